//! End-to-end orchestration of individual runs.
//!
//! [`RunDispatcher::dispatch`] spawns one task per run that vends a scoped
//! credential, submits to the routed backend and polls until the backend
//! reports a terminal status. A run that cannot get a credential never reaches
//! the backend.

mod router;
mod ticket;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval_at, timeout};
use tracing::Instrument;
use uuid::Uuid;

pub use router::{ExecutorRouter, Route};
pub use ticket::{LogFollower, RunOutcome, RunProgress, RunTicket};

use crate::config::DispatcherConfig;
use crate::credentials::{Credential, CredentialBroker};
use crate::election::ShutdownToken;
use crate::error::{CredentialError, ExecutorError, RoutingError};
use crate::events::{EventMeta, RunEvent, RunEventBus, RunEventPayload};
use crate::executor::{ExecutorBackend, RunStatusResponse, SubmitRequest};
use crate::run::{Namespace, RunId, RunParameters, RunStatus};
use crate::telemetry::{
    record_credential_failure, record_run_dispatched, record_run_finished, run_dispatch_span,
};

const NO_BACKEND: &str = "none";

/// One run to execute.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunRequest {
    pub run_id: RunId,
    /// Identity the credential is vended for.
    pub principal: String,
    pub namespace: Namespace,
    #[serde(default)]
    pub parameters: RunParameters,
    /// Backend name; `None` lets the router decide.
    #[serde(default)]
    pub backend: Option<String>,
}

impl RunRequest {
    pub fn new(principal: impl Into<String>, namespace: Namespace) -> Self {
        Self {
            run_id: RunId::new(),
            principal: principal.into(),
            namespace,
            parameters: RunParameters::new(),
            backend: None,
        }
    }

    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }
}

/// Drives runs from credential vending to a terminal status.
pub struct RunDispatcher {
    broker: Arc<dyn CredentialBroker>,
    router: Arc<ExecutorRouter>,
    config: DispatcherConfig,
    events: RunEventBus,
}

impl std::fmt::Debug for RunDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunDispatcher")
            .field("router", &self.router)
            .field("config", &self.config)
            .field("events", &self.events)
            .finish()
    }
}

impl RunDispatcher {
    pub fn new(
        broker: Arc<dyn CredentialBroker>,
        router: Arc<ExecutorRouter>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            broker,
            router,
            config,
            events: RunEventBus::default(),
        }
    }

    /// Publish run events on `events` instead of a private bus.
    pub fn with_event_bus(mut self, events: RunEventBus) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &RunEventBus {
        &self.events
    }

    pub fn router(&self) -> &Arc<ExecutorRouter> {
        &self.router
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Start `request` on its own task. Must be called inside a tokio runtime.
    pub fn dispatch(&self, request: RunRequest) -> RunTicket {
        let run_id = request.run_id;
        let route = self
            .router
            .resolve(request.backend.as_deref(), &request.namespace);
        let backend = route.as_ref().ok().map(|r| Arc::clone(&r.backend));
        let backend_name = route.as_ref().ok().map(|r| r.name.clone());

        let (progress_tx, progress_rx) = watch::channel(RunProgress::pending());
        let cancel = ShutdownToken::new();
        let span = run_dispatch_span(
            run_id,
            &request.namespace,
            backend_name.as_deref().unwrap_or(NO_BACKEND),
        );

        let driver = RunDriver {
            request,
            broker: Arc::clone(&self.broker),
            config: self.config.clone(),
            events: self.events.clone(),
            progress: progress_tx,
            cancel: cancel.clone(),
            correlation_id: Uuid::now_v7(),
            sequence: 0,
            started: Instant::now(),
            backend_name,
        };
        let task = tokio::spawn(driver.run(route).instrument(span));

        RunTicket {
            run_id,
            backend,
            progress: progress_rx,
            cancel,
            task,
            log_poll_interval: self.config.log_poll_interval(),
        }
    }
}

/// Per-run state owned by the dispatch task.
struct RunDriver {
    request: RunRequest,
    broker: Arc<dyn CredentialBroker>,
    config: DispatcherConfig,
    events: RunEventBus,
    progress: watch::Sender<RunProgress>,
    cancel: ShutdownToken,
    correlation_id: Uuid,
    sequence: u32,
    started: Instant,
    backend_name: Option<String>,
}

impl RunDriver {
    fn backend_label(&self) -> &str {
        self.backend_name.as_deref().unwrap_or(NO_BACKEND)
    }

    async fn run(mut self, route: Result<Route, RoutingError>) -> RunOutcome {
        let route = match route {
            Ok(route) => route,
            Err(err) => {
                tracing::warn!("run not routable: {err}");
                return self.finish(RunStatus::Failed, Some(err.to_string()));
            }
        };

        let credential = match self.fetch_credential().await {
            Ok(credential) => credential,
            Err(err) => {
                record_credential_failure(&self.request.namespace, &err);
                return self.finish(
                    RunStatus::Failed,
                    Some(format!("credential vending failed: {err}")),
                );
            }
        };
        self.publish(RunEventPayload::CredentialsIssued {
            namespace: self.request.namespace.clone(),
            expires_at: credential.expires_at,
        });

        if self.cancel.is_cancelled() {
            return self.finish(
                RunStatus::Cancelled,
                Some("cancelled before submission".to_string()),
            );
        }

        let backend = route.backend;
        if let Err(message) = self.submit(backend.as_ref(), credential).await {
            tracing::warn!("{message}");
            return self.finish(RunStatus::Failed, Some(message));
        }

        self.poll_until_terminal(backend.as_ref()).await
    }

    async fn fetch_credential(&self) -> Result<Credential, CredentialError> {
        let limit = self.config.credential_timeout();
        let credential = timeout(
            limit,
            self.broker
                .get_credentials(&self.request.principal, &self.request.namespace),
        )
        .await
        .map_err(|_| CredentialError::Timeout(limit))??;

        credential.validate_for(&self.request.namespace)?;
        Ok(credential)
    }

    async fn submit(
        &mut self,
        backend: &dyn ExecutorBackend,
        credential: Credential,
    ) -> Result<(), String> {
        let request = SubmitRequest::new(self.request.run_id, self.request.namespace.clone())
            .with_parameters(self.request.parameters.clone())
            .with_credential(credential);

        let response = match self.bounded(backend.submit(request)).await {
            Ok(response) => response,
            Err(err) => {
                if err.is_transient() {
                    self.withdraw(backend).await;
                }
                return Err(format!("submission failed: {err}"));
            }
        };
        if !response.accepted {
            return Err(format!("backend {} did not accept the run", self.backend_label()));
        }

        record_run_dispatched(self.backend_label(), &self.request.namespace);
        self.publish(RunEventPayload::Submitted {
            backend: self.backend_label().to_string(),
        });
        self.advance(RunStatusResponse::new(RunStatus::Submitted));
        Ok(())
    }

    async fn poll_until_terminal(&mut self, backend: &dyn ExecutorBackend) -> RunOutcome {
        let period = self.config.poll_interval();
        let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cancel_sent = false;
        let cancel = self.cancel.clone();
        let run_id = self.request.run_id;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled(), if !cancel_sent => {
                    cancel_sent = true;
                    match self.bounded(backend.cancel(run_id)).await {
                        Ok(response) => {
                            tracing::info!(acknowledged = response.acknowledged, "cancel sent");
                            self.publish(RunEventPayload::CancelRequested {
                                acknowledged: response.acknowledged,
                            });
                        }
                        Err(err) => tracing::warn!("cancel request failed: {err}"),
                    }
                }

                _ = ticker.tick() => {
                    match self.bounded(backend.get_run_status(run_id)).await {
                        Ok(observed) => {
                            self.advance(observed);
                            let current = self.progress.borrow().clone();
                            if current.status.is_terminal() {
                                return self.finish(current.status, current.message);
                            }
                        }
                        Err(ExecutorError::NotFound(_)) => {
                            tracing::warn!("executor no longer knows the run");
                            return self.finish(
                                RunStatus::Failed,
                                Some("run is unknown to the executor (orphaned)".to_string()),
                            );
                        }
                        Err(err) => tracing::warn!("status poll failed, retrying: {err}"),
                    }
                }
            }
        }
    }

    /// Bound a backend call by the configured backend timeout.
    /// Best-effort cancel after a submit whose outcome is unknown, so a
    /// compute unit that did start is not left running unobserved.
    async fn withdraw(&self, backend: &dyn ExecutorBackend) {
        match self.bounded(backend.cancel(self.request.run_id)).await {
            Ok(response) => {
                tracing::info!(acknowledged = response.acknowledged, "withdrew unconfirmed submission")
            }
            Err(ExecutorError::NotFound(_)) => {
                tracing::debug!("nothing to withdraw, executor never saw the run")
            }
            Err(err) => tracing::warn!("withdrawing unconfirmed submission failed: {err}"),
        }
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, ExecutorError>>,
    ) -> Result<T, ExecutorError> {
        let limit: Duration = self.config.backend_timeout();
        timeout(limit, call)
            .await
            .map_err(|_| ExecutorError::Transport(format!("backend call timed out after {limit:?}")))?
    }

    /// Move to `observed` if it is ahead of the current status.
    fn advance(&mut self, observed: RunStatusResponse) {
        let previous = self.progress.borrow().status;
        if !previous.can_advance_to(observed.status) {
            if observed.status != previous {
                tracing::debug!(
                    current = %previous,
                    observed = %observed.status,
                    "ignoring status that does not advance the run"
                );
            }
            return;
        }

        self.progress.send_replace(RunProgress {
            status: observed.status,
            message: observed.message.clone(),
        });
        self.publish(RunEventPayload::StatusChanged {
            from: previous,
            to: observed.status,
            message: observed.message,
        });
    }

    fn finish(&mut self, status: RunStatus, message: Option<String>) -> RunOutcome {
        let current = self.progress.borrow().clone();
        let (status, message) = if current.status.is_terminal() {
            (current.status, current.message)
        } else {
            self.progress.send_replace(RunProgress {
                status,
                message: message.clone(),
            });
            (status, message)
        };

        self.publish(RunEventPayload::Finished {
            status,
            message: message.clone(),
        });
        record_run_finished(self.backend_label(), status, self.started);

        RunOutcome {
            run_id: self.request.run_id,
            status,
            message,
            backend: self.backend_name.clone(),
        }
    }

    fn publish(&mut self, payload: RunEventPayload) {
        self.sequence += 1;
        let key = format!("{}:{}:{}", self.request.run_id, self.sequence, payload.name());
        self.events.emit(RunEvent {
            meta: EventMeta::new(self.request.run_id, Some(self.correlation_id), key),
            payload,
        });
    }
}
