use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use keel::{Credential, CredentialBroker, CredentialError, Namespace};
use parking_lot::Mutex;

/// Broker that issues credentials locally and records every request.
///
/// By default each credential is scoped to the requested namespace. A fixed
/// prefix or a negative lifetime can be forced to exercise the dispatcher's
/// validation.
#[derive(Clone)]
pub struct StaticCredentialBroker {
    requests: Arc<Mutex<Vec<(String, Namespace)>>>,
    ttl: chrono::Duration,
    forced_prefix: Option<String>,
    delay: Duration,
}

impl Default for StaticCredentialBroker {
    fn default() -> Self {
        Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            ttl: chrono::Duration::hours(1),
            forced_prefix: None,
            delay: Duration::ZERO,
        }
    }
}

impl StaticCredentialBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue every credential for `prefix` regardless of the namespace asked for.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.forced_prefix = Some(prefix.into());
        self
    }

    pub fn with_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sleep before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// `(principal, namespace)` of every request, in order.
    pub fn requests(&self) -> Vec<(String, Namespace)> {
        self.requests.lock().clone()
    }

    pub fn assert_request_count_eq(&self, expected: usize) {
        let actual = self.requests.lock().len();
        assert_eq!(
            actual, expected,
            "expected {expected} credential requests, got {actual}"
        );
    }
}

#[async_trait]
impl CredentialBroker for StaticCredentialBroker {
    async fn get_credentials(
        &self,
        principal: &str,
        namespace: &Namespace,
    ) -> Result<Credential, CredentialError> {
        let serial = {
            let mut requests = self.requests.lock();
            requests.push((principal.to_string(), namespace.clone()));
            requests.len()
        };
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        Ok(Credential {
            access_key: format!("ASIATEST{serial:08}"),
            secret_key: format!("secret-{serial}"),
            session_token: format!("session-{principal}-{serial}"),
            expires_at: Utc::now() + self.ttl,
            namespace: namespace.clone(),
            allowed_prefix: self
                .forced_prefix
                .clone()
                .unwrap_or_else(|| namespace.allowed_prefix()),
        })
    }
}

/// Broker whose identity provider always refuses.
#[derive(Clone, Default)]
pub struct FailingCredentialBroker {
    attempts: Arc<Mutex<usize>>,
}

impl FailingCredentialBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> usize {
        *self.attempts.lock()
    }
}

#[async_trait]
impl CredentialBroker for FailingCredentialBroker {
    async fn get_credentials(
        &self,
        _principal: &str,
        _namespace: &Namespace,
    ) -> Result<Credential, CredentialError> {
        *self.attempts.lock() += 1;
        Err(CredentialError::Rejected {
            status: 503,
            body: "identity provider unavailable".to_string(),
        })
    }
}
