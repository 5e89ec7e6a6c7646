//! Dispatcher behaviour end to end against in-memory executors and brokers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use keel::executor::{
    CancelResponse, LogChunk, RunStatusResponse, SubmitRequest, SubmitResponse, TaskDescription,
};
use keel::{
    CloudExecutor, CloudExecutorConfig, CredentialBroker, DispatcherConfig, ExecutorBackend,
    ExecutorError, ExecutorRouter, LocalExecutor, LocalExecutorConfig, LogCursor, Namespace,
    RunDispatcher, RunEventPayload, RunId, RunRequest, RunStatus,
};
use keel_testkit::{
    FailingCredentialBroker, FakeContainerRuntime, FakeTaskService, StaticCredentialBroker,
};
use tokio::time::{sleep, timeout};

fn ns(value: &str) -> Namespace {
    Namespace::parse(value).unwrap()
}

fn fast_config() -> DispatcherConfig {
    DispatcherConfig::default()
        .with_poll_interval(10)
        .with_log_poll_interval(10)
        .with_credential_timeout(1_000)
        .with_backend_timeout(1_000)
}

struct Harness {
    runtime: FakeContainerRuntime,
    dispatcher: RunDispatcher,
}

fn local_harness(broker: Arc<dyn CredentialBroker>) -> Harness {
    let runtime = FakeContainerRuntime::new();
    let executor = LocalExecutor::new(
        Arc::new(runtime.clone()),
        LocalExecutorConfig::new("pipeline-runner:1.4"),
    );
    let router = ExecutorRouter::new().with_backend("local", Arc::new(executor));
    Harness {
        runtime,
        dispatcher: RunDispatcher::new(broker, Arc::new(router), fast_config()),
    }
}

async fn launched_container(runtime: &FakeContainerRuntime, run_id: RunId) -> String {
    timeout(Duration::from_secs(5), async {
        loop {
            if let Some(id) = runtime.container_for(run_id) {
                return id;
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("container was never launched")
}

#[tokio::test]
async fn test_run_succeeds_on_local_executor() {
    let broker = StaticCredentialBroker::new();
    let harness = local_harness(Arc::new(broker.clone()));
    let request = RunRequest::new("scheduler", ns("acct-42")).with_parameter("date", "2026-10-15");
    let run_id = request.run_id;

    let ticket = harness.dispatcher.dispatch(request);
    let container = launched_container(&harness.runtime, run_id).await;
    harness.runtime.set_state(&container, "exited", Some(0));

    let outcome = timeout(Duration::from_secs(5), ticket.wait()).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert_eq!(outcome.backend.as_deref(), Some("local"));

    broker.assert_request_count_eq(1);
    assert_eq!(broker.requests()[0], ("scheduler".to_string(), ns("acct-42")));

    let spec = &harness.runtime.created()[0];
    assert_eq!(spec.image, "pipeline-runner:1.4");
    assert_eq!(spec.env["KEEL_NAMESPACE"], "acct-42");
    assert_eq!(spec.env["KEEL_PARAM_DATE"], "2026-10-15");
    assert!(spec.env.contains_key("AWS_SESSION_TOKEN"));
}

#[tokio::test]
async fn test_credential_failure_never_submits() {
    let broker = FailingCredentialBroker::new();
    let harness = local_harness(Arc::new(broker.clone()));

    let outcome = harness
        .dispatcher
        .dispatch(RunRequest::new("scheduler", ns("acct-42")))
        .wait()
        .await;

    assert_eq!(outcome.status, RunStatus::Failed);
    assert!(
        outcome
            .message
            .as_deref()
            .unwrap()
            .starts_with("credential vending failed")
    );
    assert_eq!(broker.attempts(), 1);
    harness.runtime.assert_created_count_eq(0);
}

#[tokio::test]
async fn test_credential_for_another_namespace_is_refused() {
    let broker = StaticCredentialBroker::new().with_prefix("acct-42/*");
    let harness = local_harness(Arc::new(broker));

    let outcome = harness
        .dispatcher
        .dispatch(RunRequest::new("scheduler", ns("billing")))
        .wait()
        .await;

    assert_eq!(outcome.status, RunStatus::Failed);
    let message = outcome.message.unwrap();
    assert!(message.contains("billing/*"), "{message}");
    assert!(message.contains("acct-42/*"), "{message}");
    harness.runtime.assert_created_count_eq(0);
}

#[tokio::test]
async fn test_expired_credential_is_refused() {
    let broker = StaticCredentialBroker::new().with_ttl(chrono::Duration::minutes(-1));
    let harness = local_harness(Arc::new(broker));

    let outcome = harness
        .dispatcher
        .dispatch(RunRequest::new("scheduler", ns("acct-42")))
        .wait()
        .await;

    assert_eq!(outcome.status, RunStatus::Failed);
    harness.runtime.assert_created_count_eq(0);
}

#[tokio::test]
async fn test_slow_broker_times_out() {
    let harness = local_harness(Arc::new(StaticCredentialBroker::new()));
    let slow = StaticCredentialBroker::new().with_delay(Duration::from_millis(500));
    let dispatcher = RunDispatcher::new(
        Arc::new(slow),
        Arc::clone(harness.dispatcher.router()),
        fast_config().with_credential_timeout(20),
    );

    let outcome = dispatcher
        .dispatch(RunRequest::new("scheduler", ns("acct-42")))
        .wait()
        .await;

    assert_eq!(outcome.status, RunStatus::Failed);
    harness.runtime.assert_created_count_eq(0);
}

#[tokio::test]
async fn test_executor_rejects_foreign_credential_directly() {
    let runtime = FakeContainerRuntime::new();
    let executor = LocalExecutor::new(
        Arc::new(runtime.clone()),
        LocalExecutorConfig::new("pipeline-runner:1.4"),
    );
    let credential = StaticCredentialBroker::new()
        .get_credentials("scheduler", &ns("acct-42"))
        .await
        .unwrap();

    let request = SubmitRequest::new(RunId::new(), ns("billing")).with_credential(credential);
    let err = executor.submit(request).await.unwrap_err();

    match err {
        ExecutorError::CredentialScope {
            namespace,
            expected,
            actual,
        } => {
            assert_eq!(namespace, "billing");
            assert_eq!(expected, "billing/*");
            assert_eq!(actual, "acct-42/*");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    runtime.assert_created_count_eq(0);
}

#[tokio::test]
async fn test_resubmitting_a_run_launches_once() {
    let runtime = FakeContainerRuntime::new();
    let executor = LocalExecutor::new(
        Arc::new(runtime.clone()),
        LocalExecutorConfig::new("pipeline-runner:1.4"),
    );
    let credential = StaticCredentialBroker::new()
        .get_credentials("scheduler", &ns("acct-42"))
        .await
        .unwrap();
    let request = SubmitRequest::new(RunId::new(), ns("acct-42")).with_credential(credential);

    assert!(executor.submit(request.clone()).await.unwrap().accepted);
    assert!(executor.submit(request.clone()).await.unwrap().accepted);

    runtime.assert_created_count_eq(1);
    assert_eq!(executor.tracked_runs(), 1);
    assert_eq!(
        executor.get_run_status(request.run_id).await.unwrap().status,
        RunStatus::Running
    );
}

#[tokio::test]
async fn test_cancel_ends_run_cancelled() {
    let harness = local_harness(Arc::new(StaticCredentialBroker::new()));
    let request = RunRequest::new("scheduler", ns("acct-42"));
    let run_id = request.run_id;

    let ticket = harness.dispatcher.dispatch(request);
    let container = launched_container(&harness.runtime, run_id).await;
    ticket.cancel();

    let outcome = timeout(Duration::from_secs(5), ticket.wait()).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Cancelled);
    assert_eq!(harness.runtime.stopped(), vec![container]);
}

#[tokio::test]
async fn test_cancel_of_finished_run_is_not_acknowledged() {
    let runtime = FakeContainerRuntime::new();
    let executor = LocalExecutor::new(
        Arc::new(runtime.clone()),
        LocalExecutorConfig::new("pipeline-runner:1.4"),
    );
    let credential = StaticCredentialBroker::new()
        .get_credentials("scheduler", &ns("acct-42"))
        .await
        .unwrap();
    let run_id = RunId::new();
    executor
        .submit(SubmitRequest::new(run_id, ns("acct-42")).with_credential(credential))
        .await
        .unwrap();

    let container = runtime.container_for(run_id).unwrap();
    runtime.set_state(&container, "exited", Some(0));

    assert!(!executor.cancel(run_id).await.unwrap().acknowledged);
    assert!(runtime.stopped().is_empty());
    assert_eq!(
        executor.get_run_status(run_id).await.unwrap().status,
        RunStatus::Succeeded
    );
}

#[tokio::test]
async fn test_timed_out_submission_is_withdrawn() {
    let runtime = FakeContainerRuntime::new().with_create_delay(Duration::from_millis(200));
    let executor = LocalExecutor::new(
        Arc::new(runtime.clone()),
        LocalExecutorConfig::new("pipeline-runner:1.4"),
    );
    let router = ExecutorRouter::new().with_backend("local", Arc::new(executor));
    let dispatcher = RunDispatcher::new(
        Arc::new(StaticCredentialBroker::new()),
        Arc::new(router),
        fast_config().with_backend_timeout(50),
    );
    let request = RunRequest::new("scheduler", ns("acct-42"));
    let run_id = request.run_id;

    let outcome = timeout(Duration::from_secs(5), dispatcher.dispatch(request).wait())
        .await
        .unwrap();
    assert_eq!(outcome.status, RunStatus::Failed);
    assert!(outcome.message.unwrap().starts_with("submission failed"));

    // The engine finishes creating the container after the dispatcher gave up.
    let container = launched_container(&runtime, run_id).await;
    timeout(Duration::from_secs(5), async {
        while runtime.stopped().is_empty() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("late container was never stopped");
    assert_eq!(runtime.stopped(), vec![container]);
    runtime.assert_created_count_eq(1);
}

#[tokio::test]
async fn test_finished_runs_are_forgotten_after_retention() {
    let runtime = FakeContainerRuntime::new();
    let executor = LocalExecutor::new(
        Arc::new(runtime.clone()),
        LocalExecutorConfig::new("pipeline-runner:1.4").with_finished_retention(0),
    );
    let credential = StaticCredentialBroker::new()
        .get_credentials("scheduler", &ns("acct-42"))
        .await
        .unwrap();

    let finished = RunId::new();
    executor
        .submit(SubmitRequest::new(finished, ns("acct-42")).with_credential(credential.clone()))
        .await
        .unwrap();
    let container = runtime.container_for(finished).unwrap();
    runtime.set_state(&container, "exited", Some(0));
    assert_eq!(
        executor.get_run_status(finished).await.unwrap().status,
        RunStatus::Succeeded
    );
    assert_eq!(executor.tracked_runs(), 1);

    executor
        .submit(SubmitRequest::new(RunId::new(), ns("acct-42")).with_credential(credential))
        .await
        .unwrap();
    assert_eq!(executor.tracked_runs(), 1);
    assert!(matches!(
        executor.get_run_status(finished).await,
        Err(ExecutorError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_log_follower_delivers_each_line_once() {
    let harness = local_harness(Arc::new(StaticCredentialBroker::new()));
    let request = RunRequest::new("scheduler", ns("acct-42"));
    let run_id = request.run_id;

    let ticket = harness.dispatcher.dispatch(request);
    let container = launched_container(&harness.runtime, run_id).await;
    harness
        .runtime
        .push_logs(&container, ["extract: 120 rows", "transform: ok"]);

    let mut follower = ticket.logs();
    let first = timeout(Duration::from_secs(5), follower.next_batch())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, vec!["extract: 120 rows", "transform: ok"]);
    assert_eq!(follower.cursor(), LogCursor(2));

    harness.runtime.push_logs(&container, ["load: done"]);
    harness.runtime.set_state(&container, "exited", Some(0));

    let rest: Vec<String> = timeout(Duration::from_secs(5), follower.into_stream().collect())
        .await
        .unwrap();
    assert_eq!(rest, vec!["load: done"]);

    let outcome = ticket.wait().await;
    assert_eq!(outcome.status, RunStatus::Succeeded);
}

#[tokio::test]
async fn test_container_vanishing_fails_run() {
    let harness = local_harness(Arc::new(StaticCredentialBroker::new()));
    let request = RunRequest::new("scheduler", ns("acct-42"));
    let run_id = request.run_id;

    let ticket = harness.dispatcher.dispatch(request);
    let container = launched_container(&harness.runtime, run_id).await;
    harness.runtime.remove(&container);

    let outcome = timeout(Duration::from_secs(5), ticket.wait()).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Failed);
    assert!(outcome.message.unwrap().contains("no longer exists"));
}

/// Accepts every submission and then forgets about it.
struct ForgetfulBackend;

#[async_trait]
impl ExecutorBackend for ForgetfulBackend {
    fn name(&self) -> &str {
        "forgetful"
    }

    async fn submit(&self, _request: SubmitRequest) -> Result<SubmitResponse, ExecutorError> {
        Ok(SubmitResponse { accepted: true })
    }

    async fn get_run_status(&self, run_id: RunId) -> Result<RunStatusResponse, ExecutorError> {
        Err(ExecutorError::NotFound(run_id))
    }

    async fn stream_logs(
        &self,
        run_id: RunId,
        _cursor: LogCursor,
    ) -> Result<LogChunk, ExecutorError> {
        Err(ExecutorError::NotFound(run_id))
    }

    async fn cancel(&self, run_id: RunId) -> Result<CancelResponse, ExecutorError> {
        Err(ExecutorError::NotFound(run_id))
    }
}

#[tokio::test]
async fn test_orphaned_run_fails() {
    let router = ExecutorRouter::new().with_backend("forgetful", Arc::new(ForgetfulBackend));
    let dispatcher = RunDispatcher::new(
        Arc::new(StaticCredentialBroker::new()),
        Arc::new(router),
        fast_config(),
    );

    let ticket = dispatcher.dispatch(RunRequest::new("scheduler", ns("acct-42")));
    let outcome = timeout(Duration::from_secs(5), ticket.wait()).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Failed);
    assert!(outcome.message.unwrap().contains("orphaned"));
}

#[tokio::test]
async fn test_unknown_backend_fails_before_vending() {
    let broker = StaticCredentialBroker::new();
    let harness = local_harness(Arc::new(broker.clone()));

    let ticket = harness
        .dispatcher
        .dispatch(RunRequest::new("scheduler", ns("acct-42")).with_backend("gpu"));
    let outcome = ticket.wait().await;

    assert_eq!(outcome.status, RunStatus::Failed);
    assert!(outcome.message.unwrap().contains("gpu"));
    assert!(outcome.backend.is_none());
    broker.assert_request_count_eq(0);
}

#[tokio::test]
async fn test_namespace_route_sends_run_to_cloud() {
    let runtime = FakeContainerRuntime::new();
    let tasks = FakeTaskService::new();
    let router = ExecutorRouter::new()
        .with_backend(
            "local",
            Arc::new(LocalExecutor::new(
                Arc::new(runtime.clone()),
                LocalExecutorConfig::new("pipeline-runner:1.4"),
            )),
        )
        .with_backend(
            "cloud",
            Arc::new(CloudExecutor::new(
                Arc::new(tasks.clone()),
                CloudExecutorConfig::new("pipelines", "pipeline-runner:7"),
            )),
        );
    router.route_namespace(ns("billing"), "cloud");
    let dispatcher = RunDispatcher::new(
        Arc::new(StaticCredentialBroker::new()),
        Arc::new(router),
        fast_config(),
    );

    let request = RunRequest::new("scheduler", ns("billing"));
    let run_id = request.run_id;
    let ticket = dispatcher.dispatch(request);
    let progress = ticket.subscribe();

    let task = timeout(Duration::from_secs(5), async {
        loop {
            if let Some(task) = tasks.task_for(run_id) {
                return task;
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    tasks.set_status(&task, "RUNNING");
    timeout(Duration::from_secs(5), async {
        while ticket.status() != RunStatus::Running {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    tasks.set_description(
        &task,
        TaskDescription {
            last_status: "STOPPED".to_string(),
            stop_code: Some("EssentialContainerExited".to_string()),
            stopped_reason: Some("Essential container in task exited".to_string()),
            exit_code: Some(1),
        },
    );
    let outcome = timeout(Duration::from_secs(5), ticket.wait()).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.backend.as_deref(), Some("cloud"));
    assert_eq!(
        outcome.message.as_deref(),
        Some("Essential container in task exited")
    );

    assert_eq!(progress.borrow().status, RunStatus::Failed);
    runtime.assert_created_count_eq(0);
    let launches = tasks.launches();
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].started_by, "keel/billing");
    assert_eq!(launches[0].client_token, run_id.to_string());
    assert_eq!(launches[0].env["KEEL_NAMESPACE"], "billing");
}

#[tokio::test]
async fn test_run_events_are_published_in_order() {
    let harness = local_harness(Arc::new(StaticCredentialBroker::new()));
    let mut events = harness.dispatcher.events().subscribe();
    let request = RunRequest::new("scheduler", ns("acct-42"));
    let run_id = request.run_id;

    let ticket = harness.dispatcher.dispatch(request);
    let container = launched_container(&harness.runtime, run_id).await;
    harness.runtime.set_state(&container, "exited", Some(0));
    let outcome = timeout(Duration::from_secs(5), ticket.wait()).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Succeeded);

    let mut names = Vec::new();
    let mut correlation = None;
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.meta.run_id, run_id);
        let id = event.meta.correlation_id;
        assert_eq!(*correlation.get_or_insert(id), id);
        names.push(event.payload.name());
        if let RunEventPayload::Finished { status, .. } = event.payload {
            assert_eq!(status, RunStatus::Succeeded);
        }
    }

    assert_eq!(names.first(), Some(&"credentials_issued"));
    assert_eq!(names.get(1), Some(&"submitted"));
    assert_eq!(names.last(), Some(&"finished"));
    assert!(names.contains(&"status_changed"));
}
