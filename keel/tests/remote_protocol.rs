//! The executor protocol and credential vending over real HTTP/2 sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use chrono::Utc;
use keel::executor::SubmitRequest;
use keel::executor::service;
use keel::{
    ChannelConfig, CredentialBroker, CredentialBrokerConfig, CredentialError, DispatcherConfig,
    ExecutorBackend, ExecutorError, ExecutorRouter, HttpCredentialBroker, LocalExecutor,
    LocalExecutorConfig, LogCursor, Namespace, RemoteExecutor, RunDispatcher, RunId, RunRequest,
    RunStatus, SecureChannelFactory, ShutdownToken, Transport,
};
use keel_testkit::{FakeContainerRuntime, StaticCredentialBroker};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};

fn ns(value: &str) -> Namespace {
    Namespace::parse(value).unwrap()
}

struct ExecutorProcess {
    addr: SocketAddr,
    runtime: FakeContainerRuntime,
    shutdown: ShutdownToken,
}

impl Drop for ExecutorProcess {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn spawn_executor() -> ExecutorProcess {
    let runtime = FakeContainerRuntime::new();
    let backend: Arc<dyn ExecutorBackend> = Arc::new(LocalExecutor::new(
        Arc::new(runtime.clone()),
        LocalExecutorConfig::new("pipeline-runner:1.4"),
    ));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = ShutdownToken::new();
    tokio::spawn(service::serve(listener, backend, shutdown.clone()));
    ExecutorProcess {
        addr,
        runtime,
        shutdown,
    }
}

fn remote(addr: SocketAddr) -> RemoteExecutor {
    let channel = SecureChannelFactory::build(&ChannelConfig::new(format!("http://{addr}"))).unwrap();
    assert_eq!(channel.transport(), Transport::Cleartext);
    RemoteExecutor::new("remote", channel)
}

async fn scoped_credential(namespace: &str) -> keel::Credential {
    StaticCredentialBroker::new()
        .get_credentials("scheduler", &ns(namespace))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_remote_run_lifecycle() {
    let process = spawn_executor().await;
    let executor = remote(process.addr);
    let run_id = RunId::new();
    let request = SubmitRequest::new(run_id, ns("acct-42"))
        .with_credential(scoped_credential("acct-42").await);

    assert!(executor.submit(request.clone()).await.unwrap().accepted);
    assert!(executor.submit(request).await.unwrap().accepted);
    process.runtime.assert_created_count_eq(1);

    let status = executor.get_run_status(run_id).await.unwrap();
    assert_eq!(status.status, RunStatus::Running);

    let container = process.runtime.container_for(run_id).unwrap();
    process
        .runtime
        .push_logs(&container, ["starting", "step 1/2", "step 2/2"]);
    let chunk = executor.stream_logs(run_id, LogCursor::START).await.unwrap();
    assert_eq!(chunk.lines.len(), 3);
    assert_eq!(chunk.next_cursor, LogCursor(3));
    let chunk = executor.stream_logs(run_id, LogCursor(1)).await.unwrap();
    assert_eq!(chunk.lines, vec!["step 1/2", "step 2/2"]);

    assert!(executor.cancel(run_id).await.unwrap().acknowledged);
    let status = executor.get_run_status(run_id).await.unwrap();
    assert_eq!(status.status, RunStatus::Cancelled);
    assert!(!executor.cancel(run_id).await.unwrap().acknowledged);
}

#[tokio::test]
async fn test_remote_errors_keep_their_kind() {
    let process = spawn_executor().await;
    let executor = remote(process.addr);

    let unknown = RunId::new();
    match executor.get_run_status(unknown).await {
        Err(ExecutorError::NotFound(run_id)) => assert_eq!(run_id, unknown),
        other => panic!("unexpected result: {other:?}"),
    }

    let request = SubmitRequest::new(RunId::new(), ns("billing"))
        .with_credential(scoped_credential("acct-42").await);
    match executor.submit(request).await {
        Err(ExecutorError::CredentialScope {
            namespace,
            expected,
            actual,
        }) => {
            assert_eq!(namespace, "billing");
            assert_eq!(expected, "billing/*");
            assert_eq!(actual, "acct-42/*");
        }
        other => panic!("unexpected result: {other:?}"),
    }

    let bare = SubmitRequest::new(RunId::new(), ns("acct-42"));
    assert!(matches!(
        executor.submit(bare).await,
        Err(ExecutorError::Rejected(_))
    ));
    process.runtime.assert_created_count_eq(0);
}

#[tokio::test]
async fn test_unreachable_executor_is_a_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = remote(addr).get_run_status(RunId::new()).await.unwrap_err();
    assert!(err.is_transient(), "{err:?}");
}

/// Executor process that accepts runs and then reports a status keel has no
/// name for.
async fn spawn_unfamiliar_executor() -> (SocketAddr, ShutdownToken) {
    let app = Router::new()
        .route(
            service::SUBMIT_PATH,
            post(|| async { Json(json!({ "accepted": true })) }),
        )
        .route(
            service::STATUS_PATH,
            post(|| async { Json(json!({ "status": "Hibernating" })) }),
        )
        .route(
            service::CANCEL_PATH,
            post(|| async { Json(json!({ "acknowledged": false })) }),
        );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = ShutdownToken::new();
    let stop = shutdown.clone();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { stop.cancelled().await })
            .await
    });
    (addr, shutdown)
}

#[tokio::test]
async fn test_unrecognised_remote_status_fails_the_run() {
    let (addr, shutdown) = spawn_unfamiliar_executor().await;
    let executor = remote(addr);

    let status = executor.get_run_status(RunId::new()).await.unwrap();
    assert_eq!(status.status, RunStatus::Failed);
    assert!(status.message.unwrap().contains("Hibernating"));

    let router = ExecutorRouter::new().with_backend("remote", Arc::new(executor));
    let dispatcher = RunDispatcher::new(
        Arc::new(StaticCredentialBroker::new()),
        Arc::new(router),
        DispatcherConfig::default().with_poll_interval(10),
    );
    let ticket = dispatcher.dispatch(RunRequest::new("scheduler", ns("acct-42")));
    let outcome = timeout(Duration::from_secs(2), ticket.wait())
        .await
        .expect("run must not stay stuck on an unknown status");

    assert_eq!(outcome.status, RunStatus::Failed);
    assert!(outcome.message.unwrap().contains("unrecognised executor status"));
    shutdown.cancel();
}

#[tokio::test]
async fn test_dispatch_through_remote_executor() {
    let process = spawn_executor().await;
    let router = ExecutorRouter::new().with_backend("remote", Arc::new(remote(process.addr)));
    let dispatcher = RunDispatcher::new(
        Arc::new(StaticCredentialBroker::new()),
        Arc::new(router),
        DispatcherConfig::default()
            .with_poll_interval(10)
            .with_log_poll_interval(10),
    );

    let request = RunRequest::new("scheduler", ns("acct-42"));
    let run_id = request.run_id;
    let ticket = dispatcher.dispatch(request);

    let container = timeout(Duration::from_secs(5), async {
        loop {
            if let Some(id) = process.runtime.container_for(run_id) {
                return id;
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    process.runtime.push_logs(&container, ["done"]);
    process.runtime.set_state(&container, "exited", Some(0));

    let mut follower = ticket.logs();
    let outcome = timeout(Duration::from_secs(5), ticket.wait()).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert_eq!(outcome.backend.as_deref(), Some("remote"));
    assert_eq!(follower.next_batch().await, Some(vec!["done".to_string()]));
    assert_eq!(follower.next_batch().await, None);
}

#[derive(Clone, Default)]
struct IdentityProvider {
    requests: Arc<Mutex<Vec<Value>>>,
    prefix_override: Option<String>,
    refuse: bool,
}

async fn vend(
    State(idp): State<IdentityProvider>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    idp.requests.lock().push(body.clone());
    if idp.refuse {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "principal may not assume role" })),
        );
    }
    let namespace = body["namespace"].as_str().unwrap_or_default();
    let prefix = idp
        .prefix_override
        .clone()
        .unwrap_or_else(|| format!("{namespace}/*"));
    (
        StatusCode::OK,
        Json(json!({
            "accessKey": "ASIAVENDED",
            "secretKey": "vended-secret",
            "sessionToken": "vended-session",
            "expiresAt": Utc::now() + chrono::Duration::minutes(15),
            "allowedPrefix": prefix,
        })),
    )
}

async fn spawn_identity_provider(idp: IdentityProvider) -> (HttpCredentialBroker, ShutdownToken) {
    let app = Router::new()
        .route("/v1/credentials", post(vend))
        .with_state(idp);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = ShutdownToken::new();
    let stop = shutdown.clone();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { stop.cancelled().await })
            .await
    });

    let channel = SecureChannelFactory::build(&ChannelConfig::new(format!("http://{addr}"))).unwrap();
    let broker = HttpCredentialBroker::new(
        channel,
        CredentialBrokerConfig::new("arn:aws:s3:::pipeline-data").with_session_duration(900),
    );
    (broker, shutdown)
}

#[tokio::test]
async fn test_http_broker_vends_scoped_credential() {
    let idp = IdentityProvider::default();
    let (broker, shutdown) = spawn_identity_provider(idp.clone()).await;

    let credential = broker
        .get_credentials("scheduler", &ns("acct-42"))
        .await
        .unwrap();
    assert_eq!(credential.allowed_prefix, "acct-42/*");
    assert_eq!(credential.namespace, ns("acct-42"));
    assert!(!credential.is_expired());

    let requests = idp.requests.lock().clone();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request["principal"], "scheduler");
    assert_eq!(request["namespace"], "acct-42");
    assert_eq!(request["durationSeconds"], 900);
    assert_eq!(
        request["policy"]["Statement"][0]["Resource"][0],
        "arn:aws:s3:::pipeline-data/acct-42/*"
    );
    shutdown.cancel();
}

#[tokio::test]
async fn test_http_broker_refuses_wrongly_scoped_credential() {
    let idp = IdentityProvider {
        prefix_override: Some("acct-42/*".to_string()),
        ..IdentityProvider::default()
    };
    let (broker, shutdown) = spawn_identity_provider(idp).await;

    let err = broker
        .get_credentials("scheduler", &ns("billing"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CredentialError::ScopeMismatch { ref expected, ref actual }
            if expected == "billing/*" && actual == "acct-42/*"
    ));
    shutdown.cancel();
}

#[tokio::test]
async fn test_http_broker_surfaces_provider_refusal() {
    let idp = IdentityProvider {
        refuse: true,
        ..IdentityProvider::default()
    };
    let (broker, shutdown) = spawn_identity_provider(idp).await;

    match broker.get_credentials("scheduler", &ns("acct-42")).await {
        Err(CredentialError::Rejected { status, body }) => {
            assert_eq!(status, 403);
            assert!(body.contains("may not assume role"));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    shutdown.cancel();
}
