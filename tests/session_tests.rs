//! Session lifecycle tests against the mock stdio server

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use mcp_runtime::config::{Config, SessionConfig};
use mcp_runtime::process::{CommandPolicy, ProcessManager};
use mcp_runtime::protocol::Content;
use mcp_runtime::transport::{
    ContextStrategy, DefaultTransportFactory, Transport, TransportFactory,
};
use mcp_runtime::{
    ConnectionDescriptor, ConnectionState, Error, ErrorCategory, McpService, SessionManager,
    TransportKind,
};

const MOCK_SERVER: &str = env!("CARGO_BIN_EXE_mock-mcp-server");

fn test_config() -> Config {
    let mut config = Config::default();
    config.transport.allow_absolute_commands = true;
    config.transport.request_timeout = Duration::from_secs(5);
    config.session.handshake_timeout = Duration::from_secs(5);
    config.session.health_check.enabled = false;
    config.session.reconnect.base_delay = Some(Duration::from_millis(10));
    config
}

fn mock_descriptor() -> ConnectionDescriptor {
    ConnectionDescriptor::stdio(MOCK_SERVER, vec![]).unwrap()
}

/// Manager sharing a process manager the test can inspect
fn manager_with_processes(config: &Config) -> (Arc<SessionManager>, Arc<ProcessManager>) {
    let processes = ProcessManager::new(
        config.process.clone(),
        CommandPolicy {
            allow_absolute_paths: true,
        },
    );
    let factory = Arc::new(DefaultTransportFactory::new(
        Arc::clone(&processes),
        &config.transport,
    ));
    let manager = SessionManager::with_factory(
        config.session.clone(),
        config.transport.request_timeout,
        factory,
        Some(Arc::clone(&processes)),
    );
    (manager, processes)
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_connect_list_call_disconnect() {
    let service = McpService::new(&test_config());

    let info = service.connect(mock_descriptor()).await.unwrap();
    assert_eq!(info.name, "mock-mcp-server");
    assert_eq!(info.protocol_version, "2025-06-18");
    assert_eq!(info.instructions.as_deref(), Some("Test server"));
    assert!(service.is_connected());

    // Two pages, merged in order
    let tools = service.list_tools().await.unwrap();
    let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["echo", "add", "fail", "sleep", "exit"]);

    let result = service
        .call_tool("echo", json!({"text": "hello"}))
        .await
        .unwrap();
    assert!(!result.is_error);
    assert!(matches!(&result.content[0], Content::Text { text } if text == "hello"));

    // A tool-level failure is a result, not an error
    let failed = service.call_tool("fail", json!({})).await.unwrap();
    assert!(failed.is_error);

    let contents = service.read_resource("mock://readme").await.unwrap();
    assert_eq!(contents.len(), 1);
    assert_eq!(
        serde_json::to_value(&contents[0]).unwrap()["text"],
        "hello from mock"
    );

    let prompt = service
        .get_prompt("greet", [("who".to_string(), "tests".to_string())].into())
        .await
        .unwrap();
    assert!(matches!(&prompt.messages[0].content, Content::Text { text } if text == "Hello, tests!"));

    assert!(service.ping().await.is_ok());

    // Snapshots carry the session id as a string
    let health = serde_json::to_value(service.connection_health()).unwrap();
    assert_eq!(health["session_id"], json!(info.session_id.to_string()));
    let server = serde_json::to_value(service.server_info().unwrap()).unwrap();
    assert_eq!(server["session_id"], json!(info.session_id.to_string()));

    service.disconnect().await.unwrap();
    assert!(!service.is_connected());
    assert_eq!(service.manager().state(), ConnectionState::Disconnected);

    let err = service.list_tools().await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::ClientUsage);

    service.shutdown().await;
}

#[tokio::test]
async fn test_server_errors_are_classified() {
    let service = McpService::new(&test_config());
    service.connect(mock_descriptor()).await.unwrap();

    let err = service.call_tool("missing", json!({})).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Validation);
    assert!(!err.is_recoverable());
    assert_eq!(err.operation(), Some("call_tool"));

    // Still usable afterwards
    assert!(service.is_connected());
    let stats = service.error_statistics();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.by_category.get(&ErrorCategory::Validation), Some(&1));

    service.shutdown().await;
}

#[tokio::test]
async fn test_double_disconnect_is_idempotent() {
    let config = test_config();
    let (manager, processes) = manager_with_processes(&config);

    manager.connect(mock_descriptor()).await.unwrap();
    assert_eq!(processes.running_count(), 1);

    manager.disconnect().await.unwrap();
    manager.disconnect().await.unwrap();
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    eventually("server process to stop", || processes.running_count() == 0).await;

    // Disconnect without ever connecting is fine too
    let (fresh, _) = manager_with_processes(&config);
    fresh.disconnect().await.unwrap();

    manager.shutdown().await;
    fresh.shutdown().await;
}

#[tokio::test]
async fn test_connect_while_connected_is_rejected() {
    let service = McpService::new(&test_config());
    let first = service.connect(mock_descriptor()).await.unwrap();

    let err = service.connect(mock_descriptor()).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::ClientUsage);

    // The original session survives the rejected attempt
    assert_eq!(service.server_info().unwrap().session_id, first.session_id);
    service.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_connects_are_exclusive() {
    let config = test_config();
    let (manager, processes) = manager_with_processes(&config);

    let (a, b) = tokio::join!(
        manager.connect(mock_descriptor()),
        manager.connect(mock_descriptor())
    );

    let (ok, rejected) = match (a, b) {
        (Ok(session), Err(e)) | (Err(e), Ok(session)) => (session, e),
        (a, b) => panic!("expected exactly one success, got {:?} / {:?}", a.is_ok(), b.is_ok()),
    };
    assert_eq!(rejected.category(), ErrorCategory::ClientUsage);
    assert!(matches!(rejected.cause(), Some(Error::ConnectInProgress)));
    assert_eq!(manager.session().map(|s| s.id()), Some(ok.id()));
    assert_eq!(processes.running_count(), 1);

    manager.shutdown().await;
    assert_eq!(manager.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_process_exit_mid_session() {
    let mut config = test_config();
    config.session.reconnect.enabled = false;
    let service = McpService::new(&config);
    let before = service.connect(mock_descriptor()).await.unwrap();

    let err = service
        .call_tool("exit", json!({"code": 3}))
        .await
        .unwrap_err();
    assert!(
        matches!(
            err.category(),
            ErrorCategory::ServerUnavailable | ErrorCategory::Transport
        ),
        "unexpected category {}",
        err.category()
    );

    eventually("transport to report dead", || !service.is_connected()).await;
    let health = service.connection_health();
    assert!(!health.connected);
    assert!(health.last_error.is_some());

    // Explicit reconnect replaces the dead session
    let session = service.manager().reconnect().await.unwrap();
    assert_ne!(session.id(), before.session_id);
    assert!(service.is_connected());
    assert_eq!(service.list_tools().await.unwrap().len(), 5);

    service.shutdown().await;
}

#[tokio::test]
async fn test_background_reconnect_after_process_exit() {
    let service = McpService::new(&test_config());
    let before = service.connect(mock_descriptor()).await.unwrap();

    assert!(service.call_tool("exit", json!({})).await.is_err());

    eventually("background reconnect", || {
        service.is_connected()
            && service
                .server_info()
                .is_ok_and(|info| info.session_id != before.session_id)
    })
    .await;
    assert_eq!(service.connection_health().reconnect_attempts, 1);

    service.shutdown().await;
}

/// Factory whose every attempt fails with a fixed error
struct FailingFactory {
    calls: AtomicUsize,
    error: fn() -> Error,
}

#[async_trait]
impl TransportFactory for FailingFactory {
    async fn create(
        &self,
        _descriptor: &ConnectionDescriptor,
    ) -> mcp_runtime::Result<(Arc<dyn Transport>, ContextStrategy)> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err((self.error)())
    }
}

fn failing_manager(error: fn() -> Error, max_attempts: u32) -> (Arc<SessionManager>, Arc<FailingFactory>) {
    let factory = Arc::new(FailingFactory {
        calls: AtomicUsize::new(0),
        error,
    });
    let mut config = SessionConfig::default();
    config.health_check.enabled = false;
    config.reconnect.max_attempts = max_attempts;
    config.reconnect.base_delay = Some(Duration::from_millis(10));
    let manager = SessionManager::with_factory(
        config,
        Duration::from_secs(1),
        Arc::clone(&factory) as Arc<dyn TransportFactory>,
        None,
    );
    (manager, factory)
}

#[tokio::test]
async fn test_reconnection_attempts_are_bounded() {
    let (manager, factory) = failing_manager(
        || Error::HttpStatus {
            status: 503,
            body: "busy".to_string(),
        },
        3,
    );
    let descriptor =
        ConnectionDescriptor::network(TransportKind::Http, "http://127.0.0.1:9/mcp", vec![])
            .unwrap();

    let err = manager.connect(descriptor).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::ServerUnavailable);
    assert_eq!(factory.calls.load(Ordering::SeqCst), 3);
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    let stats = manager.error_statistics();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.retries, 2);
}

#[tokio::test]
async fn test_unrecoverable_connect_errors_are_not_retried() {
    let (manager, factory) = failing_manager(
        || Error::UnsafeCommand("dangerous pattern \";\" in argument 0".to_string()),
        5,
    );

    let err = manager.connect(mock_descriptor()).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::ClientConfig);
    assert_eq!(factory.calls.load(Ordering::SeqCst), 1);
    assert_eq!(manager.error_statistics().retries, 0);
}

#[tokio::test]
async fn test_disconnect_cancels_pending_connect() {
    let (manager, factory) = failing_manager(
        || Error::HttpStatus {
            status: 503,
            body: String::new(),
        },
        100,
    );

    let connecting = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.connect(mock_descriptor()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    manager.disconnect().await.unwrap();

    let err = tokio::time::timeout(Duration::from_secs(2), connecting)
        .await
        .expect("connect should stop promptly")
        .unwrap()
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::ClientUsage);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(factory.calls.load(Ordering::SeqCst) < 100);
}

#[tokio::test]
async fn test_abandoned_connect_rolls_back() {
    let config = test_config();
    let (manager, processes) = manager_with_processes(&config);

    // A server that never answers the handshake, given up on by the caller
    let silent = ConnectionDescriptor::stdio("sleep", vec!["30".to_string()]).unwrap();
    let abandoned =
        tokio::time::timeout(Duration::from_millis(300), manager.connect(silent)).await;
    assert!(abandoned.is_err());

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    eventually("abandoned server process to stop", || {
        processes.running_count() == 0
    })
    .await;

    // The next connect is not blocked by the dropped one
    manager.connect(mock_descriptor()).await.unwrap();
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(processes.running_count(), 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_is_terminal() {
    let service = McpService::new(&test_config());
    service.connect(mock_descriptor()).await.unwrap();

    service.shutdown().await;
    assert_eq!(service.manager().state(), ConnectionState::Closed);

    let err = service.connect(mock_descriptor()).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::ClientUsage);
    assert!(matches!(err.cause(), Some(Error::Closed)));
}
