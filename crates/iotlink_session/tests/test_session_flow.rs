use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use iotlink_engine::{
    ConnectivityEngine, DeviceUid, EngineCode, EngineOp, EngineResult, SessionId, SimulatedEngine,
};
use iotlink_session::{
    ChannelState, InitStatus, LinkConfig, LinkError, SessionManager, SessionState,
};

const UID: &str = "ABCDEFGHIJ1234567890";

fn setup(config: LinkConfig) -> (SessionManager, Arc<SimulatedEngine>) {
    let engine = Arc::new(SimulatedEngine::new());
    let manager = SessionManager::new(engine.clone(), config);
    (manager, engine)
}

async fn ready(config: LinkConfig) -> (SessionManager, Arc<SimulatedEngine>) {
    let (manager, engine) = setup(config);
    manager.initialize().await.unwrap();
    (manager, engine)
}

// ---------------------------------------------------------------------------
// Engine lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_double_initialize_calls_engine_once() {
    let (manager, engine) = setup(LinkConfig::default());
    assert_eq!(manager.initialize().await, Ok(InitStatus::Initialized));
    assert_eq!(manager.initialize().await, Ok(InitStatus::AlreadyInitialized));
    assert_eq!(engine.calls(EngineOp::Initialize), 1);
}

#[tokio::test]
async fn test_concurrent_initialize_calls_engine_once() {
    let (manager, engine) = setup(LinkConfig::default());
    let (a, b) = tokio::join!(manager.initialize(), manager.initialize());
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(engine.calls(EngineOp::Initialize), 1);
}

#[tokio::test]
async fn test_deinitialize_clears_sessions() {
    let (manager, engine) = ready(LinkConfig::default()).await;
    let a = manager.connect(UID).await.unwrap();
    let b = manager.connect("ZZZZZZZZZZ0000000000").await.unwrap();
    manager.set_channel(a, 0, true).await.unwrap();
    let mut rx = manager.subscribe(a, 0).unwrap();

    manager.deinitialize().await;
    assert!(!manager.is_initialized());
    assert!(manager.sessions().is_empty());
    assert!(manager.session(b).is_none());
    assert!(rx.recv().await.is_none());
    assert!(!engine.is_initialized());
    assert_eq!(manager.write(a, 0, b"x").await, Err(LinkError::NotInitialized));

    // A second teardown is logged, not an error, and does not reach the engine.
    manager.deinitialize().await;
    assert_eq!(engine.calls(EngineOp::Deinitialize), 1);
}

// ---------------------------------------------------------------------------
// Connect and close
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_connect_registers_engine_handle() {
    let (manager, engine) = ready(LinkConfig::default()).await;
    engine.set_next_session_id(3);

    let id = manager.connect(UID).await.unwrap();
    assert_eq!(id, SessionId(3));

    let session = manager.session(id).unwrap();
    assert_eq!(session.state, SessionState::Connected);
    assert_eq!(session.uid.as_str(), UID);
    assert_eq!(manager.channel_state(id, 0), Ok(ChannelState::Off));
}

#[tokio::test]
async fn test_connect_rejects_bad_uid_without_engine_call() {
    let (manager, engine) = ready(LinkConfig::default()).await;
    for uid in ["", "SHORT", "ABCDEFGHIJ123456789", "ABCDEFGHIJ12345678901"] {
        assert!(
            matches!(manager.connect(uid).await, Err(LinkError::InvalidArgument(_))),
            "accepted {uid:?}"
        );
    }
    assert_eq!(engine.calls(EngineOp::Connect), 0);
    assert!(manager.sessions().is_empty());
}

#[tokio::test]
async fn test_connect_failure_keeps_code_and_registers_nothing() {
    let (manager, engine) = ready(LinkConfig::default()).await;
    engine.fail_next(EngineOp::Connect, EngineCode::CAN_NOT_FIND_DEVICE);

    let err = manager.connect(UID).await.unwrap_err();
    assert_eq!(
        err,
        LinkError::ConnectFailed {
            code: EngineCode::CAN_NOT_FIND_DEVICE
        }
    );
    assert_eq!(err.code().map(EngineCode::value), Some(-17));
    assert!(manager.sessions().is_empty());
}

#[tokio::test]
async fn test_connect_timeout_closes_late_session() {
    let config = LinkConfig {
        connect_timeout: Duration::from_millis(50),
        ..LinkConfig::default()
    };
    let (manager, engine) = ready(config).await;
    engine.set_connect_latency(Duration::from_millis(200));

    assert_eq!(
        manager.connect(UID).await,
        Err(LinkError::ConnectFailed {
            code: EngineCode::TIMEOUT
        })
    );
    assert!(manager.sessions().is_empty());

    // The engine finishes the connect after the caller gave up.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(engine.calls(EngineOp::Connect), 1);
    assert_eq!(engine.calls(EngineOp::Close), 1);
    assert_eq!(engine.open_sessions(), 0);
    assert!(manager.sessions().is_empty());
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (manager, engine) = ready(LinkConfig::default()).await;
    let id = manager.connect(UID).await.unwrap();

    assert!(manager.close(id).await);
    assert!(!manager.close(id).await);
    assert_eq!(engine.calls(EngineOp::Close), 1);
    assert!(manager.session(id).is_none());
    assert_eq!(engine.open_sessions(), 0);
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_channel_on_then_off() {
    let (manager, _engine) = ready(LinkConfig::default()).await;
    let id = manager.connect(UID).await.unwrap();

    manager.set_channel(id, 4, true).await.unwrap();
    assert_eq!(manager.channel_state(id, 4), Ok(ChannelState::On));
    manager.set_channel(id, 4, false).await.unwrap();
    assert_eq!(manager.channel_state(id, 4), Ok(ChannelState::Off));
}

#[tokio::test]
async fn test_failed_channel_off_leaves_channel_on() {
    let (manager, engine) = ready(LinkConfig::default()).await;
    let id = manager.connect(UID).await.unwrap();
    manager.set_channel(id, 1, true).await.unwrap();

    engine.fail_next(EngineOp::ChannelOff, EngineCode::FAIL_SETUP_CHANNEL);
    assert_eq!(
        manager.set_channel(id, 1, false).await,
        Err(LinkError::ChannelOpFailed {
            code: EngineCode::FAIL_SETUP_CHANNEL
        })
    );
    assert_eq!(manager.channel_state(id, 1), Ok(ChannelState::On));
}

#[tokio::test]
async fn test_channel_validation_happens_before_engine() {
    let (manager, engine) = ready(LinkConfig::default()).await;
    let id = manager.connect(UID).await.unwrap();

    assert!(matches!(
        manager.set_channel(id, 32, true).await,
        Err(LinkError::InvalidArgument(_))
    ));
    assert_eq!(
        manager.set_channel(SessionId(77), 0, true).await,
        Err(LinkError::UnknownSession(SessionId(77)))
    );
    assert_eq!(engine.calls(EngineOp::ChannelOn), 0);
}

// ---------------------------------------------------------------------------
// Reads and writes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_write_on_off_channel_never_reaches_engine() {
    let (manager, engine) = ready(LinkConfig::default()).await;
    let id = manager.connect(UID).await.unwrap();

    assert_eq!(
        manager.write(id, 0, b"print").await,
        Err(LinkError::ChannelNotOn { session: id, channel: 0 })
    );
    assert!(matches!(
        manager.write(id, 0, b"").await,
        Err(LinkError::InvalidArgument(_))
    ));
    assert_eq!(
        manager.write(SessionId(99), 0, b"print").await,
        Err(LinkError::UnknownSession(SessionId(99)))
    );
    assert_eq!(engine.calls(EngineOp::Write), 0);
}

#[tokio::test]
async fn test_read_timeout_is_empty_success() {
    let (manager, _engine) = ready(LinkConfig::default()).await;
    let id = manager.connect(UID).await.unwrap();

    let started = Instant::now();
    let data = manager.read(id, 1024, Duration::from_millis(500)).await.unwrap();
    assert!(data.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(450));
}

#[tokio::test]
async fn test_read_returns_pushed_data() {
    let (manager, engine) = ready(LinkConfig::default()).await;
    let id = manager.connect(UID).await.unwrap();
    engine.push_inbound(id, b"status:ok".to_vec());

    let data = manager.read(id, 1024, Duration::from_millis(200)).await.unwrap();
    assert_eq!(data, b"status:ok");
    assert!(matches!(
        manager.read(id, 0, Duration::from_millis(10)).await,
        Err(LinkError::InvalidArgument(_))
    ));
}

// ---------------------------------------------------------------------------
// Stream readers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_subscription_delivers_in_order() {
    let (manager, engine) = ready(LinkConfig::default()).await;
    let id = manager.connect(UID).await.unwrap();
    manager.set_channel(id, 0, true).await.unwrap();
    let mut rx = manager.subscribe(id, 0).unwrap();

    for frame in ["first", "second", "third"] {
        engine.push_inbound(id, frame.as_bytes().to_vec());
    }
    for expected in ["first", "second", "third"] {
        let chunk = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chunk.data, expected.as_bytes());
        assert_eq!(chunk.session_id, id);
        assert_eq!(chunk.channel, 0);
    }
}

#[tokio::test]
async fn test_callback_subscription() {
    let (manager, engine) = ready(LinkConfig::default()).await;
    let id = manager.connect(UID).await.unwrap();
    manager.set_channel(id, 2, true).await.unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    manager
        .subscribe_with(id, 2, move |chunk| {
            let _ = tx.send(chunk.data);
        })
        .unwrap();
    engine.push_inbound(id, b"cb".to_vec());

    let data = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(data, b"cb");
}

#[tokio::test]
async fn test_close_preempts_long_blocked_read() {
    let config = LinkConfig {
        reader_poll_timeout: Duration::from_millis(5000),
        ..LinkConfig::default()
    };
    let (manager, _engine) = ready(config).await;
    let id = manager.connect(UID).await.unwrap();
    manager.set_channel(id, 0, true).await.unwrap();
    let mut rx = manager.subscribe(id, 0).unwrap();

    // Let the reader settle into its 5s read.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    assert!(manager.close(id).await);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!manager.has_reader(id, 0));
    assert!(rx.recv().await.is_none());
}

/// Holds each non-empty read for `delay` after the data left the engine.
struct SlowReadEngine {
    inner: Arc<SimulatedEngine>,
    delay: Duration,
}

#[async_trait]
impl ConnectivityEngine for SlowReadEngine {
    async fn initialize(&self) -> EngineResult<()> {
        self.inner.initialize().await
    }

    async fn deinitialize(&self) -> EngineResult<()> {
        self.inner.deinitialize().await
    }

    async fn set_max_sessions(&self, max: u32) -> EngineResult<u32> {
        self.inner.set_max_sessions(max).await
    }

    fn version(&self) -> String {
        self.inner.version()
    }

    async fn connect_by_uid(&self, uid: &DeviceUid) -> EngineResult<SessionId> {
        self.inner.connect_by_uid(uid).await
    }

    async fn session_close(&self, session: SessionId) -> EngineResult<()> {
        self.inner.session_close(session).await
    }

    async fn session_check(&self, session: SessionId) -> bool {
        self.inner.session_check(session).await
    }

    async fn session_read(
        &self,
        session: SessionId,
        max_bytes: usize,
        timeout: Duration,
    ) -> EngineResult<Vec<u8>> {
        let data = self.inner.session_read(session, max_bytes, timeout).await?;
        if !data.is_empty() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(data)
    }

    async fn session_write(
        &self,
        session: SessionId,
        data: &[u8],
        channel: u8,
    ) -> EngineResult<usize> {
        self.inner.session_write(session, data, channel).await
    }

    async fn channel_on(&self, session: SessionId, channel: u8) -> EngineResult<()> {
        self.inner.channel_on(session, channel).await
    }

    async fn channel_off(&self, session: SessionId, channel: u8) -> EngineResult<()> {
        self.inner.channel_off(session, channel).await
    }

    async fn discover_lan(&self, timeout: Duration) -> Vec<String> {
        self.inner.discover_lan(timeout).await
    }
}

#[tokio::test]
async fn test_channel_off_delivers_in_flight_read() {
    let engine = Arc::new(SimulatedEngine::new());
    let slow = Arc::new(SlowReadEngine {
        inner: engine.clone(),
        delay: Duration::from_millis(150),
    });
    let manager = SessionManager::new(slow, LinkConfig::default());
    manager.initialize().await.unwrap();
    let id = manager.connect(UID).await.unwrap();
    manager.set_channel(id, 0, true).await.unwrap();
    let mut rx = manager.subscribe(id, 0).unwrap();

    assert!(engine.push_inbound(id, b"in-flight".to_vec()));
    // The reader has taken the data and is still inside the read.
    tokio::time::sleep(Duration::from_millis(30)).await;
    manager.set_channel(id, 0, false).await.unwrap();

    assert!(!manager.has_reader(id, 0));
    let chunk = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(chunk.data, b"in-flight");
    assert!(rx.recv().await.is_none());
    assert_eq!(manager.channel_state(id, 0), Ok(ChannelState::Off));
}

#[tokio::test]
async fn test_remote_drop_closes_session() {
    let (manager, engine) = ready(LinkConfig::default()).await;
    let id = manager.connect(UID).await.unwrap();
    manager.set_channel(id, 0, true).await.unwrap();
    let mut rx = manager.subscribe(id, 0).unwrap();

    engine.drop_remote(id, EngineCode::SESSION_CLOSE_BY_REMOTE);
    assert!(
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .is_none()
    );

    let deadline = Instant::now() + Duration::from_secs(2);
    while manager.session(id).is_some() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(manager.session(id).is_none());
    assert_eq!(engine.calls(EngineOp::Close), 1);
}

#[tokio::test]
async fn test_remote_drop_keeps_session_when_configured() {
    let config = LinkConfig {
        close_on_reader_failure: false,
        ..LinkConfig::default()
    };
    let (manager, engine) = ready(config).await;
    let id = manager.connect(UID).await.unwrap();
    manager.set_channel(id, 0, true).await.unwrap();
    let mut rx = manager.subscribe(id, 0).unwrap();

    engine.drop_remote(id, EngineCode::REMOTE_TIMEOUT_DISCONNECT);
    assert!(
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .is_none()
    );
    assert!(manager.session(id).is_some());
    assert_eq!(engine.calls(EngineOp::Close), 0);
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_second_scan_fails_fast() {
    let (manager, engine) = ready(LinkConfig::default()).await;
    engine.set_discovery_records(vec![format!("{UID}:192.168.1.50:32100")], None);

    let scanner = manager.clone();
    let first = tokio::spawn(async move { scanner.scan(Duration::from_millis(1000)).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    assert_eq!(
        manager.scan(Duration::from_millis(1000)).await,
        Err(LinkError::ScanAlreadyInProgress)
    );
    assert!(started.elapsed() < Duration::from_millis(100));

    let devices = first.await.unwrap().unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].address.port, 32100);
    assert_eq!(manager.discovery().last_results(), devices);
}

#[tokio::test]
async fn test_discovered_uid_can_be_connected() {
    let (manager, engine) = ready(LinkConfig::default()).await;
    engine.set_discovery_records(
        vec!["bogus".to_string(), format!("{UID}:10.1.1.1:6000")],
        Some(Duration::ZERO),
    );

    let devices = manager.scan(Duration::from_millis(200)).await.unwrap();
    assert_eq!(devices.len(), 1);
    let id = manager.connect(devices[0].uid.as_str()).await.unwrap();
    assert_eq!(engine.session_uid(id), Some(devices[0].uid.clone()));
}
