//! Reactor integration tests
//!
//! Runs the whole bridge against a scripted stub on a unix socket and a fake
//! sysfs tree:
//! - startup failures (no vhci_hcd, no free port)
//! - connect, attach, transport loss, detach, reconnect
//! - shutdown while the stub is unreachable
//!
//! Run with: `cargo test -p bridge --test reactor`

use bridge::Reactor;
use bridge::config::{BridgeConfig, TransportKind};
use bytes::Bytes;
use common::Error;
use common::test_utils::{
    DEFAULT_TEST_TIMEOUT, MockStub, StubAction, StubRequest, create_mock_device_info, with_timeout,
};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::UnixListener;
use tokio::sync::watch;

const STATUS_TWO_FREE: &str = "\
hub port sta spd dev      sockfd local_busid
hs  0000 006 003 00020002 000009 2-2
hs  0001 004 000 00000000 000000 0-0
hs  0002 004 000 00000000 000000 0-0
ss  0003 004 000 00000000 000000 0-0
";

const STATUS_ONE_FREE: &str = "\
hub port sta spd dev      sockfd local_busid
hs  0000 006 003 00020002 000009 2-2
hs  0001 006 003 00010001 000011 1-1
hs  0002 004 000 00000000 000000 0-0
ss  0003 004 000 00000000 000000 0-0
";

const STATUS_FULL: &str = "\
hub port sta spd dev      sockfd local_busid
hs  0000 006 003 00020002 000009 2-2
hs  0001 006 003 00010001 000011 1-1
ss  0002 004 000 00000000 000000 0-0
";

// ============================================================================
// Harness
// ============================================================================

struct Sandbox {
    dir: TempDir,
    vhci: PathBuf,
}

impl Sandbox {
    fn new(status: Option<&str>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let vhci = dir.path().join("sysfs").join("vhci_hcd.0");
        fs::create_dir_all(&vhci).unwrap();
        if let Some(status) = status {
            fs::write(vhci.join("status"), status).unwrap();
            fs::write(vhci.join("attach"), "").unwrap();
            fs::write(vhci.join("detach"), "").unwrap();
        }
        Self { dir, vhci }
    }

    fn socket_path(&self) -> PathBuf {
        self.dir.path().join("stub.sock")
    }

    fn config(&self) -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.transport.kind = TransportKind::Unix;
        config.transport.path = Some(self.socket_path());
        config.transport.reconnect_interval_ms = 50;
        config.usbip.listen_addr = "127.0.0.1:0".parse().unwrap();
        config.vhci.sysfs_root = self.dir.path().join("sysfs");
        config.vhci.retry_interval_ms = 50;
        config.proxy.heartbeat_interval_secs = 0;
        config
    }

    fn read(&self, file: &str) -> String {
        fs::read_to_string(self.vhci.join(file)).unwrap_or_default()
    }

    fn set_status(&self, status: &str) {
        fs::write(self.vhci.join("status"), status).unwrap();
    }

    async fn wait_for(&self, file: &str, done: impl Fn(&str) -> bool) -> String {
        with_timeout(DEFAULT_TEST_TIMEOUT, async {
            loop {
                let content = self.read(file);
                if done(&content) {
                    return content;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap()
    }
}

fn cooperative_stub() -> MockStub<impl FnMut(&StubRequest) -> StubAction + Send> {
    MockStub::new(vec![create_mock_device_info(1, 1)], |_| {
        StubAction::Reply(Bytes::new())
    })
}

async fn accept_stub(listener: &UnixListener) -> tokio::task::JoinHandle<()> {
    let (stream, _) = with_timeout(DEFAULT_TEST_TIMEOUT, listener.accept())
        .await
        .unwrap()
        .unwrap();
    tokio::spawn(async move {
        cooperative_stub().serve(stream).await;
    })
}

fn is_attach_line(content: &str, port: &str) -> bool {
    content.ends_with('\n') && content.split(' ').next() == Some(port)
}

async fn run_to_completion(config: BridgeConfig) -> common::Result<()> {
    let reactor = Reactor::new(config).unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    with_timeout(DEFAULT_TEST_TIMEOUT, reactor.run(shutdown_rx))
        .await
        .unwrap()
}

// ============================================================================
// Startup
// ============================================================================

#[tokio::test]
async fn test_missing_vhci_is_fatal() {
    let sandbox = Sandbox::new(None);
    let result = run_to_completion(sandbox.config()).await;
    match result {
        Err(Error::VhciUnavailable(message)) => assert!(message.contains("modprobe vhci-hcd")),
        other => panic!("expected VhciUnavailable, got {:?}", other),
    }
}

#[tokio::test]
async fn test_full_controller_is_fatal_before_listening() {
    let sandbox = Sandbox::new(Some(STATUS_FULL));
    let result = run_to_completion(sandbox.config()).await;
    assert!(matches!(result, Err(Error::NoFreeVhciPort)));
    assert_eq!(sandbox.read("attach"), "");
}

#[tokio::test]
async fn test_transport_settings_are_checked_up_front() {
    let sandbox = Sandbox::new(Some(STATUS_TWO_FREE));
    let mut config = sandbox.config();
    config.transport.path = None;
    assert!(matches!(Reactor::new(config), Err(Error::Config(_))));
}

// ============================================================================
// Connection cycles
// ============================================================================

#[tokio::test]
async fn test_shutdown_while_stub_is_unreachable() {
    let sandbox = Sandbox::new(Some(STATUS_TWO_FREE));
    let reactor = Reactor::new(sandbox.config()).unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(reactor.run(shutdown_rx));

    // Several reconnect intervals pass without a stub
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!running.is_finished());
    assert_eq!(sandbox.read("attach"), "");

    shutdown_tx.send_replace(true);
    let result = with_timeout(DEFAULT_TEST_TIMEOUT, running)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_reconnect_cycle_reattaches() {
    let sandbox = Sandbox::new(Some(STATUS_TWO_FREE));
    let listener = UnixListener::bind(sandbox.socket_path()).unwrap();
    let reactor = Reactor::new(sandbox.config()).unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(reactor.run(shutdown_rx));

    // First session lands on port 1
    let stub = accept_stub(&listener).await;
    sandbox
        .wait_for("attach", |content| is_attach_line(content, "1"))
        .await;
    assert_eq!(sandbox.read("detach"), "");

    // The stub goes away: the port is released
    sandbox.set_status(STATUS_ONE_FREE);
    stub.abort();
    let detach = sandbox.wait_for("detach", |content| !content.is_empty()).await;
    assert_eq!(detach, "1\n");

    // The next session takes the remaining port
    let stub = accept_stub(&listener).await;
    sandbox
        .wait_for("attach", |content| is_attach_line(content, "2"))
        .await;

    shutdown_tx.send_replace(true);
    let result = with_timeout(DEFAULT_TEST_TIMEOUT, running)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
    stub.abort();
}

#[tokio::test]
async fn test_shutdown_releases_attached_port() {
    let sandbox = Sandbox::new(Some(STATUS_TWO_FREE));
    let listener = UnixListener::bind(sandbox.socket_path()).unwrap();
    let reactor = Reactor::new(sandbox.config()).unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(reactor.run(shutdown_rx));

    let _stub = accept_stub(&listener).await;
    sandbox
        .wait_for("attach", |content| is_attach_line(content, "1"))
        .await;
    sandbox.set_status(STATUS_ONE_FREE);

    shutdown_tx.send_replace(true);
    let result = with_timeout(DEFAULT_TEST_TIMEOUT, running)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(sandbox.read("detach"), "1\n");
}
