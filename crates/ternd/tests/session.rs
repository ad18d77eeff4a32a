//! End-to-end session tests: a listener and a dialer wired back to back
//! over an in-memory duplex stream, each with its own spools.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tern_proto::frame::FileId;
use tern_proto::Address;
use ternd::config::Config;
use ternd::error::NodeError;
use ternd::handshake;
use ternd::spool::Spool;
use tokio::time::timeout;

const SESSION_DEADLINE: Duration = Duration::from_secs(30);

/// Builds a node config whose only link points at `peer`, spooling under
/// `dir`.
fn node_config(dir: &TempDir, own: &str, peer: &str, password: &str) -> Arc<Config> {
    let in_dir = dir.path().join("in");
    let out_dir = dir.path().join("out");
    let text = format!(
        r#"{{
            admin: "Test Admin",
            system: "Test System",
            location: "Integration Test",
            nets: [{{
                name: "fsxnet",
                address: "{own}",
                links: [{{
                    address: "{peer}",
                    password: "{password}",
                    "in": "{}",
                    "out": "{}",
                    poll: "4h",
                }}],
            }}],
        }}"#,
        in_dir.display(),
        out_dir.display(),
    );
    let config = Config::parse_str(&text).expect("test config must parse");
    for link in config.links() {
        link.in_spool.create_dirs().unwrap();
        link.out_spool.create_dirs().unwrap();
    }
    Arc::new(config)
}

fn link_spools(config: &Config, peer: &str) -> (Spool, Spool) {
    let peer: Address = peer.parse().unwrap();
    let link = config.link_for(&peer).expect("peer must be linked");
    (link.in_spool.clone(), link.out_spool.clone())
}

/// Publishes `contents` into `spool` under the given wire identity, the
/// same way a completed inbound transfer would.
fn queue_outbound(spool: &Spool, id: &FileId, contents: &[u8]) {
    let (key, mut file) = spool.temp_file_for(id).unwrap();
    file.write_all(contents).unwrap();
    file.sync_all().unwrap();
    drop(file);
    spool.publish(&key).unwrap();
}

async fn run_session(
    listener_cfg: Arc<Config>,
    dialer_cfg: Arc<Config>,
) -> (Result<(), NodeError>, Result<(), NodeError>) {
    let (listener_stream, dialer_stream) = tokio::io::duplex(64 * 1024);
    let listener = tokio::spawn(handshake::run_listener(listener_cfg, listener_stream));
    let dialer = tokio::spawn(handshake::run_dialer(dialer_cfg, dialer_stream));
    timeout(SESSION_DEADLINE, async {
        (listener.await.unwrap(), dialer.await.unwrap())
    })
    .await
    .expect("session must not hang")
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_batch_session_completes_cleanly() {
    let ldir = TempDir::new().unwrap();
    let ddir = TempDir::new().unwrap();
    let listener_cfg = node_config(&ldir, "21:1/100@fsxnet", "21:1/101@fsxnet", "s3cret");
    let dialer_cfg = node_config(&ddir, "21:1/101@fsxnet", "21:1/100@fsxnet", "s3cret");

    let (listener, dialer) = run_session(listener_cfg, dialer_cfg).await;
    listener.expect("listener session should succeed");
    dialer.expect("dialer session should succeed");
}

#[tokio::test(flavor = "multi_thread")]
async fn dialer_file_lands_in_listener_spool() {
    let ldir = TempDir::new().unwrap();
    let ddir = TempDir::new().unwrap();
    let listener_cfg = node_config(&ldir, "21:1/100@fsxnet", "21:1/101@fsxnet", "s3cret");
    let dialer_cfg = node_config(&ddir, "21:1/101@fsxnet", "21:1/100@fsxnet", "s3cret");

    // Big enough to need several data frames.
    let contents: Vec<u8> = (0..70_000u32).map(|i| (i % 251) as u8).collect();
    let id = FileId {
        name: "packet.zip".to_string(),
        size: contents.len() as u64,
        mtime: 1_700_000_000,
    };
    let (_, dialer_out) = link_spools(&dialer_cfg, "21:1/100@fsxnet");
    queue_outbound(&dialer_out, &id, &contents);

    let (listener, dialer) = run_session(listener_cfg.clone(), dialer_cfg).await;
    listener.expect("listener session should succeed");
    dialer.expect("dialer session should succeed");

    // The file was published into the listener's inbound spool.
    let (listener_in, _) = link_spools(&listener_cfg, "21:1/101@fsxnet");
    let queue = listener_in.read_queue("new", "Queue").unwrap();
    assert_eq!(queue.len(), 1, "one file should have been published");
    assert_eq!(queue[0].file, id);
    let received = std::fs::read(listener_in.file_name("new", &queue[0].name)).unwrap();
    assert_eq!(received, contents);

    // The peer's GOT emptied the outbound queue and removed the payload.
    let residual = dialer_out.read_queue("cur", "Queue").unwrap();
    assert!(residual.is_empty(), "GOT should clear the outbound queue");
}

#[tokio::test(flavor = "multi_thread")]
async fn files_flow_both_ways_in_one_session() {
    let ldir = TempDir::new().unwrap();
    let ddir = TempDir::new().unwrap();
    let listener_cfg = node_config(&ldir, "21:1/100@fsxnet", "21:1/101@fsxnet", "s3cret");
    let dialer_cfg = node_config(&ddir, "21:1/101@fsxnet", "21:1/100@fsxnet", "s3cret");

    let to_listener = FileId {
        name: "inbound.pkt".to_string(),
        size: 40_000,
        mtime: 1_700_000_001,
    };
    let to_dialer = FileId {
        name: "outbound.pkt".to_string(),
        size: 5,
        mtime: 1_700_000_002,
    };
    let big: Vec<u8> = (0..40_000u32).map(|i| (i % 249) as u8).collect();

    let (_, dialer_out) = link_spools(&dialer_cfg, "21:1/100@fsxnet");
    queue_outbound(&dialer_out, &to_listener, &big);
    let (_, listener_out) = link_spools(&listener_cfg, "21:1/101@fsxnet");
    queue_outbound(&listener_out, &to_dialer, b"hello");

    let (listener, dialer) = run_session(listener_cfg.clone(), dialer_cfg.clone()).await;
    listener.expect("listener session should succeed");
    dialer.expect("dialer session should succeed");

    let (listener_in, _) = link_spools(&listener_cfg, "21:1/101@fsxnet");
    let queue = listener_in.read_queue("new", "Queue").unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].file, to_listener);
    assert_eq!(
        std::fs::read(listener_in.file_name("new", &queue[0].name)).unwrap(),
        big
    );

    let (dialer_in, _) = link_spools(&dialer_cfg, "21:1/100@fsxnet");
    let queue = dialer_in.read_queue("new", "Queue").unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].file, to_dialer);
    assert_eq!(
        std::fs::read(dialer_in.file_name("new", &queue[0].name)).unwrap(),
        b"hello"
    );

    assert!(dialer_out.read_queue("cur", "Queue").unwrap().is_empty());
    assert!(listener_out.read_queue("cur", "Queue").unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_password_is_rejected_with_err() {
    let ldir = TempDir::new().unwrap();
    let ddir = TempDir::new().unwrap();
    let listener_cfg = node_config(&ldir, "21:1/100@fsxnet", "21:1/101@fsxnet", "s3cret");
    let dialer_cfg = node_config(&ddir, "21:1/101@fsxnet", "21:1/100@fsxnet", "wrong");

    let (listener, dialer) = run_session(listener_cfg, dialer_cfg).await;
    assert!(
        matches!(listener, Err(NodeError::Auth(_))),
        "listener should fail authentication, got {listener:?}"
    );
    match dialer {
        Err(NodeError::PeerError(text)) => assert_eq!(text, "Invalid password"),
        other => panic!("dialer should see the peer's ERR, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_peer_is_rejected() {
    let ldir = TempDir::new().unwrap();
    let ddir = TempDir::new().unwrap();
    // The listener has no link for the dialer's address.
    let listener_cfg = node_config(&ldir, "21:1/100@fsxnet", "21:1/999@fsxnet", "s3cret");
    let dialer_cfg = node_config(&ddir, "21:1/101@fsxnet", "21:1/100@fsxnet", "s3cret");

    let (listener, _dialer) = run_session(listener_cfg, dialer_cfg).await;
    assert!(
        matches!(listener, Err(NodeError::Unlinked)),
        "listener should reject the unlinked peer, got {listener:?}"
    );
}
