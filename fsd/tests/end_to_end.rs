use std::sync::{Arc, Once};
use std::time::Duration;

use raw::raw_request;
use common::{Connection, OpenFlags, ProtocolError, Status};
use fsd::server::{ServerState, Shutdown, serve};
use libfilestore::{StorageTable, StoreConfig};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
            .is_test(true)
            .try_init();
    });
}

struct TestServer {
    addr: String,
    state: Arc<ServerState>,
    shutdown: watch::Sender<Shutdown>,
    handle: JoinHandle<anyhow::Result<()>>,
}

async fn start(storage: StoreConfig, max_clients: usize) -> TestServer {
    init_logging();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let state = Arc::new(ServerState::new(StorageTable::new(storage).unwrap()));
    let (shutdown, rx) = watch::channel(Shutdown::Running);
    let handle = tokio::spawn(serve(listener, state.clone(), max_clients, rx));
    TestServer {
        addr,
        state,
        shutdown,
        handle,
    }
}

async fn connect(server: &TestServer) -> Connection {
    Connection::open(&server.addr, Duration::from_millis(20), Duration::from_secs(2))
        .await
        .unwrap()
}

fn small_table() -> StoreConfig {
    StoreConfig {
        max_files: 2,
        max_bytes: 64,
        ..Default::default()
    }
}

fn status_of(result: Result<impl std::fmt::Debug, ProtocolError>) -> Option<Status> {
    result.err().and_then(|e| e.status())
}

mod raw {
    use bytes::Bytes;
    use common::frame::{recv_response, transport};
    use common::protocol::Response;
    use futures::SinkExt;
    use tokio::net::TcpStream;

    /// Sends hand-made frames and returns the reply, if any.
    pub async fn raw_request(addr: &str, frames: Vec<Vec<u8>>) -> Option<Response> {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut transport = transport(stream);
        for frame in frames {
            transport.send(Bytes::from(frame)).await.unwrap();
        }
        recv_response(&mut transport).await.ok().flatten()
    }
}

#[tokio::test]
async fn test_create_write_read_remove() {
    let server = start(small_table(), 8).await;
    let mut c1 = connect(&server).await;

    c1.open_file("/docs/a", OpenFlags::CREATE | OpenFlags::LOCK)
        .await
        .unwrap();
    assert!(c1.write_file("/docs/a", b"hello", None).await.unwrap().is_empty());
    c1.append_to_file("/docs/a", b" world", None).await.unwrap();
    assert_eq!(c1.read_file("/docs/a").await.unwrap(), b"hello world");
    c1.unlock_file("/docs/a").await.unwrap();

    let mut c2 = connect(&server).await;
    // not opened yet
    assert_eq!(
        status_of(c2.read_file("/docs/a").await),
        Some(Status::PermissionDenied)
    );
    c2.open_file("/docs/a", OpenFlags::empty()).await.unwrap();
    assert_eq!(c2.read_file("/docs/a").await.unwrap(), b"hello world");
    let sample = c2.read_n_files(0, None).await.unwrap();
    assert_eq!(sample.len(), 1);
    assert_eq!(sample[0].pathname, "/docs/a");

    c2.remove_file("/docs/a").await.unwrap();
    assert_eq!(
        status_of(c1.read_file("/docs/a").await),
        Some(Status::NotFound)
    );
    assert_eq!(server.state.store.stats().unwrap().file_count, 0);

    c1.close().await.unwrap();
    c2.close().await.unwrap();
}

#[tokio::test]
async fn test_lock_waits_for_unlock() {
    let server = start(small_table(), 8).await;
    let mut c1 = connect(&server).await;
    c1.open_file("/f", OpenFlags::CREATE | OpenFlags::LOCK)
        .await
        .unwrap();
    c1.write_file("/f", b"x", None).await.unwrap();

    let mut c2 = connect(&server).await;
    c2.open_file("/f", OpenFlags::empty()).await.unwrap();
    let waiter = tokio::spawn(async move {
        c2.lock_file("/f").await.unwrap();
        c2
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiter.is_finished());

    c1.unlock_file("/f").await.unwrap();
    let mut c2 = timeout(WAIT, waiter).await.unwrap().unwrap();
    c2.append_to_file("/f", b"y", None).await.unwrap();
    assert_eq!(
        status_of(c1.append_to_file("/f", b"z", None).await),
        Some(Status::PermissionDenied)
    );
}

#[tokio::test]
async fn test_disconnect_hands_lock_to_waiter() {
    let server = start(small_table(), 8).await;
    let mut c1 = connect(&server).await;
    c1.open_file("/f", OpenFlags::CREATE | OpenFlags::LOCK)
        .await
        .unwrap();
    c1.write_file("/f", b"x", None).await.unwrap();

    let mut c2 = connect(&server).await;
    let waiter = tokio::spawn(async move {
        c2.open_file("/f", OpenFlags::LOCK).await.unwrap();
        c2
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiter.is_finished());

    c1.close().await.unwrap();
    let mut c2 = timeout(WAIT, waiter).await.unwrap().unwrap();
    c2.append_to_file("/f", b"y", None).await.unwrap();
    assert_eq!(c2.read_file("/f").await.unwrap(), b"xy");
}

#[tokio::test]
async fn test_waiter_fails_when_file_is_removed() {
    let server = start(small_table(), 8).await;
    let mut c1 = connect(&server).await;
    c1.open_file("/f", OpenFlags::CREATE | OpenFlags::LOCK)
        .await
        .unwrap();
    c1.write_file("/f", b"x", None).await.unwrap();

    let mut c2 = connect(&server).await;
    c2.open_file("/f", OpenFlags::empty()).await.unwrap();
    let waiter = tokio::spawn(async move { c2.lock_file("/f").await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    c1.remove_file("/f").await.unwrap();
    let result = timeout(WAIT, waiter).await.unwrap().unwrap();
    assert_eq!(status_of(result), Some(Status::NotFound));
}

#[tokio::test]
async fn test_eviction_saves_victims() {
    let server = start(small_table(), 8).await;
    let dir = tempfile::tempdir().unwrap();
    let mut c1 = connect(&server).await;

    for (name, data) in [("/d/one", b"1111"), ("/d/two", b"2222")] {
        c1.open_file(name, OpenFlags::CREATE | OpenFlags::LOCK)
            .await
            .unwrap();
        c1.write_file(name, data, Some(dir.path())).await.unwrap();
    }
    c1.read_file("/d/one").await.unwrap();

    c1.open_file("/d/three", OpenFlags::CREATE | OpenFlags::LOCK)
        .await
        .unwrap();
    let evicted = c1
        .write_file("/d/three", b"3333", Some(dir.path()))
        .await
        .unwrap();
    assert_eq!(evicted.len(), 1);
    assert_eq!(evicted[0].pathname, "/d/two");
    assert_eq!(std::fs::read(dir.path().join("d_two")).unwrap(), b"2222");

    let stats = server.state.store.stats().unwrap();
    assert_eq!(stats.file_count, 2);
    assert_eq!(stats.evictions, 1);
}

#[tokio::test]
async fn test_write_too_large() {
    let server = start(small_table(), 8).await;
    let mut c1 = connect(&server).await;
    c1.open_file("/big", OpenFlags::CREATE | OpenFlags::LOCK)
        .await
        .unwrap();
    assert_eq!(
        status_of(c1.write_file("/big", &[0u8; 65], None).await),
        Some(Status::TooLarge)
    );
    assert_eq!(
        status_of(c1.read_file("/big").await),
        Some(Status::NotFound)
    );
}

#[tokio::test]
async fn test_extra_clients_are_refused() {
    let server = start(small_table(), 1).await;
    let mut c1 = connect(&server).await;
    // a completed request proves c1 holds the only slot
    assert!(c1.read_n_files(0, None).await.unwrap().is_empty());

    let mut c2 = connect(&server).await;
    let refused = timeout(WAIT, c2.read_n_files(0, None)).await.unwrap();
    assert!(refused.is_err());

    c1.close().await.unwrap();
}

#[tokio::test]
async fn test_malformed_request_closes_connection() {
    let server = start(small_table(), 8).await;
    let reply = timeout(WAIT, raw_request(&server.addr, vec![b"format".to_vec()]))
        .await
        .unwrap();
    assert!(matches!(
        reply,
        Some(common::Response::Error {
            status: Status::BadRequest,
            ..
        })
    ));
}

#[tokio::test]
async fn test_graceful_shutdown_waits_for_clients() {
    let server = start(small_table(), 8).await;
    let mut c1 = connect(&server).await;
    c1.open_file("/f", OpenFlags::CREATE).await.unwrap();

    server.shutdown.send_replace(Shutdown::Graceful);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!server.handle.is_finished());
    // the connected client is still served
    assert!(c1.read_n_files(0, None).await.unwrap().is_empty());

    c1.close().await.unwrap();
    timeout(WAIT, server.handle).await.unwrap().unwrap().unwrap();
    // the abandoned draft went with the client
    assert_eq!(server.state.store.stats().unwrap().staged, 0);
}

#[tokio::test]
async fn test_immediate_shutdown_drops_clients() {
    let server = start(small_table(), 8).await;
    let mut c1 = connect(&server).await;
    c1.open_file("/f", OpenFlags::CREATE).await.unwrap();

    server.shutdown.send_replace(Shutdown::Immediate);
    timeout(WAIT, server.handle).await.unwrap().unwrap().unwrap();
    let dropped = timeout(WAIT, c1.read_n_files(0, None)).await.unwrap();
    assert!(dropped.is_err());
}
