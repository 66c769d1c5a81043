use async_trait::async_trait;
use confwatch::{
    CloseReason, ConfigStore, Error, GrpcStore, KeySpace, LiveView, MemoryStore, Op, Revision,
    Snapshot, StoreConfig, SyncState, Synchronizer, ViewSnapshot, WatchStream, Writer,
};
use confwatch_server::{db, grpc, storage, Authenticator};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};

async fn start_test_server(
    authenticator: Authenticator,
) -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("[::1]:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let pool = db::init_pool("sqlite::memory:").await.unwrap();
    let storage = Arc::new(storage::Storage::open(pool).await.unwrap());
    let server = grpc::create_server(storage, authenticator);

    let handle = tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(server)
            .serve_with_incoming(tokio_stream::wrappers::TcpListenerStream::new(listener))
            .await
            .unwrap();
    });

    sleep(Duration::from_millis(100)).await;
    (addr, handle)
}

fn config_for(addr: SocketAddr) -> StoreConfig {
    StoreConfig::new(vec![format!("http://{}", addr)]).dial_timeout(Duration::from_secs(2))
}

async fn next_view(live: &mut LiveView) -> ViewSnapshot {
    timeout(Duration::from_secs(5), live.next())
        .await
        .expect("view published in time")
        .expect("synchronizer still running")
}

#[tokio::test]
async fn test_live_view_follows_the_server() {
    let (addr, _handle) = start_test_server(Authenticator::open()).await;
    let store = GrpcStore::connect(&config_for(addr)).await.unwrap();

    store.put("/config/srv1/timeout", "30").await.unwrap();
    store.put("/config/srv2/timeout", "99").await.unwrap();

    let mut live = LiveView::start(store.clone(), &KeySpace::default(), "srv1").unwrap();

    let seeded = next_view(&mut live).await;
    assert_eq!(seeded.to_string(), "{timeout=30}");
    assert_eq!(seeded.revision(), Revision(2));

    store.put("/config/srv1/retries", "3").await.unwrap();
    let view = next_view(&mut live).await;
    assert_eq!(view.to_string(), "{retries=3, timeout=30}");

    store.delete("/config/srv1/timeout").await.unwrap();
    let view = next_view(&mut live).await;
    assert_eq!(view.to_string(), "{retries=3}");

    // Changes to other entities never show up.
    store.put("/config/srv2/retries", "1").await.unwrap();
    store.put("/config/srv1/retries", "4").await.unwrap();
    let view = next_view(&mut live).await;
    assert_eq!(view.to_string(), "{retries=4}");

    live.cancel();
    assert!(timeout(Duration::from_secs(5), live.next()).await.unwrap().is_none());
    assert_eq!(live.join().await.unwrap(), CloseReason::Cancelled);
}

#[tokio::test]
async fn test_write_is_visible_to_a_fresh_seed() {
    let (addr, _handle) = start_test_server(Authenticator::open()).await;
    let store = GrpcStore::connect(&config_for(addr)).await.unwrap();

    let writer = Writer::new(store.clone(), KeySpace::default());
    writer.write("srv1", "timeout", "45").await.unwrap();

    let mut live = LiveView::start(store, &KeySpace::default(), "srv1").unwrap();
    let view = next_view(&mut live).await;
    assert_eq!(view.get("timeout"), Some("45"));
}

#[tokio::test]
async fn test_prefix_delete_is_published_as_one_view() {
    let (addr, _handle) = start_test_server(Authenticator::open()).await;
    let store = GrpcStore::connect(&config_for(addr)).await.unwrap();

    store.put("/config/srv1/a", "1").await.unwrap();
    store.put("/config/srv1/b", "2").await.unwrap();

    let mut live = LiveView::start(store.clone(), &KeySpace::default(), "srv1").unwrap();
    assert_eq!(next_view(&mut live).await.len(), 2);

    let (deleted, revision) = store.delete_prefix("/config/srv1/").await.unwrap();
    assert_eq!(deleted, 2);

    let view = next_view(&mut live).await;
    assert!(view.is_empty());
    assert_eq!(view.revision(), revision);
}

/// Compacts the store right after the seed read, so the watch has to resume
/// from a revision that no longer exists.
struct CompactAfterSeed {
    inner: GrpcStore,
}

#[async_trait]
impl ConfigStore for CompactAfterSeed {
    async fn get_prefix(&self, prefix: &str) -> Result<Snapshot, Error> {
        let snapshot = self.inner.get_prefix(prefix).await?;
        let head = self.inner.put("/config/other/x", "1").await?;
        self.inner.compact(head).await?;
        Ok(snapshot)
    }

    async fn put(&self, key: &str, value: &str) -> Result<Revision, Error> {
        self.inner.put(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<Option<Revision>, Error> {
        self.inner.delete(key).await
    }

    async fn watch_prefix(&self, prefix: &str, after: Revision) -> Result<WatchStream, Error> {
        self.inner.watch_prefix(prefix, after).await
    }
}

#[tokio::test]
async fn test_compacted_resume_marker_fails_the_run() {
    let (addr, _handle) = start_test_server(Authenticator::open()).await;
    let store = GrpcStore::connect(&config_for(addr)).await.unwrap();
    store.put("/config/srv1/timeout", "30").await.unwrap();

    let compacting = CompactAfterSeed {
        inner: store.clone(),
    };
    let mut sync = Synchronizer::new(compacting, &KeySpace::default(), "srv1").unwrap();
    let mut views = Vec::new();
    let mut sink = |view: ViewSnapshot| views.push(view);

    let err = timeout(Duration::from_secs(5), sync.run(&mut sink))
        .await
        .unwrap()
        .unwrap_err();

    assert!(err.is_compacted(), "unexpected error: {}", err);
    assert!(matches!(err, Error::Stream { .. }));
    assert_eq!(sync.state(), SyncState::Failed);
    assert_eq!(views.len(), 1);

    let (head, compacted) = store.status().await.unwrap();
    assert_eq!(head, Revision(2));
    assert_eq!(compacted, head);
}

#[tokio::test]
async fn test_credentials_are_checked_at_connect() {
    let (addr, _handle) =
        start_test_server(Authenticator::with_credentials("root", "secret")).await;

    let err = GrpcStore::connect(&config_for(addr)).await.err().unwrap();
    assert!(matches!(err, Error::Connection(_)));

    let err = GrpcStore::connect(&config_for(addr).credentials("root", "wrong"))
        .await
        .err()
        .unwrap();
    assert!(err.is_connection());

    let store = GrpcStore::connect(&config_for(addr).credentials("root", "secret"))
        .await
        .unwrap();
    assert_eq!(store.put("/config/srv1/a", "1").await.unwrap(), Revision(1));
}

#[tokio::test]
async fn test_unreachable_endpoint_is_a_connection_error() {
    let listener = TcpListener::bind("[::1]:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = GrpcStore::connect(&config_for(addr)).await.err().unwrap();
    assert!(matches!(err, Error::Transport(_)), "unexpected error: {}", err);
    assert!(err.is_connection());
}

#[tokio::test]
async fn test_memory_store_batches_are_published_atomically() {
    let store = Arc::new(MemoryStore::new());
    store.set("/config/srv1/timeout", "30");

    let mut live = LiveView::start(Arc::clone(&store), &KeySpace::default(), "srv1").unwrap();
    assert_eq!(next_view(&mut live).await.to_string(), "{timeout=30}");

    store.commit(vec![
        Op::put("/config/srv1/retries", "3"),
        Op::delete("/config/srv1/timeout"),
        Op::put("/config/srv1/mode", "fast"),
    ]);

    let view = next_view(&mut live).await;
    assert_eq!(view.to_string(), "{mode=fast, retries=3}");
    assert_eq!(view.revision(), Revision(2));
}

#[tokio::test]
async fn test_memory_store_watch_is_released_on_cancel() {
    let store = Arc::new(MemoryStore::new());
    let mut live = LiveView::start(Arc::clone(&store), &KeySpace::default(), "srv1").unwrap();
    next_view(&mut live).await;

    // The watch opens right after the first publish.
    for _ in 0..50 {
        if store.watcher_count() == 1 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(store.watcher_count(), 1);

    live.cancel();
    assert_eq!(live.join().await.unwrap(), CloseReason::Cancelled);
    assert_eq!(store.watcher_count(), 0);
}

#[tokio::test]
async fn test_memory_store_clean_end_of_stream_closes_the_run() {
    let store = Arc::new(MemoryStore::new());
    let mut live = LiveView::start(Arc::clone(&store), &KeySpace::default(), "srv1").unwrap();
    next_view(&mut live).await;

    for _ in 0..50 {
        if store.watcher_count() == 1 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    store.close_watches();

    let reason = timeout(Duration::from_secs(5), live.join()).await.unwrap().unwrap();
    assert_eq!(reason, CloseReason::EndOfStream);
}
