//! Concurrency contracts for the coordinator: one producer per key, no
//! cross-key waiting, and a lock table that never outlives its waiters.

use async_trait::async_trait;
use futures::future::join_all;
use pixelgrove_cache::{
    ArtifactRequest, BufferPool, CacheConfig, Coordinator, Error, PooledBuffer, ProduceError,
    Producer,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;
use tokio::sync::Notify;

/// Produces key-derived payloads after a fixed delay, counting invocations.
struct SlowProducer {
    calls: AtomicUsize,
    delay: Duration,
}

impl SlowProducer {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Producer for SlowProducer {
    async fn produce(
        &self,
        request: &ArtifactRequest,
        pool: &BufferPool,
    ) -> Result<PooledBuffer, ProduceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let payload = format!("artifact for {}", request.key).into_bytes();
        let mut buffer = pool.allocate(payload.len());
        buffer.copy_from_slice(&payload);
        Ok(buffer)
    }
}

/// Blocks production of `gated/` keys until the gate opens; everything else
/// produces immediately.
struct GatedProducer {
    gate: Notify,
    gated_calls: AtomicUsize,
}

impl GatedProducer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            gate: Notify::new(),
            gated_calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Producer for GatedProducer {
    async fn produce(
        &self,
        request: &ArtifactRequest,
        pool: &BufferPool,
    ) -> Result<PooledBuffer, ProduceError> {
        if request.key.starts_with("gated/") {
            self.gated_calls.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
        }
        let payload = format!("artifact for {}", request.key).into_bytes();
        let mut buffer = pool.allocate(payload.len());
        buffer.copy_from_slice(&payload);
        Ok(buffer)
    }
}

fn request(key: &str) -> ArtifactRequest {
    ArtifactRequest::new(key, SystemTime::UNIX_EPOCH)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_identical_requests_produce_exactly_once() {
    let root = TempDir::new().expect("temp dir");
    let producer = SlowProducer::new(Duration::from_millis(50));
    let coordinator = Arc::new(
        Coordinator::with_disk_store(CacheConfig::new(root.path()), producer.clone())
            .expect("valid config"),
    );

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.fetch(&request("img/cat.jpg?w=200")).await })
        })
        .collect();

    for joined in join_all(tasks).await {
        let buffer = joined.expect("task completes").expect("fetch succeeds");
        assert_eq!(&buffer[..], b"artifact for img/cat.jpg?w=200");
    }

    assert_eq!(
        producer.calls(),
        1,
        "identical concurrent requests must collapse onto one producer"
    );
    assert_eq!(coordinator.active_locks(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn distinct_keys_progress_independently() {
    let root = TempDir::new().expect("temp dir");
    let producer = GatedProducer::new();
    let coordinator = Arc::new(
        Coordinator::with_disk_store(CacheConfig::new(root.path()), producer.clone())
            .expect("valid config"),
    );

    let gated = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.fetch(&request("gated/slow.jpg")).await })
    };

    // Let the gated request enter its critical section before racing it.
    while producer.gated_calls.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let fast = tokio::time::timeout(
        Duration::from_secs(5),
        coordinator.fetch(&request("img/fast.jpg")),
    )
    .await
    .expect("a distinct key must not wait on an in-flight producer")
    .expect("fetch succeeds");
    assert_eq!(&fast[..], b"artifact for img/fast.jpg");

    producer.gate.notify_one();
    let gated = gated
        .await
        .expect("task completes")
        .expect("gated fetch succeeds");
    assert_eq!(&gated[..], b"artifact for gated/slow.jpg");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lock_wait_limit_surfaces_cancellation() {
    let root = TempDir::new().expect("temp dir");
    let producer = GatedProducer::new();
    let coordinator = Arc::new(
        Coordinator::with_disk_store(CacheConfig::new(root.path()), producer.clone())
            .expect("valid config")
            .with_lock_timeout(Duration::from_millis(100)),
    );

    let holder = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.fetch(&request("gated/contended.jpg")).await })
    };
    while producer.gated_calls.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let timed_out = coordinator.fetch(&request("gated/contended.jpg")).await;
    assert!(
        matches!(timed_out, Err(Error::LockCancelled { .. })),
        "waiting past the limit must surface as lock cancellation"
    );

    // The abandoned waiter must not corrupt the holder's critical section.
    producer.gate.notify_one();
    let held = holder
        .await
        .expect("task completes")
        .expect("holder fetch succeeds");
    assert_eq!(&held[..], b"artifact for gated/contended.jpg");
    assert_eq!(coordinator.active_locks(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_distinct_keys_leave_no_lock_entries() {
    let root = TempDir::new().expect("temp dir");
    let producer = SlowProducer::new(Duration::from_millis(5));
    let coordinator = Arc::new(
        Coordinator::with_disk_store(CacheConfig::new(root.path()), producer.clone())
            .expect("valid config"),
    );

    for wave in 0..3 {
        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let coordinator = Arc::clone(&coordinator);
                let key = format!("img/{wave}-{i}.jpg");
                tokio::spawn(async move { coordinator.fetch(&request(&key)).await })
            })
            .collect();
        for joined in join_all(tasks).await {
            joined.expect("task completes").expect("fetch succeeds");
        }
    }

    assert_eq!(producer.calls(), 24, "every distinct key produces once");
    assert_eq!(
        coordinator.active_locks(),
        0,
        "completed waves must not retain lock entries"
    );
}
