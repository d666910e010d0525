//! Commit pipeline behavior: flush semantics, shutdown, shard ordering,
//! back-pressure drops, per-model locks and counter monotonicity.

mod support;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use strato::cond::Condition;
use strato::error::RemoteError;
use strato::{FlushTarget, MemorySource, Model, ModelOps};

use support::{engine_custom, engine_with_memory, engine_with_queues, Seq, User, ALIAS};

/// Delegates to an in-memory store but parks every mutation until the test
/// hands out permits. Lets a test hold a worker mid-batch.
struct GatedSource {
    inner: MemorySource,
    permits: Semaphore,
}

impl GatedSource {
    fn new() -> Self {
        Self {
            inner: MemorySource::new(),
            permits: Semaphore::new(0),
        }
    }

    fn release(&self, count: usize) {
        self.permits.add_permits(count);
    }
}

#[async_trait]
impl ModelOps for GatedSource {
    async fn read(
        &self,
        probe: &dyn Model,
        cond: Option<&Condition>,
    ) -> Result<Option<Box<dyn Model>>, RemoteError> {
        self.inner.read(probe, cond).await
    }

    async fn list(
        &self,
        probe: &dyn Model,
        cond: Option<&Condition>,
    ) -> Result<Vec<Box<dyn Model>>, RemoteError> {
        self.inner.list(probe, cond).await
    }

    async fn write(&self, model: &dyn Model) -> Result<u64, RemoteError> {
        let _permit = self.permits.acquire().await.expect("gate open");
        self.inner.write(model).await
    }

    async fn delete(&self, model: &dyn Model) -> Result<u64, RemoteError> {
        let _permit = self.permits.acquire().await.expect("gate open");
        self.inner.delete(model).await
    }

    async fn clear(
        &self,
        probe: &dyn Model,
        cond: Option<&Condition>,
    ) -> Result<u64, RemoteError> {
        let _permit = self.permits.acquire().await.expect("gate open");
        self.inner.clear(probe, cond).await
    }

    async fn count(&self, probe: &dyn Model, cond: Option<&Condition>) -> Result<i64, RemoteError> {
        self.inner.count(probe, cond).await
    }

    async fn max(&self, probe: &dyn Model, column: &str) -> Result<i64, RemoteError> {
        self.inner.max(probe, column).await
    }

    async fn min(&self, probe: &dyn Model, column: &str) -> Result<i64, RemoteError> {
        self.inner.min(probe, column).await
    }
}

#[tokio::test]
async fn flush_all_waits_for_every_queue_to_drain() {
    let (engine, source) = engine_with_queues(4).await;
    engine.meta(&User::default(), true, true);

    for id in 1..=20 {
        let session = engine.watch(true).await;
        session.write(User::new(id, "w", id)).await;
        session.defer().await;
    }

    engine.flush(FlushTarget::All).await;
    let stats = engine.commit_stats();
    assert_eq!(stats.submitted(), 20);
    assert_eq!(stats.processed(), stats.submitted());
    assert_eq!(stats.pending(), 0);
    assert_eq!(source.stored(&User::default()), 20);
    engine.close().await;
}

#[tokio::test]
async fn close_is_idempotent_and_makes_submit_flush_no_ops() {
    let (engine, source) = engine_with_memory().await;
    engine.meta(&User::default(), true, true);

    let session = engine.watch(true).await;
    session.write(User::new(1, "pre", 1)).await;
    session.defer().await;

    engine.close().await;
    engine.close().await; // idempotent

    // Close drained the queue first.
    assert_eq!(engine.commit_stats().processed(), 1);
    assert_eq!(source.stored(&User::default()), 1);

    // Batches after close are silently dropped; flush is a no-op.
    let late = engine.watch(true).await;
    late.write(User::new(2, "post", 2)).await;
    late.defer().await;
    engine.flush(FlushTarget::All).await;

    assert_eq!(engine.commit_stats().submitted(), 1);
    assert_eq!(source.stored(&User::default()), 1);
}

#[tokio::test]
async fn same_shard_sessions_replay_in_order() {
    // One shard: every session serializes through the same queue.
    let (engine, source) = engine_with_memory().await;
    engine.meta(&User::default(), true, true);

    let writer = engine.watch(true).await;
    writer.write(User::new(5, "first", 1)).await;
    writer.defer().await;

    let deleter = engine.watch(true).await;
    deleter.delete(User::probe(5)).await;
    deleter.defer().await;

    engine.flush(FlushTarget::All).await;
    assert_eq!(source.stored(&User::default()), 0);
    engine.close().await;
}

#[tokio::test]
async fn full_queue_drops_the_batch() {
    let (engine, _unused) = engine_custom(1, 1).await;
    let gated = Arc::new(GatedSource::new());
    engine.register_source(ALIAS, gated.clone());
    engine.meta(&User::default(), true, true);

    // First batch occupies the worker (parked in the gated write), the
    // second fills the single queue slot, the third overflows and drops.
    for id in 1..=3 {
        let session = engine.watch(true).await;
        session.write(User::new(id, "burst", id)).await;
        session.defer().await;
        // Give the worker time to pick up the first batch.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(engine.commit_stats().submitted(), 2);

    gated.release(16);
    engine.flush(FlushTarget::All).await;
    assert_eq!(engine.commit_stats().processed(), 2);
    assert_eq!(gated.inner.stored(&User::default()), 2);
    engine.close().await;
}

#[tokio::test]
async fn deletes_hold_the_model_lock_until_replayed() {
    let (engine, _unused) = engine_with_queues(1).await;
    let gated = Arc::new(GatedSource::new());
    engine.register_source(ALIAS, gated.clone());
    engine.meta(&User::default(), true, true);
    gated.inner.seed(&User::new(6, "locked", 6));

    let session = engine.watch(true).await;
    session.delete(User::probe(6)).await;
    session.defer().await;

    // The lock is taken at defer and visible until the worker replays.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let snapshot = engine.print().await;
    assert!(snapshot.contains("[Lock]\n\tgame_user"));

    gated.release(16);
    engine.flush(FlushTarget::All).await;
    let snapshot = engine.print().await;
    assert!(!snapshot.contains("[Lock]\n\tgame_user"));
    assert_eq!(gated.inner.stored(&User::default()), 0);
    engine.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_incre_is_strictly_monotonic() {
    let (engine, _source) = engine_with_memory().await;
    let engine = Arc::new(engine);
    engine.meta(&Seq::default(), true, true);

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let engine = Arc::clone(&engine);
        tasks.push(tokio::spawn(async move {
            let session = engine.watch(true).await;
            let mut values = Vec::with_capacity(100);
            for _ in 0..100 {
                values.push(session.incre(Seq::default()).await);
            }
            session.defer().await;
            values
        }));
    }

    let mut all = BTreeSet::new();
    for task in tasks {
        for value in task.await.expect("task") {
            assert!(all.insert(value), "duplicate incre value {value}");
        }
    }

    let expected: BTreeSet<i64> = (1..=1000).collect();
    assert_eq!(all, expected);
    engine.close().await;
}

#[tokio::test]
async fn incre_seeds_from_the_remote_maximum() {
    let (engine, source) = engine_with_memory().await;
    engine.meta(&Seq::default(), true, true);
    source.seed(&Seq {
        id: 41,
        valid: true,
    });

    let session = engine.watch(true).await;
    assert_eq!(session.incre(Seq::default()).await, 42);
    assert_eq!(session.incre_by(Seq::default(), Some("id"), 8).await, 50);
    session.defer().await;
    engine.close().await;
}

#[tokio::test]
async fn incre_requires_a_writable_context() {
    let (engine, _source) = engine_with_memory().await;
    engine.meta(&Seq::default(), true, true);

    let session = engine.watch(false).await;
    assert_eq!(session.incre(Seq::default()).await, -1);
    session.defer().await;
    engine.close().await;
}
