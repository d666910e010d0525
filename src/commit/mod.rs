//! The sharded asynchronous commit pipeline.
//!
//! `defer` condenses a writable session into one [`CommitBatch`] and routes
//! it to the shard `gid % queue_count`, so batches from one logical thread
//! replay in FIFO order. Each shard owns a bounded channel and one worker
//! task selecting over new batches, flush requests and the shutdown signal.
//!
//! Replay applies clears first, then deletes, then creates/updates: the
//! per-model commit locks taken at `defer` are released as soon as the
//! corresponding destructive mutation lands, which shortens the window in
//! which readers block on the remote tier.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use metrics::{counter, gauge, Counter, Gauge};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::lock::mutex_lock;
use crate::cache::GlobalStore;
use crate::cond::Condition;
use crate::model::{cell_clone, ModelCell};
use crate::source::SourceRegistry;

const SOURCE: &str = "commit";

const GAUGE_PENDING: &str = "xorm_commit_queue";
const COUNTER_TOTAL: &str = "xorm_commit_total";

/// What the worker replays against the remote tier for one entry.
#[derive(Debug, Clone)]
pub enum CommitAction {
    Create,
    Update,
    Delete,
    Clear(Condition),
}

/// One mutation extracted from a session entry.
pub struct CommitEntry {
    pub cell: ModelCell,
    pub action: CommitAction,
    pub alias: String,
    pub model_key: String,
    pub data_key: String,
}

/// Hook invoked around each entry's remote call.
pub type CommitHook = Arc<dyn Fn(&CommitEntry) + Send + Sync>;

/// The unit handed from `defer` to exactly one shard.
pub struct CommitBatch {
    pub gid: u64,
    pub entries: Vec<CommitEntry>,
    pub prehandler: Option<CommitHook>,
    pub posthandler: Option<CommitHook>,
}

impl CommitBatch {
    pub fn new(gid: u64) -> Self {
        Self {
            gid,
            entries: Vec::new(),
            prehandler: None,
            posthandler: None,
        }
    }
}

/// Flush scope: one session's shard, or every shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTarget {
    All,
    Gid(u64),
}

/// Counters shared between workers and observers. The `metrics` handles
/// mirror the atomics so both dashboards and tests see the same numbers.
pub struct CommitStats {
    submitted: AtomicU64,
    processed: AtomicU64,
    pending: AtomicI64,
    queue_pending: Vec<AtomicI64>,
    gauge: Gauge,
    counter: Counter,
    queue_gauges: Vec<Gauge>,
    queue_counters: Vec<Counter>,
}

impl CommitStats {
    fn new(queue_count: usize) -> Self {
        Self {
            submitted: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            pending: AtomicI64::new(0),
            queue_pending: (0..queue_count).map(|_| AtomicI64::new(0)).collect(),
            gauge: gauge!(GAUGE_PENDING),
            counter: counter!(COUNTER_TOTAL),
            queue_gauges: (0..queue_count)
                .map(|index| gauge!(format!("{GAUGE_PENDING}_{index}")))
                .collect(),
            queue_counters: (0..queue_count)
                .map(|index| counter!(format!("{COUNTER_TOTAL}_{index}")))
                .collect(),
        }
    }

    fn submitted_objects(&self, queue: usize, count: usize) {
        self.submitted.fetch_add(count as u64, Ordering::AcqRel);
        self.pending.fetch_add(count as i64, Ordering::AcqRel);
        self.queue_pending[queue].fetch_add(count as i64, Ordering::AcqRel);
        self.gauge.increment(count as f64);
        self.queue_gauges[queue].increment(count as f64);
    }

    fn processed_object(&self, queue: usize) {
        self.processed.fetch_add(1, Ordering::AcqRel);
        self.pending.fetch_sub(1, Ordering::AcqRel);
        self.queue_pending[queue].fetch_sub(1, Ordering::AcqRel);
        self.counter.increment(1);
        self.queue_counters[queue].increment(1);
        self.gauge.decrement(1.0);
        self.queue_gauges[queue].decrement(1.0);
    }

    fn reset_gauges(&self) {
        self.gauge.set(0.0);
        for gauge in &self.queue_gauges {
            gauge.set(0.0);
        }
    }

    /// Objects accepted into a queue so far.
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Acquire)
    }

    /// Objects fully handled by workers so far.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Acquire)
    }

    /// Objects sitting in queues right now.
    pub fn pending(&self) -> i64 {
        self.pending.load(Ordering::Acquire)
    }
}

struct WorkerContext {
    queue_id: usize,
    global: Arc<GlobalStore>,
    sources: Arc<SourceRegistry>,
    stats: Arc<CommitStats>,
}

pub struct CommitPipeline {
    queue_count: usize,
    queues: Vec<mpsc::Sender<CommitBatch>>,
    flush_queues: Vec<mpsc::Sender<oneshot::Sender<()>>>,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    flushing: AtomicBool,
    stats: Arc<CommitStats>,
}

impl CommitPipeline {
    /// Spawn `queue_count` workers. Must run inside a tokio runtime.
    pub fn start(
        queue_count: usize,
        queue_capacity: usize,
        global: Arc<GlobalStore>,
        sources: Arc<SourceRegistry>,
    ) -> Self {
        let queue_count = queue_count.max(1);
        let queue_capacity = queue_capacity.max(1);
        let stats = Arc::new(CommitStats::new(queue_count));
        let (shutdown, _) = watch::channel(false);

        let mut queues = Vec::with_capacity(queue_count);
        let mut flush_queues = Vec::with_capacity(queue_count);
        let mut workers = Vec::with_capacity(queue_count);

        for queue_id in 0..queue_count {
            let (batch_tx, batch_rx) = mpsc::channel::<CommitBatch>(queue_capacity);
            let (flush_tx, flush_rx) = mpsc::channel::<oneshot::Sender<()>>(1);
            let context = WorkerContext {
                queue_id,
                global: Arc::clone(&global),
                sources: Arc::clone(&sources),
                stats: Arc::clone(&stats),
            };
            workers.push(tokio::spawn(worker_loop(
                context,
                batch_rx,
                flush_rx,
                shutdown.subscribe(),
            )));
            queues.push(batch_tx);
            flush_queues.push(flush_tx);
        }

        info!(queue_count, queue_capacity, "commit pipeline started");
        Self {
            queue_count,
            queues,
            flush_queues,
            shutdown,
            workers: Mutex::new(workers),
            closed: AtomicBool::new(false),
            flushing: AtomicBool::new(false),
            stats,
        }
    }

    pub fn queue_count(&self) -> usize {
        self.queue_count
    }

    pub fn stats(&self) -> &CommitStats {
        &self.stats
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn queue_for(&self, gid: u64) -> usize {
        (gid % self.queue_count as u64) as usize
    }

    /// Route a batch to its shard. Submission never blocks: a full shard
    /// drops the batch with a critical log, and a closed pipeline drops it
    /// silently.
    pub fn submit(&self, batch: CommitBatch) {
        if self.is_closed() {
            return;
        }
        let queue_id = self.queue_for(batch.gid);
        let objects = batch.entries.len();
        match self.queues[queue_id].try_send(batch) {
            Ok(()) => {
                self.stats.submitted_objects(queue_id, objects);
                debug!(queue_id, objects, "commit batch submitted");
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                error!(
                    critical = true,
                    queue_id, objects, "commit queue overflow, batch dropped"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(queue_id, objects, "commit queue closed, batch dropped");
            }
        }
    }

    /// Block until the targeted shard(s) are empty. Serialized for
    /// [`FlushTarget::All`] so overlapping full flushes collapse into one.
    pub async fn flush(&self, target: FlushTarget) {
        if self.is_closed() {
            return;
        }
        match target {
            FlushTarget::All => {
                if self
                    .flushing
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    return;
                }
                for queue_id in 0..self.queue_count {
                    self.flush_queue(queue_id).await;
                }
                self.flushing.store(false, Ordering::Release);
                info!("all commit queues flushed");
            }
            FlushTarget::Gid(gid) => {
                let queue_id = self.queue_for(gid);
                self.flush_queue(queue_id).await;
                debug!(queue_id, "commit queue flushed");
            }
        }
    }

    async fn flush_queue(&self, queue_id: usize) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.flush_queues[queue_id].send(ack_tx).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Signal shutdown, wait for every worker to drain and exit, and zero
    /// the pending gauges. Idempotent; afterwards `submit` and `flush` are
    /// no-ops.
    pub async fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.shutdown.send_replace(true);

        let workers = {
            let mut guard = mutex_lock(&self.workers, SOURCE, "close");
            std::mem::take(&mut *guard)
        };
        for worker in workers {
            if let Err(err) = worker.await {
                warn!(error = %err, "commit worker ended abnormally");
            }
        }

        self.stats.reset_gauges();
        info!("commit pipeline closed");
    }
}

async fn worker_loop(
    context: WorkerContext,
    mut batches: mpsc::Receiver<CommitBatch>,
    mut flushes: mpsc::Receiver<oneshot::Sender<()>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            batch = batches.recv() => match batch {
                Some(batch) => context.replay(batch).await,
                None => break,
            },
            request = flushes.recv() => match request {
                Some(ack) => {
                    drain(&context, &mut batches).await;
                    let _ = ack.send(());
                }
                None => {
                    // Pipeline dropped without close: drain and exit.
                    drain(&context, &mut batches).await;
                    break;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    drain(&context, &mut batches).await;
                    debug!(queue_id = context.queue_id, "commit worker draining on shutdown");
                    break;
                }
            }
        }
    }
}

async fn drain(context: &WorkerContext, batches: &mut mpsc::Receiver<CommitBatch>) {
    while let Ok(batch) = batches.try_recv() {
        context.replay(batch).await;
    }
}

impl WorkerContext {
    /// Replay one batch: clears, then deletes, then creates/updates.
    async fn replay(&self, batch: CommitBatch) {
        let CommitBatch {
            gid,
            entries,
            prehandler,
            posthandler,
        } = batch;
        let total = entries.len();

        let mut clears: Vec<CommitEntry> = Vec::new();
        let mut deletes: Vec<CommitEntry> = Vec::new();
        let mut upserts: Vec<CommitEntry> = Vec::new();
        for entry in entries {
            match entry.action {
                CommitAction::Clear(_) => clears.push(entry),
                CommitAction::Delete => deletes.push(entry),
                _ => upserts.push(entry),
            }
        }
        for entry in clears.iter().chain(&deletes).chain(&upserts) {
            self.handle(entry, &prehandler, &posthandler).await;
        }

        debug!(queue_id = self.queue_id, gid, total, "commit batch replayed");
    }

    async fn handle(
        &self,
        entry: &CommitEntry,
        prehandler: &Option<CommitHook>,
        posthandler: &Option<CommitHook>,
    ) {
        if let Some(hook) = prehandler {
            hook(entry);
        }

        // Snapshot outside the remote call so no lock spans the await.
        let snapshot = cell_clone(&entry.cell);
        match self.sources.require(&entry.alias) {
            Ok(ops) => {
                let result = match &entry.action {
                    CommitAction::Create | CommitAction::Update => {
                        ops.write(snapshot.as_ref()).await
                    }
                    CommitAction::Delete => ops.delete(snapshot.as_ref()).await,
                    CommitAction::Clear(cond) => {
                        let scoped = !cond.is_empty() || cond.limit() > 0 || cond.offset() > 0;
                        ops.clear(snapshot.as_ref(), scoped.then_some(cond)).await
                    }
                };
                if let Err(err) = result {
                    error!(
                        data_key = %entry.data_key,
                        action = ?entry.action,
                        error = %err,
                        "commit entry failed, moving on"
                    );
                }
            }
            Err(err) => {
                error!(
                    critical = true,
                    data_key = %entry.data_key,
                    error = %err,
                    "commit entry has no backing source"
                );
            }
        }

        if let Some(hook) = posthandler {
            hook(entry);
        }

        // The destructive path erases soft-deleted global entries only now,
        // after the remote mutation landed, then releases the model lock.
        match &entry.action {
            CommitAction::Delete => {
                self.global
                    .remove_if_invalid(&entry.model_key, &entry.data_key);
                self.global.unlock(&entry.model_key);
            }
            CommitAction::Clear(_) => {
                self.global.sweep_invalid(&entry.model_key);
                self.global.unlock(&entry.model_key);
            }
            _ => {}
        }

        self.stats.processed_object(self.queue_id);
    }
}
