//! PartitionShard: one per `(table, partition)` (spec §4.2). Owns a bounded
//! row queue, a single-threaded worker, a reusable batch buffer, and the
//! batch-submit/resubmit logic. This is the heart of the engine.
//!
//! The worker is modeled as the actor design note (spec §9) describes: a
//! dedicated task draining a bounded channel. Two channels feed it —
//! `row_rx` carries enqueued rows (its bounded capacity *is* the
//! backpressure mechanism from spec §4.2 `enqueue`), `ctrl_rx` carries the
//! handful of out-of-band commands (`Flush`, `Shutdown`) spec §9 calls for.
//! Row-triggered drains and `Shutdown` run the full submit-and-distribute
//! sequence inline on the worker task, so "at most one batch-submit and one
//! drain in flight per shard" (spec §5) holds for them. `Flush` is the one
//! exception: spec §4.5 requires it to return once a batch's submit is
//! issued, not once its response lands, so its drain stages batches on the
//! worker task but hands each one's submit-and-distribute sequence to a
//! detached task instead of awaiting it — a `flush()` can leave more than
//! one submit in flight at once.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashSet;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tracing::{debug, info, warn};

use crate::client::{BatchRow, CallResponse, ProcedureClient, Status};
use crate::error::{IngestError, IngestResult};
use crate::metrics::IngestMetrics;
use crate::row::Row;
use crate::value::{coerce, value_to_routing_bytes, ColumnDescriptor};

/// Identifies a shard within the registry: either the single shared shard
/// for a multi-partition table, or one of a partitioned table's N shards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ShardId {
    Mp { table: String },
    Partition { table: String, partition: usize },
}

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShardId::Mp { table } => write!(f, "{table}:mp"),
            ShardId::Partition { table, partition } => write!(f, "{table}:{partition}"),
        }
    }
}

enum ShardControl {
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Everything the worker task needs; split out from `PartitionShard` so it
/// can be moved wholesale into the spawned task. The mutable bits
/// (`trigger_size`, `auto_reconnect`, `reconnect_notify`) are shared with the
/// handle separately rather than living here, since the handle mutates them
/// directly instead of going through the control channel.
struct ShardInner {
    id: ShardId,
    mp: bool,
    table: String,
    procedure: String,
    upsert: bool,
    columns: Arc<[ColumnDescriptor]>,
    partition_column_index: Option<usize>,
    client: Arc<dyn ProcedureClient>,
    metrics: Arc<IngestMetrics>,
}

pub struct PartitionShard {
    id: ShardId,
    owners: DashSet<u64>,
    row_tx: mpsc::Sender<Row>,
    control_tx: mpsc::Sender<ShardControl>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
    trigger_size: Arc<AtomicUsize>,
    auto_reconnect: Arc<AtomicBool>,
    reconnect_notify: Arc<Notify>,
}

/// Static table schema a shard needs at creation time: column layout,
/// procedure name, and whether it's MP or partitioned.
pub struct ShardSpec {
    pub table: String,
    pub procedure: String,
    pub upsert: bool,
    pub columns: Arc<[ColumnDescriptor]>,
    pub partition_column_index: Option<usize>,
    pub auto_reconnect: bool,
}

impl PartitionShard {
    pub fn spawn(
        id: ShardId,
        spec: &ShardSpec,
        initial_trigger_size: usize,
        queue_capacity_multiplier: usize,
        client: Arc<dyn ProcedureClient>,
        metrics: Arc<IngestMetrics>,
    ) -> Arc<Self> {
        let capacity = (initial_trigger_size * queue_capacity_multiplier).max(1);
        let (row_tx, row_rx) = mpsc::channel(capacity);
        let (control_tx, control_rx) = mpsc::channel(8);

        let trigger_size = Arc::new(AtomicUsize::new(initial_trigger_size.max(1)));
        let auto_reconnect = Arc::new(AtomicBool::new(spec.auto_reconnect));
        let reconnect_notify = Arc::new(Notify::new());

        let inner = Arc::new(ShardInner {
            id: id.clone(),
            mp: matches!(id, ShardId::Mp { .. }),
            table: spec.table.clone(),
            procedure: spec.procedure.clone(),
            upsert: spec.upsert,
            columns: spec.columns.clone(),
            partition_column_index: spec.partition_column_index,
            client,
            metrics,
        });

        let shared_trigger = trigger_size.clone();
        let shared_reconnect = auto_reconnect.clone();
        let shared_notify = reconnect_notify.clone();

        let handle = tokio::spawn(run_worker(
            inner,
            row_rx,
            control_rx,
            shared_trigger,
            shared_reconnect,
            shared_notify,
        ));

        Arc::new(Self {
            id,
            owners: DashSet::new(),
            row_tx,
            control_tx,
            worker: Mutex::new(Some(handle)),
            trigger_size,
            auto_reconnect,
            reconnect_notify,
        })
    }

    pub fn id(&self) -> &ShardId {
        &self.id
    }

    /// Blocks the caller when the bounded queue is full — the natural
    /// backpressure spec §4.2 describes (`enqueue`).
    pub async fn enqueue(&self, row: Row) -> IngestResult<()> {
        self.row_tx
            .send(row)
            .await
            .map_err(|_| IngestError::ShardShutdown)
    }

    /// Schedules a drain regardless of queue length; the returned future
    /// resolves once the pending rows have been split into batches and each
    /// batch's submit has been issued — not once any batch's response has
    /// landed (spec §4.2 step 5 "register a response callback that fires
    /// asynchronously"; spec §4.5 `flush` "does not wait for their
    /// responses").
    pub async fn flush(&self) -> IngestResult<()> {
        let (tx, rx) = oneshot::channel();
        self.control_tx
            .send(ShardControl::Flush(tx))
            .await
            .map_err(|_| IngestError::ShardShutdown)?;
        rx.await.map_err(|_| IngestError::ShardShutdown)
    }

    /// `min(current, n)`, monotonically non-increasing per spec §4.2.
    pub fn update_trigger_size(&self, n: usize) {
        let n = n.max(1);
        let _ = self
            .trigger_size
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| Some(cur.min(n)));
    }

    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.auto_reconnect.store(enabled, Ordering::SeqCst);
    }

    /// Wake the worker if it is parked on connection loss (spec §4.6
    /// `notifyReconnected`).
    pub fn notify_reconnected(&self) {
        self.reconnect_notify.notify_waiters();
    }

    pub fn add_owner(&self, loader_id: u64) {
        self.owners.insert(loader_id);
    }

    /// Returns true if the shard now has no owning loaders left.
    pub fn remove_owner(&self, loader_id: u64) -> bool {
        self.owners.remove(&loader_id);
        self.owners.is_empty()
    }

    pub fn owner_count(&self) -> usize {
        self.owners.len()
    }

    /// Flush, wait, then terminate the worker. Idempotent (spec §4.2
    /// `shutdown`).
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.control_tx.send(ShardControl::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }

        let mut guard = self.worker.lock().await;
        if let Some(handle) = guard.take() {
            let _ = handle.await;
        }
    }
}

/// Pairs a row with its already-coerced column values, so a later
/// row-by-row resubmission (spec §4.3) never has to re-coerce.
struct Staged {
    row: Row,
    coerced: BatchRow,
}

async fn run_worker(
    shared: Arc<ShardInner>,
    mut row_rx: mpsc::Receiver<Row>,
    mut control_rx: mpsc::Receiver<ShardControl>,
    trigger_size: Arc<AtomicUsize>,
    auto_reconnect: Arc<AtomicBool>,
    reconnect_notify: Arc<Notify>,
) {
    let mut pending: VecDeque<Row> = VecDeque::new();

    loop {
        tokio::select! {
            biased;

            ctrl = control_rx.recv() => {
                match ctrl {
                    Some(ShardControl::Flush(reply)) => {
                        drain_fully_detached(&shared, &mut pending, &trigger_size, &auto_reconnect, &reconnect_notify);
                        shared.metrics.set_shard_queue_depth(pending.len() as i64);
                        let _ = reply.send(());
                    }
                    Some(ShardControl::Shutdown(reply)) => {
                        drain_fully(&shared, &mut pending, &trigger_size, &auto_reconnect, &reconnect_notify).await;
                        let _ = reply.send(());
                        break;
                    }
                    None => break,
                }
            }

            maybe_row = row_rx.recv() => {
                match maybe_row {
                    Some(row) => {
                        pending.push_back(row);
                        shared.metrics.set_shard_queue_depth(pending.len() as i64);
                        let trigger = trigger_size.load(Ordering::SeqCst);
                        while pending.len() >= trigger {
                            drain_once(&shared, &mut pending, trigger, &auto_reconnect, &reconnect_notify).await;
                            shared.metrics.set_shard_queue_depth(pending.len() as i64);
                        }
                    }
                    None => break,
                }
            }
        }
    }

    debug!(shard = %shared.id, remaining = pending.len(), "shard worker exiting");
}

/// Flush semantics: drain everything currently pending, in trigger-sized
/// chunks so a very large backlog still submits as several batches rather
/// than one unbounded one. Used by `Shutdown`, which needs every batch's
/// response resolved (and every row's callback delivered) before the worker
/// exits.
async fn drain_fully(
    shared: &Arc<ShardInner>,
    pending: &mut VecDeque<Row>,
    trigger_size: &AtomicUsize,
    auto_reconnect: &Arc<AtomicBool>,
    reconnect_notify: &Arc<Notify>,
) {
    if pending.is_empty() {
        return;
    }
    let chunk = trigger_size.load(Ordering::SeqCst).max(1);
    while !pending.is_empty() {
        let take = chunk.min(pending.len());
        drain_once(shared, pending, take, auto_reconnect, reconnect_notify).await;
    }
}

/// `Flush` counterpart to `drain_fully`: stages every pending row into
/// trigger-sized batches synchronously (so the caller can reply the moment
/// this returns), but hands each batch's submit-and-distribute sequence to a
/// detached task instead of awaiting it — spec §4.2 step 5 fires the
/// response callback asynchronously, and spec §4.5 `flush` explicitly
/// doesn't wait for it.
fn drain_fully_detached(
    shared: &Arc<ShardInner>,
    pending: &mut VecDeque<Row>,
    trigger_size: &AtomicUsize,
    auto_reconnect: &Arc<AtomicBool>,
    reconnect_notify: &Arc<Notify>,
) {
    if pending.is_empty() {
        return;
    }
    let chunk = trigger_size.load(Ordering::SeqCst).max(1);
    while !pending.is_empty() {
        let take = chunk.min(pending.len());
        if let Some(batch) = stage_chunk(shared, pending, take) {
            let shared = shared.clone();
            let auto_reconnect = auto_reconnect.clone();
            let reconnect_notify = reconnect_notify.clone();
            tokio::spawn(async move {
                submit_and_distribute(&shared, batch, &auto_reconnect, &reconnect_notify).await;
            });
        }
    }
}

struct StagedBatch {
    staged: Vec<Staged>,
    batch_rows: Vec<BatchRow>,
    routing: Option<Vec<u8>>,
}

/// Pulls up to `take` rows off `pending` and coerces them (spec §4.2 steps
/// 1–2), delivering coercion failures immediately and leaving only the rows
/// that survived in the returned batch. Pure bookkeeping — no `.await` — so
/// both the synchronous and detached drain paths can call it identically.
fn stage_chunk(shared: &Arc<ShardInner>, pending: &mut VecDeque<Row>, take: usize) -> Option<StagedBatch> {
    let mut staged: Vec<Staged> = Vec::with_capacity(take);
    let mut first_partition_value = None;

    for _ in 0..take {
        let Some(row) = pending.pop_front() else {
            break;
        };

        let mut coerced = Vec::with_capacity(row.values.len());
        let mut err = None;
        for (col, raw) in shared.columns.iter().zip(row.values.iter()) {
            match coerce(raw, col.ty) {
                Ok(v) => coerced.push(v),
                Err(reason) => {
                    err = Some(IngestError::ParameterTypeError {
                        column: col.name.to_string(),
                        reason,
                    });
                    break;
                }
            }
        }

        match err {
            Some(e) => {
                shared.metrics.inc_coercion_error();
                shared.metrics.inc_rows_failed(1);
                let values = row.values.clone();
                let response = CallResponse::user_error(e.to_string());
                warn!(shard = %shared.id, error = %e, "row rejected during coercion, removed from batch");
                row.loader.deliver_failure(row.handle, values, response);
            }
            None => {
                if first_partition_value.is_none() {
                    if let Some(idx) = shared.partition_column_index {
                        first_partition_value = coerced.get(idx).cloned();
                    }
                }
                staged.push(Staged { row, coerced });
            }
        }
    }

    if staged.is_empty() {
        return None;
    }

    let batch_rows: Vec<BatchRow> = staged.iter().map(|s| s.coerced.clone()).collect();
    let routing = (!shared.mp)
        .then(|| first_partition_value.as_ref().map(value_to_routing_bytes))
        .flatten();

    Some(StagedBatch { staged, batch_rows, routing })
}

/// One drain cycle (spec §4.2 steps 1–6): pull up to `take` rows, coerce,
/// submit as a batch, and resolve the response before returning.
async fn drain_once(
    shared: &Arc<ShardInner>,
    pending: &mut VecDeque<Row>,
    take: usize,
    auto_reconnect: &Arc<AtomicBool>,
    reconnect_notify: &Arc<Notify>,
) {
    let Some(batch) = stage_chunk(shared, pending, take) else {
        return;
    };
    submit_and_distribute(shared, batch, auto_reconnect, reconnect_notify).await;
}

/// Submits a staged batch and delivers every row's terminal callback (spec
/// §4.2 steps 3–6, minus the pull/coerce already done by `stage_chunk`).
async fn submit_and_distribute(
    shared: &Arc<ShardInner>,
    batch: StagedBatch,
    auto_reconnect: &Arc<AtomicBool>,
    reconnect_notify: &Arc<Notify>,
) {
    let StagedBatch { staged, batch_rows, routing } = batch;

    debug!(shard = %shared.id, batch_len = batch_rows.len(), "submitting batch");
    let response = submit_batch(
        shared,
        &batch_rows,
        routing.as_deref(),
        auto_reconnect,
        reconnect_notify,
    )
    .await;

    if response.is_success() {
        shared.metrics.observe_batch_submitted(staged.len());
        shared.metrics.inc_rows_completed(staged.len() as u64);

        let mut per_loader: std::collections::HashMap<u64, (Arc<dyn crate::row::LoaderCallbacks>, u64)> =
            std::collections::HashMap::new();
        for s in &staged {
            let entry = per_loader
                .entry(s.row.loader.loader_id())
                .or_insert_with(|| (s.row.loader.clone(), 0));
            entry.1 += 1;
        }
        for (loader, count) in per_loader.values() {
            loader.record_batch_completion(*count);
        }

        for Staged { row, .. } in staged {
            row.loader.deliver_success(row.handle, response.clone());
        }
    } else {
        shared.metrics.inc_batch_rejected();
        info!(
            shard = %shared.id,
            batch_len = staged.len(),
            status = ?response.status,
            "batch rejected, resubmitting rows individually",
        );
        resubmit_individually(shared, staged, auto_reconnect, reconnect_notify).await;
    }
}

/// Row-by-row resubmission after a batch failure (spec §4.3). A single bad
/// row never causes the rest of the batch to be reported as failed.
async fn resubmit_individually(
    shared: &Arc<ShardInner>,
    staged: Vec<Staged>,
    auto_reconnect: &Arc<AtomicBool>,
    reconnect_notify: &Arc<Notify>,
) {
    for Staged { row, coerced } in staged {
        resubmit_one(shared, row, coerced, auto_reconnect, reconnect_notify).await;
    }
}

async fn resubmit_one(
    shared: &Arc<ShardInner>,
    row: Row,
    coerced: BatchRow,
    auto_reconnect: &Arc<AtomicBool>,
    reconnect_notify: &Arc<Notify>,
) {
    let single = [coerced];
    loop {
        let routing = (!shared.mp)
            .then(|| {
                shared
                    .partition_column_index
                    .and_then(|idx| single[0].get(idx))
                    .map(value_to_routing_bytes)
            })
            .flatten();

        let response = submit_batch(shared, &single, routing.as_deref(), auto_reconnect, reconnect_notify)
            .await;

        if response.is_success() {
            shared.metrics.inc_rows_completed(1);
            row.loader.record_batch_completion(1);
            row.loader.deliver_success(row.handle, response);
            return;
        }

        if response.status == Status::ConnectionLost && auto_reconnect.load(Ordering::SeqCst) {
            debug!(shard = %shared.id, "row parked for isolated retry after ConnectionLost");
            shared.metrics.inc_reconnect_park();
            reconnect_notify.notified().await;
            continue;
        }

        shared.metrics.inc_rows_failed(1);
        let Row { handle, values, loader } = row;
        loader.deliver_failure(handle, values, response);
        return;
    }
}

/// Submit `rows` as one stored-procedure call (spec §6 invocation shapes),
/// parking on connection loss when auto-reconnect is enabled (spec §4.4)
/// and otherwise synthesizing a `ConnectionLost` response so the caller's
/// batch-failure path (§4.3) takes over.
async fn submit_batch(
    shared: &Arc<ShardInner>,
    rows: &[BatchRow],
    routing: Option<&[u8]>,
    auto_reconnect: &Arc<AtomicBool>,
    reconnect_notify: &Arc<Notify>,
) -> CallResponse {
    loop {
        let result = match routing {
            Some(rp) => {
                shared
                    .client
                    .call_procedure_sp(&shared.procedure, rp, &shared.table, shared.upsert, rows)
                    .await
            }
            None => {
                shared
                    .client
                    .call_procedure_mp(&shared.procedure, &shared.table, shared.upsert, rows)
                    .await
            }
        };

        match result {
            Ok(response) => return response,
            Err(unreachable) => {
                if auto_reconnect.load(Ordering::SeqCst) {
                    warn!(shard = %shared.id, error = %unreachable, "submit unreachable, parking for reconnect");
                    shared.metrics.inc_reconnect_park();
                    let notified = reconnect_notify.notified();
                    notified.await;
                    continue;
                }
                warn!(shard = %shared.id, error = %unreachable, "submit unreachable, auto-reconnect disabled");
                return CallResponse::connection_lost();
            }
        }
    }
}
