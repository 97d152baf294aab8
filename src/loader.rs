//! `BulkLoader<H>`: the user-facing handle (spec §4.5). Generic over the
//! caller's opaque handle type `H`; internally the handle is boxed into a
//! `RowHandle` so a shard can hold rows from differently-typed loaders in
//! the same queue (spec §3 "multiple `BulkLoader`s... share the same set of
//! `PartitionShard`s").

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::client::CallResponse;
use crate::error::{IngestError, IngestResult};
use crate::manager::{IngestManager, TableSpec, TableTopology};
use crate::metrics::IngestMetrics;
use crate::row::{LoaderCallbacks, Row, RowHandle};
use crate::value::{ColumnDescriptor, ColumnType, Value};

static NEXT_LOADER_ID: AtomicU64 = AtomicU64::new(1);

pub type SuccessCallback<H> = Arc<dyn Fn(H, CallResponse) + Send + Sync>;
pub type FailureCallback<H> = Arc<dyn Fn(H, Vec<Value>, CallResponse) + Send + Sync>;

/// Shared state behind a `BulkLoader<H>`; this is what actually implements
/// `LoaderCallbacks`; the `BulkLoader` handle just wraps an `Arc` of it plus
/// its collaborators.
struct LoaderCore<H: Send + 'static> {
    id: u64,
    table: String,
    partition_column_index: Option<usize>,
    partition_column_type: Option<ColumnType>,
    trigger_size: AtomicUsize,
    closed: AtomicBool,
    outstanding: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    drained: Notify,
    metrics: Arc<IngestMetrics>,
    success_callback: Option<SuccessCallback<H>>,
    failure_callback: FailureCallback<H>,
}

impl<H: Send + 'static> fmt::Debug for LoaderCore<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderCore")
            .field("id", &self.id)
            .field("table", &self.table)
            .field("outstanding", &self.outstanding.load(Ordering::Relaxed))
            .field("completed", &self.completed.load(Ordering::Relaxed))
            .field("failed", &self.failed.load(Ordering::Relaxed))
            .finish()
    }
}

impl<H: Send + 'static> LoaderCore<H> {
    fn downcast(handle: RowHandle) -> H {
        *handle
            .downcast::<H>()
            .unwrap_or_else(|_| panic!("row handle type mismatch for loader"))
    }

    /// Wake any `drain()` waiter if outstanding has reached zero. Always
    /// called after outstanding is mutated, so a waiter parked on `Notify`
    /// never misses the transition to zero (it re-checks after being
    /// registered, per the usual `Notify` pattern).
    fn wake_if_drained(&self) {
        if self.outstanding.load(Ordering::SeqCst) == 0 {
            self.drained.notify_waiters();
        }
    }
}

impl<H: Send + 'static> LoaderCallbacks for LoaderCore<H> {
    fn loader_id(&self) -> u64 {
        self.id
    }

    fn table(&self) -> &str {
        &self.table
    }

    fn trigger_size(&self) -> usize {
        self.trigger_size.load(Ordering::SeqCst)
    }

    fn deliver_success(&self, handle: RowHandle, response: CallResponse) {
        let handle = Self::downcast(handle);
        if let Some(cb) = &self.success_callback {
            cb(handle, response);
        }
        self.wake_if_drained();
    }

    fn deliver_failure(&self, handle: RowHandle, values: Vec<Value>, response: CallResponse) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.failed.fetch_add(1, Ordering::SeqCst);
        let handle = Self::downcast(handle);
        (self.failure_callback)(handle, values, response);
        self.wake_if_drained();
    }

    fn deliver_routing_error(&self, handle: RowHandle, values: Vec<Value>, err: IngestError) {
        // Never counted as outstanding (spec §7 `InvalidPartitionKey`), so
        // only `failed` moves.
        self.failed.fetch_add(1, Ordering::SeqCst);
        self.metrics.inc_invalid_partition_key();
        let handle = Self::downcast(handle);
        (self.failure_callback)(handle, values, CallResponse::user_error(err.to_string()));
    }

    fn record_batch_completion(&self, n: u64) {
        self.completed.fetch_add(n, Ordering::SeqCst);
        self.outstanding.fetch_sub(n, Ordering::SeqCst);
        self.wake_if_drained();
    }
}

/// User-facing ingest handle for one table. Cheap to clone — cloning shares
/// the same counters, callbacks, and shard set.
pub struct BulkLoader<H: Send + 'static> {
    core: Arc<LoaderCore<H>>,
    manager: Arc<IngestManager>,
    topology: Arc<TableTopology>,
    partition_count: usize,
}

impl<H: Send + 'static> Clone for BulkLoader<H> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            manager: self.manager.clone(),
            topology: self.topology.clone(),
            partition_count: self.partition_count,
        }
    }
}

impl<H: Send + 'static> BulkLoader<H> {
    /// Route and enqueue one row (spec §4.5 `insert`). Blocks if the target
    /// shard's bounded queue is full. Rejected once `close()` has begun
    /// (spec §9 open question: reject inserts after close begins).
    pub async fn insert(&self, handle: H, values: Vec<Value>) -> IngestResult<()> {
        if self.core.closed.load(Ordering::SeqCst) {
            return Err(IngestError::LoaderClosed);
        }

        let shard = if self.topology.mp {
            self.topology.shards[0].clone()
        } else {
            let idx = self.core.partition_column_index.ok_or_else(|| {
                IngestError::InvalidConfig("partitioned table requires a partition column".into())
            })?;
            let ty = self.core.partition_column_type.ok_or_else(|| {
                IngestError::InvalidConfig("partitioned table requires a partition column type".into())
            })?;

            let Some(raw) = values.get(idx) else {
                let err = IngestError::InvalidPartitionKey {
                    table: self.core.table.clone(),
                    reason: format!("row has no value at partition column index {idx}"),
                };
                self.core
                    .deliver_routing_error(Box::new(handle), values, err.clone());
                return Err(err);
            };

            match self
                .manager
                .router()
                .partition_id(&self.core.table, raw, ty, self.partition_count)
            {
                Ok(partition) => self.topology.shards[partition].clone(),
                Err(err) => {
                    self.core
                        .deliver_routing_error(Box::new(handle), values, err.clone());
                    return Err(err);
                }
            }
        };

        self.core.outstanding.fetch_add(1, Ordering::SeqCst);
        self.core.metrics.inc_rows_enqueued(1);
        let handle: RowHandle = Box::new(handle);
        let row = Row::new(handle, values, self.core.clone());
        shard.enqueue(row).await
    }

    /// Schedule a drain on every shard this table's topology spans (spec
    /// §4.5 `flush`). Completes once each shard has staged and issued its
    /// batch submits, not once their responses land.
    pub async fn flush(&self) -> IngestResult<()> {
        for shard in &self.topology.shards {
            shard.flush().await?;
        }
        Ok(())
    }

    /// Flush, then wait until this loader's outstanding count reaches zero
    /// (spec §4.5 `drain`).
    pub async fn drain(&self) -> IngestResult<()> {
        self.flush().await?;
        loop {
            if self.core.outstanding.load(Ordering::SeqCst) == 0 {
                return Ok(());
            }
            let notified = self.core.drained.notified();
            if self.core.outstanding.load(Ordering::SeqCst) == 0 {
                return Ok(());
            }
            notified.await;
        }
    }

    /// Drain, then deregister from shared shards, shutting down any shard
    /// whose owner set becomes empty (spec §4.5 `close`). Idempotent.
    pub async fn close(&self) -> IngestResult<()> {
        self.core.closed.store(true, Ordering::SeqCst);
        self.drain().await?;
        self.manager.release_shards(&self.core.table, self.core.id).await;
        Ok(())
    }

    pub fn outstanding(&self) -> u64 {
        self.core.outstanding.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> u64 {
        self.core.completed.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> u64 {
        self.core.failed.load(Ordering::SeqCst)
    }

    pub fn table(&self) -> &str {
        &self.core.table
    }
}

/// Builder for `BulkLoader<H>` (spec §3 `BulkLoader` attributes). A failure
/// callback is mandatory; a success callback is optional (spec §6).
pub struct BulkLoaderBuilder<H: Send + 'static> {
    table: String,
    columns: Vec<ColumnDescriptor>,
    partition_column_index: Option<usize>,
    partition_column_type: Option<ColumnType>,
    partition_count: Option<usize>,
    procedure: Option<String>,
    upsert: bool,
    trigger_size: usize,
    auto_reconnect: bool,
    success_callback: Option<SuccessCallback<H>>,
    failure_callback: Option<FailureCallback<H>>,
}

impl<H: Send + 'static> BulkLoaderBuilder<H> {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
            partition_column_index: None,
            partition_column_type: None,
            partition_count: None,
            procedure: None,
            upsert: false,
            trigger_size: 200,
            auto_reconnect: true,
            success_callback: None,
            failure_callback: None,
        }
    }

    pub fn column(mut self, name: &'static str, ty: ColumnType) -> Self {
        self.columns.push(ColumnDescriptor::new(name, ty));
        self
    }

    /// Marks this table as partitioned, routed by the value at `index`
    /// (spec §3 "partition-column index and type"). Omit for an MP table.
    pub fn partition_column(mut self, index: usize, ty: ColumnType) -> Self {
        self.partition_column_index = Some(index);
        self.partition_column_type = Some(ty);
        self
    }

    pub fn partition_count(mut self, n: usize) -> Self {
        self.partition_count = Some(n);
        self
    }

    pub fn procedure(mut self, name: impl Into<String>) -> Self {
        self.procedure = Some(name.into());
        self
    }

    pub fn upsert(mut self, upsert: bool) -> Self {
        self.upsert = upsert;
        self
    }

    pub fn trigger_size(mut self, n: usize) -> Self {
        self.trigger_size = n.max(1);
        self
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn on_success(mut self, cb: impl Fn(H, CallResponse) + Send + Sync + 'static) -> Self {
        self.success_callback = Some(Arc::new(cb));
        self
    }

    pub fn on_failure(mut self, cb: impl Fn(H, Vec<Value>, CallResponse) + Send + Sync + 'static) -> Self {
        self.failure_callback = Some(Arc::new(cb));
        self
    }

    pub fn build(self, manager: Arc<IngestManager>) -> IngestResult<BulkLoader<H>> {
        let failure_callback = self
            .failure_callback
            .ok_or_else(|| IngestError::InvalidConfig("BulkLoader requires a failure callback".into()))?;

        if self.columns.is_empty() {
            return Err(IngestError::InvalidConfig(
                "BulkLoader requires at least one column descriptor".into(),
            ));
        }

        let mp = self.partition_column_index.is_none();
        let procedure = self
            .procedure
            .unwrap_or_else(|| format!("{}.insert", self.table));
        let id = NEXT_LOADER_ID.fetch_add(1, Ordering::SeqCst);
        let columns: Arc<[ColumnDescriptor]> = self.columns.into();

        let core = Arc::new(LoaderCore {
            id,
            table: self.table.clone(),
            partition_column_index: self.partition_column_index,
            partition_column_type: self.partition_column_type,
            trigger_size: AtomicUsize::new(self.trigger_size),
            closed: AtomicBool::new(false),
            outstanding: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            drained: Notify::new(),
            metrics: manager.metrics(),
            success_callback: self.success_callback,
            failure_callback,
        });

        let spec = TableSpec {
            table: self.table,
            mp,
            procedure,
            upsert: self.upsert,
            columns,
            partition_column_index: self.partition_column_index,
            partition_count: self.partition_count,
            auto_reconnect: self.auto_reconnect,
        };

        let topology = manager.acquire_shards(id, &spec, self.trigger_size);
        let partition_count = topology.shards.len();

        Ok(BulkLoader { core, manager, topology, partition_count })
    }
}
