//! The immutable, in-flight unit of work (spec §2 "Row", §3 data model).
//!
//! A `Row` carries an opaque caller handle and a reference back to its
//! owning loader. Rows from loaders with different handle types can share a
//! shard (spec §3: "multiple `BulkLoader`s targeting the same table share
//! the same set of `PartitionShard`s"), so the handle is type-erased here
//! and downcast by the loader that owns it — the shard itself never
//! inspects it.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::client::CallResponse;
use crate::error::IngestError;
use crate::value::Value;

/// Opaque caller-supplied handle, boxed so shards can hold rows from
/// differently-typed loaders in the same queue and batch.
pub type RowHandle = Box<dyn Any + Send>;

/// Per-loader callback surface a shard uses to report terminal outcomes and
/// drive this loader's counters, without needing to know the loader's
/// handle type `H` (spec §4.5, §6 "Callbacks exposed to the caller").
pub trait LoaderCallbacks: Send + Sync + fmt::Debug {
    fn loader_id(&self) -> u64;

    fn table(&self) -> &str;

    /// Current trigger size this loader wants for shards it shares.
    fn trigger_size(&self) -> usize;

    /// Invoked once per row, in the batch's success path.
    fn deliver_success(&self, handle: RowHandle, response: CallResponse);

    /// Invoked once per row for any non-success terminal outcome, including
    /// `ParameterTypeError` coercion failures and row-by-row resubmission
    /// failures (spec §4.2 step 2, §4.3).
    fn deliver_failure(&self, handle: RowHandle, values: Vec<Value>, response: CallResponse);

    /// Invoked for routing failures before a row is ever enqueued
    /// (`InvalidPartitionKey`, spec §4.1). Never counted as outstanding.
    fn deliver_routing_error(&self, handle: RowHandle, values: Vec<Value>, err: IngestError);

    /// Add `n` to this loader's completed counter and subtract it from
    /// outstanding, as part of a batch's success notification (spec §4.2
    /// response callback, §3 invariants).
    fn record_batch_completion(&self, n: u64);
}

/// An immutable row enqueued by a `BulkLoader`, destined for exactly one
/// shard's queue and exactly one batch.
pub struct Row {
    pub handle: RowHandle,
    pub values: Vec<Value>,
    pub loader: Arc<dyn LoaderCallbacks>,
}

impl fmt::Debug for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Row")
            .field("values", &self.values)
            .field("loader", &self.loader)
            .finish()
    }
}

impl Row {
    pub fn new(handle: RowHandle, values: Vec<Value>, loader: Arc<dyn LoaderCallbacks>) -> Self {
        Self {
            handle,
            values,
            loader,
        }
    }
}
