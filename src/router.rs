//! Maps a row's partition-key value to a partition id (spec §4.1).
//!
//! Resolving a partition id to an actual `PartitionShard` is the
//! `IngestManager`'s job; this module only owns the hash-the-key half of
//! routing, kept pluggable behind `PartitionKeyFn` since the real
//! logical-to-physical partition mapping is an external collaborator
//! (spec §1).

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::error::IngestError;
use crate::value::{coerce, ColumnType, Value};

/// The cluster's partitioning function: hashes a coerced partition-key
/// value to one of `partition_count` partitions.
pub trait PartitionKeyFn: Send + Sync {
    fn partition_for(&self, value: &Value, partition_count: usize) -> usize;
}

/// Default partitioner: hash the value's canonical bytes and reduce mod
/// the partition count. Good enough as a stand-in for the real cluster
/// hash function, which lives outside this crate's scope.
#[derive(Debug, Default)]
pub struct HashPartitioner;

impl PartitionKeyFn for HashPartitioner {
    fn partition_for(&self, value: &Value, partition_count: usize) -> usize {
        debug_assert!(partition_count > 0);
        let mut hasher = DefaultHasher::new();
        crate::value::value_to_routing_bytes(value).hash(&mut hasher);
        (hasher.finish() as usize) % partition_count.max(1)
    }
}

pub struct PartitionRouter {
    partitioner: Arc<dyn PartitionKeyFn>,
}

impl PartitionRouter {
    pub fn new(partitioner: Arc<dyn PartitionKeyFn>) -> Self {
        Self { partitioner }
    }

    /// Resolve the partition id for a single-partition table. `raw` is the
    /// row's untouched value at the partition-column index; it is coerced
    /// to `partition_column_type` before hashing, per spec §4.1. A
    /// coercion failure yields `InvalidPartitionKey` — the row must never
    /// be enqueued in that case.
    pub fn partition_id(
        &self,
        table: &str,
        raw: &Value,
        partition_column_type: ColumnType,
        partition_count: usize,
    ) -> Result<usize, IngestError> {
        let coerced = coerce(raw, partition_column_type).map_err(|reason| {
            IngestError::InvalidPartitionKey {
                table: table.to_string(),
                reason,
            }
        })?;
        Ok(self.partitioner.partition_for(&coerced, partition_count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_key_routes_to_same_partition() {
        let router = PartitionRouter::new(Arc::new(HashPartitioner));
        let a = router
            .partition_id("t", &Value::Int(42), ColumnType::Int, 8)
            .unwrap();
        let b = router
            .partition_id("t", &Value::Int(42), ColumnType::Int, 8)
            .unwrap();
        assert_eq!(a, b);
        assert!(a < 8);
    }

    #[test]
    fn uncoercible_key_is_invalid_partition_key() {
        let router = PartitionRouter::new(Arc::new(HashPartitioner));
        let err = router
            .partition_id("t", &Value::Text("nope".into()), ColumnType::Int, 8)
            .unwrap_err();
        assert!(matches!(err, IngestError::InvalidPartitionKey { .. }));
    }
}
