//! `IngestManager`: the process-wide registry mapping table name to its
//! shard set (spec §4.6, §5 "Global state"). Implemented with `DashMap`
//! rather than a single `Mutex<HashMap<...>>` — the spec explicitly allows a
//! lock-free map ("implementations may use a lock-free map but are not
//! required to"), and per-table sharded locking is the natural fit here
//! since acquisition for one table never needs to block acquisition for
//! another.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::client::ProcedureClient;
use crate::metrics::IngestMetrics;
use crate::router::PartitionRouter;
use crate::shard::{PartitionShard, ShardId, ShardSpec};
use crate::value::ColumnDescriptor;

/// Static schema a `BulkLoader` supplies the first time it touches a table;
/// only consulted when the table's topology doesn't exist yet.
pub struct TableSpec {
    pub table: String,
    pub mp: bool,
    pub procedure: String,
    pub upsert: bool,
    pub columns: Arc<[ColumnDescriptor]>,
    pub partition_column_index: Option<usize>,
    pub partition_count: Option<usize>,
    pub auto_reconnect: bool,
}

/// A table's shard set: one shard if MP, `partition_count` shards otherwise,
/// indexed by partition id.
pub struct TableTopology {
    pub mp: bool,
    pub shards: Vec<Arc<PartitionShard>>,
}

pub struct IngestManager {
    client: Arc<dyn ProcedureClient>,
    metrics: Arc<IngestMetrics>,
    router: Arc<PartitionRouter>,
    default_partition_count: usize,
    queue_capacity_multiplier: usize,
    tables: DashMap<String, Arc<TableTopology>>,
}

impl IngestManager {
    pub fn new(
        client: Arc<dyn ProcedureClient>,
        metrics: Arc<IngestMetrics>,
        router: Arc<PartitionRouter>,
        default_partition_count: usize,
        queue_capacity_multiplier: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            metrics,
            router,
            default_partition_count: default_partition_count.max(1),
            queue_capacity_multiplier: queue_capacity_multiplier.max(1),
            tables: DashMap::new(),
        })
    }

    pub fn metrics(&self) -> Arc<IngestMetrics> {
        self.metrics.clone()
    }

    pub fn router(&self) -> Arc<PartitionRouter> {
        self.router.clone()
    }

    /// Find-or-create the table's topology, register `loader_id` as an
    /// owner of every shard in it, and push the shard trigger size down to
    /// `min(current, trigger_size)` (spec §4.6 `acquireShards`).
    ///
    /// Only consulted for topology creation; an already-registered table
    /// keeps its existing shard count even if `spec.partition_count`
    /// differs on a later caller — shard count is fixed at first use.
    pub fn acquire_shards(&self, loader_id: u64, spec: &TableSpec, trigger_size: usize) -> Arc<TableTopology> {
        let topology = {
            let entry = self.tables.entry(spec.table.clone()).or_insert_with(|| {
                info!(table = %spec.table, mp = spec.mp, "creating shard topology");
                Arc::new(self.build_topology(spec, trigger_size))
            });
            (*entry).clone()
        };

        for shard in &topology.shards {
            shard.add_owner(loader_id);
            shard.update_trigger_size(trigger_size);
            shard.set_auto_reconnect(spec.auto_reconnect);
        }

        topology
    }

    /// Inverse of `acquire_shards` (spec §4.6 `releaseShards`): drop
    /// `loader_id` from every shard's owner set; shut down and evict any
    /// shard (and, once all are gone, the table entry itself) that becomes
    /// unowned.
    pub async fn release_shards(&self, table: &str, loader_id: u64) {
        // Release the DashMap guard before awaiting shard shutdown below —
        // holding it would block any other loader touching this table.
        let Some(topology) = self.tables.get(table).map(|e| (*e).clone()) else {
            return;
        };

        for shard in &topology.shards {
            if shard.remove_owner(loader_id) {
                info!(table = %table, shard = %shard.id(), "last owner left, shutting down shard");
                shard.shutdown().await;
            }
        }

        if topology.shards.iter().all(|s| s.owner_count() == 0) {
            self.tables.remove(table);
        }
    }

    /// Wake every shard parked on connection loss (spec §4.6
    /// `notifyReconnected`).
    pub fn notify_reconnected(&self) {
        for entry in self.tables.iter() {
            for shard in &entry.shards {
                shard.notify_reconnected();
            }
        }
    }

    fn build_topology(&self, spec: &TableSpec, initial_trigger_size: usize) -> TableTopology {
        let shard_spec = ShardSpec {
            table: spec.table.clone(),
            procedure: spec.procedure.clone(),
            upsert: spec.upsert,
            columns: spec.columns.clone(),
            partition_column_index: spec.partition_column_index,
            auto_reconnect: spec.auto_reconnect,
        };

        if spec.mp {
            let shard = PartitionShard::spawn(
                ShardId::Mp { table: spec.table.clone() },
                &shard_spec,
                initial_trigger_size,
                self.queue_capacity_multiplier,
                self.client.clone(),
                self.metrics.clone(),
            );
            TableTopology { mp: true, shards: vec![shard] }
        } else {
            let partition_count = spec.partition_count.unwrap_or(self.default_partition_count).max(1);
            let shards = (0..partition_count)
                .map(|partition| {
                    PartitionShard::spawn(
                        ShardId::Partition { table: spec.table.clone(), partition },
                        &shard_spec,
                        initial_trigger_size,
                        self.queue_capacity_multiplier,
                        self.client.clone(),
                        self.metrics.clone(),
                    )
                })
                .collect();
            TableTopology { mp: false, shards }
        }
    }
}
