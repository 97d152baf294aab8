//! Prometheus metrics for the ingest engine, following the same
//! feature-gated, always-safe-to-call pattern the teacher uses for its own
//! per-subsystem metric structs.

use crate::error::IngestResult;

#[cfg(feature = "metrics")]
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};

#[derive(Clone, Debug)]
pub struct IngestMetrics {
    #[cfg(feature = "metrics")]
    registry: Registry,

    // --- Throughput
    #[cfg(feature = "metrics")]
    pub rows_enqueued_total: IntCounter,
    #[cfg(feature = "metrics")]
    pub rows_completed_total: IntCounter,
    #[cfg(feature = "metrics")]
    pub rows_failed_total: IntCounter,

    // --- Batches
    #[cfg(feature = "metrics")]
    pub batches_submitted_total: IntCounter,
    #[cfg(feature = "metrics")]
    pub batches_rejected_total: IntCounter,
    #[cfg(feature = "metrics")]
    pub rows_per_batch: Histogram,

    // --- Coercion / routing failures
    #[cfg(feature = "metrics")]
    pub coercion_errors_total: IntCounter,
    #[cfg(feature = "metrics")]
    pub invalid_partition_key_total: IntCounter,

    // --- Connection loss
    #[cfg(feature = "metrics")]
    pub reconnect_parks_total: IntCounter,

    // --- Backpressure
    #[cfg(feature = "metrics")]
    pub shard_queue_depth: IntGauge,

    #[cfg(not(feature = "metrics"))]
    _noop: (),
}

impl IngestMetrics {
    pub fn new() -> IngestResult<Self> {
        #[cfg(feature = "metrics")]
        {
            let registry = Registry::new();

            let rows_enqueued_total = IntCounter::with_opts(Opts::new(
                "ingest_rows_enqueued_total",
                "Rows accepted by BulkLoader::insert",
            ))?;
            let rows_completed_total = IntCounter::with_opts(Opts::new(
                "ingest_rows_completed_total",
                "Rows whose terminal callback was a success",
            ))?;
            let rows_failed_total = IntCounter::with_opts(Opts::new(
                "ingest_rows_failed_total",
                "Rows whose terminal callback was a failure",
            ))?;

            let batches_submitted_total = IntCounter::with_opts(Opts::new(
                "ingest_batches_submitted_total",
                "Batches submitted to the procedure client, successful or not",
            ))?;
            let batches_rejected_total = IntCounter::with_opts(Opts::new(
                "ingest_batches_rejected_total",
                "Batches whose response was non-success, triggering row-by-row resubmission",
            ))?;
            let rows_per_batch = Histogram::with_opts(HistogramOpts::new(
                "ingest_rows_per_batch",
                "Row count of each submitted batch",
            ))?;

            let coercion_errors_total = IntCounter::with_opts(Opts::new(
                "ingest_coercion_errors_total",
                "Rows rejected during drain because a value failed to coerce",
            ))?;
            let invalid_partition_key_total = IntCounter::with_opts(Opts::new(
                "ingest_invalid_partition_key_total",
                "Rows rejected by the router before being enqueued",
            ))?;

            let reconnect_parks_total = IntCounter::with_opts(Opts::new(
                "ingest_reconnect_parks_total",
                "Times a shard worker parked waiting for a reconnect notification",
            ))?;

            let shard_queue_depth = IntGauge::with_opts(Opts::new(
                "ingest_shard_queue_depth",
                "Approximate pending-row depth of the most recently updated shard",
            ))?;

            registry.register(Box::new(rows_enqueued_total.clone()))?;
            registry.register(Box::new(rows_completed_total.clone()))?;
            registry.register(Box::new(rows_failed_total.clone()))?;
            registry.register(Box::new(batches_submitted_total.clone()))?;
            registry.register(Box::new(batches_rejected_total.clone()))?;
            registry.register(Box::new(rows_per_batch.clone()))?;
            registry.register(Box::new(coercion_errors_total.clone()))?;
            registry.register(Box::new(invalid_partition_key_total.clone()))?;
            registry.register(Box::new(reconnect_parks_total.clone()))?;
            registry.register(Box::new(shard_queue_depth.clone()))?;

            Ok(Self {
                registry,
                rows_enqueued_total,
                rows_completed_total,
                rows_failed_total,
                batches_submitted_total,
                batches_rejected_total,
                rows_per_batch,
                coercion_errors_total,
                invalid_partition_key_total,
                reconnect_parks_total,
                shard_queue_depth,
            })
        }

        #[cfg(not(feature = "metrics"))]
        {
            Ok(Self { _noop: () })
        }
    }

    #[cfg(feature = "metrics")]
    pub fn encode_text(&self) -> IngestResult<String> {
        use prometheus::{Encoder, TextEncoder};
        let mf = self.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new().encode(&mf, &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    #[cfg(not(feature = "metrics"))]
    pub fn encode_text(&self) -> IngestResult<String> {
        Err(crate::error::IngestError::InvalidConfig(
            "metrics feature is disabled".into(),
        ))
    }

    #[inline]
    pub fn inc_rows_enqueued(&self, _n: u64) {
        #[cfg(feature = "metrics")]
        self.rows_enqueued_total.inc_by(_n);
    }

    #[inline]
    pub fn inc_rows_completed(&self, _n: u64) {
        #[cfg(feature = "metrics")]
        self.rows_completed_total.inc_by(_n);
    }

    #[inline]
    pub fn inc_rows_failed(&self, _n: u64) {
        #[cfg(feature = "metrics")]
        self.rows_failed_total.inc_by(_n);
    }

    #[inline]
    pub fn observe_batch_submitted(&self, _rows: usize) {
        #[cfg(feature = "metrics")]
        {
            self.batches_submitted_total.inc();
            self.rows_per_batch.observe(_rows as f64);
        }
    }

    #[inline]
    pub fn inc_batch_rejected(&self) {
        #[cfg(feature = "metrics")]
        self.batches_rejected_total.inc();
    }

    #[inline]
    pub fn inc_coercion_error(&self) {
        #[cfg(feature = "metrics")]
        self.coercion_errors_total.inc();
    }

    #[inline]
    pub fn inc_invalid_partition_key(&self) {
        #[cfg(feature = "metrics")]
        self.invalid_partition_key_total.inc();
    }

    #[inline]
    pub fn inc_reconnect_park(&self) {
        #[cfg(feature = "metrics")]
        self.reconnect_parks_total.inc();
    }

    #[inline]
    pub fn set_shard_queue_depth(&self, _depth: i64) {
        #[cfg(feature = "metrics")]
        self.shard_queue_depth.set(_depth);
    }
}
