use thiserror::Error;

/// Crate-wide result type.
pub type IngestResult<T> = std::result::Result<T, IngestError>;

#[derive(Debug, Clone, Error)]
pub enum IngestError {
    // =========
    // Config / startup
    // =========
    #[error("configuration file IO error: {0}")]
    ConfigIo(String),

    #[error("failed to parse TOML config: {0}")]
    ConfigToml(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // =========
    // Routing / coercion (spec §4.1, §7)
    // =========
    /// The row's partition-key value could not be coerced to the column's
    /// declared type, so the row was never enqueued.
    #[error("invalid partition key for table '{table}': {reason}")]
    InvalidPartitionKey { table: String, reason: String },

    /// A row value could not coerce to its declared column type inside a
    /// drain (spec §4.2 step 2). The shard reports the offending row via
    /// the loader's failure callback and continues the batch.
    #[error("parameter type error on column '{column}': {reason}")]
    ParameterTypeError { column: String, reason: String },

    // =========
    // Submission / connectivity (spec §4.3, §4.4, §7)
    // =========
    /// A batch submit returned a non-success status that is not
    /// `ConnectionLost` (spec: `UserError`, `GracefulFailure`, ...).
    #[error("batch rejected: {0}")]
    BatchRejected(String),

    /// The underlying client signaled (or we synthesized) connection loss.
    #[error("connection lost")]
    ConnectionLost,

    /// The shard was torn down while rows were still queued.
    #[error("shard shut down with rows still queued")]
    ShardShutdown,

    // =========
    // Executor / lifecycle
    // =========
    #[error("failed to join worker task: {0}")]
    TaskJoin(String),

    #[error("loader closed")]
    LoaderClosed,

    #[error("prometheus registry error: {0}")]
    Prometheus(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for IngestError {
    fn from(e: std::io::Error) -> Self {
        IngestError::ConfigIo(e.to_string())
    }
}

impl From<toml::de::Error> for IngestError {
    fn from(e: toml::de::Error) -> Self {
        IngestError::ConfigToml(e.to_string())
    }
}

impl From<prometheus::Error> for IngestError {
    fn from(e: prometheus::Error) -> Self {
        IngestError::Prometheus(e.to_string())
    }
}

impl From<tokio::task::JoinError> for IngestError {
    fn from(e: tokio::task::JoinError) -> Self {
        IngestError::TaskJoin(e.to_string())
    }
}
