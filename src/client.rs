//! The database client collaborator (spec §6). Out of scope for the ingest
//! core proper, but the shard needs *something* to invoke stored procedures
//! against, so this module defines the trait shape the spec describes and a
//! small in-memory mock used by the scenario tests.

use async_trait::async_trait;
use std::fmt;

use crate::value::Value;

/// Response status from a stored-procedure invocation (spec §6). Only
/// `Success` is treated as success; everything else is a failure, and
/// `ConnectionLost` is the only status that re-enters the submit loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    ConnectionLost,
    UserError,
    GracefulFailure,
}

#[derive(Debug, Clone)]
pub struct CallResponse {
    pub status: Status,
    pub message: String,
}

impl CallResponse {
    pub fn success() -> Self {
        Self {
            status: Status::Success,
            message: String::new(),
        }
    }

    pub fn connection_lost() -> Self {
        Self {
            status: Status::ConnectionLost,
            message: "connection lost".into(),
        }
    }

    pub fn user_error(message: impl Into<String>) -> Self {
        Self {
            status: Status::UserError,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}

/// Signals the synchronous "unreachable network" path from spec §6: the
/// client threw before it could even register an asynchronous callback.
#[derive(Debug, Clone)]
pub struct Unreachable(pub String);

impl fmt::Display for Unreachable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client unreachable: {}", self.0)
    }
}

impl std::error::Error for Unreachable {}

/// One row of a batch, as handed to the client for a stored-procedure
/// invocation. Column order matches the loader's column descriptors.
pub type BatchRow = Vec<Value>;

/// Non-blocking `callProcedure(callback, name, args...)` (spec §6), modeled
/// as an async trait so the shard worker can simply `.await` the response
/// instead of registering a callback by hand.
#[async_trait]
pub trait ProcedureClient: Send + Sync {
    /// MP invocation shape: `callProcedure(cb, procName, tableName, upsert, rows)`.
    async fn call_procedure_mp(
        &self,
        procedure: &str,
        table: &str,
        upsert: bool,
        rows: &[BatchRow],
    ) -> Result<CallResponse, Unreachable>;

    /// SP invocation shape:
    /// `callProcedure(cb, procName, routingParam, tableName, upsert, rows)`.
    async fn call_procedure_sp(
        &self,
        procedure: &str,
        routing_param: &[u8],
        table: &str,
        upsert: bool,
        rows: &[BatchRow],
    ) -> Result<CallResponse, Unreachable>;
}

/// In-memory `ProcedureClient`, scriptable by tests and usable as the
/// backing client for the demo binary alike.
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// What the mock should do on its *next* `n` submits before falling
    /// back to `Success`. Consumed front-to-back, one scripted outcome per
    /// call to either `call_procedure_mp` or `call_procedure_sp`.
    #[derive(Clone)]
    pub enum Scripted {
        Respond(CallResponse),
        Unreachable,
    }

    #[derive(Debug, Clone)]
    pub struct RecordedCall {
        pub procedure: String,
        pub table: String,
        pub upsert: bool,
        pub routing_param: Option<Vec<u8>>,
        pub rows: Vec<BatchRow>,
    }

    /// In-memory `ProcedureClient` for tests: records every call it
    /// receives and plays back a scripted sequence of responses.
    pub struct MockClient {
        script: Mutex<Vec<Scripted>>,
        calls: Mutex<Vec<RecordedCall>>,
        next: AtomicUsize,
    }

    impl MockClient {
        pub fn new() -> Self {
            Self {
                script: Mutex::new(Vec::new()),
                calls: Mutex::new(Vec::new()),
                next: AtomicUsize::new(0),
            }
        }

        /// Queue the next scripted outcome(s), consumed in order.
        pub fn push_script(&self, outcome: Scripted) {
            self.script.lock().unwrap().push(outcome);
        }

        pub fn calls(&self) -> Vec<RecordedCall> {
            self.calls.lock().unwrap().clone()
        }

        fn next_outcome(&self) -> Option<Scripted> {
            let idx = self.next.fetch_add(1, Ordering::SeqCst);
            self.script.lock().unwrap().get(idx).cloned()
        }

        async fn resolve(
            &self,
            procedure: &str,
            table: &str,
            upsert: bool,
            routing_param: Option<Vec<u8>>,
            rows: &[BatchRow],
        ) -> Result<CallResponse, Unreachable> {
            self.calls.lock().unwrap().push(RecordedCall {
                procedure: procedure.to_string(),
                table: table.to_string(),
                upsert,
                routing_param,
                rows: rows.to_vec(),
            });

            match self.next_outcome() {
                Some(Scripted::Respond(r)) => Ok(r),
                Some(Scripted::Unreachable) => Err(Unreachable("scripted".into())),
                None => Ok(CallResponse::success()),
            }
        }
    }

    impl Clone for Scripted {
        fn clone(&self) -> Self {
            match self {
                Scripted::Respond(r) => Scripted::Respond(r.clone()),
                Scripted::Unreachable => Scripted::Unreachable,
            }
        }
    }

    #[async_trait]
    impl ProcedureClient for MockClient {
        async fn call_procedure_mp(
            &self,
            procedure: &str,
            table: &str,
            upsert: bool,
            rows: &[BatchRow],
        ) -> Result<CallResponse, Unreachable> {
            self.resolve(procedure, table, upsert, None, rows).await
        }

        async fn call_procedure_sp(
            &self,
            procedure: &str,
            routing_param: &[u8],
            table: &str,
            upsert: bool,
            rows: &[BatchRow],
        ) -> Result<CallResponse, Unreachable> {
            self.resolve(procedure, table, upsert, Some(routing_param.to_vec()), rows)
                .await
        }
    }
}
