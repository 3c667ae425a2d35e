//! Per-request execution context.
//!
//! An [`ExecutionContext`] is created by the scheduler for each dispatched
//! request and carries the execution id, the caller's trace id, the
//! cancellation token tied to the HTTP connection, and the append-only
//! per-stage I/O trace. It lives exactly as long as the request.

use crate::error::{GatewayError, Result};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Outcome of one stage invocation, for observability only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    /// The stage completed.
    Ok,
    /// The stage returned or raised an error.
    Error,
}

/// One entry in the per-request I/O trace.
///
/// Recorded by the executor around every stage call, both directions.
/// Carries no semantic weight — transforms never read it.
#[derive(Debug, Clone)]
pub struct StageIo {
    /// Stage name.
    pub stage: &'static str,
    /// When the stage started, relative to context creation.
    pub started_at: Duration,
    /// How long the stage ran.
    pub duration: Duration,
    /// Ok or Error.
    pub status: StageStatus,
    /// Approximate input payload size in bytes.
    pub input_size: usize,
    /// Approximate output payload size in bytes (0 on error).
    pub output_size: usize,
    /// Stable error code when `status` is `Error`.
    pub error_kind: Option<&'static str>,
}

/// Scratch state owned by a single in-flight request.
pub struct ExecutionContext {
    /// Unique id for this execution.
    pub execution_id: String,
    /// Trace id carried end to end; the caller's `traceparent` when present.
    pub trace_id: String,
    /// The virtual model serving this request.
    pub virtual_model: String,
    /// Instance currently executing the request; updated on failover.
    instance_id: Mutex<Option<String>>,
    /// When the context was created.
    pub started_at: Instant,
    /// Hard per-request deadline enforced by the executor.
    pub timeout: Duration,
    cancel: CancellationToken,
    io_records: Mutex<Vec<StageIo>>,
}

impl ExecutionContext {
    /// Create a context for one request.
    ///
    /// `trace_id` should come from the caller's `traceparent`; a fresh id is
    /// minted when the caller did not send one. The token is a child of the
    /// connection token so a client disconnect cancels the whole attempt
    /// chain.
    pub fn new(
        virtual_model: impl Into<String>,
        trace_id: Option<&str>,
        cancel: CancellationToken,
        timeout: Duration,
    ) -> Self {
        Self {
            execution_id: Uuid::new_v4().to_string(),
            trace_id: trace_id
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            virtual_model: virtual_model.into(),
            instance_id: Mutex::new(None),
            started_at: Instant::now(),
            timeout,
            cancel,
            io_records: Mutex::new(Vec::new()),
        }
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Return `Err(Cancelled)` if cancellation has been requested.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }
        Ok(())
    }

    /// Resolves when cancellation is requested. Usable in `tokio::select!`.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// A child token for work spawned on behalf of this request.
    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Record which instance is currently serving the request.
    pub fn set_instance(&self, instance_id: impl Into<String>) {
        *self.instance_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(instance_id.into());
    }

    /// The instance currently serving the request, if one was picked yet.
    pub fn instance(&self) -> Option<String> {
        self.instance_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Append a stage I/O record.
    pub fn record_io(&self, record: StageIo) {
        self.io_records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
    }

    /// Snapshot of the I/O trace so far.
    pub fn io_records(&self) -> Vec<StageIo> {
        self.io_records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Time since the context was created.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("execution_id", &self.execution_id)
            .field("trace_id", &self.trace_id)
            .field("virtual_model", &self.virtual_model)
            .field("instance_id", &self.instance())
            .field("elapsed", &self.elapsed())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
