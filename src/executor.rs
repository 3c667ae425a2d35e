//! The pipeline executor.
//!
//! Drives one request through an instance's four stages and back, recording
//! a [`StageIo`] around every stage call. All cross-cutting concerns live
//! here — the deadline, cancellation, panic capture, and the logging around
//! each call — so the stages themselves stay free of them.

use crate::context::{ExecutionContext, StageIo, StageStatus};
use crate::envelope::{stream_from_receiver, ChunkStream};
use crate::error::{GatewayError, Result};
use crate::instance::PipelineInstance;
use crate::stage::{Stage, StageKind};
use crate::stages::workflow::{self, WorkflowMode};
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// Run a non-streaming request through the instance's pipeline.
///
/// Enforces the per-request deadline (whatever is left of it across earlier
/// attempts) and fails fast on cancellation. The deadline firing also
/// abandons the in-flight provider call.
pub async fn execute(
    instance: &PipelineInstance,
    request: Value,
    ctx: &ExecutionContext,
) -> Result<Value> {
    let Some(remaining) = ctx.timeout.checked_sub(ctx.elapsed()) else {
        return Err(GatewayError::Timeout);
    };

    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(GatewayError::Cancelled),
        outcome = tokio::time::timeout(remaining, run_pipeline(instance, request, ctx)) => {
            match outcome {
                Ok(result) => result,
                Err(_) => Err(GatewayError::Timeout),
            }
        }
    }
}

async fn run_pipeline(
    instance: &PipelineInstance,
    request: Value,
    ctx: &ExecutionContext,
) -> Result<Value> {
    let wants_stream = request
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let mode = instance.workflow_config().mode(wants_stream);
    let stages = instance.stages();

    let mut value = request;
    for stage in stages {
        // A stream-only provider still serves non-streaming clients: the
        // provider leg runs as a stream and the chunks collapse here.
        if stage.kind() == StageKind::Provider && mode == WorkflowMode::StreamToNonStream {
            value = run_provider_accumulating(instance, value, ctx).await?;
        } else {
            value = run_stage(stage, Direction::Forward, value, ctx).await?;
        }
    }
    for stage in stages.iter().rev() {
        value = run_stage(*stage, Direction::Reverse, value, ctx).await?;
    }
    Ok(value)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

async fn run_stage(
    stage: &dyn Stage,
    direction: Direction,
    input: Value,
    ctx: &ExecutionContext,
) -> Result<Value> {
    let name = stage.kind().name();
    let started_at = ctx.elapsed();
    let start = Instant::now();
    let input_size = json_size(&input);

    let fut = match direction {
        Direction::Forward => stage.process(input, ctx),
        Direction::Reverse => stage.process_response(input, ctx),
    };
    let result = match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(GatewayError::Internal {
            stage: Some(name.to_string()),
            message: format!("stage panicked: {}", panic_message(&payload)),
        }),
    };

    match result {
        Ok(output) => {
            ctx.record_io(StageIo {
                stage: name,
                started_at,
                duration: start.elapsed(),
                status: StageStatus::Ok,
                input_size,
                output_size: json_size(&output),
                error_kind: None,
            });
            Ok(output)
        }
        Err(error) => {
            ctx.record_io(StageIo {
                stage: name,
                started_at,
                duration: start.elapsed(),
                status: StageStatus::Error,
                input_size,
                output_size: 0,
                error_kind: Some(error.code()),
            });
            tracing::debug!(
                execution_id = %ctx.execution_id,
                stage = name,
                code = error.code(),
                "stage failed"
            );
            Err(error)
        }
    }
}

/// Provider leg for stream-only providers serving non-streaming clients:
/// open the stream, drain it fully, emit one accumulated response. A failed
/// chunk fails the whole call — no half-stream ever escapes.
async fn run_provider_accumulating(
    instance: &PipelineInstance,
    request: Value,
    ctx: &ExecutionContext,
) -> Result<Value> {
    let name = StageKind::Provider.name();
    let started_at = ctx.elapsed();
    let start = Instant::now();
    let input_size = json_size(&request);

    let outcome: Result<Value> = async {
        let mut stream = instance.provider().open_stream(request, ctx).await?;
        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk?);
        }
        Ok(workflow::accumulate(&chunks))
    }
    .await;

    match outcome {
        Ok(body) => {
            ctx.record_io(StageIo {
                stage: name,
                started_at,
                duration: start.elapsed(),
                status: StageStatus::Ok,
                input_size,
                output_size: json_size(&body),
                error_kind: None,
            });
            Ok(body)
        }
        Err(error) => {
            ctx.record_io(StageIo {
                stage: name,
                started_at,
                duration: start.elapsed(),
                status: StageStatus::Error,
                input_size,
                output_size: 0,
                error_kind: Some(error.code()),
            });
            Err(error)
        }
    }
}

/// Run a streaming request.
///
/// The forward pass and the provider stream setup run under the deadline;
/// once the stream is live, its lifetime is bounded by cancellation rather
/// than the deadline. Every chunk passes through the reverse stages in
/// order before reaching the caller.
pub async fn execute_stream(
    instance: Arc<PipelineInstance>,
    request: Value,
    ctx: Arc<ExecutionContext>,
) -> Result<ChunkStream> {
    let Some(remaining) = ctx.timeout.checked_sub(ctx.elapsed()) else {
        return Err(GatewayError::Timeout);
    };

    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(GatewayError::Cancelled),
        outcome = tokio::time::timeout(
            remaining,
            open_stream(Arc::clone(&instance), request, Arc::clone(&ctx)),
        ) => {
            match outcome {
                Ok(result) => result,
                Err(_) => Err(GatewayError::Timeout),
            }
        }
    }
}

async fn open_stream(
    instance: Arc<PipelineInstance>,
    request: Value,
    ctx: Arc<ExecutionContext>,
) -> Result<ChunkStream> {
    let stages = instance.stages();

    // Forward pass through the three transform stages.
    let mut value = request;
    for stage in &stages[..3] {
        value = run_stage(*stage, Direction::Forward, value, &ctx).await?;
    }

    match instance.workflow_config().mode(true) {
        WorkflowMode::NonStreamToStream => {
            // The provider can't stream: run the whole pipeline to one
            // response, then fragment it.
            let mut response = run_stage(stages[3], Direction::Forward, value, &ctx).await?;
            for stage in stages.iter().rev() {
                response = run_stage(*stage, Direction::Reverse, response, &ctx).await?;
            }
            let cfg = instance.workflow_config();
            let chunks = workflow::fragment(&response, cfg.chunk_size);
            let delay = cfg.stream_delay;

            let (tx, rx) = mpsc::channel::<Result<Value>>(16);
            let task_ctx = Arc::clone(&ctx);
            tokio::spawn(async move {
                for chunk in chunks {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    if task_ctx.is_cancelled() {
                        let _ = tx.send(Err(GatewayError::Cancelled)).await;
                        return;
                    }
                    if tx.send(Ok(chunk)).await.is_err() {
                        return;
                    }
                }
            });
            Ok(stream_from_receiver(rx))
        }
        _ => {
            let mut provider_stream = instance.provider().open_stream(value, &ctx).await?;
            let (tx, rx) = mpsc::channel::<Result<Value>>(16);
            let task_ctx = Arc::clone(&ctx);
            let task_instance = Arc::clone(&instance);
            tokio::spawn(async move {
                let started_at = task_ctx.elapsed();
                let start = Instant::now();
                let mut chunk_count = 0usize;
                let mut failed: Option<&'static str> = None;

                loop {
                    let next = tokio::select! {
                        biased;
                        _ = task_ctx.cancelled() => {
                            failed = Some("CANCELLED");
                            let _ = tx.send(Err(GatewayError::Cancelled)).await;
                            break;
                        }
                        next = provider_stream.next() => next,
                    };
                    let Some(chunk) = next else { break };
                    let result = match chunk {
                        Ok(chunk) => reverse_chunk(&task_instance, chunk, &task_ctx).await,
                        Err(e) => Err(e),
                    };
                    match result {
                        Ok(chunk) => {
                            chunk_count += 1;
                            if tx.send(Ok(chunk)).await.is_err() {
                                break;
                            }
                        }
                        Err(error) => {
                            failed = Some(error.code());
                            let _ = tx.send(Err(error)).await;
                            break;
                        }
                    }
                }

                task_ctx.record_io(StageIo {
                    stage: StageKind::Provider.name(),
                    started_at,
                    duration: start.elapsed(),
                    status: if failed.is_some() {
                        StageStatus::Error
                    } else {
                        StageStatus::Ok
                    },
                    input_size: 0,
                    output_size: chunk_count,
                    error_kind: failed,
                });
            });
            Ok(stream_from_receiver(rx))
        }
    }
}

/// Pass one streamed chunk back through the reverse transform stages.
async fn reverse_chunk(
    instance: &PipelineInstance,
    chunk: Value,
    ctx: &ExecutionContext,
) -> Result<Value> {
    let stages = instance.stages();
    let mut value = chunk;
    for stage in stages[..3].iter().rev() {
        value = stage.process_response(value, ctx).await?;
    }
    Ok(value)
}

fn json_size(value: &Value) -> usize {
    serde_json::to_vec(value).map(|b| b.len()).unwrap_or(0)
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
