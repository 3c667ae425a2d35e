//! The top-level scheduler registry.
//!
//! One [`SchedulerManager`] per process: it builds a [`VmScheduler`] per
//! virtual model from the pipeline table, routes `(virtual model, request)`
//! pairs to the owning scheduler, and drives lifecycle — startup, atomic
//! config reload, and graceful shutdown with a drain period.

use crate::config::GatewayConfig;
use crate::context::ExecutionContext;
use crate::envelope::{ChunkStream, ExecutionResult, ExecutionStatus, GatewayRequest};
use crate::error::{GatewayError, Result};
use crate::events::EventHandler;
use crate::policy::ErrorHandlerCenter;
use crate::scheduler::{VmMetrics, VmScheduler};
use crate::table::PipelineTable;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Top-level façade over all virtual-model schedulers.
pub struct SchedulerManager {
    table: ArcSwap<PipelineTable>,
    schedulers: DashMap<String, Arc<VmScheduler>>,
    config: GatewayConfig,
    events: Option<Arc<dyn EventHandler>>,
    accepting: AtomicBool,
    root_cancel: CancellationToken,
}

impl SchedulerManager {
    /// Build the manager (and the pipeline table) from parsed config.
    ///
    /// Schedulers are not created until [`start`](Self::start).
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let table = PipelineTable::build(&config)?;
        Ok(Self {
            table: ArcSwap::from_pointee(table),
            schedulers: DashMap::new(),
            config,
            events: None,
            accepting: AtomicBool::new(false),
            root_cancel: CancellationToken::new(),
        })
    }

    /// Attach an observer before starting.
    pub fn with_events(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build one scheduler per virtual model and begin accepting requests.
    pub fn start(&self) -> Result<()> {
        let table = self.table.load();
        for vm in table.virtual_models() {
            let pipelines = table.lookup(vm).unwrap_or_default();
            let scheduler = VmScheduler::new(
                vm,
                pipelines,
                self.config.scheduler.clone(),
                self.events.clone(),
            )?;
            self.schedulers.insert(vm.to_string(), Arc::new(scheduler));
        }
        self.accepting.store(true, Ordering::SeqCst);
        tracing::info!(virtual_models = self.schedulers.len(), "gateway started");
        Ok(())
    }

    /// Register a pre-built scheduler (embedders wiring custom provider
    /// clients). Implies accepting requests for that virtual model.
    pub fn register_scheduler(&self, scheduler: Arc<VmScheduler>) {
        self.schedulers
            .insert(scheduler.virtual_model().to_string(), scheduler);
        self.accepting.store(true, Ordering::SeqCst);
    }

    /// Ids of all registered virtual models.
    pub fn virtual_models(&self) -> Vec<String> {
        self.schedulers.iter().map(|e| e.key().clone()).collect()
    }

    /// The scheduler owning a virtual model.
    pub fn scheduler(&self, virtual_model: &str) -> Option<Arc<VmScheduler>> {
        self.schedulers
            .get(virtual_model)
            .map(|e| Arc::clone(e.value()))
    }

    /// Metrics snapshots for every virtual model.
    pub fn metrics(&self) -> Vec<VmMetrics> {
        self.schedulers.iter().map(|e| e.metrics()).collect()
    }

    /// Dispatch a non-streaming request to its virtual model.
    pub async fn dispatch(
        &self,
        virtual_model: &str,
        request: GatewayRequest,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        let Some(scheduler) = self.lookup_accepting(virtual_model) else {
            return self.rejection_result(virtual_model, &request, cancel);
        };
        let (linked, _guard) = self.link_cancellation(cancel);
        scheduler.handle_request(request, linked).await
    }

    /// Dispatch a streaming request to its virtual model.
    pub async fn dispatch_stream(
        &self,
        virtual_model: &str,
        request: GatewayRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkStream> {
        let Some(scheduler) = self.lookup_accepting(virtual_model) else {
            return Err(self.rejection_error(virtual_model));
        };
        let (linked, guard) = self.link_cancellation(cancel);
        let stream = scheduler.handle_streaming_request(request, linked).await?;
        // The guard must outlive the stream: dropping it cancels the linked
        // token and would close a live stream.
        Ok(Box::pin(futures::StreamExt::map(stream, move |chunk| {
            let _guard = &guard;
            chunk
        })))
    }

    /// Rebuild the pipeline table from new config and swap it in.
    ///
    /// New schedulers replace the old ones atomically per virtual model;
    /// removed virtual models stop accepting immediately. In-flight
    /// requests finish on the schedulers they started on.
    pub fn reload(&self, config: GatewayConfig) -> Result<()> {
        let table = PipelineTable::build(&config)?;

        let mut fresh = Vec::new();
        for vm in table.virtual_models() {
            let pipelines = table.lookup(vm).unwrap_or_default();
            let scheduler = VmScheduler::new(
                vm,
                pipelines,
                config.scheduler.clone(),
                self.events.clone(),
            )?;
            fresh.push((vm.to_string(), Arc::new(scheduler)));
        }

        let keep: std::collections::HashSet<&str> =
            table.virtual_models().collect();
        self.schedulers.retain(|vm, old| {
            let stays = keep.contains(vm.as_str());
            if !stays {
                old.stop();
            }
            stays
        });
        for (vm, scheduler) in fresh {
            if let Some(old) = self.schedulers.insert(vm, scheduler) {
                old.stop();
            }
        }
        self.table.store(Arc::new(table));
        tracing::info!("pipeline table reloaded");
        Ok(())
    }

    /// Total in-flight requests across all schedulers.
    pub fn in_flight(&self) -> u32 {
        self.schedulers.iter().map(|e| e.in_flight()).sum()
    }

    /// Stop accepting, drain in-flight requests up to `grace`, then cancel
    /// whatever remains.
    pub async fn shutdown(&self, grace: Duration) {
        self.accepting.store(false, Ordering::SeqCst);
        tracing::info!(grace_ms = grace.as_millis() as u64, "gateway draining");

        let deadline = tokio::time::Instant::now() + grace;
        while self.in_flight() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let leftover = self.in_flight();
        if leftover > 0 {
            tracing::warn!(leftover, "grace period elapsed; cancelling remainder");
        }
        self.root_cancel.cancel();
        for entry in self.schedulers.iter() {
            entry.stop();
        }
        tracing::info!("gateway stopped");
    }

    fn lookup_accepting(&self, virtual_model: &str) -> Option<Arc<VmScheduler>> {
        if !self.accepting.load(Ordering::SeqCst) {
            return None;
        }
        self.scheduler(virtual_model)
    }

    /// A cancellation token that fires on client disconnect or shutdown.
    ///
    /// The returned guard cancels the linked token when dropped, which both
    /// reaps the watcher task and bounds the request's lifetime.
    fn link_cancellation(
        &self,
        client: CancellationToken,
    ) -> (CancellationToken, tokio_util::sync::DropGuard) {
        let linked = self.root_cancel.child_token();
        let watcher = linked.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = client.cancelled() => watcher.cancel(),
                _ = watcher.cancelled() => {}
            }
        });
        let guard = linked.clone().drop_guard();
        (linked, guard)
    }

    fn rejection_error(&self, virtual_model: &str) -> GatewayError {
        if self.accepting.load(Ordering::SeqCst) {
            GatewayError::UnknownVirtualModel {
                virtual_model: virtual_model.to_string(),
            }
        } else {
            // Shutting down: every pool reads as drained.
            GatewayError::NoHealthyInstance {
                virtual_model: virtual_model.to_string(),
            }
        }
    }

    fn rejection_result(
        &self,
        virtual_model: &str,
        request: &GatewayRequest,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        let error = self.rejection_error(virtual_model);
        let ctx = ExecutionContext::new(
            virtual_model,
            request.traceparent.as_deref(),
            cancel,
            Duration::ZERO,
        );
        ExecutionResult {
            execution_id: ctx.execution_id,
            status: ExecutionStatus::Failed,
            duration_ms: 0,
            body: None,
            error: Some(ErrorHandlerCenter::error_response(&error)),
        }
    }
}

impl std::fmt::Debug for SchedulerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerManager")
            .field("virtual_models", &self.schedulers.len())
            .field("accepting", &self.accepting.load(Ordering::SeqCst))
            .finish()
    }
}
