//! The per-virtual-model scheduler.
//!
//! One [`VmScheduler`] owns everything for a single virtual model: its
//! pipeline instances, load balancer, health tracker, and blacklist. It is
//! the `handleRequest` entry point — it picks an instance, runs the
//! pipeline, feeds outcomes back into health tracking, and walks the
//! retry/failover/blacklist ladder the error policy dictates.
//!
//! Independent requests run concurrently; within one request, retries are
//! strictly sequential. A bounded semaphore enforces the per-VM concurrency
//! cap — overflow is rejected immediately, never queued.

use crate::backoff::RetryBackoff;
use crate::balancer::LoadBalancer;
use crate::blacklist::{Blacklist, BlacklistEntrySnapshot};
use crate::config::SchedulerConfig;
use crate::context::ExecutionContext;
use crate::envelope::{ChunkStream, ExecutionResult, ExecutionStatus, GatewayRequest};
use crate::error::{GatewayError, Result};
use crate::events::{emit, EventHandler, GatewayEvent};
use crate::health::{CircuitState, HealthMetrics, HealthTracker};
use crate::instance::{InstanceState, InstanceStatsSnapshot, PipelineInstance};
use crate::policy::{ErrorHandlerCenter, RecoveryAction};
use crate::table::PipelineConfig;
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Per-instance entry in a metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceMetrics {
    /// Instance id.
    pub instance_id: String,
    /// Derived instance state.
    pub state: InstanceState,
    /// Counter snapshot.
    pub stats: InstanceStatsSnapshot,
    /// Health view.
    pub health: HealthMetrics,
}

/// Point-in-time view of one scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct VmMetrics {
    /// The virtual model this snapshot describes.
    pub virtual_model: String,
    /// All registered instances.
    pub instances: Vec<InstanceMetrics>,
    /// Live blacklist entries.
    pub blacklist: Vec<BlacklistEntrySnapshot>,
}

/// Scheduler for one virtual model.
pub struct VmScheduler {
    virtual_model: String,
    instances: RwLock<Vec<Arc<PipelineInstance>>>,
    balancer: LoadBalancer,
    tracker: Arc<HealthTracker>,
    blacklist: Arc<Blacklist>,
    policy: ErrorHandlerCenter,
    backoff: RetryBackoff,
    limiter: Arc<Semaphore>,
    config: SchedulerConfig,
    events: Option<Arc<dyn EventHandler>>,
    shutdown: CancellationToken,
}

impl VmScheduler {
    /// Build a scheduler from pipeline configs (real HTTP clients).
    pub fn new(
        virtual_model: impl Into<String>,
        pipelines: &[PipelineConfig],
        config: SchedulerConfig,
        events: Option<Arc<dyn EventHandler>>,
    ) -> Result<Self> {
        let instances = pipelines
            .iter()
            .map(|p| PipelineInstance::from_config(p.clone()).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        Self::with_instances(virtual_model, instances, config, events)
    }

    /// Build a scheduler around pre-built instances (tests, custom clients).
    pub fn with_instances(
        virtual_model: impl Into<String>,
        instances: Vec<Arc<PipelineInstance>>,
        config: SchedulerConfig,
        events: Option<Arc<dyn EventHandler>>,
    ) -> Result<Self> {
        let virtual_model = virtual_model.into();
        if instances.is_empty() {
            return Err(GatewayError::StageConfigInvalid(format!(
                "virtual model '{virtual_model}' has no routable instances"
            )));
        }

        let tracker = Arc::new(HealthTracker::new(
            config.load_balancer.circuit_breaker.clone(),
            events.clone(),
        ));
        for instance in &instances {
            tracker.register(instance.id());
        }

        let blacklist = Arc::new(Blacklist::new(events.clone()));
        let shutdown = CancellationToken::new();
        Arc::clone(&blacklist)
            .spawn_sweeper(config.blacklist_sweep_interval(), shutdown.child_token());
        Arc::clone(&tracker).spawn_ticker(
            config.load_balancer.health_check_interval(),
            shutdown.child_token(),
        );

        Ok(Self {
            balancer: LoadBalancer::new(config.load_balancer.strategy),
            tracker,
            blacklist,
            policy: ErrorHandlerCenter::new(config.max_retries),
            backoff: RetryBackoff::standard(),
            limiter: Arc::new(Semaphore::new(config.max_concurrent_requests)),
            instances: RwLock::new(instances),
            config,
            events,
            shutdown,
            virtual_model,
        })
    }

    /// Replace the retry backoff (tests want zero delays).
    pub fn with_backoff(mut self, backoff: RetryBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Replace the error policy.
    pub fn with_policy(mut self, policy: ErrorHandlerCenter) -> Self {
        self.policy = policy;
        self
    }

    /// The virtual model this scheduler serves.
    pub fn virtual_model(&self) -> &str {
        &self.virtual_model
    }

    /// Add an instance after startup (uncommon).
    pub fn register_instance(&self, instance: Arc<PipelineInstance>) {
        self.tracker.register(instance.id());
        self.instances
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(instance);
    }

    /// Remove an instance. Returns whether it was present.
    pub fn unregister_instance(&self, instance_id: &str) -> bool {
        let mut instances = self.instances.write().unwrap_or_else(|e| e.into_inner());
        let before = instances.len();
        instances.retain(|i| i.id() != instance_id);
        let removed = instances.len() < before;
        if removed {
            self.tracker.unregister(instance_id);
            self.blacklist.remove(instance_id);
        }
        removed
    }

    /// Requests currently executing across all instances.
    pub fn in_flight(&self) -> u32 {
        self.instances
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|i| i.stats().current_in_flight())
            .sum()
    }

    /// Admin: blacklist an instance (permanent when `duration` is `None`).
    pub fn blacklist_instance(
        &self,
        instance_id: &str,
        reason: &str,
        duration: Option<std::time::Duration>,
    ) {
        self.blacklist.add(instance_id, reason, duration);
    }

    /// Admin: clear a blacklist entry, permanent ones included.
    pub fn unblacklist_instance(&self, instance_id: &str) -> bool {
        self.blacklist.remove(instance_id)
    }

    /// Stop background work (blacklist sweeper). Instances die with the
    /// scheduler.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Metrics snapshot.
    pub fn metrics(&self) -> VmMetrics {
        let instances = self.instances.read().unwrap_or_else(|e| e.into_inner());
        VmMetrics {
            virtual_model: self.virtual_model.clone(),
            instances: instances
                .iter()
                .map(|instance| {
                    let circuit_open =
                        self.tracker.circuit_state(instance.id()) == CircuitState::Open;
                    let blacklisted = self.blacklist.contains(instance.id());
                    InstanceMetrics {
                        instance_id: instance.id().to_string(),
                        state: instance.state(circuit_open, blacklisted),
                        stats: instance.stats_snapshot(),
                        health: self.tracker.metrics(instance),
                    }
                })
                .collect(),
            blacklist: self.blacklist.snapshot(),
        }
    }

    /// Instances neither blacklisted, circuit-excluded, nor excluded for
    /// this request, in stable config order.
    fn healthy_set(&self, excluded: &HashSet<String>) -> Vec<Arc<PipelineInstance>> {
        self.instances
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|i| !excluded.contains(i.id()))
            .filter(|i| !self.blacklist.contains(i.id()))
            .filter(|i| self.tracker.is_eligible(i.id()))
            .cloned()
            .collect()
    }

    /// Pick an instance, honoring the half-open probe budget.
    fn pick(&self, excluded: &mut HashSet<String>) -> Option<Arc<PipelineInstance>> {
        loop {
            let healthy = self.healthy_set(excluded);
            let instance = self.balancer.pick(&healthy)?;
            if self.tracker.try_acquire(instance.id()) {
                return Some(instance);
            }
            // Lost the probe race; retry without this instance. The
            // exclusion is per-request only.
            excluded.insert(instance.id().to_string());
        }
    }

    /// Handle one non-streaming request end to end.
    ///
    /// `cancel` should be tied to the client connection; dropping it mid
    /// flight cancels the provider call.
    pub async fn handle_request(
        &self,
        request: GatewayRequest,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        let Ok(_permit) = self.limiter.try_acquire() else {
            let err = GatewayError::BackpressureRejected {
                virtual_model: self.virtual_model.clone(),
            };
            return Self::result_for_error(&ExecutionContext::new(
                &self.virtual_model,
                request.traceparent.as_deref(),
                cancel,
                self.config.request_timeout(),
            ), err);
        };

        let ctx = ExecutionContext::new(
            &self.virtual_model,
            request.traceparent.as_deref(),
            cancel,
            self.config.request_timeout(),
        );
        emit(
            &self.events,
            GatewayEvent::RequestStart {
                execution_id: ctx.execution_id.clone(),
                virtual_model: self.virtual_model.clone(),
            },
        );

        let outcome = self.run_attempts(&request, &ctx).await;
        let result = match outcome {
            Ok(body) => ExecutionResult {
                execution_id: ctx.execution_id.clone(),
                status: ExecutionStatus::Completed,
                duration_ms: ctx.elapsed().as_millis() as u64,
                body: Some(body),
                error: None,
            },
            Err(error) => Self::result_for_error(&ctx, error),
        };

        self.publish_stage_events(&ctx);
        emit(
            &self.events,
            GatewayEvent::RequestEnd {
                execution_id: ctx.execution_id.clone(),
                ok: result.is_success(),
                duration: ctx.elapsed(),
            },
        );
        result
    }

    /// The retry/failover ladder for one request.
    async fn run_attempts(
        &self,
        request: &GatewayRequest,
        ctx: &ExecutionContext,
    ) -> Result<Value> {
        let mut excluded: HashSet<String> = HashSet::new();
        let mut retry_count: u32 = 0;
        let mut last_error: Option<GatewayError> = None;
        // Set when the policy asked for a same-instance retry.
        let mut retrying: Option<Arc<PipelineInstance>> = None;

        loop {
            ctx.check_cancelled()?;

            let picked = match retrying.take() {
                Some(instance) => Some(instance),
                None => self.pick(&mut excluded),
            };
            let Some(instance) = picked else {
                // Exhausted the pool: surface what actually went wrong if
                // anything was attempted, otherwise report the empty pool.
                return Err(last_error.unwrap_or_else(|| GatewayError::NoHealthyInstance {
                    virtual_model: self.virtual_model.clone(),
                }));
            };
            ctx.set_instance(instance.id());
            tracing::debug!(
                execution_id = %ctx.execution_id,
                instance = instance.id(),
                retry = retry_count,
                "dispatching attempt"
            );

            let attempt_start = Instant::now();
            match instance.execute(request.body.clone(), ctx).await {
                Ok(body) => {
                    self.tracker.record_success(&instance, attempt_start.elapsed());
                    return Ok(body);
                }
                Err(error) => {
                    // Cancellation is not an instance failure; just give
                    // back any probe slot this attempt was holding.
                    if matches!(error, GatewayError::Cancelled) {
                        self.tracker.abandon(instance.id());
                        return Err(error);
                    }
                    self.tracker.record_failure(&instance, attempt_start.elapsed());

                    match self.policy.decide(&error, retry_count) {
                        RecoveryAction::RetrySame => {
                            retry_count += 1;
                            let delay = error
                                .retry_after()
                                .unwrap_or_else(|| self.backoff.delay_for_attempt(retry_count - 1));
                            emit(
                                &self.events,
                                GatewayEvent::RetryScheduled {
                                    execution_id: ctx.execution_id.clone(),
                                    instance_id: instance.id().to_string(),
                                    attempt: retry_count,
                                    delay,
                                },
                            );
                            last_error = Some(error);
                            retrying = Some(Arc::clone(&instance));
                            if !delay.is_zero() {
                                tokio::select! {
                                    _ = ctx.cancelled() => return Err(GatewayError::Cancelled),
                                    _ = tokio::time::sleep(delay) => {}
                                }
                            }
                        }
                        RecoveryAction::Failover => {
                            emit(
                                &self.events,
                                GatewayEvent::FailoverSelected {
                                    execution_id: ctx.execution_id.clone(),
                                    from_instance: instance.id().to_string(),
                                },
                            );
                            excluded.insert(instance.id().to_string());
                            last_error = Some(error);
                        }
                        RecoveryAction::BlacklistAndFailover { duration } => {
                            self.blacklist
                                .add(instance.id(), error.code(), Some(duration));
                            emit(
                                &self.events,
                                GatewayEvent::FailoverSelected {
                                    execution_id: ctx.execution_id.clone(),
                                    from_instance: instance.id().to_string(),
                                },
                            );
                            excluded.insert(instance.id().to_string());
                            last_error = Some(error);
                        }
                        RecoveryAction::Abort => return Err(error),
                    }
                }
            }
        }
    }

    /// Handle one streaming request.
    ///
    /// Retry and failover apply up to the point the stream opens; once
    /// chunks are flowing the stream is committed to its instance. The
    /// concurrency permit rides inside the returned stream.
    pub async fn handle_streaming_request(
        &self,
        request: GatewayRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkStream> {
        let permit = Arc::clone(&self.limiter).try_acquire_owned().map_err(|_| {
            GatewayError::BackpressureRejected {
                virtual_model: self.virtual_model.clone(),
            }
        })?;

        let ctx = Arc::new(ExecutionContext::new(
            &self.virtual_model,
            request.traceparent.as_deref(),
            cancel,
            self.config.request_timeout(),
        ));
        emit(
            &self.events,
            GatewayEvent::RequestStart {
                execution_id: ctx.execution_id.clone(),
                virtual_model: self.virtual_model.clone(),
            },
        );

        let mut excluded: HashSet<String> = HashSet::new();
        let mut retry_count: u32 = 0;
        let mut last_error: Option<GatewayError> = None;
        let mut retrying: Option<Arc<PipelineInstance>> = None;

        loop {
            ctx.check_cancelled()?;
            let picked = match retrying.take() {
                Some(instance) => Some(instance),
                None => self.pick(&mut excluded),
            };
            let Some(instance) = picked else {
                return Err(last_error.unwrap_or_else(|| GatewayError::NoHealthyInstance {
                    virtual_model: self.virtual_model.clone(),
                }));
            };
            ctx.set_instance(instance.id());

            let attempt_start = Instant::now();
            match Arc::clone(&instance)
                .execute_stream(request.body.clone(), Arc::clone(&ctx))
                .await
            {
                Ok(stream) => {
                    // The stream opened; the provider accepted the request.
                    self.tracker.record_success(&instance, attempt_start.elapsed());
                    let moved_permit = permit;
                    return Ok(Box::pin(stream.map(move |chunk| {
                        let _permit = &moved_permit;
                        chunk
                    })));
                }
                Err(error) => {
                    if matches!(error, GatewayError::Cancelled) {
                        self.tracker.abandon(instance.id());
                        return Err(error);
                    }
                    self.tracker.record_failure(&instance, attempt_start.elapsed());
                    match self.policy.decide(&error, retry_count) {
                        RecoveryAction::RetrySame => {
                            retry_count += 1;
                            let delay = error
                                .retry_after()
                                .unwrap_or_else(|| self.backoff.delay_for_attempt(retry_count - 1));
                            last_error = Some(error);
                            retrying = Some(Arc::clone(&instance));
                            if !delay.is_zero() {
                                tokio::select! {
                                    _ = ctx.cancelled() => return Err(GatewayError::Cancelled),
                                    _ = tokio::time::sleep(delay) => {}
                                }
                            }
                        }
                        RecoveryAction::Failover => {
                            excluded.insert(instance.id().to_string());
                            last_error = Some(error);
                        }
                        RecoveryAction::BlacklistAndFailover { duration } => {
                            self.blacklist
                                .add(instance.id(), error.code(), Some(duration));
                            excluded.insert(instance.id().to_string());
                            last_error = Some(error);
                        }
                        RecoveryAction::Abort => return Err(error),
                    }
                }
            }
        }
    }

    fn result_for_error(ctx: &ExecutionContext, error: GatewayError) -> ExecutionResult {
        let status = match &error {
            GatewayError::Cancelled => ExecutionStatus::Cancelled,
            GatewayError::Timeout => ExecutionStatus::Timeout,
            _ => ExecutionStatus::Failed,
        };
        tracing::warn!(
            execution_id = %ctx.execution_id,
            code = error.code(),
            "request failed"
        );
        ExecutionResult {
            execution_id: ctx.execution_id.clone(),
            status,
            duration_ms: ctx.elapsed().as_millis() as u64,
            body: None,
            error: Some(ErrorHandlerCenter::error_response(&error)),
        }
    }

    fn publish_stage_events(&self, ctx: &ExecutionContext) {
        if self.events.is_none() {
            return;
        }
        for record in ctx.io_records() {
            emit(
                &self.events,
                GatewayEvent::StageComplete {
                    execution_id: ctx.execution_id.clone(),
                    stage: record.stage,
                    ok: record.status == crate::context::StageStatus::Ok,
                },
            );
        }
    }
}

impl std::fmt::Debug for VmScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmScheduler")
            .field("virtual_model", &self.virtual_model)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl Drop for VmScheduler {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
