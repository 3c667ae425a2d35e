//! Pipeline instances.
//!
//! A [`PipelineInstance`] binds one [`PipelineConfig`] to constructed stage
//! modules — the runtime unit the load balancer picks between. Instances are
//! owned exclusively by their virtual-model scheduler and never shared
//! across virtual models.

use crate::config::Target;
use crate::context::ExecutionContext;
use crate::envelope::ChunkStream;
use crate::error::Result;
use crate::executor;
use crate::stage::Stage;
use crate::stages::provider::ProviderClient;
use crate::stages::{
    Compatibility, LlmSwitch, ProviderStage, Workflow, WorkflowConfig,
};
use crate::table::PipelineConfig;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Reported state of an instance.
///
/// Derived, not stored: `Unhealthy` comes from the circuit breaker and
/// `Blacklisted` from the blacklist; the executor itself never moves an
/// instance between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    /// Healthy with no requests in flight.
    Idle,
    /// Healthy and serving at least one request.
    Busy,
    /// Excluded by the circuit breaker.
    Unhealthy,
    /// Excluded by the blacklist.
    Blacklisted,
}

/// EWMA weight applied to each new latency observation.
const LATENCY_ALPHA: f64 = 0.2;

/// Lock-free per-instance counters.
///
/// Mutated by the health tracker and the in-flight guard; read by the load
/// balancer and metrics snapshots. All accesses are relaxed — these are
/// statistics, not synchronization points.
#[derive(Debug, Default)]
pub struct InstanceStats {
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    consecutive_failures: AtomicU32,
    current_in_flight: AtomicU32,
    avg_latency_us: AtomicU64,
    last_used_at_ms: AtomicU64,
}

impl InstanceStats {
    /// Record a successful execution.
    pub fn record_success(&self, latency: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.update_latency(latency);
    }

    /// Record a failed execution.
    pub fn record_failure(&self, latency: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        self.update_latency(latency);
    }

    fn update_latency(&self, latency: Duration) {
        let sample = latency.as_micros() as u64;
        let old = self.avg_latency_us.load(Ordering::Relaxed);
        let new = if old == 0 {
            sample
        } else {
            (old as f64 * (1.0 - LATENCY_ALPHA) + sample as f64 * LATENCY_ALPHA) as u64
        };
        self.avg_latency_us.store(new, Ordering::Relaxed);
    }

    /// Requests currently executing on this instance.
    pub fn current_in_flight(&self) -> u32 {
        self.current_in_flight.load(Ordering::Relaxed)
    }

    /// Consecutive failures since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Smoothed average latency.
    pub fn avg_latency(&self) -> Duration {
        Duration::from_micros(self.avg_latency_us.load(Ordering::Relaxed))
    }

    /// Total completed requests.
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Total successes.
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Total failures.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// Serializable point-in-time view of [`InstanceStats`].
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatsSnapshot {
    /// Total completed requests.
    pub requests: u64,
    /// Total successes.
    pub successes: u64,
    /// Total failures.
    pub failures: u64,
    /// Consecutive failures since the last success.
    pub consecutive_failures: u32,
    /// Requests currently executing.
    pub current_in_flight: u32,
    /// Smoothed average latency in milliseconds.
    pub avg_latency_ms: u64,
}

/// Decrements the in-flight counter when an execution ends, however it ends.
struct InFlightGuard<'a>(&'a InstanceStats);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.current_in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Owned variant of the guard for streams, which outlive the call that
/// opened them.
struct OwnedInFlightGuard(Arc<PipelineInstance>);

impl Drop for OwnedInFlightGuard {
    fn drop(&mut self) {
        self.0.stats.current_in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// One wired pipeline: four stages bound to a single target.
pub struct PipelineInstance {
    config: PipelineConfig,
    llm_switch: LlmSwitch,
    workflow: Workflow,
    compatibility: Compatibility,
    provider: ProviderStage,
    stats: InstanceStats,
    created_at: Instant,
}

impl PipelineInstance {
    /// Build an instance with a real HTTP provider client.
    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        let provider = ProviderStage::from_config(
            &config.provider,
            &config.target,
            config.stages.provider.timeout,
        )?;
        Self::assemble(config, provider)
    }

    /// Build an instance around an injected provider client.
    pub fn with_provider_client(
        config: PipelineConfig,
        client: Arc<dyn ProviderClient>,
    ) -> Result<Self> {
        let provider = ProviderStage::with_client(config.stages.provider.clone(), client);
        Self::assemble(config, provider)
    }

    fn assemble(config: PipelineConfig, provider: ProviderStage) -> Result<Self> {
        Ok(Self {
            llm_switch: LlmSwitch::new(config.stages.llm_switch.clone())?,
            workflow: Workflow::new(config.stages.workflow.clone())?,
            compatibility: Compatibility::new(config.stages.compatibility.clone())?,
            provider,
            stats: InstanceStats::default(),
            created_at: Instant::now(),
            config,
        })
    }

    /// The instance id (same as the pipeline id — one instance per config).
    pub fn id(&self) -> &str {
        &self.config.pipeline_id
    }

    /// The immutable pipeline configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// The routed target.
    pub fn target(&self) -> &Target {
        &self.config.target
    }

    /// Load-balancing weight.
    pub fn weight(&self) -> u32 {
        self.config.target.weight
    }

    /// Live counters.
    pub fn stats(&self) -> &InstanceStats {
        &self.stats
    }

    /// The workflow tuning for this instance.
    pub fn workflow_config(&self) -> &WorkflowConfig {
        self.workflow.config()
    }

    /// The provider stage (streaming path needs direct access).
    pub(crate) fn provider(&self) -> &ProviderStage {
        &self.provider
    }

    /// The four stages in forward order.
    pub(crate) fn stages(&self) -> [&dyn Stage; 4] {
        [
            &self.llm_switch,
            &self.workflow,
            &self.compatibility,
            &self.provider,
        ]
    }

    /// Report the instance state given exclusion inputs from the owner.
    pub fn state(&self, circuit_open: bool, blacklisted: bool) -> InstanceState {
        if blacklisted {
            InstanceState::Blacklisted
        } else if circuit_open {
            InstanceState::Unhealthy
        } else if self.stats.current_in_flight() > 0 {
            InstanceState::Busy
        } else {
            InstanceState::Idle
        }
    }

    /// Serializable stats snapshot.
    pub fn stats_snapshot(&self) -> InstanceStatsSnapshot {
        InstanceStatsSnapshot {
            requests: self.stats.requests(),
            successes: self.stats.successes(),
            failures: self.stats.failures(),
            consecutive_failures: self.stats.consecutive_failures(),
            current_in_flight: self.stats.current_in_flight(),
            avg_latency_ms: self.stats.avg_latency().as_millis() as u64,
        }
    }

    fn mark_started(&self) {
        self.stats.current_in_flight.fetch_add(1, Ordering::Relaxed);
        self.stats.last_used_at_ms.store(
            self.created_at.elapsed().as_millis() as u64,
            Ordering::Relaxed,
        );
    }

    fn touch(&self) -> InFlightGuard<'_> {
        self.mark_started();
        InFlightGuard(&self.stats)
    }

    /// Run one request through the four stages and back.
    pub async fn execute(&self, request: Value, ctx: &ExecutionContext) -> Result<Value> {
        let _guard = self.touch();
        executor::execute(self, request, ctx).await
    }

    /// Run one streaming request; chunks flow through the reverse stages.
    ///
    /// The instance counts as in-flight until the returned stream is
    /// dropped, not just until it opens.
    pub async fn execute_stream(
        self: Arc<Self>,
        request: Value,
        ctx: Arc<ExecutionContext>,
    ) -> Result<ChunkStream> {
        self.mark_started();
        let guard = OwnedInFlightGuard(Arc::clone(&self));
        let stream = executor::execute_stream(self, request, ctx).await?;
        Ok(Box::pin(futures::StreamExt::map(stream, move |chunk| {
            let _guard = &guard;
            chunk
        })))
    }
}

impl std::fmt::Debug for PipelineInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineInstance")
            .field("id", &self.config.pipeline_id)
            .field("in_flight", &self.stats.current_in_flight())
            .finish()
    }
}
