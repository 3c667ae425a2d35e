//! Per-instance health tracking and circuit breaking.
//!
//! The tracker owns every circuit breaker for one virtual model and is the
//! only writer of instance health counters. State machine per instance:
//!
//! ```text
//! Closed ──(consecutive failures ≥ threshold within window)──► Open
//! Open ──(recovery time elapsed)──► HalfOpen (one probe admitted)
//! HalfOpen ──(probe succeeds)──► Closed
//! HalfOpen ──(probe fails)──► Open
//! ```
//!
//! Reads on the pick path take the per-instance mutex for at most a state
//! check and a possible single transition; nothing here blocks on I/O.

use crate::config::CircuitBreakerConfig;
use crate::events::{emit, EventHandler, GatewayEvent};
use crate::instance::PipelineInstance;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitState {
    /// Traffic flows normally.
    Closed,
    /// Instance is out of rotation.
    Open,
    /// One probe request is allowed through.
    HalfOpen,
}

/// Health snapshot for one instance.
#[derive(Debug, Clone, Serialize)]
pub struct HealthMetrics {
    /// Whether the instance is currently eligible for traffic.
    pub is_healthy: bool,
    /// Failures / requests over the instance lifetime.
    pub error_rate: f64,
    /// Smoothed average response time.
    pub avg_response_time_ms: u64,
    /// Milliseconds since the epoch of this snapshot.
    pub last_check_ms: u64,
    /// Current circuit state.
    pub circuit_state: CircuitState,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// True while the single half-open probe is outstanding.
    probe_in_flight: bool,
    /// When the outstanding probe was admitted; the health tick reclaims
    /// probes that never report back (cancelled requests).
    probe_started_at: Option<Instant>,
    window_start: Instant,
    window_observations: u32,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
            probe_started_at: None,
            window_start: Instant::now(),
            window_observations: 0,
        }
    }

    fn clear_probe(&mut self) {
        self.probe_in_flight = false;
        self.probe_started_at = None;
    }

    fn roll_window(&mut self, window: Duration) {
        if self.window_start.elapsed() > window {
            self.window_start = Instant::now();
            self.window_observations = 0;
            self.consecutive_failures = 0;
        }
    }
}

/// Health tracker for one virtual model's instances.
pub struct HealthTracker {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Mutex<BreakerInner>>,
    events: Option<Arc<dyn EventHandler>>,
}

impl HealthTracker {
    /// Create a tracker with the given breaker tuning.
    pub fn new(config: CircuitBreakerConfig, events: Option<Arc<dyn EventHandler>>) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
            events,
        }
    }

    /// Start tracking an instance.
    pub fn register(&self, instance_id: &str) {
        self.breakers
            .entry(instance_id.to_string())
            .or_insert_with(|| Mutex::new(BreakerInner::new()));
    }

    /// Stop tracking an instance.
    pub fn unregister(&self, instance_id: &str) {
        self.breakers.remove(instance_id);
    }

    /// Record a successful execution.
    pub fn record_success(&self, instance: &PipelineInstance, latency: Duration) {
        instance.stats().record_success(latency);
        self.with_breaker(instance.id(), |inner| {
            inner.roll_window(self.config.rolling_window());
            inner.window_observations += 1;
            inner.consecutive_failures = 0;
            match inner.state {
                CircuitState::HalfOpen => {
                    inner.clear_probe();
                    inner.opened_at = None;
                    self.transition(instance.id(), inner, CircuitState::Closed);
                }
                CircuitState::Open | CircuitState::Closed => {}
            }
        });
    }

    /// Record a failed execution.
    ///
    /// Cancellations never reach here — the scheduler filters them out
    /// before consulting the tracker.
    pub fn record_failure(&self, instance: &PipelineInstance, latency: Duration) {
        instance.stats().record_failure(latency);
        self.with_breaker(instance.id(), |inner| {
            inner.roll_window(self.config.rolling_window());
            inner.window_observations += 1;
            inner.consecutive_failures += 1;
            match inner.state {
                CircuitState::HalfOpen => {
                    // The probe failed; back to Open for a fresh window.
                    inner.clear_probe();
                    inner.opened_at = Some(Instant::now());
                    self.transition(instance.id(), inner, CircuitState::Open);
                }
                CircuitState::Closed => {
                    if inner.consecutive_failures >= self.config.failure_threshold
                        && inner.window_observations >= self.config.request_volume_threshold
                    {
                        inner.opened_at = Some(Instant::now());
                        self.transition(instance.id(), inner, CircuitState::Open);
                    }
                }
                CircuitState::Open => {}
            }
        });
    }

    /// Read-only eligibility check for building the healthy set.
    ///
    /// Never transitions state or claims the half-open probe slot — that
    /// happens in [`try_acquire`](Self::try_acquire) once the balancer has
    /// actually picked the instance.
    pub fn is_eligible(&self, instance_id: &str) -> bool {
        self.with_breaker(instance_id, |inner| match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => inner
                .opened_at
                .map(|t| t.elapsed() >= self.config.recovery_time())
                .unwrap_or(true),
            CircuitState::HalfOpen => !inner.probe_in_flight,
        })
        .unwrap_or(true)
    }

    /// Claim the right to send one request to the instance.
    ///
    /// An Open breaker whose recovery time has elapsed moves to HalfOpen
    /// and admits exactly one probe; concurrent callers see `false` until
    /// the probe resolves.
    pub fn try_acquire(&self, instance_id: &str) -> bool {
        self.with_breaker(instance_id, |inner| match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed_enough = inner
                    .opened_at
                    .map(|t| t.elapsed() >= self.config.recovery_time())
                    .unwrap_or(true);
                if elapsed_enough {
                    self.transition(instance_id, inner, CircuitState::HalfOpen);
                    inner.probe_in_flight = true;
                    inner.probe_started_at = Some(Instant::now());
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    inner.probe_started_at = Some(Instant::now());
                    true
                }
            }
        })
        .unwrap_or(true)
    }

    /// Release a claimed probe that produced no outcome.
    ///
    /// Called by the scheduler when an attempt ends without a verdict
    /// (client cancellation); without this the single half-open probe slot
    /// would stay occupied forever.
    pub fn abandon(&self, instance_id: &str) {
        self.with_breaker(instance_id, |inner| {
            if inner.state == CircuitState::HalfOpen && inner.probe_in_flight {
                inner.clear_probe();
            }
        });
    }

    /// Periodic health maintenance, driven by the scheduler at the
    /// configured `health_check_interval`.
    ///
    /// Keeps observation windows current on idle instances and reclaims
    /// half-open probes that have been outstanding longer than the recovery
    /// time (a cancelled probe request never reports an outcome).
    pub fn tick(&self) {
        for entry in self.breakers.iter() {
            let mut inner = entry.value().lock().unwrap_or_else(|e| e.into_inner());
            inner.roll_window(self.config.rolling_window());
            if inner.state == CircuitState::HalfOpen
                && inner.probe_in_flight
                && inner
                    .probe_started_at
                    .is_some_and(|t| t.elapsed() >= self.config.recovery_time())
            {
                tracing::warn!(instance = %entry.key(), "reclaiming stalled half-open probe");
                inner.clear_probe();
            }
        }
    }

    /// Spawn the periodic health tick; stops when the token cancels.
    ///
    /// No-op outside a tokio runtime, like the blacklist sweeper.
    pub fn spawn_ticker(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let tracker = self;
        handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => tracker.tick(),
                }
            }
        });
    }

    /// Current circuit state of an instance.
    pub fn circuit_state(&self, instance_id: &str) -> CircuitState {
        self.with_breaker(instance_id, |inner| inner.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Health snapshot for an instance.
    pub fn metrics(&self, instance: &PipelineInstance) -> HealthMetrics {
        let stats = instance.stats();
        let requests = stats.requests();
        let state = self.circuit_state(instance.id());
        HealthMetrics {
            is_healthy: state != CircuitState::Open,
            error_rate: if requests == 0 {
                0.0
            } else {
                stats.failures() as f64 / requests as f64
            },
            avg_response_time_ms: stats.avg_latency().as_millis() as u64,
            last_check_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            circuit_state: state,
        }
    }

    fn with_breaker<T>(&self, instance_id: &str, f: impl FnOnce(&mut BreakerInner) -> T) -> Option<T> {
        self.breakers.get(instance_id).map(|cell| {
            let mut inner = cell.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut inner)
        })
    }

    fn transition(&self, instance_id: &str, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        tracing::info!(instance = instance_id, ?from, ?to, "circuit transition");
        emit(
            &self.events,
            GatewayEvent::CircuitTransition {
                instance_id: instance_id.to_string(),
                from,
                to,
            },
        );
    }
}

impl std::fmt::Debug for HealthTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthTracker")
            .field("instances", &self.breakers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, AuthKind, ProviderConfig, Target};
    use crate::stages::llm_switch::{LlmSwitchConfig, Protocol};
    use crate::stages::provider::{MockProviderClient, ProviderStageConfig};
    use crate::stages::workflow::WorkflowConfig;
    use crate::stages::CompatibilityConfig;
    use crate::table::{PipelineConfig, StageConfigSet};
    use serde_json::json;
    use std::collections::HashMap;

    fn make_instance(id: &str) -> Arc<PipelineInstance> {
        let config = PipelineConfig {
            pipeline_id: id.to_string(),
            virtual_model: "vm".into(),
            target: Target {
                provider_id: "p".into(),
                model_id: "m".into(),
                key_index: 0,
                weight: 1,
                enabled: true,
            },
            provider: ProviderConfig {
                provider_id: "p".into(),
                provider_type: "openai".into(),
                endpoint: "https://p.example.com".into(),
                auth: AuthConfig {
                    kind: AuthKind::ApiKey,
                    keys: vec!["k".into()],
                },
                models: HashMap::new(),
            },
            stages: StageConfigSet {
                llm_switch: LlmSwitchConfig::passthrough(Protocol::OpenaiChat),
                workflow: WorkflowConfig::default(),
                compatibility: CompatibilityConfig {
                    provider_type: "openai".into(),
                },
                provider: ProviderStageConfig {
                    provider_id: "p".into(),
                    provider_type: "openai".into(),
                    model_id: "m".into(),
                    key_index: 0,
                    timeout: Duration::from_secs(5),
                },
            },
        };
        let client = Arc::new(MockProviderClient::always(json!({})));
        Arc::new(PipelineInstance::with_provider_client(config, client).unwrap())
    }

    fn tracker(threshold: u32, recovery_ms: u64) -> HealthTracker {
        HealthTracker::new(
            CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_time_ms: recovery_ms,
                request_volume_threshold: 1,
                rolling_window_ms: 60_000,
            },
            None,
        )
    }

    #[test]
    fn test_opens_after_threshold() {
        let t = tracker(3, 5_000);
        let i = make_instance("a");
        t.register(i.id());

        for _ in 0..2 {
            t.record_failure(&i, Duration::from_millis(5));
            assert_eq!(t.circuit_state(i.id()), CircuitState::Closed);
        }
        t.record_failure(&i, Duration::from_millis(5));
        assert_eq!(t.circuit_state(i.id()), CircuitState::Open);
        assert!(!t.try_acquire(i.id()));
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let t = tracker(3, 5_000);
        let i = make_instance("a");
        t.register(i.id());

        t.record_failure(&i, Duration::from_millis(5));
        t.record_failure(&i, Duration::from_millis(5));
        t.record_success(&i, Duration::from_millis(5));
        t.record_failure(&i, Duration::from_millis(5));
        t.record_failure(&i, Duration::from_millis(5));
        assert_eq!(t.circuit_state(i.id()), CircuitState::Closed);
    }

    #[test]
    fn test_volume_threshold_gates_opening() {
        let t = HealthTracker::new(
            CircuitBreakerConfig {
                failure_threshold: 2,
                recovery_time_ms: 5_000,
                request_volume_threshold: 5,
                rolling_window_ms: 60_000,
            },
            None,
        );
        let i = make_instance("a");
        t.register(i.id());

        t.record_failure(&i, Duration::from_millis(5));
        t.record_failure(&i, Duration::from_millis(5));
        // Threshold met but not enough observations in the window.
        assert_eq!(t.circuit_state(i.id()), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_single_probe_then_close() {
        let t = tracker(1, 20);
        let i = make_instance("a");
        t.register(i.id());

        t.record_failure(&i, Duration::from_millis(5));
        assert_eq!(t.circuit_state(i.id()), CircuitState::Open);
        assert!(!t.try_acquire(i.id()));

        tokio::time::sleep(Duration::from_millis(30)).await;

        // Exactly one probe admitted.
        assert!(t.try_acquire(i.id()));
        assert_eq!(t.circuit_state(i.id()), CircuitState::HalfOpen);
        assert!(!t.try_acquire(i.id()));

        t.record_success(&i, Duration::from_millis(5));
        assert_eq!(t.circuit_state(i.id()), CircuitState::Closed);
        assert!(t.try_acquire(i.id()));
    }

    #[tokio::test]
    async fn test_half_open_probe_failure_reopens() {
        let t = tracker(1, 20);
        let i = make_instance("a");
        t.register(i.id());

        t.record_failure(&i, Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(t.try_acquire(i.id()));

        t.record_failure(&i, Duration::from_millis(5));
        assert_eq!(t.circuit_state(i.id()), CircuitState::Open);
        assert!(!t.try_acquire(i.id()));
    }

    #[tokio::test]
    async fn test_abandon_frees_the_probe_slot() {
        let t = tracker(1, 20);
        let i = make_instance("a");
        t.register(i.id());

        t.record_failure(&i, Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(t.try_acquire(i.id()));
        assert!(!t.try_acquire(i.id()));

        // The probe was cancelled and never reported back.
        t.abandon(i.id());
        assert!(t.try_acquire(i.id()));
        assert_eq!(t.circuit_state(i.id()), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_tick_reclaims_stalled_probe() {
        let t = tracker(1, 20);
        let i = make_instance("a");
        t.register(i.id());

        t.record_failure(&i, Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(t.try_acquire(i.id()));
        assert!(!t.is_eligible(i.id()));

        // Too early: the probe may still legitimately be running.
        t.tick();
        assert!(!t.is_eligible(i.id()));

        tokio::time::sleep(Duration::from_millis(30)).await;
        t.tick();
        assert!(t.is_eligible(i.id()));
    }

    #[test]
    fn test_tick_rolls_idle_windows() {
        let t = HealthTracker::new(
            CircuitBreakerConfig {
                failure_threshold: 3,
                recovery_time_ms: 60_000,
                request_volume_threshold: 1,
                rolling_window_ms: 10,
            },
            None,
        );
        let i = make_instance("a");
        t.register(i.id());

        t.record_failure(&i, Duration::from_millis(5));
        t.record_failure(&i, Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(20));
        t.tick();

        // The stale streak rolled away with its window; one more failure
        // does not open the circuit.
        t.record_failure(&i, Duration::from_millis(5));
        assert_eq!(t.circuit_state(i.id()), CircuitState::Closed);
    }

    #[test]
    fn test_unregistered_instance_defaults_healthy() {
        let t = tracker(1, 1_000);
        assert!(t.try_acquire("ghost"));
        assert_eq!(t.circuit_state("ghost"), CircuitState::Closed);
    }

    #[test]
    fn test_metrics_error_rate() {
        let t = tracker(10, 1_000);
        let i = make_instance("a");
        t.register(i.id());
        t.record_success(&i, Duration::from_millis(10));
        t.record_failure(&i, Duration::from_millis(10));

        let m = t.metrics(&i);
        assert!(m.is_healthy);
        assert!((m.error_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(m.circuit_state, CircuitState::Closed);
    }
}
