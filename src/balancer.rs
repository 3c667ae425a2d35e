//! Load-balancing strategies over healthy instances.
//!
//! The strategy is fixed at startup. `pick` receives the already-filtered
//! healthy set (never a blacklisted or circuit-open instance) in stable
//! config order, which doubles as the deterministic tiebreak everywhere.
//! Mutable cursor state sits behind one short mutex; the critical section
//! is O(set size) at worst.

use crate::config::BalancerStrategy;
use crate::instance::PipelineInstance;
use std::sync::{Arc, Mutex};

/// Picks one instance per request under the configured strategy.
#[derive(Debug)]
pub struct LoadBalancer {
    strategy: BalancerStrategy,
    state: Mutex<BalancerState>,
}

#[derive(Debug, Default)]
struct BalancerState {
    /// Round-robin cursor.
    cursor: usize,
    /// Smooth-WRR accumulators, parallel to the signature.
    current_weights: Vec<i64>,
    /// Instance ids the accumulators were built for. A healthy-set change
    /// (health flap, failover exclusion) resets the accumulators.
    signature: Vec<String>,
    total_weight: i64,
}

impl LoadBalancer {
    /// Create a balancer with the given strategy.
    pub fn new(strategy: BalancerStrategy) -> Self {
        Self {
            strategy,
            state: Mutex::new(BalancerState::default()),
        }
    }

    /// The configured strategy.
    pub fn strategy(&self) -> BalancerStrategy {
        self.strategy
    }

    /// Pick an instance from the healthy set.
    ///
    /// Returns `None` iff the set is empty.
    pub fn pick(&self, healthy: &[Arc<PipelineInstance>]) -> Option<Arc<PipelineInstance>> {
        if healthy.is_empty() {
            return None;
        }
        let index = match self.strategy {
            BalancerStrategy::RoundRobin => self.next_round_robin(healthy.len()),
            BalancerStrategy::Weighted => self.next_weighted(healthy),
            BalancerStrategy::LeastConnections => Self::least_connections(healthy),
            BalancerStrategy::Random => fastrand::usize(..healthy.len()),
        };
        Some(Arc::clone(&healthy[index]))
    }

    fn next_round_robin(&self, len: usize) -> usize {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let index = state.cursor % len;
        state.cursor = state.cursor.wrapping_add(1);
        index
    }

    /// Smooth weighted round-robin: every pick adds each instance's weight
    /// to its accumulator, takes the largest, and subtracts the total. Over
    /// any window the pick ratio converges on the weight ratio without
    /// bursts.
    fn next_weighted(&self, healthy: &[Arc<PipelineInstance>]) -> usize {
        let total_weight: i64 = healthy.iter().map(|i| i.weight() as i64).sum();
        if total_weight == 0 {
            // All-zero weights degrade to round-robin.
            return self.next_round_robin(healthy.len());
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let signature_changed = state.signature.len() != healthy.len()
            || state.total_weight != total_weight
            || state
                .signature
                .iter()
                .zip(healthy)
                .any(|(id, instance)| id != instance.id());
        if signature_changed {
            state.current_weights = vec![0; healthy.len()];
            state.signature = healthy.iter().map(|i| i.id().to_string()).collect();
            state.total_weight = total_weight;
        }

        let mut best = 0usize;
        let mut best_value = i64::MIN;
        for (i, instance) in healthy.iter().enumerate() {
            state.current_weights[i] += instance.weight() as i64;
            if state.current_weights[i] > best_value {
                best_value = state.current_weights[i];
                best = i;
            }
        }
        state.current_weights[best] -= total_weight;
        best
    }

    /// Fewest in-flight requests; ties break by lower smoothed latency,
    /// then stable order.
    fn least_connections(healthy: &[Arc<PipelineInstance>]) -> usize {
        let mut best = 0usize;
        for (i, instance) in healthy.iter().enumerate().skip(1) {
            let (best_inflight, best_latency) = {
                let stats = healthy[best].stats();
                (stats.current_in_flight(), stats.avg_latency())
            };
            let stats = instance.stats();
            let inflight = stats.current_in_flight();
            if inflight < best_inflight
                || (inflight == best_inflight && stats.avg_latency() < best_latency)
            {
                best = i;
            }
        }
        best
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
    use std::time::Duration;

    fn make_instance(id: &str, weight: u32) -> Arc<PipelineInstance> {
        let config = PipelineConfig {
            pipeline_id: id.to_string(),
            virtual_model: "vm".into(),
            target: Target {
                provider_id: "p".into(),
                model_id: "m".into(),
                key_index: 0,
                weight,
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

    #[test]
    fn test_empty_set_returns_none() {
        let lb = LoadBalancer::new(BalancerStrategy::RoundRobin);
        assert!(lb.pick(&[]).is_none());
    }

    #[test]
    fn test_round_robin_fairness() {
        let lb = LoadBalancer::new(BalancerStrategy::RoundRobin);
        let set = vec![
            make_instance("a", 1),
            make_instance("b", 1),
            make_instance("c", 1),
        ];
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..30 {
            let picked = lb.pick(&set).unwrap();
            *counts.entry(picked.id().to_string()).or_default() += 1;
        }
        // Exactly k picks each over a window of k*N.
        assert_eq!(counts["a"], 10);
        assert_eq!(counts["b"], 10);
        assert_eq!(counts["c"], 10);
    }

    #[test]
    fn test_weighted_ratio_within_one() {
        let lb = LoadBalancer::new(BalancerStrategy::Weighted);
        let set = vec![make_instance("a", 70), make_instance("b", 30)];
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..100 {
            let picked = lb.pick(&set).unwrap();
            *counts.entry(picked.id().to_string()).or_default() += 1;
        }
        assert!((counts["a"] as i64 - 70).abs() <= 1, "a got {}", counts["a"]);
        assert!((counts["b"] as i64 - 30).abs() <= 1, "b got {}", counts["b"]);
    }

    #[test]
    fn test_weighted_resets_on_set_change() {
        let lb = LoadBalancer::new(BalancerStrategy::Weighted);
        let a = make_instance("a", 2);
        let b = make_instance("b", 1);
        let full = vec![Arc::clone(&a), Arc::clone(&b)];
        lb.pick(&full).unwrap();

        // Shrinking the healthy set must not leave stale accumulators.
        let only_b = vec![Arc::clone(&b)];
        assert_eq!(lb.pick(&only_b).unwrap().id(), "b");

        // And growing back still works.
        assert!(lb.pick(&full).is_some());
    }

    #[test]
    fn test_weighted_all_zero_degrades_to_round_robin() {
        let lb = LoadBalancer::new(BalancerStrategy::Weighted);
        let set = vec![make_instance("a", 0), make_instance("b", 0)];
        let first = lb.pick(&set).unwrap().id().to_string();
        let second = lb.pick(&set).unwrap().id().to_string();
        assert_ne!(first, second);
    }

    #[test]
    fn test_least_connections_prefers_idle() {
        let lb = LoadBalancer::new(BalancerStrategy::LeastConnections);
        let a = make_instance("a", 1);
        let b = make_instance("b", 1);

        // Simulate load on `a`.
        a.stats().record_success(Duration::from_millis(10));
        let set = vec![Arc::clone(&a), Arc::clone(&b)];
        // Both idle: stable order wins (a first). Tie on in-flight, but `a`
        // has recorded latency while `b` is at zero.
        let picked = lb.pick(&set).unwrap();
        assert_eq!(picked.id(), "b");
    }

    #[test]
    fn test_random_covers_set() {
        let lb = LoadBalancer::new(BalancerStrategy::Random);
        let set = vec![make_instance("a", 1), make_instance("b", 1)];
        let mut seen: HashMap<String, usize> = HashMap::new();
        for _ in 0..200 {
            let picked = lb.pick(&set).unwrap();
            *seen.entry(picked.id().to_string()).or_default() += 1;
        }
        assert!(seen.contains_key("a"));
        assert!(seen.contains_key("b"));
    }
}
