//! Startup configuration model.
//!
//! These structs are the parsed form of the gateway's configuration surface:
//! providers, virtual models, and scheduler tuning. Reading them from disk
//! (YAML/TOML/env) is the embedding binary's job; the core only consumes the
//! deserialized values and validates them while building the
//! [`PipelineTable`](crate::table::PipelineTable).

use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

/// Opaque identifier clients use to select a virtual model.
pub type VirtualModelId = String;

/// How a provider authenticates outbound calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthKind {
    /// Static key sent as a bearer/header credential.
    ApiKey,
    /// Token endpoint exchange with cached, refreshed access tokens.
    Oauth2,
    /// Provider-specific scheme handled by the provider client.
    Custom,
}

/// Credential configuration for one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// The authentication scheme.
    pub kind: AuthKind,
    /// Ordered credential list; targets address into it by `key_index`.
    #[serde(default)]
    pub keys: Vec<String>,
}

/// Per-model metadata under a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Context window in tokens.
    pub context_length: u32,
    /// Maximum completion tokens.
    pub max_tokens: u32,
    /// Capability tags, e.g. `"streaming"`, `"tools"`, `"vision"`.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
}

impl ModelInfo {
    /// Whether this model carries the given capability tag.
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}

/// One concrete provider endpoint and its models.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Unique provider id, referenced by targets.
    pub provider_id: String,
    /// Wire protocol family: `"openai"`, `"anthropic"`, `"qwen"`, `"gemini"`.
    pub provider_type: String,
    /// Base endpoint URL.
    pub endpoint: String,
    /// Credential configuration.
    pub auth: AuthConfig,
    /// Models served by this provider, keyed by model id.
    #[serde(default)]
    pub models: HashMap<String, ModelInfo>,
}

impl ProviderConfig {
    /// Validate internal consistency. Called during table build.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(GatewayError::StageConfigInvalid(format!(
                "provider '{}' has an empty endpoint",
                self.provider_id
            )));
        }
        if matches!(self.auth.kind, AuthKind::ApiKey | AuthKind::Oauth2) && self.auth.keys.is_empty()
        {
            return Err(GatewayError::StageConfigInvalid(format!(
                "provider '{}' uses {:?} auth but configures no keys",
                self.provider_id, self.auth.kind
            )));
        }
        Ok(())
    }
}

/// A routable `(provider, model, key)` triple inside a virtual model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Provider id this target routes to.
    pub provider_id: String,
    /// Model id on that provider.
    pub model_id: String,
    /// Index into the provider's credential list.
    #[serde(default)]
    pub key_index: usize,
    /// Relative weight for weighted balancing. Zero-weight targets are valid
    /// but never preferred by the weighted strategy.
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Disabled targets are skipped at table build.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_weight() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

/// A logical model alias fanning out to one or more targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualModelConfig {
    /// The id clients route by.
    pub id: VirtualModelId,
    /// Disabled virtual models are skipped entirely at table build.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Relative priority among virtual models (informational).
    #[serde(default)]
    pub priority: u32,
    /// Ordered target list; order is the deterministic tiebreak.
    pub targets: Vec<Target>,
    /// Capability tags advertised by this alias.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
}

impl VirtualModelConfig {
    /// Targets that are enabled, in declared order.
    pub fn enabled_targets(&self) -> impl Iterator<Item = &Target> {
        self.targets.iter().filter(|t| t.enabled)
    }
}

/// Load-balancing strategy, fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BalancerStrategy {
    /// Cursor mod N over the healthy set.
    #[default]
    RoundRobin,
    /// Smooth weighted round-robin over target weights.
    Weighted,
    /// Fewest in-flight requests, latency tiebreak.
    LeastConnections,
    /// Uniform random over the healthy set.
    Random,
}

/// Circuit-breaker tuning, per instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures within the rolling window that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long an open circuit waits before admitting a half-open probe.
    #[serde(default = "default_recovery_time_ms")]
    pub recovery_time_ms: u64,
    /// Minimum observations in the window before Open is possible.
    #[serde(default = "default_volume_threshold")]
    pub request_volume_threshold: u32,
    /// Width of the rolling observation window.
    #[serde(default = "default_rolling_window_ms")]
    pub rolling_window_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_recovery_time_ms() -> u64 {
    30_000
}
fn default_volume_threshold() -> u32 {
    1
}
fn default_rolling_window_ms() -> u64 {
    60_000
}

impl CircuitBreakerConfig {
    /// Recovery time as a [`Duration`].
    pub fn recovery_time(&self) -> Duration {
        Duration::from_millis(self.recovery_time_ms)
    }

    /// Rolling window as a [`Duration`].
    pub fn rolling_window(&self) -> Duration {
        Duration::from_millis(self.rolling_window_ms)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_time_ms: default_recovery_time_ms(),
            request_volume_threshold: default_volume_threshold(),
            rolling_window_ms: default_rolling_window_ms(),
        }
    }
}

/// Load balancer + health tuning shared by all virtual models.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerConfig {
    /// Selection strategy.
    #[serde(default)]
    pub strategy: BalancerStrategy,
    /// Interval of the periodic health tick (rolls idle observation
    /// windows, reclaims orphaned half-open probes).
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    /// Circuit-breaker parameters applied per instance.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

fn default_health_check_interval_ms() -> u64 {
    30_000
}

impl LoadBalancerConfig {
    /// Health tick interval as a [`Duration`].
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            strategy: BalancerStrategy::default(),
            health_check_interval_ms: default_health_check_interval_ms(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Scheduler-wide tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Same-instance retry budget per request.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Hard per-request deadline.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Per-VM concurrency cap; overflow is rejected, never queued.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,
    /// Load-balancer and circuit-breaker tuning.
    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,
    /// Interval of the blacklist expiry sweep.
    #[serde(default = "default_sweep_interval_ms")]
    pub blacklist_sweep_interval_ms: u64,
}

fn default_max_retries() -> u32 {
    2
}
fn default_timeout_ms() -> u64 {
    120_000
}
fn default_max_concurrent() -> usize {
    256
}
fn default_sweep_interval_ms() -> u64 {
    5_000
}

impl SchedulerConfig {
    /// Per-request deadline as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Blacklist sweep interval as a [`Duration`].
    pub fn blacklist_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.blacklist_sweep_interval_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            default_timeout_ms: default_timeout_ms(),
            max_concurrent_requests: default_max_concurrent(),
            load_balancer: LoadBalancerConfig::default(),
            blacklist_sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

/// The full parsed configuration consumed at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Providers keyed by id.
    pub providers: HashMap<String, ProviderConfig>,
    /// Virtual model definitions.
    pub virtual_models: Vec<VirtualModelConfig>,
    /// Scheduler tuning.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Protocol family the shim delivers inbound bodies in.
    #[serde(default = "default_client_protocol")]
    pub client_protocol: String,
}

fn default_client_protocol() -> String {
    "openai".to_string()
}
