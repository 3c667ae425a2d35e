//! The pipeline table: config in, routable pipelines out.
//!
//! Built once at startup from the parsed [`GatewayConfig`], then treated as
//! immutable; a reload builds a fresh table and swaps it atomically at the
//! manager level. Lookups never fail — every validation problem is caught
//! here, before traffic flows.

use crate::config::{GatewayConfig, ProviderConfig, Target, VirtualModelId, VirtualModelConfig};
use crate::error::{GatewayError, Result};
use crate::stages::llm_switch::{LlmSwitchConfig, Protocol};
use crate::stages::provider::ProviderStageConfig;
use crate::stages::workflow::WorkflowConfig;
use crate::stages::CompatibilityConfig;
use crate::transform::TransformMode;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Transform cache capacity given to every LLMSwitch stage.
const SWITCH_CACHE_SIZE: usize = 64;

/// The four synthesized stage configurations for one pipeline.
#[derive(Debug, Clone)]
pub struct StageConfigSet {
    /// Protocol remap configuration.
    pub llm_switch: LlmSwitchConfig,
    /// Streaming reconciliation configuration.
    pub workflow: WorkflowConfig,
    /// Provider-quirk configuration.
    pub compatibility: CompatibilityConfig,
    /// Outbound-call configuration.
    pub provider: ProviderStageConfig,
}

/// One immutable (virtual model, target) pipeline definition.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Stable id: `{vm}:{provider}:{model}:{key_index}`.
    pub pipeline_id: String,
    /// Owning virtual model.
    pub virtual_model: VirtualModelId,
    /// The routed target.
    pub target: Target,
    /// Resolved provider definition (credentials included).
    pub provider: ProviderConfig,
    /// Synthesized stage configurations.
    pub stages: StageConfigSet,
}

/// Immutable mapping from virtual-model id to its pipeline configs.
#[derive(Debug, Default)]
pub struct PipelineTable {
    entries: HashMap<VirtualModelId, Vec<PipelineConfig>>,
}

impl PipelineTable {
    /// Build the table from parsed configuration.
    ///
    /// Disabled virtual models and virtual models whose targets are all
    /// disabled are skipped. A virtual model with an empty target list, a
    /// duplicate `(provider, model, key)` triple, or a dangling
    /// provider/model/key reference fails the whole build.
    pub fn build(config: &GatewayConfig) -> Result<Self> {
        let client_protocol = Protocol::from_provider_type(&config.client_protocol)?;
        let timeout = config.scheduler.request_timeout();

        let mut entries = HashMap::new();
        for vm in &config.virtual_models {
            if vm.targets.is_empty() {
                return Err(GatewayError::StageConfigInvalid(format!(
                    "virtual model '{}' declares no targets",
                    vm.id
                )));
            }
            if !vm.enabled {
                tracing::debug!(virtual_model = %vm.id, "skipping disabled virtual model");
                continue;
            }
            let pipelines = Self::build_virtual_model(config, vm, client_protocol, timeout)?;
            if pipelines.is_empty() {
                tracing::warn!(
                    virtual_model = %vm.id,
                    "virtual model has no enabled targets; skipping"
                );
                continue;
            }
            if entries.insert(vm.id.clone(), pipelines).is_some() {
                return Err(GatewayError::StageConfigInvalid(format!(
                    "duplicate virtual model id '{}'",
                    vm.id
                )));
            }
        }
        Ok(Self { entries })
    }

    fn build_virtual_model(
        config: &GatewayConfig,
        vm: &VirtualModelConfig,
        client_protocol: Protocol,
        timeout: Duration,
    ) -> Result<Vec<PipelineConfig>> {
        let mut seen: HashSet<(String, String, usize)> = HashSet::new();
        let mut pipelines = Vec::new();

        for target in vm.enabled_targets() {
            let triple = (
                target.provider_id.clone(),
                target.model_id.clone(),
                target.key_index,
            );
            if !seen.insert(triple) {
                return Err(GatewayError::StageConfigInvalid(format!(
                    "virtual model '{}' lists target {}/{} (key {}) more than once",
                    vm.id, target.provider_id, target.model_id, target.key_index
                )));
            }

            let provider = config.providers.get(&target.provider_id).ok_or_else(|| {
                GatewayError::StageConfigInvalid(format!(
                    "virtual model '{}' references unknown provider '{}'",
                    vm.id, target.provider_id
                ))
            })?;
            provider.validate()?;

            let model = provider.models.get(&target.model_id).ok_or_else(|| {
                GatewayError::StageConfigInvalid(format!(
                    "provider '{}' has no model '{}'",
                    target.provider_id, target.model_id
                ))
            })?;
            if !provider.auth.keys.is_empty() && target.key_index >= provider.auth.keys.len() {
                return Err(GatewayError::StageConfigInvalid(format!(
                    "target {}/{} references key index {} but provider has {} keys",
                    target.provider_id,
                    target.model_id,
                    target.key_index,
                    provider.auth.keys.len()
                )));
            }

            // A model that declares no capabilities is assumed unrestricted.
            let provider_streams =
                model.capabilities.is_empty() || model.supports("streaming");
            let stages = StageConfigSet {
                llm_switch: LlmSwitchConfig {
                    client: client_protocol,
                    provider: Protocol::from_provider_type(&provider.provider_type)?,
                    mode: TransformMode::Lax,
                    cache_size: SWITCH_CACHE_SIZE,
                },
                workflow: WorkflowConfig {
                    provider_streams,
                    provider_stream_only: model.supports("stream-only"),
                    ..WorkflowConfig::default()
                },
                compatibility: CompatibilityConfig {
                    provider_type: provider.provider_type.clone(),
                },
                provider: ProviderStageConfig {
                    provider_id: provider.provider_id.clone(),
                    provider_type: provider.provider_type.clone(),
                    model_id: target.model_id.clone(),
                    key_index: target.key_index,
                    timeout,
                },
            };

            pipelines.push(PipelineConfig {
                pipeline_id: format!(
                    "{}:{}:{}:{}",
                    vm.id, target.provider_id, target.model_id, target.key_index
                ),
                virtual_model: vm.id.clone(),
                target: target.clone(),
                provider: provider.clone(),
                stages,
            });
        }
        Ok(pipelines)
    }

    /// The pipeline configs for a virtual model, in stable target order.
    pub fn lookup(&self, virtual_model: &str) -> Option<&[PipelineConfig]> {
        self.entries.get(virtual_model).map(Vec::as_slice)
    }

    /// Ids of every registered virtual model.
    pub fn virtual_models(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Number of registered virtual models.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
