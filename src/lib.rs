//! # Model Relay
//!
//! A virtual-model request gateway core: clients address a *virtual model*
//! (a logical alias like `gpt-proxy`), and the gateway resolves it to one of
//! several concrete provider targets, runs the request through a fixed
//! four-stage pipeline, and dispatches it with load balancing, health
//! tracking, retries, and failure isolation.
//!
//! The crate is the routing fabric only. HTTP serving, config file parsing,
//! and provider SDKs stay outside; the embedding binary hands in parsed
//! [`GatewayConfig`] and [`GatewayRequest`] values and gets back
//! [`ExecutionResult`]s or chunk streams.
//!
//! ## Core Concepts
//!
//! - **[`SchedulerManager`]** — top-level registry: builds one scheduler per
//!   virtual model, routes requests, owns startup/reload/shutdown.
//! - **[`VmScheduler`]** — per-virtual-model state machine: instances, load
//!   balancer, health tracker, blacklist, retry/failover ladder.
//! - **[`PipelineInstance`]** — four wired stages
//!   (`LLMSwitch → Workflow → Compatibility → Provider`) bound to one
//!   `(provider, model, key)` target; the unit of load balancing.
//! - **[`PipelineTable`]** — the immutable startup artifact mapping virtual
//!   models to pipeline configs.
//! - **[`ErrorHandlerCenter`]** — maps errors to retry / failover /
//!   blacklist / abort decisions.
//!
//! ## Quick Start
//!
//! ```no_run
//! use model_relay::{GatewayConfig, GatewayRequest, SchedulerManager};
//! use serde_json::json;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let raw = std::fs::read_to_string("gateway.json")?;
//!     let config: GatewayConfig = serde_json::from_str(&raw)?;
//!     let manager = SchedulerManager::new(config)?;
//!     manager.start()?;
//!
//!     let request = GatewayRequest::new(
//!         "req-1",
//!         json!({"model": "gpt-proxy", "messages": [{"role": "user", "content": "hi"}]}),
//!     );
//!     let result = manager
//!         .dispatch("gpt-proxy", request, CancellationToken::new())
//!         .await;
//!     println!("{:?}", result.status);
//!
//!     manager.shutdown(std::time::Duration::from_secs(5)).await;
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod balancer;
pub mod blacklist;
pub mod config;
pub mod context;
pub mod envelope;
pub mod error;
pub mod events;
pub mod executor;
pub mod health;
pub mod instance;
pub mod manager;
pub mod policy;
pub mod scheduler;
pub mod sse;
pub mod stage;
pub mod stages;
pub mod table;
pub mod transform;

pub use backoff::RetryBackoff;
pub use blacklist::{Blacklist, BlacklistEntry};
pub use config::{
    AuthKind, BalancerStrategy, CircuitBreakerConfig, GatewayConfig, ProviderConfig,
    SchedulerConfig, Target, VirtualModelConfig, VirtualModelId,
};
pub use context::{ExecutionContext, StageIo, StageStatus};
pub use envelope::{ChunkStream, ExecutionResult, ExecutionStatus, GatewayRequest, GatewayResponse};
pub use error::{ErrorCategory, GatewayError, Result, Severity};
pub use events::{EventHandler, FnEventHandler, GatewayEvent};
pub use health::{CircuitState, HealthMetrics, HealthTracker};
pub use instance::{InstanceState, PipelineInstance};
pub use manager::SchedulerManager;
pub use policy::{ErrorHandlerCenter, RecoveryAction};
pub use scheduler::{VmMetrics, VmScheduler};
pub use stage::{Stage, StageKind};
pub use stages::provider::{MockOutcome, MockProviderClient, ProviderClient};
pub use table::{PipelineConfig, PipelineTable};
