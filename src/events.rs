//! Observer hooks for the routing lifecycle.
//!
//! The core never depends on a global event bus; instead, components accept
//! an optional [`EventHandler`] at construction and publish [`GatewayEvent`]s
//! through it. Handlers must be cheap and non-blocking — they run inline on
//! the request path.

use crate::health::CircuitState;
use std::sync::Arc;
use std::time::Duration;

/// Events published during request routing and pipeline execution.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// A request entered a virtual-model scheduler.
    RequestStart {
        /// Execution id assigned to this request.
        execution_id: String,
        /// The virtual model handling it.
        virtual_model: String,
    },
    /// A request left the scheduler.
    RequestEnd {
        /// Execution id of the finished request.
        execution_id: String,
        /// Whether it completed successfully.
        ok: bool,
        /// Total duration across attempts.
        duration: Duration,
    },
    /// A pipeline stage finished one direction of processing.
    StageComplete {
        /// Execution id this stage ran under.
        execution_id: String,
        /// Stage name (`llm-switch`, `workflow`, `compatibility`, `provider`).
        stage: &'static str,
        /// Whether the stage succeeded.
        ok: bool,
    },
    /// A same-instance retry was scheduled.
    RetryScheduled {
        /// Execution id being retried.
        execution_id: String,
        /// Instance that will be retried.
        instance_id: String,
        /// 1-indexed attempt number.
        attempt: u32,
        /// Delay before the retry.
        delay: Duration,
    },
    /// The scheduler moved a request to a different instance.
    FailoverSelected {
        /// Execution id failing over.
        execution_id: String,
        /// Instance that failed.
        from_instance: String,
    },
    /// An instance entered the blacklist.
    InstanceBlacklisted {
        /// The excluded instance.
        instance_id: String,
        /// Why it was excluded.
        reason: String,
        /// `None` for permanent entries.
        duration: Option<Duration>,
    },
    /// An instance left the blacklist (expiry or admin removal).
    InstanceUnblacklisted {
        /// The restored instance.
        instance_id: String,
    },
    /// An instance's circuit breaker changed state.
    CircuitTransition {
        /// The instance whose breaker moved.
        instance_id: String,
        /// Previous state.
        from: CircuitState,
        /// New state.
        to: CircuitState,
    },
}

/// Receiver for [`GatewayEvent`]s.
///
/// Entirely optional — every component works without a handler. Implement
/// this for metrics export, admin dashboards, or debug tracing.
pub trait EventHandler: Send + Sync {
    /// Called for each published event.
    fn on_event(&self, event: GatewayEvent);
}

/// Publish an event if a handler is present. No-op otherwise.
pub(crate) fn emit(handler: &Option<Arc<dyn EventHandler>>, event: GatewayEvent) {
    if let Some(ref h) = handler {
        h.on_event(event);
    }
}

/// An [`EventHandler`] backed by a closure.
///
/// # Example
///
/// ```
/// use model_relay::events::{FnEventHandler, GatewayEvent};
/// use std::sync::Arc;
///
/// let handler = Arc::new(FnEventHandler(|event: GatewayEvent| {
///     if let GatewayEvent::FailoverSelected { from_instance, .. } = event {
///         eprintln!("failover away from {from_instance}");
///     }
/// }));
/// ```
pub struct FnEventHandler<F: Fn(GatewayEvent) + Send + Sync>(pub F);

impl<F: Fn(GatewayEvent) + Send + Sync> EventHandler for FnEventHandler<F> {
    fn on_event(&self, event: GatewayEvent) {
        (self.0)(event);
    }
}
