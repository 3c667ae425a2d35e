//! Error recovery policy.
//!
//! Pure decision logic: given a failed attempt, choose between retrying the
//! same instance, failing over, blacklisting, or aborting. The defaults
//! implement the fixed category table; per-code overrides can be installed
//! at construction for deployments that need different behavior. Nothing
//! else in the crate decides recovery.

use crate::error::{ErrorCategory, GatewayError};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

/// What the scheduler should do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Retry the same instance (after backoff).
    RetrySame,
    /// Exclude the instance for this request and pick another.
    Failover,
    /// Blacklist the instance for the given duration, then fail over.
    BlacklistAndFailover {
        /// How long the instance stays excluded.
        duration: Duration,
    },
    /// Give up and return the error.
    Abort,
}

/// Policy center mapping errors to recovery actions.
#[derive(Debug, Clone)]
pub struct ErrorHandlerCenter {
    max_retries: u32,
    /// Blacklist duration for rate limits without a `Retry-After` hint.
    rate_limit_penalty: Duration,
    /// Blacklist duration for auth failures (cleared early only by admin
    /// action after rotating credentials).
    auth_penalty: Duration,
    /// Blacklist duration for internal stage crashes.
    internal_penalty: Duration,
    overrides: HashMap<&'static str, RecoveryAction>,
}

impl ErrorHandlerCenter {
    /// Create a policy with the default rule table and a retry budget.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            rate_limit_penalty: Duration::from_secs(1),
            auth_penalty: Duration::from_secs(300),
            internal_penalty: Duration::from_secs(30),
            overrides: HashMap::new(),
        }
    }

    /// Override the action for one error code.
    pub fn with_rule(mut self, code: &'static str, action: RecoveryAction) -> Self {
        self.overrides.insert(code, action);
        self
    }

    /// The same-instance retry budget.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Decide the recovery action for a failed attempt.
    ///
    /// `retry_count` is how many same-instance retries this request has
    /// already spent.
    pub fn decide(&self, error: &GatewayError, retry_count: u32) -> RecoveryAction {
        if let Some(action) = self.overrides.get(error.code()) {
            return *action;
        }

        match error {
            // The deadline already covered any inner retries; there is no
            // time left to spend on another instance.
            GatewayError::Timeout => RecoveryAction::Abort,
            GatewayError::Cancelled => RecoveryAction::Abort,
            _ => match error.category() {
                ErrorCategory::Transient => {
                    if retry_count < self.max_retries {
                        RecoveryAction::RetrySame
                    } else {
                        RecoveryAction::Failover
                    }
                }
                ErrorCategory::RateLimit => RecoveryAction::BlacklistAndFailover {
                    duration: error.retry_after().unwrap_or(self.rate_limit_penalty),
                },
                ErrorCategory::Auth => RecoveryAction::BlacklistAndFailover {
                    duration: self.auth_penalty,
                },
                ErrorCategory::Internal => RecoveryAction::BlacklistAndFailover {
                    duration: self.internal_penalty,
                },
                ErrorCategory::Upstream | ErrorCategory::Permanent => RecoveryAction::Abort,
            },
        }
    }

    /// Assemble the normalized user-visible error body.
    ///
    /// The shape is stable regardless of the error's origin; provider
    /// payloads and credentials never pass through.
    pub fn error_response(error: &GatewayError) -> Value {
        json!({
            "error": {
                "code": error.code(),
                "message": error.to_string(),
                "type": format!("{:?}", error.category()).to_lowercase(),
                "httpStatus": error.http_status(),
            }
        })
    }
}
