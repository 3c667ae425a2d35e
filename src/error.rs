use std::time::Duration;
use thiserror::Error;

/// Coarse error classification driving retry/failover policy.
///
/// Every [`GatewayError`] maps to exactly one category; the
/// [`ErrorHandlerCenter`](crate::policy::ErrorHandlerCenter) keys its default
/// rules off this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Recoverable by retrying: network failures, 5xx, saturation.
    Transient,
    /// Will not recover on retry: bad request, unknown model, cancellation.
    Permanent,
    /// Credential problems (401/403 from the provider).
    Auth,
    /// Provider-side throttling (429).
    RateLimit,
    /// Provider rejected the request (4xx other than auth/rate-limit).
    Upstream,
    /// A bug or invariant violation inside the gateway itself.
    Internal,
}

/// How loudly an error should be reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Expected under load; logged at debug/warn.
    Warning,
    /// A failed request; logged at error.
    Error,
    /// Misconfiguration or invariant breakage; fatal at startup.
    Critical,
}

/// Errors produced by the gateway core.
///
/// Each variant carries a stable code (see [`GatewayError::code`]) that is
/// independent of the message text, so callers and tests can match on
/// behavior rather than wording.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The requested virtual model is not registered.
    #[error("unknown virtual model '{virtual_model}'")]
    UnknownVirtualModel {
        /// The id the caller asked for.
        virtual_model: String,
    },

    /// Every instance of the virtual model is blacklisted or unhealthy.
    #[error("no healthy instance available for virtual model '{virtual_model}'")]
    NoHealthyInstance {
        /// The virtual model whose pool is exhausted.
        virtual_model: String,
    },

    /// The per-VM concurrency cap rejected the request immediately.
    #[error("virtual model '{virtual_model}' is at its concurrency limit")]
    BackpressureRejected {
        /// The saturated virtual model.
        virtual_model: String,
    },

    /// Invalid stage or table configuration detected at build time.
    #[error("invalid configuration: {0}")]
    StageConfigInvalid(String),

    /// A transform stage rejected the request (schema violation, bad field).
    #[error("stage '{stage}' could not transform the request: {message}")]
    StageTransformFailed {
        /// Name of the stage that failed.
        stage: String,
        /// What went wrong.
        message: String,
    },

    /// Transport-level failure reaching the provider (connect, reset, DNS).
    #[error("provider network error: {message}")]
    ProviderNetwork {
        /// Transport error description.
        message: String,
    },

    /// The provider accepted the connection but did not answer in time.
    #[error("provider timed out: {message}")]
    ProviderTimeout {
        /// Timeout description.
        message: String,
    },

    /// Upstream 429. `retry_after` is populated from the `Retry-After`
    /// response header when present.
    #[error("provider rate limit: {body}")]
    ProviderRateLimit {
        /// Response body text.
        body: String,
        /// Parsed `Retry-After` hint, if the provider sent one.
        retry_after: Option<Duration>,
    },

    /// Upstream 401/403 — the configured credentials were rejected.
    #[error("provider auth failure (HTTP {status})")]
    ProviderAuth {
        /// The provider's status code.
        status: u16,
        /// Response body text.
        body: String,
    },

    /// Upstream 4xx other than auth/rate-limit; mirrored to the caller.
    #[error("provider rejected request (HTTP {status}): {body}")]
    ProviderBadRequest {
        /// The provider's status code.
        status: u16,
        /// Response body text.
        body: String,
    },

    /// Upstream 5xx.
    #[error("provider server error (HTTP {status}): {body}")]
    ProviderServerError {
        /// The provider's status code.
        status: u16,
        /// Response body text.
        body: String,
    },

    /// The request was cancelled by the caller (client disconnect).
    #[error("request was cancelled")]
    Cancelled,

    /// The per-request hard deadline elapsed.
    #[error("request exceeded its deadline")]
    Timeout,

    /// Unexpected failure inside a stage or the executor.
    #[error("internal error{}: {message}", .stage.as_deref().map(|s| format!(" in stage '{s}'")).unwrap_or_default())]
    Internal {
        /// The stage that blew up, when known.
        stage: Option<String>,
        /// Failure description.
        message: String,
    },
}

impl GatewayError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownVirtualModel { .. } => "UNKNOWN_VIRTUAL_MODEL",
            Self::NoHealthyInstance { .. } => "NO_HEALTHY_INSTANCE",
            Self::BackpressureRejected { .. } => "BACKPRESSURE_REJECTED",
            Self::StageConfigInvalid(_) => "STAGE_CONFIG_INVALID",
            Self::StageTransformFailed { .. } => "STAGE_TRANSFORM_FAILED",
            Self::ProviderNetwork { .. } => "PROVIDER_NETWORK",
            Self::ProviderTimeout { .. } => "PROVIDER_TIMEOUT",
            Self::ProviderRateLimit { .. } => "PROVIDER_RATE_LIMIT",
            Self::ProviderAuth { .. } => "PROVIDER_AUTH",
            Self::ProviderBadRequest { .. } => "PROVIDER_BAD_REQUEST",
            Self::ProviderServerError { .. } => "PROVIDER_SERVER_ERROR",
            Self::Cancelled => "CANCELLED",
            Self::Timeout => "TIMEOUT",
            Self::Internal { .. } => "INTERNAL",
        }
    }

    /// The policy category this error falls into.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::UnknownVirtualModel { .. }
            | Self::StageConfigInvalid(_)
            | Self::StageTransformFailed { .. }
            | Self::Cancelled => ErrorCategory::Permanent,
            Self::NoHealthyInstance { .. }
            | Self::BackpressureRejected { .. }
            | Self::ProviderNetwork { .. }
            | Self::ProviderTimeout { .. }
            | Self::ProviderServerError { .. }
            | Self::Timeout => ErrorCategory::Transient,
            Self::ProviderRateLimit { .. } => ErrorCategory::RateLimit,
            Self::ProviderAuth { .. } => ErrorCategory::Auth,
            Self::ProviderBadRequest { .. } => ErrorCategory::Upstream,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// Severity for logging and alerting.
    pub fn severity(&self) -> Severity {
        match self {
            Self::BackpressureRejected { .. } | Self::ProviderRateLimit { .. } => Severity::Warning,
            Self::StageConfigInvalid(_) | Self::Internal { .. } => Severity::Critical,
            _ => Severity::Error,
        }
    }

    /// HTTP status the shim should return for this error.
    ///
    /// `ProviderBadRequest` mirrors the provider's own status; everything
    /// else maps per the fixed table.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::UnknownVirtualModel { .. } => 404,
            Self::NoHealthyInstance { .. } => 503,
            Self::BackpressureRejected { .. } | Self::ProviderRateLimit { .. } => 429,
            Self::StageConfigInvalid(_) => 500,
            Self::StageTransformFailed { .. } => 400,
            Self::ProviderNetwork { .. }
            | Self::ProviderAuth { .. }
            | Self::ProviderServerError { .. } => 502,
            Self::ProviderTimeout { .. } | Self::Timeout => 504,
            Self::ProviderBadRequest { status, .. } => *status,
            Self::Cancelled => 499,
            Self::Internal { .. } => 500,
        }
    }

    /// Whether retrying the same request can succeed.
    ///
    /// `Timeout` is not retryable: the deadline already covered any inner
    /// retries. `Internal` defaults to not-retryable; the policy may still
    /// fail over to another instance.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::NoHealthyInstance { .. }
                | Self::BackpressureRejected { .. }
                | Self::ProviderNetwork { .. }
                | Self::ProviderTimeout { .. }
                | Self::ProviderRateLimit { .. }
                | Self::ProviderServerError { .. }
        )
    }

    /// The `Retry-After` hint, when the provider sent one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::ProviderRateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Classify a non-success provider status code.
    ///
    /// 401/403 → [`ProviderAuth`](Self::ProviderAuth), 429 →
    /// [`ProviderRateLimit`](Self::ProviderRateLimit), other 4xx →
    /// [`ProviderBadRequest`](Self::ProviderBadRequest), 5xx →
    /// [`ProviderServerError`](Self::ProviderServerError).
    pub fn from_provider_status(status: u16, body: String, retry_after: Option<Duration>) -> Self {
        match status {
            401 | 403 => Self::ProviderAuth { status, body },
            429 => Self::ProviderRateLimit { body, retry_after },
            400..=499 => Self::ProviderBadRequest { status, body },
            _ => Self::ProviderServerError { status, body },
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::ProviderTimeout {
                message: err.to_string(),
            }
        } else {
            GatewayError::ProviderNetwork {
                message: err.to_string(),
            }
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Internal {
            stage: None,
            message: format!("JSON handling failed: {err}"),
        }
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        GatewayError::Internal {
            stage: None,
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_status_classification() {
        assert!(matches!(
            GatewayError::from_provider_status(401, "denied".into(), None),
            GatewayError::ProviderAuth { status: 401, .. }
        ));
        assert!(matches!(
            GatewayError::from_provider_status(429, "slow down".into(), None),
            GatewayError::ProviderRateLimit { .. }
        ));
        assert!(matches!(
            GatewayError::from_provider_status(422, "bad shape".into(), None),
            GatewayError::ProviderBadRequest { status: 422, .. }
        ));
        assert!(matches!(
            GatewayError::from_provider_status(503, "down".into(), None),
            GatewayError::ProviderServerError { status: 503, .. }
        ));
    }

    #[test]
    fn test_http_mapping_is_deterministic() {
        let err = GatewayError::NoHealthyInstance {
            virtual_model: "vm".into(),
        };
        assert_eq!(err.http_status(), 503);
        assert_eq!(err.category(), ErrorCategory::Transient);
        assert!(err.retryable());

        let err = GatewayError::ProviderBadRequest {
            status: 418,
            body: String::new(),
        };
        // 4xx mirrors the provider's own status.
        assert_eq!(err.http_status(), 418);
        assert!(!err.retryable());

        assert_eq!(GatewayError::Cancelled.http_status(), 499);
        assert_eq!(GatewayError::Timeout.http_status(), 504);
        assert!(!GatewayError::Timeout.retryable());
    }

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(
            GatewayError::UnknownVirtualModel {
                virtual_model: "x".into()
            }
            .code(),
            "UNKNOWN_VIRTUAL_MODEL"
        );
        assert_eq!(GatewayError::Cancelled.code(), "CANCELLED");
        assert_eq!(
            GatewayError::Internal {
                stage: Some("workflow".into()),
                message: "boom".into()
            }
            .code(),
            "INTERNAL"
        );
    }

    #[test]
    fn test_retry_after_surfaced() {
        let err = GatewayError::from_provider_status(
            429,
            "limited".into(),
            Some(Duration::from_secs(2)),
        );
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
    }
}
