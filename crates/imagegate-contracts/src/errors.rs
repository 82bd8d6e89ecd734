use std::time::Duration;

use thiserror::Error;

/// Outcome of a failed slot pipeline, classified before it reaches the
/// orchestrator. Every variant keeps the upstream diagnostic text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassifiedError {
    #[error("authentication rejected: {0}")]
    AuthError(String),
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("upstream rejected request: {0}")]
    UpstreamRejected(String),
    #[error("image decode failed: {0}")]
    DecodeFailure(String),
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl ClassifiedError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthError(_) => "auth_error",
            Self::RateLimited { .. } => "rate_limited",
            Self::Timeout(_) => "timeout",
            Self::Transport(_) => "transport",
            Self::MalformedResponse(_) => "malformed_response",
            Self::UpstreamRejected(_) => "upstream_rejected",
            Self::DecodeFailure(_) => "decode_failure",
            Self::UnknownProvider(_) => "unknown_provider",
            Self::Cancelled(_) => "cancelled",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::AuthError(message)
            | Self::RateLimited { message, .. }
            | Self::Timeout(message)
            | Self::Transport(message)
            | Self::MalformedResponse(message)
            | Self::UpstreamRejected(message)
            | Self::DecodeFailure(message)
            | Self::UnknownProvider(message)
            | Self::Cancelled(message) => message,
        }
    }
}

/// Request-level problems that apply identically to every slot. These are the
/// only errors that fail a `generate` call outright.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PreflightError {
    #[error("prompt must not be empty")]
    EmptyPrompt,
    #[error("image count must be at least 1")]
    ZeroCount,
    #[error("at most {max} images per request (got {count})")]
    TooManyImages { count: u32, max: u32 },
    #[error("seed '{0}' is not an integer")]
    InvalidSeed(String),
    #[error("width and height must be positive (got {width}x{height})")]
    InvalidDimensions { width: u32, height: u32 },
    #[error("provider '{provider}' does not accept {width}x{height}; allowed sides: {allowed:?}")]
    UnsupportedDimensions {
        provider: String,
        width: u32,
        height: u32,
        allowed: Vec<u32>,
    },
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),
}

#[cfg(test)]
mod tests {
    use super::ClassifiedError;

    #[test]
    fn kind_and_message_expose_diagnostics() {
        let err = ClassifiedError::RateLimited {
            message: "slow down".to_string(),
            retry_after: None,
        };
        assert_eq!(err.kind(), "rate_limited");
        assert_eq!(err.message(), "slow down");
        assert_eq!(err.to_string(), "rate limited: slow down");
    }
}
