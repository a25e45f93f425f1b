use std::time::Duration;

use thiserror::Error;

use crate::amount::AmountError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors reported by a [`Gateway`](crate::traits::Gateway) implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("not authenticated")]
    Unauthenticated,
    #[error("record '{0}' not found")]
    NotFound(String),
    #[error("access denied: {0}")]
    Forbidden(String),
    #[error("{0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("no authenticated session")]
    Unauthenticated,

    #[error(transparent)]
    Gateway(GatewayError),

    #[error("gateway did not respond within {0:?}")]
    Timeout(Duration),

    #[error("malformed row: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    Amount(#[from] AmountError),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("page number and page size must both be at least 1")]
    InvalidPage,

    #[error("invalid filter: {0}")]
    Filter(String),

    #[error("change subscription closed")]
    SubscriptionClosed,

    #[error(transparent)]
    Builder(#[from] fieldx::error::FieldXError),

    #[error(transparent)]
    Cli(#[from] clap::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Whether repeating the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::SubscriptionClosed | Self::Gateway(GatewayError::Backend(_))
        )
    }
}

impl From<GatewayError> for Error {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Unauthenticated => Self::Unauthenticated,
            other => Self::Gateway(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthenticated_gateway_error_is_lifted() {
        assert!(matches!(Error::from(GatewayError::Unauthenticated), Error::Unauthenticated));
        assert!(matches!(
            Error::from(GatewayError::NotFound("42".into())),
            Error::Gateway(GatewayError::NotFound(_))
        ));
    }

    #[test]
    fn retryable() {
        assert!(Error::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(Error::from(GatewayError::Backend("connection reset".into())).is_retryable());
        assert!(!Error::InvalidPage.is_retryable());
        assert!(!Error::from(GatewayError::Forbidden("not yours".into())).is_retryable());
    }
}
