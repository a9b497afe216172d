//! Error taxonomy for enrichment and fusion

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::models::IocType;

/// Machine-readable failure class, alongside the human-readable message
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Disabled or misconfigured provider, unsupported type; never retried
    Configuration,
    /// Timeout, rate limit, transport failure; retried inside the contract
    Transient,
    /// Too few successful providers or zero valid results
    Insufficient,
    /// No provider can satisfy the request at all
    Capacity,
}

/// Everything that can go wrong during enrichment
#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("provider {0} is disabled")]
    ProviderDisabled(String),

    #[error("provider {provider} does not support {ioc_type} indicators")]
    UnsupportedIndicator { provider: String, ioc_type: IocType },

    #[error("provider {provider} rate limited, resets at {retry_at}")]
    RateLimited {
        provider: String,
        retry_at: DateTime<Utc>,
    },

    #[error("provider {provider} timed out after {timeout_ms}ms")]
    Timeout { provider: String, timeout_ms: u64 },

    #[error("provider {provider} failed: {source}")]
    Provider {
        provider: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("no providers available for {0} indicators")]
    NoProvidersAvailable(IocType),

    #[error("only {succeeded} of a required {required} providers succeeded")]
    InsufficientProviders { succeeded: usize, required: usize },

    #[error("no valid provider results to aggregate")]
    NoValidResults,

    #[error("enrichment timed out after {0}ms")]
    OperationTimeout(u64),

    #[error("could not determine indicator type for {0:?}")]
    InvalidIndicator(String),
}

impl EnrichError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EnrichError::ProviderDisabled(_)
            | EnrichError::UnsupportedIndicator { .. }
            | EnrichError::InvalidIndicator(_) => ErrorKind::Configuration,
            EnrichError::RateLimited { .. }
            | EnrichError::Timeout { .. }
            | EnrichError::Provider { .. }
            | EnrichError::OperationTimeout(_) => ErrorKind::Transient,
            EnrichError::InsufficientProviders { .. } | EnrichError::NoValidResults => {
                ErrorKind::Insufficient
            }
            EnrichError::NoProvidersAvailable(_) => ErrorKind::Capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(
            EnrichError::ProviderDisabled("vt".into()).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            EnrichError::Timeout { provider: "vt".into(), timeout_ms: 100 }.kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            EnrichError::InsufficientProviders { succeeded: 1, required: 2 }.kind(),
            ErrorKind::Insufficient
        );
        assert_eq!(
            EnrichError::NoProvidersAvailable(IocType::Cve).kind(),
            ErrorKind::Capacity
        );
    }

    #[test]
    fn messages_are_descriptive() {
        let e = EnrichError::InsufficientProviders { succeeded: 1, required: 2 };
        assert!(e.to_string().contains("1 of a required 2"));
    }
}
