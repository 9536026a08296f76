//! Gateway sync error types.

use crate::types::RecordId;
use thiserror::Error;

/// Result type for gateway sync operations.
pub type IotResult<T> = Result<T, IotError>;

/// Errors that can occur while reconciling or mutating gateway entities.
#[derive(Debug, Error)]
pub enum IotError {
    /// No local record exists for the requested external id.
    #[error("entity not found: {0}")]
    EntityNotFound(String),

    /// Some external ids of a bulk request have no durable identity.
    #[error("unable to resolve durable ids for {} entities: {}", missing.len(), missing.join(", "))]
    PartialResolution { missing: Vec<String> },

    /// The backend rejected the session. Terminal: the session must end.
    #[error("backend session is no longer authorized")]
    Unauthorized,

    #[error("API request failed: {0}")]
    Api(String),

    #[error("gateway request failed: {0}")]
    Gateway(String),

    #[error("gateway rejected the access key")]
    GatewayUnauthorized,

    #[error("gateway not found: {0}")]
    GatewayNotFound(RecordId),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl IotError {
    /// Returns true for the terminal backend auth condition.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, IotError::Unauthorized)
    }

    /// Returns true for failures that are rolled back and may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            IotError::Api(_) | IotError::Gateway(_) | IotError::Http(_)
        )
    }
}
