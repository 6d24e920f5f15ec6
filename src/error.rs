//! Error taxonomy for the gateway core.

use thiserror::Error;

/// The tag carried by a canceled query's error, per the external error contract.
pub const CANCELED_BY_USER: &str = "CANCELED_BY_USER";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("validation failed: field `{field}` rejected by `{validator}`")]
    Validation { field: String, validator: String },

    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("{CANCELED_BY_USER}")]
    Canceled,

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("vault authentication failed")]
    Auth,

    #[error("query not ready for cancellation")]
    QueryNotReady,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl GatewayError {
    pub fn validation(field: impl Into<String>, validator: impl Into<String>) -> Self {
        GatewayError::Validation {
            field: field.into(),
            validator: validator.into(),
        }
    }

    /// Whether this error carries the `CANCELED_BY_USER` tag.
    pub fn is_canceled_by_user(&self) -> bool {
        matches!(self, GatewayError::Canceled)
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
