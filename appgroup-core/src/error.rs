use serde::Serialize;
use thiserror::Error;

use crate::storage::StorageError;

/// Result type for backend operations.
pub type AppGroupResult<T, E = AppGroupError> = std::result::Result<T, E>;

/// Error outputs from the AppGroup backend.
#[derive(Debug, Error)]
pub enum AppGroupError {
    /// The request is malformed or violates a constraint.
    #[error("validation_error: {0}")]
    Validation(String),
    /// An administrative path referenced an app, group or secret ID that does not exist.
    #[error("not_found: {kind} '{name}'")]
    NotFound {
        /// What kind of entity was looked up.
        kind: &'static str,
        /// The name or accessor that was not found.
        name: String,
    },
    /// No secret ID matching the presented value exists for the login target.
    #[error("invalid_credential")]
    InvalidCredential,
    /// The presented secret ID is past its expiration time.
    #[error("expired")]
    Expired,
    /// The presented secret ID has no remaining uses.
    #[error("exhausted")]
    Exhausted,
    /// A renewal was requested after the grant's maximum lifetime.
    #[error("lease_expired")]
    LeaseExpired,
    /// The backing store failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// An internal failure: no randomness available, or a response could not be encoded.
    #[error("internal_error: {0}")]
    Internal(String),
}

impl AppGroupError {
    pub(crate) fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Returns `true` for the credential failures a login must not tell apart.
    #[must_use]
    pub const fn is_login_denial(&self) -> bool {
        matches!(
            self,
            Self::InvalidCredential | Self::Expired | Self::Exhausted
        )
    }

    /// Machine readable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound { .. } => "not_found",
            Self::InvalidCredential => "invalid_credential",
            Self::Expired => "expired",
            Self::Exhausted => "exhausted",
            Self::LeaseExpired => "lease_expired",
            Self::Storage(_) => "storage_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// HTTP-style status hint for hosts that speak HTTP.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::InvalidCredential | Self::Expired | Self::Exhausted | Self::LeaseExpired => 403,
            Self::NotFound { .. } => 404,
            Self::Storage(_) | Self::Internal(_) => 500,
        }
    }
}

/// Error body returned to the host.
///
/// Credential failures on login collapse into one generic denial so a caller
/// cannot probe which secret IDs exist, expired or ran out of uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorResponse {
    /// Machine readable error code.
    pub code: String,
    /// Human readable message.
    pub message: String,
    /// HTTP-style status hint.
    pub status: u16,
}

impl ErrorResponse {
    /// The response every login credential failure maps to.
    #[must_use]
    pub fn permission_denied() -> Self {
        Self {
            code: "permission_denied".to_string(),
            message: "permission denied".to_string(),
            status: 403,
        }
    }
}

impl From<&AppGroupError> for ErrorResponse {
    fn from(error: &AppGroupError) -> Self {
        if error.is_login_denial() {
            return Self::permission_denied();
        }
        Self {
            code: error.code().to_string(),
            message: error.to_string(),
            status: error.status_code(),
        }
    }
}

impl From<AppGroupError> for ErrorResponse {
    fn from(error: AppGroupError) -> Self {
        Self::from(&error)
    }
}
