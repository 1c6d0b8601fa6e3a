//! Process configuration supplied by the host.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration;

/// Default lifetime of an issued token when an app or group does not set one.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(60 * 60);

/// Default upper bound on a token's lifetime across renewals.
pub const DEFAULT_TOKEN_MAX_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Defaults applied to apps and groups that leave a value unset.
///
/// A `secret_id_num_uses` of 0 means unlimited uses and a zero
/// `secret_id_ttl` means secret IDs never expire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Number of logins a new secret ID allows.
    pub secret_id_num_uses: u32,
    /// Lifetime of a new secret ID.
    #[serde(with = "duration::serde_secs")]
    pub secret_id_ttl: Duration,
    /// Lifetime of an issued token.
    #[serde(with = "duration::serde_secs")]
    pub token_ttl: Duration,
    /// Maximum lifetime of an issued token across renewals.
    #[serde(with = "duration::serde_secs")]
    pub token_max_ttl: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            secret_id_num_uses: 0,
            secret_id_ttl: Duration::ZERO,
            token_ttl: DEFAULT_TOKEN_TTL,
            token_max_ttl: DEFAULT_TOKEN_MAX_TTL,
        }
    }
}

impl BackendConfig {
    /// Parses a configuration from JSON; absent fields keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or a duration is invalid.
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
