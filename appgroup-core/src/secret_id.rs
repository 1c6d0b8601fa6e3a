//! Secret ID records and the bookkeeping shared by apps and groups.
//!
//! A secret ID is stored at `secret_id/<app>/<digest>` where `digest` is the
//! salted hash of the raw value. Its accessor is indexed at
//! `accessor/<digest(accessor)>`. The raw value exists only in the
//! [`SecretId`] handed back to the caller at generation time.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::duration::as_millis_u64;
use crate::error::{AppGroupError, AppGroupResult};
use crate::hasher::SaltedHasher;
use crate::locks::LockRegistry;
use crate::storage::{list_leaves, read_json, write_json, Storage};

/// A raw secret ID value.
///
/// The value is redacted from `Debug` output and zeroized on drop.
pub struct SecretId(SecretString);

impl SecretId {
    /// Wraps a raw secret value.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(SecretString::from(raw.into()))
    }

    pub(crate) fn generate() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }

    /// Returns the raw value. Only call this to hand the value to its holder.
    #[must_use]
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl fmt::Debug for SecretId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretId([REDACTED])")
    }
}

impl From<&str> for SecretId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for SecretId {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

/// Who a secret ID was issued through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "snake_case")]
pub enum SecretIdScope {
    /// Issued directly for the app; valid for app and group logins.
    App,
    /// Issued for a member app by a group; valid only for that group's logins.
    Group(String),
}

impl SecretIdScope {
    /// Whether a secret with this scope may be spent by a login on `group`
    /// (`None` for an app login).
    #[must_use]
    pub fn permits(&self, group: Option<&str>) -> bool {
        match (self, group) {
            (Self::App, _) => true,
            (Self::Group(owner), Some(group)) => owner == group,
            (Self::Group(_), None) => false,
        }
    }
}

/// Persisted state of one secret ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SecretIdEntry {
    pub digest: String,
    pub app: String,
    pub accessor: String,
    pub scope: SecretIdScope,
    pub num_uses: Option<u32>,
    pub remaining_uses: Option<u32>,
    pub created_at: u64,
    pub expires_at: Option<u64>,
    pub last_used_at: Option<u64>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl SecretIdEntry {
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining_uses == Some(0)
    }

    /// Checks expiry first, then the remaining budget.
    pub fn check_usable(&self, now: u64) -> AppGroupResult<()> {
        if self.is_expired(now) {
            return Err(AppGroupError::Expired);
        }
        if self.is_exhausted() {
            return Err(AppGroupError::Exhausted);
        }
        Ok(())
    }

    /// The record after one successful login.
    pub fn consumed(&self, now: u64) -> Self {
        Self {
            remaining_uses: self.remaining_uses.map(|uses| uses.saturating_sub(1)),
            last_used_at: Some(now),
            ..self.clone()
        }
    }

    pub fn info(&self) -> SecretIdInfo {
        SecretIdInfo {
            accessor: self.accessor.clone(),
            app: self.app.clone(),
            scope: self.scope.clone(),
            num_uses: self.num_uses,
            remaining_uses: self.remaining_uses,
            created_at: self.created_at,
            expires_at: self.expires_at,
            last_used_at: self.last_used_at,
            metadata: self.metadata.clone(),
        }
    }
}

/// Index entry resolving an accessor to its secret ID record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct AccessorEntry {
    pub app: String,
    pub digest: String,
}

/// Administrative view of a secret ID. Never carries the raw value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecretIdInfo {
    /// Non-secret identifier of the secret ID.
    pub accessor: String,
    /// App the secret ID belongs to.
    pub app: String,
    /// How the secret ID was issued.
    pub scope: SecretIdScope,
    /// Initial number of uses; `None` means unlimited.
    pub num_uses: Option<u32>,
    /// Remaining number of uses; `None` means unlimited.
    pub remaining_uses: Option<u32>,
    /// Creation time, unix milliseconds.
    pub created_at: u64,
    /// Expiration time, unix milliseconds; `None` means never.
    pub expires_at: Option<u64>,
    /// Time of the last successful login, unix milliseconds.
    pub last_used_at: Option<u64>,
    /// Caller supplied metadata.
    pub metadata: BTreeMap<String, String>,
}

/// A freshly issued secret ID.
///
/// This is the only place the raw value is ever returned.
#[derive(Debug)]
pub struct SecretIdResponse {
    /// The raw secret value.
    pub secret_id: SecretId,
    /// Non-secret identifier for administrative use.
    pub accessor: String,
    /// Expiration time, unix milliseconds.
    pub expires_at: Option<u64>,
    /// Number of logins allowed; `None` means unlimited.
    pub num_uses: Option<u32>,
}

/// Per-call overrides when generating a secret ID.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerateParams {
    /// Overrides the owner's default number of uses (0 = unlimited).
    pub num_uses: Option<u32>,
    /// Overrides the owner's default TTL (zero = no expiry).
    pub ttl: Option<Duration>,
    /// Free-form metadata stored with the secret ID.
    pub metadata: BTreeMap<String, String>,
}

pub(crate) fn secret_prefix(app: &str) -> String {
    format!("secret_id/{app}/")
}

pub(crate) fn secret_key(app: &str, digest: &str) -> String {
    format!("secret_id/{app}/{digest}")
}

fn accessor_key(accessor_digest: &str) -> String {
    format!("accessor/{accessor_digest}")
}

/// What to store for a new secret ID.
pub(crate) struct IssueRequest<'a> {
    pub app: &'a str,
    pub secret_id: SecretId,
    pub num_uses: u32,
    pub ttl: Duration,
    pub scope: SecretIdScope,
    pub metadata: BTreeMap<String, String>,
    pub now: u64,
}

/// Reads and writes secret ID records under their credential locks.
///
/// None of these methods take structural locks; callers hold the app lock
/// (and the group lock where relevant) as documented in [`crate::locks`].
#[derive(Clone)]
pub(crate) struct SecretIdBook {
    storage: Arc<dyn Storage>,
    hasher: Arc<SaltedHasher>,
    locks: Arc<LockRegistry>,
}

impl SecretIdBook {
    pub fn new(
        storage: Arc<dyn Storage>,
        hasher: Arc<SaltedHasher>,
        locks: Arc<LockRegistry>,
    ) -> Self {
        Self {
            storage,
            hasher,
            locks,
        }
    }

    pub fn storage(&self) -> &dyn Storage {
        self.storage.as_ref()
    }

    pub fn locks(&self) -> &LockRegistry {
        &self.locks
    }

    pub fn digest(&self, raw: &str) -> String {
        self.hasher.hash_with_salt(raw)
    }

    /// Loads the record for `digest`, rejecting records whose stored digest
    /// does not belong to `raw`.
    pub fn load_for(
        &self,
        app: &str,
        raw: &SecretId,
        digest: &str,
    ) -> AppGroupResult<Option<SecretIdEntry>> {
        let entry: Option<SecretIdEntry> =
            read_json(self.storage(), &secret_key(app, digest))?;
        Ok(entry.filter(|entry| {
            entry.app == app && self.hasher.matches(raw.expose(), &entry.digest)
        }))
    }

    pub fn load(&self, app: &str, digest: &str) -> AppGroupResult<Option<SecretIdEntry>> {
        Ok(read_json(self.storage(), &secret_key(app, digest))?)
    }

    pub fn save(&self, entry: &SecretIdEntry) -> AppGroupResult<()> {
        write_json(self.storage(), &secret_key(&entry.app, &entry.digest), entry)?;
        Ok(())
    }

    /// Persists a new secret ID and its accessor index entry.
    pub fn issue(&self, request: IssueRequest<'_>) -> AppGroupResult<SecretIdResponse> {
        let IssueRequest {
            app,
            secret_id,
            num_uses,
            ttl,
            scope,
            metadata,
            now,
        } = request;

        if secret_id.expose().is_empty() {
            return Err(AppGroupError::Validation("secret_id must not be empty".to_string()));
        }

        let digest = self.digest(secret_id.expose());
        let accessor = Uuid::new_v4().to_string();
        let limited = (num_uses > 0).then_some(num_uses);
        let expires_at = (!ttl.is_zero()).then(|| now.saturating_add(as_millis_u64(ttl)));
        let entry = SecretIdEntry {
            digest: digest.clone(),
            app: app.to_string(),
            accessor: accessor.clone(),
            scope,
            num_uses: limited,
            remaining_uses: limited,
            created_at: now,
            expires_at,
            last_used_at: None,
            metadata,
        };
        let index = AccessorEntry {
            app: app.to_string(),
            digest: digest.clone(),
        };
        let key = secret_key(app, &digest);
        let index_key = accessor_key(&self.digest(&accessor));

        self.locks.with_credential_lock(&digest, || {
            if self.storage.get(&key)?.is_some() {
                return Err(AppGroupError::Validation(
                    "secret_id is already registered for this app".to_string(),
                ));
            }
            write_json(self.storage(), &key, &entry)?;
            if let Err(err) = write_json(self.storage(), &index_key, &index) {
                if let Err(cleanup) = self.storage.delete(&key) {
                    tracing::warn!(
                        app,
                        accessor = %accessor,
                        %cleanup,
                        "failed to remove secret id after index write failure"
                    );
                }
                return Err(err.into());
            }
            Ok(())
        })?;

        tracing::debug!(app, accessor = %accessor, "issued secret id");
        Ok(SecretIdResponse {
            secret_id,
            accessor,
            expires_at,
            num_uses: limited,
        })
    }

    /// Resolves an accessor belonging to `app`.
    pub fn resolve_accessor(
        &self,
        app: &str,
        accessor: &str,
    ) -> AppGroupResult<Option<SecretIdEntry>> {
        let index: Option<AccessorEntry> =
            read_json(self.storage(), &accessor_key(&self.digest(accessor)))?;
        match index {
            Some(index) if index.app == app => self.load(app, &index.digest),
            _ => Ok(None),
        }
    }

    /// Deletes a secret ID and its accessor. The caller holds the digest's
    /// credential lock.
    pub fn remove_locked(&self, entry: &SecretIdEntry) -> AppGroupResult<()> {
        self.storage
            .delete(&accessor_key(&self.digest(&entry.accessor)))?;
        self.storage.delete(&secret_key(&entry.app, &entry.digest))?;
        Ok(())
    }

    /// Deletes the secret ID stored under `digest`, if still present.
    pub fn remove(&self, app: &str, digest: &str) -> AppGroupResult<Option<SecretIdEntry>> {
        self.locks.with_credential_lock(digest, || {
            let entry = self.load(app, digest)?;
            if let Some(entry) = &entry {
                self.remove_locked(entry)?;
            }
            Ok(entry)
        })
    }

    /// Digests of every secret ID stored for `app`.
    pub fn digests(&self, app: &str) -> AppGroupResult<Vec<String>> {
        Ok(list_leaves(self.storage(), &secret_prefix(app))?)
    }

    /// Every secret ID record stored for `app`.
    pub fn entries(&self, app: &str) -> AppGroupResult<Vec<SecretIdEntry>> {
        let mut entries = Vec::new();
        for digest in self.digests(app)? {
            if let Some(entry) = self.load(app, &digest)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}
