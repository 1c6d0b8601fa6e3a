//! App definitions and the secret IDs issued for them.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::BackendConfig;
use crate::duration;
use crate::error::{AppGroupError, AppGroupResult};
use crate::secret_id::{
    GenerateParams, IssueRequest, SecretId, SecretIdBook, SecretIdInfo,
    SecretIdResponse, SecretIdScope,
};
use crate::storage::{list_leaves, read_json, write_json};
use crate::validation::{sanitize_policies, validate_name, validate_token_ttls};

const APP_PREFIX: &str = "app/";

fn app_key(name: &str) -> String {
    format!("{APP_PREFIX}{name}")
}

/// A stored app definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppEntry {
    /// Unique, immutable name.
    pub name: String,
    /// Policies attached to tokens issued through this app.
    pub policies: Vec<String>,
    /// Default number of uses for new secret IDs (0 = unlimited).
    pub secret_id_num_uses: u32,
    /// Default lifetime of new secret IDs (zero = no expiry).
    #[serde(with = "duration::serde_secs")]
    pub secret_id_ttl: Duration,
    /// Lifetime of issued tokens.
    #[serde(with = "duration::serde_secs")]
    pub token_ttl: Duration,
    /// Maximum lifetime of issued tokens across renewals (zero = unbounded).
    #[serde(with = "duration::serde_secs")]
    pub token_max_ttl: Duration,
}

/// Fields of a create or update request. Unset fields keep the stored value,
/// or the configured default when the app is new.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppConfig {
    /// Policies to attach.
    pub policies: Option<Vec<String>>,
    /// Default number of uses for new secret IDs.
    pub secret_id_num_uses: Option<u32>,
    /// Default lifetime of new secret IDs.
    pub secret_id_ttl: Option<Duration>,
    /// Lifetime of issued tokens.
    pub token_ttl: Option<Duration>,
    /// Maximum lifetime of issued tokens.
    pub token_max_ttl: Option<Duration>,
}

/// Result of a successful validate-and-consume against an app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppGrant {
    /// The app as it was when the secret was consumed.
    pub app: AppEntry,
    /// Accessor of the consumed secret ID.
    pub accessor: String,
    /// Uses left after this login; `None` means unlimited.
    pub remaining_uses: Option<u32>,
}

/// CRUD for apps and secret ID issuance and consumption against them.
#[derive(Clone)]
pub struct AppStore {
    book: SecretIdBook,
    config: Arc<BackendConfig>,
}

impl AppStore {
    pub(crate) const fn new(book: SecretIdBook, config: Arc<BackendConfig>) -> Self {
        Self { book, config }
    }

    /// Creates the app or updates its definition.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a bad name or inconsistent TTLs, and
    /// storage errors unmodified.
    pub fn write_app(&self, name: &str, config: AppConfig) -> AppGroupResult<AppEntry> {
        validate_name("app", name)?;
        let _app = self.book.locks().app_write();

        let existing = self.load_app(name)?;
        let created = existing.is_none();
        let base = existing.unwrap_or_else(|| AppEntry {
            name: name.to_string(),
            policies: Vec::new(),
            secret_id_num_uses: self.config.secret_id_num_uses,
            secret_id_ttl: self.config.secret_id_ttl,
            token_ttl: self.config.token_ttl,
            token_max_ttl: self.config.token_max_ttl,
        });
        let entry = AppEntry {
            name: base.name,
            policies: config
                .policies
                .map_or(base.policies, |policies| sanitize_policies(&policies)),
            secret_id_num_uses: config.secret_id_num_uses.unwrap_or(base.secret_id_num_uses),
            secret_id_ttl: config.secret_id_ttl.unwrap_or(base.secret_id_ttl),
            token_ttl: config.token_ttl.unwrap_or(base.token_ttl),
            token_max_ttl: config.token_max_ttl.unwrap_or(base.token_max_ttl),
        };
        validate_token_ttls(entry.token_ttl, entry.token_max_ttl)?;

        write_json(self.book.storage(), &app_key(name), &entry)?;
        tracing::info!(app = name, created, "wrote app");
        Ok(entry)
    }

    /// Reads an app definition.
    ///
    /// # Errors
    ///
    /// Returns storage errors unmodified.
    pub fn read_app(&self, name: &str) -> AppGroupResult<Option<AppEntry>> {
        let _app = self.book.locks().app_read();
        self.load_app(name)
    }

    /// Lists app names in ascending order.
    ///
    /// # Errors
    ///
    /// Returns storage errors unmodified.
    pub fn list_apps(&self) -> AppGroupResult<Vec<String>> {
        let _app = self.book.locks().app_read();
        Ok(list_leaves(self.book.storage(), APP_PREFIX)?)
    }

    /// Deletes an app and every secret ID issued for it. Deleting a missing
    /// app is a no-op.
    ///
    /// # Errors
    ///
    /// Returns storage errors unmodified.
    pub fn delete_app(&self, name: &str) -> AppGroupResult<()> {
        validate_name("app", name)?;
        let _app = self.book.locks().app_write();

        let digests = self.book.digests(name)?;
        for digest in &digests {
            self.book.remove(name, digest)?;
        }
        self.book.storage().delete(&app_key(name))?;
        tracing::info!(app = name, secret_ids = digests.len(), "deleted app");
        Ok(())
    }

    /// Generates a new secret ID for the app and returns its raw value. The
    /// value is not recoverable afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`AppGroupError::NotFound`] if the app does not exist.
    pub fn generate_secret_id(
        &self,
        name: &str,
        params: GenerateParams,
        now: u64,
    ) -> AppGroupResult<SecretIdResponse> {
        self.issue(name, SecretId::generate(), params, now)
    }

    /// Registers a caller-chosen secret ID for the app.
    ///
    /// # Errors
    ///
    /// Returns [`AppGroupError::NotFound`] if the app does not exist and a
    /// validation error if the value is empty or already registered.
    pub fn generate_custom_secret_id(
        &self,
        name: &str,
        secret_id: SecretId,
        params: GenerateParams,
        now: u64,
    ) -> AppGroupResult<SecretIdResponse> {
        self.issue(name, secret_id, params, now)
    }

    fn issue(
        &self,
        name: &str,
        secret_id: SecretId,
        params: GenerateParams,
        now: u64,
    ) -> AppGroupResult<SecretIdResponse> {
        let _app = self.book.locks().app_read();
        let app = self.require_app(name)?;
        self.book.issue(IssueRequest {
            app: name,
            secret_id,
            num_uses: params.num_uses.unwrap_or(app.secret_id_num_uses),
            ttl: params.ttl.unwrap_or(app.secret_id_ttl),
            scope: SecretIdScope::App,
            metadata: params.metadata,
            now,
        })
    }

    /// Validates `secret_id` against the app and spends one use of it.
    ///
    /// The digest's credential lock is held from the read through the write
    /// of the decremented record.
    ///
    /// # Errors
    ///
    /// Returns [`AppGroupError::InvalidCredential`] if the app or the secret
    /// is unknown, [`AppGroupError::Expired`] or [`AppGroupError::Exhausted`]
    /// if the secret can no longer be used.
    pub fn validate_and_consume(
        &self,
        name: &str,
        secret_id: &SecretId,
        now: u64,
    ) -> AppGroupResult<AppGrant> {
        let _app = self.book.locks().app_read();
        let app = self
            .load_app(name)?
            .ok_or(AppGroupError::InvalidCredential)?;
        let digest = self.book.digest(secret_id.expose());

        let consumed = self.book.locks().with_credential_lock(&digest, || {
            let entry = self
                .book
                .load_for(name, secret_id, &digest)?
                .filter(|entry| entry.scope.permits(None))
                .ok_or(AppGroupError::InvalidCredential)?;
            entry.check_usable(now)?;
            let consumed = entry.consumed(now);
            self.book.save(&consumed)?;
            Ok::<_, AppGroupError>(consumed)
        })?;

        tracing::debug!(
            app = name,
            accessor = %consumed.accessor,
            remaining_uses = ?consumed.remaining_uses,
            "consumed secret id"
        );
        Ok(AppGrant {
            app,
            accessor: consumed.accessor,
            remaining_uses: consumed.remaining_uses,
        })
    }

    /// Looks up a secret ID by its raw value.
    ///
    /// # Errors
    ///
    /// Returns [`AppGroupError::NotFound`] if the app does not exist.
    pub fn read_secret_id(
        &self,
        name: &str,
        secret_id: &SecretId,
    ) -> AppGroupResult<Option<SecretIdInfo>> {
        let _app = self.book.locks().app_read();
        self.require_app(name)?;
        let digest = self.book.digest(secret_id.expose());
        Ok(self
            .book
            .load_for(name, secret_id, &digest)?
            .map(|entry| entry.info()))
    }

    /// Looks up a secret ID by its accessor.
    ///
    /// # Errors
    ///
    /// Returns [`AppGroupError::NotFound`] if the app does not exist.
    pub fn read_secret_id_by_accessor(
        &self,
        name: &str,
        accessor: &str,
    ) -> AppGroupResult<Option<SecretIdInfo>> {
        let _app = self.book.locks().app_read();
        self.require_app(name)?;
        Ok(self
            .book
            .resolve_accessor(name, accessor)?
            .map(|entry| entry.info()))
    }

    /// Lists the accessors of every secret ID stored for the app.
    ///
    /// # Errors
    ///
    /// Returns [`AppGroupError::NotFound`] if the app does not exist.
    pub fn list_secret_id_accessors(&self, name: &str) -> AppGroupResult<Vec<String>> {
        let _app = self.book.locks().app_read();
        self.require_app(name)?;
        let mut accessors: Vec<String> = self
            .book
            .entries(name)?
            .into_iter()
            .map(|entry| entry.accessor)
            .collect();
        accessors.sort();
        Ok(accessors)
    }

    /// Destroys a secret ID by its raw value.
    ///
    /// # Errors
    ///
    /// Returns [`AppGroupError::NotFound`] if the app or the secret ID does
    /// not exist.
    pub fn destroy_secret_id(&self, name: &str, secret_id: &SecretId) -> AppGroupResult<()> {
        let _app = self.book.locks().app_read();
        self.require_app(name)?;
        let digest = self.book.digest(secret_id.expose());
        let removed = self.book.locks().with_credential_lock(&digest, || {
            let entry = self.book.load_for(name, secret_id, &digest)?;
            if let Some(entry) = &entry {
                self.book.remove_locked(entry)?;
            }
            Ok::<_, AppGroupError>(entry)
        })?;
        let entry = removed.ok_or_else(|| AppGroupError::not_found("secret_id", "<redacted>"))?;
        tracing::info!(app = name, accessor = %entry.accessor, "destroyed secret id");
        Ok(())
    }

    /// Destroys a secret ID by its accessor.
    ///
    /// # Errors
    ///
    /// Returns [`AppGroupError::NotFound`] if the app or the accessor does
    /// not exist.
    pub fn destroy_secret_id_by_accessor(&self, name: &str, accessor: &str) -> AppGroupResult<()> {
        let _app = self.book.locks().app_read();
        self.require_app(name)?;
        let entry = self
            .book
            .resolve_accessor(name, accessor)?
            .ok_or_else(|| AppGroupError::not_found("secret_id_accessor", accessor))?;
        self.book.remove(name, &entry.digest)?;
        tracing::info!(app = name, accessor, "destroyed secret id");
        Ok(())
    }

    /// Removes every expired or exhausted secret ID across all apps and
    /// returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns storage errors unmodified.
    pub fn tidy_secret_ids(&self, now: u64) -> AppGroupResult<usize> {
        let _app = self.book.locks().app_read();
        let _generic = self.book.locks().generic_write();
        self.tidy_secret_ids_locked(now)
    }

    /// Member pass of [`Self::tidy_secret_ids`]. The caller holds the app
    /// read lock and the generic write lock.
    pub(crate) fn tidy_secret_ids_locked(&self, now: u64) -> AppGroupResult<usize> {
        let mut removed = 0;
        for app in self.book.storage().list("secret_id/")? {
            let app = app.trim_end_matches('/');
            for digest in self.book.digests(app)? {
                let tidied = self.book.locks().with_credential_lock(&digest, || {
                    match self.book.load(app, &digest)? {
                        Some(entry) if entry.is_expired(now) || entry.is_exhausted() => {
                            self.book.remove_locked(&entry)?;
                            Ok::<_, AppGroupError>(true)
                        }
                        _ => Ok(false),
                    }
                })?;
                removed += usize::from(tidied);
            }
        }
        tracing::info!(removed, "tidied secret ids");
        Ok(removed)
    }

    /// Reads an app without taking the app lock.
    pub(crate) fn load_app(&self, name: &str) -> AppGroupResult<Option<AppEntry>> {
        Ok(read_json(self.book.storage(), &app_key(name))?)
    }

    pub(crate) fn require_app(&self, name: &str) -> AppGroupResult<AppEntry> {
        self.load_app(name)?
            .ok_or_else(|| AppGroupError::not_found("app", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::SaltedHasher;
    use crate::locks::LockRegistry;
    use crate::storage::{MemoryStorage, Storage};

    const HOUR_MS: u64 = 60 * 60 * 1_000;

    fn store() -> (Arc<MemoryStorage>, AppStore) {
        let storage = Arc::new(MemoryStorage::new());
        let book = SecretIdBook::new(
            storage.clone(),
            Arc::new(SaltedHasher::from_salt([5u8; 32])),
            Arc::new(LockRegistry::new()),
        );
        (storage, AppStore::new(book, Arc::new(BackendConfig::default())))
    }

    fn web_config() -> AppConfig {
        AppConfig {
            policies: Some(vec!["Dev".to_string(), " ops ".to_string(), "dev".to_string()]),
            secret_id_num_uses: Some(2),
            secret_id_ttl: Some(Duration::from_secs(3_600)),
            ..AppConfig::default()
        }
    }

    #[test]
    fn test_write_read_update_app() {
        let (_, apps) = store();
        let created = apps.write_app("web", web_config()).expect("create");
        assert_eq!(created.policies, vec!["dev", "ops"]);
        assert_eq!(created.token_ttl, crate::config::DEFAULT_TOKEN_TTL);

        let updated = apps
            .write_app(
                "web",
                AppConfig {
                    secret_id_num_uses: Some(7),
                    ..AppConfig::default()
                },
            )
            .expect("update");
        assert_eq!(updated.secret_id_num_uses, 7);
        assert_eq!(updated.policies, vec!["dev", "ops"]);
        assert_eq!(updated.secret_id_ttl, Duration::from_secs(3_600));

        assert_eq!(apps.read_app("web").expect("read"), Some(updated));
        assert_eq!(apps.list_apps().expect("list"), vec!["web"]);
    }

    #[test]
    fn test_write_app_rejects_ttl_above_max() {
        let (_, apps) = store();
        let result = apps.write_app(
            "web",
            AppConfig {
                token_ttl: Some(Duration::from_secs(10)),
                token_max_ttl: Some(Duration::from_secs(5)),
                ..AppConfig::default()
            },
        );
        assert!(matches!(result, Err(AppGroupError::Validation(_))));
    }

    #[test]
    fn test_generate_requires_existing_app() {
        let (_, apps) = store();
        match apps.generate_secret_id("ghost", GenerateParams::default(), 0) {
            Err(AppGroupError::NotFound { kind: "app", .. }) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_two_uses_then_exhausted() {
        let (_, apps) = store();
        apps.write_app("web", web_config()).expect("create");
        let issued = apps
            .generate_secret_id("web", GenerateParams::default(), 1_000)
            .expect("generate");
        assert_eq!(issued.num_uses, Some(2));
        assert_eq!(issued.expires_at, Some(1_000 + HOUR_MS));

        let first = apps
            .validate_and_consume("web", &issued.secret_id, 2_000)
            .expect("first login");
        assert_eq!(first.remaining_uses, Some(1));
        assert_eq!(first.accessor, issued.accessor);
        assert_eq!(first.app.policies, vec!["dev", "ops"]);

        let second = apps
            .validate_and_consume("web", &issued.secret_id, 3_000)
            .expect("second login");
        assert_eq!(second.remaining_uses, Some(0));

        match apps.validate_and_consume("web", &issued.secret_id, 4_000) {
            Err(AppGroupError::Exhausted) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_secret_and_unknown_app_are_invalid_credentials() {
        let (_, apps) = store();
        apps.write_app("web", web_config()).expect("create");
        let bogus = SecretId::new("not-a-secret");
        assert!(matches!(
            apps.validate_and_consume("web", &bogus, 0),
            Err(AppGroupError::InvalidCredential)
        ));
        assert!(matches!(
            apps.validate_and_consume("ghost", &bogus, 0),
            Err(AppGroupError::InvalidCredential)
        ));
    }

    #[test]
    fn test_secret_is_bound_to_its_app() {
        let (_, apps) = store();
        apps.write_app("web", web_config()).expect("create");
        apps.write_app("db", web_config()).expect("create");
        let issued = apps
            .generate_secret_id("web", GenerateParams::default(), 0)
            .expect("generate");
        assert!(matches!(
            apps.validate_and_consume("db", &issued.secret_id, 1),
            Err(AppGroupError::InvalidCredential)
        ));
    }

    #[test]
    fn test_raw_value_never_reaches_storage() {
        let (storage, apps) = store();
        apps.write_app("web", web_config()).expect("create");
        let issued = apps
            .generate_secret_id("web", GenerateParams::default(), 0)
            .expect("generate");
        let raw = issued.secret_id.expose().as_bytes().to_vec();

        for (key, value) in storage.snapshot().expect("snapshot") {
            assert!(!key.contains(issued.secret_id.expose()), "raw value in key {key}");
            assert!(
                !value.windows(raw.len()).any(|window| window == raw.as_slice()),
                "raw value stored at {key}"
            );
        }

        let info = apps
            .read_secret_id_by_accessor("web", &issued.accessor)
            .expect("lookup")
            .expect("present");
        let rendered = serde_json::to_string(&info).expect("json");
        assert!(!rendered.contains(issued.secret_id.expose()));
    }

    #[test]
    fn test_custom_secret_id_rejects_duplicates_and_empty() {
        let (_, apps) = store();
        apps.write_app("web", web_config()).expect("create");
        apps.generate_custom_secret_id("web", "custom-1".into(), GenerateParams::default(), 0)
            .expect("custom");
        assert!(matches!(
            apps.generate_custom_secret_id("web", "custom-1".into(), GenerateParams::default(), 0),
            Err(AppGroupError::Validation(_))
        ));
        assert!(matches!(
            apps.generate_custom_secret_id("web", "".into(), GenerateParams::default(), 0),
            Err(AppGroupError::Validation(_))
        ));
        apps.validate_and_consume("web", &SecretId::new("custom-1"), 1)
            .expect("login with custom secret");
    }

    #[test]
    fn test_params_override_app_defaults() {
        let (_, apps) = store();
        apps.write_app("web", web_config()).expect("create");
        let issued = apps
            .generate_secret_id(
                "web",
                GenerateParams {
                    num_uses: Some(0),
                    ttl: Some(Duration::ZERO),
                    metadata: [("host".to_string(), "ci-1".to_string())].into(),
                },
                0,
            )
            .expect("generate");
        assert_eq!(issued.num_uses, None);
        assert_eq!(issued.expires_at, None);

        let info = apps
            .read_secret_id("web", &issued.secret_id)
            .expect("read")
            .expect("present");
        assert_eq!(info.metadata.get("host").map(String::as_str), Some("ci-1"));
        for now in 0..5 {
            apps.validate_and_consume("web", &issued.secret_id, now)
                .expect("unlimited login");
        }
    }

    #[test]
    fn test_accessor_lookup_list_and_destroy() {
        let (_, apps) = store();
        apps.write_app("web", web_config()).expect("create");
        let a = apps
            .generate_secret_id("web", GenerateParams::default(), 0)
            .expect("generate");
        let b = apps
            .generate_secret_id("web", GenerateParams::default(), 0)
            .expect("generate");

        let mut expected = vec![a.accessor.clone(), b.accessor.clone()];
        expected.sort();
        assert_eq!(apps.list_secret_id_accessors("web").expect("list"), expected);

        apps.destroy_secret_id_by_accessor("web", &a.accessor)
            .expect("destroy by accessor");
        assert!(apps
            .read_secret_id_by_accessor("web", &a.accessor)
            .expect("lookup")
            .is_none());
        assert!(matches!(
            apps.destroy_secret_id_by_accessor("web", &a.accessor),
            Err(AppGroupError::NotFound { .. })
        ));

        apps.destroy_secret_id("web", &b.secret_id).expect("destroy by value");
        assert!(apps.list_secret_id_accessors("web").expect("list").is_empty());
        assert!(matches!(
            apps.validate_and_consume("web", &b.secret_id, 1),
            Err(AppGroupError::InvalidCredential)
        ));
    }

    #[test]
    fn test_accessor_of_other_app_is_not_resolved() {
        let (_, apps) = store();
        apps.write_app("web", web_config()).expect("create");
        apps.write_app("db", web_config()).expect("create");
        let issued = apps
            .generate_secret_id("web", GenerateParams::default(), 0)
            .expect("generate");
        assert!(apps
            .read_secret_id_by_accessor("db", &issued.accessor)
            .expect("lookup")
            .is_none());
    }

    #[test]
    fn test_delete_app_cascades() {
        let (storage, apps) = store();
        apps.write_app("web", web_config()).expect("create");
        let issued = apps
            .generate_secret_id("web", GenerateParams::default(), 0)
            .expect("generate");

        apps.delete_app("web").expect("delete");
        assert!(apps.read_app("web").expect("read").is_none());
        assert!(storage.list("secret_id/").expect("list").is_empty());
        assert!(storage.list("accessor/").expect("list").is_empty());

        apps.write_app("web", web_config()).expect("recreate");
        assert!(matches!(
            apps.validate_and_consume("web", &issued.secret_id, 1),
            Err(AppGroupError::InvalidCredential)
        ));
    }

    #[test]
    fn test_tidy_removes_only_dead_secret_ids() {
        let (_, apps) = store();
        apps.write_app("web", web_config()).expect("create");
        let expiring = apps
            .generate_secret_id(
                "web",
                GenerateParams {
                    ttl: Some(Duration::from_millis(10)),
                    ..GenerateParams::default()
                },
                0,
            )
            .expect("generate");
        let single = apps
            .generate_secret_id(
                "web",
                GenerateParams {
                    num_uses: Some(1),
                    ..GenerateParams::default()
                },
                0,
            )
            .expect("generate");
        let live = apps
            .generate_secret_id("web", GenerateParams::default(), 0)
            .expect("generate");
        apps.validate_and_consume("web", &single.secret_id, 1)
            .expect("spend single use");

        assert_eq!(apps.tidy_secret_ids(100).expect("tidy"), 2);
        assert_eq!(
            apps.list_secret_id_accessors("web").expect("list"),
            vec![live.accessor]
        );
        assert!(apps
            .read_secret_id_by_accessor("web", &expiring.accessor)
            .expect("lookup")
            .is_none());
    }
}
