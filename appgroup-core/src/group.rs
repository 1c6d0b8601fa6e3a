//! Groups of apps and the composite secret IDs issued for them.
//!
//! A group login must present a valid secret ID for every member app. The
//! members' secrets are validated together under their credential locks and
//! only consumed once all of them pass.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::app::{AppEntry, AppStore};
use crate::config::BackendConfig;
use crate::duration;
use crate::error::{AppGroupError, AppGroupResult};
use crate::secret_id::{
    GenerateParams, IssueRequest, SecretId, SecretIdBook, SecretIdEntry, SecretIdInfo,
    SecretIdScope,
};
use crate::storage::{list_leaves, read_json, write_json};
use crate::validation::{sanitize_policies, validate_name, validate_token_ttls};

const GROUP_PREFIX: &str = "group/";

fn group_key(name: &str) -> String {
    format!("{GROUP_PREFIX}{name}")
}

const COMPOSITE_ROOT: &str = "group_secret_id/";

fn composite_prefix(group: &str) -> String {
    format!("{COMPOSITE_ROOT}{group}/")
}

fn composite_key(group: &str, accessor_digest: &str) -> String {
    format!("{COMPOSITE_ROOT}{group}/{accessor_digest}")
}

/// A stored group definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupEntry {
    /// Unique, immutable name.
    pub name: String,
    /// Member app names, unique, in the order they were configured.
    pub apps: Vec<String>,
    /// Policies added on top of the member apps' policies.
    pub policies: Vec<String>,
    /// Number of uses for secret IDs generated through the group (0 = unlimited).
    pub secret_id_num_uses: u32,
    /// Lifetime of secret IDs generated through the group (zero = no expiry).
    #[serde(with = "duration::serde_secs")]
    pub secret_id_ttl: Duration,
    /// Lifetime of issued tokens.
    #[serde(with = "duration::serde_secs")]
    pub token_ttl: Duration,
    /// Maximum lifetime of issued tokens across renewals (zero = unbounded).
    #[serde(with = "duration::serde_secs")]
    pub token_max_ttl: Duration,
}

/// Fields of a group create or update request. `apps` is required when the
/// group is new.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupConfig {
    /// Member app names.
    pub apps: Option<Vec<String>>,
    /// Additional policies.
    pub policies: Option<Vec<String>>,
    /// Number of uses for generated secret IDs.
    pub secret_id_num_uses: Option<u32>,
    /// Lifetime of generated secret IDs.
    pub secret_id_ttl: Option<Duration>,
    /// Lifetime of issued tokens.
    pub token_ttl: Option<Duration>,
    /// Maximum lifetime of issued tokens.
    pub token_max_ttl: Option<Duration>,
}

/// One member's share of a composite secret ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct MemberSecret {
    accessor: String,
    digest: String,
}

/// Persisted composite record tying the member secrets of one group
/// generation together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct GroupSecretIdEntry {
    accessor: String,
    group: String,
    members: BTreeMap<String, MemberSecret>,
    created_at: u64,
    expires_at: Option<u64>,
    num_uses: Option<u32>,
}

/// Secret IDs freshly generated for every member of a group.
#[derive(Debug)]
pub struct GroupSecretIdResponse {
    /// Accessor of the composite record.
    pub accessor: String,
    /// Raw secret value per member app.
    pub secret_ids: BTreeMap<String, SecretId>,
    /// Accessor of each member's secret ID.
    pub member_accessors: BTreeMap<String, String>,
    /// Expiration time, unix milliseconds.
    pub expires_at: Option<u64>,
    /// Number of logins allowed; `None` means unlimited.
    pub num_uses: Option<u32>,
}

/// Administrative view of a composite secret ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupSecretIdInfo {
    /// Accessor of the composite record.
    pub accessor: String,
    /// Group the record belongs to.
    pub group: String,
    /// Member secret IDs that still exist, keyed by app.
    pub members: BTreeMap<String, SecretIdInfo>,
    /// Creation time, unix milliseconds.
    pub created_at: u64,
    /// Expiration time, unix milliseconds.
    pub expires_at: Option<u64>,
}

/// Result of a successful group validate-and-consume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupGrant {
    /// The group as it was when its members were validated.
    pub group: GroupEntry,
    /// Sorted union of the members' and the group's policies.
    pub policies: Vec<String>,
    /// Accessor of the consumed secret ID per member app.
    pub accessors: BTreeMap<String, String>,
}

/// CRUD for groups and their composite secret IDs.
#[derive(Clone)]
pub struct GroupStore {
    book: SecretIdBook,
    apps: AppStore,
    config: Arc<BackendConfig>,
}

impl GroupStore {
    pub(crate) const fn new(book: SecretIdBook, apps: AppStore, config: Arc<BackendConfig>) -> Self {
        Self { book, apps, config }
    }

    /// Creates the group or updates its definition.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a bad name, an empty or duplicated
    /// member list or inconsistent TTLs, and [`AppGroupError::NotFound`] if a
    /// member app does not exist.
    pub fn write_group(&self, name: &str, config: GroupConfig) -> AppGroupResult<GroupEntry> {
        validate_name("group", name)?;
        let _group = self.book.locks().group_write();
        let _app = self.book.locks().app_read();

        let existing = self.load_group(name)?;
        let created = existing.is_none();
        let apps = match (config.apps, &existing) {
            (Some(apps), _) => self.check_members(&apps)?,
            (None, Some(existing)) => existing.apps.clone(),
            (None, None) => {
                return Err(AppGroupError::Validation(
                    "a new group needs at least one member app".to_string(),
                ))
            }
        };
        let base = existing.unwrap_or_else(|| GroupEntry {
            name: name.to_string(),
            apps: Vec::new(),
            policies: Vec::new(),
            secret_id_num_uses: self.config.secret_id_num_uses,
            secret_id_ttl: self.config.secret_id_ttl,
            token_ttl: self.config.token_ttl,
            token_max_ttl: self.config.token_max_ttl,
        });
        let entry = GroupEntry {
            name: base.name,
            apps,
            policies: config
                .policies
                .map_or(base.policies, |policies| sanitize_policies(&policies)),
            secret_id_num_uses: config.secret_id_num_uses.unwrap_or(base.secret_id_num_uses),
            secret_id_ttl: config.secret_id_ttl.unwrap_or(base.secret_id_ttl),
            token_ttl: config.token_ttl.unwrap_or(base.token_ttl),
            token_max_ttl: config.token_max_ttl.unwrap_or(base.token_max_ttl),
        };
        validate_token_ttls(entry.token_ttl, entry.token_max_ttl)?;

        write_json(self.book.storage(), &group_key(name), &entry)?;
        tracing::info!(group = name, created, members = ?entry.apps, "wrote group");
        Ok(entry)
    }

    fn check_members(&self, apps: &[String]) -> AppGroupResult<Vec<String>> {
        if apps.is_empty() {
            return Err(AppGroupError::Validation(
                "a group needs at least one member app".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for app in apps {
            validate_name("app", app)?;
            if !seen.insert(app.as_str()) {
                return Err(AppGroupError::Validation(format!(
                    "app '{app}' is listed more than once"
                )));
            }
            self.apps.require_app(app)?;
        }
        Ok(apps.to_vec())
    }

    /// Reads a group definition.
    ///
    /// # Errors
    ///
    /// Returns storage errors unmodified.
    pub fn read_group(&self, name: &str) -> AppGroupResult<Option<GroupEntry>> {
        let _group = self.book.locks().group_read();
        self.load_group(name)
    }

    /// Lists group names in ascending order.
    ///
    /// # Errors
    ///
    /// Returns storage errors unmodified.
    pub fn list_groups(&self) -> AppGroupResult<Vec<String>> {
        let _group = self.book.locks().group_read();
        Ok(list_leaves(self.book.storage(), GROUP_PREFIX)?)
    }

    /// Deletes a group, its composite records and every member secret ID
    /// issued through it. Deleting a missing group is a no-op.
    ///
    /// # Errors
    ///
    /// Returns storage errors unmodified.
    pub fn delete_group(&self, name: &str) -> AppGroupResult<()> {
        validate_name("group", name)?;
        let _group = self.book.locks().group_write();
        let _app = self.book.locks().app_read();
        let _generic = self.book.locks().generic_write();

        let composites = self.composites(name)?;
        for (key, composite) in &composites {
            self.remove_composite(key, composite)?;
        }
        self.book.storage().delete(&group_key(name))?;
        tracing::info!(group = name, secret_ids = composites.len(), "deleted group");
        Ok(())
    }

    /// Generates one secret ID per member app, usable only for logins on
    /// this group, and records them under a single group accessor.
    ///
    /// # Errors
    ///
    /// Returns [`AppGroupError::NotFound`] if the group or one of its member
    /// apps does not exist.
    pub fn generate_secret_id(
        &self,
        name: &str,
        params: GenerateParams,
        now: u64,
    ) -> AppGroupResult<GroupSecretIdResponse> {
        let _group = self.book.locks().group_read();
        let _app = self.book.locks().app_read();
        let group = self.require_group(name)?;
        for app in &group.apps {
            self.apps.require_app(app)?;
        }

        let num_uses = params.num_uses.unwrap_or(group.secret_id_num_uses);
        let ttl = params.ttl.unwrap_or(group.secret_id_ttl);
        let mut secret_ids = BTreeMap::new();
        let mut members = BTreeMap::new();
        let mut expires_at = None;
        let mut limited = None;

        for app in &group.apps {
            let issued = self.book.issue(IssueRequest {
                app,
                secret_id: SecretId::generate(),
                num_uses,
                ttl,
                scope: SecretIdScope::Group(name.to_string()),
                metadata: params.metadata.clone(),
                now,
            });
            let issued = match issued {
                Ok(issued) => issued,
                Err(err) => {
                    self.discard_members(&members);
                    return Err(err);
                }
            };
            expires_at = issued.expires_at;
            limited = issued.num_uses;
            members.insert(
                app.clone(),
                MemberSecret {
                    accessor: issued.accessor.clone(),
                    digest: self.book.digest(issued.secret_id.expose()),
                },
            );
            secret_ids.insert(app.clone(), issued.secret_id);
        }

        let composite = GroupSecretIdEntry {
            accessor: uuid::Uuid::new_v4().to_string(),
            group: name.to_string(),
            members,
            created_at: now,
            expires_at,
            num_uses: limited,
        };
        let key = composite_key(name, &self.book.digest(&composite.accessor));
        {
            let _generic = self.book.locks().generic_write();
            if let Err(err) = write_json(self.book.storage(), &key, &composite) {
                self.discard_members(&composite.members);
                return Err(err.into());
            }
        }

        tracing::debug!(group = name, accessor = %composite.accessor, "issued group secret id");
        Ok(GroupSecretIdResponse {
            member_accessors: composite
                .members
                .iter()
                .map(|(app, member)| (app.clone(), member.accessor.clone()))
                .collect(),
            accessor: composite.accessor,
            secret_ids,
            expires_at,
            num_uses: limited,
        })
    }

    /// Best-effort removal of member secrets issued before a failure.
    fn discard_members(&self, members: &BTreeMap<String, MemberSecret>) {
        for (app, member) in members {
            if let Err(err) = self.book.remove(app, &member.digest) {
                tracing::warn!(app = %app, accessor = %member.accessor, %err, "failed to discard member secret id");
            }
        }
    }

    /// Lists the accessors of the group's composite secret IDs.
    ///
    /// # Errors
    ///
    /// Returns [`AppGroupError::NotFound`] if the group does not exist.
    pub fn list_secret_id_accessors(&self, name: &str) -> AppGroupResult<Vec<String>> {
        let _group = self.book.locks().group_read();
        self.require_group(name)?;
        let _generic = self.book.locks().generic_read();
        let mut accessors: Vec<String> = self
            .composites(name)?
            .into_iter()
            .map(|(_, composite)| composite.accessor)
            .collect();
        accessors.sort();
        Ok(accessors)
    }

    /// Looks up a composite secret ID by its group accessor.
    ///
    /// # Errors
    ///
    /// Returns [`AppGroupError::NotFound`] if the group does not exist.
    pub fn read_secret_id_by_accessor(
        &self,
        name: &str,
        accessor: &str,
    ) -> AppGroupResult<Option<GroupSecretIdInfo>> {
        let _group = self.book.locks().group_read();
        self.require_group(name)?;
        let _app = self.book.locks().app_read();
        let _generic = self.book.locks().generic_read();

        let key = composite_key(name, &self.book.digest(accessor));
        let Some(composite) = read_json::<GroupSecretIdEntry>(self.book.storage(), &key)? else {
            return Ok(None);
        };
        let mut members = BTreeMap::new();
        for (app, member) in &composite.members {
            if let Some(entry) = self.book.load(app, &member.digest)? {
                members.insert(app.clone(), entry.info());
            }
        }
        Ok(Some(GroupSecretIdInfo {
            accessor: composite.accessor,
            group: composite.group,
            members,
            created_at: composite.created_at,
            expires_at: composite.expires_at,
        }))
    }

    /// Destroys a composite secret ID and the member secrets it lists.
    ///
    /// # Errors
    ///
    /// Returns [`AppGroupError::NotFound`] if the group or the accessor does
    /// not exist.
    pub fn destroy_secret_id_by_accessor(&self, name: &str, accessor: &str) -> AppGroupResult<()> {
        let _group = self.book.locks().group_read();
        self.require_group(name)?;
        let _app = self.book.locks().app_read();
        let _generic = self.book.locks().generic_write();

        let key = composite_key(name, &self.book.digest(accessor));
        let composite = read_json::<GroupSecretIdEntry>(self.book.storage(), &key)?
            .ok_or_else(|| AppGroupError::not_found("group_secret_id_accessor", accessor))?;
        self.remove_composite(&key, &composite)?;
        tracing::info!(group = name, accessor, "destroyed group secret id");
        Ok(())
    }

    /// Removes expired and exhausted secret IDs across all apps, then every
    /// composite record that has expired or lost a member secret, along with
    /// the member secrets it still lists. Returns the number of records
    /// removed.
    ///
    /// # Errors
    ///
    /// Returns storage errors unmodified.
    pub fn tidy_secret_ids(&self, now: u64) -> AppGroupResult<usize> {
        let _group = self.book.locks().group_read();
        let _app = self.book.locks().app_read();
        let _generic = self.book.locks().generic_write();

        let mut removed = self.apps.tidy_secret_ids_locked(now)?;
        let mut composites = 0;
        for group in self.book.storage().list(COMPOSITE_ROOT)? {
            let group = group.trim_end_matches('/');
            for (key, composite) in self.composites(group)? {
                if self.is_dead(&composite, now)? {
                    removed += self.remove_composite(&key, &composite)? + 1;
                    composites += 1;
                }
            }
        }
        tracing::info!(removed, composites, "tidied group secret ids");
        Ok(removed)
    }

    /// A composite is dead once it expires or any member secret is gone.
    fn is_dead(&self, composite: &GroupSecretIdEntry, now: u64) -> AppGroupResult<bool> {
        if composite.expires_at.is_some_and(|expires_at| now >= expires_at) {
            return Ok(true);
        }
        for (app, member) in &composite.members {
            if self.book.load(app, &member.digest)?.is_none() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Validates one secret per member app and, only if every one of them
    /// is usable, spends one use of each.
    ///
    /// `secret_ids` must name exactly the group's member apps. All member
    /// credential locks are held from the first read to the last write and
    /// every member is checked against the same `now`. If persisting a
    /// decrement fails, the members already written are restored.
    ///
    /// # Errors
    ///
    /// Returns a validation error if `secret_ids` is empty,
    /// [`AppGroupError::InvalidCredential`] if the group is unknown, the
    /// presented apps differ from the member set, or a member app or secret
    /// is unknown, and [`AppGroupError::Expired`] or
    /// [`AppGroupError::Exhausted`] for the first unusable member secret.
    pub fn validate_and_consume_all(
        &self,
        name: &str,
        secret_ids: &BTreeMap<String, SecretId>,
        now: u64,
    ) -> AppGroupResult<GroupGrant> {
        if secret_ids.is_empty() {
            return Err(AppGroupError::Validation(
                "group login needs at least one secret_id".to_string(),
            ));
        }

        let _group = self.book.locks().group_read();
        let _app = self.book.locks().app_read();

        let group = self
            .load_group(name)?
            .ok_or(AppGroupError::InvalidCredential)?;
        let members: BTreeSet<&str> = group.apps.iter().map(String::as_str).collect();
        let presented: BTreeSet<&str> = secret_ids.keys().map(String::as_str).collect();
        if members != presented {
            return Err(AppGroupError::InvalidCredential);
        }

        let mut apps: Vec<AppEntry> = Vec::with_capacity(group.apps.len());
        let mut attempts: Vec<(&str, &SecretId, String)> = Vec::with_capacity(group.apps.len());
        for app in &group.apps {
            apps.push(
                self.apps
                    .load_app(app)?
                    .ok_or(AppGroupError::InvalidCredential)?,
            );
            let secret_id = secret_ids
                .get(app)
                .ok_or(AppGroupError::InvalidCredential)?;
            attempts.push((app.as_str(), secret_id, self.book.digest(secret_id.expose())));
        }

        let digests = attempts.iter().map(|(_, _, digest)| digest.as_str());
        let consumed = self.book.locks().with_credential_locks(digests, || {
            let mut usable = Vec::with_capacity(attempts.len());
            for (app, secret_id, digest) in &attempts {
                let entry = self.book.load_for(app, secret_id, digest)?;
                usable.push(check_member_entry(entry, name, now)?);
            }
            self.consume_all(&usable, now)
        })?;

        let mut policies: BTreeSet<String> = group.policies.iter().cloned().collect();
        for app in &apps {
            policies.extend(app.policies.iter().cloned());
        }
        let accessors = consumed
            .into_iter()
            .map(|entry| (entry.app, entry.accessor))
            .collect();

        tracing::debug!(group = name, "consumed group secret ids");
        Ok(GroupGrant {
            group,
            policies: policies.into_iter().collect(),
            accessors,
        })
    }

    /// Writes the decremented records. The caller holds every credential
    /// lock involved.
    fn consume_all(
        &self,
        usable: &[SecretIdEntry],
        now: u64,
    ) -> AppGroupResult<Vec<SecretIdEntry>> {
        let mut written: Vec<&SecretIdEntry> = Vec::with_capacity(usable.len());
        let mut consumed = Vec::with_capacity(usable.len());
        for entry in usable {
            let next = entry.consumed(now);
            if let Err(err) = self.book.save(&next) {
                for previous in written {
                    if let Err(restore) = self.book.save(previous) {
                        tracing::error!(
                            app = %previous.app,
                            accessor = %previous.accessor,
                            %restore,
                            "failed to restore member secret id"
                        );
                    }
                }
                return Err(err);
            }
            written.push(entry);
            consumed.push(next);
        }
        Ok(consumed)
    }

    /// Reads a group without taking the group lock.
    pub(crate) fn load_group(&self, name: &str) -> AppGroupResult<Option<GroupEntry>> {
        Ok(read_json(self.book.storage(), &group_key(name))?)
    }

    fn require_group(&self, name: &str) -> AppGroupResult<GroupEntry> {
        self.load_group(name)?
            .ok_or_else(|| AppGroupError::not_found("group", name))
    }

    pub(crate) const fn apps(&self) -> &AppStore {
        &self.apps
    }

    fn composites(&self, group: &str) -> AppGroupResult<Vec<(String, GroupSecretIdEntry)>> {
        let mut composites = Vec::new();
        for leaf in list_leaves(self.book.storage(), &composite_prefix(group))? {
            let key = format!("{}{leaf}", composite_prefix(group));
            if let Some(composite) = read_json(self.book.storage(), &key)? {
                composites.push((key, composite));
            }
        }
        Ok(composites)
    }

    /// Deletes the composite record and returns how many member secrets were
    /// still present.
    fn remove_composite(&self, key: &str, composite: &GroupSecretIdEntry) -> AppGroupResult<usize> {
        let mut removed = 0;
        for (app, member) in &composite.members {
            removed += usize::from(self.book.remove(app, &member.digest)?.is_some());
        }
        self.book.storage().delete(key)?;
        Ok(removed)
    }
}

/// A member secret may be app-scoped or issued through this same group.
fn check_member_entry(
    entry: Option<SecretIdEntry>,
    group: &str,
    now: u64,
) -> AppGroupResult<SecretIdEntry> {
    let entry = entry
        .filter(|entry| entry.scope.permits(Some(group)))
        .ok_or(AppGroupError::InvalidCredential)?;
    entry.check_usable(now)?;
    Ok(entry)
}
