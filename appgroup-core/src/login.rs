//! Login and renewal.
//!
//! An attempt moves `Received → Resolved → Validating → Validated | Denied`.
//! Only a validated attempt produces an [`Auth`]; the host turns it into a
//! token. Renewal never touches secret IDs, it only checks that whatever
//! produced the grant still exists.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::app::AppStore;
use crate::duration::{self, as_millis_u64};
use crate::error::{AppGroupError, AppGroupResult};
use crate::group::GroupStore;
use crate::secret_id::SecretId;

/// Kind of entity a login was made against.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SelectorType {
    /// A single app.
    App,
    /// A group of apps.
    Group,
}

/// The app or group a grant originates from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector {
    /// Kind of entity.
    #[serde(rename = "type")]
    pub kind: SelectorType,
    /// Name of the app or group.
    pub name: String,
}

/// A login attempt.
#[derive(Debug)]
pub enum LoginRequest {
    /// Log in as an app with one of its secret IDs.
    App {
        /// App name.
        name: String,
        /// Raw secret value.
        secret_id: SecretId,
    },
    /// Log in as a group with one secret ID per member app.
    Group {
        /// Group name.
        name: String,
        /// Raw secret value per member app.
        secret_ids: BTreeMap<String, SecretId>,
    },
}

/// Lifetime parameters of a grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Time to live from now.
    #[serde(with = "duration::serde_secs")]
    pub ttl: Duration,
    /// Upper bound on the grant's total lifetime (zero = unbounded).
    #[serde(with = "duration::serde_secs")]
    pub max_ttl: Duration,
    /// Whether the grant may be renewed.
    pub renewable: bool,
    /// Time of the original login, unix milliseconds.
    pub issued_at: u64,
}

impl Lease {
    /// Builds the lease for a grant issued at `issued_at`, seen from `now`.
    ///
    /// A zero `token_ttl` falls back to the time left under `max_ttl`.
    ///
    /// # Errors
    ///
    /// Returns [`AppGroupError::LeaseExpired`] once `issued_at + max_ttl`
    /// has passed.
    pub fn compute(
        token_ttl: Duration,
        max_ttl: Duration,
        issued_at: u64,
        now: u64,
    ) -> AppGroupResult<Self> {
        let ttl = if max_ttl.is_zero() {
            token_ttl
        } else {
            let deadline = issued_at.saturating_add(as_millis_u64(max_ttl));
            if now >= deadline {
                return Err(AppGroupError::LeaseExpired);
            }
            let left = Duration::from_millis(deadline - now);
            if token_ttl.is_zero() {
                left
            } else {
                token_ttl.min(left)
            }
        };
        Ok(Self {
            ttl,
            max_ttl,
            renewable: true,
            issued_at,
        })
    }
}

/// What a successful login grants. The host mints a token from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Auth {
    /// Sorted policy names.
    pub policies: Vec<String>,
    /// `selector_type` and `selector_value` of the origin.
    pub metadata: BTreeMap<String, String>,
    /// Origin of the grant, used on renewal.
    pub selector: Selector,
    /// Accessor of each consumed secret ID, keyed by app.
    pub accessors: BTreeMap<String, String>,
    /// Lifetime of the grant.
    pub lease: Lease,
}

impl Auth {
    fn new(
        kind: SelectorType,
        name: &str,
        policies: Vec<String>,
        accessors: BTreeMap<String, String>,
        lease: Lease,
    ) -> Self {
        let metadata = BTreeMap::from([
            ("selector_type".to_string(), kind.to_string()),
            ("selector_value".to_string(), name.to_string()),
        ]);
        Self {
            policies,
            metadata,
            selector: Selector {
                kind,
                name: name.to_string(),
            },
            accessors,
            lease,
        }
    }
}

/// Validates login attempts and renews grants.
#[derive(Clone)]
pub struct LoginEngine {
    groups: GroupStore,
}

impl LoginEngine {
    pub(crate) const fn new(groups: GroupStore) -> Self {
        Self { groups }
    }

    fn apps(&self) -> &AppStore {
        self.groups.apps()
    }

    /// Validates the credential in `request` and consumes one use of every
    /// secret ID it presents.
    ///
    /// # Errors
    ///
    /// Returns [`AppGroupError::InvalidCredential`],
    /// [`AppGroupError::Expired`] or [`AppGroupError::Exhausted`] when the
    /// credential is rejected, and a validation error for a malformed group
    /// request.
    pub fn login(&self, request: LoginRequest, now: u64) -> AppGroupResult<Auth> {
        match request {
            LoginRequest::App { name, secret_id } => {
                let grant = self.apps().validate_and_consume(&name, &secret_id, now)?;
                let lease =
                    Lease::compute(grant.app.token_ttl, grant.app.token_max_ttl, now, now)?;
                tracing::info!(app = %name, accessor = %grant.accessor, "app login");
                Ok(Auth::new(
                    SelectorType::App,
                    &name,
                    grant.app.policies,
                    BTreeMap::from([(name.clone(), grant.accessor)]),
                    lease,
                ))
            }
            LoginRequest::Group { name, secret_ids } => {
                let grant = self
                    .groups
                    .validate_and_consume_all(&name, &secret_ids, now)?;
                let lease = Lease::compute(
                    grant.group.token_ttl,
                    grant.group.token_max_ttl,
                    now,
                    now,
                )?;
                tracing::info!(group = %name, members = grant.accessors.len(), "group login");
                Ok(Auth::new(
                    SelectorType::Group,
                    &name,
                    grant.policies,
                    grant.accessors,
                    lease,
                ))
            }
        }
    }

    /// Extends a grant, re-reading the current token TTLs of its origin.
    ///
    /// # Errors
    ///
    /// Returns [`AppGroupError::NotFound`] if the originating app, group or
    /// any member app of the group no longer exists, and
    /// [`AppGroupError::LeaseExpired`] past the grant's maximum lifetime.
    pub fn renew(&self, auth: &Auth, now: u64) -> AppGroupResult<Lease> {
        let name = auth.selector.name.as_str();
        let (token_ttl, token_max_ttl) = match auth.selector.kind {
            SelectorType::App => {
                let app = self
                    .apps()
                    .read_app(name)?
                    .ok_or_else(|| AppGroupError::not_found("app", name))?;
                (app.token_ttl, app.token_max_ttl)
            }
            SelectorType::Group => {
                let group = self
                    .groups
                    .read_group(name)?
                    .ok_or_else(|| AppGroupError::not_found("group", name))?;
                for app in &group.apps {
                    if self.apps().read_app(app)?.is_none() {
                        return Err(AppGroupError::not_found("app", app.as_str()));
                    }
                }
                (group.token_ttl, group.token_max_ttl)
            }
        };
        let lease = Lease::compute(token_ttl, token_max_ttl, auth.lease.issued_at, now)?;
        tracing::debug!(selector = %auth.selector.kind, name, ttl = ?lease.ttl, "renewed grant");
        Ok(lease)
    }
}
