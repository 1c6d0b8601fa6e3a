//! Composition root wiring storage, hashing, locking and the stores together.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::app::AppStore;
use crate::config::BackendConfig;
use crate::error::{AppGroupResult, ErrorResponse};
use crate::group::GroupStore;
use crate::hasher::SaltedHasher;
use crate::locks::LockRegistry;
use crate::login::{Auth, LoginEngine};
use crate::routes::{self, Request, Response, Route};
use crate::secret_id::SecretIdBook;
use crate::storage::Storage;

/// A token minted by the host for a successful login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedToken {
    /// Opaque bearer token handed to the client.
    pub client_token: String,
    /// Non-secret identifier of the token.
    pub accessor: String,
}

/// Host hook that turns a grant into a token.
pub trait TokenIssuer: Send + Sync {
    /// Mints a token for `auth`.
    ///
    /// # Errors
    ///
    /// Returns an error if the token cannot be issued.
    fn issue(&self, auth: &Auth) -> AppGroupResult<IssuedToken>;
}

/// Issues random UUID v4 tokens. Used when the host supplies no issuer.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomTokenIssuer;

impl TokenIssuer for RandomTokenIssuer {
    fn issue(&self, _auth: &Auth) -> AppGroupResult<IssuedToken> {
        Ok(IssuedToken {
            client_token: Uuid::new_v4().to_string(),
            accessor: Uuid::new_v4().to_string(),
        })
    }
}

/// The AppGroup credential backend.
pub struct Backend {
    locks: Arc<LockRegistry>,
    apps: AppStore,
    groups: GroupStore,
    login: LoginEngine,
    issuer: Arc<dyn TokenIssuer>,
    routes: Vec<Route>,
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("locks", &self.locks)
            .field("routes", &self.routes.len())
            .finish_non_exhaustive()
    }
}

impl Backend {
    /// Builds a backend over `storage`, loading or creating the salt.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the salt cannot be read or persisted.
    pub fn new(storage: Arc<dyn Storage>, config: BackendConfig) -> AppGroupResult<Self> {
        let hasher = Arc::new(SaltedHasher::initialize(storage.as_ref())?);
        let locks = Arc::new(LockRegistry::new());
        let config = Arc::new(config);
        let book = SecretIdBook::new(storage, hasher, Arc::clone(&locks));
        let apps = AppStore::new(book.clone(), Arc::clone(&config));
        let groups = GroupStore::new(book, apps.clone(), config);
        let login = LoginEngine::new(groups.clone());
        let routes = routes::table();
        tracing::debug!(routes = routes.len(), "backend ready");
        Ok(Self {
            locks,
            apps,
            groups,
            login,
            issuer: Arc::new(RandomTokenIssuer),
            routes,
        })
    }

    /// Replaces the token issuer used by the `login` route.
    #[must_use]
    pub fn with_token_issuer(mut self, issuer: Arc<dyn TokenIssuer>) -> Self {
        self.issuer = issuer;
        self
    }

    /// App administration and app-level secret IDs.
    #[must_use]
    pub const fn apps(&self) -> &AppStore {
        &self.apps
    }

    /// Group administration and group-level secret IDs.
    #[must_use]
    pub const fn groups(&self) -> &GroupStore {
        &self.groups
    }

    /// Login and renewal.
    #[must_use]
    pub const fn login_engine(&self) -> &LoginEngine {
        &self.login
    }

    /// The lock registry shared by every store.
    #[must_use]
    pub fn locks(&self) -> &LockRegistry {
        &self.locks
    }

    pub(crate) fn issuer(&self) -> &dyn TokenIssuer {
        self.issuer.as_ref()
    }

    /// Dispatches a request through the route table.
    ///
    /// Credential failures on login all map to the same
    /// [`ErrorResponse::permission_denied`].
    ///
    /// # Errors
    ///
    /// Returns the error response for any failed request.
    pub fn handle(&self, request: &Request) -> Result<Response, ErrorResponse> {
        routes::dispatch(self, &self.routes, request).map_err(|err| {
            if err.is_login_denial() {
                tracing::info!(path = %request.path, reason = err.code(), "login denied");
            } else {
                tracing::warn!(path = %request.path, %err, "request failed");
            }
            ErrorResponse::from(&err)
        })
    }
}
