#![deny(clippy::all, clippy::pedantic, clippy::nursery)]
//! AppGroup: a credential backend granting tokens to holders of secret IDs
//! bound to apps, or to groups of apps presenting one secret each.
//!
//! The [`Backend`] wires a [`storage::Storage`] implementation to the
//! [`AppStore`], [`GroupStore`] and [`LoginEngine`] and exposes them through
//! [`Backend::handle`].

mod app;
pub use app::{AppConfig, AppEntry, AppGrant, AppStore};

mod backend;
pub use backend::{Backend, IssuedToken, RandomTokenIssuer, TokenIssuer};

mod config;
pub use config::{BackendConfig, DEFAULT_TOKEN_MAX_TTL, DEFAULT_TOKEN_TTL};

mod error;
pub use error::{AppGroupError, AppGroupResult, ErrorResponse};

mod group;
pub use group::{
    GroupConfig, GroupEntry, GroupGrant, GroupSecretIdInfo, GroupSecretIdResponse, GroupStore,
};

mod hasher;
pub use hasher::{SaltedHasher, SALT_KEY, SALT_LEN};

mod locks;
pub use locks::LockRegistry;

mod login;
pub use login::{Auth, Lease, LoginEngine, LoginRequest, Selector, SelectorType};

mod routes;
pub use routes::{Operation, Request, Response};

mod secret_id;
pub use secret_id::{GenerateParams, SecretId, SecretIdInfo, SecretIdResponse, SecretIdScope};

mod validation;
pub use validation::MAX_NAME_LEN;

pub mod duration;
pub mod logger;
pub mod storage;
