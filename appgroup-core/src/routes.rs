//! Request envelope and the static route table.
//!
//! Paths are matched segment by segment; a `{name}` segment captures the app
//! or group name. Durations in request data are integer seconds or text with
//! an `ms`, `s`, `m` or `h` suffix.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use strum::{Display, EnumString};

use crate::app::AppConfig;
use crate::backend::Backend;
use crate::duration::{self, unix_millis};
use crate::error::{AppGroupError, AppGroupResult};
use crate::group::GroupConfig;
use crate::login::{Auth, LoginRequest};
use crate::secret_id::{GenerateParams, SecretId, SecretIdResponse};

/// Operation requested on a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Operation {
    /// Read one entity.
    Read,
    /// Create an entity.
    Create,
    /// Update an entity or perform an action.
    Update,
    /// Delete an entity.
    Delete,
    /// List entities.
    List,
}

/// A request from the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Requested operation.
    pub operation: Operation,
    /// Path relative to the backend mount, e.g. `app/web/secret-id`.
    pub path: String,
    /// JSON object carrying the request fields.
    #[serde(default)]
    pub data: Value,
    /// Evaluation time in unix milliseconds; the wall clock when unset. Never
    /// read from serialized input, only the host sets it through
    /// [`Request::at`].
    #[serde(skip)]
    pub now: Option<u64>,
}

impl Request {
    /// Builds a request evaluated at the current time.
    #[must_use]
    pub fn new(operation: Operation, path: impl Into<String>, data: Value) -> Self {
        Self {
            operation,
            path: path.into(),
            data,
            now: None,
        }
    }

    /// Pins the evaluation time.
    #[must_use]
    pub const fn at(mut self, now: u64) -> Self {
        self.now = Some(now);
        self
    }
}

/// A successful response. `data` is `null` for operations without output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Response body.
    pub data: Value,
}

struct Call<'a> {
    name: Option<&'a str>,
    data: &'a Value,
    now: u64,
}

impl Call<'_> {
    fn name(&self) -> AppGroupResult<&str> {
        self.name
            .ok_or_else(|| AppGroupError::Internal("route has no name segment".to_string()))
    }

    fn payload<T: DeserializeOwned>(&self) -> AppGroupResult<T> {
        let data = if self.data.is_null() {
            json!({})
        } else {
            self.data.clone()
        };
        serde_json::from_value(data)
            .map_err(|err| AppGroupError::Validation(format!("invalid request data: {err}")))
    }
}

type Handler = fn(&Backend, &Call<'_>) -> AppGroupResult<Value>;

/// One path pattern and the operations it supports.
pub(crate) struct Route {
    pattern: &'static str,
    operations: Vec<(Operation, Handler)>,
}

impl Route {
    fn new(pattern: &'static str, operations: &[(Operation, Handler)]) -> Self {
        Self {
            pattern,
            operations: operations.to_vec(),
        }
    }

    /// Returns `Some(name)` when `path` matches, where `name` is the
    /// captured `{name}` segment if the pattern has one.
    fn matches<'p>(&self, path: &'p str) -> Option<Option<&'p str>> {
        let mut pattern = self.pattern.split('/');
        let mut segments = path.split('/');
        let mut name = None;
        loop {
            match (pattern.next(), segments.next()) {
                (None, None) => return Some(name),
                (Some("{name}"), Some(segment)) if !segment.is_empty() => name = Some(segment),
                (Some(expected), Some(segment)) if expected == segment => {}
                _ => return None,
            }
        }
    }
}

/// Builds the route table.
pub(crate) fn table() -> Vec<Route> {
    use Operation::{Create, Delete, List, Read, Update};

    vec![
        Route::new("app", &[(List, list_apps)]),
        Route::new(
            "app/{name}",
            &[
                (Read, read_app),
                (Create, write_app),
                (Update, write_app),
                (Delete, delete_app),
            ],
        ),
        Route::new(
            "app/{name}/secret-id",
            &[
                (Update, generate_app_secret_id),
                (List, list_app_secret_id_accessors),
            ],
        ),
        Route::new("app/{name}/custom-secret-id", &[(Update, custom_secret_id)]),
        Route::new("app/{name}/secret-id/lookup", &[(Update, lookup_secret_id)]),
        Route::new("app/{name}/secret-id/destroy", &[(Update, destroy_secret_id)]),
        Route::new(
            "app/{name}/secret-id-accessor/lookup",
            &[(Update, lookup_app_accessor)],
        ),
        Route::new(
            "app/{name}/secret-id-accessor/destroy",
            &[(Update, destroy_app_accessor)],
        ),
        Route::new("group", &[(List, list_groups)]),
        Route::new(
            "group/{name}",
            &[
                (Read, read_group),
                (Create, write_group),
                (Update, write_group),
                (Delete, delete_group),
            ],
        ),
        Route::new(
            "group/{name}/secret-id",
            &[
                (Update, generate_group_secret_id),
                (List, list_group_secret_id_accessors),
            ],
        ),
        Route::new(
            "group/{name}/secret-id-accessor/lookup",
            &[(Update, lookup_group_accessor)],
        ),
        Route::new(
            "group/{name}/secret-id-accessor/destroy",
            &[(Update, destroy_group_accessor)],
        ),
        Route::new("tidy/secret-id", &[(Update, tidy_secret_ids)]),
        Route::new("login", &[(Update, login)]),
        Route::new("login/renew", &[(Update, renew)]),
    ]
}

pub(crate) fn dispatch(
    backend: &Backend,
    routes: &[Route],
    request: &Request,
) -> AppGroupResult<Response> {
    let path = request.path.trim_matches('/');
    let (route, name) = routes
        .iter()
        .find_map(|route| route.matches(path).map(|name| (route, name)))
        .ok_or_else(|| AppGroupError::not_found("path", path))?;
    let handler = route
        .operations
        .iter()
        .find(|(operation, _)| *operation == request.operation)
        .map(|(_, handler)| *handler)
        .ok_or_else(|| {
            AppGroupError::Validation(format!(
                "operation '{}' is not supported on '{path}'",
                request.operation
            ))
        })?;

    tracing::debug!(operation = %request.operation, path, "handling request");
    let call = Call {
        name,
        data: &request.data,
        now: request.now.unwrap_or_else(unix_millis),
    };
    handler(backend, &call).map(|data| Response { data })
}

#[derive(Deserialize)]
struct DurationValue(#[serde(with = "duration::serde_secs")] Duration);

/// A list given either as a JSON array or as comma separated text.
#[derive(Deserialize)]
#[serde(untagged)]
enum StringList {
    List(Vec<String>),
    Text(String),
}

impl StringList {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::List(items) => items,
            Self::Text(text) => text
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct AppPayload {
    policies: Option<StringList>,
    secret_id_num_uses: Option<u32>,
    secret_id_ttl: Option<DurationValue>,
    token_ttl: Option<DurationValue>,
    token_max_ttl: Option<DurationValue>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct GroupPayload {
    apps: Option<StringList>,
    policies: Option<StringList>,
    secret_id_num_uses: Option<u32>,
    secret_id_ttl: Option<DurationValue>,
    token_ttl: Option<DurationValue>,
    token_max_ttl: Option<DurationValue>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct GeneratePayload {
    #[serde(default)]
    secret_id: Option<String>,
    num_uses: Option<u32>,
    ttl: Option<DurationValue>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

impl GeneratePayload {
    fn params(self) -> (Option<String>, GenerateParams) {
        (
            self.secret_id,
            GenerateParams {
                num_uses: self.num_uses,
                ttl: self.ttl.map(|ttl| ttl.0),
                metadata: self.metadata,
            },
        )
    }
}

#[derive(Deserialize)]
struct SecretIdPayload {
    secret_id: String,
}

#[derive(Deserialize)]
struct AccessorPayload {
    secret_id_accessor: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct LoginPayload {
    app: Option<String>,
    group: Option<String>,
    secret_id: Option<String>,
    #[serde(default)]
    secret_ids: BTreeMap<String, String>,
}

impl LoginPayload {
    fn into_request(self) -> AppGroupResult<LoginRequest> {
        match (self.app, self.group) {
            (Some(name), None) => {
                let secret_id = self.secret_id.ok_or_else(|| {
                    AppGroupError::Validation("missing secret_id".to_string())
                })?;
                Ok(LoginRequest::App {
                    name,
                    secret_id: SecretId::new(secret_id),
                })
            }
            (None, Some(name)) => Ok(LoginRequest::Group {
                name,
                secret_ids: self
                    .secret_ids
                    .into_iter()
                    .map(|(app, raw)| (app, SecretId::new(raw)))
                    .collect(),
            }),
            _ => Err(AppGroupError::Validation(
                "exactly one of 'app' or 'group' is required".to_string(),
            )),
        }
    }
}

#[derive(Deserialize)]
struct RenewPayload {
    auth: Auth,
}

fn keys(names: &[String]) -> Value {
    json!({ "keys": names })
}

fn to_value<T: Serialize>(value: &T) -> AppGroupResult<Value> {
    serde_json::to_value(value).map_err(|err| AppGroupError::Internal(err.to_string()))
}

fn secret_id_response(response: &SecretIdResponse) -> Value {
    json!({
        "secret_id": response.secret_id.expose(),
        "secret_id_accessor": response.accessor,
        "expires_at": response.expires_at,
        "num_uses": response.num_uses,
    })
}

fn list_apps(backend: &Backend, _call: &Call<'_>) -> AppGroupResult<Value> {
    Ok(keys(&backend.apps().list_apps()?))
}

fn read_app(backend: &Backend, call: &Call<'_>) -> AppGroupResult<Value> {
    let name = call.name()?;
    let app = backend
        .apps()
        .read_app(name)?
        .ok_or_else(|| AppGroupError::not_found("app", name))?;
    to_value(&app)
}

fn write_app(backend: &Backend, call: &Call<'_>) -> AppGroupResult<Value> {
    let payload: AppPayload = call.payload()?;
    let config = AppConfig {
        policies: payload.policies.map(StringList::into_vec),
        secret_id_num_uses: payload.secret_id_num_uses,
        secret_id_ttl: payload.secret_id_ttl.map(|ttl| ttl.0),
        token_ttl: payload.token_ttl.map(|ttl| ttl.0),
        token_max_ttl: payload.token_max_ttl.map(|ttl| ttl.0),
    };
    to_value(&backend.apps().write_app(call.name()?, config)?)
}

fn delete_app(backend: &Backend, call: &Call<'_>) -> AppGroupResult<Value> {
    backend.apps().delete_app(call.name()?)?;
    Ok(Value::Null)
}

fn generate_app_secret_id(backend: &Backend, call: &Call<'_>) -> AppGroupResult<Value> {
    let (custom, params) = call.payload::<GeneratePayload>()?.params();
    if custom.is_some() {
        return Err(AppGroupError::Validation(
            "use custom-secret-id to register a chosen secret_id".to_string(),
        ));
    }
    let response = backend
        .apps()
        .generate_secret_id(call.name()?, params, call.now)?;
    Ok(secret_id_response(&response))
}

fn custom_secret_id(backend: &Backend, call: &Call<'_>) -> AppGroupResult<Value> {
    let (custom, params) = call.payload::<GeneratePayload>()?.params();
    let secret_id = custom
        .map(SecretId::new)
        .ok_or_else(|| AppGroupError::Validation("missing secret_id".to_string()))?;
    let response =
        backend
            .apps()
            .generate_custom_secret_id(call.name()?, secret_id, params, call.now)?;
    Ok(secret_id_response(&response))
}

fn list_app_secret_id_accessors(backend: &Backend, call: &Call<'_>) -> AppGroupResult<Value> {
    Ok(keys(&backend.apps().list_secret_id_accessors(call.name()?)?))
}

fn lookup_secret_id(backend: &Backend, call: &Call<'_>) -> AppGroupResult<Value> {
    let payload: SecretIdPayload = call.payload()?;
    let info = backend
        .apps()
        .read_secret_id(call.name()?, &SecretId::new(payload.secret_id))?
        .ok_or_else(|| AppGroupError::not_found("secret_id", "<redacted>"))?;
    to_value(&info)
}

fn destroy_secret_id(backend: &Backend, call: &Call<'_>) -> AppGroupResult<Value> {
    let payload: SecretIdPayload = call.payload()?;
    backend
        .apps()
        .destroy_secret_id(call.name()?, &SecretId::new(payload.secret_id))?;
    Ok(Value::Null)
}

fn lookup_app_accessor(backend: &Backend, call: &Call<'_>) -> AppGroupResult<Value> {
    let payload: AccessorPayload = call.payload()?;
    let info = backend
        .apps()
        .read_secret_id_by_accessor(call.name()?, &payload.secret_id_accessor)?
        .ok_or_else(|| AppGroupError::not_found("secret_id_accessor", payload.secret_id_accessor))?;
    to_value(&info)
}

fn destroy_app_accessor(backend: &Backend, call: &Call<'_>) -> AppGroupResult<Value> {
    let payload: AccessorPayload = call.payload()?;
    backend
        .apps()
        .destroy_secret_id_by_accessor(call.name()?, &payload.secret_id_accessor)?;
    Ok(Value::Null)
}

fn list_groups(backend: &Backend, _call: &Call<'_>) -> AppGroupResult<Value> {
    Ok(keys(&backend.groups().list_groups()?))
}

fn read_group(backend: &Backend, call: &Call<'_>) -> AppGroupResult<Value> {
    let name = call.name()?;
    let group = backend
        .groups()
        .read_group(name)?
        .ok_or_else(|| AppGroupError::not_found("group", name))?;
    to_value(&group)
}

fn write_group(backend: &Backend, call: &Call<'_>) -> AppGroupResult<Value> {
    let payload: GroupPayload = call.payload()?;
    let config = GroupConfig {
        apps: payload.apps.map(StringList::into_vec),
        policies: payload.policies.map(StringList::into_vec),
        secret_id_num_uses: payload.secret_id_num_uses,
        secret_id_ttl: payload.secret_id_ttl.map(|ttl| ttl.0),
        token_ttl: payload.token_ttl.map(|ttl| ttl.0),
        token_max_ttl: payload.token_max_ttl.map(|ttl| ttl.0),
    };
    to_value(&backend.groups().write_group(call.name()?, config)?)
}

fn delete_group(backend: &Backend, call: &Call<'_>) -> AppGroupResult<Value> {
    backend.groups().delete_group(call.name()?)?;
    Ok(Value::Null)
}

fn generate_group_secret_id(backend: &Backend, call: &Call<'_>) -> AppGroupResult<Value> {
    let (custom, params) = call.payload::<GeneratePayload>()?.params();
    if custom.is_some() {
        return Err(AppGroupError::Validation(
            "groups do not accept a chosen secret_id".to_string(),
        ));
    }
    let response = backend
        .groups()
        .generate_secret_id(call.name()?, params, call.now)?;
    let secret_ids: BTreeMap<&str, &str> = response
        .secret_ids
        .iter()
        .map(|(app, secret_id)| (app.as_str(), secret_id.expose()))
        .collect();
    Ok(json!({
        "secret_ids": secret_ids,
        "secret_id_accessor": response.accessor,
        "member_accessors": response.member_accessors,
        "expires_at": response.expires_at,
        "num_uses": response.num_uses,
    }))
}

fn list_group_secret_id_accessors(backend: &Backend, call: &Call<'_>) -> AppGroupResult<Value> {
    Ok(keys(&backend.groups().list_secret_id_accessors(call.name()?)?))
}

fn lookup_group_accessor(backend: &Backend, call: &Call<'_>) -> AppGroupResult<Value> {
    let payload: AccessorPayload = call.payload()?;
    let info = backend
        .groups()
        .read_secret_id_by_accessor(call.name()?, &payload.secret_id_accessor)?
        .ok_or_else(|| AppGroupError::not_found("secret_id_accessor", payload.secret_id_accessor))?;
    to_value(&info)
}

fn destroy_group_accessor(backend: &Backend, call: &Call<'_>) -> AppGroupResult<Value> {
    let payload: AccessorPayload = call.payload()?;
    backend
        .groups()
        .destroy_secret_id_by_accessor(call.name()?, &payload.secret_id_accessor)?;
    Ok(Value::Null)
}

fn tidy_secret_ids(backend: &Backend, call: &Call<'_>) -> AppGroupResult<Value> {
    let removed = backend.groups().tidy_secret_ids(call.now)?;
    Ok(json!({ "removed": removed }))
}

fn login(backend: &Backend, call: &Call<'_>) -> AppGroupResult<Value> {
    let request = call.payload::<LoginPayload>()?.into_request()?;
    let auth = backend.login_engine().login(request, call.now)?;
    let token = backend.issuer().issue(&auth)?;
    Ok(json!({ "auth": auth, "token": token }))
}

fn renew(backend: &Backend, call: &Call<'_>) -> AppGroupResult<Value> {
    let payload: RenewPayload = call.payload()?;
    let lease = backend.login_engine().renew(&payload.auth, call.now)?;
    to_value(&lease)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("app", "app", Some(None) ; "literal")]
    #[test_case("app/{name}", "app/web", Some(Some("web")) ; "capture")]
    #[test_case("app/{name}/secret-id", "app/web/secret-id", Some(Some("web")) ; "capture then literal")]
    #[test_case("app/{name}", "app/web/secret-id", None ; "too long")]
    #[test_case("app/{name}/secret-id", "app/web", None ; "too short")]
    #[test_case("app/{name}", "app/", None ; "empty capture")]
    #[test_case("group/{name}", "app/web", None ; "wrong literal")]
    fn test_route_matching(pattern: &'static str, path: &str, expected: Option<Option<&str>>) {
        let route = Route::new(pattern, &[]);
        assert_eq!(route.matches(path), expected);
    }

    #[test]
    fn test_table_paths_are_unique() {
        let table = table();
        let mut patterns: Vec<&str> = table.iter().map(|route| route.pattern).collect();
        patterns.sort_unstable();
        patterns.dedup();
        assert_eq!(patterns.len(), table.len());
    }

    #[test]
    fn test_operation_strings() {
        assert_eq!(Operation::List.to_string(), "list");
        assert_eq!("update".parse::<Operation>(), Ok(Operation::Update));
    }

    #[test]
    fn test_string_list_accepts_text_and_array() {
        let text: StringList = serde_json::from_value(json!("a, b,,c")).expect("text");
        assert_eq!(text.into_vec(), vec!["a", "b", "c"]);
        let array: StringList = serde_json::from_value(json!(["a", "a"])).expect("array");
        assert_eq!(array.into_vec(), vec!["a", "a"]);
    }

    #[test]
    fn test_login_payload_needs_one_target() {
        let both: LoginPayload =
            serde_json::from_value(json!({"app": "a", "group": "g"})).expect("payload");
        assert!(matches!(
            both.into_request(),
            Err(AppGroupError::Validation(_))
        ));
        let missing: LoginPayload = serde_json::from_value(json!({"app": "a"})).expect("payload");
        assert!(matches!(
            missing.into_request(),
            Err(AppGroupError::Validation(_))
        ));
    }

    #[test]
    fn test_request_clock_is_not_deserialized() {
        let request: Request = serde_json::from_value(json!({
            "operation": "update",
            "path": "login",
            "data": {"app": "web", "secret_id": "s"},
            "now": 0,
        }))
        .expect("request");
        assert_eq!(request.now, None);
        assert_eq!(request.clone().at(5).now, Some(5));

        let encoded = serde_json::to_value(request.at(5)).expect("encode");
        assert!(encoded.get("now").is_none());
    }
}
