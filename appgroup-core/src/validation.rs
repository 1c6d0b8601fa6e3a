//! Input checks shared by the app and group stores.

use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::{AppGroupError, AppGroupResult};

/// Longest accepted app or group name.
pub const MAX_NAME_LEN: usize = 128;

/// Checks that `name` is non-empty, at most [`MAX_NAME_LEN`] characters and
/// made of ASCII letters, digits, `_`, `-` or `.`.
pub(crate) fn validate_name(kind: &str, name: &str) -> AppGroupResult<()> {
    if name.is_empty() {
        return Err(AppGroupError::Validation(format!("{kind} name is empty")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(AppGroupError::Validation(format!(
            "{kind} name is longer than {MAX_NAME_LEN} characters"
        )));
    }
    if name == "." || name == ".." {
        return Err(AppGroupError::Validation(format!("{kind} name '{name}' is reserved")));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        return Err(AppGroupError::Validation(format!(
            "{kind} name '{name}' contains invalid character '{bad}'"
        )));
    }
    Ok(())
}

/// Trims, lowercases, dedupes and sorts policy names, dropping empty ones.
pub(crate) fn sanitize_policies<S: AsRef<str>>(policies: &[S]) -> Vec<String> {
    policies
        .iter()
        .map(|policy| policy.as_ref().trim().to_lowercase())
        .filter(|policy| !policy.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// A zero `token_max_ttl` leaves the token TTL unbounded.
pub(crate) fn validate_token_ttls(token_ttl: Duration, token_max_ttl: Duration) -> AppGroupResult<()> {
    if !token_max_ttl.is_zero() && token_ttl > token_max_ttl {
        return Err(AppGroupError::Validation(
            "token_ttl must not exceed token_max_ttl".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("web" ; "plain")]
    #[test_case("web-01.prod_a" ; "punctuation")]
    fn test_accepts_name(name: &str) {
        assert!(validate_name("app", name).is_ok());
    }

    #[test_case("" ; "empty")]
    #[test_case("web/admin" ; "slash")]
    #[test_case("web app" ; "space")]
    #[test_case(".." ; "parent")]
    #[test_case("é" ; "non ascii")]
    fn test_rejects_name(name: &str) {
        assert!(matches!(
            validate_name("app", name),
            Err(AppGroupError::Validation(_))
        ));
    }

    #[test]
    fn test_rejects_overlong_name() {
        let name = "a".repeat(MAX_NAME_LEN + 1);
        assert!(validate_name("group", &name).is_err());
        assert!(validate_name("group", &name[1..]).is_ok());
    }

    #[test]
    fn test_sanitize_policies() {
        assert_eq!(
            sanitize_policies(&["Ops", " dev", "", "ops", "  "]),
            vec!["dev".to_string(), "ops".to_string()]
        );
    }

    #[test]
    fn test_token_ttls() {
        let hour = Duration::from_secs(3_600);
        assert!(validate_token_ttls(hour, hour).is_ok());
        assert!(validate_token_ttls(hour * 2, Duration::ZERO).is_ok());
        assert!(validate_token_ttls(hour * 2, hour).is_err());
    }
}
