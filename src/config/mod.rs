use crate::core::{Result, TxError};
use http::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{Level, event};

pub const DEFAULT_MIDDLEWARE_ALIAS: &str = "with_db_transactions";

/// Default upper bound for buffered request bodies (2 MiB)
pub const DEFAULT_REQUEST_BODY_LIMIT: usize = 2 * 1024 * 1024;

/// Middleware configuration, fixed at boot.
///
/// Deserializes from JSON; missing keys take the defaults below.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransactionConfig {
    /// Route names that bypass the middleware
    pub ignore_route_names: Vec<String>,

    /// Request methods that bypass the middleware (matched case-insensitively)
    pub ignore_request_methods: Vec<String>,

    /// Default attempt budget
    pub maximum_attempts: u32,

    /// Response status codes that commit the transaction
    pub commit_http_statuses: BTreeSet<u16>,

    /// Name the middleware is registered under
    pub middleware_alias: String,

    /// Route groups the middleware is pushed onto at boot
    pub middleware_groups: Vec<String>,

    /// Attempt budget for group-attached instances; `None` or `0` falls back
    /// to `maximum_attempts`
    pub maximum_attempts_for_groups: Option<u32>,

    /// Maximum request body size buffered for replays
    pub request_body_limit: usize,
}

impl TransactionConfig {
    pub fn new() -> Self {
        Self {
            ignore_route_names: Vec::new(),
            ignore_request_methods: vec!["get".to_string()],
            maximum_attempts: 1,
            commit_http_statuses: default_commit_statuses(),
            middleware_alias: DEFAULT_MIDDLEWARE_ALIAS.to_string(),
            middleware_groups: Vec::new(),
            maximum_attempts_for_groups: None,
            request_body_limit: DEFAULT_REQUEST_BODY_LIMIT,
        }
    }

    pub fn ignore_route_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignore_route_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn ignore_request_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignore_request_methods = methods.into_iter().map(Into::into).collect();
        self
    }

    pub fn maximum_attempts(mut self, attempts: u32) -> Self {
        self.maximum_attempts = attempts;
        self
    }

    pub fn commit_http_statuses<I: IntoIterator<Item = u16>>(mut self, statuses: I) -> Self {
        self.commit_http_statuses = statuses.into_iter().collect();
        self
    }

    pub fn middleware_alias(mut self, alias: &str) -> Self {
        self.middleware_alias = alias.to_string();
        self
    }

    pub fn middleware_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.middleware_groups = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn maximum_attempts_for_groups(mut self, attempts: u32) -> Self {
        self.maximum_attempts_for_groups = Some(attempts);
        self
    }

    pub fn request_body_limit(mut self, limit: usize) -> Self {
        self.request_body_limit = limit;
        self
    }

    /// Parse from a JSON document
    ///
    /// Legacy `middleware_class` and `*_event` keys are skipped with a warning;
    /// listeners are registered on an `EventBus` instead.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let mut value: serde_json::Value =
            serde_json::from_str(json).map_err(|e| TxError::Config(e.to_string()))?;
        if let Some(map) = value.as_object_mut() {
            map.retain(|key, _| {
                let legacy = is_legacy_key(key);
                if legacy {
                    event!(Level::WARN, key = key.as_str(), "ignoring legacy configuration key");
                }
                !legacy
            });
        }
        let config: Self =
            serde_json::from_value(value).map_err(|e| TxError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| TxError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.middleware_alias.is_empty() {
            return Err(TxError::Config("middleware_alias cannot be empty".into()));
        }

        if self.middleware_alias.contains(':') {
            return Err(TxError::Config("middleware_alias cannot contain ':'".into()));
        }

        if let Some(bad) = self
            .commit_http_statuses
            .iter()
            .find(|code| StatusCode::from_u16(**code).is_err())
        {
            return Err(TxError::Config(format!("invalid HTTP status code {bad}")));
        }

        if let Some(bad) = self
            .ignore_request_methods
            .iter()
            .find(|m| Method::from_bytes(m.to_ascii_uppercase().as_bytes()).is_err())
        {
            return Err(TxError::Config(format!("invalid request method '{bad}'")));
        }

        Ok(())
    }

    pub fn should_ignore_route(&self, route_name: Option<&str>) -> bool {
        route_name.is_some_and(|name| self.ignore_route_names.iter().any(|n| n == name))
    }

    pub fn should_ignore_method(&self, method: &Method) -> bool {
        self.ignore_request_methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method.as_str()))
    }

    pub fn should_commit(&self, status: StatusCode) -> bool {
        self.commit_http_statuses.contains(&status.as_u16())
    }

    /// Attempt budget for an explicit request, `0` meaning one attempt
    pub fn effective_attempts(&self, requested: Option<u32>) -> u32 {
        requested
            .filter(|n| *n > 0)
            .unwrap_or(self.maximum_attempts)
            .max(1)
    }

    /// Attempt budget appended to group registrations
    pub fn group_attempts(&self) -> u32 {
        self.maximum_attempts_for_groups
            .filter(|n| *n > 0)
            .unwrap_or(self.maximum_attempts)
    }
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Every 2xx and 3xx code with a standard meaning.
fn default_commit_statuses() -> BTreeSet<u16> {
    [
        200, 201, 202, 203, 204, 205, 206, 207, 208, 226, // success
        300, 301, 302, 303, 304, 305, 306, 307, 308, // redirection
    ]
    .into_iter()
    .collect()
}

fn is_legacy_key(key: &str) -> bool {
    key == "middleware_class" || key.ends_with("_event")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = TransactionConfig::default();
        assert_eq!(config.middleware_alias, "with_db_transactions");
        assert_eq!(config.maximum_attempts, 1);
        assert_eq!(config.ignore_request_methods, vec!["get".to_string()]);
        assert!(config.should_commit(StatusCode::OK));
        assert!(config.should_commit(StatusCode::PERMANENT_REDIRECT));
        assert!(!config.should_commit(StatusCode::UNPROCESSABLE_ENTITY));
        assert!(!config.should_commit(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = TransactionConfig::new()
            .ignore_route_names(["login"])
            .ignore_request_methods(["GET", "head"])
            .maximum_attempts(3)
            .commit_http_statuses([200, 201])
            .middleware_alias("tx")
            .middleware_groups(["api"])
            .maximum_attempts_for_groups(5);

        assert!(config.should_ignore_route(Some("login")));
        assert!(!config.should_ignore_route(Some("logout")));
        assert!(!config.should_ignore_route(None));
        assert!(config.should_ignore_method(&Method::GET));
        assert!(config.should_ignore_method(&Method::HEAD));
        assert!(!config.should_ignore_method(&Method::POST));
        assert_eq!(config.group_attempts(), 5);
        assert!(!config.should_commit(StatusCode::ACCEPTED));
    }

    #[test]
    fn test_effective_attempts() {
        let config = TransactionConfig::new().maximum_attempts(4);
        assert_eq!(config.effective_attempts(None), 4);
        assert_eq!(config.effective_attempts(Some(2)), 2);
        assert_eq!(config.effective_attempts(Some(0)), 4);

        let zero = TransactionConfig::new().maximum_attempts(0);
        assert_eq!(zero.effective_attempts(None), 1);
    }

    #[test]
    fn test_group_attempts_fall_back_to_default() {
        let config = TransactionConfig::new().maximum_attempts(2);
        assert_eq!(config.group_attempts(), 2);
        assert_eq!(config.clone().maximum_attempts_for_groups(0).group_attempts(), 2);
    }

    #[test]
    fn test_from_json_uses_defaults_for_missing_keys() {
        let config = TransactionConfig::from_json_str(
            r#"{ "maximum_attempts": 3, "commit_http_statuses": [200, 201] }"#,
        )
        .unwrap();
        assert_eq!(config.maximum_attempts, 3);
        assert_eq!(config.commit_http_statuses, BTreeSet::from([200, 201]));
        assert_eq!(config.middleware_alias, DEFAULT_MIDDLEWARE_ALIAS);
        assert_eq!(config.request_body_limit, DEFAULT_REQUEST_BODY_LIMIT);
    }

    #[test]
    fn test_from_json_rejects_invalid() {
        assert!(matches!(
            TransactionConfig::from_json_str(r#"{ "commit_http_statuses": [42] }"#),
            Err(TxError::Config(_))
        ));
        assert!(matches!(
            TransactionConfig::from_json_str(r#"{ "unknown_key": true }"#),
            Err(TxError::Config(_))
        ));
        assert!(matches!(
            TransactionConfig::from_json_str(r#"{ "middleware_alias": "tx:2" }"#),
            Err(TxError::Config(_))
        ));
    }

    #[test]
    fn test_from_json_skips_legacy_keys() {
        let config = TransactionConfig::from_json_str(
            r#"{
                "middleware_class": "TransactionLayer",
                "before_commit_event": "audit.before_commit",
                "after_every_rollback_event": null,
                "maximum_attempts": 2
            }"#,
        )
        .unwrap();
        assert_eq!(config.maximum_attempts, 2);
        assert_eq!(config.middleware_alias, DEFAULT_MIDDLEWARE_ALIAS);

        assert!(matches!(
            TransactionConfig::from_json_str(r#"{ "middleware_klass": "x" }"#),
            Err(TxError::Config(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "middleware_groups": ["api", "web"] }}"#).unwrap();

        let config = TransactionConfig::from_file(file.path()).unwrap();
        assert_eq!(config.middleware_groups, vec!["api", "web"]);

        assert!(TransactionConfig::from_file("/nonexistent/config.json").is_err());
    }
}
