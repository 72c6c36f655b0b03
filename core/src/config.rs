use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::suite::TimeoutClass;

/// Immutable settings for one harness run. Built once and shared read-only
/// with every suite the orchestrator executes. An empty `base_url` is rejected
/// when the orchestrator is constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub concurrent_suites: bool,
    #[serde(default)]
    pub critical_steps: BTreeSet<String>,
    #[serde(default)]
    pub preflight_path: Option<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub csrf_path: String,
    pub callback_path: String,
    pub session_path: String,
    pub session_cookie_marker: String,
    pub csrf_cookie_marker: String,
    pub verify_session: bool,
    pub policy: AuthPolicy,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthPolicy {
    #[default]
    Reauthenticate,
    Abort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub structural_ms: u64,
    pub generative_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub backoff_ms: u64,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid base url '{url}': {reason}")]
    InvalidBaseUrl { url: String, reason: String },
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            csrf_path: "/api/auth/csrf".to_string(),
            callback_path: "/api/auth/callback/credentials".to_string(),
            session_path: "/api/auth/session".to_string(),
            session_cookie_marker: "session-token".to_string(),
            csrf_cookie_marker: "csrf-token".to_string(),
            verify_session: true,
            policy: AuthPolicy::default(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            structural_ms: 10_000,
            generative_ms: 30_000,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_ms: 250,
        }
    }
}

impl RunConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            auth: AuthConfig::default(),
            timeouts: TimeoutConfig::default(),
            retry: RetryConfig::default(),
            parallel: false,
            concurrent_suites: false,
            critical_steps: BTreeSet::new(),
            preflight_path: None,
            variables: BTreeMap::new(),
            secrets: BTreeMap::new(),
        }
    }

    pub fn parsed_base_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.base_url).map_err(|err| ConfigError::InvalidBaseUrl {
            url: self.base_url.clone(),
            reason: err.to_string(),
        })?;
        if url.cannot_be_a_base() {
            return Err(ConfigError::InvalidBaseUrl {
                url: self.base_url.clone(),
                reason: "url cannot be used as a base".to_string(),
            });
        }
        Ok(url)
    }

    pub fn timeout_for(&self, class: TimeoutClass, override_ms: Option<u64>) -> Duration {
        let millis = override_ms.unwrap_or(match class {
            TimeoutClass::Structural => self.timeouts.structural_ms,
            TimeoutClass::Generative => self.timeouts.generative_ms,
        });
        Duration::from_millis(millis)
    }

    /// Backoff before retry number `attempt` (1-based), doubling each time.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.retry.backoff_ms.saturating_mul(factor))
    }

    pub fn is_critical(&self, suite: &str, step: &str) -> bool {
        self.critical_steps.contains(step)
            || self.critical_steps.contains(&format!("{suite}/{step}"))
    }
}

/// Joins an absolute request path onto the base url, keeping any path prefix
/// the base url carries (e.g. a deployment mounted under `/preview`).
pub fn join_url(base: &Url, path: &str) -> Url {
    let prefix = base.path().trim_end_matches('/');
    let (path_part, query) = match path.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path, None),
    };
    let mut url = base.clone();
    url.set_path(&format!("{prefix}{path_part}"));
    url.set_query(query);
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_structural_and_generative_budgets() {
        let config = RunConfig::new("http://localhost:3000");
        assert_eq!(
            config.timeout_for(TimeoutClass::Structural, None),
            Duration::from_secs(10)
        );
        assert_eq!(
            config.timeout_for(TimeoutClass::Generative, None),
            Duration::from_secs(30)
        );
        assert_eq!(
            config.timeout_for(TimeoutClass::Generative, Some(5)),
            Duration::from_millis(5)
        );
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let config = RunConfig::new("http://localhost:3000");
        assert_eq!(config.backoff_for(1), Duration::from_millis(250));
        assert_eq!(config.backoff_for(2), Duration::from_millis(500));
        assert_eq!(config.backoff_for(3), Duration::from_millis(1000));
    }

    #[test]
    fn critical_matches_plain_and_qualified_ids() {
        let mut config = RunConfig::new("http://localhost:3000");
        config.critical_steps.insert("authenticate".to_string());
        config.critical_steps.insert("resume/upload".to_string());
        assert!(config.is_critical("auth", "authenticate"));
        assert!(config.is_critical("resume", "upload"));
        assert!(!config.is_critical("interview", "upload"));
    }

    #[test]
    fn join_keeps_base_prefix_and_query() {
        let base = Url::parse("https://example.test/preview/").expect("valid url");
        let url = join_url(&base, "/api/resumes?page=2");
        assert_eq!(url.as_str(), "https://example.test/preview/api/resumes?page=2");
    }

    #[test]
    fn rejects_unparseable_base_url() {
        let config = RunConfig::new("not a url");
        assert!(matches!(
            config.parsed_base_url(),
            Err(ConfigError::InvalidBaseUrl { .. })
        ));
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: RunConfig = serde_json::from_str(
            r#"{"base_url":"http://localhost:3000","auth":{"policy":"abort"}}"#,
        )
        .expect("config parses");
        assert_eq!(config.auth.policy, AuthPolicy::Abort);
        assert_eq!(config.auth.csrf_path, "/api/auth/csrf");
        assert_eq!(config.auth.csrf_cookie_marker, "csrf-token");
        assert_eq!(config.retry.max_retries, 2);
    }
}
