use crate::validation::Diagnostic;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request to {url} timed out after {timeout_ms}ms")]
    Timeout { url: String, timeout_ms: u128 },
    #[error("network failure for {url}: {message}")]
    Network { url: String, message: String },
    #[error("failed to prepare request body: {0}")]
    Body(String),
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum HarnessError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("authentication error: {0}")]
    Auth(String),
    #[error("assertion failed: {0}")]
    Assertion(String),
    #[error("step '{step}' references unresolved context key '{key}'")]
    UnresolvedReference { step: String, key: String },
}

impl HarnessError {
    /// Transport failures may be retried up to the configured bound, auth
    /// failures exactly once after a fresh CSRF token, everything else is terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HarnessError::Transport(_) | HarnessError::Auth(_))
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("suite '{suite}' is invalid: {}", summarize(.diagnostics))]
pub struct SuiteError {
    pub suite: String,
    pub diagnostics: Vec<Diagnostic>,
}

fn summarize(diagnostics: &[Diagnostic]) -> String {
    let errors: Vec<String> = diagnostics
        .iter()
        .filter(|diag| diag.is_error())
        .map(|diag| match &diag.location {
            Some(location) => format!("{location}: {}", diag.message),
            None => diag.message.clone(),
        })
        .collect();
    errors.join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_and_auth_are_retryable() {
        let transport = HarnessError::from(TransportError::Timeout {
            url: "http://localhost/api".to_string(),
            timeout_ms: 10,
        });
        assert!(transport.is_retryable());
        assert!(HarnessError::Auth("no session cookie".to_string()).is_retryable());
        assert!(!HarnessError::Protocol("missing csrfToken".to_string()).is_retryable());
        assert!(!HarnessError::Assertion("status".to_string()).is_retryable());
        assert!(!HarnessError::UnresolvedReference {
            step: "get".to_string(),
            key: "id".to_string(),
        }
        .is_retryable());
    }
}
