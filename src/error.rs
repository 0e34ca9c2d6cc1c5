use thiserror::Error;

/// Why loading the remote script, or a call routed through it, failed.
///
/// Cloneable so a single pending load can hand the same failure to every
/// caller awaiting it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoadError {
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error(
        "failed to load script from {url}: {reason} (network failure, blocked by an extension, or a bad site identifier)"
    )]
    Network { url: String, reason: String },
    #[error("script loaded from {url} but did not initialize the global binding")]
    Initialization { url: String },
    #[error("script from {url} did not become ready within {timeout_ms}ms")]
    Timeout { url: String, timeout_ms: u128 },
    #[error("method `{method}` did not become available (available: [{}])", .available.join(", "))]
    MethodUnavailable {
        method: String,
        available: Vec<String>,
    },
    #[error("method `{method}` failed: {message}")]
    Call { method: String, message: String },
    #[error("no global scope available in this environment")]
    NoGlobalScope,
    #[error("no tokio runtime available on this thread")]
    NoRuntime,
    #[error("load task aborted: {0}")]
    Aborted(String),
}

impl LoadError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

/// Error thrown by the remote implementation of a method.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    #[error("method not found")]
    NotFound,
    #[error("{0}")]
    Thrown(String),
}

impl CallError {
    pub(crate) fn into_load_error(self, method: &str) -> LoadError {
        LoadError::Call {
            method: method.to_string(),
            message: self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_unavailable_lists_names() {
        let err = LoadError::MethodUnavailable {
            method: "track".into(),
            available: vec!["identify".into(), "tag".into()],
        };
        assert_eq!(
            err.to_string(),
            "method `track` did not become available (available: [identify, tag])"
        );
    }

    #[test]
    fn empty_available_list_renders_empty_brackets() {
        let err = LoadError::MethodUnavailable {
            method: "track".into(),
            available: vec![],
        };
        assert!(err.to_string().ends_with("(available: [])"));
    }
}
