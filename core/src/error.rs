//! Error types for the search orchestration core.

use thiserror::Error;

/// Result type alias for internal orchestration helpers.
pub type SearchCoreResult<T> = std::result::Result<T, SearchCoreError>;

/// Errors raised by internal helpers across the pipeline.
///
/// None of these ever escape [`crate::orchestrator::Orchestrator::search`] — every
/// variant is caught at its phase boundary and folded into `Response.errors`.
#[derive(Debug, Error)]
pub enum SearchCoreError {
    /// Caller input failed validation (empty context, limit out of range, ...).
    #[error("validation error: {0}")]
    Validation(String),

    /// A capability payload failed registration validation.
    #[error("capability registration error: {0}")]
    RegistryValidation(String),

    /// A backend call (MCP or direct) failed or returned an unparseable payload.
    #[error("dispatch error for source '{source}': {message}")]
    Dispatch { source: String, message: String },

    /// Anything else that should never happen if invariants hold.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SearchCoreError {
    /// Classifier string for logging/metrics, mirroring the severity ladder in the design.
    #[must_use]
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION",
            Self::RegistryValidation(_) => "REGISTRY_VALIDATION",
            Self::Dispatch { .. } => "DISPATCH",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Whether the error represents a partial, recoverable failure (the search can
    /// still proceed and surface a degraded answer) as opposed to one that should
    /// short-circuit the whole call.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Dispatch { .. })
    }

    /// Render as the `"{source}: {message}"` shape the design requires for `meta.errors`.
    #[must_use]
    pub fn as_meta_error(&self) -> String {
        match self {
            Self::Dispatch { source, message } => format!("{source}: {message}"),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_type_mapping() {
        let cases = vec![
            (SearchCoreError::Validation("x".into()), "VALIDATION"),
            (
                SearchCoreError::RegistryValidation("x".into()),
                "REGISTRY_VALIDATION",
            ),
            (
                SearchCoreError::Dispatch {
                    source: "email".into(),
                    message: "boom".into(),
                },
                "DISPATCH",
            ),
            (SearchCoreError::Internal("x".into()), "INTERNAL"),
        ];
        for (err, expected) in &cases {
            assert_eq!(err.error_type(), *expected);
        }
    }

    #[test]
    fn only_dispatch_is_recoverable() {
        assert!(SearchCoreError::Dispatch {
            source: "s".into(),
            message: "m".into()
        }
        .is_recoverable());
        assert!(!SearchCoreError::Validation("x".into()).is_recoverable());
        assert!(!SearchCoreError::Internal("x".into()).is_recoverable());
    }

    #[test]
    fn meta_error_shape() {
        let err = SearchCoreError::Dispatch {
            source: "email".into(),
            message: "timed out".into(),
        };
        assert_eq!(err.as_meta_error(), "email: timed out");
    }
}
