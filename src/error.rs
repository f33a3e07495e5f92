//! Engine error taxonomy.
//!
//! Every fallible operation surfaces one of these variants; the HTTP layer
//! maps them onto status codes and stable error codes. The structured query
//! path additionally distinguishes errors that degrade to the schema-only
//! fallback from errors that abort the request.

use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed or incomplete request input.
    #[error("{0}")]
    Validation(String),

    /// Missing or unusable credentials.
    #[error("missing or invalid credentials")]
    Auth,

    /// The named resource does not exist for this principal. Deliberately
    /// also covers resources owned by someone else.
    #[error("{0} not found")]
    NotFound(String),

    /// A dependency (LLM provider, storage, tabular service) failed or was
    /// unreachable.
    #[error("upstream service error: {0}")]
    Upstream(String),

    /// Generated code was rejected by the static safety gate.
    #[error("generated code rejected: {0}")]
    CodeSafety(String),

    /// The execution service accepted the request but the code failed.
    #[error("execution failed: {0}")]
    Execution(String),

    /// A provider thread run ended in a non-completed terminal state.
    #[error("run ended as {status}: {detail}")]
    RunFailed { status: String, detail: String },

    #[error(transparent)]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Stable machine-readable code for the HTTP error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "bad_request",
            EngineError::Auth => "unauthorized",
            EngineError::NotFound(_) => "not_found",
            EngineError::Upstream(_) => "upstream_unavailable",
            EngineError::CodeSafety(_) => "code_rejected",
            EngineError::Execution(_) => "execution_failed",
            EngineError::RunFailed { .. } => "run_failed",
            EngineError::Db(_) | EngineError::Other(_) => "internal",
        }
    }

    /// Whether the structured path may answer from the cached schema instead
    /// of propagating this error.
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(
            self,
            EngineError::Upstream(_) | EngineError::CodeSafety(_) | EngineError::Execution(_)
        )
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        EngineError::Upstream(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(EngineError::Validation("x".into()).code(), "bad_request");
        assert_eq!(EngineError::Auth.code(), "unauthorized");
        assert_eq!(EngineError::NotFound("doc".into()).code(), "not_found");
        assert_eq!(
            EngineError::Upstream("boom".into()).code(),
            "upstream_unavailable"
        );
        assert_eq!(
            EngineError::RunFailed {
                status: "expired".into(),
                detail: "timeout".into()
            }
            .code(),
            "run_failed"
        );
    }

    #[test]
    fn fallback_eligibility() {
        assert!(EngineError::Upstream("x".into()).is_fallback_eligible());
        assert!(EngineError::CodeSafety("import os".into()).is_fallback_eligible());
        assert!(EngineError::Execution("KeyError".into()).is_fallback_eligible());
        assert!(!EngineError::Validation("x".into()).is_fallback_eligible());
        assert!(!EngineError::Auth.is_fallback_eligible());
    }

    #[test]
    fn not_found_message_names_the_resource() {
        let err = EngineError::NotFound("document d1".into());
        assert_eq!(err.to_string(), "document d1 not found");
    }
}
