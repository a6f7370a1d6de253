//! Central error hierarchy.
//!
//! Every fallible operation in the deliberation pipeline resolves to one of
//! these kinds so call sites can match on kind while still propagating a
//! human-readable message, instead of threading stringly-typed errors.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CouncilError {
    #[error("configuration invalid: {0}")]
    ConfigInvalid(String),

    #[error("model backend unreachable: {0}")]
    BackendUnreachable(String),

    #[error("model not loaded: {0}")]
    ModelNotLoaded(String),

    #[error("request timed out after {0}s")]
    Timeout(u64),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("ranker produced an unparseable ranking: {0}")]
    Unparseable(String),

    #[error("insufficient council responses ({succeeded}/{attempted}, need >= {required})")]
    InsufficientCouncil {
        succeeded: usize,
        attempted: usize,
        required: usize,
    },

    #[error("request cancelled")]
    Cancelled,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("subscriber lagged and was dropped")]
    SubscriberLagged,
}

impl CouncilError {
    /// The process exit code this error maps to when encountered during
    /// startup validation (§6). Not meaningful for request-scoped errors.
    pub fn exit_code(&self) -> i32 {
        match self {
            CouncilError::ConfigInvalid(_) => 1,
            CouncilError::BackendUnreachable(_) => 2,
            CouncilError::ModelNotLoaded(_) => 3,
            _ => 1,
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            CouncilError::ConfigInvalid(_) => "config_invalid",
            CouncilError::BackendUnreachable(_) => "backend_unreachable",
            CouncilError::ModelNotLoaded(_) => "model_not_loaded",
            CouncilError::Timeout(_) => "timeout",
            CouncilError::ProtocolError(_) => "protocol_error",
            CouncilError::Unparseable(_) => "unparseable",
            CouncilError::InsufficientCouncil { .. } => "insufficient_council",
            CouncilError::Cancelled => "cancelled",
            CouncilError::NotFound(_) => "not_found",
            CouncilError::SubscriberLagged => "subscriber_lagged",
        }
    }
}

pub type CouncilResult<T> = Result<T, CouncilError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(CouncilError::ConfigInvalid("x".into()).exit_code(), 1);
        assert_eq!(CouncilError::BackendUnreachable("x".into()).exit_code(), 2);
        assert_eq!(CouncilError::ModelNotLoaded("x".into()).exit_code(), 3);
    }

    #[test]
    fn test_kind_str_distinct() {
        let err = CouncilError::InsufficientCouncil {
            succeeded: 1,
            attempted: 3,
            required: 2,
        };
        assert_eq!(err.kind_str(), "insufficient_council");
    }
}
