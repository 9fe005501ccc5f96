use engine::{ArtifactKind, Blocked};

/// Failures of a single backend interaction or coordinator action.
///
/// None of these escape a dispatcher action; they end up in its
/// [`ActionOutcome`](crate::session::ActionOutcome) and in the log.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError {
    /// Input rejected before any request was made.
    #[error("{0}")]
    Validation(String),

    /// The stage or action is not available right now.
    #[error("action unavailable: {0}")]
    Unavailable(Blocked),

    /// The same action is already in flight.
    #[error("{0} is already in progress")]
    Busy(String),

    #[error("no block with id {0:?}")]
    UnknownBlock(String),

    /// Backend unreachable, timed out, or answered something unreadable.
    #[error("request to {endpoint} failed: {message}")]
    Transport { endpoint: String, message: String },

    /// Backend answered but reported failure.
    #[error("backend rejected {endpoint}: {detail}")]
    BackendRejection { endpoint: String, detail: String },

    /// Backend accepted the job but the artifact never showed up while polling.
    #[error("{artifact} not found after {attempts} probes; generation may still be running")]
    NotConfirmed { artifact: ArtifactKind, attempts: u32 },
}

impl PipelineError {
    pub fn transport(endpoint: impl Into<String>, err: impl std::fmt::Display) -> Self {
        PipelineError::Transport {
            endpoint: endpoint.into(),
            message: err.to_string(),
        }
    }

    pub fn rejection(endpoint: impl Into<String>, detail: impl Into<String>) -> Self {
        PipelineError::BackendRejection {
            endpoint: endpoint.into(),
            detail: detail.into(),
        }
    }

    /// Errors raised synchronously, before any network call.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            PipelineError::Validation(_)
                | PipelineError::Unavailable(_)
                | PipelineError::Busy(_)
                | PipelineError::UnknownBlock(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
