use lowband_http::{DecodeError, TransportError};
use lowband_proxy::RotateError;

/// Terminal failures of one pipeline run.
///
/// `Clone` so a leader can hand the same failure to every follower.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("upstream fetch failed after {attempts} attempt(s): {last_error}")]
    TransportFailure {
        attempts: u32,
        #[source]
        last_error: TransportError,
    },

    #[error("could not decode upstream body: {0}")]
    DecodingFailure(#[from] DecodeError),

    #[error("no healthy egress proxy available for session '{session}'")]
    NoProxyAvailable { session: String },

    #[error("gave up after {waited_ms} ms waiting on an identical in-flight request")]
    DedupTimeout { waited_ms: u64 },

    #[error("the identical in-flight request was cancelled before it completed")]
    LeaderAborted,

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl From<RotateError> for PipelineError {
    fn from(err: RotateError) -> Self {
        match err {
            RotateError::NoProxyAvailable { session } => PipelineError::NoProxyAvailable { session },
        }
    }
}
