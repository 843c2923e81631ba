use crate::adapters::kv::KvError;
use crate::domain::registration::{NetworkFailureReason, RegistrationOutcome};
use crate::domain::token::ShapeViolation;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("No push token available: {0}")]
    NoTokenAvailable(NoTokenReason),
    #[error("Persistence failure: {0}")]
    Persistence(#[from] KvError),
    #[error("Registration rejected with status {status}")]
    Rejected { status: u16, body: String },
    #[error("Network failure: {0}")]
    Network(NetworkFailureReason),
    #[error("Token not registered: attempt ended as {0}")]
    NotRegistered(&'static str),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NoTokenReason {
    #[error("platform returned no token")]
    Empty,
    #[error("notification permission denied")]
    PermissionDenied,
    #[error("malformed token: {0}")]
    Malformed(ShapeViolation),
    #[error("platform error: {0}")]
    Platform(String),
}

impl NoTokenReason {
    /// Low-cardinality name for metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::PermissionDenied => "permission_denied",
            Self::Malformed(_) => "malformed",
            Self::Platform(_) => "platform",
        }
    }
}

pub type Result<T> = std::result::Result<T, LifecycleError>;

impl RegistrationOutcome {
    /// Converts the outcome into a `Result`, keeping the server response on success.
    ///
    /// # Errors
    /// Returns `Rejected` or `Network` for the corresponding failed outcomes.
    pub fn into_result(self) -> Result<serde_json::Value> {
        match self {
            Self::Success(body) => Ok(body),
            Self::Rejected { status, body } => Err(LifecycleError::Rejected { status, body }),
            Self::NetworkFailure(reason) => Err(LifecycleError::Network(reason)),
        }
    }
}
