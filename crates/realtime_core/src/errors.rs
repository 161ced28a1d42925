use thiserror::Error;

/// The error taxonomy is a set of *kinds*, not a grab-bag of ad-hoc variants:
/// every boundary maps one of these to the wire's `error` envelope with a
/// numeric code and short reason.
#[derive(Debug, Error, Clone)]
pub enum RealtimeError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("aborted: {0}")]
    Aborted(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("handler failure: {0}")]
    HandlerFailure(String),
}

impl RealtimeError {
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument(reason.into())
    }
    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::NotFound(reason.into())
    }
    pub fn permission_denied(reason: impl Into<String>) -> Self {
        Self::PermissionDenied(reason.into())
    }
    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::Conflict(reason.into())
    }
    pub fn resource_exhausted(reason: impl Into<String>) -> Self {
        Self::ResourceExhausted(reason.into())
    }
    pub fn failed_precondition(reason: impl Into<String>) -> Self {
        Self::FailedPrecondition(reason.into())
    }
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::Aborted(reason.into())
    }
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable(reason.into())
    }
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal(reason.into())
    }
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled(reason.into())
    }
    pub fn handler_failure(reason: impl Into<String>) -> Self {
        Self::HandlerFailure(reason.into())
    }

    /// Numeric code transmitted on the wire `error` envelope.
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidArgument(_) => 3,
            Self::NotFound(_) => 5,
            Self::PermissionDenied(_) => 7,
            Self::Conflict(_) => 9,
            Self::ResourceExhausted(_) => 8,
            Self::FailedPrecondition(_) => 9, // shares gRPC-style code 9 with Conflict, distinguished by reason text
            Self::Aborted(_) => 10,
            Self::Unavailable(_) => 14,
            Self::Internal(_) => 13,
            Self::Cancelled(_) => 1,
            Self::HandlerFailure(_) => 100,
        }
    }

    pub fn reason(&self) -> String {
        self.to_string()
    }
}
