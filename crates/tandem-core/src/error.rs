//! Error types for Tandem

use thiserror::Error;

/// Result type alias for Tandem operations
pub type Result<T> = std::result::Result<T, Error>;

/// Tandem error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Operation on a closed or otherwise unusable handle
    #[error("invalid handle: connection is closed")]
    InvalidHandle,

    /// Call made in a state that does not allow it
    #[error("precondition violated: {0}")]
    PreconditionViolated(String),

    /// Session description failed structural validation
    #[error("malformed session description: {0}")]
    MalformedDescription(String),

    /// Allocation failure during construction or gathering
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Connectivity check failed; the negotiation round is still valid
    #[error("transient failure: {0}")]
    Transient(String),

    /// Bad argument to a pure function
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Numeric status code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::InvalidHandle => ErrorCode::InvalidHandle,
            Error::PreconditionViolated(_) => ErrorCode::PreconditionViolated,
            Error::MalformedDescription(_) => ErrorCode::MalformedDescription,
            Error::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
            Error::Transient(_) => ErrorCode::Transient,
            Error::InvalidArgument(_) => ErrorCode::InvalidArgument,
        }
    }

    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Error::MalformedDescription(msg.into())
    }
}

/// Status codes reported at the API boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // 100-199: handle errors
    InvalidHandle = 100,

    // 200-299: caller errors
    PreconditionViolated = 200,
    MalformedDescription = 201,
    InvalidArgument = 202,

    // 300-399: runtime errors
    ResourceExhausted = 300,
    Transient = 301,
}

impl ErrorCode {
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            100 => Some(ErrorCode::InvalidHandle),
            200 => Some(ErrorCode::PreconditionViolated),
            201 => Some(ErrorCode::MalformedDescription),
            202 => Some(ErrorCode::InvalidArgument),
            300 => Some(ErrorCode::ResourceExhausted),
            301 => Some(ErrorCode::Transient),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for err in [
            Error::InvalidHandle,
            Error::PreconditionViolated("x".into()),
            Error::MalformedDescription("x".into()),
            Error::ResourceExhausted("x".into()),
            Error::Transient("x".into()),
            Error::InvalidArgument("x".into()),
        ] {
            let code = err.code();
            assert_eq!(ErrorCode::from_u16(code as u16), Some(code));
        }
        assert_eq!(ErrorCode::from_u16(999), None);
    }
}
