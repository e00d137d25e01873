use std::time::Duration;

use core::error::Error;
use derive_more::Display;
use error_stack::Report;
use tonic::Code;
use tonic::Status;

/// Result type returned by the client.
pub type ClientResult<T> = Result<T, Report<ClientError>>;

#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The server answered with a non-OK status.
    #[display("{code:?}: {message}")]
    Status { code: Code, message: String },

    /// A cached lookup found nothing.
    #[display("{resource} {name:?} not found")]
    NotFound { resource: &'static str, name: String },

    #[display("failed to connect to {target}")]
    Connect { target: String },

    #[display("invalid client configuration: {message}")]
    Configuration { message: String },

    #[display("failed to obtain an access token: {message}")]
    Token { message: String },

    #[display("request did not complete within {_0:?}")]
    Timeout(Duration),

    #[display("unknown index {_0:?}")]
    UnknownIndex(String),
}

impl Error for ClientError {}

impl ClientError {
    pub fn from_status(status: &Status) -> Self {
        ClientError::Status {
            code: status.code(),
            message: status.message().to_string(),
        }
    }

    /// The wire code, if this error came from the server.
    pub fn code(&self) -> Option<Code> {
        match self {
            ClientError::Status { code, .. } => Some(*code),
            ClientError::NotFound { .. } => Some(Code::NotFound),
            ClientError::Timeout(_) => Some(Code::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.code() == Some(Code::NotFound)
    }

    pub fn is_already_exists(&self) -> bool {
        self.code() == Some(Code::AlreadyExists)
    }

    /// An optimistic concurrency failure; re-read and retry.
    pub fn is_conflict(&self) -> bool {
        self.code() == Some(Code::Aborted)
    }

    pub fn is_invalid(&self) -> bool {
        self.code() == Some(Code::InvalidArgument)
    }
}

impl From<Status> for ClientError {
    fn from(status: Status) -> Self {
        ClientError::from_status(&status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_wire_codes() {
        assert!(ClientError::from(Status::not_found("x")).is_not_found());
        assert!(ClientError::from(Status::aborted("x")).is_conflict());
        assert!(ClientError::from(Status::already_exists("x")).is_already_exists());
        assert!(ClientError::from(Status::invalid_argument("x")).is_invalid());
        assert!(ClientError::NotFound {
            resource: "gpus",
            name: "gpu-1".into()
        }
        .is_not_found());
        assert!(!ClientError::Connect {
            target: "unix:///x".into()
        }
        .is_not_found());
    }
}
