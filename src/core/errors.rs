use std::fmt;

use thiserror::Error;

use crate::ledger::LedgerError;

#[derive(Error, Debug)]
pub enum ConsoleError {
    #[error("I/O error: {0}")]
    Io(Box<std::io::Error>),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Reqwest error: {0}")]
    Reqwest(Box<reqwest::Error>),

    #[error("Failed to install tracing subscriber: {0}")]
    Logging(String),

    #[error("ConsoleError: {0}")]
    Custom(String),
}

impl From<std::io::Error> for ConsoleError {
    fn from(error: std::io::Error) -> Self {
        ConsoleError::Io(Box::new(error))
    }
}

impl From<reqwest::Error> for ConsoleError {
    fn from(error: reqwest::Error) -> Self {
        ConsoleError::Reqwest(Box::new(error))
    }
}

/// Failure categories shared by both controllers. Every error surfaced to the
/// UI layer carries one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    InvalidArgument,
    InvalidState,
    Expired,
    VerificationFailed,
    AttemptsExhausted,
    RemoteFailure,
}

impl ErrorKind {
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::InvalidState => "invalid state",
            ErrorKind::Expired => "expired",
            ErrorKind::VerificationFailed => "verification failed",
            ErrorKind::AttemptsExhausted => "attempts exhausted",
            ErrorKind::RemoteFailure => "remote failure",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind}: {message}")]
pub struct SchedulerError {
    pub kind: ErrorKind,
    pub message: String,
}

impl SchedulerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidState, message)
    }

    pub fn remote(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RemoteFailure, message)
    }
}

impl From<LedgerError> for SchedulerError {
    fn from(error: LedgerError) -> Self {
        SchedulerError::remote(error.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind}: {message}")]
pub struct ConsentError {
    pub kind: ErrorKind,
    pub message: String,
    /// Attempts left on the session after this failure, when one still exists.
    pub attempts_remaining: Option<u32>,
}

impl ConsentError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), attempts_remaining: None }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidState, message)
    }

    pub fn expired(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Expired, message)
    }

    pub fn verification_failed(attempts_remaining: u32) -> Self {
        Self {
            kind: ErrorKind::VerificationFailed,
            message: format!("Invalid OTP. {attempts_remaining} attempts remaining."),
            attempts_remaining: Some(attempts_remaining),
        }
    }

    pub fn attempts_exhausted() -> Self {
        Self {
            kind: ErrorKind::AttemptsExhausted,
            message: "Invalid OTP. Maximum attempts exceeded. Please request a new OTP."
                .to_string(),
            attempts_remaining: Some(0),
        }
    }

    pub fn remote(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RemoteFailure, message)
    }
}
