// =============================================================================
// Matrixon Identity - Error Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Error taxonomy shared by every identity operation. Failures are always
//   delivered through the completion path of an operation, never by panicking.
//
// =============================================================================

use std::{fmt, io};

use thiserror::Error;

use crate::service::identity::{BindingState, ThreePid};

/// Why the identity server refused a submitted validation code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeRejection {
    /// The code does not match the one sent out of band
    InvalidCode,
    /// The validation session is no longer known to the identity server
    ExpiredSession,
}

impl fmt::Display for CodeRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCode => f.write_str("invalid code"),
            Self::ExpiredSession => f.write_str("expired session"),
        }
    }
}

/// Matrixon identity error type
#[derive(Debug, Error)]
pub enum Error {
    #[error("Identity server unreachable: {0}")]
    Unreachable(String),

    #[error("Unsupported identity server version: {0}")]
    UnsupportedServerVersion(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("No identity server configured")]
    NoIdentityServerConfigured,

    #[error("No active binding session for {0}")]
    NoActiveSession(ThreePid),

    #[error("Validation code rejected: {0}")]
    InvalidOrExpiredCode(CodeRejection),

    #[error("Validation session expired")]
    SessionExpired,

    #[error("Third party identifier is already bound")]
    AlreadyBound,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Binding for {threepid} is {actual:?}, expected one of {expected:?}")]
    UnexpectedBindingState {
        threepid: ThreePid,
        expected: &'static [BindingState],
        actual: Option<BindingState>,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    BadConfig(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Only transport failures are worth retrying as-is
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Error::MalformedResponse(err.to_string())
        } else {
            Error::Unreachable(err.to_string())
        }
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

/// Matrixon identity result type
pub type Result<T> = std::result::Result<T, Error>;
