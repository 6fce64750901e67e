use std::io;

use thiserror::Error;

pub type Result<T, E = ClientError> = std::result::Result<T, E>;

/// Errors talking to the proxy.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("{message} ({status})")]
    Status { status: u16, message: String },
    #[error("couldn't reach the proxy: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid proxy address: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("IO operation failed: {0}")]
    Io(#[from] io::Error),
    #[error("the proxy answered without a session cookie")]
    NoCookie,
}

impl ClientError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// The session is gone: the cookie expired, doesn't decrypt, or was never set.
    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }

    /// The saved server can't be used with the current session.
    pub fn is_refused(&self) -> bool {
        matches!(self.status(), Some(401 | 403))
    }
}
