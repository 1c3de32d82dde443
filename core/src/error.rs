/// Error types for the messaging client
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Push channel error: {0}")]
    PushChannel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not authenticated")]
    NotAuthenticated,
}

/// Coarse classification used to decide how a failure is presented
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network or transport failure, including timeouts and 5xx responses
    Transport,
    /// The backend refused the session or the action
    Auth,
    /// The request was malformed (e.g. empty message content)
    Validation,
    /// The push connection dropped
    PushDisconnect,
    Other,
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Io(_) | ClientError::Transport(_) | ClientError::Timeout(_) => {
                ErrorKind::Transport
            }
            ClientError::Server { status, .. } if *status >= 500 => ErrorKind::Transport,
            ClientError::Unauthorized(_) | ClientError::Forbidden(_) | ClientError::NotAuthenticated => {
                ErrorKind::Auth
            }
            ClientError::Validation(_) => ErrorKind::Validation,
            ClientError::PushChannel(_) => ErrorKind::PushDisconnect,
            ClientError::Serialization(_)
            | ClientError::Server { .. }
            | ClientError::NotFound(_)
            | ClientError::Protocol(_)
            | ClientError::Config(_) => ErrorKind::Other,
        }
    }

    /// Whether repeating the same request may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transport | ErrorKind::PushDisconnect)
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
