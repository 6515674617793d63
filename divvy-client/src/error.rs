use thiserror::Error;

use crate::protocol::FaultCode;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("Invalid field: {0}")]
    InvalidField(String),

    #[error("Server error ({code}): {message}")]
    ServerFault { code: FaultCode, message: String },

    #[error("Malformed reply: {0}")]
    MalformedReply(String),

    #[error("Failed to connect to {addr}: {reason}")]
    ConnectFailed { addr: String, reason: String },

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Client closed")]
    ClientClosed,

    #[error("Timeout")]
    Timeout,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClientError {
    /// True for failures of the connection to the server rather than of the
    /// request itself. The affected request was not answered.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ClientError::ConnectFailed { .. }
                | ClientError::ConnectionLost(_)
                | ClientError::NotConnected
                | ClientError::Timeout
                | ClientError::MalformedReply(_)
        )
    }

    /// True when the server answered the request with an error reply.
    pub fn is_application(&self) -> bool {
        matches!(self, ClientError::ServerFault { .. })
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
