use std::time::Duration;

use nmxp_rs_protocol::{DecodeError, ProtocolError};

/// Errors that can occur during PDS/DAP client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// TCP or socket I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Framing or handshake error (bad signature, unexpected message type, etc.).
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A data packet could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The peer closed the socket part way through a fixed-size transfer.
    #[error("short transfer: expected {expected} bytes, got {actual}")]
    ShortTransfer { expected: usize, actual: usize },

    /// TCP connect to the server failed.
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Operation exceeded the configured timeout duration.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// Server closed the connection between messages.
    #[error("disconnected")]
    Disconnected,

    /// Server sent an ERROR message.
    #[error("server error: {0}")]
    ServerError(String),

    /// Method called in wrong client state (e.g., `next_record` before subscribing).
    #[error("invalid state: expected {expected}, actual {actual}")]
    InvalidState {
        /// The state(s) required for the operation.
        expected: &'static str,
        /// The current client state.
        actual: &'static str,
    },

    /// Request parameters rejected before any socket was opened.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The stop signal fired.
    #[error("stopped")]
    Stopped,

    /// Gave up reconnecting after the configured number of attempts.
    #[error("reconnect failed after {attempts} attempts")]
    ReconnectFailed { attempts: u32 },
}

impl ClientError {
    /// Whether the connection this error came from is unusable.
    ///
    /// These are the errors a reconnecting client recovers from by opening a
    /// new connection. Server-reported errors, configuration errors and
    /// decode errors are not.
    pub fn is_connection_fatal(&self) -> bool {
        match self {
            Self::Io(_)
            | Self::ShortTransfer { .. }
            | Self::Connect { .. }
            | Self::Timeout(_)
            | Self::Disconnected => true,
            Self::Protocol(e) => matches!(
                e,
                ProtocolError::SignatureMismatch { .. }
                    | ProtocolError::FrameTooShort { .. }
                    | ProtocolError::MessageTooLarge { .. }
                    | ProtocolError::UnexpectedMessage { .. }
            ),
            _ => false,
        }
    }
}

/// Convenience alias for `Result<T, ClientError>`.
pub type Result<T> = std::result::Result<T, ClientError>;
