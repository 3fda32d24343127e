use crate::message::MessageType;

/// Framing and handshake errors. Any of these leaves the connection
/// desynchronized.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("signature mismatch: expected {expected:#010X}, actual {actual:#010X}")]
    SignatureMismatch { expected: u32, actual: u32 },

    #[error("frame too short: expected {expected}, actual {actual}")]
    FrameTooShort { expected: usize, actual: usize },

    #[error("unexpected message: expected {expected:?}, actual type {actual}")]
    UnexpectedMessage { expected: MessageType, actual: u32 },

    #[error("invalid channel list: {0}")]
    InvalidChannelList(String),

    #[error("invalid precis list: {0}")]
    InvalidPrecisList(String),

    #[error("invalid channel pattern: {0:?}")]
    InvalidPattern(String),

    #[error("message too large: {length} bytes (max {max})")]
    MessageTooLarge { length: u32, max: u32 },

    #[error("username too long: {0} bytes (max 11)")]
    UsernameTooLong(usize),
}

/// Errors that drop a single packet. The stream itself stays usable.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("body too short: expected at least {expected}, actual {actual}")]
    BodyTooShort { expected: usize, actual: usize },

    #[error("bundle area of {len} bytes is not a multiple of 17")]
    BundleRemainder { len: usize },

    #[error("filler packet")]
    FillerPacket,

    #[error("unknown channel key {0:#010X}")]
    UnknownChannel(u32),

    #[error("body length mismatch: expected {expected}, actual {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("invalid sample rate for key {key:#010X} (rate code {code})")]
    InvalidSampleRate { key: u32, code: u8 },
}

pub type Result<T, E = ProtocolError> = std::result::Result<T, E>;
