use crate::error::{ProtocolError, Result};
use crate::message::{MessageType, encode_message};
use crate::wire::{Reader, Writer};

/// Width of the NUL-padded username field in a ConnectRequest.
pub const USERNAME_LEN: usize = 12;

/// Protocol version announced in ConnectRequest.
pub const DAP_PROTOCOL_VERSION: i32 = 0;

/// Value for `out_format` meaning "native sample rate".
pub const NATIVE_RATE: i32 = -1;

/// Reason code carried by TerminateSubscription.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ShutdownReason {
    Normal,
    Error,
    Timeout,
}

impl ShutdownReason {
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            1 => Some(Self::Normal),
            2 => Some(Self::Error),
            3 => Some(Self::Timeout),
            _ => None,
        }
    }

    pub fn to_i32(self) -> i32 {
        match self {
            Self::Normal => 1,
            Self::Error => 2,
            Self::Timeout => 3,
        }
    }
}

/// A client → server message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    // PDS
    Connect,
    RequestPending,
    AddTimeSeriesChannels {
        keys: Vec<u32>,
        /// -1 raw stream, 0 no wait, 1..=300 seconds to wait for missing packets.
        short_term_completion: i32,
        out_format: i32,
        buffered: bool,
    },

    // DAP
    ConnectRequest {
        username: String,
        connection_time: i32,
        crc32: u32,
    },
    ChannelListRequest,
    PrecisListRequest {
        instrument_id: i32,
        data_type: i32,
        channel: i32,
    },
    DataRequest {
        key: u32,
        start: i32,
        end: i32,
    },

    // Both
    TerminateSubscription {
        reason: ShutdownReason,
        message: String,
    },
}

impl Request {
    /// Build a ConnectRequest, computing its checksum from the credentials.
    ///
    /// The checksum covers `username`, the protocol version, the
    /// connection time and `password`, concatenated as ASCII text.
    pub fn connect_request(username: &str, password: &str, connection_time: i32) -> Result<Self> {
        if username.len() >= USERNAME_LEN {
            return Err(ProtocolError::UsernameTooLong(username.len()));
        }
        let text = format!("{username}{DAP_PROTOCOL_VERSION}{connection_time}{password}");
        Ok(Self::ConnectRequest {
            username: username.to_owned(),
            connection_time,
            crc32: crc32fast::hash(text.as_bytes()),
        })
    }

    pub fn msg_type(&self) -> MessageType {
        match self {
            Self::Connect => MessageType::Connect,
            Self::RequestPending => MessageType::RequestPending,
            Self::AddTimeSeriesChannels { .. } => MessageType::AddTimeSeriesChannels,
            Self::ConnectRequest { .. } => MessageType::ConnectRequest,
            Self::ChannelListRequest => MessageType::ChannelListRequest,
            Self::PrecisListRequest { .. } => MessageType::PrecisListRequest,
            Self::DataRequest { .. } => MessageType::DataRequest,
            Self::TerminateSubscription { .. } => MessageType::TerminateSubscription,
        }
    }

    /// Serialize the message body (without header).
    pub fn to_body(&self) -> Vec<u8> {
        let mut w = Writer::default();
        match self {
            Self::Connect | Self::RequestPending | Self::ChannelListRequest => {}
            Self::AddTimeSeriesChannels {
                keys,
                short_term_completion,
                out_format,
                buffered,
            } => {
                w.i32(keys.len() as i32);
                for key in keys {
                    w.u32(*key);
                }
                w.i32(*short_term_completion)
                    .i32(*out_format)
                    .i32(i32::from(*buffered));
            }
            Self::ConnectRequest {
                username,
                connection_time,
                crc32,
            } => {
                w.fixed_str(username, USERNAME_LEN)
                    .i32(DAP_PROTOCOL_VERSION)
                    .i32(*connection_time)
                    .u32(*crc32);
            }
            Self::PrecisListRequest {
                instrument_id,
                data_type,
                channel,
            } => {
                w.i32(*instrument_id).i32(*data_type).i32(*channel);
            }
            Self::DataRequest { key, start, end } => {
                w.u32(*key).i32(*start).i32(*end);
            }
            Self::TerminateSubscription { reason, message } => {
                w.i32(reason.to_i32()).bytes(message.as_bytes());
            }
        }
        w.into_vec()
    }

    /// Serialize header + body.
    pub fn to_message(&self) -> Vec<u8> {
        encode_message(self.msg_type(), &self.to_body())
    }

    /// Parse a client message. Used by test servers to check what was sent.
    pub fn parse(msg_type: u32, body: &[u8]) -> Result<Self> {
        let kind = MessageType::from_u32(msg_type).ok_or(ProtocolError::UnexpectedMessage {
            expected: MessageType::Connect,
            actual: msg_type,
        })?;
        let mut r = Reader::new(body);
        let short = || ProtocolError::FrameTooShort {
            expected: body.len() + 1,
            actual: body.len(),
        };

        match kind {
            MessageType::Connect => Ok(Self::Connect),
            MessageType::RequestPending => Ok(Self::RequestPending),
            MessageType::ChannelListRequest => Ok(Self::ChannelListRequest),
            MessageType::AddTimeSeriesChannels => {
                let count = r.i32().ok_or_else(short)?.max(0) as usize;
                let mut keys = Vec::with_capacity(count.min(r.remaining() / 4));
                for _ in 0..count {
                    keys.push(r.u32().ok_or_else(short)?);
                }
                let short_term_completion = r.i32().ok_or_else(short)?;
                let out_format = r.i32().ok_or_else(short)?;
                let buffered = r.i32().ok_or_else(short)? != 0;
                Ok(Self::AddTimeSeriesChannels {
                    keys,
                    short_term_completion,
                    out_format,
                    buffered,
                })
            }
            MessageType::ConnectRequest => {
                let username = r.fixed_str(USERNAME_LEN).ok_or_else(short)?;
                let _version = r.i32().ok_or_else(short)?;
                let connection_time = r.i32().ok_or_else(short)?;
                let crc32 = r.u32().ok_or_else(short)?;
                Ok(Self::ConnectRequest {
                    username,
                    connection_time,
                    crc32,
                })
            }
            MessageType::PrecisListRequest => Ok(Self::PrecisListRequest {
                instrument_id: r.i32().ok_or_else(short)?,
                data_type: r.i32().ok_or_else(short)?,
                channel: r.i32().ok_or_else(short)?,
            }),
            MessageType::DataRequest => Ok(Self::DataRequest {
                key: r.u32().ok_or_else(short)?,
                start: r.i32().ok_or_else(short)?,
                end: r.i32().ok_or_else(short)?,
            }),
            MessageType::TerminateSubscription => {
                let code = r.i32().ok_or_else(short)?;
                let reason = ShutdownReason::from_i32(code).unwrap_or(ShutdownReason::Error);
                Ok(Self::TerminateSubscription {
                    reason,
                    message: message_text(r.rest()),
                })
            }
            other => Err(ProtocolError::UnexpectedMessage {
                expected: MessageType::Connect,
                actual: other.to_u32(),
            }),
        }
    }
}

/// Text carried by ERROR and TerminateSubscription bodies, without
/// trailing NULs.
pub fn message_text(body: &[u8]) -> String {
    let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
    String::from_utf8_lossy(&body[..end]).trim().to_owned()
}
