use crate::error::{ProtocolError, Result};
use crate::wire::{Reader, Writer};

/// Magic value opening every NMXP message header.
pub const SIGNATURE: u32 = 0x7ABC_DE0F;

/// Header size: signature + type + length, all u32.
pub const HEADER_LEN: usize = 12;

/// NMXP message types, both directions.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    // -- server → client --
    Compressed,
    Decompressed,
    Trigger,
    Event,
    ChannelList,
    Error,
    Ready,
    PrecisList,
    // -- client → server --
    Connect,
    RequestPending,
    AddTimeSeriesChannels,
    ConnectRequest,
    PrecisListRequest,
    ChannelListRequest,
    DataRequest,
    // -- both --
    TerminateSubscription,
}

impl MessageType {
    /// Parse a wire type code. Unknown codes return `None`; callers log and
    /// skip them.
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::Compressed),
            4 => Some(Self::Decompressed),
            5 => Some(Self::Trigger),
            6 => Some(Self::Event),
            150 => Some(Self::ChannelList),
            190 => Some(Self::Error),
            208 => Some(Self::Ready),
            253 => Some(Self::PrecisList),
            100 => Some(Self::Connect),
            110 => Some(Self::RequestPending),
            120 => Some(Self::AddTimeSeriesChannels),
            206 => Some(Self::ConnectRequest),
            203 => Some(Self::PrecisListRequest),
            209 => Some(Self::ChannelListRequest),
            227 => Some(Self::DataRequest),
            200 => Some(Self::TerminateSubscription),
            _ => None,
        }
    }

    /// Wire type code.
    pub fn to_u32(self) -> u32 {
        match self {
            Self::Compressed => 1,
            Self::Decompressed => 4,
            Self::Trigger => 5,
            Self::Event => 6,
            Self::ChannelList => 150,
            Self::Error => 190,
            Self::Ready => 208,
            Self::PrecisList => 253,
            Self::Connect => 100,
            Self::RequestPending => 110,
            Self::AddTimeSeriesChannels => 120,
            Self::ConnectRequest => 206,
            Self::PrecisListRequest => 203,
            Self::ChannelListRequest => 209,
            Self::DataRequest => 227,
            Self::TerminateSubscription => 200,
        }
    }
}

/// Decoded message header. `msg_type` is kept raw so unknown types can be
/// skipped without losing framing.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub msg_type: u32,
    pub length: u32,
}

impl MessageHeader {
    pub fn new(msg_type: MessageType, length: u32) -> Self {
        Self {
            msg_type: msg_type.to_u32(),
            length,
        }
    }

    pub fn kind(&self) -> Option<MessageType> {
        MessageType::from_u32(self.msg_type)
    }
}

/// Encode a 12-byte header.
pub fn encode_header(header: MessageHeader) -> [u8; HEADER_LEN] {
    let mut w = Writer::with_capacity(HEADER_LEN);
    w.u32(SIGNATURE).u32(header.msg_type).u32(header.length);
    let mut out = [0u8; HEADER_LEN];
    out.copy_from_slice(&w.into_vec());
    out
}

/// Decode a 12-byte header, validating the signature.
///
/// On mismatch nothing else in the header is trusted.
pub fn decode_header(data: &[u8]) -> Result<MessageHeader> {
    let mut r = Reader::new(data);
    let (Some(signature), Some(msg_type), Some(length)) = (r.u32(), r.u32(), r.u32()) else {
        return Err(ProtocolError::FrameTooShort {
            expected: HEADER_LEN,
            actual: data.len(),
        });
    };

    if signature != SIGNATURE {
        return Err(ProtocolError::SignatureMismatch {
            expected: SIGNATURE,
            actual: signature,
        });
    }

    Ok(MessageHeader { msg_type, length })
}

/// Encode a complete message: header followed by `body`.
pub fn encode_message(msg_type: MessageType, body: &[u8]) -> Vec<u8> {
    let header = MessageHeader::new(msg_type, body.len() as u32);
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&encode_header(header));
    out.extend_from_slice(body);
    out
}
