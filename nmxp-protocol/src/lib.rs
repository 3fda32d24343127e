//! NMXP protocol types, message framing, and compressed packet decoding.
//!
//! This crate provides the wire layer shared by the PDS (subscription) and
//! DAP (bulk retrieval) clients: message headers, request bodies, channel
//! directories, and the differential bundle decoder that turns data
//! packets into sample records.

pub mod bundle;
pub mod channel;
pub mod error;
pub mod message;
pub mod packet;
pub mod request;
pub mod wire;

pub use channel::{ChannelDirectory, ChannelKey, ChannelPattern, DataType, PrecisEntry};
pub use error::{DecodeError, ProtocolError, Result};
pub use message::{HEADER_LEN, MessageHeader, MessageType, SIGNATURE};
pub use packet::{DataRecord, PacketHeader, decode_compressed, decode_decompressed};
pub use request::{Request, ShutdownReason};
