use crate::bundle::{BUNDLE_LEN, unpack_bundles};
use crate::channel::{ChannelDirectory, make_key, split_name};
use crate::error::DecodeError;
use crate::message::MessageType;
use crate::wire::{Reader, Writer};

/// Size of the compressed packet header, which is itself bundle-sized.
pub const PACKET_HEADER_LEN: usize = BUNDLE_LEN;

/// Offset of the first data bundle in a compressed body
/// (oldest sequence number + packet header).
pub const COMPRESSED_DATA_OFFSET: usize = 4 + PACKET_HEADER_LEN;

/// Fixed part of a decompressed body: key, time, sample count, rate.
pub const DECOMPRESSED_HEADER_LEN: usize = 20;

/// Sample rates in Hz indexed by the 5-bit rate code. Zero entries are
/// reserved codes.
pub const RATE_TABLE: [i32; 32] = [
    0, 1, 2, 5, 10, 20, 40, 50, 80, 100, 125, 200, 250, 500, 1000, 25, 120, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0,
];

/// Packet type low nibble marking a filler packet.
const FILLER_PACKET: u8 = 9;

/// Data type code stamped into keys derived from compressed headers.
const TIMESERIES_TYPE: u8 = 1;

/// Sample rate for a rate code; reserved and out-of-range codes give 0.
pub fn sample_rate_for_code(code: u8) -> i32 {
    RATE_TABLE.get(code as usize).copied().unwrap_or(0)
}

/// The 17-byte header at the start of every compressed packet.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_type: u8,
    pub seconds: u32,
    /// Sub-second part in units of 1/10000 s.
    pub ticks: u16,
    pub instrument_id: u16,
    pub sequence_number: u32,
    /// Rate code in the upper 5 bits, channel code in the lower 3.
    pub rate_byte: u8,
    /// First sample, a signed 24-bit value on the wire.
    pub x0: i32,
}

impl PacketHeader {
    pub fn parse(r: &mut Reader<'_>) -> Option<Self> {
        Some(Self {
            packet_type: r.u8()?,
            seconds: r.u32()?,
            ticks: r.u16()?,
            instrument_id: r.u16()?,
            sequence_number: r.u32()?,
            rate_byte: r.u8()?,
            x0: r.i24()?,
        })
    }

    pub fn to_bytes(&self) -> [u8; PACKET_HEADER_LEN] {
        let mut out = [0u8; PACKET_HEADER_LEN];
        out[0] = self.packet_type;
        out[1..5].copy_from_slice(&self.seconds.to_be_bytes());
        out[5..7].copy_from_slice(&self.ticks.to_be_bytes());
        out[7..9].copy_from_slice(&self.instrument_id.to_be_bytes());
        out[9..13].copy_from_slice(&self.sequence_number.to_be_bytes());
        out[13] = self.rate_byte;
        out[14..17].copy_from_slice(&(self.x0 as u32).to_be_bytes()[1..]);
        out
    }

    pub fn is_filler(&self) -> bool {
        self.packet_type & 0x0F == FILLER_PACKET
    }

    pub fn rate_code(&self) -> u8 {
        self.rate_byte >> 3
    }

    pub fn channel_code(&self) -> u8 {
        self.rate_byte & 0x07
    }

    pub fn key(&self) -> u32 {
        make_key(self.instrument_id, TIMESERIES_TYPE, self.channel_code())
    }

    pub fn time(&self) -> f64 {
        f64::from(self.seconds) + f64::from(self.ticks) / 10_000.0
    }
}

/// A decoded block of samples for one channel.
#[derive(Clone, Debug, PartialEq)]
pub struct DataRecord {
    pub key: u32,
    pub network: Option<String>,
    pub station: String,
    pub channel: String,
    pub packet_type: i32,
    /// First sample of a compressed packet.
    pub x0: Option<i32>,
    /// Final chained value of a compressed packet. The next contiguous
    /// packet of the channel starts with this value as its `x0`.
    pub last_value: Option<i32>,
    pub sequence_number: Option<i32>,
    pub oldest_sequence: Option<i32>,
    /// Time of the first sample, epoch seconds.
    pub time: f64,
    pub samples: Vec<i32>,
    pub sample_rate: i32,
    /// Length of the message body this record came from.
    pub raw_length: usize,
}

impl DataRecord {
    /// Time just after the last sample.
    pub fn end_time(&self) -> f64 {
        if self.sample_rate > 0 {
            self.time + self.samples.len() as f64 / f64::from(self.sample_rate)
        } else {
            self.time
        }
    }

    /// `STATION.CHAN`.
    pub fn name(&self) -> String {
        format!("{}.{}", self.station, self.channel)
    }

    /// Keep only samples whose time falls in `[start, end)`.
    ///
    /// `time` and `x0` move to the first kept sample; when the tail is cut,
    /// `last_value` becomes the first dropped sample. Returns whether any
    /// samples remain.
    pub fn trim(&mut self, start: f64, end: f64) -> bool {
        // In samples. Epoch times near 1.7e9 carry ~1e-7 s of rounding.
        const EPSILON: f64 = 1e-3;

        if self.samples.is_empty() || self.sample_rate <= 0 || end <= start {
            self.samples.clear();
            return false;
        }

        let rate = f64::from(self.sample_rate);
        let len = self.samples.len();
        let index_at = |t: f64| ((t - self.time) * rate - EPSILON).ceil().clamp(0.0, len as f64) as usize;
        let first = index_at(start);
        let last = index_at(end);

        if first >= last {
            self.samples.clear();
            return false;
        }

        if last < len {
            self.last_value = self.last_value.map(|_| self.samples[last]);
        }
        self.samples.truncate(last);
        self.samples.drain(..first);
        self.time += first as f64 / rate;
        if self.x0.is_some() {
            self.x0 = self.samples.first().copied();
        }
        true
    }
}

/// Decode a COMPRESSED message body.
///
/// The body is the oldest buffered sequence number, the packet header and a
/// run of bundles. The output is seeded with `x0` and the decoder keeps all
/// but the final chained value, which is reported as `last_value`: it is
/// the `x0` of the channel's next packet.
pub fn decode_compressed(body: &[u8], directory: &ChannelDirectory) -> Result<DataRecord, DecodeError> {
    let mut r = Reader::new(body);
    let (Some(oldest), Some(header)) = (r.i32(), PacketHeader::parse(&mut r)) else {
        return Err(DecodeError::BodyTooShort {
            expected: COMPRESSED_DATA_OFFSET,
            actual: body.len(),
        });
    };

    if header.is_filler() {
        return Err(DecodeError::FillerPacket);
    }

    let bundles = r.rest();
    if bundles.len() % BUNDLE_LEN != 0 {
        return Err(DecodeError::BundleRemainder { len: bundles.len() });
    }

    let key = header.key();
    let mut samples = Vec::with_capacity(1 + bundles.len() / BUNDLE_LEN * 16);
    samples.push(header.x0);
    let mut previous = header.x0;
    unpack_bundles(bundles, &mut previous, &mut samples);
    let last_value = samples.pop();

    let sample_rate = sample_rate_for_code(header.rate_code());
    if sample_rate == 0 && !samples.is_empty() {
        return Err(DecodeError::InvalidSampleRate {
            key,
            code: header.rate_code(),
        });
    }

    let (network, station, channel) = resolve(directory, key)?;
    Ok(DataRecord {
        key,
        network,
        station,
        channel,
        packet_type: i32::from(header.packet_type),
        x0: Some(header.x0),
        last_value,
        sequence_number: Some(header.sequence_number as i32),
        oldest_sequence: Some(oldest),
        time: header.time(),
        samples,
        sample_rate,
        raw_length: body.len(),
    })
}

/// Decode a DECOMPRESSED message body.
pub fn decode_decompressed(body: &[u8], directory: &ChannelDirectory) -> Result<DataRecord, DecodeError> {
    let mut r = Reader::new(body);
    let (Some(key), Some(time), Some(n_samp), Some(rate)) = (r.u32(), r.f64(), r.u32(), r.u32()) else {
        return Err(DecodeError::BodyTooShort {
            expected: DECOMPRESSED_HEADER_LEN,
            actual: body.len(),
        });
    };

    let expected = (n_samp as usize)
        .saturating_mul(4)
        .saturating_add(DECOMPRESSED_HEADER_LEN);
    if body.len() != expected {
        return Err(DecodeError::LengthMismatch {
            expected,
            actual: body.len(),
        });
    }

    let samples: Vec<i32> = r
        .rest()
        .chunks_exact(4)
        .map(|c| i32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    let sample_rate = rate as i32;
    if sample_rate <= 0 && !samples.is_empty() {
        return Err(DecodeError::InvalidSampleRate { key, code: 0 });
    }

    let (network, station, channel) = resolve(directory, key)?;
    Ok(DataRecord {
        key,
        network,
        station,
        channel,
        packet_type: MessageType::Decompressed.to_u32() as i32,
        x0: None,
        last_value: None,
        sequence_number: None,
        oldest_sequence: None,
        time,
        samples,
        sample_rate,
        raw_length: body.len(),
    })
}

fn resolve(directory: &ChannelDirectory, key: u32) -> Result<(Option<String>, String, String), DecodeError> {
    let entry = directory.get(key).ok_or(DecodeError::UnknownChannel(key))?;
    let (station, channel) = split_name(&entry.name);
    Ok((entry.network.clone(), station.to_owned(), channel.to_owned()))
}

/// Build a COMPRESSED body from a header and raw bundle bytes.
pub fn encode_compressed(oldest_sequence: i32, header: &PacketHeader, bundles: &[u8]) -> Vec<u8> {
    let mut w = Writer::with_capacity(COMPRESSED_DATA_OFFSET + bundles.len());
    w.i32(oldest_sequence).bytes(&header.to_bytes()).bytes(bundles);
    w.into_vec()
}

/// Build a DECOMPRESSED body.
pub fn encode_decompressed(key: u32, time: f64, sample_rate: u32, samples: &[i32]) -> Vec<u8> {
    let mut w = Writer::with_capacity(DECOMPRESSED_HEADER_LEN + samples.len() * 4);
    w.u32(key)
        .bytes(&time.to_be_bytes())
        .u32(samples.len() as u32)
        .u32(sample_rate);
    for s in samples {
        w.i32(*s);
    }
    w.into_vec()
}
