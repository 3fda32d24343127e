//! Channel directory and channel selection patterns.
//!
//! A channel key packs three fields: instrument id in bits 16–31, data type
//! in bits 8–15 and channel code in bits 0–7. Names take the form
//! `STATION.CHAN`.

use std::collections::HashSet;

use crate::error::{ProtocolError, Result};
use crate::wire::{Reader, Writer};

/// Width of the NUL-padded name field in channel and precis lists.
pub const NAME_LEN: usize = 12;

const CHANNEL_ENTRY_LEN: usize = 4 + NAME_LEN;
const PRECIS_ENTRY_LEN: usize = 4 + NAME_LEN + 4 + 4;

/// Data type embedded in a channel key.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DataType {
    Timeseries,
    Soh,
    Trigger,
    Event,
    Serial,
    TransparentSerial,
}

impl DataType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Timeseries),
            2 => Some(Self::Soh),
            3 => Some(Self::Trigger),
            4 => Some(Self::Event),
            6 => Some(Self::Serial),
            7 => Some(Self::TransparentSerial),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::Timeseries => 1,
            Self::Soh => 2,
            Self::Trigger => 3,
            Self::Event => 4,
            Self::Serial => 6,
            Self::TransparentSerial => 7,
        }
    }
}

impl From<DataType> for u8 {
    fn from(data_type: DataType) -> Self {
        data_type.to_u8()
    }
}

/// Build a channel key from its parts.
pub fn make_key(instrument_id: u16, data_type: u8, channel_code: u8) -> u32 {
    (u32::from(instrument_id) << 16) | (u32::from(data_type) << 8) | u32::from(channel_code)
}

/// One directory entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelKey {
    pub key: u32,
    /// `STATION.CHAN`, at most 11 characters.
    pub name: String,
    /// Network code assigned by [`ChannelDirectory::subset`].
    pub network: Option<String>,
}

impl ChannelKey {
    pub fn new(key: u32, name: impl Into<String>) -> Self {
        Self {
            key,
            name: name.into(),
            network: None,
        }
    }

    pub fn instrument_id(&self) -> u16 {
        (self.key >> 16) as u16
    }

    pub fn data_type(&self) -> u8 {
        ((self.key >> 8) & 0xFF) as u8
    }

    pub fn channel_code(&self) -> u8 {
        (self.key & 0xFF) as u8
    }

    /// Split the name into `(station, channel)` at the first `.`.
    pub fn station_channel(&self) -> (&str, &str) {
        split_name(&self.name)
    }
}

pub(crate) fn split_name(name: &str) -> (&str, &str) {
    name.split_once('.').unwrap_or((name, ""))
}

/// Ordered, immutable set of channels known to a server.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelDirectory {
    channels: Vec<ChannelKey>,
}

impl ChannelDirectory {
    /// Build a directory, dropping later entries that repeat a key.
    pub fn new(entries: Vec<ChannelKey>) -> Self {
        let mut seen = HashSet::with_capacity(entries.len());
        let channels = entries.into_iter().filter(|c| seen.insert(c.key)).collect();
        Self { channels }
    }

    /// Parse a ChannelList message body.
    pub fn parse(body: &[u8]) -> Result<Self> {
        let mut r = Reader::new(body);
        let count = r
            .u32()
            .ok_or_else(|| ProtocolError::InvalidChannelList("missing count".into()))?
            as usize;

        let needed = count.saturating_mul(CHANNEL_ENTRY_LEN);
        if r.remaining() < needed {
            return Err(ProtocolError::InvalidChannelList(format!(
                "{count} entries need {needed} bytes, body has {}",
                r.remaining()
            )));
        }

        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            // length was checked above
            let key = r.u32().unwrap_or_default();
            let name = r.fixed_str(NAME_LEN).unwrap_or_default();
            entries.push(ChannelKey::new(key, name));
        }
        Ok(Self::new(entries))
    }

    /// Serialize as a ChannelList message body.
    pub fn to_body(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(4 + self.channels.len() * CHANNEL_ENTRY_LEN);
        w.u32(self.channels.len() as u32);
        for c in &self.channels {
            w.u32(c.key).fixed_str(&c.name, NAME_LEN);
        }
        w.into_vec()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ChannelKey> {
        self.channels.iter()
    }

    pub fn keys(&self) -> Vec<u32> {
        self.channels.iter().map(|c| c.key).collect()
    }

    pub fn get(&self, key: u32) -> Option<&ChannelKey> {
        self.channels.iter().find(|c| c.key == key)
    }

    /// Index of `key`, used to address per-channel state.
    pub fn position(&self, key: u32) -> Option<usize> {
        self.channels.iter().position(|c| c.key == key)
    }

    /// Key for `name`, compared case-insensitively.
    pub fn lookup_key(&self, name: &str) -> Option<u32> {
        self.channels
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
            .map(|c| c.key)
    }

    pub fn lookup_name(&self, key: u32) -> Option<&str> {
        self.get(key).map(|c| c.name.as_str())
    }

    /// Entries whose key carries `data_type`, in directory order. Takes a
    /// [`DataType`] or a raw type code.
    pub fn filter_by_type(&self, data_type: impl Into<u8>) -> Self {
        let code = data_type.into();
        Self {
            channels: self
                .channels
                .iter()
                .filter(|c| c.data_type() == code)
                .cloned()
                .collect(),
        }
    }

    /// Entries matched by a comma-separated list of channel patterns.
    ///
    /// The first pattern that matches an entry decides its network code.
    pub fn subset(&self, patterns: &str, default_network: &str) -> Result<Self> {
        let patterns = ChannelPattern::parse_list(patterns, default_network)?;
        let channels = self
            .channels
            .iter()
            .filter_map(|c| {
                patterns.iter().find(|p| p.matches(&c.name)).map(|p| ChannelKey {
                    network: Some(p.network.clone()),
                    ..c.clone()
                })
            })
            .collect();
        Ok(Self { channels })
    }
}

impl<'a> IntoIterator for &'a ChannelDirectory {
    type Item = &'a ChannelKey;
    type IntoIter = std::slice::Iter<'a, ChannelKey>;

    fn into_iter(self) -> Self::IntoIter {
        self.channels.iter()
    }
}

#[derive(Clone, Debug)]
enum PatternChar {
    Literal(u8),
    Wildcard,
}

impl PatternChar {
    fn matches(&self, byte: u8) -> bool {
        match self {
            PatternChar::Literal(b) => b.eq_ignore_ascii_case(&byte),
            PatternChar::Wildcard => true,
        }
    }

    fn from_byte(b: u8) -> Self {
        if b == b'?' {
            PatternChar::Wildcard
        } else {
            PatternChar::Literal(b)
        }
    }
}

/// A parsed `NET.STA.CHAN` or `STA.CHAN` selector.
///
/// Station `*` matches every station; `?` in the channel matches any single
/// character.
#[derive(Clone, Debug)]
pub struct ChannelPattern {
    pub network: String,
    station: Option<String>,
    channel: Vec<PatternChar>,
}

impl ChannelPattern {
    pub fn parse(pattern: &str, default_network: &str) -> Result<Self> {
        let invalid = || ProtocolError::InvalidPattern(pattern.to_owned());
        let parts: Vec<&str> = pattern.trim().split('.').collect();
        let (network, station, channel) = match parts.as_slice() {
            [sta, chan] => (default_network, *sta, *chan),
            [net, sta, chan] => (*net, *sta, *chan),
            _ => return Err(invalid()),
        };
        if network.is_empty() || station.is_empty() || channel.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            network: network.to_owned(),
            station: (station != "*").then(|| station.to_owned()),
            channel: channel.bytes().map(PatternChar::from_byte).collect(),
        })
    }

    /// Parse a comma-separated pattern list. Empty items are rejected.
    pub fn parse_list(patterns: &str, default_network: &str) -> Result<Vec<Self>> {
        if patterns.trim().is_empty() {
            return Err(ProtocolError::InvalidPattern(patterns.to_owned()));
        }
        patterns
            .split(',')
            .map(|p| Self::parse(p, default_network))
            .collect()
    }

    /// Check a `STATION.CHAN` channel name against this pattern.
    pub fn matches(&self, name: &str) -> bool {
        let (station, channel) = split_name(name);

        if let Some(ref sta) = self.station
            && !sta.eq_ignore_ascii_case(station)
        {
            return false;
        }

        let channel = channel.as_bytes();
        channel.len() == self.channel.len()
            && self
                .channel
                .iter()
                .zip(channel)
                .all(|(p, &b)| p.matches(b))
    }
}

/// Time range a DataServer holds for one channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrecisEntry {
    pub key: u32,
    pub name: String,
    pub start_time: i32,
    pub end_time: i32,
}

/// Parse a PrecisList message body.
pub fn parse_precis_list(body: &[u8]) -> Result<Vec<PrecisEntry>> {
    let mut r = Reader::new(body);
    let count = r
        .u32()
        .ok_or_else(|| ProtocolError::InvalidPrecisList("missing count".into()))?
        as usize;

    let needed = count.saturating_mul(PRECIS_ENTRY_LEN);
    if r.remaining() < needed {
        return Err(ProtocolError::InvalidPrecisList(format!(
            "{count} entries need {needed} bytes, body has {}",
            r.remaining()
        )));
    }

    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        entries.push(PrecisEntry {
            key: r.u32().unwrap_or_default(),
            name: r.fixed_str(NAME_LEN).unwrap_or_default(),
            start_time: r.i32().unwrap_or_default(),
            end_time: r.i32().unwrap_or_default(),
        });
    }
    Ok(entries)
}

/// Serialize a PrecisList message body.
pub fn encode_precis_list(entries: &[PrecisEntry]) -> Vec<u8> {
    let mut w = Writer::with_capacity(4 + entries.len() * PRECIS_ENTRY_LEN);
    w.u32(entries.len() as u32);
    for e in entries {
        w.u32(e.key)
            .fixed_str(&e.name, NAME_LEN)
            .i32(e.start_time)
            .i32(e.end_time);
    }
    w.into_vec()
}
