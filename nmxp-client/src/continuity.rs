//! Per-channel stream continuity.
//!
//! Each subscribed channel remembers where its last record ended. A new
//! record starting later than that (beyond [`GAP_TOLERANCE`]) is a gap,
//! earlier is an overlap. Compressed records also carry the decoder's
//! rebasing value, which the next packet's `x0` must repeat.

use nmxp_rs_protocol::{ChannelDirectory, DataRecord};

use crate::raw_stream::RawStreamBuffer;

/// Seconds of slack before a time difference counts as a gap or overlap.
pub const GAP_TOLERANCE: f64 = 0.001;

/// How a record relates to the previous record of its channel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Continuity {
    /// First record with samples on this channel; nothing to compare with.
    First,
    /// Starts where the previous record ended.
    Contiguous,
    /// Starts this many seconds after the previous record ended.
    Gap(f64),
    /// Starts this many seconds before the previous record ended.
    Overlap(f64),
    /// Record has no samples and was not compared.
    Empty,
}

#[derive(Clone, Debug)]
pub struct ContinuityState {
    pub key: u32,
    /// Set once a record with at least one sample has been seen.
    pub significant: bool,
    pub last_end_time: f64,
    /// Rebasing value of the last record: the `x0` the next compressed
    /// packet should start with.
    pub previous_last_sample: Option<i32>,
    pub raw_buffer: Option<RawStreamBuffer>,
    pub gaps: u64,
    pub overlaps: u64,
    pub x0_mismatches: u64,
}

impl ContinuityState {
    fn new(key: u32, reorder_capacity: Option<usize>) -> Self {
        Self {
            key,
            significant: false,
            last_end_time: 0.0,
            previous_last_sample: None,
            raw_buffer: reorder_capacity.map(RawStreamBuffer::new),
            gaps: 0,
            overlaps: 0,
            x0_mismatches: 0,
        }
    }
}

/// Continuity state for every channel of a subscription, kept in the order
/// of the subscribed directory.
#[derive(Clone, Debug)]
pub struct ContinuityTracker {
    channels: Vec<ContinuityState>,
    tolerance: f64,
    reorder_capacity: Option<usize>,
}

impl ContinuityTracker {
    pub fn new(directory: &ChannelDirectory, reorder_capacity: Option<usize>) -> Self {
        Self {
            channels: directory
                .iter()
                .map(|c| ContinuityState::new(c.key, reorder_capacity))
                .collect(),
            tolerance: GAP_TOLERANCE,
            reorder_capacity,
        }
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Re-align to a new directory after a reconnect. Channels still present
    /// keep their state.
    pub fn rebuild(&mut self, directory: &ChannelDirectory) {
        let mut old = std::mem::take(&mut self.channels);
        self.channels = directory
            .iter()
            .map(|c| match old.iter().position(|s| s.key == c.key) {
                Some(i) => old.swap_remove(i),
                None => ContinuityState::new(c.key, self.reorder_capacity),
            })
            .collect();
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn state(&self, key: u32) -> Option<&ContinuityState> {
        self.channels.iter().find(|s| s.key == key)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ContinuityState> {
        self.channels.iter()
    }

    /// Pass a record through its channel's raw reorder buffer, if any.
    pub fn reorder(&mut self, record: DataRecord) -> Vec<DataRecord> {
        match self
            .channels
            .iter_mut()
            .find(|s| s.key == record.key)
            .and_then(|s| s.raw_buffer.as_mut())
        {
            Some(buffer) => buffer.push(record),
            None => vec![record],
        }
    }

    /// Drain every reorder buffer, channel by channel.
    pub fn flush_raw(&mut self) -> Vec<DataRecord> {
        self.channels
            .iter_mut()
            .filter_map(|s| s.raw_buffer.as_mut())
            .flat_map(RawStreamBuffer::flush)
            .collect()
    }

    /// Compare `record` with the previous record of its channel and advance
    /// the channel's state.
    pub fn observe(&mut self, record: &DataRecord) -> Continuity {
        let tolerance = self.tolerance;
        let state = self.state_mut(record.key);

        if record.samples.is_empty() {
            return Continuity::Empty;
        }

        let continuity = if !state.significant {
            state.significant = true;
            Continuity::First
        } else {
            let diff = record.time - state.last_end_time;
            if diff > tolerance {
                state.gaps += 1;
                Continuity::Gap(diff)
            } else if diff < -tolerance {
                state.overlaps += 1;
                Continuity::Overlap(-diff)
            } else {
                Continuity::Contiguous
            }
        };

        if continuity == Continuity::Contiguous
            && let (Some(x0), Some(previous)) = (record.x0, state.previous_last_sample)
            && x0 != previous
        {
            state.x0_mismatches += 1;
        }

        state.last_end_time = record.end_time();
        state.previous_last_sample = record.last_value.or(record.samples.last().copied());
        continuity
    }

    /// Whether `record` would fail the `x0` rebasing check against its
    /// channel's previous record.
    pub fn x0_mismatch(&self, record: &DataRecord) -> bool {
        match (record.x0, self.state(record.key).and_then(|s| s.previous_last_sample)) {
            (Some(x0), Some(previous)) => x0 != previous,
            _ => false,
        }
    }

    fn state_mut(&mut self, key: u32) -> &mut ContinuityState {
        let index = match self.channels.iter().position(|s| s.key == key) {
            Some(i) => i,
            None => {
                self.channels
                    .push(ContinuityState::new(key, self.reorder_capacity));
                self.channels.len() - 1
            }
        };
        &mut self.channels[index]
    }
}
