use std::collections::BTreeMap;

use nmxp_rs_protocol::DataRecord;
use tracing::debug;

/// Reorders one channel's raw packets by server sequence number.
///
/// Records are released in sequence order. A record at or below the last
/// released sequence is a duplicate or arrived too late and is dropped. When
/// more than `capacity` records wait behind a missing sequence number, the
/// hole is abandoned and the lowest waiting record is released.
///
/// Sequence numbers are compared with wrapping arithmetic, so the stream
/// continues across `i32::MAX`.
#[derive(Clone, Debug)]
pub struct RawStreamBuffer {
    capacity: usize,
    /// Keyed by unwrapped position; congruent to the sequence number mod 2^32.
    pending: BTreeMap<i64, DataRecord>,
    last_released: Option<i32>,
    position: i64,
}

impl RawStreamBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            pending: BTreeMap::new(),
            last_released: None,
            position: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn last_released(&self) -> Option<i32> {
        self.last_released
    }

    /// Add a record and return whatever can now be released, in order.
    ///
    /// Records without a sequence number pass straight through.
    pub fn push(&mut self, record: DataRecord) -> Vec<DataRecord> {
        let Some(seq) = record.sequence_number else {
            return vec![record];
        };

        let pos = match self.last_released {
            Some(last) => {
                let ahead = seq.wrapping_sub(last);
                if ahead <= 0 {
                    debug!(seq, last, "dropping late or duplicate packet");
                    return Vec::new();
                }
                self.position + i64::from(ahead)
            }
            // nothing released yet, so nothing is pending either
            None => i64::from(seq),
        };
        if self.pending.contains_key(&pos) {
            debug!(seq, "dropping duplicate packet");
            return Vec::new();
        }
        self.pending.insert(pos, record);

        let mut out = Vec::new();
        loop {
            self.release_consecutive(&mut out);
            if self.pending.len() <= self.capacity {
                break;
            }
            if let Some((pos, record)) = self.pending.pop_first() {
                debug!(seq = pos as i32, expected = ?self.last_released.map(|s| s.wrapping_add(1)), "skipping missing packets");
                self.mark_released(pos);
                out.push(record);
            }
        }
        out
    }

    /// Release everything still waiting, in sequence order.
    pub fn flush(&mut self) -> Vec<DataRecord> {
        let pending = std::mem::take(&mut self.pending);
        if let Some((&last, _)) = pending.last_key_value() {
            self.mark_released(last);
        }
        pending.into_values().collect()
    }

    fn release_consecutive(&mut self, out: &mut Vec<DataRecord>) {
        while let Some(entry) = self.pending.first_entry() {
            let pos = *entry.key();
            // The first packet seen defines where the stream starts.
            if self.last_released.is_some() && pos != self.position + 1 {
                break;
            }
            out.push(entry.remove());
            self.mark_released(pos);
        }
    }

    fn mark_released(&mut self, pos: i64) {
        self.position = pos;
        self.last_released = Some(pos as i32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(seq: i32) -> DataRecord {
        DataRecord {
            key: 1,
            network: None,
            station: "STA".into(),
            channel: "HHZ".into(),
            packet_type: 1,
            x0: Some(0),
            last_value: Some(0),
            sequence_number: Some(seq),
            oldest_sequence: None,
            time: f64::from(seq),
            samples: vec![0; 4],
            sample_rate: 4,
            raw_length: 0,
        }
    }

    fn seqs(records: &[DataRecord]) -> Vec<i32> {
        records.iter().filter_map(|r| r.sequence_number).collect()
    }

    #[test]
    fn in_order_passes_through() {
        let mut buf = RawStreamBuffer::new(4);
        for s in 10..15 {
            assert_eq!(seqs(&buf.push(rec(s))), [s]);
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn swapped_pair_is_reordered() {
        let mut buf = RawStreamBuffer::new(4);
        assert_eq!(seqs(&buf.push(rec(1))), [1]);
        assert!(buf.push(rec(3)).is_empty());
        assert_eq!(seqs(&buf.push(rec(2))), [2, 3]);
        assert_eq!(buf.last_released(), Some(3));
    }

    #[test]
    fn duplicates_and_late_packets_dropped() {
        let mut buf = RawStreamBuffer::new(4);
        buf.push(rec(1));
        buf.push(rec(2));
        assert!(buf.push(rec(2)).is_empty());
        assert!(buf.push(rec(1)).is_empty());

        assert!(buf.push(rec(4)).is_empty());
        assert!(buf.push(rec(4)).is_empty());
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn hole_abandoned_when_full() {
        let mut buf = RawStreamBuffer::new(2);
        buf.push(rec(1));
        assert!(buf.push(rec(3)).is_empty());
        assert!(buf.push(rec(4)).is_empty());
        // third record behind the hole at 2
        assert_eq!(seqs(&buf.push(rec(5))), [3, 4, 5]);
        // 2 is now late
        assert!(buf.push(rec(2)).is_empty());
    }

    #[test]
    fn flush_releases_in_order() {
        let mut buf = RawStreamBuffer::new(8);
        buf.push(rec(1));
        buf.push(rec(7));
        buf.push(rec(5));
        assert_eq!(seqs(&buf.flush()), [5, 7]);
        assert!(buf.push(rec(6)).is_empty());
        assert_eq!(seqs(&buf.push(rec(8))), [8]);
    }

    #[test]
    fn sequence_wraps_past_i32_max() {
        let mut buf = RawStreamBuffer::new(4);
        assert_eq!(seqs(&buf.push(rec(i32::MAX - 1))), [i32::MAX - 1]);
        assert_eq!(seqs(&buf.push(rec(i32::MAX))), [i32::MAX]);
        assert_eq!(seqs(&buf.push(rec(i32::MIN))), [i32::MIN]);
        assert_eq!(buf.last_released(), Some(i32::MIN));
        // behind the wrap point: late
        assert!(buf.push(rec(i32::MAX)).is_empty());
    }

    #[test]
    fn reorders_across_wrap() {
        let mut buf = RawStreamBuffer::new(4);
        buf.push(rec(i32::MAX - 1));
        assert!(buf.push(rec(i32::MIN + 1)).is_empty());
        assert!(buf.push(rec(i32::MIN)).is_empty());
        assert_eq!(seqs(&buf.push(rec(i32::MAX))), [i32::MAX, i32::MIN, i32::MIN + 1]);
        assert!(buf.is_empty());
    }

    #[test]
    fn flush_across_wrap_keeps_order() {
        let mut buf = RawStreamBuffer::new(8);
        buf.push(rec(i32::MAX - 2));
        buf.push(rec(i32::MIN));
        buf.push(rec(i32::MAX));
        assert_eq!(seqs(&buf.flush()), [i32::MAX, i32::MIN]);
        assert_eq!(buf.last_released(), Some(i32::MIN));
        assert_eq!(seqs(&buf.push(rec(i32::MIN + 1))), [i32::MIN + 1]);
    }

    #[test]
    fn no_sequence_passes_through() {
        let mut buf = RawStreamBuffer::new(2);
        let mut r = rec(0);
        r.sequence_number = None;
        assert_eq!(buf.push(r).len(), 1);
        assert!(buf.is_empty());
    }
}
