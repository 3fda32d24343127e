//! Differential bundle decompression.
//!
//! A bundle is 17 bytes: one control byte and four 4-byte groups. Each
//! 2-bit selector of the control byte (most significant pair first) says how
//! its group is read:
//!
//! | selector | diffs | width |
//! |----------|-------|-------|
//! | 0        | 0     | -     |
//! | 1        | 4     | i8    |
//! | 2        | 2     | i16   |
//! | 3        | 1     | i32   |
//!
//! A control byte of exactly [`FILLER_CONTROL`] marks a filler bundle.

use crate::wire::Reader;

pub const BUNDLE_LEN: usize = 17;

/// Maximum samples one bundle can carry.
pub const MAX_BUNDLE_SAMPLES: usize = 16;

/// Control byte value of a filler bundle.
pub const FILLER_CONTROL: u8 = 9;

/// Decode one bundle, appending samples to `out`.
///
/// Each sample is `previous + diff`, and `previous` is updated after every
/// sample so diffs chain across groups and across bundles.
///
/// Returns the number of samples appended (0–16), or `None` for a filler
/// bundle, which appends nothing and leaves `previous` untouched.
pub fn unpack_bundle(bundle: &[u8; BUNDLE_LEN], previous: &mut i32, out: &mut Vec<i32>) -> Option<usize> {
    let control = bundle[0];
    if control == FILLER_CONTROL {
        return None;
    }

    let start = out.len();
    let mut groups = Reader::new(&bundle[1..]);
    for shift in [6u32, 4, 2, 0] {
        let Some(group) = groups.array::<4>() else {
            break;
        };
        let mut push = |diff: i32| {
            *previous = previous.wrapping_add(diff);
            out.push(*previous);
        };
        match (control >> shift) & 0b11 {
            1 => group.iter().for_each(|&b| push(i32::from(b as i8))),
            2 => {
                push(i32::from(i16::from_be_bytes([group[0], group[1]])));
                push(i32::from(i16::from_be_bytes([group[2], group[3]])));
            }
            3 => push(i32::from_be_bytes(group)),
            _ => {}
        }
    }
    Some(out.len() - start)
}

/// Decode consecutive bundles until the data ends or a filler bundle is hit.
///
/// Trailing bytes that do not form a whole bundle are ignored; callers that
/// care validate the length first. Returns the total samples appended.
pub fn unpack_bundles(data: &[u8], previous: &mut i32, out: &mut Vec<i32>) -> usize {
    let mut total = 0;
    for chunk in data.chunks_exact(BUNDLE_LEN) {
        let Ok(bundle) = <&[u8; BUNDLE_LEN]>::try_from(chunk) else {
            break;
        };
        match unpack_bundle(bundle, previous, out) {
            Some(n) => total += n,
            None => break,
        }
    }
    total
}
