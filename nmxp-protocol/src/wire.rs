//! Big-endian field access shared by every decode site.
//!
//! All NMXP integers and floats travel in network byte order. Decoders read
//! through [`Reader`] and encoders append through [`Writer`], so no call site
//! swaps bytes by hand.

/// Cursor over a borrowed byte slice.
///
/// Every read returns `None` when fewer bytes remain than the field needs;
/// callers map that to their own "too short" error.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Borrow the next `n` bytes and advance.
    pub fn bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    pub fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.bytes(N)?.try_into().ok()
    }

    /// Unconsumed tail.
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    pub fn u8(&mut self) -> Option<u8> {
        self.array::<1>().map(|b| b[0])
    }

    pub fn u16(&mut self) -> Option<u16> {
        self.array().map(u16::from_be_bytes)
    }

    pub fn u32(&mut self) -> Option<u32> {
        self.array().map(u32::from_be_bytes)
    }

    pub fn i32(&mut self) -> Option<i32> {
        self.array().map(i32::from_be_bytes)
    }

    pub fn f64(&mut self) -> Option<f64> {
        self.array().map(f64::from_be_bytes)
    }

    /// Signed 24-bit integer, sign-extended to 32 bits.
    pub fn i24(&mut self) -> Option<i32> {
        let b: [u8; 3] = self.array()?;
        Some(sign_extend_24(
            (u32::from(b[0]) << 16) | (u32::from(b[1]) << 8) | u32::from(b[2]),
        ))
    }

    /// Fixed-width, NUL-padded text field.
    pub fn fixed_str(&mut self, width: usize) -> Option<String> {
        let raw = self.bytes(width)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Some(String::from_utf8_lossy(&raw[..end]).into_owned())
    }
}

/// Sign-extend the low 24 bits of `raw`.
pub fn sign_extend_24(raw: u32) -> i32 {
    let raw = raw & 0x00FF_FFFF;
    if raw & (1 << 23) != 0 {
        raw as i32 - (1 << 24)
    } else {
        raw as i32
    }
}

/// Append-only big-endian encoder.
#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn i32(&mut self, v: i32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(v);
        self
    }

    /// Write `s` into a zeroed field of `width` bytes, truncating if needed.
    pub fn fixed_str(&mut self, s: &str, width: usize) -> &mut Self {
        let start = self.buf.len();
        self.buf.resize(start + width, 0);
        let n = s.len().min(width);
        self.buf[start..start + n].copy_from_slice(&s.as_bytes()[..n]);
        self
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}
