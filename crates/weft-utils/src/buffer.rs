/// Default arena size. Bounds the largest single message a caller can
/// serialise; oversized writes are refused, not grown into.
pub const DEFAULT_CAPACITY: usize = 1024 * 1024;

/// Byte-order swap for a 16-bit value.
#[inline(always)]
pub const fn swab16(x: u16) -> u16 {
    x.swap_bytes()
}

/// Byte-order swap for a 32-bit value.
#[inline(always)]
pub const fn swab32(x: u32) -> u32 {
    x.swap_bytes()
}

/// Reads a big-endian u16 out of a raw pair of bytes.
#[inline(always)]
pub const fn swab16_slice(buf: &[u8; 2]) -> u16 {
    u16::from_be_bytes(*buf)
}

/// Reads a big-endian u32 out of four raw bytes (the frame header parse).
#[inline(always)]
pub const fn swab32_slice(buf: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*buf)
}

/// Fixed-capacity byte arena with independent read and write cursors.
///
/// Both cursors only ever advance; `reuse` is the single way back to the
/// start. Typed writes refuse (returning `false`) instead of reallocating,
/// so a partially serialised message can be detected by inspecting
/// `available()` and abandoned without a grown buffer hiding the overflow.
///
/// Invariant: `0 <= rd <= wr <= capacity`.
pub struct ByteBuf {
    buf: Box<[u8]>,
    rd: usize,
    wr: usize,
}

impl Default for ByteBuf {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

macro_rules! rw_primitive {
    ($write_fn:ident, $read_fn:ident, $ty:ty) => {
        #[inline]
        pub fn $write_fn(&mut self, v: $ty) -> bool {
            self.write_raw(&v.to_ne_bytes())
        }

        #[inline]
        pub fn $read_fn(&mut self) -> Option<$ty> {
            let mut raw = [0u8; size_of::<$ty>()];
            self.read_raw(&mut raw)?;
            Some(<$ty>::from_ne_bytes(raw))
        }
    };
}

impl ByteBuf {
    /// A zero or otherwise degenerate capacity falls back to
    /// [`DEFAULT_CAPACITY`].
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 { DEFAULT_CAPACITY } else { capacity };
        Self { buf: vec![0u8; capacity].into_boxed_slice(), rd: 0, wr: 0 }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes written but not yet read.
    #[inline]
    pub fn available(&self) -> usize {
        self.wr - self.rd
    }

    /// Bytes of capacity left for writing.
    #[inline]
    pub fn space(&self) -> usize {
        self.buf.len() - self.wr
    }

    /// The written prefix of the arena.
    #[inline]
    pub fn content(&self) -> &[u8] {
        &self.buf[..self.wr]
    }

    /// Zeroes the arena and returns both cursors to the start. No
    /// reallocation.
    pub fn reuse(&mut self) {
        self.buf.fill(0);
        self.rd = 0;
        self.wr = 0;
    }

    /// Replaces the content wholesale: `src` is copied to the start, the
    /// write cursor lands at `src.len()`, the read cursor at 0. Fails if
    /// `src` exceeds capacity.
    pub fn set_content(&mut self, src: &[u8]) -> bool {
        if src.len() > self.buf.len() {
            return false;
        }
        self.buf[..src.len()].copy_from_slice(src);
        self.wr = src.len();
        self.rd = 0;
        true
    }

    #[inline]
    fn write_raw(&mut self, src: &[u8]) -> bool {
        if self.space() < src.len() {
            return false;
        }
        self.buf[self.wr..self.wr + src.len()].copy_from_slice(src);
        self.wr += src.len();
        true
    }

    #[inline]
    fn read_raw(&mut self, dst: &mut [u8]) -> Option<()> {
        if self.available() < dst.len() {
            return None;
        }
        dst.copy_from_slice(&self.buf[self.rd..self.rd + dst.len()]);
        self.rd += dst.len();
        Some(())
    }

    #[inline]
    pub fn write_bool(&mut self, v: bool) -> bool {
        self.write_raw(&[u8::from(v)])
    }

    #[inline]
    pub fn read_bool(&mut self) -> Option<bool> {
        let mut raw = [0u8; 1];
        self.read_raw(&mut raw)?;
        Some(raw[0] != 0)
    }

    rw_primitive!(write_u8, read_u8, u8);
    rw_primitive!(write_i16, read_i16, i16);
    rw_primitive!(write_u16, read_u16, u16);
    rw_primitive!(write_i32, read_i32, i32);
    rw_primitive!(write_u32, read_u32, u32);
    rw_primitive!(write_i64, read_i64, i64);
    rw_primitive!(write_u64, read_u64, u64);
    rw_primitive!(write_f32, read_f32, f32);
    rw_primitive!(write_f64, read_f64, f64);

    /// Appends raw bytes without a length prefix.
    #[inline]
    pub fn write_bytes(&mut self, src: &[u8]) -> bool {
        self.write_raw(src)
    }

    /// Consumes `len` raw bytes.
    #[inline]
    pub fn read_bytes(&mut self, len: usize) -> Option<&[u8]> {
        if self.available() < len {
            return None;
        }
        let out = &self.buf[self.rd..self.rd + len];
        self.rd += len;
        Some(out)
    }

    /// Strings go on the wire as a 4-byte length followed by the bytes.
    /// There is no NUL-terminated variant.
    pub fn write_str(&mut self, s: &str) -> bool {
        if self.space() < size_of::<u32>() + s.len() {
            return false;
        }
        self.write_u32(s.len() as u32) && self.write_raw(s.as_bytes())
    }

    pub fn read_str(&mut self) -> Option<String> {
        let mark = self.rd;
        let len = self.read_u32()? as usize;
        match self.read_bytes(len) {
            Some(raw) => match std::str::from_utf8(raw) {
                Ok(s) => Some(s.to_owned()),
                Err(_) => {
                    self.rd = mark;
                    None
                }
            },
            None => {
                // Length header without a full body: rewind so the caller
                // sees an unconsumed buffer.
                self.rd = mark;
                None
            }
        }
    }
}

impl std::fmt::Debug for ByteBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ByteBuf {{ capacity: {}, rd: {}, wr: {} }}", self.buf.len(), self.rd, self.wr)
    }
}
