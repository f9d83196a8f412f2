//! A flat bit array over a borrowed byte buffer.

/// Bit `i` lives in byte `i / 8` at mask `0x80 >> (i % 8)` (most significant bit first).
pub struct Bitmap<'a> {
    buffer: &'a mut [u8],
}

impl<'a> Bitmap<'a> {
    /// Views `buffer` as a bitmap, clearing every bit.
    pub fn new(buffer: &'a mut [u8]) -> Self {
        buffer.fill(0);
        Self { buffer }
    }

    /// Re-points the bitmap at `buffer` and clears it.
    pub fn init(&mut self, buffer: &'a mut [u8]) {
        buffer.fill(0);
        self.buffer = buffer;
    }

    /// Size of the backing buffer in bytes.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.buffer.len()
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Number of addressable bits.
    #[inline]
    #[must_use]
    pub const fn bit_count(&self) -> u64 {
        self.buffer.len() as u64 * 8
    }

    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *const u8 {
        self.buffer.as_ptr()
    }

    #[inline]
    fn locate(&self, index: u64) -> Option<(usize, u8)> {
        let byte = usize::try_from(index / 8).ok()?;
        (byte < self.buffer.len()).then_some((byte, 0x80 >> (index % 8)))
    }

    /// Out-of-range bits read as `false`.
    #[inline]
    #[must_use]
    pub fn get(&self, index: u64) -> bool {
        self.locate(index)
            .is_some_and(|(byte, mask)| self.buffer[byte] & mask != 0)
    }

    /// Returns `false` and leaves the bitmap untouched if `index` is out of range.
    #[inline]
    pub fn set(&mut self, index: u64, value: bool) -> bool {
        let Some((byte, mask)) = self.locate(index) else {
            return false;
        };
        if value {
            self.buffer[byte] |= mask;
        } else {
            self.buffer[byte] &= !mask;
        }
        true
    }
}

impl core::fmt::Debug for Bitmap<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Bitmap")
            .field("base", &self.as_ptr())
            .field("len", &self.len())
            .finish()
    }
}
