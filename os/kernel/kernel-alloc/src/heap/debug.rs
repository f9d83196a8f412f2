//! Heap dumps for the debug console.

use super::Heap;
use core::fmt::{self, Write};
use log::info;

/// Heap bytes represented by one starchart character.
const BYTES_PER_CHAR: u64 = 64;

impl Heap {
    /// Logs every segment with its payload share, the average header overhead
    /// of used segments and the [`starchart`](Self::starchart).
    pub fn log_segments(&self) {
        info!("heap: {} bytes, {}..{}", self.size(), self.start, self.end);

        let mut used = 0u64;
        let mut used_permille = 0u64;
        for (i, segment) in self.segments().enumerate() {
            let permille = segment.length * 1000 / segment.total_size();
            info!(
                "  #{i}: {} {} ({}) bytes, {}.{}% payload, header {}, payload {}",
                state(segment.free),
                segment.length,
                segment.total_size(),
                permille / 10,
                permille % 10,
                segment.header,
                segment.payload()
            );
            if !segment.free {
                used += 1;
                used_permille += permille;
            }
        }

        if used > 0 {
            let overhead = 1000 - used_permille / used;
            info!(
                "heap: headers take {}.{}% of used segments",
                overhead / 10,
                overhead % 10
            );
        }
        info!("heap: {}", self.starchart());
    }

    /// Like [`log_segments`](Self::log_segments), with runs of neighbouring
    /// segments in the same state folded into one line.
    pub fn log_segments_summed(&self) {
        info!("heap: {} bytes, {}..{}", self.size(), self.start, self.end);

        let mut segments = self.segments().peekable();
        let mut run = 0;
        while let Some(first) = segments.next() {
            let mut count = 1;
            let mut payload = first.length;
            let mut total = first.total_size();
            while let Some(segment) = segments.next_if(|s| s.free == first.free) {
                count += 1;
                payload += segment.length;
                total += segment.total_size();
            }
            info!(
                "  #{run}: {count} {} segment(s) from {}, {payload} ({total}) bytes",
                state(first.free),
                first.header
            );
            run += 1;
        }
    }

    /// One character per 64 heap bytes: `_` free, `*` used.
    #[must_use]
    pub const fn starchart(&self) -> Starchart<'_> {
        Starchart { heap: self }
    }
}

const fn state(free: bool) -> &'static str {
    if free { "free" } else { "used" }
}

/// See [`Heap::starchart`].
pub struct Starchart<'h> {
    heap: &'h Heap,
}

impl fmt::Display for Starchart<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let limit = self.heap.size() / BYTES_PER_CHAR + 1;
        let mut written = 0;
        let mut free_rest = 0;
        let mut used_rest = 0;

        for segment in self.heap.segments() {
            let size = segment.total_size();
            let rest = if segment.free { &mut free_rest } else { &mut used_rest };

            // Remainders of each state add up until they are worth a character.
            let mut chars = size / BYTES_PER_CHAR;
            *rest += size % BYTES_PER_CHAR;
            if *rest > BYTES_PER_CHAR {
                *rest -= BYTES_PER_CHAR;
                chars += 1;
            }

            let c = if segment.free { '_' } else { '*' };
            for _ in 0..chars.min(limit - written) {
                f.write_char(c)?;
            }
            written += chars.min(limit - written);
            if written == limit {
                break;
            }
        }
        Ok(())
    }
}
