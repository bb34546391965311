//! Timing snapshots and write index bookkeeping.
//!
//! A latency reply describes the server's queue as it was when the request
//! was processed. Playback data written after the request left is not
//! accounted for in the reply's write index, so each playback timing request
//! opens a [`Correction`] slot that accumulates the effect of every later
//! write, and the reply's write index is patched with all slots opened at or
//! after its own request.

use rill_proto::message::SeekMode;

/// Number of timing requests a playback stream may have in flight.
pub const MAX_WRITE_INDEX_CORRECTIONS: usize = 32;

/// Latest reconciled view of a stream's position on the server.
///
/// Indices are byte positions in the stream, times are microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimingInfo {
    /// Wall clock time the snapshot refers to.
    pub timestamp: u64,
    /// Whether the local and remote clocks seemed to agree.
    pub synchronized_clocks: bool,
    /// Latency of the sink's own buffer.
    pub sink_usec: u64,
    /// Latency of the source's own buffer.
    pub source_usec: u64,
    /// Estimated one-way transport delay.
    pub transport_usec: u64,
    pub playing: bool,
    pub write_index_corrupt: bool,
    pub write_index: i64,
    pub read_index_corrupt: bool,
    pub read_index: i64,
    pub configured_sink_usec: u64,
    pub configured_source_usec: u64,
    /// Bytes played since the last underrun, or bytes missed since it
    /// started when not playing.
    pub since_underrun: u64,
}

// index just past a write of `length` bytes at `offset`
#[inline(always)]
fn write_end(offset: i64, length: usize) -> i64 {
    offset.saturating_add(i64::try_from(length).unwrap_or(i64::MAX))
}

impl TimingInfo {
    /// Applies a local write to the snapshot's write index.
    pub(crate) fn apply_write(&mut self, offset: i64, length: usize, seek: SeekMode) {
        match seek {
            SeekMode::Absolute => {
                self.write_index_corrupt = false;
                self.write_index = write_end(offset, length);
            }
            SeekMode::Relative => {
                if !self.write_index_corrupt {
                    self.write_index = self.write_index.saturating_add(write_end(offset, length));
                }
            }
            SeekMode::RelativeOnRead | SeekMode::RelativeEnd => self.write_index_corrupt = true,
        }
    }
}

/// Effect of the writes issued after one timing request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Correction {
    pub valid: bool,
    pub tag: u32,
    pub corrupt: bool,
    pub absolute: bool,
    pub value: i64,
}

/// Circular log of [`Correction`]s, one per in-flight playback timing request.
#[derive(Debug, Clone)]
pub(crate) struct CorrectionRing {
    slots: [Correction; MAX_WRITE_INDEX_CORRECTIONS],
    current: usize,
}

impl Default for CorrectionRing {
    fn default() -> Self {
        Self {
            slots: [Correction::default(); MAX_WRITE_INDEX_CORRECTIONS],
            current: 0,
        }
    }
}

impl CorrectionRing {
    /// The slot the next request would use, if it is free.
    #[inline]
    pub(crate) fn next_free(&self) -> Option<usize> {
        let next = (self.current + 1) % MAX_WRITE_INDEX_CORRECTIONS;
        (!self.slots[next].valid).then_some(next)
    }

    /// Opens slot `index` for the request sent under `tag`; later writes
    /// accumulate there.
    #[inline]
    pub(crate) fn open(&mut self, index: usize, tag: u32) {
        self.current = index;
        self.slots[index] = Correction {
            valid: true,
            tag,
            corrupt: false,
            absolute: false,
            value: 0,
        };
    }

    pub(crate) fn record_write(&mut self, offset: i64, length: usize, seek: SeekMode) {
        let slot = &mut self.slots[self.current];
        if !slot.valid {
            return;
        }

        match seek {
            SeekMode::Absolute => {
                slot.corrupt = false;
                slot.absolute = true;
                slot.value = write_end(offset, length);
            }
            SeekMode::Relative => {
                if !slot.corrupt {
                    slot.value = slot.value.saturating_add(write_end(offset, length));
                }
            }
            SeekMode::RelativeOnRead | SeekMode::RelativeEnd => slot.corrupt = true,
        }
    }

    /// Marks the writes since the last request as unknowable.
    #[inline]
    pub(crate) fn corrupt_current(&mut self) {
        let slot = &mut self.slots[self.current];
        if slot.valid {
            slot.corrupt = true;
        }
    }

    /// Patches `info.write_index` with every slot opened at or after `tag`,
    /// oldest first.
    pub(crate) fn fold(&self, tag: u32, info: &mut TimingInfo) {
        let mut ctag = tag;

        for n in 0..MAX_WRITE_INDEX_CORRECTIONS {
            let slot = &self.slots[(self.current + 1 + n) % MAX_WRITE_INDEX_CORRECTIONS];

            if !slot.valid || slot.tag < ctag {
                continue;
            }

            ctag = slot.tag.saturating_add(1);

            if slot.corrupt {
                info.write_index = 0;
                info.write_index_corrupt = true;
            } else if slot.absolute {
                info.write_index = slot.value;
                info.write_index_corrupt = false;
            } else if !info.write_index_corrupt {
                info.write_index = info.write_index.saturating_add(slot.value);
            }
        }
    }

    /// Frees every slot opened at or before `tag`.
    pub(crate) fn release_through(&mut self, tag: u32) {
        for slot in &mut self.slots {
            if slot.valid && slot.tag <= tag {
                slot.valid = false;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.slots.iter().filter(|s| s.valid).count()
    }
}
