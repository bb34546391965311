//! A byte queue made of shared [`MemChunk`]s, indexed by absolute stream position.
//!
//! The queue tracks two positions: the read index (next byte handed to the
//! consumer) and the write index (where the next pushed chunk lands). The
//! write index can be moved with [`BlockQueue::seek`]; moving it past the end
//! of the queued data leaves a gap that is filled with silence on the next
//! push, moving it backwards discards the queued data after it.

use std::collections::VecDeque;

use rill_proto::message::SeekMode;

use crate::memblock::MemChunk;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// A push would grow the queue beyond its maximum length.
    Full,
    /// A seek or push would move an index out of the `i64` range.
    BadSeek,
}

impl core::fmt::Display for QueueError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Self::Full => "block queue full",
            Self::BadSeek => "seek out of range",
        })
    }
}

impl std::error::Error for QueueError {}

#[derive(Debug, Clone)]
pub struct BlockQueue {
    chunks: VecDeque<MemChunk>,
    maxlength: usize,
    read_index: i64,
    write_index: i64,
    // sum of all chunk lengths
    length: usize,
}

impl BlockQueue {
    pub fn new(maxlength: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            maxlength,
            read_index: 0,
            write_index: 0,
            length: 0,
        }
    }

    #[inline(always)]
    pub const fn maxlength(&self) -> usize {
        self.maxlength
    }

    /// Number of queued bytes, ready to be read.
    #[inline(always)]
    pub const fn len(&self) -> usize {
        self.length
    }

    #[inline(always)]
    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }

    #[inline(always)]
    pub const fn read_index(&self) -> i64 {
        self.read_index
    }

    #[inline(always)]
    pub const fn write_index(&self) -> i64 {
        self.write_index
    }

    // never overflows: the queued length is bounded by `maxlength`
    #[inline(always)]
    const fn end_index(&self) -> i64 {
        self.read_index + self.length as i64
    }

    /// Moves the write index.
    ///
    /// [`SeekMode::RelativeEnd`] is relative to the end of the queued data.
    /// The write index is left untouched if the target does not fit in an `i64`.
    pub fn seek(&mut self, offset: i64, mode: SeekMode) -> Result<(), QueueError> {
        let base = match mode {
            SeekMode::Relative => self.write_index,
            SeekMode::Absolute => 0,
            SeekMode::RelativeOnRead => self.read_index,
            SeekMode::RelativeEnd => self.end_index(),
        };

        self.write_index = base.checked_add(offset).ok_or(QueueError::BadSeek)?;
        Ok(())
    }

    /// Appends `chunk` at the write index and advances it.
    ///
    /// Bytes that would land before the read index are skipped.
    pub fn push(&mut self, mut chunk: MemChunk) -> Result<(), QueueError> {
        let len = i64::try_from(chunk.len()).map_err(|_| QueueError::BadSeek)?;
        let write_end = self
            .write_index
            .checked_add(len)
            .ok_or(QueueError::BadSeek)?;

        let start = self.write_index.max(self.read_index);
        let skipped = start
            .checked_sub(self.write_index)
            .and_then(|d| usize::try_from(d).ok())
            .unwrap_or(usize::MAX);
        let keep = chunk.len().saturating_sub(skipped);

        // `start` is at most `write_end` whenever something is kept
        let new_end = start.saturating_add(keep as i64);
        let new_length = new_end.max(self.end_index()) - self.read_index;

        if usize::try_from(new_length).map_or(true, |n| n > self.maxlength) {
            return Err(QueueError::Full);
        }

        self.write_index = write_end;

        if keep == 0 {
            return Ok(());
        }
        chunk.advance(skipped);

        let end = self.end_index();
        if start < end {
            self.truncate_to(start);
        } else if start > end {
            let gap = (start - end) as usize;
            log::trace!("filling {gap} byte gap with silence");
            self.push_back(MemChunk::silence(gap));
        }

        self.push_back(chunk);

        Ok(())
    }

    #[inline]
    fn push_back(&mut self, chunk: MemChunk) {
        self.length += chunk.len();
        self.chunks.push_back(chunk);
    }

    // drops all queued data at or beyond the absolute position `index`
    fn truncate_to(&mut self, index: i64) {
        let mut keep = (index - self.read_index).max(0) as usize;

        let mut n = 0;
        for chunk in self.chunks.iter_mut() {
            if keep == 0 {
                break;
            }
            if chunk.len() > keep {
                chunk.truncate(keep);
            }
            keep -= chunk.len();
            n += 1;
        }

        log::trace!("overwriting queued data from index {index}");

        self.chunks.truncate(n);
        self.length = self.chunks.iter().map(MemChunk::len).sum();
    }

    /// The oldest queued chunk, if any.
    #[inline(always)]
    pub fn peek(&self) -> Option<&MemChunk> {
        self.chunks.front()
    }

    /// Discards `len` bytes from the front and moves the read index past them.
    ///
    /// The read index also advances over bytes that are not queued.
    pub fn drop_front(&mut self, len: usize) {
        let mut left = len;

        while left > 0 {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };

            if front.len() > left {
                front.advance(left);
                self.length -= left;
                left = 0;
            } else {
                left -= front.len();
                self.length -= front.len();
                self.chunks.pop_front();
            }
        }

        let len = i64::try_from(len).unwrap_or(i64::MAX);
        self.read_index = self.read_index.saturating_add(len);
        self.write_index = self.write_index.max(self.read_index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(bytes: &[u8]) -> MemChunk {
        MemChunk::from_vec(bytes.to_vec())
    }

    #[test]
    fn drop_front_splits_chunks() {
        let mut q = BlockQueue::new(64);
        q.push(chunk(&[1, 2, 3])).unwrap();
        q.push(chunk(&[4, 5])).unwrap();

        q.drop_front(2);

        assert_eq!(q.len(), 3);
        assert_eq!(q.read_index(), 2);
        assert_eq!(q.peek().unwrap().as_slice(), &[3]);
    }

    #[test]
    fn backwards_seek_overwrites() {
        let mut q = BlockQueue::new(64);
        q.push(chunk(&[1, 2, 3, 4])).unwrap();
        q.seek(-2, SeekMode::Relative).unwrap();
        q.push(chunk(&[9])).unwrap();

        assert_eq!(q.len(), 3);
        assert_eq!(q.write_index(), 3);

        let bytes: Vec<u8> = q.chunks.iter().flat_map(|c| c.as_slice().to_vec()).collect();
        assert_eq!(bytes, [1, 2, 9]);
    }

    #[test]
    fn out_of_range_positions_are_rejected() {
        let mut q = BlockQueue::new(64);
        q.push(chunk(&[1, 2])).unwrap();

        assert_eq!(q.seek(i64::MAX, SeekMode::Relative), Err(QueueError::BadSeek));
        assert_eq!(q.write_index(), 2);

        // a legal position, but nothing fits past it
        q.seek(i64::MAX, SeekMode::Absolute).unwrap();
        assert_eq!(q.push(chunk(&[3, 4, 5])), Err(QueueError::BadSeek));

        q.seek(i64::MAX - 3, SeekMode::Absolute).unwrap();
        assert_eq!(q.push(chunk(&[3, 4, 5])), Err(QueueError::Full));

        assert_eq!(q.len(), 2);
        assert_eq!(q.peek().unwrap().as_slice(), &[1, 2]);
    }

    #[test]
    fn data_before_the_read_index_is_skipped() {
        let mut q = BlockQueue::new(64);
        q.seek(i64::MIN, SeekMode::Absolute).unwrap();
        q.push(chunk(&[1, 2, 3])).unwrap();

        assert!(q.is_empty());
    }
}
