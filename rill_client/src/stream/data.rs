//! Moving audio: playback writes, record reads, and flow control credit.

use rill_proto::message::SeekMode;
use rill_utils::MemChunk;

use super::{Direction, StreamInner, StreamState};
use crate::{
    Context, Error, Result, Stream,
    context::Core,
    transport::{Clock, Transport},
};

impl<T: Transport, C: Clock> Context<T, C> {
    /// Sends `data` to a playback or upload stream, copying it into pool
    /// blocks.
    ///
    /// `offset` and `seek` position the data in the server's queue. Upload
    /// streams only accept plain appends.
    pub fn write(&mut self, stream: &Stream, data: &[u8], offset: i64, seek: SeekMode) -> Result<()> {
        self.run(stream, |core, s| {
            s.check_writable(offset, seek)?;
            if data.is_empty() {
                return Ok(());
            }

            s.send_copied(core, data, offset, seek)?;
            s.account_write(core, data.len(), offset, seek)
        })
    }

    /// Like [`write`](Self::write), but hands `data` over to the transport
    /// as one block, without copying, unless the transport uses shared
    /// memory.
    pub fn write_owned(
        &mut self,
        stream: &Stream,
        data: Vec<u8>,
        offset: i64,
        seek: SeekMode,
    ) -> Result<()> {
        self.run(stream, |core, s| {
            s.check_writable(offset, seek)?;
            if data.is_empty() {
                return Ok(());
            }

            let length = data.len();

            if core.transport.uses_shm() {
                s.send_copied(core, &data, offset, seek)?;
            } else {
                let channel = s.bound_channel()?;
                core.transport
                    .send_memblock(channel, offset, seek, &MemChunk::from_vec(data))?;
            }

            s.account_write(core, length, offset, seek)
        })
    }

    /// The block at the front of a record stream's queue.
    ///
    /// Returns an empty slice when nothing has been received. The same block
    /// is returned until it is released with [`discard`](Self::discard).
    pub fn peek(&mut self, stream: &Stream) -> Result<&[u8]> {
        let s = self.streams.get_mut(&stream.key()).ok_or(Error::BadState)?;
        s.require_ready()?;
        if s.direction != Direction::Record {
            return Err(Error::BadState);
        }

        let record = s.record.as_mut().ok_or(Error::BadState)?;

        if record.peeked.is_none() {
            record.peeked = record.queue.peek().cloned();
        }

        Ok(match &record.peeked {
            Some(chunk) => chunk.as_slice(),
            None => &[],
        })
    }

    /// Releases the block returned by [`peek`](Self::peek).
    pub fn discard(&mut self, stream: &Stream) -> Result<()> {
        let s = self.streams.get_mut(&stream.key()).ok_or(Error::BadState)?;
        s.require_ready()?;
        if s.direction != Direction::Record {
            return Err(Error::BadState);
        }

        let record = s.record.as_mut().ok_or(Error::BadState)?;
        let chunk = record.peeked.take().ok_or(Error::BadState)?;

        record.queue.drop_front(chunk.len());

        let info = &mut s.timing.info;
        if s.timing.valid && !info.read_index_corrupt {
            info.read_index = info.read_index.saturating_add(chunk.len() as i64);
        }

        Ok(())
    }

    /// Bytes the server asked for and has not received yet.
    pub fn writable_size(&self, stream: &Stream) -> Result<usize> {
        let s = self.streams.get(&stream.key()).ok_or(Error::BadState)?;
        s.require_ready()?;
        if s.direction == Direction::Record {
            return Err(Error::BadState);
        }

        Ok(s.requested_bytes)
    }

    /// Bytes of record data queued locally.
    pub fn readable_size(&self, stream: &Stream) -> Result<usize> {
        let s = self.streams.get(&stream.key()).ok_or(Error::BadState)?;
        s.require_ready()?;

        s.record
            .as_ref()
            .filter(|_| s.direction == Direction::Record)
            .map(|r| r.queue.len())
            .ok_or(Error::BadState)
    }
}

impl StreamInner {
    fn check_writable(&self, offset: i64, seek: SeekMode) -> Result<()> {
        if self.state != StreamState::Ready {
            return Err(Error::BadState);
        }

        match self.direction {
            Direction::Playback => Ok(()),
            Direction::Upload if seek == SeekMode::Relative && offset == 0 => Ok(()),
            Direction::Upload => Err(Error::Invalid),
            _ => Err(Error::BadState),
        }
    }

    /// Sends `data` in pool sized blocks. Only the first one is positioned
    /// by `offset` and `seek`; the rest follow it.
    fn send_copied(
        &self,
        core: &mut Core<impl Transport, impl Clock>,
        data: &[u8],
        offset: i64,
        seek: SeekMode,
    ) -> Result<()> {
        let channel = self.bound_channel()?;
        let block_size = core.pool.block_size_max().get();

        let (mut offset, mut seek) = (offset, seek);

        for part in data.chunks(block_size) {
            let chunk = core.pool.copy_from(part);
            core.transport.send_memblock(channel, offset, seek, &chunk)?;

            offset = 0;
            seek = SeekMode::Relative;
        }

        Ok(())
    }

    /// Charges a write of `length` bytes against the credit and the
    /// playback timing bookkeeping.
    fn account_write(
        &mut self,
        core: &mut Core<impl Transport, impl Clock>,
        length: usize,
        offset: i64,
        seek: SeekMode,
    ) -> Result<()> {
        self.requested_bytes = self.requested_bytes.saturating_sub(length);

        if self.direction != Direction::Playback {
            return Ok(());
        }

        self.timing.corrections.record_write(offset, length, seek);

        if self.timing.valid {
            self.timing.info.apply_write(offset, length, seek);
        }

        if !self.timing.valid || self.timing.info.write_index_corrupt {
            self.request_auto_timing_update(core, true)?;
        }

        Ok(())
    }
}
