//! The seams between the stream state machine and the outside world.

use std::{io, time};

use rill_proto::message::{ClientMessage, Command, SeekMode};
use rill_utils::MemChunk;

/// Delivers requests and audio to the server.
///
/// Implementations only move bytes: tags are allocated, and replies are
/// matched, by the [`Context`](crate::Context).
pub trait Transport {
    /// Sends `command` under `tag`.
    fn send_command(&mut self, tag: u32, command: &Command) -> io::Result<()>;

    /// Sends a block of playback data for `channel`.
    fn send_memblock(
        &mut self,
        channel: u32,
        offset: i64,
        seek: SeekMode,
        chunk: &MemChunk,
    ) -> io::Result<()>;

    /// Whether audio is passed through shared memory.
    ///
    /// If so, caller-owned buffers always get copied into pool blocks.
    #[inline(always)]
    fn uses_shm(&self) -> bool {
        false
    }
}

/// Writes every message as a `postcard` frame, prefixed with its length
/// as a little endian `u32`.
#[derive(Debug)]
pub struct FramedTransport<W> {
    writer: W,
}

impl<W: io::Write> FramedTransport<W> {
    #[inline(always)]
    pub const fn new(writer: W) -> Self {
        Self { writer }
    }

    #[inline(always)]
    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    #[inline(always)]
    pub fn into_inner(self) -> W {
        self.writer
    }

    fn send_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        let len = u32::try_from(frame.len()).map_err(|_| io::ErrorKind::InvalidInput)?;

        self.writer.write_all(&len.to_le_bytes())?;
        self.writer.write_all(frame)
    }
}

impl<W: io::Write> Transport for FramedTransport<W> {
    fn send_command(&mut self, tag: u32, command: &Command) -> io::Result<()> {
        let frame = rill_proto::encode_command(tag, command).map_err(postcard_to_io_err)?;
        self.send_frame(&frame)
    }

    fn send_memblock(
        &mut self,
        channel: u32,
        offset: i64,
        seek: SeekMode,
        chunk: &MemChunk,
    ) -> io::Result<()> {
        let frame = rill_proto::encode(&ClientMessage::Memblock {
            channel,
            offset,
            seek,
            bytes: chunk.as_slice(),
        })
        .map_err(postcard_to_io_err)?;

        self.send_frame(&frame)
    }
}

pub(crate) fn postcard_to_io_err(e: postcard::Error) -> io::Error {
    match e {
        postcard::Error::DeserializeUnexpectedEnd => io::ErrorKind::UnexpectedEof.into(),
        postcard::Error::SerializeBufferFull => io::ErrorKind::OutOfMemory.into(),
        _ => io::ErrorKind::InvalidData.into(),
    }
}

/// Time sources, in microseconds.
pub trait Clock {
    /// Monotonic time, used for smoothing and deadlines.
    fn monotonic_usec(&self) -> u64;

    /// Wall clock time, exchanged with the server in latency requests.
    fn wall_usec(&self) -> u64;
}

#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: time::Instant,
}

impl Default for SystemClock {
    #[inline(always)]
    fn default() -> Self {
        Self {
            origin: time::Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    #[inline]
    fn monotonic_usec(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_micros()).unwrap_or(u64::MAX)
    }

    #[inline]
    fn wall_usec(&self) -> u64 {
        time::SystemTime::now()
            .duration_since(time::UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_length_prefixed() {
        let mut t = FramedTransport::new(Vec::new());
        t.send_command(5, &Command::DrainPlaybackStream { channel: 1 })
            .unwrap();

        let bytes = t.into_inner();
        let len = u32::from_le_bytes(bytes[..4].try_into().unwrap()) as usize;
        assert_eq!(len, bytes.len() - 4);

        let msg: ClientMessage = rill_proto::decode_exact(&bytes[4..]).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Command {
                tag: 5,
                command: Command::DrainPlaybackStream { channel: 1 },
            }
        );
    }
}
