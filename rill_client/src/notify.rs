//! Handlers for messages the server sends on its own.
//!
//! Notifications for channels no stream is bound to, or for streams that
//! are not ready, are dropped.

use rill_proto::message::{BufferAttr, ErrorCode, INVALID_INDEX, MovedBufferAttr, SeekMode, StreamMoved};
use rill_utils::MemChunk;

use crate::{
    Context, Error, Result,
    event::StreamEvent,
    stream::{Direction, StreamInner, StreamState},
    transport::{Clock, Transport},
};

impl<T: Transport, C: Clock> Context<T, C> {
    /// The ready stream bound to `channel` in `direction`'s table.
    fn ready_stream(&mut self, direction: Direction, channel: u32) -> Option<&mut StreamInner> {
        let Some(key) = self.core.lookup(direction, channel) else {
            log::debug!("notification for unbound {direction:?} channel {channel}");
            return None;
        };

        self.streams
            .get_mut(&key)
            .filter(|s| s.state == StreamState::Ready)
    }

    pub(crate) fn on_killed(&mut self, direction: Direction, channel: u32) {
        let Some(key) = self.core.lookup(direction, channel) else {
            return;
        };
        let Some(s) = self.streams.get_mut(&key) else {
            return;
        };
        if s.state != StreamState::Ready {
            return;
        }

        log::warn!("stream {key:?} killed by the server");

        self.core.error = Some(ErrorCode::Killed);
        s.set_state(&mut self.core, StreamState::Failed);
    }

    pub(crate) fn on_moved(&mut self, direction: Direction, moved: StreamMoved) -> Result<()> {
        let version = self.core.version;
        if !version.has_device_info() {
            return Err(Error::Protocol("stream moved before protocol 12"));
        }

        let attr = match (direction, moved.buffer_attr) {
            (_, None) if !version.has_proplist() => None,
            (Direction::Playback, Some(MovedBufferAttr::Playback { attr, configured_usec }))
                if version.has_proplist() =>
            {
                let attr = BufferAttr {
                    maxlength: attr.maxlength,
                    tlength: attr.tlength,
                    prebuf: attr.prebuf,
                    minreq: attr.minreq,
                    fragsize: 0,
                };
                Some((attr, configured_usec))
            }
            (Direction::Record, Some(MovedBufferAttr::Record { attr, configured_usec }))
                if version.has_proplist() =>
            {
                let attr = BufferAttr {
                    maxlength: attr.maxlength,
                    fragsize: attr.fragsize,
                    ..BufferAttr::default()
                };
                Some((attr, configured_usec))
            }
            _ => return Err(Error::Protocol("unexpected buffer attributes in move")),
        };

        let name = match moved.device_name {
            Some(name) if !name.is_empty() && moved.device_index != INVALID_INDEX => name,
            _ => return Err(Error::Protocol("stream moved to an invalid device")),
        };

        let core = &mut self.core;
        let Some(s) = core
            .lookup(direction, moved.channel)
            .and_then(|key| self.streams.get_mut(&key))
            .filter(|s| s.state == StreamState::Ready)
        else {
            return Ok(());
        };

        if let Some((attr, configured_usec)) = attr {
            match direction {
                Direction::Record => s.timing.info.configured_source_usec = configured_usec,
                _ => s.timing.info.configured_sink_usec = configured_usec,
            }
            s.buffer_attr = attr;
        }

        log::debug!("stream {:?} moved to {name}", s.key);

        s.device_name = Some(name);
        s.device_index = moved.device_index;
        s.suspended = moved.suspended;

        s.request_auto_timing_update(core, true)?;
        s.events.push(StreamEvent::Moved);

        Ok(())
    }

    pub(crate) fn on_suspended(
        &mut self,
        direction: Direction,
        channel: u32,
        suspended: bool,
    ) -> Result<()> {
        if !self.core.version.has_device_info() {
            return Err(Error::Protocol("suspend notification before protocol 12"));
        }

        let now = self.core.now();
        let core = &mut self.core;
        let Some(s) = core
            .lookup(direction, channel)
            .and_then(|key| self.streams.get_mut(&key))
            .filter(|s| s.state == StreamState::Ready)
        else {
            return Ok(());
        };

        s.suspended = suspended;

        let x = s.smoother_time(now, false);
        let halted = s.suspended || s.corked;
        if let Some(smoother) = s.smoother.as_mut() {
            if halted {
                smoother.pause(x);
            } else {
                smoother.resume(x);
            }
        }

        s.request_auto_timing_update(core, true)?;
        s.events.push(StreamEvent::Suspended);

        Ok(())
    }

    pub(crate) fn on_started(&mut self, channel: u32) -> Result<()> {
        if !self.core.version.has_proplist() {
            return Err(Error::Protocol("start notification before protocol 13"));
        }

        let core = &mut self.core;
        let Some(s) = core
            .lookup(Direction::Playback, channel)
            .and_then(|key| self.streams.get_mut(&key))
            .filter(|s| s.state == StreamState::Ready)
        else {
            return Ok(());
        };

        s.request_auto_timing_update(core, true)?;
        s.events.push(StreamEvent::Started);

        Ok(())
    }

    /// Adds `bytes` to the flow control credit of a playback or upload stream.
    pub(crate) fn on_request(&mut self, channel: u32, bytes: u32) {
        let Some(s) = self.ready_stream(Direction::Playback, channel) else {
            return;
        };

        s.requested_bytes = s.requested_bytes.saturating_add(bytes as usize);

        if s.requested_bytes > 0 {
            s.events.push(StreamEvent::Write(s.requested_bytes));
        }
    }

    pub(crate) fn on_xrun(&mut self, channel: u32, overflow: bool) -> Result<()> {
        let now = self.core.now();
        let core = &mut self.core;
        let Some(s) = core
            .lookup(Direction::Playback, channel)
            .and_then(|key| self.streams.get_mut(&key))
            .filter(|s| s.state == StreamState::Ready)
        else {
            return Ok(());
        };

        if s.direction == Direction::Playback && s.buffer_attr.prebuf > 0 {
            let x = s.smoother_time(now, false);
            if let Some(smoother) = s.smoother.as_mut() {
                smoother.pause(x);
            }
        }

        s.request_auto_timing_update(core, true)?;
        s.events.push(if overflow {
            StreamEvent::Overflow
        } else {
            StreamEvent::Underflow
        });

        Ok(())
    }

    /// Queues record data received for `channel`.
    pub(crate) fn on_record_data(&mut self, channel: u32, offset: i64, seek: SeekMode, bytes: &[u8]) {
        let Some(s) = self.ready_stream(Direction::Record, channel) else {
            return;
        };
        let Some(record) = s.record.as_mut() else {
            return;
        };

        if bytes.is_empty() {
            return;
        }

        let queued = record
            .queue
            .seek(offset, seek)
            .and_then(|()| record.queue.push(MemChunk::from_vec(bytes.to_vec())));

        if let Err(e) = queued {
            log::warn!("stream {:?}: dropping {} bytes of record data: {e}", s.key, bytes.len());
            return;
        }

        let readable = record.queue.len();
        if readable > 0 {
            s.events.push(StreamEvent::Read(readable));
        }
    }
}
