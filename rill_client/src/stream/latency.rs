//! Timing requests and the playback time and latency derived from them.

use rill_proto::{
    decode_exact,
    message::{Command, ErrorCode, LatencyReply},
};

use super::{Direction, StreamFlags, StreamInner, check_presence};
use crate::{
    Context, Error, Result, Stream,
    context::Core,
    dispatch::ReplyKind,
    event::StreamEvent,
    operation::{Completion, Operation},
    transport::{Clock, Transport},
};

impl<T: Transport, C: Clock> Context<T, C> {
    /// Requests a fresh timing snapshot from the server.
    ///
    /// The operation succeeds if the snapshot it produced is valid.
    /// Fails with [`Error::Exhausted`] when too many playback timing
    /// requests are in flight.
    pub fn update_timing_info(&mut self, stream: &Stream) -> Result<Operation> {
        self.run(stream, |core, s| {
            s.send_timing_request(core, true)?.ok_or(Error::BadState)
        })
    }

    /// Current playback (or capture) position of the stream, in microseconds.
    ///
    /// Interpolated between snapshots when the stream was connected with
    /// [`StreamFlags::INTERPOLATE_TIMING`]. Never goes backwards unless
    /// connected with [`StreamFlags::NOT_MONOTONIC`].
    pub fn get_time(&mut self, stream: &Stream) -> Result<u64> {
        let now = self.core.now();
        let s = self.streams.get_mut(&stream.key()).ok_or(Error::BadState)?;
        s.time_at(now)
    }

    /// Latency between writing and hearing (playback), or between capture
    /// and reading (record).
    ///
    /// Returns the latency and whether it is negative. Only record streams
    /// report negative latencies; playback ones are clamped to zero.
    pub fn get_latency(&mut self, stream: &Stream) -> Result<(u64, bool)> {
        let now = self.core.now();
        let s = self.streams.get_mut(&stream.key()).ok_or(Error::BadState)?;

        s.require_ready_stream()?;
        if !s.timing.valid {
            return Err(Error::NoData);
        }

        let info = &s.timing.info;
        let (index, corrupt) = match s.direction {
            Direction::Playback => (info.write_index, info.write_index_corrupt),
            _ => (info.read_index, info.read_index_corrupt),
        };
        if corrupt {
            return Err(Error::NoData);
        }

        let t = s.time_at(now)?;
        let c = s.sample_spec.bytes_to_usec(index.max(0) as u64);

        Ok(match s.direction {
            Direction::Playback => (c.saturating_sub(t), false),
            _ if t >= c => (t - c, false),
            _ => (c - t, true),
        })
    }
}

impl StreamInner {
    /// Sends a latency request. Playback requests open a correction slot.
    pub(crate) fn send_timing_request(
        &mut self,
        core: &mut Core<impl Transport, impl Clock>,
        with_op: bool,
    ) -> Result<Option<Operation>> {
        self.require_ready_stream()?;
        let channel = self.bound_channel()?;
        let now = core.clock.wall_usec();

        let (command, slot) = match self.direction {
            Direction::Playback => {
                let slot = self.timing.corrections.next_free().ok_or(Error::Exhausted)?;
                (Command::GetPlaybackLatency { channel, now }, Some(slot))
            }
            _ => (Command::GetRecordLatency { channel, now }, None),
        };

        let (tag, op) = core.request(self.key, ReplyKind::Timing, &command, with_op)?;

        if let Some(slot) = slot {
            self.timing.corrections.open(slot, tag);
        }

        Ok(op)
    }

    pub(crate) fn on_timing_reply(
        &mut self,
        core: &mut Core<impl Transport, impl Clock>,
        tag: u32,
        result: Result<&[u8], ErrorCode>,
        op: Option<&Operation>,
    ) -> Result<()> {
        let reply = match result {
            Ok(payload) => Some(decode_exact::<LatencyReply>(payload)?),
            Err(_) => None,
        };

        self.timing.valid = false;
        self.timing.info.write_index_corrupt = false;
        self.timing.info.read_index_corrupt = false;

        match reply {
            Some(reply) => self.apply_timing(core, tag, reply)?,
            // a refused or timed out request frees its slot all the same
            None if self.direction == Direction::Playback => {
                self.timing.corrections.release_through(tag)
            }
            None => {}
        }

        self.timing.auto_update_requested = false;
        self.events.push(StreamEvent::LatencyUpdate);

        if let Some(op) = op {
            op.complete(match result {
                Err(code) => Completion::failed(code),
                Ok(_) => Completion::success(self.timing.valid),
            });
        }

        Ok(())
    }

    fn apply_timing(
        &mut self,
        core: &mut Core<impl Transport, impl Clock>,
        tag: u32,
        reply: LatencyReply,
    ) -> Result<()> {
        let playback = self.direction == Direction::Playback;

        check_presence(
            core.version.has_proplist() && playback,
            &reply.underrun,
            "underrun information",
        )?;

        let info = &mut self.timing.info;
        self.timing.valid = true;

        info.sink_usec = reply.sink_usec;
        info.source_usec = reply.source_usec;
        info.playing = reply.playing;
        info.write_index = reply.write_index;
        info.read_index = reply.read_index;
        info.since_underrun = reply.underrun.map_or(0, |u| {
            if reply.playing { u.playing_for } else { u.underrun_for }
        });

        let now = core.clock.wall_usec();
        let (local, remote) = (reply.local, reply.remote);

        if local <= remote && remote <= now {
            info.transport_usec = if playback { remote - local } else { now - remote };
            info.synchronized_clocks = true;
            info.timestamp = remote;
        } else {
            info.transport_usec = now.saturating_sub(local) / 2;
            info.synchronized_clocks = false;
            info.timestamp = local.saturating_add(info.transport_usec);
        }

        if tag < self.timing.read_index_not_before {
            info.read_index_corrupt = true;
        }
        if tag < self.timing.write_index_not_before {
            info.write_index_corrupt = true;
        }

        if playback {
            self.timing.corrections.fold(tag, info);
        } else if let Some(record) = &self.record {
            if !info.read_index_corrupt {
                info.read_index = info.read_index.saturating_sub(record.queue.len() as i64);
            }
        }

        if playback {
            self.timing.corrections.release_through(tag);
        }

        self.feed_smoother(core);

        Ok(())
    }

    fn feed_smoother(&mut self, core: &Core<impl Transport, impl Clock>) {
        if self.smoother.is_none() {
            return;
        }

        let info = self.timing.info;
        let u = core.now().saturating_sub(info.transport_usec);
        let mut x = u;

        if self.direction == Direction::Playback && core.version.has_proplist() {
            let su = self.sample_spec.bytes_to_usec(info.since_underrun);
            if su < info.sink_usec {
                x = x.saturating_add(info.sink_usec - su);
            }
        }

        let trustworthy = match self.direction {
            Direction::Playback => !info.read_index_corrupt,
            _ => !info.write_index_corrupt,
        };
        let y = trustworthy.then(|| self.calc_time(true));

        let Some(smoother) = self.smoother.as_mut() else {
            return;
        };

        if !info.playing {
            smoother.pause(x);
        }

        if let Some(y) = y {
            smoother.put(u, y);
        }

        if info.playing {
            smoother.resume(x);
        }
    }

    /// Stream time according to the latest snapshot alone.
    pub(crate) fn calc_time(&self, ignore_transport: bool) -> u64 {
        let info = &self.timing.info;
        let running = !self.corked && !self.suspended;

        let (index, source_usec) = match self.direction {
            Direction::Playback => (info.read_index, 0),
            _ => (info.write_index, info.source_usec),
        };

        let mut usec = self.sample_spec.bytes_to_usec(index.max(0) as u64);

        if running {
            if !ignore_transport {
                usec = usec.saturating_add(info.transport_usec);
            }
            usec = usec
                .saturating_add(source_usec)
                .saturating_sub(info.sink_usec);
        }

        usec
    }

    fn time_at(&mut self, now: u64) -> Result<u64> {
        self.require_ready_stream()?;
        if !self.timing.valid {
            return Err(Error::NoData);
        }

        let info = &self.timing.info;
        let corrupt = match self.direction {
            Direction::Playback => info.read_index_corrupt,
            _ => info.write_index_corrupt,
        };
        if corrupt {
            return Err(Error::NoData);
        }

        let usec = match self.smoother.as_mut() {
            Some(smoother) => smoother.get(now),
            None => self.calc_time(false),
        };

        if self.flags.contains(StreamFlags::NOT_MONOTONIC) {
            return Ok(usec);
        }

        if usec < self.timing.previous_time {
            Ok(self.timing.previous_time)
        } else {
            self.timing.previous_time = usec;
            Ok(usec)
        }
    }
}
