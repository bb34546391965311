//! Control commands answered with an [`Operation`].

use rill_proto::{
    decode_exact,
    format::RATE_MAX,
    message::*,
};

use super::{Direction, StreamFlags, StreamInner};
use crate::{
    Context, Error, Result, Stream,
    dispatch::ReplyKind,
    operation::{Completion, Operation},
    transport::{Clock, Transport},
};

impl<T: Transport, C: Clock> Context<T, C> {
    /// Pauses (`cork = true`) or resumes the stream.
    pub fn cork(&mut self, stream: &Stream, cork: bool) -> Result<Operation> {
        self.run(stream, |core, s| {
            s.require_ready_stream()?;
            let channel = s.bound_channel()?;

            let command = match s.direction {
                Direction::Playback => Command::CorkPlaybackStream { channel, cork },
                _ => Command::CorkRecordStream { channel, cork },
            };

            let op = core.request_op(s.key, ReplyKind::Ack, &command)?;
            s.corked = cork;

            let x = s.smoother_time(core.now(), true);
            if s.corked || s.suspended {
                if let Some(smoother) = s.smoother.as_mut() {
                    smoother.pause(x);
                }
            }

            if s.direction == Direction::Playback {
                s.invalidate_indexes(core, true, false)?;
            }

            Ok(op)
        })
    }

    /// Drops all data queued on the server.
    pub fn flush(&mut self, stream: &Stream) -> Result<Operation> {
        self.run(stream, |core, s| {
            s.require_ready_stream()?;
            let channel = s.bound_channel()?;

            let command = match s.direction {
                Direction::Playback => Command::FlushPlaybackStream { channel },
                _ => Command::FlushRecordStream { channel },
            };

            let op = core.request_op(s.key, ReplyKind::Ack, &command)?;

            if s.direction != Direction::Playback {
                s.invalidate_indexes(core, false, true)?;
                return Ok(op);
            }

            s.timing.corrections.corrupt_current();
            if s.timing.valid {
                s.timing.info.write_index_corrupt = true;
            }

            let prebuffering = s.buffer_attr.prebuf > 0;
            if prebuffering {
                s.invalidate_indexes(core, true, false)?;
            } else {
                s.request_auto_timing_update(core, true)?;
            }

            if prebuffering {
                let x = s.smoother_time(core.now(), true);
                if let Some(smoother) = s.smoother.as_mut() {
                    smoother.pause(x);
                }
            }

            Ok(op)
        })
    }

    /// Restarts prebuffering, so playback stops until the buffer refills.
    pub fn prebuf(&mut self, stream: &Stream) -> Result<Operation> {
        self.prebuffer_command(stream, |channel| Command::PrebufPlaybackStream { channel })
    }

    /// Starts playback right away, even if the prebuffer is not full yet.
    pub fn trigger(&mut self, stream: &Stream) -> Result<Operation> {
        self.prebuffer_command(stream, |channel| Command::TriggerPlaybackStream { channel })
    }

    fn prebuffer_command(
        &mut self,
        stream: &Stream,
        command: impl FnOnce(u32) -> Command,
    ) -> Result<Operation> {
        self.run(stream, |core, s| {
            s.require_ready()?;
            if s.direction != Direction::Playback || s.buffer_attr.prebuf == 0 {
                return Err(Error::BadState);
            }

            let op = core.request_op(s.key, ReplyKind::Ack, &command(s.bound_channel()?))?;
            s.invalidate_indexes(core, true, false)?;

            Ok(op)
        })
    }

    /// Completes once everything written so far has been played.
    pub fn drain(&mut self, stream: &Stream) -> Result<Operation> {
        self.run(stream, |core, s| {
            s.require_ready()?;
            if s.direction != Direction::Playback {
                return Err(Error::BadState);
            }

            let channel = s.bound_channel()?;
            core.request_op(s.key, ReplyKind::Ack, &Command::DrainPlaybackStream { channel })
        })
    }

    pub fn set_name(&mut self, stream: &Stream, name: &str) -> Result<Operation> {
        if self.core.version.has_proplist() {
            let mut props = Proplist::new();
            props.set(PROP_APPLICATION_NAME, name);
            return self.proplist_update(stream, UpdateMode::Replace, &props);
        }

        self.run(stream, |core, s| {
            s.require_ready_stream()?;
            let channel = s.bound_channel()?;
            let name = name.to_owned();

            let command = match s.direction {
                Direction::Record => Command::SetRecordStreamName { channel, name },
                _ => Command::SetPlaybackStreamName { channel, name },
            };

            core.request_op(s.key, ReplyKind::Ack, &command)
        })
    }

    /// Asks the server for new buffer metrics.
    ///
    /// The metrics the server settled on are applied to the stream and
    /// reported in the operation's [`Completion`].
    pub fn set_buffer_attr(&mut self, stream: &Stream, attr: &BufferAttr) -> Result<Operation> {
        self.run(stream, |core, s| {
            s.require_ready_stream()?;
            if !core.version.has_device_info() {
                return Err(Error::NotSupported);
            }

            let channel = s.bound_channel()?;
            let adjust_latency = core
                .version
                .has_proplist()
                .then(|| s.flags.contains(StreamFlags::ADJUST_LATENCY));

            let command = match s.direction {
                Direction::Playback => Command::SetPlaybackStreamBufferAttr(SetPlaybackBufferAttr {
                    channel,
                    maxlength: attr.maxlength,
                    tlength: attr.tlength,
                    prebuf: attr.prebuf,
                    minreq: attr.minreq,
                    adjust_latency,
                }),
                _ => Command::SetRecordStreamBufferAttr(SetRecordBufferAttr {
                    channel,
                    maxlength: attr.maxlength,
                    fragsize: attr.fragsize,
                    adjust_latency,
                }),
            };

            core.request_op(s.key, ReplyKind::BufferAttr, &command)
        })
    }

    /// Changes the stream's sample rate. Needs [`StreamFlags::VARIABLE_RATE`].
    pub fn update_sample_rate(&mut self, stream: &Stream, rate: u32) -> Result<Operation> {
        self.run(stream, |core, s| {
            if rate == 0 || rate > RATE_MAX {
                return Err(Error::Invalid);
            }
            s.require_ready_stream()?;
            if !s.flags.contains(StreamFlags::VARIABLE_RATE) {
                return Err(Error::BadState);
            }
            if !core.version.has_device_info() {
                return Err(Error::NotSupported);
            }

            let channel = s.bound_channel()?;
            let command = match s.direction {
                Direction::Record => Command::UpdateRecordStreamSampleRate { channel, rate },
                _ => Command::UpdatePlaybackStreamSampleRate { channel, rate },
            };

            core.request_op(s.key, ReplyKind::SampleRate(rate), &command)
        })
    }

    /// Updates the server side property list of the stream.
    ///
    /// The local [`proplist`](Self::proplist) keeps the properties the
    /// stream was created with.
    pub fn proplist_update(
        &mut self,
        stream: &Stream,
        mode: UpdateMode,
        proplist: &Proplist,
    ) -> Result<Operation> {
        self.run(stream, |core, s| {
            s.require_ready_stream()?;
            if !core.version.has_proplist() {
                return Err(Error::NotSupported);
            }

            let channel = s.bound_channel()?;
            let proplist = proplist.clone();

            let command = match s.direction {
                Direction::Record => Command::UpdateRecordStreamProplist {
                    channel,
                    mode,
                    proplist,
                },
                _ => Command::UpdatePlaybackStreamProplist {
                    channel,
                    mode,
                    proplist,
                },
            };

            core.request_op(s.key, ReplyKind::Ack, &command)
        })
    }

    pub fn proplist_remove(&mut self, stream: &Stream, keys: &[&str]) -> Result<Operation> {
        self.run(stream, |core, s| {
            if keys.is_empty() {
                return Err(Error::Invalid);
            }
            s.require_ready_stream()?;
            if !core.version.has_proplist() {
                return Err(Error::NotSupported);
            }

            let channel = s.bound_channel()?;
            let keys = keys.iter().map(|&k| k.to_owned()).collect();

            let command = match s.direction {
                Direction::Record => Command::RemoveRecordStreamProplist { channel, keys },
                _ => Command::RemovePlaybackStreamProplist { channel, keys },
            };

            core.request_op(s.key, ReplyKind::Ack, &command)
        })
    }
}

impl StreamInner {
    pub(crate) fn on_ack_reply(
        &mut self,
        result: Result<&[u8], ErrorCode>,
        op: Option<&Operation>,
    ) -> Result<()> {
        let completion = match result {
            Ok([]) => Completion::success(true),
            Ok(_) => return Err(Error::Protocol("trailing data in acknowledgement")),
            Err(code) => Completion::failed(code),
        };

        if let Some(op) = op {
            op.complete(completion);
        }

        Ok(())
    }

    pub(crate) fn on_buffer_attr_reply(
        &mut self,
        result: Result<&[u8], ErrorCode>,
        op: Option<&Operation>,
    ) -> Result<()> {
        let completion = match result {
            Err(code) => Completion::failed(code),
            Ok(payload) => {
                match self.direction {
                    Direction::Playback => self.merge_playback_attr(decode_exact(payload)?),
                    Direction::Record => self.merge_record_attr(decode_exact(payload)?),
                    _ => return Err(Error::Protocol("buffer attributes for an upload stream")),
                }

                Completion {
                    buffer_attr: Some(self.buffer_attr),
                    ..Completion::success(true)
                }
            }
        };

        if let Some(op) = op {
            op.complete(completion);
        }

        Ok(())
    }

    pub(crate) fn on_sample_rate_reply(
        &mut self,
        result: Result<&[u8], ErrorCode>,
        rate: u32,
        op: Option<&Operation>,
    ) -> Result<()> {
        let completion = match result {
            Ok([]) => {
                self.sample_spec.rate = rate;
                Completion::success(true)
            }
            Ok(_) => return Err(Error::Protocol("trailing data in sample rate reply")),
            Err(code) => Completion::failed(code),
        };

        if let Some(op) = op {
            op.complete(completion);
        }

        Ok(())
    }
}
