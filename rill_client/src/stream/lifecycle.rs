//! Creating, connecting and tearing down streams.

use rill_proto::{
    decode_exact,
    format::{ChannelMap, ChannelVolumes, SampleSpec, USEC_PER_MSEC},
    message::*,
};
use rill_utils::{BlockQueue, Smoother};

use super::{
    Direction, RecordState, Stream, StreamFlags, StreamInner, StreamState, check_presence,
    new_handle,
};
use crate::{
    Context, Error, Result,
    context::{ContextState, Core},
    dispatch::ReplyKind,
    event::StreamEvent,
    transport::{Clock, Transport},
};

/// Target length of a new stream, before the application picks its own.
pub(crate) const DEFAULT_TLENGTH_USEC: u64 = 250 * USEC_PER_MSEC;

/// Queue limit servers before protocol 13 supported.
pub(crate) const LEGACY_MAXLENGTH: u32 = 4 * 1024 * 1024;

impl<T: Transport, C: Clock> Context<T, C> {
    /// Creates an unconnected stream.
    ///
    /// A name is required, either as `name` or as the `media.name` property.
    /// Without a channel map, the default layout for the spec's channel
    /// count is used.
    pub fn new_stream(
        &mut self,
        name: Option<&str>,
        sample_spec: &SampleSpec,
        channel_map: Option<&ChannelMap>,
        proplist: Option<&Proplist>,
    ) -> Result<Stream> {
        self.sweep();

        if self.core.state != ContextState::Ready {
            return Err(Error::BadState);
        }

        if !sample_spec.is_valid() {
            return Err(Error::Invalid);
        }

        if !self.core.version.has_device_info() && sample_spec.format.is_s32() {
            return Err(Error::NotSupported);
        }

        if let Some(map) = channel_map {
            if !map.is_valid() || map.channels() != usize::from(sample_spec.channels) {
                return Err(Error::Invalid);
            }
        }

        if name.is_none() && !proplist.is_some_and(|p| p.contains(PROP_MEDIA_NAME)) {
            return Err(Error::Invalid);
        }

        let channel_map = match channel_map {
            Some(map) => map.clone(),
            None => ChannelMap::auto(sample_spec.channels).ok_or(Error::Invalid)?,
        };

        let mut proplist = proplist.cloned().unwrap_or_default();
        if let Some(name) = name {
            proplist.set(PROP_MEDIA_NAME, name);
        }

        let key = self.core.next_key();
        let sync_id = self.core.next_sync_id();
        let (handle, weak) = new_handle();

        self.streams.insert(
            key,
            StreamInner::new(key, weak, *sample_spec, channel_map, proplist, sync_id),
        );

        log::debug!("stream {key:?}: created for {sample_spec}");

        Ok(Stream::from_parts(key, handle))
    }

    /// Makes a future record stream monitor sink input `sink_input`.
    pub fn set_monitor_stream(&mut self, stream: &Stream, sink_input: u32) -> Result<()> {
        let version = self.core.version;
        let s = self.streams.get_mut(&stream.key()).ok_or(Error::BadState)?;

        if sink_input == INVALID_INDEX {
            return Err(Error::Invalid);
        }
        if s.state != StreamState::Unconnected {
            return Err(Error::BadState);
        }
        if !version.has_proplist() {
            return Err(Error::NotSupported);
        }

        s.direct_on_input = Some(sink_input);
        Ok(())
    }

    pub fn monitor_stream(&self, stream: &Stream) -> Result<u32> {
        let s = self.streams.get(&stream.key()).ok_or(Error::BadState)?;
        let target = s.direct_on_input.ok_or(Error::BadState)?;

        if !self.core.version.has_proplist() {
            return Err(Error::NotSupported);
        }

        Ok(target)
    }

    /// Connects `stream` for playback.
    ///
    /// `device` falls back to the configured default sink. `sync_stream`
    /// puts both streams into the same sync group; it must be a playback
    /// stream of this context.
    pub fn connect_playback(
        &mut self,
        stream: &Stream,
        device: Option<&str>,
        attr: Option<&BufferAttr>,
        flags: StreamFlags,
        volume: Option<&ChannelVolumes>,
        sync_stream: Option<&Stream>,
    ) -> Result<()> {
        let sync = match sync_stream {
            Some(sync) => {
                let s = self.streams.get(&sync.key()).ok_or(Error::Invalid)?;
                Some((s.direction, s.sync_id))
            }
            None => None,
        };

        self.run(stream, |core, s| {
            s.create(core, Direction::Playback, device, attr, flags, volume, sync)
        })
    }

    /// Connects `stream` for recording.
    ///
    /// `device` falls back to the configured default source.
    pub fn connect_record(
        &mut self,
        stream: &Stream,
        device: Option<&str>,
        attr: Option<&BufferAttr>,
        flags: StreamFlags,
    ) -> Result<()> {
        self.run(stream, |core, s| {
            s.create(core, Direction::Record, device, attr, flags, None, None)
        })
    }

    /// Connects `stream` for uploading a `length` byte sample into the
    /// server's sample cache.
    pub fn connect_upload(&mut self, stream: &Stream, length: usize) -> Result<()> {
        self.run(stream, |core, s| s.create_upload(core, length))
    }

    /// Stores the uploaded sample, then terminates the upload stream.
    pub fn finish_upload(&mut self, stream: &Stream) -> Result<()> {
        self.run(stream, |core, s| {
            let channel = s.bound_channel()?;
            if core.state != ContextState::Ready || s.direction != Direction::Upload {
                return Err(Error::BadState);
            }

            core.request(
                s.key,
                ReplyKind::Delete,
                &Command::FinishUploadStream { channel },
                false,
            )?;
            Ok(())
        })
    }

    /// Asks the server to delete the stream.
    ///
    /// The stream terminates once the server confirms.
    pub fn disconnect(&mut self, stream: &Stream) -> Result<()> {
        self.run(stream, |core, s| {
            let channel = s.bound_channel()?;
            if core.state != ContextState::Ready {
                return Err(Error::BadState);
            }

            let command = match s.direction {
                Direction::Playback => Command::DeletePlaybackStream { channel },
                Direction::Record => Command::DeleteRecordStream { channel },
                Direction::Upload => Command::DeleteUploadStream { channel },
                Direction::None => return Err(Error::BadState),
            };

            core.request(s.key, ReplyKind::Delete, &command, false)?;
            Ok(())
        })
    }
}

impl StreamInner {
    #[allow(clippy::too_many_arguments)]
    fn create(
        &mut self,
        core: &mut Core<impl Transport, impl Clock>,
        direction: Direction,
        device: Option<&str>,
        attr: Option<&BufferAttr>,
        flags: StreamFlags,
        volume: Option<&ChannelVolumes>,
        sync: Option<(Direction, u32)>,
    ) -> Result<()> {
        let version = core.version;

        if core.state != ContextState::Ready || self.state != StreamState::Unconnected {
            return Err(Error::BadState);
        }
        if self.direct_on_input.is_some() && direction != Direction::Record {
            return Err(Error::BadState);
        }
        if !flags.is_known() {
            return Err(Error::Invalid);
        }
        if flags.contains(StreamFlags::VARIABLE_RATE) && !version.has_device_info() {
            return Err(Error::NotSupported);
        }
        if flags.contains(StreamFlags::PEAK_DETECT) && !version.has_proplist() {
            return Err(Error::NotSupported);
        }
        if flags.contains(StreamFlags::START_MUTED) && direction != Direction::Playback {
            return Err(Error::Invalid);
        }
        if flags.contains(StreamFlags::PEAK_DETECT) && direction != Direction::Record {
            return Err(Error::Invalid);
        }
        if volume.is_some_and(|v| v.channels() != usize::from(self.sample_spec.channels)) {
            return Err(Error::Invalid);
        }
        if let Some((sync_direction, _)) = sync {
            if direction != Direction::Playback || sync_direction != Direction::Playback {
                return Err(Error::Invalid);
            }
        }

        self.direction = direction;
        self.flags = flags;
        self.corked = flags.contains(StreamFlags::START_CORKED);

        if let Some((_, sync_id)) = sync {
            self.sync_id = sync_id;
        }

        if let Some(attr) = attr {
            self.buffer_attr = *attr;
        }
        if !version.has_proplist() {
            automatic_buffer_attr(&mut self.buffer_attr, &self.sample_spec);
        }

        if flags.contains(StreamFlags::INTERPOLATE_TIMING) {
            let monotonic = !flags.contains(StreamFlags::NOT_MONOTONIC);
            let mut smoother = Smoother::new(core.config.smoother(monotonic));

            let now = core.now();
            smoother.set_time_offset(now);
            smoother.pause(now);

            self.smoother = Some(smoother);
        }

        let device = device.map(str::to_owned).or_else(|| match direction {
            Direction::Playback => core.config.default_sink.clone(),
            _ => core.config.default_source.clone(),
        });

        let command = self.create_command(core.version, device, volume);

        core.request(self.key, ReplyKind::Create, &command, false)?;
        self.set_state(core, StreamState::Creating);

        Ok(())
    }

    fn create_command(
        &self,
        version: rill_proto::ProtocolVersion,
        device: Option<String>,
        volume: Option<&ChannelVolumes>,
    ) -> Command {
        let attr = &self.buffer_attr;
        let flags = self.flags;

        let name = (!version.has_proplist())
            .then(|| self.proplist.get(PROP_MEDIA_NAME).map(str::to_owned))
            .flatten();

        let create_flags = version.has_device_info().then(|| CreateFlags {
            no_remap_channels: flags.contains(StreamFlags::NO_REMAP_CHANNELS),
            no_remix_channels: flags.contains(StreamFlags::NO_REMIX_CHANNELS),
            fix_format: flags.contains(StreamFlags::FIX_FORMAT),
            fix_rate: flags.contains(StreamFlags::FIX_RATE),
            fix_channels: flags.contains(StreamFlags::FIX_CHANNELS),
            dont_move: flags.contains(StreamFlags::DONT_MOVE),
            variable_rate: flags.contains(StreamFlags::VARIABLE_RATE),
        });

        let extension = |direction_switch| {
            version.has_proplist().then(|| CreateExtension {
                direction_switch,
                adjust_latency: flags.contains(StreamFlags::ADJUST_LATENCY),
                proplist: self.proplist.clone(),
            })
        };

        if self.direction == Direction::Playback {
            Command::CreatePlaybackStream(CreatePlaybackStream {
                name,
                sample_spec: self.sample_spec,
                channel_map: self.channel_map.clone(),
                sink_index: INVALID_INDEX,
                sink_name: device,
                maxlength: attr.maxlength,
                corked: self.corked,
                tlength: attr.tlength,
                prebuf: attr.prebuf,
                minreq: attr.minreq,
                sync_id: self.sync_id,
                volume: volume
                    .cloned()
                    .unwrap_or_else(|| ChannelVolumes::reset(self.sample_spec.channels)),
                flags: create_flags,
                extension: extension(flags.contains(StreamFlags::START_MUTED)),
            })
        } else {
            Command::CreateRecordStream(CreateRecordStream {
                name,
                sample_spec: self.sample_spec,
                channel_map: self.channel_map.clone(),
                source_index: INVALID_INDEX,
                source_name: device,
                maxlength: attr.maxlength,
                corked: self.corked,
                fragsize: attr.fragsize,
                flags: create_flags,
                extension: extension(flags.contains(StreamFlags::PEAK_DETECT)),
                direct_on_input: version
                    .has_proplist()
                    .then(|| self.direct_on_input.unwrap_or(INVALID_INDEX)),
            })
        }
    }

    fn create_upload(&mut self, core: &mut Core<impl Transport, impl Clock>, length: usize) -> Result<()> {
        if core.state != ContextState::Ready || self.state != StreamState::Unconnected {
            return Err(Error::BadState);
        }
        let length = u32::try_from(length).map_err(|_| Error::Invalid)?;
        if length == 0 {
            return Err(Error::Invalid);
        }

        let version = core.version;
        self.direction = Direction::Upload;
        self.flags = StreamFlags::NONE;

        let command = Command::CreateUploadStream(CreateUploadStream {
            name: (!version.has_proplist())
                .then(|| self.proplist.get(PROP_MEDIA_NAME).map(str::to_owned))
                .flatten(),
            sample_spec: self.sample_spec,
            channel_map: self.channel_map.clone(),
            length,
            proplist: version.has_proplist().then(|| self.proplist.clone()),
        });

        core.request(self.key, ReplyKind::Create, &command, false)?;
        self.set_state(core, StreamState::Creating);

        Ok(())
    }

    pub(crate) fn on_create_reply(
        &mut self,
        core: &mut Core<impl Transport, impl Clock>,
        result: Result<&[u8], ErrorCode>,
    ) -> Result<()> {
        if self.state != StreamState::Creating {
            return Ok(());
        }

        let payload = match result {
            Ok(payload) => payload,
            Err(code) => {
                log::debug!("stream {:?}: creation refused: {code:?}", self.key);
                self.set_state(core, StreamState::Failed);
                return Ok(());
            }
        };

        let version = core.version;

        let channel = match self.direction {
            Direction::Playback => {
                let reply: CreatePlaybackReply = decode_exact(payload)?;
                self.check_index(reply.channel, reply.stream_index)?;
                self.requested_bytes = reply.requested_bytes as usize;

                check_presence(version.has_buffer_attr(), &reply.buffer_attr, "buffer attributes")?;
                if let Some(attr) = reply.buffer_attr {
                    self.merge_playback_attr(attr);
                }

                self.apply_device(version, reply.device)?;

                check_presence(version.has_proplist(), &reply.configured_usec, "configured latency")?;
                if let Some(usec) = reply.configured_usec {
                    self.timing.info.configured_sink_usec = usec;
                }

                reply.channel
            }
            Direction::Record => {
                let reply: CreateRecordReply = decode_exact(payload)?;
                self.check_index(reply.channel, reply.stream_index)?;

                check_presence(version.has_buffer_attr(), &reply.buffer_attr, "buffer attributes")?;
                if let Some(attr) = reply.buffer_attr {
                    self.merge_record_attr(attr);
                }

                self.apply_device(version, reply.device)?;

                check_presence(version.has_proplist(), &reply.configured_usec, "configured latency")?;
                if let Some(usec) = reply.configured_usec {
                    self.timing.info.configured_source_usec = usec;
                }

                let maxlength = match self.buffer_attr.maxlength {
                    0 => LEGACY_MAXLENGTH,
                    n => n,
                };
                self.record = Some(RecordState {
                    queue: BlockQueue::new(maxlength as usize),
                    peeked: None,
                });

                reply.channel
            }
            Direction::Upload => {
                let reply: CreateUploadReply = decode_exact(payload)?;
                if reply.channel == INVALID_INDEX {
                    return Err(Error::Protocol("invalid channel"));
                }
                self.requested_bytes = reply.requested_bytes as usize;

                reply.channel
            }
            Direction::None => return Err(Error::Protocol("reply for an unconnected stream")),
        };

        self.channel = Some(channel);
        core.bind_channel(self.direction, channel, self.key);

        self.set_state(core, StreamState::Ready);

        if self.requested_bytes > 0 {
            self.events.push(StreamEvent::Write(self.requested_bytes));
        }

        if self.flags.contains(StreamFlags::AUTO_TIMING_UPDATE) {
            self.timing.timer_armed = true;
            core.arm_timer(self.key);
            self.request_auto_timing_update(core, true)?;
        }

        Ok(())
    }

    fn check_index(&mut self, channel: u32, stream_index: u32) -> Result<()> {
        if channel == INVALID_INDEX || stream_index == INVALID_INDEX {
            return Err(Error::Protocol("invalid channel or stream index"));
        }
        self.stream_index = stream_index;
        Ok(())
    }

    /// Takes over the device binding the server chose, as long as it only
    /// changed what the stream's flags allow it to change.
    fn apply_device(
        &mut self,
        version: rill_proto::ProtocolVersion,
        device: Option<DeviceBinding>,
    ) -> Result<()> {
        check_presence(version.has_device_info(), &device, "device binding")?;
        let Some(device) = device else {
            return Ok(());
        };

        let Some(name) = device.device_name else {
            return Err(Error::Protocol("device without a name"));
        };

        let spec = device.sample_spec;
        let map = device.channel_map;
        let flags = self.flags;

        if device.device_index == INVALID_INDEX
            || usize::from(spec.channels) != map.channels()
            || !map.is_valid()
            || !spec.is_valid()
            || (!flags.contains(StreamFlags::FIX_FORMAT) && spec.format != self.sample_spec.format)
            || (!flags.contains(StreamFlags::FIX_RATE) && spec.rate != self.sample_spec.rate)
            || (!flags.contains(StreamFlags::FIX_CHANNELS) && map != self.channel_map)
        {
            return Err(Error::Protocol("unexpected device binding"));
        }

        self.device_index = device.device_index;
        self.device_name = Some(name);
        self.suspended = device.suspended;
        self.sample_spec = spec;
        self.channel_map = map;

        Ok(())
    }

    pub(crate) fn on_delete_reply(
        &mut self,
        core: &mut Core<impl Transport, impl Clock>,
        result: Result<&[u8], ErrorCode>,
    ) -> Result<()> {
        match result {
            Err(code) => {
                log::debug!("stream {:?}: delete refused: {code:?}", self.key);
                self.set_state(core, StreamState::Failed);
            }
            Ok(payload) => {
                if !payload.is_empty() {
                    return Err(Error::Protocol("trailing data in delete reply"));
                }
                self.set_state(core, StreamState::Terminated);
            }
        }

        Ok(())
    }
}

/// Fills in the buffer metrics servers before protocol 13 did not choose
/// themselves. Only zero fields are touched.
fn automatic_buffer_attr(attr: &mut BufferAttr, spec: &SampleSpec) {
    if attr.maxlength == 0 {
        attr.maxlength = LEGACY_MAXLENGTH;
    }

    if attr.tlength == 0 {
        attr.tlength = spec.usec_to_bytes(DEFAULT_TLENGTH_USEC) as u32;
    }

    if attr.minreq == 0 {
        attr.minreq = attr.tlength / 5;
    }

    if attr.prebuf == 0 {
        attr.prebuf = attr.tlength;
    }

    if attr.fragsize == 0 {
        attr.fragsize = attr.tlength;
    }
}
