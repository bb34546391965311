#![allow(dead_code)]

use std::{
    cell::{Cell, RefCell},
    io,
    rc::Rc,
};

use rill_client::{
    ClientConfig, Clock, Context, Result, Stream, StreamEvent, StreamFlags, StreamState,
    Transport,
    rill_proto::{
        ProtocolVersion,
        format::{ChannelMap, SampleFormat, SampleSpec},
        message::*,
    },
    rill_utils::MemChunk,
};
use serde::Serialize;

pub const PLAYBACK_CHANNEL: u32 = 7;
pub const RECORD_CHANNEL: u32 = 8;

/// One byte per millisecond, so byte counts read as milliseconds.
pub fn spec() -> SampleSpec {
    SampleSpec::new(SampleFormat::U8, 1000, 1)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Command(u32, Command),
    Memblock {
        channel: u32,
        offset: i64,
        seek: SeekMode,
        len: usize,
    },
}

/// What the test sees of the transport.
#[derive(Debug, Clone, Default)]
pub struct Wire {
    log: Rc<RefCell<Vec<Sent>>>,
    broken: Rc<Cell<bool>>,
}

impl Wire {
    pub fn sent(&self) -> Vec<Sent> {
        self.log.borrow().clone()
    }

    pub fn commands(&self) -> Vec<(u32, Command)> {
        self.log
            .borrow()
            .iter()
            .filter_map(|s| match s {
                Sent::Command(tag, c) => Some((*tag, c.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn memblocks(&self) -> Vec<(u32, i64, SeekMode, usize)> {
        self.log
            .borrow()
            .iter()
            .filter_map(|s| match *s {
                Sent::Memblock {
                    channel,
                    offset,
                    seek,
                    len,
                } => Some((channel, offset, seek, len)),
                _ => None,
            })
            .collect()
    }

    pub fn last_command(&self) -> (u32, Command) {
        self.commands().pop().expect("nothing was sent")
    }

    pub fn last_tag(&self) -> u32 {
        self.last_command().0
    }

    pub fn clear(&self) {
        self.log.borrow_mut().clear();
    }

    /// Makes every following send fail.
    pub fn break_pipe(&self) {
        self.broken.set(true);
    }
}

pub struct ScriptedTransport {
    wire: Wire,
    shm: bool,
}

impl ScriptedTransport {
    fn check(&self) -> io::Result<()> {
        if self.wire.broken.get() {
            Err(io::ErrorKind::BrokenPipe.into())
        } else {
            Ok(())
        }
    }
}

impl Transport for ScriptedTransport {
    fn send_command(&mut self, tag: u32, command: &Command) -> io::Result<()> {
        self.check()?;
        self.wire
            .log
            .borrow_mut()
            .push(Sent::Command(tag, command.clone()));
        Ok(())
    }

    fn send_memblock(
        &mut self,
        channel: u32,
        offset: i64,
        seek: SeekMode,
        chunk: &MemChunk,
    ) -> io::Result<()> {
        self.check()?;
        self.wire.log.borrow_mut().push(Sent::Memblock {
            channel,
            offset,
            seek,
            len: chunk.len(),
        });
        Ok(())
    }

    fn uses_shm(&self) -> bool {
        self.shm
    }
}

#[derive(Debug, Clone)]
pub struct ManualClock {
    monotonic: Rc<Cell<u64>>,
    wall: Rc<Cell<u64>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            monotonic: Rc::new(Cell::new(1_000_000)),
            wall: Rc::new(Cell::new(1_700_000_000_000_000)),
        }
    }
}

impl ManualClock {
    pub fn advance(&self, usec: u64) {
        self.monotonic.set(self.monotonic.get() + usec);
        self.wall.set(self.wall.get() + usec);
    }

    pub fn wall(&self) -> u64 {
        self.wall.get()
    }
}

impl Clock for ManualClock {
    fn monotonic_usec(&self) -> u64 {
        self.monotonic.get()
    }

    fn wall_usec(&self) -> u64 {
        self.wall.get()
    }
}

pub struct Harness {
    pub ctx: Context<ScriptedTransport, ManualClock>,
    pub wire: Wire,
    pub clock: ManualClock,
}

impl Harness {
    pub fn new(version: u32) -> Self {
        Self::build(version, ClientConfig::default(), false)
    }

    pub fn build(version: u32, config: ClientConfig, shm: bool) -> Self {
        let wire = Wire::default();
        let clock = ManualClock::default();

        let transport = ScriptedTransport {
            wire: wire.clone(),
            shm,
        };

        Self {
            ctx: Context::new(transport, clock.clone(), ProtocolVersion(version), config),
            wire,
            clock,
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.ctx.version()
    }

    pub fn reply<T: Serialize>(&mut self, tag: u32, value: &T) -> Result<()> {
        let payload = rill_client::rill_proto::encode(value).unwrap();
        self.ctx.dispatch(ServerMessage::Reply {
            tag,
            payload: &payload,
        })
    }

    pub fn ack(&mut self, tag: u32) -> Result<()> {
        self.ctx.dispatch(ServerMessage::Reply { tag, payload: &[] })
    }

    pub fn refuse(&mut self, tag: u32, code: ErrorCode) -> Result<()> {
        self.ctx.dispatch(ServerMessage::Error { tag, code })
    }

    pub fn events(&mut self, stream: &Stream) -> Vec<StreamEvent> {
        std::iter::from_fn(|| self.ctx.poll_event(stream)).collect()
    }

    pub fn new_stream(&mut self) -> Stream {
        self.ctx.new_stream(Some("test"), &spec(), None, None).unwrap()
    }

    fn device(&self) -> Option<DeviceBinding> {
        self.version().has_device_info().then(|| DeviceBinding {
            sample_spec: spec(),
            channel_map: ChannelMap::auto(1).unwrap(),
            device_index: 0,
            device_name: Some("default".into()),
            suspended: false,
        })
    }

    pub fn playback_reply(&self, channel: u32, requested_bytes: u32) -> CreatePlaybackReply {
        let version = self.version();

        CreatePlaybackReply {
            channel,
            stream_index: 40 + channel,
            requested_bytes,
            buffer_attr: version.has_buffer_attr().then_some(PlaybackBufferAttr {
                maxlength: 4096,
                tlength: 250,
                prebuf: 100,
                minreq: 50,
            }),
            device: self.device(),
            configured_usec: version.has_proplist().then_some(25_000),
        }
    }

    pub fn record_reply(&self, channel: u32) -> CreateRecordReply {
        let version = self.version();

        CreateRecordReply {
            channel,
            stream_index: 40 + channel,
            buffer_attr: version.has_buffer_attr().then_some(RecordBufferAttr {
                maxlength: 4096,
                fragsize: 100,
            }),
            device: self.device(),
            configured_usec: version.has_proplist().then_some(25_000),
        }
    }

    /// A ready playback stream on `PLAYBACK_CHANNEL`, with 1000 bytes of
    /// credit and its events drained.
    pub fn playback(&mut self, flags: StreamFlags) -> Stream {
        self.playback_on(PLAYBACK_CHANNEL, flags)
    }

    pub fn playback_on(&mut self, channel: u32, flags: StreamFlags) -> Stream {
        let s = self.new_stream();
        self.ctx
            .connect_playback(&s, None, None, flags, None, None)
            .unwrap();

        let reply = self.playback_reply(channel, 1000);
        self.reply(self.wire.last_tag(), &reply).unwrap();

        assert_eq!(self.ctx.stream_state(&s), StreamState::Ready);
        self.events(&s);
        s
    }

    /// A ready record stream on `RECORD_CHANNEL`, events drained.
    pub fn record(&mut self, flags: StreamFlags) -> Stream {
        let s = self.new_stream();
        self.ctx.connect_record(&s, None, None, flags).unwrap();

        let reply = self.record_reply(RECORD_CHANNEL);
        self.reply(self.wire.last_tag(), &reply).unwrap();

        assert_eq!(self.ctx.stream_state(&s), StreamState::Ready);
        self.events(&s);
        s
    }

    /// A timing reply with both clocks agreeing on "now", so the transport
    /// delay comes out as zero.
    pub fn latency(&self, playback: bool, write_index: i64, read_index: i64) -> LatencyReply {
        let now = self.clock.wall();

        LatencyReply {
            sink_usec: 0,
            source_usec: 0,
            playing: true,
            local: now,
            remote: now,
            write_index,
            read_index,
            underrun: (playback && self.version().has_proplist()).then_some(UnderrunInfo {
                underrun_for: 0,
                playing_for: 0,
            }),
        }
    }
}
