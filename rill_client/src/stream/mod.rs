//! Streams: one playback, record or upload channel bound to a [`Context`].
//!
//! All stream state lives inside the [`Context`]. Applications hold
//! [`Stream`] handles and pass them to the context's methods.

mod data;
mod latency;
mod lifecycle;
mod ops;

use core::ops::BitOr;
use std::rc::{Rc, Weak};

use rill_proto::{
    format::{ChannelMap, SampleSpec},
    message::{
        BufferAttr, INVALID_INDEX, PlaybackBufferAttr, Proplist, RecordBufferAttr,
    },
};
use rill_utils::{BlockQueue, MemChunk, Smoother};

use crate::{
    Context, Error, Result,
    context::Core,
    event::{EventQueue, StreamEvent},
    timing::{CorrectionRing, TimingInfo},
    transport::{Clock, Transport},
};

/// Identifies a stream within its context. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamKey(pub(crate) u64);

/// Application side handle to a stream.
///
/// Clones refer to the same stream. Stream state is freed once it has been
/// unlinked from its context and the last handle is gone.
#[derive(Debug, Clone)]
pub struct Stream {
    key: StreamKey,
    _handle: Rc<()>,
}

impl Stream {
    #[inline(always)]
    pub fn key(&self) -> StreamKey {
        self.key
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Not connected yet.
    None,
    Playback,
    Record,
    /// Uploads a sample into the server's cache.
    Upload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    Unconnected,
    Creating,
    Ready,
    Failed,
    Terminated,
}

impl StreamState {
    #[inline(always)]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Terminated)
    }
}

/// Connection flags of a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct StreamFlags(u32);

impl StreamFlags {
    pub const NONE: Self = Self(0);
    /// Create the stream paused.
    pub const START_CORKED: Self = Self(1 << 0);
    /// Interpolate the playback position between timing updates.
    pub const INTERPOLATE_TIMING: Self = Self(1 << 1);
    /// Allow reported times to go backwards.
    pub const NOT_MONOTONIC: Self = Self(1 << 2);
    /// Refresh timing information periodically and whenever it goes stale.
    pub const AUTO_TIMING_UPDATE: Self = Self(1 << 3);
    pub const NO_REMAP_CHANNELS: Self = Self(1 << 4);
    pub const NO_REMIX_CHANNELS: Self = Self(1 << 5);
    /// Let the server pick the sample format.
    pub const FIX_FORMAT: Self = Self(1 << 6);
    /// Let the server pick the sample rate.
    pub const FIX_RATE: Self = Self(1 << 7);
    /// Let the server pick the channel layout.
    pub const FIX_CHANNELS: Self = Self(1 << 8);
    pub const DONT_MOVE: Self = Self(1 << 9);
    /// Allow [`Context::update_sample_rate`].
    pub const VARIABLE_RATE: Self = Self(1 << 10);
    /// Record streams only.
    pub const PEAK_DETECT: Self = Self(1 << 11);
    /// Playback streams only.
    pub const START_MUTED: Self = Self(1 << 12);
    pub const ADJUST_LATENCY: Self = Self(1 << 13);

    const KNOWN: u32 = (1 << 14) - 1;

    #[inline(always)]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[inline(always)]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline(always)]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline(always)]
    pub const fn is_known(self) -> bool {
        self.0 & !Self::KNOWN == 0
    }
}

impl BitOr for StreamFlags {
    type Output = Self;

    #[inline(always)]
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Debug, Default)]
pub(crate) struct TimingState {
    pub info: TimingInfo,
    pub valid: bool,
    pub corrections: CorrectionRing,
    pub read_index_not_before: u32,
    pub write_index_not_before: u32,
    pub previous_time: u64,
    pub auto_update_requested: bool,
    pub timer_armed: bool,
}

/// Received record data and the chunk currently lent to the application.
#[derive(Debug)]
pub(crate) struct RecordState {
    pub queue: BlockQueue,
    pub peeked: Option<MemChunk>,
}

pub(crate) struct StreamInner {
    pub key: StreamKey,
    handles: Weak<()>,
    /// Cleared when the stream is unlinked from its context.
    pub linked: bool,

    pub direction: Direction,
    pub state: StreamState,
    pub flags: StreamFlags,

    pub sample_spec: SampleSpec,
    pub channel_map: ChannelMap,
    pub proplist: Proplist,
    pub buffer_attr: BufferAttr,

    pub channel: Option<u32>,
    pub stream_index: u32,
    pub sync_id: u32,
    pub direct_on_input: Option<u32>,

    pub device_index: u32,
    pub device_name: Option<String>,
    pub suspended: bool,
    pub corked: bool,

    /// Flow control credit, in bytes.
    pub requested_bytes: usize,

    pub timing: TimingState,
    pub smoother: Option<Smoother>,
    pub record: Option<RecordState>,

    pub events: EventQueue,
}

impl StreamInner {
    #[inline(always)]
    pub(crate) fn has_handles(&self) -> bool {
        self.handles.strong_count() > 0
    }

    pub(crate) fn set_state(&mut self, core: &mut Core<impl Transport, impl Clock>, st: StreamState) {
        if self.state == st {
            return;
        }

        log::debug!("stream {:?}: {:?} -> {:?}", self.key, self.state, st);

        self.state = st;
        self.events.push(StreamEvent::StateChanged(st));
        core.notify_state(self.key, st);

        if st.is_terminal() {
            self.unlink(core);
        }
    }

    /// Detaches the stream from its context. Runs at most once.
    fn unlink(&mut self, core: &mut Core<impl Transport, impl Clock>) {
        if !self.linked {
            return;
        }
        self.linked = false;

        for reply in core.replies.drop_stream(self.key) {
            if let Some(op) = reply.op {
                op.cancel();
            }
        }

        if let Some(channel) = self.channel.take() {
            core.unbind_channel(self.direction, channel, self.key);
        }

        core.disarm_timer(self.key);
        self.timing.timer_armed = false;

        self.events.close();
    }

    /// Transport-corrected local time, for feeding the smoother.
    #[inline]
    pub(crate) fn smoother_time(&self, now: u64, ahead: bool) -> u64 {
        if !self.timing.valid {
            return now;
        }

        let transport = self.timing.info.transport_usec;
        if ahead {
            now.saturating_add(transport)
        } else {
            now.saturating_sub(transport)
        }
    }

    /// Marks the read and/or write index of the current snapshot as stale,
    /// along with every reply to a request sent before now.
    pub(crate) fn invalidate_indexes(
        &mut self,
        core: &mut Core<impl Transport, impl Clock>,
        read: bool,
        write: bool,
    ) -> Result<()> {
        if self.state != StreamState::Ready {
            return Ok(());
        }

        if write {
            self.timing.write_index_not_before = core.next_tag();
            if self.timing.valid {
                self.timing.info.write_index_corrupt = true;
            }
        }

        if read {
            self.timing.read_index_not_before = core.next_tag();
            if self.timing.valid {
                self.timing.info.read_index_corrupt = true;
            }
        }

        self.request_auto_timing_update(core, true)
    }

    /// Sends a timing request if automatic updates are on and either `force`
    /// is set or none is in flight yet, then rearms the refresh timer.
    pub(crate) fn request_auto_timing_update(
        &mut self,
        core: &mut Core<impl Transport, impl Clock>,
        force: bool,
    ) -> Result<()> {
        if !self.flags.contains(StreamFlags::AUTO_TIMING_UPDATE) {
            return Ok(());
        }

        if self.state == StreamState::Ready && (force || !self.timing.auto_update_requested) {
            match self.send_timing_request(core, false) {
                Ok(_) => self.timing.auto_update_requested = true,
                Err(Error::Exhausted) => {
                    log::debug!("stream {:?}: skipping timing refresh, too many in flight", self.key)
                }
                Err(e) => return Err(e),
            }
        }

        if self.timing.timer_armed {
            core.arm_timer(self.key);
        }

        Ok(())
    }

    #[inline]
    fn merge_playback_attr(&mut self, attr: PlaybackBufferAttr) {
        self.buffer_attr.maxlength = attr.maxlength;
        self.buffer_attr.tlength = attr.tlength;
        self.buffer_attr.prebuf = attr.prebuf;
        self.buffer_attr.minreq = attr.minreq;
    }

    #[inline]
    fn merge_record_attr(&mut self, attr: RecordBufferAttr) {
        self.buffer_attr.maxlength = attr.maxlength;
        self.buffer_attr.fragsize = attr.fragsize;
    }

    #[inline(always)]
    fn require_ready(&self) -> Result<()> {
        if self.state == StreamState::Ready {
            Ok(())
        } else {
            Err(Error::BadState)
        }
    }

    /// Ready, and not an upload.
    #[inline]
    fn require_ready_stream(&self) -> Result<()> {
        self.require_ready()?;
        if self.direction == Direction::Upload {
            return Err(Error::BadState);
        }
        Ok(())
    }

    #[inline]
    fn bound_channel(&self) -> Result<u32> {
        self.channel.ok_or(Error::BadState)
    }
}

/// Fails unless an optional field is present exactly when the negotiated
/// version says it should be.
#[inline]
fn check_presence<V>(expected: bool, field: &Option<V>, what: &'static str) -> Result<()> {
    if expected == field.is_some() {
        Ok(())
    } else {
        Err(Error::Protocol(what))
    }
}

// ------ accessors

impl<T: Transport, C: Clock> Context<T, C> {
    #[inline]
    fn inner(&self, stream: &Stream) -> Result<&StreamInner> {
        self.streams.get(&stream.key).ok_or(Error::BadState)
    }

    /// Takes the oldest queued event of `stream`.
    #[inline]
    pub fn poll_event(&mut self, stream: &Stream) -> Option<StreamEvent> {
        self.streams.get_mut(&stream.key)?.events.pop()
    }

    #[inline]
    pub fn stream_state(&self, stream: &Stream) -> StreamState {
        self.inner(stream)
            .map_or(StreamState::Terminated, |s| s.state)
    }

    #[inline]
    pub fn direction(&self, stream: &Stream) -> Direction {
        self.inner(stream).map_or(Direction::None, |s| s.direction)
    }

    /// Server side index of the stream.
    pub fn stream_index(&self, stream: &Stream) -> Result<u32> {
        let s = self.inner(stream)?;
        s.require_ready()?;
        Ok(s.stream_index)
    }

    /// Channel id the stream is bound to on this connection.
    pub fn channel(&self, stream: &Stream) -> Result<u32> {
        self.inner(stream)?.bound_channel()
    }

    pub fn device_index(&self, stream: &Stream) -> Result<u32> {
        let s = self.inner(stream)?;
        s.require_ready_stream()?;
        if !self.core.version.has_device_info() {
            return Err(Error::NotSupported);
        }
        if s.device_index == INVALID_INDEX {
            return Err(Error::BadState);
        }
        Ok(s.device_index)
    }

    pub fn device_name(&self, stream: &Stream) -> Result<&str> {
        let s = self.inner(stream)?;
        s.require_ready_stream()?;
        if !self.core.version.has_device_info() {
            return Err(Error::NotSupported);
        }
        s.device_name.as_deref().ok_or(Error::BadState)
    }

    pub fn is_suspended(&self, stream: &Stream) -> Result<bool> {
        let s = self.inner(stream)?;
        s.require_ready_stream()?;
        if !self.core.version.has_device_info() {
            return Err(Error::NotSupported);
        }
        Ok(s.suspended)
    }

    pub fn is_corked(&self, stream: &Stream) -> Result<bool> {
        let s = self.inner(stream)?;
        s.require_ready_stream()?;
        Ok(s.corked)
    }

    pub fn sample_spec(&self, stream: &Stream) -> Result<&SampleSpec> {
        Ok(&self.inner(stream)?.sample_spec)
    }

    pub fn channel_map(&self, stream: &Stream) -> Result<&ChannelMap> {
        Ok(&self.inner(stream)?.channel_map)
    }

    pub fn proplist(&self, stream: &Stream) -> Result<&Proplist> {
        Ok(&self.inner(stream)?.proplist)
    }

    pub fn buffer_attr(&self, stream: &Stream) -> Result<&BufferAttr> {
        let s = self.inner(stream)?;
        s.require_ready_stream()?;
        if !self.core.version.has_buffer_attr() {
            return Err(Error::NotSupported);
        }
        Ok(&s.buffer_attr)
    }

    /// The latest timing snapshot.
    pub fn timing_info(&self, stream: &Stream) -> Result<&TimingInfo> {
        let s = self.inner(stream)?;
        s.require_ready_stream()?;
        if !s.timing.valid {
            return Err(Error::BadState);
        }
        Ok(&s.timing.info)
    }
}

impl StreamInner {
    pub(crate) fn new(
        key: StreamKey,
        handles: Weak<()>,
        sample_spec: SampleSpec,
        channel_map: ChannelMap,
        proplist: Proplist,
        sync_id: u32,
    ) -> Self {
        let buffer_attr = BufferAttr {
            tlength: sample_spec.usec_to_bytes(lifecycle::DEFAULT_TLENGTH_USEC) as u32,
            ..BufferAttr::default()
        };

        Self {
            key,
            handles,
            linked: true,
            direction: Direction::None,
            state: StreamState::Unconnected,
            flags: StreamFlags::NONE,
            sample_spec,
            channel_map,
            proplist,
            buffer_attr,
            channel: None,
            stream_index: INVALID_INDEX,
            sync_id,
            direct_on_input: None,
            device_index: INVALID_INDEX,
            device_name: None,
            suspended: false,
            corked: false,
            requested_bytes: 0,
            timing: TimingState::default(),
            smoother: None,
            record: None,
            events: EventQueue::default(),
        }
    }
}

pub(crate) fn new_handle() -> (Rc<()>, Weak<()>) {
    let rc = Rc::new(());
    let weak = Rc::downgrade(&rc);
    (rc, weak)
}

impl Stream {
    #[inline(always)]
    pub(crate) fn from_parts(key: StreamKey, handle: Rc<()>) -> Self {
        Self {
            key,
            _handle: handle,
        }
    }
}
