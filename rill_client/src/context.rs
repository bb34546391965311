//! The connection that owns every stream.

use core::cmp;

use rill_proto::{
    ProtocolVersion,
    message::{Command, ErrorCode, ServerMessage},
};
use rill_utils::{HeapPool, MemPool};
use rustc_hash::FxBuildHasher;

use crate::{
    Error, Result,
    config::ClientConfig,
    dispatch::{PendingReply, ReplyKind, ReplyRegistry},
    operation::Operation,
    stream::{Direction, StreamInner, StreamKey, StreamState},
    transport::{Clock, SystemClock, Transport},
};

type StreamMap<V> = rustc_hash::FxHashMap<StreamKey, V>;
type ChannelTable = rustc_hash::FxHashMap<u32, StreamKey>;

/// Per-stream refresh timers. The priority is a `Reverse` deadline, so the
/// earliest one pops first.
type TimerPQ = priority_queue::PriorityQueue<StreamKey, cmp::Reverse<u64>, FxBuildHasher>;

type StateHook = Box<dyn FnMut(StreamKey, StreamState)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextState {
    /// Authenticated and usable.
    Ready,
    /// Torn down by a fatal error. Every stream has failed with it.
    Failed,
}

/// Connection-wide state shared by all streams.
pub(crate) struct Core<T, C> {
    pub transport: T,
    pub clock: C,
    pub pool: Box<dyn MemPool>,
    pub config: ClientConfig,
    pub version: ProtocolVersion,
    pub state: ContextState,
    pub error: Option<ErrorCode>,
    pub replies: ReplyRegistry,

    ctag: u32,
    csyncid: u32,
    next_key: u64,

    timers: TimerPQ,
    playback_channels: ChannelTable,
    record_channels: ChannelTable,
    state_hook: Option<StateHook>,
}

impl<T: Transport, C: Clock> Core<T, C> {
    /// Tag the next request will be sent under.
    #[inline(always)]
    pub(crate) fn next_tag(&self) -> u32 {
        self.ctag
    }

    #[inline(always)]
    pub(crate) fn now(&self) -> u64 {
        self.clock.monotonic_usec()
    }

    pub(crate) fn next_sync_id(&mut self) -> u32 {
        let id = self.csyncid;
        self.csyncid = self.csyncid.wrapping_add(1);
        id
    }

    pub(crate) fn next_key(&mut self) -> StreamKey {
        let key = StreamKey(self.next_key);
        self.next_key = self.next_key.strict_add(1);
        key
    }

    /// Sends `command` under the next tag.
    ///
    /// Tags are never reused, so a connection carries at most `u32::MAX`
    /// requests. Past that, every request fails the connection.
    fn send(&mut self, command: &Command) -> Result<u32> {
        if self.ctag == u32::MAX {
            return Err(Error::Protocol("request tags exhausted"));
        }

        let tag = self.ctag;
        self.ctag += 1;

        self.transport.send_command(tag, command)?;
        Ok(tag)
    }

    /// Sends `command` and waits for its reply on behalf of `stream`.
    ///
    /// Returns the request's tag, and an operation handle if `with_op` is set.
    pub(crate) fn request(
        &mut self,
        stream: StreamKey,
        kind: ReplyKind,
        command: &Command,
        with_op: bool,
    ) -> Result<(u32, Option<Operation>)> {
        let tag = self.send(command)?;
        let op = with_op.then(Operation::new);

        let deadline = self.now().saturating_add(self.config.reply_timeout_usec);
        self.replies.register(
            tag,
            PendingReply {
                stream,
                kind,
                op: op.clone(),
            },
            deadline,
        );

        Ok((tag, op))
    }

    /// Like [`request`](Self::request), always returning an operation.
    pub(crate) fn request_op(
        &mut self,
        stream: StreamKey,
        kind: ReplyKind,
        command: &Command,
    ) -> Result<Operation> {
        let (_, op) = self.request(stream, kind, command, true)?;
        op.ok_or(Error::BadState)
    }

    #[inline]
    fn channels(&self, direction: Direction) -> &ChannelTable {
        match direction {
            Direction::Record => &self.record_channels,
            _ => &self.playback_channels,
        }
    }

    #[inline]
    fn channels_mut(&mut self, direction: Direction) -> &mut ChannelTable {
        match direction {
            Direction::Record => &mut self.record_channels,
            _ => &mut self.playback_channels,
        }
    }

    /// Upload streams share the playback table.
    #[inline]
    pub(crate) fn bind_channel(&mut self, direction: Direction, channel: u32, key: StreamKey) {
        self.channels_mut(direction).insert(channel, key);
    }

    pub(crate) fn unbind_channel(&mut self, direction: Direction, channel: u32, key: StreamKey) {
        let table = self.channels_mut(direction);
        if table.get(&channel) == Some(&key) {
            table.remove(&channel);
        }
    }

    #[inline]
    pub(crate) fn lookup(&self, direction: Direction, channel: u32) -> Option<StreamKey> {
        self.channels(direction).get(&channel).copied()
    }

    /// (Re)starts the refresh timer of `key`, one interval from now.
    #[inline]
    pub(crate) fn arm_timer(&mut self, key: StreamKey) {
        // a zero interval would fire forever within one call to process_timeouts
        let interval = self.config.auto_timing_interval_usec.max(1);
        let deadline = self.now().saturating_add(interval);
        self.timers.push(key, cmp::Reverse(deadline));
    }

    #[inline]
    pub(crate) fn disarm_timer(&mut self, key: StreamKey) {
        self.timers.remove(&key);
    }

    #[inline]
    pub(crate) fn notify_state(&mut self, key: StreamKey, state: StreamState) {
        if let Some(hook) = self.state_hook.as_mut() {
            hook(key, state);
        }
    }
}

/// A connection to an audio server, and every stream bound to it.
///
/// The context is driven from the outside: the owner feeds it every frame
/// received from the server ([`handle_message`](Self::handle_message)), and
/// calls [`process_timeouts`](Self::process_timeouts) whenever
/// [`next_deadline`](Self::next_deadline) has passed. Stream events are queued
/// and drained with [`poll_event`](Self::poll_event).
pub struct Context<T, C = SystemClock> {
    pub(crate) core: Core<T, C>,
    pub(crate) streams: StreamMap<StreamInner>,
}

impl<T: Transport, C: Clock> Context<T, C> {
    /// Creates a context for a connection that already negotiated `version`.
    pub fn new(transport: T, clock: C, version: ProtocolVersion, config: ClientConfig) -> Self {
        let pool = HeapPool::new(config.block_size_max);

        Self {
            core: Core {
                transport,
                clock,
                pool: Box::new(pool),
                config,
                version,
                state: ContextState::Ready,
                error: None,
                replies: ReplyRegistry::default(),
                ctag: 0,
                csyncid: 0,
                next_key: 0,
                timers: TimerPQ::with_hasher(FxBuildHasher),
                playback_channels: ChannelTable::with_hasher(FxBuildHasher),
                record_channels: ChannelTable::with_hasher(FxBuildHasher),
                state_hook: None,
            },
            streams: StreamMap::with_hasher(FxBuildHasher),
        }
    }

    /// Replaces the pool audio blocks are allocated from.
    pub fn with_pool(mut self, pool: impl MemPool + 'static) -> Self {
        self.core.pool = Box::new(pool);
        self
    }

    #[inline(always)]
    pub fn state(&self) -> ContextState {
        self.core.state
    }

    /// The last error the connection ran into.
    #[inline(always)]
    pub fn error(&self) -> Option<ErrorCode> {
        self.core.error
    }

    #[inline(always)]
    pub fn version(&self) -> ProtocolVersion {
        self.core.version
    }

    #[inline(always)]
    pub fn config(&self) -> &ClientConfig {
        &self.core.config
    }

    #[inline(always)]
    pub fn transport(&self) -> &T {
        &self.core.transport
    }

    #[inline(always)]
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.core.transport
    }

    #[inline(always)]
    pub fn clock(&self) -> &C {
        &self.core.clock
    }

    /// Streams that were connected and are not terminated yet.
    pub fn live_streams(&self) -> usize {
        self.streams
            .values()
            .filter(|s| s.linked && s.state != StreamState::Unconnected)
            .count()
    }

    /// Number of requests waiting for a reply.
    #[inline]
    pub fn pending_requests(&self) -> usize {
        self.core.replies.len()
    }

    /// Runs `hook` on every stream state change.
    pub fn set_state_hook(&mut self, hook: impl FnMut(StreamKey, StreamState) + 'static) {
        self.core.state_hook = Some(Box::new(hook));
    }

    /// Tears the connection down: records `code` and fails every stream.
    pub fn fail(&mut self, code: ErrorCode) {
        if self.core.state == ContextState::Failed {
            return;
        }

        log::warn!("connection failed: {code:?}");

        self.core.error = Some(code);
        self.core.state = ContextState::Failed;

        for s in self.streams.values_mut() {
            if s.linked {
                s.set_state(&mut self.core, StreamState::Failed);
            }
        }
    }

    /// Fails the connection if `res` carries a fatal error.
    pub(crate) fn guard<R>(&mut self, res: Result<R>) -> Result<R> {
        if let Err(e) = &res {
            if e.is_fatal() {
                log::warn!("{e}");
                self.fail(e.code());
            }
        }
        res
    }

    /// Runs `f` on the state of `stream`, failing the connection on fatal errors.
    pub(crate) fn run<R>(
        &mut self,
        stream: &crate::Stream,
        f: impl FnOnce(&mut Core<T, C>, &mut StreamInner) -> Result<R>,
    ) -> Result<R> {
        let res = match self.streams.get_mut(&stream.key()) {
            Some(s) => f(&mut self.core, s),
            None => Err(Error::BadState),
        };
        self.guard(res)
    }

    /// Frees streams that are unlinked, or were never connected, and have no
    /// handles left.
    pub(crate) fn sweep(&mut self) {
        self.streams.retain(|_, s| {
            s.has_handles() || (s.linked && s.state != StreamState::Unconnected)
        });
    }

    /// Decodes and handles one frame received from the server.
    ///
    /// A malformed frame is fatal to the connection.
    pub fn handle_message(&mut self, frame: &[u8]) -> Result<()> {
        match rill_proto::decode_server_message(frame) {
            Ok(msg) => self.dispatch(msg),
            Err(e) => {
                let res: Result<()> = Err(e.into());
                self.sweep();
                self.guard(res)
            }
        }
    }

    /// Handles one server message.
    pub fn dispatch(&mut self, msg: ServerMessage<'_>) -> Result<()> {
        let res = if self.core.state == ContextState::Failed {
            log::debug!("ignoring message on failed connection");
            Ok(())
        } else {
            self.route(msg)
        };

        let res = self.guard(res);
        self.sweep();
        res
    }

    fn route(&mut self, msg: ServerMessage<'_>) -> Result<()> {
        match msg {
            ServerMessage::Reply { tag, payload } => self.on_reply(tag, Ok(payload)),
            ServerMessage::Error { tag, code } => {
                self.core.error = Some(code);
                self.on_reply(tag, Err(code))
            }
            ServerMessage::PlaybackStreamKilled { channel } => {
                self.on_killed(Direction::Playback, channel);
                Ok(())
            }
            ServerMessage::RecordStreamKilled { channel } => {
                self.on_killed(Direction::Record, channel);
                Ok(())
            }
            ServerMessage::PlaybackStreamMoved(m) => self.on_moved(Direction::Playback, m),
            ServerMessage::RecordStreamMoved(m) => self.on_moved(Direction::Record, m),
            ServerMessage::PlaybackStreamSuspended { channel, suspended } => {
                self.on_suspended(Direction::Playback, channel, suspended)
            }
            ServerMessage::RecordStreamSuspended { channel, suspended } => {
                self.on_suspended(Direction::Record, channel, suspended)
            }
            ServerMessage::Started { channel } => self.on_started(channel),
            ServerMessage::Request { channel, bytes } => {
                self.on_request(channel, bytes);
                Ok(())
            }
            ServerMessage::Overflow { channel } => self.on_xrun(channel, true),
            ServerMessage::Underflow { channel } => self.on_xrun(channel, false),
            ServerMessage::Memblock {
                channel,
                offset,
                seek,
                bytes,
            } => {
                self.on_record_data(channel, offset, seek, bytes);
                Ok(())
            }
        }
    }

    fn on_reply(&mut self, tag: u32, result: Result<&[u8], ErrorCode>) -> Result<()> {
        let Some(reply) = self.core.replies.take(tag) else {
            log::debug!("no request pending for reply tag {tag}");
            return Ok(());
        };

        self.complete_reply(tag, reply, result)
    }

    fn complete_reply(
        &mut self,
        tag: u32,
        reply: PendingReply,
        result: Result<&[u8], ErrorCode>,
    ) -> Result<()> {
        let Some(s) = self.streams.get_mut(&reply.stream) else {
            return Ok(());
        };
        let core = &mut self.core;
        let op = reply.op;

        let res = match reply.kind {
            ReplyKind::Create => s.on_create_reply(core, result),
            ReplyKind::Delete => s.on_delete_reply(core, result),
            ReplyKind::Ack => s.on_ack_reply(result, op.as_ref()),
            ReplyKind::Timing => s.on_timing_reply(core, tag, result, op.as_ref()),
            ReplyKind::BufferAttr => s.on_buffer_attr_reply(result, op.as_ref()),
            ReplyKind::SampleRate(rate) => s.on_sample_rate_reply(result, rate, op.as_ref()),
        };

        if res.is_err() {
            if let Some(op) = op {
                op.cancel();
            }
        }

        res
    }

    /// Earliest instant, in monotonic microseconds, at which
    /// [`process_timeouts`](Self::process_timeouts) has work to do.
    pub fn next_deadline(&self) -> Option<u64> {
        let timer = self.core.timers.peek().map(|(_, cmp::Reverse(d))| *d);
        let reply = self.core.replies.next_deadline();

        match (timer, reply) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Fails requests whose reply is overdue, and runs due refresh timers.
    pub fn process_timeouts(&mut self) -> Result<()> {
        let res = self.expire(self.core.now());
        let res = self.guard(res);
        self.sweep();
        res
    }

    fn expire(&mut self, now: u64) -> Result<()> {
        while let Some((tag, reply)) = self.core.replies.pop_expired(now) {
            log::debug!("request {tag} timed out");
            self.core.error = Some(ErrorCode::Timeout);
            self.complete_reply(tag, reply, Err(ErrorCode::Timeout))?;
        }

        while let Some((key, _)) = self
            .core
            .timers
            .pop_if(|_, cmp::Reverse(deadline)| *deadline <= now)
        {
            if let Some(s) = self.streams.get_mut(&key) {
                s.request_auto_timing_update(&mut self.core, false)?;
            }
        }

        Ok(())
    }
}
