//! All protocol message types exchanged between a client and an audio server.
//!
//! Requests flow from the client as [`Command`]s, each sent under a sequence
//! tag. The server answers every tag with either a reply payload or an error
//! code, and pushes [`ServerMessage`] notifications about streams on its own.
//!
//! Payload layouts depend on the negotiated [`ProtocolVersion`](crate::ProtocolVersion).
//! Fields that only exist above some version are modelled as `Option`s; the
//! receiver checks their presence against the version it negotiated.

use alloc::{collections::BTreeMap, string::String, vec::Vec};
use serde::{Deserialize, Serialize};

use crate::format::{ChannelMap, ChannelVolumes, SampleSpec};

/// Property key holding a stream's human readable name.
pub const PROP_MEDIA_NAME: &str = "media.name";

/// Property key holding the application name.
pub const PROP_APPLICATION_NAME: &str = "application.name";

/// Sentinel used on the wire for "no index".
pub const INVALID_INDEX: u32 = u32::MAX;

/// Free-form key/value properties attached to a stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proplist(pub BTreeMap<String, String>);

impl Proplist {
    #[inline(always)]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    #[inline]
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    #[inline]
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// How a property update is merged with the server's copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateMode {
    /// Replace the whole list.
    Set,
    /// Only add keys that are not present yet.
    Merge,
    /// Add new keys and overwrite existing ones.
    Replace,
}

/// Where an incoming or outgoing block of audio is placed in the server queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SeekMode {
    /// Relative to the current write index.
    Relative,
    /// Absolute position in the stream.
    Absolute,
    /// Relative to the current read index.
    RelativeOnRead,
    /// Relative to the end of the queued data.
    RelativeEnd,
}

/// Buffer metrics of a stream, all expressed in bytes.
///
/// A zero field means "let the other side choose".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferAttr {
    /// Upper bound of the server side queue.
    pub maxlength: u32,
    /// Playback only: amount of data the server tries to keep queued.
    pub tlength: u32,
    /// Playback only: how much must be queued before playback starts.
    pub prebuf: u32,
    /// Playback only: smallest request the server sends.
    pub minreq: u32,
    /// Record only: size of the fragments the server sends.
    pub fragsize: u32,
}

/// Error codes a server may answer a request with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    Access,
    Command,
    Invalid,
    Exist,
    NoEntity,
    ConnectionRefused,
    Protocol,
    Timeout,
    AuthKey,
    Internal,
    ConnectionTerminated,
    Killed,
    InvalidServer,
    ModuleInitFailed,
    BadState,
    NoData,
    Version,
    TooLarge,
    NotSupported,
    Unknown,
}

// ------ requests

/// Channel remixing and renegotiation switches, sent by protocol 12 and later.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CreateFlags {
    pub no_remap_channels: bool,
    pub no_remix_channels: bool,
    pub fix_format: bool,
    pub fix_rate: bool,
    pub fix_channels: bool,
    pub dont_move: bool,
    pub variable_rate: bool,
}

/// Trailing fields of a create request, sent by protocol 13 and later.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateExtension {
    /// `start_muted` for playback streams, `peak_detect` for record streams.
    pub direction_switch: bool,
    pub adjust_latency: bool,
    pub proplist: Proplist,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePlaybackStream {
    /// Only sent below protocol 13, which carries the name in `proplist`.
    pub name: Option<String>,
    pub sample_spec: SampleSpec,
    pub channel_map: ChannelMap,
    pub sink_index: u32,
    pub sink_name: Option<String>,
    pub maxlength: u32,
    pub corked: bool,
    pub tlength: u32,
    pub prebuf: u32,
    pub minreq: u32,
    pub sync_id: u32,
    pub volume: ChannelVolumes,
    pub flags: Option<CreateFlags>,
    pub extension: Option<CreateExtension>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRecordStream {
    /// Only sent below protocol 13, which carries the name in `proplist`.
    pub name: Option<String>,
    pub sample_spec: SampleSpec,
    pub channel_map: ChannelMap,
    pub source_index: u32,
    pub source_name: Option<String>,
    pub maxlength: u32,
    pub corked: bool,
    pub fragsize: u32,
    pub flags: Option<CreateFlags>,
    pub extension: Option<CreateExtension>,
    /// Sink input to monitor, protocol 13 and later.
    pub direct_on_input: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateUploadStream {
    pub name: Option<String>,
    pub sample_spec: SampleSpec,
    pub channel_map: ChannelMap,
    pub length: u32,
    pub proplist: Option<Proplist>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SetPlaybackBufferAttr {
    pub channel: u32,
    pub maxlength: u32,
    pub tlength: u32,
    pub prebuf: u32,
    pub minreq: u32,
    pub adjust_latency: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SetRecordBufferAttr {
    pub channel: u32,
    pub maxlength: u32,
    pub fragsize: u32,
    pub adjust_latency: Option<bool>,
}

/// Requests a client sends to the server.
///
/// Kept flat (one variant per wire command) so a single discriminant is
/// encoded per message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    CreatePlaybackStream(CreatePlaybackStream),
    CreateRecordStream(CreateRecordStream),
    CreateUploadStream(CreateUploadStream),
    DeletePlaybackStream { channel: u32 },
    DeleteRecordStream { channel: u32 },
    DeleteUploadStream { channel: u32 },
    FinishUploadStream { channel: u32 },
    CorkPlaybackStream { channel: u32, cork: bool },
    CorkRecordStream { channel: u32, cork: bool },
    FlushPlaybackStream { channel: u32 },
    FlushRecordStream { channel: u32 },
    PrebufPlaybackStream { channel: u32 },
    TriggerPlaybackStream { channel: u32 },
    DrainPlaybackStream { channel: u32 },
    SetPlaybackStreamName { channel: u32, name: String },
    SetRecordStreamName { channel: u32, name: String },
    SetPlaybackStreamBufferAttr(SetPlaybackBufferAttr),
    SetRecordStreamBufferAttr(SetRecordBufferAttr),
    UpdatePlaybackStreamSampleRate { channel: u32, rate: u32 },
    UpdateRecordStreamSampleRate { channel: u32, rate: u32 },
    UpdatePlaybackStreamProplist { channel: u32, mode: UpdateMode, proplist: Proplist },
    UpdateRecordStreamProplist { channel: u32, mode: UpdateMode, proplist: Proplist },
    RemovePlaybackStreamProplist { channel: u32, keys: Vec<String> },
    RemoveRecordStreamProplist { channel: u32, keys: Vec<String> },
    /// `now` is the client's wall clock in microseconds.
    GetPlaybackLatency { channel: u32, now: u64 },
    GetRecordLatency { channel: u32, now: u64 },
}

// ------ replies

/// Negotiated playback buffer metrics, protocol 9 and later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlaybackBufferAttr {
    pub maxlength: u32,
    pub tlength: u32,
    pub prebuf: u32,
    pub minreq: u32,
}

/// Negotiated record buffer metrics, protocol 9 and later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordBufferAttr {
    pub maxlength: u32,
    pub fragsize: u32,
}

/// Device the stream was bound to, protocol 12 and later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceBinding {
    pub sample_spec: SampleSpec,
    pub channel_map: ChannelMap,
    pub device_index: u32,
    pub device_name: Option<String>,
    pub suspended: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePlaybackReply {
    pub channel: u32,
    pub stream_index: u32,
    pub requested_bytes: u32,
    pub buffer_attr: Option<PlaybackBufferAttr>,
    pub device: Option<DeviceBinding>,
    /// Configured sink latency, protocol 13 and later.
    pub configured_usec: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRecordReply {
    pub channel: u32,
    pub stream_index: u32,
    pub buffer_attr: Option<RecordBufferAttr>,
    pub device: Option<DeviceBinding>,
    /// Configured source latency, protocol 13 and later.
    pub configured_usec: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CreateUploadReply {
    pub channel: u32,
    pub requested_bytes: u32,
}

/// Underrun bookkeeping appended to playback latency replies, protocol 13 and later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnderrunInfo {
    pub underrun_for: u64,
    pub playing_for: u64,
}

/// Answer to a latency request.
///
/// Timestamps are wall-clock microseconds: `local` echoes the request's
/// `now`, `remote` is the server's clock when it answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LatencyReply {
    pub sink_usec: u64,
    pub source_usec: u64,
    pub playing: bool,
    pub local: u64,
    pub remote: u64,
    pub write_index: i64,
    pub read_index: i64,
    pub underrun: Option<UnderrunInfo>,
}

// ------ notifications

/// Buffer metrics pushed along with a move, protocol 13 and later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MovedBufferAttr {
    Playback {
        attr: PlaybackBufferAttr,
        configured_usec: u64,
    },
    Record {
        attr: RecordBufferAttr,
        configured_usec: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMoved {
    pub channel: u32,
    pub device_index: u32,
    pub device_name: Option<String>,
    pub suspended: bool,
    pub buffer_attr: Option<MovedBufferAttr>,
}

/// Everything a server sends to a client.
///
/// Replies carry their payload undecoded: only the pending request knows
/// which reply type to expect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage<'a> {
    Reply {
        tag: u32,
        #[serde(borrow)]
        payload: &'a [u8],
    },
    Error {
        tag: u32,
        code: ErrorCode,
    },
    PlaybackStreamKilled { channel: u32 },
    RecordStreamKilled { channel: u32 },
    PlaybackStreamMoved(StreamMoved),
    RecordStreamMoved(StreamMoved),
    PlaybackStreamSuspended { channel: u32, suspended: bool },
    RecordStreamSuspended { channel: u32, suspended: bool },
    Started { channel: u32 },
    Request { channel: u32, bytes: u32 },
    Overflow { channel: u32 },
    Underflow { channel: u32 },
    /// Record data for a stream.
    Memblock {
        channel: u32,
        offset: i64,
        seek: SeekMode,
        #[serde(borrow)]
        bytes: &'a [u8],
    },
}

/// Everything a client sends to a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage<'a> {
    Command {
        tag: u32,
        command: Command,
    },
    Memblock {
        channel: u32,
        offset: i64,
        seek: SeekMode,
        #[serde(borrow)]
        bytes: &'a [u8],
    },
}
