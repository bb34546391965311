#![no_std]
//! Wire model of a versioned, tag-based audio stream protocol.
//!
//! A client talks to an audio server over a single persistent connection.
//! Every request carries a sequence tag, and the server answers each tag
//! exactly once, either with a reply payload or an error code. Independently
//! of requests, the server pushes notifications about the streams bound to
//! the connection (moves, suspensions, flow control requests, ...).
//!
//! ## Versions
//!
//! Both ends agree on a [`ProtocolVersion`] while authenticating. Several
//! message fields only exist from some version onwards; they are modelled as
//! `Option`s, and the receiving side checks their presence against the
//! negotiated version. The relevant thresholds are:
//!
//! - **9**: create replies carry the negotiated buffer metrics.
//! - **12**: device binding info, move/suspend notifications, buffer metric
//!   and sample rate updates.
//! - **13**: property lists, started notifications, peak detection, monitor
//!   streams, underrun info in latency replies.
//!
//! ## Encoding
//!
//! All types implement `serde`'s `Serialize` and `Deserialize`. The helpers
//! in this crate use `postcard`, one value per frame.
//!
//! See the [`message`] module for the complete message definitions.

extern crate alloc;

pub mod format;
pub mod message;

use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

pub use postcard::Error as CodecError;

/// Protocol version negotiated for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProtocolVersion(pub u32);

impl ProtocolVersion {
    /// Newest version this crate knows about.
    pub const CURRENT: Self = Self(13);

    /// Whether create replies carry buffer metrics.
    #[inline(always)]
    pub const fn has_buffer_attr(self) -> bool {
        self.0 >= 9
    }

    /// Whether device binding info, move and suspend notifications, and
    /// runtime buffer/rate updates are available.
    #[inline(always)]
    pub const fn has_device_info(self) -> bool {
        self.0 >= 12
    }

    /// Whether property lists, started notifications and the other
    /// protocol 13 extensions are available.
    #[inline(always)]
    pub const fn has_proplist(self) -> bool {
        self.0 >= 13
    }
}

impl Default for ProtocolVersion {
    #[inline(always)]
    fn default() -> Self {
        Self::CURRENT
    }
}

/// Encodes a single request frame.
#[inline]
pub fn encode_command(tag: u32, command: &message::Command) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(&message::ClientMessage::Command {
        tag,
        command: command.clone(),
    })
}

/// Encodes any serializable value, typically a reply payload on the server side.
#[inline]
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(value)
}

/// Decodes one server frame. Trailing bytes are rejected.
#[inline]
pub fn decode_server_message(bytes: &[u8]) -> Result<message::ServerMessage<'_>, CodecError> {
    decode_exact(bytes)
}

/// Decodes a value that must span the whole buffer.
///
/// Payloads with leftover bytes are as malformed as truncated ones.
pub fn decode_exact<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, CodecError> {
    let (value, rest) = postcard::take_from_bytes(bytes)?;
    if !rest.is_empty() {
        return Err(CodecError::DeserializeBadEncoding);
    }
    Ok(value)
}
