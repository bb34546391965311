//! Client side of the rill stream protocol.
//!
//! A [`Context`] represents one connection to an audio server and owns every
//! stream created on it. Each stream goes through a small state machine
//! (`Unconnected`, `Creating`, `Ready`, then `Failed` or `Terminated`) driven
//! by the application's calls and by the server's replies and notifications.
//!
//! ## Scope
//!
//! - Connecting playback, record and upload streams, and tearing them down.
//! - Playback writes, record reads and flow control credit.
//! - Control commands (cork, flush, drain, ...) tracked as [`Operation`]s.
//! - Reconciling the server's timing snapshots with locally issued writes,
//!   and interpolating the playback position between snapshots.
//!
//! Socket handling and authentication happen elsewhere: the context only
//! needs a [`Transport`] to send with, and is fed received frames through
//! [`Context::handle_message`].

pub mod config;
mod context;
mod dispatch;
pub mod error;
pub mod event;
mod notify;
pub mod operation;
pub mod stream;
pub mod timing;
pub mod transport;

pub use config::ClientConfig;
pub use context::{Context, ContextState};
pub use error::{Error, Result};
pub use event::StreamEvent;
pub use operation::{Completion, Operation, OperationState};
pub use stream::{Direction, Stream, StreamFlags, StreamKey, StreamState};
pub use timing::TimingInfo;
pub use transport::{Clock, FramedTransport, SystemClock, Transport};

pub use rill_proto;
pub use rill_utils;
