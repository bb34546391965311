//! Per-stream event queues.
//!
//! Nothing the [`Context`](crate::Context) does calls back into application
//! code. Whatever a stream reports is queued here, and the application drains
//! the queue with [`Context::poll_event`](crate::Context::poll_event) once the
//! call that produced the events has returned.

use std::collections::VecDeque;

use crate::stream::StreamState;

/// Something that happened to a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamEvent {
    StateChanged(StreamState),
    /// The server wants more playback data. Carries the total credit in bytes.
    Write(usize),
    /// Record data is available. Carries the readable size in bytes.
    Read(usize),
    Overflow,
    Underflow,
    /// A timing refresh completed, successfully or not.
    LatencyUpdate,
    /// The stream now runs on another device.
    Moved,
    /// The device was suspended or resumed.
    Suspended,
    /// Playback actually started on the device.
    Started,
}

#[derive(Debug, Default)]
pub(crate) struct EventQueue {
    events: VecDeque<StreamEvent>,
    closed: bool,
}

impl EventQueue {
    #[inline]
    pub(crate) fn push(&mut self, event: StreamEvent) {
        if self.closed {
            log::trace!("dropping {event:?} for unlinked stream");
            return;
        }

        self.events.push_back(event);
    }

    /// Rejects all further events. Queued ones can still be drained.
    #[inline(always)]
    pub(crate) fn close(&mut self) {
        self.closed = true;
    }

    #[inline(always)]
    pub(crate) fn pop(&mut self) -> Option<StreamEvent> {
        self.events.pop_front()
    }
}
