//! Bookkeeping of requests waiting for their reply.

use core::cmp;

use rustc_hash::FxBuildHasher;

use crate::{operation::Operation, stream::StreamKey};

type TagMap<V> = rustc_hash::FxHashMap<u32, V>;

/// Priority queue keyed by tag.
///
/// The priority is a `Reverse` deadline, so the earliest one pops first.
type TagPQ<V> = priority_queue::PriorityQueue<u32, V, FxBuildHasher>;

/// What a reply means once it arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReplyKind {
    /// Binds a new playback, record or upload stream.
    Create,
    /// Ends a stream, both on delete and on finishing an upload.
    Delete,
    /// Empty acknowledgement.
    Ack,
    Timing,
    BufferAttr,
    /// The rate is only committed once the server accepted it.
    SampleRate(u32),
}

#[derive(Debug)]
pub(crate) struct PendingReply {
    pub stream: StreamKey,
    pub kind: ReplyKind,
    pub op: Option<Operation>,
}

/// All replies a connection is waiting for, with their timeouts.
pub(crate) struct ReplyRegistry {
    pending: TagMap<PendingReply>,
    deadlines: TagPQ<cmp::Reverse<u64>>,
}

impl Default for ReplyRegistry {
    fn default() -> Self {
        Self {
            pending: TagMap::with_hasher(FxBuildHasher),
            deadlines: TagPQ::with_hasher(FxBuildHasher),
        }
    }
}

impl ReplyRegistry {
    pub(crate) fn register(&mut self, tag: u32, reply: PendingReply, deadline: u64) {
        self.pending.insert(tag, reply);
        self.deadlines.push(tag, cmp::Reverse(deadline));
    }

    pub(crate) fn take(&mut self, tag: u32) -> Option<PendingReply> {
        self.deadlines.remove(&tag);
        self.pending.remove(&tag)
    }

    /// Forgets every reply expected for `stream`, returning them.
    pub(crate) fn drop_stream(&mut self, stream: StreamKey) -> Vec<PendingReply> {
        let tags: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, r)| r.stream == stream)
            .map(|(&tag, _)| tag)
            .collect();

        tags.into_iter().filter_map(|tag| self.take(tag)).collect()
    }

    /// Pops the oldest reply whose deadline is at or before `now`.
    pub(crate) fn pop_expired(&mut self, now: u64) -> Option<(u32, PendingReply)> {
        while let Some((tag, _)) = self
            .deadlines
            .pop_if(|_, cmp::Reverse(deadline)| *deadline <= now)
        {
            if let Some(reply) = self.pending.remove(&tag) {
                return Some((tag, reply));
            }
        }

        None
    }

    #[inline]
    pub(crate) fn next_deadline(&self) -> Option<u64> {
        self.deadlines.peek().map(|(_, cmp::Reverse(d))| *d)
    }

    #[inline(always)]
    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}
