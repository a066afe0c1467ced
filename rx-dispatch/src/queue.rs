//! Per-thread batch queue with chain folding
//!
//! A producer notification may carry many packets linked through `next`.
//! Rather than queueing one entry per packet, the batch is folded into a
//! single entry: the head's `next` link is parked in its `ext_list` slot and
//! the entry remembers how many packets it stands for. Dequeue reverses the
//! move so the consumer sees the flat chain the producer built.
//!
//! The head's `ext_list` can only be borrowed when it is free. Leading packets
//! that carry their own fragments are therefore queued one by one first.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::buffer::{BufferChain, PacketBatch, PacketBuffer};

/// One queue slot: a head buffer plus, when `element_count > 1`, the rest of
/// its batch parked in `head.ext_list`.
struct QueuedBatch {
    ring_id: u8,
    peer_local_id: u32,
    element_count: u32,
    head: Box<PacketBuffer>,
}

impl QueuedBatch {
    fn unfold(self) -> PacketBatch {
        let QueuedBatch {
            ring_id,
            peer_local_id,
            element_count,
            mut head,
        } = self;
        if element_count > 1 {
            head.next = head.ext_list.take();
        }
        PacketBatch::from_parts(
            ring_id,
            peer_local_id,
            element_count,
            BufferChain::from_head(Some(head)),
        )
    }
}

struct QueueInner {
    entries: VecDeque<QueuedBatch>,
    closed: bool,
}

/// Outcome of a successful push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PushInfo {
    /// Packets accepted
    pub elements: u32,
    /// Queue length (entries) right after the push
    pub queue_len: usize,
}

/// Multi-producer, single-consumer FIFO of folded batches.
pub(crate) struct BatchQueue {
    inner: Mutex<QueueInner>,
}

impl BatchQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                entries: VecDeque::new(),
                closed: false,
            }),
        }
    }

    /// Fold `batch` and append it. A closed queue hands the batch back.
    pub fn push(&self, batch: PacketBatch) -> Result<PushInfo, PacketBatch> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(batch);
        }

        let ring_id = batch.ring_id();
        let peer_local_id = batch.peer_local_id();
        let elements = batch.element_count();
        let mut remaining = elements;
        let mut head = batch.into_chain().into_head();

        // Packets with their own fragments can't host the continuation.
        while let Some(mut buf) = head.take_if(|buf| buf.ext_list.is_some()) {
            head = buf.next.take();
            remaining = remaining.saturating_sub(1);
            inner.entries.push_back(QueuedBatch {
                ring_id,
                peer_local_id,
                element_count: 1,
                head: buf,
            });
        }

        if let Some(mut buf) = head {
            buf.ext_list = buf.next.take();
            inner.entries.push_back(QueuedBatch {
                ring_id,
                peer_local_id,
                element_count: remaining,
                head: buf,
            });
        }

        Ok(PushInfo {
            elements,
            queue_len: inner.entries.len(),
        })
    }

    /// Take the oldest entry and restore its flat chain
    pub fn pop(&self) -> Option<PacketBatch> {
        let entry = self.inner.lock().entries.pop_front()?;
        Some(entry.unfold())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Remove every queued entry for `peer_local_id`; returns packets removed
    pub fn flush_peer(&self, peer_local_id: u32) -> u64 {
        let removed: Vec<QueuedBatch> = {
            let mut inner = self.inner.lock();
            let (removed, kept): (VecDeque<_>, VecDeque<_>) = inner
                .entries
                .drain(..)
                .partition(|entry| entry.peer_local_id == peer_local_id);
            inner.entries = kept;
            removed.into()
        };
        // Buffers are freed outside the lock.
        removed.iter().map(|e| u64::from(e.element_count)).sum()
    }

    /// Reject further pushes and return the packet count left behind
    pub fn close_and_flush(&self) -> u64 {
        let removed: VecDeque<QueuedBatch> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            std::mem::take(&mut inner.entries)
        };
        removed.iter().map(|e| u64::from(e.element_count)).sum()
    }
}
