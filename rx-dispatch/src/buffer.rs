//! Packet buffers, owned buffer chains and packet batches
//!
//! A `BufferChain` is a singly linked list of `PacketBuffer`s joined through
//! their `next` link. Every buffer also has an extension list (`ext_list`):
//! for a fragmented packet it holds the fragment chain, and while a batch sits
//! in a `BatchQueue` the head buffer may use it to hold the folded rest of the
//! batch instead.
//!
//! Ownership rules:
//! - the producer builds the chain
//! - the queue owns it while queued
//! - the rx thread, then the delivery callback, owns it after dequeue

use std::fmt;

/// One received packet.
pub struct PacketBuffer {
    data: Vec<u8>,
    pub(crate) next: Option<Box<PacketBuffer>>,
    pub(crate) ext_list: Option<Box<PacketBuffer>>,
}

impl PacketBuffer {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            next: None,
            ext_list: None,
        }
    }

    /// Create a packet whose payload continues in `fragments`
    pub fn with_fragments(data: Vec<u8>, fragments: BufferChain) -> Self {
        Self {
            data,
            next: None,
            ext_list: fragments.into_head(),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn has_fragments(&self) -> bool {
        self.ext_list.is_some()
    }

    /// Iterate over the fragment chain
    pub fn fragments(&self) -> Iter<'_> {
        Iter {
            cur: self.ext_list.as_deref(),
        }
    }
}

impl Drop for PacketBuffer {
    fn drop(&mut self) {
        // Unlink iteratively so long chains don't recurse.
        let mut next = self.next.take();
        while let Some(mut buf) = next {
            next = buf.next.take();
        }
    }
}

impl fmt::Debug for PacketBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketBuffer")
            .field("len", &self.data.len())
            .field("fragments", &self.fragments().count())
            .field("has_next", &self.next.is_some())
            .finish()
    }
}

/// Exclusively owned chain of packet buffers.
#[derive(Default)]
pub struct BufferChain {
    head: Option<Box<PacketBuffer>>,
}

impl BufferChain {
    pub fn new() -> Self {
        Self { head: None }
    }

    pub(crate) fn from_head(head: Option<Box<PacketBuffer>>) -> Self {
        Self { head }
    }

    pub(crate) fn into_head(self) -> Option<Box<PacketBuffer>> {
        self.head
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Number of packets linked through `next` (fragments not counted)
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Number of buffers including every packet's fragments
    pub fn buffer_count(&self) -> usize {
        self.iter().map(|buf| 1 + buf.fragments().count()).sum()
    }

    pub fn head(&self) -> Option<&PacketBuffer> {
        self.head.as_deref()
    }

    pub fn push_front(&mut self, buf: PacketBuffer) {
        let mut buf = Box::new(buf);
        buf.next = self.head.take();
        self.head = Some(buf);
    }

    /// Link an independent chain after the last packet of this one
    pub fn append(&mut self, other: BufferChain) {
        let mut cursor = &mut self.head;
        while let Some(buf) = cursor {
            cursor = &mut buf.next;
        }
        *cursor = other.into_head();
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter {
            cur: self.head.as_deref(),
        }
    }
}

impl fmt::Debug for BufferChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferChain")
            .field("len", &self.len())
            .finish()
    }
}

impl FromIterator<PacketBuffer> for BufferChain {
    fn from_iter<I: IntoIterator<Item = PacketBuffer>>(iter: I) -> Self {
        let buffers: Vec<PacketBuffer> = iter.into_iter().collect();
        let mut chain = BufferChain::new();
        for buf in buffers.into_iter().rev() {
            chain.push_front(buf);
        }
        chain
    }
}

/// Borrowing iterator over a chain's packets.
pub struct Iter<'a> {
    cur: Option<&'a PacketBuffer>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a PacketBuffer;

    fn next(&mut self) -> Option<Self::Item> {
        let buf = self.cur?;
        self.cur = buf.next.as_deref();
        Some(buf)
    }
}

/// Consuming iterator; yields each packet unlinked from the rest.
pub struct IntoIter {
    head: Option<Box<PacketBuffer>>,
}

impl Iterator for IntoIter {
    type Item = PacketBuffer;

    fn next(&mut self) -> Option<Self::Item> {
        let mut buf = self.head.take()?;
        self.head = buf.next.take();
        Some(*buf)
    }
}

impl IntoIterator for BufferChain {
    type Item = PacketBuffer;
    type IntoIter = IntoIter;

    fn into_iter(self) -> IntoIter {
        IntoIter { head: self.head }
    }
}

impl<'a> IntoIterator for &'a BufferChain {
    type Item = &'a PacketBuffer;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Iter<'a> {
        self.iter()
    }
}

/// Packets handed over by one producer notification.
#[derive(Debug)]
pub struct PacketBatch {
    ring_id: u8,
    peer_local_id: u32,
    element_count: u32,
    chain: BufferChain,
}

impl PacketBatch {
    /// Create a batch; `element_count` is taken from the chain length
    pub fn new(ring_id: u8, peer_local_id: u32, chain: BufferChain) -> Self {
        let element_count = u32::try_from(chain.len()).unwrap_or(u32::MAX);
        Self {
            ring_id,
            peer_local_id,
            element_count,
            chain,
        }
    }

    pub(crate) fn from_parts(
        ring_id: u8,
        peer_local_id: u32,
        element_count: u32,
        chain: BufferChain,
    ) -> Self {
        Self {
            ring_id,
            peer_local_id,
            element_count,
            chain,
        }
    }

    pub fn ring_id(&self) -> u8 {
        self.ring_id
    }

    pub fn peer_local_id(&self) -> u32 {
        self.peer_local_id
    }

    pub fn element_count(&self) -> u32 {
        self.element_count
    }

    pub fn chain(&self) -> &BufferChain {
        &self.chain
    }

    pub fn into_chain(self) -> BufferChain {
        self.chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(values: &[u8]) -> BufferChain {
        values.iter().map(|v| PacketBuffer::new(vec![*v])).collect()
    }

    fn contents(chain: &BufferChain) -> Vec<u8> {
        chain.iter().map(|b| b.data()[0]).collect()
    }

    #[test]
    fn test_collect_preserves_order() {
        let c = chain(&[1, 2, 3]);
        assert_eq!(c.len(), 3);
        assert_eq!(contents(&c), vec![1, 2, 3]);
        assert!(!c.is_empty());
        assert!(BufferChain::new().is_empty());
    }

    #[test]
    fn test_append_joins_independent_chains() {
        let mut a = chain(&[1, 2]);
        a.append(chain(&[3]));
        a.append(BufferChain::new());
        a.append(chain(&[4, 5]));
        assert_eq!(contents(&a), vec![1, 2, 3, 4, 5]);

        let mut empty = BufferChain::new();
        empty.append(chain(&[9]));
        assert_eq!(contents(&empty), vec![9]);
    }

    #[test]
    fn test_into_iter_unlinks() {
        let bufs: Vec<PacketBuffer> = chain(&[1, 2, 3]).into_iter().collect();
        assert_eq!(bufs.len(), 3);
        assert!(bufs.iter().all(|b| b.next.is_none()));
    }

    #[test]
    fn test_fragments() {
        let buf = PacketBuffer::with_fragments(vec![0; 4], chain(&[7, 8]));
        assert!(buf.has_fragments());
        assert_eq!(buf.fragments().map(|b| b.data()[0]).collect::<Vec<_>>(), vec![7, 8]);
        assert!(!PacketBuffer::new(vec![1]).has_fragments());

        let mut c = BufferChain::new();
        c.push_front(PacketBuffer::new(vec![1]));
        c.push_front(buf);
        assert_eq!(c.len(), 2);
        assert_eq!(c.buffer_count(), 4);
    }

    #[test]
    fn test_long_chain_drop() {
        let c: BufferChain = (0..200_000).map(|_| PacketBuffer::new(Vec::new())).collect();
        assert_eq!(c.len(), 200_000);
        drop(c);
    }

    #[test]
    fn test_batch_counts_elements() {
        let batch = PacketBatch::new(1, 42, chain(&[1, 2, 3]));
        assert_eq!(batch.ring_id(), 1);
        assert_eq!(batch.peer_local_id(), 42);
        assert_eq!(batch.element_count(), 3);
        assert_eq!(batch.into_chain().len(), 3);
    }
}
