//! FIFO of queued outbound chunks, draining strictly front-to-back.
//!
//! Grounded on `stream.rs`'s `send_backlog: VecDeque<Vec<u8>>` plus its
//! `enqueue_front`/`enqueue_back`/`drain_backlog` trio, generalized to the
//! `{buffer, offset, len}` entry shape spec'd for the core (the teacher
//! drains with `Vec::drain`, which is equivalent to an implicit offset of
//! zero re-applied after every partial write; this keeps the offset
//! explicit so `bytes()` is O(1) instead of a sum over entries).

use std::collections::VecDeque;

struct Entry {
    buf: Vec<u8>,
    offset: usize,
}

impl Entry {
    #[inline]
    fn remaining(&self) -> &[u8] {
        &self.buf[self.offset..]
    }

    #[inline]
    fn len_remaining(&self) -> usize {
        self.buf.len() - self.offset
    }
}

/// Ordered backlog of not-yet-sent bytes for one handle. `bytes()` is kept
/// in sync incrementally and must always equal the sum of each entry's
/// remaining length (the write_queue_bytes invariant from the data model).
#[derive(Default)]
pub struct WriteQueue {
    entries: VecDeque<Entry>,
    bytes: usize,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn push_back(&mut self, buf: Vec<u8>) {
        if buf.is_empty() {
            return;
        }
        self.bytes += buf.len();
        self.entries.push_back(Entry { buf, offset: 0 });
    }

    /// Returns the bytes still owed from the front entry, if any.
    pub fn front(&self) -> Option<&[u8]> {
        self.entries.front().map(Entry::remaining)
    }

    /// Advances the front entry's consumed offset by `n` bytes, dropping it
    /// once fully consumed. `n` must not exceed the front entry's remaining
    /// length.
    pub fn consume_front(&mut self, n: usize) {
        let Some(front) = self.entries.front_mut() else { return };
        debug_assert!(n <= front.len_remaining());
        front.offset += n;
        self.bytes -= n;
        if front.offset == front.buf.len() {
            self.entries.pop_front();
        }
    }

    pub fn cleanup(&mut self) {
        self.entries.clear();
        self.bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_bytes_across_partial_consumption() {
        let mut q = WriteQueue::new();
        q.push_back(vec![1, 2, 3]);
        q.push_back(vec![4, 5]);
        assert_eq!(q.bytes(), 5);

        q.consume_front(2);
        assert_eq!(q.bytes(), 3);
        assert_eq!(q.front(), Some(&[3u8][..]));

        q.consume_front(1);
        assert_eq!(q.front(), Some(&[4u8, 5][..]));
        assert_eq!(q.bytes(), 2);

        q.consume_front(2);
        assert!(q.is_empty());
        assert_eq!(q.bytes(), 0);
    }

    #[test]
    fn cleanup_discards_everything() {
        let mut q = WriteQueue::new();
        q.push_back(vec![1, 2, 3]);
        q.cleanup();
        assert!(q.is_empty());
        assert_eq!(q.bytes(), 0);
    }
}
