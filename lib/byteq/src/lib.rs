// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A lock-free single-producer single-consumer byte queue, backed by
//! borrowed memory.
//!
//! This is the hand-off point between the transport interrupt handler and
//! the protocol loop: the ISR pushes received bytes from one context, the
//! loop pops them from another, and neither side ever takes a lock or
//! disables interrupts.
//!
//! # Design goals
//!
//! 1. `no_std`, no allocation.
//! 2. Borrowed backing memory, so the queue can live in a named `static`
//!    for debug visibility rather than somewhere on a stack.
//! 3. Exactly one producer and one consumer, enforced by ownership: the
//!    queue is [`split`](ByteQueue::split) into two halves that can be moved
//!    to their respective contexts and cannot be cloned.
//! 4. Overflow is the producer's problem and is non-blocking: a push into a
//!    full queue drops the byte and bumps a counter. The ISR never waits.
//!
//! Non-goals: multi-producer use, chunked zero-copy access, being the
//! fastest queue ever.
//!
//! # Memory ordering
//!
//! The producer owns `head`, the consumer owns `tail`. A slot's contents are
//! published to the consumer by the Release store of `head` and observed via
//! the Acquire load on the other side (and symmetrically for slot reuse
//! through `tail`). One byte of capacity is sacrificed to distinguish full
//! from empty.

#![cfg_attr(not(test), no_std)]

use core::marker::PhantomData;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Error returned when the queue is too full to accept a byte.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct QueueFull;

/// The shared queue state. Create one, then [`split`](Self::split) it; the
/// queue itself has no push/pop operations.
pub struct ByteQueue<'s> {
    buf: *mut u8,
    len: usize,
    /// Next index the producer will write. Written only by the producer.
    head: AtomicUsize,
    /// Next index the consumer will read. Written only by the consumer.
    tail: AtomicUsize,
    /// Bytes dropped on overflow since creation.
    dropped: AtomicU32,
    _backing: PhantomData<&'s mut [u8]>,
}

// Safety: the raw pointer makes this !Sync by default. Concurrent access is
// sound because `split` hands out exactly one producer and one consumer,
// each index is stored by exactly one side, and slot contents are ordered by
// the Release/Acquire pairs on those indices.
unsafe impl Sync for ByteQueue<'_> {}
unsafe impl Send for ByteQueue<'_> {}

impl<'s> ByteQueue<'s> {
    /// Creates a queue over `backing`. One byte is reserved to tell full
    /// from empty, so the usable capacity is `backing.len() - 1`.
    pub fn new(backing: &'s mut [u8]) -> Self {
        assert!(backing.len() >= 2);
        Self {
            buf: backing.as_mut_ptr(),
            len: backing.len(),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            dropped: AtomicU32::new(0),
            _backing: PhantomData,
        }
    }

    /// Splits the queue into its producer and consumer halves. The `&mut`
    /// receiver guarantees nobody else holds a half while we mint the pair.
    pub fn split(&mut self) -> (Producer<'_, 's>, Consumer<'_, 's>) {
        let q = &*self;
        (Producer { q }, Consumer { q })
    }

    /// Number of bytes currently enqueued. Exact only when both sides are
    /// quiescent; otherwise a snapshot.
    pub fn available(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        if head >= tail {
            head - tail
        } else {
            head + self.len - tail
        }
    }

    /// Bytes dropped by the producer because the queue was full.
    pub fn dropped(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn wrap(&self, i: usize) -> usize {
        // Avoids a hardware-divide dependency; `i` is always < 2 * len.
        let n = i + 1;
        if n == self.len {
            0
        } else {
            n
        }
    }
}

/// The interrupt-context half: pushes bytes, never blocks.
pub struct Producer<'a, 's> {
    q: &'a ByteQueue<'s>,
}

impl Producer<'_, '_> {
    /// Enqueues one byte. On overflow the byte is dropped, the drop counter
    /// is bumped, and `Err(QueueFull)` tells the caller it happened.
    pub fn push(&mut self, byte: u8) -> Result<(), QueueFull> {
        let head = self.q.head.load(Ordering::Relaxed);
        let next = self.q.wrap(head);
        if next == self.q.tail.load(Ordering::Acquire) {
            self.q.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(QueueFull);
        }
        // Safety: `head` is in-bounds and this slot is not readable by the
        // consumer until the Release store below.
        unsafe {
            self.q.buf.add(head).write(byte);
        }
        self.q.head.store(next, Ordering::Release);
        Ok(())
    }

    /// Enqueues as much of `bytes` as fits; returns how many were accepted.
    pub fn push_all(&mut self, bytes: &[u8]) -> usize {
        for (i, &b) in bytes.iter().enumerate() {
            if self.push(b).is_err() {
                return i;
            }
        }
        bytes.len()
    }
}

/// The protocol-loop half: pops bytes.
pub struct Consumer<'a, 's> {
    q: &'a ByteQueue<'s>,
}

impl Consumer<'_, '_> {
    /// Dequeues one byte, or `None` if the queue is empty.
    pub fn pop(&mut self) -> Option<u8> {
        let tail = self.q.tail.load(Ordering::Relaxed);
        if tail == self.q.head.load(Ordering::Acquire) {
            return None;
        }
        // Safety: `tail` is in-bounds and the byte there was published by
        // the producer's Release store of `head`.
        let byte = unsafe { self.q.buf.add(tail).read() };
        self.q.tail.store(self.q.wrap(tail), Ordering::Release);
        Some(byte)
    }

    /// Pops up to `dest.len()` bytes into `dest`; returns how many.
    pub fn pop_into(&mut self, dest: &mut [u8]) -> usize {
        for (i, slot) in dest.iter_mut().enumerate() {
            match self.pop() {
                Some(b) => *slot = b,
                None => return i,
            }
        }
        dest.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_state() {
        let mut backing = [0; 16];
        let q = ByteQueue::new(&mut backing);
        assert_eq!(q.available(), 0);
        assert_eq!(q.dropped(), 0);
    }

    #[test]
    fn fifo_order() {
        let mut backing = [0; 16];
        let mut q = ByteQueue::new(&mut backing);
        let (mut tx, mut rx) = q.split();

        assert_eq!(tx.push_all(b"ABCDEF"), 6);
        for &expected in b"ABCDEF" {
            assert_eq!(rx.pop(), Some(expected));
        }
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn capacity_is_len_minus_one() {
        let mut backing = [0; 8];
        let mut q = ByteQueue::new(&mut backing);
        let (mut tx, _rx) = q.split();

        for i in 0..7 {
            tx.push(i).expect("should fit");
        }
        assert_eq!(tx.push(7), Err(QueueFull));
    }

    #[test]
    fn overflow_drops_and_counts() {
        let mut backing = [0; 4];
        let mut q = ByteQueue::new(&mut backing);
        {
            let (mut tx, _rx) = q.split();
            assert_eq!(tx.push_all(b"abcdef"), 3);
        }
        assert_eq!(q.dropped(), 1);
        let (_tx, mut rx) = q.split();
        let mut out = [0; 8];
        assert_eq!(rx.pop_into(&mut out), 3);
        assert_eq!(&out[..3], b"abc");
    }

    #[test]
    fn wraparound_preserves_data() {
        let mut backing = [0; 5];
        let mut q = ByteQueue::new(&mut backing);
        let (mut tx, mut rx) = q.split();

        // Cycle enough data through a tiny queue that every index wraps
        // several times.
        for round in 0u32..64 {
            let chunk = [round as u8, (round + 1) as u8, (round + 2) as u8];
            assert_eq!(tx.push_all(&chunk), 3);
            let mut out = [0; 3];
            assert_eq!(rx.pop_into(&mut out), 3);
            assert_eq!(out, chunk);
        }
    }

    #[test]
    fn cross_thread_stream() {
        // Producer thread pushes a known byte stream while the consumer
        // drains it; every byte must come out exactly once, in order.
        const COUNT: usize = 100_000;
        static mut BACKING: [u8; 64] = [0; 64];

        // Safety: test-local static, used by this test only.
        let backing = unsafe { &mut *core::ptr::addr_of_mut!(BACKING) };
        let mut q = ByteQueue::new(backing);
        let (mut tx, mut rx) = q.split();

        std::thread::scope(|s| {
            s.spawn(move || {
                for i in 0..COUNT {
                    let byte = (i % 251) as u8;
                    while tx.push(byte).is_err() {
                        std::hint::spin_loop();
                    }
                }
            });

            let mut received = 0usize;
            while received < COUNT {
                if let Some(b) = rx.pop() {
                    assert_eq!(b, (received % 251) as u8);
                    received += 1;
                } else {
                    std::hint::spin_loop();
                }
            }
        });
    }
}
