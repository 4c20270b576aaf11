//! Lock-free bounded handoff buffer for finished spans.
//!
//! Many threads finish spans concurrently; one (or more) reporter threads
//! drain them. Slots are claimed and published with a sequence-stamped
//! array in the classic bounded-queue arrangement: a producer claims a
//! slot by advancing `head` with a compare-and-swap, writes the value,
//! then publishes by storing the slot's sequence; consumers mirror the
//! protocol on `tail`. When the ring is full the span is dropped on the
//! spot and a counter is bumped, so finishing a span never blocks on a
//! slow reporter and the loss stays observable.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::trace::span::FinishedSpan;

struct Slot {
    sequence: AtomicUsize,
    value: UnsafeCell<MaybeUninit<FinishedSpan>>,
}

pub(crate) struct SpanRing {
    buffer: Box<[Slot]>,
    mask: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
    dropped: AtomicU64,
}

// Slot values are only touched between a successful sequence CAS and the
// matching sequence store, which hand ownership over exactly once.
unsafe impl Send for SpanRing {}
unsafe impl Sync for SpanRing {}

impl SpanRing {
    /// Creates a ring holding at least `capacity` spans, rounded up to a
    /// power of two (minimum 2).
    pub(crate) fn with_capacity(capacity: usize) -> SpanRing {
        let capacity = capacity.max(2).next_power_of_two();
        let buffer = (0..capacity)
            .map(|i| Slot {
                sequence: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        SpanRing {
            buffer,
            mask: capacity - 1,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Number of slots.
    pub(crate) fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Spans dropped because the ring was full.
    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Offers a finished span. Returns `false` (and counts a drop) when
    /// the ring is full.
    pub(crate) fn offer(&self, span: FinishedSpan) -> bool {
        let mut pos = self.head.load(Ordering::Relaxed);
        loop {
            let slot = &self.buffer[pos & self.mask];
            let sequence = slot.sequence.load(Ordering::Acquire);
            let difference = sequence as isize - pos as isize;

            if difference == 0 {
                match self
                    .head
                    .compare_exchange_weak(pos, pos.wrapping_add(1), Ordering::Relaxed, Ordering::Relaxed)
                {
                    Ok(_) => {
                        unsafe { (*slot.value.get()).write(span) };
                        slot.sequence.store(pos.wrapping_add(1), Ordering::Release);
                        return true;
                    }
                    Err(current) => pos = current,
                }
            } else if difference < 0 {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            } else {
                pos = self.head.load(Ordering::Relaxed);
            }
        }
    }

    /// Removes the oldest span, if any.
    pub(crate) fn pop(&self) -> Option<FinishedSpan> {
        let mut pos = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.buffer[pos & self.mask];
            let sequence = slot.sequence.load(Ordering::Acquire);
            let difference = sequence as isize - pos.wrapping_add(1) as isize;

            if difference == 0 {
                match self
                    .tail
                    .compare_exchange_weak(pos, pos.wrapping_add(1), Ordering::Relaxed, Ordering::Relaxed)
                {
                    Ok(_) => {
                        let span = unsafe { (*slot.value.get()).assume_init_read() };
                        slot.sequence
                            .store(pos.wrapping_add(self.mask + 1), Ordering::Release);
                        return Some(span);
                    }
                    Err(current) => pos = current,
                }
            } else if difference < 0 {
                return None;
            } else {
                pos = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Drains every span currently buffered. Safe against concurrent
    /// offers and other drains; each span is returned exactly once.
    pub(crate) fn drain(&self) -> Vec<FinishedSpan> {
        let mut drained = Vec::new();
        while let Some(span) = self.pop() {
            drained.push(span);
        }
        drained
    }
}

impl Drop for SpanRing {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::TagSet;
    use crate::trace::{Identifier, SamplingDecision, SpanKind, SpanPosition, Trace};
    use std::sync::Arc;
    use std::time::SystemTime;

    fn finished(n: u64) -> FinishedSpan {
        FinishedSpan {
            id: Identifier::from_bytes_8(n.to_be_bytes()),
            parent_id: Identifier::empty(),
            trace: Trace::new(Identifier::from_bytes_8([1; 8]), SamplingDecision::Sample),
            position: SpanPosition::Root,
            kind: SpanKind::Internal,
            operation_name: format!("op-{n}"),
            start: SystemTime::UNIX_EPOCH,
            finish: SystemTime::UNIX_EPOCH,
            tags: TagSet::empty(),
            metric_tags: TagSet::empty(),
            marks: Vec::new(),
            failure: None,
            track_metrics: false,
        }
    }

    #[test]
    fn offers_beyond_capacity_are_dropped_and_counted() {
        let ring = SpanRing::with_capacity(16);
        for n in 0..1000 {
            ring.offer(finished(n));
        }

        let drained = ring.drain();
        assert_eq!(drained.len(), 16);
        assert_eq!(ring.dropped(), 984);
        // The survivors are the earliest offers, in offer order.
        for (i, span) in drained.iter().enumerate() {
            assert_eq!(span.operation_name, format!("op-{i}"));
        }
    }

    #[test]
    fn drain_is_idempotent() {
        let ring = SpanRing::with_capacity(8);
        ring.offer(finished(1));
        ring.offer(finished(2));

        assert_eq!(ring.drain().len(), 2);
        assert_eq!(ring.drain().len(), 0);
    }

    #[test]
    fn capacity_rounds_up_to_a_power_of_two() {
        assert_eq!(SpanRing::with_capacity(10).capacity(), 16);
        assert_eq!(SpanRing::with_capacity(16).capacity(), 16);
        assert_eq!(SpanRing::with_capacity(0).capacity(), 2);
    }

    #[test]
    fn concurrent_offers_preserve_per_thread_order() {
        let ring = Arc::new(SpanRing::with_capacity(4096));
        let mut handles = Vec::new();
        for t in 0..4u64 {
            let ring = ring.clone();
            handles.push(std::thread::spawn(move || {
                for n in 0..500u64 {
                    assert!(ring.offer(finished(t * 1_000 + n)));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let drained = ring.drain();
        assert_eq!(drained.len(), 2_000);

        // Reconstruct per-thread sequences and check FIFO per producer.
        for t in 0..4u64 {
            let seen: Vec<u64> = drained
                .iter()
                .filter_map(|s| {
                    let id = u64::from_be_bytes(s.id.bytes().try_into().unwrap());
                    (id / 1_000 == t).then_some(id % 1_000)
                })
                .collect();
            assert_eq!(seen.len(), 500);
            assert!(seen.windows(2).all(|w| w[0] < w[1]), "thread {t} out of order");
        }
    }
}
