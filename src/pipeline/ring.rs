//! Fixed-capacity ring buffer for the ingress-to-egress pipeline.
//!
//! Capacity is rounded up to the next power of two so index arithmetic is a
//! bitmask. Push never blocks: a full ring rejects the tick and the caller
//! counts the drop. Both indices live behind one short `parking_lot::Mutex`
//! critical section; handler tasks may run on different runtime threads, so
//! the single-producer assumption of a bare unsynchronized ring does not hold
//! here.

use parking_lot::Mutex;

use crate::models::Tick;

struct RingInner {
    slots: Vec<Option<Tick>>,
    write: usize,
    read: usize,
}

pub struct SpscRing {
    inner: Mutex<RingInner>,
    capacity: usize,
    mask: usize,
}

impl SpscRing {
    /// Create a ring with at least `capacity` slots (rounded up to a power
    /// of two). One slot is kept free to distinguish full from empty, so the
    /// usable capacity is `capacity() - 1`.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            inner: Mutex::new(RingInner {
                slots,
                write: 0,
                read: 0,
            }),
            capacity,
            mask: capacity - 1,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.write.wrapping_sub(inner.read) & self.mask
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock();
        inner.write == inner.read
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity - 1
    }

    /// Store a tick, returning false when the ring is full.
    pub fn push(&self, tick: Tick) -> bool {
        let mut inner = self.inner.lock();
        let next_write = (inner.write + 1) & self.mask;
        if next_write == inner.read {
            return false;
        }
        let write = inner.write;
        inner.slots[write] = Some(tick);
        inner.write = next_write;
        true
    }

    /// Remove the oldest tick, clearing its slot.
    pub fn pop(&self) -> Option<Tick> {
        let mut inner = self.inner.lock();
        Self::pop_locked(&mut inner, self.mask)
    }

    /// Pop up to `max` ticks in push order.
    pub fn pop_batch(&self, max: usize) -> Vec<Tick> {
        let mut inner = self.inner.lock();
        let available = inner.write.wrapping_sub(inner.read) & self.mask;
        let count = max.min(available);
        let mut batch = Vec::with_capacity(count);
        for _ in 0..count {
            match Self::pop_locked(&mut inner, self.mask) {
                Some(tick) => batch.push(tick),
                None => break,
            }
        }
        batch
    }

    #[inline]
    fn pop_locked(inner: &mut RingInner, mask: usize) -> Option<Tick> {
        if inner.read == inner.write {
            return None;
        }
        let read = inner.read;
        let tick = inner.slots[read].take();
        inner.read = (read + 1) & mask;
        tick
    }
}
