use thiserror::Error;

/// Ring buffer failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RingError {
    /// Append on a full ring.
    #[error("ring buffer is full (capacity {0})")]
    Full(usize),
    /// Removal from an empty ring.
    #[error("ring buffer is empty")]
    Empty,
    /// Index at or past the live length.
    #[error("index {index} out of range for ring of length {len}")]
    OutOfRange {
        /// Requested position.
        index: usize,
        /// Live length.
        len: usize,
    },
    /// Resize below the live length.
    #[error("resize to {capacity} would drop {len} live elements")]
    WouldTruncate {
        /// Live length.
        len: usize,
        /// Requested capacity.
        capacity: usize,
    },
    /// Capacity of zero.
    #[error("ring capacity must be at least 1")]
    ZeroCapacity,
    /// Capacity whose slot count does not fit in `usize`.
    #[error("ring capacity {0} is too large")]
    TooLarge(usize),
}

/// Fixed-capacity circular store.
///
/// Holds `capacity + 1` slots so that `head == tail` means empty and
/// `tail + 1 == head` means full, without a separate counter.
#[derive(Debug)]
pub struct RingBuffer<T> {
    slots: Vec<Option<T>>,
    head: usize,
    tail: usize,
}

impl<T> RingBuffer<T> {
    /// Creates an empty ring holding up to `capacity` elements.
    pub fn new(capacity: usize) -> Result<Self, RingError> {
        Ok(Self {
            slots: empty_slots(slot_count(capacity)?),
            head: 0,
            tail: 0,
        })
    }

    /// Most elements the ring holds.
    pub fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    /// Live element count.
    pub fn len(&self) -> usize {
        let n = self.slots.len();
        (self.tail + n - self.head) % n
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// True when an append would fail.
    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// Stores `item` as the newest element.
    pub fn append(&mut self, item: T) -> Result<(), RingError> {
        if self.is_full() {
            return Err(RingError::Full(self.capacity()));
        }
        self.slots[self.tail] = Some(item);
        self.tail = (self.tail + 1) % self.slots.len();
        Ok(())
    }

    /// Takes the oldest element out.
    pub fn remove_oldest(&mut self) -> Result<T, RingError> {
        if self.is_empty() {
            return Err(RingError::Empty);
        }
        let item = self.slots[self.head].take().ok_or(RingError::Empty)?;
        self.head = (self.head + 1) % self.slots.len();
        Ok(item)
    }

    /// Element at logical position `index`, oldest first.
    pub fn get(&self, index: usize) -> Result<&T, RingError> {
        let len = self.len();
        if index >= len {
            return Err(RingError::OutOfRange { index, len });
        }
        let slot = (self.head + index) % self.slots.len();
        self.slots[slot]
            .as_ref()
            .ok_or(RingError::OutOfRange { index, len })
    }

    /// Moves live elements into a fresh store of `capacity + 1` slots.
    ///
    /// Callers shrink by removing the oldest entries first; this never drops.
    pub fn resize(&mut self, capacity: usize) -> Result<(), RingError> {
        let slots = slot_count(capacity)?;
        let len = self.len();
        if capacity < len {
            return Err(RingError::WouldTruncate { len, capacity });
        }
        if capacity == self.capacity() {
            return Ok(());
        }

        let mut slots = empty_slots(slots);
        for (i, slot) in slots.iter_mut().take(len).enumerate() {
            let from = (self.head + i) % self.slots.len();
            *slot = self.slots[from].take();
        }
        self.slots = slots;
        self.head = 0;
        self.tail = len;
        Ok(())
    }

    /// Live elements, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.len()).filter_map(move |i| self.get(i).ok())
    }
}

fn slot_count(capacity: usize) -> Result<usize, RingError> {
    if capacity == 0 {
        return Err(RingError::ZeroCapacity);
    }
    capacity.checked_add(1).ok_or(RingError::TooLarge(capacity))
}

fn empty_slots<T>(n: usize) -> Vec<Option<T>> {
    std::iter::repeat_with(|| None).take(n).collect()
}
