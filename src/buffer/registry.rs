use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{namespace::Namespace, notification::same_object};

use super::event_buffer::{BufferError, BufferFilter, EventBuffer, FetchRequest, FetchResult};

/// Identifier of one sharer's claim on a buffer.
pub type SharerId = u64;

struct RegistryEntry {
    namespace: Arc<dyn Namespace>,
    buffer: Arc<EventBuffer>,
    sharers: HashMap<SharerId, usize>,
}

impl RegistryEntry {
    fn effective_capacity(&self) -> Option<usize> {
        self.sharers.values().copied().max()
    }
}

/// Maps each namespace to one shared [`EventBuffer`].
///
/// Created at application startup and torn down with [`BufferRegistry::shutdown`].
/// Its lock is always taken before a buffer's own lock, never the reverse.
pub struct BufferRegistry {
    entries: Mutex<Vec<RegistryEntry>>,
    next_sharer: AtomicU64,
}

impl BufferRegistry {
    /// Creates an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(Vec::new()),
            next_sharer: AtomicU64::new(1),
        })
    }

    /// Adds a sharer for `namespace`, creating and attaching the buffer on
    /// first use. The buffer's capacity becomes the largest requested one.
    pub fn acquire(
        self: &Arc<Self>,
        namespace: &Arc<dyn Namespace>,
        capacity: usize,
    ) -> Result<SharedBuffer, BufferError> {
        if capacity == 0 {
            return Err(BufferError::InvalidArgument("requested capacity must be at least 1".to_string()));
        }
        let sharer = self.next_sharer.fetch_add(1, Ordering::Relaxed);

        let (buffer, created) = {
            let mut entries = self.entries.lock();
            let existing = entries
                .iter()
                .position(|e| same_object(&e.namespace, namespace));
            let (index, created) = match existing {
                Some(index) => (index, false),
                None => {
                    entries.push(RegistryEntry {
                        namespace: Arc::clone(namespace),
                        buffer: EventBuffer::new(Arc::clone(namespace), capacity)?,
                        sharers: HashMap::new(),
                    });
                    (entries.len() - 1, true)
                }
            };
            let entry = &mut entries[index];
            entry.sharers.insert(sharer, capacity);
            let effective = entry.effective_capacity().unwrap_or(capacity);
            entry.buffer.set_capacity(effective)?;
            debug!(sharer, capacity, effective, sharers = entry.sharers.len(), "buffer sharer added");
            (Arc::clone(&entry.buffer), created)
        };

        let shared = SharedBuffer {
            registry: Arc::clone(self),
            buffer,
            sharer,
            requested_capacity: capacity,
            released: AtomicBool::new(false),
        };
        if created {
            // Dropping `shared` on failure releases the sharer.
            shared.buffer.attach_to_namespace()?;
        }
        Ok(shared)
    }

    /// Number of live shared buffers.
    pub fn buffer_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Disposes every buffer. Existing [`SharedBuffer`] handles keep
    /// answering fetches with empty, disposed results.
    pub fn shutdown(&self) {
        let entries = std::mem::take(&mut *self.entries.lock());
        for entry in entries {
            entry.buffer.dispose();
        }
    }

    fn release(&self, sharer: SharerId, buffer: &Arc<EventBuffer>) {
        let disposed = {
            let mut entries = self.entries.lock();
            let Some(index) = entries.iter().position(|e| Arc::ptr_eq(&e.buffer, buffer)) else {
                return;
            };
            let entry = &mut entries[index];
            entry.sharers.remove(&sharer);
            match entry.effective_capacity() {
                Some(effective) => {
                    if let Err(err) = entry.buffer.set_capacity(effective) {
                        warn!(%err, effective, "failed to resize shared buffer");
                    }
                    false
                }
                None => {
                    entries.swap_remove(index);
                    buffer.mark_disposed()
                }
            }
        };
        if disposed {
            debug!(sharer, "last sharer released; buffer disposed");
            buffer.detach_from_namespace();
        }
    }
}

/// One sharer's handle on a registry-owned [`EventBuffer`].
///
/// Releasing the handle (explicitly or on drop) removes the sharer; the last
/// release disposes the buffer.
pub struct SharedBuffer {
    registry: Arc<BufferRegistry>,
    buffer: Arc<EventBuffer>,
    sharer: SharerId,
    requested_capacity: usize,
    released: AtomicBool,
}

impl SharedBuffer {
    /// The shared buffer.
    pub fn buffer(&self) -> &Arc<EventBuffer> {
        &self.buffer
    }

    /// Identity of this claim.
    pub fn sharer_id(&self) -> SharerId {
        self.sharer
    }

    /// Capacity this sharer asked for.
    pub fn requested_capacity(&self) -> usize {
        self.requested_capacity
    }

    /// Fetches from the shared buffer.
    pub async fn fetch(&self, filter: &dyn BufferFilter, request: FetchRequest) -> Result<FetchResult, BufferError> {
        self.buffer.fetch(filter, request).await
    }

    /// Removes this sharer. Idempotent.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.registry.release(self.sharer, &self.buffer);
        }
    }
}

impl Drop for SharedBuffer {
    fn drop(&mut self) {
        self.release();
    }
}
