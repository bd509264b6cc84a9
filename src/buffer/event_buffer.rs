use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::{sync::Notify, time::Instant};
use tracing::{debug, error};

use crate::{
    core::ring::{RingBuffer, RingError},
    namespace::{Namespace, NamespaceError},
    notification::{
        Handback, Notification, NotificationListener, SequencedEvent, TargetedEvent, now_ms,
    },
    types::{ObjectPattern, SeqNum},
};

use super::attach::AttachState;

/// Event buffer failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    /// Caller-supplied value out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Operation on a disposed buffer.
    #[error("buffer has been disposed")]
    Disposed,
    /// Underlying ring failure.
    #[error(transparent)]
    Ring(#[from] RingError),
    /// Namespace failure while attaching.
    #[error(transparent)]
    Namespace(#[from] NamespaceError),
}

// Roughly thirty years; keeps `Instant + timeout` from overflowing.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Parameters of one long-poll fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRequest {
    /// First sequence number the caller has not seen. Negative means
    /// "report the current bounds only".
    pub start_seq: SeqNum,
    /// How long to wait when nothing matching is available.
    pub timeout: Duration,
    /// Upper bound on matched candidate events.
    pub max_count: usize,
}

impl FetchRequest {
    /// Builds a request.
    pub fn new(start_seq: SeqNum, timeout: Duration, max_count: usize) -> Self {
        Self {
            start_seq,
            timeout,
            max_count,
        }
    }

    /// Validates signed wire values.
    pub fn from_raw(start_seq: SeqNum, timeout_ms: i64, max_count: i64) -> Result<Self, BufferError> {
        if timeout_ms < 0 {
            return Err(BufferError::InvalidArgument(format!("negative timeout: {timeout_ms}")));
        }
        let max_count = usize::try_from(max_count)
            .map_err(|_| BufferError::InvalidArgument(format!("negative max count: {max_count}")))?;
        Ok(Self::new(start_seq, Duration::from_millis(timeout_ms as u64), max_count))
    }
}

/// Outcome of a fetch.
#[derive(Debug, Clone)]
pub struct FetchResult {
    /// Earliest sequence number still retained. Greater than the request's
    /// start when events were evicted before the caller could see them.
    pub earliest_seq: SeqNum,
    /// Cursor to pass as `start_seq` on the next fetch.
    pub next_seq: SeqNum,
    /// Matched events in sequence order.
    pub events: Vec<TargetedEvent>,
    /// Set once the buffer has been disposed; the result is then empty.
    pub disposed: bool,
}

impl FetchResult {
    /// Number of events lost between `cursor` and this result.
    pub fn missed_since(&self, cursor: SeqNum) -> u64 {
        if cursor < 0 {
            return 0;
        }
        u64::try_from(self.earliest_seq - cursor).unwrap_or(0)
    }
}

/// Selects which registrations a buffered event is delivered to.
///
/// Called outside the buffer lock, once per candidate. A candidate that
/// pushes nothing is skipped without counting against the fetch limit.
pub trait BufferFilter: Send + Sync {
    /// Pushes one entry per registration `event` is delivered to.
    fn apply(&self, event: &SequencedEvent, out: &mut Vec<TargetedEvent>);
}

impl<F> BufferFilter for F
where
    F: Fn(&SequencedEvent, &mut Vec<TargetedEvent>) + Send + Sync,
{
    fn apply(&self, event: &SequencedEvent, out: &mut Vec<TargetedEvent>) {
        self(event, out)
    }
}

struct BufferState {
    queue: RingBuffer<SequencedEvent>,
    earliest_seq: SeqNum,
    next_seq: SeqNum,
    disposed: bool,
}

impl BufferState {
    fn evict_oldest(&mut self) -> bool {
        if self.queue.remove_oldest().is_ok() {
            self.earliest_seq += 1;
            true
        } else {
            false
        }
    }
}

/// Bounded, sequence-numbered event store with long-poll fetch.
///
/// Producers call [`EventBuffer::append`] from any thread; fetchers wait on
/// [`EventBuffer::fetch`] until an event passes their filter, the timeout
/// elapses, or the buffer is disposed.
pub struct EventBuffer {
    state: Mutex<BufferState>,
    changed: Notify,
    pub(super) namespace: Arc<dyn Namespace>,
    pub(super) pattern: ObjectPattern,
    pub(super) attach: Mutex<AttachState>,
    pub(super) feed: Arc<dyn NotificationListener>,
    pub(super) lifecycle: Arc<dyn NotificationListener>,
}

impl EventBuffer {
    /// Creates a buffer whose sequence numbers start at the current time in
    /// milliseconds.
    pub fn new(namespace: Arc<dyn Namespace>, capacity: usize) -> Result<Arc<Self>, BufferError> {
        Self::starting_at(namespace, capacity, now_ms() as SeqNum)
    }

    /// Creates a buffer whose first appended event gets `first_seq`.
    pub fn starting_at(
        namespace: Arc<dyn Namespace>,
        capacity: usize,
        first_seq: SeqNum,
    ) -> Result<Arc<Self>, BufferError> {
        if first_seq < 0 {
            return Err(BufferError::InvalidArgument(format!("negative first sequence: {first_seq}")));
        }
        let queue = RingBuffer::new(capacity)?;
        Ok(Arc::new_cyclic(|weak: &Weak<Self>| Self {
            state: Mutex::new(BufferState {
                queue,
                earliest_seq: first_seq,
                next_seq: first_seq,
                disposed: false,
            }),
            changed: Notify::new(),
            namespace,
            pattern: ObjectPattern::any(),
            attach: Mutex::new(AttachState::default()),
            feed: Arc::new(Feed {
                buffer: weak.clone(),
            }),
            lifecycle: Arc::new(Lifecycle {
                buffer: weak.clone(),
            }),
        }))
    }

    /// Current capacity.
    pub fn capacity(&self) -> usize {
        self.state.lock().queue.capacity()
    }

    /// Retained event count.
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// True when nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    /// Sequence number of the oldest retained event.
    pub fn earliest_seq(&self) -> SeqNum {
        self.state.lock().earliest_seq
    }

    /// Sequence number the next append receives.
    pub fn next_seq(&self) -> SeqNum {
        self.state.lock().next_seq
    }

    /// True once disposed.
    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    /// Inserts `event`, evicting the oldest entries first when full.
    pub fn append(&self, event: SequencedEvent) {
        {
            let mut st = self.state.lock();
            while st.queue.is_full() {
                if !st.evict_oldest() {
                    break;
                }
            }
            if let Err(err) = st.queue.append(event) {
                error!(%err, "event buffer rejected append");
                return;
            }
            st.next_seq += 1;
        }
        self.changed.notify_waiters();
    }

    /// Changes the capacity, evicting exactly enough of the oldest entries to
    /// fit. Growing never evicts.
    pub fn set_capacity(&self, capacity: usize) -> Result<(), BufferError> {
        if capacity == 0 {
            return Err(BufferError::InvalidArgument("capacity must be at least 1".to_string()));
        }
        let mut st = self.state.lock();
        let mut evicted = 0usize;
        while st.queue.len() > capacity {
            if !st.evict_oldest() {
                break;
            }
            evicted += 1;
        }
        st.queue.resize(capacity)?;
        if evicted > 0 {
            debug!(capacity, evicted, earliest_seq = st.earliest_seq, "event buffer shrunk");
        }
        Ok(())
    }

    /// Disposes the buffer and detaches it from the namespace. Idempotent.
    pub fn dispose(&self) {
        if self.mark_disposed() {
            self.detach_from_namespace();
        }
    }

    /// Flags the buffer disposed and wakes every waiting fetch. Returns true
    /// on the first call only.
    pub(super) fn mark_disposed(&self) -> bool {
        let first = {
            let mut st = self.state.lock();
            !std::mem::replace(&mut st.disposed, true)
        };
        if first {
            self.changed.notify_waiters();
        }
        first
    }

    /// Long-poll fetch of events at or after `request.start_seq`.
    pub async fn fetch(&self, filter: &dyn BufferFilter, request: FetchRequest) -> Result<FetchResult, BufferError> {
        let FetchRequest {
            start_seq,
            timeout,
            max_count,
        } = request;
        let deadline = Instant::now()
            .checked_add(timeout)
            .unwrap_or_else(|| Instant::now() + FAR_FUTURE);

        let scan_earliest = {
            let st = self.state.lock();
            if start_seq > st.next_seq {
                return Err(BufferError::InvalidArgument(format!(
                    "start sequence {start_seq} is beyond next sequence {}",
                    st.next_seq
                )));
            }
            if start_seq < 0 || st.disposed {
                return Ok(FetchResult {
                    earliest_seq: st.earliest_seq,
                    next_seq: st.next_seq,
                    events: Vec::new(),
                    disposed: st.disposed,
                });
            }
            st.earliest_seq
        };

        let mut cursor = start_seq;
        let mut events = Vec::new();
        let mut scratch = Vec::new();
        let mut matched = 0usize;
        let mut earliest;

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let candidate = {
                let st = self.state.lock();
                earliest = st.earliest_seq;
                if st.disposed {
                    return Ok(FetchResult {
                        earliest_seq: earliest,
                        next_seq: cursor,
                        events: Vec::new(),
                        disposed: true,
                    });
                }
                if cursor < earliest {
                    if events.is_empty() {
                        debug!(start_seq, cursor, earliest, "fetch cursor fell behind eviction");
                        return Ok(FetchResult {
                            earliest_seq: earliest,
                            next_seq: earliest,
                            events,
                            disposed: false,
                        });
                    }
                    // Report what was collected; the next fetch sees the gap.
                    return Ok(FetchResult {
                        earliest_seq: scan_earliest.min(start_seq),
                        next_seq: cursor,
                        events,
                        disposed: false,
                    });
                }
                if cursor < st.next_seq {
                    let index = (cursor - earliest) as usize;
                    Some(st.queue.get(index)?.clone())
                } else {
                    None
                }
            };

            match candidate {
                Some(event) => {
                    scratch.clear();
                    filter.apply(&event, &mut scratch);
                    if !scratch.is_empty() {
                        if matched == max_count {
                            break;
                        }
                        matched += 1;
                        events.append(&mut scratch);
                    }
                    cursor += 1;
                    if max_count > 0 && matched == max_count {
                        break;
                    }
                }
                None if !events.is_empty() || max_count == 0 => break,
                None => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        break;
                    }
                }
            }
        }

        Ok(FetchResult {
            earliest_seq: earliest.min(start_seq),
            next_seq: cursor,
            events,
            disposed: false,
        })
    }
}

// Appends every notification from an attached member.
struct Feed {
    buffer: Weak<EventBuffer>,
}

impl NotificationListener for Feed {
    fn handle_notification(&self, notification: &Notification, _handback: Option<&Handback>) {
        if let Some(buffer) = self.buffer.upgrade() {
            buffer.append(SequencedEvent::new(notification.source.clone(), notification.clone()));
        }
    }
}

// Tracks member creation and removal on the namespace root.
struct Lifecycle {
    buffer: Weak<EventBuffer>,
}

impl NotificationListener for Lifecycle {
    fn handle_notification(&self, notification: &Notification, _handback: Option<&Handback>) {
        let Some(buffer) = self.buffer.upgrade() else {
            return;
        };
        if let Some(id) = notification.created_member() {
            buffer.on_member_created(id.clone());
        } else if let Some(id) = notification.removed_member() {
            buffer.on_member_removed(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{namespace::local::LocalNamespace, notification::Notification, types::ObjectId};

    fn buffer(capacity: usize, first: SeqNum) -> Arc<EventBuffer> {
        EventBuffer::starting_at(Arc::new(LocalNamespace::new("root")), capacity, first).unwrap()
    }

    fn event(i: u64) -> SequencedEvent {
        SequencedEvent::new(ObjectId::new("src"), Notification::new("t", ObjectId::new("src"), i, ""))
    }

    #[test]
    fn counters_track_appends_and_evictions() {
        let buf = buffer(3, 10);
        for i in 0..5 {
            buf.append(event(i));
        }
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.earliest_seq(), 12);
        assert_eq!(buf.next_seq(), 15);
    }

    #[test]
    fn raw_request_rejects_negative_values() {
        assert!(matches!(FetchRequest::from_raw(0, -1, 1), Err(BufferError::InvalidArgument(_))));
        assert!(matches!(FetchRequest::from_raw(0, 1, -1), Err(BufferError::InvalidArgument(_))));
        let ok = FetchRequest::from_raw(-1, 250, 3).unwrap();
        assert_eq!(ok.timeout, Duration::from_millis(250));
    }

    #[test]
    fn missed_since_is_never_negative() {
        let r = FetchResult {
            earliest_seq: 5,
            next_seq: 5,
            events: Vec::new(),
            disposed: false,
        };
        assert_eq!(r.missed_since(2), 3);
        assert_eq!(r.missed_since(7), 0);
        assert_eq!(r.missed_since(-1), 0);
    }
}
