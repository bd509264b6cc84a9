use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::{
    buffer::{BufferError, BufferFilter, BufferRegistry, FetchRequest, FetchResult, SharedBuffer},
    config::ForwarderConfig,
    health::{HealthMonitor, MonitorError, RequestGuard},
    namespace::{AccessController, AccessError, Action, Namespace, NamespaceError},
    notification::{Handback, NotificationFilter, SequencedEvent, TargetedEvent, same_optional},
    types::{ListenerId, ObjectId, Principal, SeqNum},
};

use super::registrations::{ListenerRegistration, RegistrationTable};

/// Forwarding session failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The session was terminated, possibly while the call was waiting.
    #[error("forwarding session terminated")]
    Terminated,
    /// Listener target cannot emit notifications.
    #[error("{0} does not emit notifications")]
    NotAnEmitter(ObjectId),
    /// No matching registration.
    #[error("listener {id} is not registered on {target}")]
    ListenerNotFound {
        /// Object the removal named.
        target: ObjectId,
        /// Listener the removal named.
        id: ListenerId,
    },
    /// Access controller refusal.
    #[error(transparent)]
    Access(#[from] AccessError),
    /// Namespace lookup failure.
    #[error(transparent)]
    Namespace(#[from] NamespaceError),
    /// Buffer failure.
    #[error(transparent)]
    Buffer(#[from] BufferError),
    /// Request refused by the connection monitor.
    #[error(transparent)]
    Monitor(#[from] MonitorError),
}

struct SessionState {
    table: RegistrationTable,
    next_id: ListenerId,
    terminated: bool,
}

/// Server-side state of one client connection.
///
/// Owns a sharer claim on the namespace's buffer and the listeners the
/// client registered; fetches deliver only events those listeners accept.
pub struct ForwardingSession {
    namespace: Arc<dyn Namespace>,
    access: Arc<dyn AccessController>,
    buffer: SharedBuffer,
    root: ObjectId,
    max_fetch_timeout: Duration,
    max_fetch_count: usize,
    state: Mutex<SessionState>,
    // Wakes this session's own blocked fetches on terminate.
    closed: Notify,
    monitor: Option<Arc<HealthMonitor>>,
}

impl ForwardingSession {
    /// Opens a session with a claim of `config.buffer_capacity` on the
    /// namespace's shared buffer.
    pub fn new(
        registry: &Arc<BufferRegistry>,
        namespace: Arc<dyn Namespace>,
        access: Arc<dyn AccessController>,
        config: &ForwarderConfig,
    ) -> Result<Self, SessionError> {
        let buffer = registry.acquire(&namespace, config.buffer_capacity)?;
        let root = namespace.root();
        Ok(Self {
            namespace,
            access,
            buffer,
            root,
            max_fetch_timeout: config.fetch_timeout(),
            max_fetch_count: config.max_fetch_count,
            state: Mutex::new(SessionState {
                table: RegistrationTable::default(),
                next_id: 1,
                terminated: false,
            }),
            closed: Notify::new(),
            monitor: None,
        })
    }

    /// Counts every request against `monitor`'s admission tracking.
    pub fn with_monitor(mut self, monitor: Arc<HealthMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Namespace root; removal tracking listens here.
    pub fn root(&self) -> ObjectId {
        self.root.clone()
    }

    /// This session's buffer claim.
    pub fn buffer(&self) -> &SharedBuffer {
        &self.buffer
    }

    /// Registers a listener on an emitting `target` and returns its id.
    pub fn register_listener(
        &self,
        target: &ObjectId,
        filter: Option<NotificationFilter>,
        handback: Option<Handback>,
        principal: Option<Principal>,
    ) -> Result<ListenerId, SessionError> {
        self.ensure_active()?;
        let _guard = self.admit()?;

        if !self.namespace.is_emitter(target)? {
            return Err(SessionError::NotAnEmitter(target.clone()));
        }
        self.access.check(principal.as_ref(), target, Action::AddListener)?;

        let mut st = self.state.lock();
        if st.terminated {
            return Err(SessionError::Terminated);
        }
        let id = st.next_id;
        st.next_id += 1;
        st.table.insert(ListenerRegistration {
            id,
            target: target.clone(),
            filter,
            handback,
            principal,
        });
        debug!(listener_id = id, %target, "listener registered");
        Ok(id)
    }

    /// Registers a root listener that only passes member-removal
    /// notifications; clients use it to drop listeners on removed members.
    pub fn register_removal_tracking(&self, principal: Option<Principal>) -> Result<ListenerId, SessionError> {
        let removed_only: NotificationFilter = Arc::new(|n| n.removed_member().is_some());
        let root = self.root();
        self.register_listener(&root, Some(removed_only), None, principal)
    }

    /// Removes registration `id` on `target`.
    pub fn remove_listener(
        &self,
        target: &ObjectId,
        id: ListenerId,
        principal: Option<&Principal>,
    ) -> Result<(), SessionError> {
        self.ensure_active()?;
        let _guard = self.admit()?;
        self.check_removal(target, principal)?;

        self.state
            .lock()
            .table
            .remove(target, id)
            .map(|_| ())
            .ok_or_else(|| SessionError::ListenerNotFound {
                target: target.clone(),
                id,
            })
    }

    /// Removes `id` only if its filter and handback are the same objects.
    pub fn remove_listener_exact(
        &self,
        target: &ObjectId,
        id: ListenerId,
        filter: Option<&NotificationFilter>,
        handback: Option<&Handback>,
        principal: Option<&Principal>,
    ) -> Result<(), SessionError> {
        self.ensure_active()?;
        let _guard = self.admit()?;
        self.check_removal(target, principal)?;

        let mut st = self.state.lock();
        let matches = st
            .table
            .get(target, id)
            .is_some_and(|reg| same_optional(reg.filter.as_ref(), filter) && same_optional(reg.handback.as_ref(), handback));
        if !matches {
            return Err(SessionError::ListenerNotFound {
                target: target.clone(),
                id,
            });
        }
        st.table.remove(target, id);
        Ok(())
    }

    /// Long-poll fetch of events for this session's listeners.
    ///
    /// `timeout` and `max_count` are clamped to the configured maxima.
    /// Terminating the session ends a waiting fetch with
    /// [`SessionError::Terminated`].
    pub async fn fetch(
        &self,
        start_seq: SeqNum,
        timeout: Duration,
        max_count: usize,
        principal: Option<&Principal>,
    ) -> Result<FetchResult, SessionError> {
        let closed = self.closed.notified();
        tokio::pin!(closed);
        closed.as_mut().enable();
        self.ensure_active()?;
        let _guard = self.admit()?;

        let request = FetchRequest::new(
            start_seq,
            timeout.min(self.max_fetch_timeout),
            max_count.min(self.max_fetch_count),
        );
        let filter = SessionFilter {
            session: self,
            principal,
        };
        let result = tokio::select! {
            res = self.buffer.fetch(&filter, request) => res?,
            _ = closed => return Err(SessionError::Terminated),
        };
        debug!(
            start_seq,
            next_seq = result.next_seq,
            earliest_seq = result.earliest_seq,
            events = result.events.len(),
            "fetch complete"
        );
        Ok(result)
    }

    /// Clears every registration and releases the buffer claim. Idempotent.
    pub fn terminate(&self) {
        let first = {
            let mut st = self.state.lock();
            if st.terminated {
                false
            } else {
                st.terminated = true;
                st.table.clear();
                true
            }
        };
        if first {
            self.closed.notify_waiters();
            self.buffer.release();
            info!(sharer = self.buffer.sharer_id(), "forwarding session terminated");
        }
    }

    /// True once terminated.
    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminated
    }

    /// Registered listener ids, ascending.
    pub fn listener_ids(&self) -> Vec<ListenerId> {
        self.state.lock().table.ids()
    }

    /// Number of live registrations.
    pub fn registration_count(&self) -> usize {
        self.state.lock().table.len()
    }

    fn ensure_active(&self) -> Result<(), SessionError> {
        if self.state.lock().terminated {
            Err(SessionError::Terminated)
        } else {
            Ok(())
        }
    }

    fn admit(&self) -> Result<Option<RequestGuard>, SessionError> {
        self.monitor
            .as_ref()
            .map(|m| m.begin_request())
            .transpose()
            .map_err(SessionError::from)
    }

    // A vanished target may still have stale registrations to remove.
    fn check_removal(&self, target: &ObjectId, principal: Option<&Principal>) -> Result<(), SessionError> {
        match self.access.check(principal, target, Action::RemoveListener) {
            Ok(()) | Err(AccessError::NotFound(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn purge_target(&self, target: &ObjectId) {
        let ids = self.state.lock().table.remove_target(target);
        if !ids.is_empty() {
            debug!(%target, removed = ids.len(), "purged listeners of removed member");
        }
    }
}

impl Drop for ForwardingSession {
    fn drop(&mut self) {
        self.terminate();
    }
}

struct SessionFilter<'a> {
    session: &'a ForwardingSession,
    principal: Option<&'a Principal>,
}

impl BufferFilter for SessionFilter<'_> {
    fn apply(&self, event: &SequencedEvent, out: &mut Vec<TargetedEvent>) {
        let session = self.session;
        if event.origin == session.root {
            if let Some(removed) = event.notification.removed_member() {
                session.purge_target(removed);
            }
        }

        let regs = {
            let st = session.state.lock();
            if st.terminated {
                return;
            }
            st.table.for_target(&event.origin)
        };

        for reg in regs {
            if let Some(filter) = &reg.filter {
                if !filter(&event.notification) {
                    continue;
                }
            }
            let principal = self.principal.or(reg.principal.as_ref());
            match session.access.check(principal, &event.origin, Action::FetchNotification) {
                Ok(()) => out.push(TargetedEvent {
                    listener_id: reg.id,
                    notification: Arc::clone(&event.notification),
                }),
                Err(err) => {
                    debug!(listener_id = reg.id, %err, "notification withheld");
                }
            }
        }
    }
}
