use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::{runtime::Handle, sync::broadcast};
use tracing::{debug, error, info, warn};

use crate::{
    config::ForwarderConfig,
    health::HealthMonitor,
    notification::{Handback, Notification, NotificationFilter, NotificationListener},
    transport::{FetchReply, NotificationTransport, TransportError},
    types::{ListenerId, ObjectId, SeqNum},
};

use super::{
    events::{ClientEvent, LossReason},
    listeners::{ClientListenerEntry, ListenerTable},
};

/// Client notifier failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotifierError {
    /// The notifier was terminated.
    #[error("client notifier terminated")]
    Terminated,
    /// No local listener matched the removal.
    #[error("no matching listener on {0}")]
    ListenerNotFound(ObjectId),
    /// Remote call failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

struct PumpState {
    table: ListenerTable,
    /// `None` until the first sync probe, and after a rejected cursor.
    cursor: Option<SeqNum>,
    removal_id: Option<ListenerId>,
    pump_running: bool,
    reconnecting: bool,
    terminated: bool,
}

impl PumpState {
    fn wants_pump(&self) -> bool {
        !self.terminated && !self.reconnecting && !self.table.is_empty()
    }
}

struct Inner {
    transport: Arc<dyn NotificationTransport>,
    fetch_timeout: Duration,
    max_fetch_count: usize,
    monitor: Mutex<Option<Arc<HealthMonitor>>>,
    executor: Mutex<Option<Handle>>,
    state: Mutex<PumpState>,
    // Serializes removal-tracking registration against its removal.
    tracking: tokio::sync::Mutex<()>,
    events_tx: broadcast::Sender<ClientEvent>,
}

/// Client end of notification forwarding.
///
/// Holds the local listener table and runs a single pump task that
/// long-polls the transport from a cursor, reports losses and dispatches
/// fetched notifications to their listeners by id.
#[derive(Clone)]
pub struct ClientNotifier {
    inner: Arc<Inner>,
}

impl ClientNotifier {
    /// Creates an idle notifier; the pump starts with the first listener.
    pub fn new(transport: Arc<dyn NotificationTransport>, config: &ForwarderConfig) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                transport,
                fetch_timeout: config.fetch_timeout(),
                max_fetch_count: config.max_fetch_count,
                monitor: Mutex::new(None),
                executor: Mutex::new(None),
                state: Mutex::new(PumpState {
                    table: ListenerTable::default(),
                    cursor: None,
                    removal_id: None,
                    pump_running: false,
                    reconnecting: false,
                    terminated: false,
                }),
                tracking: tokio::sync::Mutex::new(()),
                events_tx,
            }),
        }
    }

    /// Routes I/O failures through `monitor` instead of terminating.
    pub fn with_monitor(self, monitor: Arc<HealthMonitor>) -> Self {
        *self.inner.monitor.lock() = Some(monitor);
        self
    }

    /// Spawns the pump on `executor` rather than the caller's runtime.
    pub fn with_executor(self, executor: Handle) -> Self {
        *self.inner.executor.lock() = Some(executor);
        self
    }

    /// Subscribes to loss, removal and termination events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Adds an entry whose id the server already issued. The first entry
    /// registers removal tracking, syncs the cursor and starts the pump.
    pub async fn add_listener(&self, entry: ClientListenerEntry) -> Result<(), NotifierError> {
        let id = entry.id;
        {
            let mut st = self.inner.state.lock();
            if st.terminated {
                return Err(NotifierError::Terminated);
            }
            st.table.insert(entry);
            if st.reconnecting {
                debug!(listener_id = id, "listener stored until reconnect completes");
                return Ok(());
            }
        }

        if let Err(err) = Inner::ensure_started(&self.inner).await {
            self.inner.state.lock().table.remove_ids(&[id]);
            return Err(err);
        }
        Ok(())
    }

    /// Removes every entry for `listener` on `target`.
    pub async fn remove_listener(
        &self,
        target: &ObjectId,
        listener: &Arc<dyn NotificationListener>,
    ) -> Result<Vec<ListenerId>, NotifierError> {
        let ids = {
            let mut st = self.inner.state.lock();
            if st.terminated {
                return Err(NotifierError::Terminated);
            }
            st.table.remove_matching(target, listener)
        };
        if ids.is_empty() {
            return Err(NotifierError::ListenerNotFound(target.clone()));
        }
        self.inner.stop_tracking_if_idle().await;
        Ok(ids)
    }

    /// Removes the most recently added entry with exactly these fields.
    pub async fn remove_listener_exact(
        &self,
        target: &ObjectId,
        listener: &Arc<dyn NotificationListener>,
        filter: Option<&NotificationFilter>,
        handback: Option<&Handback>,
    ) -> Result<ListenerId, NotifierError> {
        let id = {
            let mut st = self.inner.state.lock();
            if st.terminated {
                return Err(NotifierError::Terminated);
            }
            st.table.remove_exact(target, listener, filter, handback)
        };
        let id = id.ok_or_else(|| NotifierError::ListenerNotFound(target.clone()))?;
        self.inner.stop_tracking_if_idle().await;
        Ok(id)
    }

    /// Drops the entries with the given ids and returns them.
    pub async fn remove_listener_ids(&self, ids: &[ListenerId]) -> Vec<ClientListenerEntry> {
        let removed = self.inner.state.lock().table.remove_ids(ids);
        if !removed.is_empty() {
            self.inner.stop_tracking_if_idle().await;
        }
        removed
    }

    /// Entry registered under `id`.
    pub fn listener(&self, id: ListenerId) -> Option<ClientListenerEntry> {
        self.inner.state.lock().table.get(id).cloned()
    }

    /// Registered ids in insertion order.
    pub fn listener_ids(&self) -> Vec<ListenerId> {
        self.inner.state.lock().table.ids()
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.state.lock().table.len()
    }

    /// Next sequence number to fetch, once known.
    pub fn cursor(&self) -> Option<SeqNum> {
        self.inner.state.lock().cursor
    }

    /// True while a pump task is live.
    pub fn is_pump_running(&self) -> bool {
        self.inner.state.lock().pump_running
    }

    /// True once terminated.
    pub fn is_terminated(&self) -> bool {
        self.inner.state.lock().terminated
    }

    /// Suspends dispatch ahead of a reconnect and hands back the entries the
    /// caller must re-register on the new connection.
    pub fn pre_reconnect(&self) -> Vec<ClientListenerEntry> {
        let mut st = self.inner.state.lock();
        st.reconnecting = true;
        st.removal_id = None;
        let entries = st.table.drain();
        debug!(listeners = entries.len(), "reconnect started");
        entries
    }

    /// Restores `entries` (carrying their new server ids) and resumes the
    /// pump from the retained cursor.
    pub async fn post_reconnect(&self, entries: Vec<ClientListenerEntry>) -> Result<(), NotifierError> {
        {
            let mut st = self.inner.state.lock();
            if st.terminated {
                return Err(NotifierError::Terminated);
            }
            for entry in entries {
                st.table.insert(entry);
            }
            st.reconnecting = false;
            debug!(listeners = st.table.len(), cursor = ?st.cursor, "reconnect finished");
        }
        Inner::ensure_started(&self.inner).await
    }

    /// Stops forwarding for good. Idempotent.
    pub async fn terminate(&self) {
        self.inner.terminate().await;
    }
}

impl Inner {
    async fn ensure_started(this: &Arc<Self>) -> Result<(), NotifierError> {
        let _tracking = this.tracking.lock().await;
        let (need_tracking, need_sync) = {
            let st = this.state.lock();
            if st.terminated {
                return Err(NotifierError::Terminated);
            }
            if !st.wants_pump() {
                return Ok(());
            }
            (st.removal_id.is_none(), st.cursor.is_none())
        };

        if need_tracking {
            let id = this.transport.register_removal_tracking().await?;
            this.state.lock().removal_id = Some(id);
            debug!(listener_id = id, "removal tracking registered");
        }
        if need_sync {
            let probe = this.transport.fetch(-1, Duration::ZERO, 0).await?;
            this.state.lock().cursor.get_or_insert(probe.next_seq);
        }

        Self::spawn_pump(this);
        Ok(())
    }

    fn spawn_pump(this: &Arc<Self>) {
        {
            let mut st = this.state.lock();
            if st.pump_running || !st.wants_pump() {
                return;
            }
            st.pump_running = true;
        }
        let inner = Arc::clone(this);
        let pump = async move { inner.run_pump().await };
        match this.executor.lock().clone() {
            Some(handle) => drop(handle.spawn(pump)),
            None => drop(tokio::spawn(pump)),
        }
    }

    async fn run_pump(self: Arc<Self>) {
        debug!("notification pump started");
        loop {
            let cursor = {
                let mut st = self.state.lock();
                if !st.wants_pump() {
                    st.pump_running = false;
                    break;
                }
                st.cursor
            };

            let outcome = match cursor {
                Some(cursor) => match self.transport.fetch(cursor, self.fetch_timeout, self.max_fetch_count).await {
                    Ok(reply) => self.deliver(cursor, reply).await,
                    Err(err) => Err(err),
                },
                None => self.resync().await,
            };

            if let Err(err) = outcome {
                self.handle_failure(err, cursor.is_none()).await;
            }
        }
        debug!("notification pump stopped");
    }

    async fn resync(&self) -> Result<(), TransportError> {
        let probe = self.transport.fetch(-1, Duration::ZERO, 0).await?;
        self.state.lock().cursor = Some(probe.next_seq);
        debug!(cursor = probe.next_seq, "cursor resynchronized");
        Ok(())
    }

    async fn deliver(&self, cursor: SeqNum, reply: FetchReply) -> Result<(), TransportError> {
        let mut decoded = Vec::with_capacity(reply.events.len());
        for event in &reply.events {
            match event.decode() {
                Ok(n) => decoded.push((event.listener_id, n)),
                Err(err) => {
                    warn!(%err, cursor, "undecodable notification in batch, fetching one at a time");
                    return self.recover_incompatible(cursor, reply.next_seq).await;
                }
            }
        }

        self.report_gap(cursor, reply.earliest_seq);
        self.advance(reply.next_seq);
        self.dispatch(decoded);
        Ok(())
    }

    // Walks [cursor, end) one matching event at a time so a single bad
    // payload costs only itself.
    async fn recover_incompatible(&self, mut cursor: SeqNum, end: SeqNum) -> Result<(), TransportError> {
        let mut dropped = 0u64;
        while cursor < end {
            let skip = self.transport.fetch(cursor, Duration::ZERO, 0).await?;
            self.report_gap(cursor, skip.earliest_seq);
            cursor = skip.next_seq;
            self.advance(cursor);
            if cursor >= end {
                break;
            }

            let one = self.transport.fetch(cursor, Duration::ZERO, 1).await?;
            self.report_gap(cursor, one.earliest_seq);
            if one.next_seq <= cursor {
                break;
            }
            cursor = one.next_seq;
            self.advance(cursor);
            for event in one.events {
                match event.decode() {
                    Ok(n) => self.dispatch(vec![(event.listener_id, n)]),
                    Err(err) => {
                        debug!(%err, listener_id = event.listener_id, "dropping undecodable notification");
                        dropped += 1;
                    }
                }
            }
        }

        if dropped > 0 {
            warn!(dropped, "notifications lost to incompatible payloads");
            self.emit(ClientEvent::NotificationsLost {
                missed: dropped,
                reason: LossReason::IncompatibleType,
            });
        }
        Ok(())
    }

    fn report_gap(&self, cursor: SeqNum, earliest: SeqNum) {
        let missed = earliest.saturating_sub(cursor);
        if missed > 0 {
            warn!(missed, cursor, earliest, "notifications lost to eviction");
            self.emit(ClientEvent::NotificationsLost {
                missed: missed as u64,
                reason: LossReason::Evicted,
            });
        }
    }

    fn advance(&self, next: SeqNum) {
        let mut st = self.state.lock();
        if !st.terminated {
            st.cursor = Some(next);
        }
    }

    fn dispatch(&self, events: Vec<(ListenerId, Notification)>) {
        for (listener_id, notification) in events {
            let entry = {
                let mut st = self.state.lock();
                if st.terminated {
                    return;
                }
                if st.removal_id == Some(listener_id) {
                    if let Some(target) = notification.removed_member() {
                        let ids = st.table.remove_target(target);
                        drop(st);
                        if !ids.is_empty() {
                            debug!(%target, removed = ids.len(), "dropped listeners of removed member");
                            self.emit(ClientEvent::ListenersRemoved {
                                target: target.clone(),
                                ids,
                            });
                        }
                    }
                    continue;
                }
                st.table.get(listener_id).cloned()
            };

            let Some(entry) = entry else {
                debug!(listener_id, "notification for unknown listener");
                continue;
            };
            let call = AssertUnwindSafe(|| entry.listener.handle_notification(&notification, entry.handback.as_ref()));
            if catch_unwind(call).is_err() {
                warn!(listener_id, kind = %notification.kind, "listener panicked while handling notification");
            }
        }
    }

    async fn handle_failure(&self, err: TransportError, probing: bool) {
        match err {
            TransportError::Terminated => {
                info!("remote session terminated");
                self.terminate().await;
            }
            TransportError::Rejected(reason) if !probing => {
                warn!(%reason, "fetch rejected, resynchronizing cursor");
                self.state.lock().cursor = None;
            }
            TransportError::Rejected(reason) => {
                error!(%reason, "cursor probe rejected");
                self.terminate().await;
            }
            err => {
                let monitor = self.monitor.lock().clone();
                let Some(monitor) = monitor else {
                    error!(%err, "transport failure without a health monitor");
                    self.terminate().await;
                    return;
                };
                if let Err(monitor_err) = monitor.report_failure(err).await {
                    error!(%monitor_err, "connection could not be recovered");
                    self.terminate().await;
                }
            }
        }
    }

    async fn stop_tracking_if_idle(&self) {
        let _tracking = self.tracking.lock().await;
        let id = {
            let mut st = self.state.lock();
            if !st.table.is_empty() || st.terminated {
                return;
            }
            st.removal_id.take()
        };
        if let Some(id) = id {
            if let Err(err) = self.transport.unregister_removal_tracking(id).await {
                warn!(%err, listener_id = id, "failed to unregister removal tracking");
            }
        }
    }

    async fn terminate(&self) {
        let removal_id = {
            let mut st = self.state.lock();
            if st.terminated {
                return;
            }
            st.terminated = true;
            st.table.drain();
            st.removal_id.take()
        };
        if let Some(id) = removal_id {
            if let Err(err) = self.transport.unregister_removal_tracking(id).await {
                debug!(%err, listener_id = id, "removal tracking not unregistered");
            }
        }
        info!("client notifier terminated");
        self.emit(ClientEvent::Terminated);
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events_tx.send(event);
    }
}
