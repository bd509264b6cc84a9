use std::{fmt, sync::Arc};

use hashbrown::HashMap;

use crate::{
    notification::{Handback, NotificationFilter, NotificationListener, same_object, same_optional},
    types::{ListenerId, ObjectId, Principal},
};

/// A locally registered callback and the server-side id it listens under.
#[derive(Clone)]
pub struct ClientListenerEntry {
    /// Server-side registration id.
    pub id: ListenerId,
    /// Object listened to.
    pub target: ObjectId,
    /// Local callback.
    pub listener: Arc<dyn NotificationListener>,
    /// Filter the server applies, kept for exact removal.
    pub filter: Option<NotificationFilter>,
    /// Token passed back on each callback.
    pub handback: Option<Handback>,
    /// Identity the registration was made under.
    pub principal: Option<Principal>,
}

impl ClientListenerEntry {
    /// Entry with no filter, handback or principal.
    pub fn new(id: ListenerId, target: ObjectId, listener: Arc<dyn NotificationListener>) -> Self {
        Self {
            id,
            target,
            listener,
            filter: None,
            handback: None,
            principal: None,
        }
    }

    /// Sets the filter.
    pub fn with_filter(mut self, filter: NotificationFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Sets the handback.
    pub fn with_handback(mut self, handback: Handback) -> Self {
        self.handback = Some(handback);
        self
    }

    /// Sets the principal.
    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = Some(principal);
        self
    }
}

impl fmt::Debug for ClientListenerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientListenerEntry")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("principal", &self.principal)
            .finish_non_exhaustive()
    }
}

/// Entries keyed by id, remembering insertion order for removal lookups.
#[derive(Default)]
pub(crate) struct ListenerTable {
    entries: HashMap<ListenerId, ClientListenerEntry>,
    order: Vec<ListenerId>,
}

impl ListenerTable {
    pub(crate) fn insert(&mut self, entry: ClientListenerEntry) {
        if self.entries.contains_key(&entry.id) {
            self.order.retain(|id| *id != entry.id);
        }
        self.order.push(entry.id);
        self.entries.insert(entry.id, entry);
    }

    pub(crate) fn get(&self, id: ListenerId) -> Option<&ClientListenerEntry> {
        self.entries.get(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn ids(&self) -> Vec<ListenerId> {
        self.order.clone()
    }

    /// Every entry for `listener` on `target`.
    pub(crate) fn remove_matching(
        &mut self,
        target: &ObjectId,
        listener: &Arc<dyn NotificationListener>,
    ) -> Vec<ListenerId> {
        let ids: Vec<ListenerId> = self
            .order
            .iter()
            .copied()
            .filter(|id| {
                self.entries
                    .get(id)
                    .is_some_and(|e| e.target == *target && same_object(&e.listener, listener))
            })
            .collect();
        self.remove_ids(&ids);
        ids
    }

    /// The most recently added entry matching all of the given fields.
    pub(crate) fn remove_exact(
        &mut self,
        target: &ObjectId,
        listener: &Arc<dyn NotificationListener>,
        filter: Option<&NotificationFilter>,
        handback: Option<&Handback>,
    ) -> Option<ListenerId> {
        let id = self.order.iter().rev().copied().find(|id| {
            self.entries.get(id).is_some_and(|e| {
                e.target == *target
                    && same_object(&e.listener, listener)
                    && same_optional(e.filter.as_ref(), filter)
                    && same_optional(e.handback.as_ref(), handback)
            })
        })?;
        self.remove_ids(&[id]);
        Some(id)
    }

    pub(crate) fn remove_target(&mut self, target: &ObjectId) -> Vec<ListenerId> {
        let ids: Vec<ListenerId> = self
            .order
            .iter()
            .copied()
            .filter(|id| self.entries.get(id).is_some_and(|e| e.target == *target))
            .collect();
        self.remove_ids(&ids);
        ids
    }

    pub(crate) fn remove_ids(&mut self, ids: &[ListenerId]) -> Vec<ClientListenerEntry> {
        let removed: Vec<_> = ids.iter().filter_map(|id| self.entries.remove(id)).collect();
        if !removed.is_empty() {
            self.order.retain(|id| self.entries.contains_key(id));
        }
        removed
    }

    /// Empties the table, returning entries in insertion order.
    pub(crate) fn drain(&mut self) -> Vec<ClientListenerEntry> {
        let order = std::mem::take(&mut self.order);
        order.into_iter().filter_map(|id| self.entries.remove(&id)).collect()
    }
}
