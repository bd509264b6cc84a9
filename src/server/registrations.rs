use std::fmt;

use hashbrown::HashMap;

use crate::{
    notification::{Handback, NotificationFilter},
    types::{ListenerId, ObjectId, Principal},
};

/// One listener registered through a forwarding session.
#[derive(Clone)]
pub struct ListenerRegistration {
    /// Session-assigned id.
    pub id: ListenerId,
    /// Object listened to.
    pub target: ObjectId,
    /// Predicate checked before delivery.
    pub filter: Option<NotificationFilter>,
    /// Opaque token, compared by identity on exact removal.
    pub handback: Option<Handback>,
    /// Identity used for fetch-time access checks.
    pub principal: Option<Principal>,
}

impl fmt::Debug for ListenerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistration")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("filtered", &self.filter.is_some())
            .field("principal", &self.principal)
            .finish()
    }
}

// Most targets carry a single listener; only grow into a map when needed.
enum RegistrationSet {
    One(ListenerRegistration),
    Many(HashMap<ListenerId, ListenerRegistration>),
}

impl RegistrationSet {
    fn get(&self, id: ListenerId) -> Option<&ListenerRegistration> {
        match self {
            Self::One(reg) => (reg.id == id).then_some(reg),
            Self::Many(map) => map.get(&id),
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::One(_) => 1,
            Self::Many(map) => map.len(),
        }
    }

    fn cloned(&self) -> Vec<ListenerRegistration> {
        match self {
            Self::One(reg) => vec![reg.clone()],
            Self::Many(map) => {
                let mut regs: Vec<_> = map.values().cloned().collect();
                regs.sort_by_key(|r| r.id);
                regs
            }
        }
    }
}

/// Target-keyed multimap of registrations with an id index.
#[derive(Default)]
pub(crate) struct RegistrationTable {
    by_target: HashMap<ObjectId, RegistrationSet>,
    target_of: HashMap<ListenerId, ObjectId>,
}

impl RegistrationTable {
    pub(crate) fn insert(&mut self, reg: ListenerRegistration) {
        self.target_of.insert(reg.id, reg.target.clone());
        let target = reg.target.clone();
        match self.by_target.remove(&target) {
            None => {
                self.by_target.insert(target, RegistrationSet::One(reg));
            }
            Some(RegistrationSet::One(existing)) => {
                let mut map = HashMap::with_capacity(2);
                map.insert(existing.id, existing);
                map.insert(reg.id, reg);
                self.by_target.insert(target, RegistrationSet::Many(map));
            }
            Some(RegistrationSet::Many(mut map)) => {
                map.insert(reg.id, reg);
                self.by_target.insert(target, RegistrationSet::Many(map));
            }
        }
    }

    pub(crate) fn get(&self, target: &ObjectId, id: ListenerId) -> Option<&ListenerRegistration> {
        self.by_target.get(target).and_then(|set| set.get(id))
    }

    pub(crate) fn remove(&mut self, target: &ObjectId, id: ListenerId) -> Option<ListenerRegistration> {
        if self.target_of.get(&id) != Some(target) {
            return None;
        }
        let set = self.by_target.remove(target)?;
        let (removed, rest) = match set {
            RegistrationSet::One(reg) => (Some(reg), None),
            RegistrationSet::Many(mut map) => {
                let removed = map.remove(&id);
                let rest = match map.len() {
                    0 => None,
                    1 => map.into_values().next().map(RegistrationSet::One),
                    _ => Some(RegistrationSet::Many(map)),
                };
                (removed, rest)
            }
        };
        if let Some(rest) = rest {
            self.by_target.insert(target.clone(), rest);
        }
        if removed.is_some() {
            self.target_of.remove(&id);
        }
        removed
    }

    /// Registrations on `target`, in id order.
    pub(crate) fn for_target(&self, target: &ObjectId) -> Vec<ListenerRegistration> {
        self.by_target.get(target).map(RegistrationSet::cloned).unwrap_or_default()
    }

    /// Drops every registration on `target`; returns their ids.
    pub(crate) fn remove_target(&mut self, target: &ObjectId) -> Vec<ListenerId> {
        let Some(set) = self.by_target.remove(target) else {
            return Vec::new();
        };
        let ids: Vec<ListenerId> = set.cloned().into_iter().map(|r| r.id).collect();
        for id in &ids {
            self.target_of.remove(id);
        }
        ids
    }

    pub(crate) fn clear(&mut self) {
        self.by_target.clear();
        self.target_of.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.by_target.values().map(RegistrationSet::len).sum()
    }

    pub(crate) fn ids(&self) -> Vec<ListenerId> {
        let mut ids: Vec<_> = self.target_of.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
