use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;

use crate::{
    notification::{
        Handback, MEMBER_CREATED, MEMBER_REMOVED, Notification, NotificationFilter,
        NotificationListener, same_object,
    },
    types::{ObjectId, ObjectPattern},
};

use super::{Namespace, NamespaceError};

struct Registration {
    listener: Arc<dyn NotificationListener>,
    filter: Option<NotificationFilter>,
    handback: Option<Handback>,
}

struct Member {
    emitter: bool,
    listeners: Vec<Registration>,
}

/// Namespace kept entirely in process memory.
///
/// Notifications are delivered synchronously on the emitting thread, outside
/// the member table lock.
pub struct LocalNamespace {
    root: ObjectId,
    members: Mutex<HashMap<ObjectId, Member>>,
    next_seq: AtomicU64,
}

impl LocalNamespace {
    /// Creates a namespace whose root object is `root`.
    pub fn new(root: impl Into<ObjectId>) -> Self {
        let root = root.into();
        let mut members = HashMap::new();
        members.insert(
            root.clone(),
            Member {
                emitter: true,
                listeners: Vec::new(),
            },
        );
        Self {
            root,
            members: Mutex::new(members),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Adds a member and announces it from the root.
    pub fn register(&self, id: impl Into<ObjectId>, emitter: bool) -> Result<(), NamespaceError> {
        let id = id.into();
        {
            let mut members = self.members.lock();
            if members.contains_key(&id) {
                return Err(NamespaceError::Other(format!("{id} already registered")));
            }
            members.insert(
                id.clone(),
                Member {
                    emitter,
                    listeners: Vec::new(),
                },
            );
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.emit(Notification::member_event(MEMBER_CREATED, self.root.clone(), id, seq))
    }

    /// Removes a member, dropping its listeners, and announces it from the root.
    pub fn unregister(&self, id: &ObjectId) -> Result<(), NamespaceError> {
        if *id == self.root {
            return Err(NamespaceError::Other("cannot unregister the namespace root".to_string()));
        }
        self.members
            .lock()
            .remove(id)
            .ok_or_else(|| NamespaceError::NotFound(id.clone()))?;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.emit(Notification::member_event(MEMBER_REMOVED, self.root.clone(), id.clone(), seq))
    }

    /// Delivers `notification` to the listeners of its source.
    pub fn emit(&self, notification: Notification) -> Result<(), NamespaceError> {
        let targets: Vec<(Arc<dyn NotificationListener>, Option<NotificationFilter>, Option<Handback>)> = {
            let members = self.members.lock();
            let member = members
                .get(&notification.source)
                .ok_or_else(|| NamespaceError::NotFound(notification.source.clone()))?;
            if !member.emitter {
                return Err(NamespaceError::NotAnEmitter(notification.source.clone()));
            }
            member
                .listeners
                .iter()
                .map(|r| (Arc::clone(&r.listener), r.filter.clone(), r.handback.clone()))
                .collect()
        };

        for (listener, filter, handback) in targets {
            if filter.as_ref().is_none_or(|f| f(&notification)) {
                listener.handle_notification(&notification, handback.as_ref());
            }
        }
        Ok(())
    }

    /// Emits a plain notification from `source` with a fresh sequence number.
    pub fn publish(&self, source: &ObjectId, kind: &str, message: &str) -> Result<(), NamespaceError> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.emit(Notification::new(kind, source.clone(), seq, message))
    }

    /// Number of listener registrations on `id`.
    pub fn listener_count(&self, id: &ObjectId) -> usize {
        self.members.lock().get(id).map_or(0, |m| m.listeners.len())
    }
}

impl Namespace for LocalNamespace {
    fn root(&self) -> ObjectId {
        self.root.clone()
    }

    fn query_members(&self, pattern: &ObjectPattern) -> Result<HashSet<ObjectId>, NamespaceError> {
        Ok(self
            .members
            .lock()
            .keys()
            .filter(|id| pattern.matches(id))
            .cloned()
            .collect())
    }

    fn is_emitter(&self, id: &ObjectId) -> Result<bool, NamespaceError> {
        self.members
            .lock()
            .get(id)
            .map(|m| m.emitter)
            .ok_or_else(|| NamespaceError::NotFound(id.clone()))
    }

    fn add_member_listener(
        &self,
        id: &ObjectId,
        listener: Arc<dyn NotificationListener>,
        filter: Option<NotificationFilter>,
        handback: Option<Handback>,
    ) -> Result<(), NamespaceError> {
        let mut members = self.members.lock();
        let member = members
            .get_mut(id)
            .ok_or_else(|| NamespaceError::NotFound(id.clone()))?;
        if !member.emitter {
            return Err(NamespaceError::NotAnEmitter(id.clone()));
        }
        member.listeners.push(Registration {
            listener,
            filter,
            handback,
        });
        Ok(())
    }

    fn remove_member_listener(
        &self,
        id: &ObjectId,
        listener: &Arc<dyn NotificationListener>,
    ) -> Result<(), NamespaceError> {
        let mut members = self.members.lock();
        let member = members
            .get_mut(id)
            .ok_or_else(|| NamespaceError::NotFound(id.clone()))?;
        let before = member.listeners.len();
        member.listeners.retain(|r| !same_object(&r.listener, listener));
        if member.listeners.len() == before {
            return Err(NamespaceError::ListenerNotFound(id.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn lifecycle_events_reach_root_listeners() {
        let ns = LocalNamespace::new("root");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener: Arc<dyn NotificationListener> =
            Arc::new(move |n: &Notification, _h: Option<&Handback>| sink.lock().push(n.kind.clone()));
        ns.add_member_listener(&ns.root(), Arc::clone(&listener), None, None)
            .unwrap();

        ns.register("a", true).unwrap();
        ns.unregister(&ObjectId::new("a")).unwrap();

        assert_eq!(*seen.lock(), vec![MEMBER_CREATED.to_string(), MEMBER_REMOVED.to_string()]);
        ns.remove_member_listener(&ns.root(), &listener).unwrap();
        assert_eq!(ns.listener_count(&ns.root()), 0);
    }

    #[test]
    fn filters_and_non_emitters() {
        let ns = LocalNamespace::new("root");
        ns.register("quiet", false).unwrap();
        ns.register("loud", true).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let listener: Arc<dyn NotificationListener> = Arc::new(move |_n: &Notification, _h: Option<&Handback>| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let quiet = ObjectId::new("quiet");
        assert_eq!(
            ns.add_member_listener(&quiet, Arc::clone(&listener), None, None),
            Err(NamespaceError::NotAnEmitter(quiet))
        );

        let loud = ObjectId::new("loud");
        let only_alarms: NotificationFilter = Arc::new(|n| n.kind == "alarm");
        ns.add_member_listener(&loud, listener, Some(only_alarms), None)
            .unwrap();
        ns.publish(&loud, "tick", "t").unwrap();
        ns.publish(&loud, "alarm", "a").unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
