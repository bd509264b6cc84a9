//! Notification payloads, buffered events, and listener callback types.

use std::{
    any::Any,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

use crate::types::{ListenerId, ObjectId};

/// Kind emitted by the namespace root when a member appears.
pub const MEMBER_CREATED: &str = "namespace.member.created";
/// Kind emitted by the namespace root when a member goes away.
pub const MEMBER_REMOVED: &str = "namespace.member.removed";

/// Event value emitted by a managed object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Dotted notification type.
    pub kind: String,
    /// Emitting object.
    pub source: ObjectId,
    /// Producer-assigned sequence number (not the buffer sequence).
    pub sequence: u64,
    /// Emission time in milliseconds since epoch.
    pub timestamp_ms: u64,
    /// Human-readable message.
    pub message: String,
    /// Object the notification is about, for lifecycle notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<ObjectId>,
    /// Free-form attachment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<serde_json::Value>,
}

impl Notification {
    /// Builds a notification stamped with the current time.
    pub fn new(kind: impl Into<String>, source: ObjectId, sequence: u64, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            source,
            sequence,
            timestamp_ms: now_ms(),
            message: message.into(),
            subject: None,
            user_data: None,
        }
    }

    /// Lifecycle notification emitted by `root` about `member`.
    pub fn member_event(kind: &str, root: ObjectId, member: ObjectId, sequence: u64) -> Self {
        let message = format!("{kind}: {member}");
        Self {
            subject: Some(member),
            ..Self::new(kind, root, sequence, message)
        }
    }

    /// Member named by a creation notification.
    pub fn created_member(&self) -> Option<&ObjectId> {
        (self.kind == MEMBER_CREATED).then_some(self.subject.as_ref()).flatten()
    }

    /// Member named by a removal notification.
    pub fn removed_member(&self) -> Option<&ObjectId> {
        (self.kind == MEMBER_REMOVED).then_some(self.subject.as_ref()).flatten()
    }
}

/// A notification as retained in the ring, tagged with its origin.
#[derive(Debug, Clone)]
pub struct SequencedEvent {
    /// Object whose listener produced the event.
    pub origin: ObjectId,
    /// Shared payload.
    pub notification: Arc<Notification>,
}

impl SequencedEvent {
    /// Wraps a notification emitted by `origin`.
    pub fn new(origin: ObjectId, notification: Notification) -> Self {
        Self {
            origin,
            notification: Arc::new(notification),
        }
    }
}

/// A fetched event addressed to one listener registration.
#[derive(Debug, Clone)]
pub struct TargetedEvent {
    /// Registration the event matched.
    pub listener_id: ListenerId,
    /// Shared payload.
    pub notification: Arc<Notification>,
}

/// Opaque caller token handed back on every callback.
pub type Handback = Arc<dyn Any + Send + Sync>;

/// Predicate over notifications.
pub type NotificationFilter = Arc<dyn Fn(&Notification) -> bool + Send + Sync>;

/// Callback invoked for each delivered notification.
pub trait NotificationListener: Send + Sync {
    /// Handles one notification.
    fn handle_notification(&self, notification: &Notification, handback: Option<&Handback>);
}

impl<F> NotificationListener for F
where
    F: Fn(&Notification, Option<&Handback>) + Send + Sync,
{
    fn handle_notification(&self, notification: &Notification, handback: Option<&Handback>) {
        self(notification, handback)
    }
}

/// Pointer identity for shared trait objects; vtables are ignored.
pub fn same_object<T: ?Sized, U: ?Sized>(a: &Arc<T>, b: &Arc<U>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

pub(crate) fn same_optional<T: ?Sized>(a: Option<&Arc<T>>, b: Option<&Arc<T>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => same_object(a, b),
        _ => false,
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_accessors_follow_kind() {
        let created = Notification::member_event(MEMBER_CREATED, "root".into(), "a".into(), 1);
        assert_eq!(created.created_member(), Some(&ObjectId::new("a")));
        assert_eq!(created.removed_member(), None);

        let plain = Notification::new("app.tick", "a".into(), 2, "tick");
        assert_eq!(plain.created_member(), None);
    }

    #[test]
    fn json_omits_empty_optionals() {
        let n = Notification::new("app.tick", "a".into(), 2, "tick");
        let text = serde_json::to_string(&n).expect("encode");
        assert!(!text.contains("subject"));
        let back: Notification = serde_json::from_str(&text).expect("decode");
        assert_eq!(back, n);
    }
}
