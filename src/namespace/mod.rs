//! Collaborator seams: the managed-object namespace and access control.

/// In-process namespace used by embedders and tests.
pub mod local;

use std::sync::Arc;

use hashbrown::HashSet;
use thiserror::Error;

use crate::{
    notification::{Handback, NotificationFilter, NotificationListener},
    types::{ObjectId, ObjectPattern, Principal},
};

/// Namespace lookup and listener failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NamespaceError {
    /// No such member.
    #[error("object not found: {0}")]
    NotFound(ObjectId),
    /// Member exists but cannot emit.
    #[error("object {0} does not emit notifications")]
    NotAnEmitter(ObjectId),
    /// Removal of a listener that was never added.
    #[error("listener not registered on {0}")]
    ListenerNotFound(ObjectId),
    /// Anything else the implementation reports.
    #[error("namespace failure: {0}")]
    Other(String),
}

/// Directory of manageable objects that emit notifications.
///
/// The root object emits [`crate::notification::MEMBER_CREATED`] and
/// [`crate::notification::MEMBER_REMOVED`] notifications naming the affected
/// member in `subject`.
pub trait Namespace: Send + Sync {
    /// Name of the root object.
    fn root(&self) -> ObjectId;

    /// Members whose names match `pattern`.
    fn query_members(&self, pattern: &ObjectPattern) -> Result<HashSet<ObjectId>, NamespaceError>;

    /// Whether `id` can emit notifications.
    fn is_emitter(&self, id: &ObjectId) -> Result<bool, NamespaceError>;

    /// Adds `listener` on `id`. The same listener may be added more than once.
    fn add_member_listener(
        &self,
        id: &ObjectId,
        listener: Arc<dyn NotificationListener>,
        filter: Option<NotificationFilter>,
        handback: Option<Handback>,
    ) -> Result<(), NamespaceError>;

    /// Removes every registration of `listener` on `id`.
    fn remove_member_listener(
        &self,
        id: &ObjectId,
        listener: &Arc<dyn NotificationListener>,
    ) -> Result<(), NamespaceError>;
}

/// Permission-checked actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Registering a listener.
    AddListener,
    /// Removing a listener.
    RemoveListener,
    /// Receiving a buffered notification.
    FetchNotification,
}

/// Access check outcome other than a grant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessError {
    /// Principal may not perform `action` on `id`.
    #[error("access denied: {action:?} on {id}")]
    Denied {
        /// Object checked.
        id: ObjectId,
        /// Refused action.
        action: Action,
    },
    /// Object no longer exists.
    #[error("object not found: {0}")]
    NotFound(ObjectId),
}

/// Decides whether a principal may act on an object.
pub trait AccessController: Send + Sync {
    /// Grants with `Ok`; `principal` is `None` for anonymous callers.
    fn check(&self, principal: Option<&Principal>, id: &ObjectId, action: Action) -> Result<(), AccessError>;
}

/// Grants everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AccessController for AllowAll {
    fn check(&self, _principal: Option<&Principal>, _id: &ObjectId, _action: Action) -> Result<(), AccessError> {
        Ok(())
    }
}

impl<F> AccessController for F
where
    F: Fn(Option<&Principal>, &ObjectId, Action) -> Result<(), AccessError> + Send + Sync,
{
    fn check(&self, principal: Option<&Principal>, id: &ObjectId, action: Action) -> Result<(), AccessError> {
        self(principal, id, action)
    }
}
