//! Namespace bootstrap and listener lifecycle for [`EventBuffer`].
//!
//! The creation listener goes on the namespace root before members are
//! enumerated. Creations observed while the enumeration runs land in a side
//! set that is merged into the enumerated set afterwards, so a member created
//! mid-enumeration is attached exactly once. None of this runs under the
//! buffer's state lock: namespace calls may run arbitrary listener code.

use std::sync::Arc;

use hashbrown::HashSet;
use tracing::{debug, warn};

use crate::{
    namespace::NamespaceError,
    notification::NotificationFilter,
    types::ObjectId,
};

use super::event_buffer::{BufferError, EventBuffer};

#[derive(Debug, Default)]
pub(super) struct AttachState {
    // Some while the bootstrap enumeration is in progress.
    pending: Option<HashSet<ObjectId>>,
    attached: HashSet<ObjectId>,
    watching_root: bool,
    closed: bool,
}

impl EventBuffer {
    /// Starts collecting notifications from every emitting member of the
    /// namespace, including members created later. Idempotent.
    pub fn attach_to_namespace(&self) -> Result<(), BufferError> {
        {
            let mut st = self.attach.lock();
            if st.closed {
                return Err(BufferError::Disposed);
            }
            if st.watching_root {
                return Ok(());
            }
            st.pending = Some(HashSet::new());
            st.watching_root = true;
        }

        let root = self.namespace.root();
        let lifecycle_only: NotificationFilter =
            Arc::new(|n| n.created_member().is_some() || n.removed_member().is_some());
        if let Err(err) =
            self.namespace
                .add_member_listener(&root, Arc::clone(&self.lifecycle), Some(lifecycle_only), None)
        {
            let mut st = self.attach.lock();
            st.pending = None;
            st.watching_root = false;
            return Err(err.into());
        }

        let members = match self.namespace.query_members(&self.pattern) {
            Ok(members) => members,
            Err(err) => {
                {
                    let mut st = self.attach.lock();
                    st.pending = None;
                    st.watching_root = false;
                }
                if let Err(cleanup) = self.namespace.remove_member_listener(&root, &self.lifecycle) {
                    debug!(%cleanup, "creation listener already gone");
                }
                return Err(err.into());
            }
        };

        let to_attach: HashSet<ObjectId> = {
            let mut st = self.attach.lock();
            let created = st.pending.take().unwrap_or_default();
            members.into_iter().chain(created).collect()
        };
        debug!(members = to_attach.len(), "attaching event buffer to namespace");
        for id in to_attach {
            self.attach_member(id);
        }
        Ok(())
    }

    /// Number of members currently feeding this buffer.
    pub fn attached_count(&self) -> usize {
        self.attach.lock().attached.len()
    }

    pub(super) fn on_member_created(&self, id: ObjectId) {
        if !self.pattern.matches(&id) {
            return;
        }
        {
            let mut st = self.attach.lock();
            if let Some(pending) = st.pending.as_mut() {
                pending.insert(id);
                return;
            }
        }
        self.attach_member(id);
    }

    pub(super) fn on_member_removed(&self, id: &ObjectId) {
        let mut st = self.attach.lock();
        st.attached.remove(id);
        if let Some(pending) = st.pending.as_mut() {
            pending.remove(id);
        }
    }

    fn attach_member(&self, id: ObjectId) {
        {
            let mut st = self.attach.lock();
            if st.closed || !st.attached.insert(id.clone()) {
                return;
            }
        }

        let outcome = match self.namespace.is_emitter(&id) {
            Ok(true) => self
                .namespace
                .add_member_listener(&id, Arc::clone(&self.feed), None, None),
            Ok(false) => Err(NamespaceError::NotAnEmitter(id.clone())),
            Err(err) => Err(err),
        };

        match outcome {
            Ok(()) => {
                let closed = self.attach.lock().closed;
                if closed {
                    // Disposal raced with this attach; undo it.
                    if let Err(err) = self.namespace.remove_member_listener(&id, &self.feed) {
                        debug!(member = %id, %err, "late member listener already gone");
                    }
                }
            }
            Err(NamespaceError::NotAnEmitter(_)) => {
                self.attach.lock().attached.remove(&id);
            }
            Err(err) => {
                debug!(member = %id, %err, "member vanished before attach");
                self.attach.lock().attached.remove(&id);
            }
        }
    }

    pub(super) fn detach_from_namespace(&self) {
        let (attached, watching_root) = {
            let mut st = self.attach.lock();
            st.closed = true;
            st.pending = None;
            (
                std::mem::take(&mut st.attached),
                std::mem::replace(&mut st.watching_root, false),
            )
        };

        if watching_root {
            let root = self.namespace.root();
            if let Err(err) = self.namespace.remove_member_listener(&root, &self.lifecycle) {
                warn!(%err, "failed to remove creation listener");
            }
        }
        for id in attached {
            if let Err(err) = self.namespace.remove_member_listener(&id, &self.feed) {
                debug!(member = %id, %err, "member listener already gone");
            }
        }
    }
}
