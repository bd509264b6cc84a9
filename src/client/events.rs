//! Connection-level events surfaced by the client pump.

use crate::types::{ListenerId, ObjectId};

/// Why notifications were lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossReason {
    /// The server evicted them before this client fetched them.
    Evicted,
    /// They arrived but could not be decoded.
    IncompatibleType,
}

/// Events emitted from the client dispatch loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Some notifications will never be delivered.
    NotificationsLost {
        /// How many.
        missed: u64,
        /// Why.
        reason: LossReason,
    },
    /// Listeners were dropped because their target left the namespace.
    ListenersRemoved {
        /// Removed member.
        target: ObjectId,
        /// Dropped listener ids.
        ids: Vec<ListenerId>,
    },
    /// The notifier stopped for good.
    Terminated,
}
