//! Fetch RPC seam between the client pump and a remote forwarding session.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    buffer::{BufferError, FetchResult},
    notification::Notification,
    server::session::{ForwardingSession, SessionError},
    types::{ListenerId, Principal, SeqNum},
};

/// Failures of a remote call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Connection-level failure; a reconnect may cure it.
    #[error("i/o failure: {0}")]
    Io(String),
    /// The peer refused the request.
    #[error("request rejected: {0}")]
    Rejected(String),
    /// The remote session is gone.
    #[error("remote session terminated")]
    Terminated,
    /// Payload could not be encoded or decoded.
    #[error("undecodable payload: {0}")]
    Decode(String),
}

impl TransportError {
    /// True for failures a reconnect may cure.
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

/// One fetched notification as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEvent {
    /// Registration the event is addressed to.
    pub listener_id: ListenerId,
    /// JSON-encoded [`Notification`].
    pub payload: Vec<u8>,
}

impl WireEvent {
    /// Serializes `notification` for `listener_id`.
    pub fn encode(listener_id: ListenerId, notification: &Notification) -> Result<Self, TransportError> {
        let payload = serde_json::to_vec(notification).map_err(|e| TransportError::Decode(e.to_string()))?;
        Ok(Self { listener_id, payload })
    }

    /// Deserializes the payload.
    pub fn decode(&self) -> Result<Notification, TransportError> {
        serde_json::from_slice(&self.payload).map_err(|e| TransportError::Decode(e.to_string()))
    }
}

/// Reply to a fetch call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchReply {
    /// Earliest retained sequence number.
    pub earliest_seq: SeqNum,
    /// Cursor for the next fetch.
    pub next_seq: SeqNum,
    /// Fetched events in order.
    pub events: Vec<WireEvent>,
}

impl FetchReply {
    /// Reply carrying bounds only.
    pub fn empty(earliest_seq: SeqNum, next_seq: SeqNum) -> Self {
        Self {
            earliest_seq,
            next_seq,
            events: Vec::new(),
        }
    }

    /// Encodes a buffer fetch result.
    pub fn from_result(result: &FetchResult) -> Result<Self, TransportError> {
        let events = result
            .events
            .iter()
            .map(|e| WireEvent::encode(e.listener_id, &e.notification))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            earliest_seq: result.earliest_seq,
            next_seq: result.next_seq,
            events,
        })
    }
}

/// Remote calls the client pump depends on.
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    /// Long-poll fetch from `cursor`; a negative cursor asks for bounds only.
    async fn fetch(&self, cursor: SeqNum, timeout: Duration, max_count: usize) -> Result<FetchReply, TransportError>;

    /// Registers a listener for member-removal notifications on the remote
    /// namespace root.
    async fn register_removal_tracking(&self) -> Result<ListenerId, TransportError>;

    /// Drops the removal-tracking listener `id`.
    async fn unregister_removal_tracking(&self, id: ListenerId) -> Result<(), TransportError>;
}

/// In-process transport bound to a [`ForwardingSession`].
pub struct LoopbackTransport {
    session: Arc<ForwardingSession>,
    principal: Option<Principal>,
}

impl LoopbackTransport {
    /// Transport calling `session` as `principal`.
    pub fn new(session: Arc<ForwardingSession>, principal: Option<Principal>) -> Self {
        Self { session, principal }
    }

    /// The bound session.
    pub fn session(&self) -> &Arc<ForwardingSession> {
        &self.session
    }
}

#[async_trait]
impl NotificationTransport for LoopbackTransport {
    async fn fetch(&self, cursor: SeqNum, timeout: Duration, max_count: usize) -> Result<FetchReply, TransportError> {
        let result = self
            .session
            .fetch(cursor, timeout, max_count, self.principal.as_ref())
            .await?;
        if result.disposed {
            return Err(TransportError::Terminated);
        }
        FetchReply::from_result(&result)
    }

    async fn register_removal_tracking(&self) -> Result<ListenerId, TransportError> {
        Ok(self.session.register_removal_tracking(self.principal.clone())?)
    }

    async fn unregister_removal_tracking(&self, id: ListenerId) -> Result<(), TransportError> {
        let root = self.session.root();
        Ok(self.session.remove_listener(&root, id, self.principal.as_ref())?)
    }
}

impl From<SessionError> for TransportError {
    fn from(value: SessionError) -> Self {
        match value {
            SessionError::Terminated
            | SessionError::Monitor(_)
            | SessionError::Buffer(BufferError::Disposed) => Self::Terminated,
            other => Self::Rejected(other.to_string()),
        }
    }
}
