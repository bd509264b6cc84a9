//! Server side of notification forwarding.

/// Target-keyed listener registrations.
pub mod registrations;
/// Per-connection forwarding session.
pub mod session;

pub use registrations::ListenerRegistration;
pub use session::{ForwardingSession, SessionError};
