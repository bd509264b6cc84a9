//! Client side of notification forwarding.

/// Loss and lifecycle events emitted by the pump.
pub mod events;
/// Local listener table.
pub mod listeners;
/// Cursor-driven fetch pump and dispatch.
pub mod notifier;

pub use events::{ClientEvent, LossReason};
pub use listeners::ClientListenerEntry;
pub use notifier::{ClientNotifier, NotifierError};
