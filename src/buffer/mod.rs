//! Shared, sequence-numbered event buffering.

mod attach;
/// Ring-backed buffer with long-poll fetch.
pub mod event_buffer;
/// Namespace-to-buffer registry and sharer handles.
pub mod registry;

pub use event_buffer::{BufferError, BufferFilter, EventBuffer, FetchRequest, FetchResult};
pub use registry::{BufferRegistry, SharedBuffer, SharerId};
