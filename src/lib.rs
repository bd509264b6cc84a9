//! Buffered notification forwarding between a managed-object namespace and
//! remote listeners.
//!
//! A [`buffer::BufferRegistry`] keeps one sequence-numbered ring of
//! notifications per namespace, shared by every connection to it. Each
//! connection's [`server::ForwardingSession`] long-polls that ring through its
//! own listener registrations, and a [`client::ClientNotifier`] on the other
//! end pumps the results to local callbacks, reporting anything lost.
//!
//! # Examples
//!
//! Buffer and fetch within one process:
//! ```
//! use std::{sync::Arc, time::Duration};
//!
//! use notifwd::{
//!     buffer::BufferRegistry,
//!     config::ForwarderConfig,
//!     namespace::{AllowAll, Namespace, local::LocalNamespace},
//!     server::ForwardingSession,
//!     types::ObjectId,
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! let ns = Arc::new(LocalNamespace::new("root"));
//! ns.register("sensor-1", true).expect("register");
//! let namespace: Arc<dyn Namespace> = ns.clone();
//!
//! let registry = BufferRegistry::new();
//! let session = ForwardingSession::new(&registry, namespace, Arc::new(AllowAll), &ForwarderConfig::default())
//!     .expect("session");
//! let target = ObjectId::new("sensor-1");
//! let id = session.register_listener(&target, None, None, None).expect("listen");
//!
//! let start = session.buffer().buffer().next_seq();
//! ns.publish(&target, "reading", "42").expect("publish");
//!
//! let result = session.fetch(start, Duration::from_secs(1), 10, None).await.expect("fetch");
//! assert_eq!(result.events.len(), 1);
//! assert_eq!(result.events[0].listener_id, id);
//! # }
//! ```
#![deny(missing_docs)]

/// Shared sequence-numbered buffers and their registry.
pub mod buffer;
/// Client-side pump, listener table and events.
pub mod client;
/// Forwarding configuration.
pub mod config;
/// Ring buffer primitive.
pub mod core;
/// Connection health monitoring.
pub mod health;
/// Namespace and access-control seams.
pub mod namespace;
/// Notification payloads and listener callbacks.
pub mod notification;
/// Per-connection server sessions.
pub mod server;
/// Fetch RPC seam and in-process loopback.
pub mod transport;
/// Shared identifiers and primitive types.
pub mod types;
