//! # meshlink-mesh
//!
//! Connection orchestration for meshlink sessions.
//!
//! The orchestrator runs as a tokio task per local participant. It registers
//! with a [`SignalingStore`](meshlink_store::SignalingStore), polls it for
//! offers, answers and signals, and drives peer links created through a
//! [`PeerTransport`](link::PeerTransport) until they connect. Application code
//! talks to it through a [`MeshHandle`] and a stream of
//! [`MeshNotification`]s.

pub mod config;
pub mod error;
pub mod http;
pub mod link;
pub mod memory;
pub mod orchestrator;
pub mod registry;
pub mod retry;
pub mod tasks;

pub use config::{BootstrapMode, MeshConfig};
pub use error::MeshError;
pub use http::HttpRelay;
pub use link::{LinkConfig, LinkError, LinkEvent, LinkEventKind, LinkState, PeerLink, PeerTransport};
pub use memory::MemoryTransport;
pub use orchestrator::{spawn_orchestrator, ConnectionState, MeshHandle, MeshNotification};
pub use registry::{PeerLinkHandle, PeerRegistry};
