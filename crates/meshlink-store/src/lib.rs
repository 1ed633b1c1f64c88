//! # meshlink-store
//!
//! Signaling state for meshlink sessions ("rooms"): who is in a session,
//! the pending offers/answers of the host/joiner bootstrap, and the queued
//! signals participants address to each other.
//!
//! The [`SignalingStore`] trait is the seam between the orchestrator and the
//! storage. [`MemoryStore`] is the process-wide in-memory implementation used
//! by the relay server; an HTTP client or an external shared store can
//! implement the same trait.

pub mod api;
pub mod clock;
pub mod config;
pub mod memory;
pub mod models;
pub mod store;

mod error;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use models::*;
pub use store::SignalingStore;
