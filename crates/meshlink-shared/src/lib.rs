//! # meshlink-shared
//!
//! Types shared by every meshlink crate: participant and session ids, the
//! signaling payloads exchanged through the relay, the peer-to-peer wire
//! protocol, content checksums and connection strings.

pub mod checksum;
pub mod constants;
pub mod error;
pub mod invite;
pub mod protocol;
pub mod types;

pub use error::MeshlinkError;
pub use types::{LinkRole, ParticipantId, Role, SessionId};
