//! # meshlink-transfer
//!
//! Payload handling on top of an established peer link: files are split into
//! checksummed chunks by the [`Chunker`], put back together by the
//! [`ReassemblyEngine`], and short text or JSON messages go through the
//! [`Broadcaster`] / [`MessageReceiver`] pair.
//!
//! A [`PeerInbox`] routes each inbound frame to the right one of them.
//!
//! Nothing here knows about links. Outbound bytes leave through caller
//! supplied send functions and inbound bytes are handed in by the caller.

pub mod broadcast;
pub mod chunker;
pub mod error;
pub mod inbox;
pub mod reassembly;

pub use broadcast::{BroadcastResult, Broadcaster, MessageReceiver, ReceiveOutcome, ReceiverEvent};
pub use chunker::{
    CancelFlag, Chunk, ChunkIter, ChunkProgress, ChunkSource, Chunker,
    ChunkerConfig, FileSource, MemorySource, SendReport, TransferMetadata,
};
pub use error::TransferError;
pub use inbox::{InboxEvent, PeerInbox};
pub use reassembly::{FrameOutcome, ReassemblyEngine, ReassemblyOutcome, ReassemblyProgress};
