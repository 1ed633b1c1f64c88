/// Scheme used by out-of-band connection strings.
pub const CONNECTION_SCHEME: &str = "meshlink";

/// Application name
pub const APP_NAME: &str = "meshlink";

/// Maximum session id length in characters
pub const MAX_SESSION_ID_LEN: usize = 64;

/// Sessions expire this long after their last mutation (30 minutes)
pub const SESSION_TTL_SECS: i64 = 30 * 60;

/// Participants without a heartbeat for this long are pruned (2.5 minutes)
pub const PARTICIPANT_TIMEOUT_SECS: i64 = 150;

/// Grace period for a session whose last participant left
pub const EMPTY_SESSION_GRACE_SECS: i64 = 60;

/// Store sweep interval in seconds
pub const SWEEP_INTERVAL_SECS: u64 = 60;

/// Heartbeat interval in milliseconds
pub const HEARTBEAT_INTERVAL_MS: u64 = 60_000;

/// Signal/answer polling interval in milliseconds
pub const POLL_INTERVAL_MS: u64 = 1_500;

/// Counterpart roster refresh interval in milliseconds
pub const ROSTER_INTERVAL_MS: u64 = 3_000;

/// Gap between two offer fetch attempts of a joiner
pub const OFFER_FETCH_INTERVAL_MS: u64 = 2_000;

/// Offer fetch attempts before a joiner gives up
pub const OFFER_FETCH_ATTEMPTS: u32 = 15;

/// Deadline for an initiator attempt to reach `connected`
pub const HANDSHAKE_TIMEOUT_MS: u64 = 12_000;

/// Retries per counterpart after the first initiator attempt
pub const MAX_HANDSHAKE_RETRIES: u32 = 2;

/// Bound on the relay call made when leaving a session
pub const LEAVE_TIMEOUT_MS: u64 = 2_000;

/// Mesh size cap (single-digit meshes)
pub const MAX_MESH_PEERS: usize = 8;

/// Default chunk size (16 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Upper bound for the configurable chunk size (256 KiB)
pub const MAX_CHUNK_SIZE: usize = 256 * 1024;

/// Broadcast recipients that have not confirmed within this long count as failed
pub const CONFIRMATION_TIMEOUT_SECS: u64 = 30;

/// Cancelled transfer ids are remembered this long to drop late chunks
pub const CANCELLED_TRANSFER_RETENTION_SECS: u64 = 600;

/// Maximum text/structured message size in bytes (256 KiB)
pub const MAX_MESSAGE_SIZE: usize = 262_144;

/// BLAKE3 key derivation context for connection-string passwords
pub const KDF_CONTEXT_SESSION_PASSWORD: &str = "meshlink-session-password-v1";
