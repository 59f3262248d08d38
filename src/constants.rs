//! Protocol-wide constants.
//!
//! Values here are part of the wire contract; changing them breaks
//! interoperability with existing deployments.

use std::time::Duration;

/// Protocol version sent in the `Hello` packet.
pub const VERSION: u32 = 1;

/// Length of peer and channel identifiers in bytes.
pub const ID_LENGTH: usize = 32;

/// Length of message content hashes in bytes.
pub const HASH_SIZE: usize = 32;

/// Length of an Ed25519 public key in bytes.
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// Length of an Ed25519 signature in bytes.
pub const SIGNATURE_LENGTH: usize = 64;

/// Length of a secretbox nonce in bytes.
pub const NONCE_LENGTH: usize = 24;

/// Maximum number of links in a signing chain.
pub const MAX_CHAIN_LENGTH: usize = 3;

/// Maximum byte length of a trustee display name.
pub const MAX_DISPLAY_NAME_LENGTH: usize = 128;

/// Maximum byte length of a channel name.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 128;

/// Default validity window of an issued link: 99 days.
pub const EXPIRATION_DELTA: f64 = 99.0 * 24.0 * 3600.0;

/// Maximum allowed spread between a message's parents: 30 days.
pub const MAX_PARENT_DELTA: f64 = 30.0 * 24.0 * 3600.0;

/// Tolerated clock skew into the future for message timestamps.
pub const FUTURE: f64 = 120.0;

/// Maximum number of abbreviated messages in a single query response.
pub const MAX_QUERY_LIMIT: usize = 1024;

/// Unresolved-parent bound before the sync loop falls back to full sync.
pub const MAX_UNRESOLVED_COUNT: usize = 262_144;

/// Maximum number of full messages in a single bulk response.
pub const MAX_BULK_COUNT: usize = 128;

/// Maximum number of parents a message may carry, and the bound on the
/// leaf set returned at query time.
pub const MAX_LEAVES_COUNT: usize = 128;

/// Deadline for a single sync request before it resolves empty.
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(15);

/// Maximum byte length of an `Error` packet reason.
pub const MAX_ERROR_REASON_LEN: usize = 1024;

/// Upper bound on a single length-delimited frame.
pub const MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

/// Keyed-hash domain for deriving a channel id from its public key.
pub const CHANNEL_ID_KEY: &[u8] = b"peerlinks-channel-id";

/// Keyed-hash domain for deriving a channel's symmetric key.
pub const CHANNEL_SYMMETRIC_KEY: &[u8] = b"peerlinks-symmetric";

/// Keyed-hash domain for deriving an invite request id.
pub const INVITE_REQUEST_KEY: &[u8] = b"peerlinks-invite";

/// JSON body size limits indexed by chain length (root body excluded).
pub const MAX_JSON_LIMITS: [usize; 4] = [usize::MAX, 2_097_152, 524_288, 8_192];
