//! Error types for the PeerLinks core.
//!
//! Two taxonomies:
//! - [`BanError`] covers wire-level protocol violations and cryptographic
//!   failures attributable to the remote peer. Any ban error reaching the
//!   peer loop terminates the session with an `Error` packet.
//! - [`Error`] covers everything the caller can observe, including local
//!   misuse (no chain for a channel, posting a root body) which must never
//!   kill a session.

use thiserror::Error as ThisError;

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Protocol violations attributable to the remote peer.
#[derive(Debug, Clone, ThisError)]
pub enum BanError {
    /// Symmetric decryption failed (wrong key or corrupted box).
    #[error("decryption failed")]
    DecryptionFailed,

    /// Decrypted body claimed to be JSON but did not parse.
    #[error("invalid JSON")]
    InvalidJson,

    /// Signature or signing-chain verification failed.
    #[error("invalid signature or chain")]
    InvalidSignature,

    /// A referenced parent is not present in local storage.
    #[error("parent not found: {0}")]
    ParentNotFound(String),

    /// Parents of a message are spread wider than the allowed delta.
    #[error("parent timestamp delta exceeded")]
    ParentDelta,

    /// Declared height does not match `1 + max(parent heights)`.
    #[error("invalid height")]
    InvalidHeight,

    /// Timestamp is in the future or regresses below a parent.
    #[error("invalid timestamp")]
    InvalidTimestamp,

    /// Message carries more parents than allowed.
    #[error("too many parents: {0}")]
    TooManyParents(usize),

    /// Body shape does not match the message position (root vs json).
    #[error("invalid body: {0}")]
    InvalidBody(String),

    /// JSON body exceeds the limit for the sender's chain length.
    #[error("JSON body too large: {size} > {limit}")]
    JsonTooLarge { size: usize, limit: usize },

    /// A wire field has the wrong length.
    #[error("invalid length of {field}: {actual}")]
    InvalidLength { field: &'static str, actual: usize },

    /// Signing chain is longer than the protocol allows.
    #[error("chain length overflow: {0}")]
    ChainTooLong(usize),

    /// Query response carried more entries than the negotiated limit.
    #[error("query response overflow: {0}")]
    QueryOverflow(usize),

    /// Response seq does not match any in-flight request.
    #[error("unexpected response seq: {0}")]
    UnexpectedSeq(u32),

    /// Response type does not match the pending request.
    #[error("expected {expected} response")]
    UnexpectedResponseType { expected: &'static str },

    /// A message referenced a missing parent during full sync.
    #[error("missing parent in full sync")]
    MissingParentInFullSync,

    /// Hello handshake carried an unsupported version.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u32),

    /// A packet failed protobuf decoding or shape validation.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),
}

/// Errors surfaced by the PeerLinks core.
#[derive(Debug, ThisError)]
pub enum Error {
    /// Remote-attributable protocol violation; terminates the session.
    #[error(transparent)]
    Ban(#[from] BanError),

    /// The identity holds no signing chain for the channel.
    #[error("no chain for channel: {0}")]
    NoChain(String),

    /// Message body exceeds the limit for the identity's chain length.
    #[error("body too large: {size} > {limit}")]
    BodyTooLarge { size: usize, limit: usize },

    /// All current leaves are too old to use as parents.
    #[error("no recent leaves available")]
    NoLeaves,

    /// The channel has no messages yet; sync before posting.
    #[error("channel is not synchronized")]
    NotSynchronized,

    /// Root bodies may not be posted through `post`.
    #[error("root body may not be posted")]
    RootRejected,

    /// An identity or channel with this name already exists.
    #[error("duplicate name: {0}")]
    DuplicateName(String),

    /// No channel registered under this id.
    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    /// An invite failed local validation.
    #[error("invalid invite: {0}")]
    InvalidInvite(String),

    /// A caller-supplied argument is out of bounds.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation timed out.
    #[error("timed out")]
    Timeout,

    /// The peer, agent, or channel was closed.
    #[error("closed")]
    Closed,

    /// Storage backend failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Local encode/decode failure not attributable to the remote.
    #[error("codec error: {0}")]
    Codec(String),

    /// Socket-level I/O failure.
    #[error("i/o error: {0}")]
    Io(String),
}

impl Error {
    /// Whether this error must terminate the peer session.
    pub fn is_ban(&self) -> bool {
        matches!(self, Error::Ban(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<prost::DecodeError> for Error {
    fn from(err: prost::DecodeError) -> Self {
        Error::Ban(BanError::MalformedPacket(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ban_error_display() {
        let err = BanError::ParentNotFound("ab12".to_string());
        assert_eq!(err.to_string(), "parent not found: ab12");
    }

    #[test]
    fn test_is_ban() {
        let ban: Error = BanError::DecryptionFailed.into();
        assert!(ban.is_ban());
        assert!(!Error::NoLeaves.is_ban());
        assert!(!Error::Timeout.is_ban());
    }

    #[test]
    fn test_decode_error_is_ban() {
        let err: Error = prost::DecodeError::new("truncated").into();
        assert!(err.is_ban());
    }
}
