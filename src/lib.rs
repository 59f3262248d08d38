//! PeerLinks core.
//!
//! A peer-to-peer protocol for end-to-end encrypted append-only channels
//! shared among an invitation-gated group of identities. Each channel is
//! a causally-ordered DAG of signed, encrypted messages that participants
//! converge on through gossip-style synchronization with untrusted
//! transport peers.
//!
//! The crate deliberately stops at the session boundary: discovery and
//! transport hand it an established byte socket, persistence hands it a
//! [`core_store::Storage`] implementation, and user interfaces sit on
//! top of [`protocol::Protocol`].

pub mod config;
pub mod constants;
pub mod core_channel;
pub mod core_crypto;
pub mod core_identity;
pub mod core_peer;
pub mod core_store;
pub mod core_sync;
pub mod error;
pub mod logging;
pub mod proto;
pub mod protocol;
pub mod types;

#[cfg(test)]
pub mod test_utils;

pub use config::ProtocolConfig;
pub use core_channel::{Body, Channel, Message};
pub use core_identity::{Chain, Identity, Link};
pub use core_store::{MemoryStorage, Storage};
pub use error::{BanError, Error, Result};
pub use logging::{init_logging, LogLevel};
pub use protocol::Protocol;
pub use types::{ChannelId, MessageHash, PeerId};
