//! Identities and the channel trust chain.
//!
//! A channel's root public key delegates posting rights through signed,
//! time-bounded [`Link`]s. An ordered sequence of links forms a [`Chain`];
//! the terminal trustee key is the leaf key authorized to sign messages.
//! [`Identity`] owns the long-lived Ed25519 keypair and one chain per
//! channel it belongs to.

mod chain;
mod identity;
mod link;

pub use chain::Chain;
pub use identity::{Identity, InviteBox};
pub use link::Link;
