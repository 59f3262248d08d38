/*
    core_peer - Peer session lifecycle

    One Peer per established socket: hello handshake, packet dispatch,
    per-channel sync agents, invite relay, and notification fan-out.
    Ban-worthy violations terminate the session with an Error packet;
    transient failures leave it running.
*/

mod peer;

#[cfg(test)]
mod tests;

pub use peer::{Peer, PeerSession};
