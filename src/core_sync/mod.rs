/*
    core_sync - Per-peer channel synchronization

    One SyncAgent exists per (peer session, channel). It drives the
    channel's discovery-and-fetch loop over the peer's packet stream,
    matching encrypted responses to requests by sequence number and
    coalescing re-entrant synchronize triggers.
*/

mod agent;

pub use agent::{AgentSigner, SyncAgent};
