/*
    core_channel - Encrypted append-only channel DAG

    A channel is a causally-ordered DAG of signed, symmetrically encrypted
    messages rooted at a single root message. This module owns the DAG
    acceptance rules, posting, the query/bulk services answered on behalf
    of remote peers, and the discovery-and-fetch sync driver.
*/

mod channel;
mod message;

#[cfg(test)]
mod tests;

pub use channel::{AbbreviatedEntry, BulkResult, Channel, QueryResult, RemoteChannel};
pub use message::{Body, Content, Message};
