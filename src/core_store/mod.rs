/*
    core_store - Per-channel message persistence

    The storage layer owns every persisted byte: the CRDT-ordered message
    index, the leaf set, the hash index, and the entity blob store used
    for channels and identities. Channels coordinate access but never
    bypass this interface.

    Backends are pluggable behind the object-safe `Storage` trait; the
    in-memory implementation is the reference for ordering semantics.
*/

pub mod memory;
pub mod traits;

pub use memory::MemoryStorage;
pub use traits::{Cursor, QuerySlice, Storage};
