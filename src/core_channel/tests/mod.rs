/*
    Channel test suite

    1. Message encryption, hashing, and verification
    2. DAG acceptance rules and invariants
    3. Two-replica synchronization and convergence
*/

mod message_tests;
mod sync_tests;
