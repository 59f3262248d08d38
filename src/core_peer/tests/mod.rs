/*
    Peer session test suite

    End-to-end sessions over in-memory duplex sockets: handshake, gossip
    convergence, invite relay, liveness, and ban behavior.
*/
