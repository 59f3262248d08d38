//! Wire schema for the PeerLinks protocol.
//!
//! Hand-maintained prost structs. Field numbers and wire types are part of
//! the protocol contract and MUST be preserved bit-exactly; treat every
//! `tag` below as frozen.
//!
//! `Link.Tbs.channel_id` and `Content.Tbs` exist only as signing inputs:
//! the channel id travels empty on the wire and is injected locally before
//! sign/verify.

pub mod framing;

use prost::Message as ProstMessage;

use crate::error::{BanError, Error, Result};

/// Session greeting. `version` MUST be 1 and `peer_id` MUST be 32 bytes.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Hello {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub peer_id: ::std::vec::Vec<u8>,
}

/// Signing input of a [`Link`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LinkTbs {
    #[prost(bytes = "vec", tag = "1")]
    pub trustee_pub_key: ::std::vec::Vec<u8>,
    #[prost(string, tag = "2")]
    pub trustee_display_name: ::std::string::String,
    #[prost(double, tag = "3")]
    pub valid_from: f64,
    #[prost(double, tag = "4")]
    pub valid_to: f64,
    /// Transported empty; filled in locally before sign/verify so a link
    /// is bound to exactly one channel.
    #[prost(bytes = "vec", tag = "5")]
    pub channel_id: ::std::vec::Vec<u8>,
}

/// One delegation step from a signer to a trustee key.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Link {
    #[prost(message, optional, tag = "1")]
    pub tbs: ::std::option::Option<LinkTbs>,
    #[prost(bytes = "vec", tag = "2")]
    pub signature: ::std::vec::Vec<u8>,
}

/// Invite payload sealed to the requester's box key.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Invite {
    #[prost(bytes = "vec", tag = "1")]
    pub channel_pub_key: ::std::vec::Vec<u8>,
    #[prost(string, tag = "2")]
    pub channel_name: ::std::string::String,
    #[prost(message, repeated, tag = "3")]
    pub chain: ::std::vec::Vec<Link>,
}

/// Sealed invite relayed through peers to the requester.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EncryptedInvite {
    #[prost(bytes = "vec", tag = "1")]
    pub request_id: ::std::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub r#box: ::std::vec::Vec<u8>,
}

/// Out-of-band request for an invitation.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InviteRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub peer_id: ::std::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub trustee_pub_key: ::std::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub box_pub_key: ::std::vec::Vec<u8>,
}

/// Message body: the unique root marker, or an opaque JSON string.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Body {
    #[prost(oneof = "body::Body", tags = "1, 2")]
    pub body: ::std::option::Option<body::Body>,
}
pub mod body {
    /// Empty marker for the channel root message.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Root {}

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Body {
        #[prost(message, tag = "1")]
        Root(Root),
        #[prost(string, tag = "2")]
        Json(::std::string::String),
    }
}

/// Signing input of a channel message. `parents` and `height` come from
/// the enclosing envelope; the rest from the decrypted content.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContentTbs {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub parents: ::std::vec::Vec<::std::vec::Vec<u8>>,
    #[prost(int64, tag = "2")]
    pub height: i64,
    #[prost(message, repeated, tag = "3")]
    pub chain: ::std::vec::Vec<Link>,
    #[prost(double, tag = "4")]
    pub timestamp: f64,
    #[prost(message, optional, tag = "5")]
    pub body: ::std::option::Option<Body>,
}

/// Decrypted payload of a channel message.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Content {
    #[prost(message, repeated, tag = "1")]
    pub chain: ::std::vec::Vec<Link>,
    #[prost(double, tag = "2")]
    pub timestamp: f64,
    #[prost(message, optional, tag = "3")]
    pub body: ::std::option::Option<Body>,
    #[prost(bytes = "vec", tag = "4")]
    pub signature: ::std::vec::Vec<u8>,
}

/// Encrypted channel message as transported and stored. The content hash
/// covers the canonical encoding of this record.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChannelMessage {
    #[prost(bytes = "vec", tag = "1")]
    pub channel_id: ::std::vec::Vec<u8>,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub parents: ::std::vec::Vec<::std::vec::Vec<u8>>,
    #[prost(int64, tag = "3")]
    pub height: i64,
    #[prost(bytes = "vec", tag = "4")]
    pub nonce: ::std::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "5")]
    pub encrypted_content: ::std::vec::Vec<u8>,
}

/// DAG discovery request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Query {
    #[prost(bool, tag = "3")]
    pub is_backward: bool,
    #[prost(uint32, tag = "4")]
    pub limit: u32,
    #[prost(oneof = "query::Cursor", tags = "1, 2")]
    pub cursor: ::std::option::Option<query::Cursor>,
}
pub mod query {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Cursor {
        #[prost(int64, tag = "1")]
        Height(i64),
        #[prost(bytes, tag = "2")]
        Hash(::std::vec::Vec<u8>),
    }
}

/// Parent list and hash of a known message, enough for DAG discovery.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AbbreviatedMessage {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub parents: ::std::vec::Vec<::std::vec::Vec<u8>>,
    #[prost(bytes = "vec", tag = "2")]
    pub hash: ::std::vec::Vec<u8>,
}

/// Slice of the CRDT linearization around the query cursor.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueryResponse {
    #[prost(message, repeated, tag = "1")]
    pub abbreviated_messages: ::std::vec::Vec<AbbreviatedMessage>,
    /// Hash of the message immediately after the slice, or empty.
    #[prost(bytes = "vec", tag = "2")]
    pub forward_hash: ::std::vec::Vec<u8>,
    /// Hash of the first returned message unless the slice starts at
    /// offset zero, or empty.
    #[prost(bytes = "vec", tag = "3")]
    pub backward_hash: ::std::vec::Vec<u8>,
}

/// Full-message fetch by hash.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Bulk {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub hashes: ::std::vec::Vec<::std::vec::Vec<u8>>,
}

/// Subset of requested messages present in storage, in request order.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BulkResponse {
    #[prost(message, repeated, tag = "1")]
    pub messages: ::std::vec::Vec<ChannelMessage>,
    /// Number of input hashes processed; the client resumes from here.
    #[prost(uint32, tag = "2")]
    pub forward_index: u32,
}

/// Signed, sealed content of a [`SyncRequest`].
///
/// The signature covers the canonical encoding of this message with the
/// `signature` field cleared. Member requests carry a chain; feed requests
/// carry a bare ephemeral public key and an empty chain.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SyncRequestContent {
    #[prost(message, repeated, tag = "1")]
    pub chain: ::std::vec::Vec<Link>,
    #[prost(bytes = "vec", tag = "2")]
    pub public_key: ::std::vec::Vec<u8>,
    #[prost(double, tag = "3")]
    pub timestamp: f64,
    #[prost(bytes = "vec", tag = "6")]
    pub signature: ::std::vec::Vec<u8>,
    #[prost(oneof = "sync_request_content::Content", tags = "4, 5")]
    pub content: ::std::option::Option<sync_request_content::Content>,
}
pub mod sync_request_content {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Content {
        #[prost(message, tag = "4")]
        Query(super::Query),
        #[prost(message, tag = "5")]
        Bulk(super::Bulk),
    }
}

/// Sealed content of a [`SyncResponse`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SyncResponseContent {
    #[prost(oneof = "sync_response_content::Content", tags = "1, 2")]
    pub content: ::std::option::Option<sync_response_content::Content>,
}
pub mod sync_response_content {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Content {
        #[prost(message, tag = "1")]
        QueryResponse(super::QueryResponse),
        #[prost(message, tag = "2")]
        BulkResponse(super::BulkResponse),
    }
}

/// Envelope for an encrypted query or bulk request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SyncRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub channel_id: ::std::vec::Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub seq: u32,
    #[prost(bytes = "vec", tag = "3")]
    pub nonce: ::std::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub r#box: ::std::vec::Vec<u8>,
}

/// Envelope for an encrypted query or bulk response. The box carries
/// `nonce ‖ ciphertext` since this envelope has no nonce field.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SyncResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub channel_id: ::std::vec::Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub seq: u32,
    #[prost(bytes = "vec", tag = "3")]
    pub r#box: ::std::vec::Vec<u8>,
}

/// Hint that a channel has new messages; receivers coalesce.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Notification {
    #[prost(bytes = "vec", tag = "1")]
    pub channel_id: ::std::vec::Vec<u8>,
}

/// Session-terminating error with a diagnostic reason.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PacketError {
    #[prost(string, tag = "1")]
    pub reason: ::std::string::String,
}

/// Liveness probe.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ping {
    #[prost(uint32, tag = "1")]
    pub seq: u32,
}

/// Liveness reply, echoing the probe seq.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Pong {
    #[prost(uint32, tag = "1")]
    pub seq: u32,
}

/// Top-level frame exchanged between peers after the Hello handshake.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Packet {
    #[prost(oneof = "packet::Content", tags = "1, 2, 3, 4, 5, 6, 7")]
    pub content: ::std::option::Option<packet::Content>,
}
pub mod packet {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Content {
        #[prost(message, tag = "1")]
        Error(super::PacketError),
        #[prost(message, tag = "2")]
        Invite(super::EncryptedInvite),
        #[prost(message, tag = "3")]
        SyncRequest(super::SyncRequest),
        #[prost(message, tag = "4")]
        SyncResponse(super::SyncResponse),
        #[prost(message, tag = "5")]
        Notification(super::Notification),
        #[prost(message, tag = "6")]
        Ping(super::Ping),
        #[prost(message, tag = "7")]
        Pong(super::Pong),
    }
}

/// Encode any wire message to its canonical byte form.
pub fn encode<M: ProstMessage>(message: &M) -> Vec<u8> {
    message.encode_to_vec()
}

/// Decode a wire message, mapping failures to a ban-worthy error.
pub fn decode<M: ProstMessage + Default>(bytes: &[u8]) -> Result<M> {
    M::decode(bytes).map_err(|err| Error::Ban(BanError::MalformedPacket(err.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_roundtrip() {
        let packet = Packet {
            content: Some(packet::Content::Notification(Notification {
                channel_id: vec![7u8; 32],
            })),
        };
        let bytes = encode(&packet);
        let decoded: Packet = decode(&bytes).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_body_oneof_roundtrip() {
        let root = Body { body: Some(body::Body::Root(body::Root {})) };
        let decoded: Body = decode(&encode(&root)).unwrap();
        assert_eq!(decoded, root);

        let json = Body { body: Some(body::Body::Json("{\"a\":1}".into())) };
        let decoded: Body = decode(&encode(&json)).unwrap();
        assert_eq!(decoded, json);
    }

    #[test]
    fn test_query_cursor_tags() {
        // Height cursor must land on field 1, hash cursor on field 2.
        let by_height = Query {
            cursor: Some(query::Cursor::Height(42)),
            is_backward: false,
            limit: 10,
        };
        let bytes = encode(&by_height);
        assert_eq!(bytes[0], 0x08); // field 1, varint

        let by_hash = Query {
            cursor: Some(query::Cursor::Hash(vec![1u8; 32])),
            is_backward: true,
            limit: 10,
        };
        let bytes = encode(&by_hash);
        assert_eq!(bytes[0], 0x12); // field 2, length-delimited
    }

    #[test]
    fn test_decode_garbage_is_ban() {
        let err = decode::<Packet>(&[0xff, 0xff, 0xff]).unwrap_err();
        assert!(err.is_ban());
    }
}
