//! Length-delimited framing over an established byte socket.
//!
//! The core does not dial or accept connections; it is handed a
//! bidirectional stream and wraps it in a bounded length-prefixed codec.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use super::Packet;
use crate::error::Result;

/// Framed packet stream over any async byte socket.
pub type PacketFraming<T> = Framed<T, LengthDelimitedCodec>;

/// Wrap the given socket in a length-delimited frame codec with the given
/// maximum frame length.
pub fn framed<T>(socket: T, max_frame_len: usize) -> PacketFraming<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    Framed::new(
        socket,
        LengthDelimitedCodec::builder()
            .max_frame_length(max_frame_len)
            .new_codec(),
    )
}

/// Encode a packet into a frame body.
pub fn encode_packet(packet: &Packet) -> Bytes {
    Bytes::from(super::encode(packet))
}

/// Decode a frame body into a packet; malformed input is ban-worthy.
pub fn decode_packet(frame: &[u8]) -> Result<Packet> {
    super::decode(frame)
}
