//! Core identifier newtypes.
//!
//! All 32-byte identifiers get their own type so a channel id can never be
//! passed where a message hash is expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::constants::{HASH_SIZE, ID_LENGTH};
use crate::error::BanError;

macro_rules! id_type {
    ($name:ident, $len:expr, $field:expr) => {
        /// 32-byte identifier.
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            /// Wrap raw bytes.
            pub const fn from_bytes(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            /// Borrow the raw bytes.
            pub const fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            /// Hex encoding, used for entity keys and wait-list ids.
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Parse from a wire-transported byte slice, rejecting any
            /// length other than 32.
            pub fn from_slice(slice: &[u8]) -> Result<Self, BanError> {
                let arr: [u8; $len] = slice.try_into().map_err(|_| BanError::InvalidLength {
                    field: $field,
                    actual: slice.len(),
                })?;
                Ok(Self(arr))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), &self.to_hex()[..16])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", &self.to_hex()[..16])
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }
    };
}

id_type!(ChannelId, ID_LENGTH, "channel id");
id_type!(MessageHash, HASH_SIZE, "message hash");
id_type!(PeerId, ID_LENGTH, "peer id");

/// Current wall-clock time as floating-point seconds since the epoch.
///
/// Message and link timestamps are `double` on the wire, matching existing
/// deployments.
pub fn now_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_slice_rejects_short_input() {
        let err = ChannelId::from_slice(&[0u8; 16]).unwrap_err();
        assert!(matches!(
            err,
            BanError::InvalidLength { field: "channel id", actual: 16 }
        ));
    }

    #[test]
    fn test_hex_roundtrip() {
        let hash = MessageHash::from_bytes([0xab; 32]);
        assert_eq!(hash.to_hex(), "ab".repeat(32));
        assert_eq!(format!("{}", hash), "abababababababab");
    }

    #[test]
    fn test_debug_is_truncated() {
        let id = PeerId::from_bytes([0xcd; 32]);
        assert_eq!(format!("{:?}", id), "PeerId(cdcdcdcdcdcdcdcd)");
    }

    #[test]
    fn test_now_seconds_is_positive() {
        assert!(now_seconds() > 0.0);
    }
}
