//! Fixed-size byte buffer newtypes.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! impl_buf {
    ($name:ident, $len:expr) => {
        #[derive(
            Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
        )]
        pub struct $name(#[serde(with = "hex")] pub [u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            pub const fn new(data: [u8; $len]) -> Self {
                Self(data)
            }

            pub const fn zero() -> Self {
                Self([0; $len])
            }

            pub fn is_zero(&self) -> bool {
                self.0.iter().all(|b| *b == 0)
            }

            pub fn as_slice(&self) -> &[u8] {
                &self.0
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(data: [u8; $len]) -> Self {
                Self(data)
            }
        }

        impl From<$name> for [u8; $len] {
            fn from(buf: $name) -> Self {
                buf.0
            }
        }

        impl AsRef<[u8; $len]> for $name {
            fn as_ref(&self) -> &[u8; $len] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                // Abbreviated form for logs, first and last 4 bytes.
                f.write_str(&hex::encode(&self.0[..4]))?;
                f.write_str("..")?;
                f.write_str(&hex::encode(&self.0[$len - 4..]))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }
    };
}

impl_buf!(Buf20, 20);
impl_buf!(Buf32, 32);

/// An L2 account address.
pub type Address = Buf20;

/// A transaction hash.
pub type TxHash = Buf32;

/// A state root reported by the execution engine.
pub type StateRoot = Buf32;

/// A global or local exit root.
pub type ExitRoot = Buf32;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buf_roundtrip() {
        let mut data = [0u8; 32];
        for (i, b) in data.iter_mut().enumerate() {
            *b = i as u8;
        }
        let buf = Buf32::new(data);
        assert_eq!(<[u8; 32]>::from(buf), data);
        assert!(!buf.is_zero());
        assert!(Buf32::zero().is_zero());
    }

    #[test]
    fn test_display_abbreviates() {
        let buf = Buf32::new([0xab; 32]);
        assert_eq!(buf.to_string(), "abababab..abababab");
        assert_eq!(format!("{buf:?}").len(), 64);
    }

    #[test]
    fn test_serde_hex() {
        let buf = Buf20::new([0x11; 20]);
        let s = serde_json::to_string(&buf).unwrap();
        assert_eq!(s, format!("\"{}\"", "11".repeat(20)));
        let back: Buf20 = serde_json::from_str(&s).unwrap();
        assert_eq!(back, buf);
    }
}
