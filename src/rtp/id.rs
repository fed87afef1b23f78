use std::fmt;
use std::ops::Deref;

use serde::{Deserialize, Serialize};

use crate::util::NonCryptographicRng;

macro_rules! num_id {
    ($id:ident, $t:tt) => {
        impl $id {
            /// Creates a new random id.
            pub fn new() -> Self {
                $id(NonCryptographicRng::$t())
            }
        }

        impl Deref for $id {
            type Target = $t;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl From<$t> for $id {
            fn from(v: $t) -> Self {
                $id(v)
            }
        }

        impl fmt::Display for $id {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

/// Synchronization source.
///
/// Uniquely identifies a sending source of data. Each stream of RTP packets
/// is associated with exactly one synchronization source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ssrc(u32);
num_id!(Ssrc, u32);

/// Payload type.
///
/// The payload type identifies which codec and format parameters a stream is
/// sent with. PTs in RTP headers are 7 bits. Values >= 128 are not valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pt(u8);
num_id!(Pt, u8);

impl Default for Pt {
    fn default() -> Self {
        Pt(0)
    }
}

impl Default for Ssrc {
    fn default() -> Self {
        Ssrc(0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pt_deref_and_from() {
        let pt: Pt = 111.into();
        assert_eq!(*pt, 111);
        assert_eq!(pt.to_string(), "111");
    }

    #[test]
    fn ssrc_from() {
        let ssrc: Ssrc = 0xDEAD_BEEF.into();
        assert_eq!(*ssrc, 0xDEAD_BEEF);
    }
}
