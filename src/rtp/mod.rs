//! Transport level types: the RTP header codec, full packets and sequencing.

mod id;
pub use id::{Pt, Ssrc};

mod error;
pub use error::RtpError;

mod header;
pub use header::{Extension, Header, EXTENSION_PROFILE_ONE_BYTE, EXTENSION_PROFILE_TWO_BYTE};

mod packet;
pub use packet::Packet;

mod seq;
pub use seq::Sequencer;
