#![allow(clippy::new_without_default)]
//! RTP payload packetization and depacketization.
//!
//! This crate turns complete compressed media frames into sequences of RTP
//! packets bounded by a path MTU, and reassembles such packets back into the
//! original frames. Six payload formats are implemented: AV1, H264, H265,
//! VP8, VP9 and Opus. Everything is sans-IO: no sockets, no timers, no
//! threads. The caller moves bytes in and out.
//!
//! The crate has three layers:
//!
//! * [`rtp`] — the transport header codec ([`rtp::Header`], [`rtp::Packet`])
//!   and the [`rtp::Sequencer`] producing sequence numbers.
//! * [`packet`] — the per-codec payload codecs behind the
//!   [`packet::Packetizer`] and [`packet::Depacketizer`] traits.
//! * The facade — [`RtpPacketizer`] and [`RtpDepacketizer`], which combine
//!   a payload codec with header serialization and sequencing.
//!
//! ```
//! use rtp_payload::{Codec, RtpPacketizer, RtpDepacketizer};
//!
//! let mut packetizer = RtpPacketizer::new(Codec::Opus, 1200);
//! packetizer.set_payload_type(111);
//! packetizer.set_ssrc(0x1234_5678);
//!
//! let frame = vec![0x01, 0x02, 0x03];
//! let packets = packetizer.packetize(&frame).unwrap();
//! assert_eq!(packets.len(), 1);
//!
//! let mut depacketizer = RtpDepacketizer::new(Codec::Opus);
//! let out = depacketizer.depacketize(&packets[0]).unwrap();
//! assert_eq!(out.as_deref(), Some(&frame[..]));
//! ```

#[macro_use]
extern crate tracing;

use thiserror::Error;

mod codec;
pub use codec::Codec;

pub mod rtp;

pub mod packet;
pub use packet::{RtpDepacketizer, RtpPacketizer};

mod util;

/// Top level errors for the crate.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// Transport header errors.
    #[error("{0}")]
    Rtp(#[from] rtp::RtpError),

    /// Payload codec errors.
    #[error("{0}")]
    Packet(#[from] packet::PacketError),
}
