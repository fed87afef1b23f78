//! Per-codec payload codecs and the codec-selecting facade.

use std::fmt;

use thiserror::Error;

use crate::Codec;

pub(crate) mod leb128;

mod opus;
pub use opus::{OpusDepacketizer, OpusPacketizer};

mod vp8;
pub use vp8::{Vp8Depacketizer, Vp8Packetizer};

mod vp9;
pub use vp9::{Vp9Depacketizer, Vp9Packetizer};

mod h264;
pub use h264::{H264Depacketizer, H264Packetizer};

mod h265;
pub use h265::{
    H265AggregationPacket, H265AggregationUnit, H265AggregationUnitFirst, H265Depacketizer,
    H265FragmentationUnitHeader, H265FragmentationUnitPacket, H265NALUHeader, H265PACIPacket,
    H265Packetizer, H265Payload, H265SingleNALUnitPacket, H265TSCI,
};

mod av1;
pub use av1::{Av1Depacketizer, Av1Packetizer, ObuExtension, ObuHeader};

mod payload;
pub use payload::{RtpDepacketizer, RtpPacketizer, DEFAULT_MTU};

/// Errors arising in packet- and depacketization.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    /// The input ended mid-field.
    #[error("packet is too short")]
    ShortPacket,

    /// A forbidden bit is set or a reserved invariant is violated.
    #[error("corrupted packet")]
    Corrupted,

    /// The receiver saw a NAL unit type it does not implement.
    #[error("NALU type is not handled: {0}")]
    UnhandledNaluType(u8),

    /// Packetization cannot produce any valid output within the MTU.
    #[error("frame does not fit within the MTU")]
    FrameTooLarge,

    /// VP9 scalability structure names too many spatial layers.
    #[error("too many spatial layers")]
    TooManySpatialLayers,

    /// VP9 reference indices name too many P_DIFF entries.
    #[error("too many reference P_DIFF entries")]
    TooManyReferences,
}

/// Chunks one frame into RTP payload blobs, each at most `mtu` octets.
pub trait Packetizer: fmt::Debug {
    /// Fragment `frame` across one or more payloads.
    fn packetize(&mut self, mtu: usize, frame: &[u8]) -> Result<Vec<Vec<u8>>, PacketError>;
}

/// Reassembles RTP payload blobs into frames.
///
/// Removes any RTP specific framing from the payload. A depacketizer is
/// stateful for codecs that fragment: feeding a middle fragment appends
/// nothing to `out` until the final fragment arrives.
pub trait Depacketizer: fmt::Debug {
    /// Unpack one RTP payload into `out`.
    fn depacketize(&mut self, packet: &[u8], out: &mut Vec<u8>) -> Result<(), PacketError>;

    /// Checks if the packet is at the beginning of a partition.
    ///
    /// Returns false if the result could not be determined.
    fn is_partition_head(&self, packet: &[u8]) -> bool;

    /// Checks if the packet is at the end of a partition.
    ///
    /// Returns false if the result could not be determined.
    fn is_partition_tail(&self, marker: bool, packet: &[u8]) -> bool;
}

/// Helper to replace Bytes. Provides get_u8 and get_u16 over some buffer of bytes.
pub(crate) trait BitRead {
    fn remaining(&self) -> usize;
    fn get_u8(&mut self) -> Option<u8>;
    fn get_u16(&mut self) -> Option<u16>;
}

impl BitRead for (&[u8], usize) {
    #[inline(always)]
    fn remaining(&self) -> usize {
        (self.0.len() * 8).saturating_sub(self.1)
    }

    #[inline(always)]
    fn get_u8(&mut self) -> Option<u8> {
        if self.remaining() < 8 {
            return None;
        }

        let offs = self.1 / 8;
        let shift = (self.1 % 8) as u32;
        self.1 += 8;

        let mut n = self.0[offs];

        if shift > 0 {
            n <<= shift;
            n |= self.0[offs + 1] >> (8 - shift)
        }

        Some(n)
    }

    fn get_u16(&mut self) -> Option<u16> {
        if self.remaining() < 16 {
            return None;
        }
        Some(u16::from_be_bytes([self.get_u8()?, self.get_u8()?]))
    }
}

#[derive(Debug)]
pub(crate) enum CodecPacketizer {
    Av1(Av1Packetizer),
    H264(H264Packetizer),
    H265(H265Packetizer),
    Opus(OpusPacketizer),
    Vp8(Vp8Packetizer),
    Vp9(Vp9Packetizer),
}

#[derive(Debug)]
pub(crate) enum CodecDepacketizer {
    Av1(Av1Depacketizer),
    H264(H264Depacketizer),
    H265(H265Depacketizer),
    Opus(OpusDepacketizer),
    Vp8(Vp8Depacketizer),
    Vp9(Vp9Depacketizer),
}

impl From<Codec> for CodecPacketizer {
    fn from(c: Codec) -> Self {
        match c {
            Codec::Av1 => CodecPacketizer::Av1(Av1Packetizer::default()),
            Codec::H264 => CodecPacketizer::H264(H264Packetizer::default()),
            Codec::H265 => CodecPacketizer::H265(H265Packetizer::default()),
            Codec::Opus => CodecPacketizer::Opus(OpusPacketizer),
            Codec::Vp8 => CodecPacketizer::Vp8(Vp8Packetizer::default()),
            Codec::Vp9 => CodecPacketizer::Vp9(Vp9Packetizer::default()),
        }
    }
}

impl From<Codec> for CodecDepacketizer {
    fn from(c: Codec) -> Self {
        match c {
            Codec::Av1 => CodecDepacketizer::Av1(Av1Depacketizer::default()),
            Codec::H264 => CodecDepacketizer::H264(H264Depacketizer::default()),
            Codec::H265 => CodecDepacketizer::H265(H265Depacketizer::default()),
            Codec::Opus => CodecDepacketizer::Opus(OpusDepacketizer),
            Codec::Vp8 => CodecDepacketizer::Vp8(Vp8Depacketizer::default()),
            Codec::Vp9 => CodecDepacketizer::Vp9(Vp9Depacketizer::default()),
        }
    }
}

impl Packetizer for CodecPacketizer {
    fn packetize(&mut self, mtu: usize, frame: &[u8]) -> Result<Vec<Vec<u8>>, PacketError> {
        use CodecPacketizer::*;
        match self {
            Av1(v) => v.packetize(mtu, frame),
            H264(v) => v.packetize(mtu, frame),
            H265(v) => v.packetize(mtu, frame),
            Opus(v) => v.packetize(mtu, frame),
            Vp8(v) => v.packetize(mtu, frame),
            Vp9(v) => v.packetize(mtu, frame),
        }
    }
}

impl Depacketizer for CodecDepacketizer {
    fn depacketize(&mut self, packet: &[u8], out: &mut Vec<u8>) -> Result<(), PacketError> {
        use CodecDepacketizer::*;
        match self {
            Av1(v) => v.depacketize(packet, out),
            H264(v) => v.depacketize(packet, out),
            H265(v) => v.depacketize(packet, out),
            Opus(v) => v.depacketize(packet, out),
            Vp8(v) => v.depacketize(packet, out),
            Vp9(v) => v.depacketize(packet, out),
        }
    }

    fn is_partition_head(&self, packet: &[u8]) -> bool {
        use CodecDepacketizer::*;
        match self {
            Av1(v) => v.is_partition_head(packet),
            H264(v) => v.is_partition_head(packet),
            H265(v) => v.is_partition_head(packet),
            Opus(v) => v.is_partition_head(packet),
            Vp8(v) => v.is_partition_head(packet),
            Vp9(v) => v.is_partition_head(packet),
        }
    }

    fn is_partition_tail(&self, marker: bool, packet: &[u8]) -> bool {
        use CodecDepacketizer::*;
        match self {
            Av1(v) => v.is_partition_tail(marker, packet),
            H264(v) => v.is_partition_tail(marker, packet),
            H265(v) => v.is_partition_tail(marker, packet),
            Opus(v) => v.is_partition_tail(marker, packet),
            Vp8(v) => v.is_partition_tail(marker, packet),
            Vp9(v) => v.is_partition_tail(marker, packet),
        }
    }
}
