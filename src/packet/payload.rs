use crate::rtp::{Header, Packet, Pt, Sequencer, Ssrc};
use crate::{Codec, Error};

use super::{CodecDepacketizer, CodecPacketizer, Depacketizer, PacketError, Packetizer};

/// Default path MTU when none is negotiated.
pub const DEFAULT_MTU: usize = 1200;

/// Codec-selecting packetizer producing complete RTP packets.
///
/// Combines a payload codec with header serialization and sequencing: every
/// produced packet carries the configured SSRC, payload type and timestamp,
/// a fresh sequence number, and the marker flag on the last packet of the
/// frame.
#[derive(Debug)]
pub struct RtpPacketizer {
    codec: Codec,
    mtu: usize,
    pack: CodecPacketizer,
    sequencer: Sequencer,
    payload_type: Pt,
    ssrc: Ssrc,
    timestamp: u32,
}

impl RtpPacketizer {
    /// A packetizer for `codec` bounded by `mtu` ([`DEFAULT_MTU`] is the
    /// conventional value).
    pub fn new(codec: Codec, mtu: usize) -> Self {
        RtpPacketizer {
            codec,
            mtu,
            pack: codec.into(),
            sequencer: Sequencer::random(),
            payload_type: Pt::default(),
            ssrc: Ssrc::default(),
            timestamp: 0,
        }
    }

    /// Set the synchronization source of produced packets.
    pub fn set_ssrc(&mut self, ssrc: u32) {
        self.ssrc = ssrc.into();
    }

    /// Set the payload type of produced packets.
    pub fn set_payload_type(&mut self, payload_type: u8) {
        self.payload_type = (payload_type & 0x7F).into();
    }

    /// Set the media timestamp of produced packets.
    pub fn set_timestamp(&mut self, timestamp: u32) {
        self.timestamp = timestamp;
    }

    /// H264: combine SPS and PPS with the following NAL unit in STAP-A
    /// packets. Returns whether the option applied to this codec.
    pub fn enable_stap_a(&mut self, enable: bool) -> bool {
        match &mut self.pack {
            CodecPacketizer::H264(v) => {
                v.enable_stap_a(enable);
                true
            }
            _ => false,
        }
    }

    /// H265: insert decoding order numbers (DONL). Returns whether the
    /// option applied to this codec.
    pub fn set_donl(&mut self, enable: bool) -> bool {
        match &mut self.pack {
            CodecPacketizer::H265(v) => {
                v.with_donl(enable);
                true
            }
            _ => false,
        }
    }

    /// H265: emit every NAL unit on its own instead of aggregating.
    /// Returns whether the option applied to this codec.
    pub fn set_skip_aggregation(&mut self, value: bool) -> bool {
        match &mut self.pack {
            CodecPacketizer::H265(v) => {
                v.with_skip_aggregation(value);
                true
            }
            _ => false,
        }
    }

    /// VP8: write picture ids into the payload descriptor. Returns whether
    /// the option applied to this codec.
    pub fn enable_picture_id(&mut self, enable: bool) -> bool {
        match &mut self.pack {
            CodecPacketizer::Vp8(v) => {
                v.enable_picture_id(enable);
                true
            }
            _ => false,
        }
    }

    /// VP9: switch between flexible and non-flexible mode. Returns whether
    /// the option applied to this codec.
    pub fn set_flexible_mode(&mut self, enable: bool) -> bool {
        match &mut self.pack {
            CodecPacketizer::Vp9(v) => {
                v.set_flexible_mode(enable);
                true
            }
            _ => false,
        }
    }

    /// VP9: pin the starting picture id. Returns whether the option applied
    /// to this codec.
    pub fn set_initial_picture_id(&mut self, id: u16) -> bool {
        match &mut self.pack {
            CodecPacketizer::Vp9(v) => {
                v.set_initial_picture_id(id);
                true
            }
            _ => false,
        }
    }

    /// Packetize one complete frame into serialized RTP packets.
    pub fn packetize(&mut self, frame: &[u8]) -> Result<Vec<Vec<u8>>, Error> {
        let payloads = self.pack.packetize(self.mtu, frame)?;

        // Opus is never fragmented; the bound applies to the serialized
        // transport packet. Checked before any counter advances.
        if self.codec == Codec::Opus {
            if let Some(p) = payloads.first() {
                let header_size = Header::default().marshal_size();
                if header_size + p.len() > self.mtu {
                    return Err(PacketError::FrameTooLarge.into());
                }
            }
        }

        let count = payloads.len();
        let mut packets = Vec::with_capacity(count);

        for (i, payload) in payloads.into_iter().enumerate() {
            let last = i == count - 1;

            let packet = Packet {
                header: Header {
                    marker: last,
                    payload_type: self.payload_type,
                    sequence_number: self.sequencer.next(),
                    timestamp: self.timestamp,
                    ssrc: self.ssrc,
                    ..Default::default()
                },
                payload,
                padding_size: 0,
            };

            packets.push(packet.marshal()?);
        }

        Ok(packets)
    }

    /// The sequencer producing this packetizer's sequence numbers.
    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }
}

/// Codec-selecting depacketizer consuming complete RTP packets.
#[derive(Debug)]
pub struct RtpDepacketizer {
    depack: CodecDepacketizer,
}

impl RtpDepacketizer {
    /// A depacketizer for `codec`.
    pub fn new(codec: Codec) -> Self {
        RtpDepacketizer {
            depack: codec.into(),
        }
    }

    /// H265: expect decoding order numbers (DONL) in payloads. Returns
    /// whether the option applied to this codec.
    pub fn set_donl(&mut self, enable: bool) -> bool {
        match &mut self.depack {
            CodecDepacketizer::H265(v) => {
                v.with_donl(enable);
                true
            }
            _ => false,
        }
    }

    /// Feed one serialized RTP packet.
    ///
    /// Returns `Ok(None)` while reassembly of a fragmented unit is still in
    /// progress; `Ok(Some(frame))` once a complete unit is available.
    pub fn depacketize(&mut self, packet: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        let parsed = Packet::parse(packet)?;

        let mut out = Vec::new();
        self.depack.depacketize(&parsed.payload, &mut out)?;

        if out.is_empty() {
            Ok(None)
        } else {
            Ok(Some(out))
        }
    }

    /// Whether this serialized packet starts a new frame.
    pub fn is_frame_start(&self, packet: &[u8]) -> bool {
        let Ok(parsed) = Packet::parse(packet) else {
            return false;
        };
        self.depack.is_partition_head(&parsed.payload)
    }

    /// Whether this serialized packet ends a frame. The marker flag is
    /// passed in explicitly so callers holding it from elsewhere (e.g. an
    /// SRTP layer) can supply it.
    pub fn is_frame_end(&self, marker: bool, packet: &[u8]) -> bool {
        let Ok(parsed) = Packet::parse(packet) else {
            return false;
        };
        self.depack.is_partition_tail(marker, &parsed.payload)
    }
}
