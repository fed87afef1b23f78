use super::{Depacketizer, PacketError, Packetizer};

pub const STAPA_NALU_TYPE: u8 = 24;
pub const FUA_NALU_TYPE: u8 = 28;
pub const FUB_NALU_TYPE: u8 = 29;
pub const SPS_NALU_TYPE: u8 = 7;
pub const PPS_NALU_TYPE: u8 = 8;
pub const AUD_NALU_TYPE: u8 = 9;
pub const FILLER_NALU_TYPE: u8 = 12;

pub const FUA_HEADER_SIZE: usize = 2;
pub const STAPA_HEADER_SIZE: usize = 1;
pub const STAPA_NALU_LENGTH_SIZE: usize = 2;

pub const NALU_TYPE_BITMASK: u8 = 0x1F;
pub const NALU_REF_IDC_BITMASK: u8 = 0x60;
pub const FU_START_BITMASK: u8 = 0x80;
pub const FU_END_BITMASK: u8 = 0x40;

/// STAP-A NAL header: forbidden 0, NRI 3, type 24.
pub const OUTPUT_STAP_A_HEADER: u8 = 0x78;

pub static ANNEXB_NALU_START_CODE: &[u8] = &[0x00, 0x00, 0x00, 0x01];

/// Packetizes H264 Annex-B byte streams.
///
/// The input frame is scanned for 3- or 4-octet start codes and each
/// inter-marker region is one NAL unit. SPS and PPS are buffered and join
/// the next NAL in a STAP-A packet; NALs larger than the MTU become FU-A
/// fragments.
#[derive(Debug, Clone)]
pub struct H264Packetizer {
    pub(crate) enable_stap_a: bool,
    sps_nalu: Option<Vec<u8>>,
    pps_nalu: Option<Vec<u8>>,
}

impl Default for H264Packetizer {
    fn default() -> Self {
        H264Packetizer {
            enable_stap_a: true,
            sps_nalu: None,
            pps_nalu: None,
        }
    }
}

impl H264Packetizer {
    /// Combine SPS and PPS with the following NAL unit in STAP-A packets.
    /// On by default.
    pub fn enable_stap_a(&mut self, enable: bool) {
        self.enable_stap_a = enable;
    }
}

/// Find the next Annex-B start code at or after `start`.
///
/// Returns (index of the first zero octet, start code length), or (-1, -1).
pub(crate) fn next_ind(nalu: &[u8], start: usize) -> (isize, isize) {
    let mut zero_count = 0;

    for (i, &b) in nalu[start..].iter().enumerate() {
        if b == 0 {
            zero_count += 1;
            continue;
        } else if b == 1 && zero_count >= 2 {
            return ((start + i - zero_count) as isize, zero_count as isize + 1);
        }
        zero_count = 0
    }
    (-1, -1)
}

impl H264Packetizer {
    fn emit(&mut self, nalu: &[u8], mtu: usize, payloads: &mut Vec<Vec<u8>>) {
        if nalu.is_empty() {
            return;
        }

        let nalu_type = nalu[0] & NALU_TYPE_BITMASK;
        let nalu_ref_idc = nalu[0] & NALU_REF_IDC_BITMASK;

        if nalu_type == AUD_NALU_TYPE || nalu_type == FILLER_NALU_TYPE {
            return;
        }

        if self.enable_stap_a {
            if nalu_type == SPS_NALU_TYPE {
                self.sps_nalu = Some(nalu.to_vec());
                return;
            } else if nalu_type == PPS_NALU_TYPE {
                self.pps_nalu = Some(nalu.to_vec());
                return;
            }

            if let (Some(sps), Some(pps)) = (&self.sps_nalu, &self.pps_nalu) {
                // Pack SPS, PPS and the current NALU together as STAP-A.
                let stap_a_len = STAPA_HEADER_SIZE
                    + 3 * STAPA_NALU_LENGTH_SIZE
                    + sps.len()
                    + pps.len()
                    + nalu.len();

                let mut stap_a_nalu = Vec::with_capacity(stap_a_len);
                stap_a_nalu.push(OUTPUT_STAP_A_HEADER);
                stap_a_nalu.extend((sps.len() as u16).to_be_bytes());
                stap_a_nalu.extend_from_slice(sps);
                stap_a_nalu.extend((pps.len() as u16).to_be_bytes());
                stap_a_nalu.extend_from_slice(pps);
                stap_a_nalu.extend((nalu.len() as u16).to_be_bytes());
                stap_a_nalu.extend_from_slice(nalu);

                // The buffered pair is spent either way; when the STAP-A
                // does not fit, the NALU proceeds on its own.
                self.sps_nalu = None;
                self.pps_nalu = None;

                if stap_a_nalu.len() <= mtu {
                    payloads.push(stap_a_nalu);
                    return;
                }
            }
        }

        // Single NALU
        if nalu.len() <= mtu {
            payloads.push(nalu.to_vec());
            return;
        }

        // FU-A
        let max_fragment_size = mtu as isize - FUA_HEADER_SIZE as isize;

        // The NAL header octet is not carried as payload; its ref_idc moves
        // into the FU indicator and its type into the FU header.
        let mut nalu_index = 1;
        let nalu_length = nalu.len() as isize - nalu_index;
        let mut nalu_remaining = nalu_length;

        if max_fragment_size.min(nalu_remaining) <= 0 {
            return;
        }

        while nalu_remaining > 0 {
            let fragment_size = max_fragment_size.min(nalu_remaining);
            let mut out = Vec::with_capacity(FUA_HEADER_SIZE + fragment_size as usize);

            // +---------------+
            // |0|1|2|3|4|5|6|7|
            // +-+-+-+-+-+-+-+-+
            // |F|NRI|  Type   |
            // +---------------+
            out.push(FUA_NALU_TYPE | nalu_ref_idc);

            // +---------------+
            // |0|1|2|3|4|5|6|7|
            // +-+-+-+-+-+-+-+-+
            // |S|E|R|  Type   |
            // +---------------+
            let mut b1 = nalu_type;
            if nalu_remaining == nalu_length {
                b1 |= FU_START_BITMASK;
            } else if nalu_remaining - fragment_size == 0 {
                b1 |= FU_END_BITMASK;
            }
            out.push(b1);

            out.extend_from_slice(&nalu[nalu_index as usize..(nalu_index + fragment_size) as usize]);
            payloads.push(out);

            nalu_remaining -= fragment_size;
            nalu_index += fragment_size;
        }
    }
}

impl Packetizer for H264Packetizer {
    fn packetize(&mut self, mtu: usize, frame: &[u8]) -> Result<Vec<Vec<u8>>, PacketError> {
        if frame.is_empty() || mtu == 0 {
            return Ok(vec![]);
        }

        let mut payloads = vec![];

        let (mut ind_start, mut ind_len) = next_ind(frame, 0);
        if ind_start == -1 {
            // No start code: the whole frame is one NAL unit.
            self.emit(frame, mtu, &mut payloads);
        } else {
            while ind_start != -1 {
                let prev_start = (ind_start + ind_len) as usize;
                let (next_start, next_len) = next_ind(frame, prev_start);
                ind_start = next_start;
                ind_len = next_len;
                if ind_start != -1 {
                    self.emit(&frame[prev_start..ind_start as usize], mtu, &mut payloads);
                } else {
                    // Emit until end of stream, no further start code.
                    self.emit(&frame[prev_start..], mtu, &mut payloads);
                }
            }
        }

        Ok(payloads)
    }
}

/// Depacketizes H264 packets.
///
/// NAL units are packaged with an Annex-B start code, or a 4-octet length
/// prefix when `is_avc` is set.
#[derive(PartialEq, Eq, Debug, Default, Clone)]
pub struct H264Depacketizer {
    /// Output AVC length-prefixed NAL units instead of Annex-B.
    pub is_avc: bool,
    fua_buffer: Option<Vec<u8>>,
}

impl H264Depacketizer {
    fn package(&self, nalu: &[u8], out: &mut Vec<u8>) {
        if self.is_avc {
            out.extend_from_slice(&(nalu.len() as u32).to_be_bytes());
        } else {
            out.extend_from_slice(ANNEXB_NALU_START_CODE);
        }
        out.extend_from_slice(nalu);
    }
}

impl Depacketizer for H264Depacketizer {
    fn depacketize(&mut self, packet: &[u8], out: &mut Vec<u8>) -> Result<(), PacketError> {
        if packet.is_empty() {
            return Err(PacketError::ShortPacket);
        }

        // NALU types https://tools.ietf.org/html/rfc6184#section-5.4
        let b0 = packet[0];
        let nalu_type = b0 & NALU_TYPE_BITMASK;

        match nalu_type {
            1..=23 => {
                self.package(packet, out);
                Ok(())
            }
            STAPA_NALU_TYPE => {
                let mut curr_offset = STAPA_HEADER_SIZE;
                while curr_offset + 1 < packet.len() {
                    let nalu_size =
                        ((packet[curr_offset] as usize) << 8) | packet[curr_offset + 1] as usize;
                    curr_offset += STAPA_NALU_LENGTH_SIZE;

                    if curr_offset + nalu_size > packet.len() {
                        return Err(PacketError::ShortPacket);
                    }

                    self.package(&packet[curr_offset..curr_offset + nalu_size], out);
                    curr_offset += nalu_size;
                }

                Ok(())
            }
            FUA_NALU_TYPE => {
                if packet.len() < FUA_HEADER_SIZE {
                    return Err(PacketError::ShortPacket);
                }

                let fua_buffer = self.fua_buffer.get_or_insert_with(Vec::new);
                fua_buffer.extend_from_slice(&packet[FUA_HEADER_SIZE..]);

                let b1 = packet[1];
                if b1 & FU_END_BITMASK != 0 {
                    let nalu_ref_idc = b0 & NALU_REF_IDC_BITMASK;
                    let fragmented_nalu_type = b1 & NALU_TYPE_BITMASK;

                    if let Some(fua_buffer) = self.fua_buffer.take() {
                        let mut nalu = Vec::with_capacity(1 + fua_buffer.len());
                        nalu.push(nalu_ref_idc | fragmented_nalu_type);
                        nalu.extend_from_slice(&fua_buffer);
                        self.package(&nalu, out);
                    }
                }

                Ok(())
            }
            _ => Err(PacketError::UnhandledNaluType(nalu_type)),
        }
    }

    /// Checks if this is the head of a packetized NALU stream.
    fn is_partition_head(&self, packet: &[u8]) -> bool {
        if packet.len() < 2 {
            return false;
        }

        if packet[0] & NALU_TYPE_BITMASK == FUA_NALU_TYPE
            || packet[0] & NALU_TYPE_BITMASK == FUB_NALU_TYPE
        {
            (packet[1] & FU_START_BITMASK) != 0
        } else {
            true
        }
    }

    fn is_partition_tail(&self, marker: bool, packet: &[u8]) -> bool {
        if packet.len() < 2 {
            return false;
        }

        if packet[0] & NALU_TYPE_BITMASK == FUA_NALU_TYPE
            || packet[0] & NALU_TYPE_BITMASK == FUB_NALU_TYPE
        {
            (packet[1] & FU_END_BITMASK) != 0
        } else {
            marker
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_h264_payload() -> Result<(), PacketError> {
        let empty = &[];
        let small_payload = &[0x90, 0x90, 0x90];
        let multiple_payload = &[0x00, 0x00, 0x01, 0x90, 0x00, 0x00, 0x01, 0x90];
        let large_payload = &[
            0x00, 0x00, 0x01, 0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x10,
            0x11, 0x12, 0x13, 0x14, 0x15,
        ];
        let large_payload_packetized: Vec<&[u8]> = vec![
            &[0x1C, 0x80, 0x01, 0x02, 0x03],
            &[0x1C, 0x00, 0x04, 0x05, 0x06],
            &[0x1C, 0x00, 0x07, 0x08, 0x09],
            &[0x1C, 0x00, 0x10, 0x11, 0x12],
            &[0x1C, 0x40, 0x13, 0x14, 0x15],
        ];

        let mut pck = H264Packetizer::default();

        // Positive MTU, empty frame
        let result = pck.packetize(1, empty)?;
        assert!(result.is_empty(), "generated payload should be empty");

        // 0 MTU
        let result = pck.packetize(0, small_payload)?;
        assert_eq!(result.len(), 0, "generated payload should be empty");

        // Positive MTU, NALU smaller than FU-A header
        let result = pck.packetize(1, small_payload)?;
        assert_eq!(result.len(), 0, "generated payload should be empty");

        // Positive MTU, small NALU
        let result = pck.packetize(5, small_payload)?;
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].len(), small_payload.len());

        // Multiple NALUs in a single frame
        let result = pck.packetize(5, multiple_payload)?;
        assert_eq!(result.len(), 2, "2 nal units should be broken out");
        for (i, p) in result.iter().enumerate() {
            assert_eq!(p.len(), 1, "payload {} of 2 is packed incorrectly", i + 1);
        }

        // Large NALU split across multiple packets
        let result = pck.packetize(5, large_payload)?;
        assert_eq!(result, large_payload_packetized, "FU-A packetization failed");

        // NALU type 9 (AUD) is dropped
        let result = pck.packetize(5, &[0x09, 0x00, 0x00])?;
        assert_eq!(result.len(), 0, "AUD NALU should be dropped");

        // NALU type 12 (filler) is dropped
        let result = pck.packetize(5, &[0x0C, 0x00, 0x00])?;
        assert_eq!(result.len(), 0, "filler NALU should be dropped");

        Ok(())
    }

    #[test]
    fn test_h264_packetizer_stap_a() -> Result<(), PacketError> {
        let mut pck = H264Packetizer::default();

        // SPS and PPS are buffered, not emitted on their own
        let res = pck.packetize(1500, &[0x07, 0x00, 0x01])?;
        assert!(res.is_empty(), "SPS should be buffered");

        let res = pck.packetize(1500, &[0x08, 0x02, 0x03])?;
        assert!(res.is_empty(), "PPS should be buffered");

        // The next NALU pulls both into one STAP-A
        let expected: Vec<&[u8]> = vec![&[
            0x78, 0x00, 0x03, 0x07, 0x00, 0x01, 0x00, 0x03, 0x08, 0x02, 0x03, 0x00, 0x03, 0x05,
            0x04, 0x05,
        ]];
        let actual = pck.packetize(1500, &[0x05, 0x04, 0x05])?;
        assert_eq!(actual, expected, "SPS, PPS and NALU aren't packed together");

        Ok(())
    }

    #[test]
    fn test_h264_packetizer_stap_a_overflow() -> Result<(), PacketError> {
        let mut pck = H264Packetizer::default();

        pck.packetize(1500, &[0x07, 0x00, 0x01])?;
        pck.packetize(1500, &[0x08, 0x02, 0x03])?;

        // The combined STAP-A exceeds the MTU: the pair is discarded and the
        // NALU goes out alone.
        let actual = pck.packetize(5, &[0x05, 0x04, 0x05])?;
        assert_eq!(actual, vec![vec![0x05, 0x04, 0x05]]);

        Ok(())
    }

    #[test]
    fn test_h264_packetizer_stap_a_disabled() -> Result<(), PacketError> {
        let mut pck = H264Packetizer {
            enable_stap_a: false,
            ..Default::default()
        };

        // With STAP-A disabled SPS/PPS are emitted like any other NALU.
        let res = pck.packetize(1500, &[0x07, 0x00, 0x01])?;
        assert_eq!(res, vec![vec![0x07, 0x00, 0x01]]);

        Ok(())
    }

    macro_rules! test_h264 {
        ($name:tt, $is_avc:expr, $is_ok:expr, $payload:expr, $err:tt) => {
            #[test]
            fn $name() -> Result<(), PacketError> {
                let mut pkt = H264Depacketizer {
                    is_avc: $is_avc,
                    ..Default::default()
                };
                let mut out: Vec<u8> = Vec::new();
                let result = pkt.depacketize($payload, &mut out);
                if $is_ok {
                    assert!(result.is_ok(), $err);
                } else {
                    assert!(result.is_err(), $err);
                }
                Ok(())
            }
        };
    }

    test_h264!(
        nil_payload,
        false,
        false,
        &[],
        "depacketize did not fail on empty payload"
    );
    test_h264!(
        unit_delimiter,
        false,
        true,
        &[0x09, 0x30],
        "depacketize should accept a minimal access unit delimiter"
    );
    test_h264!(
        end_of_sequence_nalu,
        false,
        true,
        &[0x0A],
        "depacketize should accept an end of sequence NALU"
    );
    test_h264!(
        not_handled,
        false,
        false,
        &[0xFF, 0x00, 0x00],
        "depacketize accepted a packet with a NALU type we don't handle"
    );
    test_h264!(
        incomplete_single_payload_multi_nalu,
        false,
        false,
        &[
            0x78, 0x00, 0x0F, 0x67, 0x42, 0xC0, 0x1F, 0x1A, 0x32, 0x35, 0x01, 0x40, 0x7A, 0x40,
            0x3C, 0x22, 0x11,
        ],
        "depacketize accepted a STAP-A packet with insufficient data"
    );

    #[test]
    fn single_payload() -> Result<(), PacketError> {
        let mut pkt = H264Depacketizer::default();
        let mut out: Vec<u8> = Vec::new();
        pkt.depacketize(&[0x90, 0x90, 0x90], &mut out)?;
        assert_eq!(out, &[0x00, 0x00, 0x00, 0x01, 0x90, 0x90, 0x90]);
        Ok(())
    }

    #[test]
    fn single_payload_avc() -> Result<(), PacketError> {
        let mut pkt = H264Depacketizer {
            is_avc: true,
            ..Default::default()
        };
        let mut out: Vec<u8> = Vec::new();
        pkt.depacketize(&[0x90, 0x90, 0x90], &mut out)?;
        assert_eq!(out, &[0x00, 0x00, 0x00, 0x03, 0x90, 0x90, 0x90]);
        Ok(())
    }

    #[test]
    fn h264_fua_reassembly() -> Result<(), PacketError> {
        let packets: Vec<&[u8]> = vec![
            &[0x1C, 0x80, 0x01, 0x02, 0x03],
            &[0x1C, 0x00, 0x04, 0x05, 0x06],
            &[0x1C, 0x00, 0x07, 0x08, 0x09],
            &[0x1C, 0x00, 0x10, 0x11, 0x12],
            &[0x1C, 0x40, 0x13, 0x14, 0x15],
        ];

        let expected = &[
            0x00, 0x00, 0x00, 0x01, 0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09,
            0x10, 0x11, 0x12, 0x13, 0x14, 0x15,
        ];

        let mut pkt = H264Depacketizer::default();
        let mut out = Vec::new();
        for p in &packets {
            pkt.depacketize(p, &mut out)?;
        }
        assert_eq!(out, expected, "failed to reassemble FU-A fragments");

        Ok(())
    }

    #[test]
    fn single_payload_multi_nalu() -> Result<(), PacketError> {
        let single_payload_multi_nalu = &[
            0x78, 0x00, 0x0F, 0x67, 0x42, 0xC0, 0x1F, 0x1A, 0x32, 0x35, 0x01, 0x40, 0x7A, 0x40,
            0x3C, 0x22, 0x11, 0xA8, 0x00, 0x05, 0x68, 0x1A, 0x34, 0xE3, 0xC8, 0x00,
        ];
        let expected = &[
            0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0xC0, 0x1F, 0x1A, 0x32, 0x35, 0x01, 0x40, 0x7A,
            0x40, 0x3C, 0x22, 0x11, 0xA8, 0x00, 0x00, 0x00, 0x01, 0x68, 0x1A, 0x34, 0xE3, 0xC8,
        ];

        let mut pkt = H264Depacketizer::default();
        let mut out = Vec::new();
        pkt.depacketize(single_payload_multi_nalu, &mut out)?;
        assert_eq!(out, expected);

        Ok(())
    }

    #[test]
    fn test_h264_partition_head() {
        let h264 = H264Depacketizer::default();

        assert!(!h264.is_partition_head(&[]), "empty packet");
        assert!(h264.is_partition_head(&[1, 0]), "single nalu");
        assert!(h264.is_partition_head(&[STAPA_NALU_TYPE, 0]), "stapa nalu");
        assert!(
            h264.is_partition_head(&[FUA_NALU_TYPE, FU_START_BITMASK]),
            "fua start"
        );
        assert!(
            !h264.is_partition_head(&[FUA_NALU_TYPE, FU_END_BITMASK]),
            "fua end"
        );
        assert!(
            h264.is_partition_head(&[FUB_NALU_TYPE, FU_START_BITMASK]),
            "fub start"
        );
        assert!(
            !h264.is_partition_head(&[FUB_NALU_TYPE, FU_END_BITMASK]),
            "fub end"
        );
    }

    #[test]
    fn test_h264_partition_tail() {
        let h264 = H264Depacketizer::default();

        assert!(!h264.is_partition_tail(true, &[]), "empty packet");
        assert!(h264.is_partition_tail(true, &[1, 0]), "marker carries");
        assert!(!h264.is_partition_tail(false, &[1, 0]));
        assert!(
            h264.is_partition_tail(false, &[FUA_NALU_TYPE, FU_END_BITMASK]),
            "fua end"
        );
        assert!(
            !h264.is_partition_tail(false, &[FUA_NALU_TYPE, FU_START_BITMASK]),
            "fua start"
        );
    }

    #[test]
    fn test_out_of_bounds_stapa() {
        const PACKET: &[u8] = &[STAPA_NALU_TYPE, 0x00, 0x00];

        let mut pck = H264Depacketizer::default();
        let mut out = vec![];
        pck.depacketize(PACKET, &mut out).unwrap();
    }
}
