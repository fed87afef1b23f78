use super::leb128::{leb128_size, read_leb128, write_leb128};
use super::{Depacketizer, PacketError, Packetizer};

const AV1_Z_MASK: u8 = 0b1000_0000;
const AV1_Y_MASK: u8 = 0b0100_0000;
const AV1_W_MASK: u8 = 0b0011_0000;
const AV1_W_BITSHIFT: u8 = 4;
const AV1_N_MASK: u8 = 0b0000_1000;

const OBU_TYPE_SEQUENCE_HEADER: u8 = 1;
const OBU_TYPE_TEMPORAL_DELIMITER: u8 = 2;
const OBU_TYPE_TILE_LIST: u8 = 8;

/// The smallest usable MTU: aggregation header plus one octet.
const AV1_MIN_MTU: usize = 2;

/// OBU extension header: temporal and spatial identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObuExtension {
    pub temporal_id: u8,
    pub spatial_id: u8,
    pub reserved_3bits: u8,
}

impl ObuExtension {
    fn marshal(&self) -> u8 {
        (self.temporal_id << 5) | ((self.spatial_id & 0x3) << 3) | (self.reserved_3bits & 0x07)
    }
}

/// An AV1 OBU header: 1 octet plus an optional extension octet.
///
/// ```text
///  0 1 2 3 4 5 6 7
/// +-+-+-+-+-+-+-+-+
/// |F|   T   |E|S|R|
/// +-+-+-+-+-+-+-+-+
/// ```
///
/// F is the forbidden bit (must be 0), T the OBU type, E flags the presence
/// of the extension octet, S the presence of a leb128 size field, R is
/// reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObuHeader {
    pub obu_type: u8,
    pub extension: Option<ObuExtension>,
    pub has_size_field: bool,
    pub reserved_1bit: bool,
}

impl ObuHeader {
    /// Parse an OBU header at `offset`. Returns the header and the number of
    /// octets consumed.
    pub fn parse(buf: &[u8], offset: usize) -> Result<(ObuHeader, usize), PacketError> {
        let b = *buf.get(offset).ok_or(PacketError::ShortPacket)?;

        if b & 0x80 != 0 {
            return Err(PacketError::Corrupted);
        }

        let obu_type = (b & 0x78) >> 3;
        let has_extension = b & 0x04 != 0;
        let has_size_field = b & 0x02 != 0;
        let reserved_1bit = b & 0x01 != 0;

        let mut consumed = 1;
        let extension = if has_extension {
            let e = *buf.get(offset + 1).ok_or(PacketError::ShortPacket)?;
            consumed += 1;
            Some(ObuExtension {
                temporal_id: e >> 5,
                spatial_id: (e >> 3) & 0x03,
                reserved_3bits: e & 0x07,
            })
        } else {
            None
        };

        Ok((
            ObuHeader {
                obu_type,
                extension,
                has_size_field,
                reserved_1bit,
            },
            consumed,
        ))
    }

    /// Serialize the header into 1 or 2 octets.
    pub fn marshal(&self) -> Vec<u8> {
        let mut b = self.obu_type << 3;
        if self.extension.is_some() {
            b |= 0x04;
        }
        if self.has_size_field {
            b |= 0x02;
        }
        if self.reserved_1bit {
            b |= 0x01;
        }

        let mut out = Vec::with_capacity(self.size());
        out.push(b);
        if let Some(ext) = &self.extension {
            out.push(ext.marshal());
        }
        out
    }

    /// Header size in octets.
    pub fn size(&self) -> usize {
        1 + usize::from(self.extension.is_some())
    }
}

/// Packetizes AV1 OBU streams.
///
/// Size fields are stripped on the wire; temporal delimiter and tile list
/// OBUs are dropped. OBU elements pack into packets under the Z/Y/W/N
/// aggregation header semantics.
#[derive(Default, Debug, Clone)]
pub struct Av1Packetizer;

impl Packetizer for Av1Packetizer {
    fn packetize(&mut self, mtu: usize, frame: &[u8]) -> Result<Vec<Vec<u8>>, PacketError> {
        if frame.is_empty() {
            return Ok(vec![]);
        }

        let mtu = mtu.max(AV1_MIN_MTU);

        let mut payloads: Vec<Vec<u8>> = vec![];
        let mut offset = 0;

        let mut current_obu_payload: Vec<u8> = vec![];
        let mut current_packet_ext: Option<ObuExtension> = None;
        let mut obus_in_packet = 0;
        let mut new_sequence = false;
        let mut start_with_new_packet = false;

        while offset < frame.len() {
            let (obu_header, header_size) = ObuHeader::parse(frame, offset)?;
            offset += header_size;

            let obu_size = if obu_header.has_size_field {
                let (size, n) = read_leb128(frame, offset)?;
                offset += n;
                size as usize
            } else {
                frame.len() - offset
            };

            // A temporal delimiter or sequence header forces the next OBU
            // element into a fresh packet, as does a change of the
            // temporal/spatial ids.
            let mut need_new_packet = obu_header.obu_type == OBU_TYPE_TEMPORAL_DELIMITER
                || obu_header.obu_type == OBU_TYPE_SEQUENCE_HEADER;

            if !need_new_packet {
                if let (Some(ext), Some(cur)) = (obu_header.extension, current_packet_ext) {
                    need_new_packet =
                        ext.spatial_id != cur.spatial_id || ext.temporal_id != cur.temporal_id;
                }
            }

            if let Some(ext) = obu_header.extension {
                current_packet_ext = Some(ext);
            }

            if offset + obu_size > frame.len() {
                return Err(PacketError::ShortPacket);
            }

            // Flush the previously collected OBU element.
            if !current_obu_payload.is_empty() {
                obus_in_packet = append_obu_payload(
                    &mut payloads,
                    &current_obu_payload,
                    new_sequence,
                    need_new_packet,
                    start_with_new_packet,
                    mtu,
                    obus_in_packet,
                );
                current_obu_payload.clear();
                start_with_new_packet = need_new_packet;

                if need_new_packet {
                    new_sequence = false;
                    current_packet_ext = None;
                }
            }

            if obu_header.obu_type == OBU_TYPE_TEMPORAL_DELIMITER
                || obu_header.obu_type == OBU_TYPE_TILE_LIST
            {
                offset += obu_size;
                continue;
            }

            // Re-serialize the header without the size field; the element
            // length on the wire is carried by the aggregation layer.
            let wire_header = ObuHeader {
                has_size_field: false,
                ..obu_header
            };
            current_obu_payload = wire_header.marshal();
            current_obu_payload.extend_from_slice(&frame[offset..offset + obu_size]);
            offset += obu_size;

            new_sequence = obu_header.obu_type == OBU_TYPE_SEQUENCE_HEADER;
        }

        if !current_obu_payload.is_empty() {
            append_obu_payload(
                &mut payloads,
                &current_obu_payload,
                new_sequence,
                true,
                start_with_new_packet,
                mtu,
                obus_in_packet,
            );
        }

        Ok(payloads)
    }
}

/// Place one OBU element into the packet sequence, fragmenting it across
/// packets when it does not fit.
///
/// Returns the number of length-prefixed OBU elements now open in the last
/// packet.
#[allow(clippy::too_many_arguments)]
fn append_obu_payload(
    payloads: &mut Vec<Vec<u8>>,
    obu_payload: &[u8],
    is_new_video_sequence: bool,
    is_last: bool,
    start_with_new_packet: bool,
    mtu: usize,
    current_obu_count: usize,
) -> usize {
    let mut count = current_obu_count;

    let mut free_space = 0isize;
    if let Some(last) = payloads.last() {
        free_space = mtu as isize - last.len() as isize;
    }

    if payloads.is_empty() || free_space <= 0 || start_with_new_packet {
        let mut payload = vec![0u8];
        if is_new_video_sequence {
            payload[0] |= AV1_N_MASK;
        }
        payloads.push(payload);
        free_space = mtu as isize - 1;
        count = 0;
    }
    let free_space = free_space as usize;

    let mut to_write = obu_payload.len().min(free_space);

    // The element filling the rest of the packet (or the frame's final
    // element) goes in without a length prefix, described by the W field.
    // At most three elements can do so.
    let should_use_w_field = (is_last || to_write >= free_space) && count < 3;

    let current = payloads.len() - 1;
    if should_use_w_field {
        payloads[current][0] |= (((count + 1) << AV1_W_BITSHIFT) as u8) & AV1_W_MASK;
        payloads[current].extend_from_slice(&obu_payload[..to_write]);
        count = 0;
    } else if free_space >= 2 {
        // Length-prefixed element: 2 octets minimum for prefix + data.
        to_write = compute_write_size(to_write, free_space);
        let length_field = write_leb128(to_write as u32);
        payloads[current].extend_from_slice(&length_field);
        payloads[current].extend_from_slice(&obu_payload[..to_write]);
        count += 1;
    } else {
        to_write = 0;
    }

    // Fragment whatever remains across fresh packets.
    let mut remaining_obu = &obu_payload[to_write..];

    while !remaining_obu.is_empty() {
        payloads.push(vec![0u8]);
        let current = payloads.len() - 1;

        if to_write != 0 {
            // The element continues across the packet boundary.
            payloads[current - 1][0] |= AV1_Y_MASK;
            payloads[current][0] |= AV1_Z_MASK;
        }

        to_write = remaining_obu.len().min(mtu - 1);

        if is_last || remaining_obu.len() <= mtu - 1 {
            // Final continuation: described by W=1.
            payloads[current][0] |= 1 << AV1_W_BITSHIFT;
        } else {
            to_write = compute_write_size(to_write, mtu - 1);
            if to_write == 0 {
                // No room for a length field at this MTU. W=1 plus the Y
                // bit set on the next round keeps the chain valid.
                payloads[current][0] |= 1 << AV1_W_BITSHIFT;
                to_write = remaining_obu.len().min(mtu - 1);
            } else {
                let length_field = write_leb128(to_write as u32);
                payloads[current].extend_from_slice(&length_field);
            }
        }

        payloads[current].extend_from_slice(&remaining_obu[..to_write]);
        remaining_obu = &remaining_obu[to_write..];
        count = 1;
    }

    count
}

/// Largest prefix of `want_to_write` octets whose leb128 length field still
/// fits inside `can_write` octets.
fn compute_write_size(want_to_write: usize, can_write: usize) -> usize {
    let (leb128_len, is_at_edge) = leb128_size(want_to_write);

    if can_write >= want_to_write + leb128_len {
        return want_to_write;
    }

    // Shrinking by one can shrink the length field as well.
    if is_at_edge && can_write >= want_to_write + leb128_len - 1 {
        return want_to_write - 1;
    }

    want_to_write - leb128_len
}

/// Depacketizes AV1 packets into OBU streams.
///
/// Output OBUs carry explicit size fields; fragments buffered across packet
/// boundaries are stitched back together.
#[derive(Default, Debug, Clone)]
pub struct Av1Depacketizer {
    /// Fragment carried over from a packet whose last element had Y set.
    buffer: Vec<u8>,
}

impl Depacketizer for Av1Depacketizer {
    fn depacketize(&mut self, packet: &[u8], out: &mut Vec<u8>) -> Result<(), PacketError> {
        if packet.len() <= 1 {
            return Err(PacketError::ShortPacket);
        }

        let z = packet[0] & AV1_Z_MASK != 0;
        let y = packet[0] & AV1_Y_MASK != 0;
        let w = ((packet[0] & AV1_W_MASK) >> AV1_W_BITSHIFT) as usize;
        let n = packet[0] & AV1_N_MASK != 0;

        if z && n {
            return Err(PacketError::Corrupted);
        }

        // A new coded video sequence cannot continue a fragment.
        if n {
            self.buffer.clear();
        }

        // Not a continuation: drop any half-assembled fragment.
        if !z && !self.buffer.is_empty() {
            trace!("AV1 dropping unfinished fragment, packet is not a continuation");
            self.buffer.clear();
        }

        let mut offset = 1;
        let mut obu_offset = 0;

        while offset < packet.len() {
            let is_first = obu_offset == 0;
            let mut is_last = w != 0 && obu_offset == w - 1;

            // The last element's length is implicit when W is non-zero.
            let element_length = if w == 0 || !is_last {
                let (len, consumed) = read_leb128(packet, offset)?;
                offset += consumed;

                if w == 0 && offset + len as usize == packet.len() {
                    is_last = true;
                }

                len as usize
            } else {
                packet.len() - offset
            };

            if offset + element_length > packet.len() {
                return Err(PacketError::ShortPacket);
            }

            let obu_buffer;
            if is_first && z {
                if self.buffer.is_empty() {
                    // The head of this fragment was lost; skip the element.
                    trace!("AV1 continuation without buffered fragment, dropping element");
                    if is_last {
                        break;
                    }
                    offset += element_length;
                    obu_offset += 1;
                    continue;
                }

                let mut combined =
                    Vec::with_capacity(self.buffer.len() + element_length);
                combined.extend_from_slice(&self.buffer);
                combined.extend_from_slice(&packet[offset..offset + element_length]);
                self.buffer.clear();
                obu_buffer = combined;
            } else {
                obu_buffer = packet[offset..offset + element_length].to_vec();
            }

            offset += element_length;

            // An unfinished last element waits for the next packet.
            if is_last && y {
                self.buffer = obu_buffer;
                break;
            }

            if obu_buffer.is_empty() {
                obu_offset += 1;
                continue;
            }

            let (obu_header, header_size) = ObuHeader::parse(&obu_buffer, 0)?;

            if obu_header.obu_type == OBU_TYPE_TEMPORAL_DELIMITER
                || obu_header.obu_type == OBU_TYPE_TILE_LIST
            {
                if is_last {
                    break;
                }
                obu_offset += 1;
                continue;
            }

            // Re-attach an explicit size field for the output stream.
            let out_header = ObuHeader {
                has_size_field: true,
                ..obu_header
            };
            let payload_size = obu_buffer.len() - header_size;

            out.extend_from_slice(&out_header.marshal());
            out.extend_from_slice(&write_leb128(payload_size as u32));
            out.extend_from_slice(&obu_buffer[header_size..]);

            if is_last {
                break;
            }
            obu_offset += 1;
        }

        // All W elements must have been seen.
        if w != 0 && obu_offset != w - 1 {
            return Err(PacketError::Corrupted);
        }

        Ok(())
    }

    fn is_partition_head(&self, packet: &[u8]) -> bool {
        if packet.is_empty() {
            return false;
        }

        // A partition head does not continue a fragment from the previous
        // packet.
        packet[0] & AV1_Z_MASK == 0
    }

    fn is_partition_tail(&self, marker: bool, _packet: &[u8]) -> bool {
        marker
    }
}
