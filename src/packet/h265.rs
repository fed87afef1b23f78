use super::{h264::next_ind, Depacketizer, PacketError, Packetizer};

const H265_NALU_HEADER_SIZE: usize = 2;
/// https://datatracker.ietf.org/doc/html/rfc7798#section-4.4.2
const H265_NALU_AGGREGATION_PACKET_TYPE: u8 = 48;
/// https://datatracker.ietf.org/doc/html/rfc7798#section-4.4.3
const H265_NALU_FRAGMENTATION_UNIT_TYPE: u8 = 49;
/// https://datatracker.ietf.org/doc/html/rfc7798#section-4.4.4
const H265_NALU_PACI_PACKET_TYPE: u8 = 50;

const H265_FRAGMENTATION_UNIT_HEADER_SIZE: usize = 1;

/// H265NALUHeader is a H265 NAL unit header.
/// https://datatracker.ietf.org/doc/html/rfc7798#section-1.1.4
///
/// ```text
/// +---------------+---------------+
/// |0|1|2|3|4|5|6|7|0|1|2|3|4|5|6|7|
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |F|   Type    |  layer_id  | tid |
/// +-------------+-----------------+
/// ```
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct H265NALUHeader(pub u16);

impl H265NALUHeader {
    pub fn new(high_byte: u8, low_byte: u8) -> Self {
        H265NALUHeader(((high_byte as u16) << 8) | low_byte as u16)
    }

    /// The forbidden bit, should always be 0.
    pub fn f(&self) -> bool {
        (self.0 >> 15) != 0
    }

    /// NAL unit type.
    pub fn nalu_type(&self) -> u8 {
        // 01111110 00000000
        const MASK: u16 = 0b01111110 << 8;
        ((self.0 & MASK) >> (8 + 1)) as u8
    }

    /// Whether the NAL unit type is a VCL NAL unit.
    pub fn is_type_vcl_unit(&self) -> bool {
        // Type is coded on 6 bits
        const MSB_MASK: u8 = 0b00100000;
        (self.nalu_type() & MSB_MASK) == 0
    }

    /// layer_id should always be 0 in non-3D HEVC context.
    pub fn layer_id(&self) -> u8 {
        // 00000001 11111000
        const MASK: u16 = (0b00000001 << 8) | 0b11111000;
        ((self.0 & MASK) >> 3) as u8
    }

    /// Temporal identifier of the NAL unit plus 1.
    pub fn tid(&self) -> u8 {
        const MASK: u16 = 0b00000111;
        (self.0 & MASK) as u8
    }

    /// Whether the packet is an aggregation packet.
    pub fn is_aggregation_packet(&self) -> bool {
        self.nalu_type() == H265_NALU_AGGREGATION_PACKET_TYPE
    }

    /// Whether the packet is a fragmentation unit packet.
    pub fn is_fragmentation_unit(&self) -> bool {
        self.nalu_type() == H265_NALU_FRAGMENTATION_UNIT_TYPE
    }

    /// Whether the packet is a PACI packet.
    pub fn is_paci_packet(&self) -> bool {
        self.nalu_type() == H265_NALU_PACI_PACKET_TYPE
    }
}

/// H265FragmentationUnitHeader is a H265 FU header.
///
/// ```text
/// +---------------+
/// |0|1|2|3|4|5|6|7|
/// +-+-+-+-+-+-+-+-+
/// |S|E|  fu_type  |
/// +---------------+
/// ```
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct H265FragmentationUnitHeader(pub u8);

impl H265FragmentationUnitHeader {
    /// Start of a fragmented NAL unit.
    pub fn s(&self) -> bool {
        const MASK: u8 = 0b10000000;
        (self.0 & MASK) != 0
    }

    /// End of a fragmented NAL unit.
    pub fn e(&self) -> bool {
        const MASK: u8 = 0b01000000;
        (self.0 & MASK) != 0
    }

    /// fu_type must equal the Type field of the fragmented NAL unit.
    pub fn fu_type(&self) -> u8 {
        const MASK: u8 = 0b00111111;
        self.0 & MASK
    }
}

/// A packet carrying exactly one NAL unit, with an optional DONL.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           PayloadHdr          |      DONL (conditional)       |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                  NAL unit payload data                        |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Reference: https://datatracker.ietf.org/doc/html/rfc7798#section-4.4.1
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct H265SingleNALUnitPacket {
    payload_header: H265NALUHeader,
    donl: Option<u16>,
    payload: Vec<u8>,
}

impl H265SingleNALUnitPacket {
    fn parse(packet: &[u8], with_donl: bool) -> Result<Self, PacketError> {
        if packet.len() <= H265_NALU_HEADER_SIZE {
            return Err(PacketError::ShortPacket);
        }

        let payload_header = H265NALUHeader::new(packet[0], packet[1]);
        let mut rest = &packet[2..];

        let mut donl = None;
        if with_donl {
            if rest.len() <= 2 {
                return Err(PacketError::ShortPacket);
            }
            donl = Some(u16::from_be_bytes([rest[0], rest[1]]));
            rest = &rest[2..];
        }

        Ok(H265SingleNALUnitPacket {
            payload_header,
            donl,
            payload: rest.to_vec(),
        })
    }

    /// The NALU header of the packet.
    pub fn payload_header(&self) -> H265NALUHeader {
        self.payload_header
    }

    /// DONL of the packet, when DONL mode is active.
    pub fn donl(&self) -> Option<u16> {
        self.donl
    }

    /// NAL unit payload, excluding the two header octets and any DONL.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// The first aggregation unit in an aggregation packet. Carries the DONL
/// when DONL mode is active.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct H265AggregationUnitFirst {
    donl: Option<u16>,
    nal_unit_size: u16,
    nal_unit: Vec<u8>,
}

impl H265AggregationUnitFirst {
    /// The 16 least significant bits of the decoding order number.
    pub fn donl(&self) -> Option<u16> {
        self.donl
    }

    /// Size, in octets, of the NAL unit.
    pub fn nalu_size(&self) -> u16 {
        self.nal_unit_size
    }

    /// The NAL unit, including its two-octet header.
    pub fn nal_unit(&self) -> &[u8] {
        &self.nal_unit
    }
}

/// An aggregation unit other than the first. Carries a DOND octet when DONL
/// mode is active.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct H265AggregationUnit {
    dond: Option<u8>,
    nal_unit_size: u16,
    nal_unit: Vec<u8>,
}

impl H265AggregationUnit {
    /// DOND plus 1 is the difference between the decoding order numbers of
    /// this unit and the preceding one.
    pub fn dond(&self) -> Option<u8> {
        self.dond
    }

    /// Size, in octets, of the NAL unit.
    pub fn nalu_size(&self) -> u16 {
        self.nal_unit_size
    }

    /// The NAL unit, including its two-octet header.
    pub fn nal_unit(&self) -> &[u8] {
        &self.nal_unit
    }
}

/// An aggregation packet (type 48): two or more NAL units in one payload.
///
/// Reference: https://datatracker.ietf.org/doc/html/rfc7798#section-4.4.2
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct H265AggregationPacket {
    first_unit: Option<H265AggregationUnitFirst>,
    other_units: Vec<H265AggregationUnit>,
}

impl H265AggregationPacket {
    fn parse(packet: &[u8], with_donl: bool) -> Result<Self, PacketError> {
        if packet.len() <= H265_NALU_HEADER_SIZE {
            return Err(PacketError::ShortPacket);
        }

        let mut rest = &packet[2..];
        let mut first_unit = H265AggregationUnitFirst::default();

        if with_donl {
            if rest.len() < 2 {
                return Err(PacketError::ShortPacket);
            }
            first_unit.donl = Some(u16::from_be_bytes([rest[0], rest[1]]));
            rest = &rest[2..];
        }

        if rest.len() < 2 {
            return Err(PacketError::ShortPacket);
        }
        first_unit.nal_unit_size = u16::from_be_bytes([rest[0], rest[1]]);
        rest = &rest[2..];

        if rest.len() < first_unit.nal_unit_size as usize {
            return Err(PacketError::ShortPacket);
        }
        first_unit.nal_unit = rest[..first_unit.nal_unit_size as usize].to_vec();
        rest = &rest[first_unit.nal_unit_size as usize..];

        // Parse remaining aggregation units.
        let mut units = vec![];
        loop {
            let mut unit = H265AggregationUnit::default();

            if with_donl {
                if rest.is_empty() {
                    break;
                }
                unit.dond = Some(rest[0]);
                rest = &rest[1..];
            }

            if rest.len() < 2 {
                break;
            }
            unit.nal_unit_size = u16::from_be_bytes([rest[0], rest[1]]);
            rest = &rest[2..];

            if rest.len() < unit.nal_unit_size as usize {
                break;
            }
            unit.nal_unit = rest[..unit.nal_unit_size as usize].to_vec();
            rest = &rest[unit.nal_unit_size as usize..];

            units.push(unit);
        }

        // An aggregation packet must contain at least two units.
        if units.is_empty() {
            return Err(PacketError::ShortPacket);
        }

        Ok(H265AggregationPacket {
            first_unit: Some(first_unit),
            other_units: units,
        })
    }

    /// The first aggregated unit of the packet.
    pub fn first_unit(&self) -> Option<&H265AggregationUnitFirst> {
        self.first_unit.as_ref()
    }

    /// All other aggregated units (excluding the first).
    pub fn other_units(&self) -> &[H265AggregationUnit] {
        &self.other_units
    }
}

/// A fragmentation unit packet (type 49): one fragment of a larger NAL.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |    PayloadHdr (Type=49)       |   FU header   | DONL (cond)   |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-|
/// | DONL (cond)   |                                               |
/// |-+-+-+-+-+-+-+-+                 FU payload                    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Reference: https://datatracker.ietf.org/doc/html/rfc7798#section-4.4.3
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct H265FragmentationUnitPacket {
    payload_header: H265NALUHeader,
    fu_header: H265FragmentationUnitHeader,
    donl: Option<u16>,
    payload: Vec<u8>,
}

impl H265FragmentationUnitPacket {
    fn parse(packet: &[u8], with_donl: bool) -> Result<Self, PacketError> {
        const TOTAL_HEADER_SIZE: usize =
            H265_NALU_HEADER_SIZE + H265_FRAGMENTATION_UNIT_HEADER_SIZE;
        if packet.len() <= TOTAL_HEADER_SIZE {
            return Err(PacketError::ShortPacket);
        }

        let payload_header = H265NALUHeader::new(packet[0], packet[1]);
        let fu_header = H265FragmentationUnitHeader(packet[2]);
        let mut rest = &packet[3..];

        let mut donl = None;
        if fu_header.s() && with_donl {
            if rest.len() <= 2 {
                return Err(PacketError::ShortPacket);
            }
            donl = Some(u16::from_be_bytes([rest[0], rest[1]]));
            rest = &rest[2..];
        }

        Ok(H265FragmentationUnitPacket {
            payload_header,
            fu_header,
            donl,
            payload: rest.to_vec(),
        })
    }

    /// The NALU header of the packet.
    pub fn payload_header(&self) -> H265NALUHeader {
        self.payload_header
    }

    /// The FU header of the packet.
    pub fn fu_header(&self) -> H265FragmentationUnitHeader {
        self.fu_header
    }

    /// DONL of the packet, present on S fragments in DONL mode.
    pub fn donl(&self) -> Option<u16> {
        self.donl
    }

    /// The fragment body.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// A PACI packet (type 50).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |    PayloadHdr (Type=50)       |A|   cType   | PHSsize |F0..2|Y|
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |        Payload Header Extension Structure (PHES)              |
/// |=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=|
/// |                  PACI payload: NAL unit                       |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Reference: https://datatracker.ietf.org/doc/html/rfc7798#section-4.4.4
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct H265PACIPacket {
    payload_header: H265NALUHeader,
    paci_header_fields: u16,
    phes: Vec<u8>,
    payload: Vec<u8>,
}

impl H265PACIPacket {
    fn parse(packet: &[u8]) -> Result<Self, PacketError> {
        const TOTAL_HEADER_SIZE: usize = H265_NALU_HEADER_SIZE + 2;
        if packet.len() <= TOTAL_HEADER_SIZE {
            return Err(PacketError::ShortPacket);
        }

        let payload_header = H265NALUHeader::new(packet[0], packet[1]);
        let paci_header_fields = u16::from_be_bytes([packet[2], packet[3]]);
        let rest = &packet[4..];

        let mut paci = H265PACIPacket {
            payload_header,
            paci_header_fields,
            phes: vec![],
            payload: vec![],
        };

        let phs_size = paci.phs_size() as usize;
        if rest.len() < phs_size + 1 {
            return Err(PacketError::ShortPacket);
        }

        paci.phes = rest[..phs_size].to_vec();
        paci.payload = rest[phs_size..].to_vec();

        Ok(paci)
    }

    /// The NAL unit header.
    pub fn payload_header(&self) -> H265NALUHeader {
        self.payload_header
    }

    /// A copies the F bit of the PACI payload NALU.
    pub fn a(&self) -> bool {
        const MASK: u16 = 0b10000000 << 8;
        (self.paci_header_fields & MASK) != 0
    }

    /// CType copies the Type field of the PACI payload NALU.
    pub fn ctype(&self) -> u8 {
        const MASK: u16 = 0b01111110 << 8;
        ((self.paci_header_fields & MASK) >> (8 + 1)) as u8
    }

    /// Size of the PHES field in octets.
    pub fn phs_size(&self) -> u8 {
        const MASK: u16 = (0b00000001 << 8) | 0b11110000;
        ((self.paci_header_fields & MASK) >> 4) as u8
    }

    /// Indicates a temporal scalability support extension in the PHES.
    pub fn f0(&self) -> bool {
        const MASK: u16 = 0b00001000;
        (self.paci_header_fields & MASK) != 0
    }

    /// Must be zero, reserved for future extensions.
    pub fn f1(&self) -> bool {
        const MASK: u16 = 0b00000100;
        (self.paci_header_fields & MASK) != 0
    }

    /// Must be zero, reserved for future extensions.
    pub fn f2(&self) -> bool {
        const MASK: u16 = 0b00000010;
        (self.paci_header_fields & MASK) != 0
    }

    /// Must be zero, reserved for future extensions.
    pub fn y(&self) -> bool {
        const MASK: u16 = 0b00000001;
        (self.paci_header_fields & MASK) != 0
    }

    /// The header extension bytes, of length `phs_size()`.
    pub fn phes(&self) -> &[u8] {
        &self.phes
    }

    /// The carried NAL unit body, without its first two octets.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The temporal scalability control information extension, if present.
    pub fn tsci(&self) -> Option<H265TSCI> {
        if !self.f0() || self.phs_size() < 3 || self.phes.len() < 3 {
            return None;
        }

        Some(H265TSCI(
            ((self.phes[0] as u32) << 16) | ((self.phes[1] as u32) << 8) | self.phes[2] as u32,
        ))
    }
}

/// Temporal scalability control information, a 3-octet PHES extension.
/// Reference: https://datatracker.ietf.org/doc/html/rfc7798#section-4.5
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct H265TSCI(pub u32);

impl H265TSCI {
    /// Temporal layer zero index.
    pub fn tl0picidx(&self) -> u8 {
        (self.0 >> 16) as u8
    }

    /// IRAP picture id.
    pub fn irap_pic_id(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    /// Start-of-stream bit.
    pub fn s(&self) -> bool {
        self.0 & 0b10000000 != 0
    }

    /// End-of-stream bit.
    pub fn e(&self) -> bool {
        self.0 & 0b01000000 != 0
    }

    /// Reserved bits.
    pub fn res(&self) -> u8 {
        (self.0 & 0b00111111) as u8
    }
}

/// One parsed H265 payload, in any of the four packet shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum H265Payload {
    SingleNalu(H265SingleNALUnitPacket),
    FragmentationUnit(H265FragmentationUnitPacket),
    Aggregation(H265AggregationPacket),
    Paci(H265PACIPacket),
}

impl H265Payload {
    /// Parse a payload into its packet shape.
    ///
    /// The forbidden bit being set fails with [`PacketError::Corrupted`] in
    /// every case.
    pub fn parse(packet: &[u8], with_donl: bool) -> Result<H265Payload, PacketError> {
        if packet.len() <= H265_NALU_HEADER_SIZE {
            return Err(PacketError::ShortPacket);
        }

        let header = H265NALUHeader::new(packet[0], packet[1]);
        if header.f() {
            return Err(PacketError::Corrupted);
        }

        if header.is_paci_packet() {
            Ok(H265Payload::Paci(H265PACIPacket::parse(packet)?))
        } else if header.is_fragmentation_unit() {
            Ok(H265Payload::FragmentationUnit(
                H265FragmentationUnitPacket::parse(packet, with_donl)?,
            ))
        } else if header.is_aggregation_packet() {
            Ok(H265Payload::Aggregation(H265AggregationPacket::parse(
                packet, with_donl,
            )?))
        } else {
            Ok(H265Payload::SingleNalu(H265SingleNALUnitPacket::parse(
                packet, with_donl,
            )?))
        }
    }
}

impl Default for H265Payload {
    fn default() -> Self {
        H265Payload::SingleNalu(H265SingleNALUnitPacket::default())
    }
}

/// Depacketizes H265 packets into NAL units.
///
/// Note: an aggregation packet yields only its first contained NAL unit to
/// the output; the remaining units stay accessible via [`H265Depacketizer::payload`].
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct H265Depacketizer {
    payload: H265Payload,
    might_need_donl: bool,
    fragment_buffer: Vec<u8>,
    fragment_valid: bool,
}

impl H265Depacketizer {
    /// Specify whether DONL fields might be present.
    ///
    /// DONL may need to be parsed if `sprop-max-don-diff` is greater than 0
    /// on the RTP stream.
    pub fn with_donl(&mut self, value: bool) {
        self.might_need_donl = value;
    }

    /// The most recently parsed payload.
    pub fn payload(&self) -> &H265Payload {
        &self.payload
    }
}

impl Depacketizer for H265Depacketizer {
    fn depacketize(&mut self, packet: &[u8], out: &mut Vec<u8>) -> Result<(), PacketError> {
        self.payload = H265Payload::parse(packet, self.might_need_donl)?;

        match &self.payload {
            H265Payload::FragmentationUnit(fu) => {
                let fu_header = fu.fu_header();

                if fu_header.s() {
                    // Start fragment: reset and rebuild the NAL header from
                    // the payload header and the FU type.
                    self.fragment_buffer.clear();
                    self.fragment_valid = true;

                    let header = fu.payload_header();
                    let f_bit = if header.f() { 1u16 } else { 0 };
                    let reconstructed = (f_bit << 15)
                        | ((fu_header.fu_type() as u16) << 9)
                        | ((header.layer_id() as u16) << 3)
                        | header.tid() as u16;
                    self.fragment_buffer
                        .extend_from_slice(&reconstructed.to_be_bytes());
                } else if !self.fragment_valid {
                    // Continuation without a start fragment: drop until the
                    // next partition head arrives.
                    trace!("H265 FU continuation without start, dropping");
                    return Ok(());
                }

                self.fragment_buffer.extend_from_slice(fu.payload());

                if fu_header.e() {
                    out.extend_from_slice(&self.fragment_buffer);
                    self.fragment_buffer.clear();
                    self.fragment_valid = false;
                }

                Ok(())
            }
            H265Payload::SingleNalu(single) => {
                out.extend_from_slice(&single.payload_header().0.to_be_bytes());
                out.extend_from_slice(single.payload());
                Ok(())
            }
            H265Payload::Aggregation(agg) => {
                // Only the first unit reaches the output. The others remain
                // accessible on `payload()`.
                let first = agg.first_unit().ok_or(PacketError::ShortPacket)?;
                out.extend_from_slice(first.nal_unit());
                Ok(())
            }
            H265Payload::Paci(paci) => {
                let f_bit = if paci.a() { 1u16 } else { 0 };
                let reconstructed = (f_bit << 15) | ((paci.ctype() as u16) << 9);
                out.extend_from_slice(&reconstructed.to_be_bytes());
                out.extend_from_slice(paci.payload());
                Ok(())
            }
        }
    }

    fn is_partition_head(&self, packet: &[u8]) -> bool {
        if packet.len() < 3 {
            return false;
        }

        let header = H265NALUHeader::new(packet[0], packet[1]);
        if header.is_fragmentation_unit() {
            H265FragmentationUnitHeader(packet[2]).s()
        } else {
            // Aggregation, PACI and single NALU packets always start a
            // partition.
            true
        }
    }

    fn is_partition_tail(&self, marker: bool, packet: &[u8]) -> bool {
        if packet.len() < 3 {
            return false;
        }

        let header = H265NALUHeader::new(packet[0], packet[1]);
        if header.is_fragmentation_unit() {
            H265FragmentationUnitHeader(packet[2]).e()
        } else {
            marker
        }
    }
}

/// Packetizes H265 Annex-B byte streams.
///
/// Small NAL units are buffered and flushed as aggregation packets (or a
/// single-NALU packet when only one is buffered); large NAL units become
/// fragmentation units. DONL mode inserts decoding order numbers.
#[derive(Default, Debug, Clone)]
pub struct H265Packetizer {
    pub(crate) add_donl: bool,
    pub(crate) skip_aggregation: bool,
    donl: u16,
}

impl H265Packetizer {
    /// Enable or disable DONL insertion.
    pub fn with_donl(&mut self, value: bool) {
        self.add_donl = value;
    }

    /// When set, every NAL unit is emitted on its own instead of being
    /// aggregated.
    pub fn with_skip_aggregation(&mut self, value: bool) {
        self.skip_aggregation = value;
    }

    fn process_nalu(
        &mut self,
        nalu: &[u8],
        mtu: usize,
        buffered_nalus: &mut Vec<Vec<u8>>,
        aggregation_buffer_size: &mut usize,
        payloads: &mut Vec<Vec<u8>>,
    ) {
        if nalu.len() < H265_NALU_HEADER_SIZE {
            return;
        }

        let mut nalu_len = nalu.len() + H265_NALU_HEADER_SIZE;
        if self.add_donl {
            nalu_len += 2;
        }

        if nalu_len > mtu {
            // Too large for one packet: flush anything aggregated so far,
            // then fragment.
            self.flush_buffered_nalus(buffered_nalus, payloads);
            *aggregation_buffer_size = 0;
            self.fragment_nalu(nalu, mtu, payloads);
            return;
        }

        let mut marginal_size = self.marginal_aggregation_size(nalu, buffered_nalus);
        if *aggregation_buffer_size + marginal_size > mtu {
            self.flush_buffered_nalus(buffered_nalus, payloads);
            *aggregation_buffer_size = 0;
            marginal_size = self.marginal_aggregation_size(nalu, buffered_nalus);
        }

        buffered_nalus.push(nalu.to_vec());
        *aggregation_buffer_size += marginal_size;

        if self.skip_aggregation {
            self.flush_buffered_nalus(buffered_nalus, payloads);
            *aggregation_buffer_size = 0;
        }
    }

    fn marginal_aggregation_size(&self, nalu: &[u8], buffered_nalus: &[Vec<u8>]) -> usize {
        // +2 is the NALU size field. When the buffer holds exactly one NALU
        // this addition turns it into a real aggregation, so the aggregation
        // header is accounted as well.
        let mut marginal = nalu.len() + 2;
        if buffered_nalus.len() == 1 {
            marginal = nalu.len() + 4;
        }
        if self.add_donl {
            if buffered_nalus.is_empty() {
                marginal += 2;
            } else {
                marginal += 1;
            }
        }
        marginal
    }

    fn output_single_nalu(&mut self, nalu: &[u8], payloads: &mut Vec<Vec<u8>>) {
        if self.add_donl {
            let mut packet = Vec::with_capacity(nalu.len() + 2);
            packet.extend_from_slice(&nalu[..H265_NALU_HEADER_SIZE]);
            packet.extend_from_slice(&self.donl.to_be_bytes());
            packet.extend_from_slice(&nalu[H265_NALU_HEADER_SIZE..]);
            self.donl = self.donl.wrapping_add(1);
            payloads.push(packet);
        } else {
            payloads.push(nalu.to_vec());
        }
    }

    fn flush_buffered_nalus(
        &mut self,
        buffered_nalus: &mut Vec<Vec<u8>>,
        payloads: &mut Vec<Vec<u8>>,
    ) {
        match buffered_nalus.len() {
            0 => return,
            1 => {
                let nalu = buffered_nalus.remove(0);
                self.output_single_nalu(&nalu, payloads);
            }
            _ => {
                // The aggregation header carries the minimum layer_id and
                // tid across the aggregated units.
                let mut layer_id = u8::MAX;
                let mut tid = u8::MAX;
                for nalu in buffered_nalus.iter() {
                    let header = H265NALUHeader::new(nalu[0], nalu[1]);
                    layer_id = layer_id.min(header.layer_id());
                    tid = tid.min(header.tid());
                }

                let aggregation_header = ((H265_NALU_AGGREGATION_PACKET_TYPE as u16) << 9)
                    | ((layer_id as u16) << 3)
                    | tid as u16;

                let mut packet = Vec::new();
                packet.extend_from_slice(&aggregation_header.to_be_bytes());

                for (i, nalu) in buffered_nalus.iter().enumerate() {
                    if self.add_donl {
                        if i == 0 {
                            packet.extend_from_slice(&self.donl.to_be_bytes());
                        } else {
                            packet.push((i - 1) as u8);
                        }
                    }
                    packet.extend_from_slice(&(nalu.len() as u16).to_be_bytes());
                    packet.extend_from_slice(nalu);
                }

                payloads.push(packet);
            }
        }
        buffered_nalus.clear();
    }

    fn fragment_nalu(&mut self, nalu: &[u8], mtu: usize, payloads: &mut Vec<Vec<u8>>) {
        let header = H265NALUHeader::new(nalu[0], nalu[1]);
        let nalu_type = header.nalu_type();

        let mut fu_packet_header_size =
            H265_NALU_HEADER_SIZE + H265_FRAGMENTATION_UNIT_HEADER_SIZE;
        if self.add_donl {
            fu_packet_header_size += 2;
        }

        if mtu <= fu_packet_header_size {
            return;
        }
        let max_fu_payload_size = mtu - fu_packet_header_size;

        // The NALU header is not carried in the fragment payloads.
        let nalu_data = &nalu[H265_NALU_HEADER_SIZE..];
        if nalu_data.is_empty() {
            return;
        }

        let mut offset = 0;
        while offset < nalu_data.len() {
            let fragment_size = max_fu_payload_size.min(nalu_data.len() - offset);

            let mut packet = Vec::with_capacity(fu_packet_header_size + fragment_size);

            // Payload header: keep F and the layer/tid bits, replace the
            // type with 49.
            let fu_payload_header = (header.0 & 0b10000001_11111111)
                | ((H265_NALU_FRAGMENTATION_UNIT_TYPE as u16) << 9);
            packet.extend_from_slice(&fu_payload_header.to_be_bytes());

            let mut fu_header = nalu_type;
            if offset == 0 {
                fu_header |= 0b10000000; // S
            } else if offset + fragment_size == nalu_data.len() {
                fu_header |= 0b01000000; // E
            }
            packet.push(fu_header);

            if self.add_donl {
                packet.extend_from_slice(&self.donl.to_be_bytes());
                self.donl = self.donl.wrapping_add(1);
            }

            packet.extend_from_slice(&nalu_data[offset..offset + fragment_size]);
            payloads.push(packet);

            offset += fragment_size;
        }
    }
}

impl Packetizer for H265Packetizer {
    fn packetize(&mut self, mtu: usize, frame: &[u8]) -> Result<Vec<Vec<u8>>, PacketError> {
        if frame.is_empty() || mtu == 0 {
            return Ok(vec![]);
        }

        let mut payloads = Vec::new();
        let mut buffered_nalus = Vec::new();
        let mut aggregation_buffer_size = 0;

        let (mut ind_start, mut ind_len) = next_ind(frame, 0);
        if ind_start == -1 {
            // No start code: the whole frame is one NAL unit.
            self.process_nalu(
                frame,
                mtu,
                &mut buffered_nalus,
                &mut aggregation_buffer_size,
                &mut payloads,
            );
        } else {
            while ind_start != -1 {
                let nalu_start = (ind_start + ind_len) as usize;
                let (next_start, next_len) = next_ind(frame, nalu_start);
                ind_start = next_start;
                ind_len = next_len;

                let nalu_end = if ind_start == -1 {
                    frame.len()
                } else {
                    ind_start as usize
                };

                self.process_nalu(
                    &frame[nalu_start..nalu_end],
                    mtu,
                    &mut buffered_nalus,
                    &mut aggregation_buffer_size,
                    &mut payloads,
                );
            }
        }

        self.flush_buffered_nalus(&mut buffered_nalus, &mut payloads);

        Ok(payloads)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_h265_nalu_header() {
        struct TestType {
            raw_header: &'static [u8],
            fbit: bool,
            typ: u8,
            layer_id: u8,
            tid: u8,
            is_ap: bool,
            is_fu: bool,
            is_paci: bool,
        }

        impl Default for TestType {
            fn default() -> Self {
                TestType {
                    raw_header: &[],
                    fbit: false,
                    typ: 0,
                    layer_id: 0,
                    tid: 0,
                    is_ap: false,
                    is_fu: false,
                    is_paci: false,
                }
            }
        }

        let tests = vec![
            // fbit
            TestType {
                raw_header: &[0x80, 0x00],
                fbit: true,
                ..Default::default()
            },
            // VPS_NUT
            TestType {
                raw_header: &[0x40, 0x01],
                typ: 32,
                tid: 1,
                ..Default::default()
            },
            // SPS_NUT
            TestType {
                raw_header: &[0x42, 0x01],
                typ: 33,
                tid: 1,
                ..Default::default()
            },
            // PPS_NUT
            TestType {
                raw_header: &[0x44, 0x01],
                typ: 34,
                tid: 1,
                ..Default::default()
            },
            // Aggregation packet
            TestType {
                raw_header: &[0x60, 0x01],
                typ: H265_NALU_AGGREGATION_PACKET_TYPE,
                tid: 1,
                is_ap: true,
                ..Default::default()
            },
            // Fragmentation unit
            TestType {
                raw_header: &[0x62, 0x01],
                typ: H265_NALU_FRAGMENTATION_UNIT_TYPE,
                tid: 1,
                is_fu: true,
                ..Default::default()
            },
            // PACI
            TestType {
                raw_header: &[0x64, 0x01],
                typ: H265_NALU_PACI_PACKET_TYPE,
                tid: 1,
                is_paci: true,
                ..Default::default()
            },
        ];

        for cur in tests {
            let header = H265NALUHeader::new(cur.raw_header[0], cur.raw_header[1]);

            assert_eq!(header.f(), cur.fbit, "invalid F bit");
            assert_eq!(header.nalu_type(), cur.typ, "invalid type");
            assert_eq!(
                header.is_type_vcl_unit(),
                header.nalu_type() < 32,
                "invalid is_type_vcl_unit"
            );
            assert_eq!(header.is_aggregation_packet(), cur.is_ap);
            assert_eq!(header.is_fragmentation_unit(), cur.is_fu);
            assert_eq!(header.is_paci_packet(), cur.is_paci);
            assert_eq!(header.layer_id(), cur.layer_id, "invalid layer_id");
            assert_eq!(header.tid(), cur.tid, "invalid tid");
        }
    }

    #[test]
    fn test_h265_fu_header() {
        let tests = [
            // Start | IDR_W_RADL
            (H265FragmentationUnitHeader(0x93), true, false, 19),
            // Continuation | IDR_W_RADL
            (H265FragmentationUnitHeader(0x13), false, false, 19),
            // End | IDR_W_RADL
            (H265FragmentationUnitHeader(0x53), false, true, 19),
            // Start | TRAIL_R
            (H265FragmentationUnitHeader(0x81), true, false, 1),
            // End | TRAIL_R
            (H265FragmentationUnitHeader(0x41), false, true, 1),
        ];

        for (header, s, e, typ) in tests {
            assert_eq!(header.s(), s, "invalid S bit");
            assert_eq!(header.e(), e, "invalid E bit");
            assert_eq!(header.fu_type(), typ, "invalid FU type");
        }
    }

    #[test]
    fn single_nalu_round_trip() -> Result<(), PacketError> {
        // type 32 (VPS), tid 1
        let nalu = vec![0x40, 0x01, 0xAA, 0xBB, 0xCC];

        let mut pck = H265Packetizer::default();
        let payloads = pck.packetize(1200, &nalu)?;
        assert_eq!(payloads, vec![nalu.clone()]);

        let mut depck = H265Depacketizer::default();
        let mut out = Vec::new();
        depck.depacketize(&payloads[0], &mut out)?;
        assert_eq!(out, nalu);

        Ok(())
    }

    #[test]
    fn single_nalu_with_donl() -> Result<(), PacketError> {
        let nalu = vec![0x40, 0x01, 0xAA, 0xBB, 0xCC];

        let mut pck = H265Packetizer::default();
        pck.with_donl(true);
        pck.with_skip_aggregation(true);

        let payloads = pck.packetize(1200, &nalu)?;
        assert_eq!(payloads.len(), 1);
        // DONL 0 inserted after the two header octets
        assert_eq!(payloads[0], vec![0x40, 0x01, 0x00, 0x00, 0xAA, 0xBB, 0xCC]);

        let mut depck = H265Depacketizer::default();
        depck.with_donl(true);
        let mut out = Vec::new();
        depck.depacketize(&payloads[0], &mut out)?;
        assert_eq!(out, nalu);

        if let H265Payload::SingleNalu(single) = depck.payload() {
            assert_eq!(single.donl(), Some(0));
        } else {
            panic!("expected a single NALU payload");
        }

        Ok(())
    }

    #[test]
    fn aggregation_of_small_nalus() -> Result<(), PacketError> {
        // Two small NALUs separated by start codes. Types 32 and 33 with
        // differing tids; the aggregation header must carry the minima.
        let frame = [
            0x00, 0x00, 0x01, 0x40, 0x02, 0xAA, // VPS, tid 2
            0x00, 0x00, 0x01, 0x42, 0x01, 0xBB, // SPS, tid 1
        ];

        let mut pck = H265Packetizer::default();
        let payloads = pck.packetize(1200, &frame)?;
        assert_eq!(payloads.len(), 1, "both NALUs should aggregate");

        let agg = &payloads[0];
        let header = H265NALUHeader::new(agg[0], agg[1]);
        assert_eq!(header.nalu_type(), H265_NALU_AGGREGATION_PACKET_TYPE);
        assert_eq!(header.layer_id(), 0);
        assert_eq!(header.tid(), 1, "tid must be the minimum across units");

        #[rustfmt::skip]
        assert_eq!(
            agg[2..],
            [
                0x00, 0x03, 0x40, 0x02, 0xAA,
                0x00, 0x03, 0x42, 0x01, 0xBB,
            ]
        );

        // The depacketizer hands back the first unit only.
        let mut depck = H265Depacketizer::default();
        let mut out = Vec::new();
        depck.depacketize(agg, &mut out)?;
        assert_eq!(out, vec![0x40, 0x02, 0xAA]);

        if let H265Payload::Aggregation(parsed) = depck.payload() {
            assert_eq!(parsed.other_units().len(), 1);
            assert_eq!(parsed.other_units()[0].nal_unit(), &[0x42, 0x01, 0xBB]);
        } else {
            panic!("expected an aggregation payload");
        }

        Ok(())
    }

    #[test]
    fn aggregation_with_donl() -> Result<(), PacketError> {
        let frame = [
            0x00, 0x00, 0x01, 0x40, 0x01, 0xAA, //
            0x00, 0x00, 0x01, 0x42, 0x01, 0xBB, //
        ];

        let mut pck = H265Packetizer::default();
        pck.with_donl(true);
        let payloads = pck.packetize(1200, &frame)?;
        assert_eq!(payloads.len(), 1);

        let agg = &payloads[0];
        // header(2) + DONL(2) + size(2) + nalu(3) + DOND(1) + size(2) + nalu(3)
        assert_eq!(agg.len(), 15);

        let mut depck = H265Depacketizer::default();
        depck.with_donl(true);
        let mut out = Vec::new();
        depck.depacketize(agg, &mut out)?;
        assert_eq!(out, vec![0x40, 0x01, 0xAA]);

        if let H265Payload::Aggregation(parsed) = depck.payload() {
            let first = parsed.first_unit().unwrap();
            assert_eq!(first.donl(), Some(0));
            assert_eq!(parsed.other_units()[0].dond(), Some(0));
        } else {
            panic!("expected an aggregation payload");
        }

        Ok(())
    }

    #[test]
    fn aggregation_requires_two_units() {
        // A type 48 packet holding a single unit is malformed.
        let packet = [
            0x60, 0x01, // aggregation header
            0x00, 0x03, 0x40, 0x01, 0xAA, // one unit only
        ];

        assert_eq!(
            H265Payload::parse(&packet, false),
            Err(PacketError::ShortPacket)
        );
    }

    #[test]
    fn fragmentation_round_trip() -> Result<(), PacketError> {
        // NAL with header {0x40, 0x01} (type 32, layer 0, tid 1) and a 500
        // octet body.
        let mut nalu = vec![0x40, 0x01];
        nalu.extend((0..500).map(|i| i as u8));

        let mut pck = H265Packetizer::default();
        let payloads = pck.packetize(100, &nalu)?;
        assert_eq!(payloads.len(), 6, "500 octets at MTU 100 makes 6 FUs");

        for (i, p) in payloads.iter().enumerate() {
            assert!(p.len() <= 100);
            // payload header: type 49, layer/tid preserved
            assert_eq!(p[0], 0x62);
            assert_eq!(p[1], 0x01);

            let fu = H265FragmentationUnitHeader(p[2]);
            assert_eq!(fu.fu_type(), 32);
            assert_eq!(fu.s(), i == 0, "S only on the first fragment");
            assert_eq!(fu.e(), i == payloads.len() - 1, "E only on the last");
        }

        let mut depck = H265Depacketizer::default();
        let mut out = Vec::new();
        for p in &payloads {
            depck.depacketize(p, &mut out)?;
        }
        assert_eq!(out, nalu, "reassembly must reproduce the original NALU");

        Ok(())
    }

    #[test]
    fn fragment_continuation_without_start_is_dropped() -> Result<(), PacketError> {
        let mut nalu = vec![0x40, 0x01];
        nalu.extend(std::iter::repeat(0xAB).take(300));

        let mut pck = H265Packetizer::default();
        let payloads = pck.packetize(100, &nalu)?;
        assert!(payloads.len() >= 3);

        // Lose the start fragment.
        let mut depck = H265Depacketizer::default();
        let mut out = Vec::new();
        for p in &payloads[1..] {
            depck.depacketize(p, &mut out)?;
        }
        assert!(out.is_empty(), "no partial fragment may leak");

        // A subsequent complete unit resynchronizes.
        let mut out = Vec::new();
        for p in &payloads {
            depck.depacketize(p, &mut out)?;
        }
        assert_eq!(out, nalu);

        Ok(())
    }

    #[test]
    fn fragment_restart_discards_stale_buffer() -> Result<(), PacketError> {
        let mut nalu = vec![0x40, 0x01];
        nalu.extend(std::iter::repeat(0xCD).take(300));

        let mut pck = H265Packetizer::default();
        let payloads = pck.packetize(100, &nalu)?;

        let mut depck = H265Depacketizer::default();
        let mut out = Vec::new();

        // Start fragment arrives, then the E fragment is lost and a new
        // start fragment begins. The stale prefix must not survive.
        depck.depacketize(&payloads[0], &mut out)?;
        for p in &payloads {
            depck.depacketize(p, &mut out)?;
        }
        assert_eq!(out, nalu);

        Ok(())
    }

    #[test]
    fn skip_aggregation_emits_singles() -> Result<(), PacketError> {
        let frame = [
            0x00, 0x00, 0x01, 0x40, 0x01, 0xAA, //
            0x00, 0x00, 0x01, 0x42, 0x01, 0xBB, //
        ];

        let mut pck = H265Packetizer::default();
        pck.with_skip_aggregation(true);
        let payloads = pck.packetize(1200, &frame)?;

        assert_eq!(
            payloads,
            vec![vec![0x40, 0x01, 0xAA], vec![0x42, 0x01, 0xBB]]
        );

        Ok(())
    }

    #[test]
    fn paci_packet() -> Result<(), PacketError> {
        // PACI carrying cType 32 with a 3-octet TSCI extension.
        #[rustfmt::skip]
        let packet = [
            0x64, 0x01,             // payload header, type 50
            0b1_100000_0 | 0x00, 0b001_1_1000, // A=1, cType=32, PHSsize=3, F0=1
            0x05, 0x06, 0b10_000001, // TSCI: tl0picidx 5, irap 6, S=1
            0xAA, 0xBB,             // payload
        ];

        let mut depck = H265Depacketizer::default();
        let mut out = Vec::new();
        depck.depacketize(&packet, &mut out)?;

        // Reconstructed NAL header: F=1 from A, type 32, layer 0, tid 0.
        assert_eq!(out, vec![0xC0, 0x00, 0xAA, 0xBB]);

        if let H265Payload::Paci(paci) = depck.payload() {
            assert!(paci.a());
            assert_eq!(paci.ctype(), 32);
            assert_eq!(paci.phs_size(), 3);
            assert!(paci.f0());
            let tsci = paci.tsci().expect("tsci present");
            assert_eq!(tsci.tl0picidx(), 5);
            assert_eq!(tsci.irap_pic_id(), 6);
            assert!(tsci.s());
            assert!(!tsci.e());
        } else {
            panic!("expected a PACI payload");
        }

        Ok(())
    }

    #[test]
    fn forbidden_bit_is_corrupted() {
        let packet = [0x80, 0x01, 0xAA, 0xBB];
        assert_eq!(
            H265Payload::parse(&packet, false),
            Err(PacketError::Corrupted)
        );
    }

    #[test]
    fn partition_bounds() {
        let depck = H265Depacketizer::default();

        // Too short to determine.
        assert!(!depck.is_partition_head(&[0x62]));
        assert!(!depck.is_partition_tail(true, &[0x62]));

        // FU with S bit.
        assert!(depck.is_partition_head(&[0x62, 0x01, 0x80 | 32]));
        assert!(!depck.is_partition_head(&[0x62, 0x01, 32]));

        // FU with E bit.
        assert!(depck.is_partition_tail(false, &[0x62, 0x01, 0x40 | 32]));
        assert!(!depck.is_partition_tail(false, &[0x62, 0x01, 0x80 | 32]));

        // Non-FU packets follow the marker for the tail.
        assert!(depck.is_partition_head(&[0x40, 0x01, 0xAA]));
        assert!(depck.is_partition_tail(true, &[0x40, 0x01, 0xAA]));
        assert!(!depck.is_partition_tail(false, &[0x40, 0x01, 0xAA]));
    }

    #[test]
    fn aggregation_flushes_when_full() -> Result<(), PacketError> {
        // Three NALUs of 40 octets each; MTU 100 fits two per aggregation.
        let mut frame = Vec::new();
        for t in [0x40u8, 0x42, 0x44] {
            frame.extend_from_slice(&[0x00, 0x00, 0x01, t, 0x01]);
            frame.extend(std::iter::repeat(0xEE).take(38));
        }

        let mut pck = H265Packetizer::default();
        let payloads = pck.packetize(100, &frame)?;

        assert_eq!(payloads.len(), 2);

        // First payload aggregates two units, second is a lone single NALU.
        let header = H265NALUHeader::new(payloads[0][0], payloads[0][1]);
        assert!(header.is_aggregation_packet());
        let header = H265NALUHeader::new(payloads[1][0], payloads[1][1]);
        assert_eq!(header.nalu_type(), 34);

        Ok(())
    }
}
