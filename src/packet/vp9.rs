use super::{BitRead, Depacketizer, PacketError, Packetizer};
use crate::util::NonCryptographicRng;

/// Flexible mode descriptor: control octet + 15 bit picture id.
const VP9_FLEXIBLE_HEADER_SIZE: usize = 3;
/// Non-flexible mode adds layer indices and TL0PICIDX.
const VP9_NON_FLEXIBLE_HEADER_SIZE: usize = 5;

const MAX_SPATIAL_LAYERS: u8 = 5;
const MAX_VP9_REF_PICS: usize = 3;

/// Packetizes VP9 frames.
///
/// Two wire modes exist. In flexible mode (F=1) the descriptor is three
/// octets: control, then a 15 bit picture id. In non-flexible mode (F=0)
/// layer indices and a TL0PICIDX octet follow the picture id, and the P bit
/// is cleared only for frames whose uncompressed header prefix parses as a
/// keyframe.
#[derive(Default, Debug, Clone)]
pub struct Vp9Packetizer {
    pub(crate) flexible_mode: bool,
    pub(crate) picture_id: u16,
    pub(crate) initialized: bool,
    tl0_pic_idx: u8,
}

impl Vp9Packetizer {
    /// Switch between flexible (F=1) and non-flexible (F=0) mode.
    pub fn set_flexible_mode(&mut self, enable: bool) {
        self.flexible_mode = enable;
    }

    /// Pin the starting picture id. Also suppresses the lazy random init.
    pub fn set_initial_picture_id(&mut self, id: u16) {
        self.picture_id = id & 0x7FFF;
        self.initialized = true;
    }

    fn payload_flexible(
        &mut self,
        mtu: usize,
        frame: &[u8],
    ) -> Result<Vec<Vec<u8>>, PacketError> {
        /*
         * Flexible mode (F=1)
         *        0 1 2 3 4 5 6 7
         *       +-+-+-+-+-+-+-+-+
         *       |I|P|L|F|B|E|V|Z| (REQUIRED)
         *       +-+-+-+-+-+-+-+-+
         *  I:   |M| PICTURE ID  | (REQUIRED)
         *       +-+-+-+-+-+-+-+-+
         *  M:   | EXTENDED PID  | (RECOMMENDED)
         *       +-+-+-+-+-+-+-+-+
         */
        let max_fragment_size = mtu as isize - VP9_FLEXIBLE_HEADER_SIZE as isize;
        if max_fragment_size <= 0 {
            return Err(PacketError::FrameTooLarge);
        }
        let max_fragment_size = max_fragment_size as usize;

        let mut payloads = vec![];
        let mut remaining = frame.len();
        let mut index = 0;

        while remaining > 0 {
            let fragment_size = max_fragment_size.min(remaining);
            let mut out = Vec::with_capacity(VP9_FLEXIBLE_HEADER_SIZE + fragment_size);

            let mut b0 = 0x90; // I=1, F=1
            if index == 0 {
                b0 |= 0x08; // B=1
            }
            if remaining == fragment_size {
                b0 |= 0x04; // E=1
            }
            out.push(b0);
            out.push((self.picture_id >> 8) as u8 | 0x80);
            out.push((self.picture_id & 0xFF) as u8);

            out.extend_from_slice(&frame[index..index + fragment_size]);
            payloads.push(out);

            remaining -= fragment_size;
            index += fragment_size;
        }

        Ok(payloads)
    }

    fn payload_non_flexible(
        &mut self,
        mtu: usize,
        frame: &[u8],
    ) -> Result<Vec<Vec<u8>>, PacketError> {
        /*
         * Non-flexible mode (F=0)
         *        0 1 2 3 4 5 6 7
         *       +-+-+-+-+-+-+-+-+
         *       |I|P|L|F|B|E|V|Z| (REQUIRED)
         *       +-+-+-+-+-+-+-+-+
         *  I:   |M| PICTURE ID  | (REQUIRED)
         *       +-+-+-+-+-+-+-+-+
         *  M:   | EXTENDED PID  | (RECOMMENDED)
         *       +-+-+-+-+-+-+-+-+
         *  L:   |  T  |U|  S  |D| (REQUIRED)
         *       +-+-+-+-+-+-+-+-+
         *       |   TL0PICIDX   | (REQUIRED)
         *       +-+-+-+-+-+-+-+-+
         */
        let is_key_frame = Vp9FrameHeader::parse(frame)
            .map(|h| h.is_key_frame())
            .unwrap_or(false);

        let max_fragment_size = mtu as isize - VP9_NON_FLEXIBLE_HEADER_SIZE as isize;
        if max_fragment_size <= 0 {
            return Err(PacketError::FrameTooLarge);
        }
        let max_fragment_size = max_fragment_size as usize;

        // Single temporal layer, no spatial scalability.
        let temporal_id = 0u8;
        let spatial_id = 0u8;

        let mut payloads = vec![];
        let mut remaining = frame.len();
        let mut index = 0;

        while remaining > 0 {
            let fragment_size = max_fragment_size.min(remaining);
            let mut out = Vec::with_capacity(VP9_NON_FLEXIBLE_HEADER_SIZE + fragment_size);

            let mut b0 = 0x80 | 0x20; // I=1, L=1
            if !is_key_frame {
                b0 |= 0x40; // P=1
            }
            if index == 0 {
                b0 |= 0x08; // B=1
            }
            if remaining == fragment_size {
                b0 |= 0x04; // E=1
            }
            out.push(b0);
            out.push((self.picture_id >> 8) as u8 | 0x80);
            out.push((self.picture_id & 0xFF) as u8);
            out.push((temporal_id << 5) | (spatial_id << 1));
            out.push(self.tl0_pic_idx);
            if temporal_id == 0 {
                self.tl0_pic_idx = self.tl0_pic_idx.wrapping_add(1);
            }

            out.extend_from_slice(&frame[index..index + fragment_size]);
            payloads.push(out);

            remaining -= fragment_size;
            index += fragment_size;
        }

        Ok(payloads)
    }
}

impl Packetizer for Vp9Packetizer {
    fn packetize(&mut self, mtu: usize, frame: &[u8]) -> Result<Vec<Vec<u8>>, PacketError> {
        if frame.is_empty() {
            return Ok(vec![]);
        }

        if !self.initialized {
            self.picture_id = NonCryptographicRng::u16() & 0x7FFF;
            self.initialized = true;
        }

        let payloads = if self.flexible_mode {
            self.payload_flexible(mtu, frame)?
        } else {
            self.payload_non_flexible(mtu, frame)?
        };

        self.picture_id += 1;
        self.picture_id &= 0x7FFF;

        Ok(payloads)
    }
}

/// Depacketizes VP9 packets.
///
/// The descriptor fields of the last parsed packet remain readable on the
/// struct after [`Depacketizer::depacketize`] returns.
#[derive(PartialEq, Eq, Debug, Default, Clone)]
pub struct Vp9Depacketizer {
    /// Picture id present.
    pub i: bool,
    /// Inter-picture predicted frame.
    pub p: bool,
    /// Layer indices present.
    pub l: bool,
    /// Flexible mode.
    pub f: bool,
    /// Start of a frame.
    pub b: bool,
    /// End of a frame.
    pub e: bool,
    /// Scalability structure present.
    pub v: bool,
    /// Not a reference frame for upper spatial layers.
    pub z: bool,

    /// 7 or 15 bits picture id.
    pub picture_id: u16,

    /// Temporal layer id.
    pub tid: u8,
    /// Switching up point.
    pub u: bool,
    /// Spatial layer id.
    pub sid: u8,
    /// Inter-layer dependency used.
    pub d: bool,

    /// Reference indices (flexible mode).
    pub pdiff: Vec<u8>,
    /// Temporal layer zero index (non-flexible mode).
    pub tl0picidx: u8,

    /// N_S + 1 is the number of spatial layers in the stream.
    pub ns: u8,
    /// Each spatial layer's resolution present.
    pub y: bool,
    /// Picture group description present.
    pub g: bool,
    /// Number of pictures in the picture group.
    pub ng: u8,
    /// Per-layer widths.
    pub width: Vec<u16>,
    /// Per-layer heights.
    pub height: Vec<u16>,
    /// Temporal layer id per picture group picture.
    pub pgtid: Vec<u8>,
    /// Switching up point per picture group picture.
    pub pgu: Vec<bool>,
    /// Reference indices per picture group picture.
    pub pgpdiff: Vec<Vec<u8>>,
}

impl Depacketizer for Vp9Depacketizer {
    fn depacketize(&mut self, packet: &[u8], out: &mut Vec<u8>) -> Result<(), PacketError> {
        let mut reader = (packet, 0);
        let b = reader.get_u8().ok_or(PacketError::ShortPacket)?;

        self.i = (b & 0x80) != 0;
        self.p = (b & 0x40) != 0;
        self.l = (b & 0x20) != 0;
        self.f = (b & 0x10) != 0;
        self.b = (b & 0x08) != 0;
        self.e = (b & 0x04) != 0;
        self.v = (b & 0x02) != 0;
        self.z = (b & 0x01) != 0;

        let mut payload_index = 1;

        if self.i {
            payload_index = self.parse_picture_id(&mut reader, payload_index)?;
        }

        if self.l {
            payload_index = self.parse_layer_info(&mut reader, payload_index)?;
        }

        if self.f && self.p {
            payload_index = self.parse_ref_indices(&mut reader, payload_index)?;
        }

        if self.v {
            payload_index = self.parse_ssdata(&mut reader, payload_index)?;
        }

        out.extend_from_slice(&packet[payload_index..]);
        Ok(())
    }

    fn is_partition_head(&self, packet: &[u8]) -> bool {
        if packet.is_empty() {
            false
        } else {
            (packet[0] & 0x08) != 0
        }
    }

    fn is_partition_tail(&self, marker: bool, packet: &[u8]) -> bool {
        if packet.is_empty() {
            return marker;
        }
        (packet[0] & 0x04) != 0 || marker
    }
}

impl Vp9Depacketizer {
    // Picture ID:
    //
    //      +-+-+-+-+-+-+-+-+
    // I:   |M| PICTURE ID  |   M:0 => picture id is 7 bits.
    //      +-+-+-+-+-+-+-+-+   M:1 => picture id is 15 bits.
    // M:   | EXTENDED PID  |
    //      +-+-+-+-+-+-+-+-+
    //
    fn parse_picture_id(
        &mut self,
        reader: &mut dyn BitRead,
        mut payload_index: usize,
    ) -> Result<usize, PacketError> {
        let b = reader.get_u8().ok_or(PacketError::ShortPacket)?;
        payload_index += 1;

        if (b & 0x80) != 0 {
            // M == 1, 15 bit picture id
            let ext = reader.get_u8().ok_or(PacketError::ShortPacket)?;
            self.picture_id = (((b & 0x7F) as u16) << 8) | ext as u16;
            payload_index += 1;
        } else {
            self.picture_id = (b & 0x7F) as u16;
        }

        Ok(payload_index)
    }

    fn parse_layer_info(
        &mut self,
        reader: &mut dyn BitRead,
        payload_index: usize,
    ) -> Result<usize, PacketError> {
        let payload_index = self.parse_layer_info_common(reader, payload_index)?;

        if self.f {
            Ok(payload_index)
        } else {
            self.parse_layer_info_non_flexible_mode(reader, payload_index)
        }
    }

    // Layer indices (common):
    //
    //      +-+-+-+-+-+-+-+-+
    // L:   |  T  |U|  S  |D|
    //      +-+-+-+-+-+-+-+-+
    //
    fn parse_layer_info_common(
        &mut self,
        reader: &mut dyn BitRead,
        mut payload_index: usize,
    ) -> Result<usize, PacketError> {
        let b = reader.get_u8().ok_or(PacketError::ShortPacket)?;
        payload_index += 1;

        self.tid = b >> 5;
        self.u = b & 0x10 != 0;
        self.sid = (b >> 1) & 0x7;
        self.d = b & 0x01 != 0;

        if self.sid >= MAX_SPATIAL_LAYERS {
            Err(PacketError::TooManySpatialLayers)
        } else {
            Ok(payload_index)
        }
    }

    // Layer indices (non-flexible mode) append:
    //
    //      +-+-+-+-+-+-+-+-+
    //      |   tl0picidx   |
    //      +-+-+-+-+-+-+-+-+
    //
    fn parse_layer_info_non_flexible_mode(
        &mut self,
        reader: &mut dyn BitRead,
        mut payload_index: usize,
    ) -> Result<usize, PacketError> {
        self.tl0picidx = reader.get_u8().ok_or(PacketError::ShortPacket)?;
        payload_index += 1;
        Ok(payload_index)
    }

    // Reference indices:
    //
    //      +-+-+-+-+-+-+-+-+                P=1,F=1: At least one reference index
    // P,F: | P_DIFF      |N|  up to 3 times          has to be specified.
    //      +-+-+-+-+-+-+-+-+                    N=1: An additional P_DIFF follows
    //                                                current P_DIFF.
    //
    fn parse_ref_indices(
        &mut self,
        reader: &mut dyn BitRead,
        mut payload_index: usize,
    ) -> Result<usize, PacketError> {
        self.pdiff.clear();

        loop {
            let b = reader.get_u8().ok_or(PacketError::ShortPacket)?;
            payload_index += 1;

            self.pdiff.push(b >> 1);
            if b & 0x01 == 0 {
                break;
            }
            if self.pdiff.len() >= MAX_VP9_REF_PICS {
                return Err(PacketError::TooManyReferences);
            }
        }

        Ok(payload_index)
    }

    // Scalability structure (SS):
    //
    //      +-+-+-+-+-+-+-+-+
    // V:   | N_S |Y|G|-|-|-|
    //      +-+-+-+-+-+-+-+-+              -|
    // Y:   |     WIDTH     | (OPTIONAL)    .
    //      +               +               .
    //      |               | (OPTIONAL)    .
    //      +-+-+-+-+-+-+-+-+               . N_S + 1 times
    //      |     HEIGHT    | (OPTIONAL)    .
    //      +               +               .
    //      |               | (OPTIONAL)    .
    //      +-+-+-+-+-+-+-+-+              -|
    // G:   |      N_G      | (OPTIONAL)
    //      +-+-+-+-+-+-+-+-+                           -|
    // N_G: |  T  |U| R |-|-| (OPTIONAL)                 .
    //      +-+-+-+-+-+-+-+-+              -|            . N_G times
    //      |    P_DIFF     | (OPTIONAL)    . R times    .
    //      +-+-+-+-+-+-+-+-+              -|           -|
    //
    fn parse_ssdata(
        &mut self,
        reader: &mut dyn BitRead,
        mut payload_index: usize,
    ) -> Result<usize, PacketError> {
        let b = reader.get_u8().ok_or(PacketError::ShortPacket)?;
        payload_index += 1;

        self.ns = b >> 5;
        self.y = b & 0x10 != 0;
        self.g = b & 0x08 != 0;

        let ns = (self.ns + 1) as usize;
        self.ng = 0;

        if self.y {
            self.width = Vec::with_capacity(ns);
            self.height = Vec::with_capacity(ns);
            for _ in 0..ns {
                self.width
                    .push(reader.get_u16().ok_or(PacketError::ShortPacket)?);
                self.height
                    .push(reader.get_u16().ok_or(PacketError::ShortPacket)?);
            }
            payload_index += 4 * ns;
        }

        if self.g {
            self.ng = reader.get_u8().ok_or(PacketError::ShortPacket)?;
            payload_index += 1;
        }

        self.pgtid.clear();
        self.pgu.clear();
        self.pgpdiff.clear();

        for i in 0..self.ng as usize {
            let b = reader.get_u8().ok_or(PacketError::ShortPacket)?;
            payload_index += 1;

            self.pgtid.push(b >> 5);
            self.pgu.push(b & 0x10 != 0);

            let r = ((b >> 2) & 0x3) as usize;
            self.pgpdiff.push(vec![]);
            for _ in 0..r {
                let b = reader.get_u8().ok_or(PacketError::ShortPacket)?;
                payload_index += 1;
                self.pgpdiff[i].push(b);
            }
        }

        Ok(payload_index)
    }
}

/// The fields of the VP9 uncompressed frame header prefix that matter for
/// packetization.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct Vp9FrameHeader {
    pub profile: u8,
    pub show_existing_frame: bool,
    pub frame_to_show_map_idx: u8,
    pub non_key_frame: bool,
    pub show_frame: bool,
    pub error_resilient_mode: bool,
    pub width: u16,
    pub height: u16,
}

impl Vp9FrameHeader {
    fn is_key_frame(&self) -> bool {
        !self.show_existing_frame && !self.non_key_frame
    }

    /// Parse the uncompressed header prefix. Returns `None` for anything
    /// that is not a well-formed VP9 frame start.
    pub fn parse(buf: &[u8]) -> Option<Vp9FrameHeader> {
        let mut r = FrameBitReader::new(buf);
        let mut header = Vp9FrameHeader::default();

        let frame_marker = r.read_bits(2)?;
        if frame_marker != 2 {
            return None;
        }

        let profile_low = r.read_bits(1)? as u8;
        let profile_high = r.read_bits(1)? as u8;
        header.profile = (profile_high << 1) + profile_low;

        if header.profile == 3 {
            // reserved zero bit
            r.read_bits(1)?;
        }

        header.show_existing_frame = r.read_flag()?;
        if header.show_existing_frame {
            header.frame_to_show_map_idx = r.read_bits(3)? as u8;
            return Some(header);
        }

        header.non_key_frame = r.read_flag()?;
        header.show_frame = r.read_flag()?;
        header.error_resilient_mode = r.read_flag()?;

        if !header.non_key_frame {
            let sync = [
                r.read_bits(8)? as u8,
                r.read_bits(8)? as u8,
                r.read_bits(8)? as u8,
            ];
            if sync != [0x49, 0x83, 0x42] {
                return None;
            }

            header.parse_color_config(&mut r)?;

            header.width = r.read_bits(16)? as u16 + 1;
            header.height = r.read_bits(16)? as u16 + 1;
        }

        Some(header)
    }

    fn parse_color_config(&mut self, r: &mut FrameBitReader) -> Option<()> {
        if self.profile >= 2 {
            // ten_or_twelve_bit
            r.read_flag()?;
        }

        let color_space = r.read_bits(3)?;

        if color_space != 7 {
            // color_range
            r.read_flag()?;
            if self.profile == 1 || self.profile == 3 {
                // subsampling_x, subsampling_y, reserved
                r.read_bits(3)?;
            }
        } else if self.profile == 1 || self.profile == 3 {
            // reserved
            r.read_bits(1)?;
        }

        Some(())
    }
}

/// Big-endian bit cursor over the frame header prefix.
struct FrameBitReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FrameBitReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        FrameBitReader { buf, pos: 0 }
    }

    fn read_flag(&mut self) -> Option<bool> {
        Some(self.read_bits(1)? == 1)
    }

    fn read_bits(&mut self, n: usize) -> Option<u64> {
        if self.pos + n > self.buf.len() * 8 {
            return None;
        }

        let mut bits = 0u64;
        for _ in 0..n {
            let byte = self.buf[self.pos >> 3];
            let bit = (byte >> (7 - (self.pos & 0x7))) & 0x1;
            bits = (bits << 1) | bit as u64;
            self.pos += 1;
        }

        Some(bits)
    }
}
