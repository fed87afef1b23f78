use super::{BitRead, Depacketizer, PacketError, Packetizer};

pub const VP8_HEADER_SIZE: usize = 1;

/// Packetizes VP8 frames.
///
/// Fragments a frame by repeatedly taking up to `mtu - header_size` octets.
/// The first fragment carries the S bit. With the picture id enabled the
/// descriptor grows to 3 or 4 octets depending on whether the current id
/// fits in 7 bits.
#[derive(Default, Debug, Copy, Clone)]
pub struct Vp8Packetizer {
    pub(crate) enable_picture_id: bool,
    pub(crate) picture_id: u16,
}

impl Vp8Packetizer {
    /// Write picture ids into the payload descriptor.
    pub fn enable_picture_id(&mut self, enable: bool) {
        self.enable_picture_id = enable;
    }
}

impl Packetizer for Vp8Packetizer {
    fn packetize(&mut self, mtu: usize, frame: &[u8]) -> Result<Vec<Vec<u8>>, PacketError> {
        if frame.is_empty() {
            return Ok(vec![]);
        }

        /*
         * https://tools.ietf.org/html/rfc7741#section-4.2
         *
         *       0 1 2 3 4 5 6 7
         *      +-+-+-+-+-+-+-+-+
         *      |X|R|N|S|R| PID | (REQUIRED)
         *      +-+-+-+-+-+-+-+-+
         * X:   |I|L|T|K| RSV   | (OPTIONAL)
         *      +-+-+-+-+-+-+-+-+
         * I:   |M| PictureID   | (OPTIONAL)
         *      +-+-+-+-+-+-+-+-+
         * L:   |   tl0picidx   | (OPTIONAL)
         *      +-+-+-+-+-+-+-+-+
         * T/K: |tid|Y| KEYIDX  | (OPTIONAL)
         *      +-+-+-+-+-+-+-+-+
         *
         *  S: Start of VP8 partition. Set on the first packet of each frame.
         */
        let using_header_size = if self.enable_picture_id {
            if self.picture_id < 128 {
                VP8_HEADER_SIZE + 2
            } else {
                VP8_HEADER_SIZE + 3
            }
        } else {
            VP8_HEADER_SIZE
        };

        let max_fragment_size = mtu as isize - using_header_size as isize;
        if max_fragment_size <= 0 {
            return Err(PacketError::FrameTooLarge);
        }
        let max_fragment_size = max_fragment_size as usize;

        let mut payloads = vec![];
        let mut remaining = frame.len();
        let mut index = 0;
        let mut first = true;

        while remaining > 0 {
            let fragment_size = max_fragment_size.min(remaining);
            let mut out = Vec::with_capacity(using_header_size + fragment_size);

            let mut buf = [0u8; 4];
            if first {
                buf[0] = 0x10;
                first = false;
            }

            if self.enable_picture_id {
                if using_header_size == VP8_HEADER_SIZE + 2 {
                    buf[0] |= 0x80;
                    buf[1] |= 0x80;
                    buf[2] |= (self.picture_id & 0x7F) as u8;
                } else {
                    buf[0] |= 0x80;
                    buf[1] |= 0x80;
                    buf[2] |= 0x80 | ((self.picture_id >> 8) & 0x7F) as u8;
                    buf[3] |= (self.picture_id & 0xFF) as u8;
                }
            }

            out.extend_from_slice(&buf[..using_header_size]);
            out.extend_from_slice(&frame[index..index + fragment_size]);
            payloads.push(out);

            remaining -= fragment_size;
            index += fragment_size;
        }

        self.picture_id += 1;
        self.picture_id &= 0x7FFF;

        Ok(payloads)
    }
}

/// Depacketizes VP8 packets.
///
/// The descriptor fields of the last parsed packet remain readable on the
/// struct after [`Depacketizer::depacketize`] returns.
#[derive(PartialEq, Eq, Debug, Default, Clone)]
pub struct Vp8Depacketizer {
    /// Extended control bits present.
    pub x: u8,
    /// When set the frame can be discarded without decoding problems.
    pub n: u8,
    /// Start of VP8 partition.
    pub s: u8,
    /// Partition index.
    pub pid: u8,

    /// 1 if PictureID is present.
    pub i: u8,
    /// 1 if tl0picidx is present.
    pub l: u8,
    /// 1 if tid is present.
    pub t: u8,
    /// 1 if KEYIDX is present.
    pub k: u8,

    /// 7 or 15 bits picture id.
    pub picture_id: u16,
    /// Temporal level zero index.
    pub tl0_pic_idx: u8,
    /// Temporal layer index.
    pub tid: u8,
    /// Layer sync bit.
    pub y: u8,
    /// Temporal key frame index.
    pub key_idx: u8,
}

impl Depacketizer for Vp8Depacketizer {
    fn depacketize(&mut self, packet: &[u8], out: &mut Vec<u8>) -> Result<(), PacketError> {
        let payload_len = packet.len();
        let mut reader = (packet, 0);
        let mut payload_index = 0;

        let mut b = reader.get_u8().ok_or(PacketError::ShortPacket)?;
        payload_index += 1;

        self.x = (b & 0x80) >> 7;
        self.n = (b & 0x20) >> 5;
        self.s = (b & 0x10) >> 4;
        self.pid = b & 0x07;

        if self.x == 1 {
            b = reader.get_u8().ok_or(PacketError::ShortPacket)?;
            payload_index += 1;
            self.i = (b & 0x80) >> 7;
            self.l = (b & 0x40) >> 6;
            self.t = (b & 0x20) >> 5;
            self.k = (b & 0x10) >> 4;
        } else {
            self.i = 0;
            self.l = 0;
            self.t = 0;
            self.k = 0;
        }

        if self.i == 1 {
            b = reader.get_u8().ok_or(PacketError::ShortPacket)?;
            payload_index += 1;
            if b & 0x80 > 0 {
                // M == 1, PictureID is 15 bits
                let ext = reader.get_u8().ok_or(PacketError::ShortPacket)?;
                self.picture_id = (((b & 0x7F) as u16) << 8) | ext as u16;
                payload_index += 1;
            } else {
                self.picture_id = b as u16;
            }
        }

        if payload_index >= payload_len {
            return Err(PacketError::ShortPacket);
        }

        if self.l == 1 {
            self.tl0_pic_idx = reader.get_u8().ok_or(PacketError::ShortPacket)?;
            payload_index += 1;
        }

        if payload_index >= payload_len {
            return Err(PacketError::ShortPacket);
        }

        if self.t == 1 || self.k == 1 {
            let b = reader.get_u8().ok_or(PacketError::ShortPacket)?;
            if self.t == 1 {
                self.tid = b >> 6;
                self.y = (b >> 5) & 0x1;
            }
            if self.k == 1 {
                self.key_idx = b & 0x1F;
            }
            payload_index += 1;
        }

        if payload_index >= payload_len {
            return Err(PacketError::ShortPacket);
        }

        out.extend_from_slice(&packet[payload_index..]);
        Ok(())
    }

    fn is_partition_head(&self, packet: &[u8]) -> bool {
        if packet.is_empty() {
            false
        } else {
            (packet[0] & 0x10) != 0
        }
    }

    fn is_partition_tail(&self, marker: bool, _packet: &[u8]) -> bool {
        marker
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_vp8_unmarshal() -> Result<(), PacketError> {
        let mut pck = Vp8Depacketizer::default();

        // Empty packet
        let mut payload = Vec::new();
        let result = pck.depacketize(&[], &mut payload);
        assert!(result.is_err(), "result should be err on empty packet");

        // Small payload with single octet header
        let small_bytes = &[0x00, 0x11, 0x22];
        let mut payload = Vec::new();
        pck.depacketize(small_bytes, &mut payload)?;
        assert_eq!(payload, [0x11, 0x22]);

        // Payload is header only
        let mut payload = Vec::new();
        let result = pck.depacketize(&[0x00], &mut payload);
        assert!(result.is_err(), "descriptor-only packet has no payload");

        // Header size, only X
        let raw_bytes = &[0x80, 0x00, 0x00, 0x00];
        let mut payload = Vec::new();
        pck.depacketize(raw_bytes, &mut payload)?;
        assert!(!payload.is_empty());
        assert_eq!(pck.x, 1, "X must be 1");
        assert_eq!(pck.i, 0, "I must be 0");
        assert_eq!(pck.l, 0, "L must be 0");
        assert_eq!(pck.t, 0, "T must be 0");
        assert_eq!(pck.k, 0, "K must be 0");

        // Header size, X and I, PictureID 15 bits
        let raw_bytes = &[0x80, 0x80, 0x81, 0x00, 0x00];
        let mut payload = Vec::new();
        pck.depacketize(raw_bytes, &mut payload)?;
        assert!(!payload.is_empty());
        assert_eq!(pck.x, 1, "X must be 1");
        assert_eq!(pck.i, 1, "I must be 1");
        assert_eq!(pck.picture_id, 0x0100);

        // Header size, X and L
        let raw_bytes = &[0x80, 0x40, 0x00, 0x00];
        let mut payload = Vec::new();
        pck.depacketize(raw_bytes, &mut payload)?;
        assert_eq!(pck.l, 1, "L must be 1");

        // Header size, X and T
        let raw_bytes = &[0x80, 0x20, 0x00, 0x00];
        let mut payload = Vec::new();
        pck.depacketize(raw_bytes, &mut payload)?;
        assert_eq!(pck.t, 1, "T must be 1");

        // Header size, X and K
        let raw_bytes = &[0x80, 0x10, 0x00, 0x00];
        let mut payload = Vec::new();
        pck.depacketize(raw_bytes, &mut payload)?;
        assert_eq!(pck.k, 1, "K must be 1");

        // Header size, all flags and 8 bit picture_id
        let raw_bytes = &[0xFF, 0xFF, 0x00, 0x00, 0x00, 0x00];
        let mut payload = Vec::new();
        pck.depacketize(raw_bytes, &mut payload)?;
        assert!(!payload.is_empty());

        // Header size, all flags and 16 bit picture_id
        let raw_bytes = &[0xFF, 0xFF, 0x80, 0x00, 0x00, 0x00, 0x00];
        let mut payload = Vec::new();
        pck.depacketize(raw_bytes, &mut payload)?;
        assert!(!payload.is_empty());

        Ok(())
    }

    #[test]
    fn test_vp8_payload() -> Result<(), PacketError> {
        let tests: Vec<(&str, Vp8Packetizer, usize, Vec<&[u8]>, Vec<Vec<&[u8]>>)> = vec![
            (
                "WithoutPictureID",
                Vp8Packetizer::default(),
                2,
                vec![&[0x90, 0x90, 0x90], &[0x91, 0x91]],
                vec![
                    vec![&[0x10, 0x90], &[0x00, 0x90], &[0x00, 0x90]],
                    vec![&[0x10, 0x91], &[0x00, 0x91]],
                ],
            ),
            (
                "WithPictureID_1byte",
                Vp8Packetizer {
                    enable_picture_id: true,
                    picture_id: 0x20,
                },
                5,
                vec![&[0x90, 0x90, 0x90], &[0x91, 0x91]],
                vec![
                    vec![&[0x90, 0x80, 0x20, 0x90, 0x90], &[0x80, 0x80, 0x20, 0x90]],
                    vec![&[0x90, 0x80, 0x21, 0x91, 0x91]],
                ],
            ),
            (
                "WithPictureID_2bytes",
                Vp8Packetizer {
                    enable_picture_id: true,
                    picture_id: 0x120,
                },
                6,
                vec![&[0x90, 0x90, 0x90], &[0x91, 0x91]],
                vec![
                    vec![
                        &[0x90, 0x80, 0x81, 0x20, 0x90, 0x90],
                        &[0x80, 0x80, 0x81, 0x20, 0x90],
                    ],
                    vec![&[0x90, 0x80, 0x81, 0x21, 0x91, 0x91]],
                ],
            ),
        ];

        for (name, mut pck, mtu, frames, expected) in tests {
            for (i, frame) in frames.iter().enumerate() {
                let actual = pck.packetize(mtu, frame)?;
                assert_eq!(expected[i], actual, "{name}: generated packet[{i}] differs");
            }
        }

        Ok(())
    }

    #[test]
    fn test_vp8_payload_too_small_mtu() {
        let mut pck = Vp8Packetizer::default();
        let frame = &[0x90, 0x90, 0x90];

        // empty frame: no packets, no error
        let result = pck.packetize(1, &[]).unwrap();
        assert!(result.is_empty());

        // descriptor consumes the whole MTU
        let result = pck.packetize(1, frame);
        assert_eq!(result, Err(PacketError::FrameTooLarge));

        // one octet of room per packet
        let result = pck.packetize(2, frame).unwrap();
        assert_eq!(result.len(), frame.len());
    }

    #[test]
    fn test_vp8_picture_id_wraps() -> Result<(), PacketError> {
        let mut pck = Vp8Packetizer {
            enable_picture_id: true,
            picture_id: 0x7FFF,
        };

        pck.packetize(100, &[0x90])?;
        assert_eq!(pck.picture_id, 0, "picture id wraps modulo 2^15");
        Ok(())
    }

    #[test]
    fn test_vp8_partition_head() {
        let vp8 = Vp8Depacketizer::default();

        assert!(!vp8.is_partition_head(&[]));
        assert!(
            vp8.is_partition_head(&[0x10, 0x00, 0x00, 0x00]),
            "S flag should make this a partition head"
        );
        assert!(!vp8.is_partition_head(&[0x00, 0x00, 0x00, 0x00]));
    }
}
