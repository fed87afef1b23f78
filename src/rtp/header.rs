#![allow(clippy::unusual_byte_groupings)]

use super::{Pt, RtpError, Ssrc};

/// Extension profile for the RFC 8285 one-byte form.
pub const EXTENSION_PROFILE_ONE_BYTE: u16 = 0xBEDE;
/// Extension profile for the RFC 8285 two-byte form.
pub const EXTENSION_PROFILE_TWO_BYTE: u16 = 0x1000;

const EXTENSION_ID_RESERVED: u8 = 0xF;
const FIXED_HEADER_LEN: usize = 12;
const CSRC_LEN: usize = 4;

/// A single RTP header extension: an id paired with its payload bytes.
///
/// In the one-byte profile the id is 1..=14 and the payload 1..=16 octets.
/// In the two-byte profile the id is >= 1 and the payload up to 255 octets.
/// For any other profile a single extension with id 0 carries the raw
/// extension region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
    /// Extension identifier.
    pub id: u8,
    /// Extension payload bytes.
    pub payload: Vec<u8>,
}

/// Parsed RTP packet header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Protocol version, always 2.
    pub version: u8,
    /// Whether the packet carries trailing padding.
    pub padding: bool,
    /// Whether a header extension block follows the CSRC list.
    pub extension: bool,
    /// For video, signifies the last packet of a frame. For audio, the
    /// start of a talkspurt.
    pub marker: bool,
    /// Type of payload being carried.
    pub payload_type: Pt,
    /// Sequence number increasing by 1 for each packet.
    pub sequence_number: u16,
    /// Timestamp in media time. The time base depends on the codec.
    pub timestamp: u32,
    /// Sender source identifier.
    pub ssrc: Ssrc,
    /// Contributing sources, at most 15.
    pub csrc: Vec<u32>,
    /// Extension profile, meaningful when `extension` is set.
    pub extension_profile: u16,
    /// Ordered list of header extensions. Order is preserved across
    /// parse/serialize/set/delete.
    pub extensions: Vec<Extension>,
}

impl Default for Header {
    fn default() -> Self {
        Header {
            version: 2,
            padding: false,
            extension: false,
            marker: false,
            payload_type: 0.into(),
            sequence_number: 0,
            timestamp: 0,
            ssrc: 0.into(),
            csrc: vec![],
            extension_profile: 0,
            extensions: vec![],
        }
    }
}

impl Header {
    /// Parse a header from the start of `buf`.
    ///
    /// Returns the header and the number of octets consumed.
    pub fn parse(buf: &[u8]) -> Result<(Header, usize), RtpError> {
        if buf.len() < FIXED_HEADER_LEN {
            trace!("RTP header too short < 12: {}", buf.len());
            return Err(RtpError::ShortBuffer);
        }

        let version = (buf[0] & 0b1100_0000) >> 6;
        let padding = buf[0] & 0b0010_0000 > 0;
        let extension = buf[0] & 0b0001_0000 > 0;
        let csrc_count = (buf[0] & 0b0000_1111) as usize;

        let marker = buf[1] & 0b1000_0000 > 0;
        let payload_type = (buf[1] & 0b0111_1111).into();

        let sequence_number = u16::from_be_bytes([buf[2], buf[3]]);
        let timestamp = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let ssrc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);

        let mut n = FIXED_HEADER_LEN + csrc_count * CSRC_LEN;
        if buf.len() < n {
            trace!("RTP header not enough csrc");
            return Err(RtpError::ShortBuffer);
        }

        let mut csrc = Vec::with_capacity(csrc_count);
        for i in 0..csrc_count {
            let o = FIXED_HEADER_LEN + i * CSRC_LEN;
            csrc.push(u32::from_be_bytes([
                buf[o],
                buf[o + 1],
                buf[o + 2],
                buf[o + 3],
            ]));
        }

        let mut extension_profile = 0;
        let mut extensions = vec![];

        if extension {
            if buf.len() < n + 4 {
                trace!("RTP header extension block truncated");
                return Err(RtpError::ShortBuffer);
            }

            extension_profile = u16::from_be_bytes([buf[n], buf[n + 1]]);
            let ext_words = u16::from_be_bytes([buf[n + 2], buf[n + 3]]) as usize;
            n += 4;

            let extension_end = n + ext_words * 4;
            if buf.len() < extension_end {
                trace!("RTP extension region overflows buffer");
                return Err(RtpError::ShortBuffer);
            }

            match extension_profile {
                EXTENSION_PROFILE_ONE_BYTE => {
                    while n < extension_end {
                        if buf[n] == 0x00 {
                            // padding inside the extension region
                            n += 1;
                            continue;
                        }

                        let id = buf[n] >> 4;
                        let len = ((buf[n] & 0x0F) + 1) as usize;
                        n += 1;

                        if id == EXTENSION_ID_RESERVED {
                            break;
                        }

                        if n + len > extension_end {
                            return Err(RtpError::MalformedExtension);
                        }

                        extensions.push(Extension {
                            id,
                            payload: buf[n..n + len].to_vec(),
                        });
                        n += len;
                    }
                }
                EXTENSION_PROFILE_TWO_BYTE => {
                    while n < extension_end {
                        if buf[n] == 0x00 {
                            n += 1;
                            continue;
                        }

                        let id = buf[n];
                        n += 1;

                        if n >= extension_end {
                            return Err(RtpError::MalformedExtension);
                        }

                        let len = buf[n] as usize;
                        n += 1;

                        if n + len > extension_end {
                            return Err(RtpError::MalformedExtension);
                        }

                        extensions.push(Extension {
                            id,
                            payload: buf[n..n + len].to_vec(),
                        });
                        n += len;
                    }
                }
                _ => {
                    // RFC 3550 style: one opaque extension with id 0.
                    extensions.push(Extension {
                        id: 0,
                        payload: buf[n..extension_end].to_vec(),
                    });
                }
            }

            n = extension_end;
        }

        let header = Header {
            version,
            padding,
            extension,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc: ssrc.into(),
            csrc,
            extension_profile,
            extensions,
        };

        Ok((header, n))
    }

    /// Number of octets [`Header::marshal`] produces.
    ///
    /// Always `12 + 4 * |CSRC| + extension block`, where the extension block
    /// is zero when the extension flag is unset and otherwise rounded up to
    /// a multiple of four octets.
    pub fn marshal_size(&self) -> usize {
        let mut size = FIXED_HEADER_LEN + self.csrc.len() * CSRC_LEN;

        if self.extension {
            let mut ext_size = 4;

            match self.extension_profile {
                EXTENSION_PROFILE_ONE_BYTE => {
                    for ext in &self.extensions {
                        ext_size += 1 + ext.payload.len();
                    }
                }
                EXTENSION_PROFILE_TWO_BYTE => {
                    for ext in &self.extensions {
                        ext_size += 2 + ext.payload.len();
                    }
                }
                _ => {
                    if let Some(ext) = self.extensions.first() {
                        ext_size += ext.payload.len();
                    }
                }
            }

            // round up to a multiple of 4 octets
            size += (ext_size + 3) / 4 * 4;
        }

        size
    }

    /// Serialize the header.
    ///
    /// Extension invariants are checked before any output is produced;
    /// violations fail with [`RtpError::InvalidExtension`].
    pub fn marshal(&self) -> Result<Vec<u8>, RtpError> {
        self.check_extensions()?;

        let mut buf = Vec::with_capacity(self.marshal_size());

        buf.push(
            (self.version << 6)
                | if self.padding { 1 << 5 } else { 0 }
                | if self.extension { 1 << 4 } else { 0 }
                | (self.csrc.len() as u8 & 0b0000_1111),
        );
        buf.push(*self.payload_type & 0b0111_1111 | if self.marker { 1 << 7 } else { 0 });
        buf.extend_from_slice(&self.sequence_number.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&self.ssrc.to_be_bytes());

        for csrc in &self.csrc {
            buf.extend_from_slice(&csrc.to_be_bytes());
        }

        if self.extension {
            buf.extend_from_slice(&self.extension_profile.to_be_bytes());

            let length_pos = buf.len();
            buf.extend_from_slice(&[0, 0]);

            let start = buf.len();

            match self.extension_profile {
                EXTENSION_PROFILE_ONE_BYTE => {
                    for ext in &self.extensions {
                        buf.push((ext.id << 4) | (ext.payload.len() as u8 - 1) & 0x0F);
                        buf.extend_from_slice(&ext.payload);
                    }
                }
                EXTENSION_PROFILE_TWO_BYTE => {
                    for ext in &self.extensions {
                        buf.push(ext.id);
                        buf.push(ext.payload.len() as u8);
                        buf.extend_from_slice(&ext.payload);
                    }
                }
                _ => {
                    if let Some(ext) = self.extensions.first() {
                        buf.extend_from_slice(&ext.payload);
                    }
                }
            }

            let ext_size = buf.len() - start;
            let rounded = (ext_size + 3) / 4 * 4;
            buf.resize(start + rounded, 0);

            let words = (rounded / 4) as u16;
            buf[length_pos..length_pos + 2].copy_from_slice(&words.to_be_bytes());
        }

        Ok(buf)
    }

    fn check_extensions(&self) -> Result<(), RtpError> {
        if !self.extension {
            return Ok(());
        }

        match self.extension_profile {
            EXTENSION_PROFILE_ONE_BYTE => {
                for ext in &self.extensions {
                    if ext.id < 1 || ext.id > 14 {
                        return Err(RtpError::InvalidExtension);
                    }
                    if ext.payload.is_empty() || ext.payload.len() > 16 {
                        return Err(RtpError::InvalidExtension);
                    }
                }
            }
            EXTENSION_PROFILE_TWO_BYTE => {
                for ext in &self.extensions {
                    if ext.id < 1 {
                        return Err(RtpError::InvalidExtension);
                    }
                    if ext.payload.len() > 255 {
                        return Err(RtpError::InvalidExtension);
                    }
                }
            }
            _ => {
                if let Some(ext) = self.extensions.first() {
                    if ext.payload.len() % 4 != 0 {
                        return Err(RtpError::InvalidExtension);
                    }
                }
            }
        }

        Ok(())
    }

    /// Set an extension, replacing any existing extension with the same id
    /// in place.
    ///
    /// On a header with no prior extensions this selects the one-byte
    /// profile when the payload is at most 16 octets, else the two-byte
    /// profile when shorter than 256 octets, and raises the extension flag.
    pub fn set_extension(&mut self, id: u8, payload: Vec<u8>) -> Result<(), RtpError> {
        if self.extension {
            match self.extension_profile {
                EXTENSION_PROFILE_ONE_BYTE => {
                    if !(1..=14).contains(&id) {
                        return Err(RtpError::InvalidExtension);
                    }
                    if payload.len() > 16 {
                        return Err(RtpError::InvalidExtension);
                    }
                }
                EXTENSION_PROFILE_TWO_BYTE => {
                    if id < 1 {
                        return Err(RtpError::InvalidExtension);
                    }
                    if payload.len() > 255 {
                        return Err(RtpError::InvalidExtension);
                    }
                }
                _ => {
                    if id != 0 {
                        return Err(RtpError::InvalidExtension);
                    }
                }
            }

            // Replacing keeps the insertion position.
            for ext in &mut self.extensions {
                if ext.id == id {
                    ext.payload = payload;
                    return Ok(());
                }
            }

            self.extensions.push(Extension { id, payload });
            return Ok(());
        }

        self.extension = true;

        self.extension_profile = if payload.len() <= 16 {
            EXTENSION_PROFILE_ONE_BYTE
        } else if payload.len() < 256 {
            EXTENSION_PROFILE_TWO_BYTE
        } else {
            self.extension_profile
        };

        self.extensions.push(Extension { id, payload });
        Ok(())
    }

    /// Get the payload of the extension with the given id.
    pub fn get_extension(&self, id: u8) -> Option<&[u8]> {
        if !self.extension {
            return None;
        }
        self.extensions
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.payload.as_slice())
    }

    /// All extension ids in stored order.
    pub fn extension_ids(&self) -> Vec<u8> {
        if !self.extension {
            return vec![];
        }
        self.extensions.iter().map(|e| e.id).collect()
    }

    /// Remove the extension with the given id.
    ///
    /// Returns `false` without mutating when the id is absent.
    pub fn delete_extension(&mut self, id: u8) -> bool {
        if !self.extension {
            return false;
        }
        let before = self.extensions.len();
        self.extensions.retain(|e| e.id != id);
        self.extensions.len() != before
    }
}
