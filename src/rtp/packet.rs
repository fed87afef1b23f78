use super::{Header, RtpError};

/// A complete RTP packet: header, payload and optional trailing padding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    /// The transport header.
    pub header: Header,
    /// The payload bytes, excluding padding.
    pub payload: Vec<u8>,
    /// Number of trailing padding octets, including the count octet itself.
    /// Only meaningful when `header.padding` is set.
    pub padding_size: u8,
}

impl Packet {
    /// Parse a serialized packet.
    ///
    /// When the padding flag is set, the last octet names the number of
    /// padding octets (including itself) and must be in
    /// `1..=len - header_size`; those octets are stripped from the payload.
    pub fn parse(buf: &[u8]) -> Result<Packet, RtpError> {
        let (header, header_len) = Header::parse(buf)?;

        let mut end = buf.len();
        let padding_size = if header.padding {
            if end <= header_len {
                return Err(RtpError::ShortBuffer);
            }
            let pad = buf[end - 1];
            if pad == 0 {
                return Err(RtpError::InvalidPadding);
            }
            if (pad as usize) > end - header_len {
                return Err(RtpError::ShortBuffer);
            }
            end -= pad as usize;
            pad
        } else {
            0
        };

        Ok(Packet {
            header,
            payload: buf[header_len..end].to_vec(),
            padding_size,
        })
    }

    /// Number of octets [`Packet::marshal`] produces.
    pub fn marshal_size(&self) -> usize {
        self.header.marshal_size() + self.payload.len() + self.padding_size as usize
    }

    /// Serialize the packet.
    ///
    /// When the padding flag is set a non-zero `padding_size` must be
    /// present; the last written octet carries the padding count.
    pub fn marshal(&self) -> Result<Vec<u8>, RtpError> {
        if self.header.padding && self.padding_size == 0 {
            return Err(RtpError::InvalidPadding);
        }

        let mut buf = self.header.marshal()?;
        buf.extend_from_slice(&self.payload);

        if self.header.padding {
            buf.resize(buf.len() + self.padding_size as usize, 0);
            let last = buf.len() - 1;
            buf[last] = self.padding_size;
        }

        Ok(buf)
    }
}
