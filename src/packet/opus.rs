use super::{Depacketizer, PacketError, Packetizer};

/// Packetizes Opus frames.
///
/// Every frame becomes exactly one packet, byte for byte. Opus frames are
/// self-delimited and are never fragmented; the facade rejects frames whose
/// serialized transport packet exceeds the MTU.
#[derive(Debug, Default, Copy, Clone)]
pub struct OpusPacketizer;

impl Packetizer for OpusPacketizer {
    fn packetize(&mut self, _mtu: usize, frame: &[u8]) -> Result<Vec<Vec<u8>>, PacketError> {
        if frame.is_empty() {
            return Ok(vec![]);
        }

        Ok(vec![frame.to_vec()])
    }
}

/// Depacketizes Opus packets.
#[derive(PartialEq, Eq, Debug, Default, Clone)]
pub struct OpusDepacketizer;

impl Depacketizer for OpusDepacketizer {
    fn depacketize(&mut self, packet: &[u8], out: &mut Vec<u8>) -> Result<(), PacketError> {
        if packet.is_empty() {
            return Err(PacketError::ShortPacket);
        }

        out.extend_from_slice(packet);
        Ok(())
    }

    fn is_partition_head(&self, _packet: &[u8]) -> bool {
        true
    }

    fn is_partition_tail(&self, marker: bool, _packet: &[u8]) -> bool {
        marker
    }
}
