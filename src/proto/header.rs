//! The fixed message envelope.

use crc32c::crc32c;

use super::{FrameError, MessageKind};

/// "CCEE"
pub const MAGIC: u32 = 0x4343_4545;
pub const HEADER_LEN: usize = 32;
/// Hard cap on a single payload. Anything larger is a framing error and the
/// payload bytes are never read off the transport.
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// Checksum covers everything before the checksum field itself.
const CHECKSUM_OFFSET: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: MessageKind,
    pub flags: u16,
    pub payload_len: u32,
    pub correlation_id: u32,
    pub timestamp_ms: u64,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        buf[4..6].copy_from_slice(&(self.kind as u16).to_be_bytes());
        buf[6..8].copy_from_slice(&self.flags.to_be_bytes());
        buf[8..12].copy_from_slice(&self.payload_len.to_be_bytes());
        buf[12..16].copy_from_slice(&self.correlation_id.to_be_bytes());
        buf[16..24].copy_from_slice(&self.timestamp_ms.to_be_bytes());
        let checksum = crc32c(&buf[..CHECKSUM_OFFSET]);
        buf[24..28].copy_from_slice(&checksum.to_be_bytes());
        // Bytes 28..32 are reserved and encoded as zero.
        buf
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self, FrameError> {
        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != MAGIC {
            return Err(FrameError::BadMagic { got: magic });
        }

        let expected = u32::from_be_bytes([buf[24], buf[25], buf[26], buf[27]]);
        let got = crc32c(&buf[..CHECKSUM_OFFSET]);
        if expected != got {
            return Err(FrameError::BadChecksum { expected, got });
        }

        let raw_kind = u16::from_be_bytes([buf[4], buf[5]]);
        let kind = MessageKind::from_u16(raw_kind).ok_or(FrameError::UnknownKind(raw_kind))?;

        let payload_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        if payload_len as usize > MAX_PAYLOAD_LEN {
            return Err(FrameError::TooLarge {
                max: MAX_PAYLOAD_LEN,
                got: payload_len as usize,
            });
        }

        Ok(Self {
            kind,
            flags: u16::from_be_bytes([buf[6], buf[7]]),
            payload_len,
            correlation_id: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
            timestamp_ms: u64::from_be_bytes([
                buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
            ]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FrameHeader {
        FrameHeader {
            kind: MessageKind::CompileRequest,
            flags: 0x0004,
            payload_len: 1344,
            correlation_id: 0xdead_beef,
            timestamp_ms: 1_700_000_000_123,
        }
    }

    #[test]
    fn round_trip() {
        let header = sample();
        let bytes = header.encode();
        assert_eq!(FrameHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn fields_are_big_endian() {
        let bytes = sample().encode();
        assert_eq!(&bytes[0..4], &[0x43, 0x43, 0x45, 0x45]);
        assert_eq!(&bytes[4..6], &[0x00, 0x05]);
        assert_eq!(&bytes[12..16], &[0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = sample().encode();
        bytes[0] = 0x00;
        assert!(matches!(
            FrameHeader::decode(&bytes),
            Err(FrameError::BadMagic { .. })
        ));
    }

    #[test]
    fn rejects_corrupted_checksum() {
        let mut bytes = sample().encode();
        bytes[6] ^= 0xff;
        assert!(matches!(
            FrameHeader::decode(&bytes),
            Err(FrameError::BadChecksum { .. })
        ));
    }

    #[test]
    fn rejects_unknown_kind() {
        let mut bytes = sample().encode();
        bytes[4..6].copy_from_slice(&99u16.to_be_bytes());
        let checksum = crc32c::crc32c(&bytes[..24]);
        bytes[24..28].copy_from_slice(&checksum.to_be_bytes());
        assert!(matches!(
            FrameHeader::decode(&bytes),
            Err(FrameError::UnknownKind(99))
        ));
    }

    #[test]
    fn rejects_payload_over_cap() {
        let mut header = sample();
        header.payload_len = MAX_PAYLOAD_LEN as u32 + 1;
        let bytes = header.encode();
        assert!(matches!(
            FrameHeader::decode(&bytes),
            Err(FrameError::TooLarge { .. })
        ));
    }
}
