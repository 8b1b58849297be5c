use bytes::{Buf, BufMut, Bytes};
use serde::{Deserialize, Serialize};

use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

pub const HEADER_LENGTH: usize = 4;
pub const VERSION_SHIFT: u8 = 6;
pub const VERSION_MASK: u8 = 0x3;
pub const PADDING_SHIFT: u8 = 5;
pub const PADDING_MASK: u8 = 0x1;
pub const EXTENSION_SHIFT: u8 = 4;
pub const EXTENSION_MASK: u8 = 0x1;
pub const CC_MASK: u8 = 0xF;
pub const MARKER_SHIFT: u8 = 7;
pub const MARKER_MASK: u8 = 0x1;
pub const PT_MASK: u8 = 0x7F;
pub const SEQ_NUM_OFFSET: usize = 2;
pub const SEQ_NUM_LENGTH: usize = 2;
pub const TIMESTAMP_OFFSET: usize = 4;
pub const TIMESTAMP_LENGTH: usize = 4;
pub const SSRC_OFFSET: usize = 8;
pub const SSRC_LENGTH: usize = 4;
pub const CSRC_OFFSET: usize = 12;
pub const CSRC_LENGTH: usize = 4;

/// A parsed RTP fixed header plus CSRC list and the optional RFC 3550
/// generic extension (16-bit profile, 16-bit word count, payload).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       sequence number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           synchronization source (SSRC) identifier            |
/// +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
/// |            contributing source (CSRC) identifiers             |
/// |                             ....                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Header {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrc: Vec<u32>,
    pub extension_profile: u16,
    /// Raw extension words, always a multiple of four bytes.
    pub extension_payload: Bytes,
}

impl MarshalSize for Header {
    fn marshal_size(&self) -> usize {
        let mut size = CSRC_OFFSET + self.csrc.len() * CSRC_LENGTH;
        if self.extension {
            size += 4 + self.extension_payload.len();
        }
        size
    }
}

impl Unmarshal for Header {
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        if raw_packet.remaining() < CSRC_OFFSET {
            return Err(Error::ErrHeaderSizeInsufficient);
        }

        let b0 = raw_packet.get_u8();
        let version = (b0 >> VERSION_SHIFT) & VERSION_MASK;
        if version != 2 {
            return Err(Error::ErrInvalidVersion);
        }
        let padding = ((b0 >> PADDING_SHIFT) & PADDING_MASK) > 0;
        let extension = ((b0 >> EXTENSION_SHIFT) & EXTENSION_MASK) > 0;
        let cc = (b0 & CC_MASK) as usize;

        let b1 = raw_packet.get_u8();
        let marker = ((b1 >> MARKER_SHIFT) & MARKER_MASK) > 0;
        let payload_type = b1 & PT_MASK;

        let sequence_number = raw_packet.get_u16();
        let timestamp = raw_packet.get_u32();
        let ssrc = raw_packet.get_u32();

        if raw_packet.remaining() < cc * CSRC_LENGTH {
            return Err(Error::ErrHeaderSizeInsufficient);
        }
        let mut csrc = Vec::with_capacity(cc);
        for _ in 0..cc {
            csrc.push(raw_packet.get_u32());
        }

        let (extension_profile, extension_payload) = if extension {
            if raw_packet.remaining() < 4 {
                return Err(Error::ErrHeaderSizeInsufficientForExtension);
            }
            let profile = raw_packet.get_u16();
            let length = raw_packet.get_u16() as usize * 4;
            if raw_packet.remaining() < length {
                return Err(Error::ErrHeaderSizeInsufficientForExtension);
            }
            let payload = raw_packet.copy_to_bytes(length);
            (profile, payload)
        } else {
            (0, Bytes::new())
        };

        Ok(Header {
            version,
            padding,
            extension,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc,
            extension_profile,
            extension_payload,
        })
    }
}

impl Marshal for Header {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        let size = self.marshal_size();
        if buf.remaining_mut() < size {
            return Err(Error::ErrBufferShort);
        }
        if self.csrc.len() > 0xF {
            return Err(Error::ErrTooManyReports);
        }
        if self.extension && self.extension_payload.len() % 4 != 0 {
            return Err(Error::ErrHeaderSizeInsufficientForExtension);
        }

        let mut b0 = 2u8 << VERSION_SHIFT;
        if self.padding {
            b0 |= 1 << PADDING_SHIFT;
        }
        if self.extension {
            b0 |= 1 << EXTENSION_SHIFT;
        }
        b0 |= self.csrc.len() as u8;
        buf.put_u8(b0);

        let mut b1 = self.payload_type & PT_MASK;
        if self.marker {
            b1 |= 1 << MARKER_SHIFT;
        }
        buf.put_u8(b1);

        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);

        for csrc in &self.csrc {
            buf.put_u32(*csrc);
        }

        if self.extension {
            buf.put_u16(self.extension_profile);
            buf.put_u16((self.extension_payload.len() / 4) as u16);
            buf.put_slice(&self.extension_payload);
        }

        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_basic_header_unmarshal() {
        let raw = Bytes::from_static(&[
            0x80, 0xe4, 0x69, 0x8f, 0xd9, 0xc2, 0x93, 0xda, 0x1c, 0x64, 0x27, 0x82,
        ]);
        let mut buf = raw.clone();
        let h = Header::unmarshal(&mut buf).unwrap();
        assert_eq!(h.version, 2);
        assert!(!h.padding);
        assert!(!h.extension);
        assert!(h.marker);
        assert_eq!(h.payload_type, 100);
        assert_eq!(h.sequence_number, 0x698f);
        assert_eq!(h.timestamp, 0xd9c293da);
        assert_eq!(h.ssrc, 0x1c642782);
        assert_eq!(h.marshal().unwrap(), raw);
    }

    #[test]
    fn test_header_with_csrc_round_trip() {
        let h = Header {
            version: 2,
            marker: true,
            payload_type: 96,
            sequence_number: 27023,
            timestamp: 3653407706,
            ssrc: 476325762,
            csrc: vec![0x11111111, 0x22222222],
            ..Default::default()
        };
        let raw = h.marshal().unwrap();
        assert_eq!(raw.len(), 20);
        assert_eq!(raw[0] & CC_MASK, 2);
        let mut buf = raw.clone();
        assert_eq!(Header::unmarshal(&mut buf).unwrap(), h);
    }

    #[test]
    fn test_header_extension_round_trip() {
        let h = Header {
            version: 2,
            extension: true,
            payload_type: 98,
            sequence_number: 1,
            timestamp: 12345,
            ssrc: 0xdeadbeef,
            extension_profile: 0xbede,
            extension_payload: Bytes::from_static(&[0x90, 0x01, 0x00, 0x00]),
            ..Default::default()
        };
        let raw = h.marshal().unwrap();
        let mut buf = raw.clone();
        let parsed = Header::unmarshal(&mut buf).unwrap();
        assert_eq!(parsed.extension_profile, 0xbede);
        assert_eq!(parsed.extension_payload.len(), 4);
        assert_eq!(parsed, h);
    }

    #[test]
    fn test_rejects_wrong_version() {
        let raw = Bytes::from_static(&[
            0x40, 0xe4, 0x69, 0x8f, 0xd9, 0xc2, 0x93, 0xda, 0x1c, 0x64, 0x27, 0x82,
        ]);
        let mut buf = raw;
        assert_eq!(Header::unmarshal(&mut buf), Err(Error::ErrInvalidVersion));
    }

    #[test]
    fn test_rejects_truncated_extension() {
        // X bit set but no room for the extension header
        let raw = Bytes::from_static(&[
            0x90, 0x60, 0x69, 0x8f, 0xd9, 0xc2, 0x93, 0xda, 0x1c, 0x64, 0x27, 0x82,
        ]);
        let mut buf = raw;
        assert_eq!(
            Header::unmarshal(&mut buf),
            Err(Error::ErrHeaderSizeInsufficientForExtension)
        );
    }
}
