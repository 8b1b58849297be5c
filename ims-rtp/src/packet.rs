use bytes::{Buf, BufMut, Bytes};

use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::header::Header;

/// A full RTP packet: header, payload, optional trailing padding.
///
/// When the header padding bit is set the final payload byte on the wire is
/// the pad count; `unmarshal` validates and strips it, `marshal` re-appends
/// `padding_size - 1` zero bytes followed by the count.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Packet {
    pub header: Header,
    pub payload: Bytes,
    pub padding_size: u8,
}

impl MarshalSize for Packet {
    fn marshal_size(&self) -> usize {
        self.header.marshal_size() + self.payload.len() + self.padding_size as usize
    }
}

impl Unmarshal for Packet {
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        let header = Header::unmarshal(raw_packet)?;
        let remaining = raw_packet.remaining();

        let (payload, padding_size) = if header.padding {
            if remaining == 0 {
                return Err(Error::ErrInvalidPadding);
            }
            let body = raw_packet.copy_to_bytes(remaining);
            let pad_len = body[remaining - 1] as usize;
            if pad_len == 0 || pad_len > remaining {
                return Err(Error::ErrInvalidPadding);
            }
            (body.slice(..remaining - pad_len), pad_len as u8)
        } else {
            (raw_packet.copy_to_bytes(remaining), 0)
        };

        Ok(Packet {
            header,
            payload,
            padding_size,
        })
    }
}

impl Marshal for Packet {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        let size = self.marshal_size();
        if buf.remaining_mut() < size {
            return Err(Error::ErrBufferShort);
        }
        if self.header.padding != (self.padding_size > 0) {
            return Err(Error::ErrInvalidPadding);
        }

        let n = self.header.marshal_to(buf)?;
        let mut rest = &mut buf[n..];
        rest.put_slice(&self.payload);

        if self.padding_size > 0 {
            for _ in 0..self.padding_size - 1 {
                rest.put_u8(0);
            }
            rest.put_u8(self.padding_size);
        }

        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_round_trip() {
        let p = Packet {
            header: Header {
                version: 2,
                marker: true,
                payload_type: 96,
                sequence_number: 100,
                timestamp: 160,
                ssrc: 0x12345678,
                ..Default::default()
            },
            payload: Bytes::from_static(&[0xf0, 0x44, 0x84, 0x1c]),
            padding_size: 0,
        };
        let raw = p.marshal().unwrap();
        assert_eq!(raw.len(), 16);
        let mut buf = raw.clone();
        let parsed = Packet::unmarshal(&mut buf).unwrap();
        assert_eq!(parsed, p);
        assert_eq!(parsed.payload, p.payload);
    }

    #[test]
    fn test_padding_round_trip() {
        let p = Packet {
            header: Header {
                version: 2,
                padding: true,
                payload_type: 96,
                sequence_number: 7,
                timestamp: 1234,
                ssrc: 1,
                ..Default::default()
            },
            payload: Bytes::from_static(&[0xaa, 0xbb, 0xcc]),
            padding_size: 5,
        };
        let raw = p.marshal().unwrap();
        // last byte carries the pad count
        assert_eq!(raw[raw.len() - 1], 5);
        let mut buf = raw.clone();
        let parsed = Packet::unmarshal(&mut buf).unwrap();
        assert_eq!(parsed.payload, p.payload);
        assert_eq!(parsed.padding_size, 5);
    }

    #[test]
    fn test_rejects_zero_pad_length() {
        let p = Packet {
            header: Header {
                version: 2,
                payload_type: 96,
                sequence_number: 7,
                timestamp: 1234,
                ssrc: 1,
                ..Default::default()
            },
            payload: Bytes::from_static(&[0xaa, 0xbb, 0xcc, 0x00]),
            padding_size: 0,
        };
        let mut raw = bytes::BytesMut::from(&p.marshal().unwrap()[..]);
        raw[0] |= 1 << crate::header::PADDING_SHIFT; // claim padding, last byte is 0
        let mut buf = raw.freeze();
        assert_eq!(Packet::unmarshal(&mut buf), Err(Error::ErrInvalidPadding));
    }

    #[test]
    fn test_rejects_oversized_pad_length() {
        let p = Packet {
            header: Header {
                version: 2,
                payload_type: 96,
                sequence_number: 7,
                timestamp: 1234,
                ssrc: 1,
                ..Default::default()
            },
            payload: Bytes::from_static(&[0xaa, 0xff]),
            padding_size: 0,
        };
        let mut raw = bytes::BytesMut::from(&p.marshal().unwrap()[..]);
        raw[0] |= 1 << crate::header::PADDING_SHIFT; // claim padding, last byte is 0xff > len
        let mut buf = raw.freeze();
        assert_eq!(Packet::unmarshal(&mut buf), Err(Error::ErrInvalidPadding));
    }
}
