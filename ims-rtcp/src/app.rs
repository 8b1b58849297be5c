use std::any::Any;

use bytes::{Buf, BufMut, Bytes};

use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::header::{HEADER_LENGTH, Header, PacketType};
use crate::packet::Packet;

pub const APP_PACKET_FIXED_LENGTH: usize = 8;

/// An RTCP application-defined packet (packet type 204): a subtype in the
/// count field, the source SSRC, a four-character name, and opaque
/// word-aligned data.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ApplicationDefined {
    pub sub_type: u8,
    pub ssrc: u32,
    pub name: [u8; 4],
    pub data: Bytes,
}

impl ApplicationDefined {
    fn size(&self) -> usize {
        HEADER_LENGTH + APP_PACKET_FIXED_LENGTH + self.data.len()
    }

    pub fn header(&self) -> Header {
        Header {
            padding: false,
            count: self.sub_type,
            packet_type: PacketType::ApplicationDefined,
            length: ((self.size() / 4) - 1) as u16,
        }
    }
}

impl Packet for ApplicationDefined {
    fn header(&self) -> Header {
        ApplicationDefined::header(self)
    }

    fn destination_ssrc(&self) -> Vec<u32> {
        vec![self.ssrc]
    }

    fn raw_size(&self) -> usize {
        self.size()
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }

    fn equal(&self, other: &(dyn Packet + Send + Sync)) -> bool {
        other
            .as_any()
            .downcast_ref::<ApplicationDefined>()
            .is_some_and(|a| self == a)
    }

    fn cloned(&self) -> Box<dyn Packet + Send + Sync> {
        Box::new(self.clone())
    }
}

impl MarshalSize for ApplicationDefined {
    fn marshal_size(&self) -> usize {
        self.size()
    }
}

impl Marshal for ApplicationDefined {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        let size = self.marshal_size();
        if buf.remaining_mut() < size {
            return Err(Error::ErrBufferShort);
        }
        if self.data.len() % 4 != 0 {
            return Err(Error::ErrInvalidHeaderLength);
        }
        if self.sub_type > 0x1F {
            return Err(Error::ErrInvalidHeaderLength);
        }

        let off = ApplicationDefined::header(self).marshal_to(buf)?;
        let mut body = &mut buf[off..];
        body.put_u32(self.ssrc);
        body.put_slice(&self.name);
        body.put_slice(&self.data);

        Ok(size)
    }
}

impl Unmarshal for ApplicationDefined {
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        let header = Header::unmarshal(raw_packet)?;
        if header.packet_type != PacketType::ApplicationDefined {
            return Err(Error::ErrInvalidPacketType);
        }
        if raw_packet.remaining() < APP_PACKET_FIXED_LENGTH {
            return Err(Error::ErrPacketTooShort);
        }

        let ssrc = raw_packet.get_u32();
        let mut name = [0u8; 4];
        raw_packet.copy_to_slice(&mut name);
        let data = raw_packet.copy_to_bytes(raw_packet.remaining());

        Ok(ApplicationDefined {
            sub_type: header.count,
            ssrc,
            name,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_round_trip() {
        let app = ApplicationDefined {
            sub_type: 5,
            ssrc: 0x902f9e2e,
            name: *b"QUAL",
            data: Bytes::from_static(&[0x01, 0x02, 0x03, 0x04]),
        };
        let raw = app.marshal().unwrap();
        assert_eq!(raw.len(), 16);
        let mut buf = raw.clone();
        assert_eq!(ApplicationDefined::unmarshal(&mut buf).unwrap(), app);
    }

    #[test]
    fn test_app_rejects_unaligned_data() {
        let app = ApplicationDefined {
            sub_type: 1,
            ssrc: 1,
            name: *b"TEST",
            data: Bytes::from_static(&[0x01, 0x02, 0x03]),
        };
        assert!(app.marshal().is_err());
    }
}
