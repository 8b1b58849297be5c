use std::any::Any;

use bytes::{Buf, BufMut, Bytes};

use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::header::{HEADER_LENGTH, Header};
use crate::packet::Packet;

/// An unparsed RTCP sub-packet kept as raw bytes, used for types the engine
/// forwards without interpreting.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawPacket(pub Bytes);

impl Packet for RawPacket {
    fn header(&self) -> Header {
        let mut buf = self.0.clone();
        Header::unmarshal(&mut buf).unwrap_or_default()
    }

    fn destination_ssrc(&self) -> Vec<u32> {
        vec![]
    }

    fn raw_size(&self) -> usize {
        self.0.len()
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }

    fn equal(&self, other: &(dyn Packet + Send + Sync)) -> bool {
        other
            .as_any()
            .downcast_ref::<RawPacket>()
            .is_some_and(|a| self == a)
    }

    fn cloned(&self) -> Box<dyn Packet + Send + Sync> {
        Box::new(self.clone())
    }
}

impl MarshalSize for RawPacket {
    fn marshal_size(&self) -> usize {
        self.0.len()
    }
}

impl Marshal for RawPacket {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        if buf.remaining_mut() < self.0.len() {
            return Err(Error::ErrBufferShort);
        }
        buf.put_slice(&self.0);
        Ok(self.0.len())
    }
}

impl Unmarshal for RawPacket {
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        if raw_packet.remaining() < HEADER_LENGTH {
            return Err(Error::ErrPacketTooShort);
        }
        Ok(RawPacket(
            raw_packet.copy_to_bytes(raw_packet.remaining()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_packet_round_trip() {
        let raw = RawPacket(Bytes::from_static(&[
            0x81, 0xcd, 0x00, 0x02, 0x90, 0x2f, 0x9e, 0x2e, 0x12, 0x34, 0x56, 0x78,
        ]));
        let out = raw.marshal().unwrap();
        let mut buf = out.clone();
        assert_eq!(RawPacket::unmarshal(&mut buf).unwrap(), raw);
        assert_eq!(
            raw.header().packet_type,
            crate::header::PacketType::TransportSpecificFeedback
        );
    }
}
