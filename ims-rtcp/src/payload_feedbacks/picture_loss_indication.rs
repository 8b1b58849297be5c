use std::any::Any;

use bytes::{Buf, BufMut};

use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::header::{FORMAT_PLI, HEADER_LENGTH, Header, PacketType};
use crate::packet::Packet;

pub const PLI_LENGTH: usize = 8;

/// An RTCP picture loss indication (packet type 206, FMT 1): asks the
/// sender for a new intra frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct PictureLossIndication {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
}

impl PictureLossIndication {
    pub fn header(&self) -> Header {
        Header {
            padding: false,
            count: FORMAT_PLI,
            packet_type: PacketType::PayloadSpecificFeedback,
            length: ((HEADER_LENGTH + PLI_LENGTH) / 4 - 1) as u16,
        }
    }
}

impl Packet for PictureLossIndication {
    fn header(&self) -> Header {
        PictureLossIndication::header(self)
    }

    fn destination_ssrc(&self) -> Vec<u32> {
        vec![self.media_ssrc]
    }

    fn raw_size(&self) -> usize {
        HEADER_LENGTH + PLI_LENGTH
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }

    fn equal(&self, other: &(dyn Packet + Send + Sync)) -> bool {
        other
            .as_any()
            .downcast_ref::<PictureLossIndication>()
            .is_some_and(|a| self == a)
    }

    fn cloned(&self) -> Box<dyn Packet + Send + Sync> {
        Box::new(*self)
    }
}

impl MarshalSize for PictureLossIndication {
    fn marshal_size(&self) -> usize {
        HEADER_LENGTH + PLI_LENGTH
    }
}

impl Marshal for PictureLossIndication {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        let size = self.marshal_size();
        if buf.remaining_mut() < size {
            return Err(Error::ErrBufferShort);
        }

        let off = PictureLossIndication::header(self).marshal_to(buf)?;
        let mut body = &mut buf[off..];
        body.put_u32(self.sender_ssrc);
        body.put_u32(self.media_ssrc);

        Ok(size)
    }
}

impl Unmarshal for PictureLossIndication {
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        let header = Header::unmarshal(raw_packet)?;
        if header.packet_type != PacketType::PayloadSpecificFeedback || header.count != FORMAT_PLI
        {
            return Err(Error::ErrInvalidPacketType);
        }
        if raw_packet.remaining() < PLI_LENGTH {
            return Err(Error::ErrPacketTooShort);
        }

        Ok(PictureLossIndication {
            sender_ssrc: raw_packet.get_u32(),
            media_ssrc: raw_packet.get_u32(),
        })
    }
}
