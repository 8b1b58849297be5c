use std::any::Any;

use bytes::{Buf, BufMut, Bytes};

use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal, get_padding_size};

use crate::header::{COUNT_MAX, HEADER_LENGTH, Header, PacketType};
use crate::packet::Packet;

/// An RTCP goodbye (packet type 203): leaving sources plus an optional
/// reason string.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Goodbye {
    pub sources: Vec<u32>,
    pub reason: Bytes,
}

impl Goodbye {
    fn content_size(&self) -> usize {
        let mut size = HEADER_LENGTH + self.sources.len() * 4;
        if !self.reason.is_empty() {
            size += 1 + self.reason.len();
        }
        size
    }

    fn size(&self) -> usize {
        let l = self.content_size();
        l + get_padding_size(l)
    }

    pub fn header(&self) -> Header {
        Header {
            padding: false,
            count: self.sources.len() as u8,
            packet_type: PacketType::Goodbye,
            length: ((self.size() / 4) - 1) as u16,
        }
    }
}

impl Packet for Goodbye {
    fn header(&self) -> Header {
        Goodbye::header(self)
    }

    fn destination_ssrc(&self) -> Vec<u32> {
        self.sources.clone()
    }

    fn raw_size(&self) -> usize {
        self.content_size()
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }

    fn equal(&self, other: &(dyn Packet + Send + Sync)) -> bool {
        other
            .as_any()
            .downcast_ref::<Goodbye>()
            .is_some_and(|a| self == a)
    }

    fn cloned(&self) -> Box<dyn Packet + Send + Sync> {
        Box::new(self.clone())
    }
}

impl MarshalSize for Goodbye {
    fn marshal_size(&self) -> usize {
        self.size()
    }
}

impl Marshal for Goodbye {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        let size = self.marshal_size();
        if buf.remaining_mut() < size {
            return Err(Error::ErrBufferShort);
        }
        if self.sources.len() > COUNT_MAX {
            return Err(Error::ErrTooManyReports);
        }
        if self.reason.len() > 0xFF {
            return Err(Error::ErrReasonTooLong);
        }

        let off = Goodbye::header(self).marshal_to(buf)?;
        let mut body = &mut buf[off..];

        for source in &self.sources {
            body.put_u32(*source);
        }

        if !self.reason.is_empty() {
            body.put_u8(self.reason.len() as u8);
            body.put_slice(&self.reason);
        }
        for _ in 0..get_padding_size(self.content_size()) {
            body.put_u8(0);
        }

        Ok(size)
    }
}

impl Unmarshal for Goodbye {
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        let header = Header::unmarshal(raw_packet)?;
        if header.packet_type != PacketType::Goodbye {
            return Err(Error::ErrInvalidPacketType);
        }
        if raw_packet.remaining() < header.count as usize * 4 {
            return Err(Error::ErrPacketTooShort);
        }

        let mut sources = Vec::with_capacity(header.count as usize);
        for _ in 0..header.count {
            sources.push(raw_packet.get_u32());
        }

        let reason = if raw_packet.has_remaining() {
            let len = raw_packet.get_u8() as usize;
            if raw_packet.remaining() < len {
                return Err(Error::ErrPacketTooShort);
            }
            raw_packet.copy_to_bytes(len)
        } else {
            Bytes::new()
        };

        Ok(Goodbye { sources, reason })
    }
}
