use std::any::Any;

use bytes::{Buf, BufMut, Bytes};

use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal, get_padding_size};

use crate::header::{COUNT_MAX, HEADER_LENGTH, Header, PacketType};
use crate::packet::Packet;

pub const SDES_MAX_OCTET_COUNT: usize = (1 << 8) - 1;

/// SDES item types, RFC 3550 section 6.5.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum SdesType {
    #[default]
    SdesEnd = 0,
    SdesCname = 1,
    SdesName = 2,
    SdesEmail = 3,
    SdesPhone = 4,
    SdesLocation = 5,
    SdesTool = 6,
    SdesNote = 7,
    SdesPrivate = 8,
}

impl From<u8> for SdesType {
    fn from(b: u8) -> Self {
        match b {
            1 => SdesType::SdesCname,
            2 => SdesType::SdesName,
            3 => SdesType::SdesEmail,
            4 => SdesType::SdesPhone,
            5 => SdesType::SdesLocation,
            6 => SdesType::SdesTool,
            7 => SdesType::SdesNote,
            8 => SdesType::SdesPrivate,
            _ => SdesType::SdesEnd,
        }
    }
}

/// One SDES item: type, length, UTF-8 text.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceDescriptionItem {
    pub sdes_type: SdesType,
    pub text: Bytes,
}

impl SourceDescriptionItem {
    fn size(&self) -> usize {
        2 + self.text.len()
    }
}

/// One SDES chunk: a source and its item list, zero-terminated and padded
/// to a word boundary.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceDescriptionChunk {
    pub source: u32,
    pub items: Vec<SourceDescriptionItem>,
}

impl SourceDescriptionChunk {
    fn content_size(&self) -> usize {
        4 + self.items.iter().map(|i| i.size()).sum::<usize>() + 1
    }

    fn size(&self) -> usize {
        let l = self.content_size();
        l + get_padding_size(l)
    }

    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        let size = self.size();
        let mut b = &mut buf[..];
        if b.remaining_mut() < size {
            return Err(Error::ErrBufferShort);
        }

        b.put_u32(self.source);
        for item in &self.items {
            if item.text.len() > SDES_MAX_OCTET_COUNT {
                return Err(Error::ErrSdesTextTooLong);
            }
            b.put_u8(item.sdes_type as u8);
            b.put_u8(item.text.len() as u8);
            b.put_slice(&item.text);
        }
        b.put_u8(SdesType::SdesEnd as u8);
        for _ in 0..get_padding_size(self.content_size()) {
            b.put_u8(0);
        }

        Ok(size)
    }

    fn unmarshal<B: Buf>(raw_packet: &mut B) -> Result<Self> {
        if raw_packet.remaining() < 4 {
            return Err(Error::ErrPacketTooShort);
        }
        let source = raw_packet.get_u32();

        let mut items = vec![];
        let mut consumed = 4usize;
        loop {
            if !raw_packet.has_remaining() {
                return Err(Error::ErrPacketTooShort);
            }
            let t = SdesType::from(raw_packet.get_u8());
            consumed += 1;
            if t == SdesType::SdesEnd {
                break;
            }
            if !raw_packet.has_remaining() {
                return Err(Error::ErrPacketTooShort);
            }
            let len = raw_packet.get_u8() as usize;
            consumed += 1;
            if raw_packet.remaining() < len {
                return Err(Error::ErrPacketTooShort);
            }
            let text = raw_packet.copy_to_bytes(len);
            consumed += len;
            items.push(SourceDescriptionItem { sdes_type: t, text });
        }

        // consume chunk padding to the word boundary
        let pad = get_padding_size(consumed);
        if raw_packet.remaining() < pad {
            return Err(Error::ErrPacketTooShort);
        }
        raw_packet.advance(pad);

        Ok(SourceDescriptionChunk { source, items })
    }
}

/// An RTCP source description (packet type 202).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceDescription {
    pub chunks: Vec<SourceDescriptionChunk>,
}

impl SourceDescription {
    /// The usual minimal SDES: one chunk carrying the sender's CNAME.
    pub fn with_cname(ssrc: u32, cname: &str) -> Self {
        SourceDescription {
            chunks: vec![SourceDescriptionChunk {
                source: ssrc,
                items: vec![SourceDescriptionItem {
                    sdes_type: SdesType::SdesCname,
                    text: Bytes::copy_from_slice(cname.as_bytes()),
                }],
            }],
        }
    }

    fn size(&self) -> usize {
        HEADER_LENGTH + self.chunks.iter().map(|c| c.size()).sum::<usize>()
    }

    pub fn header(&self) -> Header {
        Header {
            padding: false,
            count: self.chunks.len() as u8,
            packet_type: PacketType::SourceDescription,
            length: ((self.size() / 4) - 1) as u16,
        }
    }
}

impl Packet for SourceDescription {
    fn header(&self) -> Header {
        SourceDescription::header(self)
    }

    fn destination_ssrc(&self) -> Vec<u32> {
        self.chunks.iter().map(|c| c.source).collect()
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
            .downcast_ref::<SourceDescription>()
            .is_some_and(|a| self == a)
    }

    fn cloned(&self) -> Box<dyn Packet + Send + Sync> {
        Box::new(self.clone())
    }
}

impl MarshalSize for SourceDescription {
    fn marshal_size(&self) -> usize {
        self.size()
    }
}

impl Marshal for SourceDescription {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        let size = self.marshal_size();
        if buf.remaining_mut() < size {
            return Err(Error::ErrBufferShort);
        }
        if self.chunks.len() > COUNT_MAX {
            return Err(Error::ErrTooManyChunks);
        }

        let mut off = SourceDescription::header(self).marshal_to(buf)?;
        for chunk in &self.chunks {
            off += chunk.marshal_to(&mut buf[off..])?;
        }

        Ok(size)
    }
}

impl Unmarshal for SourceDescription {
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        let header = Header::unmarshal(raw_packet)?;
        if header.packet_type != PacketType::SourceDescription {
            return Err(Error::ErrInvalidPacketType);
        }

        let mut chunks = Vec::with_capacity(header.count as usize);
        for _ in 0..header.count {
            chunks.push(SourceDescriptionChunk::unmarshal(raw_packet)?);
        }

        Ok(SourceDescription { chunks })
    }
}
