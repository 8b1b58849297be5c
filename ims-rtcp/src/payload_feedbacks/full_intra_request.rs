use std::any::Any;

use bytes::{Buf, BufMut};

use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::header::{FORMAT_FIR, HEADER_LENGTH, Header, PacketType};
use crate::packet::Packet;

pub const FIR_FIXED_LENGTH: usize = 8;
pub const FIR_ENTRY_LENGTH: usize = 8;

/// One FIR entry: the target SSRC and a command sequence number that
/// deduplicates retransmitted requests.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct FirEntry {
    pub ssrc: u32,
    pub sequence_number: u8,
}

/// An RTCP full intra request (packet type 206, FMT 4), RFC 5104.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FullIntraRequest {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
    pub fir: Vec<FirEntry>,
}

impl FullIntraRequest {
    fn size(&self) -> usize {
        HEADER_LENGTH + FIR_FIXED_LENGTH + self.fir.len() * FIR_ENTRY_LENGTH
    }

    pub fn header(&self) -> Header {
        Header {
            padding: false,
            count: FORMAT_FIR,
            packet_type: PacketType::PayloadSpecificFeedback,
            length: ((self.size() / 4) - 1) as u16,
        }
    }
}

impl Packet for FullIntraRequest {
    fn header(&self) -> Header {
        FullIntraRequest::header(self)
    }

    fn destination_ssrc(&self) -> Vec<u32> {
        self.fir.iter().map(|f| f.ssrc).collect()
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
            .downcast_ref::<FullIntraRequest>()
            .is_some_and(|a| self == a)
    }

    fn cloned(&self) -> Box<dyn Packet + Send + Sync> {
        Box::new(self.clone())
    }
}

impl MarshalSize for FullIntraRequest {
    fn marshal_size(&self) -> usize {
        self.size()
    }
}

impl Marshal for FullIntraRequest {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        let size = self.marshal_size();
        if buf.remaining_mut() < size {
            return Err(Error::ErrBufferShort);
        }

        let off = FullIntraRequest::header(self).marshal_to(buf)?;
        let mut body = &mut buf[off..];
        body.put_u32(self.sender_ssrc);
        body.put_u32(self.media_ssrc);
        for fir in &self.fir {
            body.put_u32(fir.ssrc);
            body.put_u8(fir.sequence_number);
            body.put_u8(0);
            body.put_u16(0);
        }

        Ok(size)
    }
}

impl Unmarshal for FullIntraRequest {
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        let header = Header::unmarshal(raw_packet)?;
        if header.packet_type != PacketType::PayloadSpecificFeedback || header.count != FORMAT_FIR
        {
            return Err(Error::ErrInvalidPacketType);
        }
        if raw_packet.remaining() < FIR_FIXED_LENGTH {
            return Err(Error::ErrPacketTooShort);
        }

        let sender_ssrc = raw_packet.get_u32();
        let media_ssrc = raw_packet.get_u32();

        let mut fir = vec![];
        while raw_packet.remaining() >= FIR_ENTRY_LENGTH {
            let ssrc = raw_packet.get_u32();
            let sequence_number = raw_packet.get_u8();
            raw_packet.advance(3);
            fir.push(FirEntry {
                ssrc,
                sequence_number,
            });
        }

        Ok(FullIntraRequest {
            sender_ssrc,
            media_ssrc,
            fir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fir_round_trip() {
        let fir = FullIntraRequest {
            sender_ssrc: 0x902f9e2e,
            media_ssrc: 0xbc5e9a40,
            fir: vec![FirEntry {
                ssrc: 0xbc5e9a40,
                sequence_number: 3,
            }],
        };
        let raw = fir.marshal().unwrap();
        assert_eq!(raw.len(), 20);
        assert_eq!(raw[0] & 0x1F, FORMAT_FIR);
        let mut buf = raw.clone();
        assert_eq!(FullIntraRequest::unmarshal(&mut buf).unwrap(), fir);
    }
}
