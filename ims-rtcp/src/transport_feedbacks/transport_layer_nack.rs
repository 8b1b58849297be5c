use std::any::Any;

use bytes::{Buf, BufMut};

use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::header::{FORMAT_TLN, HEADER_LENGTH, Header, PacketType};
use crate::packet::Packet;

pub const TLN_FIXED_LENGTH: usize = 8;
pub const NACK_PAIR_LENGTH: usize = 4;

/// One generic NACK entry: a packet id and a bitmask of the sixteen
/// sequence numbers that follow it (RFC 4585 6.2.1).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct NackPair {
    pub packet_id: u16,
    pub lost_packets: u16,
}

impl NackPair {
    /// Expands the pair into the sequence numbers it reports lost.
    pub fn packet_list(&self) -> Vec<u16> {
        let mut out = vec![self.packet_id];
        for i in 0..16u16 {
            if (self.lost_packets >> i) & 1 != 0 {
                out.push(self.packet_id.wrapping_add(i + 1));
            }
        }
        out
    }
}

/// Builds the minimal set of NACK pairs covering `lost` sequence numbers.
pub fn nack_pairs_from_sequence_numbers(lost: &[u16]) -> Vec<NackPair> {
    let mut pairs: Vec<NackPair> = vec![];
    for &seq in lost {
        match pairs.last_mut() {
            Some(pair) => {
                let dist = seq.wrapping_sub(pair.packet_id);
                if dist > 0 && dist <= 16 {
                    pair.lost_packets |= 1 << (dist - 1);
                } else if dist != 0 {
                    pairs.push(NackPair {
                        packet_id: seq,
                        lost_packets: 0,
                    });
                }
            }
            None => pairs.push(NackPair {
                packet_id: seq,
                lost_packets: 0,
            }),
        }
    }
    pairs
}

/// An RTCP transport-layer NACK (packet type 205, FMT 1).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransportLayerNack {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
    pub nacks: Vec<NackPair>,
}

impl TransportLayerNack {
    fn size(&self) -> usize {
        HEADER_LENGTH + TLN_FIXED_LENGTH + self.nacks.len() * NACK_PAIR_LENGTH
    }

    pub fn header(&self) -> Header {
        Header {
            padding: false,
            count: FORMAT_TLN,
            packet_type: PacketType::TransportSpecificFeedback,
            length: ((self.size() / 4) - 1) as u16,
        }
    }
}

impl Packet for TransportLayerNack {
    fn header(&self) -> Header {
        TransportLayerNack::header(self)
    }

    fn destination_ssrc(&self) -> Vec<u32> {
        vec![self.media_ssrc]
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
            .downcast_ref::<TransportLayerNack>()
            .is_some_and(|a| self == a)
    }

    fn cloned(&self) -> Box<dyn Packet + Send + Sync> {
        Box::new(self.clone())
    }
}

impl MarshalSize for TransportLayerNack {
    fn marshal_size(&self) -> usize {
        self.size()
    }
}

impl Marshal for TransportLayerNack {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        let size = self.marshal_size();
        if buf.remaining_mut() < size {
            return Err(Error::ErrBufferShort);
        }

        let off = TransportLayerNack::header(self).marshal_to(buf)?;
        let mut body = &mut buf[off..];
        body.put_u32(self.sender_ssrc);
        body.put_u32(self.media_ssrc);
        for nack in &self.nacks {
            body.put_u16(nack.packet_id);
            body.put_u16(nack.lost_packets);
        }

        Ok(size)
    }
}

impl Unmarshal for TransportLayerNack {
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        let header = Header::unmarshal(raw_packet)?;
        if header.packet_type != PacketType::TransportSpecificFeedback
            || header.count != FORMAT_TLN
        {
            return Err(Error::ErrInvalidPacketType);
        }
        if raw_packet.remaining() < TLN_FIXED_LENGTH {
            return Err(Error::ErrPacketTooShort);
        }

        let sender_ssrc = raw_packet.get_u32();
        let media_ssrc = raw_packet.get_u32();

        let mut nacks = vec![];
        while raw_packet.remaining() >= NACK_PAIR_LENGTH {
            nacks.push(NackPair {
                packet_id: raw_packet.get_u16(),
                lost_packets: raw_packet.get_u16(),
            });
        }

        Ok(TransportLayerNack {
            sender_ssrc,
            media_ssrc,
            nacks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nack_round_trip() {
        let nack = TransportLayerNack {
            sender_ssrc: 0x902f9e2e,
            media_ssrc: 0xbc5e9a40,
            nacks: vec![
                NackPair {
                    packet_id: 1000,
                    lost_packets: 0b0101_0101_0101_0101,
                },
                NackPair {
                    packet_id: 2000,
                    lost_packets: 0,
                },
            ],
        };
        let raw = nack.marshal().unwrap();
        assert_eq!(raw.len(), 20);
        let mut buf = raw.clone();
        assert_eq!(TransportLayerNack::unmarshal(&mut buf).unwrap(), nack);
    }

    #[test]
    fn test_nack_pair_expansion() {
        let pair = NackPair {
            packet_id: 100,
            lost_packets: 0b1000_0000_0000_0001,
        };
        assert_eq!(pair.packet_list(), vec![100, 101, 116]);
    }

    #[test]
    fn test_pairs_from_sequence_numbers() {
        let pairs = nack_pairs_from_sequence_numbers(&[10, 11, 26, 27, 50]);
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0].packet_id, 10);
        // 11 is bit 0, 26 is bit 15; 27 and 50 exceed the mask range
        assert_eq!(pairs[0].lost_packets, 0b1000_0000_0000_0001);
        assert_eq!(pairs[1].packet_id, 27);
        assert_eq!(pairs[1].lost_packets, 0);
        assert_eq!(pairs[2].packet_id, 50);
    }

    #[test]
    fn test_nack_wraparound_pairs() {
        let pairs = nack_pairs_from_sequence_numbers(&[65535, 0, 1]);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].packet_id, 65535);
        assert_eq!(pairs[0].lost_packets, 0b11);
    }
}
