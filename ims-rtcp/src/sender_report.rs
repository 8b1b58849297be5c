use std::any::Any;

use bytes::{Buf, BufMut, Bytes};

use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::header::{COUNT_MAX, HEADER_LENGTH, Header, PacketType};
use crate::packet::Packet;
use crate::reception_report::{RECEPTION_REPORT_LENGTH, ReceptionReport};

pub const SR_HEADER_LENGTH: usize = 24;
pub const SR_SSRC_OFFSET: usize = HEADER_LENGTH;
pub const SR_REPORT_OFFSET: usize = SR_SSRC_OFFSET + SR_HEADER_LENGTH;

/// An RTCP sender report (packet type 200).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SenderReport {
    /// The SSRC of this sender.
    pub ssrc: u32,
    /// The 64-bit NTP wall clock at the moment of the report.
    pub ntp_time: u64,
    /// The same instant in the stream's RTP timestamp units.
    pub rtp_time: u32,
    /// Total RTP packets sent since the stream started.
    pub packet_count: u32,
    /// Total payload octets sent since the stream started.
    pub octet_count: u32,
    pub reports: Vec<ReceptionReport>,
    /// Profile-specific trailing extension, kept opaque.
    pub profile_extensions: Bytes,
}

impl SenderReport {
    fn size(&self) -> usize {
        HEADER_LENGTH
            + SR_HEADER_LENGTH
            + self.reports.len() * RECEPTION_REPORT_LENGTH
            + self.profile_extensions.len()
    }

    pub fn header(&self) -> Header {
        Header {
            padding: false,
            count: self.reports.len() as u8,
            packet_type: PacketType::SenderReport,
            length: ((self.size() / 4) - 1) as u16,
        }
    }
}

impl Packet for SenderReport {
    fn header(&self) -> Header {
        SenderReport::header(self)
    }

    fn destination_ssrc(&self) -> Vec<u32> {
        self.reports.iter().map(|r| r.ssrc).collect()
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
            .downcast_ref::<SenderReport>()
            .is_some_and(|a| self == a)
    }

    fn cloned(&self) -> Box<dyn Packet + Send + Sync> {
        Box::new(self.clone())
    }
}

impl MarshalSize for SenderReport {
    fn marshal_size(&self) -> usize {
        self.size()
    }
}

impl Marshal for SenderReport {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        let size = self.marshal_size();
        if buf.remaining_mut() < size {
            return Err(Error::ErrBufferShort);
        }
        if self.reports.len() > COUNT_MAX {
            return Err(Error::ErrTooManyReports);
        }

        let mut off = SenderReport::header(self).marshal_to(buf)?;
        let mut body = &mut buf[off..];
        body.put_u32(self.ssrc);
        body.put_u64(self.ntp_time);
        body.put_u32(self.rtp_time);
        body.put_u32(self.packet_count);
        body.put_u32(self.octet_count);
        off += SR_HEADER_LENGTH;

        for report in &self.reports {
            off += report.marshal_to(&mut buf[off..])?;
        }

        let mut tail = &mut buf[off..];
        tail.put_slice(&self.profile_extensions);

        Ok(size)
    }
}

impl Unmarshal for SenderReport {
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        let header = Header::unmarshal(raw_packet)?;
        if header.packet_type != PacketType::SenderReport {
            return Err(Error::ErrInvalidPacketType);
        }
        if raw_packet.remaining() < SR_HEADER_LENGTH {
            return Err(Error::ErrPacketTooShort);
        }

        let ssrc = raw_packet.get_u32();
        let ntp_time = raw_packet.get_u64();
        let rtp_time = raw_packet.get_u32();
        let packet_count = raw_packet.get_u32();
        let octet_count = raw_packet.get_u32();

        let mut reports = Vec::with_capacity(header.count as usize);
        for _ in 0..header.count {
            reports.push(ReceptionReport::unmarshal(raw_packet)?);
        }
        let profile_extensions = raw_packet.copy_to_bytes(raw_packet.remaining());

        Ok(SenderReport {
            ssrc,
            ntp_time,
            rtp_time,
            packet_count,
            octet_count,
            reports,
            profile_extensions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sender_report_round_trip() {
        let sr = SenderReport {
            ssrc: 0x902f9e2e,
            ntp_time: 0xda8bd1fcdddda05a,
            rtp_time: 0xaaf4edd5,
            packet_count: 1000,
            octet_count: 50000,
            reports: vec![ReceptionReport {
                ssrc: 0xbc5e9a40,
                fraction_lost: 10,
                total_lost: 100,
                last_sequence_number: 0x46e1,
                jitter: 273,
                last_sender_report: 0x9f36432,
                delay: 150137,
            }],
            profile_extensions: Bytes::new(),
        };
        let raw = sr.marshal().unwrap();
        assert_eq!(raw.len(), 52);
        // length field counts 32-bit words minus one
        assert_eq!(u16::from_be_bytes([raw[2], raw[3]]), 12);
        let mut buf = raw.clone();
        assert_eq!(SenderReport::unmarshal(&mut buf).unwrap(), sr);
    }

    #[test]
    fn test_sender_report_wrong_type() {
        let mut buf = Bytes::from_static(&[
            0x80, 0xc9, 0x00, 0x06, // RR header on an SR parse
            0x90, 0x2f, 0x9e, 0x2e, 0xda, 0x8b, 0xd1, 0xfc, 0xdd, 0xdd, 0xa0, 0x5a, 0xaa, 0xf4,
            0xed, 0xd5, 0x00, 0x00, 0x03, 0xe8, 0x00, 0x00, 0xc3, 0x50,
        ]);
        assert_eq!(
            SenderReport::unmarshal(&mut buf),
            Err(Error::ErrInvalidPacketType)
        );
    }
}
