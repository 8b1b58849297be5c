use std::any::Any;

use bytes::{Buf, BufMut, Bytes};

use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::header::{COUNT_MAX, HEADER_LENGTH, Header, PacketType};
use crate::packet::Packet;
use crate::reception_report::{RECEPTION_REPORT_LENGTH, ReceptionReport};

pub const RR_SSRC_LENGTH: usize = 4;

/// An RTCP receiver report (packet type 201).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReceiverReport {
    /// The SSRC of the reporting receiver.
    pub ssrc: u32,
    pub reports: Vec<ReceptionReport>,
    pub profile_extensions: Bytes,
}

impl ReceiverReport {
    fn size(&self) -> usize {
        HEADER_LENGTH
            + RR_SSRC_LENGTH
            + self.reports.len() * RECEPTION_REPORT_LENGTH
            + self.profile_extensions.len()
    }

    pub fn header(&self) -> Header {
        Header {
            padding: false,
            count: self.reports.len() as u8,
            packet_type: PacketType::ReceiverReport,
            length: ((self.size() / 4) - 1) as u16,
        }
    }
}

impl Packet for ReceiverReport {
    fn header(&self) -> Header {
        ReceiverReport::header(self)
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
            .downcast_ref::<ReceiverReport>()
            .is_some_and(|a| self == a)
    }

    fn cloned(&self) -> Box<dyn Packet + Send + Sync> {
        Box::new(self.clone())
    }
}

impl MarshalSize for ReceiverReport {
    fn marshal_size(&self) -> usize {
        self.size()
    }
}

impl Marshal for ReceiverReport {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        let size = self.marshal_size();
        if buf.remaining_mut() < size {
            return Err(Error::ErrBufferShort);
        }
        if self.reports.len() > COUNT_MAX {
            return Err(Error::ErrTooManyReports);
        }

        let mut off = ReceiverReport::header(self).marshal_to(buf)?;
        let mut body = &mut buf[off..];
        body.put_u32(self.ssrc);
        off += RR_SSRC_LENGTH;

        for report in &self.reports {
            off += report.marshal_to(&mut buf[off..])?;
        }

        let mut tail = &mut buf[off..];
        tail.put_slice(&self.profile_extensions);

        Ok(size)
    }
}

impl Unmarshal for ReceiverReport {
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        let header = Header::unmarshal(raw_packet)?;
        if header.packet_type != PacketType::ReceiverReport {
            return Err(Error::ErrInvalidPacketType);
        }
        if raw_packet.remaining() < RR_SSRC_LENGTH {
            return Err(Error::ErrPacketTooShort);
        }

        let ssrc = raw_packet.get_u32();
        let mut reports = Vec::with_capacity(header.count as usize);
        for _ in 0..header.count {
            reports.push(ReceptionReport::unmarshal(raw_packet)?);
        }
        let profile_extensions = raw_packet.copy_to_bytes(raw_packet.remaining());

        Ok(ReceiverReport {
            ssrc,
            reports,
            profile_extensions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receiver_report_round_trip() {
        let rr = ReceiverReport {
            ssrc: 0x902f9e2e,
            reports: vec![
                ReceptionReport {
                    ssrc: 0xbc5e9a40,
                    fraction_lost: 10,
                    total_lost: 100,
                    last_sequence_number: 0x46e1,
                    jitter: 273,
                    last_sender_report: 0x9f36432,
                    delay: 150137,
                },
                ReceptionReport {
                    ssrc: 0xbc5e9a41,
                    fraction_lost: 5,
                    total_lost: 50,
                    last_sequence_number: 0x46e2,
                    jitter: 150,
                    last_sender_report: 0x9f36433,
                    delay: 150138,
                },
            ],
            profile_extensions: Bytes::new(),
        };
        let raw = rr.marshal().unwrap();
        assert_eq!(raw.len(), 8 + 2 * RECEPTION_REPORT_LENGTH);
        assert_eq!(raw[0] & 0x1F, 2);
        let mut buf = raw.clone();
        assert_eq!(ReceiverReport::unmarshal(&mut buf).unwrap(), rr);
    }

    #[test]
    fn test_receiver_report_empty_round_trip() {
        let rr = ReceiverReport {
            ssrc: 0x902f9e2e,
            ..Default::default()
        };
        let raw = rr.marshal().unwrap();
        assert_eq!(raw.len(), 8);
        let mut buf = raw.clone();
        assert_eq!(ReceiverReport::unmarshal(&mut buf).unwrap(), rr);
    }
}
