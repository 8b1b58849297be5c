pub mod statistics_summary;
pub mod voip_metrics;

use std::any::Any;

use bytes::{Buf, BufMut, Bytes};

use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::header::{HEADER_LENGTH, Header, PacketType};
use crate::packet::Packet;

pub use statistics_summary::StatisticsSummaryReportBlock;
pub use voip_metrics::VoipMetricsReportBlock;

pub const XR_HEADER_LENGTH: usize = 4;
pub const XR_BLOCK_HEADER_LENGTH: usize = 4;

/// Block type ids the engine emits and parses.
pub const BLOCK_TYPE_STATISTICS_SUMMARY: u8 = 4;
pub const BLOCK_TYPE_VOIP_METRICS: u8 = 7;

/// Common four-byte header preceding every XR report block.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct XrBlockHeader {
    pub block_type: u8,
    pub type_specific: u8,
    /// Block body length in 32-bit words, excluding this header.
    pub block_length: u16,
}

impl XrBlockHeader {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        let mut b = &mut buf[..];
        if b.remaining_mut() < XR_BLOCK_HEADER_LENGTH {
            return Err(Error::ErrBufferShort);
        }
        b.put_u8(self.block_type);
        b.put_u8(self.type_specific);
        b.put_u16(self.block_length);
        Ok(XR_BLOCK_HEADER_LENGTH)
    }

    fn unmarshal<B: Buf>(raw_packet: &mut B) -> Result<Self> {
        if raw_packet.remaining() < XR_BLOCK_HEADER_LENGTH {
            return Err(Error::ErrPacketTooShort);
        }
        Ok(XrBlockHeader {
            block_type: raw_packet.get_u8(),
            type_specific: raw_packet.get_u8(),
            block_length: raw_packet.get_u16(),
        })
    }
}

/// A typed XR report block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportBlock {
    StatisticsSummary(StatisticsSummaryReportBlock),
    VoipMetrics(VoipMetricsReportBlock),
    /// Unrecognized block, header plus raw body.
    Unknown(XrBlockHeader, Bytes),
}

impl ReportBlock {
    pub fn block_size(&self) -> usize {
        match self {
            ReportBlock::StatisticsSummary(b) => b.block_size(),
            ReportBlock::VoipMetrics(b) => b.block_size(),
            ReportBlock::Unknown(_, body) => XR_BLOCK_HEADER_LENGTH + body.len(),
        }
    }

    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        match self {
            ReportBlock::StatisticsSummary(b) => b.marshal_to(buf),
            ReportBlock::VoipMetrics(b) => b.marshal_to(buf),
            ReportBlock::Unknown(header, body) => {
                if buf.len() < XR_BLOCK_HEADER_LENGTH + body.len() {
                    return Err(Error::ErrBufferShort);
                }
                let off = header.marshal_to(buf)?;
                let mut rest = &mut buf[off..];
                rest.put_slice(body);
                Ok(off + body.len())
            }
        }
    }

    fn unmarshal<B: Buf>(raw_packet: &mut B) -> Result<Self> {
        let raw = raw_packet.copy_to_bytes(raw_packet.remaining());
        let mut peek = raw.clone();
        let header = XrBlockHeader::unmarshal(&mut peek)?;
        let total = XR_BLOCK_HEADER_LENGTH + header.block_length as usize * 4;
        if raw.len() < total {
            return Err(Error::ErrXrBlockLength);
        }
        let mut block = raw.slice(..total);
        Ok(match header.block_type {
            BLOCK_TYPE_STATISTICS_SUMMARY => ReportBlock::StatisticsSummary(
                StatisticsSummaryReportBlock::unmarshal(&mut block)?,
            ),
            BLOCK_TYPE_VOIP_METRICS => {
                ReportBlock::VoipMetrics(VoipMetricsReportBlock::unmarshal(&mut block)?)
            }
            _ => {
                block.advance(XR_BLOCK_HEADER_LENGTH);
                ReportBlock::Unknown(header, block)
            }
        })
    }
}

/// An RTCP extended report (packet type 207), RFC 3611.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExtendedReport {
    pub sender_ssrc: u32,
    pub reports: Vec<ReportBlock>,
}

impl ExtendedReport {
    fn size(&self) -> usize {
        HEADER_LENGTH
            + XR_HEADER_LENGTH
            + self.reports.iter().map(|r| r.block_size()).sum::<usize>()
    }

    pub fn header(&self) -> Header {
        Header {
            padding: false,
            count: 0,
            packet_type: PacketType::ExtendedReport,
            length: ((self.size() / 4) - 1) as u16,
        }
    }
}

impl Packet for ExtendedReport {
    fn header(&self) -> Header {
        ExtendedReport::header(self)
    }

    fn destination_ssrc(&self) -> Vec<u32> {
        vec![self.sender_ssrc]
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
            .downcast_ref::<ExtendedReport>()
            .is_some_and(|a| self == a)
    }

    fn cloned(&self) -> Box<dyn Packet + Send + Sync> {
        Box::new(self.clone())
    }
}

impl MarshalSize for ExtendedReport {
    fn marshal_size(&self) -> usize {
        self.size()
    }
}

impl Marshal for ExtendedReport {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        let size = self.marshal_size();
        if buf.remaining_mut() < size {
            return Err(Error::ErrBufferShort);
        }

        let mut off = ExtendedReport::header(self).marshal_to(buf)?;
        let mut body = &mut buf[off..];
        body.put_u32(self.sender_ssrc);
        off += XR_HEADER_LENGTH;

        for report in &self.reports {
            off += report.marshal_to(&mut buf[off..])?;
        }

        Ok(size)
    }
}

impl Unmarshal for ExtendedReport {
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        let header = Header::unmarshal(raw_packet)?;
        if header.packet_type != PacketType::ExtendedReport {
            return Err(Error::ErrInvalidPacketType);
        }
        if raw_packet.remaining() < XR_HEADER_LENGTH {
            return Err(Error::ErrPacketTooShort);
        }

        let sender_ssrc = raw_packet.get_u32();

        let mut remaining = raw_packet.copy_to_bytes(raw_packet.remaining());
        let mut reports = vec![];
        while !remaining.is_empty() {
            let mut peek = remaining.clone();
            let block_header = XrBlockHeader::unmarshal(&mut peek)?;
            let total = XR_BLOCK_HEADER_LENGTH + block_header.block_length as usize * 4;
            if remaining.len() < total {
                return Err(Error::ErrXrBlockLength);
            }
            let mut block = remaining.slice(..total);
            remaining.advance(total);
            reports.push(ReportBlock::unmarshal(&mut block)?);
        }

        Ok(ExtendedReport {
            sender_ssrc,
            reports,
        })
    }
}
