use bytes::{Buf, BufMut};

use shared::error::{Error, Result};

use crate::extended_report::{
    BLOCK_TYPE_STATISTICS_SUMMARY, XR_BLOCK_HEADER_LENGTH, XrBlockHeader,
};

pub const STATISTICS_SUMMARY_BLOCK_LENGTH: usize = 36;

/// Statistics summary report block: loss, duplicate, jitter and TTL
/// aggregates over a sequence range (RFC 3611 layout).
///
/// The type-specific byte carries the loss/duplicate/jitter/TTL validity
/// flags; all four are set by this encoder.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct StatisticsSummaryReportBlock {
    pub ssrc: u32,
    pub begin_seq: u16,
    pub end_seq: u16,
    pub lost_packets: u32,
    pub dup_packets: u32,
    /// Jitter aggregates in RTP timestamp units.
    pub min_jitter: u32,
    pub max_jitter: u32,
    pub mean_jitter: u32,
    pub dev_jitter: u32,
    pub min_ttl: u8,
    pub max_ttl: u8,
    pub mean_ttl: u8,
    pub dev_ttl: u8,
}

pub const TYPE_SPECIFIC_ALL_FLAGS: u8 = 0b1111_0000;

impl StatisticsSummaryReportBlock {
    pub fn block_size(&self) -> usize {
        XR_BLOCK_HEADER_LENGTH + STATISTICS_SUMMARY_BLOCK_LENGTH
    }

    pub fn block_header(&self) -> XrBlockHeader {
        XrBlockHeader {
            block_type: BLOCK_TYPE_STATISTICS_SUMMARY,
            type_specific: TYPE_SPECIFIC_ALL_FLAGS,
            block_length: (STATISTICS_SUMMARY_BLOCK_LENGTH / 4) as u16,
        }
    }

    pub fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < self.block_size() {
            return Err(Error::ErrBufferShort);
        }

        let off = self.block_header().marshal_to(buf)?;
        let mut b = &mut buf[off..];
        b.put_u32(self.ssrc);
        b.put_u16(self.begin_seq);
        b.put_u16(self.end_seq);
        b.put_u32(self.lost_packets);
        b.put_u32(self.dup_packets);
        b.put_u32(self.min_jitter);
        b.put_u32(self.max_jitter);
        b.put_u32(self.mean_jitter);
        b.put_u32(self.dev_jitter);
        b.put_u8(self.min_ttl);
        b.put_u8(self.max_ttl);
        b.put_u8(self.mean_ttl);
        b.put_u8(self.dev_ttl);

        Ok(self.block_size())
    }

    pub fn unmarshal<B: Buf>(raw_packet: &mut B) -> Result<Self> {
        let header = XrBlockHeader::unmarshal(raw_packet)?;
        if header.block_type != BLOCK_TYPE_STATISTICS_SUMMARY {
            return Err(Error::ErrInvalidPacketType);
        }
        if raw_packet.remaining() < STATISTICS_SUMMARY_BLOCK_LENGTH {
            return Err(Error::ErrXrBlockLength);
        }

        Ok(StatisticsSummaryReportBlock {
            ssrc: raw_packet.get_u32(),
            begin_seq: raw_packet.get_u16(),
            end_seq: raw_packet.get_u16(),
            lost_packets: raw_packet.get_u32(),
            dup_packets: raw_packet.get_u32(),
            min_jitter: raw_packet.get_u32(),
            max_jitter: raw_packet.get_u32(),
            mean_jitter: raw_packet.get_u32(),
            dev_jitter: raw_packet.get_u32(),
            min_ttl: raw_packet.get_u8(),
            max_ttl: raw_packet.get_u8(),
            mean_ttl: raw_packet.get_u8(),
            dev_ttl: raw_packet.get_u8(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statistics_summary_round_trip() {
        let block = StatisticsSummaryReportBlock {
            ssrc: 0xbc5e9a40,
            begin_seq: 10,
            end_seq: 1010,
            lost_packets: 12,
            dup_packets: 2,
            min_jitter: 1,
            max_jitter: 44,
            mean_jitter: 9,
            dev_jitter: 5,
            min_ttl: 61,
            max_ttl: 64,
            mean_ttl: 63,
            dev_ttl: 1,
        };
        let mut buf = vec![0u8; block.block_size()];
        let n = block.marshal_to(&mut buf).unwrap();
        assert_eq!(n, 40);
        assert_eq!(buf[0], BLOCK_TYPE_STATISTICS_SUMMARY);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 9);

        let mut raw = bytes::Bytes::from(buf);
        assert_eq!(
            StatisticsSummaryReportBlock::unmarshal(&mut raw).unwrap(),
            block
        );
    }
}
