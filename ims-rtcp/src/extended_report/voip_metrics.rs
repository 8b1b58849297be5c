use bytes::{Buf, BufMut};

use shared::error::{Error, Result};

use crate::extended_report::{BLOCK_TYPE_VOIP_METRICS, XR_BLOCK_HEADER_LENGTH, XrBlockHeader};

pub const VOIP_METRICS_BLOCK_LENGTH: usize = 32;

/// VoIP metrics report block (RFC 3611 section 4.7).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct VoipMetricsReportBlock {
    pub ssrc: u32,
    /// Fraction of packets lost, in 1/256 units.
    pub loss_rate: u8,
    /// Fraction of packets discarded by the jitter buffer, in 1/256 units.
    pub discard_rate: u8,
    pub burst_density: u8,
    pub gap_density: u8,
    /// Mean burst duration in milliseconds.
    pub burst_duration: u16,
    pub gap_duration: u16,
    /// Most recent round trip estimate in milliseconds.
    pub round_trip_delay: u16,
    pub end_system_delay: u16,
    /// Voice signal relative level, dBm (127 = unavailable).
    pub signal_level: u8,
    pub noise_level: u8,
    /// Residual echo return loss, dB (127 = unavailable).
    pub rerl: u8,
    /// Gap threshold in packets, typically 16.
    pub gmin: u8,
    pub r_factor: u8,
    pub ext_r_factor: u8,
    /// MOS-LQ scaled by ten (10..50, 127 = unavailable).
    pub mos_lq: u8,
    pub mos_cq: u8,
    /// PLC / jitter buffer adaptation configuration bits.
    pub rx_config: u8,
    /// Nominal jitter buffer delay in milliseconds.
    pub jb_nominal: u16,
    pub jb_maximum: u16,
    pub jb_abs_max: u16,
}

impl VoipMetricsReportBlock {
    pub fn block_size(&self) -> usize {
        XR_BLOCK_HEADER_LENGTH + VOIP_METRICS_BLOCK_LENGTH
    }

    pub fn block_header(&self) -> XrBlockHeader {
        XrBlockHeader {
            block_type: BLOCK_TYPE_VOIP_METRICS,
            type_specific: 0,
            block_length: (VOIP_METRICS_BLOCK_LENGTH / 4) as u16,
        }
    }

    pub fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < self.block_size() {
            return Err(Error::ErrBufferShort);
        }

        let off = self.block_header().marshal_to(buf)?;
        let mut b = &mut buf[off..];
        b.put_u32(self.ssrc);
        b.put_u8(self.loss_rate);
        b.put_u8(self.discard_rate);
        b.put_u8(self.burst_density);
        b.put_u8(self.gap_density);
        b.put_u16(self.burst_duration);
        b.put_u16(self.gap_duration);
        b.put_u16(self.round_trip_delay);
        b.put_u16(self.end_system_delay);
        b.put_u8(self.signal_level);
        b.put_u8(self.noise_level);
        b.put_u8(self.rerl);
        b.put_u8(self.gmin);
        b.put_u8(self.r_factor);
        b.put_u8(self.ext_r_factor);
        b.put_u8(self.mos_lq);
        b.put_u8(self.mos_cq);
        b.put_u8(self.rx_config);
        b.put_u8(0); // reserved
        b.put_u16(self.jb_nominal);
        b.put_u16(self.jb_maximum);
        b.put_u16(self.jb_abs_max);

        Ok(self.block_size())
    }

    pub fn unmarshal<B: Buf>(raw_packet: &mut B) -> Result<Self> {
        let header = XrBlockHeader::unmarshal(raw_packet)?;
        if header.block_type != BLOCK_TYPE_VOIP_METRICS {
            return Err(Error::ErrInvalidPacketType);
        }
        if raw_packet.remaining() < VOIP_METRICS_BLOCK_LENGTH {
            return Err(Error::ErrXrBlockLength);
        }

        let ssrc = raw_packet.get_u32();
        let loss_rate = raw_packet.get_u8();
        let discard_rate = raw_packet.get_u8();
        let burst_density = raw_packet.get_u8();
        let gap_density = raw_packet.get_u8();
        let burst_duration = raw_packet.get_u16();
        let gap_duration = raw_packet.get_u16();
        let round_trip_delay = raw_packet.get_u16();
        let end_system_delay = raw_packet.get_u16();
        let signal_level = raw_packet.get_u8();
        let noise_level = raw_packet.get_u8();
        let rerl = raw_packet.get_u8();
        let gmin = raw_packet.get_u8();
        let r_factor = raw_packet.get_u8();
        let ext_r_factor = raw_packet.get_u8();
        let mos_lq = raw_packet.get_u8();
        let mos_cq = raw_packet.get_u8();
        let rx_config = raw_packet.get_u8();
        let _reserved = raw_packet.get_u8();
        let jb_nominal = raw_packet.get_u16();
        let jb_maximum = raw_packet.get_u16();
        let jb_abs_max = raw_packet.get_u16();

        Ok(VoipMetricsReportBlock {
            ssrc,
            loss_rate,
            discard_rate,
            burst_density,
            gap_density,
            burst_duration,
            gap_duration,
            round_trip_delay,
            end_system_delay,
            signal_level,
            noise_level,
            rerl,
            gmin,
            r_factor,
            ext_r_factor,
            mos_lq,
            mos_cq,
            rx_config,
            jb_nominal,
            jb_maximum,
            jb_abs_max,
        })
    }
}
