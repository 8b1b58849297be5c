use bytes::{Buf, BufMut};

use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

pub const RECEPTION_REPORT_LENGTH: usize = 24;
pub const FRACTION_LOST_OFFSET: usize = 4;
pub const TOTAL_LOST_OFFSET: usize = 5;
pub const LAST_SEQ_OFFSET: usize = 8;
pub const JITTER_OFFSET: usize = 12;
pub const LAST_SR_OFFSET: usize = 16;
pub const DELAY_OFFSET: usize = 20;

/// One reception report block as carried in SR and RR packets.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct ReceptionReport {
    /// The SSRC of the source this report is about.
    pub ssrc: u32,
    /// Fraction of packets lost since the previous report, in 1/256 units.
    pub fraction_lost: u8,
    /// Cumulative packets lost, clamped to 24 bits.
    pub total_lost: u32,
    /// Cycle count in the upper 16 bits, highest sequence received below.
    pub last_sequence_number: u32,
    /// Interarrival jitter per RFC 3550 A.8, in timestamp units.
    pub jitter: u32,
    /// Middle 32 bits of the NTP timestamp of the last received SR.
    pub last_sender_report: u32,
    /// Delay since that SR, in 1/65536 second units.
    pub delay: u32,
}

impl MarshalSize for ReceptionReport {
    fn marshal_size(&self) -> usize {
        RECEPTION_REPORT_LENGTH
    }
}

impl Marshal for ReceptionReport {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        if buf.remaining_mut() < RECEPTION_REPORT_LENGTH {
            return Err(Error::ErrBufferShort);
        }
        if self.total_lost >= (1 << 25) {
            return Err(Error::ErrInvalidTotalLost);
        }

        buf.put_u32(self.ssrc);
        buf.put_u8(self.fraction_lost);
        buf.put_u8((self.total_lost >> 16) as u8);
        buf.put_u8((self.total_lost >> 8) as u8);
        buf.put_u8(self.total_lost as u8);
        buf.put_u32(self.last_sequence_number);
        buf.put_u32(self.jitter);
        buf.put_u32(self.last_sender_report);
        buf.put_u32(self.delay);

        Ok(RECEPTION_REPORT_LENGTH)
    }
}

impl Unmarshal for ReceptionReport {
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        if raw_packet.remaining() < RECEPTION_REPORT_LENGTH {
            return Err(Error::ErrPacketTooShort);
        }

        let ssrc = raw_packet.get_u32();
        let fraction_lost = raw_packet.get_u8();
        let total_lost = {
            let b0 = raw_packet.get_u8() as u32;
            let b1 = raw_packet.get_u8() as u32;
            let b2 = raw_packet.get_u8() as u32;
            (b0 << 16) | (b1 << 8) | b2
        };
        let last_sequence_number = raw_packet.get_u32();
        let jitter = raw_packet.get_u32();
        let last_sender_report = raw_packet.get_u32();
        let delay = raw_packet.get_u32();

        Ok(ReceptionReport {
            ssrc,
            fraction_lost,
            total_lost,
            last_sequence_number,
            jitter,
            last_sender_report,
            delay,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reception_report_round_trip() {
        let rr = ReceptionReport {
            ssrc: 0xbc5e9a40,
            fraction_lost: 10,
            total_lost: 100,
            last_sequence_number: 0x00010203,
            jitter: 273,
            last_sender_report: 0x09f36432,
            delay: 150137,
        };
        let raw = rr.marshal().unwrap();
        assert_eq!(raw.len(), RECEPTION_REPORT_LENGTH);
        let mut buf = raw.clone();
        assert_eq!(ReceptionReport::unmarshal(&mut buf).unwrap(), rr);
    }

    #[test]
    fn test_total_lost_limit() {
        let rr = ReceptionReport {
            total_lost: 1 << 25,
            ..Default::default()
        };
        assert_eq!(rr.marshal(), Err(Error::ErrInvalidTotalLost));
    }
}
