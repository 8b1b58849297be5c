use bytes::{Buf, Bytes};

use shared::error::{Error, Result};

use crate::header::PacketType;
use crate::packet::{self, Packet};
use crate::source_description::{SdesType, SourceDescription};

/// A validated RTCP compound packet.
///
/// RFC 3550 requires every compound to open with an SR or RR and to carry a
/// CNAME item so receivers can correlate SSRCs across streams.
#[derive(Debug, Default, Clone)]
pub struct CompoundPacket(pub Vec<Box<dyn Packet + Send + Sync>>);

impl CompoundPacket {
    /// Checks the compound structure rules.
    pub fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(Error::ErrBadFirstPacket);
        }

        match self.0[0].header().packet_type {
            PacketType::SenderReport | PacketType::ReceiverReport => {}
            _ => return Err(Error::ErrBadFirstPacket),
        }

        let has_cname = self.0.iter().any(|p| {
            p.as_any()
                .downcast_ref::<SourceDescription>()
                .map(|sdes| {
                    sdes.chunks
                        .iter()
                        .flat_map(|c| c.items.iter())
                        .any(|i| i.sdes_type == SdesType::SdesCname)
                })
                .unwrap_or(false)
        });
        if !has_cname {
            return Err(Error::ErrMissingCname);
        }

        Ok(())
    }

    /// Serialises all sub-packets back to back.
    pub fn marshal(&self) -> Result<Bytes> {
        packet::marshal(&self.0)
    }

    /// Parses and structure-checks a compound datagram.
    pub fn unmarshal<B: Buf>(raw: &mut B) -> Result<Self> {
        let packets = packet::unmarshal(raw)?;
        let compound = CompoundPacket(packets);
        compound.validate()?;
        Ok(compound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::goodbye::Goodbye;
    use crate::receiver_report::ReceiverReport;

    fn rr() -> Box<dyn Packet + Send + Sync> {
        Box::new(ReceiverReport {
            ssrc: 0x902f9e2e,
            ..Default::default()
        })
    }

    fn cname() -> Box<dyn Packet + Send + Sync> {
        Box::new(SourceDescription::with_cname(0x902f9e2e, "cname@host"))
    }

    #[test]
    fn test_valid_compound() {
        let compound = CompoundPacket(vec![rr(), cname()]);
        assert!(compound.validate().is_ok());

        let raw = compound.marshal().unwrap();
        let mut buf = raw.clone();
        let parsed = CompoundPacket::unmarshal(&mut buf).unwrap();
        assert_eq!(parsed.0.len(), 2);
    }

    #[test]
    fn test_rejects_bad_first_packet() {
        let bye: Box<dyn Packet + Send + Sync> = Box::new(Goodbye {
            sources: vec![1],
            ..Default::default()
        });
        let compound = CompoundPacket(vec![bye, cname()]);
        assert_eq!(compound.validate(), Err(Error::ErrBadFirstPacket));

        // and the same through the wire parser
        let compound = CompoundPacket(vec![
            Box::new(Goodbye {
                sources: vec![1],
                ..Default::default()
            }),
            cname(),
        ]);
        let raw = compound.marshal().unwrap();
        let mut buf = raw.clone();
        assert_eq!(
            CompoundPacket::unmarshal(&mut buf).err(),
            Some(Error::ErrBadFirstPacket)
        );
    }

    #[test]
    fn test_rejects_missing_cname() {
        let compound = CompoundPacket(vec![rr()]);
        assert_eq!(compound.validate(), Err(Error::ErrMissingCname));
    }
}
