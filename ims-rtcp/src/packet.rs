use std::any::Any;
use std::fmt;

use bytes::{Buf, Bytes, BytesMut};

use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::app::ApplicationDefined;
use crate::extended_report::ExtendedReport;
use crate::goodbye::Goodbye;
use crate::header::{
    FORMAT_FIR, FORMAT_PLI, FORMAT_TLN, Header, PacketType,
};
use crate::payload_feedbacks::full_intra_request::FullIntraRequest;
use crate::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use crate::raw_packet::RawPacket;
use crate::receiver_report::ReceiverReport;
use crate::sender_report::SenderReport;
use crate::source_description::SourceDescription;
use crate::transport_feedbacks::transport_layer_nack::TransportLayerNack;

/// One RTCP sub-packet inside a compound datagram.
pub trait Packet: Marshal + fmt::Debug {
    fn header(&self) -> Header;
    fn destination_ssrc(&self) -> Vec<u32>;
    fn raw_size(&self) -> usize;
    fn as_any(&self) -> &(dyn Any + Send + Sync);
    fn equal(&self, other: &(dyn Packet + Send + Sync)) -> bool;
    fn cloned(&self) -> Box<dyn Packet + Send + Sync>;
}

impl PartialEq for dyn Packet + Send + Sync {
    fn eq(&self, other: &Self) -> bool {
        self.equal(other)
    }
}

impl Clone for Box<dyn Packet + Send + Sync> {
    fn clone(&self) -> Self {
        self.cloned()
    }
}

/// Parses a datagram into its sub-packets, reading headers until the buffer
/// is exhausted.
pub fn unmarshal<B>(raw_data: &mut B) -> Result<Vec<Box<dyn Packet + Send + Sync>>>
where
    B: Buf,
{
    let mut packets = vec![];
    let mut raw = raw_data.copy_to_bytes(raw_data.remaining());

    while !raw.is_empty() {
        let mut peek = raw.clone();
        let header = Header::unmarshal(&mut peek)?;
        let total = (header.length as usize + 1) * 4;
        if raw.len() < total {
            return Err(Error::ErrPacketTooShort);
        }

        let mut in_packet = raw.slice(..total);
        raw = raw.slice(total..);

        let packet: Box<dyn Packet + Send + Sync> = match header.packet_type {
            PacketType::SenderReport => Box::new(SenderReport::unmarshal(&mut in_packet)?),
            PacketType::ReceiverReport => Box::new(ReceiverReport::unmarshal(&mut in_packet)?),
            PacketType::SourceDescription => {
                Box::new(SourceDescription::unmarshal(&mut in_packet)?)
            }
            PacketType::Goodbye => Box::new(Goodbye::unmarshal(&mut in_packet)?),
            PacketType::ApplicationDefined => {
                Box::new(ApplicationDefined::unmarshal(&mut in_packet)?)
            }
            PacketType::TransportSpecificFeedback => match header.count {
                FORMAT_TLN => Box::new(TransportLayerNack::unmarshal(&mut in_packet)?),
                _ => Box::new(RawPacket::unmarshal(&mut in_packet)?),
            },
            PacketType::PayloadSpecificFeedback => match header.count {
                FORMAT_PLI => Box::new(PictureLossIndication::unmarshal(&mut in_packet)?),
                FORMAT_FIR => Box::new(FullIntraRequest::unmarshal(&mut in_packet)?),
                _ => Box::new(RawPacket::unmarshal(&mut in_packet)?),
            },
            PacketType::ExtendedReport => Box::new(ExtendedReport::unmarshal(&mut in_packet)?),
            PacketType::Unsupported => Box::new(RawPacket::unmarshal(&mut in_packet)?),
        };
        packets.push(packet);
    }

    if packets.is_empty() {
        Err(Error::ErrInvalidHeaderLength)
    } else {
        Ok(packets)
    }
}

/// Concatenates sub-packets into one compound datagram.
pub fn marshal(packets: &[Box<dyn Packet + Send + Sync>]) -> Result<Bytes> {
    let mut out = BytesMut::new();
    for packet in packets {
        let data = packet.marshal()?;
        out.extend_from_slice(&data);
    }
    Ok(out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmarshal_empty_errors() {
        let mut empty = Bytes::new();
        assert!(unmarshal(&mut empty).is_err());
    }

    #[test]
    fn test_unmarshal_truncated_errors() {
        // claims length 4 words but only header present
        let mut buf = Bytes::from_static(&[0x81, 0xc9, 0x00, 0x04]);
        assert_eq!(unmarshal(&mut buf), Err(Error::ErrPacketTooShort));
    }

    #[test]
    fn test_unmarshal_multiple() {
        // RR (no reports) followed by PLI
        let mut buf = Bytes::from_static(&[
            // ReceiverReport len=1
            0x80, 0xc9, 0x00, 0x01, 0x90, 0x2f, 0x9e, 0x2e,
            // PictureLossIndication len=2
            0x81, 0xce, 0x00, 0x02, 0x90, 0x2f, 0x9e, 0x2e, 0x90, 0x2f, 0x9e, 0x30,
        ]);
        let packets = unmarshal(&mut buf).unwrap();
        assert_eq!(packets.len(), 2);
        assert!(
            packets[0]
                .as_any()
                .downcast_ref::<ReceiverReport>()
                .is_some()
        );
        assert!(
            packets[1]
                .as_any()
                .downcast_ref::<PictureLossIndication>()
                .is_some()
        );
    }
}
