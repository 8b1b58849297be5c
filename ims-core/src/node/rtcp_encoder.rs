use std::any::Any;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;

use rtcp::extended_report::ExtendedReport;
use rtcp::goodbye::Goodbye;
use rtcp::packet::{self, Packet as RtcpPacket};
use rtcp::payload_feedbacks::full_intra_request::{FirEntry, FullIntraRequest};
use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use rtcp::receiver_report::ReceiverReport;
use rtcp::sender_report::SenderReport;
use rtcp::source_description::SourceDescription;
use rtcp::transport_feedbacks::transport_layer_nack::{
    TransportLayerNack, nack_pairs_from_sequence_numbers,
};
use shared::error::{Error, Result};

use crate::config::{MediaConfig, MediaType, rtcp_fb};
use crate::event::SessionCallback;
use crate::node::{DataEntry, DataQueue, Node, NodeId, NodeState, SubType};
use crate::quality::MediaQualityAnalyzer;
use crate::stats::RtpSessionStats;

/// Emits compound RTCP on a one-second timer: SR or RR with reception
/// report blocks, SDES CNAME, optional XR blocks, and feedback packets.
pub struct RtcpEncoderNode {
    state: NodeState,
    queue: DataQueue,
    callback: SessionCallback,
    config: Option<MediaConfig>,
    media: MediaType,
    stats: Arc<RtpSessionStats>,
    analyzer: Option<Arc<Mutex<MediaQualityAnalyzer>>>,

    interval_sec: u32,
    xr_blocks: u32,
    fb_types: u32,
    canonical_name: String,

    seconds_since_report: u32,
    last_tx_packets: u32,
    bye_sent: bool,
    fir_sequence: u8,
}

impl RtcpEncoderNode {
    pub fn new(media: MediaType, callback: SessionCallback, stats: Arc<RtpSessionStats>) -> Self {
        Self {
            state: NodeState::Stopped,
            queue: DataQueue::new(),
            callback,
            config: None,
            media,
            stats,
            analyzer: None,
            interval_sec: 0,
            xr_blocks: 0,
            fb_types: 0,
            canonical_name: String::new(),
            seconds_since_report: 0,
            last_tx_packets: 0,
            bye_sent: false,
            fir_sequence: 0,
        }
    }

    pub fn set_analyzer(&mut self, analyzer: Arc<Mutex<MediaQualityAnalyzer>>) {
        self.analyzer = Some(analyzer);
    }

    fn sdes(&self) -> SourceDescription {
        SourceDescription::with_cname(self.stats.local_ssrc(), &self.canonical_name)
    }

    fn compose_report(&mut self, now: Instant) -> Vec<Box<dyn RtcpPacket + Send + Sync>> {
        let mut packets: Vec<Box<dyn RtcpPacket + Send + Sync>> = vec![];

        let reports = self
            .stats
            .generate_reception_report(now)
            .into_iter()
            .collect::<Vec<_>>();

        let (tx_packets, tx_octets, tx_rtp_ts) = self.stats.tx_totals();
        let sent_in_interval = tx_packets.wrapping_sub(self.last_tx_packets);
        self.last_tx_packets = tx_packets;

        if sent_in_interval > 0 {
            packets.push(Box::new(SenderReport {
                ssrc: self.stats.local_ssrc(),
                ntp_time: self.stats.clock.ntp(now),
                rtp_time: tx_rtp_ts,
                packet_count: tx_packets,
                octet_count: tx_octets,
                reports,
                profile_extensions: Bytes::new(),
            }));
        } else {
            packets.push(Box::new(ReceiverReport {
                ssrc: self.stats.local_ssrc(),
                reports,
                profile_extensions: Bytes::new(),
            }));
        }

        packets.push(Box::new(self.sdes()));

        if self.xr_blocks != 0 {
            if let Some(analyzer) = &self.analyzer {
                let blocks = analyzer
                    .lock()
                    .unwrap()
                    .get_rtcp_xr_report_blocks(self.xr_blocks);
                if let Some(blocks) = blocks {
                    packets.push(Box::new(ExtendedReport {
                        sender_ssrc: self.stats.local_ssrc(),
                        reports: blocks,
                    }));
                }
            }
        }

        packets
    }

    fn marshal_entry(
        packets: Vec<Box<dyn RtcpPacket + Send + Sync>>,
        subtype: SubType,
    ) -> Vec<DataEntry> {
        match packet::marshal(&packets) {
            Ok(data) => vec![DataEntry {
                subtype,
                data,
                ..Default::default()
            }],
            Err(e) => {
                log::error!("rtcp marshal failed: {e}");
                vec![]
            }
        }
    }

    /// Builds the leave packet sent once when the session closes.
    pub fn create_bye(&mut self, reason: &str) -> Vec<DataEntry> {
        if self.bye_sent {
            return vec![];
        }
        self.bye_sent = true;

        let now = Instant::now();
        let mut packets = self.compose_report(now);
        packets.push(Box::new(Goodbye {
            sources: vec![self.stats.local_ssrc()],
            reason: Bytes::copy_from_slice(reason.as_bytes()),
        }));
        Self::marshal_entry(packets, SubType::RtcpPacketBye)
    }

    /// Sends a generic NACK for the given missing sequence numbers.
    pub fn send_nack(&mut self, missing: &[u16]) -> Vec<DataEntry> {
        if missing.is_empty() || self.fb_types & rtcp_fb::NACK == 0 {
            return vec![];
        }
        let media_ssrc = self.stats.remote_ssrc().unwrap_or(0);
        let nack = TransportLayerNack {
            sender_ssrc: self.stats.local_ssrc(),
            media_ssrc,
            nacks: nack_pairs_from_sequence_numbers(missing),
        };
        let packets: Vec<Box<dyn RtcpPacket + Send + Sync>> = vec![
            Box::new(ReceiverReport {
                ssrc: self.stats.local_ssrc(),
                ..Default::default()
            }),
            Box::new(self.sdes()),
            Box::new(nack),
        ];
        Self::marshal_entry(packets, SubType::RtcpPacket)
    }

    /// Asks the peer for a new intra frame after unrecoverable video loss.
    pub fn send_picture_loss(&mut self) -> Vec<DataEntry> {
        if self.fb_types & rtcp_fb::PLI == 0 && self.fb_types & rtcp_fb::FIR == 0 {
            return vec![];
        }
        let media_ssrc = self.stats.remote_ssrc().unwrap_or(0);
        let mut packets: Vec<Box<dyn RtcpPacket + Send + Sync>> = vec![
            Box::new(ReceiverReport {
                ssrc: self.stats.local_ssrc(),
                ..Default::default()
            }),
            Box::new(self.sdes()),
        ];
        if self.fb_types & rtcp_fb::PLI != 0 {
            packets.push(Box::new(PictureLossIndication {
                sender_ssrc: self.stats.local_ssrc(),
                media_ssrc,
            }));
        }
        if self.fb_types & rtcp_fb::FIR != 0 {
            self.fir_sequence = self.fir_sequence.wrapping_add(1);
            packets.push(Box::new(FullIntraRequest {
                sender_ssrc: self.stats.local_ssrc(),
                media_ssrc,
                fir: vec![FirEntry {
                    ssrc: media_ssrc,
                    sequence_number: self.fir_sequence,
                }],
            }));
        }
        Self::marshal_entry(packets, SubType::RtcpPacket)
    }
}

impl Node for RtcpEncoderNode {
    fn id(&self) -> NodeId {
        NodeId::RtcpEncoder
    }

    fn media(&self) -> MediaType {
        self.media
    }

    fn state(&self) -> NodeState {
        self.state
    }

    fn start(&mut self) -> Result<()> {
        if self.config.is_none() {
            return Err(Error::ErrNotReady);
        }
        if self.canonical_name.is_empty() {
            return Err(Error::ErrInvalidParam);
        }
        self.seconds_since_report = 0;
        self.bye_sent = false;
        self.last_tx_packets = 0;
        self.state = NodeState::Running;
        Ok(())
    }

    fn stop(&mut self) {
        self.state = NodeState::Stopped;
    }

    fn is_runtime(&self) -> bool {
        true
    }

    fn is_source(&self) -> bool {
        true
    }

    fn set_config(&mut self, config: &MediaConfig) {
        self.config = Some(config.clone());
        let rtcp = &config.rtp().rtcp;
        self.interval_sec = rtcp.interval_sec;
        self.xr_blocks = rtcp.xr_blocks;
        self.fb_types = rtcp.fb_types;
        self.canonical_name = rtcp.canonical_name.clone();
    }

    fn is_same_config(&self, config: &MediaConfig) -> bool {
        self.config.as_ref() == Some(config)
    }

    fn queue(&self) -> &DataQueue {
        &self.queue
    }

    fn runtime_period(&self) -> Option<Duration> {
        Some(Duration::from_secs(1))
    }

    fn poll_runtime(&mut self) -> Vec<DataEntry> {
        if self.state != NodeState::Running || self.interval_sec == 0 {
            return vec![];
        }

        self.seconds_since_report += 1;
        if self.seconds_since_report < self.interval_sec {
            return vec![];
        }
        self.seconds_since_report = 0;

        let packets = self.compose_report(Instant::now());
        Self::marshal_entry(packets, SubType::RtcpPacket)
    }

    fn as_any_mut(&mut self) -> &mut (dyn Any + 'static) {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AudioConfig, RtcpConfig, VideoConfig};
    use rtcp::header::PacketType;

    fn audio_encoder(interval: u32) -> (RtcpEncoderNode, Arc<RtpSessionStats>) {
        let (cb, _rx) = SessionCallback::new();
        let stats = Arc::new(RtpSessionStats::new(16000));
        let mut node = RtcpEncoderNode::new(MediaType::Audio, cb, stats.clone());
        let mut config = AudioConfig::default();
        config.rtp.rtcp = RtcpConfig {
            canonical_name: "sender@host".to_string(),
            interval_sec: interval,
            ..Default::default()
        };
        node.set_config(&MediaConfig::Audio(config));
        node.start().unwrap();
        (node, stats)
    }

    #[test]
    fn test_no_report_before_interval() {
        let (mut node, _stats) = audio_encoder(5);
        for _ in 0..4 {
            assert!(node.poll_runtime().is_empty());
        }
        assert_eq!(node.poll_runtime().len(), 1);
    }

    #[test]
    fn test_sr_when_sending_rr_otherwise() {
        let (mut node, stats) = audio_encoder(1);
        // no tx activity: RR first
        let out = node.poll_runtime();
        let mut buf = out[0].data.clone();
        let packets = rtcp::packet::unmarshal(&mut buf).unwrap();
        assert_eq!(packets[0].header().packet_type, PacketType::ReceiverReport);
        assert_eq!(
            packets[1].header().packet_type,
            PacketType::SourceDescription
        );

        // with tx activity: SR, carrying totals
        for i in 0..50 {
            stats.on_tx_packet(i * 320, 32);
        }
        let out = node.poll_runtime();
        let mut buf = out[0].data.clone();
        let packets = rtcp::packet::unmarshal(&mut buf).unwrap();
        let sr = packets[0]
            .as_any()
            .downcast_ref::<SenderReport>()
            .expect("sender report");
        assert_eq!(sr.packet_count, 50);
        assert_eq!(sr.octet_count, 50 * 32);
    }

    #[test]
    fn test_bye_sent_once() {
        let (mut node, _stats) = audio_encoder(5);
        let bye = node.create_bye("closed");
        assert_eq!(bye.len(), 1);
        assert_eq!(bye[0].subtype, SubType::RtcpPacketBye);
        let mut buf = bye[0].data.clone();
        let packets = rtcp::packet::unmarshal(&mut buf).unwrap();
        assert!(
            packets
                .iter()
                .any(|p| p.header().packet_type == PacketType::Goodbye)
        );
        assert!(node.create_bye("again").is_empty());
    }

    #[test]
    fn test_disabled_interval_emits_nothing() {
        let (mut node, _stats) = audio_encoder(0);
        for _ in 0..10 {
            assert!(node.poll_runtime().is_empty());
        }
    }

    #[test]
    fn test_video_feedback_packets() {
        let (cb, _rx) = SessionCallback::new();
        let stats = Arc::new(RtpSessionStats::new(90000));
        let mut node = RtcpEncoderNode::new(MediaType::Video, cb, stats.clone());
        let mut config = VideoConfig::default();
        config.rtp.rtcp = RtcpConfig {
            canonical_name: "video@host".to_string(),
            interval_sec: 1,
            fb_types: rtcp_fb::NACK | rtcp_fb::PLI,
            ..Default::default()
        };
        node.set_config(&MediaConfig::Video(config));
        node.start().unwrap();

        stats.on_rx_packet(Instant::now(), 0x1234, 10, 0);

        let nack = node.send_nack(&[11, 12]);
        assert_eq!(nack.len(), 1);
        let mut buf = nack[0].data.clone();
        let packets = rtcp::packet::unmarshal(&mut buf).unwrap();
        let tln = packets
            .iter()
            .find_map(|p| p.as_any().downcast_ref::<TransportLayerNack>())
            .expect("nack present");
        assert_eq!(tln.media_ssrc, 0x1234);
        assert_eq!(tln.nacks[0].packet_id, 11);

        let pli = node.send_picture_loss();
        let mut buf = pli[0].data.clone();
        let packets = rtcp::packet::unmarshal(&mut buf).unwrap();
        assert!(
            packets
                .iter()
                .any(|p| p.as_any().downcast_ref::<PictureLossIndication>().is_some())
        );
    }
}
