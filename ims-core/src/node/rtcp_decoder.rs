use std::any::Any;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rtcp::header::PacketType;
use rtcp::packet::Packet as _;
use rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use rtcp::receiver_report::ReceiverReport;
use rtcp::sender_report::SenderReport;
use rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;
use shared::error::Result;

use crate::config::{MediaConfig, MediaType};
use crate::event::{InactivityCause, SessionCallback, SessionEvent};
use crate::node::{DataEntry, DataQueue, Node, NodeId, NodeState};
use crate::quality::{MediaQualityAnalyzer, OptionalInfo};
use crate::stats::RtpSessionStats;

/// Sequence numbers the peer reported missing, waiting for the session to
/// trigger retransmission on the Tx graph.
#[derive(Debug, Default)]
pub struct FeedbackRequests {
    pub nacked: Vec<u16>,
    pub idr_requested: bool,
}

/// Parses inbound compound RTCP, updates reception statistics, reacts to
/// feedback, and raises RTCP inactivity.
pub struct RtcpDecoderNode {
    state: NodeState,
    queue: DataQueue,
    callback: SessionCallback,
    config: Option<MediaConfig>,
    media: MediaType,
    stats: Arc<RtpSessionStats>,
    analyzer: Option<Arc<Mutex<MediaQualityAnalyzer>>>,

    parse_errors: u32,
    inactivity_time_sec: u32,
    no_rtcp_seconds: u32,
    feedback: FeedbackRequests,
}

impl RtcpDecoderNode {
    pub fn new(media: MediaType, callback: SessionCallback, stats: Arc<RtpSessionStats>) -> Self {
        Self {
            state: NodeState::Stopped,
            queue: DataQueue::new(),
            callback,
            config: None,
            media,
            stats,
            analyzer: None,
            parse_errors: 0,
            inactivity_time_sec: 0,
            no_rtcp_seconds: 0,
            feedback: FeedbackRequests::default(),
        }
    }

    pub fn set_analyzer(&mut self, analyzer: Arc<Mutex<MediaQualityAnalyzer>>) {
        self.analyzer = Some(analyzer);
    }

    pub fn set_inactivity_timer_sec(&mut self, seconds: u32) {
        self.inactivity_time_sec = seconds;
        self.no_rtcp_seconds = 0;
    }

    pub fn parse_errors(&self) -> u32 {
        self.parse_errors
    }

    /// Feedback collected from the peer since the last call.
    pub fn take_feedback(&mut self) -> FeedbackRequests {
        std::mem::take(&mut self.feedback)
    }

    fn handle_sender_report(&mut self, now: Instant, sr: &SenderReport) {
        self.stats.on_rx_sender_report(now, sr.ntp_time);

        if let Some(analyzer) = &self.analyzer {
            let mut analyzer = analyzer.lock().unwrap();
            analyzer.set_remote_ssrc(sr.ssrc);

            // round trip from a report block about our own stream:
            // now_mid32 - LSR - DLSR, all in 1/65536 s
            for block in &sr.reports {
                if block.ssrc == self.stats.local_ssrc() && block.delay > 0 {
                    let now_mid = self.stats.clock.ntp_mid32(now);
                    let rtt_units = now_mid
                        .wrapping_sub(block.last_sender_report)
                        .wrapping_sub(block.delay);
                    let rtt_ms = (u64::from(rtt_units) * 1000 / 65536) as u32;
                    analyzer.collect_optional_info(OptionalInfo::RoundTripDelay, 0, rtt_ms);
                }
            }
        }
    }

    fn handle_receiver_report(&mut self, now: Instant, rr: &ReceiverReport) {
        self.stats.on_rx_receiver_report();

        if let Some(analyzer) = &self.analyzer {
            let mut analyzer = analyzer.lock().unwrap();
            for block in &rr.reports {
                if block.ssrc == self.stats.local_ssrc() && block.delay > 0 {
                    let now_mid = self.stats.clock.ntp_mid32(now);
                    let rtt_units = now_mid
                        .wrapping_sub(block.last_sender_report)
                        .wrapping_sub(block.delay);
                    let rtt_ms = (u64::from(rtt_units) * 1000 / 65536) as u32;
                    analyzer.collect_optional_info(OptionalInfo::RoundTripDelay, 0, rtt_ms);
                }
            }
        }
    }
}

impl Node for RtcpDecoderNode {
    fn id(&self) -> NodeId {
        NodeId::RtcpDecoder
    }

    fn media(&self) -> MediaType {
        self.media
    }

    fn state(&self) -> NodeState {
        self.state
    }

    fn start(&mut self) -> Result<()> {
        self.no_rtcp_seconds = 0;
        self.state = NodeState::Running;
        Ok(())
    }

    fn stop(&mut self) {
        self.state = NodeState::Stopped;
    }

    fn is_runtime(&self) -> bool {
        true
    }

    fn set_config(&mut self, config: &MediaConfig) {
        self.config = Some(config.clone());
    }

    fn is_same_config(&self, config: &MediaConfig) -> bool {
        self.config.as_ref() == Some(config)
    }

    fn queue(&self) -> &DataQueue {
        &self.queue
    }

    fn consume(&mut self, entry: DataEntry) -> Vec<DataEntry> {
        if self.state != NodeState::Running {
            return vec![];
        }

        let mut buf = entry.data.clone();
        let packets = match rtcp::packet::unmarshal(&mut buf) {
            Ok(p) => p,
            Err(e) => {
                self.parse_errors += 1;
                log::warn!(
                    "dropping malformed rtcp datagram [{e}], dropped so far [{}]",
                    self.parse_errors
                );
                return vec![];
            }
        };

        // compound structure rule: an SR or RR leads
        match packets[0].header().packet_type {
            PacketType::SenderReport | PacketType::ReceiverReport => {}
            other => {
                self.parse_errors += 1;
                log::warn!("compound packet led by [{other}], dropped");
                return vec![];
            }
        }

        let now = Instant::now();
        for packet in &packets {
            let any = packet.as_any();
            if let Some(sr) = any.downcast_ref::<SenderReport>() {
                self.handle_sender_report(now, sr);
            } else if let Some(rr) = any.downcast_ref::<ReceiverReport>() {
                self.handle_receiver_report(now, rr);
            } else if let Some(nack) = any.downcast_ref::<TransportLayerNack>() {
                for pair in &nack.nacks {
                    self.feedback.nacked.extend(pair.packet_list());
                }
            } else if any.downcast_ref::<PictureLossIndication>().is_some()
                || any.downcast_ref::<FullIntraRequest>().is_some()
            {
                self.feedback.idr_requested = true;
                self.callback.send_event(SessionEvent::IdrRequested);
            }
        }

        vec![]
    }

    fn runtime_period(&self) -> Option<Duration> {
        Some(Duration::from_secs(1))
    }

    fn poll_runtime(&mut self) -> Vec<DataEntry> {
        let received = self.stats.take_rtcp_activity();
        if received == 0 {
            self.no_rtcp_seconds += 1;
        } else {
            self.no_rtcp_seconds = 0;
        }

        if self.inactivity_time_sec != 0 && self.no_rtcp_seconds == self.inactivity_time_sec {
            self.callback.send_event(SessionEvent::MediaInactivity {
                cause: InactivityCause::Rtcp,
                seconds: self.inactivity_time_sec,
            });
        }
        vec![]
    }

    fn as_any_mut(&mut self) -> &mut (dyn Any + 'static) {
        self
    }
}
