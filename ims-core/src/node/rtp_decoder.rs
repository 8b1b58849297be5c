use std::any::Any;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rtp::extension::CvoExtension;
use rtp::packet::Packet;
use shared::error::Result;
use shared::marshal::Unmarshal;

use crate::config::{MediaConfig, MediaType, TextCodec};
use crate::event::{InactivityCause, SessionCallback, SessionEvent};
use crate::node::{DataEntry, DataQueue, Node, NodeId, NodeState, SubType};
use crate::quality::{MediaQualityAnalyzer, PacketRecord, StreamUsage};
use crate::stats::RtpSessionStats;
use crate::utils::now_ms;

/// Parses inbound RTP datagrams, tracks the sending SSRC, and forwards
/// payload entries tagged for the payload decoder. Malformed datagrams are
/// counted and dropped, never raised.
pub struct RtpDecoderNode {
    state: NodeState,
    queue: DataQueue,
    callback: SessionCallback,
    config: Option<MediaConfig>,
    media: MediaType,
    stats: Arc<RtpSessionStats>,
    analyzer: Option<Arc<Mutex<MediaQualityAnalyzer>>>,

    sampling_khz: u32,
    rx_payload_type: u8,
    dtmf_payload_type: u8,
    red_payload_type: u8,
    red_enabled: bool,
    cvo_enabled: bool,

    receiving_ssrc: u32,
    received_first: bool,
    parse_errors: u32,

    inactivity_time_sec: u32,
    no_rtp_seconds: u32,
}

impl RtpDecoderNode {
    pub fn new(media: MediaType, callback: SessionCallback, stats: Arc<RtpSessionStats>) -> Self {
        Self {
            state: NodeState::Stopped,
            queue: DataQueue::new(),
            callback,
            config: None,
            media,
            stats,
            analyzer: None,
            sampling_khz: 0,
            rx_payload_type: 0,
            dtmf_payload_type: 0,
            red_payload_type: 0,
            red_enabled: false,
            cvo_enabled: false,
            receiving_ssrc: 0,
            received_first: false,
            parse_errors: 0,
            inactivity_time_sec: 0,
            no_rtp_seconds: 0,
        }
    }

    pub fn set_analyzer(&mut self, analyzer: Arc<Mutex<MediaQualityAnalyzer>>) {
        self.analyzer = Some(analyzer);
    }

    /// Seconds of RTP silence after which `MediaInactivity` fires; zero
    /// disables the check.
    pub fn set_inactivity_timer_sec(&mut self, seconds: u32) {
        self.inactivity_time_sec = seconds;
        self.no_rtp_seconds = 0;
    }

    pub fn parse_errors(&self) -> u32 {
        self.parse_errors
    }

    fn classify(&self, packet: &Packet) -> (SubType, SubType) {
        let pt = packet.header.payload_type;
        let mut data_type = SubType::Undefined;

        let subtype = match self.media {
            MediaType::Audio => {
                if pt == self.dtmf_payload_type {
                    SubType::DtmfPayload
                } else {
                    SubType::RtpPayload
                }
            }
            MediaType::Video => {
                if self.cvo_enabled && packet.header.extension {
                    let ext = &packet.header.extension_payload;
                    if ext.len() >= 2 {
                        let cvo = CvoExtension::from_u16(u16::from_be_bytes([ext[0], ext[1]]));
                        data_type = match cvo.rotation {
                            rtp::extension::CvoRotation::Rot90 => SubType::RawDataRot90,
                            rtp::extension::CvoRotation::Rot180 => SubType::RawDataRot180,
                            rtp::extension::CvoRotation::Rot270 => SubType::RawDataRot270,
                            rtp::extension::CvoRotation::Rot0 => SubType::RawData,
                        };
                    }
                }
                SubType::RtpPayload
            }
            MediaType::Text => {
                if pt == self.rx_payload_type {
                    if self.red_enabled {
                        SubType::BitstreamT140Red
                    } else {
                        SubType::BitstreamT140
                    }
                } else if pt == self.red_payload_type {
                    SubType::BitstreamT140
                } else {
                    log::debug!("text payload with unknown payload type [{pt}]");
                    SubType::RtpPayload
                }
            }
        };
        (subtype, data_type)
    }
}

impl Node for RtpDecoderNode {
    fn id(&self) -> NodeId {
        NodeId::RtpDecoder
    }

    fn media(&self) -> MediaType {
        self.media
    }

    fn state(&self) -> NodeState {
        self.state
    }

    fn start(&mut self) -> Result<()> {
        self.receiving_ssrc = 0;
        self.received_first = false;
        self.no_rtp_seconds = 0;
        self.state = NodeState::Running;
        Ok(())
    }

    fn stop(&mut self) {
        self.receiving_ssrc = 0;
        self.state = NodeState::Stopped;
    }

    fn is_runtime(&self) -> bool {
        true
    }

    fn set_config(&mut self, config: &MediaConfig) {
        self.config = Some(config.clone());
        match config {
            MediaConfig::Audio(c) => {
                self.sampling_khz = c.sampling_rate_khz;
                self.rx_payload_type = c.rx_payload_type;
                self.dtmf_payload_type = c.dtmf_payload_type;
            }
            MediaConfig::Video(c) => {
                self.sampling_khz = c.sampling_rate_khz;
                self.rx_payload_type = c.rx_payload_type;
                self.cvo_enabled = c.cvo_extension_id != 0;
            }
            MediaConfig::Text(c) => {
                self.sampling_khz = 1;
                self.rx_payload_type = c.rx_payload_type;
                self.red_payload_type = c.redundant_payload_type;
                self.red_enabled = c.codec == TextCodec::T140Red && c.redundant_level > 0;
            }
        }
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
        let packet = match Packet::unmarshal(&mut buf) {
            Ok(p) => p,
            Err(e) => {
                self.parse_errors += 1;
                log::warn!(
                    "dropping malformed rtp datagram [{e}], dropped so far [{}]",
                    self.parse_errors
                );
                return vec![];
            }
        };

        let arrival = now_ms();
        self.stats.on_rx_packet(
            Instant::now(),
            packet.header.ssrc,
            packet.header.sequence_number,
            packet.header.timestamp,
        );

        let mut out = vec![];

        if !self.received_first {
            self.received_first = true;
            if let Some(config) = self.config.clone() {
                self.callback.send_event(SessionEvent::FirstMediaPacketReceived {
                    config: Box::new(config),
                });
            }
        }

        if self.receiving_ssrc != packet.header.ssrc {
            if self.receiving_ssrc != 0 {
                log::debug!(
                    "SSRC changed [{:#x}] -> [{:#x}]",
                    self.receiving_ssrc,
                    packet.header.ssrc
                );
            }
            let refresh_needed = self.receiving_ssrc != 0;
            self.receiving_ssrc = packet.header.ssrc;
            if refresh_needed {
                out.push(DataEntry {
                    subtype: SubType::Refreshed,
                    ..Default::default()
                });
            }
        }

        if packet.header.extension && self.media == MediaType::Audio {
            self.callback.send_event(SessionEvent::RtpHeaderExtensionReceived {
                extension: packet.header.extension_payload.to_vec(),
            });
        }

        // audio and text run on millisecond timestamps downstream
        let timestamp = if self.media != MediaType::Video && self.sampling_khz != 0 {
            packet.header.timestamp / self.sampling_khz
        } else {
            packet.header.timestamp
        };

        if let Some(analyzer) = &self.analyzer {
            let mut analyzer = analyzer.lock().unwrap();
            analyzer.set_remote_ssrc(packet.header.ssrc);
            analyzer.collect_info(
                StreamUsage::Rx,
                PacketRecord {
                    seq: packet.header.sequence_number,
                    timestamp,
                    size: packet.payload.len(),
                    arrival,
                    jitter_ms: if self.sampling_khz > 0 {
                        self.stats.rx_jitter() / self.sampling_khz
                    } else {
                        self.stats.rx_jitter()
                    },
                },
            );
        }

        let (subtype, data_type) = self.classify(&packet);
        out.push(DataEntry {
            subtype,
            data: packet.payload,
            timestamp,
            mark: packet.header.marker,
            seq: packet.header.sequence_number,
            data_type,
            arrival_time: arrival,
            redundancy_left: 0,
        });
        out
    }

    fn runtime_period(&self) -> Option<Duration> {
        Some(Duration::from_secs(1))
    }

    /// One-second inactivity bookkeeping.
    fn poll_runtime(&mut self) -> Vec<DataEntry> {
        let received = self.stats.take_rtp_activity();
        if received == 0 {
            self.no_rtp_seconds += 1;
        } else {
            self.no_rtp_seconds = 0;
        }

        if self.inactivity_time_sec != 0 && self.no_rtp_seconds == self.inactivity_time_sec {
            self.callback.send_event(SessionEvent::MediaInactivity {
                cause: InactivityCause::Rtp,
                seconds: self.inactivity_time_sec,
            });
        }
        vec![]
    }

    fn as_any_mut(&mut self) -> &mut (dyn Any + 'static) {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AudioConfig;
    use bytes::Bytes;
    use rtp::header::Header;
    use shared::marshal::Marshal;
    use std::sync::mpsc::Receiver;

    fn decoder() -> (RtpDecoderNode, Receiver<SessionEvent>) {
        let (cb, rx) = SessionCallback::new();
        let stats = Arc::new(RtpSessionStats::new(8000));
        let mut node = RtpDecoderNode::new(MediaType::Audio, cb, stats);
        node.set_config(&MediaConfig::Audio(AudioConfig {
            sampling_rate_khz: 8,
            ..Default::default()
        }));
        node.start().unwrap();
        (node, rx)
    }

    fn datagram(ssrc: u32, seq: u16, ts: u32, payload: &'static [u8]) -> DataEntry {
        let packet = Packet {
            header: Header {
                version: 2,
                payload_type: 96,
                sequence_number: seq,
                timestamp: ts,
                ssrc,
                ..Default::default()
            },
            payload: Bytes::from_static(payload),
            padding_size: 0,
        };
        DataEntry::new(SubType::Undefined, packet.marshal().unwrap())
    }

    #[test]
    fn test_valid_packet_forwarded_once() {
        let (mut dec, rx) = decoder();
        let out = dec.consume(datagram(0xabc, 100, 1600, &[1, 2, 3]));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].seq, 100);
        // 1600 ticks at 8 kHz = 200 ms
        assert_eq!(out[0].timestamp, 200);
        assert_eq!(out[0].data, Bytes::from_static(&[1, 2, 3]));
        assert!(matches!(
            rx.try_recv(),
            Ok(SessionEvent::FirstMediaPacketReceived { .. })
        ));
    }

    #[test]
    fn test_malformed_dropped_and_counted() {
        let (mut dec, _rx) = decoder();
        let out = dec.consume(DataEntry::new(
            SubType::Undefined,
            Bytes::from_static(&[0x00, 0x01]),
        ));
        assert!(out.is_empty());
        assert_eq!(dec.parse_errors(), 1);
    }

    #[test]
    fn test_ssrc_change_emits_refresh() {
        let (mut dec, _rx) = decoder();
        dec.consume(datagram(0xaaa, 1, 0, &[1]));
        let out = dec.consume(datagram(0xbbb, 50, 0, &[2]));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].subtype, SubType::Refreshed);
        assert_eq!(out[1].seq, 50);
    }

    #[test]
    fn test_inactivity_event_fires_once() {
        let (mut dec, rx) = decoder();
        dec.set_inactivity_timer_sec(5);
        dec.consume(datagram(0xabc, 1, 0, &[1]));
        dec.poll_runtime(); // active second
        for _ in 0..10 {
            dec.poll_runtime();
        }
        let mut events = 0;
        while let Ok(ev) = rx.try_recv() {
            if matches!(
                ev,
                SessionEvent::MediaInactivity {
                    cause: InactivityCause::Rtp,
                    seconds: 5
                }
            ) {
                events += 1;
            }
        }
        assert_eq!(events, 1);
    }

    #[test]
    fn test_dtmf_payload_classified() {
        let (mut dec, _rx) = decoder();
        let packet = Packet {
            header: Header {
                version: 2,
                payload_type: 100,
                sequence_number: 9,
                timestamp: 0,
                ssrc: 7,
                ..Default::default()
            },
            payload: Bytes::from_static(&[0x05, 0x8a, 0x01, 0x40]),
            padding_size: 0,
        };
        let out = dec.consume(DataEntry::new(SubType::Undefined, packet.marshal().unwrap()));
        assert_eq!(out[0].subtype, SubType::DtmfPayload);
    }
}
