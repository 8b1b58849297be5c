use std::any::Any;
use std::sync::Arc;

use bytes::Bytes;

use rtp::extension::{CvoExtension, CvoRotation};
use rtp::header::Header;
use rtp::packet::Packet;
use rtp::sequence::Sequencer;
use shared::error::{Error, Result};
use shared::marshal::Marshal;

use crate::config::{MediaConfig, MediaType, TextCodec};
use crate::event::SessionCallback;
use crate::node::{DataEntry, DataQueue, Node, NodeId, NodeState, SubType};
use crate::stats::RtpSessionStats;
use crate::utils::now_ms;

pub const AUDIO_FRAME_MS: u32 = 20;
/// Idle gap after which the next text packet carries the marker.
pub const TEXT_IDLE_MARKER_MS: u32 = 300;

/// Generic RTP header extension the host asked us to attach to the next
/// outbound packet.
#[derive(Debug, Clone, Default)]
pub struct PendingExtension {
    pub profile: u16,
    pub payload: Bytes,
}

/// Builds RTP packets out of framed payloads: timestamp derivation from
/// the wall clock, sequence numbering, marker placement, DTMF gating, and
/// CVO extension insertion for video.
pub struct RtpEncoderNode {
    state: NodeState,
    queue: DataQueue,
    callback: SessionCallback,
    config: Option<MediaConfig>,
    media: MediaType,
    stats: Arc<RtpSessionStats>,

    payload_type: u8,
    dtmf_payload_type: u8,
    red_payload_type: u8,
    red_enabled: bool,
    sampling_khz: u32,
    cvo_extension_id: u8,

    sequencer: Sequencer,
    rtp_timestamp: u32,
    prev_time_ms: u32,
    dtmf_mode: bool,
    dtmf_timestamp: u32,
    audio_mark: bool,
    last_text_time_ms: u32,
    pending_extension: Option<PendingExtension>,
    /// Recent packets kept for NACK-triggered retransmission.
    send_history: std::collections::VecDeque<DataEntry>,
}

/// Packets of send history retained for retransmission.
pub const SEND_HISTORY_SIZE: usize = 128;

impl RtpEncoderNode {
    pub fn new(media: MediaType, callback: SessionCallback, stats: Arc<RtpSessionStats>) -> Self {
        Self {
            state: NodeState::Stopped,
            queue: DataQueue::new(),
            callback,
            config: None,
            media,
            stats,
            payload_type: 0,
            dtmf_payload_type: 0,
            red_payload_type: 0,
            red_enabled: false,
            sampling_khz: 0,
            cvo_extension_id: 0,
            sequencer: Sequencer::default(),
            rtp_timestamp: 0,
            prev_time_ms: 0,
            dtmf_mode: false,
            dtmf_timestamp: 0,
            audio_mark: true,
            last_text_time_ms: 0,
            pending_extension: None,
            send_history: std::collections::VecDeque::new(),
        }
    }

    /// Re-emits the requested sequence numbers from the send history.
    pub fn retransmit(&mut self, seqs: &[u16]) -> Vec<DataEntry> {
        seqs.iter()
            .filter_map(|seq| {
                self.send_history
                    .iter()
                    .find(|entry| entry.seq == *seq)
                    .cloned()
            })
            .collect()
    }

    /// Queues a host-supplied header extension for the next packet.
    pub fn send_header_extension(&mut self, profile: u16, payload: Bytes) {
        self.pending_extension = Some(PendingExtension { profile, payload });
    }

    fn build_packet(
        &mut self,
        payload_type: u8,
        payload: Bytes,
        timestamp: u32,
        marker: bool,
        extension: Option<PendingExtension>,
    ) -> DataEntry {
        let sequence_number = self.sequencer.next_sequence_number();
        let (extension_flag, extension_profile, extension_payload) = match extension {
            Some(e) => (true, e.profile, e.payload),
            None => (false, 0, Bytes::new()),
        };

        let packet = Packet {
            header: Header {
                version: 2,
                marker,
                payload_type,
                sequence_number,
                timestamp,
                ssrc: self.stats.local_ssrc(),
                extension: extension_flag,
                extension_profile,
                extension_payload,
                ..Default::default()
            },
            payload: payload.clone(),
            padding_size: 0,
        };

        let data = match packet.marshal() {
            Ok(data) => data,
            Err(e) => {
                log::error!("rtp marshal failed: {e}");
                Bytes::new()
            }
        };

        self.stats.on_tx_packet(timestamp, payload.len());

        let entry = DataEntry {
            subtype: SubType::RtpPacket,
            data,
            timestamp,
            mark: marker,
            seq: sequence_number,
            ..Default::default()
        };
        if self.send_history.len() >= SEND_HISTORY_SIZE {
            self.send_history.pop_front();
        }
        self.send_history.push_back(entry.clone());
        entry
    }

    fn process_audio(&mut self, entry: DataEntry) -> Vec<DataEntry> {
        match entry.subtype {
            SubType::DtmfStart => {
                self.dtmf_mode = true;
                self.audio_mark = true;
                vec![]
            }
            SubType::DtmfEnd => {
                self.dtmf_mode = false;
                self.audio_mark = true;
                vec![]
            }
            SubType::DtmfPayload => {
                if !self.dtmf_mode {
                    return vec![];
                }
                // interim event packets repeat the start timestamp
                if entry.timestamp == 0 || self.dtmf_timestamp == 0 {
                    let curr = now_ms();
                    self.dtmf_timestamp = curr;
                    let mut diff = (curr.wrapping_sub(self.prev_time_ms) + 10) / 20 * 20;
                    if diff == 0 {
                        diff = AUDIO_FRAME_MS;
                    }
                    self.prev_time_ms = self.prev_time_ms.wrapping_add(diff);
                    self.rtp_timestamp = self.rtp_timestamp.wrapping_add(diff * self.sampling_khz);
                }
                let marker = self.audio_mark;
                self.audio_mark = false;
                let ts = self.rtp_timestamp;
                vec![self.build_packet(self.dtmf_payload_type, entry.data, ts, marker, None)]
            }
            _ => {
                if self.dtmf_mode {
                    return vec![];
                }
                let curr = now_ms();
                if self.prev_time_ms == 0 {
                    self.prev_time_ms = curr;
                } else {
                    let diff = (curr.wrapping_sub(self.prev_time_ms) + 10) / 20 * 20;
                    if diff == 0 {
                        log::trace!("skip this turn, prev[{}] curr[{curr}]", self.prev_time_ms);
                        return vec![];
                    }
                    if diff > AUDIO_FRAME_MS {
                        self.prev_time_ms = curr;
                    } else {
                        self.prev_time_ms = self.prev_time_ms.wrapping_add(diff);
                    }
                    self.rtp_timestamp = self.rtp_timestamp.wrapping_add(diff * self.sampling_khz);
                }
                let marker = self.audio_mark || entry.mark;
                self.audio_mark = false;
                let ts = self.rtp_timestamp;
                let ext = self.pending_extension.take();
                vec![self.build_packet(self.payload_type, entry.data, ts, marker, ext)]
            }
        }
    }

    fn process_video(&mut self, entry: DataEntry) -> Vec<DataEntry> {
        let timestamp = entry.timestamp.wrapping_mul(self.sampling_khz);
        let extension = if self.cvo_extension_id != 0 && entry.mark {
            let rotation = match entry.data_type {
                SubType::RawDataRot90 => CvoRotation::Rot90,
                SubType::RawDataRot180 => CvoRotation::Rot180,
                SubType::RawDataRot270 => CvoRotation::Rot270,
                _ => CvoRotation::Rot0,
            };
            Some(PendingExtension {
                profile: 0xBEDE,
                payload: CvoExtension {
                    extension_id: self.cvo_extension_id,
                    camera_back_facing: false,
                    rotation,
                }
                .payload(),
            })
        } else {
            self.pending_extension.take()
        };
        let marker = entry.mark;
        vec![self.build_packet(self.payload_type, entry.data, timestamp, marker, extension)]
    }

    fn process_text(&mut self, entry: DataEntry) -> Vec<DataEntry> {
        let now = entry.timestamp;
        let marker =
            entry.mark || self.last_text_time_ms == 0
                || now.wrapping_sub(self.last_text_time_ms) > TEXT_IDLE_MARKER_MS;
        self.last_text_time_ms = now;

        let payload_type = match entry.subtype {
            SubType::BitstreamT140Red => self.payload_type,
            _ if self.red_enabled => self.red_payload_type,
            _ => self.payload_type,
        };
        let ext = self.pending_extension.take();
        vec![self.build_packet(payload_type, entry.data, now, marker, ext)]
    }
}

impl Node for RtpEncoderNode {
    fn id(&self) -> NodeId {
        NodeId::RtpEncoder
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
        self.dtmf_mode = false;
        self.audio_mark = true;
        self.prev_time_ms = 0;
        self.dtmf_timestamp = 0;
        self.last_text_time_ms = 0;
        self.rtp_timestamp = 0;
        self.state = NodeState::Running;
        Ok(())
    }

    fn stop(&mut self) {
        self.state = NodeState::Stopped;
    }

    fn set_config(&mut self, config: &MediaConfig) {
        self.config = Some(config.clone());
        match config {
            MediaConfig::Audio(c) => {
                self.payload_type = c.tx_payload_type;
                self.dtmf_payload_type = c.dtmf_payload_type;
                self.sampling_khz = c.sampling_rate_khz;
            }
            MediaConfig::Video(c) => {
                self.payload_type = c.tx_payload_type;
                self.sampling_khz = c.sampling_rate_khz;
                self.cvo_extension_id = c.cvo_extension_id;
            }
            MediaConfig::Text(c) => {
                self.payload_type = c.tx_payload_type;
                self.red_payload_type = c.redundant_payload_type;
                self.red_enabled = c.codec == TextCodec::T140Red && c.redundant_level > 0;
                self.sampling_khz = 1;
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
        match self.media {
            MediaType::Audio => self.process_audio(entry),
            MediaType::Video => self.process_video(entry),
            MediaType::Text => self.process_text(entry),
        }
    }

    fn as_any_mut(&mut self) -> &mut (dyn Any + 'static) {
        self
    }
}
