use std::any::Any;
use std::collections::VecDeque;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;

use shared::error::{Error, Result};

use crate::config::{MediaConfig, MediaType};
use crate::event::SessionCallback;
use crate::node::{DataEntry, DataQueue, Node, NodeId, NodeState, SubType};
use crate::utils::now_ms;

pub const DTMF_DEFAULT_DURATION_MS: u32 = 200;
pub const DTMF_MINIMUM_DURATION_MS: u32 = 40;
pub const DTMF_DEFAULT_VOLUME: u8 = 10;
/// End packet retransmissions per RFC 4733 recommendation.
pub const DTMF_END_RETRANSMITS: u32 = 3;
const EVENT_FRAME_MS: u32 = 20;

/// Maps a keypad character onto its RFC 4733 event code.
pub fn digit_to_event(digit: char) -> Option<u8> {
    match digit {
        '0'..='9' => Some(digit as u8 - b'0'),
        '*' => Some(10),
        '#' => Some(11),
        'A' | 'a' => Some(12),
        'B' | 'b' => Some(13),
        'C' | 'c' => Some(14),
        'D' | 'd' => Some(15),
        _ => None,
    }
}

/// Formats the four-byte telephone-event payload.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |     event     |E|R| volume    |          duration             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
fn event_payload(event: u8, end: bool, volume: u8, duration_ticks: u16) -> Bytes {
    let mut b1 = volume & 0x3F;
    if end {
        b1 |= 0x80;
    }
    let mut payload = [0u8; 4];
    payload[0] = event;
    payload[1] = b1;
    BigEndian::write_u16(&mut payload[2..], duration_ticks);
    Bytes::copy_from_slice(&payload)
}

/// Expands one keypad press into the full RFC 4733 event packet train:
/// a marked start packet, interim updates every 20 ms, and a retransmitted
/// end packet. Entries carry their pacing offset for the sender node.
pub struct DtmfEncoderNode {
    state: NodeState,
    queue: DataQueue,
    callback: SessionCallback,
    config: Option<MediaConfig>,

    sampling_khz: u32,
    default_duration_ms: u32,
    default_volume: u8,
}

impl DtmfEncoderNode {
    pub fn new(callback: SessionCallback) -> Self {
        Self {
            state: NodeState::Stopped,
            queue: DataQueue::new(),
            callback,
            config: None,
            sampling_khz: 16,
            default_duration_ms: DTMF_DEFAULT_DURATION_MS,
            default_volume: DTMF_DEFAULT_VOLUME,
        }
    }

    /// Builds the packet train for one tone. `duration_ms` and `volume`
    /// fall back to configured defaults when zero.
    pub fn start_tone(&mut self, digit: char, volume: u8, duration_ms: u32) -> Vec<DataEntry> {
        if self.state != NodeState::Running {
            return vec![];
        }
        let Some(event) = digit_to_event(digit) else {
            log::warn!("ignoring invalid dtmf digit [{digit}]");
            return vec![];
        };

        let duration_ms = if duration_ms == 0 {
            self.default_duration_ms
        } else {
            duration_ms.max(DTMF_MINIMUM_DURATION_MS)
        };
        let volume = if volume == 0 {
            self.default_volume
        } else {
            volume & 0x3F
        };

        let ticks_per_frame = (self.sampling_khz * EVENT_FRAME_MS) as u16;
        let frames = duration_ms / EVENT_FRAME_MS;

        let mut out = vec![DataEntry {
            subtype: SubType::DtmfStart,
            ..Default::default()
        }];

        for i in 0..frames {
            let duration_ticks = ticks_per_frame.saturating_mul((i + 1) as u16);
            out.push(DataEntry {
                subtype: SubType::DtmfPayload,
                data: event_payload(event, false, volume, duration_ticks),
                // zero marks the first packet of the event for timestamping
                timestamp: if i == 0 { 0 } else { 1 },
                arrival_time: i * EVENT_FRAME_MS,
                ..Default::default()
            });
        }

        let total_ticks = ticks_per_frame.saturating_mul(frames as u16);
        for r in 0..DTMF_END_RETRANSMITS {
            out.push(DataEntry {
                subtype: SubType::DtmfPayload,
                data: event_payload(event, true, volume, total_ticks),
                timestamp: 1,
                arrival_time: (frames + r) * EVENT_FRAME_MS,
                ..Default::default()
            });
        }

        out.push(DataEntry {
            subtype: SubType::DtmfEnd,
            arrival_time: (frames + DTMF_END_RETRANSMITS) * EVENT_FRAME_MS,
            ..Default::default()
        });

        out
    }
}

impl Node for DtmfEncoderNode {
    fn id(&self) -> NodeId {
        NodeId::DtmfEncoder
    }

    fn media(&self) -> MediaType {
        MediaType::Audio
    }

    fn state(&self) -> NodeState {
        self.state
    }

    fn start(&mut self) -> Result<()> {
        if self.sampling_khz == 0 {
            return Err(Error::ErrInvalidParam);
        }
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
        if let Some(audio) = config.audio() {
            self.sampling_khz = audio.dtmf_sampling_rate_khz;
        }
    }

    fn is_same_config(&self, config: &MediaConfig) -> bool {
        self.config.as_ref() == Some(config)
    }

    fn queue(&self) -> &DataQueue {
        &self.queue
    }

    fn as_any_mut(&mut self) -> &mut (dyn Any + 'static) {
        self
    }
}

/// Paces the encoder's packet train onto the wire at 20 ms intervals.
/// Scheduled by the graph worker; releases entries whose offset has come
/// due relative to the train's start.
pub struct DtmfSenderNode {
    state: NodeState,
    queue: DataQueue,
    callback: SessionCallback,
    config: Option<MediaConfig>,

    pending: VecDeque<DataEntry>,
    train_started_at: u32,
}

impl DtmfSenderNode {
    pub fn new(callback: SessionCallback) -> Self {
        Self {
            state: NodeState::Stopped,
            queue: DataQueue::new(),
            callback,
            config: None,
            pending: VecDeque::new(),
            train_started_at: 0,
        }
    }
}

impl Node for DtmfSenderNode {
    fn id(&self) -> NodeId {
        NodeId::DtmfSender
    }

    fn media(&self) -> MediaType {
        MediaType::Audio
    }

    fn state(&self) -> NodeState {
        self.state
    }

    fn start(&mut self) -> Result<()> {
        self.pending.clear();
        self.train_started_at = 0;
        self.state = NodeState::Running;
        Ok(())
    }

    fn stop(&mut self) {
        self.pending.clear();
        self.state = NodeState::Stopped;
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

    fn data_count(&self) -> usize {
        self.queue.len() + self.pending.len()
    }

    fn process(&mut self) -> Vec<DataEntry> {
        if self.state != NodeState::Running {
            return vec![];
        }

        while let Some(entry) = self.queue.pop() {
            if self.pending.is_empty() {
                self.train_started_at = now_ms();
            }
            self.pending.push_back(entry);
        }

        let mut out = vec![];
        let now = now_ms();
        while let Some(front) = self.pending.front() {
            let due = self.train_started_at.wrapping_add(front.arrival_time);
            // control markers ride along with the neighbouring payload
            let is_control = front.subtype != SubType::DtmfPayload;
            if is_control || now.wrapping_sub(due) < 0x8000_0000 {
                out.push(self.pending.pop_front().unwrap());
            } else {
                break;
            }
        }
        out
    }

    fn as_any_mut(&mut self) -> &mut (dyn Any + 'static) {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AudioConfig;

    fn encoder() -> DtmfEncoderNode {
        let (cb, _rx) = SessionCallback::new();
        let mut node = DtmfEncoderNode::new(cb);
        node.set_config(&MediaConfig::Audio(AudioConfig::default()));
        node.start().unwrap();
        node
    }

    #[test]
    fn test_digit_conversion() {
        assert_eq!(digit_to_event('0'), Some(0));
        assert_eq!(digit_to_event('9'), Some(9));
        assert_eq!(digit_to_event('*'), Some(10));
        assert_eq!(digit_to_event('#'), Some(11));
        assert_eq!(digit_to_event('D'), Some(15));
        assert_eq!(digit_to_event('x'), None);
    }

    #[test]
    fn test_tone_train_shape() {
        let mut enc = encoder();
        let train = enc.start_tone('5', 10, 100);
        // start marker + 5 interim + 3 end retransmits + end marker
        assert_eq!(train.len(), 1 + 5 + 3 + 1);
        assert_eq!(train[0].subtype, SubType::DtmfStart);
        assert_eq!(train[train.len() - 1].subtype, SubType::DtmfEnd);

        // first payload: event 5, not end, duration of one frame at 16 kHz
        let p = &train[1];
        assert_eq!(p.data[0], 5);
        assert_eq!(p.data[1] & 0x80, 0);
        assert_eq!(u16::from_be_bytes([p.data[2], p.data[3]]), 320);
        assert_eq!(p.timestamp, 0);

        // end packets carry the E bit and the total duration
        let end = &train[6];
        assert_eq!(end.data[1] & 0x80, 0x80);
        assert_eq!(u16::from_be_bytes([end.data[2], end.data[3]]), 1600);
        // retransmits are identical
        assert_eq!(train[6].data, train[7].data);
        assert_eq!(train[7].data, train[8].data);
    }

    #[test]
    fn test_invalid_digit_rejected() {
        let mut enc = encoder();
        assert!(enc.start_tone('x', 10, 100).is_empty());
    }

    #[test]
    fn test_sender_paces_by_offset() {
        let (cb, _rx) = SessionCallback::new();
        let mut sender = DtmfSenderNode::new(cb);
        sender.set_config(&MediaConfig::Audio(AudioConfig::default()));
        sender.start().unwrap();

        let mut enc = encoder();
        for entry in enc.start_tone('1', 10, 60) {
            sender.queue().push(entry);
        }

        // immediately due: start marker and the first payload
        let first = sender.process();
        assert!(first.len() >= 2);
        assert_eq!(first[0].subtype, SubType::DtmfStart);
        assert_eq!(first[1].subtype, SubType::DtmfPayload);
        let backlog = sender.data_count();
        assert!(backlog > 0);

        // the rest trickles out as time passes
        std::thread::sleep(Duration::from_millis(130));
        let rest = sender.process();
        assert_eq!(rest.len(), backlog);
        assert_eq!(rest[rest.len() - 1].subtype, SubType::DtmfEnd);
        assert_eq!(sender.data_count(), 0);
    }
}
