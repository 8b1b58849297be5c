use std::any::Any;
use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

use shared::bits::{BitReader, BitWriter};
use shared::error::{Error, Result};

use crate::config::{MediaConfig, MediaType, TextCodec};
use crate::event::{SessionCallback, SessionEvent};
use crate::jitter::TextJitterBuffer;
use crate::node::{DataEntry, DataQueue, Node, NodeId, NodeState, SubType};
use crate::utils::now_ms;

/// RFC 4103 buffering time: characters are batched and sent at most once
/// per this interval, and the first packet after this much idle carries
/// the RTP marker.
pub const T140_BUFFERING_MS: u32 = 300;
/// How long the receiver waits on a sequence gap before declaring loss.
pub const TEXT_LOSS_WAIT_MS: u32 = 1000;
/// Offsets beyond the 14-bit RED header field cannot be represented.
pub const MAX_RED_OFFSET_MS: u32 = (1 << 14) - 1;

const UTF8_REPLACEMENT: &[u8] = b"\xEF\xBF\xBD";
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Buffers keyed text and releases one chunk per buffering interval.
/// After the last real chunk it keeps emitting empty primaries so the
/// payload encoder can flush its redundancy, ending with the single empty
/// packet that signals idle onset.
pub struct TextSourceNode {
    state: NodeState,
    queue: DataQueue,
    callback: SessionCallback,
    config: Option<MediaConfig>,

    red_level: u8,
    pending_text: BytesMut,
    pending_empty: u32,
    last_sent_at: u32,
}

impl TextSourceNode {
    pub fn new(callback: SessionCallback) -> Self {
        Self {
            state: NodeState::Stopped,
            queue: DataQueue::new(),
            callback,
            config: None,
            red_level: 0,
            pending_text: BytesMut::new(),
            pending_empty: 0,
            last_sent_at: 0,
        }
    }

    /// Queues host keystrokes; the next buffering tick sends them.
    pub fn send_rtt(&mut self, text: &str) {
        if self.state != NodeState::Running {
            return;
        }
        self.pending_text.extend_from_slice(text.as_bytes());
    }
}

impl Node for TextSourceNode {
    fn id(&self) -> NodeId {
        NodeId::TextSource
    }

    fn media(&self) -> MediaType {
        MediaType::Text
    }

    fn state(&self) -> NodeState {
        self.state
    }

    fn start(&mut self) -> Result<()> {
        self.pending_text.clear();
        self.pending_empty = 0;
        self.last_sent_at = 0;
        self.state = NodeState::Running;
        Ok(())
    }

    fn stop(&mut self) {
        self.pending_text.clear();
        self.state = NodeState::Stopped;
    }

    fn is_source(&self) -> bool {
        true
    }

    fn set_config(&mut self, config: &MediaConfig) {
        self.config = Some(config.clone());
        if let Some(text) = config.text() {
            self.red_level = if text.codec == TextCodec::T140Red {
                text.redundant_level
            } else {
                0
            };
        }
    }

    fn is_same_config(&self, config: &MediaConfig) -> bool {
        self.config.as_ref() == Some(config)
    }

    fn queue(&self) -> &DataQueue {
        &self.queue
    }

    fn data_count(&self) -> usize {
        self.queue.len() + self.pending_text.len() + self.pending_empty as usize
    }

    fn process(&mut self) -> Vec<DataEntry> {
        if self.state != NodeState::Running {
            return vec![];
        }

        let now = now_ms();
        if self.last_sent_at != 0 && now.wrapping_sub(self.last_sent_at) < T140_BUFFERING_MS {
            return vec![];
        }

        if !self.pending_text.is_empty() {
            let chunk = std::mem::take(&mut self.pending_text).freeze();
            self.last_sent_at = now;
            // redundancy flushes, then the idle-onset empty packet
            self.pending_empty = u32::from(self.red_level) + 1;
            return vec![DataEntry {
                subtype: SubType::BitstreamT140,
                data: chunk,
                timestamp: now,
                ..Default::default()
            }];
        }

        if self.pending_empty > 0 {
            self.pending_empty -= 1;
            self.last_sent_at = now;
            return vec![DataEntry {
                subtype: SubType::BitstreamT140,
                data: Bytes::new(),
                timestamp: now,
                ..Default::default()
            }];
        }

        vec![]
    }

    fn as_any_mut(&mut self) -> &mut (dyn Any + 'static) {
        self
    }
}

struct RedEntry {
    data: Bytes,
    timestamp: u32,
    remaining: u32,
}

/// Wraps T.140 chunks in the RFC 4103 redundancy format.
pub struct TextPayloadEncoderNode {
    state: NodeState,
    queue: DataQueue,
    callback: SessionCallback,
    config: Option<MediaConfig>,

    codec: TextCodec,
    red_payload_type: u8,
    red_level: u8,
    keep_redundant_level: bool,

    red_buffer: VecDeque<RedEntry>,
    last_timestamp_sent: u32,
}

impl TextPayloadEncoderNode {
    pub fn new(callback: SessionCallback) -> Self {
        Self {
            state: NodeState::Stopped,
            queue: DataQueue::new(),
            callback,
            config: None,
            codec: TextCodec::None,
            red_payload_type: 0,
            red_level: 0,
            keep_redundant_level: false,
            red_buffer: VecDeque::new(),
            last_timestamp_sent: 0,
        }
    }

    fn encode_t140(&mut self, entry: DataEntry) -> Vec<DataEntry> {
        let timestamp = entry.timestamp;
        let mut new_mark = !entry.data.is_empty()
            && (self.last_timestamp_sent == 0
                || timestamp.wrapping_sub(self.last_timestamp_sent) > T140_BUFFERING_MS);
        self.last_timestamp_sent = timestamp;

        if self.codec != TextCodec::T140Red {
            return vec![DataEntry {
                subtype: SubType::BitstreamT140,
                data: entry.data,
                timestamp,
                mark: new_mark,
                ..Default::default()
            }];
        }

        // age out exhausted and unrepresentable redundancy
        while let Some(front) = self.red_buffer.front() {
            if front.remaining == 0
                || timestamp.wrapping_sub(front.timestamp) >= MAX_RED_OFFSET_MS
            {
                self.red_buffer.pop_front();
            } else {
                break;
            }
        }
        while self.red_buffer.len() > usize::from(self.red_level) {
            self.red_buffer.pop_front();
        }

        if entry.data.is_empty() && self.red_buffer.is_empty() {
            // idle period begins with one plain empty packet
            return vec![DataEntry {
                subtype: SubType::BitstreamT140,
                data: Bytes::new(),
                timestamp,
                mark: false,
                ..Default::default()
            }];
        }

        let has_real_redundancy = self.red_buffer.iter().any(|e| !e.data.is_empty());
        if new_mark && has_real_redundancy {
            // the marker only opens an idle period; carried redundancy
            // means the spurt is still running
            new_mark = false;
        } else if new_mark && !has_real_redundancy {
            self.red_buffer.clear();
        }

        let mut null_blocks = 0usize;
        if self.keep_redundant_level {
            null_blocks = usize::from(self.red_level).saturating_sub(self.red_buffer.len());
        }

        let mut header = BitWriter::new();
        let mut payload = BytesMut::new();

        for _ in 0..null_blocks {
            header.write(1, 1);
            header.write(u32::from(self.red_payload_type), 7);
            header.write(0, 14);
            header.write(0, 10);
        }
        for red in self.red_buffer.iter_mut() {
            let offset = timestamp.wrapping_sub(red.timestamp).min(MAX_RED_OFFSET_MS);
            header.write(1, 1);
            header.write(u32::from(self.red_payload_type), 7);
            header.write(offset, 14);
            header.write(red.data.len() as u32, 10);
            payload.extend_from_slice(&red.data);
            red.remaining -= 1;
        }
        header.write(0, 1);
        header.write(u32::from(self.red_payload_type), 7);
        payload.extend_from_slice(&entry.data);

        let mut packet = BytesMut::from(&header.into_bytes()[..]);
        packet.extend_from_slice(&payload);

        let out = DataEntry {
            subtype: SubType::BitstreamT140Red,
            data: packet.freeze(),
            timestamp,
            mark: new_mark,
            ..Default::default()
        };

        if !entry.data.is_empty() {
            self.red_buffer.push_back(RedEntry {
                data: entry.data,
                timestamp,
                remaining: u32::from(self.red_level),
            });
        }

        vec![out]
    }
}

impl Node for TextPayloadEncoderNode {
    fn id(&self) -> NodeId {
        NodeId::TextPayloadEncoder
    }

    fn media(&self) -> MediaType {
        MediaType::Text
    }

    fn state(&self) -> NodeState {
        self.state
    }

    fn start(&mut self) -> Result<()> {
        if self.codec == TextCodec::None {
            return Err(Error::ErrInvalidParam);
        }
        self.red_buffer.clear();
        self.last_timestamp_sent = 0;
        self.state = NodeState::Running;
        Ok(())
    }

    fn stop(&mut self) {
        self.red_buffer.clear();
        self.state = NodeState::Stopped;
    }

    fn is_runtime(&self) -> bool {
        true
    }

    fn set_config(&mut self, config: &MediaConfig) {
        self.config = Some(config.clone());
        if let Some(text) = config.text() {
            self.codec = text.codec;
            self.red_payload_type = text.redundant_payload_type;
            self.red_level = text.redundant_level;
            self.keep_redundant_level = text.keep_redundant_level;
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
        match self.codec {
            TextCodec::T140 | TextCodec::T140Red => self.encode_t140(entry),
            TextCodec::None => vec![],
        }
    }

    fn as_any_mut(&mut self) -> &mut (dyn Any + 'static) {
        self
    }
}

/// Splits RFC 4103 RED payloads back into primary and recovered chunks,
/// in timestamp order (recovered first).
pub struct TextPayloadDecoderNode {
    state: NodeState,
    queue: DataQueue,
    callback: SessionCallback,
    config: Option<MediaConfig>,
    codec: TextCodec,
}

impl TextPayloadDecoderNode {
    pub fn new(callback: SessionCallback) -> Self {
        Self {
            state: NodeState::Stopped,
            queue: DataQueue::new(),
            callback,
            config: None,
            codec: TextCodec::None,
        }
    }

    fn decode_red(&mut self, entry: DataEntry) -> Vec<DataEntry> {
        let data = entry.data.clone();
        let mut reader = BitReader::new(&data);
        let mut blocks: Vec<(u32, u32)> = vec![]; // (offset, length)

        loop {
            match reader.read(1) {
                Ok(1) => {
                    let Ok(_pt) = reader.read(7) else { return vec![] };
                    let Ok(offset) = reader.read(14) else {
                        return vec![];
                    };
                    let Ok(len) = reader.read(10) else { return vec![] };
                    blocks.push((offset, len));
                }
                Ok(_) => {
                    if reader.read(7).is_err() {
                        return vec![];
                    }
                    break;
                }
                Err(_) => return vec![],
            }
        }

        let red_count = blocks.len() as u16;
        let mut out = vec![];
        for (i, (offset, len)) in blocks.iter().enumerate() {
            let Ok(block) = reader.read_bytes(*len as usize * 8) else {
                log::warn!("truncated RED block, dropping packet");
                return vec![];
            };
            if *len > 0 {
                let age = red_count - i as u16;
                out.push(DataEntry {
                    subtype: SubType::BitstreamT140,
                    data: Bytes::from(block),
                    timestamp: entry.timestamp.wrapping_sub(*offset),
                    mark: entry.mark,
                    seq: entry.seq.wrapping_sub(age),
                    arrival_time: entry.arrival_time,
                    ..Default::default()
                });
            }
        }

        let remaining = reader.remaining_bits();
        let primary = match reader.read_bytes(remaining) {
            Ok(bytes) => Bytes::from(bytes),
            Err(_) => return out,
        };
        out.push(DataEntry {
            subtype: SubType::BitstreamT140,
            data: primary,
            timestamp: entry.timestamp,
            mark: entry.mark,
            seq: entry.seq,
            arrival_time: entry.arrival_time,
            ..Default::default()
        });
        out
    }
}

impl Node for TextPayloadDecoderNode {
    fn id(&self) -> NodeId {
        NodeId::TextPayloadDecoder
    }

    fn media(&self) -> MediaType {
        MediaType::Text
    }

    fn state(&self) -> NodeState {
        self.state
    }

    fn start(&mut self) -> Result<()> {
        if self.codec == TextCodec::None {
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
        if let Some(text) = config.text() {
            self.codec = text.codec;
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
        match entry.subtype {
            SubType::Refreshed => vec![entry],
            SubType::BitstreamT140Red => self.decode_red(entry),
            SubType::BitstreamT140 => vec![entry],
            other => {
                log::debug!("text decoder ignoring subtype [{other:?}]");
                vec![]
            }
        }
    }

    fn as_any_mut(&mut self) -> &mut (dyn Any + 'static) {
        self
    }
}

/// Jitter-buffered text playout with the RFC 4103 out-of-order wait and
/// replacement-character substitution for confirmed loss.
pub struct TextRendererNode {
    state: NodeState,
    queue: DataQueue,
    callback: SessionCallback,
    config: Option<MediaConfig>,

    expect_bom: bool,
    bom_consumed: bool,
    jitter: TextJitterBuffer,
    loss_wait_started: u32,
}

impl TextRendererNode {
    pub fn new(callback: SessionCallback) -> Self {
        Self {
            state: NodeState::Stopped,
            queue: DataQueue::new(),
            callback,
            config: None,
            expect_bom: false,
            bom_consumed: false,
            jitter: TextJitterBuffer::new(),
            loss_wait_started: 0,
        }
    }

    pub fn jitter_buffer(&mut self) -> &mut TextJitterBuffer {
        &mut self.jitter
    }

    fn deliver(&mut self, data: &[u8]) {
        let mut text = data;
        if self.expect_bom && !self.bom_consumed && text.starts_with(UTF8_BOM) {
            self.bom_consumed = true;
            text = &text[UTF8_BOM.len()..];
        }
        if text.is_empty() {
            return;
        }
        match std::str::from_utf8(text) {
            Ok(s) => self
                .callback
                .send_event(SessionEvent::RttReceived { text: s.to_string() }),
            Err(_) => log::warn!("dropping non-utf8 text chunk of [{}] bytes", text.len()),
        }
    }
}

impl Node for TextRendererNode {
    fn id(&self) -> NodeId {
        NodeId::TextRenderer
    }

    fn media(&self) -> MediaType {
        MediaType::Text
    }

    fn state(&self) -> NodeState {
        self.state
    }

    fn start(&mut self) -> Result<()> {
        self.bom_consumed = false;
        self.loss_wait_started = 0;
        self.jitter.reset();
        self.state = NodeState::Running;
        Ok(())
    }

    fn stop(&mut self) {
        self.state = NodeState::Stopped;
    }

    fn set_config(&mut self, config: &MediaConfig) {
        self.config = Some(config.clone());
        if let Some(text) = config.text() {
            self.expect_bom = text.expect_bom;
        }
    }

    fn is_same_config(&self, config: &MediaConfig) -> bool {
        self.config.as_ref() == Some(config)
    }

    fn queue(&self) -> &DataQueue {
        &self.queue
    }

    fn data_count(&self) -> usize {
        self.queue.len() + self.jitter.len()
    }

    fn process(&mut self) -> Vec<DataEntry> {
        if self.state != NodeState::Running {
            return vec![];
        }

        while let Some(entry) = self.queue.pop() {
            if entry.subtype == SubType::Refreshed {
                self.jitter.reset();
                self.bom_consumed = false;
                self.loss_wait_started = 0;
            } else {
                self.jitter.add(entry);
            }
        }

        loop {
            let front_seq = match self.jitter.peek() {
                Some(front) => front.seq,
                None => break,
            };
            if let Some(last) = self.jitter.last_played_seq() {
                let gap = front_seq.wrapping_sub(last);
                if gap > 1 && gap < 0x8000 {
                    // RFC 4103 5.4: give reordering a chance to recover
                    let now = now_ms();
                    if self.loss_wait_started == 0 {
                        self.loss_wait_started = now;
                    }
                    if now.wrapping_sub(self.loss_wait_started) <= TEXT_LOSS_WAIT_MS {
                        break;
                    }

                    // the payload decoder already reinserted every chunk
                    // redundancy could recover, so what remains is loss
                    let lost = u32::from(gap) - 1;
                    for i in 0..lost {
                        self.jitter.mark_lost(last.wrapping_add(1 + i as u16));
                        self.deliver(UTF8_REPLACEMENT);
                    }
                }
            }
            self.loss_wait_started = 0;

            let entry = self.jitter.get().expect("peeked entry");
            let data = entry.data.clone();
            self.deliver(&data);
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
    use crate::config::TextConfig;
    use std::sync::mpsc::Receiver;

    fn text_config(level: u8) -> MediaConfig {
        MediaConfig::Text(TextConfig {
            redundant_level: level,
            ..Default::default()
        })
    }

    fn encoder(level: u8) -> TextPayloadEncoderNode {
        let (cb, _rx) = SessionCallback::new();
        let mut node = TextPayloadEncoderNode::new(cb);
        node.set_config(&text_config(level));
        node.start().unwrap();
        node
    }

    fn decoder(level: u8) -> TextPayloadDecoderNode {
        let (cb, _rx) = SessionCallback::new();
        let mut node = TextPayloadDecoderNode::new(cb);
        node.set_config(&text_config(level));
        node.start().unwrap();
        node
    }

    fn t140(data: &'static [u8], ts: u32) -> DataEntry {
        DataEntry {
            subtype: SubType::BitstreamT140,
            data: Bytes::from_static(data),
            timestamp: ts,
            ..Default::default()
        }
    }

    #[test]
    fn test_red_first_packet_pads_empty_blocks() {
        let mut enc = encoder(2);
        let out = enc.consume(t140(b"hello", 1000));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].subtype, SubType::BitstreamT140Red);

        // 2 null blocks + primary header + "hello"
        let data = &out[0].data;
        assert_eq!(data.len(), 4 + 4 + 1 + 5);

        let mut dec = decoder(2);
        let chunks = dec.consume(out.into_iter().next().unwrap());
        // null blocks produce nothing; the primary survives
        assert_eq!(chunks.len(), 1);
        assert_eq!(&chunks[0].data[..], b"hello");
    }

    #[test]
    fn test_red_carries_previous_chunks_with_offsets() {
        let mut enc = encoder(2);
        let _first = enc.consume(t140(b"hello", 1000));

        // empty primary 300 ms later carries "hello" as redundancy
        let p2 = enc.consume(t140(b"", 1300));
        let e2 = DataEntry {
            seq: 101,
            ..p2.into_iter().next().unwrap()
        };
        assert_eq!(e2.subtype, SubType::BitstreamT140Red);

        let mut dec = decoder(2);
        let chunks = dec.consume(e2);
        // recovered "hello" at its original position, then the empty primary
        assert_eq!(chunks.len(), 2);
        assert_eq!(&chunks[0].data[..], b"hello");
        assert_eq!(chunks[0].timestamp, 1000);
        assert_eq!(chunks[0].seq, 100);
        assert!(chunks[1].data.is_empty());
        assert_eq!(chunks[1].seq, 101);

        // another 300 ms: offset grows to 600
        let p3 = enc.consume(t140(b"", 1600));
        let e3 = DataEntry {
            seq: 102,
            ..p3.into_iter().next().unwrap()
        };
        let chunks = dec.consume(e3);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].timestamp, 1000);

        // redundancy exhausted: the next empty primary is plain T140
        let p4 = enc.consume(t140(b"", 1900));
        let e4 = p4.into_iter().next().unwrap();
        assert_eq!(e4.subtype, SubType::BitstreamT140);
        assert!(e4.data.is_empty());
    }

    #[test]
    fn test_red_round_trip_all_levels() {
        for level in 0u8..=3 {
            let mut enc = encoder(level);
            let mut dec = decoder(level);
            let out = enc.consume(t140(b"abc", 500));
            let chunks = dec.consume(out.into_iter().next().unwrap());
            let primary = chunks.last().unwrap();
            assert_eq!(&primary.data[..], b"abc", "level {level}");
        }
    }

    fn renderer(level: u8) -> (TextRendererNode, Receiver<SessionEvent>) {
        let (cb, rx) = SessionCallback::new();
        let mut node = TextRendererNode::new(cb);
        node.set_config(&text_config(level));
        node.start().unwrap();
        (node, rx)
    }

    fn received_text(rx: &Receiver<SessionEvent>) -> String {
        let mut out = String::new();
        while let Ok(ev) = rx.try_recv() {
            if let SessionEvent::RttReceived { text } = ev {
                out.push_str(&text);
            }
        }
        out
    }

    #[test]
    fn test_renderer_in_order() {
        let (mut node, rx) = renderer(0);
        for (seq, text) in [(1u16, "h"), (2, "i")] {
            node.queue().push(DataEntry {
                subtype: SubType::BitstreamT140,
                data: Bytes::copy_from_slice(text.as_bytes()),
                seq,
                ..Default::default()
            });
        }
        node.process();
        assert_eq!(received_text(&rx), "hi");
    }

    #[test]
    fn test_renderer_waits_then_replaces_loss() {
        let (mut node, rx) = renderer(0);
        node.queue().push(DataEntry {
            subtype: SubType::BitstreamT140,
            data: Bytes::from_static(b"a"),
            seq: 1,
            ..Default::default()
        });
        node.process();
        assert_eq!(received_text(&rx), "a");

        // gap: 2 missing, 3 arrives
        node.queue().push(DataEntry {
            subtype: SubType::BitstreamT140,
            data: Bytes::from_static(b"c"),
            seq: 3,
            ..Default::default()
        });
        node.process();
        // still inside the wait window, nothing delivered
        assert_eq!(received_text(&rx), "");
        assert_eq!(node.data_count(), 1);

        // the wait is wall-clock; simulate expiry
        node.loss_wait_started = now_ms().wrapping_sub(TEXT_LOSS_WAIT_MS + 50);
        node.process();
        let text = received_text(&rx);
        assert_eq!(text, format!("{}c", char::REPLACEMENT_CHARACTER));
        assert_eq!(node.jitter.stats.lost, 1);
    }

    #[test]
    fn test_renderer_replaces_loss_beyond_redundancy() {
        let (mut node, rx) = renderer(2);
        node.queue().push(DataEntry {
            subtype: SubType::BitstreamT140,
            data: Bytes::from_static(b"a"),
            seq: 1,
            ..Default::default()
        });
        node.process();
        assert_eq!(received_text(&rx), "a");

        // packets 2..=4 were lost on the wire; packet 5's two redundant
        // blocks recovered 3 and 4, so 2 is gone for good
        for (seq, text) in [(3u16, "c"), (4, "d"), (5, "e")] {
            node.queue().push(DataEntry {
                subtype: SubType::BitstreamT140,
                data: Bytes::copy_from_slice(text.as_bytes()),
                seq,
                ..Default::default()
            });
        }
        node.process();
        // the gap in front of seq 3 holds everything back
        assert_eq!(received_text(&rx), "");
        assert_eq!(node.data_count(), 3);

        node.loss_wait_started = now_ms().wrapping_sub(TEXT_LOSS_WAIT_MS + 50);
        node.process();
        let text = received_text(&rx);
        assert_eq!(text, format!("{}cde", char::REPLACEMENT_CHARACTER));
        assert_eq!(node.jitter.stats.lost, 1);
    }

    #[test]
    fn test_renderer_consumes_bom_once() {
        let (cb, rx) = SessionCallback::new();
        let mut node = TextRendererNode::new(cb);
        node.set_config(&MediaConfig::Text(TextConfig {
            expect_bom: true,
            ..Default::default()
        }));
        node.start().unwrap();

        let mut bom_then_text = Vec::from(UTF8_BOM);
        bom_then_text.extend_from_slice(b"x");
        node.queue().push(DataEntry {
            subtype: SubType::BitstreamT140,
            data: Bytes::from(bom_then_text),
            seq: 1,
            ..Default::default()
        });
        node.process();
        assert_eq!(received_text(&rx), "x");
    }
}
