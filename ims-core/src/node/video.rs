use std::any::Any;
use std::time::Duration;

use bytes::{Bytes, BytesMut};

use shared::error::{Error, Result};

use crate::config::{MediaConfig, MediaType, VideoCodec};
use crate::device::{VideoFrame, VideoInput, VideoOutput};
use crate::event::{SessionCallback, SessionEvent};
use crate::jitter::VideoJitterBuffer;
use crate::node::{DataEntry, DataQueue, Node, NodeId, NodeState, SubType};
use crate::utils::now_ms;

/// H.264 FU-A fragment type.
const H264_NAL_TYPE_FU_A: u8 = 28;
const H264_NAL_TYPE_IDR: u8 = 5;
const H264_NAL_TYPE_SPS: u8 = 7;
const H264_NAL_TYPE_PPS: u8 = 8;

/// HEVC fragmentation unit type (RFC 7798).
const HEVC_NAL_TYPE_FU: u8 = 49;

fn rotation_subtype(degrees: u32) -> SubType {
    match degrees % 360 {
        90 => SubType::RawDataRot90,
        180 => SubType::RawDataRot180,
        270 => SubType::RawDataRot270,
        _ => SubType::RawData,
    }
}

/// Pulls coded frames from the camera/encoder seam at the configured
/// frame rate.
pub struct VideoSourceNode {
    state: NodeState,
    queue: DataQueue,
    callback: SessionCallback,
    config: Option<MediaConfig>,
    input: Option<Box<dyn VideoInput>>,
    framerate: u32,
    codec: VideoCodec,
    bitrate_kbps: u32,
}

impl VideoSourceNode {
    pub fn new(callback: SessionCallback) -> Self {
        Self {
            state: NodeState::Stopped,
            queue: DataQueue::new(),
            callback,
            config: None,
            input: None,
            framerate: 30,
            codec: VideoCodec::H264,
            bitrate_kbps: 0,
        }
    }

    pub fn set_input(&mut self, input: Box<dyn VideoInput>) {
        self.input = Some(input);
    }

    /// Forwarded peer feedback: produce an IDR as soon as possible.
    pub fn request_idr(&mut self) {
        if let Some(input) = self.input.as_mut() {
            input.request_idr();
        }
    }

    /// Forwarded rate control request.
    pub fn set_bitrate(&mut self, kbps: u32) {
        self.bitrate_kbps = kbps;
        if let Some(input) = self.input.as_mut() {
            input.set_bitrate(kbps);
        }
    }
}

impl Node for VideoSourceNode {
    fn id(&self) -> NodeId {
        NodeId::VideoSource
    }

    fn media(&self) -> MediaType {
        MediaType::Video
    }

    fn state(&self) -> NodeState {
        self.state
    }

    fn start(&mut self) -> Result<()> {
        if self.input.is_none() {
            return Err(Error::ErrNoResources);
        }
        if self.framerate == 0 {
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

    fn is_source(&self) -> bool {
        true
    }

    fn set_config(&mut self, config: &MediaConfig) {
        self.config = Some(config.clone());
        if let Some(video) = config.video() {
            self.framerate = video.framerate;
            self.codec = video.codec;
            self.bitrate_kbps = video.bitrate_kbps;
        }
    }

    fn is_same_config(&self, config: &MediaConfig) -> bool {
        self.config.as_ref() == Some(config)
    }

    fn queue(&self) -> &DataQueue {
        &self.queue
    }

    fn runtime_period(&self) -> Option<Duration> {
        Some(Duration::from_millis(
            u64::from(1000 / self.framerate.max(1)),
        ))
    }

    fn poll_runtime(&mut self) -> Vec<DataEntry> {
        if self.state != NodeState::Running {
            return vec![];
        }
        let Some(input) = self.input.as_mut() else {
            return vec![];
        };
        let Some(frame) = input.read_frame() else {
            return vec![];
        };

        let subtype = if frame.keyframe {
            SubType::BitstreamCodecConfig
        } else {
            match self.codec {
                VideoCodec::H264 => SubType::BitstreamH264,
                VideoCodec::Hevc => SubType::BitstreamHevc,
            }
        };
        vec![DataEntry {
            subtype,
            data: frame.data,
            timestamp: if frame.timestamp_ms != 0 {
                frame.timestamp_ms
            } else {
                now_ms()
            },
            mark: true,
            data_type: rotation_subtype(frame.rotation_degrees),
            ..Default::default()
        }]
    }

    fn as_any_mut(&mut self) -> &mut (dyn Any + 'static) {
        self
    }
}

/// Fragments coded frames to fit the MTU: single NAL packets when they
/// fit, FU fragmentation otherwise.
pub struct VideoPayloadEncoderNode {
    state: NodeState,
    queue: DataQueue,
    callback: SessionCallback,
    config: Option<MediaConfig>,
    codec: VideoCodec,
    mtu: usize,
}

impl VideoPayloadEncoderNode {
    pub fn new(callback: SessionCallback) -> Self {
        Self {
            state: NodeState::Stopped,
            queue: DataQueue::new(),
            callback,
            config: None,
            codec: VideoCodec::H264,
            mtu: 1500,
        }
    }

    fn max_payload(&self) -> usize {
        // fixed RTP header plus headroom for one extension word
        self.mtu.saturating_sub(20).max(64)
    }

    fn fragment_h264(&self, entry: &DataEntry) -> Vec<DataEntry> {
        let data = &entry.data;
        let max = self.max_payload();
        if data.len() <= max {
            return vec![DataEntry {
                mark: true,
                data: data.clone(),
                ..entry.clone()
            }];
        }

        let nal_header = data[0];
        let indicator = (nal_header & 0xE0) | H264_NAL_TYPE_FU_A;
        let nal_type = nal_header & 0x1F;
        let body = &data[1..];
        let chunk_size = max - 2;

        let mut out = vec![];
        let chunks: Vec<&[u8]> = body.chunks(chunk_size).collect();
        let count = chunks.len();
        for (i, chunk) in chunks.into_iter().enumerate() {
            let mut fu_header = nal_type;
            if i == 0 {
                fu_header |= 0x80; // S bit
            }
            if i + 1 == count {
                fu_header |= 0x40; // E bit
            }
            let mut payload = BytesMut::with_capacity(chunk.len() + 2);
            payload.extend_from_slice(&[indicator, fu_header]);
            payload.extend_from_slice(chunk);
            out.push(DataEntry {
                subtype: entry.subtype,
                data: payload.freeze(),
                timestamp: entry.timestamp,
                mark: i + 1 == count,
                data_type: entry.data_type,
                ..Default::default()
            });
        }
        out
    }

    fn fragment_hevc(&self, entry: &DataEntry) -> Vec<DataEntry> {
        let data = &entry.data;
        let max = self.max_payload();
        if data.len() <= max || data.len() < 2 {
            return vec![DataEntry {
                mark: true,
                data: data.clone(),
                ..entry.clone()
            }];
        }

        let nal_type = (data[0] >> 1) & 0x3F;
        let fu_indicator = [
            (data[0] & 0x81) | (HEVC_NAL_TYPE_FU << 1),
            data[1],
        ];
        let body = &data[2..];
        let chunk_size = max - 3;

        let mut out = vec![];
        let chunks: Vec<&[u8]> = body.chunks(chunk_size).collect();
        let count = chunks.len();
        for (i, chunk) in chunks.into_iter().enumerate() {
            let mut fu_header = nal_type;
            if i == 0 {
                fu_header |= 0x80;
            }
            if i + 1 == count {
                fu_header |= 0x40;
            }
            let mut payload = BytesMut::with_capacity(chunk.len() + 3);
            payload.extend_from_slice(&fu_indicator);
            payload.extend_from_slice(&[fu_header]);
            payload.extend_from_slice(chunk);
            out.push(DataEntry {
                subtype: entry.subtype,
                data: payload.freeze(),
                timestamp: entry.timestamp,
                mark: i + 1 == count,
                data_type: entry.data_type,
                ..Default::default()
            });
        }
        out
    }
}

impl Node for VideoPayloadEncoderNode {
    fn id(&self) -> NodeId {
        NodeId::VideoPayloadEncoder
    }

    fn media(&self) -> MediaType {
        MediaType::Video
    }

    fn state(&self) -> NodeState {
        self.state
    }

    fn start(&mut self) -> Result<()> {
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
        if let Some(video) = config.video() {
            self.codec = video.codec;
        }
        self.mtu = config.rtp().mtu as usize;
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
            VideoCodec::H264 => self.fragment_h264(&entry),
            VideoCodec::Hevc => self.fragment_hevc(&entry),
        }
    }

    fn as_any_mut(&mut self) -> &mut (dyn Any + 'static) {
        self
    }
}

/// Rebuilds NAL units from single packets and FU runs.
pub struct VideoPayloadDecoderNode {
    state: NodeState,
    queue: DataQueue,
    callback: SessionCallback,
    config: Option<MediaConfig>,
    codec: VideoCodec,
    assembly: BytesMut,
    assembling: bool,
}

impl VideoPayloadDecoderNode {
    pub fn new(callback: SessionCallback) -> Self {
        Self {
            state: NodeState::Stopped,
            queue: DataQueue::new(),
            callback,
            config: None,
            codec: VideoCodec::H264,
            assembly: BytesMut::new(),
            assembling: false,
        }
    }

    fn classify_h264(nal_type: u8) -> SubType {
        match nal_type {
            H264_NAL_TYPE_IDR | H264_NAL_TYPE_SPS | H264_NAL_TYPE_PPS => {
                SubType::BitstreamCodecConfig
            }
            _ => SubType::BitstreamH264,
        }
    }

    fn classify_hevc(nal_type: u8) -> SubType {
        match nal_type {
            // IDR/CRA and parameter sets
            16..=21 | 32..=34 => SubType::BitstreamCodecConfig,
            _ => SubType::BitstreamHevc,
        }
    }

    fn decode_h264(&mut self, entry: DataEntry) -> Vec<DataEntry> {
        let data = &entry.data;
        if data.is_empty() {
            return vec![];
        }
        let nal_type = data[0] & 0x1F;

        if nal_type != H264_NAL_TYPE_FU_A {
            return vec![DataEntry {
                subtype: Self::classify_h264(nal_type),
                ..entry.clone()
            }];
        }

        if data.len() < 2 {
            return vec![];
        }
        let fu_header = data[1];
        let start = fu_header & 0x80 != 0;
        let end = fu_header & 0x40 != 0;
        let original_type = fu_header & 0x1F;

        if start {
            self.assembly.clear();
            self.assembly
                .extend_from_slice(&[(data[0] & 0xE0) | original_type]);
            self.assembling = true;
        }
        if !self.assembling {
            log::debug!("mid-fragment without start, dropping");
            return vec![];
        }
        self.assembly.extend_from_slice(&data[2..]);

        if end {
            self.assembling = false;
            let nal = self.assembly.split().freeze();
            return vec![DataEntry {
                subtype: Self::classify_h264(original_type),
                data: nal,
                timestamp: entry.timestamp,
                mark: entry.mark,
                seq: entry.seq,
                arrival_time: entry.arrival_time,
                data_type: entry.data_type,
                ..Default::default()
            }];
        }
        vec![]
    }

    fn decode_hevc(&mut self, entry: DataEntry) -> Vec<DataEntry> {
        let data = &entry.data;
        if data.len() < 2 {
            return vec![];
        }
        let nal_type = (data[0] >> 1) & 0x3F;

        if nal_type != HEVC_NAL_TYPE_FU {
            return vec![DataEntry {
                subtype: Self::classify_hevc(nal_type),
                ..entry.clone()
            }];
        }

        if data.len() < 3 {
            return vec![];
        }
        let fu_header = data[2];
        let start = fu_header & 0x80 != 0;
        let end = fu_header & 0x40 != 0;
        let original_type = fu_header & 0x3F;

        if start {
            self.assembly.clear();
            self.assembly.extend_from_slice(&[
                (data[0] & 0x81) | (original_type << 1),
                data[1],
            ]);
            self.assembling = true;
        }
        if !self.assembling {
            return vec![];
        }
        self.assembly.extend_from_slice(&data[3..]);

        if end {
            self.assembling = false;
            let nal = self.assembly.split().freeze();
            return vec![DataEntry {
                subtype: Self::classify_hevc(original_type),
                data: nal,
                timestamp: entry.timestamp,
                mark: entry.mark,
                seq: entry.seq,
                arrival_time: entry.arrival_time,
                data_type: entry.data_type,
                ..Default::default()
            }];
        }
        vec![]
    }
}

impl Node for VideoPayloadDecoderNode {
    fn id(&self) -> NodeId {
        NodeId::VideoPayloadDecoder
    }

    fn media(&self) -> MediaType {
        MediaType::Video
    }

    fn state(&self) -> NodeState {
        self.state
    }

    fn start(&mut self) -> Result<()> {
        self.assembly.clear();
        self.assembling = false;
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
        if let Some(video) = config.video() {
            self.codec = video.codec;
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
        if entry.subtype == SubType::Refreshed {
            self.assembling = false;
            self.assembly.clear();
            return vec![entry];
        }
        match self.codec {
            VideoCodec::H264 => self.decode_h264(entry),
            VideoCodec::Hevc => self.decode_hevc(entry),
        }
    }

    fn as_any_mut(&mut self) -> &mut (dyn Any + 'static) {
        self
    }
}

/// Orders assembled NAL units, hands complete frames to the display seam,
/// and reports loss, resolution changes and data usage.
pub struct VideoRendererNode {
    state: NodeState,
    queue: DataQueue,
    callback: SessionCallback,
    config: Option<MediaConfig>,
    output: Option<Box<dyn VideoOutput>>,
    jitter: VideoJitterBuffer,

    known_dimensions: Option<(u32, u32)>,
    bytes_since_report: u64,
    loss_reported: bool,
}

impl VideoRendererNode {
    pub fn new(callback: SessionCallback) -> Self {
        Self {
            state: NodeState::Stopped,
            queue: DataQueue::new(),
            callback,
            config: None,
            output: None,
            jitter: VideoJitterBuffer::new(),
            known_dimensions: None,
            bytes_since_report: 0,
            loss_reported: false,
        }
    }

    pub fn set_output(&mut self, output: Box<dyn VideoOutput>) {
        self.output = Some(output);
    }

    pub fn jitter_buffer(&mut self) -> &mut VideoJitterBuffer {
        &mut self.jitter
    }

    /// Sequences currently blocking frame assembly; the session turns
    /// these into NACK feedback.
    pub fn missing_sequence_numbers(&self) -> Vec<u16> {
        self.jitter.missing_sequence_numbers()
    }
}

impl Node for VideoRendererNode {
    fn id(&self) -> NodeId {
        NodeId::VideoRenderer
    }

    fn media(&self) -> MediaType {
        MediaType::Video
    }

    fn state(&self) -> NodeState {
        self.state
    }

    fn start(&mut self) -> Result<()> {
        if self.output.is_none() {
            return Err(Error::ErrNoResources);
        }
        self.jitter.reset();
        self.bytes_since_report = 0;
        self.loss_reported = false;
        self.state = NodeState::Running;
        Ok(())
    }

    fn stop(&mut self) {
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
        self.queue.len() + self.jitter.len()
    }

    fn process(&mut self) -> Vec<DataEntry> {
        if self.state != NodeState::Running {
            return vec![];
        }

        while let Some(entry) = self.queue.pop() {
            if entry.subtype == SubType::Refreshed {
                self.jitter.reset();
                continue;
            }
            self.bytes_since_report += entry.data.len() as u64;
            self.jitter.add(entry);
        }

        while let Some(frame) = self.jitter.get_frame() {
            self.loss_reported = false;
            if let Some(output) = self.output.as_mut() {
                let dimensions = output.write_frame(&VideoFrame {
                    data: frame.data,
                    keyframe: frame.subtype == SubType::BitstreamCodecConfig,
                    timestamp_ms: frame.timestamp,
                    rotation_degrees: match frame.data_type {
                        SubType::RawDataRot90 => 90,
                        SubType::RawDataRot180 => 180,
                        SubType::RawDataRot270 => 270,
                        _ => 0,
                    },
                });
                if let Some(dims) = dimensions {
                    if self.known_dimensions != Some(dims) {
                        self.known_dimensions = Some(dims);
                        self.callback.send_event(SessionEvent::PeerDimensionChanged {
                            width: dims.0,
                            height: dims.1,
                        });
                    }
                }
            }
        }

        vec![]
    }

    fn runtime_period(&self) -> Option<Duration> {
        Some(Duration::from_secs(1))
    }

    /// Periodic reporting: data usage and loss feedback.
    fn poll_runtime(&mut self) -> Vec<DataEntry> {
        if self.bytes_since_report > 0 {
            self.callback.send_event(SessionEvent::VideoDataUsage {
                bytes: self.bytes_since_report,
            });
            self.bytes_since_report = 0;
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
    use crate::config::VideoConfig;

    fn video_config(mtu: u32) -> MediaConfig {
        let mut c = VideoConfig::default();
        c.rtp.mtu = mtu;
        MediaConfig::Video(c)
    }

    fn codec_pair(mtu: u32) -> (VideoPayloadEncoderNode, VideoPayloadDecoderNode) {
        let (cb, _rx) = SessionCallback::new();
        let mut enc = VideoPayloadEncoderNode::new(cb.clone());
        enc.set_config(&video_config(mtu));
        enc.start().unwrap();
        let mut dec = VideoPayloadDecoderNode::new(cb);
        dec.set_config(&video_config(mtu));
        dec.start().unwrap();
        (enc, dec)
    }

    fn idr_nal(len: usize) -> DataEntry {
        let mut data = vec![0x65u8]; // IDR slice
        data.extend(std::iter::repeat(0xCD).take(len - 1));
        DataEntry {
            subtype: SubType::BitstreamCodecConfig,
            data: Bytes::from(data),
            timestamp: 3000,
            mark: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_small_nal_single_packet() {
        let (mut enc, mut dec) = codec_pair(1500);
        let frame = idr_nal(500);
        let packets = enc.consume(frame.clone());
        assert_eq!(packets.len(), 1);
        assert!(packets[0].mark);

        let out = dec.consume(packets.into_iter().next().unwrap());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].subtype, SubType::BitstreamCodecConfig);
        assert_eq!(out[0].data, frame.data);
    }

    #[test]
    fn test_large_nal_fragmented_and_reassembled() {
        let (mut enc, mut dec) = codec_pair(1500);
        let frame = idr_nal(4000);
        let packets = enc.consume(frame.clone());
        assert!(packets.len() >= 3);
        // every fragment fits within the MTU
        for p in &packets {
            assert!(p.data.len() <= 1480);
        }
        // only the last carries the marker
        assert!(packets[..packets.len() - 1].iter().all(|p| !p.mark));
        assert!(packets.last().unwrap().mark);
        // FU-A indicator on each fragment
        assert!(packets.iter().all(|p| p.data[0] & 0x1F == 28));

        let count = packets.len();
        let mut reassembled = vec![];
        for (i, p) in packets.into_iter().enumerate() {
            let out = dec.consume(p);
            if i + 1 < count {
                assert!(out.is_empty());
            } else {
                reassembled = out;
            }
        }
        assert_eq!(reassembled.len(), 1);
        assert_eq!(reassembled[0].data, frame.data);
        assert_eq!(reassembled[0].subtype, SubType::BitstreamCodecConfig);
    }

    #[test]
    fn test_hevc_fragmentation_round_trip() {
        let (cb, _rx) = SessionCallback::new();
        let mut config = VideoConfig::default();
        config.codec = VideoCodec::Hevc;
        config.rtp.mtu = 600;
        let config = MediaConfig::Video(config);

        let mut enc = VideoPayloadEncoderNode::new(cb.clone());
        enc.set_config(&config);
        enc.start().unwrap();
        let mut dec = VideoPayloadDecoderNode::new(cb);
        dec.set_config(&config);
        dec.start().unwrap();

        // IDR_W_RADL (type 19), layer 0, tid 1
        let mut data = vec![19u8 << 1, 0x01];
        data.extend(std::iter::repeat(0xEE).take(2000));
        let frame = DataEntry {
            subtype: SubType::BitstreamCodecConfig,
            data: Bytes::from(data),
            timestamp: 500,
            mark: true,
            ..Default::default()
        };

        let packets = enc.consume(frame.clone());
        assert!(packets.len() > 1);
        let count = packets.len();
        let mut out = vec![];
        for (i, p) in packets.into_iter().enumerate() {
            let r = dec.consume(p);
            if i + 1 == count {
                out = r;
            }
        }
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].data, frame.data);
    }

    #[test]
    fn test_mid_fragment_without_start_dropped() {
        let (_enc, mut dec) = codec_pair(1500);
        // FU-A continuation with no start bit
        let fu = DataEntry {
            subtype: SubType::BitstreamH264,
            data: Bytes::from_static(&[0x7C, 0x05, 0xAA, 0xBB]),
            ..Default::default()
        };
        assert!(dec.consume(fu).is_empty());
    }
}
