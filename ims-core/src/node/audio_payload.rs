use std::any::Any;

use bytes::Bytes;

use shared::bits::{BitReader, BitWriter};
use shared::error::{Error, Result};

use crate::config::{AudioCodec, MediaConfig, MediaType};
use crate::event::{SessionCallback, SessionEvent};
use crate::node::{DataEntry, DataQueue, Node, NodeId, NodeState, SubType};

/// CMR value meaning "no mode request".
pub const CMR_NO_REQUEST: u8 = 15;
pub const FRAME_MS: u32 = 20;

/// Speech bits per AMR mode 0..=7, SID at index 8.
const AMR_BITS: [usize; 9] = [95, 103, 118, 134, 148, 159, 204, 244, 39];
/// Speech bits per AMR-WB mode 0..=8, SID at index 9.
const AMR_WB_BITS: [usize; 10] = [132, 177, 253, 285, 317, 365, 397, 461, 477, 40];

pub fn amr_mode_to_bits(mode: u8) -> Option<usize> {
    AMR_BITS.get(mode as usize).copied()
}

pub fn amr_mode_to_len(mode: u8) -> Option<usize> {
    amr_mode_to_bits(mode).map(|b| b.div_ceil(8))
}

pub fn amr_len_to_mode(len: usize) -> Option<u8> {
    (0..AMR_BITS.len() as u8).find(|&m| amr_mode_to_len(m) == Some(len))
}

pub fn amr_wb_mode_to_bits(mode: u8) -> Option<usize> {
    AMR_WB_BITS.get(mode as usize).copied()
}

pub fn amr_wb_mode_to_len(mode: u8) -> Option<usize> {
    amr_wb_mode_to_bits(mode).map(|b| b.div_ceil(8))
}

pub fn amr_wb_len_to_mode(len: usize) -> Option<u8> {
    (0..AMR_WB_BITS.len() as u8).find(|&m| amr_wb_mode_to_len(m) == Some(len))
}

/// Frames coded speech into RTP payloads: AMR / AMR-WB table-of-contents
/// bundling (octet-aligned or bandwidth-efficient), EVS, and transparent
/// G.711.
pub struct AudioPayloadEncoderNode {
    state: NodeState,
    queue: DataQueue,
    callback: SessionCallback,
    config: Option<MediaConfig>,

    codec: AudioCodec,
    octet_aligned: bool,
    evs_header_full: bool,
    evs_use_cmr: bool,
    evs_mode: u8,
    ptime_ms: u32,

    max_frames: usize,
    pending: Vec<Bytes>,
    pending_modes: Vec<u8>,
    bundle_timestamp: u32,
    first_packet: bool,
    /// Mode request to signal to the peer in the outbound CMR field.
    cmr: u8,
}

impl AudioPayloadEncoderNode {
    pub fn new(callback: SessionCallback) -> Self {
        Self {
            state: NodeState::Stopped,
            queue: DataQueue::new(),
            callback,
            config: None,
            codec: AudioCodec::None,
            octet_aligned: true,
            evs_header_full: false,
            evs_use_cmr: false,
            evs_mode: 0,
            ptime_ms: FRAME_MS,
            max_frames: 1,
            pending: vec![],
            pending_modes: vec![],
            bundle_timestamp: 0,
            first_packet: true,
            cmr: CMR_NO_REQUEST,
        }
    }

    /// Applies a codec mode request received from the peer.
    pub fn set_codec_mode_request(&mut self, cmr: u8) {
        self.cmr = cmr;
    }

    fn encode_amr(&mut self, entry: DataEntry) -> Vec<DataEntry> {
        let wide = self.codec == AudioCodec::AmrWb;
        let mode = if wide {
            amr_wb_len_to_mode(entry.data.len())
        } else {
            amr_len_to_mode(entry.data.len())
        };
        let Some(mode) = mode else {
            log::warn!(
                "dropping speech frame with unmapped length [{}]",
                entry.data.len()
            );
            return vec![];
        };

        if self.pending.is_empty() {
            self.bundle_timestamp = entry.timestamp;
        }
        self.pending.push(entry.data);
        self.pending_modes.push(mode);

        if self.pending.len() < self.max_frames {
            return vec![];
        }

        let mut writer = BitWriter::new();
        writer.write(u32::from(self.cmr), 4);
        if self.octet_aligned {
            writer.write(0, 4);
        }

        for (i, &mode) in self.pending_modes.iter().enumerate() {
            let follow = if i + 1 == self.pending_modes.len() { 0 } else { 1 };
            writer.write(follow, 1);
            writer.write(u32::from(mode), 4);
            writer.write(1, 1); // quality ok
            if self.octet_aligned {
                writer.write(0, 2);
            }
        }

        for (i, frame) in self.pending.iter().enumerate() {
            let bits = if wide {
                amr_wb_mode_to_bits(self.pending_modes[i])
            } else {
                amr_mode_to_bits(self.pending_modes[i])
            }
            .unwrap_or(frame.len() * 8);
            writer.write_bytes(frame, bits.min(frame.len() * 8));
            if self.octet_aligned {
                writer.pad_to_byte();
            }
        }
        writer.pad_to_byte();

        let mark = self.first_packet;
        self.first_packet = false;
        let out = DataEntry {
            subtype: SubType::RtpPayload,
            data: Bytes::from(writer.into_bytes()),
            timestamp: self.bundle_timestamp,
            mark,
            ..Default::default()
        };
        self.pending.clear();
        self.pending_modes.clear();
        vec![out]
    }

    fn encode_evs(&mut self, entry: DataEntry) -> Vec<DataEntry> {
        let mut writer = BitWriter::new();
        if self.evs_header_full {
            if self.evs_use_cmr {
                // CMR byte: header bit, type, definition
                writer.write(1, 1);
                writer.write(0b111, 3);
                writer.write(u32::from(self.cmr & 0x0F), 4);
            }
            // single-frame ToC
            writer.write(0, 2);
            writer.write(0, 2);
            writer.write(u32::from(self.evs_mode) & 0xF, 4);
        }
        writer.write_bytes(&entry.data, entry.data.len() * 8);

        let mark = self.first_packet;
        self.first_packet = false;
        vec![DataEntry {
            subtype: SubType::RtpPayload,
            data: Bytes::from(writer.into_bytes()),
            timestamp: entry.timestamp,
            mark,
            ..Default::default()
        }]
    }
}

impl Node for AudioPayloadEncoderNode {
    fn id(&self) -> NodeId {
        NodeId::AudioPayloadEncoder
    }

    fn media(&self) -> MediaType {
        MediaType::Audio
    }

    fn state(&self) -> NodeState {
        self.state
    }

    fn start(&mut self) -> Result<()> {
        if self.codec == AudioCodec::None {
            return Err(Error::ErrInvalidParam);
        }
        self.max_frames = (self.ptime_ms / FRAME_MS).max(1) as usize;
        self.pending.clear();
        self.pending_modes.clear();
        self.first_packet = true;
        self.cmr = CMR_NO_REQUEST;
        self.state = NodeState::Running;
        Ok(())
    }

    fn stop(&mut self) {
        self.pending.clear();
        self.pending_modes.clear();
        self.state = NodeState::Stopped;
    }

    fn is_runtime(&self) -> bool {
        true
    }

    fn set_config(&mut self, config: &MediaConfig) {
        self.config = Some(config.clone());
        if let Some(audio) = config.audio() {
            self.codec = audio.codec;
            self.octet_aligned = audio.amr.octet_aligned;
            self.evs_header_full = audio.evs.header_full;
            self.evs_use_cmr = audio.evs.use_cmr;
            self.evs_mode = audio.evs.mode;
            self.ptime_ms = audio.ptime_ms;
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
        if entry.subtype == SubType::DtxStart {
            // silence gap opened; the next speech frame starts a new talk
            // spurt and must carry the marker
            self.first_packet = true;
            return vec![];
        }
        match self.codec {
            AudioCodec::Amr | AudioCodec::AmrWb => self.encode_amr(entry),
            AudioCodec::Evs => self.encode_evs(entry),
            AudioCodec::Pcmu | AudioCodec::Pcma => {
                let mark = self.first_packet;
                self.first_packet = false;
                vec![DataEntry {
                    subtype: SubType::RtpPayload,
                    mark,
                    ..entry
                }]
            }
            AudioCodec::None => vec![],
        }
    }

    fn as_any_mut(&mut self) -> &mut (dyn Any + 'static) {
        self
    }
}

/// Unpacks RTP payloads back into individual coded speech frames and
/// surfaces inbound codec mode requests.
pub struct AudioPayloadDecoderNode {
    state: NodeState,
    queue: DataQueue,
    callback: SessionCallback,
    config: Option<MediaConfig>,

    codec: AudioCodec,
    octet_aligned: bool,
    evs_header_full: bool,
    evs_use_cmr: bool,
    prev_cmr: u8,
    pending_cmr: Option<u8>,
}

impl AudioPayloadDecoderNode {
    pub fn new(callback: SessionCallback) -> Self {
        Self {
            state: NodeState::Stopped,
            queue: DataQueue::new(),
            callback,
            config: None,
            codec: AudioCodec::None,
            octet_aligned: true,
            evs_header_full: false,
            evs_use_cmr: false,
            prev_cmr: CMR_NO_REQUEST,
            pending_cmr: None,
        }
    }

    /// Mode request received from the peer, not yet applied to the
    /// sending side.
    pub fn take_pending_cmr(&mut self) -> Option<u8> {
        self.pending_cmr.take()
    }

    fn handle_cmr(&mut self, cmr: u8) {
        if cmr == self.prev_cmr {
            return;
        }
        let max_mode = if self.codec == AudioCodec::AmrWb { 8 } else { 7 };
        if cmr == CMR_NO_REQUEST || cmr <= max_mode {
            log::debug!("peer codec mode request [{}] -> [{cmr}]", self.prev_cmr);
            self.prev_cmr = cmr;
            if cmr != CMR_NO_REQUEST {
                self.pending_cmr = Some(cmr);
                self.callback
                    .send_event(SessionEvent::CodecModeRequest { mode: cmr });
            }
        } else {
            log::warn!("invalid codec mode request [{cmr}]");
        }
    }

    fn decode_amr(&mut self, entry: DataEntry) -> Vec<DataEntry> {
        let wide = self.codec == AudioCodec::AmrWb;
        let data = entry.data.clone();
        let mut reader = BitReader::new(&data);

        let parse = |reader: &mut BitReader<'_>,
                     octet_aligned: bool|
         -> shared::error::Result<(u8, Vec<u8>, Vec<Bytes>)> {
            let cmr = reader.read(4)? as u8;
            if octet_aligned {
                reader.read(4)?;
            }

            let mut modes = vec![];
            loop {
                let follow = reader.read(1)?;
                let mode = reader.read(4)? as u8;
                let _quality = reader.read(1)?;
                if octet_aligned {
                    reader.read(2)?;
                }
                modes.push(mode);
                if follow == 0 {
                    break;
                }
            }

            let mut frames = vec![];
            for &mode in &modes {
                let bits = if wide {
                    amr_wb_mode_to_bits(mode)
                } else {
                    amr_mode_to_bits(mode)
                }
                .ok_or(Error::ErrInvalidAmrMode)?;
                let frame = reader.read_bytes(bits)?;
                if octet_aligned {
                    reader.align_byte();
                }
                frames.push(Bytes::from(frame));
            }
            Ok((cmr, modes, frames))
        };

        match parse(&mut reader, self.octet_aligned) {
            Ok((cmr, _modes, frames)) => {
                self.handle_cmr(cmr);
                let mut out = vec![];
                let mut timestamp = entry.timestamp;
                let count = frames.len();
                for (i, frame) in frames.into_iter().enumerate() {
                    out.push(DataEntry {
                        subtype: SubType::RtpPayload,
                        data: frame,
                        timestamp,
                        mark: entry.mark && i == 0,
                        seq: entry.seq.wrapping_add(i as u16),
                        arrival_time: entry.arrival_time,
                        redundancy_left: (count - 1 - i) as u32,
                        ..Default::default()
                    });
                    timestamp = timestamp.wrapping_add(FRAME_MS);
                }
                out
            }
            Err(e) => {
                log::warn!("malformed speech payload dropped: {e}");
                vec![]
            }
        }
    }

    fn decode_evs(&mut self, entry: DataEntry) -> Vec<DataEntry> {
        let data = entry.data.clone();
        let mut reader = BitReader::new(&data);

        if self.evs_header_full {
            if self.evs_use_cmr {
                match reader.read(8) {
                    Ok(byte) => self.handle_cmr((byte & 0x0F) as u8),
                    Err(_) => return vec![],
                }
            }
            if reader.read(8).is_err() {
                return vec![];
            }
            let remaining = reader.remaining_bits();
            match reader.read_bytes(remaining) {
                Ok(frame) => vec![DataEntry {
                    subtype: SubType::RtpPayload,
                    data: Bytes::from(frame),
                    ..entry
                }],
                Err(_) => vec![],
            }
        } else {
            // compact format: the payload is exactly one frame
            vec![DataEntry {
                subtype: SubType::RtpPayload,
                ..entry
            }]
        }
    }
}

impl Node for AudioPayloadDecoderNode {
    fn id(&self) -> NodeId {
        NodeId::AudioPayloadDecoder
    }

    fn media(&self) -> MediaType {
        MediaType::Audio
    }

    fn state(&self) -> NodeState {
        self.state
    }

    fn start(&mut self) -> Result<()> {
        if self.codec == AudioCodec::None {
            return Err(Error::ErrInvalidParam);
        }
        self.prev_cmr = CMR_NO_REQUEST;
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
            self.codec = audio.codec;
            self.octet_aligned = audio.amr.octet_aligned;
            self.evs_header_full = audio.evs.header_full;
            self.evs_use_cmr = audio.evs.use_cmr;
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
            return vec![entry];
        }
        match self.codec {
            AudioCodec::Amr | AudioCodec::AmrWb => self.decode_amr(entry),
            AudioCodec::Evs => self.decode_evs(entry),
            AudioCodec::Pcmu | AudioCodec::Pcma => vec![DataEntry {
                subtype: SubType::RtpPayload,
                ..entry
            }],
            AudioCodec::None => vec![],
        }
    }

    fn as_any_mut(&mut self) -> &mut (dyn Any + 'static) {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AudioConfig;

    fn audio_config(codec: AudioCodec, octet_aligned: bool, ptime: u32) -> MediaConfig {
        MediaConfig::Audio(AudioConfig {
            codec,
            ptime_ms: ptime,
            amr: crate::config::AmrParams {
                octet_aligned,
                ..Default::default()
            },
            ..Default::default()
        })
    }

    fn speech_frame(len: usize, ts: u32) -> DataEntry {
        DataEntry {
            subtype: SubType::PcmData,
            data: Bytes::from(vec![0x55u8; len]),
            timestamp: ts,
            ..Default::default()
        }
    }

    fn pair(
        codec: AudioCodec,
        octet_aligned: bool,
    ) -> (AudioPayloadEncoderNode, AudioPayloadDecoderNode) {
        let (cb, _rx) = SessionCallback::new();
        let mut enc = AudioPayloadEncoderNode::new(cb.clone());
        enc.set_config(&audio_config(codec, octet_aligned, 20));
        enc.start().unwrap();
        let mut dec = AudioPayloadDecoderNode::new(cb);
        dec.set_config(&audio_config(codec, octet_aligned, 20));
        dec.start().unwrap();
        (enc, dec)
    }

    #[test]
    fn test_amr_mode_tables() {
        assert_eq!(amr_mode_to_len(0), Some(12));
        assert_eq!(amr_mode_to_len(7), Some(31));
        assert_eq!(amr_len_to_mode(31), Some(7));
        assert_eq!(amr_wb_mode_to_len(8), Some(60));
        assert_eq!(amr_wb_len_to_mode(60), Some(8));
        assert_eq!(amr_len_to_mode(99), None);
    }

    #[test]
    fn test_amr_octet_aligned_round_trip_all_modes() {
        for mode in 0u8..=7 {
            let (mut enc, mut dec) = pair(AudioCodec::Amr, true);
            let frame = speech_frame(amr_mode_to_len(mode).unwrap(), 1000);
            let packets = enc.consume(frame.clone());
            assert_eq!(packets.len(), 1, "mode {mode}");
            assert!(packets[0].mark);

            let frames = dec.consume(packets[0].clone());
            assert_eq!(frames.len(), 1, "mode {mode}");
            assert_eq!(frames[0].data.len(), frame.data.len(), "mode {mode}");
        }
    }

    #[test]
    fn test_amr_wb_octet_aligned_round_trip_all_modes() {
        for mode in 0u8..=8 {
            let (mut enc, mut dec) = pair(AudioCodec::AmrWb, true);
            let frame = speech_frame(amr_wb_mode_to_len(mode).unwrap(), 2000);
            let packets = enc.consume(frame.clone());
            assert_eq!(packets.len(), 1, "mode {mode}");

            let frames = dec.consume(packets[0].clone());
            assert_eq!(frames.len(), 1, "mode {mode}");
            assert_eq!(frames[0].data.len(), frame.data.len(), "mode {mode}");
        }
    }

    #[test]
    fn test_amr_bandwidth_efficient_round_trip() {
        let (mut enc, mut dec) = pair(AudioCodec::AmrWb, false);
        let frame = speech_frame(amr_wb_mode_to_len(8).unwrap(), 3000);
        let packets = enc.consume(frame.clone());
        assert_eq!(packets.len(), 1);
        // bandwidth-efficient packs tighter than octet-aligned
        assert!(packets[0].data.len() <= frame.data.len() + 2);

        let frames = dec.consume(packets[0].clone());
        assert_eq!(frames.len(), 1);
        // speech bits survive; the final partial byte is zero padded
        let bits = amr_wb_mode_to_bits(8).unwrap();
        let whole_bytes = bits / 8;
        assert_eq!(
            frames[0].data[..whole_bytes],
            frame.data[..whole_bytes]
        );
    }

    #[test]
    fn test_amr_bundles_frames_per_ptime() {
        let (cb, _rx) = SessionCallback::new();
        let mut enc = AudioPayloadEncoderNode::new(cb);
        enc.set_config(&audio_config(AudioCodec::Amr, true, 40));
        enc.start().unwrap();

        let f0 = speech_frame(amr_mode_to_len(7).unwrap(), 0);
        assert!(enc.consume(f0).is_empty());
        let f1 = speech_frame(amr_mode_to_len(7).unwrap(), 20);
        let packets = enc.consume(f1);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].timestamp, 0);

        let (cb2, _rx2) = SessionCallback::new();
        let mut dec = AudioPayloadDecoderNode::new(cb2);
        dec.set_config(&audio_config(AudioCodec::Amr, true, 40));
        dec.start().unwrap();
        let frames = dec.consume(packets[0].clone());
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].timestamp, 0);
        assert_eq!(frames[1].timestamp, 20);
    }

    #[test]
    fn test_marker_returns_after_dtx_gap() {
        let (mut enc, _dec) = pair(AudioCodec::AmrWb, true);
        let frame = || speech_frame(amr_wb_mode_to_len(8).unwrap(), 0);

        let first = enc.consume(frame());
        assert!(first[0].mark);
        let second = enc.consume(frame());
        assert!(!second[0].mark);

        // silence onset, then the spurt resumes
        assert!(enc.consume(DataEntry::new(SubType::DtxStart, Bytes::new())).is_empty());
        let resumed = enc.consume(frame());
        assert!(resumed[0].mark, "first frame after DTX opens a talk spurt");
        let following = enc.consume(frame());
        assert!(!following[0].mark);
    }

    #[test]
    fn test_decoder_reports_cmr() {
        let (cb, rx) = SessionCallback::new();
        let mut dec = AudioPayloadDecoderNode::new(cb);
        dec.set_config(&audio_config(AudioCodec::Amr, true, 20));
        dec.start().unwrap();

        // hand-built payload with CMR = 5
        let mut w = BitWriter::new();
        w.write(5, 4);
        w.write(0, 4);
        w.write(0, 1);
        w.write(0, 4); // mode 0
        w.write(1, 1);
        w.write(0, 2);
        let body = vec![0x11u8; amr_mode_to_len(0).unwrap()];
        w.write_bytes(&body, amr_mode_to_bits(0).unwrap());
        w.pad_to_byte();

        let entry = DataEntry::new(SubType::RtpPayload, Bytes::from(w.into_bytes()));
        let frames = dec.consume(entry);
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            rx.try_recv(),
            Ok(SessionEvent::CodecModeRequest { mode: 5 })
        ));
    }

    #[test]
    fn test_malformed_payload_dropped() {
        let (cb, _rx) = SessionCallback::new();
        let mut dec = AudioPayloadDecoderNode::new(cb);
        dec.set_config(&audio_config(AudioCodec::AmrWb, true, 20));
        dec.start().unwrap();

        let entry = DataEntry::new(SubType::RtpPayload, Bytes::from_static(&[0xF0]));
        assert!(dec.consume(entry).is_empty());
    }

    #[test]
    fn test_g711_passthrough() {
        let (mut enc, mut dec) = pair(AudioCodec::Pcmu, true);
        let frame = speech_frame(160, 500);
        let packets = enc.consume(frame.clone());
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].data, frame.data);
        let frames = dec.consume(packets[0].clone());
        assert_eq!(frames[0].data, frame.data);
    }
}
