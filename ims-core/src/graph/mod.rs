pub mod scheduler;

use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};

use shared::error::{Error, Result};

use crate::config::{MediaConfig, MediaQualityThreshold, MediaType};
use crate::device::MediaEndpoints;
use crate::event::{SessionCallback, SessionEvent, StreamState};
use crate::node::audio_device::{AudioPlayerNode, AudioSourceNode};
use crate::node::audio_payload::{AudioPayloadDecoderNode, AudioPayloadEncoderNode};
use crate::node::dtmf::{DtmfEncoderNode, DtmfSenderNode};
use crate::node::rtcp_decoder::{FeedbackRequests, RtcpDecoderNode};
use crate::node::rtcp_encoder::RtcpEncoderNode;
use crate::node::rtp_decoder::RtpDecoderNode;
use crate::node::rtp_encoder::RtpEncoderNode;
use crate::node::socket::{ProtocolKind, SocketReaderNode, SocketWriterNode};
use crate::node::text::{TextPayloadDecoderNode, TextPayloadEncoderNode, TextRendererNode, TextSourceNode};
use crate::node::video::{
    VideoPayloadDecoderNode, VideoPayloadEncoderNode, VideoRendererNode, VideoSourceNode,
};
use crate::node::{DataEntry, Node, NodeId, NodeState};
use crate::quality::MediaQualityAnalyzer;
use crate::stats::RtpSessionStats;
use crate::utils::RepeatingTimer;

use self::scheduler::StreamScheduler;

/// Which of a session's three pipelines a graph implements.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StreamDirection {
    RtpTx,
    RtpRx,
    Rtcp,
}

/// Node storage and topology of one graph. Edges are index pairs; the
/// vector owns every node.
#[derive(Default)]
pub struct GraphCore {
    pub(crate) nodes: Vec<Box<dyn Node>>,
    pub(crate) rear: Vec<Option<usize>>,
}

impl GraphCore {
    pub fn add_node(&mut self, node: Box<dyn Node>) -> usize {
        self.nodes.push(node);
        self.rear.push(None);
        self.nodes.len() - 1
    }

    /// Connects `front`'s output to `rear`'s input.
    pub fn connect(&mut self, front: usize, rear: usize) {
        self.rear[front] = Some(rear);
    }

    pub fn find(&self, id: NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| n.id() == id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, idx: usize) -> &dyn Node {
        self.nodes[idx].as_ref()
    }

    /// Runs one processing step of `idx` and routes whatever it produced.
    pub fn run_node(&mut self, idx: usize) {
        let outputs = self.nodes[idx].process();
        self.route(idx, outputs);
    }

    /// Runs the periodic step of `idx` and routes its output.
    pub fn poll_runtime(&mut self, idx: usize) {
        if self.nodes[idx].state() != NodeState::Running {
            return;
        }
        let outputs = self.nodes[idx].poll_runtime();
        self.route(idx, outputs);
    }

    /// Moves entries from `from` towards the sinks: runtime rears process
    /// inline on this thread, scheduled rears buffer in their queue.
    pub fn route(&mut self, from: usize, outputs: Vec<DataEntry>) {
        let mut work: VecDeque<(usize, DataEntry)> = VecDeque::new();
        if let Some(rear) = self.rear[from] {
            for entry in outputs {
                work.push_back((rear, entry));
            }
        }

        while let Some((idx, entry)) = work.pop_front() {
            let node = &mut self.nodes[idx];
            if node.state() != NodeState::Running {
                continue;
            }
            if node.is_runtime() {
                let outputs = node.consume(entry);
                if let Some(rear) = self.rear[idx] {
                    for entry in outputs {
                        work.push_back((rear, entry));
                    }
                }
            } else {
                node.queue().push(entry);
            }
        }
    }

    /// Borrows a concrete node by id.
    pub fn with_node<N: 'static, R>(
        &mut self,
        id: NodeId,
        f: impl FnOnce(&mut N) -> R,
    ) -> Option<R> {
        let idx = self.find(id)?;
        self.nodes[idx].as_any_mut().downcast_mut::<N>().map(f)
    }
}

/// Owns, wires and life-cycles the node set of one direction.
pub struct StreamGraph {
    direction: StreamDirection,
    media: MediaType,
    callback: SessionCallback,
    core: Arc<Mutex<GraphCore>>,
    scheduler: StreamScheduler,
    /// Creation order; `start` walks it front to back.
    to_start: Vec<usize>,
    started: Vec<usize>,
    state: StreamState,
    config: Option<MediaConfig>,
    pumps: Vec<RepeatingTimer>,
    has_surface: bool,
}

/// Shared collaborators the graph wires into its nodes.
pub struct GraphContext<'a> {
    pub rtp_fd: RawFd,
    pub rtcp_fd: RawFd,
    pub stats: Arc<RtpSessionStats>,
    pub analyzer: Option<Arc<Mutex<MediaQualityAnalyzer>>>,
    pub endpoints: &'a mut MediaEndpoints,
    pub threshold: MediaQualityThreshold,
}

impl StreamGraph {
    pub fn new(direction: StreamDirection, media: MediaType, callback: SessionCallback) -> Self {
        let core = Arc::new(Mutex::new(GraphCore::default()));
        Self {
            direction,
            media,
            callback,
            scheduler: StreamScheduler::new(core.clone()),
            core,
            to_start: vec![],
            started: vec![],
            state: StreamState::Idle,
            config: None,
            pumps: vec![],
            has_surface: false,
        }
    }

    pub fn direction(&self) -> StreamDirection {
        self.direction
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn config(&self) -> Option<&MediaConfig> {
        self.config.as_ref()
    }

    pub fn core(&self) -> Arc<Mutex<GraphCore>> {
        self.core.clone()
    }

    fn set_state(&mut self, state: StreamState) {
        if self.state != state {
            self.state = state;
            self.callback
                .send_event(SessionEvent::StateChanged { state });
        }
    }

    fn add(&mut self, core: &mut GraphCore, node: Box<dyn Node>) -> usize {
        let runtime = node.is_runtime();
        let idx = core.add_node(node);
        self.to_start.push(idx);
        if !runtime {
            self.scheduler.register_node(idx);
        }
        idx
    }

    /// Builds the node list for this direction and media, ready to start.
    pub fn create(&mut self, config: &MediaConfig, ctx: &mut GraphContext<'_>) -> Result<()> {
        if config.media_type() != self.media {
            return Err(Error::ErrInvalidParam);
        }
        let core = self.core.clone();
        let mut core = core.lock().unwrap();

        match (self.direction, self.media) {
            (StreamDirection::RtpTx, MediaType::Audio) => {
                let mut source = AudioSourceNode::new(self.callback.clone());
                if let Some(input) = ctx.endpoints.audio_input.take() {
                    source.set_input(input);
                }
                let source = self.add(&mut core, Box::new(source));

                let payload = self.add(
                    &mut core,
                    Box::new(AudioPayloadEncoderNode::new(self.callback.clone())),
                );
                let rtp = self.add(
                    &mut core,
                    Box::new(RtpEncoderNode::new(
                        self.media,
                        self.callback.clone(),
                        ctx.stats.clone(),
                    )),
                );
                let writer = self.add(
                    &mut core,
                    Box::new(SocketWriterNode::new(
                        self.media,
                        ProtocolKind::Rtp,
                        ctx.rtp_fd,
                        self.callback.clone(),
                    )),
                );
                core.connect(source, payload);
                core.connect(payload, rtp);
                core.connect(rtp, writer);

                let dtmf = self.add(
                    &mut core,
                    Box::new(DtmfEncoderNode::new(self.callback.clone())),
                );
                let dtmf_sender = self.add(
                    &mut core,
                    Box::new(DtmfSenderNode::new(self.callback.clone())),
                );
                core.connect(dtmf, dtmf_sender);
                core.connect(dtmf_sender, rtp);
            }
            (StreamDirection::RtpRx, MediaType::Audio) => {
                let reader = self.add(
                    &mut core,
                    Box::new(SocketReaderNode::new(
                        self.media,
                        ProtocolKind::Rtp,
                        ctx.rtp_fd,
                        self.callback.clone(),
                    )),
                );
                let mut rtp_decoder =
                    RtpDecoderNode::new(self.media, self.callback.clone(), ctx.stats.clone());
                if let Some(analyzer) = &ctx.analyzer {
                    rtp_decoder.set_analyzer(analyzer.clone());
                }
                rtp_decoder
                    .set_inactivity_timer_sec(ctx.threshold.rtp_inactivity_timer_ms / 1000);
                let rtp = self.add(&mut core, Box::new(rtp_decoder));

                let payload = self.add(
                    &mut core,
                    Box::new(AudioPayloadDecoderNode::new(self.callback.clone())),
                );

                let mut player = AudioPlayerNode::new(self.callback.clone());
                if let Some(output) = ctx.endpoints.audio_output.take() {
                    player.set_output(output);
                }
                if let Some(analyzer) = &ctx.analyzer {
                    player.set_analyzer(analyzer.clone());
                }
                let player = self.add(&mut core, Box::new(player));

                core.connect(reader, rtp);
                core.connect(rtp, payload);
                core.connect(payload, player);
            }
            (StreamDirection::RtpTx, MediaType::Video) => {
                let mut source = VideoSourceNode::new(self.callback.clone());
                if let Some(input) = ctx.endpoints.video_input.take() {
                    source.set_input(input);
                }
                let source = self.add(&mut core, Box::new(source));
                let payload = self.add(
                    &mut core,
                    Box::new(VideoPayloadEncoderNode::new(self.callback.clone())),
                );
                let rtp = self.add(
                    &mut core,
                    Box::new(RtpEncoderNode::new(
                        self.media,
                        self.callback.clone(),
                        ctx.stats.clone(),
                    )),
                );
                let writer = self.add(
                    &mut core,
                    Box::new(SocketWriterNode::new(
                        self.media,
                        ProtocolKind::Rtp,
                        ctx.rtp_fd,
                        self.callback.clone(),
                    )),
                );
                core.connect(source, payload);
                core.connect(payload, rtp);
                core.connect(rtp, writer);
            }
            (StreamDirection::RtpRx, MediaType::Video) => {
                let reader = self.add(
                    &mut core,
                    Box::new(SocketReaderNode::new(
                        self.media,
                        ProtocolKind::Rtp,
                        ctx.rtp_fd,
                        self.callback.clone(),
                    )),
                );
                let mut rtp_decoder =
                    RtpDecoderNode::new(self.media, self.callback.clone(), ctx.stats.clone());
                rtp_decoder
                    .set_inactivity_timer_sec(ctx.threshold.rtp_inactivity_timer_ms / 1000);
                let rtp = self.add(&mut core, Box::new(rtp_decoder));
                let payload = self.add(
                    &mut core,
                    Box::new(VideoPayloadDecoderNode::new(self.callback.clone())),
                );
                let mut renderer = VideoRendererNode::new(self.callback.clone());
                if let Some(output) = ctx.endpoints.video_output.take() {
                    renderer.set_output(output);
                    self.has_surface = true;
                }
                let renderer = self.add(&mut core, Box::new(renderer));

                core.connect(reader, rtp);
                core.connect(rtp, payload);
                core.connect(payload, renderer);
            }
            (StreamDirection::RtpTx, MediaType::Text) => {
                let source = self.add(
                    &mut core,
                    Box::new(TextSourceNode::new(self.callback.clone())),
                );
                let payload = self.add(
                    &mut core,
                    Box::new(TextPayloadEncoderNode::new(self.callback.clone())),
                );
                let rtp = self.add(
                    &mut core,
                    Box::new(RtpEncoderNode::new(
                        self.media,
                        self.callback.clone(),
                        ctx.stats.clone(),
                    )),
                );
                let writer = self.add(
                    &mut core,
                    Box::new(SocketWriterNode::new(
                        self.media,
                        ProtocolKind::Rtp,
                        ctx.rtp_fd,
                        self.callback.clone(),
                    )),
                );
                core.connect(source, payload);
                core.connect(payload, rtp);
                core.connect(rtp, writer);
            }
            (StreamDirection::RtpRx, MediaType::Text) => {
                let reader = self.add(
                    &mut core,
                    Box::new(SocketReaderNode::new(
                        self.media,
                        ProtocolKind::Rtp,
                        ctx.rtp_fd,
                        self.callback.clone(),
                    )),
                );
                let mut rtp_decoder =
                    RtpDecoderNode::new(self.media, self.callback.clone(), ctx.stats.clone());
                rtp_decoder
                    .set_inactivity_timer_sec(ctx.threshold.rtp_inactivity_timer_ms / 1000);
                let rtp = self.add(&mut core, Box::new(rtp_decoder));
                let payload = self.add(
                    &mut core,
                    Box::new(TextPayloadDecoderNode::new(self.callback.clone())),
                );
                let renderer = self.add(
                    &mut core,
                    Box::new(TextRendererNode::new(self.callback.clone())),
                );

                core.connect(reader, rtp);
                core.connect(rtp, payload);
                core.connect(payload, renderer);
            }
            (StreamDirection::Rtcp, _) => {
                let mut encoder =
                    RtcpEncoderNode::new(self.media, self.callback.clone(), ctx.stats.clone());
                if let Some(analyzer) = &ctx.analyzer {
                    encoder.set_analyzer(analyzer.clone());
                }
                let encoder = self.add(&mut core, Box::new(encoder));
                let writer = self.add(
                    &mut core,
                    Box::new(SocketWriterNode::new(
                        self.media,
                        ProtocolKind::Rtcp,
                        ctx.rtcp_fd,
                        self.callback.clone(),
                    )),
                );
                core.connect(encoder, writer);

                let reader = self.add(
                    &mut core,
                    Box::new(SocketReaderNode::new(
                        self.media,
                        ProtocolKind::Rtcp,
                        ctx.rtcp_fd,
                        self.callback.clone(),
                    )),
                );
                let mut decoder =
                    RtcpDecoderNode::new(self.media, self.callback.clone(), ctx.stats.clone());
                if let Some(analyzer) = &ctx.analyzer {
                    decoder.set_analyzer(analyzer.clone());
                }
                decoder
                    .set_inactivity_timer_sec(ctx.threshold.rtcp_inactivity_timer_ms / 1000);
                let decoder = self.add(&mut core, Box::new(decoder));
                core.connect(reader, decoder);
            }
        }

        for &idx in &self.to_start {
            core.nodes[idx].set_config(config);
        }
        drop(core);

        self.config = Some(config.clone());
        self.set_state(StreamState::Created);
        Ok(())
    }

    fn spawn_pumps(&mut self) {
        let core = self.core.clone();
        let periods: Vec<(usize, std::time::Duration)> = {
            let core = core.lock().unwrap();
            core.nodes
                .iter()
                .enumerate()
                .filter_map(|(idx, n)| n.runtime_period().map(|p| (idx, p)))
                .collect()
        };
        for (idx, period) in periods {
            let pump_core = core.clone();
            self.pumps.push(RepeatingTimer::start(period, move || {
                let mut core = pump_core.lock().unwrap();
                core.poll_runtime(idx);
            }));
        }
    }

    /// Starts nodes in insertion order; a failure stops whatever already
    /// started and returns the original error.
    pub fn start(&mut self) -> Result<()> {
        if self.state == StreamState::Running {
            return Ok(());
        }
        if self.direction == StreamDirection::RtpRx
            && self.media == MediaType::Video
            && !self.has_surface
        {
            self.set_state(StreamState::WaitSurface);
            return Ok(());
        }

        {
            let core = self.core.clone();
            let mut core = core.lock().unwrap();
            for i in 0..self.to_start.len() {
                let idx = self.to_start[i];
                if core.nodes[idx].state() == NodeState::Running {
                    self.started.push(idx);
                    continue;
                }
                match core.nodes[idx].start() {
                    Ok(()) => self.started.push(idx),
                    Err(e) => {
                        log::error!("node [{:?}] failed to start: {e}", core.nodes[idx].id());
                        for &started_idx in self.started.iter().rev() {
                            core.nodes[started_idx].stop();
                        }
                        self.started.clear();
                        return Err(e);
                    }
                }
            }
        }

        self.scheduler.start();
        self.spawn_pumps();
        self.set_state(StreamState::Running);
        Ok(())
    }

    /// Stops in reverse start order. Idempotent.
    pub fn stop(&mut self) {
        self.scheduler.stop();

        {
            let core = self.core.clone();
            let mut core = core.lock().unwrap();
            for &idx in self.started.iter().rev() {
                core.nodes[idx].stop();
            }
        }
        self.started.clear();
        self.pumps.clear();

        if self.state == StreamState::Running || self.state == StreamState::WaitSurface {
            self.set_state(StreamState::Created);
        }
    }

    fn direction_active(&self, config: &MediaConfig) -> bool {
        let direction = config.rtp().direction;
        match self.direction {
            StreamDirection::RtpTx => direction.transmits(),
            StreamDirection::RtpRx => direction.receives(),
            StreamDirection::Rtcp => config.rtp().rtcp.interval_sec != 0,
        }
    }

    /// Diffs against the cached config; pauses, resumes, or restarts the
    /// node set as the new config demands.
    pub fn update(&mut self, config: &MediaConfig) -> Result<()> {
        if self.config.as_ref() == Some(config) {
            log::debug!("update with identical config, nothing to do");
            return Ok(());
        }

        if !self.direction_active(config) {
            log::debug!("direction pauses {:?} graph", self.direction);
            self.config = Some(config.clone());
            self.stop();
            return Ok(());
        }

        let was_running = self.state == StreamState::Running;
        if was_running {
            self.scheduler.stop();
            self.pumps.clear();
        }

        let mut result = Ok(());
        {
            let core = self.core.clone();
            let mut core = core.lock().unwrap();
            for &idx in &self.to_start {
                if let Err(e) = core.nodes[idx].update_config(config) {
                    log::error!(
                        "node [{:?}] failed to update: {e}",
                        core.nodes[idx].id()
                    );
                    result = Err(e);
                }
            }
        }
        self.config = Some(config.clone());

        if was_running {
            self.scheduler.start();
            self.spawn_pumps();
        } else if self.state == StreamState::Created {
            // a paused graph resumes when its direction comes back
            self.started.clear();
            return self.start();
        }

        result
    }

    /// Forwarded to the inbound decoders only (Rx and RTCP graphs).
    pub fn set_media_quality_threshold(&mut self, threshold: &MediaQualityThreshold) -> bool {
        let core = self.core.clone();
        let mut core = core.lock().unwrap();
        match self.direction {
            StreamDirection::RtpRx => core
                .with_node::<RtpDecoderNode, _>(NodeId::RtpDecoder, |n| {
                    n.set_inactivity_timer_sec(threshold.rtp_inactivity_timer_ms / 1000)
                })
                .is_some(),
            StreamDirection::Rtcp => core
                .with_node::<RtcpDecoderNode, _>(NodeId::RtcpDecoder, |n| {
                    n.set_inactivity_timer_sec(threshold.rtcp_inactivity_timer_ms / 1000)
                })
                .is_some(),
            StreamDirection::RtpTx => false,
        }
    }

    /// Tx graph: expand one DTMF keypress into its packet train.
    pub fn start_dtmf(&mut self, digit: char, volume: u8, duration_ms: u32) {
        let core = self.core.clone();
        let mut core = core.lock().unwrap();
        if let Some(idx) = core.find(NodeId::DtmfEncoder) {
            let outputs = core.nodes[idx]
                .as_any_mut()
                .downcast_mut::<DtmfEncoderNode>()
                .map(|n| n.start_tone(digit, volume, duration_ms))
                .unwrap_or_default();
            core.route(idx, outputs);
        }
        self.scheduler.awake();
    }

    /// Tx graph (text): queue characters for the next buffering tick.
    pub fn send_rtt(&mut self, text: &str) {
        let core = self.core.clone();
        let mut core = core.lock().unwrap();
        core.with_node::<TextSourceNode, _>(NodeId::TextSource, |n| n.send_rtt(text));
        drop(core);
        self.scheduler.awake();
    }

    /// Tx graph: attach a host header extension to the next packet.
    pub fn send_rtp_header_extension(&mut self, profile: u16, payload: bytes::Bytes) {
        let core = self.core.clone();
        let mut core = core.lock().unwrap();
        core.with_node::<RtpEncoderNode, _>(NodeId::RtpEncoder, |n| {
            n.send_header_extension(profile, payload)
        });
    }

    /// RTCP graph: compose and push the BYE towards the wire.
    pub fn send_rtcp_bye(&mut self, reason: &str) {
        let core = self.core.clone();
        let mut core = core.lock().unwrap();
        if let Some(idx) = core.find(NodeId::RtcpEncoder) {
            let outputs = core.nodes[idx]
                .as_any_mut()
                .downcast_mut::<RtcpEncoderNode>()
                .map(|n| n.create_bye(reason))
                .unwrap_or_default();
            core.route(idx, outputs);
        }
    }

    /// Gate the socket writers; only a BYE passes once disabled.
    pub fn set_socket_disabled(&mut self, disabled: bool) {
        let core = self.core.clone();
        let mut core = core.lock().unwrap();
        for idx in 0..core.nodes.len() {
            if core.nodes[idx].id() == NodeId::SocketWriter {
                if let Some(writer) = core.nodes[idx]
                    .as_any_mut()
                    .downcast_mut::<SocketWriterNode>()
                {
                    writer.set_disabled(disabled);
                }
            }
        }
    }

    /// Tx graph: retransmit sequences the peer reported missing.
    pub fn retransmit(&mut self, seqs: &[u16]) {
        if seqs.is_empty() {
            return;
        }
        let core = self.core.clone();
        let mut core = core.lock().unwrap();
        if let Some(idx) = core.find(NodeId::RtpEncoder) {
            let outputs = core.nodes[idx]
                .as_any_mut()
                .downcast_mut::<RtpEncoderNode>()
                .map(|n| n.retransmit(seqs))
                .unwrap_or_default();
            core.route(idx, outputs);
        }
    }

    /// Tx graph (video): forward an IDR request to the encoder seam.
    pub fn request_idr(&mut self) {
        let core = self.core.clone();
        let mut core = core.lock().unwrap();
        core.with_node::<VideoSourceNode, _>(NodeId::VideoSource, |n| n.request_idr());
    }

    /// Tx graph (video): forward a bitrate change to the encoder seam.
    pub fn set_video_bitrate(&mut self, kbps: u32) {
        let core = self.core.clone();
        let mut core = core.lock().unwrap();
        core.with_node::<VideoSourceNode, _>(NodeId::VideoSource, |n| n.set_bitrate(kbps));
    }

    /// RTCP graph: feedback the decoder collected since last polled.
    pub fn take_feedback(&mut self) -> FeedbackRequests {
        let core = self.core.clone();
        let mut core = core.lock().unwrap();
        core.with_node::<RtcpDecoderNode, _>(NodeId::RtcpDecoder, |n| n.take_feedback())
            .unwrap_or_default()
    }

    /// RTCP graph: emit a NACK for the given missing sequences.
    pub fn send_nack(&mut self, missing: &[u16]) {
        if missing.is_empty() {
            return;
        }
        let core = self.core.clone();
        let mut core = core.lock().unwrap();
        if let Some(idx) = core.find(NodeId::RtcpEncoder) {
            let outputs = core.nodes[idx]
                .as_any_mut()
                .downcast_mut::<RtcpEncoderNode>()
                .map(|n| n.send_nack(missing))
                .unwrap_or_default();
            core.route(idx, outputs);
        }
    }

    /// Rx graph (video): sequences blocking frame assembly.
    pub fn missing_video_sequences(&mut self) -> Vec<u16> {
        let core = self.core.clone();
        let mut core = core.lock().unwrap();
        core.with_node::<VideoRendererNode, _>(NodeId::VideoRenderer, |n| {
            n.missing_sequence_numbers()
        })
        .unwrap_or_default()
    }

    /// Rx graph (video): late surface arrival releases WaitSurface.
    pub fn set_surface(&mut self, output: Box<dyn crate::device::VideoOutput>) -> Result<()> {
        {
            let core = self.core.clone();
            let mut core = core.lock().unwrap();
            core.with_node::<VideoRendererNode, _>(NodeId::VideoRenderer, |n| {
                n.set_output(output)
            });
        }
        self.has_surface = true;
        if self.state == StreamState::WaitSurface {
            return self.start();
        }
        Ok(())
    }
}

impl Drop for StreamGraph {
    fn drop(&mut self) {
        self.stop();
        self.set_state(StreamState::Idle);
    }
}
