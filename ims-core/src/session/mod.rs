use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use shared::error::{Error, Result};

use crate::config::{MediaConfig, MediaQualityThreshold, MediaType};
use crate::device::MediaEndpoints;
use crate::event::{SessionCallback, SessionEvent, SessionState, StreamState};
use crate::graph::{GraphContext, GraphCore, StreamDirection, StreamGraph};
use crate::node::NodeId;
use crate::node::audio_payload::{AudioPayloadDecoderNode, AudioPayloadEncoderNode};
use crate::node::rtcp_decoder::RtcpDecoderNode;
use crate::node::rtcp_encoder::RtcpEncoderNode;
use crate::node::rtp_encoder::RtpEncoderNode;
use crate::node::video::{VideoRendererNode, VideoSourceNode};
use crate::quality::MediaQualityAnalyzer;
use crate::stats::RtpSessionStats;
use crate::utils::RepeatingTimer;

/// Control messages accepted by the [`MediaManager`].
pub enum SessionCommand {
    OpenSession {
        session_id: u32,
        media: MediaType,
        rtp_fd: RawFd,
        rtcp_fd: RawFd,
        endpoints: MediaEndpoints,
    },
    CloseSession {
        session_id: u32,
    },
    ModifySession {
        session_id: u32,
        config: MediaConfig,
    },
    AddConfig {
        session_id: u32,
        config: MediaConfig,
    },
    ConfirmConfig {
        session_id: u32,
        config: MediaConfig,
    },
    DeleteConfig {
        session_id: u32,
        config: MediaConfig,
    },
    SendDtmf {
        session_id: u32,
        digit: char,
        volume: u8,
        duration_ms: u32,
    },
    SendRtpHeaderExtension {
        session_id: u32,
        profile: u16,
        payload: Bytes,
    },
    SetMediaQualityThreshold {
        session_id: u32,
        threshold: MediaQualityThreshold,
    },
    SendRtt {
        session_id: u32,
        text: String,
    },
}

/// Moves peer feedback between the three graphs once a second: NACKed
/// sequences to the Tx history, IDR requests to the video source, video
/// receive gaps back out as NACK.
fn run_maintenance(
    media: MediaType,
    tx_core: &Arc<Mutex<GraphCore>>,
    rx_core: &Arc<Mutex<GraphCore>>,
    rtcp_core: &Arc<Mutex<GraphCore>>,
) {
    let feedback = {
        let mut core = rtcp_core.lock().unwrap();
        core.with_node::<RtcpDecoderNode, _>(NodeId::RtcpDecoder, |n| n.take_feedback())
            .unwrap_or_default()
    };

    if !feedback.nacked.is_empty() {
        let mut core = tx_core.lock().unwrap();
        if let Some(idx) = core.find(NodeId::RtpEncoder) {
            let outputs = core.nodes[idx]
                .as_any_mut()
                .downcast_mut::<RtpEncoderNode>()
                .map(|n| n.retransmit(&feedback.nacked))
                .unwrap_or_default();
            core.route(idx, outputs);
        }
    }

    if feedback.idr_requested {
        let mut core = tx_core.lock().unwrap();
        core.with_node::<VideoSourceNode, _>(NodeId::VideoSource, |n| n.request_idr());
    }

    if media == MediaType::Audio {
        // an inbound CMR steers our own encoder's outbound mode
        let cmr = {
            let mut core = rx_core.lock().unwrap();
            core.with_node::<AudioPayloadDecoderNode, _>(NodeId::AudioPayloadDecoder, |n| {
                n.take_pending_cmr()
            })
            .flatten()
        };
        if let Some(cmr) = cmr {
            let mut core = tx_core.lock().unwrap();
            core.with_node::<AudioPayloadEncoderNode, _>(NodeId::AudioPayloadEncoder, |n| {
                n.set_codec_mode_request(cmr)
            });
        }
    }

    if media == MediaType::Video {
        let missing = {
            let mut core = rx_core.lock().unwrap();
            core.with_node::<VideoRendererNode, _>(NodeId::VideoRenderer, |n| {
                n.missing_sequence_numbers()
            })
            .unwrap_or_default()
        };
        if !missing.is_empty() {
            let mut core = rtcp_core.lock().unwrap();
            if let Some(idx) = core.find(NodeId::RtcpEncoder) {
                let outputs = core.nodes[idx]
                    .as_any_mut()
                    .downcast_mut::<RtcpEncoderNode>()
                    .map(|n| n.send_nack(&missing))
                    .unwrap_or_default();
                core.route(idx, outputs);
            }
        }
    }
}

/// One media session: three stream graphs over a pair of supplied
/// descriptors, plus the audio quality analyzer.
pub struct Session {
    id: u32,
    media: MediaType,
    rtp_fd: RawFd,
    rtcp_fd: RawFd,
    callback: SessionCallback,
    endpoints: MediaEndpoints,

    stats: Option<Arc<RtpSessionStats>>,
    analyzer: Option<Arc<Mutex<MediaQualityAnalyzer>>>,
    analyzer_timer: Option<RepeatingTimer>,
    maintenance_timer: Option<RepeatingTimer>,

    graphs_tx: Vec<StreamGraph>,
    graphs_rx: Vec<StreamGraph>,
    graphs_rtcp: Vec<StreamGraph>,

    threshold: MediaQualityThreshold,
    state: SessionState,
}

impl Session {
    pub fn open(
        id: u32,
        media: MediaType,
        rtp_fd: RawFd,
        rtcp_fd: RawFd,
        endpoints: MediaEndpoints,
        callback: SessionCallback,
    ) -> Self {
        log::debug!("session [{id}] opened for {media:?}");
        Self {
            id,
            media,
            rtp_fd,
            rtcp_fd,
            callback,
            endpoints,
            stats: None,
            analyzer: None,
            analyzer_timer: None,
            maintenance_timer: None,
            graphs_tx: vec![],
            graphs_rx: vec![],
            graphs_rtcp: vec![],
            threshold: MediaQualityThreshold::default(),
            state: SessionState::Opened,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn media(&self) -> MediaType {
        self.media
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            self.state = state;
            self.callback
                .send_event(SessionEvent::SessionChanged { state });
        }
    }

    fn ensure_collaborators(&mut self, config: &MediaConfig) {
        if self.stats.is_none() {
            self.stats = Some(Arc::new(RtpSessionStats::new(config.clock_rate())));
        }
        if self.media == MediaType::Audio && self.analyzer.is_none() {
            let analyzer = Arc::new(Mutex::new(MediaQualityAnalyzer::new(self.callback.clone())));
            if let Some(audio) = config.audio() {
                analyzer.lock().unwrap().set_config(audio);
            }
            let timer_analyzer = analyzer.clone();
            self.analyzer_timer = Some(RepeatingTimer::start(Duration::from_secs(1), move || {
                timer_analyzer.lock().unwrap().process_timer();
            }));
            self.analyzer = Some(analyzer);
        }
    }

    fn create_graph_set(&mut self, config: &MediaConfig) -> Result<()> {
        for direction in [
            StreamDirection::RtpTx,
            StreamDirection::RtpRx,
            StreamDirection::Rtcp,
        ] {
            let mut graph = StreamGraph::new(direction, self.media, self.callback.clone());
            let mut ctx = GraphContext {
                rtp_fd: self.rtp_fd,
                rtcp_fd: self.rtcp_fd,
                stats: self.stats.clone().expect("stats exist"),
                analyzer: self.analyzer.clone(),
                endpoints: &mut self.endpoints,
                threshold: self.threshold,
            };
            graph.create(config, &mut ctx)?;
            match direction {
                StreamDirection::RtpTx => self.graphs_tx.push(graph),
                StreamDirection::RtpRx => self.graphs_rx.push(graph),
                StreamDirection::Rtcp => self.graphs_rtcp.push(graph),
            }
        }
        Ok(())
    }

    fn start_maintenance(&mut self) {
        if self.maintenance_timer.is_some() {
            return;
        }
        let (Some(tx), Some(rx), Some(rtcp)) = (
            self.graphs_tx.first(),
            self.graphs_rx.first(),
            self.graphs_rtcp.first(),
        ) else {
            return;
        };
        let media = self.media;
        let tx_core = tx.core();
        let rx_core = rx.core();
        let rtcp_core = rtcp.core();
        self.maintenance_timer = Some(RepeatingTimer::start(Duration::from_secs(1), move || {
            run_maintenance(media, &tx_core, &rx_core, &rtcp_core);
        }));
    }

    fn refresh_session_state(&mut self) {
        let any_rtp_running = self
            .graphs_tx
            .iter()
            .chain(self.graphs_rx.iter())
            .any(|g| g.state() == StreamState::Running);
        let any_created = !self.graphs_tx.is_empty() || !self.graphs_rx.is_empty();

        let state = if any_rtp_running {
            SessionState::Active
        } else if any_created {
            SessionState::Suspended
        } else {
            SessionState::Opened
        };
        self.set_state(state);
    }

    /// `ModifySession`: lazily creates the graph set on first call, then
    /// reconciles every graph with the new config.
    pub fn modify(&mut self, config: &MediaConfig) -> Result<()> {
        if config.media_type() != self.media {
            return Err(Error::ErrInvalidParam);
        }
        if config.rtp().remote_address.is_empty() {
            return Err(Error::ErrInvalidParam);
        }

        self.ensure_collaborators(config);

        if self.graphs_tx.is_empty() {
            self.create_graph_set(config)?;
            let result: Result<()> = (|| {
                for graph in self
                    .graphs_tx
                    .iter_mut()
                    .chain(self.graphs_rx.iter_mut())
                    .chain(self.graphs_rtcp.iter_mut())
                {
                    if graph_direction_enabled(graph, config) {
                        graph.start()?;
                    }
                }
                Ok(())
            })();
            if let Err(e) = result {
                for graph in self
                    .graphs_tx
                    .iter_mut()
                    .chain(self.graphs_rx.iter_mut())
                    .chain(self.graphs_rtcp.iter_mut())
                {
                    graph.stop();
                }
                return Err(e);
            }
        } else {
            for graph in self
                .graphs_tx
                .iter_mut()
                .chain(self.graphs_rx.iter_mut())
                .chain(self.graphs_rtcp.iter_mut())
            {
                graph.update(config)?;
            }
        }

        if let (Some(analyzer), Some(audio)) = (&self.analyzer, config.audio()) {
            let mut analyzer = analyzer.lock().unwrap();
            if !analyzer.is_same_config(audio) {
                analyzer.set_config(audio);
            }
        }

        self.start_maintenance();
        self.refresh_session_state();
        Ok(())
    }

    /// `AddConfig`: suspend the active RTP flow and stage a graph set for
    /// the candidate config; RTCP keeps running for both.
    pub fn add_config(&mut self, config: &MediaConfig) -> Result<()> {
        if self.graphs_tx.is_empty() {
            return self.modify(config);
        }

        for graph in self.graphs_tx.iter_mut().chain(self.graphs_rx.iter_mut()) {
            graph.stop();
        }

        self.create_graph_set(config)?;
        if let Some(rtcp) = self.graphs_rtcp.last_mut() {
            rtcp.start()?;
        }
        self.refresh_session_state();
        Ok(())
    }

    /// `ConfirmConfig`: keep the graph set whose config matches, drop the
    /// rest, and run the confirmed one.
    pub fn confirm_config(&mut self, config: &MediaConfig) -> Result<()> {
        retain_matching(&mut self.graphs_tx, config);
        retain_matching(&mut self.graphs_rx, config);
        retain_matching(&mut self.graphs_rtcp, config);

        if self.graphs_tx.is_empty() {
            return Err(Error::ErrNotReady);
        }

        for graph in self
            .graphs_tx
            .iter_mut()
            .chain(self.graphs_rx.iter_mut())
            .chain(self.graphs_rtcp.iter_mut())
        {
            if graph_direction_enabled(graph, config) {
                graph.start()?;
            }
        }
        self.refresh_session_state();
        Ok(())
    }

    /// `DeleteConfig`: remove the graph set built for this config.
    pub fn delete_config(&mut self, config: &MediaConfig) {
        remove_matching(&mut self.graphs_tx, config);
        remove_matching(&mut self.graphs_rx, config);
        remove_matching(&mut self.graphs_rtcp, config);
        self.refresh_session_state();
    }

    pub fn send_dtmf(&mut self, digit: char, volume: u8, duration_ms: u32) {
        for graph in &mut self.graphs_tx {
            if graph.state() == StreamState::Running {
                graph.start_dtmf(digit, volume, duration_ms);
            }
        }
    }

    pub fn send_rtt(&mut self, text: &str) {
        for graph in &mut self.graphs_tx {
            if graph.state() == StreamState::Running {
                graph.send_rtt(text);
            }
        }
    }

    pub fn send_rtp_header_extension(&mut self, profile: u16, payload: Bytes) {
        for graph in &mut self.graphs_tx {
            graph.send_rtp_header_extension(profile, payload.clone());
        }
    }

    pub fn set_media_quality_threshold(&mut self, threshold: &MediaQualityThreshold) {
        self.threshold = *threshold;
        for graph in self.graphs_rx.iter_mut().chain(self.graphs_rtcp.iter_mut()) {
            graph.set_media_quality_threshold(threshold);
        }
        if let Some(analyzer) = &self.analyzer {
            analyzer.lock().unwrap().set_threshold(threshold);
        }
    }

    /// Late display surface for a video receive graph.
    pub fn set_display_surface(&mut self, output: Box<dyn crate::device::VideoOutput>) -> Result<()> {
        match self.graphs_rx.first_mut() {
            Some(graph) => {
                let result = graph.set_surface(output);
                self.refresh_session_state();
                result
            }
            None => Err(Error::ErrNotReady),
        }
    }

    /// Orderly shutdown: gate the writers, push one BYE, stop everything.
    pub fn close(&mut self) {
        log::debug!("session [{}] closing", self.id);
        self.maintenance_timer = None;
        self.analyzer_timer = None;

        for graph in self
            .graphs_tx
            .iter_mut()
            .chain(self.graphs_rx.iter_mut())
            .chain(self.graphs_rtcp.iter_mut())
        {
            graph.set_socket_disabled(true);
        }
        for graph in &mut self.graphs_rtcp {
            if graph.state() == StreamState::Running {
                graph.send_rtcp_bye("session closed");
            }
        }

        self.graphs_tx.clear();
        self.graphs_rx.clear();
        self.graphs_rtcp.clear();
        self.set_state(SessionState::Closed);
    }
}

fn graph_direction_enabled(graph: &StreamGraph, config: &MediaConfig) -> bool {
    let direction = config.rtp().direction;
    match graph.direction() {
        StreamDirection::RtpTx => direction.transmits(),
        StreamDirection::RtpRx => direction.receives(),
        StreamDirection::Rtcp => config.rtp().rtcp.interval_sec != 0,
    }
}

fn retain_matching(graphs: &mut Vec<StreamGraph>, config: &MediaConfig) {
    graphs.retain_mut(|g| {
        let keep = g.config() == Some(config);
        if !keep {
            g.stop();
        }
        keep
    });
}

fn remove_matching(graphs: &mut Vec<StreamGraph>, config: &MediaConfig) {
    graphs.retain_mut(|g| {
        let matches = g.config() == Some(config);
        if matches {
            g.stop();
        }
        !matches
    });
}

/// Owns every session and executes host commands against them.
pub struct MediaManager {
    callback: SessionCallback,
    sessions: HashMap<u32, Session>,
}

impl MediaManager {
    pub fn new(callback: SessionCallback) -> Self {
        Self {
            callback,
            sessions: HashMap::new(),
        }
    }

    pub fn session(&self, id: u32) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn session_mut(&mut self, id: u32) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    pub fn handle(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::OpenSession {
                session_id,
                media,
                rtp_fd,
                rtcp_fd,
                endpoints,
            } => {
                if self.sessions.contains_key(&session_id) {
                    self.callback.send_event(SessionEvent::OpenFailure {
                        session_id,
                        error: Error::ErrInvalidParam,
                    });
                    return;
                }
                let session = Session::open(
                    session_id,
                    media,
                    rtp_fd,
                    rtcp_fd,
                    endpoints,
                    self.callback.clone(),
                );
                self.sessions.insert(session_id, session);
                self.callback
                    .send_event(SessionEvent::OpenSuccess { session_id });
            }
            SessionCommand::CloseSession { session_id } => {
                if let Some(mut session) = self.sessions.remove(&session_id) {
                    session.close();
                }
            }
            SessionCommand::ModifySession { session_id, config } => {
                let status = match self.sessions.get_mut(&session_id) {
                    Some(session) => session.modify(&config),
                    None => Err(Error::ErrNotReady),
                };
                self.callback
                    .send_event(SessionEvent::ModifyResponse { status });
            }
            SessionCommand::AddConfig { session_id, config } => {
                let status = match self.sessions.get_mut(&session_id) {
                    Some(session) => session.add_config(&config),
                    None => Err(Error::ErrNotReady),
                };
                self.callback
                    .send_event(SessionEvent::AddConfigResponse { status });
            }
            SessionCommand::ConfirmConfig { session_id, config } => {
                let status = match self.sessions.get_mut(&session_id) {
                    Some(session) => session.confirm_config(&config),
                    None => Err(Error::ErrNotReady),
                };
                self.callback
                    .send_event(SessionEvent::ConfirmConfigResponse { status });
            }
            SessionCommand::DeleteConfig { session_id, config } => {
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    session.delete_config(&config);
                }
            }
            SessionCommand::SendDtmf {
                session_id,
                digit,
                volume,
                duration_ms,
            } => {
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    session.send_dtmf(digit, volume, duration_ms);
                }
            }
            SessionCommand::SendRtpHeaderExtension {
                session_id,
                profile,
                payload,
            } => {
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    session.send_rtp_header_extension(profile, payload);
                }
            }
            SessionCommand::SetMediaQualityThreshold {
                session_id,
                threshold,
            } => {
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    session.set_media_quality_threshold(&threshold);
                }
            }
            SessionCommand::SendRtt { session_id, text } => {
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    session.send_rtt(&text);
                }
            }
        }
    }
}
