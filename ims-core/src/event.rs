use std::sync::mpsc;

use crate::config::MediaConfig;
use crate::quality::CallQualityReport;

/// Which inbound flow went quiet.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InactivityCause {
    Rtp,
    Rtcp,
}

/// Stream graph states reported through `SessionEvent::StateChanged`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum StreamState {
    #[default]
    Idle,
    Created,
    Running,
    /// Video receive graph waiting for its rendering surface.
    WaitSurface,
}

/// Session lifecycle states.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Session exists, no graphs created yet.
    #[default]
    Opened,
    /// RTP stream graphs are running.
    Active,
    /// Graphs exist but RTP flow is paused.
    Suspended,
    Closed,
}

/// Asynchronous notifications from the engine to its host.
#[derive(Debug)]
pub enum SessionEvent {
    OpenSuccess {
        session_id: u32,
    },
    OpenFailure {
        session_id: u32,
        error: shared::error::Error,
    },
    SessionChanged {
        state: SessionState,
    },
    StateChanged {
        state: StreamState,
    },
    ModifyResponse {
        status: shared::error::Result<()>,
    },
    AddConfigResponse {
        status: shared::error::Result<()>,
    },
    ConfirmConfigResponse {
        status: shared::error::Result<()>,
    },
    FirstMediaPacketReceived {
        config: Box<MediaConfig>,
    },
    RtpHeaderExtensionReceived {
        extension: Vec<u8>,
    },
    MediaInactivity {
        cause: InactivityCause,
        seconds: u32,
    },
    /// Loss rate threshold crossing, in tenths of a percent.
    PacketLoss {
        permille: u32,
    },
    /// Jitter threshold crossing, in milliseconds.
    Jitter {
        milliseconds: u32,
    },
    MediaQualityStatus {
        report: Box<CallQualityReport>,
    },
    /// Real-time text arrived on a text session.
    RttReceived {
        text: String,
    },
    /// The sender asked for a new intra frame (video).
    IdrRequested,
    /// Peer video resolution changed.
    PeerDimensionChanged {
        width: u32,
        height: u32,
    },
    /// Bytes received on the video stream since the last report.
    VideoDataUsage {
        bytes: u64,
    },
    /// The peer requested a different codec mode (CMR).
    CodecModeRequest {
        mode: u8,
    },
}

/// Cloneable handle nodes use to report events back to the session owner.
///
/// Send failures mean the host dropped its receiver; events are then
/// discarded, which is fine during teardown.
#[derive(Debug, Clone)]
pub struct SessionCallback {
    tx: mpsc::Sender<SessionEvent>,
}

impl SessionCallback {
    pub fn new() -> (Self, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }

    pub fn send_event(&self, event: SessionEvent) {
        if let Err(e) = self.tx.send(event) {
            log::debug!("event receiver gone: {e}");
        }
    }
}
