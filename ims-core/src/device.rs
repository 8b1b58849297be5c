use bytes::Bytes;

/// One coded video frame crossing the device seam.
#[derive(Debug, Clone, Default)]
pub struct VideoFrame {
    pub data: Bytes,
    /// Key frame carrying decoder configuration (IDR + parameter sets).
    pub keyframe: bool,
    /// Capture timestamp in milliseconds.
    pub timestamp_ms: u32,
    /// Camera rotation in degrees clockwise.
    pub rotation_degrees: u32,
}

/// Capture side of the audio codec chain. Implementations hand out one
/// coded 20 ms frame per call, or `None` during DTX silence.
pub trait AudioInput: Send {
    fn read_frame(&mut self) -> Option<Bytes>;
}

/// Playout side of the audio codec chain. An empty frame asks the decoder
/// for packet loss concealment.
pub trait AudioOutput: Send {
    fn write_frame(&mut self, frame: &[u8]);
}

/// Camera plus encoder seam.
pub trait VideoInput: Send {
    fn read_frame(&mut self) -> Option<VideoFrame>;
    /// Ask the encoder for an IDR at the next opportunity.
    fn request_idr(&mut self) {}
    /// Adjust the encoder target bitrate, in kbps.
    fn set_bitrate(&mut self, _kbps: u32) {}
}

/// Decoder plus display seam. Returns the decoded dimensions when the
/// implementation knows them, letting the engine report peer resolution
/// changes.
pub trait VideoOutput: Send {
    fn write_frame(&mut self, frame: &VideoFrame) -> Option<(u32, u32)>;
}

/// Device endpoints injected at session open. Absent endpoints leave the
/// corresponding pipeline inert, which unit tests use to drive graphs by
/// hand.
#[derive(Default)]
pub struct MediaEndpoints {
    pub audio_input: Option<Box<dyn AudioInput>>,
    pub audio_output: Option<Box<dyn AudioOutput>>,
    pub video_input: Option<Box<dyn VideoInput>>,
    pub video_output: Option<Box<dyn VideoOutput>>,
    /// Opaque preview / display surface handles, passed through untouched.
    pub preview_surface: Option<u64>,
    pub display_surface: Option<u64>,
}
