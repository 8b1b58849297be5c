use serde::{Deserialize, Serialize};

/// Media carried by a session.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MediaType {
    #[default]
    Audio,
    Video,
    Text,
}

/// Negotiated media flow direction.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MediaDirection {
    NoFlow,
    TransmitOnly,
    ReceiveOnly,
    #[default]
    TransmitReceive,
    Inactive,
}

impl MediaDirection {
    pub fn transmits(self) -> bool {
        matches!(
            self,
            MediaDirection::TransmitOnly | MediaDirection::TransmitReceive
        )
    }

    pub fn receives(self) -> bool {
        matches!(
            self,
            MediaDirection::ReceiveOnly | MediaDirection::TransmitReceive
        )
    }
}

/// RTCP-XR block selection bitmask.
pub mod xr_block {
    pub const NONE: u32 = 0;
    pub const STATISTICS_SUMMARY: u32 = 1 << 3;
    pub const VOIP_METRICS: u32 = 1 << 6;
}

/// RTCP feedback capability bits (video).
pub mod rtcp_fb {
    pub const NONE: u32 = 0;
    pub const NACK: u32 = 1 << 0;
    pub const PLI: u32 = 1 << 1;
    pub const FIR: u32 = 1 << 2;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcpConfig {
    /// Canonical name sent in SDES.
    pub canonical_name: String,
    /// Seconds between reports; zero disables RTCP transmission.
    pub interval_sec: u32,
    /// Bitmask of enabled XR blocks, see [`xr_block`].
    pub xr_blocks: u32,
    /// Bitmask of feedback types, see [`rtcp_fb`].
    pub fb_types: u32,
}

impl Default for RtcpConfig {
    fn default() -> Self {
        Self {
            canonical_name: String::new(),
            interval_sec: 5,
            xr_blocks: xr_block::NONE,
            fb_types: rtcp_fb::NONE,
        }
    }
}

/// Transport-level settings shared by every media kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtpConfig {
    pub remote_address: String,
    pub remote_port: u16,
    pub direction: MediaDirection,
    /// DSCP code point written into IP_TOS on the send sockets.
    pub dscp: u8,
    pub mtu: u32,
    pub rtcp: RtcpConfig,
}

impl Default for RtpConfig {
    fn default() -> Self {
        Self {
            remote_address: String::new(),
            remote_port: 0,
            direction: MediaDirection::TransmitReceive,
            dscp: 0,
            mtu: 1500,
            rtcp: RtcpConfig::default(),
        }
    }
}

/// Speech codecs the engine can frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AudioCodec {
    None,
    #[default]
    Amr,
    AmrWb,
    Pcmu,
    Pcma,
    Evs,
}

/// AMR / AMR-WB payload parameters.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmrParams {
    pub mode: u8,
    pub octet_aligned: bool,
    pub max_redundancy_millis: u32,
}

impl Default for AmrParams {
    fn default() -> Self {
        Self {
            mode: 7,
            octet_aligned: true,
            max_redundancy_millis: 0,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EvsBandwidth {
    #[default]
    None,
    NarrowBand,
    WideBand,
    SuperWideBand,
    FullBand,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EvsParams {
    pub bandwidth: EvsBandwidth,
    pub mode: u8,
    /// Compact (false) or header-full (true) payload format.
    pub header_full: bool,
    /// Channel-aware mode offset, zero when disabled.
    pub channel_aware_offset: u8,
    pub use_cmr: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioConfig {
    pub rtp: RtpConfig,
    pub codec: AudioCodec,
    pub sampling_rate_khz: u32,
    pub ptime_ms: u32,
    pub max_ptime_ms: u32,
    pub tx_payload_type: u8,
    pub rx_payload_type: u8,
    pub dtmf_payload_type: u8,
    pub dtmf_sampling_rate_khz: u32,
    pub dtx_enabled: bool,
    pub amr: AmrParams,
    pub evs: EvsParams,
    /// Initial codec mode request sent to the encoder, 15 = none.
    pub codec_mode_request: u8,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            rtp: RtpConfig::default(),
            codec: AudioCodec::AmrWb,
            sampling_rate_khz: 16,
            ptime_ms: 20,
            max_ptime_ms: 240,
            tx_payload_type: 96,
            rx_payload_type: 96,
            dtmf_payload_type: 100,
            dtmf_sampling_rate_khz: 16,
            dtx_enabled: false,
            amr: AmrParams::default(),
            evs: EvsParams::default(),
            codec_mode_request: 15,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum VideoCodec {
    #[default]
    H264,
    Hevc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoConfig {
    pub rtp: RtpConfig,
    pub codec: VideoCodec,
    pub tx_payload_type: u8,
    pub rx_payload_type: u8,
    pub sampling_rate_khz: u32,
    pub framerate: u32,
    pub bitrate_kbps: u32,
    pub width: u32,
    pub height: u32,
    /// CVO extension id negotiated in SDP, zero when disabled.
    pub cvo_extension_id: u8,
    /// Seconds between IDR frames requested from the encoder.
    pub intra_frame_interval_sec: u32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            rtp: RtpConfig::default(),
            codec: VideoCodec::H264,
            tx_payload_type: 102,
            rx_payload_type: 102,
            sampling_rate_khz: 90,
            framerate: 30,
            bitrate_kbps: 512,
            width: 640,
            height: 480,
            cvo_extension_id: 0,
            intra_frame_interval_sec: 1,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TextCodec {
    None,
    T140,
    #[default]
    T140Red,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextConfig {
    pub rtp: RtpConfig,
    pub codec: TextCodec,
    pub tx_payload_type: u8,
    pub rx_payload_type: u8,
    /// RED payload type carried inside the redundancy header.
    pub redundant_payload_type: u8,
    /// How many previous chunks accompany each primary, 0..=3.
    pub redundant_level: u8,
    /// Pad the RED header with empty blocks so the level stays constant.
    pub keep_redundant_level: bool,
    /// Consume a leading byte-order-mark once at stream start.
    pub expect_bom: bool,
}

impl Default for TextConfig {
    fn default() -> Self {
        Self {
            rtp: RtpConfig::default(),
            codec: TextCodec::T140Red,
            tx_payload_type: 112,
            rx_payload_type: 112,
            redundant_payload_type: 111,
            redundant_level: 2,
            keep_redundant_level: true,
            expect_bom: false,
        }
    }
}

/// The per-media configuration delivered in `OpenSession` / `ModifySession`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MediaConfig {
    Audio(AudioConfig),
    Video(VideoConfig),
    Text(TextConfig),
}

impl MediaConfig {
    pub fn media_type(&self) -> MediaType {
        match self {
            MediaConfig::Audio(_) => MediaType::Audio,
            MediaConfig::Video(_) => MediaType::Video,
            MediaConfig::Text(_) => MediaType::Text,
        }
    }

    pub fn rtp(&self) -> &RtpConfig {
        match self {
            MediaConfig::Audio(c) => &c.rtp,
            MediaConfig::Video(c) => &c.rtp,
            MediaConfig::Text(c) => &c.rtp,
        }
    }

    pub fn audio(&self) -> Option<&AudioConfig> {
        match self {
            MediaConfig::Audio(c) => Some(c),
            _ => None,
        }
    }

    pub fn video(&self) -> Option<&VideoConfig> {
        match self {
            MediaConfig::Video(c) => Some(c),
            _ => None,
        }
    }

    pub fn text(&self) -> Option<&TextConfig> {
        match self {
            MediaConfig::Text(c) => Some(c),
            _ => None,
        }
    }

    /// RTP clock rate in Hz for this media.
    pub fn clock_rate(&self) -> u32 {
        match self {
            MediaConfig::Audio(c) => c.sampling_rate_khz * 1000,
            MediaConfig::Video(c) => c.sampling_rate_khz * 1000,
            // RFC 4103: the only valid rate for text/t140 is 1000
            MediaConfig::Text(_) => 1000,
        }
    }
}

/// Monitoring thresholds supplied by `SetMediaQualityThreshold`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MediaQualityThreshold {
    pub rtp_inactivity_timer_ms: u32,
    pub rtcp_inactivity_timer_ms: u32,
    /// Loss window length and rate (percent) that trigger `PacketLoss`.
    pub rtp_packet_loss_duration_ms: u32,
    pub rtp_packet_loss_rate: u32,
    /// Jitter window length and level (ms) that trigger `Jitter`.
    pub jitter_duration_ms: u32,
    pub rtp_jitter_ms: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_predicates() {
        assert!(MediaDirection::TransmitReceive.transmits());
        assert!(MediaDirection::TransmitReceive.receives());
        assert!(MediaDirection::TransmitOnly.transmits());
        assert!(!MediaDirection::TransmitOnly.receives());
        assert!(!MediaDirection::NoFlow.transmits());
        assert!(!MediaDirection::NoFlow.receives());
    }

    #[test]
    fn test_text_clock_rate_is_fixed() {
        let config = MediaConfig::Text(TextConfig::default());
        assert_eq!(config.clock_rate(), 1000);
    }

    #[test]
    fn test_config_equality_drives_update_diff() {
        let a = MediaConfig::Audio(AudioConfig::default());
        let mut b = AudioConfig::default();
        assert_eq!(a, MediaConfig::Audio(b.clone()));
        b.rtp.remote_port = 20000;
        assert_ne!(a, MediaConfig::Audio(b));
    }

}
