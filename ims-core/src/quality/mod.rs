use std::collections::VecDeque;

use rtcp::extended_report::{
    ReportBlock, StatisticsSummaryReportBlock, VoipMetricsReportBlock,
};

use crate::config::{AudioConfig, MediaQualityThreshold, xr_block};
use crate::event::{SessionCallback, SessionEvent};
use crate::jitter::PacketStatus;

/// Reporting window for call-quality summaries, in timer ticks (seconds).
pub const CALL_QUALITY_WINDOW_SEC: u32 = 5;
/// Bound on the per-direction packet record lists.
pub const MAX_PACKET_RECORDS: usize = 3000;
/// Gap threshold for burst/gap separation, RFC 3611 default.
pub const GMIN: u32 = 16;

/// Direction tag for `collect_info`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StreamUsage {
    Tx,
    Rx,
    Rtcp,
}

/// Extra observations outside the packet path.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OptionalInfo {
    /// IP TTL or hop limit of a received packet.
    Ttl,
    /// Round-trip delay in milliseconds derived from LSR/DLSR.
    RoundTripDelay,
}

/// One tracked packet.
#[derive(Debug, Copy, Clone, Default)]
pub struct PacketRecord {
    pub seq: u16,
    pub timestamp: u32,
    pub size: usize,
    pub arrival: u32,
    /// Relative jitter sample in ms, receive side only.
    pub jitter_ms: u32,
}

/// Call quality grades derived from the loss rate over a window.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CallQualityGrade {
    Excellent,
    Good,
    Fair,
    Poor,
    Bad,
}

impl CallQualityGrade {
    pub fn from_loss_rate_percent(loss: f64) -> Self {
        if loss < 3.0 {
            CallQualityGrade::Excellent
        } else if loss < 10.0 {
            CallQualityGrade::Good
        } else if loss < 20.0 {
            CallQualityGrade::Fair
        } else if loss < 30.0 {
            CallQualityGrade::Poor
        } else {
            CallQualityGrade::Bad
        }
    }
}

/// Aggregate quality over one reporting window.
#[derive(Debug, Clone)]
pub struct CallQualityReport {
    pub grade: CallQualityGrade,
    pub num_rx_packets: u32,
    pub num_lost_packets: u32,
    pub loss_rate_permille: u32,
    pub mean_jitter_ms: u32,
    pub round_trip_delay_ms: u32,
    pub jitter_buffer_ms: u32,
    pub jitter_buffer_max_ms: u32,
}

#[derive(Debug, Default)]
struct BurstGapState {
    in_burst: bool,
    pending_received: u32,
    burst_lost: u32,
    burst_total: u32,
    burst_count: u32,
    gap_lost: u32,
    gap_total: u32,
}

impl BurstGapState {
    fn on_received(&mut self) {
        if self.in_burst {
            self.pending_received += 1;
            if self.pending_received >= GMIN {
                // the quiet run closes the burst and belongs to the gap
                self.in_burst = false;
                self.gap_total += self.pending_received;
                self.pending_received = 0;
            }
        } else {
            self.gap_total += 1;
        }
    }

    fn on_lost(&mut self) {
        if self.in_burst {
            self.burst_total += self.pending_received + 1;
            self.burst_lost += 1;
            self.pending_received = 0;
        } else {
            self.in_burst = true;
            self.burst_count += 1;
            self.burst_total += 1;
            self.burst_lost += 1;
        }
    }
}

/// Per-stream quality accounting: counters for the RTCP interval, rolling
/// threshold windows, and RTCP-XR block assembly.
pub struct MediaQualityAnalyzer {
    callback: SessionCallback,
    config: Option<AudioConfig>,

    tx_packets: VecDeque<PacketRecord>,
    rx_packets: VecDeque<PacketRecord>,

    ssrc: Option<u32>,

    // rolling totals for XR statistics
    begin_seq: Option<u16>,
    end_seq: u16,
    lost_total: u32,
    dup_total: u32,
    discarded_total: u32,
    received_total: u32,
    jitter_min: u32,
    jitter_max: u32,
    jitter_sum: u64,
    jitter_sq_sum: u64,
    jitter_samples: u32,
    ttl_min: u8,
    ttl_max: u8,
    burst_gap: BurstGapState,

    // call quality window
    timer_count: u32,
    window_rx: u32,
    window_lost: u32,
    window_jitter_sum: u64,
    window_jitter_samples: u32,

    // threshold monitoring
    threshold: MediaQualityThreshold,
    jitter_tick: u32,
    loss_tick: u32,
    thresh_rx: u32,
    thresh_lost: u32,
    thresh_jitter_sum: u64,
    thresh_jitter_samples: u32,

    round_trip_delay_ms: u32,
    rtt_sum: u64,
    rtt_count: u32,

    jb_current_ms: u32,
    jb_max_ms: u32,
}

impl MediaQualityAnalyzer {
    pub fn new(callback: SessionCallback) -> Self {
        Self {
            callback,
            config: None,
            tx_packets: VecDeque::new(),
            rx_packets: VecDeque::new(),
            ssrc: None,
            begin_seq: None,
            end_seq: 0,
            lost_total: 0,
            dup_total: 0,
            discarded_total: 0,
            received_total: 0,
            jitter_min: u32::MAX,
            jitter_max: 0,
            jitter_sum: 0,
            jitter_sq_sum: 0,
            jitter_samples: 0,
            ttl_min: u8::MAX,
            ttl_max: 0,
            burst_gap: BurstGapState::default(),
            timer_count: 0,
            window_rx: 0,
            window_lost: 0,
            window_jitter_sum: 0,
            window_jitter_samples: 0,
            threshold: MediaQualityThreshold::default(),
            jitter_tick: 0,
            loss_tick: 0,
            thresh_rx: 0,
            thresh_lost: 0,
            thresh_jitter_sum: 0,
            thresh_jitter_samples: 0,
            round_trip_delay_ms: 0,
            rtt_sum: 0,
            rtt_count: 0,
            jb_current_ms: 0,
            jb_max_ms: 0,
        }
    }

    pub fn set_config(&mut self, config: &AudioConfig) {
        self.config = Some(config.clone());
    }

    pub fn is_same_config(&self, config: &AudioConfig) -> bool {
        self.config
            .as_ref()
            .map(|c| {
                c.codec == config.codec
                    && c.sampling_rate_khz == config.sampling_rate_khz
                    && c.evs.bandwidth == config.evs.bandwidth
            })
            .unwrap_or(false)
    }

    pub fn set_threshold(&mut self, threshold: &MediaQualityThreshold) {
        self.threshold = *threshold;
        self.jitter_tick = 0;
        self.loss_tick = 0;
    }

    pub fn remote_ssrc(&self) -> Option<u32> {
        self.ssrc
    }

    pub fn set_remote_ssrc(&mut self, ssrc: u32) {
        if self.ssrc != Some(ssrc) {
            self.ssrc = Some(ssrc);
        }
    }

    /// Records one packet seen on the given path.
    pub fn collect_info(&mut self, usage: StreamUsage, record: PacketRecord) {
        match usage {
            StreamUsage::Tx => {
                if self.tx_packets.len() >= MAX_PACKET_RECORDS {
                    self.tx_packets.pop_front();
                }
                self.tx_packets.push_back(record);
            }
            StreamUsage::Rx => {
                if self.rx_packets.len() >= MAX_PACKET_RECORDS {
                    self.rx_packets.pop_front();
                }
                self.begin_seq.get_or_insert(record.seq);
                self.end_seq = record.seq;
                self.received_total += 1;
                self.window_rx += 1;
                self.thresh_rx += 1;

                let j = record.jitter_ms;
                self.jitter_min = self.jitter_min.min(j);
                self.jitter_max = self.jitter_max.max(j);
                self.jitter_sum += u64::from(j);
                self.jitter_sq_sum += u64::from(j) * u64::from(j);
                self.jitter_samples += 1;
                self.window_jitter_sum += u64::from(j);
                self.window_jitter_samples += 1;
                self.thresh_jitter_sum += u64::from(j);
                self.thresh_jitter_samples += 1;

                self.rx_packets.push_back(record);
            }
            StreamUsage::Rtcp => {}
        }
    }

    /// Jitter-buffer verdict for a received sequence number.
    pub fn collect_rx_rtp_status(&mut self, _seq: u16, status: PacketStatus) {
        match status {
            PacketStatus::Ok | PacketStatus::Reordered => {
                self.burst_gap.on_received();
            }
            PacketStatus::Duplicate => {
                self.dup_total += 1;
            }
            PacketStatus::Discarded => {
                self.discarded_total += 1;
                self.burst_gap.on_lost();
            }
            PacketStatus::Lost => {
                self.lost_total += 1;
                self.window_lost += 1;
                self.thresh_lost += 1;
                self.burst_gap.on_lost();
            }
        }
    }

    pub fn collect_jitter_buffer_size(&mut self, current_ms: u32, max_ms: u32) {
        self.jb_current_ms = current_ms;
        self.jb_max_ms = max_ms;
    }

    pub fn collect_optional_info(&mut self, kind: OptionalInfo, _seq: u16, value: u32) {
        match kind {
            OptionalInfo::Ttl => {
                let ttl = value.min(255) as u8;
                self.ttl_min = self.ttl_min.min(ttl);
                self.ttl_max = self.ttl_max.max(ttl);
            }
            OptionalInfo::RoundTripDelay => {
                self.round_trip_delay_ms = value;
                self.rtt_sum += u64::from(value);
                self.rtt_count += 1;
            }
        }
    }

    /// One-second tick; closes the reporting and threshold windows when
    /// their durations elapse.
    pub fn process_timer(&mut self) {
        self.timer_count += 1;

        if self.timer_count % CALL_QUALITY_WINDOW_SEC == 0 {
            self.close_call_quality_window();
        }

        let loss_duration = self.threshold.rtp_packet_loss_duration_ms / 1000;
        if loss_duration > 0 {
            self.loss_tick += 1;
            if self.loss_tick >= loss_duration {
                self.close_loss_window();
                self.loss_tick = 0;
            }
        }

        let jitter_duration = self.threshold.jitter_duration_ms / 1000;
        if jitter_duration > 0 {
            self.jitter_tick += 1;
            if self.jitter_tick >= jitter_duration {
                self.close_jitter_window();
                self.jitter_tick = 0;
            }
        }
    }

    fn close_call_quality_window(&mut self) {
        let total = self.window_rx + self.window_lost;
        let loss_rate = if total > 0 {
            f64::from(self.window_lost) * 100.0 / f64::from(total)
        } else {
            0.0
        };
        let mean_jitter = if self.window_jitter_samples > 0 {
            (self.window_jitter_sum / u64::from(self.window_jitter_samples)) as u32
        } else {
            0
        };

        let report = CallQualityReport {
            grade: CallQualityGrade::from_loss_rate_percent(loss_rate),
            num_rx_packets: self.window_rx,
            num_lost_packets: self.window_lost,
            loss_rate_permille: (loss_rate * 10.0) as u32,
            mean_jitter_ms: mean_jitter,
            round_trip_delay_ms: self.round_trip_delay_ms,
            jitter_buffer_ms: self.jb_current_ms,
            jitter_buffer_max_ms: self.jb_max_ms,
        };
        self.callback.send_event(SessionEvent::MediaQualityStatus {
            report: Box::new(report),
        });

        self.window_rx = 0;
        self.window_lost = 0;
        self.window_jitter_sum = 0;
        self.window_jitter_samples = 0;
    }

    fn close_loss_window(&mut self) {
        let total = self.thresh_rx + self.thresh_lost;
        if total > 0 && self.threshold.rtp_packet_loss_rate > 0 {
            let rate = f64::from(self.thresh_lost) * 100.0 / f64::from(total);
            if rate >= f64::from(self.threshold.rtp_packet_loss_rate) {
                self.callback.send_event(SessionEvent::PacketLoss {
                    permille: (rate * 10.0) as u32,
                });
            }
        }
        self.thresh_rx = 0;
        self.thresh_lost = 0;
    }

    fn close_jitter_window(&mut self) {
        if self.thresh_jitter_samples > 0 && self.threshold.rtp_jitter_ms > 0 {
            let mean = (self.thresh_jitter_sum / u64::from(self.thresh_jitter_samples)) as u32;
            if mean >= self.threshold.rtp_jitter_ms {
                self.callback
                    .send_event(SessionEvent::Jitter { milliseconds: mean });
            }
        }
        self.thresh_jitter_sum = 0;
        self.thresh_jitter_samples = 0;
    }

    /// Builds the XR report blocks selected by `mask`, or `None` when the
    /// mask enables nothing the analyzer can produce.
    pub fn get_rtcp_xr_report_blocks(&mut self, mask: u32) -> Option<Vec<ReportBlock>> {
        let mut blocks = vec![];
        let ssrc = self.ssrc.unwrap_or(0);

        if mask & xr_block::STATISTICS_SUMMARY != 0 {
            let mean = if self.jitter_samples > 0 {
                (self.jitter_sum / u64::from(self.jitter_samples)) as u32
            } else {
                0
            };
            let dev = if self.jitter_samples > 0 {
                let n = u64::from(self.jitter_samples);
                let mean_sq = self.jitter_sq_sum / n;
                let sq_mean = u64::from(mean) * u64::from(mean);
                ((mean_sq.saturating_sub(sq_mean)) as f64).sqrt() as u32
            } else {
                0
            };
            blocks.push(ReportBlock::StatisticsSummary(
                StatisticsSummaryReportBlock {
                    ssrc,
                    begin_seq: self.begin_seq.unwrap_or(0),
                    end_seq: self.end_seq,
                    lost_packets: self.lost_total,
                    dup_packets: self.dup_total,
                    min_jitter: if self.jitter_min == u32::MAX {
                        0
                    } else {
                        self.jitter_min
                    },
                    max_jitter: self.jitter_max,
                    mean_jitter: mean,
                    dev_jitter: dev,
                    min_ttl: if self.ttl_min == u8::MAX { 0 } else { self.ttl_min },
                    max_ttl: self.ttl_max,
                    mean_ttl: 0,
                    dev_ttl: 0,
                },
            ));
        }

        if mask & xr_block::VOIP_METRICS != 0 {
            let total = self.received_total + self.lost_total;
            let rate256 = |part: u32, whole: u32| -> u8 {
                if whole == 0 {
                    0
                } else {
                    ((u64::from(part) * 256 / u64::from(whole)).min(255)) as u8
                }
            };
            let bg = &self.burst_gap;
            let burst_density = rate256(bg.burst_lost, bg.burst_total);
            let gap_density = rate256(bg.gap_lost, bg.gap_total);
            let frame_ms = 20u32;
            let burst_duration = if bg.burst_count > 0 {
                (bg.burst_total * frame_ms / bg.burst_count).min(0xFFFF) as u16
            } else {
                0
            };
            let gap_duration = (bg.gap_total * frame_ms).min(0xFFFF) as u16;

            blocks.push(ReportBlock::VoipMetrics(VoipMetricsReportBlock {
                ssrc,
                loss_rate: rate256(self.lost_total, total),
                discard_rate: rate256(self.discarded_total, total),
                burst_density,
                gap_density,
                burst_duration,
                gap_duration,
                round_trip_delay: self.round_trip_delay_ms.min(0xFFFF) as u16,
                end_system_delay: self.jb_current_ms.min(0xFFFF) as u16,
                signal_level: 127,
                noise_level: 127,
                rerl: 127,
                gmin: GMIN as u8,
                r_factor: 127,
                ext_r_factor: 127,
                mos_lq: 127,
                mos_cq: 127,
                rx_config: 0,
                jb_nominal: self.jb_current_ms.min(0xFFFF) as u16,
                jb_maximum: self.jb_max_ms.min(0xFFFF) as u16,
                jb_abs_max: self.jb_max_ms.min(0xFFFF) as u16,
            }));
        }

        if blocks.is_empty() { None } else { Some(blocks) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::Receiver;

    fn analyzer() -> (MediaQualityAnalyzer, Receiver<SessionEvent>) {
        let (callback, rx) = SessionCallback::new();
        (MediaQualityAnalyzer::new(callback), rx)
    }

    fn rx_record(seq: u16, jitter_ms: u32) -> PacketRecord {
        PacketRecord {
            seq,
            jitter_ms,
            size: 32,
            ..Default::default()
        }
    }

    #[test]
    fn test_grade_table() {
        assert_eq!(
            CallQualityGrade::from_loss_rate_percent(0.0),
            CallQualityGrade::Excellent
        );
        assert_eq!(
            CallQualityGrade::from_loss_rate_percent(5.0),
            CallQualityGrade::Good
        );
        assert_eq!(
            CallQualityGrade::from_loss_rate_percent(15.0),
            CallQualityGrade::Fair
        );
        assert_eq!(
            CallQualityGrade::from_loss_rate_percent(25.0),
            CallQualityGrade::Poor
        );
        assert_eq!(
            CallQualityGrade::from_loss_rate_percent(35.0),
            CallQualityGrade::Bad
        );
    }

    #[test]
    fn test_call_quality_report_every_five_seconds() {
        let (mut a, rx) = analyzer();
        for i in 0..100u16 {
            a.collect_info(StreamUsage::Rx, rx_record(i, 5));
            a.collect_rx_rtp_status(i, PacketStatus::Ok);
        }
        for _ in 0..5 {
            a.process_timer();
        }
        let ev = rx.try_recv().expect("report emitted");
        match ev {
            SessionEvent::MediaQualityStatus { report } => {
                assert_eq!(report.num_rx_packets, 100);
                assert_eq!(report.grade, CallQualityGrade::Excellent);
                assert_eq!(report.mean_jitter_ms, 5);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_loss_threshold_fires_once_per_window() {
        let (mut a, rx) = analyzer();
        a.set_threshold(&MediaQualityThreshold {
            rtp_packet_loss_duration_ms: 2000,
            rtp_packet_loss_rate: 10,
            ..Default::default()
        });
        // 8 received, 2 lost -> 20%
        for i in 0..8u16 {
            a.collect_info(StreamUsage::Rx, rx_record(i, 1));
            a.collect_rx_rtp_status(i, PacketStatus::Ok);
        }
        a.collect_rx_rtp_status(8, PacketStatus::Lost);
        a.collect_rx_rtp_status(9, PacketStatus::Lost);

        a.process_timer(); // 1 s: window still open
        assert!(rx.try_recv().is_err());
        a.process_timer(); // 2 s: window closes
        let got_loss = matches!(rx.try_recv(), Ok(SessionEvent::PacketLoss { permille }) if permille == 200);
        assert!(got_loss);
        // next window has no traffic, no re-emit
        a.process_timer();
        a.process_timer();
        assert!(
            !matches!(rx.try_recv(), Ok(SessionEvent::PacketLoss { .. })),
            "must not re-emit without data"
        );
    }

    #[test]
    fn test_jitter_threshold() {
        let (mut a, rx) = analyzer();
        a.set_threshold(&MediaQualityThreshold {
            jitter_duration_ms: 1000,
            rtp_jitter_ms: 40,
            ..Default::default()
        });
        for i in 0..10u16 {
            a.collect_info(StreamUsage::Rx, rx_record(i, 80));
        }
        a.process_timer();
        let mut saw_jitter = false;
        while let Ok(ev) = rx.try_recv() {
            if let SessionEvent::Jitter { milliseconds } = ev {
                assert_eq!(milliseconds, 80);
                saw_jitter = true;
            }
        }
        assert!(saw_jitter);
    }

    #[test]
    fn test_xr_blocks_reflect_counts() {
        let (mut a, _rx) = analyzer();
        a.set_remote_ssrc(0xbc5e9a40);
        for i in 0..50u16 {
            a.collect_info(StreamUsage::Rx, rx_record(i, 10));
            a.collect_rx_rtp_status(i, PacketStatus::Ok);
        }
        a.collect_rx_rtp_status(50, PacketStatus::Lost);
        a.collect_optional_info(OptionalInfo::Ttl, 0, 64);
        a.collect_optional_info(OptionalInfo::RoundTripDelay, 0, 120);

        let blocks = a
            .get_rtcp_xr_report_blocks(xr_block::STATISTICS_SUMMARY | xr_block::VOIP_METRICS)
            .expect("blocks");
        assert_eq!(blocks.len(), 2);
        match &blocks[0] {
            ReportBlock::StatisticsSummary(b) => {
                assert_eq!(b.ssrc, 0xbc5e9a40);
                assert_eq!(b.begin_seq, 0);
                assert_eq!(b.end_seq, 49);
                assert_eq!(b.lost_packets, 1);
                assert_eq!(b.mean_jitter, 10);
                assert_eq!(b.min_ttl, 64);
                assert_eq!(b.max_ttl, 64);
            }
            other => panic!("unexpected block {other:?}"),
        }
        match &blocks[1] {
            ReportBlock::VoipMetrics(b) => {
                assert_eq!(b.round_trip_delay, 120);
                assert_eq!(b.gmin, 16);
                // 1 lost of 51 total ~ 5/256
                assert_eq!(b.loss_rate, (256 / 51) as u8);
            }
            other => panic!("unexpected block {other:?}"),
        }
        assert!(a.get_rtcp_xr_report_blocks(xr_block::NONE).is_none());
    }
}
