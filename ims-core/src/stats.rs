use std::sync::Mutex;
use std::time::Instant;

use rtcp::reception_report::ReceptionReport;
use shared::time::SystemInstant;

/// Number of packets tracked per u64 entry in the receive bitmap.
const PACKETS_PER_ENTRY: usize = 64;
const BITMAP_SIZE: usize = 128;

/// Receive-side accounting for one remote SSRC: enough to fill RFC 3550
/// reception report blocks.
struct RxStream {
    ssrc: u32,
    clock_rate: f64,

    /// Each u64 tracks 64 packets; 128 * 64 = 8192 packet window.
    packets: Vec<u64>,
    started: bool,
    seq_num_cycles: u16,
    last_seq_num: u16,
    last_report_seq_num: u16,
    last_rtp_time_rtp: u32,
    last_rtp_time_time: Instant,
    jitter: f64,
    last_sender_report: u32,
    last_sender_report_time: Option<Instant>,
    total_lost: u32,
}

impl RxStream {
    fn new(ssrc: u32, clock_rate: u32) -> Self {
        Self {
            ssrc,
            clock_rate: clock_rate as f64,
            packets: vec![0u64; BITMAP_SIZE],
            started: false,
            seq_num_cycles: 0,
            last_seq_num: 0,
            last_report_seq_num: 0,
            last_rtp_time_rtp: 0,
            last_rtp_time_time: Instant::now(),
            jitter: 0.0,
            last_sender_report: 0,
            last_sender_report_time: None,
            total_lost: 0,
        }
    }

    fn set_received(&mut self, seq: u16) {
        let pos = (seq as usize) % (BITMAP_SIZE * PACKETS_PER_ENTRY);
        self.packets[pos / PACKETS_PER_ENTRY] |= 1 << (pos % PACKETS_PER_ENTRY);
    }

    fn del_received(&mut self, seq: u16) {
        let pos = (seq as usize) % (BITMAP_SIZE * PACKETS_PER_ENTRY);
        self.packets[pos / PACKETS_PER_ENTRY] &= !(1u64 << (pos % PACKETS_PER_ENTRY));
    }

    fn get_received(&self, seq: u16) -> bool {
        let pos = (seq as usize) % (BITMAP_SIZE * PACKETS_PER_ENTRY);
        (self.packets[pos / PACKETS_PER_ENTRY] & (1 << (pos % PACKETS_PER_ENTRY))) != 0
    }

    fn process_rtp(&mut self, now: Instant, seq: u16, timestamp: u32) {
        if !self.started {
            self.started = true;
            self.set_received(seq);
            self.last_seq_num = seq;
            self.last_report_seq_num = seq.wrapping_sub(1);
            self.last_rtp_time_rtp = timestamp;
            self.last_rtp_time_time = now;
            return;
        }

        self.set_received(seq);

        let diff = seq.wrapping_sub(self.last_seq_num);
        if diff > 0 && diff < (1 << 15) {
            if seq < self.last_seq_num {
                self.seq_num_cycles = self.seq_num_cycles.wrapping_add(1);
            }

            // anything between the old head and the new one is unseen so far
            let mut i = self.last_seq_num.wrapping_add(1);
            while i != seq {
                self.del_received(i);
                i = i.wrapping_add(1);
            }

            self.last_seq_num = seq;
        }

        // interarrival jitter, RFC 3550 A.8
        let d = now.duration_since(self.last_rtp_time_time).as_secs_f64() * self.clock_rate
            - (timestamp as f64 - self.last_rtp_time_rtp as f64);
        self.jitter += (d.abs() - self.jitter) / 16.0;

        self.last_rtp_time_rtp = timestamp;
        self.last_rtp_time_time = now;
    }

    fn generate_report(&mut self, now: Instant) -> ReceptionReport {
        let total_since_report = self.last_seq_num.wrapping_sub(self.last_report_seq_num);
        let mut lost_since_report = {
            if self.last_seq_num == self.last_report_seq_num {
                0u32
            } else {
                let mut ret = 0u32;
                let mut i = self.last_report_seq_num.wrapping_add(1);
                while i != self.last_seq_num {
                    if !self.get_received(i) {
                        ret += 1;
                    }
                    i = i.wrapping_add(1);
                }
                ret
            }
        };

        self.total_lost += lost_since_report;

        if lost_since_report > 0xFFFFFF {
            lost_since_report = 0xFFFFFF;
        }
        if self.total_lost > 0xFFFFFF {
            self.total_lost = 0xFFFFFF;
        }

        let delay = match self.last_sender_report_time {
            Some(sr_time) => (now.duration_since(sr_time).as_secs_f64() * 65536.0) as u32,
            None => 0,
        };

        let fraction_lost = if total_since_report > 0 {
            ((lost_since_report * 256) as f64 / total_since_report as f64) as u8
        } else {
            0
        };

        let report = ReceptionReport {
            ssrc: self.ssrc,
            last_sequence_number: (u32::from(self.seq_num_cycles) << 16)
                | u32::from(self.last_seq_num),
            last_sender_report: self.last_sender_report,
            fraction_lost,
            total_lost: self.total_lost,
            delay,
            jitter: self.jitter as u32,
        };

        self.last_report_seq_num = self.last_seq_num;

        report
    }
}

#[derive(Default)]
struct Inner {
    rx: Option<RxStream>,
    tx_packets: u32,
    tx_octets: u32,
    tx_rtp_timestamp: u32,
    rtp_received_in_second: u32,
    rtcp_received_in_second: u32,
}

/// Counters shared by the RTP and RTCP codec nodes of one session.
///
/// The Tx graph feeds the sent-packet side, the Rx graph feeds the
/// reception side, and the RTCP graph turns both into sender reports and
/// reception report blocks.
pub struct RtpSessionStats {
    pub clock: SystemInstant,
    local_ssrc: u32,
    clock_rate: u32,
    inner: Mutex<Inner>,
}

impl RtpSessionStats {
    pub fn new(clock_rate: u32) -> Self {
        Self {
            clock: SystemInstant::now(),
            local_ssrc: rand::random::<u32>(),
            clock_rate,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn local_ssrc(&self) -> u32 {
        self.local_ssrc
    }

    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    pub fn on_tx_packet(&self, rtp_timestamp: u32, payload_octets: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.tx_packets = inner.tx_packets.wrapping_add(1);
        inner.tx_octets = inner.tx_octets.wrapping_add(payload_octets as u32);
        inner.tx_rtp_timestamp = rtp_timestamp;
    }

    pub fn tx_totals(&self) -> (u32, u32, u32) {
        let inner = self.inner.lock().unwrap();
        (inner.tx_packets, inner.tx_octets, inner.tx_rtp_timestamp)
    }

    pub fn on_rx_packet(&self, now: Instant, ssrc: u32, seq: u16, timestamp: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.rtp_received_in_second += 1;
        let clock_rate = self.clock_rate;
        let rx = inner
            .rx
            .get_or_insert_with(|| RxStream::new(ssrc, clock_rate));
        if rx.ssrc != ssrc {
            *rx = RxStream::new(ssrc, clock_rate);
        }
        rx.process_rtp(now, seq, timestamp);
    }

    pub fn on_rx_sender_report(&self, now: Instant, ntp_time: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.rtcp_received_in_second += 1;
        if let Some(rx) = inner.rx.as_mut() {
            rx.last_sender_report = (ntp_time >> 16) as u32;
            rx.last_sender_report_time = Some(now);
        }
    }

    pub fn on_rx_receiver_report(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.rtcp_received_in_second += 1;
    }

    pub fn remote_ssrc(&self) -> Option<u32> {
        self.inner.lock().unwrap().rx.as_ref().map(|r| r.ssrc)
    }

    pub fn rx_jitter(&self) -> u32 {
        self.inner
            .lock()
            .unwrap()
            .rx
            .as_ref()
            .map(|r| r.jitter as u32)
            .unwrap_or(0)
    }

    /// Builds the reception report block for the current interval, if any
    /// remote stream has been observed.
    pub fn generate_reception_report(&self, now: Instant) -> Option<ReceptionReport> {
        let mut inner = self.inner.lock().unwrap();
        inner.rx.as_mut().map(|rx| rx.generate_report(now))
    }

    /// RTP datagrams seen since the last call; resets the counter.
    pub fn take_rtp_activity(&self) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        std::mem::take(&mut inner.rtp_received_in_second)
    }

    /// SR/RR packets seen since the last call; resets the counter.
    pub fn take_rtcp_activity(&self) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        std::mem::take(&mut inner.rtcp_received_in_second)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_reception_report_counts_loss() {
        let stats = RtpSessionStats::new(8000);
        let t0 = Instant::now();
        // 0..=9 received except 5
        for seq in (0u16..10).filter(|s| *s != 5) {
            stats.on_rx_packet(t0 + Duration::from_millis(u64::from(seq) * 20), 0xabc, seq, u32::from(seq) * 160);
        }
        let report = stats.generate_reception_report(t0 + Duration::from_secs(1)).unwrap();
        assert_eq!(report.ssrc, 0xabc);
        assert_eq!(report.total_lost, 1);
        assert_eq!(report.last_sequence_number & 0xFFFF, 9);
        // 1 lost of 10 expected: 25/256
        assert_eq!(report.fraction_lost, 25);
    }

    #[test]
    fn test_second_report_only_covers_new_interval() {
        let stats = RtpSessionStats::new(8000);
        let t0 = Instant::now();
        for seq in 0u16..10 {
            stats.on_rx_packet(t0, 0xabc, seq, u32::from(seq) * 160);
        }
        let first = stats.generate_reception_report(t0).unwrap();
        assert_eq!(first.total_lost, 0);

        for seq in 10u16..20 {
            if seq != 12 && seq != 13 {
                stats.on_rx_packet(t0, 0xabc, seq, u32::from(seq) * 160);
            }
        }
        let second = stats.generate_reception_report(t0).unwrap();
        assert_eq!(second.total_lost, 2);
        assert!(second.fraction_lost > 0);
    }

    #[test]
    fn test_ssrc_change_resets_stream() {
        let stats = RtpSessionStats::new(8000);
        let t0 = Instant::now();
        stats.on_rx_packet(t0, 0xaaa, 100, 0);
        stats.on_rx_packet(t0, 0xbbb, 7, 0);
        assert_eq!(stats.remote_ssrc(), Some(0xbbb));
        let report = stats.generate_reception_report(t0).unwrap();
        assert_eq!(report.ssrc, 0xbbb);
    }

    #[test]
    fn test_dlsr_reflects_elapsed_time() {
        let stats = RtpSessionStats::new(8000);
        let t0 = Instant::now();
        stats.on_rx_packet(t0, 0xabc, 1, 0);
        stats.on_rx_sender_report(t0, 0xda8bd1fc_dddda05a);
        let report = stats
            .generate_reception_report(t0 + Duration::from_millis(500))
            .unwrap();
        assert_eq!(report.last_sender_report, 0xd1fcdddd);
        // 0.5 s in 1/65536 units
        assert!((report.delay as i64 - 32768).abs() < 200);
    }

    #[test]
    fn test_activity_counters_reset_on_take() {
        let stats = RtpSessionStats::new(8000);
        let t0 = Instant::now();
        stats.on_rx_packet(t0, 1, 1, 0);
        stats.on_rx_packet(t0, 1, 2, 0);
        assert_eq!(stats.take_rtp_activity(), 2);
        assert_eq!(stats.take_rtp_activity(), 0);

        stats.on_rx_sender_report(t0, 0);
        assert_eq!(stats.take_rtcp_activity(), 1);
        assert_eq!(stats.take_rtcp_activity(), 0);
    }
}
