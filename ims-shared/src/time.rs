use std::ops::Add;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Pairs a monotonic instant with the wall-clock offset captured at the same
/// moment, so NTP timestamps can be derived from later `Instant`s without
/// re-reading the system clock.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SystemInstant {
    instant: Instant,
    duration_since_unix_epoch: Duration,
}

impl SystemInstant {
    pub fn now() -> Self {
        Self {
            instant: Instant::now(),
            duration_since_unix_epoch: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_else(|_| Duration::from_secs(0)),
        }
    }

    pub fn duration_since_unix_epoch(&self, now: Instant) -> Duration {
        now.duration_since(self.instant)
            .add(self.duration_since_unix_epoch)
    }

    pub fn ntp(&self, now: Instant) -> u64 {
        unix2ntp(self.duration_since_unix_epoch(now).as_nanos() as u64)
    }

    /// The middle 32 bits of the NTP timestamp, the unit used by the RTCP
    /// LSR and DLSR fields.
    pub fn ntp_mid32(&self, now: Instant) -> u32 {
        (self.ntp(now) >> 16) as u32
    }
}

pub fn unix2ntp(u: u64) -> u64 {
    let mut s = u / 1_000_000_000;
    s += 0x83AA7E80; //offset in seconds between unix epoch and ntp epoch
    let mut f = u % 1_000_000_000;
    f <<= 32;
    f /= 1_000_000_000;
    s <<= 32;

    s | f
}

pub fn ntp2unix(t: u64) -> u64 {
    let mut s = t >> 32;
    let mut f = t & 0xFFFFFFFF;
    f *= 1_000_000_000;
    f >>= 32;
    s -= 0x83AA7E80;

    s * 1_000_000_000 + f
}

/// Duration in 1/65536 second units, the RTCP DLSR encoding.
pub fn duration_to_dlsr(d: Duration) -> u32 {
    (d.as_secs_f64() * 65536.0) as u32
}
