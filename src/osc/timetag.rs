//! NTP-format timetags and the small/absolute inference rule from spec §4.1/§4.5.
//!
//! SuperCollider (and OSC 1.0) timetags are a 64-bit value: the high 32 bits
//! are whole seconds since the NTP epoch (1900-01-01 UTC), the low 32 bits
//! are a fractional-second count. `osc_client.rs` in the teacher workspace
//! threads this same NTP/Unix conversion through a monotonic `Instant`
//! anchor to avoid wall-clock jumps; we keep that anchor pattern here.

use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Seconds between the NTP epoch (1900-01-01) and the Unix epoch (1970-01-01).
pub const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// Below this magnitude, a caller-supplied timetag input is treated as a
/// relative offset (seconds from "now") rather than an absolute Unix time.
pub const RELATIVE_THRESHOLD: f64 = 1.0e6;

/// The sentinel NTP value meaning "execute immediately" (whole=0, frac=1).
pub const IMMEDIATE: u64 = 1;

/// An absolute NTP-format 64-bit timetag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OscTimeTag(pub u64);

impl OscTimeTag {
    /// The reserved "execute immediately" value.
    pub fn immediate() -> Self {
        OscTimeTag(IMMEDIATE)
    }

    pub fn is_immediate(self) -> bool {
        self.0 == IMMEDIATE
    }

    pub fn whole_seconds(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn fraction(self) -> u32 {
        self.0 as u32
    }

    pub fn from_parts(whole: u32, fraction: u32) -> Self {
        OscTimeTag(((whole as u64) << 32) | fraction as u64)
    }

    /// Build a timetag from an absolute Unix timestamp (seconds since 1970).
    pub fn from_unix_secs_f64(unix_secs: f64) -> Self {
        let ntp_secs = unix_secs + NTP_UNIX_OFFSET as f64;
        let whole = ntp_secs.trunc().max(0.0) as u32;
        let frac = (ntp_secs.fract() * (u32::MAX as f64)) as u32;
        OscTimeTag::from_parts(whole, frac)
    }

    pub fn to_unix_secs_f64(self) -> f64 {
        self.whole_seconds() as f64 - NTP_UNIX_OFFSET as f64
            + (self.fraction() as f64 / u32::MAX as f64)
    }

    /// Interpret `value` per spec §4.1/§4.5: magnitudes under
    /// [`RELATIVE_THRESHOLD`] are seconds relative to "now"; larger values
    /// are absolute Unix seconds.
    pub fn from_caller_value(value: f64, now_unix_secs: f64) -> Self {
        if value.abs() < RELATIVE_THRESHOLD {
            OscTimeTag::from_unix_secs_f64(now_unix_secs + value)
        } else {
            OscTimeTag::from_unix_secs_f64(value)
        }
    }

    pub fn to_rosc(self) -> rosc::OscTime {
        rosc::OscTime {
            seconds: self.whole_seconds(),
            fractional: self.fraction(),
        }
    }

    pub fn from_rosc(t: rosc::OscTime) -> Self {
        OscTimeTag::from_parts(t.seconds, t.fractional)
    }
}

/// Monotonic anchor pair: (instant captured at init, wall-clock seconds at
/// that instant). All "now" reads are derived from `Instant::elapsed` off
/// this anchor so NTP adjustments to the wall clock can't move a deadline
/// backwards mid-flight — the same reasoning `osc_client.rs` documents for
/// its own `CLOCK_ANCHOR`.
struct ClockAnchor {
    instant: Instant,
    wall_unix_secs: f64,
}

static CLOCK_ANCHOR: OnceLock<ClockAnchor> = OnceLock::new();

fn anchor() -> &'static ClockAnchor {
    CLOCK_ANCHOR.get_or_init(|| ClockAnchor {
        instant: Instant::now(),
        wall_unix_secs: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64(),
    })
}

/// Current wall-clock time in Unix seconds, derived from the monotonic anchor.
pub fn now_unix_secs() -> f64 {
    let a = anchor();
    a.wall_unix_secs + a.instant.elapsed().as_secs_f64()
}
