//! Shared wire types and constants for the GPIO trace/actuation stack.
//!
//! This crate has no hardware or I/O surface of its own: it is the vocabulary
//! that `trace-decode`, `timescale`, `evtqueue`, `gpio-writer` and
//! `coprocessor-bridge` all speak, kept in one place so the sample word
//! layout and the actuation event layout each have exactly one definition.

#![forbid(unsafe_code)]

use std::fmt;

/// Number of digital input pins a trace can carry.
pub const TRACE_PIN_COUNT: usize = 8;

/// Bit index of the PPS / reset synchronization channel within a sample's
/// pin byte. Reserved: the first rising edge marks trace start, the last
/// falling edge marks trace end.
pub const PPS_BIT: u8 = 7;

/// Friendly pin labels, indexed by bit position within a sample's pin byte.
pub const PIN_LABELS: [&str; TRACE_PIN_COUNT] = [
    "LED1", "LED2", "LED3", "INT1", "INT2", "SIG1", "SIG2", "nRST",
];

/// Platform-pin aliases for the same bit positions, used when the caller
/// requests header-pin rather than logical-name labels.
pub const PIN_LABELS_ALT: [&str; TRACE_PIN_COUNT] = [
    "P845", "P846", "P843", "P844", "P841", "P842", "P839", "P840",
];

/// The ninth label in both vectors, used only for the PPS bit when a caller
/// asks for it by name (e.g. log messages); not a valid decode-time index.
pub const PPS_LABEL: &str = "PPS";
pub const PPS_LABEL_ALT: &str = "P827";

/// Returns the label for pin `bit` (0..=7), selecting the alternate
/// (platform-pin) vector when `alt` is set.
pub fn pin_label(bit: u8, alt: bool) -> &'static str {
    if bit == PPS_BIT {
        return if alt { PPS_LABEL_ALT } else { PPS_LABEL };
    }
    let table = if alt { &PIN_LABELS_ALT } else { &PIN_LABELS };
    table[bit as usize]
}

/// Nominal sampling rate of the reference firmware image, in ticks/second.
/// Must match whichever firmware image is actually loaded; see
/// `coprocessor_bridge::Firmware::sampling_rate_hz`.
pub const DEFAULT_SAMPLING_RATE_HZ: u64 = 10_000_000;

/// Reference ring buffer size, in bytes. Must be a power of two and
/// divisible by 128.
pub const DEFAULT_RING_BUFFER_BYTES: usize = 8192;

/// A single 32-bit delta-encoded sample word: `[delta:24][pins:8]`.
/// The all-zero word is the end-of-stream sentinel.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct Sample(pub u32);

impl Sample {
    pub const ZERO: Sample = Sample(0);

    #[inline]
    pub fn new(delta: u32, pins: u8) -> Self {
        debug_assert!(delta <= 0x00FF_FFFF, "delta exceeds 24 bits");
        Sample((delta << 8) | pins as u32)
    }

    #[inline]
    pub fn is_sentinel(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn delta(&self) -> u32 {
        self.0 >> 8
    }

    #[inline]
    pub fn pins(&self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    pub fn to_le_bytes(&self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    pub fn from_le_bytes(bytes: [u8; 4]) -> Self {
        Sample(u32::from_le_bytes(bytes))
    }
}

/// Logic level an actuation event applies to a pin.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Level {
    Clear = 0,
    Set = 1,
    Toggle = 2,
}

impl TryFrom<u8> for Level {
    type Error = InvalidLevel;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Level::Clear),
            1 => Ok(Level::Set),
            2 => Ok(Level::Toggle),
            _ => Err(InvalidLevel(v)),
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, thiserror::Error)]
#[error("invalid actuation level {0} (expected 0, 1 or 2)")]
pub struct InvalidLevel(pub u8);

/// The five output pins the actuation scheduler drives. Distinct from the
/// eight traced *input* pins above, though SIG1/SIG2/nRST/PPS are commonly
/// looped back into the trace so the effect of an actuation shows up in the
/// decoded edge stream.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum ActuationPin {
    Sig1,
    Sig2,
    NReset,
    Pps,
    ActuationEnable,
}

impl fmt::Display for ActuationPin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActuationPin::Sig1 => "SIG1",
            ActuationPin::Sig2 => "SIG2",
            ActuationPin::NReset => "nRST",
            ActuationPin::Pps => "PPS",
            ActuationPin::ActuationEnable => "ACTEN",
        };
        f.write_str(s)
    }
}

/// Reference GPIO numbers for the actuation pins, as wired on the testbed
/// this stack was built for. Board-specific; overridable at daemon startup.
pub mod reference_pins {
    pub const SIG1: u32 = 89;
    pub const SIG2: u32 = 88;
    pub const N_RESET: u32 = 77;
    pub const PPS: u32 = 66;
    pub const ACTUATION_ENABLE: u32 = 65;
}

/// A single scheduled actuation: `offset_us` is microseconds since the
/// previous event in the queue (the head event's offset is relative to the
/// armed start time).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ActuationEvent {
    pub offset_us: u32,
    pub pin: ActuationPin,
    pub level: Level,
}

/// Offsets below this many microseconds (but nonzero) are coalesced to zero,
/// meaning "execute together with the previous event".
pub const MIN_PERIOD_US: u32 = 10;

/// Fixed actuation event queue capacity. Must remain a power of two.
pub const QUEUE_CAPACITY: usize = 8192;

/// Timer arming offset compensation, in microseconds, applied to the start
/// marker only. Negative because the kernel's absolute timer historically
/// fires slightly late; this is a tunable derived from measured scheduling
/// latency on the reference hardware, not a universal constant.
pub const TIMER_OFS_US: i64 = -90;

/// If the remaining time to the next integer second exceeds this many
/// nanoseconds when a PPS firing is about to occur, the piggyback path gives
/// up and lets the PPS edge fire as a normal (jittery) timer event instead of
/// busy-waiting for it.
pub const PPS_MAX_WAITTIME_NS: u64 = 220_000;

/// Handshake timeout for the coprocessor start/stop handshake.
pub const HANDSHAKE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_round_trips_delta_and_pins() {
        let s = Sample::new(0x00ABCDEF & 0x00FF_FFFF, 0b1010_0101);
        assert_eq!(s.delta(), 0x00ABCDEF & 0x00FF_FFFF);
        assert_eq!(s.pins(), 0b1010_0101);
    }

    #[test]
    fn zero_word_is_sentinel() {
        assert!(Sample::ZERO.is_sentinel());
        assert!(!Sample::new(1, 0).is_sentinel());
    }

    #[test]
    fn sample_le_byte_round_trip() {
        let s = Sample::new(10, 0b0000_0001);
        assert_eq!(Sample::from_le_bytes(s.to_le_bytes()), s);
    }

    #[test]
    fn level_conversion_rejects_out_of_range() {
        assert_eq!(Level::try_from(0).unwrap(), Level::Clear);
        assert_eq!(Level::try_from(1).unwrap(), Level::Set);
        assert_eq!(Level::try_from(2).unwrap(), Level::Toggle);
        assert!(Level::try_from(3).is_err());
    }

    #[test]
    fn pin_labels_cover_both_vectors() {
        assert_eq!(pin_label(0, false), "LED1");
        assert_eq!(pin_label(0, true), "P845");
        assert_eq!(pin_label(PPS_BIT, false), "PPS");
        assert_eq!(pin_label(PPS_BIT, true), "P827");
    }

    #[test]
    fn queue_capacity_is_power_of_two() {
        assert_eq!(QUEUE_CAPACITY & (QUEUE_CAPACITY - 1), 0);
    }
}
