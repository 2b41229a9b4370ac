//! Capability flags carried by the legacy "extra options" hex word (§6),
//! and the modern flag-based surface that feeds the same bits.

/// Bit layout of the legacy extra-options word, preserved for
/// compatibility with existing orchestration scripts that still assemble
/// it by hand.
mod bits {
    pub const DEBUG_LOGGING: u32 = 1 << 0;
    pub const NO_RESET_REMAP: u32 = 1 << 1;
    pub const STEPWISE_SCALING: u32 = 1 << 2;
    pub const RATE_MEDIUM: u32 = 1 << 3;
    pub const RATE_LOW: u32 = 1 << 4;
    pub const RATE_CYCLECOUNTER: u32 = 1 << 5;
    pub const SHARED_MEMORY_BUFFER: u32 = 1 << 6;
    pub const DUAL_CORE_HELPER: u32 = 1 << 7;
    pub const NO_PPS: u32 = 1 << 8;
    pub const RELATIVE_TIME_ONLY: u32 = 1 << 9;
    pub const ALT_PIN_LABELS: u32 = 1 << 10;
    pub const STDOUT_MIRROR: u32 = 1 << 11;
}

/// Sampling rate selection; mutually exclusive despite being encoded as
/// independent bits in the legacy word (highest-priority bit wins).
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum RateSelection {
    #[default]
    Standard,
    Medium,
    Low,
    CycleCounter,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct CaptureFlags {
    pub debug_logging: bool,
    pub no_reset_remap: bool,
    pub stepwise_scaling: bool,
    pub rate: RateSelection,
    pub shared_memory_buffer: bool,
    pub dual_core_helper: bool,
    pub no_pps: bool,
    pub relative_time_only: bool,
    pub alt_pin_labels: bool,
    pub stdout_mirror: bool,
}

impl CaptureFlags {
    pub fn from_extra_options_word(word: u32) -> Self {
        let rate = if word & bits::RATE_CYCLECOUNTER != 0 {
            RateSelection::CycleCounter
        } else if word & bits::RATE_LOW != 0 {
            RateSelection::Low
        } else if word & bits::RATE_MEDIUM != 0 {
            RateSelection::Medium
        } else {
            RateSelection::Standard
        };

        CaptureFlags {
            debug_logging: word & bits::DEBUG_LOGGING != 0,
            no_reset_remap: word & bits::NO_RESET_REMAP != 0,
            stepwise_scaling: word & bits::STEPWISE_SCALING != 0,
            rate,
            shared_memory_buffer: word & bits::SHARED_MEMORY_BUFFER != 0,
            dual_core_helper: word & bits::DUAL_CORE_HELPER != 0,
            no_pps: word & bits::NO_PPS != 0,
            relative_time_only: word & bits::RELATIVE_TIME_ONLY != 0,
            alt_pin_labels: word & bits::ALT_PIN_LABELS != 0,
            stdout_mirror: word & bits::STDOUT_MIRROR != 0,
        }
    }

    pub fn firmware(&self) -> coprocessor_bridge::Firmware {
        if self.dual_core_helper {
            return coprocessor_bridge::Firmware::DualCoreScratchpad;
        }
        match self.rate {
            RateSelection::Standard => coprocessor_bridge::Firmware::Standard10MHz,
            RateSelection::Medium => coprocessor_bridge::Firmware::Medium1MHz,
            RateSelection::Low => coprocessor_bridge::Firmware::Low100kHz,
            RateSelection::CycleCounter => coprocessor_bridge::Firmware::CycleCounter6_25MHz,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_rate_bits_with_cyclecounter_priority() {
        let word = bits::RATE_LOW | bits::RATE_CYCLECOUNTER;
        let flags = CaptureFlags::from_extra_options_word(word);
        assert_eq!(flags.rate, RateSelection::CycleCounter);
    }

    #[test]
    fn decodes_independent_boolean_bits() {
        let word = bits::DEBUG_LOGGING | bits::NO_PPS | bits::STDOUT_MIRROR;
        let flags = CaptureFlags::from_extra_options_word(word);
        assert!(flags.debug_logging);
        assert!(flags.no_pps);
        assert!(flags.stdout_mirror);
        assert!(!flags.shared_memory_buffer);
    }
}
