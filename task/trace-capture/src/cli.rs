use std::path::PathBuf;

use clap::Parser;

use crate::options::CaptureFlags;

/// Drives the coprocessor through one capture and writes a decoded CSV.
///
/// The positional surface intentionally mirrors the legacy
/// `<outfile> [starttime] [stop_or_duration] [pinmask] [offset_s]
/// [extra_options_hex]` contract so existing orchestration scripts keep
/// working unmodified; the long flags below are the preferred way to set
/// individual capability bits for anything new.
#[derive(Parser, Debug)]
#[command(name = "trace-capture", version)]
pub struct Cli {
    /// Backing file for the raw delta-sample stream and, after decoding,
    /// `<outfile>.csv`.
    pub outfile: PathBuf,

    /// Trace start, in wall-clock epoch seconds; values below 1000 are
    /// interpreted as "now + this many seconds". Defaults to "now".
    pub starttime: Option<i64>,

    /// Trace stop: zero for indefinite, an epoch second, or (below the
    /// current time) a duration in seconds from start.
    pub stop_or_duration: Option<i64>,

    /// Bitmask of traced pins (bit 7 is always sampled regardless).
    #[arg(value_parser = parse_u8_flexible)]
    pub pinmask: Option<u8>,

    /// Seconds to wait after the handshake before trusting PPS sync.
    pub offset_s: Option<u64>,

    /// Legacy capability bitmask, hex-encoded (e.g. `0x105`). Overrides
    /// every capability flag below when present.
    #[arg(value_parser = parse_u32_hex)]
    pub extra_options_hex: Option<u32>,

    #[arg(long)]
    pub debug: bool,

    #[arg(long)]
    pub no_reset_remap: bool,

    #[arg(long)]
    pub stepwise: bool,

    #[arg(long, value_enum, default_value = "standard")]
    pub rate: RateArg,

    #[arg(long)]
    pub shared_memory: bool,

    #[arg(long)]
    pub dual_core: bool,

    #[arg(long)]
    pub no_pps: bool,

    #[arg(long)]
    pub relative_time_only: bool,

    #[arg(long)]
    pub alt_pin_labels: bool,

    #[arg(long)]
    pub stdout_mirror: bool,

    /// Overrides every flag above with a raw legacy hex word, exactly as
    /// `extra_options_hex` does when given positionally.
    #[arg(long, value_parser = parse_u32_hex)]
    pub raw_options: Option<u32>,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, clap::ValueEnum)]
pub enum RateArg {
    Standard,
    Medium,
    Low,
    Cyclecounter,
}

fn parse_u8_flexible(s: &str) -> Result<u8, String> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u8::from_str_radix(hex, 16).map_err(|e| e.to_string())
    } else {
        s.parse::<u8>().map_err(|e| e.to_string())
    }
}

fn parse_u32_hex(s: &str) -> Result<u32, String> {
    let hex = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    u32::from_str_radix(hex, 16).map_err(|e| e.to_string())
}

impl Cli {
    /// Resolves the effective capability flags: the raw hex word (from
    /// either the positional or `--raw-options` form) takes precedence
    /// over the individual long flags.
    pub fn resolve_flags(&self) -> CaptureFlags {
        if let Some(word) = self.raw_options.or(self.extra_options_hex) {
            return CaptureFlags::from_extra_options_word(word);
        }

        use crate::options::RateSelection;
        CaptureFlags {
            debug_logging: self.debug,
            no_reset_remap: self.no_reset_remap,
            stepwise_scaling: self.stepwise,
            rate: match self.rate {
                RateArg::Standard => RateSelection::Standard,
                RateArg::Medium => RateSelection::Medium,
                RateArg::Low => RateSelection::Low,
                RateArg::Cyclecounter => RateSelection::CycleCounter,
            },
            shared_memory_buffer: self.shared_memory,
            dual_core_helper: self.dual_core,
            no_pps: self.no_pps,
            relative_time_only: self.relative_time_only,
            alt_pin_labels: self.alt_pin_labels,
            stdout_mirror: self.stdout_mirror,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_options_overrides_individual_flags() {
        let cli = Cli::parse_from([
            "trace-capture",
            "out.bin",
            "--stepwise",
            "--raw-options",
            "0x0",
        ]);
        let flags = cli.resolve_flags();
        assert!(!flags.stepwise_scaling, "raw-options=0x0 should clear stepwise");
    }

    #[test]
    fn individual_flags_apply_without_raw_options() {
        let cli = Cli::parse_from(["trace-capture", "out.bin", "--stepwise", "--no-pps"]);
        let flags = cli.resolve_flags();
        assert!(flags.stepwise_scaling);
        assert!(flags.no_pps);
    }
}
