mod cli;
mod csv_writer;
mod drain;
mod options;

use std::fs::{File, OpenOptions};
use std::io::BufWriter;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::Parser;
use coprocessor_bridge::{effective_pin_mask, select_firmware, BridgeConfig, CoprocessorBridge};

use cli::Cli;

/// UIO device exposing the coprocessor's interrupt-equivalent event
/// channel. Deployment-specific; the reference testbed wires PRU1's
/// EVTOUT channel to this node.
const EVENT_CHANNEL_PATH: &str = "/dev/uio0";
/// Physical memory device used to map both the shared sample buffer and
/// the coprocessor's data RAM window.
const MEM_DEVICE_PATH: &str = "/dev/mem";
/// Physical base address of the DMA-carved region the coprocessor writes
/// samples into. Board-specific.
const BUFFER_PHYSICAL_ADDRESS: u64 = 0x9F00_0000;
/// Physical base address of the coprocessor's data RAM, where the config
/// record and handshake flag are written.
const DATA_RAM_PHYSICAL_ADDRESS: u64 = 0x4A30_2000;
const DATA_RAM_SIZE: usize = 0x1000;
const FIRMWARE_DIR: &str = "/lib/firmware";
const LOCK_FILE_PATH: &str = "/var/run/trace-capture.lock";
const LOG_FILE_PATH: &str = "/var/log/trace-capture.log";

/// Exit codes per the external-interface contract (§6).
mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const ARG_OR_SIGNAL_ERROR: i32 = 1;
    pub const OUTPUT_OPEN_FAIL: i32 = 2;
    pub const COPROCESSOR_INIT_FAIL: i32 = 3;
    pub const RUNTIME_ERROR: i32 = 4;
}

fn main() {
    std::process::exit(real_main());
}

fn real_main() -> i32 {
    let cli = Cli::parse();
    let flags = cli.resolve_flags();

    if let Err(e) = logfile::init(Path::new(LOG_FILE_PATH), if flags.debug_logging { "debug" } else { "info" }) {
        eprintln!("warning: failed to install log file sink: {e}");
    }

    let _lock = match acquire_singleton_lock(LOCK_FILE_PATH) {
        Ok(lock) => lock,
        Err(e) => {
            log::error!("another trace-capture instance is already running: {e}");
            return exit_code::ARG_OR_SIGNAL_ERROR;
        }
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    let abort_conversion = Arc::new(AtomicBool::new(false));
    if let Err(e) = install_signal_handlers(&shutdown, &abort_conversion) {
        log::error!("failed to install signal handlers: {e}");
        return exit_code::ARG_OR_SIGNAL_ERROR;
    }

    match run(&cli, &flags, &shutdown, &abort_conversion) {
        Ok(()) => exit_code::SUCCESS,
        Err(e) if e.is::<OutputOpenError>() => {
            log::error!("{e:#}");
            exit_code::OUTPUT_OPEN_FAIL
        }
        Err(e) if e.is::<CoprocessorInitError>() => {
            log::error!("{e:#}");
            exit_code::COPROCESSOR_INIT_FAIL
        }
        Err(e) if abort_conversion.load(Ordering::SeqCst) => {
            log::warn!("interrupted: {e:#}");
            exit_code::RUNTIME_ERROR
        }
        Err(e) => {
            log::error!("trace-capture failed: {e:#}");
            exit_code::RUNTIME_ERROR
        }
    }
}

/// Marker wrapping a failure to open the backing output file, so `main`
/// can map it to its own exit code without `run` returning anything but
/// `anyhow::Result`.
#[derive(Debug, thiserror::Error)]
#[error("failed to open output file {path}: {source}")]
struct OutputOpenError {
    path: String,
    #[source]
    source: std::io::Error,
}

#[derive(Debug, thiserror::Error)]
#[error("coprocessor init failed: {0}")]
struct CoprocessorInitError(#[source] coprocessor_bridge::BridgeError);

fn acquire_singleton_lock(path: &str) -> anyhow::Result<File> {
    let file = OpenOptions::new().create(true).write(true).open(path)?;
    nix::fcntl::flock(
        std::os::unix::io::AsRawFd::as_raw_fd(&file),
        nix::fcntl::FlockArg::LockExclusiveNonblock,
    )?;
    Ok(file)
}

/// SIGINT and SIGTERM both set `shutdown`, which unblocks the drain loop;
/// they also set `abort_conversion` so a signal arriving during the
/// decode/CSV pass short-circuits it instead of grinding through a
/// half-written trace file.
fn install_signal_handlers(shutdown: &Arc<AtomicBool>, abort_conversion: &Arc<AtomicBool>) -> anyhow::Result<()> {
    for sig in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(sig, Arc::clone(shutdown))?;
        signal_hook::flag::register(sig, Arc::clone(abort_conversion))?;
    }
    Ok(())
}

fn now_epoch_s() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Resolves a starttime argument per §3: values below 1000 are an offset
/// from now; anything else is an absolute epoch second.
fn resolve_start(starttime: Option<i64>) -> u64 {
    let now = now_epoch_s();
    match starttime {
        None => now,
        Some(v) if v < 1000 => now.saturating_add(v.max(0) as u64),
        Some(v) => v as u64,
    }
}

/// Resolves stop per §3: zero is indefinite, a small value is a duration
/// from start, otherwise an absolute epoch second.
fn resolve_stop(stop_or_duration: Option<i64>, start_s: u64) -> u64 {
    match stop_or_duration {
        None | Some(0) => 0,
        Some(v) if (v as u64) < start_s => start_s.saturating_add(v as u64),
        Some(v) => v as u64,
    }
}

fn run(
    cli: &Cli,
    flags: &options::CaptureFlags,
    shutdown: &AtomicBool,
    abort_conversion: &AtomicBool,
) -> anyhow::Result<()> {
    let start_s = resolve_start(cli.starttime);
    let stop_s = resolve_stop(cli.stop_or_duration, start_s);
    let offset_s = cli.offset_s.unwrap_or(0);
    let requested_mask = cli.pinmask.unwrap_or(0xFF);
    let pin_mask = effective_pin_mask(requested_mask, !flags.no_pps);

    let firmware = select_firmware(flags.firmware(), Path::new(FIRMWARE_DIR));
    let sampling_rate = firmware.sampling_rate_hz();

    let bridge_cfg = BridgeConfig {
        event_channel_path: EVENT_CHANNEL_PATH,
        mem_device_path: MEM_DEVICE_PATH,
        buffer_physical_address: BUFFER_PHYSICAL_ADDRESS,
        buffer_size: trace_proto::DEFAULT_RING_BUFFER_BYTES,
        data_ram_physical_address: DATA_RAM_PHYSICAL_ADDRESS,
        data_ram_size: DATA_RAM_SIZE,
        pin_mask,
        offset_s,
    };

    let mut bridge = CoprocessorBridge::init(&bridge_cfg).map_err(CoprocessorInitError)?;

    wait_until_start(start_s, shutdown);

    bridge
        .handshake(trace_proto::HANDSHAKE_TIMEOUT)
        .map_err(CoprocessorInitError)?;

    let effective_start = now_epoch_s();
    if effective_start > start_s {
        log::warn!("coprocessor handshake completed {}s late; adjusting start time", effective_start - start_s);
    }
    let effective_start = effective_start.max(start_s);

    let out_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&cli.outfile)
        .map_err(|source| OutputOpenError {
            path: cli.outfile.display().to_string(),
            source,
        })?;
    let mut writer = BufWriter::new(out_file);

    let outcome = drain::drain(&mut bridge, &mut writer, stop_s, shutdown)?;
    if outcome.overrun {
        log::error!("trace ended due to buffer overrun after {} half-fills", outcome.readout_count);
    }

    let effective_stop = now_epoch_s().max(effective_start);

    if abort_conversion.load(Ordering::SeqCst) {
        log::warn!("decode pass aborted by signal; raw trace file preserved");
        return Ok(());
    }

    post_process(cli, flags, sampling_rate, effective_start, effective_stop)
}

fn wait_until_start(start_s: u64, shutdown: &AtomicBool) {
    const POLL: Duration = Duration::from_millis(200);
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        let now = now_epoch_s();
        if now > start_s {
            return;
        }
        std::thread::sleep(POLL);
    }
}

fn post_process(
    cli: &Cli,
    flags: &options::CaptureFlags,
    sampling_rate: u64,
    start_s: u64,
    stop_s: u64,
) -> anyhow::Result<()> {
    let csv_path = cli.outfile.with_extension("csv");
    let csv_out = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&csv_path)?;
    let mut csv_writer = BufWriter::new(csv_out);

    if flags.relative_time_only {
        let mut reader = std::fs::File::open(&cli.outfile)?;
        let edges = trace_decode::decode_stream(&mut reader)?;
        csv_writer::write_unscaled(&mut csv_writer, &edges, sampling_rate, flags.alt_pin_labels)?;
        return Ok(());
    }

    if flags.stepwise_scaling {
        let mut reader = std::fs::File::open(&cli.outfile)?;
        let result = timescale::reconstruct_stepwise(&mut reader, sampling_rate, start_s, stop_s)?;
        for warning in &result.warnings {
            log_scale_warning(warning);
        }
        csv_writer::write_scaled(&mut csv_writer, &result.samples, sampling_rate, flags.alt_pin_labels)?;
    } else {
        let mut reader = std::fs::File::open(&cli.outfile)?;
        let edges = trace_decode::decode_stream(&mut reader)?;
        let (samples, warning) = timescale::reconstruct_flat(&edges, start_s, stop_s, sampling_rate)?;
        if let Some(warning) = &warning {
            log_scale_warning(warning);
        }
        csv_writer::write_scaled(&mut csv_writer, &samples, sampling_rate, flags.alt_pin_labels)?;
    }

    Ok(())
}

fn log_scale_warning(warning: &timescale::ScaleWarning) {
    match warning {
        timescale::ScaleWarning::CorrOutOfRange { corr } => {
            log::error!("timestamp scaling failed: correction factor {corr:.6} out of range, falling back to 1.0");
        }
        timescale::ScaleWarning::CorrJump { delta } => {
            log::warn!("correction factor discontinuity of {delta:.2e}, likely sample loss");
        }
        timescale::ScaleWarning::FinalSyncMismatch { expected, actual } => {
            log::warn!("final PPS sync landed on second {actual}, expected {expected}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_start_treats_small_values_as_relative() {
        let now = now_epoch_s();
        assert!(resolve_start(Some(5)) >= now);
        assert!(resolve_start(Some(5)) <= now + 6);
    }

    #[test]
    fn resolve_start_treats_large_values_as_absolute() {
        assert_eq!(resolve_start(Some(2_000_000_000)), 2_000_000_000);
    }

    #[test]
    fn resolve_stop_zero_is_indefinite() {
        assert_eq!(resolve_stop(Some(0), 1000), 0);
        assert_eq!(resolve_stop(None, 1000), 0);
    }
}
