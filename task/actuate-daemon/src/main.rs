mod commands;
mod control;
mod scheduler;

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use clap::Parser;
use evtqueue::SharedEventQueue;
use gpio_writer::GpioWriter;

use scheduler::{PinMap, Scheduler};

const MEM_DEVICE_PATH: &str = "/dev/mem";
const LOCK_FILE_PATH: &str = "/var/run/actuate-daemon.lock";
const LOG_FILE_PATH: &str = "/var/log/actuate-daemon.log";

/// Drives the testbed's actuation pins (SIG1/SIG2/nRST/PPS/ACTEN) from a
/// command stream submitted over a Unix domain socket.
#[derive(Parser, Debug)]
#[command(name = "actuate-daemon", version)]
struct Cli {
    /// Path to the control socket.
    #[arg(long, default_value = "/var/run/actuate-daemon.sock")]
    socket: std::path::PathBuf,

    /// GPIO number for SIG1, overriding the reference testbed wiring.
    #[arg(long)]
    sig1_pin: Option<u32>,
    #[arg(long)]
    sig2_pin: Option<u32>,
    #[arg(long)]
    n_reset_pin: Option<u32>,
    #[arg(long)]
    pps_pin: Option<u32>,
    #[arg(long)]
    actuation_enable_pin: Option<u32>,

    #[arg(long)]
    debug: bool,
}

impl Cli {
    fn pin_map(&self) -> PinMap {
        let defaults = PinMap::default();
        PinMap {
            sig1: self.sig1_pin.unwrap_or(defaults.sig1),
            sig2: self.sig2_pin.unwrap_or(defaults.sig2),
            n_reset: self.n_reset_pin.unwrap_or(defaults.n_reset),
            pps: self.pps_pin.unwrap_or(defaults.pps),
            actuation_enable: self.actuation_enable_pin.unwrap_or(defaults.actuation_enable),
        }
    }
}

fn main() {
    std::process::exit(real_main());
}

fn real_main() -> i32 {
    let cli = Cli::parse();

    if let Err(e) = logfile::init(Path::new(LOG_FILE_PATH), if cli.debug { "debug" } else { "info" }) {
        eprintln!("warning: failed to install log file sink: {e}");
    }

    let _lock = match acquire_singleton_lock(LOCK_FILE_PATH) {
        Ok(lock) => lock,
        Err(e) => {
            log::error!("another actuate-daemon instance is already running: {e}");
            return 1;
        }
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    if let Err(e) = install_signal_handlers(&shutdown) {
        log::error!("failed to install signal handlers: {e}");
        return 1;
    }

    let pins = cli.pin_map();
    let writer = match GpioWriter::open(MEM_DEVICE_PATH, &pins.all_pins()) {
        Ok(w) => w,
        Err(e) => {
            log::error!("failed to open GPIO register block: {e}");
            return 3;
        }
    };

    let queue = Arc::new(SharedEventQueue::new());
    let scheduler = Arc::new(Mutex::new(Scheduler::new(Arc::clone(&queue), writer, pins)));

    log::info!("actuate-daemon listening on {}", cli.socket.display());
    match control::serve(&cli.socket, scheduler, queue, shutdown) {
        Ok(()) => 0,
        Err(e) => {
            log::error!("control socket error: {e}");
            4
        }
    }
}

fn acquire_singleton_lock(path: &str) -> anyhow::Result<File> {
    let file = OpenOptions::new().create(true).write(true).open(path)?;
    nix::fcntl::flock(
        std::os::unix::io::AsRawFd::as_raw_fd(&file),
        nix::fcntl::FlockArg::LockExclusiveNonblock,
    )?;
    Ok(file)
}

fn install_signal_handlers(shutdown: &Arc<AtomicBool>) -> anyhow::Result<()> {
    for sig in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(sig, Arc::clone(shutdown))?;
    }
    Ok(())
}
