//! Fans every `log` event out to two sinks: `env_logger`'s usual
//! stderr output (so `RUST_LOG` keeps working the way every other tool in
//! this workspace expects), and an append-only tab-separated log file,
//! whose line format is an external-interface contract rather than a
//! debugging convenience.
//!
//! Each file line is `YYYY-MM-DD HH:MM:SS<TAB>LEVEL<TAB>message`.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use log::{Log, Metadata, Record};

#[derive(Debug, thiserror::Error)]
pub enum LogfileError {
    #[error("failed to open log file: {0}")]
    Open(#[from] std::io::Error),
    #[error("a logger is already installed")]
    AlreadyInitialized(#[from] log::SetLoggerError),
}

struct TabFileLogger {
    stderr: env_logger::Logger,
    file: Mutex<File>,
}

impl Log for TabFileLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.stderr.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        self.stderr.log(record);

        if let Ok(mut file) = self.file.lock() {
            let now = chrono::Local::now();
            let _ = writeln!(
                file,
                "{}\t{}\t{}",
                now.format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            );
        }
    }

    fn flush(&self) {
        self.stderr.flush();
        if let Ok(mut file) = self.file.lock() {
            let _ = file.flush();
        }
    }
}

/// Installs the global logger: stderr via `env_logger` (honoring
/// `RUST_LOG`, falling back to `default_filter`) plus the append-only file
/// at `path`. Call once near the top of `main`.
pub fn init(path: &Path, default_filter: &str) -> Result<(), LogfileError> {
    let stderr = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).build();
    let max_level = stderr.filter();

    let file = OpenOptions::new().create(true).append(true).open(path)?;

    let logger = TabFileLogger {
        stderr,
        file: Mutex::new(file),
    };

    log::set_boxed_logger(Box::new(logger))?;
    log::set_max_level(max_level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_rejects_unwritable_path() {
        let err = init(Path::new("/nonexistent-dir/sub/log.txt"), "info");
        assert!(err.is_err());
    }
}
