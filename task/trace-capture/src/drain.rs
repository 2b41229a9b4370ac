//! The sample drain loop (§4.D): blocks on the coprocessor's event
//! channel, writes each filled half to the backing file, and watches for
//! overrun by immediately re-probing the channel with a tight timeout.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use coprocessor_bridge::CoprocessorBridge;

/// Overrun: a second event arrived within this long of servicing the
/// previous one, meaning the producer lapped the consumer.
const OVERRUN_PROBE: Duration = Duration::from_micros(10);

/// Normal drain-loop wait, long enough to avoid needless wakeups but short
/// enough to notice a stop condition promptly.
const DRAIN_POLL_TIMEOUT: Duration = Duration::from_millis(200);

/// Extra bytes copied after the active half on stop, to catch any samples
/// written in the instant between the last drain and the quiescing
/// handshake.
const STOP_TRAILING_BYTES: usize = 32;

pub struct DrainOutcome {
    pub overrun: bool,
    pub readout_count: u64,
}

fn now_epoch_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Runs the drain loop until `stop_s` is reached (0 means run until
/// `shutdown_requested` is set by a signal handler), writing filled halves
/// to `out` as they arrive.
pub fn drain(
    bridge: &mut CoprocessorBridge,
    out: &mut impl Write,
    stop_s: u64,
    shutdown_requested: &AtomicBool,
) -> anyhow::Result<DrainOutcome> {
    let mut overrun = false;

    loop {
        if shutdown_requested.load(Ordering::SeqCst) {
            break;
        }
        if stop_s != 0 && now_epoch_s() >= stop_s {
            break;
        }

        if !bridge.wait_event(DRAIN_POLL_TIMEOUT)? {
            continue;
        }

        let half = bridge.read_filled_half().to_vec();
        out.write_all(&half)?;
        bridge.zero_last_read_half();

        if bridge.wait_event(OVERRUN_PROBE)? {
            overrun = true;
            log::error!("coprocessor buffer overrun detected; stopping drain");
            break;
        }
    }

    bridge.handshake(trace_proto::HANDSHAKE_TIMEOUT)?;
    let tail = bridge.read_active_half_with_trailing(STOP_TRAILING_BYTES).to_vec();
    out.write_all(&tail)?;
    out.flush()?;

    Ok(DrainOutcome {
        overrun,
        readout_count: bridge.readout_count(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_trailing_bytes_is_sample_aligned() {
        assert_eq!(STOP_TRAILING_BYTES % 4, 0);
    }
}
