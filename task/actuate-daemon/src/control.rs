//! The actuation control channel (§6). The reference implementation
//! exposes a character device; a userspace daemon has no business minting
//! one, so this binds a Unix domain stream socket at a well-known path
//! instead: `write()` submits a command stream exactly as before, and the
//! next `read()` on the same connection returns the `OK <n>` / `ERROR
//! count: <n>` reply (§4.H).

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use evtqueue::SharedEventQueue;

use crate::commands::{parse_commands, resolve_arm_target, Command};
use crate::scheduler::Scheduler;

fn now_epoch_s() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Applies one parsed command, returning `true` if it succeeded. Errors are
/// logged with enough detail to diagnose from the log file alone, since the
/// reply to the client only ever carries a count.
fn apply(scheduler: &Mutex<Scheduler>, queue: &SharedEventQueue, cmd: Command) -> bool {
    match cmd {
        Command::Arm(arg) => {
            let target = resolve_arm_target(arg, now_epoch_s());
            match scheduler.lock().expect("scheduler mutex poisoned").arm(target) {
                Ok(()) => true,
                Err(e) => {
                    log::error!("arm failed: {e}");
                    false
                }
            }
        }
        Command::Cancel => {
            scheduler.lock().expect("scheduler mutex poisoned").cancel();
            true
        }
        Command::Enqueue(event) => {
            if scheduler.lock().expect("scheduler mutex poisoned").is_armed() {
                log::error!("rejected {event:?}: scheduler is armed, queue is frozen until cancel");
                return false;
            }
            match queue.push(event) {
                Ok(()) => true,
                Err(_) => {
                    log::error!("rejected {event:?}: queue is full");
                    false
                }
            }
        }
    }
}

fn handle_connection(mut stream: UnixStream, scheduler: Arc<Mutex<Scheduler>>, queue: Arc<SharedEventQueue>) {
    let mut buf = [0u8; 4096];
    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) => {
                log::warn!("control connection read error: {e}");
                return;
            }
        };

        let text = String::from_utf8_lossy(&buf[..n]);
        let (cmds, mut errors) = parse_commands(&text);
        for cmd in cmds {
            if !apply(&scheduler, &queue, cmd) {
                errors += 1;
            }
        }

        let reply = if errors == 0 {
            format!("OK {}\n", queue.len())
        } else {
            format!("ERROR count: {errors}\n")
        };

        if let Err(e) = stream.write_all(reply.as_bytes()) {
            log::warn!("control connection write error: {e}");
            return;
        }
    }
}

/// Binds the control socket and serves connections until `shutdown` is set.
/// Runs on the calling thread; callers typically spawn this onto its own
/// thread and drive the drain/accept loop from `main` via `shutdown`.
pub fn serve(path: &Path, scheduler: Arc<Mutex<Scheduler>>, queue: Arc<SharedEventQueue>, shutdown: Arc<AtomicBool>) -> std::io::Result<()> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)?;
    listener.set_nonblocking(true)?;

    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _addr)) => {
                stream.set_nonblocking(false)?;
                let scheduler = Arc::clone(&scheduler);
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || handle_connection(stream, scheduler, queue));
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
            Err(e) => {
                log::error!("control socket accept error: {e}");
                return Err(e);
            }
        }
    }

    let _ = std::fs::remove_file(path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_format_matches_protocol() {
        assert_eq!(format!("OK {}\n", 3), "OK 3\n");
        assert_eq!(format!("ERROR count: {}\n", 2), "ERROR count: 2\n");
    }
}
