//! The realtime actuation scheduler (§4.G): an absolute, one-shot hardware
//! timer drains [`SharedEventQueue`] and drives GPIO pins on deadline, with
//! a busy-wait fast path that piggybacks the PPS rising edge onto the
//! nearest integer-second boundary (§4.G.1).
//!
//! The timer thread runs in an interrupt-like discipline: once armed it
//! only blocks on its own absolute-time wakeup, never allocates, and its
//! only I/O is memory-mapped register writes and busy-wait spin loops.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use nix::time::clock_gettime;

use evtqueue::SharedEventQueue;
use gpio_writer::GpioWriter;
use trace_proto::{reference_pins, ActuationEvent, ActuationPin, Level, PPS_MAX_WAITTIME_NS, TIMER_OFS_US};

/// The pin-level operations the scheduler needs from a GPIO driver. Exists
/// so the timer callback's coalescing logic can be exercised against a
/// recording fake in tests, without a real memory-mapped register block.
pub trait PinActuator: Send {
    fn set(&mut self, pin: u32);
    fn clear(&mut self, pin: u32);
    fn toggle(&mut self, pin: u32);
}

impl PinActuator for GpioWriter {
    fn set(&mut self, pin: u32) {
        GpioWriter::set(self, pin)
    }
    fn clear(&mut self, pin: u32) {
        GpioWriter::clear(self, pin)
    }
    fn toggle(&mut self, pin: u32) {
        GpioWriter::toggle(self, pin)
    }
}

/// Maps each logical actuation pin to a concrete GPIO number. Defaults to
/// the reference testbed wiring; overridable so the daemon isn't hard-wired
/// to one board's pinout.
#[derive(Copy, Clone, Debug)]
pub struct PinMap {
    pub sig1: u32,
    pub sig2: u32,
    pub n_reset: u32,
    pub pps: u32,
    pub actuation_enable: u32,
}

impl Default for PinMap {
    fn default() -> Self {
        PinMap {
            sig1: reference_pins::SIG1,
            sig2: reference_pins::SIG2,
            n_reset: reference_pins::N_RESET,
            pps: reference_pins::PPS,
            actuation_enable: reference_pins::ACTUATION_ENABLE,
        }
    }
}

impl PinMap {
    fn gpio_pin(&self, pin: ActuationPin) -> u32 {
        match pin {
            ActuationPin::Sig1 => self.sig1,
            ActuationPin::Sig2 => self.sig2,
            ActuationPin::NReset => self.n_reset,
            ActuationPin::Pps => self.pps,
            ActuationPin::ActuationEnable => self.actuation_enable,
        }
    }

    pub fn all_pins(&self) -> [u32; 5] {
        [self.sig1, self.sig2, self.n_reset, self.pps, self.actuation_enable]
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler is already armed")]
    AlreadyArmed,
    #[error("failed to create timer: {0}")]
    TimerCreate(#[source] nix::Error),
    #[error("failed to arm timer: {0}")]
    TimerArm(#[source] nix::Error),
}

fn drive(writer: &Mutex<Box<dyn PinActuator>>, pins: &PinMap, event: ActuationEvent) {
    let gpio = pins.gpio_pin(event.pin);
    let mut w = writer.lock().expect("gpio writer mutex poisoned");
    match event.level {
        Level::Set => w.set(gpio),
        Level::Clear => w.clear(gpio),
        Level::Toggle => w.toggle(gpio),
    }
}

fn now_ns(clock: ClockId) -> i128 {
    let ts = clock_gettime(clock).expect("clock_gettime");
    ts.tv_sec() as i128 * 1_000_000_000 + ts.tv_nsec() as i128
}

/// Spins until at least `ns` nanoseconds have elapsed. Never sleeps; this is
/// the whole point of the piggyback fast path.
fn busy_wait_ns(ns: i64) {
    if ns <= 0 {
        return;
    }
    let deadline = now_ns(ClockId::CLOCK_MONOTONIC) + ns as i128;
    while now_ns(ClockId::CLOCK_MONOTONIC) < deadline {
        std::hint::spin_loop();
    }
}

fn timespec_from_ns(ns: i128) -> TimeSpec {
    let sec = ns.div_euclid(1_000_000_000) as i64;
    let nsec = ns.rem_euclid(1_000_000_000) as i64;
    TimeSpec::new(sec, nsec)
}

fn arm_absolute(tfd: &TimerFd, target_ns: i128) -> nix::Result<()> {
    tfd.set(Expiration::OneShot(timespec_from_ns(target_ns)), TimerSetTimeFlags::TFD_TIMER_ABSTIME)
}

fn arm_relative(tfd: &TimerFd, delay_ns: i64) -> nix::Result<()> {
    let delay_ns = delay_ns.max(0);
    tfd.set(Expiration::OneShot(timespec_from_ns(delay_ns as i128)), TimerSetTimeFlags::empty())
}

/// Executes the rising-PPS-edge firing per §4.G.1: if there's enough time
/// left before the next integer second, busy-wait for it (pulling in any
/// queued events that fit inside the remaining window along the way);
/// otherwise skip the edge entirely and count it.
fn fire_pps_piggyback(
    queue: &SharedEventQueue,
    writer: &Mutex<Box<dyn PinActuator>>,
    pins: &PinMap,
    skipped_count: &AtomicU32,
    pps_event: ActuationEvent,
) -> i64 {
    let ts_now = clock_gettime(ClockId::CLOCK_REALTIME).expect("clock_gettime");
    let mut delta_ns = 1_000_000_000i64 - ts_now.tv_nsec();

    if delta_ns as u64 >= PPS_MAX_WAITTIME_NS {
        skipped_count.fetch_add(1, Ordering::SeqCst);
        log::warn!("PPS piggyback window of {delta_ns}ns too wide; skipping edge");
        return 0;
    }

    let mut extra_ns: i64 = 0;
    while let Some(next) = queue.try_peek() {
        let next_ns = next.offset_us as i64 * 1000;
        if next_ns >= delta_ns {
            break;
        }
        let popped = queue.try_pop().expect("peek and pop raced on the single-consumer timer thread");
        busy_wait_ns(popped.offset_us as i64 * 1000);
        drive(writer, pins, popped);
        delta_ns -= next_ns;
        extra_ns += popped.offset_us as i64 * 1000;
    }

    busy_wait_ns(delta_ns);
    drive(writer, pins, pps_event);
    extra_ns / 1000
}

/// State threaded through successive timer firings.
struct TimerState {
    next_event: Option<ActuationEvent>,
}

fn fire_callback(
    state: &mut TimerState,
    queue: &SharedEventQueue,
    writer: &Mutex<Box<dyn PinActuator>>,
    pins: &PinMap,
    skipped_count: &AtomicU32,
) -> Option<i64> {
    let mut extra_us: i64 = 0;

    if let Some(evt) = state.next_event.take() {
        if evt.pin == ActuationPin::Pps && evt.level == Level::Set {
            extra_us += fire_pps_piggyback(queue, writer, pins, skipped_count, evt);
        } else {
            drive(writer, pins, evt);
        }
    }

    loop {
        match queue.try_pop() {
            None => {
                state.next_event = None;
                return None;
            }
            Some(evt) if evt.offset_us == 0 => {
                drive(writer, pins, evt);
            }
            Some(evt) => {
                state.next_event = Some(evt);
                return Some(evt.offset_us as i64 + extra_us);
            }
        }
    }
}

/// Owns the GPIO driver and the armed timer thread, if any. `SIG1`/`SIG2`
/// are left under the command queue's control; `cancel` is the only
/// operation that forces them low.
pub struct Scheduler {
    queue: Arc<SharedEventQueue>,
    writer: Arc<Mutex<Box<dyn PinActuator>>>,
    pins: PinMap,
    timer_running: Arc<AtomicBool>,
    cancel_requested: Arc<AtomicBool>,
    skipped_count: Arc<AtomicU32>,
    thread: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(queue: Arc<SharedEventQueue>, writer: GpioWriter, pins: PinMap) -> Self {
        Self::with_actuator(queue, Box::new(writer), pins)
    }

    /// Constructs a scheduler over any [`PinActuator`], not just a real
    /// memory-mapped [`GpioWriter`]. Used by tests to drive the timer
    /// callback logic against a recording fake.
    pub fn with_actuator(queue: Arc<SharedEventQueue>, writer: Box<dyn PinActuator>, pins: PinMap) -> Self {
        Scheduler {
            queue,
            writer: Arc::new(Mutex::new(writer)),
            pins,
            timer_running: Arc::new(AtomicBool::new(false)),
            cancel_requested: Arc::new(AtomicBool::new(false)),
            skipped_count: Arc::new(AtomicU32::new(0)),
            thread: None,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.timer_running.load(Ordering::SeqCst)
    }

    pub fn skipped_count(&self) -> u32 {
        self.skipped_count.load(Ordering::SeqCst)
    }

    /// Arms the timer for the absolute wall-clock second `target_abs_s`,
    /// compensated by `TIMER_OFS_US`. Spawns the dedicated timer thread,
    /// which runs until the queue drains or `cancel` is called.
    pub fn arm(&mut self, target_abs_s: u64) -> Result<(), SchedulerError> {
        if self.is_armed() {
            return Err(SchedulerError::AlreadyArmed);
        }

        let tfd = TimerFd::new(ClockId::CLOCK_REALTIME, TimerFlags::empty()).map_err(SchedulerError::TimerCreate)?;
        let target_ns = target_abs_s as i128 * 1_000_000_000 + TIMER_OFS_US as i128 * 1000;
        arm_absolute(&tfd, target_ns).map_err(SchedulerError::TimerArm)?;

        self.cancel_requested.store(false, Ordering::SeqCst);
        self.timer_running.store(true, Ordering::SeqCst);

        let queue = Arc::clone(&self.queue);
        let writer = Arc::clone(&self.writer);
        let pins = self.pins;
        let timer_running = Arc::clone(&self.timer_running);
        let cancel_requested = Arc::clone(&self.cancel_requested);
        let skipped_count = Arc::clone(&self.skipped_count);

        self.thread = Some(std::thread::spawn(move || {
            let mut state = TimerState { next_event: None };

            loop {
                if cancel_requested.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = tfd.wait() {
                    log::error!("timer wait failed: {e}");
                    break;
                }
                if cancel_requested.load(Ordering::SeqCst) {
                    break;
                }

                match fire_callback(&mut state, &queue, &writer, &pins, &skipped_count) {
                    Some(delay_us) => {
                        if let Err(e) = arm_relative(&tfd, delay_us * 1000) {
                            log::error!("failed to rearm timer: {e}");
                            break;
                        }
                    }
                    None => break,
                }
            }

            timer_running.store(false, Ordering::SeqCst);
        }));

        Ok(())
    }

    /// Cancels the timer thread, clears the queue, and drives SIG1/SIG2 low
    /// (reset state). Idempotent: safe to call when not armed.
    pub fn cancel(&mut self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        self.timer_running.store(false, Ordering::SeqCst);
        self.queue.clear();
        self.skipped_count.store(0, Ordering::SeqCst);

        let mut w = self.writer.lock().expect("gpio writer mutex poisoned");
        w.clear(self.pins.sig1);
        w.clear(self.pins.sig2);
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_map_defaults_to_reference_wiring() {
        let pins = PinMap::default();
        assert_eq!(pins.sig1, reference_pins::SIG1);
        assert_eq!(pins.pps, reference_pins::PPS);
    }

    #[test]
    fn busy_wait_returns_immediately_for_zero_or_negative() {
        busy_wait_ns(0);
        busy_wait_ns(-100);
    }

    #[test]
    fn timespec_roundtrips_whole_seconds() {
        let ts = timespec_from_ns(2_500_000_000);
        assert_eq!(ts.tv_sec(), 2);
        assert_eq!(ts.tv_nsec(), 500_000_000);
    }

    /// Records every pin-level change it's asked to make, in order, instead
    /// of touching real registers.
    struct RecordingActuator {
        log: Arc<Mutex<Vec<(u32, &'static str)>>>,
    }

    impl PinActuator for RecordingActuator {
        fn set(&mut self, pin: u32) {
            self.log.lock().unwrap().push((pin, "set"));
        }
        fn clear(&mut self, pin: u32) {
            self.log.lock().unwrap().push((pin, "clear"));
        }
        fn toggle(&mut self, pin: u32) {
            self.log.lock().unwrap().push((pin, "toggle"));
        }
    }

    fn evt(offset_us: u32, pin: ActuationPin, level: Level) -> ActuationEvent {
        ActuationEvent { offset_us, pin, level }
    }

    #[test]
    fn queue_full_rejects_the_8193rd_push() {
        let queue = SharedEventQueue::new();
        for i in 0..trace_proto::QUEUE_CAPACITY {
            queue.push(evt(i as u32, ActuationPin::Sig1, Level::Set)).unwrap();
        }
        assert_eq!(queue.len(), trace_proto::QUEUE_CAPACITY);
        assert!(queue.push(evt(0, ActuationPin::Sig1, Level::Set)).is_err());
        assert_eq!(queue.len(), trace_proto::QUEUE_CAPACITY);
    }

    /// Three events queued with offsets 1_000_000 / 0 / 0: the first timer
    /// firing executes the head event, then the coalescing loop in
    /// `fire_callback` drains both zero-offset events immediately rather
    /// than scheduling a separate wakeup for each.
    #[test]
    fn zero_offset_events_coalesce_into_one_firing() {
        let queue = SharedEventQueue::new();
        queue.push(evt(1_000_000, ActuationPin::Sig1, Level::Set)).unwrap();
        queue.push(evt(0, ActuationPin::Sig2, Level::Set)).unwrap();
        queue.push(evt(0, ActuationPin::NReset, Level::Set)).unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let writer: Mutex<Box<dyn PinActuator>> = Mutex::new(Box::new(RecordingActuator { log: Arc::clone(&log) }));
        let pins = PinMap::default();
        let skipped = AtomicU32::new(0);

        // First firing: no next_event yet, so it only primes state.next_event
        // with the head event and reports its offset as the next wakeup.
        let mut state = TimerState { next_event: None };
        let wakeup = fire_callback(&mut state, &queue, &writer, &pins, &skipped);
        assert_eq!(wakeup, Some(1_000_000));
        assert!(log.lock().unwrap().is_empty());

        // Second firing (simulating the timer having slept 1_000_000us):
        // executes the primed event, then drains both zero-offset events in
        // the same callback and reports no further wakeup.
        let wakeup = fire_callback(&mut state, &queue, &writer, &pins, &skipped);
        assert_eq!(wakeup, None);

        let recorded = log.lock().unwrap().clone();
        assert_eq!(recorded, vec![(pins.sig1, "set"), (pins.sig2, "set"), (pins.n_reset, "set")]);
    }
}
