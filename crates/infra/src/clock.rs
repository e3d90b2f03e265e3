//! Wake timers and the per-instance virtual clock
//!
//! A [`WakeTimer`] is a dedicated worker thread executing single-shot,
//! self-rearming wakes against a [`TickSource`] deadline. Cancellation is
//! synchronous: once [`WakeTimer::cancel`] returns, no further wake fires
//! and no wake is in flight, which callers rely on before releasing the
//! instance's buffers.
//!
//! [`VirtualClock`] combines a timer with a [`ClockTimeline`] to emulate a
//! hardware DMA pointer with period-boundary notifications.

use crossbeam::channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use tracing::trace;

use virtuoso_core::domain::clock::{ticks_to_duration, ClockTimeline, TickSource};
use virtuoso_core::domain::pcm::EventSink;

enum TimerCmd {
    Arm { deadline: u64 },
    Cancel { done: Sender<()> },
    Shutdown,
}

/// Single-shot, self-rearming software timer on a dedicated thread
///
/// The wake callback returns the next absolute deadline in ticks, or
/// `None` to disarm. Commands and wakes are serialized on the worker, so
/// a `cancel` acknowledged after an in-flight wake means that wake has
/// fully completed.
pub struct WakeTimer {
    cmds: Sender<TimerCmd>,
    worker: Option<thread::JoinHandle<()>>,
}

impl WakeTimer {
    pub fn spawn(
        ticks: Arc<dyn TickSource>,
        on_wake: impl FnMut() -> Option<u64> + Send + 'static,
    ) -> Self {
        let (cmds, rx) = unbounded();
        let worker = thread::spawn(move || run_timer(rx, ticks, on_wake));
        Self {
            cmds,
            worker: Some(worker),
        }
    }

    /// Schedule the next wake at an absolute tick deadline
    pub fn arm_at(&self, deadline: u64) {
        let _ = self.cmds.send(TimerCmd::Arm { deadline });
    }

    /// Disarm and wait until any in-flight wake has finished
    pub fn cancel(&self) {
        let (done, ack) = bounded(0);
        if self.cmds.send(TimerCmd::Cancel { done }).is_ok() {
            let _ = ack.recv();
        }
    }
}

impl Drop for WakeTimer {
    fn drop(&mut self) {
        let _ = self.cmds.send(TimerCmd::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_timer(
    rx: Receiver<TimerCmd>,
    ticks: Arc<dyn TickSource>,
    mut on_wake: impl FnMut() -> Option<u64>,
) {
    let mut deadline: Option<u64> = None;
    loop {
        let cmd = match deadline {
            None => match rx.recv() {
                Ok(cmd) => Some(cmd),
                Err(_) => break,
            },
            Some(due) => {
                let now = ticks.now_ticks();
                if now >= due {
                    deadline = on_wake();
                    continue;
                }
                match rx.recv_timeout(ticks_to_duration(due - now)) {
                    Ok(cmd) => Some(cmd),
                    // Deadline re-checked at the top of the loop; a manual
                    // tick source may still be behind it
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        };

        if let Some(cmd) = cmd {
            match cmd {
                TimerCmd::Arm { deadline: due } => deadline = Some(due),
                TimerCmd::Cancel { done } => {
                    deadline = None;
                    let _ = done.send(());
                }
                TimerCmd::Shutdown => break,
            }
        }
    }
}

struct ClockShared {
    device: u32,
    timeline: Mutex<ClockTimeline>,
    running: AtomicBool,
    ticks: Arc<dyn TickSource>,
    sink: EventSink,
}

impl ClockShared {
    fn timeline(&self) -> MutexGuard<'_, ClockTimeline> {
        self.timeline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wake(&self) -> Option<u64> {
        if !self.running.load(Ordering::SeqCst) {
            return None;
        }
        let now = self.ticks.now_ticks();
        let (elapsed, next) = {
            let mut timeline = self.timeline();
            timeline.advance(now);
            (timeline.take_elapsed(), now + timeline.wake_in_ticks())
        };
        // Notify strictly after the lock is released: the consumer may
        // re-enter pointer() or trigger() on this same instance
        if elapsed > 0 {
            self.sink.period_elapsed(self.device, elapsed);
        }
        Some(next)
    }
}

/// Emulated DMA pointer and period interrupt for one open device instance
pub struct VirtualClock {
    shared: Arc<ClockShared>,
    timer: WakeTimer,
}

impl VirtualClock {
    pub fn new(device: u32, sink: EventSink, ticks: Arc<dyn TickSource>) -> Self {
        let shared = Arc::new(ClockShared {
            device,
            timeline: Mutex::new(ClockTimeline::new()),
            running: AtomicBool::new(false),
            ticks: Arc::clone(&ticks),
            sink,
        });
        let timer = {
            let shared = Arc::clone(&shared);
            WakeTimer::spawn(ticks, move || shared.wake())
        };
        Self { shared, timer }
    }

    /// Reset the timeline for a new run
    pub fn prepare(&self, byte_rate: u64, buffer_bytes: u64, period_bytes: u64) {
        self.shared
            .timeline()
            .prepare(byte_rate, buffer_bytes, period_bytes);
    }

    /// Anchor at the current tick and arm the first period wake
    pub fn start(&self) {
        let now = self.shared.ticks.now_ticks();
        let next = {
            let mut timeline = self.shared.timeline();
            timeline.start(now);
            now + timeline.wake_in_ticks()
        };
        self.shared.running.store(true, Ordering::SeqCst);
        trace!("Clock on device {} started, first wake at {}", self.shared.device, next);
        self.timer.arm_at(next);
    }

    /// Stop the clock; returns only once no further wake can fire
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.timer.cancel();
        trace!("Clock on device {} stopped", self.shared.device);
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Byte-accurate pointer; forces an advance while running
    ///
    /// Period crossings seen here stay pending and are delivered by the
    /// next wake, so notification stays at-most-once-per-wake.
    pub fn pointer(&self) -> u64 {
        let mut timeline = self.shared.timeline();
        if self.shared.running.load(Ordering::SeqCst) {
            timeline.advance(self.shared.ticks.now_ticks());
        }
        timeline.pos_bytes()
    }
}
