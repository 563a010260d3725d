use crate::coroutine::{Coroutine, Step};
use crate::waiter::{Waiter, WaiterHandle};
use std::cell::RefCell;
use std::rc::Rc;

/// Tick period for rates above 100 per second.
const HIGH_FREQ_TICK_MS: u64 = 10;

/// Ticks per drift window in the high-frequency regime.
const WINDOW_SLICES: u16 = 100;

/// A gap above this between two ticks means the thread was blocked
/// somewhere; the tick is skipped instead of emitting a burst.
const STALL_GAP_MS: u64 = 200;

/// Rate regime, selected once per `set_repeat_per_second` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Regime {
    /// More than 100/s: emit a burst every 10 ms.
    HighFreq,
    /// (1, 100]/s: emit one instance every `interval` ms.
    MidFreq,
    /// (1e-3, 1]/s: one instance per multi-second period.
    LowFreq,
    Stopped,
}

#[derive(Debug)]
struct Schedule {
    req_count: f64,
    regime: Regime,
    /// Period between emissions (Mid/LowFreq), in milliseconds.
    interval: u64,
    /// The first `first_interval` periods of each window are stretched to
    /// absorb the division remainder.
    first_interval: u64,
    /// Burst size (HighFreq) or emissions per window (Mid/LowFreq).
    interval_count: u32,
    /// The first `first_interval_count` bursts carry one extra instance.
    first_interval_count: u32,
    /// Position within the current window.
    index: u16,
    /// Instances actually emitted since the window started.
    real_count: u32,
    window_start_ms: u64,
    last_ms: u64,
}

impl Schedule {
    fn new() -> Self {
        Self {
            req_count: 0.0,
            regime: Regime::Stopped,
            interval: 0,
            first_interval: 0,
            interval_count: 0,
            first_interval_count: 0,
            index: 0,
            real_count: 0,
            window_start_ms: 0,
            last_ms: 0,
        }
    }

    fn set_rate(&mut self, count: f64) {
        self.req_count = count;
        if count > 100.0 {
            let int_count = count as u32;
            self.interval_count = int_count / 100;
            self.first_interval_count = int_count % 100;
            self.regime = Regime::HighFreq;
        } else if count > 1.0 {
            let int_count = count as u32;
            self.interval = 1000 / u64::from(int_count);
            self.first_interval = 1000 % u64::from(int_count);
            self.interval_count = int_count;
            self.regime = Regime::MidFreq;
        } else if count > 1e-3 {
            let int_count = (count * 1000.0) as u32;
            self.interval = 1_000_000 / u64::from(int_count);
            self.first_interval = 1_000_000 % u64::from(int_count);
            self.interval_count = int_count;
            self.regime = Regime::LowFreq;
        } else {
            // Rates at or below 1e-3 (and NaN) emit nothing.
            self.regime = Regime::Stopped;
        }
        self.index = 0;
        self.real_count = 0;
    }

    fn stop(&mut self) {
        self.req_count = 0.0;
        self.regime = Regime::Stopped;
        self.interval = 0;
        self.first_interval = 0;
        self.interval_count = 0;
        self.first_interval_count = 0;
        self.index = 0;
        self.real_count = 0;
    }

    fn next_tick_ms(&self) -> u64 {
        match self.regime {
            Regime::HighFreq => HIGH_FREQ_TICK_MS,
            Regime::MidFreq => {
                if u64::from(self.index) < self.first_interval {
                    self.interval + 1
                } else {
                    self.interval
                }
            }
            Regime::LowFreq => {
                if u64::from(self.index) < self.first_interval {
                    self.interval + 1000
                } else {
                    self.interval
                }
            }
            Regime::Stopped => 0,
        }
    }
}

/// The repeater's own leaf body: one tick per deadline, re-armed forever
/// until stopped.
struct RepeaterBody {
    schedule: Rc<RefCell<Schedule>>,
    factory: Box<dyn FnMut() -> Box<dyn Coroutine>>,
}

impl Coroutine for RepeaterBody {
    fn start(&mut self, waiter: Waiter) -> Step {
        {
            let mut schedule = self.schedule.borrow_mut();
            schedule.last_ms = crate::now_ms();
            schedule.window_start_ms = 0;
        }
        self.tick(waiter)
    }

    fn resume(&mut self, waiter: Waiter) -> Step {
        self.tick(waiter)
    }
}

impl RepeaterBody {
    fn emit(&mut self) {
        let body = (self.factory)();
        Waiter::spawn_boxed(body).start();
    }

    // The schedule borrow is never held across emit(): spawned instances
    // run user code that may call back into the repeater.
    fn tick(&mut self, waiter: Waiter) -> Step {
        if waiter.is_stopped() {
            return Step::Complete;
        }
        let regime = self.schedule.borrow().regime;
        if regime == Regime::Stopped {
            return Step::Complete;
        }

        // Arm the next tick first; emissions below may take a while.
        waiter.set_timeout(self.schedule.borrow().next_tick_ms());

        let mut now = crate::now_ms();

        // Window turnover for the sub-second regimes: repay whatever the
        // wall clock says we owe, then open a fresh window.
        if matches!(regime, Regime::HighFreq | Regime::MidFreq)
            && self.schedule.borrow().index == 0
        {
            let window_start = self.schedule.borrow().window_start_ms;
            if window_start != 0 {
                now = crate::refresh_clock();
                let (req_count, real_count) = {
                    let schedule = self.schedule.borrow();
                    (schedule.req_count, schedule.real_count)
                };
                let expected =
                    ((now.saturating_sub(window_start) as f64 / 1000.0) * req_count) as i64;
                let mut owed = expected - i64::from(real_count);
                if owed > 0 {
                    tracing::debug!(owed, "repaying repeater drift");
                }
                while owed > 0 {
                    self.emit();
                    owed -= 1;
                }
            }
            let mut schedule = self.schedule.borrow_mut();
            schedule.window_start_ms = crate::refresh_clock();
            schedule.real_count = 0;
        }

        match regime {
            Regime::HighFreq => {
                let burst = {
                    let mut schedule = self.schedule.borrow_mut();
                    if now.saturating_sub(schedule.last_ms) > STALL_GAP_MS {
                        // Something blocked the thread since the previous
                        // tick; skip this one instead of bursting.
                        schedule.last_ms = now;
                        schedule.index = 0;
                        tracing::warn!("repeater tick skipped after a stall");
                        0
                    } else {
                        schedule.last_ms = now;
                        let burst = if u32::from(schedule.index) < schedule.first_interval_count {
                            schedule.interval_count + 1
                        } else {
                            schedule.interval_count
                        };
                        schedule.index = (schedule.index + 1) % WINDOW_SLICES;
                        burst
                    }
                };
                for _ in 0..burst {
                    self.emit();
                    self.schedule.borrow_mut().real_count += 1;
                }
            }
            Regime::MidFreq => {
                {
                    let mut schedule = self.schedule.borrow_mut();
                    schedule.index = (schedule.index + 1) % (schedule.interval_count as u16);
                    schedule.last_ms = now;
                }
                self.emit();
                self.schedule.borrow_mut().real_count += 1;
            }
            Regime::LowFreq => {
                self.emit();
                let mut schedule = self.schedule.borrow_mut();
                schedule.real_count += 1;
                schedule.index = (schedule.index + 1) % (schedule.interval_count as u16);
            }
            Regime::Stopped => unreachable!("stopped regime checked above"),
        }

        Step::Yield
    }
}

/// Launches `req_count` instances of a coroutine per second, with drift
/// repayment when the wall clock overtakes the emitted count.
///
/// The repeater is itself a waiter: each tick of its leaf body spawns a
/// batch of factory instances and re-arms. Dropping the `Repeater` releases
/// the underlying waiter, armed or not.
///
/// ```no_run
/// # use corolo::{Coroutine, Repeater, Step, Waiter};
/// # struct Ping;
/// # impl Coroutine for Ping {
/// #     fn start(&mut self, w: Waiter) -> Step { w.release(); Step::Complete }
/// # }
/// corolo::init().unwrap();
/// let repeater = Repeater::new(|| Box::new(Ping));
/// repeater.set_repeat_per_second(50.0);
/// repeater.start();
/// corolo::run().unwrap();
/// ```
pub struct Repeater {
    schedule: Rc<RefCell<Schedule>>,
    waiter: Waiter,
    _handle: WaiterHandle,
}

impl Repeater {
    pub fn new<F>(factory: F) -> Self
    where
        F: FnMut() -> Box<dyn Coroutine> + 'static,
    {
        let schedule = Rc::new(RefCell::new(Schedule::new()));
        let waiter = Waiter::spawn(RepeaterBody {
            schedule: Rc::clone(&schedule),
            factory: Box::new(factory),
        });
        Self {
            schedule,
            waiter,
            _handle: WaiterHandle::new(waiter),
        }
    }

    /// One-time regime selection. Rates above 100/s tick every 10 ms with
    /// per-tick bursts; rates in (1, 100] emit one instance per sub-second
    /// period; rates in (1e-3, 1] one instance per multi-second period.
    /// Anything else stops the schedule.
    pub fn set_repeat_per_second(&self, count: f64) {
        self.schedule.borrow_mut().set_rate(count);
    }

    /// Enter the schedule body; the first batch is emitted immediately.
    /// Call after `set_repeat_per_second`.
    pub fn start(&self) {
        self.waiter.start();
    }

    /// Disarm and zero the schedule. The body observes the stopped regime
    /// and exits on its next entry.
    pub fn stop(&self) {
        self.waiter.clear_timeout();
        self.schedule.borrow_mut().stop();
    }

    pub fn waiter(&self) -> Waiter {
        self.waiter
    }
}
