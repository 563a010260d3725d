use crate::coroutine::{Continuation, Coroutine, Step};
use crate::waiter::Waiter;

/// A leaf that only waits out a deadline, then releases itself.
///
/// This is how an ordinary coroutine sleeps: it spawns a `Sleeper` carrying
/// its own resumption and suspends; the driver runs the continuation once
/// the deadline fires (or the heap is torn down).
pub struct Sleeper {
    timeout_ms: u64,
    and_then: Option<Continuation>,
}

impl Sleeper {
    pub fn new(timeout_ms: u64, and_then: Option<Continuation>) -> Self {
        Self {
            timeout_ms,
            and_then,
        }
    }
}

impl Coroutine for Sleeper {
    fn start(&mut self, waiter: Waiter) -> Step {
        waiter.set_timeout(self.timeout_ms);
        Step::Yield
    }

    fn resume(&mut self, _waiter: Waiter) -> Step {
        // Only the deadline or a stop can wake a sleeper.
        Step::Complete
    }

    fn on_finish(&mut self, waiter: Waiter) -> Option<Continuation> {
        waiter.release();
        self.and_then.take()
    }
}

/// Suspend for `timeout_ms`, then run `and_then`. The returned waiter is
/// self-releasing; keep a [`WaiterHandle`](crate::WaiterHandle) only if the
/// sleep must be observed or cancelled from outside.
pub fn sleep(timeout_ms: u64, and_then: impl FnOnce() + 'static) -> Waiter {
    let waiter = Waiter::spawn(Sleeper::new(timeout_ms, Some(Box::new(and_then))));
    waiter.start();
    waiter
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::time::Instant;

    #[test]
    fn test_sleep_runs_the_continuation_after_the_deadline() -> Result<()> {
        crate::init()?;

        let woke = Rc::new(Cell::new(false));
        let flag = Rc::clone(&woke);

        let started = Instant::now();
        sleep(30, move || flag.set(true));
        assert!(!woke.get(), "continuation must not run before the loop");

        crate::run()?;

        assert!(woke.get());
        let elapsed = started.elapsed().as_millis();
        assert!((30..=100).contains(&elapsed), "elapsed {elapsed}");

        // The sleeper released itself.
        crate::context::with_core(|core| assert_eq!(core.waiters.borrow().len(), 0));
        Ok(())
    }

    #[test]
    fn test_zero_sleep_fires_on_the_next_pass() -> Result<()> {
        crate::init()?;

        let woke = Rc::new(Cell::new(false));
        let flag = Rc::clone(&woke);
        sleep(0, move || flag.set(true));

        crate::run_once(Some(0))?;
        assert!(woke.get());
        Ok(())
    }

    #[test]
    fn test_stopped_sleeper_still_runs_its_continuation() -> Result<()> {
        crate::init()?;

        let woke = Rc::new(Cell::new(false));
        let flag = Rc::clone(&woke);
        sleep(10_000, move || flag.set(true));

        crate::destroy();

        // The stop resumed and finished the sleeper; its continuation ran.
        assert!(woke.get());
        Ok(())
    }
}
