use crate::context::{self, WaiterId};
use crate::coroutine::Step;
use crate::runtime::config::Builder;
use crate::waiter::{FinishFlags, Waiter};
use anyhow::Result;
use nix::sys::epoll::EpollFlags;
use std::os::fd::RawFd;

/// Prepares this thread's timer heap and multiplexer with defaults.
pub fn init() -> Result<()> {
    Builder::new().try_init()
}

/// Cached monotonic milliseconds; no syscall.
pub fn now_ms() -> u64 {
    context::with_core(|core| core.clock.borrow().now())
}

/// Re-reads the monotonic clock and returns the fresh timestamp.
pub fn refresh_clock() -> u64 {
    context::with_core(|core| core.clock.borrow_mut().refresh())
}

/// The thread's multiplexer descriptor, for embedding in a host loop.
pub fn poll_fd() -> RawFd {
    context::with_core(|core| core.poller.borrow().as_raw_fd())
}

/// How many fds this thread currently watches.
pub fn waited_fd_count() -> u32 {
    context::with_core(|core| core.poller.borrow().registered_count())
}

/// One driver turn: block up to `max_sleep_ms` (unbounded when `None`),
/// refresh the clock, dispatch readiness, then drain expired deadlines.
/// Returns how many waiters finished.
///
/// Readiness runs before timeouts: an fd becoming ready usually makes the
/// same waiter's pending deadline moot. Expired deadlines are popped one at
/// a time so the heap is revalidated after every excursion into user code.
pub fn run_once(max_sleep_ms: Option<u64>) -> Result<usize> {
    let ready = context::with_core(|core| core.poller.borrow_mut().wait(max_sleep_ms))?;
    context::with_core(|core| core.clock.borrow_mut().refresh());

    let mut finished = 0;
    for (id, events) in ready {
        finished += 1;
        finish(id, FinishFlags::empty(), Some(events));
    }

    loop {
        let expired = context::with_core(|core| {
            let now = core.clock.borrow().now();
            let mut arena = core.waiters.borrow_mut();
            core.heap.borrow_mut().pop_expired(&mut arena, now)
        });
        let Some(id) = expired else {
            break;
        };
        finished += 1;
        finish(id, FinishFlags::TIMEOUT, None);
    }

    Ok(finished)
}

/// Runs turns until no deadline is armed and no fd is watched. The sleep
/// bound is recomputed every pass from the heap root.
pub fn run() -> Result<()> {
    tracing::debug!("timer loop entered");
    loop {
        let sleep = context::with_core(|core| {
            let now = core.clock.borrow().now();
            match core.heap.borrow().peek_deadline() {
                Some(deadline) => Some(Some(deadline.saturating_sub(now))),
                None if core.poller.borrow().registered_count() > 0 => Some(None),
                None => None,
            }
        });
        let Some(max_sleep_ms) = sleep else {
            break;
        };
        run_once(max_sleep_ms)?;
    }
    tracing::debug!("timer loop drained");
    Ok(())
}

/// Tears the thread context down: every armed waiter finishes with the
/// stop flag, one by one; every fd registration is dropped without closing
/// the fd; the context itself is then discarded so a later `init` on this
/// thread starts fresh.
///
/// Must not be called from inside a resumed coroutine body. A no-op when
/// the thread was never initialized.
pub fn destroy() {
    if !context::is_initialized() {
        return;
    }
    context::with_core(|core| core.stopping.set(true));

    // Timer waiters first, earliest deadline first.
    loop {
        let armed = context::with_core(|core| {
            let mut arena = core.waiters.borrow_mut();
            core.heap.borrow_mut().pop_front(&mut arena)
        });
        let Some(id) = armed else {
            break;
        };
        finish(id, FinishFlags::STOPPED, None);
    }

    // Then whatever is still registered with the multiplexer.
    loop {
        let next = context::with_core(|core| core.poller.borrow().first_registered());
        let Some((fd, id)) = next else {
            break;
        };
        let live = context::with_core(|core| core.waiters.borrow().get(id).is_some());
        if live {
            finish(id, FinishFlags::STOPPED, None);
        } else {
            context::with_core(|core| core.poller.borrow_mut().unregister(fd));
        }
    }

    drop(context::take_context());
    tracing::debug!("timer context destroyed");
}

/// Finish one waiter: unlink it from the heap and the multiplexer, stamp
/// the finish word, then re-enter its body. The unlinking happens before
/// any user code runs so a panicking body cannot corrupt the heap.
fn finish(id: WaiterId, flags: FinishFlags, ready: Option<EpollFlags>) {
    let coroutine = context::with_core(|core| {
        let mut arena = core.waiters.borrow_mut();
        if arena.get(id).is_none() {
            // Released while queued for dispatch.
            return None;
        }
        core.heap.borrow_mut().remove(&mut arena, id);
        let now = core.clock.borrow().now();

        let registered_fd = {
            let slot = arena.expect_mut(id);
            if let Some(events) = ready {
                slot.poll_result = events;
            }
            slot.mark_finished(now, flags);
            let fd = if slot.poll_request.is_empty() {
                None
            } else {
                slot.fd
            };
            slot.poll_request = EpollFlags::empty();
            fd
        };
        if let Some(fd) = registered_fd {
            core.poller.borrow_mut().unregister(fd);
        }

        arena.expect_mut(id).coroutine.take()
    });
    let Some(mut coroutine) = coroutine else {
        return;
    };

    let waiter = Waiter::from_id(id);
    tracing::trace!(?flags, "resuming waiter");
    match coroutine.resume(waiter) {
        Step::Yield => waiter.park_body(coroutine),
        Step::Complete => waiter.complete_body(coroutine),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FinishLog, Probe, pipe_pair};
    use crate::{Waiter, sleep};
    use anyhow::Result;
    use std::os::fd::AsRawFd;
    use std::time::Instant;

    #[test]
    fn test_single_sleep_finishes_with_timeout() -> Result<()> {
        init()?;
        let log = FinishLog::default();

        let waiter = Waiter::spawn(Probe::new(0, &log).release_on_finish());
        waiter.start();
        waiter.set_timeout(50);

        let started = Instant::now();
        run()?;
        let elapsed = started.elapsed().as_millis();

        let records = log.borrow();
        assert_eq!(records.len(), 1);
        assert!(records[0].timeout);
        assert!(!records[0].stopped);
        assert!((50..=80).contains(&records[0].cost), "cost {}", records[0].cost);
        assert!((50..=150).contains(&elapsed), "elapsed {elapsed}");

        Ok(())
    }

    #[test]
    fn test_same_deadline_waiters_share_a_bucket_and_run_fifo() -> Result<()> {
        init()?;
        let log = FinishLog::default();

        let waiters: Vec<_> = (0..1000)
            .map(|i| {
                let w = Waiter::spawn(Probe::new(i, &log).release_on_finish());
                w.start();
                w.set_timeout(20);
                w
            })
            .collect();
        let _ = waiters;

        context::with_core(|core| assert_eq!(core.heap.borrow().bucket_count(), 1));

        run()?;

        let records = log.borrow();
        assert_eq!(records.len(), 1000);
        assert!(records.iter().all(|r| r.timeout));

        // FIFO within the bucket: finish order equals arming order.
        let labels: Vec<_> = records.iter().map(|r| r.label).collect();
        assert_eq!(labels, (0..1000).collect::<Vec<_>>());

        // Resumed within a handful of milliseconds of each other.
        let costs: Vec<_> = records.iter().map(|r| r.cost).collect();
        let spread = costs.iter().max().unwrap() - costs.iter().min().unwrap();
        assert!(spread <= 5, "spread {spread}");

        Ok(())
    }

    #[test]
    fn test_deadlines_resume_in_order() -> Result<()> {
        init()?;
        let log = FinishLog::default();

        // Armed out of order on purpose.
        for (label, timeout) in [(2u32, 30u64), (0, 10), (1, 20)] {
            let w = Waiter::spawn(Probe::new(label, &log).release_on_finish());
            w.start();
            w.set_timeout(timeout);
        }

        run()?;

        let labels: Vec<_> = log.borrow().iter().map(|r| r.label).collect();
        assert_eq!(labels, vec![0, 1, 2]);
        Ok(())
    }

    #[test]
    fn test_destroy_stops_every_armed_waiter() -> Result<()> {
        init()?;
        let log = FinishLog::default();

        let waiters: Vec<_> = [100u64, 200, 300]
            .iter()
            .enumerate()
            .map(|(i, &timeout)| {
                let w = Waiter::spawn(Probe::new(i as u32, &log).release_on_finish());
                w.start();
                w.set_timeout(timeout);
                w
            })
            .collect();
        let _ = waiters;

        destroy();

        let records = log.borrow();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.stopped));
        assert!(records.iter().all(|r| !r.timeout));

        // Earliest deadline stopped first.
        let labels: Vec<_> = records.iter().map(|r| r.label).collect();
        assert_eq!(labels, vec![0, 1, 2]);
        Ok(())
    }

    #[test]
    fn test_destroy_stops_fd_only_waiters() -> Result<()> {
        init()?;
        let log = FinishLog::default();
        let (read_end, _write_end) = pipe_pair();

        let waiter = Waiter::spawn(Probe::new(0, &log).release_on_finish());
        waiter.start();
        waiter.set_fd(read_end.as_raw_fd());
        waiter.set_poll_request(EpollFlags::EPOLLIN)?;

        destroy();

        let records = log.borrow();
        assert_eq!(records.len(), 1);
        assert!(records[0].stopped);
        assert!(records[0].ready.is_empty());
        Ok(())
    }

    #[test]
    fn test_readiness_preempts_timeout() -> Result<()> {
        init()?;
        let log = FinishLog::default();
        let (read_end, write_end) = pipe_pair();

        let waiter = Waiter::spawn(Probe::new(0, &log).release_on_finish());
        waiter.start();
        waiter.set_fd(read_end.as_raw_fd());
        waiter.set_poll_request(EpollFlags::EPOLLIN)?;
        waiter.set_timeout(1000);

        // A second leaf writes into the pipe at t = 10 ms.
        sleep(10, move || {
            nix::unistd::write(&write_end, b"x").expect("pipe write");
        });

        let started = Instant::now();
        run()?;
        let elapsed = started.elapsed().as_millis();

        let records = log.borrow();
        assert_eq!(records.len(), 1);
        assert!(records[0].ready.contains(EpollFlags::EPOLLIN));
        assert!(!records[0].timeout);
        assert!(!records[0].stopped);
        assert!((8..=60).contains(&records[0].cost), "cost {}", records[0].cost);
        assert!(elapsed < 500, "readiness should cut the 1s timeout short");

        Ok(())
    }

    #[test]
    fn test_run_returns_once_everything_is_drained() -> Result<()> {
        init()?;

        // Nothing armed: the loop exits immediately.
        run()?;
        assert_eq!(run_once(Some(0))?, 0);
        Ok(())
    }

    #[test]
    fn test_rearm_from_inside_a_resume_keeps_the_loop_alive() -> Result<()> {
        use crate::coroutine::{Coroutine, Step};
        use std::cell::Cell;
        use std::rc::Rc;

        init()?;

        struct Pulse {
            remaining: Rc<Cell<u32>>,
        }

        impl Coroutine for Pulse {
            fn start(&mut self, waiter: Waiter) -> Step {
                waiter.set_timeout(5);
                Step::Yield
            }

            fn resume(&mut self, waiter: Waiter) -> Step {
                let left = self.remaining.get();
                if left == 0 {
                    return Step::Complete;
                }
                self.remaining.set(left - 1);
                waiter.set_timeout(5);
                Step::Yield
            }

            fn on_finish(&mut self, waiter: Waiter) -> Option<crate::Continuation> {
                waiter.release();
                None
            }
        }

        let remaining = Rc::new(Cell::new(4));
        let waiter = Waiter::spawn(Pulse {
            remaining: Rc::clone(&remaining),
        });
        waiter.start();

        run()?;
        assert_eq!(remaining.get(), 0);
        Ok(())
    }
}
