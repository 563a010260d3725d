use crate::coroutine::{Continuation, Coroutine, Step};
use crate::waiter::Waiter;
use nix::sys::epoll::EpollFlags;
use std::cell::RefCell;
use std::os::fd::OwnedFd;
use std::rc::Rc;

/// A body that suspends forever; useful wherever a slot is needed but the
/// coroutine itself is irrelevant.
pub(crate) struct Noop;

impl Coroutine for Noop {
    fn start(&mut self, _waiter: Waiter) -> Step {
        Step::Yield
    }
}

/// What a probe observed when its waiter finished.
#[derive(Debug, Clone)]
pub(crate) struct FinishRecord {
    pub(crate) label: u32,
    pub(crate) timeout: bool,
    pub(crate) stopped: bool,
    pub(crate) ready: EpollFlags,
    pub(crate) cost: u32,
}

pub(crate) type FinishLog = Rc<RefCell<Vec<FinishRecord>>>;

/// A leaf that records how it finished, in finish order across all probes
/// sharing the log. Arm it from the test after `start`.
pub(crate) struct Probe {
    label: u32,
    log: FinishLog,
    release_on_finish: bool,
}

impl Probe {
    pub(crate) fn new(label: u32, log: &FinishLog) -> Self {
        Self {
            label,
            log: Rc::clone(log),
            release_on_finish: false,
        }
    }

    pub(crate) fn release_on_finish(mut self) -> Self {
        self.release_on_finish = true;
        self
    }
}

impl Coroutine for Probe {
    fn start(&mut self, _waiter: Waiter) -> Step {
        Step::Yield
    }

    fn resume(&mut self, waiter: Waiter) -> Step {
        self.log.borrow_mut().push(FinishRecord {
            label: self.label,
            timeout: waiter.is_timeout(),
            stopped: waiter.is_stopped(),
            ready: waiter.poll_result(),
            cost: waiter.time_cost(),
        });
        Step::Complete
    }

    fn on_finish(&mut self, waiter: Waiter) -> Option<Continuation> {
        if self.release_on_finish {
            waiter.release();
        }
        None
    }
}

/// Fresh pipe; both ends close on drop.
pub(crate) fn pipe_pair() -> (OwnedFd, OwnedFd) {
    nix::unistd::pipe().expect("pipe")
}
