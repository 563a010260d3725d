pub mod coroutine;
pub use coroutine::{Continuation, Coroutine, Step};

mod context;

pub mod runtime;
pub use runtime::{
    Builder, Repeater, Sleeper, destroy, init, now_ms, poll_fd, refresh_clock, run, run_once,
    sleep, waited_fd_count,
};

pub mod waiter;
pub use waiter::{Waiter, WaiterError, WaiterHandle};

// Readiness interest and results carry the multiplexer's native event bits.
pub use nix::sys::epoll::EpollFlags;

#[cfg(test)]
pub(crate) mod test_utils;
