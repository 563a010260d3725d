use crate::context;
use anyhow::{Result, anyhow};
use std::io;

// Used wherever we rely on SmallVec to store entries on stack first.
// Prevents most heap allocations for ordinary batch sizes.
pub(crate) const SPILL_TO_HEAP_THRESHOLD: usize = 16;

/// Default size of the kernel event buffer handed to one multiplexer wake.
const EVENTS_CAPACITY: usize = 256;

/// Default preallocation for the waiter arena. The arena grows past this.
const WAITER_CAPACITY: usize = 1024;

/// Default cap for one blocking multiplexer slice. Distant deadlines cost
/// one spurious wake per slice; the loop recomputes its bound every pass.
const MAX_POLL_SLICE_MS: u16 = 60_000;

/// Configures the per-thread timer-and-poll driver.
///
/// `init()` applies the defaults; use the builder when a thread needs a
/// different event batch size or arena preallocation.
#[derive(Debug, Clone)]
pub struct Builder {
    events_capacity: usize,
    waiter_capacity: usize,
    max_poll_slice_ms: u16,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            events_capacity: EVENTS_CAPACITY,
            waiter_capacity: WAITER_CAPACITY,
            max_poll_slice_ms: MAX_POLL_SLICE_MS,
        }
    }

    /// Sets how many kernel events one multiplexer wake can deliver.
    pub fn events_capacity(mut self, val: usize) -> Self {
        self.events_capacity = val;
        self
    }

    /// Sets the waiter arena preallocation for this thread.
    pub fn waiter_capacity(mut self, val: usize) -> Self {
        self.waiter_capacity = val;
        self
    }

    /// Sets the cap for a single blocking multiplexer slice.
    pub fn max_poll_slice_ms(mut self, val: u16) -> Self {
        self.max_poll_slice_ms = val;
        self
    }

    /// Validates the configuration and installs the thread context.
    pub fn try_init(self) -> Result<()> {
        let cfg: Config = self.try_into()?;
        context::init_context(&cfg)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub(crate) events_capacity: usize,
    pub(crate) waiter_capacity: usize,
    pub(crate) max_poll_slice_ms: u16,
}

impl Config {
    fn validate(&self) -> Result<()> {
        if self.events_capacity == 0 {
            return Err(anyhow!("events_capacity must be greater than 0"));
        }
        if self.max_poll_slice_ms == 0 {
            return Err(anyhow!("max_poll_slice_ms must be greater than 0"));
        }

        // Every waiter may watch its own fd in the worst case.
        check_fd_ulimit(self.waiter_capacity)?;

        Ok(())
    }
}

impl TryFrom<Builder> for Config {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let cfg = Config {
            events_capacity: builder.events_capacity,
            waiter_capacity: builder.waiter_capacity,
            max_poll_slice_ms: builder.max_poll_slice_ms,
        };

        cfg.validate()?;

        Ok(cfg)
    }
}

/// Checks the desired number of file descriptors against the soft
/// RLIMIT_NOFILE so a misconfigured thread fails at init instead of midway
/// through registration.
fn check_fd_ulimit(desired_fds: usize) -> io::Result<()> {
    let mut rlimit = std::mem::MaybeUninit::<libc::rlimit>::uninit();
    let ret = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, rlimit.as_mut_ptr()) };

    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    let rlimit = unsafe { rlimit.assume_init() };
    let current_limit = rlimit.rlim_cur as usize;

    if desired_fds > current_limit {
        let error_message = format!(
            "Configured waiter capacity ({}) exceeds the current ulimit ({}) for open files. \
             Lower the capacity or raise the limit, e.g. 'ulimit -n 65536'.",
            desired_fds, current_limit
        );
        Err(io::Error::other(error_message))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    // Builders are handed across threads when spinning up workers.
    assert_impl_all!(Builder: Send, Clone);

    #[test]
    fn test_zero_events_capacity_is_rejected() {
        let err = Builder::new().events_capacity(0).try_init().unwrap_err();
        assert!(err.to_string().contains("events_capacity"));
    }

    #[test]
    fn test_zero_poll_slice_is_rejected() {
        let err = Builder::new().max_poll_slice_ms(0).try_init().unwrap_err();
        assert!(err.to_string().contains("max_poll_slice_ms"));
    }

    #[test]
    fn test_absurd_waiter_capacity_trips_the_ulimit_check() {
        let err = Builder::new()
            .waiter_capacity(usize::MAX)
            .try_init()
            .unwrap_err();
        assert!(err.to_string().contains("ulimit"));
    }

    #[test]
    fn test_defaults_install_a_context() {
        Builder::new().try_init().expect("default init");
        assert_eq!(crate::waited_fd_count(), 0);
    }
}
