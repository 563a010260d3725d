use anyhow::{Context as _, Result};
use nix::sys::time::TimeValLike;
use nix::time::{ClockId, clock_gettime};

/// Cached monotonic millisecond timestamp.
///
/// The cached value is refreshed after every multiplexer wake and on
/// explicit request; between refreshes it is stale by design so that tight
/// resumption chains pay no syscall per query.
#[derive(Debug)]
pub(crate) struct Clock {
    now_ms: u64,
}

impl Clock {
    pub(crate) fn try_new() -> Result<Self> {
        let now_ms = monotonic_ms().context("monotonic clock unavailable")?;
        Ok(Self { now_ms })
    }

    /// Cached timestamp; no syscall.
    #[inline(always)]
    pub(crate) fn now(&self) -> u64 {
        self.now_ms
    }

    pub(crate) fn refresh(&mut self) -> u64 {
        // The first read succeeded at init; CLOCK_MONOTONIC cannot fail
        // afterwards.
        self.now_ms = monotonic_ms().expect("CLOCK_MONOTONIC read failed");
        self.now_ms
    }
}

fn monotonic_ms() -> nix::Result<u64> {
    clock_gettime(ClockId::CLOCK_MONOTONIC).map(|ts| ts.num_milliseconds() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_now_is_cached_until_refresh() -> Result<()> {
        let clock = Clock::try_new()?;
        let first = clock.now();

        thread::sleep(Duration::from_millis(15));
        assert_eq!(clock.now(), first);

        Ok(())
    }

    #[test]
    fn test_refresh_moves_forward() -> Result<()> {
        let mut clock = Clock::try_new()?;
        let first = clock.now();

        thread::sleep(Duration::from_millis(15));
        let second = clock.refresh();

        assert!(second >= first + 10);
        assert_eq!(clock.now(), second);

        Ok(())
    }
}
