use crate::context::arena::WaiterId;
use crate::runtime::config::SPILL_TO_HEAP_THRESHOLD;
use crate::waiter::WaiterError;
use anyhow::{Context as _, Result};
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

/// Readiness reported by one multiplexer wake, copied out of the kernel
/// buffer before any waiter is resumed.
pub(crate) type ReadyBatch = SmallVec<[(WaiterId, EpollFlags); SPILL_TO_HEAP_THRESHOLD]>;

/// epoll wrapper owning the per-thread multiplexer fd.
///
/// Registrations map one fd to one waiter; the map powers the teardown
/// sweep and the registered-fd count. The epoll user data carries the
/// waiter id so a wake identifies its waiter without a lookup.
pub(crate) struct Poller {
    epoll: Epoll,
    registered: HashMap<RawFd, WaiterId>,
    /// Reusable kernel event buffer; capacity bounds one wake's batch.
    events: Vec<EpollEvent>,
    /// Upper bound for one blocking slice. The loop re-evaluates its sleep
    /// bound after every wake, so capping a slice only costs a spurious
    /// wake on very distant deadlines.
    max_slice_ms: u16,
}

impl Poller {
    pub(crate) fn try_new(events_capacity: usize, max_slice_ms: u16) -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).context("epoll_create1 failed")?;

        Ok(Self {
            epoll,
            registered: HashMap::new(),
            events: vec![EpollEvent::empty(); events_capacity],
            max_slice_ms,
        })
    }

    pub(crate) fn register(
        &mut self,
        fd: RawFd,
        events: EpollFlags,
        id: WaiterId,
    ) -> Result<(), WaiterError> {
        let event = EpollEvent::new(events, id.as_user_data());
        self.epoll
            .add(unsafe { BorrowedFd::borrow_raw(fd) }, event)
            .map_err(|source| WaiterError::Registration { fd, source })?;

        self.registered.insert(fd, id);
        Ok(())
    }

    pub(crate) fn modify(
        &mut self,
        fd: RawFd,
        events: EpollFlags,
        id: WaiterId,
    ) -> Result<(), WaiterError> {
        let mut event = EpollEvent::new(events, id.as_user_data());
        self.epoll
            .modify(unsafe { BorrowedFd::borrow_raw(fd) }, &mut event)
            .map_err(|source| WaiterError::Registration { fd, source })?;

        self.registered.insert(fd, id);
        Ok(())
    }

    /// Drop the registration without closing the fd. Idempotent.
    pub(crate) fn unregister(&mut self, fd: RawFd) -> bool {
        if self.registered.remove(&fd).is_none() {
            return false;
        }
        if let Err(err) = self.epoll.delete(unsafe { BorrowedFd::borrow_raw(fd) }) {
            // The kernel already dropped the entry when the fd was closed
            // elsewhere.
            tracing::trace!(fd, %err, "EPOLL_CTL_DEL failed");
        }
        true
    }

    /// Block up to `max_sleep_ms` (unbounded when `None`, modulo the slice
    /// cap) and copy the ready set out. EINTR counts as an empty wake.
    pub(crate) fn wait(&mut self, max_sleep_ms: Option<u64>) -> Result<ReadyBatch> {
        let timeout = match max_sleep_ms {
            None => EpollTimeout::NONE,
            Some(ms) => EpollTimeout::from(ms.min(u64::from(self.max_slice_ms)) as u16),
        };

        let n = match self.epoll.wait(&mut self.events, timeout) {
            Ok(n) => n,
            Err(Errno::EINTR) => 0,
            Err(err) => return Err(err).context("epoll_wait failed"),
        };

        Ok(self.events[..n]
            .iter()
            .map(|ev| (WaiterId::from_user_data(ev.data()), ev.events()))
            .collect())
    }

    pub(crate) fn registered_count(&self) -> u32 {
        self.registered.len() as u32
    }

    pub(crate) fn first_registered(&self) -> Option<(RawFd, WaiterId)> {
        self.registered.iter().next().map(|(&fd, &id)| (fd, id))
    }

    pub(crate) fn as_raw_fd(&self) -> RawFd {
        self.epoll.0.as_raw_fd()
    }
}
