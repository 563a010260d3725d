use crate::context::{self, WaiterId};
use crate::coroutine::{Coroutine, Step};
use nix::sys::epoll::EpollFlags;
use std::os::fd::RawFd;

// Exports
pub mod errors;
pub use errors::WaiterError;

pub mod handle;
pub use handle::WaiterHandle;

pub(crate) mod slot;
pub(crate) use slot::FinishFlags;

/// A suspended leaf coroutine awaiting a deadline and/or fd readiness.
///
/// `Waiter` is a copyable id into the thread's waiter arena; the record it
/// names lives until [`release`](Waiter::release) destroys it. The heap and
/// the poller borrow the record while armed without touching its reference
/// count, so callers that suspend across the loop must keep a
/// [`WaiterHandle`] (or accept sole ownership at count zero) alive until
/// the waiter finishes.
///
/// Query and arming operations on a released waiter are program defects
/// and panic; driver-internal races against release are absorbed silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Waiter {
    id: WaiterId,
}

impl Waiter {
    /// Insert a detached waiter around `coroutine`. No deadline, no fd; arm
    /// it with [`set_timeout`](Waiter::set_timeout) and/or
    /// [`set_poll_request`](Waiter::set_poll_request).
    pub fn spawn(coroutine: impl Coroutine + 'static) -> Waiter {
        Self::spawn_boxed(Box::new(coroutine))
    }

    pub fn spawn_boxed(coroutine: Box<dyn Coroutine>) -> Waiter {
        let id = context::with_waiters_mut(|arena| arena.insert(coroutine));
        Waiter { id }
    }

    pub(crate) fn from_id(id: WaiterId) -> Waiter {
        Waiter { id }
    }

    /// Enter the body for the first time; it runs to its first suspension.
    /// Panics if the body already ran.
    #[track_caller]
    pub fn start(self) {
        let mut coroutine = context::with_waiters_mut(|arena| {
            arena
                .expect_mut(self.id)
                .coroutine
                .take()
                .expect("waiter body already entered")
        });

        match coroutine.start(self) {
            Step::Yield => self.park_body(coroutine),
            Step::Complete => self.complete_body(coroutine),
        }
    }

    // --- Timeout arming ---

    /// Arm (or re-arm) the deadline at `now + timeout_ms`. Zero is not
    /// special-cased: the deadline fires on the next loop pass. Ignored
    /// during teardown.
    pub fn set_timeout(self, timeout_ms: u64) {
        context::with_core(|core| {
            if core.stopping.get() {
                return;
            }
            let now = core.clock.borrow().now();
            let mut arena = core.waiters.borrow_mut();
            let mut heap = core.heap.borrow_mut();

            heap.remove(&mut arena, self.id);
            {
                let slot = arena.expect_mut(self.id);
                slot.start_ms = now;
                slot.finish = 0;
            }
            heap.add(&mut arena, self.id, now + timeout_ms);
        });
    }

    /// Drop the deadline if armed. Idempotent, and safe after teardown.
    pub fn clear_timeout(self) {
        context::try_with_core(|core| {
            let mut arena = core.waiters.borrow_mut();
            core.heap.borrow_mut().remove(&mut arena, self.id);
        });
    }

    // --- Fd watching ---

    /// Assign the descriptor to watch. The waiter borrows the fd; see
    /// [`close_fd`](Waiter::close_fd) for the owning variant.
    pub fn set_fd(self, fd: RawFd) {
        context::with_waiters_mut(|arena| arena.expect_mut(self.id).fd = Some(fd));
    }

    pub fn fd(self) -> Option<RawFd> {
        context::with_waiters(|arena| arena.expect(self.id).fd)
    }

    /// Register (or re-register) multiplexer interest for the watched fd.
    /// Empty interest unregisters. On failure the waiter stays unarmed for
    /// the fd and the error is surfaced.
    pub fn set_poll_request(self, events: EpollFlags) -> Result<(), WaiterError> {
        if events.is_empty() {
            self.remove_poll_request();
            return Ok(());
        }

        context::with_core(|core| {
            if core.stopping.get() {
                return Ok(());
            }
            let now = core.clock.borrow().now();
            let mut arena = core.waiters.borrow_mut();
            let mut poller = core.poller.borrow_mut();

            let slot = arena.expect_mut(self.id);
            let fd = slot.fd.ok_or(WaiterError::NoFd)?;

            let result = if slot.poll_request.is_empty() {
                poller.register(fd, events, self.id)
            } else {
                poller.modify(fd, events, self.id)
            };

            match result {
                Ok(()) => {
                    if !slot.timer.is_linked() {
                        slot.start_ms = now;
                    }
                    slot.finish = 0;
                    slot.poll_request = events;
                    Ok(())
                }
                Err(err) => {
                    tracing::warn!(fd, ?events, %err, "multiplexer registration failed");
                    Err(err)
                }
            }
        })
    }

    /// Unregister the watched fd from the multiplexer without closing it.
    /// Idempotent, and safe after teardown.
    pub fn remove_poll_request(self) {
        context::try_with_core(|core| {
            let mut arena = core.waiters.borrow_mut();
            let Some(slot) = arena.get_mut(self.id) else {
                return;
            };
            if slot.poll_request.is_empty() {
                return;
            }
            slot.poll_request = EpollFlags::empty();
            if let Some(fd) = slot.fd {
                core.poller.borrow_mut().unregister(fd);
            }
        });
    }

    /// Unregister, close the watched fd, and clear the field.
    pub fn close_fd(self) {
        self.remove_poll_request();
        context::try_with_core(|core| {
            if let Some(slot) = core.waiters.borrow_mut().get_mut(self.id)
                && let Some(fd) = slot.fd.take()
            {
                unsafe { libc::close(fd) };
            }
        });
    }

    /// Unregister and clear the watched fd without closing it.
    pub fn remove_fd(self) {
        self.remove_poll_request();
        context::try_with_core(|core| {
            if let Some(slot) = core.waiters.borrow_mut().get_mut(self.id) {
                slot.fd = None;
            }
        });
    }

    pub fn poll_request(self) -> EpollFlags {
        context::with_waiters(|arena| arena.expect(self.id).poll_request)
    }

    pub fn poll_result(self) -> EpollFlags {
        context::with_waiters(|arena| arena.expect(self.id).poll_result)
    }

    pub fn clear_poll_result(self) {
        context::with_waiters_mut(|arena| {
            arena.expect_mut(self.id).poll_result = EpollFlags::empty();
        });
    }

    pub fn set_poll_result(self, events: EpollFlags) {
        context::with_waiters_mut(|arena| arena.expect_mut(self.id).poll_result = events);
    }

    // --- Finish-state queries ---

    /// Elapsed milliseconds at the last finish (30-bit clamped).
    pub fn time_cost(self) -> u32 {
        context::with_waiters(|arena| arena.expect(self.id).time_cost())
    }

    /// Elapsed milliseconds since arming, against the cached clock.
    pub fn time_past(self) -> u32 {
        context::with_core(|core| {
            let now = core.clock.borrow().now();
            let start = core.waiters.borrow().expect(self.id).start_ms;
            now.saturating_sub(start).min(u64::from(u32::MAX)) as u32
        })
    }

    /// Absolute deadline the waiter is armed for, if any.
    pub fn timeout_time(self) -> Option<u64> {
        context::with_core(|core| {
            let arena = core.waiters.borrow();
            core.heap.borrow().deadline_of(&arena, self.id)
        })
    }

    pub fn is_set_timeout(self) -> bool {
        context::with_waiters(|arena| arena.expect(self.id).timer.is_linked())
    }

    pub fn is_timeout(self) -> bool {
        self.finish_flags().contains(FinishFlags::TIMEOUT)
    }

    pub fn is_stopped(self) -> bool {
        self.finish_flags().contains(FinishFlags::STOPPED)
    }

    pub fn is_timeout_or_stopped(self) -> bool {
        !self.finish_flags().is_empty()
    }

    fn finish_flags(self) -> FinishFlags {
        context::with_waiters(|arena| arena.expect(self.id).finish_flags())
    }

    // --- Reference counting ---

    pub fn add_ref(self) {
        context::with_waiters_mut(|arena| arena.expect_mut(self.id).ref_count += 1);
    }

    /// Decrement without the destroy-at-zero rule; returns the new count.
    pub fn remove_ref(self) -> u32 {
        context::with_waiters_mut(|arena| {
            let slot = arena.expect_mut(self.id);
            debug_assert!(slot.ref_count > 0, "remove_ref on unmanaged waiter");
            slot.ref_count = slot.ref_count.saturating_sub(1);
            slot.ref_count
        })
    }

    pub fn ref_count(self) -> u32 {
        context::with_waiters(|arena| arena.expect(self.id).ref_count)
    }

    /// Drop one strong reference. At count zero the caller is the implicit
    /// sole owner, so counts zero and one both destroy the waiter: any
    /// armed deadline is removed and the fd is unregistered (not closed).
    /// Safe after teardown, and idempotent against already-released ids.
    pub fn release(self) -> u32 {
        let (count, removed) = context::try_with_core(|core| {
            let mut arena = core.waiters.borrow_mut();
            let refs = match arena.get(self.id) {
                Some(slot) => slot.ref_count,
                None => return (0, None),
            };
            if refs > 1 {
                let slot = arena.expect_mut(self.id);
                slot.ref_count -= 1;
                return (slot.ref_count, None);
            }

            core.heap.borrow_mut().remove(&mut arena, self.id);
            let registered_fd = {
                let slot = arena.expect_mut(self.id);
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

            (0, arena.remove(self.id))
        })
        .unwrap_or((0, None));

        // The slot (and its body) drop here, outside every context borrow.
        drop(removed);
        count
    }

    // --- Driver plumbing ---

    /// Put a yielded body back into its slot. If the slot vanished while
    /// the body ran, the body drops here, outside every context borrow.
    pub(crate) fn park_body(self, coroutine: Box<dyn Coroutine>) {
        let leftover = context::try_with_core(|core| {
            match core.waiters.borrow_mut().get_mut(self.id) {
                Some(slot) => {
                    slot.coroutine = Some(coroutine);
                    None
                }
                None => Some(coroutine),
            }
        });
        drop(leftover);
    }

    /// Disarm, run the finish hook, then hand control to the continuation.
    pub(crate) fn complete_body(self, mut coroutine: Box<dyn Coroutine>) {
        self.disarm();
        let continuation = coroutine.on_finish(self);
        drop(coroutine);
        if let Some(continuation) = continuation {
            continuation();
        }
    }

    fn disarm(self) {
        self.clear_timeout();
        self.remove_poll_request();
    }
}
