use crate::context::heap::TimerLink;
use crate::coroutine::Coroutine;
use bitflags::bitflags;
use nix::sys::epoll::EpollFlags;
use std::fmt;
use std::os::fd::RawFd;

bitflags! {
    /// Finish cause, packed into the top bits of [`WaiterSlot::finish`].
    /// Readiness sets neither bit; it is visible through `poll_result`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct FinishFlags: u32 {
        const TIMEOUT = 1 << 31;
        const STOPPED = 1 << 30;
    }
}

/// Elapsed milliseconds occupy the low 30 bits of the finish word.
pub(crate) const ELAPSED_MASK: u32 = (1 << 30) - 1;

/// Arena record backing one waiter. The heap and the poller borrow slots
/// while armed; they never touch `ref_count`.
pub(crate) struct WaiterSlot {
    pub(crate) generation: u32,

    /// Wall time at which the current timeout was armed.
    pub(crate) start_ms: u64,

    /// Elapsed ms at finish (low 30 bits) fused with the finish cause.
    pub(crate) finish: u32,

    /// Heap bucket cursor. Present iff the waiter is armed in the heap.
    pub(crate) timer: TimerLink,

    pub(crate) fd: Option<RawFd>,

    /// Events the caller asked to observe. Nonempty iff registered with the
    /// multiplexer.
    pub(crate) poll_request: EpollFlags,

    /// Events the driver actually reported.
    pub(crate) poll_result: EpollFlags,

    /// Strong references. Zero means caller-owned (unmanaged).
    pub(crate) ref_count: u32,

    /// The suspended body. Taken while the body runs, put back on yield.
    pub(crate) coroutine: Option<Box<dyn Coroutine>>,
}

impl WaiterSlot {
    pub(crate) fn new(generation: u32, coroutine: Box<dyn Coroutine>) -> Self {
        Self {
            generation,
            start_ms: 0,
            finish: 0,
            timer: TimerLink::default(),
            fd: None,
            poll_request: EpollFlags::empty(),
            poll_result: EpollFlags::empty(),
            ref_count: 0,
            coroutine: Some(coroutine),
        }
    }

    /// Pack the finish word: elapsed since arming, clamped to 30 bits,
    /// fused with the cause bits.
    pub(crate) fn mark_finished(&mut self, now_ms: u64, flags: FinishFlags) {
        let elapsed = now_ms
            .saturating_sub(self.start_ms)
            .min(u64::from(ELAPSED_MASK)) as u32;
        self.finish = elapsed | flags.bits();
    }

    #[inline(always)]
    pub(crate) fn time_cost(&self) -> u32 {
        self.finish & ELAPSED_MASK
    }

    #[inline(always)]
    pub(crate) fn finish_flags(&self) -> FinishFlags {
        FinishFlags::from_bits_truncate(self.finish)
    }
}

impl fmt::Debug for WaiterSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaiterSlot")
            .field("generation", &self.generation)
            .field("start_ms", &self.start_ms)
            .field("finish", &self.finish)
            .field("fd", &self.fd)
            .field("poll_request", &self.poll_request)
            .field("poll_result", &self.poll_result)
            .field("ref_count", &self.ref_count)
            .field("suspended", &self.coroutine.is_some())
            .finish()
    }
}
