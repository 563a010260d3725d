use crate::waiter::Waiter;

/// Outcome of entering a coroutine body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The body suspended again and waits for its waiter to finish.
    Yield,
    /// The body ran to completion; `on_finish` runs next.
    Complete,
}

/// Deferred resumption of whoever awaits a finished leaf. Returned from
/// `on_finish` and invoked by the driver once the leaf is fully unlinked.
pub type Continuation = Box<dyn FnOnce()>;

/// A suspended leaf computation resumed by the timer-and-poll driver.
///
/// A leaf yields at most once per arming and is re-entered by exactly one of
/// a deadline, fd readiness, or forced stop. It must not wait on another
/// coroutine: the deadline contract would be undefined if the awaited body
/// outlived it. Nothing in this crate provides a way to nest awaits.
///
/// Recurring bodies (the repeater) re-arm their waiter inside `resume` and
/// yield again; the default `resume` re-runs `start` to support exactly that
/// shape of body.
pub trait Coroutine {
    /// Enter the body for the first time; runs until the first suspension.
    fn start(&mut self, waiter: Waiter) -> Step;

    /// Re-enter the body at its suspension point after the waiter finished.
    fn resume(&mut self, waiter: Waiter) -> Step {
        self.start(waiter)
    }

    /// Hook invoked after the body completes. The returned continuation,
    /// typically the suspended parent awaiting this leaf, is invoked next.
    fn on_finish(&mut self, _waiter: Waiter) -> Option<Continuation> {
        None
    }
}
