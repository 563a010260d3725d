// Keep the full heap/arena surface even where the driver only needs part
// of it; embedders poking at the context rely on the rest.
#![allow(dead_code)]

use crate::runtime::config::Config;
use anyhow::{Result, anyhow};
use std::cell::{Cell, RefCell};
use std::thread_local;

// Exports
pub(crate) mod arena;
pub(crate) use arena::{WaiterArena, WaiterId};

pub(crate) mod clock;
pub(crate) use clock::Clock;

pub(crate) mod heap;
pub(crate) use heap::TimerHeap;

pub(crate) mod poller;
pub(crate) use poller::Poller;

/// Per-thread timer-and-poll state. Each thread that runs the loop owns an
/// independent instance; nothing here is shared or locked.
pub(crate) struct Core {
    pub(crate) clock: RefCell<Clock>,
    pub(crate) heap: RefCell<TimerHeap>,
    pub(crate) waiters: RefCell<WaiterArena>,
    pub(crate) poller: RefCell<Poller>,

    /// Set for the duration of teardown: arming operations become no-ops so
    /// bodies resumed with the stop flag cannot re-enter the heap.
    pub(crate) stopping: Cell<bool>,
}

impl Core {
    fn try_new(cfg: &Config) -> Result<Self> {
        Ok(Self {
            clock: RefCell::new(Clock::try_new()?),
            heap: RefCell::new(TimerHeap::new()),
            waiters: RefCell::new(WaiterArena::with_capacity(cfg.waiter_capacity)),
            poller: RefCell::new(Poller::try_new(cfg.events_capacity, cfg.max_poll_slice_ms)?),
            stopping: Cell::new(false),
        })
    }
}

thread_local! {
    static CONTEXT: RefCell<Option<Core>> = const { RefCell::new(None) };
}

pub(crate) fn init_context(cfg: &Config) -> Result<()> {
    CONTEXT.with(|ctx| {
        let mut slot = ctx.borrow_mut();
        if slot.is_some() {
            return Err(anyhow!("timer context already initialized on this thread"));
        }
        *slot = Some(Core::try_new(cfg)?);
        Ok(())
    })?;

    tracing::debug!("timer context initialized");
    Ok(())
}

pub(crate) fn is_initialized() -> bool {
    CONTEXT.with(|ctx| ctx.borrow().is_some())
}

/// Take the context down. Panics if called while the context is borrowed,
/// i.e. from inside a resumed coroutine body.
pub(crate) fn take_context() -> Option<Core> {
    CONTEXT.with(|ctx| ctx.borrow_mut().take())
}

#[track_caller]
#[inline(always)]
pub(crate) fn with_core<F, R>(f: F) -> R
where
    F: FnOnce(&Core) -> R,
{
    CONTEXT.with(|ctx| {
        let root = ctx.borrow();
        let core = root
            .as_ref()
            .expect("timer context not initialized on this thread");
        f(core)
    })
}

/// Like [`with_core`] but a no-op after teardown. Release paths use this so
/// handles outliving the context do not panic on drop.
#[inline(always)]
pub(crate) fn try_with_core<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&Core) -> R,
{
    CONTEXT.with(|ctx| {
        let root = ctx.borrow();
        root.as_ref().map(f)
    })
}

#[track_caller]
#[inline(always)]
pub(crate) fn with_waiters<F, R>(f: F) -> R
where
    F: FnOnce(&WaiterArena) -> R,
{
    with_core(|core| f(&core.waiters.borrow()))
}

#[track_caller]
#[inline(always)]
pub(crate) fn with_waiters_mut<F, R>(f: F) -> R
where
    F: FnOnce(&mut WaiterArena) -> R,
{
    with_core(|core| f(&mut core.waiters.borrow_mut()))
}
