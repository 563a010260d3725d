use crate::waiter::Waiter;

/// Strong reference-counted handle over a waiter.
///
/// Every copy is a strong reference: cloning increments the waiter's count,
/// dropping releases it, and the last release destroys the waiter. There is
/// no weak variant; a cycle must be broken by clearing a handle before
/// drop. Code that lets its last handle drop while the waiter is still
/// armed has a defect: the heap and poller do not keep waiters alive.
#[derive(Debug, Default)]
pub struct WaiterHandle {
    inner: Option<Waiter>,
}

impl WaiterHandle {
    pub fn new(waiter: Waiter) -> Self {
        waiter.add_ref();
        Self {
            inner: Some(waiter),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Waiter> {
        self.inner
    }

    /// Release the held reference and empty the handle; returns the
    /// remaining count (zero when the waiter was destroyed or the handle
    /// was already empty).
    pub fn clear(&mut self) -> u32 {
        match self.inner.take() {
            Some(waiter) => waiter.release(),
            None => 0,
        }
    }
}

impl Clone for WaiterHandle {
    fn clone(&self) -> Self {
        if let Some(waiter) = self.inner {
            waiter.add_ref();
        }
        Self { inner: self.inner }
    }
}

impl Drop for WaiterHandle {
    fn drop(&mut self) {
        if let Some(waiter) = self.inner.take() {
            waiter.release();
        }
    }
}

impl From<Waiter> for WaiterHandle {
    fn from(waiter: Waiter) -> Self {
        Self::new(waiter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context;
    use crate::test_utils::Noop;

    fn live_waiters() -> usize {
        context::with_waiters(|arena| arena.len())
    }

    #[test]
    fn test_handle_churn_leaves_count_unchanged() {
        crate::init().expect("init");
        let waiter = Waiter::spawn(Noop);
        waiter.add_ref();
        assert_eq!(waiter.ref_count(), 1);

        let handles: Vec<_> = (0..5).map(|_| WaiterHandle::new(waiter)).collect();
        assert_eq!(waiter.ref_count(), 6);

        let clones: Vec<_> = handles.iter().cloned().collect();
        assert_eq!(waiter.ref_count(), 11);

        drop(clones);
        drop(handles);
        assert_eq!(waiter.ref_count(), 1);
        assert_eq!(live_waiters(), 1);
    }

    #[test]
    fn test_last_handle_destroys_the_waiter() {
        crate::init().expect("init");
        let waiter = Waiter::spawn(Noop);

        let first = WaiterHandle::new(waiter);
        let second = first.clone();
        assert_eq!(waiter.ref_count(), 2);

        drop(first);
        assert_eq!(waiter.ref_count(), 1);
        assert_eq!(live_waiters(), 1);

        drop(second);
        assert_eq!(live_waiters(), 0);
    }

    #[test]
    fn test_clear_empties_the_handle() {
        crate::init().expect("init");
        let waiter = Waiter::spawn(Noop);

        let mut handle = WaiterHandle::new(waiter);
        assert_eq!(handle.clear(), 0);
        assert!(handle.get().is_none());
        assert_eq!(live_waiters(), 0);

        // Clearing twice is a no-op.
        assert_eq!(handle.clear(), 0);
    }

    #[test]
    fn test_empty_handle_is_inert() {
        let handle = WaiterHandle::empty();
        assert!(handle.get().is_none());
        drop(handle);
    }
}
