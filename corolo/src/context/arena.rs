use crate::waiter::slot::WaiterSlot;
use slab::Slab;

/// Opaque handle to a waiter slot: slab index plus a generation counter so
/// a recycled index cannot impersonate a released waiter. Encodable as the
/// multiplexer's 64-bit user data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct WaiterId {
    index: u32,
    generation: u32,
}

impl WaiterId {
    #[inline(always)]
    pub(crate) fn as_user_data(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    #[inline(always)]
    pub(crate) fn from_user_data(data: u64) -> Self {
        Self {
            index: data as u32,
            generation: (data >> 32) as u32,
        }
    }
}

/// Slab-backed waiter storage. Grows past the configured capacity rather
/// than refusing new waiters; running out of memory is fatal anyway.
pub(crate) struct WaiterArena {
    slots: Slab<WaiterSlot>,
    next_generation: u32,
}

impl WaiterArena {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Slab::with_capacity(capacity),
            next_generation: 1,
        }
    }

    pub(crate) fn insert(&mut self, coroutine: Box<dyn crate::coroutine::Coroutine>) -> WaiterId {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1).max(1);

        let index = self.slots.insert(WaiterSlot::new(generation, coroutine));
        WaiterId {
            index: index as u32,
            generation,
        }
    }

    pub(crate) fn get(&self, id: WaiterId) -> Option<&WaiterSlot> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
    }

    pub(crate) fn get_mut(&mut self, id: WaiterId) -> Option<&mut WaiterSlot> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
    }

    #[track_caller]
    pub(crate) fn expect(&self, id: WaiterId) -> &WaiterSlot {
        self.get(id).expect("stale waiter id: already released")
    }

    #[track_caller]
    pub(crate) fn expect_mut(&mut self, id: WaiterId) -> &mut WaiterSlot {
        self.get_mut(id).expect("stale waiter id: already released")
    }

    pub(crate) fn remove(&mut self, id: WaiterId) -> Option<WaiterSlot> {
        match self.get(id) {
            Some(_) => self.slots.try_remove(id.index as usize),
            None => None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.capacity()
    }
}
