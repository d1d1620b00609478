use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(1);

/// Generation-checked index into a [`Pool`].
///
/// `T` is only a tag; handles for buffers and kernels cannot be mixed up.
/// A handle also remembers the pool that issued it and never resolves in
/// any other.
#[derive(Debug)]
pub struct Handle<T> {
    pub slot: u16,
    pub generation: u16,
    pub pool: u32,
    phantom: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    pub(crate) fn new(slot: u16, generation: u16, pool: u32) -> Self {
        Self {
            slot,
            generation,
            pool,
            phantom: PhantomData,
        }
    }
}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.slot == other.slot && self.generation == other.generation && self.pool == other.pool
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.slot.hash(state);
        self.generation.hash(state);
        self.pool.hash(state);
    }
}

/// Slot storage handing out [`Handle`]s tagged with `H`.
///
/// Releasing a slot bumps its generation so stale handles stop resolving.
pub struct Pool<T, H = T> {
    id: u32,
    items: Vec<Option<T>>,
    empty: Vec<usize>,
    generation: Vec<u16>,
    phantom: PhantomData<fn() -> H>,
}

impl<T, H> Default for Pool<T, H> {
    fn default() -> Self {
        const INITIAL_SIZE: usize = 64;
        Self::new(INITIAL_SIZE)
    }
}

impl<T, H> Pool<T, H> {
    pub fn new(initial_size: usize) -> Self {
        let mut p = Pool {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            items: Vec::with_capacity(initial_size),
            empty: Vec::with_capacity(initial_size),
            generation: vec![0; initial_size],
            phantom: PhantomData,
        };

        // Hand out low slots first.
        p.empty = (0..initial_size).rev().collect();
        p.items.resize_with(initial_size, || None);

        p
    }

    /// Store `item`, growing the pool when every slot is taken.
    ///
    /// Returns `None` only once the 16-bit slot space is exhausted.
    pub fn insert(&mut self, item: T) -> Option<Handle<H>> {
        let empty_slot = match self.empty.pop() {
            Some(slot) => slot,
            None => {
                if self.items.len() > u16::MAX as usize {
                    return None;
                }
                self.items.push(None);
                self.generation.push(0);
                self.items.len() - 1
            }
        };

        self.items[empty_slot] = Some(item);
        Some(Handle::new(
            empty_slot as u16,
            self.generation[empty_slot],
            self.id,
        ))
    }

    /// Slot index of `item` if it was issued here and is still current.
    fn live_slot(&self, item: Handle<H>) -> Option<usize> {
        let slot = item.slot as usize;
        if item.pool == self.id && self.generation.get(slot) == Some(&item.generation) {
            Some(slot)
        } else {
            None
        }
    }

    /// Remove the item behind `item`, invalidating every copy of the handle.
    pub fn take(&mut self, item: Handle<H>) -> Option<T> {
        let slot = self.live_slot(item)?;
        let value = self.items[slot].take()?;
        self.generation[slot] = self.generation[slot].wrapping_add(1);
        self.empty.push(slot);
        Some(value)
    }

    pub fn get_ref(&self, item: Handle<H>) -> Option<&T> {
        let slot = self.live_slot(item)?;
        self.items[slot].as_ref()
    }

    pub fn get_mut_ref(&mut self, item: Handle<H>) -> Option<&mut T> {
        let slot = self.live_slot(item)?;
        self.items[slot].as_mut()
    }

    pub fn len(&self) -> usize {
        self.items.iter().filter(|i| i.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empty the pool, returning every live item. Outstanding handles go stale.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::new();
        for (slot, item) in self.items.iter_mut().enumerate() {
            if let Some(value) = item.take() {
                self.generation[slot] = self.generation[slot].wrapping_add(1);
                self.empty.push(slot);
                out.push(value);
            }
        }
        out
    }
}
