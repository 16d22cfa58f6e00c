//! A typed object pool handing out generation-checked keys.
//!
//! Block and arena descriptors are stored here instead of being individually
//! boxed. Removed slots are chained into an intrusive vacant list and reused
//! by later inserts, so the alloc/free hot path does not touch the host heap
//! once the pool has grown to its working size. Removing never allocates.
//!
//! Every slot carries a generation that is bumped when the slot is vacated,
//! so a key that outlived its value no longer resolves.

use alloc::vec::Vec;
use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;
use core::ops::{Index, IndexMut};

use crate::error::AllocError;

/// A key to a value stored in a [`Pool`](struct.Pool.html).
///
/// `T` only brands the key, so keys of different pools cannot be mixed up.
pub struct Key<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Key<T> {
    fn new(index: u32, generation: u32) -> Self {
        Key {
            index,
            generation,
            _marker: PhantomData,
        }
    }
}

// Derives would require `T: Clone` and friends, which a key does not need.
impl<T> Clone for Key<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Key<T> {}

impl<T> PartialEq for Key<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Key<T> {}

impl<T> Hash for Key<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Key<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

enum Entry<T> {
    Occupied(T),
    // Index of the next vacant slot.
    Vacant(Option<u32>),
}

struct Slot<T> {
    generation: u32,
    entry: Entry<T>,
}

/// Storage for values of type `T`, addressed by `Key<M>`.
///
/// The brand `M` defaults to `T`; pools whose value type is generic use a
/// fixed brand so their keys stay nameable without the generics.
pub struct Pool<T, M = T> {
    slots: Vec<Slot<T>>,
    vacant: Option<u32>,
    vacant_len: usize,
    len: usize,
    _marker: PhantomData<fn() -> M>,
}

impl<T, M> Default for Pool<T, M> {
    fn default() -> Self {
        Pool::new()
    }
}

impl<T, M> Pool<T, M> {
    pub fn new() -> Self {
        Pool {
            slots: Vec::new(),
            vacant: None,
            vacant_len: 0,
            len: 0,
            _marker: PhantomData,
        }
    }

    /// Number of live values.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Make sure the next `additional` inserts will not need to allocate.
    ///
    /// This is the only fallible operation of the pool; callers reserve up
    /// front so that later inserts in the same operation cannot fail halfway.
    pub fn reserve(&mut self, additional: usize) -> Result<(), AllocError> {
        let needed = additional.saturating_sub(self.vacant_len);
        if needed == 0 {
            return Ok(());
        }
        if self.slots.len() + needed > u32::MAX as usize {
            return Err(AllocError::DescriptorExhausted);
        }
        self.slots
            .try_reserve(needed)
            .map_err(|_| AllocError::DescriptorExhausted)
    }

    /// The key the next call to `insert` will return.
    ///
    /// Lets a value refer to its own key, or to a key of a value inserted
    /// right after it, without a second pass.
    pub fn next_key(&self) -> Key<M> {
        match self.vacant {
            Some(index) => Key::new(index, self.slots[index as usize].generation),
            None => Key::new(self.slots.len() as u32, 0),
        }
    }

    /// Store `value` and return its key.
    ///
    /// Reuses a vacant slot when there is one. Otherwise this pushes a new
    /// slot, which only avoids reallocating if capacity was reserved first.
    pub fn insert(&mut self, value: T) -> Key<M> {
        self.len += 1;

        if let Some(index) = self.vacant {
            let slot = &mut self.slots[index as usize];
            self.vacant = match slot.entry {
                Entry::Vacant(next) => next,
                Entry::Occupied(_) => unreachable!("vacant list points at a live slot"),
            };
            self.vacant_len -= 1;
            slot.entry = Entry::Occupied(value);
            return Key::new(index, slot.generation);
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            entry: Entry::Occupied(value),
        });
        Key::new(index, 0)
    }

    /// Take the value out of the pool, recycling its slot.
    ///
    /// Returns `None` if the key is stale.
    pub fn remove(&mut self, key: Key<M>) -> Option<T> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        if let Entry::Vacant(_) = slot.entry {
            return None;
        }

        let entry = core::mem::replace(&mut slot.entry, Entry::Vacant(self.vacant));
        slot.generation = slot.generation.wrapping_add(1);
        self.vacant = Some(key.index);
        self.vacant_len += 1;
        self.len -= 1;

        match entry {
            Entry::Occupied(value) => Some(value),
            Entry::Vacant(_) => None,
        }
    }

    pub fn contains(&self, key: Key<M>) -> bool {
        self.get(key).is_some()
    }

    pub fn get(&self, key: Key<M>) -> Option<&T> {
        match self.slots.get(key.index as usize) {
            Some(Slot {
                generation,
                entry: Entry::Occupied(value),
            }) if *generation == key.generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, key: Key<M>) -> Option<&mut T> {
        match self.slots.get_mut(key.index as usize) {
            Some(Slot {
                generation,
                entry: Entry::Occupied(value),
            }) if *generation == key.generation => Some(value),
            _ => None,
        }
    }

    /// Iterate over all live values, in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Key<M>, &T)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match &slot.entry {
                Entry::Occupied(value) => Some((Key::new(index as u32, slot.generation), value)),
                Entry::Vacant(_) => None,
            })
    }

    /// Remove every value, returning them. Slots stay allocated for reuse.
    pub fn drain(&mut self) -> Vec<T> {
        let mut vacant = self.vacant;
        let mut vacant_len = self.vacant_len;
        let mut taken = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Entry::Occupied(_) = slot.entry {
                if let Entry::Occupied(value) =
                    core::mem::replace(&mut slot.entry, Entry::Vacant(vacant))
                {
                    taken.push(value);
                }
                slot.generation = slot.generation.wrapping_add(1);
                vacant = Some(index as u32);
                vacant_len += 1;
            }
        }
        self.vacant = vacant;
        self.vacant_len = vacant_len;
        self.len = 0;
        taken
    }
}

impl<T, M> Index<Key<M>> for Pool<T, M> {
    type Output = T;

    fn index(&self, key: Key<M>) -> &T {
        match self.get(key) {
            Some(value) => value,
            None => panic!("stale pool key {:?}", key),
        }
    }
}

impl<T, M> IndexMut<Key<M>> for Pool<T, M> {
    fn index_mut(&mut self, key: Key<M>) -> &mut T {
        match self.get_mut(key) {
            Some(value) => value,
            None => panic!("stale pool key {:?}", key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_env_log::test;

    #[test]
    fn test_insert_get_remove() {
        let mut pool: Pool<&'static str> = Pool::new();
        let a = pool.insert("a");
        let b = pool.insert("b");
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.get(a), Some(&"a"));
        assert_eq!(pool.get(b), Some(&"b"));

        assert_eq!(pool.remove(a), Some("a"));
        assert_eq!(pool.len(), 1);
        assert!(pool.get(a).is_none());
        assert!(pool.remove(a).is_none());
        assert_eq!(pool.get(b), Some(&"b"));
    }

    #[test]
    fn test_slots_are_recycled_with_new_generation() {
        let mut pool: Pool<u32> = Pool::new();
        let a = pool.insert(1u32);
        pool.remove(a);
        let predicted = pool.next_key();
        let c = pool.insert(3u32);
        assert_eq!(predicted, c);

        // Same slot, different key.
        assert_ne!(a, c);
        assert_eq!(pool.next_key(), Key::new(1, 0));
        assert!(pool.get(a).is_none());
        assert_eq!(pool.get(c), Some(&3));
        assert_eq!(pool.slots.len(), 1);
    }

    #[test]
    #[should_panic(expected = "stale pool key")]
    fn test_index_with_stale_key_panics() {
        let mut pool: Pool<u32> = Pool::new();
        let a = pool.insert(1);
        pool.remove(a);
        let _ = pool[a];
    }

    #[test]
    fn test_reserve_counts_vacant_slots() {
        let mut pool: Pool<u32> = Pool::new();
        let keys: Vec<_> = (0..4u32).map(|i| pool.insert(i)).collect();
        for &k in &keys {
            pool.remove(k);
        }
        let capacity = pool.slots.capacity();
        pool.reserve(4).unwrap();
        assert_eq!(pool.slots.capacity(), capacity);

        pool.reserve(16).unwrap();
        assert!(pool.slots.capacity() >= 16);
    }

    #[test]
    fn test_drain() {
        let mut pool: Pool<u32> = Pool::new();
        let a = pool.insert(1u32);
        let b = pool.insert(2u32);
        pool.remove(a);
        let c = pool.insert(3u32);

        let mut drained = pool.drain();
        drained.sort_unstable();
        assert_eq!(drained, vec![2, 3]);
        assert!(pool.is_empty());
        assert!(!pool.contains(b));
        assert!(!pool.contains(c));
        assert_eq!(pool.iter().count(), 0);

        // Everything is reusable afterwards.
        pool.insert(4u32);
        pool.insert(5u32);
        assert_eq!(pool.slots.len(), 2);
    }
}
