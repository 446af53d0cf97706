//! LRU cache of compiled functions.

use std::collections::HashMap;
use std::ops::Deref;

use crate::{Data, Function, FunctionDisassembler};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
struct CacheKey {
    tag: u64,
    address: u16,
}

struct Slot<T> {
    artifact: T,
    last_used: u64,
}

/// Result of a repository lookup.
///
/// Cacheable functions are handed out by reference and stay owned by the
/// repository; non-cacheable ones are handed over to the caller, who drops
/// them after the call.
pub enum Fetched<'a, T> {
    Cached(&'a T),
    Transient(T),
}

impl<T> Deref for Fetched<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self {
            Fetched::Cached(artifact) => artifact,
            Fetched::Transient(artifact) => artifact,
        }
    }
}

/// Repository of compiled functions, keyed by `(memory tag, entry address)`.
///
/// On a miss the requested function is recovered by the
/// [`FunctionDisassembler`] and handed to the caller's packer, which turns it
/// into whatever the active back-end executes. Cacheable artifacts are kept
/// LRU-style up to the capacity; evicting one drops it, which runs its
/// cleanup (releasing executable memory, unregistering script references).
pub struct Repository<T> {
    capacity: usize,
    slots: HashMap<CacheKey, Slot<T>>,
    stamp: u64,
}

impl<T> Repository<T> {
    pub const DEFAULT_CAPACITY: usize = 1000;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { capacity, slots: HashMap::new(), stamp: 0 }
    }

    /// Fetches the function entered at `address`, compiling it through
    /// `pack` on a miss.
    pub fn get<F>(
        &mut self,
        data: &mut dyn Data,
        address: u16,
        pack: F,
    ) -> Result<Fetched<'_, T>, String>
    where
        F: FnOnce(&Function) -> Result<T, String>,
    {
        let key = CacheKey { tag: data.tag(), address };
        self.stamp += 1;

        let hit = if let Some(slot) = self.slots.get_mut(&key) {
            slot.last_used = self.stamp;
            true
        } else {
            false
        };

        if !hit {
            let function = FunctionDisassembler::new(data).disassemble(address);
            let artifact = pack(&function)?;

            if !function.cacheable() {
                return Ok(Fetched::Transient(artifact));
            }

            if self.slots.len() >= self.capacity {
                self.evict_least_recently_used();
            }

            self.slots.insert(key, Slot { artifact, last_used: self.stamp });
        }

        Ok(Fetched::Cached(&self.slots[&key].artifact))
    }

    /// Evicts the entry for `address` under the current tag, if present.
    pub fn evict(&mut self, data: &mut dyn Data, address: u16) {
        let key = CacheKey { tag: data.tag(), address };
        self.slots.remove(&key);
    }

    /// Drops every cached artifact.
    pub fn clear(&mut self) {
        self.slots.clear();
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn evict_least_recently_used(&mut self) {
        let oldest = self
            .slots
            .iter()
            .min_by_key(|(_, slot)| slot.last_used)
            .map(|(key, _)| *key);

        if let Some(key) = oldest {
            self.slots.remove(&key);
        }
    }
}

impl<T> Default for Repository<T> {
    fn default() -> Self {
        Self::new()
    }
}
