// Copyright (c) Microsoft Corporation. All rights reserved.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::slab::Slab;
use ::std::marker::PhantomData;

//======================================================================================================================
// Constants
//======================================================================================================================

/// Arbitrary size chosen to pre-allocate the slab.
const DEFAULT_SIZE: usize = 64;

/// Number of bits of a handle that hold the slot index. The remaining high bits hold the generation.
const INDEX_BITS: u32 = 32;
const INDEX_MASK: u64 = (1 << INDEX_BITS) - 1;

//======================================================================================================================
// Structures
//======================================================================================================================

struct Slot<T> {
    generation: u32,
    value: T,
}

/// Slab-backed storage that hands out generation-stamped handles. A handle packs the slot index in its low 32 bits and
/// the generation of the insertion in its high 32 bits, so a handle whose slot has been freed (and perhaps reused by a
/// later insertion) no longer resolves. The handle types must be basic types that convert back and forth from u64.
pub struct Arena<K: From<u64> + Into<u64> + Copy, T> {
    slots: Slab<Slot<T>>,
    /// Generation stamped on the next insertion. Never zero, so a zeroed handle never resolves.
    next_generation: u32,
    _marker: PhantomData<K>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl<K: From<u64> + Into<u64> + Copy, T> Arena<K, T> {
    /// Stores `value` and returns a fresh handle to it.
    pub fn insert(&mut self, value: T) -> K {
        let generation: u32 = self.next_generation;
        self.next_generation = match self.next_generation.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        let index: usize = self.slots.insert(Slot { generation, value });
        debug_assert!((index as u64) <= INDEX_MASK);
        K::from(Self::pack(index, generation))
    }

    pub fn get(&self, key: K) -> Option<&T> {
        let (index, generation) = Self::unpack(key);
        match self.slots.get(index) {
            Some(slot) if slot.generation == generation => Some(&slot.value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, key: K) -> Option<&mut T> {
        let (index, generation) = Self::unpack(key);
        match self.slots.get_mut(index) {
            Some(slot) if slot.generation == generation => Some(&mut slot.value),
            _ => None,
        }
    }

    pub fn contains(&self, key: K) -> bool {
        self.get(key).is_some()
    }

    /// Removes the value behind `key`. Stale handles are ignored.
    pub fn remove(&mut self, key: K) -> Option<T> {
        if !self.contains(key) {
            return None;
        }
        let (index, _) = Self::unpack(key);
        Some(self.slots.remove(index).value)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (K, &T)> {
        self.slots
            .iter()
            .map(|(index, slot)| (K::from(Self::pack(index, slot.generation)), &slot.value))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (K, &mut T)> {
        self.slots
            .iter_mut()
            .map(|(index, slot)| (K::from(Self::pack(index, slot.generation)), &mut slot.value))
    }

    /// Removes every value and returns them.
    pub fn drain(&mut self) -> Vec<T> {
        self.slots.drain().map(|slot| slot.value).collect()
    }

    fn pack(index: usize, generation: u32) -> u64 {
        ((generation as u64) << INDEX_BITS) | (index as u64 & INDEX_MASK)
    }

    fn unpack(key: K) -> (usize, u32) {
        let raw: u64 = key.into();
        ((raw & INDEX_MASK) as usize, (raw >> INDEX_BITS) as u32)
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl<K: From<u64> + Into<u64> + Copy, T> Default for Arena<K, T> {
    fn default() -> Self {
        Self {
            slots: Slab::with_capacity(DEFAULT_SIZE),
            next_generation: 1,
            _marker: PhantomData,
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
