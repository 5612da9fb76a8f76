//! Instance slot storage.
//!
//! Instance ids index directly into a vector; released ids are reused lowest
//! first so ids stay dense. Capacity is a runtime limit, and storage only grows
//! as far as the highest id ever handed out.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use ash::vk;
use kohi_gpu::DeferredQueue;

use crate::texture::TextureBinding;

use super::descriptor_state::DescriptorState;

/// GPU-side state owned by one shader instance.
#[derive(Debug)]
pub struct InstanceState {
    /// Offset of the instance's region in the shader's uniform buffer.
    pub offset: u64,
    /// One descriptor set per frame in flight.
    pub descriptor_sets: Vec<vk::DescriptorSet>,
    pub descriptor_state: DescriptorState,
    /// Textures bound to the instance's sampler slots.
    pub textures: Vec<Option<TextureBinding>>,
}

#[derive(Debug)]
enum Slot<T> {
    Free,
    Live(T),
    /// Released, but the id is held until its resources are reclaimed.
    Retired,
}

/// Bounded slot map keyed by dense `u32` ids.
#[derive(Debug)]
pub struct InstanceSlots<T> {
    slots: Vec<Slot<T>>,
    free: BinaryHeap<Reverse<u32>>,
    capacity: usize,
    live: usize,
    retired: usize,
}

impl<T> InstanceSlots<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: BinaryHeap::new(),
            capacity,
            live: 0,
            retired: 0,
        }
    }

    /// Id the next insert will use, if there is room.
    pub fn next_id(&self) -> Option<u32> {
        if let Some(Reverse(id)) = self.free.peek() {
            return Some(*id);
        }
        (self.slots.len() < self.capacity).then_some(self.slots.len() as u32)
    }

    /// Store `value` in the lowest free slot, or hand it back if full.
    pub fn insert(&mut self, value: T) -> Result<u32, T> {
        if let Some(Reverse(id)) = self.free.pop() {
            self.slots[id as usize] = Slot::Live(value);
            self.live += 1;
            return Ok(id);
        }
        if self.slots.len() >= self.capacity {
            return Err(value);
        }
        let id = self.slots.len() as u32;
        self.slots.push(Slot::Live(value));
        self.live += 1;
        Ok(id)
    }

    pub fn get(&self, id: u32) -> Option<&T> {
        match self.slots.get(id as usize)? {
            Slot::Live(value) => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        match self.slots.get_mut(id as usize)? {
            Slot::Live(value) => Some(value),
            _ => None,
        }
    }

    fn take_live(&mut self, id: u32, replacement: Slot<T>) -> Option<T> {
        let slot = self.slots.get_mut(id as usize)?;
        if !matches!(slot, Slot::Live(_)) {
            return None;
        }
        match std::mem::replace(slot, replacement) {
            Slot::Live(value) => {
                self.live -= 1;
                Some(value)
            }
            _ => None,
        }
    }

    /// Empty a slot, returning what it held. The id is free at once.
    pub fn remove(&mut self, id: u32) -> Option<T> {
        let value = self.take_live(id, Slot::Free)?;
        self.free.push(Reverse(id));
        Some(value)
    }

    /// Empty a slot but keep its id out of circulation until [`Self::reclaim`].
    pub fn retire(&mut self, id: u32) -> Option<T> {
        let value = self.take_live(id, Slot::Retired)?;
        self.retired += 1;
        Some(value)
    }

    /// Return a retired id to the free pool. Returns false if `id` was not retired.
    pub fn reclaim(&mut self, id: u32) -> bool {
        let Some(slot) = self.slots.get_mut(id as usize) else {
            return false;
        };
        if !matches!(slot, Slot::Retired) {
            return false;
        }
        *slot = Slot::Free;
        self.retired -= 1;
        self.free.push(Reverse(id));
        true
    }

    /// Take every live value, leaving the map empty. Retired ids are forgotten.
    pub fn drain(&mut self) -> impl Iterator<Item = (u32, T)> + '_ {
        self.free.clear();
        self.live = 0;
        self.retired = 0;
        self.slots
            .drain(..)
            .enumerate()
            .filter_map(|(id, slot)| match slot {
                Slot::Live(value) => Some((id as u32, value)),
                _ => None,
            })
    }

    /// Live values.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Ids waiting on [`Self::reclaim`].
    pub fn retired(&self) -> usize {
        self.retired
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Instance slots plus releases still waiting on frames in flight.
///
/// A released id stays reserved until its value comes back out of
/// [`InstanceLedger::collect`], so live and pending instances together never
/// exceed the capacity the uniform buffer and descriptor pool are sized for.
pub struct InstanceLedger<T> {
    slots: InstanceSlots<T>,
    released: DeferredQueue<(u32, T)>,
}

impl<T> InstanceLedger<T> {
    pub fn new(capacity: usize, frames_in_flight: usize) -> Self {
        Self {
            slots: InstanceSlots::new(capacity),
            released: DeferredQueue::new(frames_in_flight),
        }
    }

    #[inline]
    pub fn next_id(&self) -> Option<u32> {
        self.slots.next_id()
    }

    #[inline]
    pub fn insert(&mut self, value: T) -> Result<u32, T> {
        self.slots.insert(value)
    }

    #[inline]
    pub fn get(&self, id: u32) -> Option<&T> {
        self.slots.get(id)
    }

    #[inline]
    pub fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        self.slots.get_mut(id)
    }

    /// Retire `id` during frame `frame_number`. Returns false if it is not live.
    pub fn release(&mut self, id: u32, frame_number: u64) -> bool {
        match self.slots.retire(id) {
            Some(value) => {
                self.released.push((id, value), frame_number);
                true
            }
            None => false,
        }
    }

    /// Hand every release no frame in flight can still use to `reclaim`, then
    /// free its id. Returns the number reclaimed.
    pub fn collect<F>(&mut self, frame_number: u64, mut reclaim: F) -> usize
    where
        F: FnMut(T),
    {
        let slots = &mut self.slots;
        self.released.collect(frame_number, |(id, value)| {
            reclaim(value);
            slots.reclaim(id);
        })
    }

    /// Reclaim every pending release regardless of frame. Call only after the device is idle.
    pub fn flush<F>(&mut self, mut reclaim: F)
    where
        F: FnMut(T),
    {
        let slots = &mut self.slots;
        self.released.flush(|(id, value)| {
            reclaim(value);
            slots.reclaim(id);
        });
    }

    /// Take every live value, leaving the ledger empty. Flush first.
    pub fn drain(&mut self) -> impl Iterator<Item = (u32, T)> + '_ {
        self.slots.drain()
    }

    /// Live instances.
    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Releases waiting on frames in flight.
    #[inline]
    pub fn pending(&self) -> usize {
        self.released.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    #[inline]
    pub fn frames_in_flight(&self) -> usize {
        self.released.frames_in_flight()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kohi_gpu::{Freelist, GpuError};

    #[test]
    fn released_slot_reused_before_new_one() {
        let mut slots = InstanceSlots::new(8);
        let a = slots.insert("a").unwrap();
        let b = slots.insert("b").unwrap();
        let c = slots.insert("c").unwrap();
        assert_eq!((a, b, c), (0, 1, 2));

        assert_eq!(slots.remove(b), Some("b"));
        assert_eq!(slots.next_id(), Some(1));
        assert_eq!(slots.insert("d").unwrap(), 1);
        assert_eq!(slots.insert("e").unwrap(), 3);
    }

    #[test]
    fn lowest_free_first() {
        let mut slots = InstanceSlots::new(8);
        for i in 0..5 {
            slots.insert(i).unwrap();
        }
        slots.remove(3);
        slots.remove(1);
        assert_eq!(slots.insert(10).unwrap(), 1);
        assert_eq!(slots.insert(11).unwrap(), 3);
    }

    #[test]
    fn capacity_is_enforced() {
        let mut slots = InstanceSlots::new(2);
        slots.insert(1).unwrap();
        slots.insert(2).unwrap();
        assert_eq!(slots.next_id(), None);
        assert_eq!(slots.insert(3), Err(3));

        slots.remove(0);
        assert_eq!(slots.insert(3), Ok(0));
        assert_eq!(slots.len(), 2);
    }

    #[test]
    fn remove_twice_is_none() {
        let mut slots = InstanceSlots::new(4);
        let id = slots.insert(()).unwrap();
        assert!(slots.remove(id).is_some());
        assert!(slots.remove(id).is_none());
        assert!(slots.get(id).is_none());
        assert!(slots.is_empty());
    }

    #[test]
    fn retired_id_held_until_reclaimed() {
        let mut slots = InstanceSlots::new(2);
        slots.insert('a').unwrap();
        slots.insert('b').unwrap();

        assert_eq!(slots.retire(0), Some('a'));
        assert_eq!(slots.retire(0), None);
        assert!(slots.get(0).is_none());
        assert_eq!(slots.len(), 1);
        assert_eq!(slots.retired(), 1);
        assert_eq!(slots.next_id(), None);
        assert_eq!(slots.insert('c'), Err('c'));

        assert!(!slots.reclaim(1));
        assert!(slots.reclaim(0));
        assert!(!slots.reclaim(0));
        assert_eq!(slots.retired(), 0);
        assert_eq!(slots.insert('c'), Ok(0));
    }

    #[test]
    fn drain_empties_map() {
        let mut slots = InstanceSlots::new(4);
        slots.insert('x').unwrap();
        slots.insert('y').unwrap();
        slots.insert('w').unwrap();
        slots.remove(0);
        slots.retire(2);

        let drained: Vec<_> = slots.drain().collect();
        assert_eq!(drained, vec![(1, 'y')]);
        assert!(slots.is_empty());
        assert_eq!(slots.retired(), 0);
        assert_eq!(slots.insert('z').unwrap(), 0);
    }

    /// Stand-in for an instance: its uniform range and descriptor set count.
    #[derive(Debug, PartialEq)]
    struct Region {
        offset: u64,
        sets: usize,
    }

    const STRIDE: u64 = 256;
    const FRAMES: usize = 2;

    /// Models the shader's storage: a uniform freelist and a descriptor pool
    /// both sized for exactly `capacity` instances.
    struct Storage {
        ledger: InstanceLedger<Region>,
        ubo: Freelist,
        free_sets: usize,
    }

    impl Storage {
        fn new(capacity: usize) -> Self {
            Self {
                ledger: InstanceLedger::new(capacity, FRAMES),
                ubo: Freelist::new(STRIDE * capacity as u64),
                free_sets: FRAMES * capacity,
            }
        }

        fn acquire(&mut self) -> Result<u32, &'static str> {
            if self.ledger.next_id().is_none() {
                return Err("capacity");
            }
            let offset = self.ubo.allocate(STRIDE).map_err(|e| match e {
                GpuError::OutOfSpace { .. } => "uniform space",
                _ => "freelist",
            })?;
            if self.free_sets < FRAMES {
                return Err("descriptor pool");
            }
            self.free_sets -= FRAMES;
            self.ledger
                .insert(Region {
                    offset,
                    sets: FRAMES,
                })
                .map_err(|_| "capacity")
        }

        fn collect(&mut self, frame_number: u64) -> usize {
            let ubo = &mut self.ubo;
            let free_sets = &mut self.free_sets;
            self.ledger.collect(frame_number, |region| {
                ubo.free(region.offset, STRIDE).unwrap();
                *free_sets += region.sets;
            })
        }
    }

    #[test]
    fn release_at_capacity_never_overcommits_storage() {
        let mut storage = Storage::new(2);
        assert_eq!(storage.acquire(), Ok(0));
        assert_eq!(storage.acquire(), Ok(1));

        assert!(storage.ledger.release(0, 10));
        assert_eq!(storage.ledger.len(), 1);
        assert_eq!(storage.ledger.pending(), 1);

        // The id is held, so acquisition fails on capacity rather than
        // running the uniform buffer or descriptor pool dry.
        assert_eq!(storage.acquire(), Err("capacity"));
        assert_eq!(storage.collect(11), 0);
        assert_eq!(storage.collect(12), 0);
        assert_eq!(storage.acquire(), Err("capacity"));

        assert_eq!(storage.collect(13), 1);
        assert_eq!(storage.ledger.pending(), 0);
        assert_eq!(storage.ubo.free_space(), STRIDE);
        assert_eq!(storage.free_sets, FRAMES);

        assert_eq!(storage.acquire(), Ok(0));
        assert_eq!(storage.ledger.get(0).map(|r| r.offset), Some(0));
        assert_eq!(storage.ledger.len(), 2);
    }

    #[test]
    fn churn_within_one_frame_is_bounded_by_capacity() {
        let mut storage = Storage::new(3);
        for _ in 0..3 {
            storage.acquire().unwrap();
        }
        for id in 0..3 {
            assert!(storage.ledger.release(id, 5));
        }
        assert!(!storage.ledger.release(1, 5));
        assert_eq!(storage.acquire(), Err("capacity"));

        assert_eq!(storage.collect(5 + FRAMES as u64 + 1), 3);
        assert_eq!(storage.ubo.free_space(), STRIDE * 3);
        for expected in 0..3 {
            assert_eq!(storage.acquire(), Ok(expected));
        }
    }

    #[test]
    fn flush_reclaims_everything_pending() {
        let mut ledger = InstanceLedger::new(2, FRAMES);
        ledger.insert('a').unwrap();
        ledger.insert('b').unwrap();
        ledger.release(1, 0);

        let mut reclaimed = Vec::new();
        ledger.flush(|value| reclaimed.push(value));
        assert_eq!(reclaimed, vec!['b']);
        assert_eq!(ledger.pending(), 0);
        assert_eq!(ledger.next_id(), Some(1));

        let live: Vec<_> = ledger.drain().collect();
        assert_eq!(live, vec![(0, 'a')]);
        assert!(ledger.is_empty());
    }
}
