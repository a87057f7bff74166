// Copyright (C) 2024 Ryan Daum <ryan.daum@gmail.com>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Per-thread recycle rings. A freed buffer is parked here and handed straight back to the
//! next same-class allocation on the same thread, with no lock taken. Only the owning thread
//! ever touches a ring; frees arriving from other threads go to the arena instead.
//!
//! Rings are bounded, and a periodic trim returns entries beyond the thread's recent working
//! set to the arena, so an idle burst does not squat on chunk space forever.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::arena::Arena;
use crate::size_class::{SizeClasses, SizeFamily, TINY_POOL_COUNT};
use crate::BufKind;

/// A parked free buffer: everything needed to rebuild a live buffer without consulting the
/// arena.
pub struct CacheEntry {
    pub chunk: u32,
    pub handle: u64,
    pub offset: usize,
    pub norm: usize,
    pub data: *mut u8,
}

struct Ring {
    cap: usize,
    entries: VecDeque<CacheEntry>,
    /// Pops since the last trim. Sizes the trim: rings that served fewer allocations than
    /// their capacity give the difference back.
    allocations: u32,
}

impl Ring {
    fn new(cap: usize) -> Self {
        Self {
            cap,
            entries: VecDeque::new(),
            allocations: 0,
        }
    }

    fn pop(&mut self) -> Option<CacheEntry> {
        let entry = self.entries.pop_front();
        if entry.is_some() {
            self.allocations += 1;
        }
        entry
    }

    fn push(&mut self, entry: CacheEntry) -> bool {
        if self.entries.len() >= self.cap {
            return false;
        }
        self.entries.push_back(entry);
        true
    }

    fn trim(&mut self, arena: &Arena) {
        let spare = self.cap.saturating_sub(self.allocations as usize);
        self.allocations = 0;
        for _ in 0..spare.min(self.entries.len()) {
            if let Some(e) = self.entries.pop_front() {
                let result = arena.free_to_arena(e.chunk, e.handle, e.norm);
                debug_assert!(result.is_ok());
            }
        }
    }

    fn drain(&mut self, arena: &Arena) {
        while let Some(e) = self.entries.pop_front() {
            let result = arena.free_to_arena(e.chunk, e.handle, e.norm);
            debug_assert!(result.is_ok());
        }
    }
}

/// The rings one thread holds against one arena. Created when the thread first touches the
/// pool, bound to the least-loaded arena of the family at that moment.
pub struct BoundCache {
    pub arena: Arc<Arena>,
    tiny: Box<[Ring]>,
    small: Box<[Ring]>,
    normal: Box<[Ring]>,
    /// Allocation attempts since the last sweep.
    allocations: u32,
    trim_interval: u32,
}

impl BoundCache {
    pub fn new(
        arena: Arc<Arena>,
        tiny_cache_size: usize,
        small_cache_size: usize,
        normal_cache_size: usize,
        max_cached_buffer_capacity: usize,
        trim_interval: u32,
    ) -> Self {
        arena
            .num_thread_caches
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let classes = &arena.classes;
        let tiny = (0..TINY_POOL_COUNT)
            .map(|_| Ring::new(tiny_cache_size))
            .collect();
        let small = (0..classes.small_pool_count())
            .map(|_| Ring::new(small_cache_size))
            .collect();
        // Rings only exist for normal classes up to the cacheable ceiling; larger classes
        // have no ring at all and always miss.
        let normal_rings = if normal_cache_size > 0 && max_cached_buffer_capacity >= classes.page_size
        {
            let span = max_cached_buffer_capacity / classes.page_size;
            ((usize::BITS - 1 - span.leading_zeros()) as usize + 1)
                .min(classes.max_order as usize + 1)
        } else {
            0
        };
        let normal = (0..normal_rings)
            .map(|_| Ring::new(normal_cache_size))
            .collect();
        Self {
            arena,
            tiny,
            small,
            normal,
            allocations: 0,
            trim_interval,
        }
    }

    fn ring_mut(&mut self, norm: usize) -> Option<&mut Ring> {
        match self.arena.classes.family(norm) {
            SizeFamily::Tiny => self.tiny.get_mut(SizeClasses::tiny_idx(norm)),
            SizeFamily::Small => self.small.get_mut(SizeClasses::small_idx(norm)),
            SizeFamily::Normal => {
                let idx = self.arena.classes.normal_idx(norm);
                self.normal.get_mut(idx)
            }
            SizeFamily::Huge => None,
        }
    }

    /// Try to serve a normalized capacity from the rings. Counts the attempt either way, and
    /// sweeps all rings every `trim_interval` attempts.
    pub fn pop(&mut self, norm: usize) -> Option<CacheEntry> {
        let entry = self.ring_mut(norm).and_then(|r| r.pop());
        self.allocations += 1;
        if self.allocations >= self.trim_interval {
            self.allocations = 0;
            self.trim();
        }
        entry
    }

    /// Park a freed buffer. False means the ring is full (or the class is uncacheable) and
    /// the caller must free through the arena.
    pub fn push(&mut self, entry: CacheEntry) -> bool {
        let norm = entry.norm;
        match self.ring_mut(norm) {
            Some(r) => r.push(entry),
            None => false,
        }
    }

    pub fn trim(&mut self) {
        let arena = self.arena.clone();
        for r in self.tiny.iter_mut() {
            r.trim(&arena);
        }
        for r in self.small.iter_mut() {
            r.trim(&arena);
        }
        for r in self.normal.iter_mut() {
            r.trim(&arena);
        }
    }

    fn drain(&mut self) {
        let arena = self.arena.clone();
        for r in self.tiny.iter_mut() {
            r.drain(&arena);
        }
        for r in self.small.iter_mut() {
            r.drain(&arena);
        }
        for r in self.normal.iter_mut() {
            r.drain(&arena);
        }
    }

    #[cfg(test)]
    pub fn cached_entries(&self) -> usize {
        self.tiny
            .iter()
            .chain(self.small.iter())
            .chain(self.normal.iter())
            .map(|r| r.entries.len())
            .sum()
    }

    #[cfg(test)]
    pub fn normal_ring_count(&self) -> usize {
        self.normal.len()
    }
}

impl Drop for BoundCache {
    fn drop(&mut self) {
        self.drain();
        self.arena
            .num_thread_caches
            .fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
    }
}

/// Everything one thread holds against one pool: a bound cache per configured arena family.
pub struct ThreadCache {
    pub heap: Option<BoundCache>,
    pub direct: Option<BoundCache>,
}

impl ThreadCache {
    pub fn bound_mut(&mut self, kind: BufKind) -> Option<&mut BoundCache> {
        match kind {
            BufKind::Heap => self.heap.as_mut(),
            BufKind::Direct => self.direct.as_mut(),
        }
    }
}
