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

//! The pool facade. Owns the arena arrays for both memory families, hands each thread a
//! cache bound to the least-loaded arenas on first touch, and routes allocate and release
//! through the cache fast path. Families configured with zero arenas fall back to one-off
//! unpooled regions.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use human_bytes::human_bytes;
use lazy_static::lazy_static;
use tracing::info;

use crate::arena::{Arena, ArenaMetrics};
use crate::cache::{BoundCache, ThreadCache};
use crate::config::PoolConfig;
use crate::region::Region;
use crate::size_class::SizeClasses;
use crate::{BufKind, MAX_BUFFER_CAPACITY, PoolError, PooledBuf};

/// Arena id carried by buffers served outside any arena.
const FALLBACK_ARENA: u32 = u32::MAX;

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// Each thread's caches, one per pool it has touched. Dropping the map at thread exit
    /// drains every cache back to the owning arenas.
    static THREAD_CACHES: RefCell<HashMap<usize, ThreadCache>> = RefCell::new(HashMap::new());
    /// Set by `pin_thread_cache`, read when a cache is first built for this thread.
    static CACHE_PINNED: Cell<bool> = const { Cell::new(false) };
}

lazy_static! {
    /// Process-wide pool built from the default configuration. Prefer constructing a pool
    /// and passing it through explicitly; this exists for the places where that is
    /// impractical.
    pub static ref DEFAULT: BufferPool =
        BufferPool::new(PoolConfig::default()).expect("default pool configuration is valid");
}

struct FallbackSlot {
    region: Region,
    kind: BufKind,
}

#[derive(Default)]
struct FallbackRegions {
    slots: Vec<Option<FallbackSlot>>,
    free: Vec<u32>,
}

impl FallbackRegions {
    fn insert(&mut self, slot: FallbackSlot) -> u32 {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize] = Some(slot);
                idx
            }
            None => {
                self.slots.push(Some(slot));
                (self.slots.len() - 1) as u32
            }
        }
    }

    fn used_bytes(&self, kind: BufKind) -> i64 {
        self.slots
            .iter()
            .flatten()
            .filter(|s| s.kind == kind)
            .fold(0i64, |acc, s| acc.saturating_add(s.region.len() as i64))
    }
}

pub struct BufferPool {
    id: usize,
    config: PoolConfig,
    heap_arenas: Vec<Arc<Arena>>,
    direct_arenas: Vec<Arc<Arena>>,
    fallback: Mutex<FallbackRegions>,
}

impl BufferPool {
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        let heap_classes = SizeClasses::new(config.page_size, config.max_order, 0);
        let direct_classes = SizeClasses::new(
            config.page_size,
            config.max_order,
            config.direct_memory_cache_alignment,
        );
        let heap_arenas = (0..config.num_heap_arenas)
            .map(|i| Arc::new(Arena::new(i as u32, BufKind::Heap, heap_classes.clone())))
            .collect::<Vec<_>>();
        let direct_arenas = (0..config.num_direct_arenas)
            .map(|i| Arc::new(Arena::new(i as u32, BufKind::Direct, direct_classes.clone())))
            .collect::<Vec<_>>();
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        info!(
            heap_arenas = heap_arenas.len(),
            direct_arenas = direct_arenas.len(),
            chunk_size = config.chunk_size(),
            "created buffer pool"
        );
        Ok(Self {
            id,
            config,
            heap_arenas,
            direct_arenas,
            fallback: Mutex::new(FallbackRegions::default()),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Allocate from the configured default family.
    pub fn buffer(&self, req_capacity: usize, max_capacity: usize) -> Result<PooledBuf, PoolError> {
        let kind = if self.config.prefer_direct {
            BufKind::Direct
        } else {
            BufKind::Heap
        };
        self.allocate(kind, req_capacity, max_capacity)
    }

    pub fn allocate(
        &self,
        kind: BufKind,
        req_capacity: usize,
        max_capacity: usize,
    ) -> Result<PooledBuf, PoolError> {
        let arenas = self.arenas_of(kind);
        if arenas.is_empty() {
            return self.allocate_unpooled(kind, req_capacity, max_capacity);
        }
        self.with_thread_cache(|tc| {
            let mut buf = match tc.bound_mut(kind) {
                Some(bound) => {
                    let arena = bound.arena.clone();
                    arena.allocate(Some(bound), req_capacity, max_capacity)?
                }
                // A cache is always bound when the family has arenas; this is belt and
                // braces for a cache that failed to build.
                None => arenas[0].allocate(None, req_capacity, max_capacity)?,
            };
            buf.pool = self.id;
            Ok(buf)
        })
    }

    /// Hand a buffer back. Consumes it: the memory behind it may be reissued the moment this
    /// returns.
    pub fn release(&self, buf: PooledBuf) -> Result<(), PoolError> {
        if buf.data.is_null() {
            return Ok(());
        }
        if buf.pool != self.id {
            return Err(PoolError::HandleInvalid(buf.handle));
        }
        if buf.arena == FALLBACK_ARENA {
            return self.release_unpooled(&buf);
        }
        let arena = self
            .arenas_of(buf.kind)
            .get(buf.arena as usize)
            .cloned()
            .ok_or(PoolError::HandleInvalid(buf.handle))?;
        self.with_thread_cache(|tc| {
            // Only defer into the cache when this thread is bound to the buffer's own
            // arena; otherwise the free goes straight home.
            let bound = tc.bound_mut(buf.kind).filter(|b| b.arena.id == buf.arena);
            arena.free(buf.chunk, buf.handle, buf.offset, buf.max_length, buf.data, bound)
        })
    }

    /// Flag the current thread as cache-worthy for pools configured with
    /// `use_cache_for_all_threads = false`. Takes effect for caches built after the call.
    pub fn pin_thread_cache() {
        CACHE_PINNED.with(|c| c.set(true));
    }

    /// Drop the current thread's cache for this pool, returning everything it holds to the
    /// owning arenas. A later allocation builds a fresh one.
    pub fn free_thread_cache(&self) {
        THREAD_CACHES.with(|cell| {
            cell.borrow_mut().remove(&self.id);
        });
    }

    pub fn metrics(&self) -> PoolMetrics {
        let fallback = self.fallback.lock().unwrap();
        let sum_used = |arenas: &[Arc<Arena>], kind: BufKind| {
            arenas
                .iter()
                .fold(0i64, |acc, a| acc.saturating_add(a.used_bytes()))
                .saturating_add(fallback.used_bytes(kind))
        };
        PoolMetrics {
            heap_arena_count: self.heap_arenas.len(),
            direct_arena_count: self.direct_arenas.len(),
            thread_cache_count: self
                .heap_arenas
                .iter()
                .chain(self.direct_arenas.iter())
                .map(|a| a.num_thread_caches.load(Ordering::Relaxed))
                .sum(),
            used_heap_bytes: sum_used(&self.heap_arenas, BufKind::Heap),
            used_direct_bytes: sum_used(&self.direct_arenas, BufKind::Direct),
            heap_arenas: self.heap_arenas.iter().map(|a| a.metrics()).collect(),
            direct_arenas: self.direct_arenas.iter().map(|a| a.metrics()).collect(),
        }
    }

    fn arenas_of(&self, kind: BufKind) -> &[Arc<Arena>] {
        match kind {
            BufKind::Heap => &self.heap_arenas,
            BufKind::Direct => &self.direct_arenas,
        }
    }

    fn with_thread_cache<R>(&self, f: impl FnOnce(&mut ThreadCache) -> R) -> R {
        THREAD_CACHES.with(|cell| {
            let mut map = cell.borrow_mut();
            let tc = map
                .entry(self.id)
                .or_insert_with(|| self.new_thread_cache());
            f(tc)
        })
    }

    fn new_thread_cache(&self) -> ThreadCache {
        let entitled =
            self.config.use_cache_for_all_threads || CACHE_PINNED.with(|c| c.get());
        let (tiny, small, normal) = if entitled {
            (
                self.config.tiny_cache_size,
                self.config.small_cache_size,
                self.config.normal_cache_size,
            )
        } else {
            (0, 0, 0)
        };
        let bind = |arenas: &[Arc<Arena>]| {
            least_loaded(arenas).map(|a| {
                BoundCache::new(
                    a,
                    tiny,
                    small,
                    normal,
                    self.config.max_cached_buffer_capacity,
                    self.config.cache_trim_interval,
                )
            })
        };
        ThreadCache {
            heap: bind(&self.heap_arenas),
            direct: bind(&self.direct_arenas),
        }
    }

    fn allocate_unpooled(
        &self,
        kind: BufKind,
        req_capacity: usize,
        max_capacity: usize,
    ) -> Result<PooledBuf, PoolError> {
        if req_capacity > max_capacity || max_capacity > MAX_BUFFER_CAPACITY {
            return Err(PoolError::CapacityInvalid {
                requested: req_capacity,
                maximum: max_capacity,
            });
        }
        if req_capacity == 0 {
            let mut buf = PooledBuf::empty(kind);
            buf.pool = self.id;
            return Ok(buf);
        }
        let region = match kind {
            BufKind::Heap => Region::heap(req_capacity),
            BufKind::Direct => Region::direct_anon(req_capacity)?,
        };
        let mut fallback = self.fallback.lock().unwrap();
        let slot = fallback.insert(FallbackSlot { region, kind });
        let data = fallback.slots[slot as usize]
            .as_ref()
            .map(|s| s.region.base_ptr())
            .unwrap_or(std::ptr::null_mut());
        Ok(PooledBuf {
            kind,
            arena: FALLBACK_ARENA,
            chunk: slot,
            handle: 0,
            offset: 0,
            length: req_capacity,
            max_length: req_capacity,
            data,
            pool: self.id,
        })
    }

    fn release_unpooled(&self, buf: &PooledBuf) -> Result<(), PoolError> {
        let mut fallback = self.fallback.lock().unwrap();
        let slot = fallback
            .slots
            .get_mut(buf.chunk as usize)
            .and_then(|s| s.take())
            .ok_or(PoolError::HandleInvalid(buf.handle))?;
        fallback.free.push(buf.chunk);
        drop(slot);
        Ok(())
    }
}

fn least_loaded(arenas: &[Arc<Arena>]) -> Option<Arc<Arena>> {
    arenas
        .iter()
        .min_by_key(|a| a.num_thread_caches.load(Ordering::Relaxed))
        .cloned()
}

/// A point-in-time view of the pool's arenas and caches.
#[derive(Clone, Debug)]
pub struct PoolMetrics {
    pub heap_arena_count: usize,
    pub direct_arena_count: usize,
    /// Live thread caches across all arenas of the pool.
    pub thread_cache_count: usize,
    /// Bytes held by live buffers and pinned pages, saturating.
    pub used_heap_bytes: i64,
    pub used_direct_bytes: i64,
    pub heap_arenas: Vec<ArenaMetrics>,
    pub direct_arenas: Vec<ArenaMetrics>,
}

impl fmt::Display for PoolMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} heap arenas using {}, {} direct arenas using {}, {} thread caches",
            self.heap_arena_count,
            human_bytes(self.used_heap_bytes as f64),
            self.direct_arena_count,
            human_bytes(self.used_direct_bytes as f64),
            self.thread_cache_count,
        )
    }
}
