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

//! An arena is one independently lockable partition of the pool. It owns a set of chunks
//! chained into utilization bands, plus per-class pools of partially-full subpages, all
//! guarded by a single mutex. Chunk and subpage cross-links are slot indices into the
//! arena's own storage, never references, so the rings carry no ownership.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tracing::debug;

use crate::cache::{BoundCache, CacheEntry};
use crate::chunk::{Chunk, ChunkFree};
use crate::chunk_list::{
    ALLOCATION_ORDER, BAND_COUNT, ChunkList, Q_INIT, Q000, band_name, new_bands,
};
use crate::region::Region;
use crate::size_class::{SizeClasses, SizeFamily, TINY_POOL_COUNT};
use crate::subpage::SubpageRef;
use crate::{BufKind, MAX_BUFFER_CAPACITY, PoolError, PooledBuf};

/// Counters and band occupancy for one arena, as observed at a point in time. Counter reads
/// are relaxed and may trail the truth by an update.
#[derive(Clone, Debug, Default)]
pub struct ArenaMetrics {
    pub allocations_tiny: u64,
    pub allocations_small: u64,
    pub allocations_normal: u64,
    pub allocations_huge: u64,
    pub deallocations_tiny: u64,
    pub deallocations_small: u64,
    pub deallocations_normal: u64,
    pub deallocations_huge: u64,
    pub thread_caches: usize,
    /// Usage percentage of every chunk, grouped by utilization band.
    pub band_occupancy: Vec<(&'static str, Vec<i32>)>,
}

/// A list head for the circular chain of partially-full subpages of one class. `None` link
/// ends mean the sentinel itself.
#[derive(Default)]
struct PoolHead {
    next: Option<SubpageRef>,
    prev: Option<SubpageRef>,
}

struct ArenaInner {
    chunks: Vec<Option<Chunk>>,
    free_slots: Vec<u32>,
    bands: [ChunkList; BAND_COUNT],
    tiny_pools: Vec<PoolHead>,
    small_pools: Vec<PoolHead>,
}

pub struct Arena {
    pub id: u32,
    pub kind: BufKind,
    pub classes: SizeClasses,
    inner: Mutex<ArenaInner>,
    /// Live thread caches bound to this arena, used to spread threads across arenas.
    pub num_thread_caches: AtomicUsize,

    allocations_tiny: AtomicU64,
    allocations_small: AtomicU64,
    allocations_normal: AtomicU64,
    allocations_huge: AtomicU64,
    deallocations_tiny: AtomicU64,
    deallocations_small: AtomicU64,
    deallocations_normal: AtomicU64,
    deallocations_huge: AtomicU64,
}

impl Arena {
    pub fn new(id: u32, kind: BufKind, classes: SizeClasses) -> Self {
        let small_pools = (0..classes.small_pool_count())
            .map(|_| PoolHead::default())
            .collect();
        Self {
            id,
            kind,
            classes,
            inner: Mutex::new(ArenaInner {
                chunks: vec![],
                free_slots: vec![],
                bands: new_bands(),
                tiny_pools: (0..TINY_POOL_COUNT).map(|_| PoolHead::default()).collect(),
                small_pools,
            }),
            num_thread_caches: AtomicUsize::new(0),
            allocations_tiny: AtomicU64::new(0),
            allocations_small: AtomicU64::new(0),
            allocations_normal: AtomicU64::new(0),
            allocations_huge: AtomicU64::new(0),
            deallocations_tiny: AtomicU64::new(0),
            deallocations_small: AtomicU64::new(0),
            deallocations_normal: AtomicU64::new(0),
            deallocations_huge: AtomicU64::new(0),
        }
    }

    /// Serve an allocation, trying the caller's thread cache before touching the lock.
    pub fn allocate(
        &self,
        mut cache: Option<&mut BoundCache>,
        req_capacity: usize,
        max_capacity: usize,
    ) -> Result<PooledBuf, PoolError> {
        if req_capacity > max_capacity || max_capacity > MAX_BUFFER_CAPACITY {
            return Err(PoolError::CapacityInvalid {
                requested: req_capacity,
                maximum: max_capacity,
            });
        }
        let norm = self.classes.normalize(req_capacity);
        if norm == 0 {
            return Ok(PooledBuf::empty(self.kind));
        }
        let family = self.classes.family(norm);
        match family {
            SizeFamily::Tiny | SizeFamily::Small => {
                // A cache hit resurrects an entry the arena still considers allocated, so
                // the arena counters stay untouched.
                if let Some(c) = cache.as_deref_mut()
                    && let Some(entry) = c.pop(norm)
                {
                    return Ok(self.buf_from_entry(entry, req_capacity));
                }
                let idx = match family {
                    SizeFamily::Tiny => SizeClasses::tiny_idx(norm),
                    _ => SizeClasses::small_idx(norm),
                };
                let mut inner = self.inner.lock().unwrap();
                let (cid, handle) = self.allocate_subpage_class(&mut inner, family, idx, norm)?;
                let buf = self.make_buf(&inner, cid, handle, req_capacity);
                drop(inner);
                self.count_alloc(family);
                Ok(buf)
            }
            SizeFamily::Normal => {
                if let Some(c) = cache.as_deref_mut()
                    && let Some(entry) = c.pop(norm)
                {
                    return Ok(self.buf_from_entry(entry, req_capacity));
                }
                let depth = self.classes.depth_for(norm);
                debug_assert_eq!(self.classes.run_size(depth), norm);
                let mut inner = self.inner.lock().unwrap();
                let (cid, handle) =
                    self.allocate_with_growth(&mut inner, |c| c.allocate_run(depth))?;
                inner.reband_after_alloc(cid);
                let buf = self.make_buf(&inner, cid, handle, req_capacity);
                drop(inner);
                self.count_alloc(family);
                Ok(buf)
            }
            SizeFamily::Huge => {
                // Huge allocations bypass pooling: one exactly-sized region, gone again on
                // free.
                let region = self.new_region(norm)?;
                let mut inner = self.inner.lock().unwrap();
                let cid = inner.insert_chunk(Chunk::unpooled(region));
                let data = inner.chunk(cid).region.base_ptr();
                drop(inner);
                self.count_alloc(family);
                Ok(PooledBuf {
                    kind: self.kind,
                    arena: self.id,
                    chunk: cid,
                    handle: 0,
                    offset: 0,
                    length: req_capacity,
                    max_length: norm,
                    data,
                    pool: 0,
                })
            }
        }
    }

    /// Return an allocation. Pooled frees are deferred into the thread cache when one is
    /// offered and has room; everything else goes to the chunk under the lock.
    pub fn free(
        &self,
        chunk: u32,
        handle: u64,
        offset: usize,
        norm: usize,
        data: *mut u8,
        cache: Option<&mut BoundCache>,
    ) -> Result<(), PoolError> {
        if norm > self.classes.chunk_size {
            let mut inner = self.inner.lock().unwrap();
            let unpooled = inner
                .chunks
                .get(chunk as usize)
                .and_then(|s| s.as_ref())
                .map(|c| c.unpooled);
            match unpooled {
                Some(true) => {
                    let unpooled_chunk = inner.remove_chunk(chunk);
                    drop(inner);
                    drop(unpooled_chunk);
                    self.count_dealloc(SizeFamily::Huge);
                    Ok(())
                }
                _ => Err(PoolError::HandleInvalid(handle)),
            }
        } else {
            if let Some(c) = cache
                && c.push(CacheEntry {
                    chunk,
                    handle,
                    offset,
                    norm,
                    data,
                })
            {
                return Ok(());
            }
            self.free_to_arena(chunk, handle, norm)
        }
    }

    /// The non-deferred free path, also used when cache entries are evicted or drained.
    pub fn free_to_arena(&self, chunk: u32, handle: u64, norm: usize) -> Result<(), PoolError> {
        let detached = {
            let mut inner = self.inner.lock().unwrap();
            self.free_handle_locked(&mut inner, chunk, handle)?
        };
        // An emptied entry-band chunk comes back detached so its region is unmapped out
        // here, after the lock is gone.
        drop(detached);
        self.count_dealloc(self.classes.family(norm));
        Ok(())
    }

    pub fn used_bytes(&self) -> i64 {
        let inner = self.inner.lock().unwrap();
        let mut total: i64 = 0;
        for c in inner.chunks.iter().flatten() {
            total = total.saturating_add(c.used_bytes() as i64);
        }
        total
    }

    pub fn metrics(&self) -> ArenaMetrics {
        let inner = self.inner.lock().unwrap();
        let mut band_occupancy = Vec::with_capacity(BAND_COUNT);
        for band in 0..BAND_COUNT {
            let mut usages = vec![];
            let mut cur = inner.bands[band].head;
            while let Some(cid) = cur {
                let c = inner.chunk(cid);
                usages.push(c.usage());
                cur = c.next;
            }
            band_occupancy.push((band_name(band), usages));
        }
        ArenaMetrics {
            allocations_tiny: self.allocations_tiny.load(Ordering::Relaxed),
            allocations_small: self.allocations_small.load(Ordering::Relaxed),
            allocations_normal: self.allocations_normal.load(Ordering::Relaxed),
            allocations_huge: self.allocations_huge.load(Ordering::Relaxed),
            deallocations_tiny: self.deallocations_tiny.load(Ordering::Relaxed),
            deallocations_small: self.deallocations_small.load(Ordering::Relaxed),
            deallocations_normal: self.deallocations_normal.load(Ordering::Relaxed),
            deallocations_huge: self.deallocations_huge.load(Ordering::Relaxed),
            thread_caches: self.num_thread_caches.load(Ordering::Relaxed),
            band_occupancy,
        }
    }

    fn new_region(&self, len: usize) -> Result<Region, PoolError> {
        match self.kind {
            BufKind::Heap => Ok(Region::heap(len)),
            BufKind::Direct => Region::direct_anon(len),
        }
    }

    fn new_chunk(&self) -> Result<Chunk, PoolError> {
        let region = self.new_region(self.classes.chunk_size)?;
        debug!(
            arena = self.id,
            size = self.classes.chunk_size,
            "created chunk"
        );
        Ok(Chunk::pooled(
            region,
            self.classes.page_size,
            self.classes.max_order,
        ))
    }

    /// Walk the bands in allocation order; grow by one chunk only when nothing can serve the
    /// request.
    fn allocate_with_growth<F>(
        &self,
        inner: &mut ArenaInner,
        mut f: F,
    ) -> Result<(u32, u64), PoolError>
    where
        F: FnMut(&mut Chunk) -> Option<u64>,
    {
        for band in ALLOCATION_ORDER {
            let mut cur = inner.bands[band].head;
            while let Some(cid) = cur {
                let chunk = inner.chunk_mut(cid);
                let next = chunk.next;
                if let Some(handle) = f(chunk) {
                    return Ok((cid, handle));
                }
                cur = next;
            }
        }
        let chunk = self.new_chunk()?;
        let cid = inner.insert_chunk(chunk);
        inner.band_push(Q_INIT, cid);
        match f(inner.chunk_mut(cid)) {
            Some(handle) => Ok((cid, handle)),
            None => unreachable!("fresh chunk cannot satisfy allocation"),
        }
    }

    fn allocate_subpage_class(
        &self,
        inner: &mut ArenaInner,
        family: SizeFamily,
        idx: usize,
        norm: usize,
    ) -> Result<(u32, u64), PoolError> {
        // The head of the class pool, when there is one, always has room. Full subpages are
        // unlinked the moment they fill.
        if let Some(r) = inner.pool_head(family, idx).next {
            if let Some(handle) = inner.chunk_mut(r.chunk).allocate_in_subpage(r.page as usize) {
                let now_full = inner.chunk(r.chunk).subpages[r.page as usize]
                    .as_ref()
                    .is_some_and(|s| s.is_full());
                if now_full {
                    inner.pool_unlink(family, idx, r);
                }
                return Ok((r.chunk, handle));
            }
            debug_assert!(false, "full subpage linked in class pool");
        }
        let (cid, handle) = self.allocate_with_growth(inner, |c| c.allocate_subpage(norm))?;
        inner.reband_after_alloc(cid);
        let page = inner.chunk(cid).page_of(handle);
        let now_full = inner.chunk(cid).subpages[page]
            .as_ref()
            .is_some_and(|s| s.is_full());
        if !now_full {
            inner.pool_link_head(
                family,
                idx,
                SubpageRef {
                    chunk: cid,
                    page: page as u32,
                },
            );
        }
        Ok((cid, handle))
    }

    /// Releases a handle into its chunk and maintains the class pools and bands. When the
    /// chunk empties out of the entry band it is detached and handed back; the caller drops
    /// it (and unmaps its region) once the lock is released.
    fn free_handle_locked(
        &self,
        inner: &mut ArenaInner,
        cid: u32,
        handle: u64,
    ) -> Result<Option<Chunk>, PoolError> {
        let outcome = {
            let chunk = inner
                .chunks
                .get_mut(cid as usize)
                .and_then(|s| s.as_mut())
                .ok_or(PoolError::HandleInvalid(handle))?;
            if chunk.unpooled {
                return Err(PoolError::HandleInvalid(handle));
            }
            chunk.free(handle)?
        };
        match outcome {
            ChunkFree::Run { .. } => {
                if inner.reband_after_free(cid) {
                    return Ok(Some(self.detach_chunk(inner, cid)));
                }
            }
            ChunkFree::Subpage {
                page,
                was_full,
                now_empty,
            } => {
                let (elem, was_pooled) = match inner.chunk(cid).subpages[page].as_ref() {
                    Some(s) => (s.elem_size, s.pooled),
                    None => return Err(PoolError::HandleInvalid(handle)),
                };
                let (family, idx) = pool_slot(elem);
                let r = SubpageRef {
                    chunk: cid,
                    page: page as u32,
                };
                if now_empty {
                    if was_pooled {
                        inner.pool_unlink(family, idx, r);
                    }
                    inner.chunk_mut(cid).release_subpage(page);
                    if inner.reband_after_free(cid) {
                        return Ok(Some(self.detach_chunk(inner, cid)));
                    }
                } else if was_full {
                    // First slot back after being full: rejoin the class pool at the head.
                    inner.pool_link_head(family, idx, r);
                }
            }
        }
        Ok(None)
    }

    fn detach_chunk(&self, inner: &mut ArenaInner, cid: u32) -> Chunk {
        inner.band_remove(cid);
        let chunk = inner.remove_chunk(cid);
        debug!(arena = self.id, chunk = cid, "destroying empty chunk");
        chunk
    }

    fn make_buf(&self, inner: &ArenaInner, cid: u32, handle: u64, req_capacity: usize) -> PooledBuf {
        let chunk = inner.chunk(cid);
        let offset = chunk.data_offset(handle);
        let max_length = chunk.max_length(handle);
        let data = unsafe { chunk.region.base_ptr().add(offset) };
        PooledBuf {
            kind: self.kind,
            arena: self.id,
            chunk: cid,
            handle,
            offset,
            length: req_capacity,
            max_length,
            data,
            pool: 0,
        }
    }

    fn buf_from_entry(&self, entry: CacheEntry, req_capacity: usize) -> PooledBuf {
        PooledBuf {
            kind: self.kind,
            arena: self.id,
            chunk: entry.chunk,
            handle: entry.handle,
            offset: entry.offset,
            length: req_capacity,
            max_length: entry.norm,
            data: entry.data,
            pool: 0,
        }
    }

    fn count_alloc(&self, family: SizeFamily) {
        let counter = match family {
            SizeFamily::Tiny => &self.allocations_tiny,
            SizeFamily::Small => &self.allocations_small,
            SizeFamily::Normal => &self.allocations_normal,
            SizeFamily::Huge => &self.allocations_huge,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn count_dealloc(&self, family: SizeFamily) {
        let counter = match family {
            SizeFamily::Tiny => &self.deallocations_tiny,
            SizeFamily::Small => &self.deallocations_small,
            SizeFamily::Normal => &self.deallocations_normal,
            SizeFamily::Huge => &self.deallocations_huge,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub fn chunk_count(&self) -> usize {
        self.inner.lock().unwrap().chunks.iter().flatten().count()
    }

    #[cfg(test)]
    pub fn band_of(&self, cid: u32) -> Option<usize> {
        let inner = self.inner.lock().unwrap();
        inner
            .chunks
            .get(cid as usize)
            .and_then(|s| s.as_ref())
            .map(|c| c.band)
    }

    #[cfg(test)]
    pub fn assert_consistent(&self) {
        let inner = self.inner.lock().unwrap();
        for c in inner.chunks.iter().flatten() {
            if !c.unpooled {
                c.assert_tree_consistent();
                c.assert_subpage_bookkeeping();
            }
        }
    }
}

fn pool_slot(elem_size: usize) -> (SizeFamily, usize) {
    if elem_size < crate::size_class::SMALL_MIN_CAPACITY {
        (SizeFamily::Tiny, SizeClasses::tiny_idx(elem_size))
    } else {
        (SizeFamily::Small, SizeClasses::small_idx(elem_size))
    }
}

impl ArenaInner {
    fn chunk(&self, cid: u32) -> &Chunk {
        self.chunks[cid as usize].as_ref().unwrap()
    }

    fn chunk_mut(&mut self, cid: u32) -> &mut Chunk {
        self.chunks[cid as usize].as_mut().unwrap()
    }

    fn insert_chunk(&mut self, chunk: Chunk) -> u32 {
        match self.free_slots.pop() {
            Some(cid) => {
                self.chunks[cid as usize] = Some(chunk);
                cid
            }
            None => {
                self.chunks.push(Some(chunk));
                (self.chunks.len() - 1) as u32
            }
        }
    }

    fn remove_chunk(&mut self, cid: u32) -> Chunk {
        let chunk = self.chunks[cid as usize].take().unwrap();
        self.free_slots.push(cid);
        chunk
    }

    fn band_push(&mut self, band: usize, cid: u32) {
        let old_head = self.bands[band].head;
        {
            let c = self.chunk_mut(cid);
            c.prev = None;
            c.next = old_head;
            c.band = band;
        }
        if let Some(o) = old_head {
            self.chunk_mut(o).prev = Some(cid);
        }
        self.bands[band].head = Some(cid);
    }

    fn band_remove(&mut self, cid: u32) {
        let (prev, next, band) = {
            let c = self.chunk_mut(cid);
            let links = (c.prev, c.next, c.band);
            c.prev = None;
            c.next = None;
            links
        };
        match prev {
            Some(p) => self.chunk_mut(p).next = next,
            None => self.bands[band].head = next,
        }
        if let Some(n) = next {
            self.chunk_mut(n).prev = prev;
        }
    }

    /// Move a chunk up through the bands after its usage grew.
    fn reband_after_alloc(&mut self, cid: u32) {
        loop {
            let (usage, band) = {
                let c = self.chunk(cid);
                (c.usage(), c.band)
            };
            if band + 1 < BAND_COUNT && usage >= self.bands[band].max_usage {
                self.band_remove(cid);
                self.band_push(band + 1, cid);
            } else {
                return;
            }
        }
    }

    /// Move a chunk down after a free. Returns true when the chunk should be destroyed: it
    /// emptied without ever leaving the entry band. Graduated chunks stop at q000 and are
    /// kept for reuse.
    fn reband_after_free(&mut self, cid: u32) -> bool {
        loop {
            let (usage, band, unused) = {
                let c = self.chunk(cid);
                (c.usage(), c.band, c.is_unused())
            };
            if band == Q_INIT {
                return unused;
            }
            if band > Q000 && usage < self.bands[band].min_usage {
                self.band_remove(cid);
                self.band_push(band - 1, cid);
                continue;
            }
            return false;
        }
    }

    fn pool_head(&mut self, family: SizeFamily, idx: usize) -> &mut PoolHead {
        match family {
            SizeFamily::Tiny => &mut self.tiny_pools[idx],
            SizeFamily::Small => &mut self.small_pools[idx],
            _ => unreachable!("no subpage pool for {family:?}"),
        }
    }

    fn subpage_mut(&mut self, r: SubpageRef) -> &mut crate::subpage::Subpage {
        self.chunk_mut(r.chunk).subpages[r.page as usize]
            .as_mut()
            .unwrap()
    }

    /// Insert a subpage right after the class head sentinel.
    fn pool_link_head(&mut self, family: SizeFamily, idx: usize, r: SubpageRef) {
        let old_first = self.pool_head(family, idx).next;
        {
            let s = self.subpage_mut(r);
            s.prev = None;
            s.next = old_first;
            s.pooled = true;
        }
        match old_first {
            Some(o) => self.subpage_mut(o).prev = Some(r),
            None => self.pool_head(family, idx).prev = Some(r),
        }
        self.pool_head(family, idx).next = Some(r);
    }

    fn pool_unlink(&mut self, family: SizeFamily, idx: usize, r: SubpageRef) {
        let (prev, next) = {
            let s = self.subpage_mut(r);
            let links = (s.prev, s.next);
            s.prev = None;
            s.next = None;
            s.pooled = false;
            links
        };
        match prev {
            Some(p) => self.subpage_mut(p).next = next,
            None => self.pool_head(family, idx).next = next,
        }
        match next {
            Some(n) => self.subpage_mut(n).prev = prev,
            None => self.pool_head(family, idx).prev = prev,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::arena::Arena;
    use crate::chunk_list::{Q_INIT, Q000, Q025, Q050, Q075, Q100};
    use crate::size_class::SizeClasses;
    use crate::{BufKind, MAX_BUFFER_CAPACITY, PoolError, PooledBuf};

    const PAGE: usize = 8192;
    const ORDER: u32 = 11;
    const CHUNK: usize = PAGE << ORDER;
    const MB: usize = 1 << 20;

    fn arena() -> Arena {
        Arena::new(0, BufKind::Heap, SizeClasses::new(PAGE, ORDER, 0))
    }

    fn alloc(a: &Arena, req: usize) -> PooledBuf {
        a.allocate(None, req, MAX_BUFFER_CAPACITY).unwrap()
    }

    fn release(a: &Arena, buf: PooledBuf) {
        a.free(buf.chunk, buf.handle, buf.offset, buf.max_length, buf.data, None)
            .unwrap();
    }

    #[test]
    fn capacity_validation() {
        let a = arena();
        assert!(matches!(
            a.allocate(None, 100, 50),
            Err(PoolError::CapacityInvalid { .. })
        ));
        assert!(matches!(
            a.allocate(None, 1, MAX_BUFFER_CAPACITY + 1),
            Err(PoolError::CapacityInvalid { .. })
        ));
    }

    #[test]
    fn zero_capacity_is_the_empty_buffer() {
        let a = arena();
        let buf = alloc(&a, 0);
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.capacity(), 0);
        assert!(buf.as_slice().is_empty());
        // No chunk was created and nothing was accounted.
        assert_eq!(a.chunk_count(), 0);
        assert_eq!(a.used_bytes(), 0);
    }

    #[test]
    fn tiny_round_trip_shares_a_subpage() {
        let a = arena();
        // 17 normalizes to the 32-byte class.
        let first = alloc(&a, 17);
        let second = alloc(&a, 17);
        assert_eq!(first.capacity(), 32);
        assert_eq!(second.capacity(), 32);
        assert_eq!(first.chunk, second.chunk);
        // Same page, different slots.
        assert_eq!(first.offset / PAGE, second.offset / PAGE);
        assert_ne!(first.offset, second.offset);
        a.assert_consistent();

        release(&a, first);
        release(&a, second);
        // The subpage emptied, the page went back, and the never-graduated chunk was
        // destroyed outright.
        assert_eq!(a.used_bytes(), 0);
        assert_eq!(a.chunk_count(), 0);
    }

    #[test]
    fn small_class_exhaustion_pins_a_second_page() {
        let a = arena();
        let mut first_page = vec![];
        for _ in 0..16 {
            first_page.push(alloc(&a, 512));
        }
        // All sixteen share one page.
        let page_of = |b: &PooledBuf| b.offset / PAGE;
        assert!(first_page.iter().all(|b| page_of(b) == page_of(&first_page[0])));

        // The page is full and out of the pool, so the 17th pins a fresh page.
        let seventeenth = alloc(&a, 512);
        assert_ne!(page_of(&seventeenth), page_of(&first_page[0]));

        // Freeing one slot relinks the first subpage at the head, and the next allocation
        // comes from it.
        let freed = first_page.pop().unwrap();
        let freed_offset = freed.offset;
        release(&a, freed);
        let eighteenth = alloc(&a, 512);
        assert_eq!(eighteenth.offset, freed_offset);
        a.assert_consistent();

        release(&a, seventeenth);
        release(&a, eighteenth);
        for b in first_page {
            release(&a, b);
        }
        assert_eq!(a.used_bytes(), 0);
    }

    #[test]
    fn half_chunk_runs_pack_then_grow() {
        let a = arena();
        let first = alloc(&a, 8 * MB);
        let second = alloc(&a, 8 * MB);
        assert_eq!(first.chunk, second.chunk);
        let third = alloc(&a, 8 * MB);
        assert_ne!(third.chunk, first.chunk);
        assert_eq!(a.chunk_count(), 2);

        release(&a, first);
        release(&a, second);
        release(&a, third);
        assert_eq!(a.used_bytes(), 0);
        // Both chunks graduated out of the entry band, so they are kept for reuse in q000.
        assert_eq!(a.chunk_count(), 2);
        a.assert_consistent();
    }

    #[test]
    fn utilization_band_migration() {
        let a = arena();
        let b1 = alloc(&a, 4 * MB);
        let cid = b1.chunk;
        assert_eq!(a.band_of(cid), Some(Q000));
        let b2 = alloc(&a, 4 * MB);
        assert_eq!(a.band_of(cid), Some(Q025));
        let b3 = alloc(&a, 4 * MB);
        assert_eq!(a.band_of(cid), Some(Q050));
        let b4 = alloc(&a, 4 * MB);
        assert_eq!(a.band_of(cid), Some(Q100));

        release(&a, b4);
        assert_eq!(a.band_of(cid), Some(Q075));
        release(&a, b3);
        assert_eq!(a.band_of(cid), Some(Q050));
        release(&a, b2);
        assert_eq!(a.band_of(cid), Some(Q025));
        release(&a, b1);
        // Fully free but graduated: parked in q000, not destroyed.
        assert_eq!(a.band_of(cid), Some(Q000));
        assert_eq!(a.used_bytes(), 0);
    }

    #[test]
    fn fresh_chunk_empties_from_entry_band_and_dies() {
        let a = arena();
        let buf = alloc(&a, PAGE);
        assert_eq!(a.band_of(buf.chunk), Some(Q_INIT));
        release(&a, buf);
        assert_eq!(a.chunk_count(), 0);
    }

    #[test]
    fn huge_allocations_bypass_the_pool() {
        let a = arena();
        let buf = alloc(&a, 20 * MB);
        assert_eq!(buf.capacity(), 20 * MB);
        assert_eq!(a.used_bytes(), (20 * MB) as i64);
        // No pooled chunk was created for it.
        let m = a.metrics();
        assert_eq!(m.allocations_huge, 1);
        assert!(m.band_occupancy.iter().all(|(_, usages)| usages.is_empty()));

        release(&a, buf);
        assert_eq!(a.used_bytes(), 0);
        assert_eq!(a.chunk_count(), 0);
        assert_eq!(a.metrics().deallocations_huge, 1);
    }

    #[test]
    fn double_free_is_detected() {
        let a = arena();
        let buf = alloc(&a, PAGE);
        let (chunk, handle, norm) = (buf.chunk, buf.handle, buf.max_length);
        release(&a, buf);
        assert!(matches!(
            a.free_to_arena(chunk, handle, norm),
            Err(PoolError::HandleInvalid(_))
        ));
    }

    #[test]
    fn conservation_and_non_overlap_under_churn() {
        use rand::Rng;
        let a = arena();
        let mut rng = rand::rng();
        let mut live: Vec<PooledBuf> = vec![];
        let sizes = [
            1, 16, 17, 100, 496, 512, 513, 2048, 4096, 8192, 10000, 65536, 128 * 1024, MB,
        ];
        for round in 0..2000 {
            if live.is_empty() || rng.random_bool(0.55) {
                let req = sizes[rng.random_range(0..sizes.len())];
                live.push(alloc(&a, req));
            } else {
                let victim = live.swap_remove(rng.random_range(0..live.len()));
                release(&a, victim);
            }
            if round % 200 == 0 {
                check_books(&a, &live);
            }
        }
        check_books(&a, &live);
        for buf in live.drain(..) {
            release(&a, buf);
        }
        assert_eq!(a.used_bytes(), 0);
        a.assert_consistent();
    }

    fn check_books(a: &Arena, live: &[PooledBuf]) {
        a.assert_consistent();
        // Runs and huge buffers count their own capacity; slot buffers pin a whole page
        // each, shared with their page-mates.
        let run_bytes: i64 = live
            .iter()
            .filter(|b| b.capacity() >= PAGE)
            .map(|b| b.capacity() as i64)
            .sum();
        let mut pinned_pages: Vec<(u32, usize)> = live
            .iter()
            .filter(|b| b.capacity() < PAGE)
            .map(|b| (b.chunk, b.offset / PAGE))
            .collect();
        pinned_pages.sort_unstable();
        pinned_pages.dedup();
        let spoken_for = run_bytes + (pinned_pages.len() * PAGE) as i64;
        assert_eq!(a.used_bytes(), spoken_for);
        // No two live buffers in the same chunk may overlap.
        for (i, x) in live.iter().enumerate() {
            for y in &live[i + 1..] {
                if x.chunk == y.chunk {
                    assert!(
                        x.offset + x.capacity() <= y.offset
                            || y.offset + y.capacity() <= x.offset,
                        "overlap: {x:?} vs {y:?}"
                    );
                }
            }
        }
    }
}
