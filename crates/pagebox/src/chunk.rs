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

//! A chunk is one contiguous backing region subdivided by a binary buddy tree. The tree is
//! laid out as a heap-indexed array: node 1 is the whole chunk, node `2i` and `2i + 1` split
//! node `i` in half, and the leaves are single pages. Each node records the shallowest depth
//! at which its subtree can still satisfy an allocation, so finding a free run of `2^k` pages
//! is one root-to-depth descent.
//!
//! Pages holding a live subpage are parked at the "unusable" depth until the subpage empties.
//!
//! Handles are a packed 64-bit value: the low 32 bits are the tree node index, bits 32..63
//! carry the slot index for subpage handles, and the top bit marks a subpage handle. Callers
//! treat the value as opaque.

use crate::PoolError;
use crate::region::Region;
use crate::subpage::Subpage;

const SUBPAGE_FLAG: u64 = 1 << 63;

pub fn run_handle(id: usize) -> u64 {
    id as u64
}

pub fn subpage_handle(id: usize, bitmap_idx: usize) -> u64 {
    SUBPAGE_FLAG | ((bitmap_idx as u64) << 32) | id as u64
}

pub fn handle_node(handle: u64) -> usize {
    (handle & 0xFFFF_FFFF) as usize
}

pub fn handle_bitmap_idx(handle: u64) -> usize {
    ((handle >> 32) & 0x7FFF_FFFF) as usize
}

pub fn handle_is_subpage(handle: u64) -> bool {
    handle & SUBPAGE_FLAG != 0
}

/// What a free did, so the arena can maintain its class pools and utilization chains.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkFree {
    Run { bytes: usize },
    Subpage { page: usize, was_full: bool, now_empty: bool },
}

pub struct Chunk {
    pub region: Region,
    /// Shallowest allocatable depth per node. Equal to `depth_map` when the subtree is
    /// entirely free, `max_order + 1` when nothing under the node can be allocated.
    memory_map: Vec<u8>,
    /// Each node's own depth. Constant after construction.
    depth_map: Vec<u8>,
    pub subpages: Vec<Option<Subpage>>,
    pub free_bytes: usize,

    page_size: usize,
    chunk_size: usize,
    max_pages: usize,
    unusable: u8,

    /// True for a huge, exactly-sized region with no tree over it.
    pub unpooled: bool,

    // Utilization chain membership, maintained by the owning arena.
    pub prev: Option<u32>,
    pub next: Option<u32>,
    pub band: usize,
}

impl Chunk {
    pub fn pooled(region: Region, page_size: usize, max_order: u32) -> Self {
        let max_pages = 1usize << max_order;
        let chunk_size = page_size << max_order;
        debug_assert_eq!(region.len(), chunk_size);

        let node_count = max_pages * 2;
        let mut depth_map = vec![0u8; node_count];
        for (i, d) in depth_map.iter_mut().enumerate().skip(1) {
            *d = (usize::BITS - 1 - i.leading_zeros()) as u8;
        }
        let memory_map = depth_map.clone();

        Self {
            region,
            memory_map,
            depth_map,
            subpages: (0..max_pages).map(|_| None).collect(),
            free_bytes: chunk_size,
            page_size,
            chunk_size,
            max_pages,
            unusable: (max_order + 1) as u8,
            unpooled: false,
            prev: None,
            next: None,
            band: 0,
        }
    }

    /// A huge allocation's chunk: the region is the allocation.
    pub fn unpooled(region: Region) -> Self {
        Self {
            free_bytes: 0,
            page_size: 0,
            chunk_size: region.len(),
            max_pages: 0,
            unusable: 0,
            unpooled: true,
            memory_map: vec![],
            depth_map: vec![],
            subpages: vec![],
            prev: None,
            next: None,
            band: 0,
            region,
        }
    }

    pub fn is_unused(&self) -> bool {
        self.free_bytes == self.chunk_size
    }

    pub fn used_bytes(&self) -> usize {
        if self.unpooled {
            self.region.len()
        } else {
            self.chunk_size - self.free_bytes
        }
    }

    /// Percentage of the chunk in use, rounded the way the utilization bands expect: a chunk
    /// with any allocation at all reports at least 1, a full one exactly 100.
    pub fn usage(&self) -> i32 {
        if self.free_bytes == 0 {
            return 100;
        }
        let free_pct = (self.free_bytes * 100 / self.chunk_size) as i32;
        if free_pct == 0 { 99 } else { 100 - free_pct }
    }

    /// Claim a free subtree at exactly `depth`.
    pub fn allocate_run(&mut self, depth: u32) -> Option<u64> {
        let id = self.allocate_node(depth)?;
        self.free_bytes -= self.chunk_size >> depth;
        Some(run_handle(id))
    }

    /// Pin a fresh page, install a subpage of `elem_size` slots over it, and take its first
    /// slot.
    pub fn allocate_subpage(&mut self, elem_size: usize) -> Option<u64> {
        let id = self.allocate_node(self.max_pages.trailing_zeros())?;
        self.free_bytes -= self.page_size;
        let page = id - self.max_pages;
        let mut sub = Subpage::new(elem_size, self.page_size);
        let bitmap_idx = match sub.allocate() {
            Some(idx) => idx,
            None => unreachable!("fresh subpage has no free slot"),
        };
        self.subpages[page] = Some(sub);
        Some(subpage_handle(id, bitmap_idx))
    }

    /// Take another slot from a subpage this chunk already holds.
    pub fn allocate_in_subpage(&mut self, page: usize) -> Option<u64> {
        let sub = self.subpages.get_mut(page)?.as_mut()?;
        let bitmap_idx = sub.allocate()?;
        Some(subpage_handle(self.max_pages + page, bitmap_idx))
    }

    /// Release whatever the handle refers to. Subpage handles only touch the bitmap; the
    /// caller decides when an emptied subpage's page goes back to the tree, since the class
    /// pool links have to be unhooked first.
    pub fn free(&mut self, handle: u64) -> Result<ChunkFree, PoolError> {
        let id = handle_node(handle);
        if id < 1 || id >= self.max_pages * 2 {
            return Err(PoolError::HandleInvalid(handle));
        }
        if handle_is_subpage(handle) {
            if id < self.max_pages {
                return Err(PoolError::HandleInvalid(handle));
            }
            let page = id - self.max_pages;
            let sub = self.subpages[page]
                .as_mut()
                .ok_or(PoolError::HandleInvalid(handle))?;
            let was_full = sub.is_full();
            let still_in_use = sub
                .free(handle_bitmap_idx(handle))
                .ok_or(PoolError::HandleInvalid(handle))?;
            Ok(ChunkFree::Subpage {
                page,
                was_full,
                now_empty: !still_in_use,
            })
        } else {
            if self.memory_map[id] != self.unusable {
                return Err(PoolError::HandleInvalid(handle));
            }
            if id >= self.max_pages && self.subpages[id - self.max_pages].is_some() {
                // That leaf belongs to a subpage, not a run.
                return Err(PoolError::HandleInvalid(handle));
            }
            let bytes = self.chunk_size >> self.depth_map[id];
            let offset = self.run_offset(id);
            self.free_node(id);
            self.free_bytes += bytes;
            self.region.decommit(offset, bytes);
            Ok(ChunkFree::Run { bytes })
        }
    }

    /// Drop an emptied subpage and return its page to the tree.
    pub fn release_subpage(&mut self, page: usize) {
        debug_assert!(matches!(&self.subpages[page], Some(s) if s.is_empty()));
        self.subpages[page] = None;
        let id = self.max_pages + page;
        self.free_node(id);
        self.free_bytes += self.page_size;
        self.region.decommit(self.run_offset(id), self.page_size);
    }

    /// Byte offset of the allocation a handle refers to.
    pub fn data_offset(&self, handle: u64) -> usize {
        let id = handle_node(handle);
        let offset = self.run_offset(id);
        if handle_is_subpage(handle) {
            let elem = self.subpages[id - self.max_pages]
                .as_ref()
                .map(|s| s.elem_size)
                .unwrap_or(0);
            offset + handle_bitmap_idx(handle) * elem
        } else {
            offset
        }
    }

    /// Allocated capacity behind a handle.
    pub fn max_length(&self, handle: u64) -> usize {
        let id = handle_node(handle);
        if handle_is_subpage(handle) {
            self.subpages[id - self.max_pages]
                .as_ref()
                .map(|s| s.elem_size)
                .unwrap_or(0)
        } else {
            self.chunk_size >> self.depth_map[id]
        }
    }

    pub fn page_of(&self, handle: u64) -> usize {
        handle_node(handle) - self.max_pages
    }

    fn run_offset(&self, id: usize) -> usize {
        let depth = self.depth_map[id] as u32;
        let shift = id ^ (1usize << depth);
        shift * (self.chunk_size >> depth)
    }

    /// Root-to-depth descent for the first free subtree at exactly `depth`, left child first.
    fn allocate_node(&mut self, depth: u32) -> Option<usize> {
        debug_assert!(!self.unpooled);
        if self.memory_map[1] > depth as u8 {
            return None;
        }
        let mut id = 1usize;
        for _ in 0..depth {
            id <<= 1;
            if self.memory_map[id] > depth as u8 {
                id ^= 1;
            }
        }
        debug_assert_eq!(self.memory_map[id], self.depth_map[id]);
        self.memory_map[id] = self.unusable;
        self.update_parents_alloc(id);
        Some(id)
    }

    fn update_parents_alloc(&mut self, mut id: usize) {
        while id > 1 {
            let parent = id >> 1;
            self.memory_map[parent] = self.memory_map[id].min(self.memory_map[id ^ 1]);
            id = parent;
        }
    }

    /// Mark a node free again and propagate upward, merging buddies: two entirely-free
    /// children make the parent entirely free. Stops early once nothing changes.
    fn free_node(&mut self, id: usize) {
        self.memory_map[id] = self.depth_map[id];
        let mut id = id;
        while id > 1 {
            let parent = id >> 1;
            let child_depth = self.depth_map[id];
            let v1 = self.memory_map[id];
            let v2 = self.memory_map[id ^ 1];
            let merged = if v1 == child_depth && v2 == child_depth {
                child_depth - 1
            } else {
                v1.min(v2)
            };
            if self.memory_map[parent] == merged {
                break;
            }
            self.memory_map[parent] = merged;
            id = parent;
        }
    }

    #[cfg(test)]
    pub fn map_value(&self, id: usize) -> u8 {
        self.memory_map[id]
    }

    #[cfg(test)]
    pub fn depth_value(&self, id: usize) -> u8 {
        self.depth_map[id]
    }

    /// Every internal node must either be the allocated unit itself (or fully allocated
    /// below), the min of its children, or an entirely-free merge of two entirely-free
    /// children.
    #[cfg(test)]
    pub fn assert_tree_consistent(&self) {
        for i in 1..self.max_pages {
            let v = self.memory_map[i];
            let d = self.depth_map[i];
            let l = self.memory_map[2 * i];
            let r = self.memory_map[2 * i + 1];
            let child_depth = d + 1;
            let ok = v == l.min(r)
                || v == self.unusable
                || (l == child_depth && r == child_depth && v == d);
            assert!(ok, "node {i}: v={v} d={d} l={l} r={r}");
        }
    }

    /// An installed subpage must still hold live slots and pin its leaf at the unusable
    /// depth; emptied subpages are removed and their leaf restored before anyone can
    /// observe them.
    #[cfg(test)]
    pub fn assert_subpage_bookkeeping(&self) {
        for (page, slot) in self.subpages.iter().enumerate() {
            if let Some(s) = slot {
                assert!(!s.is_empty(), "empty subpage left installed at page {page}");
                assert_eq!(
                    self.memory_map[self.max_pages + page],
                    self.unusable,
                    "leaf for live subpage at page {page} is not pinned"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::chunk::{Chunk, ChunkFree, handle_is_subpage, handle_node};
    use crate::region::Region;

    const PAGE: usize = 8192;
    const ORDER: u32 = 11;
    const CHUNK: usize = PAGE << ORDER;

    fn chunk() -> Chunk {
        Chunk::pooled(Region::heap(CHUNK), PAGE, ORDER)
    }

    #[test]
    fn handle_packing_round_trips() {
        use crate::chunk::{handle_bitmap_idx, run_handle, subpage_handle};
        let h = subpage_handle(2048 + 17, 93);
        assert!(handle_is_subpage(h));
        assert_eq!(handle_node(h), 2048 + 17);
        assert_eq!(handle_bitmap_idx(h), 93);
        let h = run_handle(3);
        assert!(!handle_is_subpage(h));
        assert_eq!(handle_node(h), 3);
    }

    #[test]
    fn two_half_chunk_runs_fill_the_chunk() {
        let mut c = chunk();
        let a = c.allocate_run(1).unwrap();
        let b = c.allocate_run(1).unwrap();
        // The two children of the root, in address order.
        assert_eq!(handle_node(a), 2);
        assert_eq!(handle_node(b), 3);
        assert_eq!(c.data_offset(a), 0);
        assert_eq!(c.data_offset(b), CHUNK / 2);
        assert_eq!(c.free_bytes, 0);
        assert_eq!(c.allocate_run(1), None);
        assert_eq!(c.allocate_run(ORDER), None);

        c.free(a).unwrap();
        c.free(b).unwrap();
        assert_eq!(c.free_bytes, CHUNK);
        c.assert_tree_consistent();
    }

    #[test]
    fn allocation_marks_and_free_restores_the_tree() {
        let mut c = chunk();
        // A quarter-chunk run sits at depth 2.
        let h = c.allocate_run(2).unwrap();
        let id = handle_node(h);
        assert_eq!(c.depth_value(id), 2);
        assert_eq!(c.map_value(id), (ORDER + 1) as u8);
        // Parent now reports the sibling's depth as its shallowest free subtree.
        let parent = id >> 1;
        assert_eq!(c.map_value(parent), c.depth_value(id ^ 1));
        c.assert_tree_consistent();

        c.free(h).unwrap();
        assert_eq!(c.map_value(id), 2);
        assert_eq!(c.map_value(parent), c.depth_value(parent));
        assert_eq!(c.map_value(1), 0);
        c.assert_tree_consistent();
    }

    #[test]
    fn buddy_merge_restores_ancestors() {
        let mut c = chunk();
        let a = c.allocate_run(ORDER).unwrap();
        let b = c.allocate_run(ORDER).unwrap();
        // Sibling leaves.
        assert_eq!(handle_node(a) ^ 1, handle_node(b));
        c.free(a).unwrap();
        c.free(b).unwrap();
        assert_eq!(c.map_value(1), 0);
        assert_eq!(c.free_bytes, CHUNK);
        c.assert_tree_consistent();
    }

    #[test]
    fn left_first_descent_preserves_address_order() {
        let mut c = chunk();
        let mut last = None;
        for _ in 0..8 {
            let h = c.allocate_run(ORDER).unwrap();
            let offset = c.data_offset(h);
            if let Some(prev) = last {
                assert!(offset > prev);
            }
            last = Some(offset);
        }
    }

    #[test]
    fn subpage_lifecycle_through_the_chunk() {
        let mut c = chunk();
        let h = c.allocate_subpage(512).unwrap();
        assert!(handle_is_subpage(h));
        assert_eq!(c.free_bytes, CHUNK - PAGE);
        let page = c.page_of(h);
        assert_eq!(c.max_length(h), 512);

        // Fill the rest of the page.
        let mut handles = vec![h];
        for _ in 1..16 {
            handles.push(c.allocate_in_subpage(page).unwrap());
        }
        assert_eq!(c.allocate_in_subpage(page), None);

        // Offsets are distinct multiples of the element size inside one page.
        let mut offsets: Vec<_> = handles.iter().map(|h| c.data_offset(*h)).collect();
        offsets.sort_unstable();
        offsets.dedup();
        assert_eq!(offsets.len(), 16);

        for (i, h) in handles.iter().enumerate() {
            match c.free(*h).unwrap() {
                ChunkFree::Subpage { now_empty, .. } => assert_eq!(now_empty, i == 15),
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        // Page only returns to the tree once the arena says so.
        assert_eq!(c.free_bytes, CHUNK - PAGE);
        c.release_subpage(page);
        assert_eq!(c.free_bytes, CHUNK);
        c.assert_tree_consistent();
    }

    #[test]
    fn stray_and_double_frees_are_rejected() {
        let mut c = chunk();
        let h = c.allocate_run(3).unwrap();
        c.free(h).unwrap();
        assert!(c.free(h).is_err());
        // A node that was never allocated.
        assert!(c.free(crate::chunk::run_handle(5)).is_err());
        // Out of range entirely.
        assert!(c.free(crate::chunk::run_handle(1 << 20)).is_err());
        c.assert_tree_consistent();
    }

    #[test]
    fn mixed_runs_do_not_overlap() {
        let mut c = chunk();
        let mut live: Vec<(u64, usize, usize)> = vec![];
        for depth in [1, 3, 3, 5, 11, 11, 4] {
            let h = c.allocate_run(depth).unwrap();
            let offset = c.data_offset(h);
            let len = c.max_length(h);
            for (_, o, l) in &live {
                assert!(offset + len <= *o || o + l <= offset);
            }
            live.push((h, offset, len));
        }
        let spoken_for: usize = live.iter().map(|(_, _, l)| l).sum();
        assert_eq!(c.free_bytes, CHUNK - spoken_for);
        for (h, _, _) in live {
            c.free(h).unwrap();
        }
        assert_eq!(c.free_bytes, CHUNK);
        c.assert_tree_consistent();
    }
}
