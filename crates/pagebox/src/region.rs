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

//! Backing memory for chunks. Heap regions come from the process allocator, direct regions
//! from anonymous memory mappings. Either way the base address is stable for the life of the
//! region, so buffers can hold resolved pointers into it.

use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use std::io;
use std::ptr::null_mut;

use human_bytes::human_bytes;
use libc::{MADV_DONTNEED, MAP_ANONYMOUS, MAP_PRIVATE, PROT_READ, PROT_WRITE, madvise};
use tracing::info;

use crate::PoolError;

const HEAP_REGION_ALIGN: usize = 4096;

enum RegionKind {
    Heap(Layout),
    Direct,
}

/// One contiguous backing region.
pub struct Region {
    base: *mut u8,
    len: usize,
    kind: RegionKind,
}

// Regions hand out raw pointers but are only mutated through exclusively-owned buffers and
// the owning arena's lock.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Allocate a zeroed heap region. Allocation failure aborts via the global allocator's
    /// error hook, as with any other process-heap exhaustion.
    pub fn heap(len: usize) -> Self {
        let layout = match Layout::from_size_align(len, HEAP_REGION_ALIGN) {
            Ok(layout) => layout,
            Err(e) => panic!("Impossible region layout for {len} bytes: {e}"),
        };
        let base = unsafe { alloc_zeroed(layout) };
        if base.is_null() {
            handle_alloc_error(layout);
        }
        Self {
            base,
            len,
            kind: RegionKind::Heap(layout),
        }
    }

    /// Map an anonymous region for a direct arena.
    pub fn direct_anon(len: usize) -> Result<Self, PoolError> {
        let base = unsafe {
            libc::mmap64(
                null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_ANONYMOUS | MAP_PRIVATE,
                -1,
                0,
            )
        };

        if base == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            return Err(PoolError::OutOfMemory {
                wanted: len,
                reason: format!("mmap failed: {err}"),
            });
        }

        info!(
            "Mapped {} at {:?} for a direct region",
            human_bytes(len as f64),
            base,
        );

        Ok(Self {
            base: base.cast::<u8>(),
            len,
            kind: RegionKind::Direct,
        })
    }

    pub fn base_ptr(&self) -> *mut u8 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Hand the physical pages behind a freed, page-aligned range back to the OS while
    /// keeping the virtual mapping for reuse. Heap regions keep their pages; those belong
    /// to the process allocator.
    pub fn decommit(&self, offset: usize, len: usize) {
        if !matches!(self.kind, RegionKind::Direct) {
            return;
        }
        unsafe {
            let addr = self.base.add(offset);
            // Panic on fail here because this working is a fundamental invariant that we
            // cannot recover from.
            let madv_resp = madvise(addr.cast(), len, MADV_DONTNEED);
            if madv_resp != 0 {
                panic!(
                    "MADV_DONTNEED failed, errno: {}",
                    io::Error::last_os_error()
                );
            }
        }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        match &self.kind {
            RegionKind::Heap(layout) => unsafe {
                dealloc(self.base, *layout);
            },
            RegionKind::Direct => {
                let result =
                    unsafe { libc::munmap(self.base.cast::<libc::c_void>(), self.len as libc::size_t) };
                // Panic on fail here because this working is a fundamental invariant that we
                // cannot recover from.
                if result != 0 {
                    let err = io::Error::last_os_error();
                    panic!("Unable to munmap region: {err}");
                }
            }
        }
    }
}
