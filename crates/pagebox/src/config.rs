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

//! Pool configuration, arriving fully resolved. Whoever builds it decides where the values
//! come from; the pool only validates and obeys.

use serde::{Deserialize, Serialize};

use crate::PoolError;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of heap arenas. Zero routes heap allocations to plain unpooled memory.
    pub num_heap_arenas: usize,
    /// Number of direct (memory-mapped) arenas. Zero routes direct allocations to one-off
    /// mappings.
    pub num_direct_arenas: usize,
    /// Smallest unit the chunk tree tracks. Power of two, at least 4096.
    pub page_size: usize,
    /// Chunk size is `page_size << max_order`. At most 14.
    pub max_order: u32,
    /// Ring capacity per tiny class in each thread cache. Zero disables tiny caching.
    pub tiny_cache_size: usize,
    /// Ring capacity per small class. Zero disables small caching.
    pub small_cache_size: usize,
    /// Ring capacity per cacheable normal class. Zero disables normal caching.
    pub normal_cache_size: usize,
    /// Normal classes above this capacity are never cached.
    pub max_cached_buffer_capacity: usize,
    /// Thread-cache allocation attempts between trim sweeps.
    pub cache_trim_interval: u32,
    /// When false, only threads that opted in via `BufferPool::pin_thread_cache` get
    /// caching rings; everyone else still binds to an arena but never defers frees.
    pub use_cache_for_all_threads: bool,
    /// Zero, or a power of two that direct allocations are padded out to.
    pub direct_memory_cache_alignment: usize,
    /// Which family `buffer()` uses.
    pub prefer_direct: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let arenas = default_arena_count();
        Self {
            num_heap_arenas: arenas,
            num_direct_arenas: arenas,
            page_size: 8192,
            max_order: 11,
            tiny_cache_size: 512,
            small_cache_size: 256,
            normal_cache_size: 64,
            max_cached_buffer_capacity: 32 * 1024,
            cache_trim_interval: 8192,
            use_cache_for_all_threads: true,
            direct_memory_cache_alignment: 0,
            prefer_direct: false,
        }
    }
}

/// Two arenas per logical core keeps arena contention low without mapping absurd amounts of
/// address space on very wide machines.
fn default_arena_count() -> usize {
    (gdt_cpus::num_logical_cores().unwrap_or(8) * 2).min(64)
}

impl PoolConfig {
    pub const MIN_PAGE_SIZE: usize = 4096;
    pub const MAX_ORDER_LIMIT: u32 = 14;

    pub fn validate(&self) -> Result<(), PoolError> {
        if self.page_size < Self::MIN_PAGE_SIZE {
            return Err(PoolError::ConfigInvalid(format!(
                "page size {} is below the minimum {}",
                self.page_size,
                Self::MIN_PAGE_SIZE
            )));
        }
        if !self.page_size.is_power_of_two() {
            return Err(PoolError::ConfigInvalid(format!(
                "page size {} is not a power of two",
                self.page_size
            )));
        }
        if self.max_order > Self::MAX_ORDER_LIMIT {
            return Err(PoolError::ConfigInvalid(format!(
                "max order {} is above the limit {}",
                self.max_order,
                Self::MAX_ORDER_LIMIT
            )));
        }
        if self.page_size.checked_mul(1usize << self.max_order).is_none() {
            return Err(PoolError::ConfigInvalid(format!(
                "chunk size {} << {} overflows",
                self.page_size, self.max_order
            )));
        }
        if self.direct_memory_cache_alignment != 0
            && !self.direct_memory_cache_alignment.is_power_of_two()
        {
            return Err(PoolError::ConfigInvalid(format!(
                "direct memory cache alignment {} is not a power of two",
                self.direct_memory_cache_alignment
            )));
        }
        Ok(())
    }

    pub fn chunk_size(&self) -> usize {
        self.page_size << self.max_order
    }
}

#[cfg(test)]
mod tests {
    use crate::PoolError;
    use crate::config::PoolConfig;

    #[test]
    fn default_config_validates() {
        let cfg = PoolConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.chunk_size(), 16 * 1024 * 1024);
        assert!(cfg.num_heap_arenas >= 1);
    }

    #[test]
    fn bad_configs_are_rejected() {
        let assert_invalid = |cfg: PoolConfig| {
            assert!(matches!(cfg.validate(), Err(PoolError::ConfigInvalid(_))));
        };
        assert_invalid(PoolConfig {
            page_size: 1024,
            ..Default::default()
        });
        assert_invalid(PoolConfig {
            page_size: 12288,
            ..Default::default()
        });
        assert_invalid(PoolConfig {
            max_order: 15,
            ..Default::default()
        });
        assert_invalid(PoolConfig {
            direct_memory_cache_alignment: 3,
            ..Default::default()
        });
        assert_invalid(PoolConfig {
            page_size: 1usize << 62,
            max_order: 10,
            ..Default::default()
        });
    }
}
