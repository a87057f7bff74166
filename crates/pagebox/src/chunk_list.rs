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

//! Chunks are chained into bands by utilization percentage, and migrate as their usage
//! crosses a band's bounds. The bands deliberately overlap so a chunk oscillating around a
//! boundary does not thrash between lists. Chains are linked through slot indices stored in
//! the chunks themselves.

/// Freshly created chunks start here and are destroyed from here once empty again.
pub const Q_INIT: usize = 0;
pub const Q000: usize = 1;
pub const Q025: usize = 2;
pub const Q050: usize = 3;
pub const Q075: usize = 4;
pub const Q100: usize = 5;

pub const BAND_COUNT: usize = 6;

/// The order bands are tried when a chunk is needed for an allocation. Moderately loaded
/// chunks first, so lightly loaded ones get a chance to empty out and the fresh ones are
/// kept for growth.
pub const ALLOCATION_ORDER: [usize; 5] = [Q050, Q025, Q000, Q_INIT, Q075];

pub struct ChunkList {
    pub head: Option<u32>,
    /// Usage bounds, half open: a chunk belongs while `min <= usage < max`.
    pub min_usage: i32,
    pub max_usage: i32,
}

impl ChunkList {
    fn new(min_usage: i32, max_usage: i32) -> Self {
        Self {
            head: None,
            min_usage,
            max_usage,
        }
    }
}

pub fn new_bands() -> [ChunkList; BAND_COUNT] {
    [
        ChunkList::new(i32::MIN, 25),
        ChunkList::new(1, 50),
        ChunkList::new(25, 75),
        ChunkList::new(50, 100),
        ChunkList::new(75, 100),
        ChunkList::new(100, i32::MAX),
    ]
}

pub fn band_name(band: usize) -> &'static str {
    match band {
        Q_INIT => "qInit",
        Q000 => "q000",
        Q025 => "q025",
        Q050 => "q050",
        Q075 => "q075",
        Q100 => "q100",
        _ => "?",
    }
}
