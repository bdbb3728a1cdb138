// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

/// Coordinate of a core on the chip grid.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct CoreCoord {
    pub x: u32,
    pub y: u32,
}

impl CoreCoord {
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

impl std::fmt::Display for CoreCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Inclusive rectangle of cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CoreRange {
    pub start: CoreCoord,
    pub end: CoreCoord,
}

impl CoreRange {
    pub fn new(start: CoreCoord, end: CoreCoord) -> Self {
        Self { start, end }
    }

    pub fn single(core: CoreCoord) -> Self {
        Self::new(core, core)
    }

    pub fn num_cores(&self) -> u32 {
        if self.end.x < self.start.x || self.end.y < self.start.y {
            return 0;
        }
        (self.end.x - self.start.x + 1) * (self.end.y - self.start.y + 1)
    }

    pub fn contains(&self, core: CoreCoord) -> bool {
        core.x >= self.start.x
            && core.x <= self.end.x
            && core.y >= self.start.y
            && core.y <= self.end.y
    }

    /// Cores of the range, row by row when `row_wise`, otherwise column by column.
    pub fn cores(&self, row_wise: bool) -> Vec<CoreCoord> {
        let mut cores = Vec::with_capacity(self.num_cores() as usize);
        if row_wise {
            for y in self.start.y..=self.end.y {
                for x in self.start.x..=self.end.x {
                    cores.push(CoreCoord::new(x, y));
                }
            }
        } else {
            for x in self.start.x..=self.end.x {
                for y in self.start.y..=self.end.y {
                    cores.push(CoreCoord::new(x, y));
                }
            }
        }
        cores
    }
}

/// Ordered set of core ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CoreRangeSet {
    ranges: Vec<CoreRange>,
}

impl CoreRangeSet {
    pub fn new(ranges: Vec<CoreRange>) -> Self {
        Self { ranges }
    }

    pub fn ranges(&self) -> &[CoreRange] {
        &self.ranges
    }

    pub fn num_cores(&self) -> u32 {
        self.ranges.iter().map(CoreRange::num_cores).sum()
    }

    pub fn contains(&self, core: CoreCoord) -> bool {
        self.ranges.iter().any(|r| r.contains(core))
    }

    /// True when no core appears in more than one range.
    pub fn is_disjoint(&self) -> bool {
        let mut seen = std::collections::HashSet::new();
        self.ranges
            .iter()
            .flat_map(|r| r.cores(true))
            .all(|core| seen.insert(core))
    }
}

impl From<CoreRange> for CoreRangeSet {
    fn from(range: CoreRange) -> Self {
        Self::new(vec![range])
    }
}

/// Flatten `set` into at most `max_cores` cores, walking each range in row or column order.
pub fn corerange_to_cores(
    set: &CoreRangeSet,
    max_cores: Option<u32>,
    row_wise: bool,
) -> Vec<CoreCoord> {
    let limit = max_cores.map(|n| n as usize).unwrap_or(usize::MAX);
    set.ranges()
        .iter()
        .flat_map(|range| range.cores(row_wise))
        .take(limit)
        .collect()
}
