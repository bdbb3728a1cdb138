// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Chip geometry: banks, logical and virtual core coordinates, NOC addressing.
//!
//! Worker cores have virtual coordinates offset by one in both axes from their logical
//! coordinates. DRAM channels sit in virtual column zero, channel `c` at row `c`.
//! A DRAM-sharded buffer names its shards by logical core `(bank, 0)`.

use crate::buffer::BufferType;
use crate::core_coord::CoreCoord;

/// Bits of the NOC address used for each coordinate.
pub const NOC_ADDR_NODE_ID_BITS: u32 = 6;

const NOC_NODE_ID_MASK: u32 = (1 << NOC_ADDR_NODE_ID_BITS) - 1;

/// Kind of logical core a coordinate refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum CoreType {
    Worker,
    Dram,
}

/// Physical memory a NOC transaction lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryEndpoint {
    DramChannel(u32),

    /// L1 of the worker at this logical coordinate
    WorkerL1(CoreCoord),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocDescriptor {
    pub grid_size: CoreCoord,
    pub num_dram_channels: u32,
    pub dram_banks_per_channel: u32,
    pub dram_bank_size: u32,
    pub l1_size: u32,
}

impl SocDescriptor {
    pub fn num_dram_banks(&self) -> u32 {
        self.num_dram_channels * self.dram_banks_per_channel
    }

    pub fn num_l1_banks(&self) -> u32 {
        self.grid_size.x * self.grid_size.y
    }

    pub fn num_banks(&self, buffer_type: BufferType) -> u32 {
        match buffer_type {
            BufferType::Dram => self.num_dram_banks(),
            BufferType::L1 => self.num_l1_banks(),
        }
    }

    /// Bytes addressable in one DRAM channel.
    pub fn dram_channel_size(&self) -> u64 {
        u64::from(self.dram_banks_per_channel) * u64::from(self.dram_bank_size)
    }

    /// Offset of `bank_id` inside the memory that hosts it.
    pub fn bank_offset(&self, buffer_type: BufferType, bank_id: u32) -> u32 {
        match buffer_type {
            BufferType::Dram => (bank_id % self.dram_banks_per_channel) * self.dram_bank_size,
            BufferType::L1 => 0,
        }
    }

    pub fn bank_endpoint(&self, buffer_type: BufferType, bank_id: u32) -> MemoryEndpoint {
        match buffer_type {
            BufferType::Dram => MemoryEndpoint::DramChannel(bank_id / self.dram_banks_per_channel),
            BufferType::L1 => MemoryEndpoint::WorkerL1(self.l1_bank_core(bank_id)),
        }
    }

    /// L1 banks are the worker cores in row-major order.
    pub fn l1_bank_core(&self, bank_id: u32) -> CoreCoord {
        CoreCoord::new(bank_id % self.grid_size.x, bank_id / self.grid_size.x)
    }

    pub fn dram_bank_from_logical_core(&self, core: CoreCoord) -> u32 {
        core.x
    }

    pub fn is_valid_logical_core(&self, core: CoreCoord, buffer_type: BufferType) -> bool {
        match buffer_type {
            BufferType::Dram => core.y == 0 && core.x < self.num_dram_banks(),
            BufferType::L1 => core.x < self.grid_size.x && core.y < self.grid_size.y,
        }
    }

    pub fn virtual_core_from_logical_core(
        &self,
        core: CoreCoord,
        core_type: CoreType,
    ) -> CoreCoord {
        match core_type {
            CoreType::Worker => CoreCoord::new(core.x + 1, core.y + 1),
            CoreType::Dram => CoreCoord::new(0, core.x / self.dram_banks_per_channel),
        }
    }

    pub fn noc_unicast_encoding(&self, virtual_core: CoreCoord) -> u32 {
        (virtual_core.y << NOC_ADDR_NODE_ID_BITS) | virtual_core.x
    }

    /// Resolve a NOC unicast encoding back to the memory it targets.
    pub fn endpoint_from_noc_encoding(&self, noc_xy: u32) -> Option<MemoryEndpoint> {
        let x = noc_xy & NOC_NODE_ID_MASK;
        let y = (noc_xy >> NOC_ADDR_NODE_ID_BITS) & NOC_NODE_ID_MASK;
        if x == 0 {
            return (y < self.num_dram_channels).then_some(MemoryEndpoint::DramChannel(y));
        }
        let logical = CoreCoord::new(x - 1, y.checked_sub(1)?);
        (logical.x < self.grid_size.x && logical.y < self.grid_size.y)
            .then_some(MemoryEndpoint::WorkerL1(logical))
    }
}
