// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Device buffers and their page layout.
//!
//! A [`Buffer`] is a contiguous range of pages spread over the banks of one memory pool.
//! Interleaved buffers place page `p` in bank `p % num_banks`; sharded buffers split a 2D
//! page grid into rectangular shards, one shard per core of the shard grid.

mod page_mapping;
mod region;

pub use page_mapping::BufferPageMapping;
pub use region::{
    BufferRegion, calculate_pages_to_process_in_shard, validate_buffer_region_conditions,
};

use std::sync::{Arc, OnceLock};

use derive_builder::Builder;
use derive_getters::Getters;
use serde::{Deserialize, Serialize};

use crate::core_coord::{CoreCoord, CoreRangeSet};
use crate::device::{BankAllocation, CoreType, Device};
use crate::error::{DispatchError, Result};

/// Memory pool a buffer lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum BufferType {
    Dram,
    L1,
}

/// How pages are distributed over banks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum BufferLayout {
    #[default]
    Interleaved,
    HeightSharded,
    WidthSharded,
    BlockSharded,
}

impl BufferLayout {
    pub fn is_sharded(&self) -> bool {
        !matches!(self, BufferLayout::Interleaved)
    }
}

/// Order in which shards are assigned to the cores of the shard grid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShardOrientation {
    #[default]
    RowMajor,
    ColMajor,
}

/// Shard geometry, with every shape measured in pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSpec {
    pub grid: CoreRangeSet,

    /// `[height, width]` of one shard
    pub shape_in_pages: [u32; 2],

    pub orientation: ShardOrientation,

    /// `[height, width]` of the whole tensor
    pub tensor2d_shape: [u32; 2],
}

impl ShardSpec {
    pub fn new(
        grid: impl Into<CoreRangeSet>,
        shape_in_pages: [u32; 2],
        orientation: ShardOrientation,
        tensor2d_shape: [u32; 2],
    ) -> Self {
        Self {
            grid: grid.into(),
            shape_in_pages,
            orientation,
            tensor2d_shape,
        }
    }

    /// Pages per shard, padding included.
    pub fn size(&self) -> u32 {
        self.shape_in_pages[0] * self.shape_in_pages[1]
    }

    pub fn shards_per_row(&self) -> u32 {
        self.tensor2d_shape[1].div_ceil(self.shape_in_pages[1])
    }

    pub fn shards_per_column(&self) -> u32 {
        self.tensor2d_shape[0].div_ceil(self.shape_in_pages[0])
    }

    pub fn num_shards(&self) -> u32 {
        self.shards_per_row() * self.shards_per_column()
    }

    pub fn num_tensor_pages(&self) -> u32 {
        self.tensor2d_shape[0] * self.tensor2d_shape[1]
    }

    fn validate(&self, layout: BufferLayout, num_pages: u32) -> Result<()> {
        let [sh, sw] = self.shape_in_pages;
        let [th, tw] = self.tensor2d_shape;
        if sh == 0 || sw == 0 || th == 0 || tw == 0 {
            return Err(DispatchError::InvalidShardSpec(format!(
                "shard shape {:?} and tensor shape {:?} must be non-zero",
                self.shape_in_pages, self.tensor2d_shape
            )));
        }
        if self.num_tensor_pages() != num_pages {
            return Err(DispatchError::InvalidShardSpec(format!(
                "tensor shape {:?} holds {} pages but the buffer has {num_pages}",
                self.tensor2d_shape,
                self.num_tensor_pages()
            )));
        }
        match layout {
            BufferLayout::HeightSharded if sw != tw => {
                return Err(DispatchError::InvalidShardSpec(format!(
                    "height sharding requires full-width shards, \
                     got width {sw} for tensor width {tw}"
                )));
            }
            BufferLayout::WidthSharded if sh != th => {
                return Err(DispatchError::InvalidShardSpec(format!(
                    "width sharding requires full-height shards, \
                     got height {sh} for tensor height {th}"
                )));
            }
            _ => {}
        }
        if !self.grid.is_disjoint() {
            return Err(DispatchError::InvalidShardSpec("shard grid ranges overlap".to_string()));
        }
        if self.num_shards() > self.grid.num_cores() {
            return Err(DispatchError::InvalidShardSpec(format!(
                "{} shards do not fit on a grid of {} cores",
                self.num_shards(),
                self.grid.num_cores()
            )));
        }
        Ok(())
    }
}

/// Parameters of a buffer allocation.
#[derive(Debug, Clone, Builder)]
#[builder(build_fn(private, name = "build_internal"))]
pub struct BufferConfig {
    /// Total bytes of host data
    pub size: u32,

    /// Bytes of one host page
    pub page_size: u32,

    #[builder(default = "BufferType::Dram")]
    pub buffer_type: BufferType,

    #[builder(default)]
    pub layout: BufferLayout,

    #[builder(default, setter(strip_option))]
    pub shard_spec: Option<ShardSpec>,
}

impl BufferConfig {
    pub fn builder() -> BufferConfigBuilder {
        BufferConfigBuilder::default()
    }
}

impl BufferConfigBuilder {
    pub fn build(&self) -> Result<BufferConfig> {
        let config = self
            .build_internal()
            .map_err(|e| DispatchError::InvalidBuffer(e.to_string()))?;

        if config.page_size == 0 {
            return Err(DispatchError::InvalidBuffer("page size must be non-zero".to_string()));
        }
        if config.size == 0 || config.size % config.page_size != 0 {
            return Err(DispatchError::InvalidBuffer(format!(
                "buffer size {} must be a non-zero multiple of the page size {}",
                config.size, config.page_size
            )));
        }
        match (config.layout.is_sharded(), config.shard_spec.is_some()) {
            (true, false) => Err(DispatchError::InvalidBuffer(format!(
                "{} buffers require a shard spec",
                config.layout
            ))),
            (false, true) => Err(DispatchError::InvalidBuffer(
                "interleaved buffers do not take a shard spec".to_string(),
            )),
            _ => Ok(config),
        }
    }
}

/// An allocated device buffer.
///
/// The allocation is released when the last `Arc<Buffer>` is dropped.
#[derive(Debug, Getters)]
pub struct Buffer {
    #[getter(copy)]
    device_id: u32,
    #[getter(copy)]
    size: u32,
    #[getter(copy)]
    page_size: u32,
    #[getter(copy)]
    aligned_page_size: u32,
    #[getter(copy)]
    alignment: u32,
    #[getter(copy)]
    buffer_type: BufferType,
    #[getter(copy)]
    layout: BufferLayout,
    #[getter(skip)]
    shard_spec: Option<ShardSpec>,
    #[getter(skip)]
    allocation: BankAllocation,
    #[getter(skip)]
    page_mapping: OnceLock<Arc<BufferPageMapping>>,
}

impl Buffer {
    /// Allocate a buffer on `device`.
    pub fn create(device: &Device, config: BufferConfig) -> Result<Arc<Buffer>> {
        let alignment = device.alignment(config.buffer_type);
        let aligned_page_size = config.page_size.next_multiple_of(alignment);
        let num_pages = config.size / config.page_size;

        let size_per_bank = match &config.shard_spec {
            Some(spec) => {
                spec.validate(config.layout, num_pages)?;
                for core in spec.grid.ranges().iter().flat_map(|r| r.cores(true)) {
                    if !device.is_valid_logical_core(core, config.buffer_type) {
                        return Err(DispatchError::InvalidShardSpec(format!(
                            "core {core} is not a valid {} core",
                            config.buffer_type
                        )));
                    }
                }
                u64::from(spec.size()) * u64::from(aligned_page_size)
            }
            None => {
                let num_banks = device.num_banks(config.buffer_type);
                u64::from(num_pages.div_ceil(num_banks)) * u64::from(aligned_page_size)
            }
        };

        let allocation = device.allocator(config.buffer_type).allocate(size_per_bank)?;

        tracing::debug!(
            address = allocation.address(),
            size = config.size,
            page_size = config.page_size,
            buffer_type = %config.buffer_type,
            layout = %config.layout,
            "allocated buffer"
        );

        Ok(Arc::new(Buffer {
            device_id: device.id(),
            size: config.size,
            page_size: config.page_size,
            aligned_page_size,
            alignment,
            buffer_type: config.buffer_type,
            layout: config.layout,
            shard_spec: config.shard_spec,
            allocation,
            page_mapping: OnceLock::new(),
        }))
    }

    /// Base address, identical in every bank the buffer occupies.
    pub fn address(&self) -> u32 {
        self.allocation.address()
    }

    pub fn num_pages(&self) -> u32 {
        self.size / self.page_size
    }

    pub fn is_dram(&self) -> bool {
        self.buffer_type == BufferType::Dram
    }

    pub fn is_l1(&self) -> bool {
        self.buffer_type == BufferType::L1
    }

    pub fn is_sharded(&self) -> bool {
        self.layout.is_sharded()
    }

    pub fn shard_spec(&self) -> Option<&ShardSpec> {
        self.shard_spec.as_ref()
    }

    /// Kind of core addressed by the buffer's logical shard cores.
    pub fn core_type(&self) -> CoreType {
        match self.buffer_type {
            BufferType::Dram => CoreType::Dram,
            BufferType::L1 => CoreType::Worker,
        }
    }

    /// Number of cores holding a shard; zero for interleaved buffers.
    pub fn num_cores(&self) -> u32 {
        self.shard_spec.as_ref().map_or(0, ShardSpec::num_shards)
    }

    /// Device pages including shard padding. Equal to [`Self::num_pages`] when interleaved.
    pub fn num_dev_pages(&self) -> u32 {
        match &self.shard_spec {
            Some(spec) => spec.num_shards() * spec.size(),
            None => self.num_pages(),
        }
    }

    /// Whole shards in the first core that a sharded region may skip.
    pub fn max_pages_per_shard(&self) -> u32 {
        self.shard_spec.as_ref().map_or(0, ShardSpec::size)
    }

    /// True when shards do not span the full tensor width, so a core holds a column slice.
    pub fn is_width_split(&self) -> bool {
        self.shard_spec
            .as_ref()
            .is_some_and(|spec| spec.shape_in_pages[1] != spec.tensor2d_shape[1])
    }

    /// Logical cores holding shards, in shard order.
    pub fn shard_cores(&self) -> Vec<CoreCoord> {
        match &self.shard_spec {
            Some(spec) => crate::core_coord::corerange_to_cores(
                &spec.grid,
                Some(spec.num_shards()),
                spec.orientation == ShardOrientation::RowMajor,
            ),
            None => Vec::new(),
        }
    }

    /// Host/device page correspondence, computed on first use.
    pub fn get_buffer_page_mapping(&self) -> Result<Arc<BufferPageMapping>> {
        let spec = self.shard_spec.as_ref().ok_or_else(|| {
            DispatchError::InvalidBuffer(
                "page mapping requested for an interleaved buffer".to_string(),
            )
        })?;
        let mapping = self
            .page_mapping
            .get_or_init(|| Arc::new(BufferPageMapping::generate(spec, self.shard_cores())));
        Ok(Arc::clone(mapping))
    }

    /// Region fits inside the buffer.
    pub fn is_valid_region(&self, region: &BufferRegion) -> bool {
        region
            .offset
            .checked_add(region.size)
            .is_some_and(|end| end <= self.size)
    }

    /// Region fits and covers less than the whole buffer.
    pub fn is_valid_partial_region(&self, region: &BufferRegion) -> bool {
        self.is_valid_region(region) && (region.offset > 0 || region.size != self.size)
    }

    /// The region covering every byte of the buffer.
    pub fn whole_region(&self) -> BufferRegion {
        BufferRegion::new(0, self.size)
    }
}
