// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use super::ShardSpec;
use crate::core_coord::CoreCoord;

/// Correspondence between host page order and device page order of a sharded buffer.
///
/// Device page `i * shard_size + r * shard_width + c` is row `r`, column `c` of the shard
/// on core `i`. Shards on the right or bottom edge of the tensor are clipped; their
/// clipped slots are padding with no host page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferPageMapping {
    /// Shard cores in shard order
    pub all_cores: Vec<CoreCoord>,

    /// Clipped `[height, width]` of the data held by each core
    pub core_shard_shape: Vec<[u32; 2]>,

    /// Sorted host pages held by each core
    pub core_host_page_indices: Vec<Vec<u32>>,

    /// `None` for padding slots
    pub dev_page_to_host_page_mapping: Vec<Option<u32>>,

    pub host_page_to_dev_page_mapping: Vec<u32>,

    /// Position of a host page inside its core's shard
    pub host_page_to_local_shard_page_mapping: Vec<u32>,
}

impl BufferPageMapping {
    pub(crate) fn generate(spec: &ShardSpec, cores: Vec<CoreCoord>) -> Self {
        let [shard_height, shard_width] = spec.shape_in_pages;
        let [tensor_height, tensor_width] = spec.tensor2d_shape;
        let shard_size = spec.size();
        let shards_per_row = spec.shards_per_row();
        let num_shards = spec.num_shards() as usize;
        let num_host_pages = spec.num_tensor_pages() as usize;

        let mut mapping = BufferPageMapping {
            all_cores: cores,
            core_shard_shape: Vec::with_capacity(num_shards),
            core_host_page_indices: Vec::with_capacity(num_shards),
            dev_page_to_host_page_mapping: vec![None; num_shards * shard_size as usize],
            host_page_to_dev_page_mapping: vec![0; num_host_pages],
            host_page_to_local_shard_page_mapping: vec![0; num_host_pages],
        };

        for shard in 0..num_shards as u32 {
            let row_start = (shard / shards_per_row) * shard_height;
            let col_start = (shard % shards_per_row) * shard_width;
            let height = shard_height.min(tensor_height - row_start);
            let width = shard_width.min(tensor_width - col_start);

            let mut host_pages = Vec::with_capacity((height * width) as usize);
            for r in 0..height {
                for c in 0..width {
                    let local = r * shard_width + c;
                    let dev_page = shard * shard_size + local;
                    let host_page = (row_start + r) * tensor_width + col_start + c;

                    mapping.dev_page_to_host_page_mapping[dev_page as usize] = Some(host_page);
                    mapping.host_page_to_dev_page_mapping[host_page as usize] = dev_page;
                    mapping.host_page_to_local_shard_page_mapping[host_page as usize] = local;
                    host_pages.push(host_page);
                }
            }

            mapping.core_shard_shape.push([height, width]);
            mapping.core_host_page_indices.push(host_pages);
        }

        mapping
    }

    pub fn num_dev_pages(&self) -> usize {
        self.dev_page_to_host_page_mapping.len()
    }
}
