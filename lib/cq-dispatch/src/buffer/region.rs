// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

use super::{Buffer, BufferPageMapping};
use crate::error::{DispatchError, Result};

/// Byte range of a buffer targeted by one read or write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferRegion {
    pub offset: u32,
    pub size: u32,
}

impl BufferRegion {
    pub const fn new(offset: u32, size: u32) -> Self {
        Self { offset, size }
    }
}

/// Reject regions the dispatcher cannot address.
///
/// A partial region must start and end on a page boundary. The whole-buffer region is
/// always accepted.
pub fn validate_buffer_region_conditions(buffer: &Buffer, region: &BufferRegion) -> Result<()> {
    if !buffer.is_valid_region(region) {
        return Err(DispatchError::invalid_region(
            region.offset,
            region.size,
            format!("exceeds buffer size {}", buffer.size()),
        ));
    }
    if buffer.is_valid_partial_region(region) {
        let page_size = buffer.page_size();
        if region.offset % page_size != 0 {
            return Err(DispatchError::invalid_region(
                region.offset,
                region.size,
                format!("offset must be a multiple of the page size {page_size}"),
            ));
        }
        if region.size % page_size != 0 {
            return Err(DispatchError::invalid_region(
                region.offset,
                region.size,
                format!("size must be a multiple of the page size {page_size}"),
            ));
        }
    }
    Ok(())
}

/// Host pages of `[start_host_page, end_host_page)` stored on the shard of `core_id`.
///
/// Returns the first such host page and the number of device pages, shard padding
/// included, from that page up to the last one in range. `(0, 0)` means the core holds
/// none of the range.
pub fn calculate_pages_to_process_in_shard(
    core_id: usize,
    mapping: &BufferPageMapping,
    shard_width: u32,
    start_host_page: u32,
    end_host_page: u32,
) -> (u32, u32) {
    let Some(host_pages) = mapping.core_host_page_indices.get(core_id) else {
        return (0, 0);
    };

    let lower = host_pages.partition_point(|&p| p < start_host_page);
    let upper = host_pages.partition_point(|&p| p < end_host_page);
    if lower >= upper {
        return (0, 0);
    }

    let first = host_pages[lower];
    let first_local = mapping.host_page_to_local_shard_page_mapping[first as usize];
    let num_dev_pages = if upper == host_pages.len() {
        // range runs to the end of this core's data
        mapping.core_shard_shape[core_id][0] * shard_width - first_local
    } else {
        mapping.host_page_to_local_shard_page_mapping[host_pages[upper] as usize] - first_local
    };

    (first, num_dev_pages)
}
