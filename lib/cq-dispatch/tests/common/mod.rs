// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use cq_dispatch::{
    Buffer, BufferConfig, BufferLayout, BufferType, CommandQueue, CoreCoord, CoreRange, Device,
    DeviceConfig, DispatchSettings, ShardOrientation, ShardSpec,
};

pub fn open_device(config: DeviceConfig, settings: DispatchSettings) -> Result<Arc<Device>> {
    Ok(Device::open(config, settings)?)
}

/// Default device with a single queue.
pub fn queue() -> Result<CommandQueue> {
    queue_with(DispatchSettings::default())
}

pub fn queue_with(settings: DispatchSettings) -> Result<CommandQueue> {
    let device = open_device(DeviceConfig::default(), settings)?;
    Ok(CommandQueue::new(device, 0)?)
}

pub fn interleaved(
    device: &Device,
    buffer_type: BufferType,
    page_size: u32,
    num_pages: u32,
) -> Result<Arc<Buffer>> {
    let config = BufferConfig::builder()
        .size(page_size * num_pages)
        .page_size(page_size)
        .buffer_type(buffer_type)
        .build()?;
    Ok(Buffer::create(device, config)?)
}

/// Sharded buffer whose shards sit on a `grid_x` by `grid_y` rectangle from the origin.
#[allow(clippy::too_many_arguments)]
pub fn sharded(
    device: &Device,
    buffer_type: BufferType,
    layout: BufferLayout,
    page_size: u32,
    grid: (u32, u32),
    shard_shape: [u32; 2],
    tensor_shape: [u32; 2],
) -> Result<Arc<Buffer>> {
    let range = CoreRange::new(CoreCoord::new(0, 0), CoreCoord::new(grid.0 - 1, grid.1 - 1));
    let spec = ShardSpec::new(range, shard_shape, ShardOrientation::RowMajor, tensor_shape);
    let config = BufferConfig::builder()
        .size(page_size * tensor_shape[0] * tensor_shape[1])
        .page_size(page_size)
        .buffer_type(buffer_type)
        .layout(layout)
        .shard_spec(spec)
        .build()?;
    Ok(Buffer::create(device, config)?)
}

/// Little-endian `0..count` as u32 words.
pub fn arange_u32(count: u32) -> Vec<u8> {
    (0..count).flat_map(u32::to_le_bytes).collect()
}

/// Bytes that differ between pages and between seeds, with no zero runs.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i * 7 + i / 251 + seed as usize * 13) % 251) as u8 + 1)
        .collect()
}

/// Settings with an issue queue small enough to wrap after a few transactions.
pub fn small_issue_queue() -> DispatchSettings {
    DispatchSettings {
        worker_max_prefetch_cmd_size: 4096,
        ethernet_max_prefetch_cmd_size: 4096,
        issue_queue_size: 16 * 1024,
        ..DispatchSettings::default()
    }
}
