// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Translation of buffer reads and writes into command sequences.
//!
//! [`write`] splits a host region into paged (interleaved) or linear (sharded) device writes
//! sized to fit the issue queue. [`read`] emits relays that stream device pages into the
//! completion queue, and [`completion`] copies them back out into user memory.

pub mod completion;
pub mod read;
pub mod write;

pub use completion::{ReadBufferDescriptor, copy_completion_queue_data_into_user_space};
pub use read::{
    BufferReadDispatchParams, ReadDispatchParams, ShardedBufferReadDispatchParams,
    copy_interleaved_buffer_to_completion_queue, copy_sharded_buffer_from_core_to_completion_queue,
    generate_interleaved_buffer_read_descriptor, generate_sharded_buffer_read_descriptor,
    initialize_interleaved_buf_read_dispatch_params, initialize_sharded_buf_read_dispatch_params,
    issue_read_buffer_dispatch_command_sequence,
};
pub use write::{WriteDispatchParams, get_cores_for_sharded_buffer, write_to_device_buffer};

use crate::config::DispatchCoreType;
use crate::device::{Device, SubDeviceId};
use crate::error::{DispatchError, Result};

/// Per-queue limits on the size of one command sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDispatchConstants {
    /// Absolute host address one past the end of the issue queue
    pub issue_queue_cmd_limit: u32,

    /// Largest command sequence the prefetcher accepts
    pub max_prefetch_command_size: u32,

    /// Largest payload of a single inline write
    pub max_data_sizeb: u32,
}

pub fn generate_buffer_dispatch_constants(
    device: &Device,
    dispatch_core_type: DispatchCoreType,
    cq_id: u8,
) -> Result<BufferDispatchConstants> {
    let settings = device.settings();
    let issue_queue_cmd_limit = device.sysmem_manager().get_issue_queue_limit(cq_id)?;
    let max_prefetch_command_size = settings.max_prefetch_cmd_size(dispatch_core_type);
    let max_data_sizeb = max_prefetch_command_size - 2 * settings.host_alignment;

    Ok(BufferDispatchConstants {
        issue_queue_cmd_limit,
        max_prefetch_command_size,
        max_data_sizeb,
    })
}

/// Sub-devices a command waits on: the stall group when none are named.
pub fn select_sub_device_ids(
    device: &Device,
    sub_device_ids: &[SubDeviceId],
) -> Result<Vec<SubDeviceId>> {
    if sub_device_ids.is_empty() {
        return Ok(device.sub_device_stall_group());
    }
    for id in sub_device_ids {
        if id.0 >= device.num_sub_devices() {
            return Err(DispatchError::InvalidSubDevice {
                index: id.0,
                num_sub_devices: device.num_sub_devices(),
            });
        }
    }
    Ok(sub_device_ids.to_vec())
}

/// A wait on the dispatch message of one sub-device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchWait {
    pub address: u32,
    pub count: u32,
}

/// Waits for every sub-device in `sub_device_ids` to reach its expected worker count.
///
/// An empty `sub_device_ids` waits on the device's stall group.
pub fn dispatch_waits(
    device: &Device,
    expected_num_workers_completed: &[u32],
    sub_device_ids: &[SubDeviceId],
) -> Result<Vec<DispatchWait>> {
    select_sub_device_ids(device, sub_device_ids)?
        .iter()
        .map(|id| {
            let count = expected_num_workers_completed
                .get(id.to_index())
                .copied()
                .ok_or(DispatchError::InvalidSubDevice {
                    index: id.0,
                    num_sub_devices: expected_num_workers_completed.len() as u8,
                })?;
            Ok(DispatchWait {
                address: device.settings().dispatch_message_addr(id.0),
                count,
            })
        })
        .collect()
}
