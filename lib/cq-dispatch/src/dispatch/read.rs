// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! # Buffer Reads
//!
//! A read asks the dispatcher to stream device pages into the completion queue. Each read
//! command sequence is:
//!
//! 1. one wait per selected sub-device, the last one a barrier followed by a prefetch stall
//! 2. a host write announcing `pages_per_txn * padded_page_size` bytes
//! 3. the relay that fetches those bytes: paged for interleaved buffers, linear from a single
//!    core for sharded ones
//!
//! Interleaved buffers are read in one command. Sharded buffers are read one core at a time,
//! skipping cores that hold none of the region. Every command produces one
//! [`ReadBufferDescriptor`] telling the completion side where its pages belong.

use std::sync::Arc;

use super::completion::ReadBufferDescriptor;
use super::{DispatchWait, dispatch_waits};
use crate::buffer::{
    Buffer, BufferPageMapping, BufferRegion, BufferType, calculate_pages_to_process_in_shard,
    validate_buffer_region_conditions,
};
use crate::command::{
    CQ_PREFETCH_RELAY_PAGED_START_PAGE_MASK, DeviceCommand, dispatch_wait_size, prefetch_cmd_size,
};
use crate::core_coord::CoreCoord;
use crate::device::{Device, SubDeviceId};
use crate::error::{DispatchError, Result};

/// State of one interleaved read, and the part shared with sharded reads.
#[derive(Debug, Clone)]
pub struct BufferReadDispatchParams {
    pub cq_id: u8,
    pub waits: Vec<DispatchWait>,
    pub padded_page_size: u32,
    /// First device page of the next command
    pub src_page_index: u32,
    /// Where the next command's pages land in the destination
    pub unpadded_dst_offset: u32,
    pub pages_per_txn: u32,
    /// Bank address of the next command
    pub address: u32,
}

#[derive(Debug, Clone)]
pub struct ShardedBufferReadDispatchParams {
    pub base: BufferReadDispatchParams,
    pub width_split: bool,
    pub starting_src_host_page_index: u32,
    pub ending_src_host_page_index: u32,
    pub initial_pages_skipped: u32,
    pub total_pages_to_read: u32,
    pub total_pages_read: u32,
    pub max_pages_per_shard: u32,
    pub page_mapping: Option<Arc<BufferPageMapping>>,
    pub core: CoreCoord,
}

/// Where a read command fetches its pages from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadRelay {
    /// Interleaved pages starting at a bank-relative page index
    Paged { is_dram: bool, start_page: u8 },
    /// Contiguous bytes on one core
    Linear { noc_xy: u32 },
}

/// Read state that can be turned into a command sequence.
pub trait ReadDispatchParams {
    fn base(&self) -> &BufferReadDispatchParams;

    fn relay(&self, device: &Device, buffer: &Buffer) -> Result<ReadRelay>;
}

impl ReadDispatchParams for BufferReadDispatchParams {
    fn base(&self) -> &BufferReadDispatchParams {
        self
    }

    fn relay(&self, _device: &Device, buffer: &Buffer) -> Result<ReadRelay> {
        let start_page = u8::try_from(self.src_page_index).map_err(|_| {
            DispatchError::protocol(format!(
                "page index {} does not fit a paged relay",
                self.src_page_index
            ))
        })?;
        Ok(ReadRelay::Paged {
            is_dram: buffer.is_dram(),
            start_page,
        })
    }
}

impl ReadDispatchParams for ShardedBufferReadDispatchParams {
    fn base(&self) -> &BufferReadDispatchParams {
        &self.base
    }

    fn relay(&self, device: &Device, buffer: &Buffer) -> Result<ReadRelay> {
        let virtual_core = device.virtual_core_from_logical_core(self.core, buffer.core_type());
        Ok(ReadRelay::Linear {
            noc_xy: device.noc_unicast_encoding(virtual_core),
        })
    }
}

fn check_read_target(device: &Device, buffer: &Buffer, region: &BufferRegion) -> Result<()> {
    if buffer.device_id() != device.id() {
        return Err(DispatchError::InvalidBuffer(format!(
            "buffer belongs to device {}, not device {}",
            buffer.device_id(),
            device.id()
        )));
    }
    validate_buffer_region_conditions(buffer, region)
}

pub fn initialize_interleaved_buf_read_dispatch_params(
    device: &Device,
    buffer: &Buffer,
    cq_id: u8,
    expected_num_workers_completed: &[u32],
    sub_device_ids: &[SubDeviceId],
    region: &BufferRegion,
) -> Result<BufferReadDispatchParams> {
    check_read_target(device, buffer, region)?;
    Ok(BufferReadDispatchParams {
        cq_id,
        waits: dispatch_waits(device, expected_num_workers_completed, sub_device_ids)?,
        padded_page_size: buffer.aligned_page_size(),
        src_page_index: region.offset / buffer.page_size(),
        unpadded_dst_offset: 0,
        pages_per_txn: region.size / buffer.page_size(),
        address: buffer.address(),
    })
}

pub fn initialize_sharded_buf_read_dispatch_params(
    device: &Device,
    buffer: &Buffer,
    cq_id: u8,
    expected_num_workers_completed: &[u32],
    sub_device_ids: &[SubDeviceId],
    region: &BufferRegion,
) -> Result<ShardedBufferReadDispatchParams> {
    check_read_target(device, buffer, region)?;
    if !buffer.is_sharded() {
        return Err(DispatchError::InvalidBuffer(
            "sharded read requested for an interleaved buffer".to_string(),
        ));
    }

    let width_split = buffer.is_width_split();
    let page_mapping = if width_split {
        Some(buffer.get_buffer_page_mapping()?)
    } else {
        None
    };
    let starting_page = region.offset / buffer.page_size();
    let total_pages = region.size / buffer.page_size();

    Ok(ShardedBufferReadDispatchParams {
        base: BufferReadDispatchParams {
            cq_id,
            waits: dispatch_waits(device, expected_num_workers_completed, sub_device_ids)?,
            padded_page_size: buffer.aligned_page_size(),
            src_page_index: starting_page,
            unpadded_dst_offset: 0,
            pages_per_txn: 0,
            address: buffer.address(),
        },
        width_split,
        starting_src_host_page_index: starting_page,
        ending_src_host_page_index: starting_page + total_pages,
        initial_pages_skipped: 0,
        total_pages_to_read: total_pages,
        total_pages_read: 0,
        max_pages_per_shard: buffer.max_pages_per_shard(),
        page_mapping,
        core: CoreCoord::default(),
    })
}

/// Push one read command sequence for the pages described by `params`.
pub fn issue_read_buffer_dispatch_command_sequence<T: ReadDispatchParams>(
    device: &Device,
    buffer: &Buffer,
    params: &T,
) -> Result<()> {
    let base = params.base();
    let Some((last_wait, waits)) = base.waits.split_last() else {
        return Err(DispatchError::protocol("read issued without a sub-device to wait on"));
    };
    let relay = params.relay(device, buffer)?;

    let host_alignment = device.settings().host_alignment;
    let wait_size = dispatch_wait_size(host_alignment);
    let prefetch_size = prefetch_cmd_size(host_alignment);
    // waits, stall, host write, relay
    let cmd_size = wait_size * base.waits.len() as u32 + prefetch_size + wait_size + prefetch_size;
    let data_size = base.pages_per_txn * base.padded_page_size;

    let sysmem = device.sysmem_manager();
    let _issue = sysmem.issue_queue_lock(base.cq_id)?;
    {
        let mut reservation = sysmem.issue_queue_reserve(cmd_size, base.cq_id)?;
        let mut command = DeviceCommand::new(reservation.as_mut_slice(), host_alignment);
        for wait in waits {
            command.add_dispatch_wait(false, wait.address, wait.count);
        }
        command.add_dispatch_wait_with_prefetch_stall(true, last_wait.address, last_wait.count);
        command.add_dispatch_write_host(false, data_size, false);
        match relay {
            ReadRelay::Paged { is_dram, start_page } => command.add_prefetch_relay_paged(
                is_dram,
                start_page,
                base.address,
                base.padded_page_size,
                base.pages_per_txn,
            ),
            ReadRelay::Linear { noc_xy } => {
                command.add_prefetch_relay_linear(noc_xy, data_size, base.address)
            }
        }
        debug_assert_eq!(command.write_offset_bytes(), cmd_size as usize);
    }

    tracing::trace!(
        cq_id = base.cq_id,
        cmd_size,
        pages = base.pages_per_txn,
        src_page_index = base.src_page_index,
        address = base.address,
        ?relay,
        "issuing read transaction"
    );

    sysmem.issue_queue_push_back(cmd_size, base.cq_id)?;
    sysmem.fetch_queue_reserve_back(base.cq_id)?;
    sysmem.fetch_queue_write(cmd_size, base.cq_id)
}

/// Read the pages of `params` held by `core`, the `core_id`th shard core.
///
/// Leaves `pages_per_txn` at zero and issues nothing when the core holds none of the region.
pub fn copy_sharded_buffer_from_core_to_completion_queue(
    device: &Device,
    core_id: usize,
    buffer: &Buffer,
    params: &mut ShardedBufferReadDispatchParams,
    core: CoreCoord,
) -> Result<()> {
    let mut curr_page_idx_in_shard = 0;
    let host_page;
    let pages_per_txn;

    if params.width_split {
        let mapping = params
            .page_mapping
            .as_deref()
            .ok_or_else(|| DispatchError::protocol("width split read without a page mapping"))?;
        let shard_width = buffer.shard_spec().map_or(0, |spec| spec.shape_in_pages[1]);
        let (start_host_page, num_pages) = calculate_pages_to_process_in_shard(
            core_id,
            mapping,
            shard_width,
            params.starting_src_host_page_index,
            params.ending_src_host_page_index,
        );
        host_page = start_host_page;
        pages_per_txn = num_pages;
        if pages_per_txn > 0 {
            params.base.src_page_index = mapping.host_page_to_dev_page_mapping[host_page as usize];
            curr_page_idx_in_shard =
                mapping.host_page_to_local_shard_page_mapping[host_page as usize];
        }
    } else {
        host_page = params.base.src_page_index;
        let max = params.max_pages_per_shard;
        let start = params.starting_src_host_page_index;
        let mut pages = params.total_pages_to_read.min(max);

        if params.initial_pages_skipped + max <= start {
            // region starts past this shard
            pages = 0;
            params.initial_pages_skipped += max;
        } else if core_id as u32 == start / max {
            params.initial_pages_skipped += start - params.initial_pages_skipped;
            let remaining_pages_in_shard =
                (core_id as u32 + 1) * max - params.initial_pages_skipped;
            curr_page_idx_in_shard = max - remaining_pages_in_shard;
            pages = pages.min(remaining_pages_in_shard);
        }
        pages_per_txn = pages;
    }

    // width split counts device pages, padding included
    params.total_pages_to_read = params.total_pages_to_read.saturating_sub(pages_per_txn);
    params.total_pages_read += pages_per_txn;
    params.base.pages_per_txn = pages_per_txn;
    if pages_per_txn == 0 {
        return Ok(());
    }

    let mut address = buffer.address();
    if buffer.is_dram() {
        let bank = device.dram_channel_from_logical_core(core);
        address += device.bank_offset(BufferType::Dram, bank);
    }
    address += curr_page_idx_in_shard * buffer.aligned_page_size();

    params.base.unpadded_dst_offset =
        (host_page - params.starting_src_host_page_index) * buffer.page_size();
    params.base.address = address;
    params.core = core;

    tracing::trace!(core_id, %core, pages_per_txn, curr_page_idx_in_shard, "reading shard");

    issue_read_buffer_dispatch_command_sequence(device, buffer, params)
}

/// Read every page of `params` with a single paged relay.
pub fn copy_interleaved_buffer_to_completion_queue(
    device: &Device,
    buffer: &Buffer,
    params: &mut BufferReadDispatchParams,
) -> Result<()> {
    if params.pages_per_txn == 0 {
        return Ok(());
    }

    let mut bank_base_address = buffer.address();
    if params.src_page_index > CQ_PREFETCH_RELAY_PAGED_START_PAGE_MASK {
        let num_banks = device.num_banks(buffer.buffer_type());
        bank_base_address += (params.src_page_index / num_banks) * buffer.aligned_page_size();
        params.src_page_index %= num_banks;
    }
    params.address = bank_base_address;
    issue_read_buffer_dispatch_command_sequence(device, buffer, params)
}

/// Describe the pages of the command just issued for `params`, then move past them.
pub fn generate_sharded_buffer_read_descriptor(
    params: &mut ShardedBufferReadDispatchParams,
    buffer: &Buffer,
) -> ReadBufferDescriptor {
    let starting_dev_page_id = params.base.src_page_index;
    params.base.src_page_index += params.base.pages_per_txn;
    ReadBufferDescriptor {
        page_size: buffer.page_size(),
        padded_page_size: params.base.padded_page_size,
        dst_offset: params.base.unpadded_dst_offset,
        num_pages_read: params.base.pages_per_txn,
        starting_dev_page_id,
        starting_host_page_id: params.starting_src_host_page_index,
        page_mapping: params.page_mapping.clone(),
    }
}

pub fn generate_interleaved_buffer_read_descriptor(
    params: &BufferReadDispatchParams,
    buffer: &Buffer,
) -> ReadBufferDescriptor {
    ReadBufferDescriptor {
        page_size: buffer.page_size(),
        padded_page_size: params.padded_page_size,
        dst_offset: params.unpadded_dst_offset,
        num_pages_read: params.pages_per_txn,
        starting_dev_page_id: params.src_page_index,
        starting_host_page_id: 0,
        page_mapping: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferConfig, BufferLayout, ShardOrientation, ShardSpec};
    use crate::command::{DeviceCommandRecord, decode_command_sequence};
    use crate::config::DispatchSettings;
    use crate::core_coord::CoreRange;
    use crate::device::DeviceConfig;
    use assert_matches::assert_matches;

    fn device() -> Arc<Device> {
        Device::open(DeviceConfig::default(), DispatchSettings::default()).unwrap()
    }

    fn height_sharded(device: &Device) -> Arc<Buffer> {
        // 64 pages of 64 bytes in shards of 16 pages over 4 cores
        let spec = ShardSpec::new(
            CoreRange::new(CoreCoord::new(0, 0), CoreCoord::new(3, 0)),
            [16, 1],
            ShardOrientation::RowMajor,
            [64, 1],
        );
        let config = BufferConfig::builder()
            .size(64 * 64)
            .page_size(64)
            .buffer_type(BufferType::L1)
            .layout(BufferLayout::HeightSharded)
            .shard_spec(spec)
            .build()
            .unwrap();
        Buffer::create(device, config).unwrap()
    }

    #[test]
    fn test_interleaved_read_sequence() {
        let device = device();
        let config = BufferConfig::builder().size(2048 * 400).page_size(2048).build().unwrap();
        let buffer = Buffer::create(&device, config).unwrap();

        let region = BufferRegion::new(2048 * 300, 2048 * 4);
        let ids = [SubDeviceId(0)];
        let mut params = initialize_interleaved_buf_read_dispatch_params(
            &device, &buffer, 0, &[0], &ids, &region,
        )
        .unwrap();
        assert_eq!(params.src_page_index, 300);
        assert_eq!(params.pages_per_txn, 4);

        copy_interleaved_buffer_to_completion_queue(&device, &buffer, &mut params).unwrap();
        // 300 pages over 12 banks: 25 full rows folded into the address
        assert_eq!(params.src_page_index, 0);
        assert_eq!(params.address, buffer.address() + 25 * 2048);

        let descriptor = generate_interleaved_buffer_read_descriptor(&params, &buffer);
        assert_eq!(descriptor.num_pages_read, 4);
        assert_eq!(descriptor.dst_offset, 0);
        assert_eq!(descriptor.record_size(), 4 * 2048 + 16);
    }

    #[test]
    fn test_read_sequence_encoding() {
        let device = device();
        let config = BufferConfig::builder().size(4096).page_size(1024).build().unwrap();
        let buffer = Buffer::create(&device, config).unwrap();
        let params = BufferReadDispatchParams {
            cq_id: 0,
            waits: vec![
                DispatchWait { address: 0x100, count: 1 },
                DispatchWait { address: 0x110, count: 2 },
            ],
            padded_page_size: 1024,
            src_page_index: 3,
            unpadded_dst_offset: 0,
            pages_per_txn: 2,
            address: buffer.address(),
        };

        let mut bytes = vec![0u8; 32 * 5];
        let mut command = DeviceCommand::new(&mut bytes, 32);
        let base = params.base();
        command.add_dispatch_wait(false, base.waits[0].address, base.waits[0].count);
        let last = base.waits[1];
        command.add_dispatch_wait_with_prefetch_stall(true, last.address, last.count);
        command.add_dispatch_write_host(false, 2048, false);
        assert_eq!(
            params.relay(&device, &buffer).unwrap(),
            ReadRelay::Paged {
                is_dram: true,
                start_page: 3
            }
        );
        command.add_prefetch_relay_paged(true, 3, base.address, 1024, 2);
        assert_eq!(command.write_offset_bytes(), bytes.len());

        let records = decode_command_sequence(&bytes, 32).unwrap();
        assert_matches!(records.last(), Some(DeviceCommandRecord::RelayPaged(r)) if r.pages == 2);
    }

    #[test]
    fn test_sharded_read_skips_leading_shards() {
        let device = device();
        let buffer = height_sharded(&device);
        let region = BufferRegion::new(20 * 64, 30 * 64);
        let ids = [SubDeviceId(1)];
        assert_matches!(
            initialize_sharded_buf_read_dispatch_params(&device, &buffer, 0, &[0], &ids, &region),
            Err(DispatchError::InvalidSubDevice { index: 1, .. })
        );

        let ids = [SubDeviceId(0)];
        let mut params =
            initialize_sharded_buf_read_dispatch_params(&device, &buffer, 0, &[0], &ids, &region)
                .unwrap();
        let cores = buffer.shard_cores();
        let mut reads = Vec::new();
        for (core_id, core) in cores.into_iter().enumerate() {
            copy_sharded_buffer_from_core_to_completion_queue(
                &device,
                core_id,
                &buffer,
                &mut params,
                core,
            )
            .unwrap();
            if params.base.pages_per_txn > 0 {
                let address = params.base.address;
                let descriptor = generate_sharded_buffer_read_descriptor(&mut params, &buffer);
                reads.push((core_id, address, descriptor));
            }
        }

        assert_eq!(reads.len(), 3);
        let (core_id, address, first) = &reads[0];
        assert_eq!(*core_id, 1);
        assert_eq!(*address, buffer.address() + 4 * 64);
        assert_eq!((first.num_pages_read, first.dst_offset), (12, 0));
        assert_eq!((reads[1].2.num_pages_read, reads[1].2.dst_offset), (16, 12 * 64));
        assert_eq!((reads[2].2.num_pages_read, reads[2].2.dst_offset), (2, 28 * 64));
        assert_eq!(params.total_pages_to_read, 0);
    }
}
