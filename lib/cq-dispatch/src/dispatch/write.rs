// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! # Buffer Writes
//!
//! A write is cut into transactions, each one command sequence in the issue queue carrying
//! as many pages as fit before the queue limit and under the prefetcher's command size.
//!
//! - Interleaved pages go out as paged writes that the dispatcher spreads across banks.
//! - Pages larger than one command's payload are cut into equal partial pages. One
//!   interleaved transaction writes the same partial of a group of consecutive full pages.
//! - Sharded pages go out as linear writes to one core at a time. A shard is contiguous on
//!   its core, so a transaction carries any run of its pages or partial pages.
//!
//! The first transaction of a write is prefixed with waits on the selected sub-devices.

use std::sync::Arc;

use super::{
    BufferDispatchConstants, DispatchWait, dispatch_waits, generate_buffer_dispatch_constants,
};
use crate::buffer::{
    Buffer, BufferPageMapping, BufferRegion, BufferType, ShardOrientation,
    calculate_pages_to_process_in_shard, validate_buffer_region_conditions,
};
use crate::command::{
    CQ_DISPATCH_CMD_PAGED_WRITE_MAX_PAGE_INDEX, DeviceCommand, dispatch_wait_size,
    dispatch_write_size,
};
use crate::config::DispatchCoreType;
use crate::core_coord::{CoreCoord, corerange_to_cores};
use crate::device::{Device, SubDeviceId};
use crate::error::{DispatchError, Result};

/// Progress shared by every kind of write.
#[derive(Debug, Clone)]
pub struct BufferWriteDispatchParams {
    pub cq_id: u8,
    pub waits: Vec<DispatchWait>,
    /// Bank-relative address of the next transaction
    pub address: u32,
    pub dst_page_index: u32,
    /// Bytes per page on the wire: the aligned page, or one partial of it
    pub page_size_to_write: u32,
    pub total_pages_to_write: u32,
    pub total_pages_written: u32,
    pub pages_per_txn: u32,
    pub issue_wait: bool,
    waits_issued: bool,
}

impl BufferWriteDispatchParams {
    fn new(cq_id: u8, waits: Vec<DispatchWait>, address: u32, page_size_to_write: u32) -> Self {
        Self {
            cq_id,
            waits,
            address,
            dst_page_index: 0,
            page_size_to_write,
            total_pages_to_write: 0,
            total_pages_written: 0,
            pages_per_txn: 0,
            issue_wait: false,
            waits_issued: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InterleavedBufferWriteDispatchParams {
    pub base: BufferWriteDispatchParams,
    pub num_banks: u32,
}

#[derive(Debug, Clone)]
pub struct InterleavedLargePageWriteDispatchParams {
    pub base: BufferWriteDispatchParams,
    pub num_banks: u32,
    /// Aligned size of one full page
    pub full_page_size: u32,
    pub num_partial_pages_per_full_page: u32,
    /// Which partial of the current group of full pages goes out next
    pub partial_page_index: u32,
    pub full_pages_to_write: u32,
    pub full_pages_written: u32,
    /// Alignment padding at the end of each full page
    pub padding: u32,
}

#[derive(Debug, Clone)]
pub struct ShardedBufferWriteDispatchParams {
    pub base: BufferWriteDispatchParams,
    pub width_split: bool,
    pub starting_dst_host_page_index: u32,
    pub ending_dst_host_page_index: u32,
    pub initial_pages_skipped: u32,
    pub max_pages_per_shard: u32,
    pub page_mapping: Option<Arc<BufferPageMapping>>,
    /// 1 unless pages are larger than one command's payload
    pub num_partial_pages_per_full_page: u32,
    pub core: CoreCoord,
    /// Next slot written on `core`, in units of `page_size_to_write`
    pub curr_page_idx_in_shard: u32,
    /// Slots of `page_size_to_write` left to write on `core`
    pub num_pages_in_core: u32,
}

impl ShardedBufferWriteDispatchParams {
    /// Source bytes of slot `slot`, relative to the region start, or `None` for shard padding.
    fn source_range(&self, slot: u32, page_size: u32) -> Result<Option<(usize, usize)>> {
        let partials = self.num_partial_pages_per_full_page;
        let host_page_offset = if self.width_split {
            let mapping = self
                .page_mapping
                .as_deref()
                .ok_or_else(|| {
                    DispatchError::protocol("width split write without a page mapping")
                })?;
            let dev_page = (self.base.dst_page_index + slot) / partials;
            let Some(host_page) = mapping
                .dev_page_to_host_page_mapping
                .get(dev_page as usize)
                .copied()
                .flatten()
            else {
                return Ok(None);
            };
            host_page - self.starting_dst_host_page_index
        } else {
            (self.base.total_pages_written + slot) / partials
        };

        // every core starts on a page boundary
        let partial_index = (self.base.dst_page_index + slot) % partials;
        let start = partial_index * self.base.page_size_to_write;
        let len = self.base.page_size_to_write.min(page_size - start);
        let offset = (host_page_offset * page_size + start) as usize;
        Ok(Some((offset, len as usize)))
    }
}

/// Write progress, by buffer kind.
#[derive(Debug, Clone)]
pub enum WriteDispatchParams {
    Interleaved(InterleavedBufferWriteDispatchParams),
    InterleavedLargePage(InterleavedLargePageWriteDispatchParams),
    Sharded(ShardedBufferWriteDispatchParams),
}

impl WriteDispatchParams {
    pub fn base(&self) -> &BufferWriteDispatchParams {
        match self {
            WriteDispatchParams::Interleaved(p) => &p.base,
            WriteDispatchParams::InterleavedLargePage(p) => &p.base,
            WriteDispatchParams::Sharded(p) => &p.base,
        }
    }

    fn base_mut(&mut self) -> &mut BufferWriteDispatchParams {
        match self {
            WriteDispatchParams::Interleaved(p) => &mut p.base,
            WriteDispatchParams::InterleavedLargePage(p) => &mut p.base,
            WriteDispatchParams::Sharded(p) => &mut p.base,
        }
    }

    fn has_pages_to_write(&self) -> bool {
        match self {
            WriteDispatchParams::Interleaved(p) => p.base.total_pages_to_write > 0,
            WriteDispatchParams::InterleavedLargePage(p) => p.base.total_pages_to_write > 0,
            WriteDispatchParams::Sharded(p) => p.num_pages_in_core > 0,
        }
    }

    /// Size the next transaction given room for `num_pages_available_in_cq` pages.
    ///
    /// Returns false when the transaction needs more room than that, which only happens
    /// part way through a group of large pages.
    pub fn calculate_num_pages_for_write_transaction(
        &mut self,
        num_pages_available_in_cq: u32,
    ) -> bool {
        match self {
            WriteDispatchParams::Interleaved(p) => {
                p.base.pages_per_txn = p.base.total_pages_to_write.min(num_pages_available_in_cq);
                true
            }
            WriteDispatchParams::InterleavedLargePage(p) => {
                if p.partial_page_index == 0 {
                    p.base.pages_per_txn = p
                        .full_pages_to_write
                        .min(p.num_banks - p.base.dst_page_index)
                        .min(num_pages_available_in_cq);
                    true
                } else {
                    // every partial of a group covers the same full pages
                    p.base.pages_per_txn <= num_pages_available_in_cq
                }
            }
            WriteDispatchParams::Sharded(p) => {
                p.base.pages_per_txn = p.num_pages_in_core.min(num_pages_available_in_cq);
                true
            }
        }
    }

    pub fn is_page_offset_out_of_bounds(&self) -> bool {
        match self {
            WriteDispatchParams::Interleaved(p) => {
                p.base.dst_page_index > CQ_DISPATCH_CMD_PAGED_WRITE_MAX_PAGE_INDEX
            }
            WriteDispatchParams::InterleavedLargePage(p) => p.base.dst_page_index >= p.num_banks,
            WriteDispatchParams::Sharded(_) => false,
        }
    }

    /// Fold whole rows of banks into the address so the page index fits the command.
    pub fn update_params_to_be_within_bounds(&mut self) {
        match self {
            WriteDispatchParams::Interleaved(p) => {
                let rows = p.base.dst_page_index / p.num_banks;
                p.base.address += rows * p.base.page_size_to_write;
                p.base.dst_page_index %= p.num_banks;
            }
            WriteDispatchParams::InterleavedLargePage(p) => {
                let rows = p.base.dst_page_index / p.num_banks;
                p.base.address += rows * p.full_page_size;
                p.base.dst_page_index %= p.num_banks;
            }
            WriteDispatchParams::Sharded(_) => {}
        }
    }

    pub fn update_params_after_write_transaction(&mut self) {
        match self {
            WriteDispatchParams::Interleaved(p) => {
                let pages = p.base.pages_per_txn;
                p.base.dst_page_index += pages;
                p.base.total_pages_to_write -= pages;
                p.base.total_pages_written += pages;
            }
            WriteDispatchParams::InterleavedLargePage(p) => {
                let pages = p.base.pages_per_txn;
                p.base.total_pages_to_write -= pages;
                p.base.total_pages_written += pages;
                p.base.address += p.base.page_size_to_write;
                p.partial_page_index += 1;

                if p.partial_page_index == p.num_partial_pages_per_full_page {
                    p.partial_page_index = 0;
                    p.full_pages_to_write -= pages;
                    p.full_pages_written += pages;
                    let next_index = p.base.dst_page_index + pages;
                    if next_index >= p.num_banks {
                        // next group starts a new row of banks
                        p.base.dst_page_index = 0;
                    } else {
                        p.base.address -= p.full_page_size;
                        p.base.dst_page_index = next_index;
                    }
                }
            }
            WriteDispatchParams::Sharded(p) => {
                let pages = p.base.pages_per_txn;
                p.base.address += pages * p.base.page_size_to_write;
                p.base.dst_page_index += pages;
                p.base.total_pages_to_write = p.base.total_pages_to_write.saturating_sub(pages);
                p.base.total_pages_written += pages;
                p.curr_page_idx_in_shard += pages;
                p.num_pages_in_core -= pages;
            }
        }
    }
}

/// Smallest multiple of `host_alignment`, from `base_partial_page_size` up, that divides
/// `aligned_page_size`. Falls back to the whole page.
pub fn partial_page_size(
    aligned_page_size: u32,
    base_partial_page_size: u32,
    host_alignment: u32,
) -> u32 {
    let mut partial = base_partial_page_size;
    while partial <= aligned_page_size {
        if aligned_page_size % partial == 0 {
            return partial;
        }
        partial += host_alignment;
    }
    aligned_page_size
}

pub fn initialize_interleaved_buf_dispatch_params(
    device: &Device,
    buffer: &Buffer,
    constants: &BufferDispatchConstants,
    cq_id: u8,
    waits: Vec<DispatchWait>,
    region: &BufferRegion,
) -> Result<WriteDispatchParams> {
    let page_size = buffer.page_size();
    let aligned_page_size = buffer.aligned_page_size();
    let num_banks = device.num_banks(buffer.buffer_type());
    let total_pages = region.size / page_size;

    let mut base =
        BufferWriteDispatchParams::new(cq_id, waits, buffer.address(), aligned_page_size);
    base.dst_page_index = region.offset / page_size;
    base.total_pages_to_write = total_pages;

    if aligned_page_size <= constants.max_data_sizeb {
        return Ok(WriteDispatchParams::Interleaved(InterleavedBufferWriteDispatchParams {
            base,
            num_banks,
        }));
    }

    let settings = device.settings();
    let partial = partial_page_size(
        aligned_page_size,
        settings.base_partial_page_size,
        settings.host_alignment,
    );
    if partial > constants.max_data_sizeb {
        return Err(DispatchError::PageTooLarge {
            page_size: aligned_page_size,
            max_data_size: constants.max_data_sizeb,
        });
    }
    let num_partial_pages_per_full_page = aligned_page_size / partial;

    tracing::debug!(
        aligned_page_size,
        partial_page_size = partial,
        num_partial_pages_per_full_page,
        "splitting large pages"
    );

    base.page_size_to_write = partial;
    base.total_pages_to_write = total_pages * num_partial_pages_per_full_page;
    Ok(WriteDispatchParams::InterleavedLargePage(InterleavedLargePageWriteDispatchParams {
        base,
        num_banks,
        full_page_size: aligned_page_size,
        num_partial_pages_per_full_page,
        partial_page_index: 0,
        full_pages_to_write: total_pages,
        full_pages_written: 0,
        padding: aligned_page_size - page_size,
    }))
}

pub fn initialize_sharded_buf_dispatch_params(
    device: &Device,
    buffer: &Buffer,
    constants: &BufferDispatchConstants,
    cq_id: u8,
    waits: Vec<DispatchWait>,
    region: &BufferRegion,
) -> Result<WriteDispatchParams> {
    let aligned_page_size = buffer.aligned_page_size();
    let page_size_to_write = if aligned_page_size <= constants.max_data_sizeb {
        aligned_page_size
    } else {
        let settings = device.settings();
        partial_page_size(
            aligned_page_size,
            settings.base_partial_page_size,
            settings.host_alignment,
        )
    };
    if page_size_to_write > constants.max_data_sizeb {
        return Err(DispatchError::PageTooLarge {
            page_size: aligned_page_size,
            max_data_size: constants.max_data_sizeb,
        });
    }
    let num_partial_pages_per_full_page = aligned_page_size / page_size_to_write;

    let width_split = buffer.is_width_split();
    let page_mapping = if width_split {
        Some(buffer.get_buffer_page_mapping()?)
    } else {
        None
    };

    let total_pages = region.size / buffer.page_size();
    let starting_dst_host_page_index = region.offset / buffer.page_size();

    let mut base =
        BufferWriteDispatchParams::new(cq_id, waits, buffer.address(), page_size_to_write);
    base.total_pages_to_write = total_pages * num_partial_pages_per_full_page;

    Ok(WriteDispatchParams::Sharded(ShardedBufferWriteDispatchParams {
        base,
        width_split,
        starting_dst_host_page_index,
        ending_dst_host_page_index: starting_dst_host_page_index + total_pages,
        initial_pages_skipped: 0,
        max_pages_per_shard: buffer.max_pages_per_shard(),
        page_mapping,
        num_partial_pages_per_full_page,
        core: CoreCoord::default(),
        curr_page_idx_in_shard: 0,
        num_pages_in_core: 0,
    }))
}

/// Cores holding the buffer's shards, in the order their pages are laid out.
pub fn get_cores_for_sharded_buffer(
    width_split: bool,
    page_mapping: Option<&BufferPageMapping>,
    buffer: &Buffer,
) -> Result<Vec<CoreCoord>> {
    if let (true, Some(mapping)) = (width_split, page_mapping) {
        return Ok(mapping.all_cores.clone());
    }
    let spec = buffer.shard_spec().ok_or_else(|| {
        DispatchError::InvalidBuffer("interleaved buffer has no shard cores".to_string())
    })?;
    Ok(corerange_to_cores(
        &spec.grid,
        Some(buffer.num_cores()),
        spec.orientation == ShardOrientation::RowMajor,
    ))
}

fn populate_interleaved_buffer_write_dispatch_cmds(
    src: &[u8],
    command: &mut DeviceCommand<'_>,
    buffer: &Buffer,
    params: &WriteDispatchParams,
) -> Result<()> {
    let base = params.base();
    let start_page = u16::try_from(base.dst_page_index).map_err(|_| {
        DispatchError::protocol(format!(
            "page index {} does not fit a paged write",
            base.dst_page_index
        ))
    })?;
    command.add_dispatch_write_paged(
        true,
        buffer.is_dram(),
        start_page,
        base.address,
        base.page_size_to_write,
        base.pages_per_txn,
    );

    let page_size = buffer.page_size() as usize;
    let pages = base.pages_per_txn as usize;
    match params {
        WriteDispatchParams::InterleavedLargePage(p) => {
            let partial = p.base.page_size_to_write as usize;
            let is_last_partial = p.partial_page_index + 1 == p.num_partial_pages_per_full_page;
            let len = if is_last_partial { partial - p.padding as usize } else { partial };
            for j in 0..pages {
                let offset = (p.full_pages_written as usize + j) * page_size
                    + p.partial_page_index as usize * partial;
                command.add_data(&src[offset..offset + len], partial);
            }
        }
        WriteDispatchParams::Interleaved(p) => {
            let start = p.base.total_pages_written as usize * page_size;
            let aligned = buffer.aligned_page_size() as usize;
            if page_size != aligned {
                for j in 0..pages {
                    let offset = start + j * page_size;
                    command.add_data(&src[offset..offset + page_size], aligned);
                }
            } else {
                let size = pages * page_size;
                command.add_data(&src[start..start + size], size);
            }
        }
        WriteDispatchParams::Sharded(_) => {
            return Err(DispatchError::protocol("sharded write routed to the interleaved encoder"));
        }
    }
    command.align_write_offset();
    Ok(())
}

fn populate_sharded_buffer_write_dispatch_cmds(
    src: &[u8],
    command: &mut DeviceCommand<'_>,
    device: &Device,
    buffer: &Buffer,
    params: &ShardedBufferWriteDispatchParams,
) -> Result<()> {
    let base = &params.base;
    let data_size = base.pages_per_txn * base.page_size_to_write;
    let virtual_core = device.virtual_core_from_logical_core(params.core, buffer.core_type());
    command.add_dispatch_write_linear(
        0,
        device.noc_unicast_encoding(virtual_core),
        base.address,
        data_size,
    );

    // padding and unmapped slots stay zero
    let at = command.reserve_space(data_size as usize);
    let slot_size = base.page_size_to_write as usize;
    for slot in 0..base.pages_per_txn {
        let Some((offset, len)) = params.source_range(slot, buffer.page_size())? else {
            continue;
        };
        let data = src.get(offset..offset + len).ok_or_else(|| {
            DispatchError::protocol(format!(
                "source bytes {offset}..{} lie outside the region",
                offset + len
            ))
        })?;
        command.update_cmd_sequence(at + slot as usize * slot_size, data);
    }
    command.align_write_offset();
    Ok(())
}

/// Push `waits` as a command of their own.
fn issue_wait_command_sequence(device: &Device, cq_id: u8, waits: &[DispatchWait]) -> Result<()> {
    let host_alignment = device.settings().host_alignment;
    let cmd_size = dispatch_wait_size(host_alignment) * waits.len() as u32;
    let sysmem = device.sysmem_manager();
    {
        let mut reservation = sysmem.issue_queue_reserve(cmd_size, cq_id)?;
        let mut command = DeviceCommand::new(reservation.as_mut_slice(), host_alignment);
        for wait in waits {
            command.add_dispatch_wait(false, wait.address, wait.count);
        }
    }
    sysmem.issue_queue_push_back(cmd_size, cq_id)?;
    sysmem.fetch_queue_reserve_back(cq_id)?;
    sysmem.fetch_queue_write(cmd_size, cq_id)
}

fn issue_buffer_dispatch_command_sequence(
    device: &Device,
    src: &[u8],
    buffer: &Buffer,
    params: &WriteDispatchParams,
) -> Result<()> {
    let host_alignment = device.settings().host_alignment;
    let base = params.base();
    let data_size = base.pages_per_txn * base.page_size_to_write;
    let waits: &[DispatchWait] = if base.issue_wait { &base.waits } else { &[] };
    let cmd_size = dispatch_wait_size(host_alignment) * waits.len() as u32
        + dispatch_write_size(data_size, host_alignment);

    let sysmem = device.sysmem_manager();
    {
        let mut reservation = sysmem.issue_queue_reserve(cmd_size, base.cq_id)?;
        let mut command = DeviceCommand::new(reservation.as_mut_slice(), host_alignment);
        for wait in waits {
            command.add_dispatch_wait(false, wait.address, wait.count);
        }
        match params {
            WriteDispatchParams::Sharded(p) => {
                populate_sharded_buffer_write_dispatch_cmds(src, &mut command, device, buffer, p)?
            }
            _ => {
                populate_interleaved_buffer_write_dispatch_cmds(src, &mut command, buffer, params)?
            }
        }
        debug_assert_eq!(command.write_offset_bytes(), cmd_size as usize);
    }

    tracing::trace!(
        cq_id = base.cq_id,
        cmd_size,
        pages = base.pages_per_txn,
        dst_page_index = base.dst_page_index,
        address = base.address,
        "issuing write transaction"
    );

    sysmem.issue_queue_push_back(cmd_size, base.cq_id)?;
    sysmem.fetch_queue_reserve_back(base.cq_id)?;
    sysmem.fetch_queue_write(cmd_size, base.cq_id)
}

/// Issue transactions until `params` has nothing left to write.
fn write_pages(
    device: &Device,
    src: &[u8],
    buffer: &Buffer,
    params: &mut WriteDispatchParams,
    constants: &BufferDispatchConstants,
) -> Result<()> {
    let host_alignment = device.settings().host_alignment;
    let sysmem = device.sysmem_manager();
    let cq_id = params.base().cq_id;
    let issue_queue_base = sysmem.get_issue_queue_base(cq_id)?;

    while params.has_pages_to_write() {
        let base = params.base_mut();
        base.issue_wait =
            base.total_pages_written == 0 && !base.waits_issued && !base.waits.is_empty();
        let num_waits = if base.issue_wait { base.waits.len() as u32 } else { 0 };
        let header_bytes = dispatch_write_size(0, host_alignment)
            + num_waits * dispatch_wait_size(host_alignment);

        if params.is_page_offset_out_of_bounds() {
            params.update_params_to_be_within_bounds();
        }

        let wr_ptr = sysmem.get_issue_queue_write_ptr(cq_id)?;
        let space =
            (constants.issue_queue_cmd_limit - wr_ptr).min(constants.max_prefetch_command_size);
        let num_pages_available =
            space.saturating_sub(header_bytes) / params.base().page_size_to_write;

        if num_pages_available == 0
            || !params.calculate_num_pages_for_write_transaction(num_pages_available)
        {
            if wr_ptr != issue_queue_base {
                sysmem.wrap_issue_queue_wr_ptr(cq_id)?;
                continue;
            }
            // a wrap frees no more room: the waits cannot share a command with any data
            if num_waits == 0 {
                return Err(DispatchError::PageTooLarge {
                    page_size: params.base().page_size_to_write,
                    max_data_size: constants.max_data_sizeb,
                });
            }
            let base = params.base_mut();
            issue_wait_command_sequence(device, cq_id, &base.waits)?;
            base.waits_issued = true;
            continue;
        }

        issue_buffer_dispatch_command_sequence(device, src, buffer, params)?;
        params.update_params_after_write_transaction();
    }
    Ok(())
}

fn write_sharded_buffer_to_core(
    device: &Device,
    src: &[u8],
    core_id: usize,
    buffer: &Buffer,
    params: &mut WriteDispatchParams,
    constants: &BufferDispatchConstants,
    core: CoreCoord,
) -> Result<()> {
    let WriteDispatchParams::Sharded(p) = params else {
        return Err(DispatchError::protocol("interleaved write routed to a shard core"));
    };

    let partials = p.num_partial_pages_per_full_page;
    let mut curr_page_idx_in_shard = 0;
    let num_pages = if p.width_split {
        let mapping = p
            .page_mapping
            .as_deref()
            .ok_or_else(|| DispatchError::protocol("width split write without a page mapping"))?;
        let shard_width = buffer.shard_spec().map_or(0, |spec| spec.shape_in_pages[1]);
        let (host_page, num_dev_pages) = calculate_pages_to_process_in_shard(
            core_id,
            mapping,
            shard_width,
            p.starting_dst_host_page_index,
            p.ending_dst_host_page_index,
        );
        if num_dev_pages == 0 {
            return Ok(());
        }
        p.base.dst_page_index =
            mapping.host_page_to_dev_page_mapping[host_page as usize] * partials;
        curr_page_idx_in_shard = mapping.host_page_to_local_shard_page_mapping[host_page as usize];
        num_dev_pages
    } else {
        let mut remaining_pages_in_shard = p.max_pages_per_shard;
        let skip = remaining_pages_in_shard
            .min(p.starting_dst_host_page_index - p.initial_pages_skipped);
        p.initial_pages_skipped += skip;
        curr_page_idx_in_shard += skip;
        remaining_pages_in_shard -= skip;
        p.base.dst_page_index = curr_page_idx_in_shard * partials;
        (p.base.total_pages_to_write / partials).min(remaining_pages_in_shard)
    };
    if num_pages == 0 {
        return Ok(());
    }

    let bank_base_address = if buffer.is_dram() {
        let bank = device.dram_channel_from_logical_core(core);
        buffer.address() + device.bank_offset(BufferType::Dram, bank)
    } else {
        buffer.address()
    };
    p.core = core;
    p.curr_page_idx_in_shard = curr_page_idx_in_shard * partials;
    p.num_pages_in_core = num_pages * partials;
    p.base.address = bank_base_address + p.curr_page_idx_in_shard * p.base.page_size_to_write;

    tracing::trace!(core_id, %core, num_pages, curr_page_idx_in_shard, "writing shard");

    write_pages(device, src, buffer, params, constants)
}

/// Copy `src` into `region` of `buffer` through command queue `cq_id`.
///
/// Returns once every transaction has been handed to the device. Fails before touching the
/// queue when the region or the page size cannot be served.
#[allow(clippy::too_many_arguments)]
#[tracing::instrument(
    level = "debug",
    skip_all,
    fields(cq_id = cq_id, offset = region.offset, size = region.size)
)]
pub fn write_to_device_buffer(
    device: &Device,
    src: &[u8],
    buffer: &Buffer,
    region: &BufferRegion,
    cq_id: u8,
    expected_num_workers_completed: &[u32],
    dispatch_core_type: DispatchCoreType,
    sub_device_ids: &[SubDeviceId],
) -> Result<()> {
    if buffer.device_id() != device.id() {
        return Err(DispatchError::InvalidBuffer(format!(
            "buffer belongs to device {}, not device {}",
            buffer.device_id(),
            device.id()
        )));
    }
    validate_buffer_region_conditions(buffer, region)?;
    if src.len() < region.size as usize {
        return Err(DispatchError::invalid_region(
            region.offset,
            region.size,
            format!("source holds only {} bytes", src.len()),
        ));
    }

    let constants = generate_buffer_dispatch_constants(device, dispatch_core_type, cq_id)?;
    let waits = dispatch_waits(device, expected_num_workers_completed, sub_device_ids)?;
    let _issue = device.sysmem_manager().issue_queue_lock(cq_id)?;

    if buffer.is_sharded() {
        let mut params = initialize_sharded_buf_dispatch_params(
            device, buffer, &constants, cq_id, waits, region,
        )?;
        let (width_split, mapping) = match &params {
            WriteDispatchParams::Sharded(p) => (p.width_split, p.page_mapping.clone()),
            _ => (false, None),
        };
        let cores = get_cores_for_sharded_buffer(width_split, mapping.as_deref(), buffer)?;
        for (core_id, core) in cores.into_iter().enumerate().take(buffer.num_cores() as usize) {
            write_sharded_buffer_to_core(
                device,
                src,
                core_id,
                buffer,
                &mut params,
                &constants,
                core,
            )?;
        }
    } else {
        let mut params = initialize_interleaved_buf_dispatch_params(
            device, buffer, &constants, cq_id, waits, region,
        )?;
        write_pages(device, src, buffer, &mut params, &constants)?;
    }
    Ok(())
}
