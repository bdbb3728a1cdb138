// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Copying read results out of the completion queue.
//!
//! Each read command produces one completion record: a 16-byte host write header followed by
//! `num_pages_read` pages of `padded_page_size` bytes. The record is drained in pops of whole
//! transfer pages, so page boundaries and pop boundaries need not line up. A
//! [`CompletionCursor`] carries the position inside the record from one pop to the next.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::buffer::BufferPageMapping;
use crate::command::CQ_CMD_SIZE;
use crate::device::Device;
use crate::error::{DispatchError, Result};

/// Where the pages of one completion record belong in the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadBufferDescriptor {
    pub page_size: u32,
    pub padded_page_size: u32,
    /// Destination offset of the first page when pages land contiguously
    pub dst_offset: u32,
    pub num_pages_read: u32,
    pub starting_dev_page_id: u32,
    pub starting_host_page_id: u32,
    /// Present for width split buffers: pages land at their host page instead
    pub page_mapping: Option<Arc<BufferPageMapping>>,
}

impl ReadBufferDescriptor {
    /// Bytes of the completion record, header included.
    pub fn record_size(&self) -> u32 {
        self.num_pages_read * self.padded_page_size + CQ_CMD_SIZE
    }
}

/// Position inside one completion record.
#[derive(Debug)]
pub(crate) struct CompletionCursor<'a> {
    descriptor: &'a ReadBufferDescriptor,
    header_remaining: usize,
    page_index: u32,
    page_offset: u32,
}

impl<'a> CompletionCursor<'a> {
    pub(crate) fn new(descriptor: &'a ReadBufferDescriptor) -> Self {
        Self {
            descriptor,
            header_remaining: CQ_CMD_SIZE as usize,
            page_index: 0,
            page_offset: 0,
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.header_remaining == 0 && self.page_index == self.descriptor.num_pages_read
    }

    /// Destination offset of page `page_index`, or `None` for shard padding.
    fn dst_page_start(&self, page_index: u32) -> Result<Option<usize>> {
        let d = self.descriptor;
        let Some(mapping) = &d.page_mapping else {
            return Ok(Some(d.dst_offset as usize + page_index as usize * d.page_size as usize));
        };

        let dev_page = d.starting_dev_page_id + page_index;
        let host_page = mapping
            .dev_page_to_host_page_mapping
            .get(dev_page as usize)
            .copied()
            .ok_or_else(|| {
                DispatchError::protocol(format!(
                    "device page {dev_page} is not in the page mapping"
                ))
            })?;
        let Some(host_page) = host_page else {
            return Ok(None);
        };
        let relative = host_page.checked_sub(d.starting_host_page_id).ok_or_else(|| {
            DispatchError::protocol(format!(
                "host page {host_page} precedes the first page {} of the read",
                d.starting_host_page_id
            ))
        })?;
        Ok(Some(relative as usize * d.page_size as usize))
    }

    /// Copy the data bytes of `chunk`, the next bytes of the record, into `dst`.
    pub(crate) fn consume(&mut self, chunk: &[u8], dst: &mut [u8]) -> Result<()> {
        let skip = self.header_remaining.min(chunk.len());
        self.header_remaining -= skip;
        let mut chunk = &chunk[skip..];

        let d = self.descriptor;
        let padded = d.padded_page_size as usize;
        let page_size = d.page_size as usize;

        if page_size == padded && d.page_mapping.is_none() {
            if chunk.is_empty() {
                return Ok(());
            }
            let position = self.page_index as usize * padded + self.page_offset as usize;
            copy_into(dst, d.dst_offset as usize + position, chunk)?;
            let end = position + chunk.len();
            self.page_index = (end / padded) as u32;
            self.page_offset = (end % padded) as u32;
            return Ok(());
        }

        while !chunk.is_empty() {
            if self.page_index >= d.num_pages_read {
                return Err(DispatchError::protocol(format!(
                    "completion record holds more than {} pages",
                    d.num_pages_read
                )));
            }
            let offset = self.page_offset as usize;
            let take = (padded - offset).min(chunk.len());
            if offset < page_size {
                let len = (page_size - offset).min(take);
                if let Some(page_start) = self.dst_page_start(self.page_index)? {
                    copy_into(dst, page_start + offset, &chunk[..len])?;
                }
            }

            chunk = &chunk[take..];
            self.page_offset += take as u32;
            if self.page_offset as usize == padded {
                self.page_offset = 0;
                self.page_index += 1;
            }
        }
        Ok(())
    }
}

fn copy_into(dst: &mut [u8], at: usize, src: &[u8]) -> Result<()> {
    let dst_len = dst.len();
    let target = dst.get_mut(at..at + src.len()).ok_or_else(|| {
        DispatchError::protocol(format!(
            "completion bytes {at}..{} fall outside a destination of {dst_len} bytes",
            at + src.len()
        ))
    })?;
    target.copy_from_slice(src);
    Ok(())
}

/// Drain the completion record described by `descriptor` from queue `cq_id` into `dst`.
///
/// Blocks until the whole record has arrived. Fails with [`DispatchError::ReadAborted`] once
/// `exit_condition` is raised; the rest of the record is left in the queue.
#[tracing::instrument(
    level = "debug",
    skip_all,
    fields(cq_id = cq_id, pages = descriptor.num_pages_read)
)]
pub fn copy_completion_queue_data_into_user_space(
    device: &Device,
    descriptor: &ReadBufferDescriptor,
    cq_id: u8,
    dst: &mut [u8],
    exit_condition: &AtomicBool,
) -> Result<()> {
    if descriptor.num_pages_read == 0 {
        return Ok(());
    }

    let sysmem = device.sysmem_manager();
    let transfer_page_size = device.settings().transfer_page_size;
    let mut cursor = CompletionCursor::new(descriptor);
    let mut remaining = descriptor.record_size();
    let mut scratch = Vec::new();

    while remaining > 0 {
        let write_ptr = sysmem.completion_queue_wait_front(cq_id, exit_condition)?;
        if exit_condition.load(Ordering::Acquire) {
            return Err(DispatchError::ReadAborted { cq_id });
        }
        let read_ptr = sysmem.get_completion_queue_read_ptr(cq_id)?;
        let read_toggle = sysmem.get_completion_queue_read_toggle(cq_id)?;

        // a pop never crosses the end of the ring
        let available = if write_ptr.ptr > read_ptr && write_ptr.toggle == read_toggle {
            write_ptr.ptr - read_ptr
        } else {
            sysmem.get_completion_queue_limit(cq_id)? - read_ptr
        };
        let transferred = remaining.min(available);

        scratch.resize(transferred as usize, 0);
        sysmem.read_completion_queue(cq_id, read_ptr, &mut scratch)?;
        cursor.consume(&scratch, dst)?;
        remaining -= transferred;

        let num_pages = transferred.div_ceil(transfer_page_size);
        tracing::trace!(
            cq_id,
            read_ptr,
            transferred,
            num_pages,
            remaining,
            "popping completion queue"
        );
        sysmem.completion_queue_pop_front(num_pages, cq_id)?;
    }

    debug_assert!(cursor.is_done());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{ShardOrientation, ShardSpec};
    use crate::config::DispatchSettings;
    use crate::core_coord::{CoreCoord, CoreRange, corerange_to_cores};
    use crate::device::DeviceConfig;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use rstest::rstest;

    /// Record bytes for `pages`, each padded with 0xFF to `padded` bytes.
    fn record(pages: &[Vec<u8>], padded: usize) -> Vec<u8> {
        let mut bytes = vec![0xEE; CQ_CMD_SIZE as usize];
        for page in pages {
            bytes.extend_from_slice(page);
            bytes.resize(bytes.len() + padded - page.len(), 0xFF);
        }
        bytes
    }

    fn pages(num_pages: u32, page_size: u32) -> Vec<Vec<u8>> {
        (0..num_pages)
            .map(|p| (0..page_size).map(|b| (p * 31 + b) as u8 % 0xE0).collect())
            .collect()
    }

    fn feed(cursor: &mut CompletionCursor<'_>, bytes: &[u8], cuts: &[usize], dst: &mut [u8]) {
        let mut at = 0;
        for cut in cuts.iter().cycle() {
            if at == bytes.len() {
                break;
            }
            let end = (at + cut).min(bytes.len());
            cursor.consume(&bytes[at..end], dst).unwrap();
            at = end;
        }
    }

    proptest! {
        #[test]
        fn prop_pages_survive_any_pop_boundaries(
            page_size in 1u32..160,
            num_pages in 1u32..24,
            dst_pages in 0u32..3,
            cuts in prop::collection::vec(1usize..400, 1..16),
        ) {
            let padded = page_size.next_multiple_of(32);
            let data = pages(num_pages, page_size);
            let bytes = record(&data, padded as usize);

            let descriptor = ReadBufferDescriptor {
                page_size,
                padded_page_size: padded,
                dst_offset: dst_pages * page_size,
                num_pages_read: num_pages,
                starting_dev_page_id: 0,
                starting_host_page_id: 0,
                page_mapping: None,
            };
            prop_assert_eq!(descriptor.record_size() as usize, bytes.len());

            let mut dst = vec![0u8; ((num_pages + dst_pages) * page_size) as usize];
            let mut cursor = CompletionCursor::new(&descriptor);
            feed(&mut cursor, &bytes, &cuts, &mut dst);

            let expected = data.concat();
            prop_assert!(cursor.is_done());
            prop_assert!(dst[..(dst_pages * page_size) as usize].iter().all(|&b| b == 0));
            prop_assert_eq!(&dst[(dst_pages * page_size) as usize..], expected.as_slice());
        }
    }

    #[rstest]
    #[case(&[1])]
    #[case(&[16])]
    #[case(&[7, 33])]
    #[case(&[100])]
    #[case(&[4096])]
    fn test_mapped_pages_skip_padding(#[case] cuts: &[usize]) {
        // 4x6 pages in 2x4 shards; the shard on core 1 is clipped to width 2
        let spec = ShardSpec::new(
            CoreRange::new(CoreCoord::new(0, 0), CoreCoord::new(3, 0)),
            [2, 4],
            ShardOrientation::RowMajor,
            [4, 6],
        );
        let cores = corerange_to_cores(&spec.grid, Some(spec.num_shards()), true);
        let mapping = Arc::new(BufferPageMapping::generate(&spec, cores));

        // whole shard of core 1: host pages 4, 5, pad, pad, 10, 11, pad, pad
        let page_size = 24;
        let data = pages(8, page_size);
        let bytes = record(&data, 32);
        let descriptor = ReadBufferDescriptor {
            page_size,
            padded_page_size: 32,
            dst_offset: 0,
            num_pages_read: 8,
            starting_dev_page_id: 8,
            starting_host_page_id: 0,
            page_mapping: Some(mapping),
        };

        let mut dst = vec![0u8; 24 * page_size as usize];
        let mut cursor = CompletionCursor::new(&descriptor);
        feed(&mut cursor, &bytes, cuts, &mut dst);
        assert!(cursor.is_done());

        let host = |p: usize| &dst[p * 24..(p + 1) * 24];
        assert_eq!(host(4), data[0].as_slice());
        assert_eq!(host(5), data[1].as_slice());
        assert_eq!(host(10), data[4].as_slice());
        assert_eq!(host(11), data[5].as_slice());
        let written: usize = dst.iter().filter(|&&b| b != 0).count();
        let expected: usize = [0, 1, 4, 5]
            .iter()
            .map(|&i| data[i].iter().filter(|&&b| b != 0).count())
            .sum();
        assert_eq!(written, expected);
    }

    #[test]
    fn test_destination_overflow_is_an_error() {
        let descriptor = ReadBufferDescriptor {
            page_size: 32,
            padded_page_size: 32,
            dst_offset: 32,
            num_pages_read: 2,
            starting_dev_page_id: 0,
            starting_host_page_id: 0,
            page_mapping: None,
        };
        let bytes = record(&pages(2, 32), 32);
        let mut dst = vec![0u8; 64];
        let mut cursor = CompletionCursor::new(&descriptor);
        assert_matches!(cursor.consume(&bytes, &mut dst), Err(DispatchError::QueueProtocol(_)));
    }

    #[test]
    fn test_empty_queue_with_exit_flag_aborts() {
        let device = Device::open(DeviceConfig::default(), DispatchSettings::default()).unwrap();
        let descriptor = ReadBufferDescriptor {
            page_size: 64,
            padded_page_size: 64,
            dst_offset: 0,
            num_pages_read: 1,
            starting_dev_page_id: 0,
            starting_host_page_id: 0,
            page_mapping: None,
        };
        let mut dst = vec![0u8; 64];
        let exit = AtomicBool::new(true);
        assert_matches!(
            copy_completion_queue_data_into_user_space(&device, &descriptor, 0, &mut dst, &exit),
            Err(DispatchError::ReadAborted { cq_id: 0 })
        );

        let nothing = ReadBufferDescriptor {
            num_pages_read: 0,
            ..descriptor
        };
        assert!(
            copy_completion_queue_data_into_user_space(&device, &nothing, 0, &mut dst, &exit)
                .is_ok()
        );
    }
}
