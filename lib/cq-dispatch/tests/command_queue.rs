// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

mod common;

use anyhow::Result;
use assert_matches::assert_matches;
use std::sync::Arc;

use cq_dispatch::dispatch::write_to_device_buffer;
use cq_dispatch::{
    BufferLayout, BufferRegion, BufferType, CommandQueue, DeviceConfig, DispatchCoreType,
    DispatchError, DispatchSettings, ErrorKind, SubDeviceId,
};

use common::{interleaved, open_device, pattern, queue, queue_with, sharded, small_issue_queue};

#[test]
fn test_back_to_back_reads_then_finish() -> Result<()> {
    let cq = queue()?;
    let buffer = interleaved(cq.device(), BufferType::Dram, 2048, 40)?;
    let src = pattern(2048 * 40, 1);
    cq.enqueue_write_buffer(&buffer, &src, false)?;

    let whole = cq.enqueue_read_buffer(&buffer, false)?;
    let region = BufferRegion::new(2048 * 7, 2048 * 20);
    let part = cq.enqueue_read_sub_buffer(&buffer, &region, false)?;
    assert_eq!(cq.num_pending_reads(), 2);

    cq.finish()?;
    assert_eq!(cq.num_pending_reads(), 0);
    assert_eq!(whole.to_vec(), src);
    assert_eq!(part.to_vec(), &src[2048 * 7..2048 * 27]);
    Ok(())
}

#[test]
fn test_blocking_read_drains_earlier_reads() -> Result<()> {
    let cq = queue()?;
    let a = interleaved(cq.device(), BufferType::L1, 512, 64)?;
    let b = interleaved(cq.device(), BufferType::Dram, 300, 10)?;
    let (src_a, src_b) = (pattern(512 * 64, 2), pattern(300 * 10, 3));
    cq.enqueue_write_buffer(&a, &src_a, false)?;
    cq.enqueue_write_buffer(&b, &src_b, true)?;

    let out_a = cq.enqueue_read_buffer(&a, false)?;
    let out_b = cq.enqueue_read_buffer(&b, true)?;
    assert_eq!(cq.num_pending_reads(), 0);
    assert_eq!(out_a.to_vec(), src_a);
    assert_eq!(out_b.to_vec(), src_b);
    Ok(())
}

#[test]
fn test_abort_fails_pending_reads() -> Result<()> {
    let cq = queue()?;
    let buffer = interleaved(cq.device(), BufferType::Dram, 1024, 8)?;
    cq.enqueue_write_buffer(&buffer, &pattern(1024 * 8, 4), false)?;

    let out = cq.enqueue_read_buffer(&buffer, false)?;
    cq.abort();
    let err = cq.finish().unwrap_err();
    assert_matches!(err, DispatchError::ReadAborted { cq_id: 0 });
    assert_eq!(err.kind(), ErrorKind::Aborted);
    assert_eq!(cq.num_pending_reads(), 0);
    assert!(out.to_vec().iter().all(|&b| b == 0));
    Ok(())
}

#[test]
fn test_queues_driven_from_threads() -> Result<()> {
    let config = DeviceConfig::builder().num_hw_cqs(2).build()?;
    let device = open_device(config, DispatchSettings::default())?;

    std::thread::scope(|s| {
        let handles: Vec<_> = (0..2u8)
            .map(|cq_id| {
                let device = device.clone();
                s.spawn(move || -> Result<()> {
                    let cq = CommandQueue::new(device, cq_id)?;
                    let page_size = 1000 + u32::from(cq_id) * 24;
                    let buffer = interleaved(cq.device(), BufferType::Dram, page_size, 300)?;
                    for round in 0..8u8 {
                        let src = pattern(buffer.size() as usize, round * 2 + cq_id);
                        cq.enqueue_write_buffer(&buffer, &src, false)?;
                        let out = cq.enqueue_read_buffer(&buffer, true)?;
                        anyhow::ensure!(
                            out.to_vec() == src,
                            "queue {cq_id} round {round} read back other data"
                        );
                    }
                    Ok(())
                })
            })
            .collect();
        handles
            .into_iter()
            .try_for_each(|h| h.join().map_err(|_| anyhow::anyhow!("queue thread panicked"))?)
    })
}

#[test]
fn test_one_queue_shared_by_threads() -> Result<()> {
    // a small issue queue so that threads wrap it often
    let cq = Arc::new(queue_with(small_issue_queue())?);

    std::thread::scope(|s| {
        let handles: Vec<_> = (0..4u8)
            .map(|thread| {
                let cq = Arc::clone(&cq);
                s.spawn(move || -> Result<()> {
                    let buffer_type =
                        if thread % 2 == 0 { BufferType::Dram } else { BufferType::L1 };
                    let page_size = 1000 + u32::from(thread) * 24;
                    let buffer = interleaved(cq.device(), buffer_type, page_size, 12)?;
                    for round in 0..50u8 {
                        let seed = round.wrapping_mul(4).wrapping_add(thread);
                        let src = pattern(buffer.size() as usize, seed);
                        cq.enqueue_write_buffer(&buffer, &src, false)?;
                        let out = cq.enqueue_read_buffer(&buffer, true)?;
                        anyhow::ensure!(
                            out.to_vec() == src,
                            "thread {thread} round {round} read back other data"
                        );
                    }
                    Ok(())
                })
            })
            .collect();
        handles
            .into_iter()
            .try_for_each(|h| h.join().map_err(|_| anyhow::anyhow!("queue thread panicked"))?)
    })?;
    assert_eq!(cq.num_pending_reads(), 0);
    Ok(())
}

#[test]
fn test_failed_read_keeps_issued_commands_pending() -> Result<()> {
    let cq = queue()?;
    let page_size = 64;
    let buffer = sharded(
        cq.device(),
        BufferType::L1,
        BufferLayout::HeightSharded,
        page_size,
        (4, 1),
        [16, 4],
        [64, 4],
    )?;
    let src = pattern((page_size * 256) as usize, 9);
    cq.enqueue_write_buffer(&buffer, &src, false)?;

    // the first two shard cores are read, the third is rejected
    cq.device().simulator().fail_after(2);
    let err = cq.enqueue_read_buffer(&buffer, true).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert_eq!(cq.num_pending_reads(), 2);

    cq.finish()?;
    assert_eq!(cq.num_pending_reads(), 0);
    assert_eq!(cq.device().sysmem_manager().completion_queue_backlog(0)?, 0);

    // the queue is back in step
    let region = BufferRegion::new(page_size * 100, page_size * 100);
    let out = cq.enqueue_read_sub_buffer(&buffer, &region, true)?;
    assert_eq!(out.to_vec(), &src[(page_size * 100) as usize..(page_size * 200) as usize]);
    Ok(())
}

#[test]
fn test_engines_wait_on_stall_group_without_ids() -> Result<()> {
    let config = DeviceConfig::builder().num_sub_devices(2).build()?;
    let device = open_device(config, DispatchSettings::default())?;
    let buffer = interleaved(&device, BufferType::Dram, 256, 4)?;
    let src = pattern(256 * 4, 10);

    // sub-device 1 has not finished its worker, so a wait on the stall group fails
    device.simulator().complete_workers(SubDeviceId(0), 1)?;
    let err = write_to_device_buffer(
        &device,
        &src,
        &buffer,
        &buffer.whole_region(),
        0,
        &[1, 1],
        DispatchCoreType::Worker,
        &[],
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);

    device.simulator().complete_workers(SubDeviceId(1), 1)?;
    write_to_device_buffer(
        &device,
        &src,
        &buffer,
        &buffer.whole_region(),
        0,
        &[1, 1],
        DispatchCoreType::Worker,
        &[],
    )?;

    let cq = CommandQueue::new(device, 0)?;
    cq.set_expected_num_workers_completed(vec![1, 1])?;
    assert_eq!(cq.enqueue_read_buffer(&buffer, true)?.to_vec(), src);
    Ok(())
}

/// Settings where sixteen waits leave no room for data in the same command.
fn tight_prefetch() -> DispatchSettings {
    DispatchSettings {
        worker_max_prefetch_cmd_size: 512,
        ethernet_max_prefetch_cmd_size: 512,
        issue_queue_size: 1024,
        ..DispatchSettings::default()
    }
}

#[test]
fn test_waits_on_many_sub_devices() -> Result<()> {
    let config = DeviceConfig::builder().num_sub_devices(16).build()?;
    let device = open_device(config, tight_prefetch())?;
    for id in 0..16 {
        device.simulator().complete_workers(SubDeviceId(id), 1)?;
    }

    let cq = CommandQueue::new(device, 0)?;
    cq.set_expected_num_workers_completed(vec![1; 16])?;
    let buffer = interleaved(cq.device(), BufferType::L1, 256, 8)?;
    let src = pattern(256 * 8, 5);
    cq.enqueue_write_buffer(&buffer, &src, false)?;
    assert_eq!(cq.enqueue_read_buffer(&buffer, true)?.to_vec(), src);

    // a single wait shares the command with the first page
    cq.set_sub_device_ids(vec![SubDeviceId(5)])?;
    let src = pattern(256 * 8, 6);
    cq.enqueue_write_buffer(&buffer, &src, false)?;
    assert_eq!(cq.enqueue_read_buffer(&buffer, true)?.to_vec(), src);
    Ok(())
}

#[test]
fn test_unmet_wait_is_reported() -> Result<()> {
    let config = DeviceConfig::builder().num_sub_devices(16).build()?;
    let device = open_device(config, tight_prefetch())?;
    for id in 0..16 {
        device.simulator().complete_workers(SubDeviceId(id), 1)?;
    }

    let cq = CommandQueue::new(device, 0)?;
    let mut expected = vec![1; 16];
    expected[3] = 2;
    cq.set_expected_num_workers_completed(expected)?;
    let buffer = interleaved(cq.device(), BufferType::L1, 256, 8)?;

    let err = cq
        .enqueue_write_buffer(&buffer, &pattern(256 * 8, 7), false)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
    Ok(())
}

#[test]
fn test_out_of_memory_is_reported() -> Result<()> {
    let cq = queue()?;
    // 1400 pages of 1 KiB in each of the 64 L1 banks
    let err = interleaved(cq.device(), BufferType::L1, 1024, 64 * 1400).unwrap_err();
    let err = err.downcast::<DispatchError>()?;
    assert_matches!(
        err,
        DispatchError::OutOfMemory {
            buffer_type: BufferType::L1,
            ..
        }
    );
    assert_eq!(err.kind(), ErrorKind::Configuration);

    let big = interleaved(cq.device(), BufferType::L1, 1024, 64 * 600)?;
    assert_matches!(interleaved(cq.device(), BufferType::L1, 1024, 64 * 900), Err(_));
    drop(big);
    assert!(interleaved(cq.device(), BufferType::L1, 1024, 64 * 900).is_ok());
    Ok(())
}
