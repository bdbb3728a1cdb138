// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Enqueue surface over one hardware command queue.
//!
//! Writes are complete once their command sequences are in the issue queue. Reads are
//! recorded as pending descriptors and drained from the completion queue in the order they
//! were issued, either immediately (blocking) or by [`CommandQueue::finish`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::buffer::{Buffer, BufferRegion};
use crate::device::{Device, SubDeviceId};
use crate::dispatch::{
    ReadBufferDescriptor, copy_completion_queue_data_into_user_space,
    copy_interleaved_buffer_to_completion_queue, copy_sharded_buffer_from_core_to_completion_queue,
    generate_interleaved_buffer_read_descriptor, generate_sharded_buffer_read_descriptor,
    get_cores_for_sharded_buffer, initialize_interleaved_buf_read_dispatch_params,
    initialize_sharded_buf_read_dispatch_params, select_sub_device_ids, write_to_device_buffer,
};
use crate::error::{DispatchError, Result};

/// Host memory a read lands in. Filled once the read has been drained.
#[derive(Debug, Clone, Default)]
pub struct HostBuffer(Arc<Mutex<Vec<u8>>>);

impl HostBuffer {
    pub fn new(size: usize) -> Self {
        Self(Arc::new(Mutex::new(vec![0; size])))
    }

    /// Copy of the current contents.
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

#[derive(Debug)]
struct PendingRead {
    descriptor: ReadBufferDescriptor,
    dst: HostBuffer,
}

#[derive(Debug)]
pub struct CommandQueue {
    device: Arc<Device>,
    cq_id: u8,
    expected_num_workers_completed: Mutex<Vec<u32>>,
    sub_device_ids: Mutex<Vec<SubDeviceId>>,
    pending_reads: Mutex<VecDeque<PendingRead>>,
    exit_condition: Arc<AtomicBool>,
}

impl CommandQueue {
    pub fn new(device: Arc<Device>, cq_id: u8) -> Result<Self> {
        if cq_id >= device.num_hw_cqs() {
            return Err(DispatchError::InvalidQueue {
                cq_id,
                num_hw_cqs: device.num_hw_cqs(),
            });
        }
        let num_sub_devices = device.num_sub_devices() as usize;
        Ok(Self {
            device,
            cq_id,
            expected_num_workers_completed: Mutex::new(vec![0; num_sub_devices]),
            sub_device_ids: Mutex::new(Vec::new()),
            pending_reads: Mutex::new(VecDeque::new()),
            exit_condition: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn id(&self) -> u8 {
        self.cq_id
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Flag that aborts reads once set.
    pub fn exit_condition(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.exit_condition)
    }

    /// Worker counts every later command waits for, indexed by sub-device.
    pub fn set_expected_num_workers_completed(&self, counts: Vec<u32>) -> Result<()> {
        let num_sub_devices = self.device.num_sub_devices();
        if counts.len() != num_sub_devices as usize {
            return Err(DispatchError::InvalidSubDevice {
                index: counts.len().min(u8::MAX as usize) as u8,
                num_sub_devices,
            });
        }
        *self.expected_num_workers_completed.lock() = counts;
        Ok(())
    }

    /// Sub-devices later commands wait on. Empty selects the device's stall group.
    pub fn set_sub_device_ids(&self, ids: Vec<SubDeviceId>) -> Result<()> {
        select_sub_device_ids(&self.device, &ids)?;
        *self.sub_device_ids.lock() = ids;
        Ok(())
    }

    fn dispatch_targets(&self) -> Result<(Vec<u32>, Vec<SubDeviceId>)> {
        let expected = self.expected_num_workers_completed.lock().clone();
        let ids = select_sub_device_ids(&self.device, &self.sub_device_ids.lock())?;
        Ok((expected, ids))
    }

    pub fn enqueue_write_buffer(&self, buffer: &Buffer, src: &[u8], blocking: bool) -> Result<()> {
        self.enqueue_write_sub_buffer(buffer, src, &buffer.whole_region(), blocking)
    }

    pub fn enqueue_write_sub_buffer(
        &self,
        buffer: &Buffer,
        src: &[u8],
        region: &BufferRegion,
        blocking: bool,
    ) -> Result<()> {
        let (expected, ids) = self.dispatch_targets()?;
        write_to_device_buffer(
            &self.device,
            src,
            buffer,
            region,
            self.cq_id,
            &expected,
            self.device.dispatch_core_type(),
            &ids,
        )?;
        if blocking {
            self.finish()?;
        }
        Ok(())
    }

    pub fn enqueue_read_buffer(&self, buffer: &Buffer, blocking: bool) -> Result<HostBuffer> {
        self.enqueue_read_sub_buffer(buffer, &buffer.whole_region(), blocking)
    }

    /// Read `region` of `buffer`.
    ///
    /// A blocking read returns with the data in place. A non-blocking read returns a handle
    /// filled by the next [`Self::finish`]. When issuing fails part way through, the commands
    /// already issued stay pending so the completion queue and the pending reads stay in step.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(cq_id = self.cq_id, offset = region.offset, size = region.size, blocking = blocking)
    )]
    pub fn enqueue_read_sub_buffer(
        &self,
        buffer: &Buffer,
        region: &BufferRegion,
        blocking: bool,
    ) -> Result<HostBuffer> {
        let (expected, ids) = self.dispatch_targets()?;
        let dst = HostBuffer::new(region.size as usize);

        // issue order must match drain order
        let mut pending = self.pending_reads.lock();
        let mut descriptors = Vec::new();
        let issued = self.issue_read(buffer, region, &expected, &ids, &mut descriptors);

        tracing::debug!(cq_id = self.cq_id, transactions = descriptors.len(), "read issued");
        pending.extend(descriptors.into_iter().map(|descriptor| PendingRead {
            descriptor,
            dst: dst.clone(),
        }));
        issued?;

        if blocking {
            self.drain(&mut pending)?;
        }
        Ok(dst)
    }

    /// Issue the read commands for `region`, recording a descriptor per issued command.
    fn issue_read(
        &self,
        buffer: &Buffer,
        region: &BufferRegion,
        expected: &[u32],
        ids: &[SubDeviceId],
        descriptors: &mut Vec<ReadBufferDescriptor>,
    ) -> Result<()> {
        if buffer.is_sharded() {
            let mut params = initialize_sharded_buf_read_dispatch_params(
                &self.device,
                buffer,
                self.cq_id,
                expected,
                ids,
                region,
            )?;
            let mapping = params.page_mapping.clone();
            let cores =
                get_cores_for_sharded_buffer(params.width_split, mapping.as_deref(), buffer)?;
            for (core_id, core) in cores.into_iter().enumerate().take(buffer.num_cores() as usize) {
                copy_sharded_buffer_from_core_to_completion_queue(
                    &self.device,
                    core_id,
                    buffer,
                    &mut params,
                    core,
                )?;
                if params.base.pages_per_txn > 0 {
                    descriptors.push(generate_sharded_buffer_read_descriptor(&mut params, buffer));
                }
            }
        } else {
            let mut params = initialize_interleaved_buf_read_dispatch_params(
                &self.device,
                buffer,
                self.cq_id,
                expected,
                ids,
                region,
            )?;
            copy_interleaved_buffer_to_completion_queue(&self.device, buffer, &mut params)?;
            if params.pages_per_txn > 0 {
                descriptors.push(generate_interleaved_buffer_read_descriptor(&params, buffer));
            }
        }
        Ok(())
    }

    /// Drain every pending read, oldest first.
    pub fn finish(&self) -> Result<()> {
        let mut pending = self.pending_reads.lock();
        self.drain(&mut pending)
    }

    fn drain(&self, pending: &mut VecDeque<PendingRead>) -> Result<()> {
        while let Some(read) = pending.pop_front() {
            let mut dst = read.dst.0.lock();
            if let Err(e) = copy_completion_queue_data_into_user_space(
                &self.device,
                &read.descriptor,
                self.cq_id,
                &mut dst,
                &self.exit_condition,
            ) {
                tracing::warn!(
                    cq_id = self.cq_id,
                    dropped = pending.len(),
                    error = %e,
                    "abandoning pending reads"
                );
                pending.clear();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Number of read transactions not yet drained.
    pub fn num_pending_reads(&self) -> usize {
        self.pending_reads.lock().len()
    }

    /// Raise the exit flag. Every read still to be drained fails, and the completion queue is
    /// left mid-record.
    pub fn abort(&self) {
        self.exit_condition.store(true, Ordering::Release);
    }
}
