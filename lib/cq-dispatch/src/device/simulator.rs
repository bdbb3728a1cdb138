// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process stand-in for the prefetch and dispatch firmware.
//!
//! Command sequences are executed synchronously when the host announces them through the
//! fetch queue. DRAM channels and worker L1s are sparse: memory is backed in 4 KiB chunks
//! on first write and unwritten memory reads back as zeros.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::soc::{MemoryEndpoint, SocDescriptor};
use super::SubDeviceId;
use crate::buffer::BufferType;
use crate::command::{
    CQ_CMD_SIZE, CqDispatchWaitCmd, CqDispatchWriteHostCmd, CqDispatchWriteLinearCmd,
    CqDispatchWritePagedCmd, CqPrefetchRelayLinearCmd, CqPrefetchRelayPagedCmd, DeviceCommandRecord,
    decode_command_sequence,
};
use crate::config::DispatchSettings;
use crate::error::{DispatchError, Result};
use crate::sysmem::{CommandProcessor, CompletionSink};

/// Granularity of simulated memory. Chunks are allocated on first write.
const MEMORY_CHUNK_SIZE: usize = 4096;

#[derive(Debug, Default)]
struct DeviceMemory {
    chunks: HashMap<(MemoryEndpoint, u32), Box<[u8; MEMORY_CHUNK_SIZE]>>,
}

impl DeviceMemory {
    fn read(&self, endpoint: MemoryEndpoint, addr: u32, out: &mut [u8]) {
        let mut addr = addr as usize;
        let mut done = 0;
        while done < out.len() {
            let offset = addr % MEMORY_CHUNK_SIZE;
            let len = (MEMORY_CHUNK_SIZE - offset).min(out.len() - done);
            let target = &mut out[done..done + len];
            match self.chunks.get(&(endpoint, (addr / MEMORY_CHUNK_SIZE) as u32)) {
                Some(chunk) => target.copy_from_slice(&chunk[offset..offset + len]),
                None => target.fill(0),
            }
            addr += len;
            done += len;
        }
    }

    fn write(&mut self, endpoint: MemoryEndpoint, addr: u32, data: &[u8]) {
        let mut addr = addr as usize;
        let mut done = 0;
        while done < data.len() {
            let offset = addr % MEMORY_CHUNK_SIZE;
            let len = (MEMORY_CHUNK_SIZE - offset).min(data.len() - done);
            let chunk = self
                .chunks
                .entry((endpoint, (addr / MEMORY_CHUNK_SIZE) as u32))
                .or_insert_with(|| Box::new([0; MEMORY_CHUNK_SIZE]));
            chunk[offset..offset + len].copy_from_slice(&data[done..done + len]);
            addr += len;
            done += len;
        }
    }
}

/// Host write waiting for the relay that supplies its payload.
struct PendingHostWrite {
    record: Vec<u8>,
    length: usize,
}

#[derive(Debug)]
pub struct SimulatedDevice {
    soc: Arc<SocDescriptor>,
    host_alignment: u32,
    dispatch_message_addr: u32,
    dispatch_message_stride: u32,
    memory: Mutex<DeviceMemory>,
    workers_completed: Mutex<Vec<u32>>,
    /// Command sequences still accepted before a fault
    fault_after: Mutex<Option<u32>>,
}

impl SimulatedDevice {
    pub fn new(soc: Arc<SocDescriptor>, settings: &DispatchSettings, num_sub_devices: u8) -> Self {
        Self {
            soc,
            host_alignment: settings.host_alignment,
            dispatch_message_addr: settings.dispatch_message_addr,
            dispatch_message_stride: settings.dispatch_message_stride,
            memory: Mutex::new(DeviceMemory::default()),
            workers_completed: Mutex::new(vec![0; num_sub_devices as usize]),
            fault_after: Mutex::new(None),
        }
    }

    /// Reject the command sequence that follows the next `sequences` ones, as a device that
    /// stops responding would. Later sequences run normally.
    pub fn fail_after(&self, sequences: u32) {
        *self.fault_after.lock() = Some(sequences);
    }

    fn take_fault(&self) -> bool {
        let mut fault = self.fault_after.lock();
        match fault.as_mut() {
            Some(0) => {
                *fault = None;
                true
            }
            Some(remaining) => {
                *remaining -= 1;
                false
            }
            None => false,
        }
    }

    /// Record `count` more finished workers on `sub_device`.
    pub fn complete_workers(&self, sub_device: SubDeviceId, count: u32) -> Result<()> {
        let mut completed = self.workers_completed.lock();
        let num_sub_devices = completed.len() as u8;
        let slot = completed
            .get_mut(sub_device.to_index())
            .ok_or(DispatchError::InvalidSubDevice {
                index: sub_device.0,
                num_sub_devices,
            })?;
        *slot += count;
        Ok(())
    }

    pub fn workers_completed(&self, sub_device: SubDeviceId) -> Option<u32> {
        self.workers_completed.lock().get(sub_device.to_index()).copied()
    }

    /// Raw memory contents, bypassing the command queues.
    pub fn read_memory(&self, endpoint: MemoryEndpoint, addr: u32, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        self.memory.lock().read(endpoint, addr, &mut out);
        out
    }

    fn capacity(&self, endpoint: MemoryEndpoint) -> u64 {
        match endpoint {
            MemoryEndpoint::DramChannel(_) => self.soc.dram_channel_size(),
            MemoryEndpoint::WorkerL1(_) => u64::from(self.soc.l1_size),
        }
    }

    fn write_memory(&self, endpoint: MemoryEndpoint, addr: u32, data: &[u8]) -> Result<()> {
        let end = u64::from(addr) + data.len() as u64;
        if end > self.capacity(endpoint) {
            return Err(DispatchError::protocol(format!(
                "write of {} bytes at {addr:#x} runs past the end of {endpoint:?}",
                data.len()
            )));
        }
        self.memory.lock().write(endpoint, addr, data);
        Ok(())
    }

    fn paged_location(
        &self,
        is_dram: u8,
        page_id: u32,
        base_addr: u32,
        page_size: u32,
    ) -> (MemoryEndpoint, u32) {
        let buffer_type = if is_dram != 0 { BufferType::Dram } else { BufferType::L1 };
        let num_banks = self.soc.num_banks(buffer_type);
        let bank = page_id % num_banks;
        let addr =
            base_addr + (page_id / num_banks) * page_size + self.soc.bank_offset(buffer_type, bank);
        (self.soc.bank_endpoint(buffer_type, bank), addr)
    }

    fn linear_endpoint(&self, noc_xy: u32) -> Result<MemoryEndpoint> {
        self.soc
            .endpoint_from_noc_encoding(noc_xy)
            .ok_or_else(|| DispatchError::protocol(format!("no core at NOC encoding {noc_xy:#x}")))
    }

    fn wait(&self, cmd: &CqDispatchWaitCmd) -> Result<()> {
        let sub_device = cmd
            .addr
            .checked_sub(self.dispatch_message_addr)
            .filter(|offset| offset % self.dispatch_message_stride == 0)
            .map(|offset| (offset / self.dispatch_message_stride) as usize)
            .ok_or_else(|| {
                DispatchError::protocol(format!("wait on unknown dispatch message {:#x}", cmd.addr))
            })?;

        let completed = self
            .workers_completed
            .lock()
            .get(sub_device)
            .copied()
            .ok_or_else(|| {
                DispatchError::protocol(format!(
                    "wait on sub-device {sub_device} which does not exist"
                ))
            })?;

        if completed < cmd.count {
            return Err(DispatchError::protocol(format!(
                "wait for {} workers on sub-device {sub_device} but only {completed} completed",
                cmd.count
            )));
        }
        Ok(())
    }

    fn write_paged(&self, cmd: &CqDispatchWritePagedCmd, data: &[u8]) -> Result<()> {
        let page_size = cmd.page_size as usize;
        if page_size == 0 || data.len() != page_size * cmd.pages as usize {
            return Err(DispatchError::protocol(format!(
                "paged write of {} pages of {} bytes carries {} bytes",
                cmd.pages,
                cmd.page_size,
                data.len()
            )));
        }
        for (i, page) in data.chunks_exact(page_size).enumerate() {
            let page_id = u32::from(cmd.start_page) + i as u32;
            let (endpoint, addr) =
                self.paged_location(cmd.is_dram, page_id, cmd.base_addr, cmd.page_size);
            self.write_memory(endpoint, addr, page)?;
        }
        Ok(())
    }

    fn write_linear(&self, cmd: &CqDispatchWriteLinearCmd, data: &[u8]) -> Result<()> {
        if data.len() != cmd.length as usize {
            return Err(DispatchError::protocol(format!(
                "linear write of {} bytes carries {} bytes",
                cmd.length,
                data.len()
            )));
        }
        let endpoint = self.linear_endpoint(cmd.noc_xy_addr)?;
        self.write_memory(endpoint, cmd.addr, data)
    }

    fn relay_paged(&self, cmd: &CqPrefetchRelayPagedCmd) -> Vec<u8> {
        let mut out = Vec::with_capacity((cmd.page_size * cmd.pages) as usize);
        for i in 0..cmd.pages {
            let page_id = u32::from(cmd.start_page) + i;
            let (endpoint, addr) =
                self.paged_location(cmd.is_dram, page_id, cmd.base_addr, cmd.page_size);
            out.extend_from_slice(&self.read_memory(endpoint, addr, cmd.page_size as usize));
        }
        out
    }

    fn relay_linear(&self, cmd: &CqPrefetchRelayLinearCmd) -> Result<Vec<u8>> {
        let endpoint = self.linear_endpoint(cmd.noc_xy_addr)?;
        Ok(self.read_memory(endpoint, cmd.addr, cmd.length as usize))
    }

    fn start_host_write(
        cmd: &CqDispatchWriteHostCmd,
        pending: &mut Option<PendingHostWrite>,
    ) -> Result<()> {
        if pending.is_some() {
            return Err(DispatchError::protocol(
                "host write started before the previous one was filled",
            ));
        }
        let length = cmd.length as usize;
        if length < CQ_CMD_SIZE as usize {
            return Err(DispatchError::protocol(format!(
                "host write length {length} is shorter than its header"
            )));
        }
        let mut record = Vec::with_capacity(length);
        record.extend_from_slice(bytemuck::bytes_of(cmd));
        *pending = Some(PendingHostWrite { record, length });
        Ok(())
    }

    fn fill_host_write(
        data: Vec<u8>,
        pending: &mut Option<PendingHostWrite>,
        completion: &mut dyn CompletionSink,
    ) -> Result<()> {
        let Some(mut write) = pending.take() else {
            return Err(DispatchError::protocol("relayed data has no host write to land in"));
        };
        if write.record.len() + data.len() != write.length {
            return Err(DispatchError::protocol(format!(
                "host write of {} bytes received {} relayed bytes",
                write.length - CQ_CMD_SIZE as usize,
                data.len()
            )));
        }
        write.record.extend_from_slice(&data);
        completion.write_completion(&write.record)
    }
}

impl CommandProcessor for SimulatedDevice {
    fn process(
        &self,
        cq_id: u8,
        commands: &[u8],
        completion: &mut dyn CompletionSink,
    ) -> Result<()> {
        if self.take_fault() {
            return Err(DispatchError::protocol(format!("device fault on queue {cq_id}")));
        }
        let records = decode_command_sequence(commands, self.host_alignment)?;
        tracing::trace!(
            cq_id,
            bytes = commands.len(),
            records = records.len(),
            "executing command sequence"
        );

        let mut pending = None;
        for record in records {
            match record {
                DeviceCommandRecord::Wait(cmd) => self.wait(&cmd)?,
                DeviceCommandRecord::Stall => {}
                DeviceCommandRecord::WritePaged { cmd, data } => self.write_paged(&cmd, data)?,
                DeviceCommandRecord::WriteLinear { cmd, data } => self.write_linear(&cmd, data)?,
                DeviceCommandRecord::WriteHost(cmd) => Self::start_host_write(&cmd, &mut pending)?,
                DeviceCommandRecord::RelayPaged(cmd) => {
                    Self::fill_host_write(self.relay_paged(&cmd), &mut pending, completion)?
                }
                DeviceCommandRecord::RelayLinear(cmd) => {
                    Self::fill_host_write(self.relay_linear(&cmd)?, &mut pending, completion)?
                }
            }
        }

        if pending.is_some() {
            return Err(DispatchError::protocol(
                "command sequence ended with an unfilled host write",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::DeviceCommand;
    use crate::core_coord::CoreCoord;
    use assert_matches::assert_matches;

    struct Collect(Vec<Vec<u8>>);

    impl CompletionSink for Collect {
        fn write_completion(&mut self, record: &[u8]) -> Result<()> {
            self.0.push(record.to_vec());
            Ok(())
        }
    }

    fn device() -> SimulatedDevice {
        let soc = SocDescriptor {
            grid_size: CoreCoord::new(2, 2),
            num_dram_channels: 2,
            dram_banks_per_channel: 2,
            dram_bank_size: 1 << 16,
            l1_size: 1 << 16,
        };
        SimulatedDevice::new(Arc::new(soc), &DispatchSettings::default(), 2)
    }

    #[test]
    fn test_paged_write_then_relay() {
        let device = device();
        let mut sink = Collect(Vec::new());
        let payload: Vec<u8> = (0..5 * 32).map(|i| i as u8).collect();

        let mut bytes = vec![0u8; 32 + 5 * 32];
        let mut cmd = DeviceCommand::new(&mut bytes, 32);
        cmd.add_dispatch_write_paged(true, true, 0, 0x40, 32, 5);
        cmd.add_data(&payload, payload.len());
        device.process(0, &bytes, &mut sink).unwrap();

        // page 4 wraps around the four banks into the second row of bank 0
        let page = device.read_memory(MemoryEndpoint::DramChannel(0), 0x40 + 32, 32);
        assert_eq!(page, payload[128..160]);
        // bank 3 is the second bank of channel 1
        let page = device.read_memory(MemoryEndpoint::DramChannel(1), 0x40 + (1 << 16), 32);
        assert_eq!(page, payload[96..128]);

        let mut bytes = vec![0u8; 64];
        let mut cmd = DeviceCommand::new(&mut bytes, 32);
        cmd.add_dispatch_write_host(false, 64, false);
        cmd.add_prefetch_relay_paged(true, 3, 0x40, 32, 2);
        device.process(0, &bytes, &mut sink).unwrap();

        assert_eq!(sink.0.len(), 1);
        assert_eq!(sink.0[0].len(), 16 + 64);
        assert_eq!(&sink.0[0][16..], &payload[96..160]);
    }

    #[test]
    fn test_wait_checks_worker_count() {
        let device = device();
        let mut sink = Collect(Vec::new());
        let settings = DispatchSettings::default();

        let mut bytes = vec![0u8; 32];
        let mut cmd = DeviceCommand::new(&mut bytes, 32);
        cmd.add_dispatch_wait(false, settings.dispatch_message_addr(1), 2);

        assert_matches!(device.process(0, &bytes, &mut sink), Err(DispatchError::QueueProtocol(_)));
        device.complete_workers(SubDeviceId(1), 2).unwrap();
        assert!(device.process(0, &bytes, &mut sink).is_ok());
        assert_matches!(
            device.complete_workers(SubDeviceId(2), 1),
            Err(DispatchError::InvalidSubDevice { index: 2, num_sub_devices: 2 })
        );
    }

    #[test]
    fn test_memory_spans_chunks() {
        let device = device();
        let endpoint = MemoryEndpoint::WorkerL1(CoreCoord::new(1, 0));
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8 + 1).collect();
        device.write_memory(endpoint, 4000, &data).unwrap();

        let back = device.read_memory(endpoint, 3990, data.len() + 20);
        assert!(back[..10].iter().all(|&b| b == 0));
        assert_eq!(&back[10..10 + data.len()], &data[..]);
        assert!(back[10 + data.len()..].iter().all(|&b| b == 0));

        assert_matches!(
            device.write_memory(endpoint, (1 << 16) - 4, &[1; 8]),
            Err(DispatchError::QueueProtocol(_))
        );
    }

    #[test]
    fn test_unfilled_host_write_is_rejected() {
        let device = device();
        let mut sink = Collect(Vec::new());
        let mut bytes = vec![0u8; 32];
        let mut cmd = DeviceCommand::new(&mut bytes, 32);
        cmd.add_dispatch_write_host(false, 64, false);
        assert_matches!(device.process(0, &bytes, &mut sink), Err(DispatchError::QueueProtocol(_)));
    }
}
