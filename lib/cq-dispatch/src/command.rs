// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! # Device Command Encoding
//!
//! A command sequence is a run of 16-byte records written into the issue queue. Prefetch
//! records are consumed by the prefetcher; inline relays carry a dispatch record plus its
//! payload on to the dispatcher. Every top-level record starts on a host-aligned offset.

use bytemuck::{Pod, Zeroable};

use crate::error::{DispatchError, Result};

/// Size of every prefetch and dispatch record.
pub const CQ_CMD_SIZE: u32 = 16;

/// Largest start page a paged dispatch write can encode.
pub const CQ_DISPATCH_CMD_PAGED_WRITE_MAX_PAGE_INDEX: u32 = 0xFFFF;

/// Largest start page a paged prefetch relay can encode.
pub const CQ_PREFETCH_RELAY_PAGED_START_PAGE_MASK: u32 = 0xFF;

pub const CQ_DISPATCH_CMD_WAIT_FLAG_BARRIER: u8 = 0x01;
pub const CQ_DISPATCH_CMD_WAIT_FLAG_NOTIFY_PREFETCH: u8 = 0x02;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum PrefetchCmdId {
    RelayLinear = 1,
    RelayPaged = 2,
    RelayInline = 5,
    RelayInlineNoflush = 6,
    Stall = 10,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum DispatchCmdId {
    WriteLinear = 1,
    WriteLinearHost = 2,
    WritePaged = 3,
    Wait = 7,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct CqPrefetchRelayLinearCmd {
    pub cmd_id: u8,
    pub _pad1: u8,
    pub _pad2: u16,
    pub noc_xy_addr: u32,
    pub addr: u32,
    pub length: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct CqPrefetchRelayPagedCmd {
    pub cmd_id: u8,
    pub start_page: u8,
    pub is_dram: u8,
    pub _pad1: u8,
    pub base_addr: u32,
    pub page_size: u32,
    pub pages: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct CqPrefetchRelayInlineCmd {
    pub cmd_id: u8,
    pub _pad1: u8,
    pub _pad2: u16,
    /// Bytes relayed to the dispatcher, dispatch record included
    pub length: u32,
    /// Distance to the next prefetch record
    pub stride: u32,
    pub _pad3: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct CqPrefetchStallCmd {
    pub cmd_id: u8,
    pub _pad: [u8; 15],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct CqDispatchWriteLinearCmd {
    pub cmd_id: u8,
    pub num_mcast_dests: u8,
    pub write_offset_index: u8,
    pub _pad1: u8,
    pub noc_xy_addr: u32,
    pub addr: u32,
    pub length: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct CqDispatchWriteHostCmd {
    pub cmd_id: u8,
    pub is_event: u8,
    pub _pad1: u16,
    pub _pad2: u32,
    /// Payload bytes plus this record
    pub length: u32,
    pub _pad3: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct CqDispatchWritePagedCmd {
    pub cmd_id: u8,
    pub is_dram: u8,
    pub start_page: u16,
    pub base_addr: u32,
    pub page_size: u32,
    pub pages: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct CqDispatchWaitCmd {
    pub cmd_id: u8,
    pub flags: u8,
    pub _pad1: u16,
    pub addr: u32,
    pub count: u32,
    pub _pad2: u32,
}

const _: () = {
    assert!(std::mem::size_of::<CqPrefetchRelayLinearCmd>() == CQ_CMD_SIZE as usize);
    assert!(std::mem::size_of::<CqPrefetchRelayPagedCmd>() == CQ_CMD_SIZE as usize);
    assert!(std::mem::size_of::<CqPrefetchRelayInlineCmd>() == CQ_CMD_SIZE as usize);
    assert!(std::mem::size_of::<CqPrefetchStallCmd>() == CQ_CMD_SIZE as usize);
    assert!(std::mem::size_of::<CqDispatchWriteLinearCmd>() == CQ_CMD_SIZE as usize);
    assert!(std::mem::size_of::<CqDispatchWriteHostCmd>() == CQ_CMD_SIZE as usize);
    assert!(std::mem::size_of::<CqDispatchWritePagedCmd>() == CQ_CMD_SIZE as usize);
    assert!(std::mem::size_of::<CqDispatchWaitCmd>() == CQ_CMD_SIZE as usize);
};

/// Bytes occupied by a dispatch wait relayed inline.
pub fn dispatch_wait_size(host_alignment: u32) -> u32 {
    (2 * CQ_CMD_SIZE).next_multiple_of(host_alignment)
}

/// Bytes occupied by an inline dispatch write of `data_size` payload bytes.
pub fn dispatch_write_size(data_size: u32, host_alignment: u32) -> u32 {
    (2 * CQ_CMD_SIZE + data_size).next_multiple_of(host_alignment)
}

/// Bytes occupied by a standalone prefetch record.
pub fn prefetch_cmd_size(host_alignment: u32) -> u32 {
    CQ_CMD_SIZE.next_multiple_of(host_alignment)
}

/// Builder for one command sequence inside an issue queue reservation.
pub struct DeviceCommand<'a> {
    data: &'a mut [u8],
    offset: usize,
    host_alignment: u32,
}

impl<'a> DeviceCommand<'a> {
    pub fn new(data: &'a mut [u8], host_alignment: u32) -> Self {
        Self {
            data,
            offset: 0,
            host_alignment,
        }
    }

    pub fn write_offset_bytes(&self) -> usize {
        self.offset
    }

    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }

    fn put<T: Pod>(&mut self, at: usize, record: &T) {
        let bytes = bytemuck::bytes_of(record);
        self.data[at..at + bytes.len()].copy_from_slice(bytes);
    }

    fn align(&self, size: u32) -> usize {
        size.next_multiple_of(self.host_alignment) as usize
    }

    fn relay_inline(&mut self, flush_prefetch: bool, length: u32, stride: u32) {
        let cmd_id = if flush_prefetch {
            PrefetchCmdId::RelayInline
        } else {
            PrefetchCmdId::RelayInlineNoflush
        };
        let relay = CqPrefetchRelayInlineCmd {
            cmd_id: cmd_id as u8,
            length,
            stride,
            ..Default::default()
        };
        self.put(self.offset, &relay);
    }

    fn wait(&mut self, flags: u8, address: u32, count: u32) {
        let stride = self.align(2 * CQ_CMD_SIZE);
        self.relay_inline(true, CQ_CMD_SIZE, stride as u32);
        let wait = CqDispatchWaitCmd {
            cmd_id: DispatchCmdId::Wait as u8,
            flags,
            addr: address,
            count,
            ..Default::default()
        };
        self.put(self.offset + CQ_CMD_SIZE as usize, &wait);
        self.offset += stride;
    }

    /// Wait until `count` workers have reported to the dispatch message at `address`.
    pub fn add_dispatch_wait(&mut self, barrier: bool, address: u32, count: u32) {
        let flags = if barrier { CQ_DISPATCH_CMD_WAIT_FLAG_BARRIER } else { 0 };
        self.wait(flags, address, count);
    }

    /// Wait, then hold the prefetcher until the dispatcher has drained.
    pub fn add_dispatch_wait_with_prefetch_stall(
        &mut self,
        barrier: bool,
        address: u32,
        count: u32,
    ) {
        let mut flags = CQ_DISPATCH_CMD_WAIT_FLAG_NOTIFY_PREFETCH;
        if barrier {
            flags |= CQ_DISPATCH_CMD_WAIT_FLAG_BARRIER;
        }
        self.wait(flags, address, count);

        let stall = CqPrefetchStallCmd {
            cmd_id: PrefetchCmdId::Stall as u8,
            ..Default::default()
        };
        self.put(self.offset, &stall);
        self.offset += self.align(CQ_CMD_SIZE);
    }

    /// Paged write of `pages` pages; the payload follows via [`Self::add_data`].
    pub fn add_dispatch_write_paged(
        &mut self,
        flush_prefetch: bool,
        is_dram: bool,
        start_page: u16,
        base_addr: u32,
        page_size: u32,
        pages: u32,
    ) {
        let data_size = page_size * pages;
        let stride = self.align(2 * CQ_CMD_SIZE + data_size);
        self.relay_inline(flush_prefetch, CQ_CMD_SIZE + data_size, stride as u32);
        let write = CqDispatchWritePagedCmd {
            cmd_id: DispatchCmdId::WritePaged as u8,
            is_dram: u8::from(is_dram),
            start_page,
            base_addr,
            page_size,
            pages,
        };
        self.put(self.offset + CQ_CMD_SIZE as usize, &write);
        self.offset += 2 * CQ_CMD_SIZE as usize;
    }

    /// Linear write to one core; the payload follows via [`Self::add_data`].
    pub fn add_dispatch_write_linear(
        &mut self,
        num_mcast_dests: u8,
        noc_xy_addr: u32,
        addr: u32,
        data_size: u32,
    ) {
        let stride = self.align(2 * CQ_CMD_SIZE + data_size);
        self.relay_inline(true, CQ_CMD_SIZE + data_size, stride as u32);
        let write = CqDispatchWriteLinearCmd {
            cmd_id: DispatchCmdId::WriteLinear as u8,
            num_mcast_dests,
            noc_xy_addr,
            addr,
            length: data_size,
            ..Default::default()
        };
        self.put(self.offset + CQ_CMD_SIZE as usize, &write);
        self.offset += 2 * CQ_CMD_SIZE as usize;
    }

    /// Route the next `data_size` relayed bytes into the completion queue.
    pub fn add_dispatch_write_host(
        &mut self,
        flush_prefetch: bool,
        data_size: u32,
        is_event: bool,
    ) {
        let stride = self.align(2 * CQ_CMD_SIZE);
        self.relay_inline(flush_prefetch, CQ_CMD_SIZE, stride as u32);
        let write = CqDispatchWriteHostCmd {
            cmd_id: DispatchCmdId::WriteLinearHost as u8,
            is_event: u8::from(is_event),
            length: data_size + CQ_CMD_SIZE,
            ..Default::default()
        };
        self.put(self.offset + CQ_CMD_SIZE as usize, &write);
        self.offset += stride;
    }

    pub fn add_prefetch_relay_paged(
        &mut self,
        is_dram: bool,
        start_page: u8,
        base_addr: u32,
        page_size: u32,
        pages: u32,
    ) {
        let relay = CqPrefetchRelayPagedCmd {
            cmd_id: PrefetchCmdId::RelayPaged as u8,
            start_page,
            is_dram: u8::from(is_dram),
            base_addr,
            page_size,
            pages,
            ..Default::default()
        };
        self.put(self.offset, &relay);
        self.offset += self.align(CQ_CMD_SIZE);
    }

    pub fn add_prefetch_relay_linear(&mut self, noc_xy_addr: u32, length: u32, addr: u32) {
        let relay = CqPrefetchRelayLinearCmd {
            cmd_id: PrefetchCmdId::RelayLinear as u8,
            noc_xy_addr,
            addr,
            length,
            ..Default::default()
        };
        self.put(self.offset, &relay);
        self.offset += self.align(CQ_CMD_SIZE);
    }

    /// Copy `src` at the write offset, then advance by `increment` bytes.
    pub fn add_data(&mut self, src: &[u8], increment: usize) {
        debug_assert!(src.len() <= increment);
        self.data[self.offset..self.offset + src.len()].copy_from_slice(src);
        self.offset += increment;
    }

    /// Skip `size` bytes to fill later with [`Self::update_cmd_sequence`]; returns their offset.
    pub fn reserve_space(&mut self, size: usize) -> usize {
        let at = self.offset;
        self.offset += size;
        at
    }

    pub fn update_cmd_sequence(&mut self, at: usize, src: &[u8]) {
        self.data[at..at + src.len()].copy_from_slice(src);
    }

    pub fn align_write_offset(&mut self) {
        self.offset = self.align(self.offset as u32);
    }
}

/// A decoded command record with its inline payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommandRecord<'a> {
    Wait(CqDispatchWaitCmd),
    Stall,
    WritePaged { cmd: CqDispatchWritePagedCmd, data: &'a [u8] },
    WriteLinear { cmd: CqDispatchWriteLinearCmd, data: &'a [u8] },
    WriteHost(CqDispatchWriteHostCmd),
    RelayPaged(CqPrefetchRelayPagedCmd),
    RelayLinear(CqPrefetchRelayLinearCmd),
}

fn read_record<T: Pod>(bytes: &[u8], at: usize) -> Result<T> {
    let end = at + CQ_CMD_SIZE as usize;
    let record = bytes.get(at..end).ok_or_else(|| {
        DispatchError::protocol(format!("record at offset {at} runs past the end of the sequence"))
    })?;
    Ok(bytemuck::pod_read_unaligned(record))
}

/// Parse a command sequence as the prefetcher and dispatcher would.
pub fn decode_command_sequence(
    bytes: &[u8],
    host_alignment: u32,
) -> Result<Vec<DeviceCommandRecord<'_>>> {
    let mut records = Vec::new();
    let mut offset = 0usize;
    let prefetch_stride = prefetch_cmd_size(host_alignment) as usize;

    while offset < bytes.len() {
        let cmd_id = bytes[offset];
        let prefetch = PrefetchCmdId::from_repr(cmd_id).ok_or_else(|| {
            DispatchError::protocol(format!("unknown prefetch command {cmd_id} at offset {offset}"))
        })?;

        match prefetch {
            PrefetchCmdId::RelayInline | PrefetchCmdId::RelayInlineNoflush => {
                let relay: CqPrefetchRelayInlineCmd = read_record(bytes, offset)?;
                if relay.length < CQ_CMD_SIZE || relay.stride < CQ_CMD_SIZE + relay.length {
                    return Err(DispatchError::protocol(format!(
                        "inline relay at offset {offset} has length {} and stride {}",
                        relay.length, relay.stride
                    )));
                }
                let dispatch_at = offset + CQ_CMD_SIZE as usize;
                let payload_start = dispatch_at + CQ_CMD_SIZE as usize;
                let payload_end = dispatch_at + relay.length as usize;
                let data = bytes.get(payload_start..payload_end).ok_or_else(|| {
                    DispatchError::protocol(format!(
                        "inline relay at offset {offset} runs past the end of the sequence"
                    ))
                })?;

                let dispatch_id = bytes[dispatch_at];
                let record = match DispatchCmdId::from_repr(dispatch_id) {
                    Some(DispatchCmdId::Wait) => {
                        DeviceCommandRecord::Wait(read_record(bytes, dispatch_at)?)
                    }
                    Some(DispatchCmdId::WritePaged) => DeviceCommandRecord::WritePaged {
                        cmd: read_record(bytes, dispatch_at)?,
                        data,
                    },
                    Some(DispatchCmdId::WriteLinear) => DeviceCommandRecord::WriteLinear {
                        cmd: read_record(bytes, dispatch_at)?,
                        data,
                    },
                    Some(DispatchCmdId::WriteLinearHost) => {
                        DeviceCommandRecord::WriteHost(read_record(bytes, dispatch_at)?)
                    }
                    None => {
                        return Err(DispatchError::protocol(format!(
                            "unknown dispatch command {dispatch_id} at offset {dispatch_at}"
                        )));
                    }
                };
                records.push(record);
                offset += relay.stride as usize;
            }
            PrefetchCmdId::RelayPaged => {
                records.push(DeviceCommandRecord::RelayPaged(read_record(bytes, offset)?));
                offset += prefetch_stride;
            }
            PrefetchCmdId::RelayLinear => {
                records.push(DeviceCommandRecord::RelayLinear(read_record(bytes, offset)?));
                offset += prefetch_stride;
            }
            PrefetchCmdId::Stall => {
                records.push(DeviceCommandRecord::Stall);
                offset += prefetch_stride;
            }
        }
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_read_sequence_layout() {
        let align = 32;
        let size = 3 * dispatch_wait_size(align) + 2 * prefetch_cmd_size(align);
        let mut bytes = vec![0u8; size as usize];
        let mut cmd = DeviceCommand::new(&mut bytes, align);
        cmd.add_dispatch_wait(false, 0x100, 3);
        cmd.add_dispatch_wait_with_prefetch_stall(true, 0x110, 5);
        cmd.add_dispatch_write_host(false, 4096, false);
        cmd.add_prefetch_relay_paged(true, 7, 0x2000, 2048, 2);
        assert_eq!(cmd.write_offset_bytes(), size as usize);

        let records = decode_command_sequence(&bytes, align).unwrap();
        assert_eq!(records.len(), 5);
        assert_matches!(
            &records[0],
            DeviceCommandRecord::Wait(w) if w.flags == 0 && w.addr == 0x100 && w.count == 3
        );
        let stall_flags =
            CQ_DISPATCH_CMD_WAIT_FLAG_BARRIER | CQ_DISPATCH_CMD_WAIT_FLAG_NOTIFY_PREFETCH;
        assert_matches!(&records[1], DeviceCommandRecord::Wait(w) if w.flags == stall_flags);
        assert_matches!(&records[2], DeviceCommandRecord::Stall);
        assert_matches!(
            &records[3],
            DeviceCommandRecord::WriteHost(w) if w.length == 4096 + CQ_CMD_SIZE
        );
        assert_matches!(
            &records[4],
            DeviceCommandRecord::RelayPaged(r)
                if r.start_page == 7 && r.is_dram == 1 && r.pages == 2
        );
    }

    #[test]
    fn test_paged_write_payload_is_padded() {
        let align = 32;
        let payload = [0xAB_u8; 40];
        let size = dispatch_write_size(40, align);
        assert_eq!(size, 96);

        let mut bytes = vec![0u8; size as usize];
        let mut cmd = DeviceCommand::new(&mut bytes, align);
        cmd.add_dispatch_write_paged(true, false, 3, 0x4000, 20, 2);
        cmd.add_data(&payload[..20], 20);
        cmd.add_data(&payload[20..], 20);
        cmd.align_write_offset();
        assert_eq!(cmd.write_offset_bytes(), 96);

        let records = decode_command_sequence(&bytes, align).unwrap();
        assert_matches!(
            records.as_slice(),
            [DeviceCommandRecord::WritePaged { cmd, data }]
                if cmd.start_page == 3
                    && cmd.page_size == 20
                    && data.len() == 40
                    && data.iter().all(|&b| b == 0xAB)
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let bytes = vec![0u8; 32];
        assert_matches!(decode_command_sequence(&bytes, 32), Err(DispatchError::QueueProtocol(_)));

        let mut bytes = vec![0u8; 32];
        bytes[0] = PrefetchCmdId::RelayInline as u8;
        bytes[4] = 200;
        assert_matches!(decode_command_sequence(&bytes, 32), Err(DispatchError::QueueProtocol(_)));
    }
}
