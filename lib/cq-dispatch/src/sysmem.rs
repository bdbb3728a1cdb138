// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! # System Memory Manager
//!
//! Host memory shared with the device is split into one region per command queue:
//!
//! ```text
//! | reserved pointers | issue queue ............ | completion queue ..... |
//! ^ cq_id * cq_size   ^ issue base               ^ completion base         ^ completion limit
//! ```
//!
//! The host writes command sequences into the issue queue and announces each one with a
//! fetch queue entry. The device writes read results into the completion queue in
//! transfer-page units. Both rings wrap to their base and flip a toggle bit on wrap so
//! that an empty ring can be told apart from a full one.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::config::DispatchSettings;
use crate::error::{DispatchError, Result};

/// Unit of the fetch queue size field.
const FETCH_QUEUE_SIZE_UNIT: u32 = 16;

/// Poll interval while waiting on the completion queue.
const COMPLETION_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Executes command sequences on behalf of the device.
pub trait CommandProcessor: Send + Sync + std::fmt::Debug {
    /// Run the command sequence fetched from `cq_id`, writing read results to `completion`.
    fn process(
        &self,
        cq_id: u8,
        commands: &[u8],
        completion: &mut dyn CompletionSink,
    ) -> Result<()>;
}

/// Device side of a completion queue.
pub trait CompletionSink {
    /// Append one completion record: the host write header followed by its payload.
    fn write_completion(&mut self, record: &[u8]) -> Result<()>;
}

/// Device write pointer of a completion queue as the device publishes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionQueueWritePointer {
    pub ptr: u32,
    pub toggle: bool,
}

impl CompletionQueueWritePointer {
    const TOGGLE_BIT: u32 = 1 << 31;

    /// Decode the packed form: bit 31 is the toggle, the low bits the pointer in 16-byte units.
    pub fn from_packed(packed: u32) -> Self {
        Self {
            ptr: (packed & !Self::TOGGLE_BIT) << 4,
            toggle: packed & Self::TOGGLE_BIT != 0,
        }
    }

    pub fn packed(&self) -> u32 {
        (self.ptr >> 4) | if self.toggle { Self::TOGGLE_BIT } else { 0 }
    }
}

#[derive(Debug, Clone, Copy)]
struct PushedCommand {
    addr: u32,
    size: u32,
    toggle: bool,
}

#[derive(Debug)]
struct IssueQueue {
    memory: Vec<u8>,
    base: u32,
    limit: u32,
    wr_ptr: u32,
    wr_toggle: bool,
    rd_ptr: u32,
    rd_toggle: bool,
    last_pushed: Option<PushedCommand>,
}

impl IssueQueue {
    fn wrap(&mut self) {
        self.wr_ptr = self.base;
        self.wr_toggle = !self.wr_toggle;
    }

    fn has_space(&self, size: u32) -> bool {
        if self.wr_toggle == self.rd_toggle {
            true
        } else {
            self.wr_ptr + size <= self.rd_ptr
        }
    }
}

#[derive(Debug)]
struct FetchQueue {
    entries: VecDeque<PushedCommand>,
    capacity: usize,
}

#[derive(Debug)]
struct CompletionQueue {
    memory: Vec<u8>,
    base: u32,
    limit: u32,
    page_size: u32,
    wr_ptr: u32,
    wr_toggle: bool,
    rd_ptr: u32,
    rd_toggle: bool,
    backlog: VecDeque<Vec<u8>>,
}

impl CompletionQueue {
    fn used_bytes(&self) -> u32 {
        if self.wr_toggle == self.rd_toggle {
            self.wr_ptr - self.rd_ptr
        } else {
            (self.limit - self.rd_ptr) + (self.wr_ptr - self.base)
        }
    }

    fn free_bytes(&self) -> u32 {
        (self.limit - self.base) - self.used_bytes()
    }

    fn has_data(&self) -> bool {
        self.wr_ptr != self.rd_ptr || self.wr_toggle != self.rd_toggle
    }

    /// Move pages waiting on the device into the ring while room remains.
    fn flush_backlog(&mut self) {
        while !self.backlog.is_empty() && self.free_bytes() >= self.page_size {
            let Some(page) = self.backlog.pop_front() else {
                break;
            };
            let at = (self.wr_ptr - self.base) as usize;
            self.memory[at..at + page.len()].copy_from_slice(&page);
            self.wr_ptr += self.page_size;
            if self.wr_ptr >= self.limit {
                self.wr_ptr = self.base;
                self.wr_toggle = !self.wr_toggle;
            }
        }
    }
}

#[derive(Debug)]
struct CommandQueueInterface {
    producer: Mutex<()>,
    issue: Mutex<IssueQueue>,
    issue_space: Condvar,
    fetch: Mutex<FetchQueue>,
    fetch_space: Condvar,
    completion: Mutex<CompletionQueue>,
    completion_ready: Condvar,
}

/// Writes device completion records into a completion queue, page by page.
struct CompletionWriter<'a> {
    queue: &'a Mutex<CompletionQueue>,
    ready: &'a Condvar,
}

impl CompletionSink for CompletionWriter<'_> {
    fn write_completion(&mut self, record: &[u8]) -> Result<()> {
        let mut queue = self.queue.lock();
        let page_size = queue.page_size as usize;
        for chunk in record.chunks(page_size) {
            let mut page = vec![0u8; page_size];
            page[..chunk.len()].copy_from_slice(chunk);
            queue.backlog.push_back(page);
        }
        queue.flush_backlog();
        self.ready.notify_all();
        Ok(())
    }
}

/// Issue queue space handed to the caller for building one command sequence.
///
/// The space is zero filled. Holding a reservation blocks other writers of the same queue.
pub struct IssueQueueReservation<'a> {
    queue: MutexGuard<'a, IssueQueue>,
    start: usize,
    size: usize,
}

impl IssueQueueReservation<'_> {
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.queue.memory[self.start..self.start + self.size]
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

/// Host side of every command queue of one device.
#[derive(Debug)]
pub struct SystemMemoryManager {
    device_id: u32,
    host_alignment: u32,
    cq_size: u32,
    cqs: Vec<CommandQueueInterface>,
    processor: Arc<dyn CommandProcessor>,
}

impl SystemMemoryManager {
    pub fn new(
        device_id: u32,
        num_hw_cqs: u8,
        settings: &DispatchSettings,
        processor: Arc<dyn CommandProcessor>,
    ) -> Self {
        let cq_size = settings.cq_size();
        let cqs = (0..u32::from(num_hw_cqs))
            .map(|cq_id| {
                let cq_base = cq_id * cq_size;
                let issue_base = cq_base + settings.host_cq_reserved_size;
                let issue_limit = issue_base + settings.issue_queue_size;
                let completion_base = issue_limit;
                let completion_limit = completion_base + settings.completion_queue_size;

                CommandQueueInterface {
                    producer: Mutex::new(()),
                    issue: Mutex::new(IssueQueue {
                        memory: vec![0; settings.issue_queue_size as usize],
                        base: issue_base,
                        limit: issue_limit,
                        wr_ptr: issue_base,
                        wr_toggle: false,
                        rd_ptr: issue_base,
                        rd_toggle: false,
                        last_pushed: None,
                    }),
                    issue_space: Condvar::new(),
                    fetch: Mutex::new(FetchQueue {
                        entries: VecDeque::new(),
                        capacity: settings.prefetch_q_entries as usize,
                    }),
                    fetch_space: Condvar::new(),
                    completion: Mutex::new(CompletionQueue {
                        memory: vec![0; settings.completion_queue_size as usize],
                        base: completion_base,
                        limit: completion_limit,
                        page_size: settings.transfer_page_size,
                        wr_ptr: completion_base,
                        wr_toggle: false,
                        rd_ptr: completion_base,
                        rd_toggle: false,
                        backlog: VecDeque::new(),
                    }),
                    completion_ready: Condvar::new(),
                }
            })
            .collect();

        tracing::debug!(device_id, num_hw_cqs, cq_size, "system memory manager initialized");

        Self {
            device_id,
            host_alignment: settings.host_alignment,
            cq_size,
            cqs,
            processor,
        }
    }

    fn cq(&self, cq_id: u8) -> Result<&CommandQueueInterface> {
        self.cqs.get(cq_id as usize).ok_or(DispatchError::InvalidQueue {
            cq_id,
            num_hw_cqs: self.cqs.len() as u8,
        })
    }

    pub fn num_hw_cqs(&self) -> u8 {
        self.cqs.len() as u8
    }

    pub fn get_cq_size(&self) -> u32 {
        self.cq_size
    }

    pub fn get_issue_queue_write_ptr(&self, cq_id: u8) -> Result<u32> {
        Ok(self.cq(cq_id)?.issue.lock().wr_ptr)
    }

    pub fn get_issue_queue_limit(&self, cq_id: u8) -> Result<u32> {
        Ok(self.cq(cq_id)?.issue.lock().limit)
    }

    pub fn get_issue_queue_base(&self, cq_id: u8) -> Result<u32> {
        Ok(self.cq(cq_id)?.issue.lock().base)
    }

    pub fn get_issue_queue_size(&self, cq_id: u8) -> Result<u32> {
        let queue = self.cq(cq_id)?.issue.lock();
        Ok(queue.limit - queue.base)
    }

    /// Exclusive right to issue command sequences on `cq_id`.
    ///
    /// Reserve, push back and fetch queue write of a command sequence all happen under one
    /// hold of this lock, as does any wrap decided from the write pointer.
    pub fn issue_queue_lock(&self, cq_id: u8) -> Result<MutexGuard<'_, ()>> {
        Ok(self.cq(cq_id)?.producer.lock())
    }

    /// Reserve `size` bytes at the issue queue write pointer.
    ///
    /// Wraps first when the command would cross the limit, then blocks until the device has
    /// consumed enough of the ring.
    pub fn issue_queue_reserve(&self, size: u32, cq_id: u8) -> Result<IssueQueueReservation<'_>> {
        let cq = self.cq(cq_id)?;
        let mut queue = cq.issue.lock();

        if size % self.host_alignment != 0 || size > queue.limit - queue.base {
            return Err(DispatchError::protocol(format!(
                "cannot reserve {size} bytes in an issue queue of {} bytes",
                queue.limit - queue.base
            )));
        }

        if queue.wr_ptr + size > queue.limit {
            queue.wrap();
        }
        while !queue.has_space(size) {
            cq.issue_space.wait(&mut queue);
        }

        let start = (queue.wr_ptr - queue.base) as usize;
        queue.memory[start..start + size as usize].fill(0);

        tracing::trace!(cq_id, size, wr_ptr = queue.wr_ptr, "reserved issue queue space");

        Ok(IssueQueueReservation {
            queue,
            start,
            size: size as usize,
        })
    }

    /// Publish the last reservation by moving the write pointer past it.
    pub fn issue_queue_push_back(&self, size: u32, cq_id: u8) -> Result<()> {
        let mut queue = self.cq(cq_id)?.issue.lock();
        queue.last_pushed = Some(PushedCommand {
            addr: queue.wr_ptr,
            size,
            toggle: queue.wr_toggle,
        });
        queue.wr_ptr += size;
        if queue.wr_ptr >= queue.limit {
            queue.wrap();
        }
        Ok(())
    }

    /// Move the write pointer back to the base, flipping the toggle.
    pub fn wrap_issue_queue_wr_ptr(&self, cq_id: u8) -> Result<()> {
        let mut queue = self.cq(cq_id)?.issue.lock();
        tracing::trace!(cq_id, wr_ptr = queue.wr_ptr, "wrapping issue queue");
        queue.wrap();
        Ok(())
    }

    /// Wait for a free fetch queue entry.
    pub fn fetch_queue_reserve_back(&self, cq_id: u8) -> Result<()> {
        let cq = self.cq(cq_id)?;
        let mut fetch = cq.fetch.lock();
        while fetch.entries.len() >= fetch.capacity {
            cq.fetch_space.wait(&mut fetch);
        }
        Ok(())
    }

    /// Tell the device that the last pushed command sequence of `size` bytes is ready.
    pub fn fetch_queue_write(&self, size: u32, cq_id: u8) -> Result<()> {
        let cq = self.cq(cq_id)?;

        let pushed = cq.issue.lock().last_pushed.take().ok_or_else(|| {
            DispatchError::protocol(format!(
                "fetch queue write of {size} bytes without a pushed command"
            ))
        })?;
        if pushed.size != size {
            return Err(DispatchError::protocol(format!(
                "fetch queue write of {size} bytes does not match the pushed command of {} bytes",
                pushed.size
            )));
        }
        if size % FETCH_QUEUE_SIZE_UNIT != 0 || size / FETCH_QUEUE_SIZE_UNIT > u32::from(u16::MAX) {
            return Err(DispatchError::protocol(format!(
                "command size {size} cannot be encoded in a fetch queue entry"
            )));
        }

        let mut fetch = cq.fetch.lock();
        fetch.entries.push_back(pushed);
        self.service_fetch_queue(cq_id, cq, &mut fetch)
    }

    /// Hand every announced command sequence to the device, in order.
    fn service_fetch_queue(
        &self,
        cq_id: u8,
        cq: &CommandQueueInterface,
        fetch: &mut MutexGuard<'_, FetchQueue>,
    ) -> Result<()> {
        while let Some(entry) = fetch.entries.pop_front() {
            let commands = {
                let queue = cq.issue.lock();
                let start = (entry.addr - queue.base) as usize;
                queue.memory[start..start + entry.size as usize].to_vec()
            };

            let mut completion = CompletionWriter {
                queue: &cq.completion,
                ready: &cq.completion_ready,
            };
            let result = self.processor.process(cq_id, &commands, &mut completion);

            {
                let mut queue = cq.issue.lock();
                queue.rd_ptr = entry.addr + entry.size;
                queue.rd_toggle = entry.toggle;
                if queue.rd_ptr >= queue.limit {
                    queue.rd_ptr = queue.base;
                    queue.rd_toggle = !queue.rd_toggle;
                }
            }
            cq.issue_space.notify_all();
            cq.fetch_space.notify_all();

            if let Err(e) = result {
                tracing::warn!(
                    device_id = self.device_id,
                    cq_id,
                    error = %e,
                    "device rejected command sequence"
                );
                return Err(e);
            }
        }
        Ok(())
    }

    /// Block until the completion queue holds data, returning the device write pointer.
    ///
    /// Gives up with [`DispatchError::ReadAborted`] once `exit_condition` is set and no data
    /// has arrived.
    pub fn completion_queue_wait_front(
        &self,
        cq_id: u8,
        exit_condition: &AtomicBool,
    ) -> Result<CompletionQueueWritePointer> {
        let cq = self.cq(cq_id)?;
        let mut queue = cq.completion.lock();
        loop {
            if queue.has_data() {
                let ptr = CompletionQueueWritePointer {
                    ptr: queue.wr_ptr,
                    toggle: queue.wr_toggle,
                };
                return Ok(CompletionQueueWritePointer::from_packed(ptr.packed()));
            }
            if exit_condition.load(Ordering::Acquire) {
                tracing::debug!(cq_id, "completion queue wait aborted");
                return Err(DispatchError::ReadAborted { cq_id });
            }
            cq.completion_ready.wait_for(&mut queue, COMPLETION_POLL_INTERVAL);
        }
    }

    pub fn get_completion_queue_read_ptr(&self, cq_id: u8) -> Result<u32> {
        Ok(self.cq(cq_id)?.completion.lock().rd_ptr)
    }

    pub fn get_completion_queue_read_toggle(&self, cq_id: u8) -> Result<bool> {
        Ok(self.cq(cq_id)?.completion.lock().rd_toggle)
    }

    pub fn get_completion_queue_limit(&self, cq_id: u8) -> Result<u32> {
        Ok(self.cq(cq_id)?.completion.lock().limit)
    }

    pub fn get_completion_queue_base(&self, cq_id: u8) -> Result<u32> {
        Ok(self.cq(cq_id)?.completion.lock().base)
    }

    /// Release `num_pages` transfer pages at the read pointer back to the device.
    pub fn completion_queue_pop_front(&self, num_pages: u32, cq_id: u8) -> Result<()> {
        let mut queue = self.cq(cq_id)?.completion.lock();
        let bytes = num_pages * queue.page_size;
        if bytes > queue.used_bytes() {
            return Err(DispatchError::protocol(format!(
                "popping {bytes} bytes from a completion queue holding {}",
                queue.used_bytes()
            )));
        }

        queue.rd_ptr += bytes;
        if queue.rd_ptr >= queue.limit {
            queue.rd_ptr = queue.base + (queue.rd_ptr - queue.limit);
            queue.rd_toggle = !queue.rd_toggle;
        }
        queue.flush_backlog();
        Ok(())
    }

    /// Copy completion queue memory at host address `addr` into `dst`.
    pub fn read_completion_queue(&self, cq_id: u8, addr: u32, dst: &mut [u8]) -> Result<()> {
        let queue = self.cq(cq_id)?.completion.lock();
        let end = u64::from(addr) + dst.len() as u64;
        if addr < queue.base || end > u64::from(queue.limit) {
            return Err(DispatchError::protocol(format!(
                "read of {} bytes at {addr:#x} is outside the completion queue",
                dst.len()
            )));
        }
        let start = (addr - queue.base) as usize;
        dst.copy_from_slice(&queue.memory[start..start + dst.len()]);
        Ok(())
    }

    /// Pages the device produced that do not fit in the completion queue yet.
    pub fn completion_queue_backlog(&self, cq_id: u8) -> Result<usize> {
        Ok(self.cq(cq_id)?.completion.lock().backlog.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    /// Echoes every command sequence back as one completion record.
    #[derive(Debug)]
    struct Echo;

    impl CommandProcessor for Echo {
        fn process(
            &self,
            _cq_id: u8,
            commands: &[u8],
            completion: &mut dyn CompletionSink,
        ) -> Result<()> {
            completion.write_completion(commands)
        }
    }

    fn settings() -> DispatchSettings {
        DispatchSettings::builder()
            .issue_queue_size(256)
            .completion_queue_size(2 * 4096)
            .worker_max_prefetch_cmd_size(256)
            .ethernet_max_prefetch_cmd_size(256)
            .build()
            .unwrap()
    }

    fn manager() -> SystemMemoryManager {
        SystemMemoryManager::new(0, 2, &settings(), Arc::new(Echo))
    }

    fn push(manager: &SystemMemoryManager, fill: u8, size: u32, cq_id: u8) {
        {
            let mut reservation = manager.issue_queue_reserve(size, cq_id).unwrap();
            reservation.as_mut_slice().fill(fill);
        }
        manager.issue_queue_push_back(size, cq_id).unwrap();
        manager.fetch_queue_reserve_back(cq_id).unwrap();
        manager.fetch_queue_write(size, cq_id).unwrap();
    }

    #[test]
    fn test_packed_write_pointer() {
        let ptr = CompletionQueueWritePointer {
            ptr: 0x1234_5670,
            toggle: true,
        };
        assert_eq!(ptr.packed() >> 31, 1);
        assert_eq!(CompletionQueueWritePointer::from_packed(ptr.packed()), ptr);
    }

    #[test]
    fn test_queue_regions() {
        let manager = manager();
        let size = settings().cq_size();
        assert_eq!(manager.get_issue_queue_base(1).unwrap(), size + 128);
        assert_eq!(manager.get_issue_queue_limit(0).unwrap(), 128 + 256);
        assert_eq!(manager.get_completion_queue_base(0).unwrap(), 128 + 256);
        assert_eq!(manager.get_completion_queue_limit(0).unwrap(), 128 + 256 + 8192);
        assert_matches!(
            manager.get_issue_queue_write_ptr(2),
            Err(DispatchError::InvalidQueue { cq_id: 2, num_hw_cqs: 2 })
        );
    }

    #[test]
    fn test_issue_queue_wraps_at_limit() {
        let manager = manager();
        let base = manager.get_issue_queue_base(0).unwrap();
        push(&manager, 1, 192, 0);
        assert_eq!(manager.get_issue_queue_write_ptr(0).unwrap(), base + 192);

        // 96 bytes no longer fit before the limit
        push(&manager, 2, 96, 0);
        assert_eq!(manager.get_issue_queue_write_ptr(0).unwrap(), base + 96);

        push(&manager, 3, 160, 0);
        assert_eq!(manager.get_issue_queue_write_ptr(0).unwrap(), base);
    }

    #[test]
    fn test_fetch_write_requires_matching_push() {
        let manager = manager();
        assert_matches!(manager.fetch_queue_write(32, 0), Err(DispatchError::QueueProtocol(_)));

        drop(manager.issue_queue_reserve(64, 0).unwrap());
        manager.issue_queue_push_back(64, 0).unwrap();
        assert_matches!(manager.fetch_queue_write(32, 0), Err(DispatchError::QueueProtocol(_)));
    }

    #[test]
    fn test_completion_backlog_drains_on_pop() {
        let manager = manager();
        let never = AtomicBool::new(false);
        let base = manager.get_completion_queue_base(0).unwrap();

        // three single-page records into a two-page ring
        push(&manager, 7, 64, 0);
        push(&manager, 8, 64, 0);
        push(&manager, 9, 64, 0);
        assert_eq!(manager.completion_queue_backlog(0).unwrap(), 1);

        let front = manager.completion_queue_wait_front(0, &never).unwrap();
        assert_eq!(front.ptr, base);
        assert!(front.toggle);

        let mut page = [0u8; 64];
        manager.read_completion_queue(0, base, &mut page).unwrap();
        assert!(page.iter().all(|&b| b == 7));

        manager.completion_queue_pop_front(1, 0).unwrap();
        assert_eq!(manager.completion_queue_backlog(0).unwrap(), 0);
        manager.read_completion_queue(0, base, &mut page).unwrap();
        assert!(page.iter().all(|&b| b == 9));

        manager.completion_queue_pop_front(1, 0).unwrap();
        assert_eq!(manager.get_completion_queue_read_ptr(0).unwrap(), base);
        assert!(manager.get_completion_queue_read_toggle(0).unwrap());
    }

    #[test]
    fn test_wait_front_aborts_when_empty() {
        let manager = manager();
        let exit = AtomicBool::new(true);
        assert_matches!(
            manager.completion_queue_wait_front(1, &exit),
            Err(DispatchError::ReadAborted { cq_id: 1 })
        );
        assert_matches!(
            manager.completion_queue_pop_front(1, 1),
            Err(DispatchError::QueueProtocol(_))
        );
    }
}
