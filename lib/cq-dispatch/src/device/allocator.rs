// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! # Bank Allocator
//!
//! Every bank of a memory pool holds the same slice of each buffer, so one allocator per
//! pool hands out a single per-bank address range. Allocation is backed by the
//! [`offset_allocator`] crate in units of the pool alignment.

use std::sync::Arc;

use offset_allocator::{Allocation, Allocator};
use parking_lot::Mutex;

use crate::buffer::BufferType;
use crate::error::{DispatchError, Result};

/// Allocator for one memory pool.
#[derive(Clone)]
pub struct BankAllocator {
    buffer_type: BufferType,
    base_address: u32,
    alignment: u32,
    bank_size: u32,
    allocator: Arc<Mutex<Allocator>>,
}

impl std::fmt::Debug for BankAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "BankAllocator {{ buffer_type: {}, base_address: {:#x}, alignment: {}, \
             bank_size: {} }}",
            self.buffer_type, self.base_address, self.alignment, self.bank_size
        )
    }
}

/// Per-bank address range owned by a buffer. Freed on drop.
pub struct BankAllocation {
    address: u32,
    size_per_bank: u64,
    allocation: Allocation,
    allocator: Arc<Mutex<Allocator>>,
}

impl BankAllocator {
    /// Manage `[base_address, bank_size)` of every bank in `alignment` sized units.
    pub fn new(
        buffer_type: BufferType,
        base_address: u32,
        bank_size: u32,
        alignment: u32,
    ) -> Result<Self> {
        if !alignment.is_power_of_two() {
            return Err(DispatchError::Config(format!(
                "{buffer_type} alignment {alignment} must be a power of 2"
            )));
        }
        let base_address = base_address.next_multiple_of(alignment);
        if base_address >= bank_size {
            return Err(DispatchError::Config(format!(
                "{buffer_type} unreserved base {base_address:#x} leaves no room \
                 in a bank of {bank_size} bytes"
            )));
        }

        let units = (bank_size - base_address) / alignment;
        Ok(Self {
            buffer_type,
            base_address,
            alignment,
            bank_size,
            allocator: Arc::new(Mutex::new(Allocator::new(units))),
        })
    }

    pub fn buffer_type(&self) -> BufferType {
        self.buffer_type
    }

    /// Reserve `size_per_bank` bytes at the same address in every bank.
    pub fn allocate(&self, size_per_bank: u64) -> Result<BankAllocation> {
        let out_of_memory = || DispatchError::OutOfMemory {
            buffer_type: self.buffer_type,
            requested: size_per_bank,
        };

        let units: u32 = size_per_bank
            .div_ceil(u64::from(self.alignment))
            .max(1)
            .try_into()
            .map_err(|_| out_of_memory())?;

        let allocation = self.allocator.lock().allocate(units).ok_or_else(out_of_memory)?;
        let address = self.base_address + allocation.offset * self.alignment;

        debug_assert!(u64::from(address) + size_per_bank <= u64::from(self.bank_size));

        Ok(BankAllocation {
            address,
            size_per_bank,
            allocation,
            allocator: self.allocator.clone(),
        })
    }
}

impl BankAllocation {
    pub fn address(&self) -> u32 {
        self.address
    }

    pub fn size_per_bank(&self) -> u64 {
        self.size_per_bank
    }
}

impl std::fmt::Debug for BankAllocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "BankAllocation {{ address: {:#x}, size_per_bank: {} }}",
            self.address, self.size_per_bank
        )
    }
}

impl Drop for BankAllocation {
    fn drop(&mut self) {
        self.allocator.lock().free(self.allocation);
    }
}
