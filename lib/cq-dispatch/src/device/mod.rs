// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Device context: geometry, allocators, host command queues and the simulated firmware
//! that services them.

mod allocator;
mod simulator;
mod soc;

pub use allocator::{BankAllocation, BankAllocator};
pub use simulator::SimulatedDevice;
pub use soc::{CoreType, MemoryEndpoint, NOC_ADDR_NODE_ID_BITS, SocDescriptor};

use std::sync::Arc;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::buffer::BufferType;
use crate::config::{DispatchCoreType, DispatchSettings};
use crate::core_coord::CoreCoord;
use crate::error::{DispatchError, Result};
use crate::sysmem::SystemMemoryManager;

/// Index of a sub-device: a partition of worker cores with its own completion tracking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubDeviceId(pub u8);

impl SubDeviceId {
    pub fn to_index(self) -> usize {
        self.0 as usize
    }
}

/// Static description of a device.
#[derive(Debug, Clone, Builder, Validate, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceConfig {
    #[builder(default = "0")]
    pub device_id: u32,

    /// Worker grid width
    #[validate(range(min = 1, max = 16))]
    #[builder(default = "8")]
    pub grid_x: u32,

    /// Worker grid height
    #[validate(range(min = 1, max = 16))]
    #[builder(default = "8")]
    pub grid_y: u32,

    #[validate(range(min = 1, max = 16))]
    #[builder(default = "6")]
    pub num_dram_channels: u32,

    #[validate(range(min = 1, max = 8))]
    #[builder(default = "2")]
    pub dram_banks_per_channel: u32,

    /// Bytes per DRAM bank
    #[validate(range(min = 4096))]
    #[builder(default = "256 * 1024 * 1024")]
    pub dram_bank_size: u32,

    /// First DRAM address available to buffers
    #[builder(default = "64")]
    pub dram_unreserved_base: u32,

    /// Bytes of L1 per worker
    #[validate(range(min = 4096))]
    #[builder(default = "1_499_136")]
    pub l1_size: u32,

    /// First L1 address available to buffers
    #[builder(default = "102_400")]
    pub l1_unreserved_base: u32,

    #[validate(range(min = 1, max = 16))]
    #[builder(default = "1")]
    pub num_sub_devices: u8,

    #[validate(range(min = 1, max = 2))]
    #[builder(default = "1")]
    pub num_hw_cqs: u8,

    #[builder(default)]
    pub dispatch_core_type: DispatchCoreType,
}

impl DeviceConfig {
    pub fn builder() -> DeviceConfigBuilder {
        DeviceConfigBuilder::default()
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            device_id: 0,
            grid_x: 8,
            grid_y: 8,
            num_dram_channels: 6,
            dram_banks_per_channel: 2,
            dram_bank_size: 256 * 1024 * 1024,
            dram_unreserved_base: 64,
            l1_size: 1_499_136,
            l1_unreserved_base: 102_400,
            num_sub_devices: 1,
            num_hw_cqs: 1,
            dispatch_core_type: DispatchCoreType::Worker,
        }
    }
}

/// An open device.
#[derive(Debug)]
pub struct Device {
    config: DeviceConfig,
    settings: DispatchSettings,
    soc: Arc<SocDescriptor>,
    dram_allocator: BankAllocator,
    l1_allocator: BankAllocator,
    simulator: Arc<SimulatedDevice>,
    sysmem: SystemMemoryManager,
}

impl Device {
    /// Validate the configuration and bring up the command queues.
    pub fn open(config: DeviceConfig, settings: DispatchSettings) -> Result<Arc<Device>> {
        config.validate()?;
        let settings = settings.validated()?;

        let soc = Arc::new(SocDescriptor {
            grid_size: CoreCoord::new(config.grid_x, config.grid_y),
            num_dram_channels: config.num_dram_channels,
            dram_banks_per_channel: config.dram_banks_per_channel,
            dram_bank_size: config.dram_bank_size,
            l1_size: config.l1_size,
        });
        if soc.dram_channel_size() > u64::from(u32::MAX) {
            return Err(DispatchError::Config(format!(
                "DRAM channel of {} bytes is not addressable with 32-bit addresses",
                soc.dram_channel_size()
            )));
        }

        let dram_allocator = BankAllocator::new(
            BufferType::Dram,
            config.dram_unreserved_base,
            config.dram_bank_size,
            settings.dram_alignment,
        )?;
        let l1_allocator = BankAllocator::new(
            BufferType::L1,
            config.l1_unreserved_base,
            config.l1_size,
            settings.l1_alignment,
        )?;

        let simulator =
            Arc::new(SimulatedDevice::new(soc.clone(), &settings, config.num_sub_devices));
        let sysmem = SystemMemoryManager::new(
            config.device_id,
            config.num_hw_cqs,
            &settings,
            simulator.clone(),
        );

        tracing::info!(
            device_id = config.device_id,
            grid = %soc.grid_size,
            dram_banks = soc.num_dram_banks(),
            num_hw_cqs = config.num_hw_cqs,
            dispatch_core_type = %config.dispatch_core_type,
            "device opened"
        );

        Ok(Arc::new(Device {
            config,
            settings,
            soc,
            dram_allocator,
            l1_allocator,
            simulator,
            sysmem,
        }))
    }

    pub fn id(&self) -> u32 {
        self.config.device_id
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    pub fn soc(&self) -> &SocDescriptor {
        &self.soc
    }

    pub fn sysmem_manager(&self) -> &SystemMemoryManager {
        &self.sysmem
    }

    pub fn simulator(&self) -> &SimulatedDevice {
        &self.simulator
    }

    pub fn allocator(&self, buffer_type: BufferType) -> &BankAllocator {
        match buffer_type {
            BufferType::Dram => &self.dram_allocator,
            BufferType::L1 => &self.l1_allocator,
        }
    }

    pub fn alignment(&self, buffer_type: BufferType) -> u32 {
        match buffer_type {
            BufferType::Dram => self.settings.dram_alignment,
            BufferType::L1 => self.settings.l1_alignment,
        }
    }

    pub fn num_hw_cqs(&self) -> u8 {
        self.config.num_hw_cqs
    }

    pub fn num_sub_devices(&self) -> u8 {
        self.config.num_sub_devices
    }

    pub fn dispatch_core_type(&self) -> DispatchCoreType {
        self.config.dispatch_core_type
    }

    /// Sub-devices waited on when the caller names none.
    pub fn sub_device_stall_group(&self) -> Vec<SubDeviceId> {
        (0..self.config.num_sub_devices).map(SubDeviceId).collect()
    }

    pub fn num_banks(&self, buffer_type: BufferType) -> u32 {
        self.soc.num_banks(buffer_type)
    }

    pub fn bank_offset(&self, buffer_type: BufferType, bank_id: u32) -> u32 {
        self.soc.bank_offset(buffer_type, bank_id)
    }

    pub fn dram_channel_from_logical_core(&self, core: CoreCoord) -> u32 {
        self.soc.dram_bank_from_logical_core(core)
    }

    pub fn virtual_core_from_logical_core(
        &self,
        core: CoreCoord,
        core_type: CoreType,
    ) -> CoreCoord {
        self.soc.virtual_core_from_logical_core(core, core_type)
    }

    pub fn noc_unicast_encoding(&self, virtual_core: CoreCoord) -> u32 {
        self.soc.noc_unicast_encoding(virtual_core)
    }

    pub fn is_valid_logical_core(&self, core: CoreCoord, buffer_type: BufferType) -> bool {
        self.soc.is_valid_logical_core(core, buffer_type)
    }
}
