// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! # CQ Dispatch
//!
//! Host side of a device command queue. Logical buffer reads and writes are turned into
//! streams of fixed-format commands in a shared-memory issue ring; read results come back
//! through a completion ring and are copied into user memory.
//!
//! ```no_run
//! use cq_dispatch::{Buffer, BufferConfig, CommandQueue, Device, DeviceConfig, DispatchSettings};
//!
//! # fn main() -> anyhow::Result<()> {
//! cq_dispatch::logging::init();
//! let device = Device::open(DeviceConfig::default(), DispatchSettings::from_settings()?)?;
//! let config = BufferConfig::builder().size(8192).page_size(2048).build()?;
//! let buffer = Buffer::create(&device, config)?;
//!
//! let cq = CommandQueue::new(device, 0)?;
//! cq.enqueue_write_buffer(&buffer, &[7u8; 8192], false)?;
//! let data = cq.enqueue_read_buffer(&buffer, true)?;
//! assert_eq!(data.to_vec(), vec![7u8; 8192]);
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod command;
pub mod command_queue;
pub mod config;
pub mod core_coord;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod sysmem;

pub use buffer::{
    Buffer, BufferConfig, BufferLayout, BufferPageMapping, BufferRegion, BufferType,
    ShardOrientation, ShardSpec,
};
pub use command_queue::{CommandQueue, HostBuffer};
pub use config::{DispatchCoreType, DispatchSettings};
pub use core_coord::{CoreCoord, CoreRange, CoreRangeSet};
pub use device::{Device, DeviceConfig, SubDeviceId};
pub use error::{DispatchError, ErrorKind, Result};
