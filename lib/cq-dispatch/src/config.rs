// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transport settings for the command queues.
//!
//! Settings are layered, lowest priority first:
//! 1. Built-in defaults ([`DispatchSettings::default`]).
//! 2. An optional TOML file pointed to by `CQD_DISPATCH_CONFIG_PATH`.
//! 3. `CQD_DISPATCH_*` environment variables, e.g. `CQD_DISPATCH_ISSUE_QUEUE_SIZE=65536`.

use anyhow::Result;
use derive_builder::Builder;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::error::DispatchError;

pub mod environment_names;

/// Size of the completion queue transfer unit; completion pages are popped in these units.
pub const DEFAULT_TRANSFER_PAGE_SIZE: u32 = 4096;

/// Starting granularity when splitting a page that is too large for one command.
pub const DEFAULT_BASE_PARTIAL_PAGE_SIZE: u32 = 4096;

const DEFAULT_HOST_ALIGNMENT: u32 = 32;
const DEFAULT_DRAM_ALIGNMENT: u32 = 32;
const DEFAULT_L1_ALIGNMENT: u32 = 16;

const DEFAULT_WORKER_MAX_PREFETCH_CMD_SIZE: u32 = 128 * 1024;
const DEFAULT_ETHERNET_MAX_PREFETCH_CMD_SIZE: u32 = 32 * 1024;

/// Default issue/completion split is 75/25 of a 1 MiB command queue.
const DEFAULT_ISSUE_QUEUE_SIZE: u32 = 768 * 1024;
const DEFAULT_COMPLETION_QUEUE_SIZE: u32 = 256 * 1024;

/// Host-owned pointer area at the start of every command queue region.
const DEFAULT_HOST_CQ_RESERVED_SIZE: u32 = 128;

const DEFAULT_PREFETCH_Q_ENTRIES: u32 = 1534;

const DEFAULT_DISPATCH_MESSAGE_ADDR: u32 = 0x100;
const DEFAULT_DISPATCH_MESSAGE_STRIDE: u32 = 16;

/// Core type running the prefetch/dispatch firmware.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DispatchCoreType {
    #[default]
    Worker,
    Ethernet,
}

/// Transport limits shared by every command queue of a device.
#[derive(Debug, Clone, Builder, Validate, Serialize, Deserialize, PartialEq, Eq)]
#[builder(default)]
pub struct DispatchSettings {
    /// Alignment of host (PCIe) memory, and of every command in the issue queue
    #[validate(custom(function = "validate_power_of_2"))]
    pub host_alignment: u32,

    /// Alignment of DRAM pages
    #[validate(custom(function = "validate_power_of_2"))]
    pub dram_alignment: u32,

    /// Alignment of L1 pages
    #[validate(custom(function = "validate_power_of_2"))]
    pub l1_alignment: u32,

    /// Completion queue page size
    #[validate(custom(function = "validate_power_of_2"))]
    pub transfer_page_size: u32,

    /// Base granularity for splitting oversized pages
    #[validate(range(min = 32))]
    pub base_partial_page_size: u32,

    /// Largest command sequence the prefetcher accepts when dispatch runs on worker cores
    #[validate(range(min = 256))]
    pub worker_max_prefetch_cmd_size: u32,

    /// Largest command sequence the prefetcher accepts when dispatch runs on ethernet cores
    #[validate(range(min = 256))]
    pub ethernet_max_prefetch_cmd_size: u32,

    /// Issue queue size per command queue
    #[validate(range(min = 1024))]
    pub issue_queue_size: u32,

    /// Completion queue size per command queue
    #[validate(range(min = 4096))]
    pub completion_queue_size: u32,

    /// Bytes reserved at the start of each command queue for host pointers
    pub host_cq_reserved_size: u32,

    /// Number of entries in the prefetch (fetch) queue
    #[validate(range(min = 1, max = 65535))]
    pub prefetch_q_entries: u32,

    /// Device address of the first sub-device dispatch message
    pub dispatch_message_addr: u32,

    /// Distance between the dispatch messages of consecutive sub-devices
    #[validate(range(min = 4))]
    pub dispatch_message_stride: u32,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        DispatchSettings {
            host_alignment: DEFAULT_HOST_ALIGNMENT,
            dram_alignment: DEFAULT_DRAM_ALIGNMENT,
            l1_alignment: DEFAULT_L1_ALIGNMENT,
            transfer_page_size: DEFAULT_TRANSFER_PAGE_SIZE,
            base_partial_page_size: DEFAULT_BASE_PARTIAL_PAGE_SIZE,
            worker_max_prefetch_cmd_size: DEFAULT_WORKER_MAX_PREFETCH_CMD_SIZE,
            ethernet_max_prefetch_cmd_size: DEFAULT_ETHERNET_MAX_PREFETCH_CMD_SIZE,
            issue_queue_size: DEFAULT_ISSUE_QUEUE_SIZE,
            completion_queue_size: DEFAULT_COMPLETION_QUEUE_SIZE,
            host_cq_reserved_size: DEFAULT_HOST_CQ_RESERVED_SIZE,
            prefetch_q_entries: DEFAULT_PREFETCH_Q_ENTRIES,
            dispatch_message_addr: DEFAULT_DISPATCH_MESSAGE_ADDR,
            dispatch_message_stride: DEFAULT_DISPATCH_MESSAGE_STRIDE,
        }
    }
}

impl DispatchSettings {
    pub fn builder() -> DispatchSettingsBuilder {
        DispatchSettingsBuilder::default()
    }

    pub(crate) fn figment() -> Figment {
        use environment_names::dispatch as env_dispatch;

        let config_path = std::env::var(env_dispatch::CQD_DISPATCH_CONFIG_PATH).unwrap_or_default();
        Figment::new()
            .merge(Serialized::defaults(DispatchSettings::default()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("CQD_DISPATCH_").filter_map(|k| {
                let full_key = format!("CQD_DISPATCH_{}", k.as_str());
                // filters out empty environment variables and the config path itself
                match std::env::var(&full_key) {
                    Ok(v)
                        if !v.is_empty() && full_key != env_dispatch::CQD_DISPATCH_CONFIG_PATH =>
                    {
                        Some(k.into())
                    }
                    _ => None,
                }
            }))
    }

    /// Load the dispatch settings from the environment and the optional configuration file.
    pub fn from_settings() -> Result<DispatchSettings> {
        let settings: DispatchSettings = Self::figment().extract()?;
        Ok(settings.validated()?)
    }

    /// Run field validation plus the checks that relate fields to each other.
    pub fn validated(self) -> std::result::Result<Self, DispatchError> {
        self.validate()?;

        let align = self.host_alignment;
        for (name, value) in [
            ("issue_queue_size", self.issue_queue_size),
            ("worker_max_prefetch_cmd_size", self.worker_max_prefetch_cmd_size),
            ("ethernet_max_prefetch_cmd_size", self.ethernet_max_prefetch_cmd_size),
            ("base_partial_page_size", self.base_partial_page_size),
            ("host_cq_reserved_size", self.host_cq_reserved_size),
        ] {
            if value % align != 0 {
                return Err(DispatchError::Config(format!(
                    "{name} ({value}) must be a multiple of the host alignment ({align})"
                )));
            }
        }

        if self.completion_queue_size % self.transfer_page_size != 0 {
            return Err(DispatchError::Config(format!(
                "completion_queue_size ({}) must be a multiple of transfer_page_size ({})",
                self.completion_queue_size, self.transfer_page_size
            )));
        }

        // a wrap of the issue queue must always free room for the largest command
        let max_prefetch = self
            .worker_max_prefetch_cmd_size
            .max(self.ethernet_max_prefetch_cmd_size);
        if self.issue_queue_size < max_prefetch {
            return Err(DispatchError::Config(format!(
                "issue_queue_size ({}) must hold the largest prefetch command ({max_prefetch})",
                self.issue_queue_size
            )));
        }

        Ok(self)
    }

    pub fn max_prefetch_cmd_size(&self, core_type: DispatchCoreType) -> u32 {
        match core_type {
            DispatchCoreType::Worker => self.worker_max_prefetch_cmd_size,
            DispatchCoreType::Ethernet => self.ethernet_max_prefetch_cmd_size,
        }
    }

    /// Device address of the dispatch message tracking workers of `sub_device`.
    pub fn dispatch_message_addr(&self, sub_device: u8) -> u32 {
        self.dispatch_message_addr + u32::from(sub_device) * self.dispatch_message_stride
    }

    /// Total bytes of one command queue region in host memory.
    pub fn cq_size(&self) -> u32 {
        self.host_cq_reserved_size + self.issue_queue_size + self.completion_queue_size
    }
}

fn validate_power_of_2(value: u32) -> Result<(), ValidationError> {
    if !value.is_power_of_two() {
        return Err(ValidationError::new("value_must_be_power_of_2"));
    }
    Ok(())
}

/// Check if a string is truthy.
///
/// Truthy values: "1", "true", "on", "yes" (case-insensitive)
pub fn is_truthy(val: &str) -> bool {
    matches!(val.to_lowercase().as_str(), "1" | "true" | "on" | "yes")
}

/// Check if an environment variable is truthy.
///
/// Returns `false` if the environment variable is not set.
pub fn env_is_truthy(env: &str) -> bool {
    match std::env::var(env) {
        Ok(val) => is_truthy(val.as_str()),
        Err(_) => false,
    }
}

/// Returns true if `CQD_LOGGING_JSONL` is set to a truthy value.
pub fn jsonl_logging_enabled() -> bool {
    env_is_truthy(environment_names::logging::CQD_LOGGING_JSONL)
}

/// Returns true if `CQD_SDK_DISABLE_ANSI_LOGGING` is set to a truthy value.
pub fn disable_ansi_logging() -> bool {
    env_is_truthy(environment_names::logging::CQD_SDK_DISABLE_ANSI_LOGGING)
}
