// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Environment variable name constants for centralized management across the crate
//!
//! ## Organization
//!
//! - **Logging**: Log level, configuration file and output format
//! - **Dispatch**: Command queue geometry and transport limits

/// Logging environment variables
pub mod logging {
    /// Log level and filters (e.g., "debug", "cq_dispatch::sysmem=trace")
    pub const CQD_LOG: &str = "CQD_LOG";

    /// Path to logging configuration file
    pub const CQD_LOGGING_CONFIG_PATH: &str = "CQD_LOGGING_CONFIG_PATH";

    /// Enable JSONL logging format
    pub const CQD_LOGGING_JSONL: &str = "CQD_LOGGING_JSONL";

    /// Disable ANSI terminal colors in logs
    pub const CQD_SDK_DISABLE_ANSI_LOGGING: &str = "CQD_SDK_DISABLE_ANSI_LOGGING";
}

/// Dispatch settings environment variables
///
/// Every field of `DispatchSettings` can be overridden with `CQD_DISPATCH_<FIELD>`;
/// the most commonly tuned ones are listed here.
pub mod dispatch {
    /// Path to a TOML file with dispatch settings
    pub const CQD_DISPATCH_CONFIG_PATH: &str = "CQD_DISPATCH_CONFIG_PATH";

    /// Host (PCIe) alignment in bytes
    pub const CQD_DISPATCH_HOST_ALIGNMENT: &str = "CQD_DISPATCH_HOST_ALIGNMENT";

    /// Issue queue size per command queue
    pub const CQD_DISPATCH_ISSUE_QUEUE_SIZE: &str = "CQD_DISPATCH_ISSUE_QUEUE_SIZE";

    /// Completion queue size per command queue
    pub const CQD_DISPATCH_COMPLETION_QUEUE_SIZE: &str = "CQD_DISPATCH_COMPLETION_QUEUE_SIZE";

    /// Number of prefetch queue entries
    pub const CQD_DISPATCH_PREFETCH_Q_ENTRIES: &str = "CQD_DISPATCH_PREFETCH_Q_ENTRIES";

    /// Maximum prefetch command size for worker dispatch cores
    pub const CQD_DISPATCH_WORKER_MAX_PREFETCH_CMD_SIZE: &str =
        "CQD_DISPATCH_WORKER_MAX_PREFETCH_CMD_SIZE";
}
