// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

mod common;

use std::io::Write;

use anyhow::Result;
use cq_dispatch::config::environment_names::dispatch;
use cq_dispatch::{BufferType, CommandQueue, DeviceConfig, DispatchSettings};

use common::{interleaved, open_device, pattern};

#[test]
fn test_queue_geometry_from_file_and_env() -> Result<()> {
    let mut file = tempfile::NamedTempFile::new()?;
    writeln!(file, "issue_queue_size = 16384")?;
    writeln!(file, "worker_max_prefetch_cmd_size = 4096")?;
    writeln!(file, "ethernet_max_prefetch_cmd_size = 4096")?;
    let path = file.path().to_string_lossy().to_string();

    let settings = temp_env::with_vars(
        vec![
            (dispatch::CQD_DISPATCH_CONFIG_PATH, Some(path.as_str())),
            (dispatch::CQD_DISPATCH_COMPLETION_QUEUE_SIZE, Some("8192")),
        ],
        DispatchSettings::from_settings,
    )?;
    assert_eq!(settings.issue_queue_size, 16 * 1024);
    assert_eq!(settings.completion_queue_size, 8192);

    let device = open_device(DeviceConfig::default(), settings)?;
    let sysmem = device.sysmem_manager();
    assert_eq!(sysmem.get_issue_queue_size(0)?, 16 * 1024);

    let cq = CommandQueue::new(device, 0)?;
    let buffer = interleaved(cq.device(), BufferType::Dram, 700, 100)?;
    let src = pattern(700 * 100, 9);
    cq.enqueue_write_buffer(&buffer, &src, false)?;
    assert_eq!(cq.enqueue_read_buffer(&buffer, true)?.to_vec(), src);
    Ok(())
}

#[test]
fn test_invalid_settings_are_rejected_at_open() {
    let settings = DispatchSettings {
        issue_queue_size: 8192,
        ..DispatchSettings::default()
    };
    let err = open_device(DeviceConfig::default(), settings).unwrap_err();
    assert!(err.to_string().contains("issue_queue_size"));
}
