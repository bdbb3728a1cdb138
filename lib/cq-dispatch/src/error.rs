// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Result type for dispatch operations.
pub type Result<T, E = DispatchError> = std::result::Result<T, E>;

/// Coarse classification of a [`DispatchError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ErrorKind {
    /// The caller passed a region, shard spec or id that can never be satisfied.
    InvalidArgument,

    /// The buffer or device configuration cannot be served by the transport.
    Configuration,

    /// An external exit flag stopped the operation before it completed.
    Aborted,

    /// The host and device sides of a queue disagree.
    Internal,
}

/// Errors raised by the dispatch layer.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("buffer region with offset {offset} and size {size} is invalid: {reason}")]
    InvalidRegion {
        offset: u32,
        size: u32,
        reason: String,
    },

    #[error("padded page size {page_size} exceeds the maximum payload of {max_data_size} bytes")]
    PageTooLarge { page_size: u32, max_data_size: u32 },

    #[error("invalid buffer configuration: {0}")]
    InvalidBuffer(String),

    #[error("invalid shard spec: {0}")]
    InvalidShardSpec(String),

    #[error("invalid sub-device id {index}, device has {num_sub_devices} sub-devices")]
    InvalidSubDevice { index: u8, num_sub_devices: u8 },

    #[error("command queue {cq_id} does not exist, device has {num_hw_cqs} hardware queues")]
    InvalidQueue { cq_id: u8, num_hw_cqs: u8 },

    #[error("out of {buffer_type} memory: requested {requested} bytes per bank")]
    OutOfMemory {
        buffer_type: crate::buffer::BufferType,
        requested: u64,
    },

    #[error("read on command queue {cq_id} aborted by exit flag")]
    ReadAborted { cq_id: u8 },

    #[error("command queue protocol violation: {0}")]
    QueueProtocol(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::InvalidRegion { .. }
            | DispatchError::InvalidBuffer(_)
            | DispatchError::InvalidShardSpec(_)
            | DispatchError::InvalidSubDevice { .. }
            | DispatchError::InvalidQueue { .. } => ErrorKind::InvalidArgument,
            DispatchError::PageTooLarge { .. }
            | DispatchError::OutOfMemory { .. }
            | DispatchError::Config(_) => ErrorKind::Configuration,
            DispatchError::ReadAborted { .. } => ErrorKind::Aborted,
            DispatchError::QueueProtocol(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn invalid_region(offset: u32, size: u32, reason: impl Into<String>) -> Self {
        DispatchError::InvalidRegion {
            offset,
            size,
            reason: reason.into(),
        }
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        DispatchError::QueueProtocol(msg.into())
    }
}

impl From<validator::ValidationErrors> for DispatchError {
    fn from(errors: validator::ValidationErrors) -> Self {
        DispatchError::Config(errors.to_string())
    }
}
