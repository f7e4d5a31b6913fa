//! External SCSI mid-layer collaborator surface.
//!
//! The engine never owns a SCSI task; it only holds an `Arc<dyn ScsiTask>`
//! handle and reports completion back through `TaskCompletionSink`. Both
//! traits are implemented by the consumer (the SCSI mid-layer), not by this
//! crate.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fmt;

use bytes::Bytes;

use crate::models::command::common::{ScsiStatus, TaskAttribute};

/// Direction of the SCSI data transfer requested by a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDirection {
    None,
    Read,
    Write,
    Bidirectional,
}

/// Encodes which "class" an initiator task tag belongs to; packed into the
/// top 8 bits of the tag so the receive loop can classify a reply in O(1)
/// without a side table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskType {
    Scsi = 0,
    Latency = 1,
    TaskMgmt = 2,
}

impl TaskType {
    #[inline]
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Scsi),
            1 => Some(Self::Latency),
            2 => Some(Self::TaskMgmt),
            _ => None,
        }
    }
}

/// Build an initiator task tag as `(task_type << 24) | (lun << 16) |
/// (scsi_task_id & 0xFFFF)`.
#[inline]
pub fn encode_task_tag(task_type: TaskType, lun: u8, scsi_task_id: u16) -> u32 {
    ((task_type as u32) << 24) | ((lun as u32) << 16) | (scsi_task_id as u32)
}

/// Inverse of [`encode_task_tag`]. Returns `None` for the task type if the
/// top byte isn't one of the known classes (e.g. the tag is a sentinel like
/// `0xFFFFFFFF`).
#[inline]
pub fn decode_task_tag(tag: u32) -> (Option<TaskType>, u8, u16) {
    let task_type = TaskType::from_u8((tag >> 24) as u8);
    let lun = ((tag >> 16) & 0xFF) as u8;
    let scsi_task_id = (tag & 0xFFFF) as u16;
    (task_type, lun, scsi_task_id)
}

/// Outcome of a completed or abandoned task, reported to the SCSI mid-layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceResponse {
    /// The command ran to completion at the target; `ScsiStatus` is valid.
    TaskComplete,
    /// Transport or target-side failure; no valid SCSI status.
    ServiceDeliveryOrTargetFailure,
    /// The connection or session was torn down before the task finished.
    DeliveryFailure,
    /// A task-management function the target refused to perform.
    FunctionRejected,
}

/// Returned by `ProcessTask` to indicate the task was accepted for
/// asynchronous dispatch (never delivered synchronously).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    RequestInProcess,
    FunctionRejected,
    TryAgain,
}

/// Opaque SCSI task handle. Implemented by the SCSI mid-layer; consumed by
/// the dispatcher, send path, and receive loop.
pub trait ScsiTask: Send + Sync + fmt::Debug {
    /// Session this task belongs to (identifies the target).
    fn session_id(&self) -> u16;
    /// Logical Unit Number the command targets.
    fn lun(&self) -> u64;
    /// SCSI-layer tagged task identifier, unique within the session.
    fn tagged_task_id(&self) -> u16;
    fn direction(&self) -> DataDirection;
    /// Total bytes this task expects to move.
    fn requested_data_transfer_count(&self) -> u32;
    /// 6, 10, 12, or 16-byte Command Descriptor Block.
    fn cdb(&self) -> &[u8];
    fn task_attribute(&self) -> TaskAttribute;

    /// Read `len` bytes at `offset` from the task's data buffer (used when
    /// emitting Data-Out).
    fn read(&self, offset: u32, len: u32) -> anyhow::Result<Bytes>;
    /// Write `buf` at `offset` into the task's data buffer (used when
    /// consuming Data-In).
    fn write(&self, offset: u32, buf: &[u8]) -> anyhow::Result<()>;

    /// The initiator task tag assigned by the dispatcher; stored on the task
    /// so the receive loop can find it again.
    fn initiator_task_tag(&self) -> u32;
    fn set_initiator_task_tag(&self, tag: u32);

    fn set_realized_data_transfer_count(&self, len: u32);
    fn increment_realized_data_transfer_count(&self, len: u32);
    fn realized_data_transfer_count(&self) -> u32;
}

/// Completion callback surface for ordinary SCSI tasks (as opposed to
/// task-management functions, which use `TaskMgmtCompletionSink` in
/// `taskmgmt.rs`).
pub trait TaskCompletionSink: Send + Sync {
    fn complete_task(
        &self,
        task: std::sync::Arc<dyn ScsiTask>,
        status: ScsiStatus,
        response: ServiceResponse,
    );
    fn complete_task_timeout(&self, task: std::sync::Arc<dyn ScsiTask>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_tag_round_trips() {
        let tag = encode_task_tag(TaskType::Scsi, 7, 0x1234);
        assert_eq!(decode_task_tag(tag), (Some(TaskType::Scsi), 7, 0x1234));

        let tag = encode_task_tag(TaskType::TaskMgmt, 63, 0xFFFF);
        assert_eq!(decode_task_tag(tag), (Some(TaskType::TaskMgmt), 63, 0xFFFF));
    }

    #[test]
    fn unrecognised_class_byte_decodes_to_none() {
        let (task_type, ..) = decode_task_tag(0xFFFF_FFFF);
        assert_eq!(task_type, None);
    }
}
