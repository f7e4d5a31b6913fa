//! Function/response codes for SCSI Task Management PDUs (RFC 3720 §10.5/10.6).

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use anyhow::{Result, bail};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Task Management function requested by the initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskMgmtFunction {
    AbortTask,
    AbortTaskSet,
    ClearAca,
    ClearTaskSet,
    LogicalUnitReset,
    TargetWarmReset,
    TargetColdReset,
    /// ERL2 connection-recovery task reassignment; the codec parses it but
    /// no connection-recovery path consumes it in this crate.
    TaskReassign,
    Reserved(u8),
}

impl TaskMgmtFunction {
    pub const FUNCTION_MASK: u8 = 0b0111_1111;

    #[inline]
    pub fn from_raw(v: u8) -> Self {
        match v & Self::FUNCTION_MASK {
            1 => Self::AbortTask,
            2 => Self::AbortTaskSet,
            3 => Self::ClearAca,
            4 => Self::ClearTaskSet,
            5 => Self::LogicalUnitReset,
            6 => Self::TargetWarmReset,
            7 => Self::TargetColdReset,
            8 => Self::TaskReassign,
            other => Self::Reserved(other),
        }
    }

    #[inline]
    pub fn as_raw(self) -> u8 {
        match self {
            Self::AbortTask => 1,
            Self::AbortTaskSet => 2,
            Self::ClearAca => 3,
            Self::ClearTaskSet => 4,
            Self::LogicalUnitReset => 5,
            Self::TargetWarmReset => 6,
            Self::TargetColdReset => 7,
            Self::TaskReassign => 8,
            Self::Reserved(v) => v,
        }
    }
}

/// Wire view of the Task Management function byte (bit 7 is reserved/0).
#[repr(transparent)]
#[derive(Default, Clone, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawTaskMgmtFunction(u8);

impl RawTaskMgmtFunction {
    #[inline]
    pub const fn raw(&self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn new_raw(v: u8) -> Self {
        Self(v)
    }

    #[inline]
    pub fn function(&self) -> TaskMgmtFunction {
        TaskMgmtFunction::from_raw(self.0)
    }

    #[inline]
    pub fn set_function(&mut self, f: TaskMgmtFunction) {
        self.0 = f.as_raw() & TaskMgmtFunction::FUNCTION_MASK;
    }
}

impl fmt::Debug for RawTaskMgmtFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawTaskMgmtFunction({:?})", self.function())
    }
}

/// Response code returned in a Task Management Response PDU (§10.6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskMgmtResponseCode {
    FunctionComplete,
    TaskNotExist,
    LunNotExist,
    TaskStillAllegiant,
    TaskFailoverNotSupported,
    TaskManagementFunctionNotSupported,
    FunctionAuthorizationFailed,
    FunctionRejected,
    Reserved(u8),
}

impl TaskMgmtResponseCode {
    #[inline]
    pub fn from_raw(v: u8) -> Self {
        match v {
            0 => Self::FunctionComplete,
            1 => Self::TaskNotExist,
            2 => Self::LunNotExist,
            3 => Self::TaskStillAllegiant,
            4 => Self::TaskFailoverNotSupported,
            5 => Self::TaskManagementFunctionNotSupported,
            6 => Self::FunctionAuthorizationFailed,
            255 => Self::FunctionRejected,
            other => Self::Reserved(other),
        }
    }

    #[inline]
    pub fn as_raw(self) -> u8 {
        match self {
            Self::FunctionComplete => 0,
            Self::TaskNotExist => 1,
            Self::LunNotExist => 2,
            Self::TaskStillAllegiant => 3,
            Self::TaskFailoverNotSupported => 4,
            Self::TaskManagementFunctionNotSupported => 5,
            Self::FunctionAuthorizationFailed => 6,
            Self::FunctionRejected => 255,
            Self::Reserved(v) => v,
        }
    }

    #[inline]
    pub fn is_success(self) -> bool {
        matches!(self, Self::FunctionComplete)
    }
}

/// Wire view of the Task Management response byte.
#[repr(transparent)]
#[derive(Default, Clone, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawTaskMgmtResponseCode(u8);

impl RawTaskMgmtResponseCode {
    #[inline]
    pub const fn raw(&self) -> u8 {
        self.0
    }

    #[inline]
    pub fn code(&self) -> TaskMgmtResponseCode {
        TaskMgmtResponseCode::from_raw(self.0)
    }

    #[inline]
    pub fn set_code(&mut self, c: TaskMgmtResponseCode) {
        self.0 = c.as_raw();
    }

    #[inline]
    pub fn validate(&self) -> Result<()> {
        if matches!(self.code(), TaskMgmtResponseCode::Reserved(v) if v != 255 ) {
            bail!("reserved task management response code: {}", self.0);
        }
        Ok(())
    }
}

impl fmt::Debug for RawTaskMgmtResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawTaskMgmtResponseCode({:?})", self.code())
    }
}
