//! BHS for **SCSI Task Management Function Request** (RFC 3720 §10.5,
//! opcode `0x02`).

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Result, bail};
use tracing::warn;
use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U32, U64,
};

use crate::{
    client::pdu_connection::FromBytes,
    models::{
        common::{BasicHeaderSegment, HEADER_LEN, SendingData},
        data_fromat::ZeroCopyType,
        opcode::{BhsOpcode, Opcode, RawBhsOpcode},
        task_mgmt::common::{RawTaskMgmtFunction, TaskMgmtFunction},
    },
};

#[repr(C)]
#[derive(Debug, Default, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct TaskMgmtRequest {
    pub opcode: RawBhsOpcode,          // 0 (0x02, I bit allowed)
    pub function: RawTaskMgmtFunction, // 1
    pub reserved1: [u8; 2],            // 2..4
    pub total_ahs_length: u8,          // 4 (must be 0)
    pub data_segment_length: [u8; 3],  // 5..8 (must be 0)
    pub lun: U64<BigEndian>,           // 8..16
    pub initiator_task_tag: u32,       // 16..20
    pub referenced_task_tag: U32<BigEndian>, // 20..24
    pub cmd_sn: U32<BigEndian>,        // 24..28
    pub exp_stat_sn: U32<BigEndian>,   // 28..32
    pub ref_cmd_sn: U32<BigEndian>,    // 32..36
    pub exp_data_sn: U32<BigEndian>,   // 36..40
    pub reserved2: U64<BigEndian>,     // 40..48
}

impl TaskMgmtRequest {
    pub fn to_bhs_bytes(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() != HEADER_LEN {
            bail!("buffer length must be {HEADER_LEN}, got {}", buf.len());
        }
        buf.copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn from_bhs_bytes(buf: &mut [u8]) -> Result<&mut Self> {
        let hdr = <Self as zerocopy::FromBytes>::mut_from_bytes(buf)
            .map_err(|e| anyhow::anyhow!("failed convert buffer TaskMgmtRequest: {e}"))?;
        if hdr.opcode.opcode_known() != Some(Opcode::ScsiTaskMgmtReq) {
            anyhow::bail!(
                "TaskMgmtRequest: invalid opcode 0x{:02x}",
                hdr.opcode.opcode_raw()
            );
        }
        Ok(hdr)
    }
}

impl SendingData for TaskMgmtRequest {
    fn get_final_bit(&self) -> bool {
        true
    }

    fn set_final_bit(&mut self) {
        warn!("TaskMgmtRequest is header-only; Final flag is implicit");
    }

    fn get_continue_bit(&self) -> bool {
        false
    }

    fn set_continue_bit(&mut self) {
        warn!("TaskMgmtRequest cannot be marked as Continue");
    }
}

impl FromBytes for TaskMgmtRequest {
    fn from_bhs_bytes(bytes: &mut [u8]) -> Result<&mut Self> {
        TaskMgmtRequest::from_bhs_bytes(bytes)
    }
}

impl BasicHeaderSegment for TaskMgmtRequest {
    #[inline]
    fn to_bhs_bytes(&self, buf: &mut [u8]) -> Result<()> {
        self.to_bhs_bytes(buf)
    }

    #[inline]
    fn get_opcode(&self) -> Result<BhsOpcode> {
        BhsOpcode::try_from(self.opcode.raw())
    }

    #[inline]
    fn get_initiator_task_tag(&self) -> u32 {
        self.initiator_task_tag
    }

    #[inline]
    fn get_ahs_length_bytes(&self) -> usize {
        (self.total_ahs_length as usize) * 4
    }

    #[inline]
    fn set_ahs_length_bytes(&mut self, len: u8) {
        self.total_ahs_length = len >> 2;
    }

    #[inline]
    fn get_data_length_bytes(&self) -> usize {
        u32::from_be_bytes([
            0,
            self.data_segment_length[0],
            self.data_segment_length[1],
            self.data_segment_length[2],
        ]) as usize
    }

    #[inline]
    fn set_data_length_bytes(&mut self, len: u32) {
        let be = len.to_be_bytes();
        self.data_segment_length = [be[1], be[2], be[3]];
    }
}

impl ZeroCopyType for TaskMgmtRequest {}

/// Fluent builder for Task Management Function Request PDUs.
#[derive(Debug, Default)]
pub struct TaskMgmtRequestBuilder {
    pub header: TaskMgmtRequest,
}

impl TaskMgmtRequestBuilder {
    pub fn new() -> Self {
        Self {
            header: TaskMgmtRequest {
                opcode: {
                    let mut tmp = RawBhsOpcode::default();
                    tmp.set_opcode_known(Opcode::ScsiTaskMgmtReq);
                    tmp
                },
                ..Default::default()
            },
        }
    }

    pub fn function(mut self, f: TaskMgmtFunction) -> Self {
        self.header.function.set_function(f);
        self
    }

    pub fn lun(mut self, lun: u64) -> Self {
        self.header.lun.set(lun);
        self
    }

    pub fn initiator_task_tag(mut self, itt: u32) -> Self {
        self.header.initiator_task_tag = itt;
        self
    }

    /// Initiator Task Tag of the task this request refers to. For
    /// `TargetWarmReset`/`TargetColdReset`/`AbortTaskSet`/`ClearTaskSet`
    /// this field is ignored by the target and should be `0xFFFFFFFF`.
    pub fn referenced_task_tag(mut self, rtt: u32) -> Self {
        self.header.referenced_task_tag.set(rtt);
        self
    }

    pub fn cmd_sn(mut self, sn: u32) -> Self {
        self.header.cmd_sn.set(sn);
        self
    }

    pub fn exp_stat_sn(mut self, sn: u32) -> Self {
        self.header.exp_stat_sn.set(sn);
        self
    }

    pub fn ref_cmd_sn(mut self, sn: u32) -> Self {
        self.header.ref_cmd_sn.set(sn);
        self
    }

    pub fn exp_data_sn(mut self, sn: u32) -> Self {
        self.header.exp_data_sn.set(sn);
        self
    }
}
