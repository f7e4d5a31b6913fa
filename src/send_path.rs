//! Send path (§4.5, §4.6, and the `BeginTask` half of §4.4): frame and
//! transmit SCSI Command, Data-Out, NOP-Out, and Task-Management Request
//! PDUs.
//!
//! Grounded in `client/client.rs`'s `send_request`/`write` (vectored
//! BHS+digest+data send over a mutex-guarded writer) and in
//! `data_fromat.rs`'s `PDUWithData::build`, which already does the
//! digest/padding work described by the framing algorithm; this module
//! supplies the per-opcode header construction and sequence-number
//! stamping the spec asks for on top of that codec.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{Arc, atomic::Ordering},
    time::Instant,
};

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use tracing::warn;

use crate::{
    cfg::{config::Config, enums::Digest},
    dispatcher::TaskRegistry,
    models::{
        command::request::{ScsiCommandRequest, ScsiCommandRequestBuilder},
        common::{BasicHeaderSegment, Builder, HEADER_LEN},
        data::request::{ScsiDataOut, ScsiDataOutBuilder},
        data_fromat::PduRequest,
        nop::request::{NopOutRequest, NopOutRequestBuilder},
        task_mgmt::{
            common::TaskMgmtFunction,
            request::{TaskMgmtRequest, TaskMgmtRequestBuilder},
        },
    },
    session::{Connection, SessionStore},
    task::{DataDirection, ScsiTask, TaskType, decode_task_tag},
};

/// A connection's digest/segment-length parameters, reflected into a
/// throwaway `Config` so the existing `PduRequest::new_request`/`build`
/// codec (which takes `&Config`) can be reused without renegotiating its
/// API. Connections carry their own negotiated digest settings once
/// `ActivateConnection` has run, which may differ from the store-wide
/// pre-login defaults.
pub(crate) fn connection_cfg(store: &SessionStore, conn: &Connection) -> Config {
    let mut cfg = store.config().clone();
    cfg.negotiation.header_digest = conn.params.header_digest;
    cfg.negotiation.data_digest = conn.params.data_digest;
    cfg.negotiation.max_recv_data_segment_length = conn.params.max_recv_data_segment_length;
    cfg
}

/// `SendPDU` (§4.6 steps 2-4): frames an already-built BHS plus payload
/// (digest computation, AHS/data padding, scatter-gather send) and
/// transmits it. Any transport error is the caller's cue to invoke
/// `HandleConnectionTimeout`.
async fn frame_and_send<T>(
    conn: &Connection,
    cfg: &Config,
    header_buf: [u8; HEADER_LEN],
    payload: &[u8],
    cancel: &CancellationToken,
) -> Result<()>
where
    T: BasicHeaderSegment
        + crate::models::common::SendingData
        + crate::client::pdu_connection::FromBytes
        + crate::models::data_fromat::ZeroCopyType,
{
    let mut pdu = PduRequest::<T>::new_request(header_buf, cfg);
    pdu.append_data(payload);
    let (header, body) = pdu.build(
        cfg.negotiation.max_recv_data_segment_length as usize,
        cfg.negotiation.header_digest == Digest::CRC32C,
        cfg.negotiation.data_digest == Digest::CRC32C,
    )?;
    conn.transport
        .send_timed(&header, &body, conn_send_timeout(cfg), cancel)
        .await
}

fn conn_send_timeout(cfg: &Config) -> std::time::Duration {
    cfg.transport.timeout_send
}

/// `BeginTask` command construction (§4.4 second half): builds and sends
/// the SCSI Command PDU for a task the workloop just dequeued, optionally
/// followed by an unsolicited Data-Out burst.
///
/// `exp_stat_sn` and `cmd_sn` must already reflect the values to stamp
/// (the caller advances the session's `CmdSN` counter per §4.3 before
/// calling this).
#[allow(clippy::too_many_arguments)]
pub async fn begin_task(
    store: &SessionStore,
    conn: &Connection,
    task: &Arc<dyn ScsiTask>,
    cmd_sn: u32,
    initial_r2t: bool,
    immediate_data: bool,
    first_burst_length: u32,
    cancel: &CancellationToken,
) -> Result<()> {
    let cfg = connection_cfg(store, conn);
    let itt = task.initiator_task_tag();
    let direction = task.direction();
    let transfer_len = task.requested_data_transfer_count();

    let mut cdb16 = [0u8; 16];
    let cdb = task.cdb();
    cdb16[..cdb.len().min(16)].copy_from_slice(&cdb[..cdb.len().min(16)]);

    let mut builder = ScsiCommandRequestBuilder::new()
        .initiator_task_tag(itt)
        .lun(task.lun())
        .expected_data_transfer_length(transfer_len)
        .cmd_sn(cmd_sn)
        .exp_stat_sn(conn.seq.current())
        .task_attribute(task.task_attribute())
        .scsi_descriptor_block(&cdb16);

    builder = match direction {
        DataDirection::Read => builder.read(),
        DataDirection::Write => builder.write(),
        DataDirection::Bidirectional => builder.read().write(),
        DataDirection::None => builder,
    };

    let is_write = matches!(direction, DataDirection::Write | DataDirection::Bidirectional);
    // §4.4 step 111: a write with InitialR2T and no immediate data sends the
    // command alone; everything else that's a write may carry immediate
    // data and/or an unsolicited burst.
    let command_alone = is_write && initial_r2t && !immediate_data;

    let immediate_len = if is_write && immediate_data && !command_alone {
        transfer_len.min(conn.immediate_data_length)
    } else {
        0
    };

    let mut header_buf = [0u8; HEADER_LEN];
    builder.header.to_bhs_bytes(&mut header_buf)?;

    let immediate_chunk = if immediate_len > 0 {
        task.read(0, immediate_len)?
    } else {
        bytes::Bytes::new()
    };

    // Starts the clock used for both this task's throughput sample and (if
    // the bandwidth window rolls over on completion) the next latency probe.
    *conn.task_start.lock().await = Some(Instant::now());

    frame_and_send::<ScsiCommandRequest>(conn, &cfg, header_buf, &immediate_chunk, cancel).await?;

    if immediate_len > 0 {
        task.increment_realized_data_transfer_count(immediate_len);
        conn.data_to_transfer
            .fetch_sub(immediate_len as u64, Ordering::SeqCst);
    }

    // §4.4 step 112: further unsolicited Data-Out is only sent when the
    // target didn't ask to drive the whole transfer via R2T.
    if is_write && !command_alone && !initial_r2t {
        let remaining_for_burst = first_burst_length.saturating_sub(immediate_len);
        let unsent = transfer_len.saturating_sub(immediate_len);
        let burst_len = unsent.min(remaining_for_burst);
        if burst_len > 0 {
            process_data_out(
                store,
                conn,
                task,
                immediate_len,
                burst_len,
                task.lun(),
                itt,
                ScsiDataOutBuilder::DEFAULT_TTT,
                cancel,
            )
            .await?;
        }
    }

    Ok(())
}

/// Drives `BeginTask` (§4.4 second half) for whichever tag currently sits at
/// the head of `conn.task_queue`, if nothing is already in flight for it.
/// Called after every `enqueue_task` and after every
/// `complete_current_task`, so a connection always keeps sending as long as
/// it has queued work — the queue only ever has one outstanding send at a
/// time, matching its role as a gating structure rather than a pipeline.
pub async fn begin_next_queued(
    store: &SessionStore,
    registry: &TaskRegistry,
    conn: &Connection,
    cancel: &CancellationToken,
) -> Result<()> {
    if conn.inflight.swap(true, Ordering::AcqRel) {
        return Ok(());
    }

    let Some(tag) = conn.peek_current_task().await else {
        conn.inflight.store(false, Ordering::Release);
        return Ok(());
    };

    let (task_type, ..) = decode_task_tag(tag);
    match task_type {
        Some(TaskType::Latency) => {
            *conn.task_start.lock().await = Some(Instant::now());
            send_nop_out(store, conn, tag, NopOutRequest::DEFAULT_TAG, 0, false, &[], cancel).await
        },
        Some(TaskType::Scsi) => {
            let Some(task) = registry.task(tag) else {
                warn!(tag, "begin_next_queued: no task for head tag, dropping");
                conn.complete_current_task().await;
                return Box::pin(begin_next_queued(store, registry, conn, cancel)).await;
            };
            let Some(session) = store.session(conn.session_id).await else {
                conn.inflight.store(false, Ordering::Release);
                return Ok(());
            };
            let cmd_sn = session.seq.stamp_cmd_sn(false);
            begin_task(
                store,
                conn,
                &task,
                cmd_sn,
                session.negotiated.initial_r2t,
                session.negotiated.immediate_data,
                session.negotiated.first_burst_length,
                cancel,
            )
            .await
        },
        Some(TaskType::TaskMgmt) | None => {
            warn!(tag, "begin_next_queued: unexpected tag class at queue head");
            conn.inflight.store(false, Ordering::Release);
            Ok(())
        },
    }
}

/// `ProcessDataOut` (§4.5): segments `data_length` bytes starting at
/// `data_offset` into Data-Out PDUs of at most
/// `conn.params.max_send_data_segment_length` bytes, DataSN incrementing
/// per segment, Final set only on the last. Aborts the burst (without
/// retrying) on the first send error — recovery is the sequence-number
/// engine's and timeout handling's job, not this function's.
#[allow(clippy::too_many_arguments)]
pub async fn process_data_out(
    store: &SessionStore,
    conn: &Connection,
    task: &Arc<dyn ScsiTask>,
    data_offset: u32,
    data_length: u32,
    lun: u64,
    itt: u32,
    ttt: u32,
    cancel: &CancellationToken,
) -> Result<()> {
    let cfg = connection_cfg(store, conn);
    let segment_size = conn.params.max_send_data_segment_length.max(1);

    let mut sent = 0u32;
    let mut data_sn = 0u32;
    while sent < data_length {
        let remaining = data_length - sent;
        let this_len = remaining.min(segment_size);
        let offset = data_offset + sent;
        let is_final = sent + this_len >= data_length;

        let chunk = task.read(offset, this_len)?;

        let mut header = ScsiDataOutBuilder::new()
            .lun(lun)
            .initiator_task_tag(itt)
            .target_transfer_tag(ttt)
            .exp_stat_sn(conn.seq.current())
            .data_sn(data_sn)
            .buffer_offset(offset)
            .header;
        header.flags.set_fin(is_final);

        let mut header_buf = [0u8; HEADER_LEN];
        header.to_bhs_bytes(&mut header_buf)?;

        frame_and_send::<ScsiDataOut>(conn, &cfg, header_buf, &chunk, cancel).await?;

        task.increment_realized_data_transfer_count(this_len);
        conn.data_to_transfer
            .fetch_sub(this_len as u64, Ordering::SeqCst);

        sent += this_len;
        data_sn += 1;
        trace!(itt, ttt, data_sn, this_len, "data-out segment sent");
    }
    Ok(())
}

/// Sends a NOP-Out. `ttt == NopOutRequest::DEFAULT_TAG` solicits a fresh
/// NOP-In (latency probe or keepalive); any other value echoes a
/// target-initiated ping.
pub async fn send_nop_out(
    store: &SessionStore,
    conn: &Connection,
    itt: u32,
    ttt: u32,
    lun: u64,
    immediate: bool,
    payload: &[u8],
    cancel: &CancellationToken,
) -> Result<()> {
    let cfg = connection_cfg(store, conn);
    let mut builder = NopOutRequestBuilder::new()
        .initiator_task_tag(itt)
        .target_task_tag(ttt)
        .lun(lun)
        .exp_stat_sn(conn.seq.current());
    if immediate {
        builder = builder.immediate();
    }

    let mut header_buf = [0u8; HEADER_LEN];
    builder.header.to_bhs_bytes(&mut header_buf)?;
    frame_and_send::<NopOutRequest>(conn, &cfg, header_buf, payload, cancel).await
}

/// Sends a Task Management Function Request (abort/reset).
pub async fn send_task_mgmt_request(
    store: &SessionStore,
    conn: &Connection,
    function: TaskMgmtFunction,
    lun: u64,
    itt: u32,
    referenced_task_tag: u32,
    cmd_sn: u32,
    cancel: &CancellationToken,
) -> Result<()> {
    let cfg = connection_cfg(store, conn);
    let builder = TaskMgmtRequestBuilder::new()
        .function(function)
        .lun(lun)
        .initiator_task_tag(itt)
        .referenced_task_tag(referenced_task_tag)
        .cmd_sn(cmd_sn)
        .exp_stat_sn(conn.seq.current());

    let mut header_buf = [0u8; HEADER_LEN];
    builder.header.to_bhs_bytes(&mut header_buf)?;
    frame_and_send::<TaskMgmtRequest>(conn, &cfg, header_buf, &[], cancel).await
}
