//! End-to-end tests driving `Engine` against a hand-rolled loopback target:
//! a bare `TcpListener` that speaks just enough of the wire protocol to
//! answer one SCSI command, built with the same `PduRequest::build` codec
//! path the engine itself uses to send requests.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{
    Arc, Mutex as StdMutex,
    atomic::{AtomicU32, Ordering},
};

use bytes::Bytes;
use iscsi_initiator_core::{
    cfg::config::Config,
    engine::Engine,
    models::{
        async_msg::{common::{AsyncEvent, RawAsyncEvent}, response::AsyncMessage},
        command::{
            common::{ResponseCode, ScsiStatus, TaskAttribute},
            response::ScsiCommandResponse,
            zero_copy::{RawResponseCode, RawScsiCmdRespFlags, RawScsiStatus},
        },
        common::{BasicHeaderSegment, Builder, HEADER_LEN},
        data::{request::{ScsiDataOut, ScsiDataOutBuilder}, response::ScsiDataIn},
        data_fromat::PduRequest,
        nop::{request::NopOutRequest, response::NopInResponse},
        opcode::{Opcode, RawBhsOpcode},
        parse::Pdu,
        ready_2_transfer::response::ReadyToTransfer,
    },
    session::TargetHooks,
    task::{DataDirection, DispatchOutcome, ScsiTask, ServiceResponse, TaskCompletionSink},
    taskmgmt::{AsyncEventNotifier, TaskMgmtCompletionSink},
    transport::PortalAddr,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot},
};
use zerocopy::{BigEndian, U16, U32, U64};

fn sample_config(initial_r2t: bool, immediate_data: bool) -> Config {
    serde_yaml::from_str(&format!(
        r#"
transport:
  TimeoutConnection: 2
  TimeoutSend: 5
  TimeoutRecv: 5
  HostInterface: ""
negotiation:
  HeaderDigest: None
  DataDigest: None
  MaxRecvDataSegmentLength: 262144
session_defaults:
  MaxBurstLength: 262144
  FirstBurstLength: 65536
  InitialR2T: "{}"
  ImmediateData: "{}"
  MaxOutstandingR2T: 1
  ErrorRecoveryLevel: 0
  DefaultTime2Wait: 2
  DefaultTime2Retain: 20
  MaxConnections: 1
runtime:
  MaxSessions: 16
  MaxConnectionsPerSession: 2
  BandwidthWindowSamples: 30
  ConnectionTimeout: 15
  TaskTimeout: 30
"#,
        if initial_r2t { "Yes" } else { "No" },
        if immediate_data { "Yes" } else { "No" },
    ))
    .unwrap()
}

/// Like `sample_config`, but with `MaxRecvDataSegmentLength`/
/// `FirstBurstLength` exposed so a test can force multi-segment
/// unsolicited bursts and multi-segment solicited R2T chunks.
fn sample_config_with_limits(
    initial_r2t: bool,
    immediate_data: bool,
    max_recv_data_segment_length: u32,
    first_burst_length: u32,
) -> Config {
    serde_yaml::from_str(&format!(
        r#"
transport:
  TimeoutConnection: 2
  TimeoutSend: 5
  TimeoutRecv: 5
  HostInterface: ""
negotiation:
  HeaderDigest: None
  DataDigest: None
  MaxRecvDataSegmentLength: {max_recv_data_segment_length}
session_defaults:
  MaxBurstLength: 262144
  FirstBurstLength: {first_burst_length}
  InitialR2T: "{}"
  ImmediateData: "{}"
  MaxOutstandingR2T: 1
  ErrorRecoveryLevel: 0
  DefaultTime2Wait: 2
  DefaultTime2Retain: 20
  MaxConnections: 1
runtime:
  MaxSessions: 16
  MaxConnectionsPerSession: 2
  BandwidthWindowSamples: 30
  ConnectionTimeout: 15
  TaskTimeout: 30
"#,
        if initial_r2t { "Yes" } else { "No" },
        if immediate_data { "Yes" } else { "No" },
    ))
    .unwrap()
}

struct NoopHooks;
impl TargetHooks for NoopHooks {
    fn create_target_for_id(&self, _session_id: u16) -> bool {
        true
    }

    fn destroy_target_for_id(&self, _session_id: u16) {}
}

struct NoopTaskMgmtSink;
impl TaskMgmtCompletionSink for NoopTaskMgmtSink {
    fn complete_abort_task(&self, _lun: u64, _rtt: u32, _response: ServiceResponse) {}

    fn complete_abort_task_set(&self, _lun: u64, _response: ServiceResponse) {}

    fn complete_clear_aca(&self, _lun: u64, _response: ServiceResponse) {}

    fn complete_clear_task_set(&self, _lun: u64, _response: ServiceResponse) {}

    fn complete_logical_unit_reset(&self, _lun: u64, _response: ServiceResponse) {}

    fn complete_target_reset(&self, _response: ServiceResponse) {}
}

struct NoopNotifier;
impl AsyncEventNotifier for NoopNotifier {
    fn notify_async_event(&self, _session_id: u16, _event: AsyncEvent, _p1: u16, _p2: u16, _p3: u16) {}
}

/// Completion gate: fires once, handing the `(status, response)` pair off
/// through a one-shot channel so the test can await it with a timeout.
#[derive(Default)]
struct Gate {
    tx: StdMutex<Option<oneshot::Sender<(ScsiStatus, ServiceResponse)>>>,
}

impl Gate {
    fn new() -> (Arc<Self>, oneshot::Receiver<(ScsiStatus, ServiceResponse)>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                tx: StdMutex::new(Some(tx)),
            }),
            rx,
        )
    }
}

impl TaskCompletionSink for Gate {
    fn complete_task(&self, _task: Arc<dyn ScsiTask>, status: ScsiStatus, response: ServiceResponse) {
        if let Some(tx) = self.tx.lock().unwrap().take() {
            let _ = tx.send((status, response));
        }
    }

    fn complete_task_timeout(&self, _task: Arc<dyn ScsiTask>) {
        if let Some(tx) = self.tx.lock().unwrap().take() {
            let _ = tx.send((ScsiStatus::Other(0xff), ServiceResponse::DeliveryFailure));
        }
    }
}

/// Like `Gate`, but fires once per completed task instead of just once —
/// needed to drive a batch of sequential round trips through a single
/// `Engine`.
struct MultiGate {
    tx: mpsc::UnboundedSender<(ScsiStatus, ServiceResponse)>,
}

impl TaskCompletionSink for MultiGate {
    fn complete_task(&self, _task: Arc<dyn ScsiTask>, status: ScsiStatus, response: ServiceResponse) {
        let _ = self.tx.send((status, response));
    }

    fn complete_task_timeout(&self, _task: Arc<dyn ScsiTask>) {
        let _ = self.tx.send((ScsiStatus::Other(0xff), ServiceResponse::DeliveryFailure));
    }
}

/// Records the first Asynchronous Message the engine forwards to the
/// external notifier, handing it off through a one-shot channel.
#[derive(Default)]
struct RecordingNotifier {
    tx: StdMutex<Option<oneshot::Sender<(AsyncEvent, u16, u16, u16)>>>,
}

impl RecordingNotifier {
    fn new() -> (Arc<Self>, oneshot::Receiver<(AsyncEvent, u16, u16, u16)>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                tx: StdMutex::new(Some(tx)),
            }),
            rx,
        )
    }
}

impl AsyncEventNotifier for RecordingNotifier {
    fn notify_async_event(&self, _session_id: u16, event: AsyncEvent, p1: u16, p2: u16, p3: u16) {
        if let Some(tx) = self.tx.lock().unwrap().take() {
            let _ = tx.send((event, p1, p2, p3));
        }
    }
}

/// A `ScsiTask` backed by an in-memory buffer: `write()` fills it (READ
/// direction), `read()` drains it (WRITE direction).
#[derive(Debug)]
struct BufferTask {
    session_id: u16,
    tagged_task_id: u16,
    direction: DataDirection,
    transfer_len: u32,
    cdb: Vec<u8>,
    buffer: StdMutex<Vec<u8>>,
    itt: AtomicU32,
    realized: AtomicU32,
}

impl BufferTask {
    fn for_read(session_id: u16, tagged_task_id: u16, transfer_len: u32, cdb: Vec<u8>) -> Self {
        Self {
            session_id,
            tagged_task_id,
            direction: DataDirection::Read,
            transfer_len,
            cdb,
            buffer: StdMutex::new(vec![0u8; transfer_len as usize]),
            itt: AtomicU32::new(0),
            realized: AtomicU32::new(0),
        }
    }

    fn for_write(session_id: u16, tagged_task_id: u16, cdb: Vec<u8>, data: Vec<u8>) -> Self {
        Self {
            session_id,
            tagged_task_id,
            direction: DataDirection::Write,
            transfer_len: data.len() as u32,
            cdb,
            buffer: StdMutex::new(data),
            itt: AtomicU32::new(0),
            realized: AtomicU32::new(0),
        }
    }
}

impl ScsiTask for BufferTask {
    fn session_id(&self) -> u16 {
        self.session_id
    }

    fn lun(&self) -> u64 {
        0
    }

    fn tagged_task_id(&self) -> u16 {
        self.tagged_task_id
    }

    fn direction(&self) -> DataDirection {
        self.direction
    }

    fn requested_data_transfer_count(&self) -> u32 {
        self.transfer_len
    }

    fn cdb(&self) -> &[u8] {
        &self.cdb
    }

    fn task_attribute(&self) -> TaskAttribute {
        TaskAttribute::Simple
    }

    fn read(&self, offset: u32, len: u32) -> anyhow::Result<Bytes> {
        let buf = self.buffer.lock().unwrap();
        let start = offset as usize;
        Ok(Bytes::copy_from_slice(&buf[start..start + len as usize]))
    }

    fn write(&self, offset: u32, data: &[u8]) -> anyhow::Result<()> {
        let mut buf = self.buffer.lock().unwrap();
        let start = offset as usize;
        buf[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn initiator_task_tag(&self) -> u32 {
        self.itt.load(Ordering::SeqCst)
    }

    fn set_initiator_task_tag(&self, tag: u32) {
        self.itt.store(tag, Ordering::SeqCst);
    }

    fn set_realized_data_transfer_count(&self, len: u32) {
        self.realized.store(len, Ordering::SeqCst);
    }

    fn increment_realized_data_transfer_count(&self, len: u32) {
        self.realized.fetch_add(len, Ordering::SeqCst);
    }

    fn realized_data_transfer_count(&self) -> u32 {
        self.realized.load(Ordering::SeqCst)
    }
}

/// Reads one full PDU (header + AHS/data/digest payload) off the wire,
/// mirroring `RecvLoop::recv_one`'s two-phase read. Digests are always off
/// in these tests, so the payload is exactly AHS+pad+data+pad.
async fn read_frame(stream: &mut TcpStream) -> ([u8; HEADER_LEN], Vec<u8>, usize) {
    let mut header_buf = [0u8; HEADER_LEN];
    stream.read_exact(&mut header_buf).await.unwrap();

    let mut probe = header_buf;
    let (ahs_len, data_len) = {
        let pdu = Pdu::from_bhs_bytes(&mut probe).unwrap();
        (pdu.get_ahs_length_bytes(), pdu.get_data_length_bytes())
    };
    let ahs_pad = (4 - (ahs_len % 4)) % 4;
    let data_pad = (4 - (data_len % 4)) % 4;

    let mut payload = vec![0u8; ahs_len + ahs_pad + data_len + data_pad];
    stream.read_exact(&mut payload).await.unwrap();
    (header_buf, payload, data_len)
}

async fn send_pdu<T>(stream: &mut TcpStream, cfg: &Config, header_buf: [u8; HEADER_LEN], data: &[u8])
where
    T: BasicHeaderSegment
        + iscsi_initiator_core::models::common::SendingData
        + iscsi_initiator_core::client::pdu_connection::FromBytes
        + iscsi_initiator_core::models::data_fromat::ZeroCopyType,
{
    let mut pdu = PduRequest::<T>::new_request(header_buf, cfg);
    pdu.append_data(data);
    let (header, body) = pdu
        .build(
            cfg.negotiation.max_recv_data_segment_length as usize,
            false,
            false,
        )
        .unwrap();
    stream.write_all(&header).await.unwrap();
    stream.write_all(&body).await.unwrap();
}

fn scsi_command_response(itt: u32, stat_sn: u32) -> ScsiCommandResponse {
    let mut opcode = RawBhsOpcode::default();
    opcode.set_opcode_known(Opcode::ScsiCommandResp);
    ScsiCommandResponse {
        opcode,
        flags: RawScsiCmdRespFlags::new_raw(RawScsiCmdRespFlags::FINAL),
        response: RawResponseCode::from(ResponseCode::CommandCompleted),
        status: RawScsiStatus::from(ScsiStatus::Good),
        initiator_task_tag: itt,
        stat_sn: U32::<BigEndian>::new(stat_sn),
        exp_cmd_sn: U32::<BigEndian>::new(1),
        max_cmd_sn: U32::<BigEndian>::new(16),
        ..Default::default()
    }
}

/// Target side of the READ(10) scenario: answers the one Command PDU it
/// receives with a single final Data-In carrying the whole payload.
async fn serve_read(mut stream: TcpStream, cfg: Config, data: Vec<u8>) {
    let (header_buf, _payload, _data_len) = read_frame(&mut stream).await;
    let mut req_hdr = header_buf;
    let itt = {
        let req = iscsi_initiator_core::models::command::request::ScsiCommandRequest::from_bhs_bytes(
            &mut req_hdr,
        )
        .unwrap();
        req.initiator_task_tag
    };

    let mut flags = iscsi_initiator_core::models::data::common::RawDataInFlags::default();
    flags.set_fin(true);
    flags.set_s(true);

    let resp = ScsiDataIn {
        opcode: {
            let mut o = RawBhsOpcode::default();
            o.set_opcode_known(Opcode::ScsiDataIn);
            o
        },
        flags,
        status_or_rsvd: RawScsiStatus::from(ScsiStatus::Good),
        lun: U64::<BigEndian>::new(0),
        initiator_task_tag: itt,
        target_transfer_tag: U32::<BigEndian>::new(0xffff_ffff),
        stat_sn_or_rsvd: U32::<BigEndian>::new(1),
        exp_cmd_sn: U32::<BigEndian>::new(1),
        max_cmd_sn: U32::<BigEndian>::new(16),
        data_sn: U32::<BigEndian>::new(0),
        buffer_offset: U32::<BigEndian>::new(0),
        residual_count: U32::<BigEndian>::new(0),
        ..Default::default()
    };
    let mut header_buf = [0u8; HEADER_LEN];
    resp.to_bhs_bytes(&mut header_buf).unwrap();
    send_pdu::<ScsiDataIn>(&mut stream, &cfg, header_buf, &data).await;
}

/// Target side of the WRITE(6) scenario: the command arrives with no
/// payload (command-alone, per InitialR2T=Yes/ImmediateData=No), the
/// target R2Ts for the whole transfer, reads back the solicited Data-Out,
/// and answers with a SCSI Response.
async fn serve_write(mut stream: TcpStream, cfg: Config, expected: Vec<u8>) {
    let (header_buf, _payload, _data_len) = read_frame(&mut stream).await;
    let mut req_hdr = header_buf;
    let (itt, transfer_len) = {
        let req = iscsi_initiator_core::models::command::request::ScsiCommandRequest::from_bhs_bytes(
            &mut req_hdr,
        )
        .unwrap();
        (req.initiator_task_tag, req.expected_data_transfer_length.get())
    };
    assert_eq!(transfer_len as usize, expected.len());

    let r2t = ReadyToTransfer {
        opcode: {
            let mut o = RawBhsOpcode::default();
            o.set_opcode_known(Opcode::ReadyToTransfer);
            o
        },
        lun: U64::<BigEndian>::new(0),
        initiator_task_tag: itt,
        target_transfer_tag: U32::<BigEndian>::new(7),
        stat_sn: U32::<BigEndian>::new(1),
        exp_cmd_sn: U32::<BigEndian>::new(1),
        max_cmd_sn: U32::<BigEndian>::new(16),
        r2t_sn: U32::<BigEndian>::new(0),
        buffer_offset: U32::<BigEndian>::new(0),
        desired_data_transfer_length: U32::<BigEndian>::new(transfer_len),
        ..Default::default()
    };
    let mut header_buf = [0u8; HEADER_LEN];
    r2t.to_bhs_bytes(&mut header_buf).unwrap();
    send_pdu::<ReadyToTransfer>(&mut stream, &cfg, header_buf, &[]).await;

    let (header_buf, payload, data_len) = read_frame(&mut stream).await;
    let mut out_hdr = header_buf;
    {
        let out = ScsiDataOut::from_bhs_bytes(&mut out_hdr).unwrap();
        assert_eq!(out.initiator_task_tag, itt);
        assert_eq!(out.target_transfer_tag.get(), 7);
    }
    assert_eq!(&payload[..data_len], expected.as_slice());

    let resp = scsi_command_response(itt, 2);
    let mut header_buf = [0u8; HEADER_LEN];
    resp.to_bhs_bytes(&mut header_buf).unwrap();
    send_pdu::<ScsiCommandResponse>(&mut stream, &cfg, header_buf, &[]).await;
}

/// Target side of the unsolicited-burst WRITE scenario
/// (InitialR2T=No/ImmediateData=Yes, segment length smaller than both the
/// first burst and the remainder): reads the Command's immediate data
/// chunk, then the unsolicited Data-Out segments that make up the rest of
/// the first burst, R2Ts for whatever's left, reads the solicited Data-Out
/// segments, and reassembles everything to check against `expected`.
async fn serve_write_burst(mut stream: TcpStream, cfg: Config, expected: Vec<u8>, first_burst_length: u32) {
    let mut received = vec![0u8; expected.len()];

    let (header_buf, immediate, _data_len) = read_frame(&mut stream).await;
    let mut req_hdr = header_buf;
    let (itt, transfer_len) = {
        let req = iscsi_initiator_core::models::command::request::ScsiCommandRequest::from_bhs_bytes(
            &mut req_hdr,
        )
        .unwrap();
        (req.initiator_task_tag, req.expected_data_transfer_length.get())
    };
    assert_eq!(transfer_len as usize, expected.len());
    received[..immediate.len()].copy_from_slice(&immediate);
    let mut filled = immediate.len() as u32;

    // Unsolicited Data-Out segments: everything up to the first burst
    // limit that didn't ride along as immediate data.
    while filled < first_burst_length.min(transfer_len) {
        let (header_buf, payload, data_len) = read_frame(&mut stream).await;
        let mut out_hdr = header_buf;
        let (out_offset, is_final) = {
            let out = ScsiDataOut::from_bhs_bytes(&mut out_hdr).unwrap();
            assert_eq!(out.initiator_task_tag, itt);
            assert_eq!(out.target_transfer_tag.get(), ScsiDataOutBuilder::DEFAULT_TTT);
            (out.buffer_offset.get(), out.flags.fin())
        };
        received[out_offset as usize..out_offset as usize + data_len].copy_from_slice(&payload[..data_len]);
        filled = out_offset + data_len as u32;
        if is_final && filled >= first_burst_length.min(transfer_len) {
            break;
        }
    }

    let remaining = transfer_len - filled;
    if remaining > 0 {
        let r2t = ReadyToTransfer {
            opcode: {
                let mut o = RawBhsOpcode::default();
                o.set_opcode_known(Opcode::ReadyToTransfer);
                o
            },
            lun: U64::<BigEndian>::new(0),
            initiator_task_tag: itt,
            target_transfer_tag: U32::<BigEndian>::new(9),
            stat_sn: U32::<BigEndian>::new(1),
            exp_cmd_sn: U32::<BigEndian>::new(1),
            max_cmd_sn: U32::<BigEndian>::new(16),
            r2t_sn: U32::<BigEndian>::new(0),
            buffer_offset: U32::<BigEndian>::new(filled),
            desired_data_transfer_length: U32::<BigEndian>::new(remaining),
            ..Default::default()
        };
        let mut header_buf = [0u8; HEADER_LEN];
        r2t.to_bhs_bytes(&mut header_buf).unwrap();
        send_pdu::<ReadyToTransfer>(&mut stream, &cfg, header_buf, &[]).await;

        while filled < transfer_len {
            let (header_buf, payload, data_len) = read_frame(&mut stream).await;
            let mut out_hdr = header_buf;
            let out_offset = {
                let out = ScsiDataOut::from_bhs_bytes(&mut out_hdr).unwrap();
                assert_eq!(out.initiator_task_tag, itt);
                assert_eq!(out.target_transfer_tag.get(), 9);
                out.buffer_offset.get()
            };
            received[out_offset as usize..out_offset as usize + data_len]
                .copy_from_slice(&payload[..data_len]);
            filled = out_offset + data_len as u32;
        }
    }

    assert_eq!(received, expected);

    let resp = scsi_command_response(itt, 2);
    let mut header_buf = [0u8; HEADER_LEN];
    resp.to_bhs_bytes(&mut header_buf).unwrap();
    send_pdu::<ScsiCommandResponse>(&mut stream, &cfg, header_buf, &[]).await;
}

/// Answers `rounds` READ(10) commands back to back with a single final
/// Data-In each (same shape as `serve_read`), then waits for the NOP-Out
/// latency probe the 30th completion is expected to fire and answers it,
/// completing the probe on the initiator side.
async fn serve_reads_then_nop(mut stream: TcpStream, cfg: Config, chunk: Vec<u8>, rounds: u32) {
    for _ in 0..rounds {
        let (header_buf, _payload, _data_len) = read_frame(&mut stream).await;
        let mut req_hdr = header_buf;
        let itt = {
            let req =
                iscsi_initiator_core::models::command::request::ScsiCommandRequest::from_bhs_bytes(
                    &mut req_hdr,
                )
                .unwrap();
            req.initiator_task_tag
        };

        let mut flags = iscsi_initiator_core::models::data::common::RawDataInFlags::default();
        flags.set_fin(true);
        flags.set_s(true);

        let resp = ScsiDataIn {
            opcode: {
                let mut o = RawBhsOpcode::default();
                o.set_opcode_known(Opcode::ScsiDataIn);
                o
            },
            flags,
            status_or_rsvd: RawScsiStatus::from(ScsiStatus::Good),
            lun: U64::<BigEndian>::new(0),
            initiator_task_tag: itt,
            target_transfer_tag: U32::<BigEndian>::new(0xffff_ffff),
            stat_sn_or_rsvd: U32::<BigEndian>::new(1),
            exp_cmd_sn: U32::<BigEndian>::new(1),
            max_cmd_sn: U32::<BigEndian>::new(16),
            data_sn: U32::<BigEndian>::new(0),
            buffer_offset: U32::<BigEndian>::new(0),
            residual_count: U32::<BigEndian>::new(0),
            ..Default::default()
        };
        let mut header_buf = [0u8; HEADER_LEN];
        resp.to_bhs_bytes(&mut header_buf).unwrap();
        send_pdu::<ScsiDataIn>(&mut stream, &cfg, header_buf, &chunk).await;
    }

    let (header_buf, _payload, _data_len) = read_frame(&mut stream).await;
    let mut nop_hdr = header_buf;
    let itt = {
        let nop = NopOutRequest::from_bhs_bytes(&mut nop_hdr).unwrap();
        assert_eq!(nop.target_task_tag.get(), NopOutRequest::DEFAULT_TAG);
        nop.initiator_task_tag
    };

    let nop_resp = NopInResponse {
        opcode: {
            let mut o = RawBhsOpcode::default();
            o.set_opcode_known(Opcode::NopIn);
            o
        },
        lun: U64::<BigEndian>::new(0),
        initiator_task_tag: itt,
        target_task_tag: U32::<BigEndian>::new(NopOutRequest::DEFAULT_TAG),
        stat_sn: U32::<BigEndian>::new(rounds + 1),
        exp_cmd_sn: U32::<BigEndian>::new(1),
        max_cmd_sn: U32::<BigEndian>::new(16),
        ..Default::default()
    };
    let mut header_buf = [0u8; HEADER_LEN];
    nop_resp.to_bhs_bytes(&mut header_buf).unwrap();
    send_pdu::<NopInResponse>(&mut stream, &cfg, header_buf, &[]).await;
}

/// Reads the one Command frame the test dispatches, then sends an
/// Asynchronous Message telling the initiator to drop connection `cid` —
/// the target side of the §4.9 `DropConnection` scenario.
async fn serve_drop_connection(mut stream: TcpStream, cfg: Config, cid: u16) {
    let _ = read_frame(&mut stream).await;

    let mut async_event = RawAsyncEvent::default();
    async_event.set_event(AsyncEvent::DropConnection);

    let msg = AsyncMessage {
        opcode: {
            let mut o = RawBhsOpcode::default();
            o.set_opcode_known(Opcode::AsyncMessage);
            o
        },
        initiator_task_tag: 0xffff_ffff,
        stat_sn: U32::<BigEndian>::new(1),
        exp_cmd_sn: U32::<BigEndian>::new(1),
        max_cmd_sn: U32::<BigEndian>::new(16),
        async_event,
        parameter1: U16::<BigEndian>::new(cid),
        ..Default::default()
    };
    let mut header_buf = [0u8; HEADER_LEN];
    msg.to_bhs_bytes(&mut header_buf).unwrap();
    send_pdu::<AsyncMessage>(&mut stream, &cfg, header_buf, &[]).await;
}

async fn loopback_engine(
    cfg: Config,
) -> (
    Engine,
    oneshot::Receiver<(ScsiStatus, ServiceResponse)>,
    TcpListener,
    std::net::SocketAddr,
) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (gate, rx) = Gate::new();
    let engine = Engine::new(
        cfg,
        Arc::new(NoopHooks),
        gate as Arc<dyn TaskCompletionSink>,
        Arc::new(NoopTaskMgmtSink),
        Arc::new(NoopNotifier),
    );
    (engine, rx, listener, addr)
}

#[tokio::test]
async fn read10_round_trip_fills_the_task_buffer() {
    let cfg = sample_config(true, true);
    let (engine, rx, listener, addr) = loopback_engine(cfg.clone()).await;

    let want = (0..4096u32).map(|b| (b % 256) as u8).collect::<Vec<u8>>();
    let server = {
        let cfg = cfg.clone();
        let want = want.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            serve_read(stream, cfg, want).await;
        })
    };

    let portal = PortalAddr::new(addr.ip(), addr.port());
    let (sid, cid) = engine.create_session("iqn.test:read", portal).await.unwrap();
    engine.activate_connection(sid, cid).await.unwrap();

    let mut cdb = vec![0x28, 0, 0, 0, 0, 0, 0, 0, 8, 0];
    cdb.resize(16, 0);
    let task: Arc<dyn ScsiTask> = Arc::new(BufferTask::for_read(sid, 1, 4096, cdb));

    let outcome = engine.process_task(task.clone()).await;
    assert_eq!(outcome, DispatchOutcome::RequestInProcess);

    let (status, response) =
        tokio::time::timeout(std::time::Duration::from_secs(5), rx).await.unwrap().unwrap();
    assert_eq!(status, ScsiStatus::Good);
    assert_eq!(response, ServiceResponse::TaskComplete);
    assert_eq!(task.realized_data_transfer_count(), 4096);

    server.await.unwrap();
}

#[tokio::test]
async fn write6_round_trip_via_r2t_sends_the_buffered_data() {
    let cfg = sample_config(true, false);
    let (engine, rx, listener, addr) = loopback_engine(cfg.clone()).await;

    let payload = (0..8192u32).map(|b| ((b * 7) % 256) as u8).collect::<Vec<u8>>();
    let server = {
        let cfg = cfg.clone();
        let payload = payload.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            serve_write(stream, cfg, payload).await;
        })
    };

    let portal = PortalAddr::new(addr.ip(), addr.port());
    let (sid, cid) = engine.create_session("iqn.test:write", portal).await.unwrap();
    engine.activate_connection(sid, cid).await.unwrap();

    let cdb = vec![0x0a, 0, 0, 0, 16, 0];
    let task: Arc<dyn ScsiTask> = Arc::new(BufferTask::for_write(sid, 1, cdb, payload));

    let outcome = engine.process_task(task.clone()).await;
    assert_eq!(outcome, DispatchOutcome::RequestInProcess);

    let (status, response) =
        tokio::time::timeout(std::time::Duration::from_secs(5), rx).await.unwrap().unwrap();
    assert_eq!(status, ScsiStatus::Good);
    assert_eq!(response, ServiceResponse::TaskComplete);

    server.await.unwrap();
}

/// WRITE with InitialR2T=No/ImmediateData=Yes and a segment length smaller
/// than both the first burst and the remainder: the command carries
/// immediate data, `begin_task` follows it with an unsolicited burst split
/// across several Data-Out segments, and the target then R2Ts for the rest
/// of the transfer, which arrives as further segmented Data-Out PDUs.
#[tokio::test]
async fn write_unsolicited_burst_then_r2t_remainder_sends_every_chunk() {
    const SEGMENT: u32 = 4096;
    const FIRST_BURST: u32 = 3 * SEGMENT;
    const TRANSFER_LEN: u32 = 20_000;

    let cfg = sample_config_with_limits(false, true, SEGMENT, FIRST_BURST);
    let (engine, rx, listener, addr) = loopback_engine(cfg.clone()).await;

    let payload = (0..TRANSFER_LEN).map(|b| ((b * 31) % 256) as u8).collect::<Vec<u8>>();
    let server = {
        let cfg = cfg.clone();
        let payload = payload.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            serve_write_burst(stream, cfg, payload, FIRST_BURST).await;
        })
    };

    let portal = PortalAddr::new(addr.ip(), addr.port());
    let (sid, cid) = engine.create_session("iqn.test:write-burst", portal).await.unwrap();
    engine.activate_connection(sid, cid).await.unwrap();

    let cdb = vec![0x2a, 0, 0, 0, 0, 0, 0, 0, 0, 0];
    let task: Arc<dyn ScsiTask> = Arc::new(BufferTask::for_write(sid, 1, cdb, payload));

    let outcome = engine.process_task(task.clone()).await;
    assert_eq!(outcome, DispatchOutcome::RequestInProcess);

    let (status, response) =
        tokio::time::timeout(std::time::Duration::from_secs(5), rx).await.unwrap().unwrap();
    assert_eq!(status, ScsiStatus::Good);
    assert_eq!(response, ServiceResponse::TaskComplete);
    assert_eq!(task.realized_data_transfer_count(), TRANSFER_LEN);

    server.await.unwrap();
}

/// After the 30th completed task on a connection, the rolling bandwidth
/// window rolls over and `fire_latency_probe` enqueues a NOP-Out latency
/// probe; the target's reply completes it without disturbing the next
/// task's dispatch.
#[tokio::test]
async fn nop_latency_probe_fires_after_thirty_completed_tasks() {
    const ROUNDS: u32 = 30;

    let cfg = sample_config(true, true);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let engine = Engine::new(
        cfg.clone(),
        Arc::new(NoopHooks),
        Arc::new(MultiGate { tx }) as Arc<dyn TaskCompletionSink>,
        Arc::new(NoopTaskMgmtSink),
        Arc::new(NoopNotifier),
    );

    let chunk = vec![0xabu8; 64];
    let server = {
        let cfg = cfg.clone();
        let chunk = chunk.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            serve_reads_then_nop(stream, cfg, chunk, ROUNDS).await;
        })
    };

    let portal = PortalAddr::new(addr.ip(), addr.port());
    let (sid, cid) = engine.create_session("iqn.test:nop", portal).await.unwrap();
    engine.activate_connection(sid, cid).await.unwrap();

    let mut cdb = vec![0x28, 0, 0, 0, 0, 0, 0, 0, 8, 0];
    cdb.resize(16, 0);

    for i in 0..ROUNDS as u16 {
        let task: Arc<dyn ScsiTask> = Arc::new(BufferTask::for_read(sid, i + 1, 64, cdb.clone()));
        let outcome = engine.process_task(task.clone()).await;
        assert_eq!(outcome, DispatchOutcome::RequestInProcess);

        let (status, response) =
            tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(status, ScsiStatus::Good);
        assert_eq!(response, ServiceResponse::TaskComplete);
    }

    tokio::time::timeout(std::time::Duration::from_secs(5), server).await.unwrap().unwrap();
}

/// A peer that closes the socket mid-task (no SCSI Response ever arrives)
/// drives `recv_one` to an I/O error, which `RecvLoop::run` hands to
/// `handle_connection_timeout`; with only one live connection the whole
/// session is released and the in-flight task is failed.
#[tokio::test]
async fn broken_connection_mid_task_fails_the_inflight_task() {
    let cfg = sample_config(true, true);
    let (engine, rx, listener, addr) = loopback_engine(cfg.clone()).await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_frame(&mut stream).await;
        drop(stream);
    });

    let portal = PortalAddr::new(addr.ip(), addr.port());
    let (sid, cid) = engine.create_session("iqn.test:broken", portal).await.unwrap();
    engine.activate_connection(sid, cid).await.unwrap();

    let mut cdb = vec![0x28, 0, 0, 0, 0, 0, 0, 0, 8, 0];
    cdb.resize(16, 0);
    let task: Arc<dyn ScsiTask> = Arc::new(BufferTask::for_read(sid, 1, 4096, cdb));

    let outcome = engine.process_task(task.clone()).await;
    assert_eq!(outcome, DispatchOutcome::RequestInProcess);

    let (status, response) =
        tokio::time::timeout(std::time::Duration::from_secs(5), rx).await.unwrap().unwrap();
    assert_eq!(status, ScsiStatus::Good);
    assert_eq!(response, ServiceResponse::DeliveryFailure);

    server.await.unwrap();
}

/// An Asynchronous Message carrying `DropConnection` releases the named
/// connection (§4.9), failing whatever task was in flight on it and
/// forwarding the event to the external `AsyncEventNotifier`.
#[tokio::test]
async fn async_drop_connection_fails_the_inflight_task_and_notifies() {
    let cfg = sample_config(true, true);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (gate, rx) = Gate::new();
    let (notifier, notify_rx) = RecordingNotifier::new();
    let engine = Engine::new(
        cfg.clone(),
        Arc::new(NoopHooks),
        gate as Arc<dyn TaskCompletionSink>,
        Arc::new(NoopTaskMgmtSink),
        notifier,
    );

    let portal_listener_addr = addr;
    let server = {
        let cfg = cfg.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            serve_drop_connection(stream, cfg, 0).await;
        })
    };

    let portal = PortalAddr::new(portal_listener_addr.ip(), portal_listener_addr.port());
    let (sid, cid) = engine.create_session("iqn.test:drop", portal).await.unwrap();
    engine.activate_connection(sid, cid).await.unwrap();

    let mut cdb = vec![0x28, 0, 0, 0, 0, 0, 0, 0, 8, 0];
    cdb.resize(16, 0);
    let task: Arc<dyn ScsiTask> = Arc::new(BufferTask::for_read(sid, 1, 4096, cdb));

    let outcome = engine.process_task(task.clone()).await;
    assert_eq!(outcome, DispatchOutcome::RequestInProcess);

    let (status, response) =
        tokio::time::timeout(std::time::Duration::from_secs(5), rx).await.unwrap().unwrap();
    assert_eq!(status, ScsiStatus::Good);
    assert_eq!(response, ServiceResponse::DeliveryFailure);

    let (event, p1, _p2, _p3) =
        tokio::time::timeout(std::time::Duration::from_secs(5), notify_rx).await.unwrap().unwrap();
    assert_eq!(event, AsyncEvent::DropConnection);
    assert_eq!(p1, cid);

    server.await.unwrap();
}
