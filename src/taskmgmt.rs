//! Task-management function dispatch and async-event notification (§4.7,
//! §4.9).
//!
//! Grounded in `dispatcher.rs`'s `TaskRegistry`: a Task Management Function
//! Request has no `Arc<dyn ScsiTask>` of its own (it's a control-plane
//! operation, not a SCSI I/O task), so it gets its own small tag registry
//! here rather than reusing the SCSI one. `task.rs`'s `TaskCompletionSink`
//! doc comment is the reference for why this lives in a separate trait.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{
    Arc,
    atomic::{AtomicU16, Ordering},
};

use anyhow::Result;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{
    models::{async_msg::common::AsyncEvent, task_mgmt::common::TaskMgmtFunction},
    send_path,
    session::{Connection, SessionStore},
    task::{ServiceResponse, TaskType, encode_task_tag},
};

/// Completion callback surface for task-management functions (as opposed to
/// ordinary SCSI tasks, which use `task::TaskCompletionSink`). Implemented by
/// the SCSI mid-layer.
pub trait TaskMgmtCompletionSink: Send + Sync {
    fn complete_abort_task(&self, lun: u64, referenced_task_tag: u32, response: ServiceResponse);
    fn complete_abort_task_set(&self, lun: u64, response: ServiceResponse);
    fn complete_clear_aca(&self, lun: u64, response: ServiceResponse);
    fn complete_clear_task_set(&self, lun: u64, response: ServiceResponse);
    fn complete_logical_unit_reset(&self, lun: u64, response: ServiceResponse);
    fn complete_target_reset(&self, response: ServiceResponse);
}

/// External daemon notification hook for Asynchronous Message events that
/// aren't handled purely at the transport layer (§4.9): logout requests,
/// renegotiation requests, and vendor/SCSI-sense events the transport layer
/// can't act on by itself.
pub trait AsyncEventNotifier: Send + Sync {
    fn notify_async_event(
        &self,
        session_id: u16,
        event: AsyncEvent,
        parameter1: u16,
        parameter2: u16,
        parameter3: u16,
    );
}

/// What a still-outstanding Task Management Function Request was asking for,
/// keyed by its initiator task tag.
#[derive(Debug, Clone, Copy)]
struct PendingTaskMgmt {
    function: TaskMgmtFunction,
    lun: u64,
    referenced_task_tag: u32,
}

/// Tracks in-flight Task Management Function Requests until their Response
/// arrives, and hands out the task ids packed into their initiator task tags.
#[derive(Debug, Default)]
pub struct TaskMgmtRegistry {
    pending: DashMap<u32, PendingTaskMgmt>,
    next_id: AtomicU16,
}

impl TaskMgmtRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_tagged_id(&self) -> u16 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// `BeginTaskMgmt`: builds and sends a Task Management Function Request,
    /// remembering what it was asking for so the matching Response can be
    /// routed to the right `TaskMgmtCompletionSink` method.
    #[allow(clippy::too_many_arguments)]
    pub async fn begin_task_mgmt(
        &self,
        store: &SessionStore,
        conn: &Connection,
        function: TaskMgmtFunction,
        lun: u64,
        referenced_task_tag: u32,
        cmd_sn: u32,
        cancel: &CancellationToken,
    ) -> Result<u32> {
        let itt = encode_task_tag(TaskType::TaskMgmt, lun as u8, self.next_tagged_id());
        self.pending.insert(itt, PendingTaskMgmt {
            function,
            lun,
            referenced_task_tag,
        });

        if let Err(e) = send_path::send_task_mgmt_request(
            store,
            conn,
            function,
            lun,
            itt,
            referenced_task_tag,
            cmd_sn,
            cancel,
        )
        .await
        {
            self.pending.remove(&itt);
            return Err(e);
        }
        Ok(itt)
    }

    /// Routes a Task Management Response (§4.7) to the matching
    /// `TaskMgmtCompletionSink` callback, forgetting the pending entry.
    pub fn dispatch_response(
        &self,
        sink: &dyn TaskMgmtCompletionSink,
        itt: u32,
        response: ServiceResponse,
    ) {
        let Some((_, pending)) = self.pending.remove(&itt) else {
            warn!(itt, "task-mgmt response: no pending request for this tag");
            return;
        };

        match pending.function {
            TaskMgmtFunction::AbortTask => {
                sink.complete_abort_task(pending.lun, pending.referenced_task_tag, response);
            },
            TaskMgmtFunction::AbortTaskSet => sink.complete_abort_task_set(pending.lun, response),
            TaskMgmtFunction::ClearAca => sink.complete_clear_aca(pending.lun, response),
            TaskMgmtFunction::ClearTaskSet => sink.complete_clear_task_set(pending.lun, response),
            TaskMgmtFunction::LogicalUnitReset => {
                sink.complete_logical_unit_reset(pending.lun, response);
            },
            TaskMgmtFunction::TargetWarmReset | TaskMgmtFunction::TargetColdReset => {
                sink.complete_target_reset(response);
            },
            TaskMgmtFunction::TaskReassign | TaskMgmtFunction::Reserved(_) => {
                warn!(
                    function = ?pending.function,
                    "task-mgmt response for an unsupported function; dropping"
                );
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::atomic::{AtomicBool, AtomicU64, AtomicUsize},
        time::Instant,
    };

    use tokio::{net::TcpListener, sync::Mutex as TokioMutex};

    use super::*;
    use crate::{
        cfg::config::Config,
        seqnum::ConnectionSequenceNumbers,
        session::{ConnectionParams, TargetHooks, BANDWIDTH_WINDOW_SAMPLES},
        transport::PortalAddr,
    };

    struct NoopHooks;
    impl TargetHooks for NoopHooks {
        fn create_target_for_id(&self, _session_id: u16) -> bool {
            true
        }

        fn destroy_target_for_id(&self, _session_id: u16) {}
    }

    #[derive(Default)]
    struct RecordingSink {
        aborted: std::sync::Mutex<Vec<(u64, u32, ServiceResponse)>>,
    }

    impl TaskMgmtCompletionSink for RecordingSink {
        fn complete_abort_task(&self, lun: u64, rtt: u32, response: ServiceResponse) {
            self.aborted.lock().unwrap().push((lun, rtt, response));
        }

        fn complete_abort_task_set(&self, _lun: u64, _response: ServiceResponse) {}

        fn complete_clear_aca(&self, _lun: u64, _response: ServiceResponse) {}

        fn complete_clear_task_set(&self, _lun: u64, _response: ServiceResponse) {}

        fn complete_logical_unit_reset(&self, _lun: u64, _response: ServiceResponse) {}

        fn complete_target_reset(&self, _response: ServiceResponse) {}
    }

    fn params() -> ConnectionParams {
        ConnectionParams {
            header_digest: crate::cfg::enums::Digest::None,
            data_digest: crate::cfg::enums::Digest::None,
            max_send_data_segment_length: 8192,
            max_recv_data_segment_length: 8192,
            use_if_marker: false,
            use_of_marker: false,
            if_mark_int: 0,
            of_mark_int: 0,
            initial_exp_stat_sn: 0,
        }
    }

    async fn loopback_connection() -> Arc<Connection> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let _server = accept.await.unwrap();
        let (reader, writer) = client.into_split();
        let portal = PortalAddr::new(addr.ip(), addr.port());
        let transport = crate::transport::Transport::from_split(reader, writer, portal);

        Arc::new(Connection {
            session_id: 0,
            cid: 0,
            portal,
            transport,
            seq: ConnectionSequenceNumbers::new(0),
            params: params(),
            immediate_data_length: 4096,
            cancel: CancellationToken::new(),
            task_queue: TokioMutex::new(VecDeque::new()),
            inflight: AtomicBool::new(false),
            ready: tokio::sync::Notify::new(),
            sources_enabled: AtomicBool::new(true),
            data_to_transfer: AtomicU64::new(0),
            bytes_per_second: AtomicU64::new(0),
            bytes_per_second_history: TokioMutex::new([0; BANDWIDTH_WINDOW_SAMPLES]),
            history_idx: AtomicUsize::new(0),
            task_start: TokioMutex::new(None::<Instant>),
            latency_ms: AtomicU64::new(0),
        })
    }

    fn sample_config() -> Config {
        serde_yaml::from_str(
            r#"
transport:
  TimeoutConnection: 1
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
  InitialR2T: "Yes"
  ImmediateData: "Yes"
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
        )
        .unwrap()
    }

    #[tokio::test]
    async fn abort_task_round_trips_through_the_registry() {
        let store = SessionStore::new(sample_config(), Arc::new(NoopHooks));
        let conn = loopback_connection().await;
        let registry = TaskMgmtRegistry::new();
        let cancel = CancellationToken::new();

        let itt = registry
            .begin_task_mgmt(&store, &conn, TaskMgmtFunction::AbortTask, 7, 0x1234, 0, &cancel)
            .await
            .unwrap();

        let sink = RecordingSink::default();
        registry.dispatch_response(&sink, itt, ServiceResponse::TaskComplete);

        let recorded = sink.aborted.lock().unwrap();
        assert_eq!(recorded.as_slice(), &[(7, 0x1234, ServiceResponse::TaskComplete)]);
    }

    #[tokio::test]
    async fn unknown_tag_is_ignored_not_panicked() {
        let sink = RecordingSink::default();
        let registry = TaskMgmtRegistry::new();
        registry.dispatch_response(&sink, 0xDEAD_BEEF, ServiceResponse::TaskComplete);
        assert!(sink.aborted.lock().unwrap().is_empty());
    }
}
