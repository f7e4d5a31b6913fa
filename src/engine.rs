//! Top-level engine: the public `Engine` API surface (§6) wiring together
//! `SessionStore`, `TaskRegistry`, `TaskMgmtRegistry`, and one `RecvLoop`
//! task per connection.
//!
//! Grounded in `client/client.rs`'s `Client` struct (the teacher's single
//! entry point that owns a connection and spawns its background tasks);
//! this generalizes that shape to the fixed-slot multi-session/
//! multi-connection store instead of one connection per `Client`.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    cfg::config::Config,
    dispatcher::{self, TaskRegistry},
    error::{CoreError, CoreResult},
    models::task_mgmt::common::TaskMgmtFunction,
    recv_loop::RecvLoop,
    send_path,
    session::{SessionStore, TargetHooks},
    task::{DispatchOutcome, ScsiTask, TaskCompletionSink},
    taskmgmt::{AsyncEventNotifier, TaskMgmtCompletionSink, TaskMgmtRegistry},
    transport::PortalAddr,
};

/// Owns every piece of shared state the specification calls "the core": the
/// session/connection store, the two task registries, and the collaborator
/// hooks the SCSI mid-layer implements. One `RecvLoop` task runs per
/// connection for as long as that connection's slot is occupied.
pub struct Engine {
    store: Arc<SessionStore>,
    registry: Arc<TaskRegistry>,
    task_mgmt: Arc<TaskMgmtRegistry>,
    sink: Arc<dyn TaskCompletionSink>,
    task_mgmt_sink: Arc<dyn TaskMgmtCompletionSink>,
    notifier: Arc<dyn AsyncEventNotifier>,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Config,
        hooks: Arc<dyn TargetHooks>,
        sink: Arc<dyn TaskCompletionSink>,
        task_mgmt_sink: Arc<dyn TaskMgmtCompletionSink>,
        notifier: Arc<dyn AsyncEventNotifier>,
    ) -> Self {
        Self {
            store: Arc::new(SessionStore::new(cfg, hooks)),
            registry: Arc::new(TaskRegistry::new()),
            task_mgmt: Arc::new(TaskMgmtRegistry::new()),
            sink,
            task_mgmt_sink,
            notifier,
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Spawns the `RecvPDU` workloop for one connection. Exits on its own
    /// once `conn.cancel` fires or the socket dies; callers don't join it.
    async fn spawn_recv_loop(&self, sid: u16, cid: u16) -> CoreResult<()> {
        let session = self
            .store
            .session(sid)
            .await
            .ok_or_else(|| CoreError::invalid_argument(format!("no session {sid}")))?;
        let conn = session
            .connection(cid)
            .await
            .ok_or_else(|| CoreError::invalid_argument(format!("no connection {cid}")))?;

        let recv_loop = RecvLoop::new(
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            Arc::clone(&self.task_mgmt),
            Arc::clone(&self.sink),
            Arc::clone(&self.task_mgmt_sink),
            Arc::clone(&self.notifier),
            sid,
            cid,
        );
        let cancel = conn.cancel.clone();
        tokio::spawn(async move { recv_loop.run(cancel).await });
        Ok(())
    }

    /// `CreateSession` (§6): allocates a session slot, opens the first
    /// connection, and starts its receive loop.
    pub async fn create_session(&self, target_iqn: &str, portal: PortalAddr) -> CoreResult<(u16, u16)> {
        let (sid, cid) = self.store.create_session(target_iqn, portal).await?;
        self.spawn_recv_loop(sid, cid).await?;
        info!(sid, cid, target_iqn, "engine: session created");
        Ok((sid, cid))
    }

    /// `CreateConnection` (§6): opens an additional connection on an
    /// existing session and starts its receive loop.
    pub async fn create_connection(&self, sid: u16, portal: PortalAddr) -> CoreResult<u16> {
        let cid = self.store.create_connection(sid, portal).await?;
        self.spawn_recv_loop(sid, cid).await?;
        Ok(cid)
    }

    pub async fn activate_connection(&self, sid: u16, cid: u16) -> CoreResult<()> {
        self.store.activate_connection(sid, cid).await
    }

    pub async fn activate_all_connections(&self, sid: u16) -> CoreResult<()> {
        self.store.activate_all_connections(sid).await
    }

    pub async fn deactivate_connection(&self, sid: u16, cid: u16) -> CoreResult<()> {
        let registry = &self.registry;
        self.store
            .deactivate_connection(sid, cid, self.sink.as_ref(), |t| registry.task(t))
            .await
    }

    pub async fn deactivate_all_connections(&self, sid: u16) -> CoreResult<()> {
        let registry = &self.registry;
        self.store
            .deactivate_all_connections(sid, self.sink.as_ref(), |t| registry.task(t))
            .await
    }

    /// `ReleaseConnection` (§6): hard cancel — tears down the socket, which
    /// also ends that connection's receive loop.
    pub async fn release_connection(&self, sid: u16, cid: u16) -> CoreResult<()> {
        let registry = &self.registry;
        self.store
            .release_connection(sid, cid, self.sink.as_ref(), |t| registry.task(t))
            .await
    }

    pub async fn release_session(&self, sid: u16) -> CoreResult<()> {
        let registry = &self.registry;
        self.store
            .release_session(sid, self.sink.as_ref(), |t| registry.task(t))
            .await
    }

    /// `ProcessTask` (§4.4, §6): dispatches a SCSI task to a connection and,
    /// if that connection wasn't already sending something, kicks off
    /// `BeginTask` for it immediately instead of waiting for some other
    /// event to do so.
    pub async fn process_task(&self, task: Arc<dyn ScsiTask>) -> DispatchOutcome {
        let outcome = dispatcher::process_task(&self.store, &self.registry, Arc::clone(&task)).await;
        if outcome == DispatchOutcome::RequestInProcess {
            if let Some(location) = self.registry.location(task.initiator_task_tag()) {
                if let Some(session) = self.store.session(location.session_id).await {
                    if let Some(conn) = session.connection(location.cid).await {
                        let cancel = conn.cancel.clone();
                        if let Err(e) =
                            send_path::begin_next_queued(&self.store, &self.registry, &conn, &cancel).await
                        {
                            tracing::warn!(error = %e, "process_task: begin_next_queued failed");
                        }
                    }
                }
            }
        }
        outcome
    }

    /// Task-management (§6): emits an Abort/AbortSet/ClearACA/ClearTaskSet/
    /// LUNReset/TargetReset PDU on the given connection. The matching
    /// Response routes back through `TaskMgmtCompletionSink` once it
    /// arrives.
    pub async fn process_task_mgmt(
        &self,
        sid: u16,
        cid: u16,
        function: TaskMgmtFunction,
        lun: u64,
        referenced_task_tag: u32,
    ) -> CoreResult<u32> {
        let session = self
            .store
            .session(sid)
            .await
            .ok_or_else(|| CoreError::invalid_argument(format!("no session {sid}")))?;
        let conn = session
            .connection(cid)
            .await
            .ok_or_else(|| CoreError::invalid_argument(format!("no connection {cid}")))?;

        let cmd_sn = session.seq.stamp_cmd_sn(false);
        let cancel = conn.cancel.clone();
        self.task_mgmt
            .begin_task_mgmt(&self.store, &conn, function, lun, referenced_task_tag, cmd_sn, &cancel)
            .await
            .map_err(crate::error::to_core_error)
    }
}
