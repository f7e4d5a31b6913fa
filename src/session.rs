//! Fixed-slot session/connection store (§3, §4.2).
//!
//! Generalizes the teacher's unbounded `DashMap`-based `Pool`/`Session`
//! (`client/pool_sessions.rs`) into the fixed-size arrays the specification
//! calls for: `kMaxSessions` session slots, each owning up to
//! `kMaxConnectionsPerSession` connections.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::{Context, Result, bail};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    cfg::{config::Config, enums::Digest},
    error::{CoreError, CoreResult},
    seqnum::{ConnectionSequenceNumbers, SessionSequenceNumbers},
    transport::{PortalAddr, Transport},
};

pub const K_MAX_SESSIONS: usize = 16;
pub const K_MAX_CONNECTIONS_PER_SESSION: usize = 2;
pub const BANDWIDTH_WINDOW_SAMPLES: usize = 30;

/// Subset of RFC 3720 session keys used by the send path (§3).
#[derive(Debug, Clone)]
pub struct NegotiatedParams {
    pub initial_r2t: bool,
    pub immediate_data: bool,
    pub first_burst_length: u32,
    pub max_burst_length: u32,
    pub max_outstanding_r2t: u16,
    pub data_pdu_in_order: bool,
    pub data_sequence_in_order: bool,
    pub error_recovery_level: u8,
    pub max_connections: u16,
    pub default_time_2_wait: Duration,
    pub default_time_2_retain: Duration,
    pub target_portal_group_tag: u16,
    pub target_session_identifying_handle: u16,
}

impl NegotiatedParams {
    /// RFC 3720 defaults, overridable once login-phase negotiation (out of
    /// this crate's scope) has run.
    pub fn defaults(cfg: &Config) -> Self {
        Self {
            initial_r2t: cfg.session_defaults.initial_r2t.as_bool(),
            immediate_data: cfg.session_defaults.immediate_data.as_bool(),
            first_burst_length: cfg.session_defaults.first_burst_length,
            max_burst_length: cfg.session_defaults.max_burst_length,
            max_outstanding_r2t: cfg.session_defaults.max_outstanding_r2t,
            data_pdu_in_order: true,
            data_sequence_in_order: true,
            error_recovery_level: cfg.session_defaults.error_recovery_level,
            max_connections: cfg.session_defaults.max_connections,
            default_time_2_wait: cfg.session_defaults.default_time2wait,
            default_time_2_retain: cfg.session_defaults.default_time2retain,
            target_portal_group_tag: 1,
            target_session_identifying_handle: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionParams {
    pub header_digest: Digest,
    pub data_digest: Digest,
    pub max_send_data_segment_length: u32,
    pub max_recv_data_segment_length: u32,
    pub use_if_marker: bool,
    pub use_of_marker: bool,
    pub if_mark_int: u32,
    pub of_mark_int: u32,
    pub initial_exp_stat_sn: u32,
}

impl ConnectionParams {
    pub fn defaults(cfg: &Config) -> Self {
        Self {
            header_digest: cfg.negotiation.header_digest,
            data_digest: cfg.negotiation.data_digest,
            max_send_data_segment_length: cfg.negotiation.max_recv_data_segment_length,
            max_recv_data_segment_length: cfg.negotiation.max_recv_data_segment_length,
            use_if_marker: false,
            use_of_marker: false,
            if_mark_int: 0,
            of_mark_int: 0,
            initial_exp_stat_sn: 0,
        }
    }
}

/// One iSCSI connection (§3 "Connection").
pub struct Connection {
    pub session_id: u16,
    pub cid: u16,
    pub portal: PortalAddr,
    pub transport: Transport,
    pub seq: ConnectionSequenceNumbers,
    pub params: ConnectionParams,
    pub immediate_data_length: u32,
    /// Cancels in-flight send/recv on this connection; triggered by
    /// `ReleaseConnection` before the socket is shut down.
    pub cancel: CancellationToken,

    /// FIFO of pending initiator task tags. Gating structure: the head is
    /// the task currently being processed by the workloop.
    pub task_queue: Mutex<VecDeque<u32>>,
    /// Set while a `BeginTask` send for the current head is in flight, so
    /// the workloop never issues two sends for the same queue head.
    /// Cleared when the head is popped (the response arrived) or the queue
    /// goes empty.
    pub inflight: AtomicBool,
    /// Woken on every `enqueue_task`/`complete_current_task`, so the
    /// workloop only wakes when the head may have changed instead of
    /// polling.
    pub ready: tokio::sync::Notify,
    pub sources_enabled: AtomicBool,

    pub data_to_transfer: AtomicU64,
    pub bytes_per_second: AtomicU64,
    bytes_per_second_history: Mutex<[u64; BANDWIDTH_WINDOW_SAMPLES]>,
    history_idx: AtomicUsize,
    pub task_start: Mutex<Option<Instant>>,
    pub latency_ms: AtomicU64,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("session_id", &self.session_id)
            .field("cid", &self.cid)
            .field("portal", &self.portal)
            .field("enabled", &self.sources_enabled.load(Ordering::Relaxed))
            .finish()
    }
}

impl Connection {
    pub fn immediate_data_length(first_burst_length: u32, max_send: u32) -> u32 {
        first_burst_length.min(max_send)
    }

    pub fn enable_sources(&self) {
        self.sources_enabled.store(true, Ordering::SeqCst);
    }

    pub fn disable_sources(&self) {
        self.sources_enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.sources_enabled.load(Ordering::SeqCst)
    }

    /// Predicted time (arbitrary units) to drain `data_to_transfer` at the
    /// connection's current peak throughput. `bps == 0` is treated by the
    /// caller as "free" (pick immediately).
    pub fn predicted_time(&self) -> Option<f64> {
        let bps = self.bytes_per_second.load(Ordering::SeqCst);
        if bps == 0 {
            return None;
        }
        Some(self.data_to_transfer.load(Ordering::SeqCst) as f64 / bps as f64)
    }

    /// Record one completed task's throughput sample into the rolling
    /// window (§4.8). Returns `true` when the window just rolled over
    /// (signalling the caller should enqueue a latency probe).
    pub async fn record_throughput_sample(
        &self,
        bytes_transferred: u64,
        duration: Duration,
    ) -> bool {
        if duration.as_secs_f64() <= 0.0 {
            return false;
        }
        let sample = (bytes_transferred as f64 / duration.as_secs_f64()) as u64;

        let mut hist = self.bytes_per_second_history.lock().await;
        let idx = self.history_idx.fetch_add(1, Ordering::SeqCst) % BANDWIDTH_WINDOW_SAMPLES;
        hist[idx] = sample;
        let peak = hist.iter().copied().max().unwrap_or(0);
        self.bytes_per_second.store(peak, Ordering::SeqCst);

        (idx + 1) % BANDWIDTH_WINDOW_SAMPLES == 0
    }

    pub async fn enqueue_task(&self, tag: u32) {
        self.task_queue.lock().await.push_back(tag);
        self.ready.notify_one();
    }

    /// Pop the head of the task queue, i.e. complete the current task.
    pub async fn complete_current_task(&self) -> Option<u32> {
        let popped = self.task_queue.lock().await.pop_front();
        self.inflight.store(false, Ordering::SeqCst);
        self.ready.notify_one();
        popped
    }

    /// Peek the current head without popping it (the task is still "in
    /// flight" until its completion PDU arrives).
    pub async fn peek_current_task(&self) -> Option<u32> {
        self.task_queue.lock().await.front().copied()
    }

    /// Drain every pending tag, returning them in FIFO order (used by
    /// `DeactivateConnection`).
    pub async fn drain_task_queue(&self) -> Vec<u32> {
        self.inflight.store(false, Ordering::SeqCst);
        self.task_queue.lock().await.drain(..).collect()
    }
}

/// One iSCSI session, one per target (§3 "Session").
pub struct Session {
    pub session_id: u16,
    pub target_iqn: String,
    pub seq: SessionSequenceNumbers,
    pub negotiated: NegotiatedParams,
    pub connections: Mutex<[Option<Arc<Connection>>; K_MAX_CONNECTIONS_PER_SESSION]>,
    pub num_active_connections: AtomicU32,
    pub active: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("target_iqn", &self.target_iqn)
            .field(
                "num_active_connections",
                &self.num_active_connections.load(Ordering::Relaxed),
            )
            .finish()
    }
}

impl Session {
    /// Returns the connection owning `cid`, if any.
    pub async fn connection(&self, cid: u16) -> Option<Arc<Connection>> {
        let slots = self.connections.lock().await;
        slots.get(cid as usize).and_then(Clone::clone)
    }

    pub async fn enabled_connections(&self) -> Vec<Arc<Connection>> {
        let slots = self.connections.lock().await;
        slots
            .iter()
            .filter_map(|c| c.clone())
            .filter(|c| c.is_enabled())
            .collect()
    }

    pub async fn live_connection_count(&self) -> usize {
        let slots = self.connections.lock().await;
        slots.iter().filter(|c| c.is_some()).count()
    }
}

/// External hook surface for SCSI-layer target object lifecycle (§4.9).
pub trait TargetHooks: Send + Sync {
    /// Called when a session transitions 0 → 1 active connections.
    fn create_target_for_id(&self, session_id: u16) -> bool;
    /// Called when a session transitions 1 → 0 active connections.
    fn destroy_target_for_id(&self, session_id: u16);
}

/// The fixed session-slot array plus the IQN → session_id registry (§4.9).
pub struct SessionStore {
    slots: Vec<Mutex<Option<Arc<Session>>>>,
    pub targets: DashMap<String, u16>,
    hooks: Arc<dyn TargetHooks>,
    cfg: Config,
}

impl SessionStore {
    pub fn new(cfg: Config, hooks: Arc<dyn TargetHooks>) -> Self {
        let n = cfg.runtime.max_sessions as usize;
        let mut slots = Vec::with_capacity(n);
        slots.resize_with(n, || Mutex::new(None));
        Self {
            slots,
            targets: DashMap::new(),
            hooks,
            cfg,
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub async fn session(&self, sid: u16) -> Option<Arc<Session>> {
        self.slots.get(sid as usize)?.lock().await.clone()
    }

    /// Scans for a free slot, allocates a session with RFC 3720 defaults,
    /// then opens the first connection. Rewinds the session allocation if
    /// the first connection fails to open.
    pub async fn create_session(
        &self,
        target_iqn: &str,
        portal: PortalAddr,
    ) -> CoreResult<(u16, u16)> {
        let sid = self.find_free_session_slot().await?;

        let session = Arc::new(Session {
            session_id: sid,
            target_iqn: target_iqn.to_string(),
            seq: SessionSequenceNumbers::default(),
            negotiated: NegotiatedParams::defaults(&self.cfg),
            connections: Mutex::new(Default::default()),
            num_active_connections: AtomicU32::new(0),
            active: AtomicBool::new(false),
        });

        {
            let mut slot = self.slots[sid as usize].lock().await;
            *slot = Some(Arc::clone(&session));
        }

        match self.create_connection_on(&session, portal).await {
            Ok(cid) => {
                self.targets.insert(target_iqn.to_string(), sid);
                info!(sid, target_iqn, "session created");
                Ok((sid, cid))
            },
            Err(e) => {
                let mut slot = self.slots[sid as usize].lock().await;
                *slot = None;
                Err(e)
            },
        }
    }

    async fn find_free_session_slot(&self) -> CoreResult<u16> {
        for (i, slot) in self.slots.iter().enumerate() {
            let guard = slot.lock().await;
            if guard.is_none() {
                return Ok(i as u16);
            }
        }
        Err(CoreError::try_again("no free session slot"))
    }

    pub async fn create_connection(&self, sid: u16, portal: PortalAddr) -> CoreResult<u16> {
        let session = self
            .session(sid)
            .await
            .ok_or_else(|| CoreError::invalid_argument(format!("no session {sid}")))?;
        self.create_connection_on(&session, portal).await
    }

    async fn create_connection_on(&self, session: &Session, portal: PortalAddr) -> CoreResult<u16> {
        let cid = {
            let slots = session.connections.lock().await;
            slots
                .iter()
                .position(Option::is_none)
                .ok_or_else(|| CoreError::try_again("no free connection slot"))? as u16
        };

        let transport = Transport::connect(&self.cfg.transport, portal)
            .await
            .map_err(|e| CoreError::Io(std::io::Error::other(e.to_string())))?;

        let params = ConnectionParams::defaults(&self.cfg);
        let immediate_data_length = Connection::immediate_data_length(
            session.negotiated.first_burst_length,
            params.max_send_data_segment_length,
        );

        let conn = Arc::new(Connection {
            session_id: session.session_id,
            cid,
            portal,
            transport,
            seq: ConnectionSequenceNumbers::new(params.initial_exp_stat_sn),
            params,
            immediate_data_length,
            cancel: CancellationToken::new(),
            task_queue: Mutex::new(VecDeque::new()),
            inflight: AtomicBool::new(false),
            ready: tokio::sync::Notify::new(),
            sources_enabled: AtomicBool::new(false),
            data_to_transfer: AtomicU64::new(0),
            bytes_per_second: AtomicU64::new(0),
            bytes_per_second_history: Mutex::new([0; BANDWIDTH_WINDOW_SAMPLES]),
            history_idx: AtomicUsize::new(0),
            task_start: Mutex::new(None),
            latency_ms: AtomicU64::new(0),
        });

        let mut slots = session.connections.lock().await;
        slots[cid as usize] = Some(conn);
        Ok(cid)
    }

    /// Enables the event sources, computes `immediate_data_length`, and
    /// bumps `num_active_connections`; on 0→1 calls `create_target_for_id`.
    pub async fn activate_connection(&self, sid: u16, cid: u16) -> CoreResult<()> {
        let session = self
            .session(sid)
            .await
            .ok_or_else(|| CoreError::invalid_argument(format!("no session {sid}")))?;
        let conn = session
            .connection(cid)
            .await
            .ok_or_else(|| CoreError::invalid_argument(format!("no connection {cid}")))?;

        conn.enable_sources();
        let was = session.num_active_connections.fetch_add(1, Ordering::SeqCst);
        if was == 0 {
            let created = self.hooks.create_target_for_id(sid);
            if !created {
                conn.disable_sources();
                session.num_active_connections.fetch_sub(1, Ordering::SeqCst);
                return Err(CoreError::try_again("target creation failed"));
            }
            session.active.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    pub async fn activate_all_connections(&self, sid: u16) -> CoreResult<()> {
        let session = self
            .session(sid)
            .await
            .ok_or_else(|| CoreError::invalid_argument(format!("no session {sid}")))?;
        let cids: Vec<u16> = {
            let slots = session.connections.lock().await;
            slots
                .iter()
                .enumerate()
                .filter_map(|(i, c)| c.as_ref().map(|_| i as u16))
                .collect()
        };
        for cid in cids {
            self.activate_connection(sid, cid).await?;
        }
        Ok(())
    }

    /// Disables the event sources, then drains the task queue failing every
    /// pending task with `DeliveryFailure`. Decrements the active count; on
    /// 1→0 destroys the target.
    pub async fn deactivate_connection(
        &self,
        sid: u16,
        cid: u16,
        sink: &dyn crate::task::TaskCompletionSink,
        find_task: impl Fn(u32) -> Option<std::sync::Arc<dyn crate::task::ScsiTask>>,
    ) -> CoreResult<()> {
        let session = self
            .session(sid)
            .await
            .ok_or_else(|| CoreError::invalid_argument(format!("no session {sid}")))?;
        let conn = session
            .connection(cid)
            .await
            .ok_or_else(|| CoreError::invalid_argument(format!("no connection {cid}")))?;

        conn.disable_sources();
        for tag in conn.drain_task_queue().await {
            if let Some(task) = find_task(tag) {
                sink.complete_task(
                    task,
                    crate::models::command::common::ScsiStatus::Good,
                    crate::task::ServiceResponse::DeliveryFailure,
                );
            } else {
                warn!(tag, "deactivate_connection: no task found for tag");
            }
        }

        let was = session.num_active_connections.fetch_sub(1, Ordering::SeqCst);
        if was == 1 {
            self.hooks.destroy_target_for_id(sid);
            session.active.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    pub async fn deactivate_all_connections(
        &self,
        sid: u16,
        sink: &dyn crate::task::TaskCompletionSink,
        find_task: impl Fn(u32) -> Option<std::sync::Arc<dyn crate::task::ScsiTask>> + Copy,
    ) -> CoreResult<()> {
        let session = self
            .session(sid)
            .await
            .ok_or_else(|| CoreError::invalid_argument(format!("no session {sid}")))?;
        let cids: Vec<u16> = {
            let slots = session.connections.lock().await;
            slots
                .iter()
                .enumerate()
                .filter_map(|(i, c)| c.as_ref().map(|_| i as u16))
                .collect()
        };
        for cid in cids {
            self.deactivate_connection(sid, cid, sink, find_task).await?;
        }
        Ok(())
    }

    /// Deactivates if active, clears the slot *before* tearing down the
    /// socket (so concurrent readers observe "gone" first), then shuts the
    /// transport down.
    pub async fn release_connection(
        &self,
        sid: u16,
        cid: u16,
        sink: &dyn crate::task::TaskCompletionSink,
        find_task: impl Fn(u32) -> Option<std::sync::Arc<dyn crate::task::ScsiTask>>,
    ) -> CoreResult<()> {
        let session = self
            .session(sid)
            .await
            .ok_or_else(|| CoreError::invalid_argument(format!("no session {sid}")))?;

        if session
            .connection(cid)
            .await
            .map(|c| c.is_enabled())
            .unwrap_or(false)
        {
            self.deactivate_connection(sid, cid, sink, find_task).await?;
        }

        let conn = {
            let mut slots = session.connections.lock().await;
            slots.get_mut(cid as usize).and_then(Option::take)
        };

        if let Some(conn) = conn {
            conn.cancel.cancel();
            conn.transport.shutdown().await.ok();
        }
        Ok(())
    }

    /// Releases every connection, clears the session slot.
    pub async fn release_session(
        &self,
        sid: u16,
        sink: &dyn crate::task::TaskCompletionSink,
        find_task: impl Fn(u32) -> Option<std::sync::Arc<dyn crate::task::ScsiTask>> + Copy,
    ) -> CoreResult<()> {
        let session = self
            .session(sid)
            .await
            .ok_or_else(|| CoreError::invalid_argument(format!("no session {sid}")))?;

        let cids: Vec<u16> = {
            let slots = session.connections.lock().await;
            slots
                .iter()
                .enumerate()
                .filter_map(|(i, c)| c.as_ref().map(|_| i as u16))
                .collect()
        };
        for cid in cids {
            self.release_connection(sid, cid, sink, find_task).await?;
        }

        self.targets.remove(&session.target_iqn);
        let mut slot = self.slots[sid as usize].lock().await;
        *slot = None;
        Ok(())
    }
}

/// Helper used by `CreateConnection`/`CreateSession` callers to turn a
/// string LUN/portal argument error into `InvalidArgument` instead of a
/// panic.
pub fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        bail!("{field} must not be empty");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_data_length_is_the_smaller_of_the_two() {
        assert_eq!(Connection::immediate_data_length(8192, 4096), 4096);
        assert_eq!(Connection::immediate_data_length(1024, 4096), 1024);
    }
}
