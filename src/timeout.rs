//! `HandleTaskTimeout` and `HandleConnectionTimeout` (§4.8).
//!
//! Grounded in `session.rs`'s deactivate/release helpers, which already do
//! the "drain the queue, fail pending tasks, tear the socket down" work;
//! this module only decides *which* of those to call and when, based on
//! `Transport::is_broken` and the session's live connection count.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use tracing::warn;

use crate::{
    dispatcher::TaskRegistry,
    session::SessionStore,
    task::{ScsiTask, TaskCompletionSink},
};

/// A task's send/response round trip exceeded `RuntimeConfig::task_timeout`.
/// Escalates to a connection-level timeout if the socket itself looks dead;
/// otherwise just fails the one task.
pub async fn handle_task_timeout(
    store: &SessionStore,
    registry: &TaskRegistry,
    sink: &dyn TaskCompletionSink,
    tag: u32,
) {
    let Some(location) = registry.location(tag) else {
        warn!(tag, "task timeout: tag not in registry, already completed?");
        return;
    };

    let Some(session) = store.session(location.session_id).await else {
        return;
    };
    let Some(conn) = session.connection(location.cid).await else {
        return;
    };

    if conn.transport.is_broken().await {
        handle_connection_timeout(store, location.session_id, location.cid, sink, |t| {
            registry.task(t)
        })
        .await;
        return;
    }

    let Some(task) = registry.task(tag) else {
        return;
    };
    registry.forget(tag);
    conn.complete_current_task().await;
    sink.complete_task_timeout(task);
}

/// A connection's socket is dead or unresponsive. If the session has other
/// live connections, deactivates and releases just this one; otherwise the
/// whole session goes down with it — there is no separate "wait for the
/// daemon to acknowledge" step here, the release is immediate (see
/// DESIGN.md).
pub async fn handle_connection_timeout(
    store: &SessionStore,
    sid: u16,
    cid: u16,
    sink: &dyn TaskCompletionSink,
    find_task: impl Fn(u32) -> Option<Arc<dyn ScsiTask>> + Copy,
) {
    let Some(session) = store.session(sid).await else {
        return;
    };

    let live = session.live_connection_count().await;
    warn!(sid, cid, live, "connection timeout");

    if live > 1 {
        if let Err(e) = store.release_connection(sid, cid, sink, find_task).await {
            warn!(sid, cid, error = %e, "connection timeout: release_connection failed");
        }
    } else if let Err(e) = store.release_session(sid, sink, find_task).await {
        warn!(sid, error = %e, "connection timeout: release_session failed");
    }
}
