//! Public leaf error type for the session/connection engine API surface.
//!
//! Internal plumbing (codec parsing, digest checks) keeps returning
//! `anyhow::Result`; anything crossing the `Engine`/`Session`/`Connection`
//! API boundary is mapped into one of these variants.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use thiserror::Error;

/// Errors returned by the public engine API.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A caller-supplied argument is out of range or otherwise malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation cannot complete right now but may succeed if retried
    /// (e.g. no free session/connection slot, dispatcher queue full).
    #[error("try again: {0}")]
    TryAgain(String),

    /// The underlying socket failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A peer sent a PDU that violates RFC 3720 framing or sequencing rules.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A connection or task exceeded its configured deadline.
    #[error("timeout: {0}")]
    Timeout(String),
}

impl CoreError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn try_again(msg: impl Into<String>) -> Self {
        Self::TryAgain(msg.into())
    }

    pub fn protocol_violation(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }
}

/// Maps an internal `anyhow::Error` to the nearest `CoreError` variant at
/// the public API edge. Internal helpers keep using `anyhow` so call sites
/// deep in the codec/dispatcher don't have to pick a variant up front.
pub fn to_core_error(err: anyhow::Error) -> CoreError {
    CoreError::ProtocolViolation(format!("{err:#}"))
}

pub type CoreResult<T> = Result<T, CoreError>;
