//! Async event codes for the iSCSI Asynchronous Message PDU (RFC 3720
//! §10.9.1).

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Meaning of an Asynchronous Message PDU, carried in the `AsyncEvent` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncEvent {
    /// SCSI sense data (or, absent sense data, a vendor-specific async
    /// message) is associated with this event.
    SenseDataOrAsyncMsg,
    /// The target requests that this session be logged out; `Parameter3`
    /// carries the number of seconds the initiator has to comply.
    RequestLogout,
    /// The target is about to drop this connection; `Parameter1` carries
    /// the CID, `Parameter3` the number of seconds before the drop.
    DropConnection,
    /// The target is about to drop all connections of this session;
    /// `Parameter3` carries the number of seconds before the drop.
    DropAllConnections,
    /// The target requests renegotiation of session parameters via a new
    /// Text negotiation.
    RequestParamNegotiation,
    VendorSpecific,
    Reserved(u8),
}

impl AsyncEvent {
    #[inline]
    pub fn from_raw(v: u8) -> Self {
        match v {
            0x00 => Self::SenseDataOrAsyncMsg,
            0x01 => Self::RequestLogout,
            0x02 => Self::DropConnection,
            0x03 => Self::DropAllConnections,
            0x04 => Self::RequestParamNegotiation,
            0xFF => Self::VendorSpecific,
            other => Self::Reserved(other),
        }
    }

    #[inline]
    pub fn as_raw(self) -> u8 {
        match self {
            Self::SenseDataOrAsyncMsg => 0x00,
            Self::RequestLogout => 0x01,
            Self::DropConnection => 0x02,
            Self::DropAllConnections => 0x03,
            Self::RequestParamNegotiation => 0x04,
            Self::VendorSpecific => 0xFF,
            Self::Reserved(v) => v,
        }
    }
}

/// Wire view of the `AsyncEvent` byte.
#[repr(transparent)]
#[derive(Default, Clone, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawAsyncEvent(u8);

impl RawAsyncEvent {
    #[inline]
    pub const fn raw(&self) -> u8 {
        self.0
    }

    #[inline]
    pub fn event(&self) -> AsyncEvent {
        AsyncEvent::from_raw(self.0)
    }

    #[inline]
    pub fn set_event(&mut self, e: AsyncEvent) {
        self.0 = e.as_raw();
    }
}

impl fmt::Debug for RawAsyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawAsyncEvent({:?})", self.event())
    }
}
