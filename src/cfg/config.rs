// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::cfg::enums::{Digest, YesNo};

/// Top-level configuration for the session/connection engine.
///
/// Unlike a full initiator, this crate never negotiates a login: the values
/// here are either transport knobs (timeouts, host interface) this crate
/// owns outright, or the RFC 3720 session-parameter defaults applied once at
/// `CreateSession`/`CreateConnection` time. `ActivateConnection` takes no
/// parameters argument and never updates them.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Portal/transport settings (connect/send/recv timeouts, host
    /// interface).
    pub transport: TransportConfig,
    /// Per-connection digest and segment-length parameters, applied once at
    /// connection setup time.
    pub negotiation: NegotiationDefaults,
    /// RFC 3720 default session parameters.
    pub session_defaults: SessionDefaults,
    /// Engine-wide resource limits.
    pub runtime: RuntimeConfig,
}

/// Transport-level settings that never travel over the wire.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TransportConfig {
    #[serde(rename = "TimeoutConnection", with = "serde_secs")]
    /// Timeout for establishing the TCP connection.
    pub timeout_connection: Duration,

    #[serde(rename = "TimeoutSend", with = "serde_secs")]
    /// Timeout for a single write()/send() call on the socket.
    pub timeout_send: Duration,

    #[serde(rename = "TimeoutRecv", with = "serde_secs")]
    /// Timeout for a single read()/recv() call on the socket.
    pub timeout_recv: Duration,

    #[serde(default, rename = "HostInterface")]
    /// Optional local interface/address to bind the outbound socket to.
    pub host_interface: String,
}

/// Digest preferences used to frame PDUs; this crate has no login phase to
/// negotiate a different value, so these are the only ones ever in effect.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct NegotiationDefaults {
    #[serde(rename = "HeaderDigest")]
    pub header_digest: Digest,
    #[serde(rename = "DataDigest")]
    pub data_digest: Digest,
    #[serde(rename = "MaxRecvDataSegmentLength")]
    pub max_recv_data_segment_length: u32,
}

/// RFC 3720 default session parameters (Appendix A), used to populate a
/// `Session`/`Connection` once at `CreateSession`/`CreateConnection` time and
/// never updated thereafter.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SessionDefaults {
    #[serde(rename = "MaxBurstLength")]
    pub max_burst_length: u32,
    #[serde(rename = "FirstBurstLength")]
    pub first_burst_length: u32,
    #[serde(rename = "InitialR2T")]
    pub initial_r2t: YesNo,
    #[serde(rename = "ImmediateData")]
    pub immediate_data: YesNo,
    #[serde(rename = "MaxOutstandingR2T")]
    pub max_outstanding_r2t: u16,
    #[serde(rename = "ErrorRecoveryLevel")]
    pub error_recovery_level: u8,
    #[serde(rename = "DefaultTime2Wait", with = "serde_secs")]
    pub default_time2wait: Duration,
    #[serde(rename = "DefaultTime2Retain", with = "serde_secs")]
    pub default_time2retain: Duration,
    #[serde(rename = "MaxConnections")]
    pub max_connections: u16,
}

/// Implementation-only limits that do not map to any RFC 3720 key.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RuntimeConfig {
    #[serde(rename = "MaxSessions")]
    /// Upper bound on simultaneously tracked sessions (`kMaxSessions`).
    pub max_sessions: u32,

    #[serde(rename = "MaxConnectionsPerSession")]
    /// Upper bound on connections per session (`kMaxConnectionsPerSession`).
    pub max_connections_per_session: u16,

    #[serde(rename = "BandwidthWindowSamples")]
    /// Number of samples kept in the per-connection rolling bandwidth
    /// window.
    pub bandwidth_window_samples: usize,

    #[serde(rename = "ConnectionTimeout", with = "serde_secs")]
    /// How long a connection may stay silent before it's considered dead.
    pub connection_timeout: Duration,

    #[serde(rename = "TaskTimeout", with = "serde_secs")]
    /// How long a dispatched task may go without a response before timing
    /// out.
    pub task_timeout: Duration,
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(self.runtime.max_sessions >= 1, "MaxSessions must be >= 1");
        ensure!(
            self.runtime.max_connections_per_session >= 1,
            "MaxConnectionsPerSession must be >= 1"
        );
        ensure!(
            self.session_defaults.max_connections >= 1,
            "MaxConnections must be >= 1"
        );
        ensure!(
            self.runtime.bandwidth_window_samples >= 1,
            "BandwidthWindowSamples must be >= 1"
        );
        ensure!(
            self.session_defaults.max_outstanding_r2t >= 1,
            "MaxOutstandingR2T must be >= 1"
        );
        ensure!(
            self.negotiation.max_recv_data_segment_length >= 512,
            "MaxRecvDataSegmentLength must be >= 512"
        );

        // ERL2 (connection recovery) is not implemented; reject it up front
        // instead of silently behaving like ERL0/1.
        ensure!(
            self.session_defaults.error_recovery_level <= 1,
            "ErrorRecoveryLevel=2 (connection recovery) is not supported"
        );

        Ok(())
    }
}

/// Serde helpers for representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_yaml() -> &'static str {
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
"#
    }

    #[test]
    fn parses_and_validates_sample_config() {
        let mut cfg: Config = serde_yaml::from_str(sample_yaml()).unwrap();
        cfg.validate_and_normalize().unwrap();
        assert_eq!(cfg.runtime.max_sessions, 16);
        assert_eq!(cfg.runtime.bandwidth_window_samples, 30);
    }

    #[test]
    fn rejects_erl2() {
        let mut cfg: Config = serde_yaml::from_str(sample_yaml()).unwrap();
        cfg.session_defaults.error_recovery_level = 2;
        assert!(cfg.validate_and_normalize().is_err());
    }
}
