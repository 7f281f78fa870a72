// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Benchmark run parameters.

use std::{fmt::Display, net::IpAddr, str::FromStr};

use crate::{Error, Res};

/// Which end of the connection this process is.
///
/// The server listens and, for unidirectional runs, is the side that
/// performs the operations; the client connects and measures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Res<Self> {
        match s {
            "server" => Ok(Self::Server),
            "client" => Ok(Self::Client),
            _ => Err(Error::InvalidConfig("mode must be server or client")),
        }
    }
}

/// The verb used for every operation of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    /// Two-sided messaging; the passive side posts receives.
    Msg,
    /// One-sided writes into the remote buffer.
    RdmaWrite,
    /// One-sided reads from the remote buffer.
    RdmaRead,
}

impl OpKind {
    #[must_use]
    pub const fn is_one_sided(self) -> bool {
        matches!(self, Self::RdmaWrite | Self::RdmaRead)
    }
}

impl FromStr for OpKind {
    type Err = Error;

    fn from_str(s: &str) -> Res<Self> {
        match s {
            "msg" => Ok(Self::Msg),
            "rdma" | "rdma-write" => Ok(Self::RdmaWrite),
            "rdma-read" => Ok(Self::RdmaRead),
            _ => Err(Error::InvalidConfig(
                "transport must be msg, rdma-write or rdma-read",
            )),
        }
    }
}

impl Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(match self {
            Self::Msg => "msg",
            Self::RdmaWrite => "rdma-write",
            Self::RdmaRead => "rdma-read",
        })
    }
}

/// Traffic pattern of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pattern {
    /// The server performs all operations, the client measures.
    Unidirectional,
    /// Both sides perform and measure at the same time.
    Bidirectional,
    /// Strictly alternating single messages; round trips are sampled.
    PingPong,
    /// One operation in flight at a time with per-operation samples.
    /// Restricted to one-sided verbs, whose completions round-trip to
    /// the peer.
    Latency,
}

impl FromStr for Pattern {
    type Err = Error;

    fn from_str(s: &str) -> Res<Self> {
        match s {
            "unidirectional" => Ok(Self::Unidirectional),
            "bidirectional" => Ok(Self::Bidirectional),
            "pingpong" => Ok(Self::PingPong),
            "latency" => Ok(Self::Latency),
            _ => Err(Error::InvalidConfig(
                "benchmark must be unidirectional, bidirectional, pingpong or latency",
            )),
        }
    }
}

impl Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(match self {
            Self::Unidirectional => "unidirectional",
            Self::Bidirectional => "bidirectional",
            Self::PingPong => "pingpong",
            Self::Latency => "latency",
        })
    }
}

/// Everything a run needs to know up front. All sizing is fixed for the
/// lifetime of the connection; nothing is renegotiated mid-run.
#[derive(Clone, Debug)]
pub struct BenchConfig {
    pub role: Role,
    /// Local address to bind, if any.
    pub bind: Option<IpAddr>,
    /// Peer host name or address; required for the client.
    pub peer: Option<String>,
    /// Data port. The control channel uses the next port up.
    pub port: u16,
    /// Size of each transferred buffer in bytes.
    pub buf_size: usize,
    /// Number of operations to perform per direction.
    pub count: u64,
    /// Capacity of each work queue.
    pub queue_depth: u32,
    pub op: OpKind,
    pub pattern: Pattern,
}

impl BenchConfig {
    pub fn validate(&self) -> Res<()> {
        if self.queue_depth == 0 {
            return Err(Error::InvalidConfig("queue depth must be at least 1"));
        }
        if self.buf_size == 0 {
            return Err(Error::InvalidConfig("buffer size must be at least 1"));
        }
        if self.role == Role::Client && self.peer.is_none() {
            return Err(Error::InvalidConfig("client needs a peer address"));
        }
        if self.pattern == Pattern::PingPong && self.op != OpKind::Msg {
            return Err(Error::InvalidConfig("pingpong only supports msg"));
        }
        // Two-sided sends complete as soon as they are handed to the
        // transport, so per-operation samples would time the local
        // enqueue instead of the network. Round trips are what pingpong
        // measures; latency needs the peer's acknowledgement.
        if self.pattern == Pattern::Latency && !self.op.is_one_sided() {
            return Err(Error::InvalidConfig(
                "latency requires rdma-write or rdma-read",
            ));
        }
        Ok(())
    }

    /// Port of the out-of-band control channel.
    #[must_use]
    pub const fn control_port(&self) -> u16 {
        self.port.wrapping_add(1)
    }
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            role: Role::Server,
            bind: None,
            peer: None,
            port: 8888,
            buf_size: 1024,
            count: 1_000_000,
            queue_depth: 100,
            op: OpKind::Msg,
            pattern: Pattern::Unidirectional,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BenchConfig, OpKind, Pattern, Role};

    #[test]
    fn parse_enums() {
        assert_eq!("server".parse::<Role>().ok(), Some(Role::Server));
        assert_eq!("rdma-read".parse::<OpKind>().ok(), Some(OpKind::RdmaRead));
        assert_eq!("rdma".parse::<OpKind>().ok(), Some(OpKind::RdmaWrite));
        assert_eq!(
            "pingpong".parse::<Pattern>().ok(),
            Some(Pattern::PingPong)
        );
        assert!("fast".parse::<Pattern>().is_err());
    }

    #[test]
    fn validate_rejects_bad_sizing() {
        let mut cfg = BenchConfig::default();
        assert!(cfg.validate().is_ok());
        cfg.queue_depth = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_one_sided_pingpong() {
        let cfg = BenchConfig {
            pattern: Pattern::PingPong,
            op: OpKind::RdmaWrite,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_two_sided_latency() {
        let mut cfg = BenchConfig {
            pattern: Pattern::Latency,
            op: OpKind::Msg,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        cfg.op = OpKind::RdmaRead;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn client_needs_peer() {
        let cfg = BenchConfig {
            role: Role::Client,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn control_port_is_adjacent() {
        let cfg = BenchConfig {
            port: 8888,
            ..Default::default()
        };
        assert_eq!(cfg.control_port(), 8889);
    }
}
