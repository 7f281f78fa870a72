// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Connection establishment and work-queue plumbing for a
//! reliable-connection throughput and latency benchmark.

use std::{
    fmt::{self, Display},
    io,
};

pub mod cm;
pub mod config;
pub mod ep;
pub mod handshake;
pub mod pipeline;
pub mod run;
pub mod sampler;
pub mod stream;

pub use self::{
    cm::{CmEvent, ConnParams, ConnectionManager},
    config::{BenchConfig, OpKind, Pattern, Role},
    ep::{Completion, CompletionStatus, Endpoint, Opcode, WorkQueue},
    pipeline::BATCH_MIN,
    run::{BenchResult, CancelToken},
    sampler::Sampler,
};

/// Fatal benchmark errors. Any of these aborts the run; the harness does
/// not retry or degrade.
#[derive(Debug)]
pub enum Error {
    /// The peer address could not be resolved in time.
    AddressResolution,
    /// No route to the resolved peer address.
    RouteResolution,
    /// The connection manager delivered an event out of order.
    UnexpectedCmEvent(CmEvent),
    /// The peer rejected or dropped the connection attempt.
    ConnectionRefused,
    /// The peer went away mid-run.
    Disconnected,
    /// Malformed or truncated control channel traffic.
    ControlChannel,
    /// Buffer registration was rejected.
    Registration,
    /// A submission would have overrun the queue depth.
    QueueCapacity,
    /// A one-sided operation was posted before the remote region was known.
    RemoteRegionUnknown,
    /// A work request completed with a non-success status.
    WorkCompletion(CompletionStatus),
    /// The run was cancelled, usually because the other direction failed.
    Cancelled,
    InvalidConfig(&'static str),
    IoError(io::Error),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::IoError(err)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Error: {self:?}")
    }
}

impl std::error::Error for Error {}

pub type Res<T> = Result<T, Error>;
