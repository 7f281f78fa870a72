// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Work queues, completions and the slot arena shared by all bindings.

use rcbench_common::RegionInfo;

use crate::Res;

/// Kind of work a slot describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
    Send,
    Recv,
    RdmaWrite,
    RdmaRead,
}

/// Outcome of a completed work request. Anything but `Success` is fatal
/// to the run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionStatus {
    Success,
    /// The local buffer did not cover the request.
    LocalProtection,
    /// The peer refused a one-sided access, e.g. a stale remote key.
    RemoteAccess,
    /// The queue was drained after the connection broke.
    Flushed,
}

/// A single entry pulled out of a completion queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Completion {
    pub id: u64,
    pub status: CompletionStatus,
}

/// One pre-built work request. Slots always cover the whole transfer
/// buffer and are always signaled.
#[derive(Clone, Copy, Debug)]
pub struct WorkSlot {
    pub id: u64,
    pub opcode: Opcode,
    pub len: u32,
}

/// Pre-allocated work request slots for one direction of an endpoint.
///
/// Slots are built once and handed out as chunks. A chunk of the same
/// size as the previous one is served from cache; only a size change
/// rebuilds the submission state. The pipelining engine keeps chunk
/// sizes stable so that steady-state submission is allocation free.
#[derive(Debug)]
pub struct SlotPool {
    slots: Vec<WorkSlot>,
    cached: u32,
    rebuilds: u64,
}

impl SlotPool {
    #[must_use]
    pub fn new(depth: u32, opcode: Opcode, len: u32) -> Self {
        let slots = (0..u64::from(depth))
            .map(|id| WorkSlot { id, opcode, len })
            .collect();
        Self {
            slots,
            cached: 0,
            rebuilds: 0,
        }
    }

    #[must_use]
    pub fn depth(&self) -> u32 {
        u32::try_from(self.slots.len()).unwrap_or(u32::MAX)
    }

    /// Hand out the first `count` slots for submission.
    ///
    /// # Panics
    ///
    /// If `count` exceeds the pool depth. Callers bound their batches by
    /// the free queue capacity, which can never exceed the depth.
    pub fn chunk(&mut self, count: u32) -> &[WorkSlot] {
        assert!(count <= self.depth());
        if count != self.cached {
            self.cached = count;
            self.rebuilds += 1;
        }
        &self.slots[..count as usize]
    }

    /// Number of times a chunk could not be served from cache.
    #[must_use]
    pub const fn rebuilds(&self) -> u64 {
        self.rebuilds
    }
}

/// One direction of an established endpoint.
///
/// `submit` posts `count` more operations of the direction's configured
/// kind; it must never be called with more than the free queue capacity.
/// `poll` empties the completion queue once without blocking and returns
/// how many requests finished. A completion that did not succeed is
/// returned as [`Error::WorkCompletion`](crate::Error::WorkCompletion).
pub trait WorkQueue {
    fn depth(&self) -> u32;
    fn submit(&mut self, count: u32) -> Res<()>;
    fn poll(&mut self) -> Res<usize>;
}

/// An established, addressable pair of work queues.
///
/// Splitting moves the two directions into separately owned halves so
/// that each can live on its own thread without locking.
pub trait Endpoint {
    type Tx: WorkQueue + Send + 'static;
    type Rx: WorkQueue + Send + 'static;

    /// Access parameters of this side's receive buffer, as sent to the
    /// peer during the handshake.
    fn local_region(&self) -> RegionInfo;

    /// Install the peer's buffer parameters for one-sided operations.
    fn set_remote_region(&mut self, region: RegionInfo);

    fn split(self) -> (Self::Tx, Self::Rx);
}
