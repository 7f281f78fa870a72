// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Connection manager events and parameters.

use std::time::Duration;

use crate::Res;

/// How long to wait for address and route resolution and for each
/// expected connection manager event.
pub const RESOLUTION_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a passive side waits for a connect request. Server and
/// client are usually started by hand, so this is generous.
pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(120);

/// Events delivered by a connection manager, in the order the handshake
/// expects them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmEvent {
    AddressResolved,
    RouteResolved,
    ConnectRequest,
    Established,
    Disconnected,
    Rejected,
}

/// Parameters carried by connect and accept.
///
/// One outstanding one-sided read per side is enough for the benchmark,
/// and both retry counts match what the connection was tuned for on
/// real fabrics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnParams {
    pub initiator_depth: u8,
    pub responder_resources: u8,
    pub retry_count: u8,
    pub rnr_retry_count: u8,
}

impl Default for ConnParams {
    fn default() -> Self {
        Self {
            initiator_depth: 1,
            responder_resources: 1,
            retry_count: 3,
            rnr_retry_count: 3,
        }
    }
}

/// Driver of the connection life cycle for one endpoint.
///
/// Implementations deliver exactly one [`CmEvent`] per successful call
/// to `event`; the handshake layer checks the ordering and converts
/// anything unexpected into a fatal error.
pub trait ConnectionManager {
    /// Resolve the peer and bind locally. Completes with
    /// [`CmEvent::AddressResolved`].
    fn resolve_address(&mut self, timeout: Duration) -> Res<()>;

    /// Resolve a route to the peer. Completes with
    /// [`CmEvent::RouteResolved`].
    fn resolve_route(&mut self, timeout: Duration) -> Res<()>;

    /// Initiate the connection. Completes with [`CmEvent::Established`]
    /// or [`CmEvent::Rejected`].
    fn connect(&mut self, params: &ConnParams) -> Res<()>;

    /// Accept a pending request. Only valid after
    /// [`CmEvent::ConnectRequest`] was delivered. Completes with
    /// [`CmEvent::Established`].
    fn accept(&mut self, params: &ConnParams) -> Res<()>;

    /// Tear the connection down. Completes with
    /// [`CmEvent::Disconnected`].
    fn disconnect(&mut self) -> Res<()>;

    /// Wait for the next event, at most `timeout`.
    fn event(&mut self, timeout: Duration) -> Res<CmEvent>;
}
