// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The connection establishment state machine and the out-of-band
//! control channel records it exchanges.

use std::io::{Read, Write};

use rcbench_common::{
    qdebug, qwarn,
    wire::{RegionInfo, CLOSE_SIGNAL, RECORD_LEN, SIGNAL_LEN, START_SIGNAL},
};

use crate::{
    cm::{CmEvent, ConnParams, ConnectionManager, ACCEPT_TIMEOUT, RESOLUTION_TIMEOUT},
    Error, Res,
};

/// Drive an outgoing connection to the established state.
///
/// Address and route resolution are bounded by
/// [`RESOLUTION_TIMEOUT`]; a missing or out-of-order event aborts the
/// handshake.
pub fn establish_active<C: ConnectionManager>(cm: &mut C, params: &ConnParams) -> Res<()> {
    cm.resolve_address(RESOLUTION_TIMEOUT)?;
    if expect(cm, CmEvent::AddressResolved).is_err() {
        return Err(Error::AddressResolution);
    }
    cm.resolve_route(RESOLUTION_TIMEOUT)?;
    if expect(cm, CmEvent::RouteResolved).is_err() {
        return Err(Error::RouteResolution);
    }
    cm.connect(params)?;
    match cm.event(RESOLUTION_TIMEOUT)? {
        CmEvent::Established => {
            qdebug!("connection established");
            Ok(())
        }
        CmEvent::Rejected => Err(Error::ConnectionRefused),
        other => Err(Error::UnexpectedCmEvent(other)),
    }
}

/// Wait for an incoming request and accept it.
pub fn establish_passive<C: ConnectionManager>(cm: &mut C, params: &ConnParams) -> Res<()> {
    match cm.event(ACCEPT_TIMEOUT)? {
        CmEvent::ConnectRequest => {}
        other => return Err(Error::UnexpectedCmEvent(other)),
    }
    cm.accept(params)?;
    expect(cm, CmEvent::Established)?;
    qdebug!("connection established");
    Ok(())
}

/// Disconnect and wait for the peer to acknowledge.
///
/// A missing acknowledgement is only logged; resources are released
/// either way and the process is about to exit.
pub fn teardown<C: ConnectionManager>(cm: &mut C) {
    if let Err(e) = cm.disconnect() {
        qwarn!("disconnect failed: {}", e);
        return;
    }
    match cm.event(RESOLUTION_TIMEOUT) {
        Ok(CmEvent::Disconnected) => qdebug!("disconnected"),
        Ok(other) => qwarn!("unexpected event during teardown: {:?}", other),
        Err(e) => qwarn!("peer did not acknowledge disconnect: {}", e),
    }
}

fn expect<C: ConnectionManager>(cm: &mut C, want: CmEvent) -> Res<()> {
    match cm.event(RESOLUTION_TIMEOUT)? {
        got if got == want => Ok(()),
        other => Err(Error::UnexpectedCmEvent(other)),
    }
}

/// Swap buffer access parameters with the peer over the control channel.
///
/// Both sides write their own record first and then read the peer's, so
/// the exchange cannot deadlock on an unbuffered channel.
pub fn exchange_regions<S: Read + Write>(channel: &mut S, local: RegionInfo) -> Res<RegionInfo> {
    channel
        .write_all(&local.encode())
        .map_err(|_| Error::ControlChannel)?;
    let mut buf = [0; RECORD_LEN];
    channel
        .read_exact(&mut buf)
        .map_err(|_| Error::ControlChannel)?;
    let remote = RegionInfo::decode(&buf).ok_or(Error::ControlChannel)?;
    qdebug!("remote region {}", remote);
    Ok(remote)
}

/// Tell the peer the measuring side is ready.
pub fn send_start<S: Write>(channel: &mut S) -> Res<()> {
    channel
        .write_all(START_SIGNAL)
        .map_err(|_| Error::ControlChannel)
}

/// Block until the peer reports readiness.
pub fn await_start<S: Read>(channel: &mut S) -> Res<()> {
    await_signal(channel, START_SIGNAL)
}

/// Tell the peer all one-sided operations have completed.
pub fn send_close<S: Write>(channel: &mut S) -> Res<()> {
    channel
        .write_all(CLOSE_SIGNAL)
        .map_err(|_| Error::ControlChannel)
}

/// Block until the peer reports it is done.
pub fn await_close<S: Read>(channel: &mut S) -> Res<()> {
    await_signal(channel, CLOSE_SIGNAL)
}

fn await_signal<S: Read>(channel: &mut S, want: &[u8; SIGNAL_LEN]) -> Res<()> {
    let mut buf = [0; SIGNAL_LEN];
    channel.read_exact(&mut buf).map_err(|_| Error::ControlChannel)?;
    if &buf == want {
        Ok(())
    } else {
        Err(Error::ControlChannel)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, io::Cursor, time::Duration};

    use rcbench_common::RegionInfo;

    use super::{
        await_start, establish_active, establish_passive, exchange_regions, send_start, teardown,
    };
    use crate::{
        cm::{CmEvent, ConnParams, ConnectionManager},
        Error, Res,
    };

    /// Replays a scripted event sequence and records the calls made.
    struct ScriptedCm {
        events: VecDeque<CmEvent>,
        calls: Vec<&'static str>,
    }

    impl ScriptedCm {
        fn new(events: &[CmEvent]) -> Self {
            Self {
                events: events.iter().copied().collect(),
                calls: Vec::new(),
            }
        }
    }

    impl ConnectionManager for ScriptedCm {
        fn resolve_address(&mut self, _timeout: Duration) -> Res<()> {
            self.calls.push("resolve_address");
            Ok(())
        }

        fn resolve_route(&mut self, _timeout: Duration) -> Res<()> {
            self.calls.push("resolve_route");
            Ok(())
        }

        fn connect(&mut self, _params: &ConnParams) -> Res<()> {
            self.calls.push("connect");
            Ok(())
        }

        fn accept(&mut self, _params: &ConnParams) -> Res<()> {
            self.calls.push("accept");
            Ok(())
        }

        fn disconnect(&mut self) -> Res<()> {
            self.calls.push("disconnect");
            Ok(())
        }

        fn event(&mut self, _timeout: Duration) -> Res<CmEvent> {
            self.events.pop_front().ok_or(Error::Disconnected)
        }
    }

    #[test]
    fn active_happy_path() {
        let mut cm = ScriptedCm::new(&[
            CmEvent::AddressResolved,
            CmEvent::RouteResolved,
            CmEvent::Established,
        ]);
        establish_active(&mut cm, &ConnParams::default()).unwrap();
        assert_eq!(cm.calls, ["resolve_address", "resolve_route", "connect"]);
    }

    #[test]
    fn passive_happy_path() {
        let mut cm = ScriptedCm::new(&[CmEvent::ConnectRequest, CmEvent::Established]);
        establish_passive(&mut cm, &ConnParams::default()).unwrap();
        assert_eq!(cm.calls, ["accept"]);
    }

    #[test]
    fn rejection_is_fatal() {
        let mut cm = ScriptedCm::new(&[
            CmEvent::AddressResolved,
            CmEvent::RouteResolved,
            CmEvent::Rejected,
        ]);
        assert!(matches!(
            establish_active(&mut cm, &ConnParams::default()),
            Err(Error::ConnectionRefused)
        ));
    }

    #[test]
    fn out_of_order_event_is_fatal() {
        let mut cm = ScriptedCm::new(&[CmEvent::Established]);
        assert!(matches!(
            establish_passive(&mut cm, &ConnParams::default()),
            Err(Error::UnexpectedCmEvent(CmEvent::Established))
        ));
    }

    #[test]
    fn missing_resolution_maps_to_resolution_error() {
        let mut cm = ScriptedCm::new(&[CmEvent::AddressResolved, CmEvent::Disconnected]);
        assert!(matches!(
            establish_active(&mut cm, &ConnParams::default()),
            Err(Error::RouteResolution)
        ));
    }

    #[test]
    fn teardown_tolerates_missing_ack() {
        let mut cm = ScriptedCm::new(&[]);
        teardown(&mut cm);
        assert_eq!(cm.calls, ["disconnect"]);
    }

    /// Read from one script, collect writes separately.
    struct Duplex {
        rx: Cursor<Vec<u8>>,
        tx: Vec<u8>,
    }

    impl std::io::Read for Duplex {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.rx.read(buf)
        }
    }

    impl std::io::Write for Duplex {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.tx.write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn region_exchange_writes_before_reading() {
        let local = RegionInfo {
            rkey: 0xabcd_1234,
            addr: 0x1122_3344_5566_7788,
        };
        let mut channel = Duplex {
            rx: Cursor::new(b"000000ff:00000000deadbeef".to_vec()),
            tx: Vec::new(),
        };
        let remote = exchange_regions(&mut channel, local).unwrap();
        assert_eq!(channel.tx, local.encode());
        assert_eq!(
            remote,
            RegionInfo {
                rkey: 0xff,
                addr: 0xdead_beef,
            }
        );
    }

    #[test]
    fn truncated_record_is_fatal() {
        let mut channel = Duplex {
            rx: Cursor::new(b"000000ff:".to_vec()),
            tx: Vec::new(),
        };
        assert!(matches!(
            exchange_regions(&mut channel, RegionInfo { rkey: 0, addr: 0 }),
            Err(Error::ControlChannel)
        ));
    }

    #[test]
    fn signals() {
        let mut channel = Duplex {
            rx: Cursor::new(b"start".to_vec()),
            tx: Vec::new(),
        };
        send_start(&mut channel).unwrap();
        await_start(&mut channel).unwrap();
        assert_eq!(channel.tx, b"start");

        let mut wrong = Duplex {
            rx: Cursor::new(b"stop!".to_vec()),
            tx: Vec::new(),
        };
        assert!(matches!(await_start(&mut wrong), Err(Error::ControlChannel)));
    }
}
