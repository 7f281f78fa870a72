// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! End-to-end runs of every pattern over a local socket pair.

use std::{net::TcpListener, sync::mpsc, thread, time::Duration};

use rcbench_common::RegionInfo;
use rcbench_transport::{
    run::{run, BenchResult},
    stream::Connection,
    BenchConfig, Error, OpKind, Pattern, Res, Role,
};

/// Find a data/control port pair that is currently free.
fn free_port_pair() -> u16 {
    loop {
        let a = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = a.local_addr().unwrap().port();
        if port == u16::MAX {
            continue;
        }
        if TcpListener::bind(("127.0.0.1", port + 1)).is_ok() {
            return port;
        }
    }
}

fn config(pattern: Pattern, op: OpKind) -> BenchConfig {
    BenchConfig {
        role: Role::Server,
        bind: None,
        peer: None,
        port: 0,
        buf_size: 64,
        count: 100,
        queue_depth: 8,
        op,
        pattern,
    }
}

fn client_of(server: &BenchConfig) -> BenchConfig {
    BenchConfig {
        role: Role::Client,
        peer: Some("127.0.0.1".to_owned()),
        ..server.clone()
    }
}

fn establish_with_retry(cfg: &BenchConfig) -> Res<Connection> {
    for _ in 0..50 {
        match Connection::establish(cfg) {
            Ok(conn) => return Ok(conn),
            Err(Error::ConnectionRefused) => thread::sleep(Duration::from_millis(20)),
            Err(e) => return Err(e),
        }
    }
    Err(Error::ConnectionRefused)
}

/// Run both roles to completion and return (server, client) results
/// along with the client's final receive buffer.
fn run_pair(mut server_cfg: BenchConfig) -> (BenchResult, BenchResult, Vec<u8>) {
    server_cfg.port = free_port_pair();
    let client_cfg = client_of(&server_cfg);
    let server = thread::spawn(move || {
        let mut conn = Connection::establish(&server_cfg).unwrap();
        let result = run(&mut conn, &server_cfg).unwrap();
        conn.close();
        result
    });
    let mut conn = establish_with_retry(&client_cfg).unwrap();
    let client_result = run(&mut conn, &client_cfg).unwrap();
    let received = conn.recv_contents();
    conn.close();
    let server_result = server.join().unwrap();
    (server_result, client_result, received)
}

fn fill_pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| b'a' + (i % 26) as u8).collect()
}

#[test]
fn unidirectional_msg() {
    let cfg = config(Pattern::Unidirectional, OpKind::Msg);
    let buf_size = cfg.buf_size;
    let (server, client, received) = run_pair(cfg);
    assert!(server.send_ns > 0);
    assert!(client.recv_ns > 0);
    assert!(server.samples.is_none());
    assert_eq!(received, fill_pattern(buf_size));
}

#[test]
fn unidirectional_msg_zero_operations() {
    let mut cfg = config(Pattern::Unidirectional, OpKind::Msg);
    cfg.count = 0;
    let (_, _, received) = run_pair(cfg);
    assert_eq!(received, vec![0; 64]);
}

#[test]
fn unidirectional_msg_shallow_queue() {
    // Queue depth below the preferred chunk size still completes.
    let mut cfg = config(Pattern::Unidirectional, OpKind::Msg);
    cfg.queue_depth = 4;
    cfg.count = 50;
    let (server, client, _) = run_pair(cfg);
    assert!(server.send_ns > 0);
    assert!(client.recv_ns > 0);
}

#[test]
fn bidirectional_msg() {
    let cfg = config(Pattern::Bidirectional, OpKind::Msg);
    let (server, client, _) = run_pair(cfg);
    assert!(server.send_ns > 0 && server.recv_ns > 0);
    assert!(client.send_ns > 0 && client.recv_ns > 0);
}

#[test]
fn unidirectional_rdma_write() {
    let cfg = config(Pattern::Unidirectional, OpKind::RdmaWrite);
    let buf_size = cfg.buf_size;
    let (server, client, received) = run_pair(cfg);
    assert!(server.send_ns > 0);
    // The client times until the close signal arrives.
    assert!(client.recv_ns > 0);
    assert_eq!(received, fill_pattern(buf_size));
}

#[test]
fn unidirectional_rdma_read() {
    let cfg = config(Pattern::Unidirectional, OpKind::RdmaRead);
    let (server, client, _) = run_pair(cfg);
    assert!(server.send_ns > 0);
    assert!(client.recv_ns > 0);
}

#[test]
fn bidirectional_rdma_write() {
    let cfg = config(Pattern::Bidirectional, OpKind::RdmaWrite);
    let (server, client, _) = run_pair(cfg);
    assert!(server.send_ns > 0 && server.recv_ns > 0);
    assert!(client.send_ns > 0 && client.recv_ns > 0);
}

#[test]
fn bidirectional_rdma_write_outsizes_socket_buffers() {
    // Outstanding bytes per direction far exceed what the kernel will
    // buffer, so progress depends on acks still flowing while both
    // sides are writing.
    let mut server_cfg = config(Pattern::Bidirectional, OpKind::RdmaWrite);
    server_cfg.buf_size = 1 << 20;
    server_cfg.queue_depth = 16;
    server_cfg.count = 64;
    server_cfg.port = free_port_pair();
    let client_cfg = client_of(&server_cfg);
    let (done_tx, done_rx) = mpsc::channel();
    let server_done = done_tx.clone();
    let server = thread::spawn(move || {
        let mut conn = Connection::establish(&server_cfg).unwrap();
        let result = run(&mut conn, &server_cfg);
        conn.close();
        let _ = server_done.send(());
        result
    });
    let client = thread::spawn(move || {
        let mut conn = establish_with_retry(&client_cfg).unwrap();
        let result = run(&mut conn, &client_cfg);
        conn.close();
        let _ = done_tx.send(());
        result
    });
    for _ in 0..2 {
        done_rx
            .recv_timeout(Duration::from_secs(60))
            .expect("bidirectional run stalled");
    }
    assert!(server.join().unwrap().is_ok());
    assert!(client.join().unwrap().is_ok());
}

#[test]
fn ping_pong_samples_round_trips() {
    let mut cfg = config(Pattern::PingPong, OpKind::Msg);
    cfg.count = 50;
    let (server, client, _) = run_pair(cfg);
    let mut samples = server.samples.expect("server samples round trips");
    assert_eq!(samples.len(), 50);
    samples.sort_ascending();
    let p50 = samples.percentile(0.5).unwrap();
    let p999 = samples.percentile(0.999).unwrap();
    assert!(p50 <= p999);
    assert!(client.samples.is_none());
}

#[test]
fn latency_rdma_write_samples_every_operation() {
    let mut cfg = config(Pattern::Latency, OpKind::RdmaWrite);
    cfg.count = 50;
    let (server, _, _) = run_pair(cfg);
    let samples = server.samples.expect("server samples operations");
    assert_eq!(samples.len(), 50);
}

#[test]
fn stale_remote_key_fails_the_run() {
    let mut server_cfg = config(Pattern::Unidirectional, OpKind::RdmaWrite);
    server_cfg.port = free_port_pair();
    let client_cfg = client_of(&server_cfg);
    let client = thread::spawn(move || {
        let mut conn = establish_with_retry(&client_cfg).unwrap();
        let res = run(&mut conn, &client_cfg);
        conn.close();
        res
    });
    let mut conn = Connection::establish(&server_cfg).unwrap();
    // Poison the peer's advertised region before running.
    conn.set_remote_region(RegionInfo {
        rkey: 0xdead_beef,
        addr: 0,
    });
    let res = run(&mut conn, &server_cfg);
    assert!(matches!(
        res,
        Err(Error::WorkCompletion(
            rcbench_transport::CompletionStatus::RemoteAccess
        ))
    ));
    conn.close();
    // The close signal never arrives, so the client fails too.
    assert!(client.join().unwrap().is_err());
}
