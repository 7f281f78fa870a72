// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Run orchestration. Each transfer direction runs on its own thread
//! with exclusive ownership of its queue half; the only shared state is
//! the cancellation token.

use std::{
    net::TcpStream,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Instant,
};

use rcbench_common::qinfo;

use crate::{
    config::{BenchConfig, OpKind, Pattern, Role},
    handshake, pipeline,
    sampler::Sampler,
    stream::{Connection, StreamRx, StreamTx},
    Error, Res,
};

/// Cooperative cancellation, shared between the direction threads. A
/// failing direction cancels the other so the process exits instead of
/// spinning on a dead connection.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// What a finished run measured. Durations are per direction; samples
/// are only taken by patterns that time individual operations.
#[derive(Debug, Default)]
pub struct BenchResult {
    /// Wall time of the operation-performing direction, in nanoseconds.
    pub send_ns: u64,
    /// Wall time of the measuring direction, in nanoseconds.
    pub recv_ns: u64,
    pub samples: Option<Sampler>,
}

/// Perform the configured run over an established connection.
pub fn run(conn: &mut Connection, cfg: &BenchConfig) -> Res<BenchResult> {
    let cancel = CancelToken::default();
    let (mut tx, mut rx) = conn.split()?;
    qinfo!(
        "running {} {} with {} operations of {} bytes",
        cfg.pattern,
        cfg.op,
        cfg.count,
        cfg.buf_size
    );
    match (cfg.pattern, cfg.role) {
        (Pattern::Unidirectional, Role::Server) => {
            let send_ns = active_side(&mut tx, conn.control()?, cfg, &cancel, None)?;
            Ok(BenchResult {
                send_ns,
                ..Default::default()
            })
        }
        (Pattern::Unidirectional, Role::Client) => {
            let recv_ns = passive_side(&mut rx, conn.control()?, cfg, &cancel)?;
            Ok(BenchResult {
                recv_ns,
                ..Default::default()
            })
        }
        (Pattern::Bidirectional, _) => {
            let tx_control = conn.control()?;
            let rx_control = conn.control()?;
            let (send_res, recv_res) = thread::scope(|s| {
                let tx_cancel = cancel.clone();
                let sender = s.spawn(move || {
                    let res = active_side(&mut tx, tx_control, cfg, &tx_cancel, None);
                    if res.is_err() {
                        tx_cancel.cancel();
                    }
                    res
                });
                let recv_res = passive_side(&mut rx, rx_control, cfg, &cancel);
                if recv_res.is_err() {
                    cancel.cancel();
                }
                (sender.join().unwrap_or(Err(Error::Cancelled)), recv_res)
            });
            Ok(BenchResult {
                send_ns: send_res?,
                recv_ns: recv_res?,
                samples: None,
            })
        }
        (Pattern::PingPong, Role::Server) => {
            let mut sampler = sampler_for(cfg)?;
            let begin = Instant::now();
            pipeline::ping(&mut tx, &mut rx, cfg.count, &cancel, &mut sampler)?;
            Ok(BenchResult {
                send_ns: elapsed_ns(begin),
                recv_ns: 0,
                samples: Some(sampler),
            })
        }
        (Pattern::PingPong, Role::Client) => {
            let begin = Instant::now();
            pipeline::pong(&mut tx, &mut rx, cfg.count, &cancel)?;
            Ok(BenchResult {
                send_ns: elapsed_ns(begin),
                ..Default::default()
            })
        }
        (Pattern::Latency, Role::Server) => {
            let mut sampler = sampler_for(cfg)?;
            let send_ns = active_side(&mut tx, conn.control()?, cfg, &cancel, Some(&mut sampler))?;
            Ok(BenchResult {
                send_ns,
                recv_ns: 0,
                samples: Some(sampler),
            })
        }
        (Pattern::Latency, Role::Client) => {
            let recv_ns = passive_side(&mut rx, conn.control()?, cfg, &cancel)?;
            Ok(BenchResult {
                recv_ns,
                ..Default::default()
            })
        }
    }
}

fn sampler_for(cfg: &BenchConfig) -> Res<Sampler> {
    let capacity =
        usize::try_from(cfg.count).map_err(|_| Error::InvalidConfig("operation count too large"))?;
    Ok(Sampler::with_capacity(capacity))
}

fn elapsed_ns(begin: Instant) -> u64 {
    u64::try_from(begin.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

/// The direction that performs the operations. For two-sided runs it
/// waits until the peer is counting; for one-sided runs it announces
/// completion instead, since the peer sees no completions of its own.
fn active_side(
    tx: &mut StreamTx,
    mut control: TcpStream,
    cfg: &BenchConfig,
    cancel: &CancelToken,
    sampler: Option<&mut Sampler>,
) -> Res<u64> {
    if cfg.op == OpKind::Msg {
        handshake::await_start(&mut control)?;
    }
    let begin = Instant::now();
    match cfg.pattern {
        Pattern::Latency => pipeline::run_single(tx, cfg.count, cancel, sampler)?,
        _ => pipeline::run_pipelined(tx, cfg.count, 0, cancel)?,
    }
    let ns = elapsed_ns(begin);
    if cfg.op.is_one_sided() {
        handshake::send_close(&mut control)?;
    }
    Ok(ns)
}

/// The measuring direction. Two-sided runs count receive completions;
/// one-sided runs have nothing to count and wait for the close signal.
fn passive_side(
    rx: &mut StreamRx,
    mut control: TcpStream,
    cfg: &BenchConfig,
    cancel: &CancelToken,
) -> Res<u64> {
    if cfg.op == OpKind::Msg {
        let prefilled = pipeline::prefill(rx, cfg.count)?;
        handshake::send_start(&mut control)?;
        let begin = Instant::now();
        pipeline::run_pipelined(rx, cfg.count, prefilled, cancel)?;
        Ok(elapsed_ns(begin))
    } else {
        let begin = Instant::now();
        handshake::await_close(&mut control)?;
        Ok(elapsed_ns(begin))
    }
}

#[cfg(test)]
mod tests {
    use super::CancelToken;

    #[test]
    fn cancellation_is_shared() {
        let token = CancelToken::default();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
