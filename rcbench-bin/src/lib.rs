// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Command line server and client around the benchmark transport.

use std::{
    fmt::{self, Display, Write as _},
    io,
    net::IpAddr,
};

use rcbench_transport::{BenchConfig, BenchResult, OpKind, Pattern, Role, Sampler};

pub mod client;
pub mod server;

#[derive(Debug)]
pub enum Error {
    ArgumentError(&'static str),
    TransportError(rcbench_transport::Error),
    IoError(io::Error),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::IoError(err)
    }
}

impl From<rcbench_transport::Error> for Error {
    fn from(err: rcbench_transport::Error) -> Self {
        Self::TransportError(err)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Error: {self:?}")?;
        Ok(())
    }
}

impl std::error::Error for Error {}

pub type Res<T> = Result<T, Error>;

#[derive(Debug, clap::Args)]
pub struct SharedArgs {
    #[command(flatten)]
    verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

    /// Benchmark pattern to run.
    #[arg(short = 'b', long, default_value = "unidirectional")]
    benchmark: Pattern,

    /// Operation kind: msg, rdma-write or rdma-read.
    #[arg(short = 't', long, default_value = "msg")]
    transport: OpKind,

    /// Size of each transferred buffer in bytes.
    #[arg(short = 's', long, default_value = "1024")]
    size: usize,

    /// Number of operations to perform per direction.
    #[arg(short = 'c', long, default_value = "1000000")]
    count: u64,

    /// Work queue depth.
    #[arg(short = 'q', long, default_value = "100")]
    qsize: u32,

    /// Port of the data connection. The control channel uses the next
    /// port up.
    #[arg(short = 'p', long, default_value = "8888")]
    port: u16,

    /// Print machine readable key=value lines instead of the formatted
    /// report.
    #[arg(long)]
    raw: bool,
}

impl SharedArgs {
    #[must_use]
    fn config(&self, role: Role, bind: Option<IpAddr>, peer: Option<String>) -> BenchConfig {
        BenchConfig {
            role,
            bind,
            peer,
            port: self.port,
            buf_size: self.size,
            count: self.count,
            queue_depth: self.qsize,
            op: self.transport,
            pattern: self.benchmark,
        }
    }

    fn log_level_filter(&self) -> log::LevelFilter {
        self.verbose.log_level_filter()
    }
}

const NS_PER_SEC: f64 = 1e9;

#[allow(clippy::cast_precision_loss)]
fn throughput_block(label: &str, ns: u64, count: u64, size: usize) -> String {
    let secs = ns as f64 / NS_PER_SEC;
    let bytes = count as f64 * size as f64;
    let mut out = String::new();
    let _ = writeln!(out, "{label} results:");
    let _ = writeln!(out, "  total time:     {secs:.3} s");
    let _ = writeln!(out, "  operations:     {count}");
    let _ = writeln!(out, "  data volume:    {:.3} MiB", bytes / f64::from(1 << 20));
    let _ = writeln!(
        out,
        "  operation rate: {:.3} kOps/s",
        count as f64 / secs / 1e3
    );
    let _ = writeln!(
        out,
        "  throughput:     {:.3} MiB/s ({:.3} MB/s)",
        bytes / secs / f64::from(1 << 20),
        bytes / secs / 1e6
    );
    out
}

#[allow(clippy::cast_precision_loss)]
fn latency_block(samples: &mut Sampler) -> String {
    samples.sort_ascending();
    let us = |ns: u64| ns as f64 / 1e3;
    let mut out = String::new();
    let _ = writeln!(out, "latency results:");
    if let (Some(avg), Some(min), Some(max)) = (samples.avg(), samples.min(), samples.max()) {
        let _ = writeln!(out, "  average:        {:.3} us", avg / 1e3);
        let _ = writeln!(out, "  minimum:        {:.3} us", us(min));
        let _ = writeln!(out, "  maximum:        {:.3} us", us(max));
    }
    for (label, p) in [
        ("50.0th", 0.5),
        ("95.0th", 0.95),
        ("99.0th", 0.99),
        ("99.9th", 0.999),
        ("99.99th", 0.9999),
    ] {
        if let Some(ns) = samples.percentile(p) {
            let _ = writeln!(out, "  {label} percentile: {:.3} us", us(ns));
        }
    }
    out
}

/// Render the run as `key=value` lines, for scripts collecting results
/// across many runs.
#[must_use]
pub fn report_raw(cfg: &BenchConfig, mut result: BenchResult) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "pattern={}", cfg.pattern);
    let _ = writeln!(out, "op={}", cfg.op);
    let _ = writeln!(out, "size={}", cfg.buf_size);
    let _ = writeln!(out, "count={}", cfg.count);
    let _ = writeln!(out, "send_ns={}", result.send_ns);
    let _ = writeln!(out, "recv_ns={}", result.recv_ns);
    if let Some(samples) = result.samples.as_mut() {
        samples.sort_ascending();
        if let (Some(min), Some(max)) = (samples.min(), samples.max()) {
            let _ = writeln!(out, "latency_min_ns={min}");
            let _ = writeln!(out, "latency_max_ns={max}");
        }
        for (label, p) in [("50", 0.5), ("95", 0.95), ("99", 0.99), ("999", 0.999), ("9999", 0.9999)] {
            if let Some(ns) = samples.percentile(p) {
                let _ = writeln!(out, "latency_p{label}_ns={ns}");
            }
        }
    }
    out
}

/// Render everything this side of the run measured.
#[must_use]
pub fn report(cfg: &BenchConfig, mut result: BenchResult) -> String {
    let mut out = String::new();
    if result.send_ns > 0 {
        out.push_str(&throughput_block("send", result.send_ns, cfg.count, cfg.buf_size));
    }
    if result.recv_ns > 0 {
        out.push_str(&throughput_block("receive", result.recv_ns, cfg.count, cfg.buf_size));
    }
    if let Some(samples) = result.samples.as_mut() {
        if !samples.is_empty() {
            out.push_str(&latency_block(samples));
        }
    }
    if out.is_empty() {
        out.push_str("no measurements on this side; see the peer's output\n");
    }
    out
}
