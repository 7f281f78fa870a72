// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The socket binding. It carries the benchmark's queue-pair semantics
//! over a TCP stream: posted receives gate incoming messages the way a
//! receive queue does, and one-sided operations address the peer's
//! registered buffer by remote key and address.
//!
//! Frames on the data stream:
//!
//! | kind | fields                                   |
//! |------|------------------------------------------|
//! | 1    | send: `len`, payload                     |
//! | 2    | write: `rkey`, `addr`, `len`, payload    |
//! | 3    | read request: `rkey`, `addr`, `len`      |
//! | 4    | read response: `status`, `len`, payload  |
//! | 5    | write ack: `status`                      |
//!
//! All integers are big endian. Writes and reads are acknowledged by
//! the peer so that a stale key or out-of-bounds address surfaces as a
//! failed completion at the initiator, like it would on a real fabric.
//!
//! A single writer thread per connection owns all outgoing frames. The
//! reader thread hands its replies to that writer instead of writing
//! them itself; a reader blocked inside a socket write while both
//! sides' buffers are full would deadlock a bidirectional run.

use std::{
    collections::VecDeque,
    io::{ErrorKind, Read, Write},
    net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use rcbench_common::{qdebug, qtrace, qwarn, RegionInfo};

use crate::{
    cm::{CmEvent, ConnParams, ConnectionManager, RESOLUTION_TIMEOUT},
    config::{BenchConfig, OpKind, Role},
    ep::{Completion, CompletionStatus, Endpoint, Opcode, SlotPool, WorkQueue},
    handshake, Error, Res,
};

const FRAME_SEND: u8 = 1;
const FRAME_WRITE: u8 = 2;
const FRAME_READ_REQ: u8 = 3;
const FRAME_READ_RESP: u8 = 4;
const FRAME_WRITE_ACK: u8 = 5;

const STATUS_OK: u8 = 0;

/// How long blocked waiters sleep before rechecking for shutdown.
const CREDIT_WAIT: Duration = Duration::from_millis(100);

static NEXT_RKEY: AtomicU32 = AtomicU32::new(1);

/// A registered transfer buffer. The address handed to the peer is the
/// buffer's real location, so offsets on incoming one-sided operations
/// can be validated against it.
struct Region {
    mem: Mutex<Box<[u8]>>,
    rkey: u32,
    addr: u64,
}

impl Region {
    fn register(len: usize, fill: bool) -> Res<Self> {
        if len == 0 {
            return Err(Error::Registration);
        }
        let mem: Box<[u8]> = if fill {
            (0..len).map(|i| b'a' + (i % 26) as u8).collect()
        } else {
            vec![0; len].into_boxed_slice()
        };
        let addr = mem.as_ptr() as u64;
        let rkey = NEXT_RKEY.fetch_add(1, Ordering::Relaxed);
        qtrace!("registered region {:08x}:{:016x} len {}", rkey, addr, len);
        Ok(Self {
            mem: Mutex::new(mem),
            rkey,
            addr,
        })
    }

    fn info(&self) -> RegionInfo {
        RegionInfo {
            rkey: self.rkey,
            addr: self.addr,
        }
    }

    fn len(&self) -> usize {
        lock(&self.mem).len()
    }

    /// Offset of `[addr, addr + len)` in this region, if covered and the
    /// key matches.
    fn offset_of(&self, rkey: u32, addr: u64, len: usize) -> Option<usize> {
        if rkey != self.rkey {
            return None;
        }
        let offset = usize::try_from(addr.checked_sub(self.addr)?).ok()?;
        (offset.checked_add(len)? <= self.len()).then_some(offset)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the two queue halves, the reader thread and
/// the writer thread.
struct Shared {
    depth: u32,
    /// Source of outgoing payloads, destination of read responses.
    send_region: Region,
    /// Destination of incoming sends and peer writes, source of peer
    /// reads. This is the region advertised during the handshake.
    recv_region: Region,
    /// Posted, unconsumed receives.
    credits: Mutex<u32>,
    credits_cv: Condvar,
    send_cq: Mutex<VecDeque<Completion>>,
    recv_cq: Mutex<VecDeque<Completion>>,
    outbox: Mutex<Outbox>,
    outbox_cv: Condvar,
    shutdown: AtomicBool,
}

/// Frames waiting for the writer thread.
#[derive(Default)]
struct Outbox {
    frames: VecDeque<OutFrame>,
    /// Batches queued or currently on the writer's stack. Held to at
    /// most one so submission keeps pace with the socket instead of
    /// racing ahead into memory.
    batches_in_flight: u32,
    /// Set when the writer thread dies on a socket error.
    failed: bool,
}

struct OutFrame {
    batch: bool,
    bytes: Vec<u8>,
}

impl Shared {
    fn push_completion(&self, dir: &Mutex<VecDeque<Completion>>, id: u64, status: CompletionStatus) {
        lock(dir).push_back(Completion { id, status });
    }

    /// Fail both queues so any poller aborts the run.
    fn flush(&self) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }
        self.push_completion(&self.send_cq, 0, CompletionStatus::Flushed);
        self.push_completion(&self.recv_cq, 0, CompletionStatus::Flushed);
        self.credits_cv.notify_all();
    }

    /// Queue a batch of operations. Blocks until the previous batch is
    /// on the wire.
    fn enqueue_batch(&self, bytes: Vec<u8>) -> Res<()> {
        let mut outbox = lock(&self.outbox);
        loop {
            if outbox.failed || self.shutdown.load(Ordering::SeqCst) {
                return Err(Error::Disconnected);
            }
            if outbox.batches_in_flight == 0 {
                break;
            }
            let (guard, _) = self
                .outbox_cv
                .wait_timeout(outbox, CREDIT_WAIT)
                .map_err(|_| Error::Disconnected)?;
            outbox = guard;
        }
        outbox.batches_in_flight += 1;
        outbox.frames.push_back(OutFrame { batch: true, bytes });
        drop(outbox);
        self.outbox_cv.notify_all();
        Ok(())
    }

    /// Queue a reply from the reader thread. Must never block: the
    /// reader has to keep draining the socket while the peer writes.
    fn enqueue_reply(&self, bytes: Vec<u8>) {
        lock(&self.outbox)
            .frames
            .push_back(OutFrame { batch: false, bytes });
        self.outbox_cv.notify_all();
    }
}

/// Owns every write to the data stream. On shutdown it drains whatever
/// is still queued before exiting so the peer sees all acknowledged
/// operations.
fn writer_loop(mut stream: TcpStream, shared: &Shared) {
    loop {
        let frame = {
            let mut outbox = lock(&shared.outbox);
            loop {
                if let Some(frame) = outbox.frames.pop_front() {
                    break frame;
                }
                if shared.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                let Ok((guard, _)) = shared.outbox_cv.wait_timeout(outbox, CREDIT_WAIT) else {
                    return;
                };
                outbox = guard;
            }
        };
        let res = stream.write_all(&frame.bytes);
        if frame.batch {
            lock(&shared.outbox).batches_in_flight -= 1;
            shared.outbox_cv.notify_all();
        }
        if let Err(e) = res {
            if !shared.shutdown.load(Ordering::SeqCst) {
                qwarn!("data stream failed: {}", e);
            }
            lock(&shared.outbox).failed = true;
            shared.outbox_cv.notify_all();
            shared.flush();
            return;
        }
    }
}

/// The send side of an established socket endpoint.
pub struct StreamTx {
    shared: Arc<Shared>,
    opcode: Opcode,
    remote: Option<RegionInfo>,
    pool: SlotPool,
    pending: u32,
}

impl StreamTx {
    fn encode_batch(&mut self, count: u32) -> Res<Vec<u8>> {
        let Some(remote) = self.remote.or_else(|| {
            (self.opcode == Opcode::Send).then_some(RegionInfo { rkey: 0, addr: 0 })
        }) else {
            return Err(Error::RemoteRegionUnknown);
        };
        let payload = lock(&self.shared.send_region.mem);
        #[allow(clippy::cast_possible_truncation)]
        let len = payload.len() as u32;
        let mut frame = Vec::with_capacity(count as usize * (17 + payload.len()));
        for _slot in self.pool.chunk(count) {
            match self.opcode {
                Opcode::Send => {
                    frame.push(FRAME_SEND);
                    frame.extend_from_slice(&len.to_be_bytes());
                    frame.extend_from_slice(&payload);
                }
                Opcode::RdmaWrite => {
                    frame.push(FRAME_WRITE);
                    frame.extend_from_slice(&remote.rkey.to_be_bytes());
                    frame.extend_from_slice(&remote.addr.to_be_bytes());
                    frame.extend_from_slice(&len.to_be_bytes());
                    frame.extend_from_slice(&payload);
                }
                Opcode::RdmaRead => {
                    frame.push(FRAME_READ_REQ);
                    frame.extend_from_slice(&remote.rkey.to_be_bytes());
                    frame.extend_from_slice(&remote.addr.to_be_bytes());
                    frame.extend_from_slice(&len.to_be_bytes());
                }
                Opcode::Recv => {
                    return Err(Error::InvalidConfig(
                        "receives are posted on the receive queue",
                    ))
                }
            }
        }
        Ok(frame)
    }
}

impl WorkQueue for StreamTx {
    fn depth(&self) -> u32 {
        self.shared.depth
    }

    fn submit(&mut self, count: u32) -> Res<()> {
        if self.pending + count > self.shared.depth {
            return Err(Error::QueueCapacity);
        }
        let frame = self.encode_batch(count)?;
        self.shared.enqueue_batch(frame)?;
        if self.opcode == Opcode::Send {
            // Two-sided sends complete once handed to the transport.
            // One-sided operations complete when the peer acknowledges.
            for slot in self.pool.chunk(count) {
                self.shared
                    .push_completion(&self.shared.send_cq, slot.id, CompletionStatus::Success);
            }
        }
        self.pending += count;
        Ok(())
    }

    fn poll(&mut self) -> Res<usize> {
        let mut done = 0;
        loop {
            let Some(c) = lock(&self.shared.send_cq).pop_front() else {
                break;
            };
            if c.status != CompletionStatus::Success {
                return Err(Error::WorkCompletion(c.status));
            }
            done += 1;
            self.pending -= 1;
            if self.pending == 0 {
                break;
            }
        }
        Ok(done)
    }
}

/// The receive side of an established socket endpoint.
pub struct StreamRx {
    shared: Arc<Shared>,
    pending: u32,
}

impl WorkQueue for StreamRx {
    fn depth(&self) -> u32 {
        self.shared.depth
    }

    fn submit(&mut self, count: u32) -> Res<()> {
        if self.pending + count > self.shared.depth {
            return Err(Error::QueueCapacity);
        }
        *lock(&self.shared.credits) += count;
        self.shared.credits_cv.notify_all();
        self.pending += count;
        Ok(())
    }

    fn poll(&mut self) -> Res<usize> {
        let mut done = 0;
        loop {
            let Some(c) = lock(&self.shared.recv_cq).pop_front() else {
                break;
            };
            if c.status != CompletionStatus::Success {
                return Err(Error::WorkCompletion(c.status));
            }
            done += 1;
            self.pending -= 1;
            if self.pending == 0 {
                break;
            }
        }
        Ok(done)
    }
}

/// An established socket endpoint, splittable into its two directions.
pub struct StreamEndpoint {
    tx: StreamTx,
    rx: StreamRx,
}

impl StreamEndpoint {
    fn new(shared: Arc<Shared>, op: OpKind) -> Self {
        let opcode = match op {
            OpKind::Msg => Opcode::Send,
            OpKind::RdmaWrite => Opcode::RdmaWrite,
            OpKind::RdmaRead => Opcode::RdmaRead,
        };
        #[allow(clippy::cast_possible_truncation)]
        let len = shared.send_region.len() as u32;
        let tx = StreamTx {
            shared: Arc::clone(&shared),
            opcode,
            remote: None,
            pool: SlotPool::new(shared.depth, opcode, len),
            pending: 0,
        };
        let rx = StreamRx { shared, pending: 0 };
        Self { tx, rx }
    }
}

impl Endpoint for StreamEndpoint {
    type Tx = StreamTx;
    type Rx = StreamRx;

    fn local_region(&self) -> RegionInfo {
        self.rx.shared.recv_region.info()
    }

    fn set_remote_region(&mut self, region: RegionInfo) {
        self.tx.remote = Some(region);
    }

    fn split(self) -> (StreamTx, StreamRx) {
        (self.tx, self.rx)
    }
}

/// Applies incoming frames to the local regions and completion queues.
fn reader_loop(mut stream: TcpStream, shared: &Shared) {
    let mut recv_seq = 0;
    let mut send_seq = 0;
    loop {
        let mut kind = [0];
        match stream.read_exact(&mut kind) {
            Ok(()) => {}
            Err(e) => {
                if !shared.shutdown.load(Ordering::SeqCst)
                    && e.kind() != ErrorKind::UnexpectedEof
                {
                    qwarn!("data stream failed: {}", e);
                }
                shared.flush();
                return;
            }
        }
        let res = match kind[0] {
            FRAME_SEND => handle_send(&mut stream, shared, &mut recv_seq),
            FRAME_WRITE => handle_write(&mut stream, shared),
            FRAME_READ_REQ => handle_read_req(&mut stream, shared),
            FRAME_READ_RESP => handle_read_resp(&mut stream, shared, &mut send_seq),
            FRAME_WRITE_ACK => handle_write_ack(&mut stream, shared, &mut send_seq),
            _ => Err(Error::ControlChannel),
        };
        if let Err(e) = res {
            if !shared.shutdown.load(Ordering::SeqCst) {
                qwarn!("data stream failed: {}", e);
            }
            shared.flush();
            return;
        }
    }
}

fn read_u32(stream: &mut TcpStream) -> Res<u32> {
    let mut buf = [0; 4];
    stream.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_u64(stream: &mut TcpStream) -> Res<u64> {
    let mut buf = [0; 8];
    stream.read_exact(&mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

/// Block until a receive is posted, honoring shutdown.
fn take_credit(shared: &Shared) -> Res<()> {
    let mut credits = lock(&shared.credits);
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        if *credits > 0 {
            *credits -= 1;
            return Ok(());
        }
        let (guard, _) = shared
            .credits_cv
            .wait_timeout(credits, CREDIT_WAIT)
            .map_err(|_| Error::Disconnected)?;
        credits = guard;
    }
}

fn handle_send(stream: &mut TcpStream, shared: &Shared, seq: &mut u64) -> Res<()> {
    let len = read_u32(stream)? as usize;
    take_credit(shared)?;
    {
        let mut mem = lock(&shared.recv_region.mem);
        if len > mem.len() {
            return Err(Error::QueueCapacity);
        }
        stream.read_exact(&mut mem[..len])?;
    }
    shared.push_completion(&shared.recv_cq, *seq, CompletionStatus::Success);
    *seq += 1;
    Ok(())
}

fn handle_write(stream: &mut TcpStream, shared: &Shared) -> Res<()> {
    let rkey = read_u32(stream)?;
    let addr = read_u64(stream)?;
    let len = read_u32(stream)? as usize;
    let status = match shared.recv_region.offset_of(rkey, addr, len) {
        Some(offset) => {
            let mut mem = lock(&shared.recv_region.mem);
            stream.read_exact(&mut mem[offset..offset + len])?;
            STATUS_OK
        }
        None => {
            qwarn!("rejecting write to {:08x}:{:016x}", rkey, addr);
            // Drain the payload so the stream stays aligned.
            std::io::copy(&mut stream.take(len as u64), &mut std::io::sink())?;
            1
        }
    };
    shared.enqueue_reply(vec![FRAME_WRITE_ACK, status]);
    Ok(())
}

fn handle_read_req(stream: &mut TcpStream, shared: &Shared) -> Res<()> {
    let rkey = read_u32(stream)?;
    let addr = read_u64(stream)?;
    let len = read_u32(stream)? as usize;
    let mut resp = Vec::with_capacity(6 + len);
    match shared.recv_region.offset_of(rkey, addr, len) {
        Some(offset) => {
            resp.push(FRAME_READ_RESP);
            resp.push(STATUS_OK);
            #[allow(clippy::cast_possible_truncation)]
            resp.extend_from_slice(&(len as u32).to_be_bytes());
            let mem = lock(&shared.recv_region.mem);
            resp.extend_from_slice(&mem[offset..offset + len]);
        }
        None => {
            qwarn!("rejecting read of {:08x}:{:016x}", rkey, addr);
            resp.push(FRAME_READ_RESP);
            resp.push(1);
            resp.extend_from_slice(&0u32.to_be_bytes());
        }
    }
    shared.enqueue_reply(resp);
    Ok(())
}

fn handle_read_resp(stream: &mut TcpStream, shared: &Shared, seq: &mut u64) -> Res<()> {
    let status = {
        let mut buf = [0];
        stream.read_exact(&mut buf)?;
        buf[0]
    };
    let len = read_u32(stream)? as usize;
    if len > 0 {
        let mut mem = lock(&shared.send_region.mem);
        if len > mem.len() {
            return Err(Error::QueueCapacity);
        }
        stream.read_exact(&mut mem[..len])?;
    }
    let status = if status == STATUS_OK {
        CompletionStatus::Success
    } else {
        CompletionStatus::RemoteAccess
    };
    shared.push_completion(&shared.send_cq, *seq, status);
    *seq += 1;
    Ok(())
}

fn handle_write_ack(stream: &mut TcpStream, shared: &Shared, seq: &mut u64) -> Res<()> {
    let mut buf = [0];
    stream.read_exact(&mut buf)?;
    let status = if buf[0] == STATUS_OK {
        CompletionStatus::Success
    } else {
        CompletionStatus::RemoteAccess
    };
    shared.push_completion(&shared.send_cq, *seq, status);
    *seq += 1;
    Ok(())
}

/// Connection life cycle over plain sockets.
pub struct StreamCm {
    peer: Option<(String, u16)>,
    resolved: Option<SocketAddr>,
    listener: Option<TcpListener>,
    stream: Option<TcpStream>,
    queue: VecDeque<CmEvent>,
}

impl StreamCm {
    #[must_use]
    pub fn client(host: &str, port: u16) -> Self {
        Self {
            peer: Some((host.to_owned(), port)),
            resolved: None,
            listener: None,
            stream: None,
            queue: VecDeque::new(),
        }
    }

    pub fn server(bind: Option<IpAddr>, port: u16) -> Res<Self> {
        let addr = SocketAddr::new(bind.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)), port);
        let listener = TcpListener::bind(addr)?;
        qdebug!("listening on {}", addr);
        Ok(Self {
            peer: None,
            resolved: None,
            listener: Some(listener),
            stream: None,
            queue: VecDeque::new(),
        })
    }

    fn take_stream(&mut self) -> Option<TcpStream> {
        self.stream.take()
    }

    fn accept_within(&mut self, timeout: Duration) -> Res<CmEvent> {
        let (stream, peer) = {
            let Some(listener) = self.listener.as_ref() else {
                return Err(Error::UnexpectedCmEvent(CmEvent::Disconnected));
            };
            listener.set_nonblocking(true)?;
            let deadline = Instant::now() + timeout;
            loop {
                match listener.accept() {
                    Ok(accepted) => {
                        listener.set_nonblocking(false)?;
                        break accepted;
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        if Instant::now() >= deadline {
                            return Err(Error::IoError(ErrorKind::TimedOut.into()));
                        }
                        thread::sleep(Duration::from_millis(1));
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        qdebug!("connect request from {}", peer);
        self.stream = Some(stream);
        Ok(CmEvent::ConnectRequest)
    }
}

impl ConnectionManager for StreamCm {
    fn resolve_address(&mut self, _timeout: Duration) -> Res<()> {
        let Some((host, port)) = self.peer.clone() else {
            return Err(Error::AddressResolution);
        };
        let addr = (host.as_str(), port)
            .to_socket_addrs()
            .map_err(|_| Error::AddressResolution)?
            .next()
            .ok_or(Error::AddressResolution)?;
        qdebug!("resolved {} to {}", host, addr);
        self.resolved = Some(addr);
        self.queue.push_back(CmEvent::AddressResolved);
        Ok(())
    }

    fn resolve_route(&mut self, _timeout: Duration) -> Res<()> {
        if self.resolved.is_none() {
            return Err(Error::RouteResolution);
        }
        self.queue.push_back(CmEvent::RouteResolved);
        Ok(())
    }

    fn connect(&mut self, _params: &ConnParams) -> Res<()> {
        let addr = self.resolved.ok_or(Error::RouteResolution)?;
        match TcpStream::connect_timeout(&addr, RESOLUTION_TIMEOUT) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                self.stream = Some(stream);
                self.queue.push_back(CmEvent::Established);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                self.queue.push_back(CmEvent::Rejected);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn accept(&mut self, _params: &ConnParams) -> Res<()> {
        if self.stream.is_none() {
            return Err(Error::UnexpectedCmEvent(CmEvent::ConnectRequest));
        }
        self.queue.push_back(CmEvent::Established);
        Ok(())
    }

    fn disconnect(&mut self) -> Res<()> {
        if let Some(stream) = &self.stream {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                qtrace!("data stream shutdown: {}", e);
            }
        }
        self.queue.push_back(CmEvent::Disconnected);
        Ok(())
    }

    fn event(&mut self, timeout: Duration) -> Res<CmEvent> {
        if let Some(event) = self.queue.pop_front() {
            return Ok(event);
        }
        if self.stream.is_none() && self.listener.is_some() {
            return self.accept_within(timeout);
        }
        Err(Error::IoError(ErrorKind::TimedOut.into()))
    }
}

/// An established connection: the endpoint, its control channel and
/// the reader and writer threads behind it.
pub struct Connection {
    endpoint: Option<StreamEndpoint>,
    control: TcpStream,
    cm: StreamCm,
    shared: Arc<Shared>,
    reader: Option<thread::JoinHandle<()>>,
    writer: Option<thread::JoinHandle<()>>,
}

impl Connection {
    /// Bring a connection all the way up: establish, register buffers,
    /// open the control channel and exchange buffer access parameters.
    pub fn establish(cfg: &BenchConfig) -> Res<Self> {
        cfg.validate()?;
        let params = ConnParams::default();
        let (mut cm, control) = match cfg.role {
            Role::Server => {
                let bind = cfg.bind.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
                let control_listener =
                    TcpListener::bind(SocketAddr::new(bind, cfg.control_port()))?;
                let mut cm = StreamCm::server(cfg.bind, cfg.port)?;
                handshake::establish_passive(&mut cm, &params)?;
                let (control, _) = control_listener.accept()?;
                (cm, control)
            }
            Role::Client => {
                let host = cfg.peer.clone().ok_or(Error::AddressResolution)?;
                let mut cm = StreamCm::client(&host, cfg.port);
                handshake::establish_active(&mut cm, &params)?;
                let control_addr =
                    SocketAddr::new(cm.resolved.ok_or(Error::AddressResolution)?.ip(), cfg.control_port());
                let control = TcpStream::connect_timeout(&control_addr, RESOLUTION_TIMEOUT)?;
                (cm, control)
            }
        };
        control.set_nodelay(true)?;
        let data = cm.take_stream().ok_or(Error::Disconnected)?;
        let shared = Arc::new(Shared {
            depth: cfg.queue_depth,
            send_region: Region::register(cfg.buf_size, true)?,
            recv_region: Region::register(cfg.buf_size, false)?,
            credits: Mutex::new(0),
            credits_cv: Condvar::new(),
            send_cq: Mutex::new(VecDeque::with_capacity(cfg.queue_depth as usize)),
            recv_cq: Mutex::new(VecDeque::with_capacity(cfg.queue_depth as usize)),
            outbox: Mutex::new(Outbox::default()),
            outbox_cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let writer = {
            let shared = Arc::clone(&shared);
            let stream = data.try_clone()?;
            thread::Builder::new()
                .name("stream-writer".into())
                .spawn(move || writer_loop(stream, &shared))?
        };
        let reader = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("stream-reader".into())
                .spawn(move || reader_loop(data, &shared))?
        };
        let mut conn = Self {
            endpoint: Some(StreamEndpoint::new(Arc::clone(&shared), cfg.op)),
            control,
            cm,
            shared,
            reader: Some(reader),
            writer: Some(writer),
        };
        let local = conn
            .endpoint
            .as_ref()
            .map(|ep| ep.local_region())
            .ok_or(Error::Disconnected)?;
        let remote = handshake::exchange_regions(&mut conn.control, local)?;
        if let Some(ep) = conn.endpoint.as_mut() {
            ep.set_remote_region(remote);
        }
        Ok(conn)
    }

    /// Move the two queue directions out for the run threads.
    pub fn split(&mut self) -> Res<(StreamTx, StreamRx)> {
        let ep = self.endpoint.take().ok_or(Error::Disconnected)?;
        Ok(ep.split())
    }

    /// A second handle to the control channel for the other direction's
    /// thread.
    pub fn control(&self) -> Res<TcpStream> {
        Ok(self.control.try_clone()?)
    }

    /// Replace the peer's advertised buffer parameters. Only useful for
    /// fault injection; normal runs use what the handshake delivered.
    pub fn set_remote_region(&mut self, region: RegionInfo) {
        if let Some(ep) = self.endpoint.as_mut() {
            ep.set_remote_region(region);
        }
    }

    /// Copy of the receive buffer, for verifying transfers.
    #[must_use]
    pub fn recv_contents(&self) -> Vec<u8> {
        lock(&self.shared.recv_region.mem).to_vec()
    }

    /// Tear everything down in reverse order of construction.
    pub fn close(mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.credits_cv.notify_all();
        self.shared.outbox_cv.notify_all();
        // The writer drains queued frames before exiting; join it
        // before the sockets come down.
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                qwarn!("writer thread panicked");
            }
        }
        if let Err(e) = self.control.shutdown(Shutdown::Both) {
            if e.kind() != ErrorKind::NotConnected {
                qwarn!("control channel shutdown failed: {}", e);
            }
        }
        handshake::teardown(&mut self.cm);
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                qwarn!("reader thread panicked");
            }
        }
    }
}
