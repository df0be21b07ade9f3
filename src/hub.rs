// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The cross-process service hub.
//!
//! A [`ServiceHub`] binds a well-known control pipe and accepts registrations
//! from [`ServiceHost`] processes keyed by a one-byte service id. When the
//! hub accepts a client connection on one of its *public* listening sockets
//! -- via the extended handshake in [`crate::acceptor_connector`] -- it
//! dispatches the raw socket to the registered host for that service over
//! the control pipe via [`crate::socket::send_msg_with_fd`], rather than
//! handling the connection itself. The hub's only job is routing accepted
//! sockets to the right worker process.
//!
//! `SCM_RIGHTS` ancillary data -- the mechanism `send_msg_with_fd` relies on
//! to hand a file descriptor to another process -- is only delivered over
//! `AF_UNIX` sockets; the kernel silently refuses it on `AF_INET`. The
//! control pipe is therefore a Unix domain socket on Unix. Windows has no
//! `SCM_RIGHTS` equivalent at all (it needs `WSADuplicateSocket`, not
//! implemented here), so the Windows control pipe is a plain TCP loopback
//! connection used only for registration/heartbeat bookkeeping; dispatch on
//! that platform returns `HubError::FdPassing` unconditionally.
//!
//! The wire frame below is the exact layout of the original C `struct
//! PRO_SERVICE_PACKET` this protocol is compatible with: two 8-byte magic
//! sentinels bracket the C2S/S2C halves so a stream reader that's lost frame
//! sync can scan forward to the next `magic1` and recover.

use crate::acceptor_connector::AcceptObserver;
use crate::error::{HubError, NetError};
use crate::handshake::ExtHandshakeInfo;
use std::collections::HashMap;
use std::convert::TryInto;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

#[cfg(unix)]
use std::os::fd::{AsRawFd, RawFd};

/// The control pipe's address, listener and stream types: a Unix domain
/// socket path on Unix, a TCP loopback address on Windows (bookkeeping only,
/// see the module docs).
#[cfg(unix)]
mod pipe_io {
    pub type PipeAddr = std::path::PathBuf;
    pub type PipeListener = std::os::unix::net::UnixListener;
    pub type PipeStream = std::os::unix::net::UnixStream;
}
#[cfg(windows)]
mod pipe_io {
    pub type PipeAddr = std::net::SocketAddr;
    pub type PipeListener = std::net::TcpListener;
    pub type PipeStream = std::net::TcpStream;
}
use pipe_io::{PipeAddr, PipeListener, PipeStream};

pub const SERVICE_MAGIC: &[u8; 8] = b"PRONET01";
const NONCE_LEN: usize = 32;
const PROTOCOL_INFO_LEN: usize = 16;

/// An in-flight or previously-handed-off socket, tracked by both a logical
/// expiry tick and a numeric id assigned by whichever side owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServiceSock {
    pub expire_tick: i64,
    pub sock_id: i64,
    pub unix_socket: bool,
}

impl ServiceSock {
    const LEN: usize = 8 + 8 + 1;

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.expire_tick.to_be_bytes());
        out.extend_from_slice(&self.sock_id.to_be_bytes());
        out.push(self.unix_socket as u8);
    }

    fn read(buf: &[u8]) -> Result<(Self, &[u8]), HubError> {
        if buf.len() < Self::LEN {
            return Err(HubError::Truncated);
        }
        let (expire, rest) = buf.split_at(8);
        let (sock_id, rest) = rest.split_at(8);
        let (flag, rest) = rest.split_at(1);
        Ok((
            Self {
                expire_tick: i64::from_be_bytes(expire.try_into().unwrap()),
                sock_id: i64::from_be_bytes(sock_id.try_into().unwrap()),
                unix_socket: flag[0] != 0,
            },
            rest,
        ))
    }
}

/// Client(host) -> hub registration/handoff-acknowledgement half.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServicePacketC2s {
    pub service_id: u8,
    pub process_id: u64,
    pub old_sock: ServiceSock,
}

/// Hub -> client(host) service-option and nonce half.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServicePacketS2c {
    pub service_id: u8,
    pub service_opt: u8,
    pub nonce: [u8; NONCE_LEN],
    /// Windows `WSAPROTOCOL_INFO` for duplicating the dispatched socket into
    /// the host process. Zero on non-Windows builds; both endpoints of a
    /// same-build pair agree this is fine.
    pub protocol_info: [u8; PROTOCOL_INFO_LEN],
    pub old_sock: ServiceSock,
}

/// The full wire frame, magic-bracketed on both sides for resync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServicePacket {
    magic1: [u8; 8],
    pub c2s: ServicePacketC2s,
    pub s2c: ServicePacketS2c,
    magic2: [u8; 8],
}

const WIRE_LEN: usize = 8 + (1 + 8 + ServiceSock::LEN) + (1 + 1 + NONCE_LEN + PROTOCOL_INFO_LEN + ServiceSock::LEN) + 8;

impl ServicePacket {
    /// Build a registration frame (client -> hub); the S2C half is zeroed,
    /// the hub fills it in on response.
    pub fn new_c2s(service_id: u8, process_id: u64, old_sock: Option<ServiceSock>) -> Self {
        Self {
            magic1: *SERVICE_MAGIC,
            magic2: *SERVICE_MAGIC,
            c2s: ServicePacketC2s {
                service_id,
                process_id,
                old_sock: old_sock.unwrap_or_default(),
            },
            s2c: ServicePacketS2c {
                service_id: 0,
                service_opt: 0,
                nonce: [0; NONCE_LEN],
                protocol_info: [0; PROTOCOL_INFO_LEN],
                old_sock: ServiceSock::default(),
            },
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(WIRE_LEN);
        out.extend_from_slice(SERVICE_MAGIC);
        out.push(self.c2s.service_id);
        out.extend_from_slice(&self.c2s.process_id.to_be_bytes());
        self.c2s.old_sock.write(&mut out);

        out.push(self.s2c.service_id);
        out.push(self.s2c.service_opt);
        out.extend_from_slice(&self.s2c.nonce);
        out.extend_from_slice(&self.s2c.protocol_info);
        self.s2c.old_sock.write(&mut out);
        out.extend_from_slice(SERVICE_MAGIC);
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, HubError> {
        if buf.len() < WIRE_LEN {
            return Err(HubError::Truncated);
        }
        let (magic1, rest) = buf.split_at(8);
        let (service_id, rest) = rest.split_at(1);
        let (process_id, rest) = rest.split_at(8);
        let (c2s_old, rest) = ServiceSock::read(rest)?;

        let (s2c_service_id, rest) = rest.split_at(1);
        let (s2c_opt, rest) = rest.split_at(1);
        let (nonce, rest) = rest.split_at(NONCE_LEN);
        let (protocol_info, rest) = rest.split_at(PROTOCOL_INFO_LEN);
        let (s2c_old, rest) = ServiceSock::read(rest)?;
        let (magic2, _rest) = rest.split_at(8.min(rest.len()));

        let packet = Self {
            magic1: magic1.try_into().unwrap(),
            magic2: magic2.try_into().unwrap(),
            c2s: ServicePacketC2s {
                service_id: service_id[0],
                process_id: u64::from_be_bytes(process_id.try_into().unwrap()),
                old_sock: c2s_old,
            },
            s2c: ServicePacketS2c {
                service_id: s2c_service_id[0],
                service_opt: s2c_opt[0],
                nonce: nonce.try_into().unwrap(),
                protocol_info: protocol_info.try_into().unwrap(),
                old_sock: s2c_old,
            },
        };

        if !packet.check_magic() {
            return Err(HubError::BadMagic);
        }
        Ok(packet)
    }

    /// Validate both magic sentinels. Both are kept even though they
    /// duplicate each other, so a stream reader that lost frame sync can
    /// scan forward to either one to resync.
    pub fn check_magic(&self) -> bool {
        self.magic1 == *SERVICE_MAGIC && self.magic2 == *SERVICE_MAGIC
    }
}

// ============================================================================
// ServiceHub / ServiceHost runtime
// ============================================================================

/// A host missing a heartbeat this long is evicted from the ready set.
pub const PIPE_TIMEOUT: Duration = Duration::from_secs(10);
/// How long a dispatched socket waits for the host to acknowledge receipt
/// before the hub closes its own copy.
pub const SOCK_TIMEOUT: Duration = Duration::from_secs(5);
/// Delay between a `ServiceHost`'s reconnect attempts after losing the pipe.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Milliseconds since the Unix epoch, used as the original library's tick
/// counter for `ServiceSock::expire_tick`.
fn tick_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Read exactly `buf.len()` bytes, or report that the read timed out (the
/// control socket has a read timeout set) or the peer closed the pipe.
fn fill_buf(stream: &mut PipeStream, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Ok(false),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
                if filled == 0 {
                    return Err(e);
                }
                continue;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

/// A registered worker process: its control pipe, and the load counters the
/// hub tracks for it. The wire frame carries no live `totalSocks` field (see
/// `ServicePacketC2s`), so load-balancing approximates "least sockets handed
/// to this host since it registered" rather than the host's true live count.
struct HostPipe {
    service_id: u8,
    process_id: u64,
    total_socks: AtomicU32,
    stream: Mutex<PipeStream>,
}

impl HostPipe {
    fn send_dispatch(&self, s2c: ServicePacketS2c, client: &TcpStream) -> Result<(), HubError> {
        let packet = ServicePacket {
            magic1: *SERVICE_MAGIC,
            magic2: *SERVICE_MAGIC,
            c2s: ServicePacketC2s {
                service_id: 0,
                process_id: 0,
                old_sock: ServiceSock::default(),
            },
            s2c,
        };
        let bytes = packet.to_bytes();
        let stream = self.stream.lock().unwrap();
        #[cfg(unix)]
        {
            crate::socket::send_msg_with_fd(stream.as_raw_fd(), &bytes, client.as_raw_fd())
                .map_err(HubError::FdPassing)?;
            Ok(())
        }
        #[cfg(windows)]
        {
            let _ = (stream, client, bytes);
            Err(HubError::FdPassing(io::Error::new(
                io::ErrorKind::Unsupported,
                "socket dispatch on Windows requires WSADuplicateSocket",
            )))
        }
    }
}

/// A dispatched client socket the hub is still waiting on the host to
/// acknowledge. Dropping the entry (on ack, or on sweep-past-deadline)
/// closes the hub's own copy of the fd.
struct ExpiringSock {
    #[allow(dead_code)]
    socket: TcpStream,
    deadline: Instant,
}

struct HubState {
    load_balance: bool,
    pipe_timeout: Duration,
    sock_timeout: Duration,
    ready: Mutex<HashMap<u8, Vec<Arc<HostPipe>>>>,
    expiring: Mutex<HashMap<i64, ExpiringSock>>,
    next_sock_id: AtomicI64,
}

impl HubState {
    fn pick_host(&self, service_id: u8) -> Option<Arc<HostPipe>> {
        let ready = self.ready.lock().unwrap();
        let hosts = ready.get(&service_id)?;
        if !self.load_balance {
            return hosts.first().cloned();
        }
        hosts
            .iter()
            .min_by_key(|h| h.total_socks.load(Ordering::SeqCst))
            .cloned()
    }

    fn sweep_expired(&self) {
        let now = Instant::now();
        self.expiring.lock().unwrap().retain(|_, e| e.deadline > now);
    }

    fn evict(&self, service_id: u8, host: &Arc<HostPipe>) {
        if let Some(hosts) = self.ready.lock().unwrap().get_mut(&service_id) {
            hosts.retain(|h| !Arc::ptr_eq(h, host));
        }
    }
}

fn handle_control_conn(mut stream: PipeStream, state: Arc<HubState>) {
    if stream.set_read_timeout(Some(state.pipe_timeout)).is_err() {
        return;
    }

    let mut buf = [0u8; WIRE_LEN];
    if !matches!(fill_buf(&mut stream, &mut buf), Ok(true)) {
        return;
    }
    let Ok(packet) = ServicePacket::from_bytes(&buf) else {
        return;
    };
    let service_id = packet.c2s.service_id;
    let process_id = packet.c2s.process_id;
    let Ok(pipe_clone) = stream.try_clone() else {
        return;
    };
    let host = Arc::new(HostPipe {
        service_id,
        process_id,
        total_socks: AtomicU32::new(0),
        stream: Mutex::new(pipe_clone),
    });
    state
        .ready
        .lock()
        .unwrap()
        .entry(service_id)
        .or_default()
        .push(host.clone());
    crate::info!("service host registered: service_id={service_id} process_id={process_id}");

    loop {
        match fill_buf(&mut stream, &mut buf) {
            Ok(true) => {
                let Ok(frame) = ServicePacket::from_bytes(&buf) else {
                    break;
                };
                if frame.c2s.old_sock.sock_id != 0 {
                    state
                        .expiring
                        .lock()
                        .unwrap()
                        .remove(&frame.c2s.old_sock.sock_id);
                }
            }
            Ok(false) => break,
            Err(_) => break,
        }
    }

    state.evict(service_id, &host);
    crate::warn!("service host evicted: service_id={service_id} process_id={process_id}");
}

/// Binds the well-known control pipe that `ServiceHost` processes register
/// against, and routes accepted external clients (via [`AcceptObserver`]) to
/// whichever registered host owns their `serviceId`.
pub struct ServiceHub {
    state: Arc<HubState>,
    local_addr: PipeAddr,
    accept_handle: Option<JoinHandle<()>>,
    sweep_stop: Arc<AtomicBool>,
    sweep_handle: Option<JoinHandle<()>>,
}

impl ServiceHub {
    /// Bind the control pipe at `addr`. `load_balance` selects the
    /// least-loaded ready host per service id rather than always the first
    /// one registered (§4.6.2). Uses the production [`PIPE_TIMEOUT`] /
    /// [`SOCK_TIMEOUT`] constants; see [`Self::bind_with_timeouts`] to
    /// override them (tests want a much shorter eviction window).
    pub fn bind(addr: PipeAddr, load_balance: bool) -> io::Result<Self> {
        Self::bind_with_timeouts(addr, load_balance, PIPE_TIMEOUT, SOCK_TIMEOUT)
    }

    /// Like [`Self::bind`] with explicit `pipe_timeout`/`sock_timeout`.
    pub fn bind_with_timeouts(
        addr: PipeAddr,
        load_balance: bool,
        pipe_timeout: Duration,
        sock_timeout: Duration,
    ) -> io::Result<Self> {
        #[cfg(unix)]
        let _ = std::fs::remove_file(&addr);
        let listener = PipeListener::bind(&addr)?;
        #[cfg(unix)]
        let local_addr = addr;
        #[cfg(windows)]
        let local_addr = listener.local_addr()?;
        let state = Arc::new(HubState {
            load_balance,
            pipe_timeout,
            sock_timeout,
            ready: Mutex::new(HashMap::new()),
            expiring: Mutex::new(HashMap::new()),
            next_sock_id: AtomicI64::new(1),
        });

        let accept_state = state.clone();
        let accept_handle = thread::Builder::new()
            .name("service-hub-accept".into())
            .spawn(move || {
                for conn in listener.incoming() {
                    let Ok(stream) = conn else { continue };
                    let state = accept_state.clone();
                    thread::spawn(move || handle_control_conn(stream, state));
                }
            })
            .expect("failed to spawn service hub accept thread");

        let sweep_stop = Arc::new(AtomicBool::new(false));
        let sweep_state = state.clone();
        let sweep_flag = sweep_stop.clone();
        let sweep_handle = thread::Builder::new()
            .name("service-hub-sweep".into())
            .spawn(move || {
                while !sweep_flag.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(20));
                    sweep_state.sweep_expired();
                }
            })
            .expect("failed to spawn service hub sweep thread");

        Ok(Self {
            state,
            local_addr,
            accept_handle: Some(accept_handle),
            sweep_stop,
            sweep_handle: Some(sweep_handle),
        })
    }

    /// The address the control pipe actually bound (useful on Windows when
    /// the requested port was 0).
    pub fn local_addr(&self) -> PipeAddr {
        self.local_addr.clone()
    }

    /// Route an externally-accepted, extended-handshake-completed client to
    /// the ready host for `info.service_id` (§4.6.3).
    pub fn dispatch(&self, socket: TcpStream, info: ExtHandshakeInfo) -> Result<(), HubError> {
        let host = self
            .state
            .pick_host(info.service_id)
            .ok_or(HubError::UnknownService(info.service_id))?;

        let sock_id = self.state.next_sock_id.fetch_add(1, Ordering::SeqCst);
        let old_sock = ServiceSock {
            expire_tick: tick_now() + self.state.sock_timeout.as_millis() as i64,
            sock_id,
            unix_socket: cfg!(unix),
        };
        let s2c = ServicePacketS2c {
            service_id: info.service_id,
            service_opt: info.service_opt,
            nonce: info.nonce,
            protocol_info: [0u8; PROTOCOL_INFO_LEN],
            old_sock,
        };

        host.send_dispatch(s2c, &socket)?;
        host.total_socks.fetch_add(1, Ordering::SeqCst);
        self.state.expiring.lock().unwrap().insert(
            sock_id,
            ExpiringSock {
                socket,
                deadline: Instant::now() + self.state.sock_timeout,
            },
        );
        Ok(())
    }
}

impl AcceptObserver for ServiceHub {
    fn on_accept_ex(&self, socket: TcpStream, _peer: SocketAddr, info: ExtHandshakeInfo) {
        if let Err(e) = self.dispatch(socket, info) {
            crate::warn!("service hub dispatch failed: {e}");
        }
    }

    fn on_accept_err(&self, _peer: Option<SocketAddr>, err: NetError) {
        crate::warn!("service hub accept failed: {err}");
    }
}

impl Drop for ServiceHub {
    fn drop(&mut self) {
        self.sweep_stop.store(true, Ordering::SeqCst);
        if let Some(h) = self.sweep_handle.take() {
            let _ = h.join();
        }
        // The accept thread is parked in a blocking `listener.incoming()`
        // call with no wakeup path; it's reaped when the process exits
        // rather than joined here.
        self.accept_handle.take();
        #[cfg(unix)]
        let _ = std::fs::remove_file(&self.local_addr);
    }
}

/// Callbacks for a [`ServiceHost`]'s dispatched sockets.
pub trait ServiceHostObserver: Send + Sync {
    /// A client socket was handed off by the hub for this host's service.
    fn on_service_accept(&self, socket: TcpStream, info: ServicePacketS2c);
    /// The control pipe broke (or never connected); a reconnect is already
    /// scheduled after [`RECONNECT_INTERVAL`].
    fn on_pipe_error(&self, _err: HubError) {}
}

/// Connects to a [`ServiceHub`]'s control pipe, registers for `service_id`,
/// and surfaces dispatched client sockets to `observer`. Runs its own
/// reconnect loop: a dropped pipe is retried every [`RECONNECT_INTERVAL`]
/// until [`ServiceHost::stop`] is called.
pub struct ServiceHost {
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl ServiceHost {
    pub fn connect(
        hub_addr: PipeAddr,
        service_id: u8,
        process_id: u64,
        observer: Arc<dyn ServiceHostObserver>,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = stop.clone();
        let worker = thread::Builder::new()
            .name(format!("service-host-{service_id}"))
            .spawn(move || Self::run(hub_addr, service_id, process_id, observer, worker_stop))
            .expect("failed to spawn service host thread");
        Self {
            stop,
            worker: Some(worker),
        }
    }

    /// Stop reconnecting and tear down the background thread. Blocks until
    /// the current attempt (if any) notices and exits.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(w) = self.worker.take() {
            let _ = w.join();
        }
    }

    fn run(
        hub_addr: PipeAddr,
        service_id: u8,
        process_id: u64,
        observer: Arc<dyn ServiceHostObserver>,
        stop: Arc<AtomicBool>,
    ) {
        while !stop.load(Ordering::SeqCst) {
            if let Err(e) = Self::run_once(&hub_addr, service_id, process_id, &observer, &stop) {
                observer.on_pipe_error(e);
            }
            if stop.load(Ordering::SeqCst) {
                break;
            }
            thread::sleep(RECONNECT_INTERVAL);
        }
    }

    fn run_once(
        hub_addr: &PipeAddr,
        service_id: u8,
        process_id: u64,
        observer: &Arc<dyn ServiceHostObserver>,
        stop: &Arc<AtomicBool>,
    ) -> Result<(), HubError> {
        let mut stream = PipeStream::connect(hub_addr).map_err(HubError::Io)?;
        let reg = ServicePacket::new_c2s(service_id, process_id, None);
        stream.write_all(&reg.to_bytes()).map_err(HubError::Io)?;
        stream
            .set_read_timeout(Some(Duration::from_millis(200)))
            .map_err(HubError::Io)?;

        let hb_stream = stream.try_clone().map_err(HubError::Io)?;
        let hb_stop = stop.clone();
        let heartbeat = thread::spawn(move || {
            Self::heartbeat_loop(hb_stream, service_id, process_id, hb_stop)
        });

        let result = Self::recv_loop(&mut stream, observer, stop);
        let _ = heartbeat.join();
        result
    }

    fn heartbeat_loop(
        mut stream: PipeStream,
        service_id: u8,
        process_id: u64,
        stop: Arc<AtomicBool>,
    ) {
        while !stop.load(Ordering::SeqCst) {
            thread::sleep(HEARTBEAT_INTERVAL);
            let packet = ServicePacket::new_c2s(service_id, process_id, None);
            if stream.write_all(&packet.to_bytes()).is_err() {
                return;
            }
        }
    }

    #[cfg(unix)]
    fn recv_loop(
        stream: &mut PipeStream,
        observer: &Arc<dyn ServiceHostObserver>,
        stop: &Arc<AtomicBool>,
    ) -> Result<(), HubError> {
        loop {
            if stop.load(Ordering::SeqCst) {
                return Ok(());
            }
            match recv_frame_with_fd(stream.as_raw_fd()) {
                Ok((bytes, fd)) => {
                    let packet = ServicePacket::from_bytes(&bytes)?;
                    if let Some(fd) = fd {
                        let socket = unsafe {
                            use std::os::fd::FromRawFd;
                            TcpStream::from_raw_fd(fd)
                        };
                        observer.on_service_accept(socket, packet.s2c);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
                    continue;
                }
                Err(e) => return Err(HubError::Io(e)),
            }
        }
    }

    #[cfg(windows)]
    fn recv_loop(
        _stream: &mut PipeStream,
        _observer: &Arc<dyn ServiceHostObserver>,
        _stop: &Arc<AtomicBool>,
    ) -> Result<(), HubError> {
        Err(HubError::FdPassing(io::Error::new(
            io::ErrorKind::Unsupported,
            "receiving a dispatched socket on Windows requires WSADuplicateSocket",
        )))
    }
}

impl Drop for ServiceHost {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Read one fixed-size `ServicePacket` frame off `sock`, returning whichever
/// fd (if any) rode along in the first `recvmsg` call that read part of it.
/// Assumes the sender wrote the whole frame (plus fd) in a single `sendmsg`,
/// so the ancillary data arrives with the earliest bytes of that write --
/// true for this frame's size over a local control pipe.
#[cfg(unix)]
fn recv_frame_with_fd(sock: RawFd) -> io::Result<(Vec<u8>, Option<RawFd>)> {
    let mut buf = vec![0u8; WIRE_LEN];
    let mut filled = 0;
    let mut fd_out = None;
    while filled < buf.len() {
        let (n, fd) = crate::socket::recv_msg_with_fd(sock, &mut buf[filled..])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "control pipe closed mid-frame",
            ));
        }
        filled += n;
        if fd_out.is_none() {
            fd_out = fd;
        }
    }
    Ok((buf, fd_out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_preserves_fields() {
        let packet = ServicePacket::new_c2s(7, 1234, None);
        let bytes = packet.to_bytes();
        let decoded = ServicePacket::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.c2s.service_id, 7);
        assert_eq!(decoded.c2s.process_id, 1234);
        assert!(decoded.check_magic());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let packet = ServicePacket::new_c2s(1, 1, None);
        let mut bytes = packet.to_bytes();
        bytes[0] ^= 0xFF;
        assert!(matches!(
            ServicePacket::from_bytes(&bytes),
            Err(HubError::BadMagic)
        ));
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let packet = ServicePacket::new_c2s(1, 1, None);
        let bytes = packet.to_bytes();
        assert!(matches!(
            ServicePacket::from_bytes(&bytes[..bytes.len() - 4]),
            Err(HubError::Truncated)
        ));
    }

    // The runtime tests below drive the control pipe directly with a raw
    // `UnixStream` standing in for a `ServiceHost`, rather than going through
    // `ServiceHost` itself, so each test controls exactly which frames are
    // sent and when.

    #[cfg(unix)]
    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let connector = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        (accepted, connector)
    }

    #[cfg(unix)]
    fn register_pseudo_host(sock_path: &std::path::Path, service_id: u8, process_id: u64) -> PipeStream {
        let mut stream = PipeStream::connect(sock_path).unwrap();
        let reg = ServicePacket::new_c2s(service_id, process_id, None);
        stream.write_all(&reg.to_bytes()).unwrap();
        stream
    }

    #[cfg(unix)]
    #[test]
    fn dispatch_with_no_registered_host_returns_unknown_service() {
        let dir = tempfile::tempdir().unwrap();
        let hub = ServiceHub::bind_with_timeouts(
            dir.path().join("hub.sock"),
            false,
            Duration::from_millis(200),
            Duration::from_millis(200),
        )
        .unwrap();

        let (accepted, _connector) = socket_pair();
        let info = ExtHandshakeInfo {
            service_id: 9,
            service_opt: 0,
            nonce: [0u8; NONCE_LEN],
        };
        assert!(matches!(
            hub.dispatch(accepted, info),
            Err(HubError::UnknownService(9))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn registered_host_receives_dispatched_socket_with_matching_nonce_and_fd() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("hub.sock");
        let hub = ServiceHub::bind_with_timeouts(
            sock_path.clone(),
            false,
            Duration::from_millis(300),
            Duration::from_millis(300),
        )
        .unwrap();

        let mut host_stream = register_pseudo_host(&sock_path, 5, 42);
        thread::sleep(Duration::from_millis(80));

        let (accepted, mut connector) = socket_pair();
        let nonce = [7u8; NONCE_LEN];
        let info = ExtHandshakeInfo {
            service_id: 5,
            service_opt: 9,
            nonce,
        };
        hub.dispatch(accepted, info).unwrap();

        let (bytes, fd) = recv_frame_with_fd(host_stream.as_raw_fd()).unwrap();
        let packet = ServicePacket::from_bytes(&bytes).unwrap();
        assert_eq!(packet.s2c.service_id, 5);
        assert_eq!(packet.s2c.service_opt, 9);
        assert_eq!(packet.s2c.nonce, nonce);
        let sock_id = packet.s2c.old_sock.sock_id;
        assert_ne!(sock_id, 0);

        let fd = fd.expect("dispatch must hand off a file descriptor");
        let mut handed_off = unsafe {
            use std::os::fd::FromRawFd;
            TcpStream::from_raw_fd(fd)
        };
        handed_off
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();

        connector.write_all(b"X").unwrap();
        let mut buf = [0u8; 1];
        handed_off.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"X");

        // Ack the handoff; the hub should drop its own copy without
        // closing the connection the handed-off fd is riding on.
        let ack = ServicePacket::new_c2s(
            5,
            42,
            Some(ServiceSock {
                expire_tick: 0,
                sock_id,
                unix_socket: true,
            }),
        );
        host_stream.write_all(&ack.to_bytes()).unwrap();
        // Outlast the sock_timeout the dispatch would have expired under
        // without an ack, proving the ack -- not merely an unswept window --
        // is what kept the hub from closing its copy.
        thread::sleep(Duration::from_millis(400));

        connector.write_all(b"Y").unwrap();
        handed_off.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"Y");
    }

    #[cfg(unix)]
    #[test]
    fn unacknowledged_dispatch_is_swept_after_sock_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("hub.sock");
        let hub = ServiceHub::bind_with_timeouts(
            sock_path.clone(),
            false,
            Duration::from_millis(300),
            Duration::from_millis(80),
        )
        .unwrap();

        let host_stream = register_pseudo_host(&sock_path, 3, 1);
        thread::sleep(Duration::from_millis(80));

        let (accepted, mut connector) = socket_pair();
        let info = ExtHandshakeInfo {
            service_id: 3,
            service_opt: 0,
            nonce: [0u8; NONCE_LEN],
        };
        hub.dispatch(accepted, info).unwrap();
        let (_bytes, fd) = recv_frame_with_fd(host_stream.as_raw_fd()).unwrap();
        // Drop the received fd without acking; the hub's own copy is the
        // one that matters for this test.
        if let Some(fd) = fd {
            unsafe { libc::close(fd) };
        }

        // No ack sent. Once sock_timeout plus a sweep tick elapse, the
        // hub closes its copy of the accepted socket, so the other end of
        // that TCP connection observes EOF.
        thread::sleep(Duration::from_millis(200));
        connector.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(connector.read(&mut buf).unwrap(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn load_balance_prefers_the_least_loaded_ready_host() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("hub.sock");
        let hub = ServiceHub::bind_with_timeouts(
            sock_path.clone(),
            true,
            Duration::from_millis(300),
            Duration::from_millis(300),
        )
        .unwrap();

        let host_a = register_pseudo_host(&sock_path, 2, 100);
        let host_b = register_pseudo_host(&sock_path, 2, 200);
        thread::sleep(Duration::from_millis(80));

        let mut picks = Vec::new();
        for _ in 0..3 {
            let (accepted, _connector) = socket_pair();
            let info = ExtHandshakeInfo {
                service_id: 2,
                service_opt: 0,
                nonce: [0u8; NONCE_LEN],
            };
            hub.dispatch(accepted, info).unwrap();

            for (label, stream) in [("a", &host_a), ("b", &host_b)] {
                let mut buf = [0u8; 1];
                stream
                    .set_read_timeout(Some(Duration::from_millis(50)))
                    .unwrap();
                if stream.peek(&mut buf).is_ok() {
                    let (_bytes, fd) = recv_frame_with_fd(stream.as_raw_fd()).unwrap();
                    if let Some(fd) = fd {
                        unsafe { libc::close(fd) };
                    }
                    picks.push(label);
                    break;
                }
            }
        }

        // Each dispatch goes to whichever host has handled fewer sockets so
        // far; with two equally-idle hosts that alternates a/b/a.
        assert_eq!(picks, vec!["a", "b", "a"]);
    }
}
