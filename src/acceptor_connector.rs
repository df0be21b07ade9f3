// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Listen-side and connect-side transport factories (§4.5).
//!
//! There's no auto-negotiated dual role here: a socket is either an
//! [`Acceptor`] (listen-only) or a [`Connector`] (connect-only), never both,
//! so there's no role negotiation to get wrong.
//!
//! Both register with a [`Reactor`] rather than driving their handshake on
//! the caller's thread: `Acceptor::listen` installs itself as an
//! [`EventHandler`] that drains `accept()` on readability, and each accepted
//! socket gets its own short-lived handshake [`EventHandler`] plus a timeout
//! timer; `Connector::connect` does the same for the connect-in-progress
//! socket. Nothing here blocks or busy-spins waiting on I/O -- every step
//! either completes immediately or waits for the reactor to call back in.

use crate::error::NetError;
use crate::handshake::{
    ClientExtHandshaker, ExtHandshakeInfo, Handshaker, ServerExtHandshaker, TcpHandshaker,
};
use crate::reactor::{EventHandler, HandlerId, Reactor, TimerId};
use mio::net::{TcpListener as MioTcpListener, TcpStream as MioTcpStream};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Which handshake an accepted/connected socket goes through before its
/// observer callback fires.
#[derive(Clone, Copy)]
pub enum HandshakeMode {
    /// No handshake; deliver the socket as soon as it's accepted/connected.
    Raw,
    /// The §4.5 extended handshake, carrying `serviceId`/`serviceOpt`/nonce.
    /// On the connect side, the pair is the `(serviceId, serviceOpt)` this
    /// side presents to the peer.
    Extended { service_id: u8, service_opt: u8 },
}

/// Callbacks for accepted connections.
pub trait AcceptObserver: Send + Sync {
    /// A raw-mode socket finished accepting.
    fn on_accept(&self, _socket: TcpStream, _peer: SocketAddr) {}
    /// An extended-mode socket completed its handshake.
    fn on_accept_ex(&self, _socket: TcpStream, _peer: SocketAddr, _info: ExtHandshakeInfo) {}
    /// Accept or handshake failed (including a handshake timeout).
    fn on_accept_err(&self, _peer: Option<SocketAddr>, _err: NetError) {}
}

/// Callbacks for outbound connections.
pub trait ConnectObserver: Send + Sync {
    /// A raw-mode socket finished connecting.
    fn on_connect_ok(&self, _socket: TcpStream, _peer: SocketAddr) {}
    /// An extended-mode socket completed its handshake.
    fn on_connect_ok_ex(&self, _socket: TcpStream, _peer: SocketAddr, _info: ExtHandshakeInfo) {}
    /// Connect or handshake failed (including a handshake timeout); the
    /// caller decides whether to retry.
    fn on_connect_err(&self, _peer: SocketAddr, _err: NetError) {}
}

/// One handshake variant in flight, type-erased so [`HandshakeConn`] doesn't
/// need to be generic over which side/mode it's driving.
enum PendingHandshake {
    Raw(TcpHandshaker),
    ServerExt(ServerExtHandshaker),
    ClientExt(ClientExtHandshaker),
}

impl PendingHandshake {
    fn poll(&mut self) -> std::io::Result<Option<(TcpStream, Option<ExtHandshakeInfo>)>> {
        match self {
            PendingHandshake::Raw(h) => {
                h.poll().map(|o| o.map(|out| (out.socket, None)))
            }
            PendingHandshake::ServerExt(h) => h.poll().map(|o| o.map(|out| (out.socket, out.ctx))),
            PendingHandshake::ClientExt(h) => h.poll().map(|o| o.map(|out| (out.socket, out.ctx))),
        }
    }
}

enum Callback {
    Accept(Arc<dyn AcceptObserver>),
    Connect(Arc<dyn ConnectObserver>),
}

/// Drives one accepted/connected socket's handshake to completion without
/// blocking the reactor thread: each readable/writable upcall re-polls the
/// handshaker, and a timer cancels the attempt if it hasn't finished within
/// the configured timeout (per §4.5, "if no progress within timeout_s, ...
/// fails with a kind Timeout").
struct HandshakeConn {
    pending: Mutex<Option<PendingHandshake>>,
    peer: SocketAddr,
    reactor: Arc<Reactor>,
    callback: Callback,
    finished: AtomicBool,
    self_id: Mutex<Option<HandlerId>>,
    timer_id: Mutex<Option<TimerId>>,
}

impl HandshakeConn {
    fn drive(&self) {
        if self.finished.load(Ordering::SeqCst) {
            return;
        }
        let mut guard = self.pending.lock().unwrap();
        let Some(mut pending) = guard.take() else {
            return;
        };
        match pending.poll() {
            Ok(Some((socket, info))) => {
                drop(guard);
                self.succeed(socket, info);
            }
            Ok(None) => {
                *guard = Some(pending);
            }
            Err(e) => {
                drop(guard);
                self.fail(NetError::Io(e));
            }
        }
    }

    fn teardown(&self) {
        if let Some(id) = self.self_id.lock().unwrap().take() {
            self.reactor.remove_handler(id);
        }
        if let Some(id) = self.timer_id.lock().unwrap().take() {
            self.reactor.cancel_timer(id);
        }
    }

    fn succeed(&self, socket: TcpStream, info: Option<ExtHandshakeInfo>) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        self.teardown();
        match (&self.callback, info) {
            (Callback::Accept(obs), Some(info)) => obs.on_accept_ex(socket, self.peer, info),
            (Callback::Accept(obs), None) => obs.on_accept(socket, self.peer),
            (Callback::Connect(obs), Some(info)) => obs.on_connect_ok_ex(socket, self.peer, info),
            (Callback::Connect(obs), None) => obs.on_connect_ok(socket, self.peer),
        }
    }

    fn fail(&self, err: NetError) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        self.teardown();
        // Drop the in-flight handshaker (and its socket) along with it.
        *self.pending.lock().unwrap() = None;
        match &self.callback {
            Callback::Accept(obs) => obs.on_accept_err(Some(self.peer), err),
            Callback::Connect(obs) => obs.on_connect_err(self.peer, err),
        }
    }
}

impl EventHandler for HandshakeConn {
    fn on_readable(&self) {
        self.drive();
    }
    fn on_writable(&self) {
        self.drive();
    }
}

fn make_pending(
    mode: HandshakeMode,
    socket: TcpStream,
    timeout: Duration,
    is_accept_side: bool,
) -> std::io::Result<PendingHandshake> {
    Ok(match mode {
        HandshakeMode::Raw => {
            PendingHandshake::Raw(TcpHandshaker::new(socket, None, 0, false, timeout)?)
        }
        HandshakeMode::Extended {
            service_id,
            service_opt,
        } => {
            if is_accept_side {
                PendingHandshake::ServerExt(ServerExtHandshaker::new(socket, timeout)?)
            } else {
                PendingHandshake::ClientExt(ClientExtHandshaker::new(
                    socket,
                    service_id,
                    service_opt,
                    timeout,
                )?)
            }
        }
    })
}

/// Binds a listening socket and hands off accepted, handshake-completed
/// connections to a [`Reactor`].
pub struct Acceptor {
    listener: TcpListener,
}

impl Acceptor {
    /// Bind a listening socket at `addr`.
    pub fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self { listener })
    }

    /// The address actually bound (useful when `addr`'s port was 0).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Register this acceptor with `reactor`. Every accepted socket is
    /// driven through `mode`'s handshake on the reactor's own threads;
    /// `observer` is called on completion, timeout, or error. Consumes
    /// `self` -- the listener now lives for as long as the registration.
    pub fn listen(
        self,
        reactor: Arc<Reactor>,
        mode: HandshakeMode,
        handshake_timeout: Duration,
        observer: Arc<dyn AcceptObserver>,
    ) -> std::io::Result<HandlerId> {
        let mio_listener = MioTcpListener::from_std(self.listener.try_clone()?);
        let handler = Arc::new(AcceptorHandler {
            listener: self.listener,
            reactor: reactor.clone(),
            mode,
            handshake_timeout,
            observer,
        });
        reactor.add_handler(handler, mio_listener, mio::Interest::READABLE)
    }
}

struct AcceptorHandler {
    listener: TcpListener,
    reactor: Arc<Reactor>,
    mode: HandshakeMode,
    handshake_timeout: Duration,
    observer: Arc<dyn AcceptObserver>,
}

impl EventHandler for AcceptorHandler {
    fn on_readable(&self) {
        loop {
            match self.listener.accept() {
                Ok((socket, peer)) => {
                    let pending = match make_pending(self.mode, socket, self.handshake_timeout, true)
                    {
                        Ok(p) => p,
                        Err(e) => {
                            self.observer.on_accept_err(Some(peer), NetError::Io(e));
                            continue;
                        }
                    };
                    // `pending` already owns the socket clone it needs; hand
                    // HandshakeConn::spawn a throwaway clone purely so its
                    // signature stays uniform with the connect side.
                    if let Err(e) = HandshakeConn::spawn(
                        self.reactor.clone(),
                        peer,
                        pending,
                        self.handshake_timeout,
                        Callback::Accept(self.observer.clone()),
                    ) {
                        self.observer.on_accept_err(Some(peer), NetError::Io(e));
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.observer.on_accept_err(None, NetError::Io(e));
                    break;
                }
            }
        }
    }
}

impl HandshakeConn {
    /// Register an already-constructed handshaker (which already owns its
    /// own socket clone) with the reactor and drive it to completion.
    fn spawn(
        reactor: Arc<Reactor>,
        peer: SocketAddr,
        pending: PendingHandshake,
        timeout: Duration,
        callback: Callback,
    ) -> std::io::Result<()> {
        let conn = Arc::new(HandshakeConn {
            pending: Mutex::new(Some(pending)),
            peer,
            reactor: reactor.clone(),
            callback,
            finished: AtomicBool::new(false),
            self_id: Mutex::new(None),
            timer_id: Mutex::new(None),
        });

        // Register a fresh mio source for the same underlying fd. Since the
        // handshaker already owns the only `std::net::TcpStream` handle, we
        // borrow a raw-fd-duplicated mio view to poll readiness; the
        // handshaker itself does the actual reads/writes.
        let source = conn.pending.lock().unwrap().as_ref().unwrap().try_clone_source()?;

        let handler: Arc<dyn EventHandler> = conn.clone();
        let id = reactor.add_handler(handler, source, mio::Interest::READABLE | mio::Interest::WRITABLE)?;
        *conn.self_id.lock().unwrap() = Some(id);

        let timeout_conn = conn.clone();
        let timer = reactor.schedule_timer(timeout, None, move || {
            timeout_conn.fail(NetError::Timeout);
        });
        *conn.timer_id.lock().unwrap() = Some(timer);

        conn.drive();
        Ok(())
    }
}

impl PendingHandshake {
    /// A duplicated mio registration source for the socket this handshaker
    /// owns, used purely to learn when the fd is ready; the handshaker keeps
    /// driving the actual I/O through its own `std::net::TcpStream`.
    fn try_clone_source(&self) -> std::io::Result<MioTcpStream> {
        let std_ref = match self {
            PendingHandshake::Raw(h) => h.peek_socket(),
            PendingHandshake::ServerExt(h) => h.peek_socket(),
            PendingHandshake::ClientExt(h) => h.peek_socket(),
        };
        Ok(MioTcpStream::from_std(std_ref.try_clone()?))
    }
}

/// Connects out to a remote address over the reactor, retrying on a fixed
/// backoff until the deadline passes, and driving whatever handshake `mode`
/// specifies once the TCP connect itself completes.
pub struct Connector {
    reactor: Arc<Reactor>,
    addr: SocketAddr,
    mode: HandshakeMode,
    handshake_timeout: Duration,
    retry_interval: Duration,
}

impl Connector {
    pub fn new(
        reactor: Arc<Reactor>,
        addr: SocketAddr,
        mode: HandshakeMode,
        handshake_timeout: Duration,
        retry_interval: Duration,
    ) -> Self {
        Self {
            reactor,
            addr,
            mode,
            handshake_timeout,
            retry_interval,
        }
    }

    /// Kick off a non-blocking connect attempt, retrying every
    /// `retry_interval` until `deadline` elapses. `observer` is called
    /// exactly once, from the reactor's threads, with the outcome.
    pub fn connect(&self, deadline: Duration, observer: Arc<dyn ConnectObserver>) {
        let attempt = Arc::new(ConnectAttempt {
            reactor: self.reactor.clone(),
            addr: self.addr,
            mode: self.mode,
            handshake_timeout: self.handshake_timeout,
            retry_interval: self.retry_interval,
            deadline_at: std::time::Instant::now() + deadline,
            observer,
        });
        attempt.try_once();
    }
}

struct ConnectAttempt {
    reactor: Arc<Reactor>,
    addr: SocketAddr,
    mode: HandshakeMode,
    handshake_timeout: Duration,
    retry_interval: Duration,
    deadline_at: std::time::Instant,
    observer: Arc<dyn ConnectObserver>,
}

impl ConnectAttempt {
    fn try_once(self: &Arc<Self>) {
        match MioTcpStream::connect(self.addr) {
            Ok(mio_stream) => {
                // The reactor takes ownership of whatever source it
                // registers, so a duplicated fd goes to the worker's poll
                // registry purely for readiness; the watcher keeps the
                // original to query `take_error()` and eventually hand off
                // to the handshake driver.
                let registered = match dup_mio_stream(&mio_stream) {
                    Ok(d) => d,
                    Err(e) => {
                        self.observer.on_connect_err(self.addr, NetError::Io(e));
                        return;
                    }
                };
                let watcher = Arc::new(ConnectWatcher {
                    attempt: self.clone(),
                    stream: Mutex::new(Some(mio_stream)),
                    self_id: Mutex::new(None),
                });
                let handler: Arc<dyn EventHandler> = watcher.clone();
                match self
                    .reactor
                    .add_handler(handler, registered, mio::Interest::WRITABLE)
                {
                    Ok(id) => *watcher.self_id.lock().unwrap() = Some(id),
                    Err(e) => self.observer.on_connect_err(self.addr, NetError::Io(e)),
                }
            }
            Err(e) => self.retry_or_fail(e),
        }
    }

    fn retry_or_fail(self: &Arc<Self>, err: std::io::Error) {
        let now = std::time::Instant::now();
        if now >= self.deadline_at {
            self.observer
                .on_connect_err(self.addr, NetError::Io(err));
            return;
        }
        let remaining = self.deadline_at - now;
        let delay = self.retry_interval.min(remaining);
        let this = self.clone();
        self.reactor.schedule_timer(delay, None, move || {
            this.try_once();
        });
    }
}

/// Watches a connect-in-progress mio socket for writability, which signals
/// the non-blocking `connect()` has resolved (success or error, checked via
/// `take_error`), then hands the resulting std socket to the handshake
/// driver.
struct ConnectWatcher {
    attempt: Arc<ConnectAttempt>,
    stream: Mutex<Option<MioTcpStream>>,
    self_id: Mutex<Option<HandlerId>>,
}

impl EventHandler for ConnectWatcher {
    fn on_writable(&self) {
        let mut guard = self.stream.lock().unwrap();
        let Some(stream) = guard.as_ref() else {
            return;
        };
        let result = stream.take_error();
        match result {
            Ok(None) => {
                let mio_stream = guard.take().unwrap();
                drop(guard);
                if let Some(id) = self.self_id.lock().unwrap().take() {
                    self.attempt.reactor.remove_handler(id);
                }
                let std_stream = into_std_stream(mio_stream);
                let pending = match make_pending(
                    self.attempt.mode,
                    std_stream,
                    self.attempt.handshake_timeout,
                    false,
                ) {
                    Ok(p) => p,
                    Err(e) => {
                        self.attempt
                            .observer
                            .on_connect_err(self.attempt.addr, NetError::Io(e));
                        return;
                    }
                };
                if let Err(e) = HandshakeConn::spawn(
                    self.attempt.reactor.clone(),
                    self.attempt.addr,
                    pending,
                    self.attempt.handshake_timeout,
                    Callback::Connect(self.attempt.observer.clone()),
                ) {
                    self.attempt
                        .observer
                        .on_connect_err(self.attempt.addr, NetError::Io(e));
                }
            }
            Ok(Some(e)) | Err(e) => {
                drop(guard);
                if let Some(id) = self.self_id.lock().unwrap().take() {
                    self.attempt.reactor.remove_handler(id);
                }
                self.attempt.retry_or_fail(e);
            }
        }
    }
}

#[cfg(unix)]
fn into_std_stream(mio_stream: MioTcpStream) -> TcpStream {
    use std::os::fd::{FromRawFd, IntoRawFd};
    unsafe { TcpStream::from_raw_fd(mio_stream.into_raw_fd()) }
}

#[cfg(windows)]
fn into_std_stream(mio_stream: MioTcpStream) -> TcpStream {
    use std::os::windows::io::{FromRawSocket, IntoRawSocket};
    unsafe { TcpStream::from_raw_socket(mio_stream.into_raw_socket()) }
}

/// Duplicate a mio socket's underlying descriptor into a second, separately
/// owned mio source, so one copy can be handed away to the reactor's poll
/// registry while the caller keeps a live handle to query/convert.
#[cfg(unix)]
fn dup_mio_stream(s: &MioTcpStream) -> std::io::Result<MioTcpStream> {
    use std::os::fd::{AsRawFd, FromRawFd};
    let fd = unsafe { libc::dup(s.as_raw_fd()) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(unsafe { MioTcpStream::from_raw_fd(fd) })
}

#[cfg(windows)]
fn dup_mio_stream(s: &MioTcpStream) -> std::io::Result<MioTcpStream> {
    use std::os::windows::io::{AsRawSocket, FromRawSocket};
    // mio exposes no direct duplication; borrow the raw socket through a
    // non-owning std::net::TcpStream purely to call its own try_clone, then
    // forget it so the original handle (still owned by `s`) isn't closed.
    let borrowed = unsafe { std::net::TcpStream::from_raw_socket(s.as_raw_socket()) };
    let cloned = borrowed.try_clone();
    std::mem::forget(borrowed);
    Ok(MioTcpStream::from_std(cloned?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    struct RecordingAccept(std::sync::mpsc::Sender<(TcpStream, SocketAddr)>);
    impl AcceptObserver for RecordingAccept {
        fn on_accept(&self, socket: TcpStream, peer: SocketAddr) {
            let _ = self.0.send((socket, peer));
        }
        fn on_accept_err(&self, _peer: Option<SocketAddr>, err: NetError) {
            panic!("accept failed: {err}");
        }
    }

    struct RecordingConnect(std::sync::mpsc::Sender<TcpStream>);
    impl ConnectObserver for RecordingConnect {
        fn on_connect_ok(&self, socket: TcpStream, _peer: SocketAddr) {
            let _ = self.0.send(socket);
        }
        fn on_connect_err(&self, _peer: SocketAddr, err: NetError) {
            panic!("connect failed: {err}");
        }
    }

    #[test]
    fn raw_mode_accept_and_connect_roundtrip_through_the_reactor() {
        let reactor = Arc::new(Reactor::new(1));
        let acceptor = Acceptor::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = acceptor.local_addr().unwrap();

        let (accept_tx, accept_rx) = channel();
        acceptor
            .listen(
                reactor.clone(),
                HandshakeMode::Raw,
                Duration::from_secs(2),
                Arc::new(RecordingAccept(accept_tx)),
            )
            .unwrap();

        let (connect_tx, connect_rx) = channel();
        let connector = Connector::new(
            reactor.clone(),
            addr,
            HandshakeMode::Raw,
            Duration::from_secs(2),
            Duration::from_millis(50),
        );
        connector.connect(
            Duration::from_secs(2),
            Arc::new(RecordingConnect(connect_tx)),
        );

        let (_server_sock, server_peer) = accept_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let _client_sock = connect_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(server_peer.ip(), addr.ip());
    }

    struct RecordingAcceptEx(std::sync::mpsc::Sender<ExtHandshakeInfo>);
    impl AcceptObserver for RecordingAcceptEx {
        fn on_accept_ex(&self, _socket: TcpStream, _peer: SocketAddr, info: ExtHandshakeInfo) {
            let _ = self.0.send(info);
        }
        fn on_accept_err(&self, _peer: Option<SocketAddr>, err: NetError) {
            panic!("accept failed: {err}");
        }
    }

    struct RecordingConnectEx(std::sync::mpsc::Sender<ExtHandshakeInfo>);
    impl ConnectObserver for RecordingConnectEx {
        fn on_connect_ok_ex(&self, _socket: TcpStream, _peer: SocketAddr, info: ExtHandshakeInfo) {
            let _ = self.0.send(info);
        }
        fn on_connect_err(&self, _peer: SocketAddr, err: NetError) {
            panic!("connect failed: {err}");
        }
    }

    #[test]
    fn extended_mode_roundtrips_service_id_and_nonce_through_the_reactor() {
        let reactor = Arc::new(Reactor::new(1));
        let acceptor = Acceptor::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = acceptor.local_addr().unwrap();

        let (accept_tx, accept_rx) = channel();
        acceptor
            .listen(
                reactor.clone(),
                HandshakeMode::Extended {
                    service_id: 7,
                    service_opt: 0,
                },
                Duration::from_secs(2),
                Arc::new(RecordingAcceptEx(accept_tx)),
            )
            .unwrap();

        let (connect_tx, connect_rx) = channel();
        let connector = Connector::new(
            reactor.clone(),
            addr,
            HandshakeMode::Extended {
                service_id: 7,
                service_opt: 0,
            },
            Duration::from_secs(2),
            Duration::from_millis(50),
        );
        connector.connect(
            Duration::from_secs(2),
            Arc::new(RecordingConnectEx(connect_tx)),
        );

        let server_info = accept_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let client_info = connect_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(server_info, client_info);
        assert_eq!(server_info.service_id, 7);
    }
}
