// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TCP server for one outlet's data and metadata.
//!
//! A single event-loop thread drives the v4/v6 acceptors, every session's
//! reads and writes, and the negotiation state machine. Transfer pumps
//! run on their own threads and talk to the loop through a command
//! channel plus a poll waker; each pump has at most one write in flight,
//! acknowledged through the session's condition variable.
//!
//! A note on memory ownership: the outlet owns the `TcpServer`; the
//! server and the loop thread share `ServerShared`; sessions are shared
//! between the loop (which owns the socket) and their pump thread via
//! `Arc<SessionShared>`, and the server only holds weak references in its
//! in-flight table. Whoever drops the last handle deregisters the
//! session.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, TryRecvError};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;

use crate::buffer::SendBuffer;
use crate::config::{ApiConfig, ACCEPTOR_BIND_RETRIES};
use crate::error::{Error, Result};
use crate::info::StreamInfo;
use crate::net;
use crate::sample::{local_clock, Sample};

use super::session::{transfer_samples_thread, Control, PumpParams, Session, SessionShared};
use super::sync_transfer::SyncTransferHandler;

/// Token of the IPv4 acceptor.
const ACCEPT_V4: Token = Token(0);
/// Token of the IPv6 acceptor.
const ACCEPT_V6: Token = Token(1);
/// Token of the command waker.
const WAKER_TOKEN: Token = Token(2);
/// First session token.
const SESSION_TOKEN_START: usize = 3;

/// Poll timeout; commands arrive via the waker, this is just a backstop.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Maximum events per poll.
const MAX_EVENTS: usize = 128;

// ============================================================================
// Commands and shared state
// ============================================================================

/// Cross-thread requests posted onto the event loop.
pub(crate) enum Command {
    /// A pump wants this chunk written; outcome goes to the session's
    /// completion slot.
    StartWrite { session: u64, data: Vec<u8> },
    /// Drop a session (pump exit, eager deregistration).
    CloseSession { session: u64 },
    /// Stop serving: close acceptors and every session, then exit.
    Shutdown,
}

/// State shared between the server handle, the loop thread and the pumps.
pub(crate) struct ServerShared {
    pub config: Arc<ApiConfig>,
    /// Stream info with session id, UID, timestamps and ports stamped.
    pub info: StreamInfo,
    /// Pre-serialized shortinfo message.
    pub shortinfo_msg: String,
    /// Pre-serialized fullinfo message.
    pub fullinfo_msg: String,
    pub send_buffer: Arc<SendBuffer>,
    pub cmd_tx: Sender<Command>,
    pub waker: Arc<Waker>,
    /// Weak references to all live sessions, by session id.
    pub inflight: Mutex<HashMap<u64, Weak<SessionShared>>>,
    /// Set once serving has ended; pumps observe it after the wakeup ping.
    pub shutdown: AtomicBool,
    /// Present when the server runs in synchronous fan-out mode.
    pub sync: Option<SyncTransferHandler>,
}

impl ServerShared {
    /// Post a command and wake the loop.
    pub fn post(&self, cmd: Command) {
        if self.cmd_tx.send(cmd).is_ok() {
            if let Err(e) = self.waker.wake() {
                log::debug!("[tcp] waker failed: {}", e);
            }
        }
    }
}

// ============================================================================
// Server handle
// ============================================================================

/// TCP server of one outlet.
pub struct TcpServer {
    shared: Arc<ServerShared>,
    loop_state: Option<ServerLoop>,
    thread: Option<JoinHandle<()>>,
}

impl TcpServer {
    /// Bind acceptors and prepare the event loop.
    ///
    /// Stamps the per-instantiation fields of `info` (session id, fresh
    /// UID, creation time, hostname, advertised data ports). Fails when
    /// neither address family yields an acceptor.
    pub fn new(
        mut info: StreamInfo,
        send_buffer: Arc<SendBuffer>,
        config: Arc<ApiConfig>,
    ) -> Result<Self> {
        info.session_id = config.session_id.clone();
        info.reset_uid();
        info.created_at = local_clock();
        info.hostname = net::hostname();

        let poll = Poll::new()?;
        let mut acceptor_v4 = None;
        let mut acceptor_v6 = None;
        if config.allow_ipv4 {
            match net::bind_tcp_in_range(false, config.base_port, config.port_range, ACCEPTOR_BIND_RETRIES)
            {
                Ok((listener, port)) => {
                    listener.set_nonblocking(true)?;
                    let mut listener = TcpListener::from_std(listener);
                    poll.registry()
                        .register(&mut listener, ACCEPT_V4, Interest::READABLE)?;
                    info.v4data_port = port;
                    log::debug!(
                        "[tcp] created IPv4 acceptor for {} @ port {}",
                        info.name,
                        port
                    );
                    acceptor_v4 = Some(listener);
                }
                Err(e) => log::warn!("[tcp] failed to create IPv4 acceptor: {}", e),
            }
        }
        if config.allow_ipv6 {
            match net::bind_tcp_in_range(true, config.base_port, config.port_range, ACCEPTOR_BIND_RETRIES)
            {
                Ok((listener, port)) => {
                    listener.set_nonblocking(true)?;
                    let mut listener = TcpListener::from_std(listener);
                    poll.registry()
                        .register(&mut listener, ACCEPT_V6, Interest::READABLE)?;
                    info.v6data_port = port;
                    log::debug!(
                        "[tcp] created IPv6 acceptor for {} @ port {}",
                        info.name,
                        port
                    );
                    acceptor_v6 = Some(listener);
                }
                Err(e) => log::warn!("[tcp] failed to create IPv6 acceptor: {}", e),
            }
        }
        if acceptor_v4.is_none() && acceptor_v6.is_none() {
            return Err(Error::Config(
                "failed to instantiate socket acceptors for the TCP server".into(),
            ));
        }

        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (cmd_tx, cmd_rx) = crossbeam::channel::unbounded();

        let shortinfo_msg = info.to_shortinfo_message();
        let fullinfo_msg = info.to_fullinfo_message();
        let sync = config.sync_transfer.then(SyncTransferHandler::new);

        let shared = Arc::new(ServerShared {
            config,
            info,
            shortinfo_msg,
            fullinfo_msg,
            send_buffer,
            cmd_tx,
            waker,
            inflight: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
            sync,
        });

        Ok(Self {
            shared,
            loop_state: Some(ServerLoop {
                poll,
                acceptor_v4,
                acceptor_v6,
                cmd_rx,
                sessions: HashMap::new(),
                by_id: HashMap::new(),
                next_token: SESSION_TOKEN_START,
                next_session_id: 1,
            }),
            thread: None,
        })
    }

    /// Stream info with the advertised ports filled in.
    pub fn info(&self) -> &StreamInfo {
        &self.shared.info
    }

    /// Start accepting connections on a dedicated loop thread.
    pub fn begin_serving(&mut self) -> Result<()> {
        let server_loop = self
            .loop_state
            .take()
            .ok_or_else(|| Error::Config("server is already serving".into()))?;
        let shared = Arc::clone(&self.shared);
        let thread = std::thread::Builder::new()
            .name("pulselink-tcp".to_string())
            .spawn(move || server_loop.run(&shared))
            .map_err(Error::Io)?;
        self.thread = Some(thread);
        Ok(())
    }

    /// Stop serving: close the acceptors and every in-flight session, and
    /// ping blocked pumps so they observe the ended server. Idempotent.
    pub fn end_serving(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.post(Command::Shutdown);
        // wake any pump blocked on an empty consumer queue
        self.shared.send_buffer.push_sample(&Arc::new(Sample::wakeup()));
    }

    /// Number of sessions currently registered in the in-flight table.
    pub fn session_count(&self) -> usize {
        self.shared
            .inflight
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Fan one serialized chunk out to all handed-off sockets
    /// (synchronous transfer mode only).
    pub fn write_all_blocking(&self, bufs: &[&[u8]]) -> Result<()> {
        match &self.shared.sync {
            Some(handler) => {
                handler.write_all_blocking(bufs);
                Ok(())
            }
            None => Err(Error::Config(
                "write_all_blocking requires sync transfer mode".into(),
            )),
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.end_serving();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("[tcp] server loop panicked");
            }
        }
    }
}

// ============================================================================
// Event loop
// ============================================================================

struct ServerLoop {
    poll: Poll,
    acceptor_v4: Option<TcpListener>,
    acceptor_v6: Option<TcpListener>,
    cmd_rx: Receiver<Command>,
    sessions: HashMap<Token, Session>,
    by_id: HashMap<u64, Token>,
    next_token: usize,
    next_session_id: u64,
}

impl ServerLoop {
    fn run(mut self, shared: &Arc<ServerShared>) {
        let mut events = Events::with_capacity(MAX_EVENTS);
        'serving: loop {
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("[tcp] poll error: {}", e);
                break;
            }
            for event in events.iter() {
                match event.token() {
                    ACCEPT_V4 => self.accept_connections(false, shared),
                    ACCEPT_V6 => self.accept_connections(true, shared),
                    WAKER_TOKEN => {
                        if self.handle_commands(shared) {
                            break 'serving;
                        }
                    }
                    token => {
                        self.service_session(
                            token,
                            event.is_readable(),
                            event.is_writable(),
                            shared,
                        );
                    }
                }
            }
        }
        self.shut_down_sessions(shared);
        log::debug!("[tcp] server loop exiting");
    }

    /// Accept until the listener runs dry.
    fn accept_connections(&mut self, v6: bool, shared: &Arc<ServerShared>) {
        loop {
            let acceptor = match if v6 { &self.acceptor_v6 } else { &self.acceptor_v4 } {
                Some(a) => a,
                None => return,
            };
            match acceptor.accept() {
                Ok((stream, peer)) => self.start_session(stream, peer, shared),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    log::warn!("[tcp] unhandled accept error: {}", e);
                    return;
                }
            }
        }
    }

    fn start_session(
        &mut self,
        mut stream: TcpStream,
        peer: std::net::SocketAddr,
        shared: &Arc<ServerShared>,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("[tcp] set_nodelay failed: {}", e);
        }
        #[cfg(unix)]
        {
            use std::os::fd::AsRawFd;
            net::apply_raw_buffer_sizes(
                stream.as_raw_fd(),
                shared.config.socket_send_buffer_size,
                shared.config.socket_receive_buffer_size,
            );
        }

        let token = Token(self.next_token);
        self.next_token += 1;
        let id = self.next_session_id;
        self.next_session_id += 1;

        if let Err(e) = self.poll.registry().register(
            &mut stream,
            token,
            Interest::READABLE | Interest::WRITABLE,
        ) {
            log::warn!("[tcp] failed to register session: {}", e);
            return;
        }

        let session_shared = SessionShared::new(id, Arc::downgrade(shared));
        shared
            .inflight
            .lock()
            .insert(id, Arc::downgrade(&session_shared));
        self.sessions
            .insert(token, Session::new(stream, session_shared));
        self.by_id.insert(id, token);
        log::debug!("[tcp] initialized client session {} from {}", id, peer);
    }

    /// Drain the command channel; true when a shutdown was requested.
    fn handle_commands(&mut self, shared: &Arc<ServerShared>) -> bool {
        loop {
            match self.cmd_rx.try_recv() {
                Ok(Command::StartWrite { session, data }) => {
                    let token = match self.by_id.get(&session) {
                        Some(token) => *token,
                        None => {
                            // session is gone; fail the pump's handshake
                            // through the in-flight table
                            if let Some(s) =
                                shared.inflight.lock().get(&session).and_then(Weak::upgrade)
                            {
                                s.complete_write(Err(io::ErrorKind::NotConnected.into()));
                            }
                            continue;
                        }
                    };
                    let control = match self.sessions.get_mut(&token) {
                        Some(s) => {
                            s.start_write(data);
                            s.on_writable()
                        }
                        None => continue,
                    };
                    self.apply(token, control, shared);
                }
                Ok(Command::CloseSession { session }) => {
                    if let Some(token) = self.by_id.get(&session).copied() {
                        self.close_session(token);
                    }
                }
                Ok(Command::Shutdown) => return true,
                Err(TryRecvError::Empty) => return false,
                Err(TryRecvError::Disconnected) => return true,
            }
        }
    }

    fn service_session(
        &mut self,
        token: Token,
        readable: bool,
        writable: bool,
        shared: &Arc<ServerShared>,
    ) {
        let control = {
            let session = match self.sessions.get_mut(&token) {
                Some(s) => s,
                None => return,
            };
            let mut control = Control::Keep;
            if readable {
                control = session.on_readable(shared);
            }
            // a response enqueued by the state machine is flushed right
            // away; if the socket pushes back, the writable event resumes
            if matches!(control, Control::Keep) && (writable || readable) {
                control = session.on_writable();
            }
            control
        };
        self.apply(token, control, shared);
    }

    fn apply(&mut self, token: Token, control: Control, shared: &Arc<ServerShared>) {
        match control {
            Control::Keep => {}
            Control::Close => self.close_session(token),
            Control::StartTransfer(params) => self.start_transfer(token, params, shared),
        }
    }

    /// Feed header is out: spawn the pump, hand off to the sync set, or,
    /// when the client asked for no buffering at all, just close.
    fn start_transfer(&mut self, token: Token, params: PumpParams, shared: &Arc<ServerShared>) {
        if params.max_buffered <= 0 {
            // a zero buffer is a handshake smoke test: close cleanly
            self.close_session(token);
            return;
        }

        if shared.sync.is_some() {
            self.hand_off_to_sync(token, shared);
            return;
        }

        let session = match self.sessions.get_mut(&token) {
            Some(s) => s,
            None => return,
        };
        session.set_streaming();
        let queue = shared
            .send_buffer
            .new_consumer(params.max_buffered.min(i32::MAX as i64) as i32);
        let session_shared = Arc::clone(&session.shared);
        let server = Arc::downgrade(shared);
        let cmd_tx = shared.cmd_tx.clone();
        let waker = Arc::clone(&shared.waker);
        let spawned = std::thread::Builder::new()
            .name("pulselink-transfer".to_string())
            .spawn(move || {
                transfer_samples_thread(session_shared, server, queue, params, cmd_tx, waker)
            });
        if let Err(e) = spawned {
            log::error!("[tcp] failed to spawn transfer thread: {}", e);
            self.close_session(token);
        }
    }

    /// Move the session's socket into the synchronous fan-out set. The
    /// session itself ends here; the socket lives on in the sync path.
    #[cfg(unix)]
    fn hand_off_to_sync(&mut self, token: Token, shared: &Arc<ServerShared>) {
        use std::os::fd::{FromRawFd, IntoRawFd};
        let mut session = match self.sessions.remove(&token) {
            Some(s) => s,
            None => return,
        };
        self.by_id.remove(&session.shared.id);
        let _ = self.poll.registry().deregister(&mut session.stream);
        let id = session.shared.id;
        let raw = session.stream.into_raw_fd();
        // SAFETY: into_raw_fd transfers ownership of the descriptor; it is
        // wrapped exactly once into a std TcpStream
        let stream = unsafe { std::net::TcpStream::from_raw_fd(raw) };
        if let Err(e) = stream.set_nonblocking(false) {
            log::warn!("[tcp] sync handoff of session {} failed: {}", id, e);
            return;
        }
        if let Some(sync) = &shared.sync {
            log::info!("[tcp] using synchronous blocking transfers for session {}", id);
            sync.add_socket(stream);
        }
    }

    #[cfg(not(unix))]
    fn hand_off_to_sync(&mut self, token: Token, _shared: &Arc<ServerShared>) {
        log::warn!("[tcp] sync transfer handoff is not supported on this platform");
        self.close_session(token);
    }

    fn close_session(&mut self, token: Token) {
        if let Some(mut session) = self.sessions.remove(&token) {
            self.by_id.remove(&session.shared.id);
            let _ = self.poll.registry().deregister(&mut session.stream);
            if session.has_pending_write() {
                session
                    .shared
                    .complete_write(Err(io::ErrorKind::ConnectionAborted.into()));
            }
            log::debug!("[tcp] closed session {}", session.shared.id);
        }
    }

    /// Shutdown: drop the acceptors, close every session socket, and fail
    /// every in-flight write handshake. The in-flight table is used rather
    /// than the session map so a `StartWrite` still queued behind the
    /// shutdown command cannot leave its pump parked forever.
    fn shut_down_sessions(&mut self, shared: &Arc<ServerShared>) {
        self.acceptor_v4 = None;
        self.acceptor_v6 = None;
        for (_, mut session) in self.sessions.drain() {
            let _ = self.poll.registry().deregister(&mut session.stream);
        }
        self.by_id.clear();
        let live: Vec<_> = shared
            .inflight
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        for session in live {
            session.complete_write(Err(io::ErrorKind::ConnectionAborted.into()));
        }
    }
}
