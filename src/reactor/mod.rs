//! The connection reactor.
//!
//! One thread owns every socket and blocks in `epoll_wait` with a fixed poll
//! interval. Listening sockets, client sessions and the CGI wake-up `eventfd`
//! all share one epoll set and are told apart by their token. CGI scripts run
//! on worker threads; their results come back through a channel and the
//! worker pokes the `eventfd` so the reactor picks them up.

mod listener;
mod poller;
mod session;

use std::io;
use std::net::SocketAddr;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::auth::{Authenticator, UserFile};
use crate::cgi::{self, CgiContext, CgiError, CgiJob, CgiOutcome};
use crate::config::Config;
use crate::error::Result;
use crate::http::{status, Request, Response};
use crate::pages::ErrorPages;
use crate::router::{Outcome, Router};
use crate::shutdown::Shutdown;

pub use listener::{bind_all, Listener};
pub use poller::{Interest, Poller, Waker};
pub use session::{Progress, ReadResult, Session, Sessions, WriteResult, READ_BUFFER_SIZE};

use poller::epoll_event;

const WAKER_TOKEN: u64 = u64::MAX;
const LISTENER_TOKEN_BASE: u64 = 1 << 48;
const GENERATION_SHIFT: u32 = 32;
/// How long a listener stays deregistered after running out of descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Session tokens carry the slot and the low bits of the session id, so an
/// event queued for a closed session never reaches the next one in its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Waker,
    Listener(usize),
    Session(usize, u16),
}

impl Token {
    fn from_raw(raw: u64) -> Token {
        if raw == WAKER_TOKEN {
            Token::Waker
        } else if raw >= LISTENER_TOKEN_BASE {
            Token::Listener((raw - LISTENER_TOKEN_BASE) as usize)
        } else {
            Token::Session(
                (raw & u64::from(u32::MAX)) as usize,
                (raw >> GENERATION_SHIFT) as u16,
            )
        }
    }

    fn raw(self) -> u64 {
        match self {
            Token::Waker => WAKER_TOKEN,
            Token::Listener(idx) => LISTENER_TOKEN_BASE + idx as u64,
            Token::Session(idx, generation) => {
                (u64::from(generation) << GENERATION_SHIFT) | (idx as u64 & u64::from(u32::MAX))
            }
        }
    }
}

fn generation(session_id: u64) -> u16 {
    session_id as u16
}

fn session_token(slot: usize, session: &Session) -> u64 {
    Token::Session(slot, generation(session.id)).raw()
}

/// Accept errors that persist until descriptors or memory are released.
fn is_exhaustion(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM)
    )
}

/// Result of a CGI run, addressed to the session that asked for it.
struct Completion {
    slot: usize,
    session_id: u64,
    result: std::result::Result<CgiOutcome, CgiError>,
}

pub struct Reactor {
    config: Config,
    poller: Poller,
    listeners: Vec<Listener>,
    sessions: Sessions,
    authenticator: Box<dyn Authenticator>,
    waker: Arc<Waker>,
    completions_tx: Sender<Completion>,
    completions: Receiver<Completion>,
    next_session_id: u64,
    last_sweep: Instant,
    paused: Vec<usize>,
    resume_at: Option<Instant>,
}

impl Reactor {
    /// Binds every configured endpoint and registers it with a fresh epoll
    /// instance. Endpoints that fail to bind are skipped.
    pub fn new(config: Config) -> Result<Reactor> {
        let poller = Poller::new()?;
        let listeners = bind_all(config.endpoints())?;
        for (idx, listener) in listeners.iter().enumerate() {
            poller.add(listener.fd(), Token::Listener(idx).raw(), Interest::Read)?;
        }

        let waker = Arc::new(Waker::new()?);
        poller.add(waker.fd(), WAKER_TOKEN, Interest::Read)?;
        let (completions_tx, completions) = mpsc::channel();

        Ok(Reactor {
            config,
            poller,
            listeners,
            sessions: Sessions::new(),
            authenticator: Box::new(UserFile),
            waker,
            completions_tx,
            completions,
            next_session_id: 0,
            last_sweep: Instant::now(),
            paused: Vec::new(),
            resume_at: None,
        })
    }

    pub fn with_authenticator(mut self, authenticator: Box<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().map(|l| l.local_addr).collect()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs until `shutdown` is triggered. Open sessions are dropped on exit.
    pub fn run(&mut self, shutdown: &Shutdown) -> Result<()> {
        let mut events = vec![epoll_event { events: 0, u64: 0 }; self.config.reactor.max_events];
        let poll_interval = Duration::from_millis(self.config.reactor.poll_interval_ms as u64);

        info!(
            endpoints = self.listeners.len(),
            servers = self.config.servers.len(),
            "reactor started"
        );

        while !shutdown.is_triggered() {
            let ready = self
                .poller
                .wait(&mut events, self.config.reactor.poll_interval_ms)?;

            for event in &events[..ready] {
                let (raw, flags) = (event.u64, event.events);
                match Token::from_raw(raw) {
                    Token::Waker => self.collect_completions(),
                    Token::Listener(idx) => self.accept(idx),
                    Token::Session(idx, generation) => self.session_event(idx, generation, flags),
                }
            }
            self.resume_listeners(Instant::now());

            if ready == 0 || self.last_sweep.elapsed() >= poll_interval {
                self.sweep_idle();
                self.last_sweep = Instant::now();
            }
        }

        info!(open = self.sessions.len(), "reactor stopping");
        for idx in self.sessions.indices() {
            self.close(idx);
        }
        Ok(())
    }

    fn accept(&mut self, listener_idx: usize) {
        loop {
            let listener = match self.listeners.get(listener_idx) {
                Some(listener) => listener,
                None => return,
            };
            let (stream, peer) = match listener.accept() {
                Ok(Some(accepted)) => accepted,
                Ok(None) => return,
                Err(err) if is_exhaustion(&err) => {
                    error!(
                        addr = %listener.local_addr,
                        error = %err,
                        "accept failed, pausing listener"
                    );
                    self.pause_listener(listener_idx, Instant::now());
                    return;
                }
                Err(err) => {
                    debug!(addr = %listener.local_addr, error = %err, "accept failed");
                    return;
                }
            };
            let local_port = listener.local_addr.port();

            self.next_session_id += 1;
            let session = Session::new(self.next_session_id, stream, peer, listener_idx, local_port);
            let fd = session.fd();
            let current = generation(session.id);
            let slot = self.sessions.insert(session);
            let token = Token::Session(slot, current).raw();
            if let Err(err) = self.poller.add(fd, token, Interest::Read) {
                error!(%peer, error = %err, "cannot register connection");
                self.sessions.remove(slot);
                continue;
            }
            debug!(%peer, slot, "connection accepted");
        }
    }

    /// Stops watching a listener that keeps failing until `ACCEPT_BACKOFF`
    /// has passed.
    fn pause_listener(&mut self, idx: usize, now: Instant) {
        let listener = match self.listeners.get(idx) {
            Some(listener) => listener,
            None => return,
        };
        if self.paused.contains(&idx) {
            return;
        }
        if let Err(err) = self.poller.delete(listener.fd()) {
            error!(addr = %listener.local_addr, error = %err, "cannot pause listener");
            return;
        }
        self.paused.push(idx);
        self.resume_at = Some(now + ACCEPT_BACKOFF);
    }

    fn resume_listeners(&mut self, now: Instant) {
        match self.resume_at {
            Some(at) if at <= now => {}
            _ => return,
        }
        self.resume_at = None;
        for idx in std::mem::take(&mut self.paused) {
            let listener = match self.listeners.get(idx) {
                Some(listener) => listener,
                None => continue,
            };
            match self
                .poller
                .add(listener.fd(), Token::Listener(idx).raw(), Interest::Read)
            {
                Ok(()) => debug!(addr = %listener.local_addr, "listener resumed"),
                Err(err) => {
                    error!(addr = %listener.local_addr, error = %err, "cannot resume listener");
                    self.paused.push(idx);
                    self.resume_at = Some(now + ACCEPT_BACKOFF);
                }
            }
        }
    }

    fn session_event(&mut self, slot: usize, expected: u16, flags: u32) {
        match self.sessions.get(slot) {
            Some(session) if generation(session.id) == expected => {}
            _ => {
                debug!(slot, "event for a closed connection");
                return;
            }
        }
        if poller::is_readable(flags) {
            self.read(slot);
        } else if poller::is_error(flags) {
            self.close(slot);
            return;
        }
        if poller::is_writable(flags) {
            self.write(slot);
        }
    }

    fn read(&mut self, slot: usize) {
        let servers = &self.config.servers;
        let listeners = &self.listeners;
        let session = match self.sessions.get_mut(slot) {
            Some(session) => session,
            None => return,
        };

        let mut buf = [0u8; READ_BUFFER_SIZE];
        let n = match session.read(&mut buf) {
            Ok(ReadResult::Data(n)) => n,
            Ok(ReadResult::WouldBlock) => return,
            Ok(ReadResult::Closed) => {
                if session.request.in_progress() {
                    info!(
                        peer = %session.peer,
                        status = status::CLIENT_CLOSED_REQUEST,
                        "client closed request"
                    );
                }
                self.close(slot);
                return;
            }
            Err(err) => {
                debug!(peer = %session.peer, error = %err, "read failed");
                self.close(slot);
                return;
            }
        };

        if session.request.is_complete() {
            return;
        }
        let endpoint = &listeners[session.listener].endpoint;
        session.request.feed_with(&buf[..n], |request| {
            let server = &servers[endpoint.select(servers, request.header("host"))];
            Some(server.max_body_size(request.uri()))
        });

        if session.request.is_complete() && session.response.is_none() && !session.awaiting_gateway {
            self.dispatch(slot);
        }
    }

    /// Runs the handler chain for a complete request.
    fn dispatch(&mut self, slot: usize) {
        let servers = &self.config.servers;
        let session = match self.sessions.get_mut(slot) {
            Some(session) => session,
            None => return,
        };
        let endpoint = &self.listeners[session.listener].endpoint;
        let server_idx = endpoint.select(servers, session.request.header("host"));
        session.server = Some(server_idx);
        let server = &servers[server_idx];

        let router = Router::new(server, self.authenticator.as_ref());
        match router.handle(&session.request) {
            Outcome::Respond(response) => self.respond(slot, response),
            Outcome::Gateway(job) => {
                let context = CgiContext {
                    server_name: server.server_name.clone(),
                    server_port: session.local_port,
                    remote_addr: session.peer.ip(),
                };
                session.awaiting_gateway = true;
                let request = session.request.clone();
                let session_id = session.id;
                if let Err(err) = self.spawn_gateway(slot, session_id, job, request, context) {
                    error!(error = %err, "cannot start CGI worker");
                    let response = router.error(status::BAD_GATEWAY);
                    if let Some(session) = self.sessions.get_mut(slot) {
                        session.awaiting_gateway = false;
                    }
                    self.respond(slot, response);
                }
            }
        }
    }

    fn spawn_gateway(
        &self,
        slot: usize,
        session_id: u64,
        job: CgiJob,
        request: Request,
        context: CgiContext,
    ) -> std::io::Result<()> {
        let timeout = Duration::from_secs(self.config.reactor.cgi_timeout_secs);
        let tx = self.completions_tx.clone();
        let waker = Arc::clone(&self.waker);
        thread::Builder::new()
            .name(format!("cgi-{}", session_id))
            .spawn(move || {
                let result = cgi::execute(&job, &request, &context, timeout);
                let completion = Completion {
                    slot,
                    session_id,
                    result,
                };
                if tx.send(completion).is_ok() {
                    if let Err(err) = waker.wake() {
                        error!(error = %err, "cannot wake reactor");
                    }
                }
            })
            .map(|_| ())
    }

    fn collect_completions(&mut self) {
        self.waker.reset();
        while let Ok(completion) = self.completions.try_recv() {
            let servers = &self.config.servers;
            let session = match self.sessions.get_mut(completion.slot) {
                Some(session) if session.id == completion.session_id && session.awaiting_gateway => {
                    session
                }
                _ => {
                    debug!(slot = completion.slot, "CGI result for a closed connection");
                    continue;
                }
            };
            session.awaiting_gateway = false;
            session.touch();
            let server = &servers[session.server.unwrap_or(0)];
            let response = cgi::respond(completion.result, &ErrorPages::for_server(server));
            self.respond(completion.slot, response);
        }
    }

    /// Queues `response` and attempts the first write right away.
    fn respond(&mut self, slot: usize, response: Response) {
        let session = match self.sessions.get_mut(slot) {
            Some(session) => session,
            None => return,
        };
        info!(
            peer = %session.peer,
            method = session.request.method(),
            uri = session.request.uri(),
            status = response.status(),
            bytes = response.body().len(),
            elapsed_ms = session.opened.elapsed().as_millis() as u64,
            "request"
        );
        session.queue(response);
        self.write(slot);
    }

    fn write(&mut self, slot: usize) {
        let max_retries = self.config.reactor.max_send_retries;
        let session = match self.sessions.get_mut(slot) {
            Some(session) => session,
            None => return,
        };
        if !session.has_pending_output() {
            return;
        }

        match session.flush(max_retries) {
            Ok(Progress::Sent) => {
                debug!(peer = %session.peer, bytes = session.bytes_written(), "response sent");
                self.close(slot);
            }
            Ok(Progress::Pending) => self.arm_write(slot),
            Ok(Progress::GiveUp) => {
                warn!(
                    peer = %session.peer,
                    retries = session.retries,
                    "send retries exhausted"
                );
                self.close(slot);
            }
            Err(err) => {
                debug!(peer = %session.peer, error = %err, "write failed");
                self.close(slot);
            }
        }
    }

    fn arm_write(&mut self, slot: usize) {
        let session = match self.sessions.get_mut(slot) {
            Some(session) => session,
            None => return,
        };
        if session.write_armed {
            return;
        }
        let fd = session.fd();
        match self
            .poller
            .modify(fd, session_token(slot, session), Interest::ReadWrite)
        {
            Ok(()) => session.write_armed = true,
            Err(err) => {
                error!(error = %err, "cannot watch for writability");
                self.close(slot);
            }
        }
    }

    fn sweep_idle(&mut self) {
        let timeout = Duration::from_secs(self.config.reactor.client_timeout_secs);
        let now = Instant::now();
        let expired = self
            .sessions
            .iter()
            .filter(|(_, s)| !s.awaiting_gateway && s.is_idle(timeout, now))
            .map(|(slot, _)| slot)
            .collect::<Vec<_>>();

        for slot in expired {
            let servers = &self.config.servers;
            if let Some(session) = self.sessions.get_mut(slot) {
                if session.request.in_progress() && session.response.is_none() {
                    let endpoint = &self.listeners[session.listener].endpoint;
                    let server = &servers[endpoint.select(servers, session.request.header("host"))];
                    let response = ErrorPages::for_server(server).response(status::REQUEST_TIMEOUT);
                    session.write_now(&response);
                    info!(peer = %session.peer, status = status::REQUEST_TIMEOUT, "request timed out");
                } else {
                    debug!(peer = %session.peer, "idle connection closed");
                }
            }
            self.close(slot);
        }
    }

    fn close(&mut self, slot: usize) {
        if let Some(session) = self.sessions.remove(slot) {
            if let Err(err) = self.poller.delete(session.fd()) {
                debug!(error = %err, "epoll delete failed");
            }
            debug!(
                peer = %session.peer,
                sent = session.is_sent(),
                "connection closed"
            );
        }
    }
}
