use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use crate::http::{Request, Response};

pub const READ_BUFFER_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadResult {
    Data(usize),
    Closed,
    WouldBlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResult {
    Done,
    Partial,
    WouldBlock,
}

/// What the reactor should do after a write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Sent,
    Pending,
    GiveUp,
}

/// One accepted connection: exactly one request and one response.
#[derive(Debug)]
pub struct Session {
    pub id: u64,
    pub peer: SocketAddr,
    pub listener: usize,
    pub local_port: u16,
    pub server: Option<usize>,
    pub request: Request,
    pub response: Option<Response>,
    pub awaiting_gateway: bool,
    pub write_armed: bool,
    pub retries: u32,
    pub opened: Instant,
    stream: TcpStream,
    outbound: Vec<u8>,
    written: usize,
    last_activity: Instant,
}

impl Session {
    pub fn new(id: u64, stream: TcpStream, peer: SocketAddr, listener: usize, local_port: u16) -> Self {
        let now = Instant::now();
        Session {
            id,
            peer,
            listener,
            local_port,
            server: None,
            request: Request::new(),
            response: None,
            awaiting_gateway: false,
            write_armed: false,
            retries: 0,
            opened: now,
            stream,
            outbound: Vec::new(),
            written: 0,
            last_activity: now,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_idle(&self, timeout: Duration, now: Instant) -> bool {
        now.duration_since(self.last_activity) >= timeout
    }

    /// One bounded, non-blocking read into `buf`.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<ReadResult> {
        match self.stream.read(buf) {
            Ok(0) => Ok(ReadResult::Closed),
            Ok(n) => {
                self.touch();
                Ok(ReadResult::Data(n))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadResult::WouldBlock),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(ReadResult::WouldBlock),
            Err(e) => Err(e),
        }
    }

    /// Serializes `response` as the bytes to send.
    pub fn queue(&mut self, response: Response) {
        self.outbound = response.to_bytes(self.request.version());
        self.written = 0;
        self.response = Some(response);
    }

    pub fn has_pending_output(&self) -> bool {
        self.written < self.outbound.len()
    }

    pub fn bytes_written(&self) -> usize {
        self.written
    }

    /// One non-blocking write of the unsent remainder.
    pub fn write(&mut self) -> io::Result<WriteResult> {
        if !self.has_pending_output() {
            return Ok(WriteResult::Done);
        }
        match self.stream.write(&self.outbound[self.written..]) {
            Ok(0) => Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => {
                self.written += n;
                self.touch();
                if self.has_pending_output() {
                    Ok(WriteResult::Partial)
                } else {
                    if let Some(response) = self.response.as_mut() {
                        response.mark_sent();
                    }
                    Ok(WriteResult::Done)
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(WriteResult::WouldBlock),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(WriteResult::WouldBlock),
            Err(e) => Err(e),
        }
    }

    /// One write attempt with retry accounting: a would-block counts
    /// against `max_retries`, any progress resets the count.
    pub fn flush(&mut self, max_retries: u32) -> io::Result<Progress> {
        match self.write()? {
            WriteResult::Done => Ok(Progress::Sent),
            WriteResult::Partial => {
                self.retries = 0;
                Ok(Progress::Pending)
            }
            WriteResult::WouldBlock => {
                self.retries += 1;
                if self.retries > max_retries {
                    Ok(Progress::GiveUp)
                } else {
                    Ok(Progress::Pending)
                }
            }
        }
    }

    /// Best-effort single write of a response that is not tracked further.
    pub fn write_now(&mut self, response: &Response) {
        let bytes = response.to_bytes(self.request.version());
        let _ = self.stream.write(&bytes);
    }

    pub fn is_sent(&self) -> bool {
        self.response.as_ref().map_or(false, Response::is_sent)
    }
}

/// Arena of sessions. A slot index is the session's epoll token and stays
/// stable while the session lives; freed slots are reused.
#[derive(Debug, Default)]
pub struct Sessions {
    slots: Vec<Option<Session>>,
    free: Vec<usize>,
    active: usize,
}

impl Sessions {
    pub fn new() -> Self {
        Sessions::default()
    }

    pub fn insert(&mut self, session: Session) -> usize {
        self.active += 1;
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(session);
                idx
            }
            None => {
                self.slots.push(Some(session));
                self.slots.len() - 1
            }
        }
    }

    pub fn get(&self, idx: usize) -> Option<&Session> {
        self.slots.get(idx).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Session> {
        self.slots.get_mut(idx).and_then(Option::as_mut)
    }

    pub fn remove(&mut self, idx: usize) -> Option<Session> {
        let session = self.slots.get_mut(idx)?.take()?;
        self.free.push(idx);
        self.active -= 1;
        Some(session)
    }

    pub fn len(&self) -> usize {
        self.active
    }

    pub fn is_empty(&self) -> bool {
        self.active == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Session)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|s| (idx, s)))
    }

    pub fn indices(&self) -> Vec<usize> {
        self.iter().map(|(idx, _)| idx).collect()
    }
}
