use std::net::{SocketAddr, TcpListener, TcpStream};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use tracing::{error, info};

use crate::config::Endpoint;
use crate::error::{Result, ServerError};

/// A bound, non-blocking listening socket for one endpoint.
#[derive(Debug)]
pub struct Listener {
    pub endpoint: Endpoint,
    pub local_addr: SocketAddr,
    socket: TcpListener,
}

impl Listener {
    pub fn bind(endpoint: Endpoint) -> Result<Listener> {
        let addr = SocketAddr::V4(endpoint.addr);
        let socket = TcpListener::bind(addr).map_err(|source| ServerError::Bind { addr, source })?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;
        Ok(Listener {
            endpoint,
            local_addr,
            socket,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    /// Accepts one pending connection, already switched to non-blocking.
    pub fn accept(&self) -> io::Result<Option<(TcpStream, SocketAddr)>> {
        match self.socket.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(true)?;
                Ok(Some((stream, peer)))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Binds every endpoint, skipping those that fail. Errors only when nothing
/// could be bound.
pub fn bind_all(endpoints: Vec<Endpoint>) -> Result<Vec<Listener>> {
    let mut listeners = Vec::new();
    for endpoint in endpoints {
        match Listener::bind(endpoint) {
            Ok(listener) => {
                info!(addr = %listener.local_addr, "listening");
                listeners.push(listener);
            }
            Err(err) => error!(error = %err, "skipping endpoint"),
        }
    }
    if listeners.is_empty() {
        return Err(ServerError::NoEndpoints);
    }
    Ok(listeners)
}
