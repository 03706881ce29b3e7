//! Ownership and readiness tracking for every socket of one mount session
//!
//! The catalogue is the single authority that holds the session's sockets:
//! the callback listener, the one persistent control connection to the tape
//! daemon, the per-file I/O control connections the daemon opens, and the
//! gateway connections waiting for an asynchronous reply. Sockets enter when
//! accepted/opened and leave through the release methods, which transfer
//! ownership back to the caller; dropping the returned stream closes it
//! exactly once.

use std::net::{TcpListener, TcpStream};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::debug;

use crate::error::{BridgeError, Result};

/// A gateway connection waiting for an asynchronous reply, together with the
/// daemon request that triggered the round trip.
pub struct PendingClient {
    pub conn: TcpStream,
    /// The I/O control connection whose acknowledgement is being delayed
    /// until this reply arrives.
    pub daemon_fd: RawFd,
    pub magic: u32,
    pub req_type: u32,
    pub tape_path: String,
    pub transaction_id: u64,
    pub requested_at: Instant,
    pub timeout: Duration,
}

/// Which socket became ready, in the catalogue's deterministic priority
/// order: listener, control, I/O connections, gateway connections.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ready {
    Listener,
    Control,
    IoConn(RawFd),
    ClientConn(RawFd),
}

pub struct SocketCatalogue {
    listener: Option<TcpListener>,
    control: Option<TcpStream>,
    io_conns: Vec<TcpStream>,
    client_conns: Vec<PendingClient>,
    max_io_conns: usize,
}

impl SocketCatalogue {
    pub fn new(max_io_conns: usize) -> Self {
        Self {
            listener: None,
            control: None,
            io_conns: Vec::new(),
            client_conns: Vec::new(),
            max_io_conns,
        }
    }

    pub fn set_listener(&mut self, listener: TcpListener) {
        debug_assert!(self.listener.is_none());
        self.listener = Some(listener);
    }

    pub fn listener(&self) -> Option<&TcpListener> {
        self.listener.as_ref()
    }

    /// Register the persistent control connection. Exactly one exists for
    /// the lifetime of a session.
    pub fn set_control(&mut self, conn: TcpStream) -> Result<()> {
        if self.control.is_some() {
            return Err(BridgeError::Malformed(
                "second control connection for the session".into(),
            ));
        }
        self.control = Some(conn);
        Ok(())
    }

    pub fn control_mut(&mut self) -> Result<&mut TcpStream> {
        self.control.as_mut().ok_or_else(|| {
            BridgeError::Malformed("no control connection registered".into())
        })
    }

    pub fn add_io_conn(&mut self, conn: TcpStream) -> Result<()> {
        if self.io_conns.len() >= self.max_io_conns {
            return Err(BridgeError::CapacityExceeded(format!(
                "more than {} I/O control connections",
                self.max_io_conns
            )));
        }
        self.io_conns.push(conn);
        Ok(())
    }

    pub fn io_conn_count(&self) -> usize {
        self.io_conns.len()
    }

    pub fn io_conn_mut(&mut self, fd: RawFd) -> Result<&mut TcpStream> {
        self.io_conns
            .iter_mut()
            .find(|c| c.as_raw_fd() == fd)
            .ok_or_else(|| BridgeError::Malformed(format!("unknown I/O connection fd {fd}")))
    }

    /// Remove an I/O control connection and hand ownership back for closing.
    pub fn release_io_conn(&mut self, fd: RawFd) -> Result<TcpStream> {
        match self.io_conns.iter().position(|c| c.as_raw_fd() == fd) {
            Some(idx) => Ok(self.io_conns.remove(idx)),
            None => Err(BridgeError::Malformed(format!(
                "release of unknown I/O connection fd {fd}"
            ))),
        }
    }

    pub fn add_client_conn(&mut self, pending: PendingClient) {
        self.client_conns.push(pending);
    }

    pub fn client_conn_count(&self) -> usize {
        self.client_conns.len()
    }

    /// Remove a pending gateway connection and hand it back together with
    /// its request context.
    pub fn release_client_conn(&mut self, fd: RawFd) -> Result<PendingClient> {
        match self
            .client_conns
            .iter()
            .position(|p| p.conn.as_raw_fd() == fd)
        {
            Some(idx) => Ok(self.client_conns.remove(idx)),
            None => Err(BridgeError::Malformed(format!(
                "release of unknown gateway connection fd {fd}"
            ))),
        }
    }

    /// Wait up to `timeout` for one socket to become ready.
    ///
    /// Returns `None` on a quiet interval (the engine's tick). Exactly one
    /// ready socket is reported per call; ties are broken in registration
    /// order within the fixed category order so behavior is reproducible.
    pub fn wait(&self, timeout: Duration) -> Result<Option<Ready>> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut fds: Vec<BorrowedFd<'_>> = Vec::new();
            let mut tokens: Vec<Ready> = Vec::new();
            if let Some(l) = &self.listener {
                fds.push(l.as_fd());
                tokens.push(Ready::Listener);
            }
            if let Some(c) = &self.control {
                fds.push(c.as_fd());
                tokens.push(Ready::Control);
            }
            for c in &self.io_conns {
                fds.push(c.as_fd());
                tokens.push(Ready::IoConn(c.as_raw_fd()));
            }
            for p in &self.client_conns {
                fds.push(p.conn.as_fd());
                tokens.push(Ready::ClientConn(p.conn.as_raw_fd()));
            }
            let mut poll_fds: Vec<PollFd<'_>> = fds
                .iter()
                .map(|fd| PollFd::new(*fd, PollFlags::POLLIN))
                .collect();

            let left = deadline.saturating_duration_since(Instant::now());
            let millis = left.as_millis().min(u16::MAX as u128) as u16;
            match poll(&mut poll_fds, PollTimeout::from(millis)) {
                Ok(0) => return Ok(None),
                Ok(_) => {
                    let interesting = PollFlags::POLLIN
                        | PollFlags::POLLHUP
                        | PollFlags::POLLERR
                        | PollFlags::POLLNVAL;
                    for (pfd, token) in poll_fds.iter().zip(tokens.iter()) {
                        if pfd
                            .revents()
                            .map(|r| r.intersects(interesting))
                            .unwrap_or(false)
                        {
                            return Ok(Some(*token));
                        }
                    }
                    // poll said something was ready but nothing matched;
                    // treat as a quiet interval
                    return Ok(None);
                }
                Err(nix::errno::Errno::EINTR) => {
                    debug!("readiness wait interrupted by signal, retrying");
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                }
                Err(e) => {
                    return Err(BridgeError::comm(
                        "readiness wait",
                        std::io::Error::from(e),
                    ))
                }
            }
        }
    }

    /// Fail the session if any gateway connection has waited past its
    /// allotted reply timeout.
    pub fn check_timeouts(&self, now: Instant) -> Result<()> {
        for p in &self.client_conns {
            let waited = now.saturating_duration_since(p.requested_at);
            if waited > p.timeout {
                return Err(BridgeError::comm(
                    format!(
                        "gateway reply for transaction {} (daemon request type {})",
                        p.transaction_id, p.req_type
                    ),
                    std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("no reply after {} ms", waited.as_millis()),
                    ),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::thread;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || TcpStream::connect(addr).unwrap());
        let (server, _) = listener.accept().unwrap();
        (handle.join().unwrap(), server)
    }

    #[test]
    fn quiet_interval_reports_none() {
        let mut cat = SocketCatalogue::new(4);
        let (_peer, control) = pair();
        cat.set_control(control).unwrap();
        assert_eq!(cat.wait(Duration::from_millis(50)).unwrap(), None);
    }

    #[test]
    fn control_outranks_io_connections() {
        let mut cat = SocketCatalogue::new(4);
        let (mut control_peer, control) = pair();
        let (mut io_peer, io) = pair();
        let io_fd = io.as_raw_fd();
        cat.set_control(control).unwrap();
        cat.add_io_conn(io).unwrap();

        io_peer.write_all(b"x").unwrap();
        control_peer.write_all(b"y").unwrap();

        // Both are readable; control wins the tie
        assert_eq!(
            cat.wait(Duration::from_secs(1)).unwrap(),
            Some(Ready::Control)
        );

        // Drain control; the I/O connection is reported next
        let mut scratch = [0u8; 1];
        cat.control_mut().unwrap().read_exact(&mut scratch).unwrap();
        assert_eq!(
            cat.wait(Duration::from_secs(1)).unwrap(),
            Some(Ready::IoConn(io_fd))
        );
    }

    #[test]
    fn io_connection_bound_is_enforced() {
        let mut cat = SocketCatalogue::new(1);
        let (_p1, a) = pair();
        let (_p2, b) = pair();
        cat.add_io_conn(a).unwrap();
        assert!(matches!(
            cat.add_io_conn(b),
            Err(BridgeError::CapacityExceeded(_))
        ));
    }

    #[test]
    fn only_one_control_connection_per_session() {
        let mut cat = SocketCatalogue::new(4);
        let (_p1, a) = pair();
        let (_p2, b) = pair();
        cat.set_control(a).unwrap();
        assert!(cat.set_control(b).is_err());
    }

    #[test]
    fn release_returns_ownership_and_forgets_the_fd() {
        let mut cat = SocketCatalogue::new(4);
        let (_peer, conn) = pair();
        let fd = conn.as_raw_fd();
        cat.add_io_conn(conn).unwrap();
        assert_eq!(cat.io_conn_count(), 1);
        let released = cat.release_io_conn(fd).unwrap();
        assert_eq!(released.as_raw_fd(), fd);
        assert_eq!(cat.io_conn_count(), 0);
        assert!(cat.release_io_conn(fd).is_err());
    }

    #[test]
    fn stale_gateway_connection_raises_a_timeout() {
        let mut cat = SocketCatalogue::new(4);
        let (_peer, conn) = pair();
        cat.add_client_conn(PendingClient {
            conn,
            daemon_fd: -1,
            magic: crate::protocol::TAPE_MAGIC,
            req_type: crate::protocol::msg::FILE,
            tape_path: "/dev/tape0".into(),
            transaction_id: 12,
            requested_at: Instant::now() - Duration::from_secs(10),
            timeout: Duration::from_secs(5),
        });
        let err = cat.check_timeouts(Instant::now()).unwrap_err();
        assert!(err.is_timeout());
        // Within budget nothing fires
        let mut cat2 = SocketCatalogue::new(4);
        let (_peer2, conn2) = pair();
        cat2.add_client_conn(PendingClient {
            conn: conn2,
            daemon_fd: -1,
            magic: crate::protocol::TAPE_MAGIC,
            req_type: crate::protocol::msg::FILE,
            tape_path: String::new(),
            transaction_id: 13,
            requested_at: Instant::now(),
            timeout: Duration::from_secs(5),
        });
        cat2.check_timeouts(Instant::now()).unwrap();
    }

    #[test]
    fn peer_close_is_reported_as_readiness() {
        let mut cat = SocketCatalogue::new(4);
        let (peer, io) = pair();
        let io_fd = io.as_raw_fd();
        cat.add_io_conn(io).unwrap();
        drop(peer);
        assert_eq!(
            cat.wait(Duration::from_secs(1)).unwrap(),
            Some(Ready::IoConn(io_fd))
        );
    }
}
