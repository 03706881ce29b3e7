//! Blocking transport for the legacy tape-daemon protocol
//!
//! One header or one header+body per call over an established connection.
//! Every operation enforces its timeout as a hard deadline covering the
//! whole transfer, not just the first byte, by shrinking the socket timeout
//! between partial reads/writes. No state is kept between calls.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use crate::codec::{self, Body, MessageHeader};
use crate::error::{BridgeError, Result};
use crate::protocol::{msg, HDR_LEN, MAX_MESSAGE};

pub(crate) fn remaining(deadline: Instant, context: &str) -> Result<Duration> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        return Err(BridgeError::comm(
            context,
            io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded"),
        ));
    }
    Ok(left)
}

/// Read exactly `buf.len()` bytes before `deadline`.
///
/// EOF before the first byte surfaces as `PeerClosed`; EOF mid-record is a
/// communication failure. Callers decide whether `PeerClosed` is a valid
/// outcome or an error.
pub(crate) fn read_exact_deadline(
    conn: &mut TcpStream,
    buf: &mut [u8],
    deadline: Instant,
    context: &str,
) -> Result<()> {
    let mut done = 0usize;
    while done < buf.len() {
        let left = remaining(deadline, context)?;
        conn.set_read_timeout(Some(left))
            .map_err(|e| BridgeError::comm(context, e))?;
        match conn.read(&mut buf[done..]) {
            Ok(0) if done == 0 => return Err(BridgeError::PeerClosed),
            Ok(0) => {
                return Err(BridgeError::comm(
                    context,
                    io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed mid-record"),
                ))
            }
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(BridgeError::comm(context, e)),
        }
    }
    Ok(())
}

pub(crate) fn write_all_deadline(
    conn: &mut TcpStream,
    buf: &[u8],
    deadline: Instant,
    context: &str,
) -> Result<()> {
    let mut done = 0usize;
    while done < buf.len() {
        let left = remaining(deadline, context)?;
        conn.set_write_timeout(Some(left))
            .map_err(|e| BridgeError::comm(context, e))?;
        match conn.write(&buf[done..]) {
            Ok(0) => {
                return Err(BridgeError::comm(
                    context,
                    io::Error::new(io::ErrorKind::WriteZero, "connection refused more data"),
                ))
            }
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(BridgeError::comm(context, e)),
        }
    }
    Ok(())
}

/// Send one bare header (acknowledgements, pings, end-of-request).
pub fn send_header(conn: &mut TcpStream, hdr: &MessageHeader, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    write_all_deadline(conn, &hdr.encode(), deadline, "send header to daemon")
}

/// Send one header+body message.
pub fn send_message(conn: &mut TcpStream, magic: u32, body: &Body, timeout: Duration) -> Result<()> {
    let mut raw = [0u8; MAX_MESSAGE];
    let body_len = codec::marshal_body(body, &mut raw[HDR_LEN..])?;
    let hdr = MessageHeader::new(magic, body.req_type(), body_len as u32);
    raw[..HDR_LEN].copy_from_slice(&hdr.encode());
    let deadline = Instant::now() + timeout;
    write_all_deadline(
        conn,
        &raw[..HDR_LEN + body_len],
        deadline,
        "send message to daemon",
    )
}

/// Receive one header. A connection closed before or during the header is an
/// error here; use [`recv_header_or_closed`] where a clean close is a valid
/// outcome.
pub fn recv_header(conn: &mut TcpStream, timeout: Duration) -> Result<MessageHeader> {
    match recv_header_or_closed(conn, timeout)? {
        Some(hdr) => Ok(hdr),
        None => Err(BridgeError::comm(
            "receive header from daemon",
            io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed"),
        )),
    }
}

/// Receive one header, treating a clean peer-initiated close (EOF before the
/// first byte) as `Ok(None)`. The event loop needs this to tell "peer hung
/// up" apart from a real failure.
pub fn recv_header_or_closed(
    conn: &mut TcpStream,
    timeout: Duration,
) -> Result<Option<MessageHeader>> {
    let deadline = Instant::now() + timeout;
    let mut raw = [0u8; HDR_LEN];
    match read_exact_deadline(conn, &mut raw, deadline, "receive header from daemon") {
        Ok(()) => Ok(Some(MessageHeader::decode(&raw)?)),
        Err(BridgeError::PeerClosed) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Receive the body announced by `hdr`. The length is validated against
/// `MAX_BODY` before any read happens.
pub fn recv_body(conn: &mut TcpStream, hdr: &MessageHeader, timeout: Duration) -> Result<Body> {
    let len = hdr.body_len()?;
    let mut raw = vec![0u8; len];
    let deadline = Instant::now() + timeout;
    match read_exact_deadline(conn, &mut raw, deadline, "receive body from daemon") {
        Ok(()) => {}
        // Body must follow its header; a close here is never clean
        Err(BridgeError::PeerClosed) => {
            return Err(BridgeError::comm(
                "receive body from daemon",
                io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed before body"),
            ))
        }
        Err(e) => return Err(e),
    }
    codec::unmarshal_body(hdr.req_type, &raw)
}

/// Send a header-only acknowledgement carrying `status`.
pub fn send_ack(conn: &mut TcpStream, magic: u32, status: i32, timeout: Duration) -> Result<()> {
    let hdr = MessageHeader::new(magic, msg::ACK, status as u32);
    send_header(conn, &hdr, timeout)
}

/// Receive an acknowledgement header and fail on a non-zero status.
pub fn recv_ack(conn: &mut TcpStream, timeout: Duration) -> Result<()> {
    let hdr = recv_header(conn, timeout)?;
    if hdr.req_type != msg::ACK {
        return Err(BridgeError::Malformed(format!(
            "expected acknowledgement, got request type {}",
            hdr.req_type
        )));
    }
    match hdr.status() {
        0 => Ok(()),
        status => Err(BridgeError::NegativeAck { status }),
    }
}
