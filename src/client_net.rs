//! Request/reply transactions against the tape gateway
//!
//! Each transaction opens a fresh TCP connection, writes one message object
//! and either leaves the connection open for an asynchronous reply (the
//! event loop registers it in the socket catalogue) or reads the single
//! reply and closes. Replies are verified against the request's correlation
//! fields before the caller sees them.

use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use crate::client_proto::{self, GatewayMessage};
use crate::error::{BridgeError, Result};
use crate::tape_net::{read_exact_deadline, remaining, write_all_deadline};

fn connect(host: &str, port: u16, deadline: Instant) -> Result<TcpStream> {
    let context = "connect to gateway";
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| BridgeError::comm(context, e))?;
    let mut last = None;
    for addr in addrs {
        let left = remaining(deadline, context)?;
        match TcpStream::connect_timeout(&addr, left) {
            Ok(conn) => {
                let _ = conn.set_nodelay(true);
                return Ok(conn);
            }
            Err(e) => last = Some(e),
        }
    }
    Err(BridgeError::comm(
        context,
        last.unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address resolved")),
    ))
}

fn send_frame(conn: &mut TcpStream, message: &GatewayMessage, deadline: Instant) -> Result<()> {
    let frame = client_proto::encode_frame(message)?;
    write_all_deadline(conn, &frame, deadline, "send request to gateway")
}

fn recv_message(conn: &mut TcpStream, deadline: Instant) -> Result<GatewayMessage> {
    let context = "receive reply from gateway";
    let mut prefix = [0u8; 4];
    match read_exact_deadline(conn, &mut prefix, deadline, context) {
        Ok(()) => {}
        // The gateway owes us a reply; hanging up instead is a failure
        Err(BridgeError::PeerClosed) => {
            return Err(BridgeError::comm(
                context,
                io::Error::new(io::ErrorKind::UnexpectedEof, "gateway closed without replying"),
            ))
        }
        Err(e) => return Err(e),
    }
    let len = client_proto::decode_frame_len(prefix)?;
    let mut payload = vec![0u8; len];
    match read_exact_deadline(conn, &mut payload, deadline, context) {
        Ok(()) => {}
        Err(BridgeError::PeerClosed) => {
            return Err(BridgeError::comm(
                context,
                io::Error::new(io::ErrorKind::UnexpectedEof, "gateway closed mid-reply"),
            ))
        }
        Err(e) => return Err(e),
    }
    client_proto::decode_payload(&payload)
}

/// Check a reply's correlation fields against the request that produced it
/// and translate an error-report reply into a failure outcome.
pub fn check_reply(request: &GatewayMessage, reply: GatewayMessage) -> Result<GatewayMessage> {
    if reply.mount_transaction_id() != request.mount_transaction_id() {
        return Err(BridgeError::TransactionMismatch {
            sent: request.mount_transaction_id(),
            received: reply.mount_transaction_id(),
        });
    }
    if reply.transaction_id() != request.transaction_id() {
        return Err(BridgeError::TransactionMismatch {
            sent: request.transaction_id(),
            received: reply.transaction_id(),
        });
    }
    if let GatewayMessage::EndNotificationErrorReport { code, message, .. } = reply {
        return Err(BridgeError::ReportedError { code, message });
    }
    Ok(reply)
}

/// Open a connection, send one message, and hand back the still-open
/// connection for the caller to register for an asynchronous reply.
pub fn send_and_leave_open(
    host: &str,
    port: u16,
    timeout: Duration,
    message: &GatewayMessage,
) -> Result<TcpStream> {
    let deadline = Instant::now() + timeout;
    let mut conn = connect(host, port, deadline)?;
    send_frame(&mut conn, message, deadline)?;
    Ok(conn)
}

/// Read exactly one reply and close the connection. The connection is
/// consumed, so it is closed on every exit path including errors.
pub fn receive_and_close(mut conn: TcpStream, timeout: Duration) -> Result<GatewayMessage> {
    let deadline = Instant::now() + timeout;
    recv_message(&mut conn, deadline)
}

/// Synchronous connect+send+receive+close round trip with correlation
/// verification; used for short exchanges such as pings and dump-parameter
/// queries.
pub fn request_reply(
    host: &str,
    port: u16,
    timeout: Duration,
    message: &GatewayMessage,
) -> Result<GatewayMessage> {
    let deadline = Instant::now() + timeout;
    let mut conn = connect(host, port, deadline)?;
    send_frame(&mut conn, message, deadline)?;
    let reply = recv_message(&mut conn, deadline)?;
    check_reply(message, reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;
    use std::thread;

    /// One-shot fake gateway: accept a connection, decode the request, reply
    /// with whatever `respond` produces.
    fn fake_gateway<F>(respond: F) -> (u16, thread::JoinHandle<GatewayMessage>)
    where
        F: FnOnce(&GatewayMessage) -> Option<GatewayMessage> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let deadline = Instant::now() + Duration::from_secs(5);
            let request = recv_message(&mut conn, deadline).unwrap();
            if let Some(reply) = respond(&request) {
                let frame = client_proto::encode_frame(&reply).unwrap();
                write_all_deadline(&mut conn, &frame, deadline, "test reply").unwrap();
            }
            // Confirm the bridge closed its end
            let mut scratch = [0u8; 1];
            assert_eq!(conn.read(&mut scratch).unwrap(), 0);
            request
        });
        (port, handle)
    }

    fn ping(tx: u64) -> GatewayMessage {
        GatewayMessage::Ping {
            mount_transaction_id: 7,
            transaction_id: tx,
        }
    }

    #[test]
    fn request_reply_round_trip_closes_the_connection() {
        let (port, gateway) = fake_gateway(|req| {
            Some(GatewayMessage::NotificationAcknowledge {
                mount_transaction_id: req.mount_transaction_id(),
                transaction_id: req.transaction_id(),
            })
        });
        let reply = request_reply("127.0.0.1", port, Duration::from_secs(5), &ping(1)).unwrap();
        assert!(matches!(reply, GatewayMessage::NotificationAcknowledge { .. }));
        assert_eq!(gateway.join().unwrap().name(), "Ping");
    }

    #[test]
    fn mismatched_transaction_id_is_fatal() {
        let (port, gateway) = fake_gateway(|req| {
            Some(GatewayMessage::NotificationAcknowledge {
                mount_transaction_id: req.mount_transaction_id(),
                transaction_id: req.transaction_id() + 1,
            })
        });
        let err = request_reply("127.0.0.1", port, Duration::from_secs(5), &ping(4)).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::TransactionMismatch {
                sent: 4,
                received: 5
            }
        ));
        gateway.join().unwrap();
    }

    #[test]
    fn error_report_reply_becomes_reported_error() {
        let (port, gateway) = fake_gateway(|req| {
            Some(GatewayMessage::EndNotificationErrorReport {
                mount_transaction_id: req.mount_transaction_id(),
                transaction_id: req.transaction_id(),
                code: 28,
                message: "no space in staging pool".into(),
            })
        });
        let err = request_reply("127.0.0.1", port, Duration::from_secs(5), &ping(9)).unwrap_err();
        match err {
            BridgeError::ReportedError { code, message } => {
                assert_eq!(code, 28);
                assert_eq!(message, "no space in staging pool");
            }
            other => panic!("unexpected error: {other}"),
        }
        gateway.join().unwrap();
    }

    #[test]
    fn send_and_leave_open_supports_a_later_reply() {
        let (port, gateway) = fake_gateway(|req| {
            Some(GatewayMessage::NoMoreFiles {
                mount_transaction_id: req.mount_transaction_id(),
                transaction_id: req.transaction_id(),
            })
        });
        let request = GatewayMessage::FilesToMigrateListRequest {
            mount_transaction_id: 7,
            transaction_id: 2,
            max_files: 1,
            max_bytes: u64::MAX,
        };
        let conn = send_and_leave_open("127.0.0.1", port, Duration::from_secs(5), &request).unwrap();
        let reply = receive_and_close(conn, Duration::from_secs(5)).unwrap();
        let reply = check_reply(&request, reply).unwrap();
        assert!(matches!(reply, GatewayMessage::NoMoreFiles { .. }));
        gateway.join().unwrap();
    }

    #[test]
    fn gateway_hanging_up_without_reply_is_a_communication_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (conn, _) = listener.accept().unwrap();
            drop(conn);
        });
        let err = request_reply("127.0.0.1", port, Duration::from_secs(5), &ping(1)).unwrap_err();
        assert!(matches!(err, BridgeError::Communication { .. }));
        server.join().unwrap();
    }
}
