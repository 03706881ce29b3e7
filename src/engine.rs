//! The protocol bridge engine: one mount session from volume hand-off to
//! end-of-session
//!
//! The engine owns every socket of the session through the catalogue, runs a
//! cooperative single-threaded readiness loop, and translates between the
//! legacy daemon protocol and the gateway's message objects. Dispatch goes
//! through two tables of plain `fn` pointers built once at construction: one
//! keyed by `(magic, request type)` for daemon messages, one keyed by reply
//! kind for gateway messages.

use std::collections::HashMap;
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::catalogue::{PendingClient, Ready, SocketCatalogue};
use crate::client_net;
use crate::client_proto::{ClientKind, FileToMigrate, FileToRecall, GatewayMessage, ReplyKind};
use crate::codec::{Body, DumpRequest, FileRequest, JobRequest, MessageHeader, TapeRequest};
use crate::error::{BridgeError, Result};
use crate::pending::PendingTransferTable;
use crate::protocol::{msg, proc_status, tape_mode, timeouts, JOB_MAGIC, TAPE_MAGIC};
use crate::tape_net;

/// The mount job descriptor handed in by the scheduler. Immutable for the
/// session's lifetime.
#[derive(Clone, Debug)]
pub struct MountJob {
    pub volume_req_id: u32,
    pub drive_unit: String,
    pub device_group: String,
    pub client_host: String,
    pub client_port: u16,
    pub client_user: String,
    pub client_euid: u32,
    pub client_egid: u32,
}

/// Per-session tunables; all externally owned configuration values.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub daemon_host: String,
    pub daemon_port: u16,
    /// Host the daemon calls back on; the bridge and daemon share a machine.
    pub callback_host: String,
    /// 0 picks an ephemeral callback port.
    pub callback_port: u16,
    pub daemon_timeout: Duration,
    pub gateway_timeout: Duration,
    pub select_tick: Duration,
    /// Liveness pings go out every this many quiet ticks.
    pub ping_interval_ticks: u64,
    /// Daemon thread-pool size + 1.
    pub max_io_conns: usize,
    pub pending_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            daemon_host: "127.0.0.1".into(),
            daemon_port: 5011,
            callback_host: "127.0.0.1".into(),
            callback_port: 0,
            daemon_timeout: timeouts::DAEMON_NET,
            gateway_timeout: timeouts::GATEWAY_NET,
            select_tick: timeouts::SELECT_TICK,
            ping_interval_ticks: 30,
            max_io_conns: 11,
            pending_capacity: 64,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MountMode {
    Migrate,
    Recall,
    Dump,
}

impl MountMode {
    pub fn from_wire(mode: u32) -> Result<Self> {
        match mode {
            tape_mode::WRITE => Ok(MountMode::Migrate),
            tape_mode::READ => Ok(MountMode::Recall),
            tape_mode::DUMP => Ok(MountMode::Dump),
            other => Err(BridgeError::Malformed(format!(
                "unknown mount mode {other}"
            ))),
        }
    }

    fn to_wire(self) -> u32 {
        match self {
            MountMode::Migrate => tape_mode::WRITE,
            MountMode::Recall => tape_mode::READ,
            MountMode::Dump => tape_mode::DUMP,
        }
    }
}

/// The volume the gateway asked us to mount. Immutable for the session.
#[derive(Clone, Debug)]
pub struct VolumeDescriptor {
    pub vid: String,
    pub label: String,
    pub density: String,
    pub mode: MountMode,
    pub client_kind: ClientKind,
    pub nb_files_on_tape: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    AwaitingMount,
    RunningMigrate,
    RunningRecall,
    RunningDump,
    Terminated,
}

/// Context of the daemon request whose acknowledgement was delayed while a
/// gateway round trip is in flight.
struct ReplyCtx {
    daemon_fd: RawFd,
    magic: u32,
    #[allow(dead_code)]
    req_type: u32,
    tape_path: String,
    transaction_id: u64,
}

type DaemonHandler = fn(&mut BridgeEngine, RawFd, MessageHeader) -> Result<()>;
type ClientHandler = fn(&mut BridgeEngine, ReplyCtx, GatewayMessage) -> Result<()>;

pub struct BridgeEngine {
    job: MountJob,
    cfg: BridgeConfig,
    /// Externally owned graceful-stop flag; polled, never mutated here.
    stop: Arc<AtomicBool>,
    /// Externally owned monotonically increasing transaction-id source.
    tx_counter: Arc<AtomicU64>,
    catalogue: SocketCatalogue,
    pending: PendingTransferTable,
    state: EngineState,
    volume: Option<VolumeDescriptor>,
    /// Next expected destination file-sequence number (write mode only).
    next_fseq: i32,
    end_of_req_count: u32,
    tick: u64,
    daemon_handlers: HashMap<(u32, u32), DaemonHandler>,
    client_handlers: HashMap<ReplyKind, ClientHandler>,
}

impl BridgeEngine {
    pub fn new(
        job: MountJob,
        cfg: BridgeConfig,
        stop: Arc<AtomicBool>,
        tx_counter: Arc<AtomicU64>,
    ) -> Self {
        let mut daemon_handlers: HashMap<(u32, u32), DaemonHandler> = HashMap::new();
        daemon_handlers.insert((TAPE_MAGIC, msg::FILE), Self::on_file_request);
        daemon_handlers.insert((TAPE_MAGIC, msg::FILE_ERR), Self::on_file_request_err);
        daemon_handlers.insert((TAPE_MAGIC, msg::TAPE), Self::on_tape_request);
        daemon_handlers.insert((TAPE_MAGIC, msg::TAPE_ERR), Self::on_tape_request_err);
        daemon_handlers.insert((TAPE_MAGIC, msg::END_OF_REQ), Self::on_end_of_request);
        daemon_handlers.insert((TAPE_MAGIC, msg::OUTPUT_LINE), Self::on_output_line);

        let mut client_handlers: HashMap<ReplyKind, ClientHandler> = HashMap::new();
        client_handlers.insert(ReplyKind::FilesToMigrateList, Self::on_file_to_migrate);
        client_handlers.insert(ReplyKind::FilesToRecallList, Self::on_file_to_recall);
        client_handlers.insert(ReplyKind::NoMoreFiles, Self::on_no_more_files);
        client_handlers.insert(
            ReplyKind::NotificationAcknowledge,
            Self::on_notification_ack,
        );
        client_handlers.insert(
            ReplyKind::EndNotificationErrorReport,
            Self::on_error_report,
        );

        let pending = PendingTransferTable::new(cfg.pending_capacity);
        let catalogue = SocketCatalogue::new(cfg.max_io_conns);
        Self {
            job,
            cfg,
            stop,
            tx_counter,
            catalogue,
            pending,
            state: EngineState::AwaitingMount,
            volume: None,
            next_fseq: 0,
            end_of_req_count: 0,
            tick: 0,
            daemon_handlers,
            client_handlers,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn volume(&self) -> Option<&VolumeDescriptor> {
        self.volume.as_ref()
    }

    /// Run the session to completion. Exactly one terminal outcome: success,
    /// or the first fatal error.
    pub fn run(&mut self) -> std::result::Result<(), BridgeError> {
        let outcome = self.run_inner();
        self.state = EngineState::Terminated;
        match &outcome {
            Ok(()) => {
                info!(vid = ?self.volume.as_ref().map(|v| v.vid.clone()), "mount session complete");
                // The session is already complete; a failed notification is
                // only worth a log line
                if let Err(e) = self.notify_end_of_session() {
                    warn!("end-of-session notification failed: {e}");
                }
            }
            Err(e) => {
                warn!("mount session failed: {e}");
                self.notify_end_of_session_error(e);
            }
        }
        outcome
    }

    fn run_inner(&mut self) -> Result<()> {
        self.check_stop()?;
        self.bootstrap()?;
        let volume = self.fetch_volume()?;
        info!(
            vid = %volume.vid,
            mode = ?volume.mode,
            "volume assigned"
        );
        self.next_fseq = first_write_fseq(volume.nb_files_on_tape)?;
        self.volume = Some(volume.clone());
        match volume.mode {
            MountMode::Migrate => {
                self.state = EngineState::RunningMigrate;
                self.run_migrate()
            }
            MountMode::Recall => {
                self.state = EngineState::RunningRecall;
                self.run_recall()
            }
            MountMode::Dump => {
                self.state = EngineState::RunningDump;
                self.run_dump()
            }
        }
    }

    // -----------------------------------------------------------------
    // Session bootstrap
    // -----------------------------------------------------------------

    /// Bind the callback listener, submit the job to the daemon, and accept
    /// the daemon's first callback as the persistent control connection.
    fn bootstrap(&mut self) -> Result<()> {
        let listener = TcpListener::bind((self.cfg.callback_host.as_str(), self.cfg.callback_port))
            .map_err(|e| BridgeError::comm("bind callback listener", e))?;
        let callback_port = listener
            .local_addr()
            .map_err(|e| BridgeError::comm("callback listener address", e))?
            .port();
        self.catalogue.set_listener(listener);

        self.submit_job(callback_port)?;

        // The first callback is the control connection
        let control = self.accept_callback()?;
        self.catalogue.set_control(control)?;
        debug!("control connection established");
        Ok(())
    }

    fn submit_job(&mut self, callback_port: u16) -> Result<()> {
        let mut conn = connect_with_timeout(
            &self.cfg.daemon_host,
            self.cfg.daemon_port,
            self.cfg.daemon_timeout,
        )?;
        let _ = conn.set_nodelay(true);
        let body = Body::Job(JobRequest {
            volume_req_id: self.job.volume_req_id,
            client_port: callback_port as u32,
            client_euid: self.job.client_euid,
            client_egid: self.job.client_egid,
            client_host: self.cfg.callback_host.clone(),
            device_group: self.job.device_group.clone(),
            drive_unit: self.job.drive_unit.clone(),
            client_user: self.job.client_user.clone(),
        });
        tape_net::send_message(&mut conn, JOB_MAGIC, &body, self.cfg.daemon_timeout)?;
        let hdr = tape_net::recv_header(&mut conn, self.cfg.daemon_timeout)?;
        if hdr.req_type != msg::JOB_REPLY {
            return Err(BridgeError::Malformed(format!(
                "expected job reply, got request type {}",
                hdr.req_type
            )));
        }
        match tape_net::recv_body(&mut conn, &hdr, self.cfg.daemon_timeout)? {
            Body::JobReply(reply) if reply.status == 0 => {
                debug!("job accepted by daemon");
                Ok(())
            }
            Body::JobReply(reply) => {
                warn!("daemon refused job: {}", reply.message);
                Err(BridgeError::NegativeAck {
                    status: reply.status,
                })
            }
            _ => Err(BridgeError::Malformed("job reply body mismatch".into())),
        }
        // Job connection closes here; the daemon calls back on its own
    }

    /// Wait for a callback connection, honouring the stop flag once per tick
    /// and rejecting non-local peers.
    fn accept_callback(&mut self) -> Result<TcpStream> {
        loop {
            self.check_stop()?;
            match self.catalogue.wait(self.cfg.select_tick)? {
                Some(Ready::Listener) => {
                    if let Some(conn) = self.accept_local()? {
                        return Ok(conn);
                    }
                }
                Some(other) => {
                    return Err(BridgeError::Malformed(format!(
                        "unexpected readiness {other:?} before control connection"
                    )))
                }
                None => {}
            }
        }
    }

    /// Accept one callback, returning `None` when the peer was not local.
    fn accept_local(&mut self) -> Result<Option<TcpStream>> {
        let listener = self
            .catalogue
            .listener()
            .ok_or_else(|| BridgeError::Malformed("no listener registered".into()))?;
        let (conn, peer) = listener
            .accept()
            .map_err(|e| BridgeError::comm("accept daemon callback", e))?;
        if !peer.ip().is_loopback() {
            warn!(%peer, "dropping non-local daemon callback");
            return Ok(None);
        }
        let _ = conn.set_nodelay(true);
        Ok(Some(conn))
    }

    /// Ask the gateway which volume this session is for.
    fn fetch_volume(&mut self) -> Result<VolumeDescriptor> {
        let request = GatewayMessage::VolumeRequest {
            mount_transaction_id: self.mount_tx(),
            transaction_id: self.next_tx(),
            drive_unit: self.job.drive_unit.clone(),
            device_group: self.job.device_group.clone(),
        };
        let reply = self.gateway_request_reply(&request)?;
        match reply {
            GatewayMessage::Volume {
                vid,
                label,
                density,
                mode,
                client_kind,
                nb_files_on_tape,
                ..
            } => Ok(VolumeDescriptor {
                vid,
                label,
                density,
                mode: MountMode::from_wire(mode)?,
                client_kind,
                nb_files_on_tape,
            }),
            other => Err(BridgeError::Malformed(format!(
                "expected volume reply, got {}",
                other.name()
            ))),
        }
    }

    // -----------------------------------------------------------------
    // Mount-mode procedures
    // -----------------------------------------------------------------

    fn run_migrate(&mut self) -> Result<()> {
        // Ask for the first file before touching the drive; an empty mount
        // releases the daemon without moving tape
        let first = self.fetch_first_migrate_file()?;
        let Some(file) = first else {
            info!("nothing to migrate, releasing drive");
            self.abort_daemon_best_effort();
            return Ok(());
        };

        self.hand_volume_to_daemon()?;
        self.give_file_on_control(&file)?;
        self.request_more_work_on_control()?;
        self.send_no_more_on_control()?;
        self.event_loop()
    }

    fn run_recall(&mut self) -> Result<()> {
        self.hand_volume_to_daemon()?;
        self.event_loop()
    }

    fn run_dump(&mut self) -> Result<()> {
        let params = self.fetch_dump_parameters()?;
        self.hand_volume_to_daemon()?;
        let control_timeout = self.cfg.daemon_timeout;
        let control = self.catalogue.control_mut()?;
        tape_net::send_message(control, TAPE_MAGIC, &Body::Dump(params), control_timeout)?;
        tape_net::recv_ack(control, control_timeout)?;
        self.event_loop()
    }

    /// Synchronous gateway round trip for the first file of a migration.
    /// Returns `None` when the gateway has nothing to write.
    fn fetch_first_migrate_file(&mut self) -> Result<Option<FileToMigrate>> {
        let request = GatewayMessage::FilesToMigrateListRequest {
            mount_transaction_id: self.mount_tx(),
            transaction_id: self.next_tx(),
            max_files: 1,
            max_bytes: u64::MAX,
        };
        match self.gateway_request_reply(&request)? {
            GatewayMessage::FilesToMigrateList { files, .. } => {
                let file = files.into_iter().next().ok_or_else(|| {
                    BridgeError::Malformed("empty files-to-migrate list".into())
                })?;
                self.check_migrate_fseq(file.tape_fseq)?;
                Ok(Some(file))
            }
            GatewayMessage::NoMoreFiles { .. } => Ok(None),
            other => Err(BridgeError::Malformed(format!(
                "expected migrate list, got {}",
                other.name()
            ))),
        }
    }

    fn fetch_dump_parameters(&mut self) -> Result<DumpRequest> {
        // Legacy tools dump with defaults; only the gateway is asked
        if self
            .volume
            .as_ref()
            .map(|v| v.client_kind != ClientKind::Gateway)
            .unwrap_or(true)
        {
            return Ok(DumpRequest {
                max_blocks: -1,
                max_files: -1,
                block_size: -1,
                from_file: -1,
                to_file: -1,
            });
        }
        let request = GatewayMessage::DumpParametersRequest {
            mount_transaction_id: self.mount_tx(),
            transaction_id: self.next_tx(),
        };
        match self.gateway_request_reply(&request)? {
            GatewayMessage::DumpParameters {
                max_blocks,
                max_files,
                block_size,
                from_file,
                to_file,
                ..
            } => Ok(DumpRequest {
                max_blocks,
                max_files,
                block_size,
                from_file,
                to_file,
            }),
            other => Err(BridgeError::Malformed(format!(
                "expected dump parameters, got {}",
                other.name()
            ))),
        }
    }

    fn hand_volume_to_daemon(&mut self) -> Result<()> {
        let volume = self
            .volume
            .as_ref()
            .ok_or_else(|| BridgeError::Malformed("no volume for session".into()))?;
        let body = Body::Tape(TapeRequest {
            vid: volume.vid.clone(),
            label: volume.label.clone(),
            density: volume.density.clone(),
            mode: volume.mode.to_wire(),
        });
        let timeout = self.cfg.daemon_timeout;
        let control = self.catalogue.control_mut()?;
        tape_net::send_message(control, TAPE_MAGIC, &body, timeout)?;
        tape_net::recv_ack(control, timeout)
    }

    /// Hand one migration file to the daemon over the control connection
    /// during session setup.
    fn give_file_on_control(&mut self, file: &FileToMigrate) -> Result<()> {
        let slot = self.pending.insert(file.file_transaction_id)?;
        let body = Body::File(FileRequest {
            tape_path: file.disk_path.clone(),
            tape_fseq: file.tape_fseq,
            disk_fseq: slot as i32,
            proc_status: proc_status::WAITING,
            bytes: file.size,
        });
        let timeout = self.cfg.daemon_timeout;
        let control = self.catalogue.control_mut()?;
        tape_net::send_message(control, TAPE_MAGIC, &body, timeout)?;
        tape_net::recv_ack(control, timeout)
    }

    /// Tell the daemon to come back for more work when it drains the list.
    fn request_more_work_on_control(&mut self) -> Result<()> {
        let body = Body::File(FileRequest {
            tape_path: String::new(),
            tape_fseq: -1,
            disk_fseq: -1,
            proc_status: proc_status::REQUEST_MORE_WORK,
            bytes: 0,
        });
        let timeout = self.cfg.daemon_timeout;
        let control = self.catalogue.control_mut()?;
        tape_net::send_message(control, TAPE_MAGIC, &body, timeout)?;
        tape_net::recv_ack(control, timeout)
    }

    fn send_no_more_on_control(&mut self) -> Result<()> {
        let timeout = self.cfg.daemon_timeout;
        let control = self.catalogue.control_mut()?;
        let hdr = MessageHeader::new(TAPE_MAGIC, msg::NO_MORE, 0);
        tape_net::send_header(control, &hdr, timeout)?;
        tape_net::recv_ack(control, timeout)
    }

    fn abort_daemon_best_effort(&mut self) {
        let timeout = self.cfg.daemon_timeout;
        if let Ok(control) = self.catalogue.control_mut() {
            let hdr = MessageHeader::new(TAPE_MAGIC, msg::ABORT, 0);
            if let Err(e) = tape_net::send_header(control, &hdr, timeout) {
                debug!("abort message not delivered: {e}");
            }
        }
    }

    // -----------------------------------------------------------------
    // Event loop
    // -----------------------------------------------------------------

    fn event_loop(&mut self) -> Result<()> {
        loop {
            self.check_stop()?;
            self.catalogue.check_timeouts(Instant::now())?;
            match self.catalogue.wait(self.cfg.select_tick)? {
                None => {
                    self.tick += 1;
                    if self.tick % self.cfg.ping_interval_ticks == 0 {
                        self.send_pings()?;
                    }
                }
                Some(Ready::Listener) => {
                    if let Some(conn) = self.accept_local()? {
                        self.catalogue.add_io_conn(conn)?;
                        debug!(
                            io_conns = self.catalogue.io_conn_count(),
                            "daemon opened I/O control connection"
                        );
                    }
                }
                Some(Ready::Control) => {
                    // The daemon never sends unsolicited data here
                    return Err(BridgeError::Malformed(
                        "unsolicited data on control connection".into(),
                    ));
                }
                Some(Ready::IoConn(fd)) => self.handle_io_conn(fd)?,
                Some(Ready::ClientConn(fd)) => self.handle_client_conn(fd)?,
            }
            if self.session_complete() {
                return self.finish_session();
            }
        }
    }

    fn check_stop(&self) -> Result<()> {
        if self.stop.load(Ordering::Relaxed) {
            return Err(BridgeError::Cancelled);
        }
        Ok(())
    }

    fn session_complete(&self) -> bool {
        self.end_of_req_count > 0
            && self.catalogue.io_conn_count() == 0
            && self.catalogue.client_conn_count() == 0
    }

    /// Final end-of-request handshake on the control connection.
    fn finish_session(&mut self) -> Result<()> {
        let timeout = self.cfg.daemon_timeout;
        let control = self.catalogue.control_mut()?;
        let hdr = MessageHeader::new(TAPE_MAGIC, msg::END_OF_REQ, 0);
        tape_net::send_header(control, &hdr, timeout)?;
        tape_net::recv_ack(control, timeout)?;
        debug!("end-of-request handshake complete");
        Ok(())
    }

    fn send_pings(&mut self) -> Result<()> {
        let critical = matches!(
            self.state,
            EngineState::RunningRecall | EngineState::RunningDump
        );
        if let Err(e) = self.ping_daemon() {
            if critical {
                return Err(e);
            }
            warn!("daemon ping failed, will retry next interval: {e}");
        }
        let gateway_kind = self
            .volume
            .as_ref()
            .map(|v| v.client_kind == ClientKind::Gateway)
            .unwrap_or(false);
        if gateway_kind {
            if let Err(e) = self.ping_gateway() {
                if critical {
                    return Err(e);
                }
                warn!("gateway ping failed, will retry next interval: {e}");
            }
        }
        Ok(())
    }

    fn ping_daemon(&mut self) -> Result<()> {
        let timeout = self.cfg.daemon_timeout;
        let control = self.catalogue.control_mut()?;
        let hdr = MessageHeader::new(TAPE_MAGIC, msg::PING, 0);
        tape_net::send_header(control, &hdr, timeout)?;
        tape_net::recv_ack(control, timeout)
    }

    fn ping_gateway(&mut self) -> Result<()> {
        let request = GatewayMessage::Ping {
            mount_transaction_id: self.mount_tx(),
            transaction_id: self.next_tx(),
        };
        match self.gateway_request_reply(&request)? {
            GatewayMessage::NotificationAcknowledge { .. } => Ok(()),
            other => Err(BridgeError::Malformed(format!(
                "expected ping acknowledge, got {}",
                other.name()
            ))),
        }
    }

    // -----------------------------------------------------------------
    // Daemon-side events (I/O control connections)
    // -----------------------------------------------------------------

    fn handle_io_conn(&mut self, fd: RawFd) -> Result<()> {
        let timeout = self.cfg.daemon_timeout;
        let conn = self.catalogue.io_conn_mut(fd)?;
        let hdr = match tape_net::recv_header_or_closed(conn, timeout)? {
            Some(hdr) => hdr,
            None => {
                // Clean peer close is a valid outcome on this path
                let conn = self.catalogue.release_io_conn(fd)?;
                drop(conn);
                debug!(
                    io_conns = self.catalogue.io_conn_count(),
                    "daemon closed I/O control connection"
                );
                return Ok(());
            }
        };
        let handler = *self
            .daemon_handlers
            .get(&(hdr.magic, hdr.req_type))
            .ok_or_else(|| {
                BridgeError::Malformed(format!(
                    "no handler for magic 0x{:08x} request type {}",
                    hdr.magic, hdr.req_type
                ))
            })?;
        handler(self, fd, hdr)
    }

    fn recv_io_body(&mut self, fd: RawFd, hdr: &MessageHeader) -> Result<Body> {
        let timeout = self.cfg.daemon_timeout;
        let conn = self.catalogue.io_conn_mut(fd)?;
        tape_net::recv_body(conn, hdr, timeout)
    }

    fn ack_io(&mut self, fd: RawFd, status: i32) -> Result<()> {
        let timeout = self.cfg.daemon_timeout;
        let conn = self.catalogue.io_conn_mut(fd)?;
        tape_net::send_ack(conn, TAPE_MAGIC, status, timeout)
    }

    fn on_file_request(&mut self, fd: RawFd, hdr: MessageHeader) -> Result<()> {
        let Body::File(file) = self.recv_io_body(fd, &hdr)? else {
            return Err(BridgeError::Malformed("file request body mismatch".into()));
        };
        self.dispatch_file_request(fd, hdr, file)
    }

    fn on_file_request_err(&mut self, fd: RawFd, hdr: MessageHeader) -> Result<()> {
        let Body::FileErr(file, report) = self.recv_io_body(fd, &hdr)? else {
            return Err(BridgeError::Malformed("file request body mismatch".into()));
        };
        if report.code != 0 {
            return Err(BridgeError::ReportedError {
                code: report.code,
                message: report.message,
            });
        }
        self.dispatch_file_request(fd, hdr, file)
    }

    fn dispatch_file_request(
        &mut self,
        fd: RawFd,
        hdr: MessageHeader,
        file: FileRequest,
    ) -> Result<()> {
        match file.proc_status {
            proc_status::REQUEST_MORE_WORK => self.start_more_work_round_trip(fd, hdr, file),
            proc_status::FINISHED => self.start_finished_round_trip(fd, hdr, file),
            proc_status::POSITIONED => {
                debug!(fseq = file.tape_fseq, "daemon positioned to file");
                self.ack_io(fd, 0)
            }
            other => Err(BridgeError::Malformed(format!(
                "unexpected proc status {other}"
            ))),
        }
    }

    /// The daemon wants another file. Ask the gateway asynchronously and
    /// delay the daemon's acknowledgement until the reply is handled.
    fn start_more_work_round_trip(
        &mut self,
        fd: RawFd,
        hdr: MessageHeader,
        file: FileRequest,
    ) -> Result<()> {
        let mode = self.mode()?;
        let transaction_id = self.next_tx();
        let request = match mode {
            MountMode::Migrate => GatewayMessage::FilesToMigrateListRequest {
                mount_transaction_id: self.mount_tx(),
                transaction_id,
                max_files: 1,
                max_bytes: u64::MAX,
            },
            MountMode::Recall => GatewayMessage::FilesToRecallListRequest {
                mount_transaction_id: self.mount_tx(),
                transaction_id,
                max_files: 1,
                max_bytes: u64::MAX,
            },
            MountMode::Dump => {
                return Err(BridgeError::Malformed(
                    "daemon requested work during a dump".into(),
                ))
            }
        };
        self.start_gateway_round_trip(fd, hdr, file.tape_path, transaction_id, request)
    }

    /// A transfer completed; map the slot back to the gateway's file
    /// transaction and notify asynchronously.
    fn start_finished_round_trip(
        &mut self,
        fd: RawFd,
        hdr: MessageHeader,
        file: FileRequest,
    ) -> Result<()> {
        if file.disk_fseq < 0 {
            return Err(BridgeError::Malformed(format!(
                "negative pending-transfer slot {}",
                file.disk_fseq
            )));
        }
        let file_transaction_id = self.pending.remove(file.disk_fseq as usize)?;
        let mode = self.mode()?;
        let transaction_id = self.next_tx();
        let request = match mode {
            MountMode::Migrate => GatewayMessage::FileMigratedNotification {
                mount_transaction_id: self.mount_tx(),
                transaction_id,
                file_transaction_id,
                tape_fseq: file.tape_fseq,
                bytes: file.bytes,
            },
            MountMode::Recall => GatewayMessage::FileRecalledNotification {
                mount_transaction_id: self.mount_tx(),
                transaction_id,
                file_transaction_id,
                tape_fseq: file.tape_fseq,
                bytes: file.bytes,
            },
            MountMode::Dump => {
                return Err(BridgeError::Malformed(
                    "file completion during a dump".into(),
                ))
            }
        };
        info!(
            fseq = file.tape_fseq,
            bytes = file.bytes,
            "file transfer finished"
        );
        self.start_gateway_round_trip(fd, hdr, file.tape_path, transaction_id, request)
    }

    fn start_gateway_round_trip(
        &mut self,
        fd: RawFd,
        hdr: MessageHeader,
        tape_path: String,
        transaction_id: u64,
        request: GatewayMessage,
    ) -> Result<()> {
        let conn = client_net::send_and_leave_open(
            &self.job.client_host,
            self.job.client_port,
            self.cfg.gateway_timeout,
            &request,
        )?;
        self.catalogue.add_client_conn(PendingClient {
            conn,
            daemon_fd: fd,
            magic: hdr.magic,
            req_type: hdr.req_type,
            tape_path,
            transaction_id,
            requested_at: Instant::now(),
            timeout: self.cfg.gateway_timeout,
        });
        Ok(())
    }

    fn on_tape_request(&mut self, fd: RawFd, hdr: MessageHeader) -> Result<()> {
        let Body::Tape(tape) = self.recv_io_body(fd, &hdr)? else {
            return Err(BridgeError::Malformed("tape request body mismatch".into()));
        };
        debug!(vid = %tape.vid, "daemon reported tape state");
        self.ack_io(fd, 0)
    }

    fn on_tape_request_err(&mut self, fd: RawFd, hdr: MessageHeader) -> Result<()> {
        let Body::TapeErr(tape, report) = self.recv_io_body(fd, &hdr)? else {
            return Err(BridgeError::Malformed("tape request body mismatch".into()));
        };
        if report.code != 0 {
            return Err(BridgeError::ReportedError {
                code: report.code,
                message: report.message,
            });
        }
        debug!(vid = %tape.vid, "daemon reported tape state");
        self.ack_io(fd, 0)
    }

    fn on_end_of_request(&mut self, fd: RawFd, hdr: MessageHeader) -> Result<()> {
        if hdr.len_or_status != 0 {
            return Err(BridgeError::Malformed(
                "end-of-request carries no body".into(),
            ));
        }
        self.ack_io(fd, 0)?;
        self.end_of_req_count += 1;
        let conn = self.catalogue.release_io_conn(fd)?;
        drop(conn);
        debug!(
            end_of_req = self.end_of_req_count,
            io_conns = self.catalogue.io_conn_count(),
            "end-of-request received"
        );
        Ok(())
    }

    fn on_output_line(&mut self, fd: RawFd, hdr: MessageHeader) -> Result<()> {
        let Body::OutputLine(line) = self.recv_io_body(fd, &hdr)? else {
            return Err(BridgeError::Malformed("output line body mismatch".into()));
        };
        info!(target: "tapebridge::operator", "{line}");
        if self.mode()? == MountMode::Dump {
            let request = GatewayMessage::DumpNotification {
                mount_transaction_id: self.mount_tx(),
                transaction_id: self.next_tx(),
                message: line,
            };
            match self.gateway_request_reply(&request)? {
                GatewayMessage::NotificationAcknowledge { .. } => {}
                other => {
                    return Err(BridgeError::Malformed(format!(
                        "expected notification acknowledge, got {}",
                        other.name()
                    )))
                }
            }
        }
        self.ack_io(fd, 0)
    }

    // -----------------------------------------------------------------
    // Gateway-side events (pending client connections)
    // -----------------------------------------------------------------

    fn handle_client_conn(&mut self, fd: RawFd) -> Result<()> {
        let pending = self.catalogue.release_client_conn(fd)?;
        // Remaining budget for the late reply, floored so a reply that just
        // made the readiness cut still gets read
        let elapsed = pending.requested_at.elapsed();
        let budget = pending
            .timeout
            .saturating_sub(elapsed)
            .max(timeouts::REPLY_FLOOR);
        let ctx = ReplyCtx {
            daemon_fd: pending.daemon_fd,
            magic: pending.magic,
            req_type: pending.req_type,
            tape_path: pending.tape_path,
            transaction_id: pending.transaction_id,
        };
        let reply = client_net::receive_and_close(pending.conn, budget)?;
        if reply.mount_transaction_id() != self.mount_tx() {
            return Err(BridgeError::TransactionMismatch {
                sent: self.mount_tx(),
                received: reply.mount_transaction_id(),
            });
        }
        if reply.transaction_id() != ctx.transaction_id {
            return Err(BridgeError::TransactionMismatch {
                sent: ctx.transaction_id,
                received: reply.transaction_id(),
            });
        }
        let kind = reply.reply_kind().ok_or_else(|| {
            BridgeError::Malformed(format!("unexpected gateway message {}", reply.name()))
        })?;
        let handler = *self.client_handlers.get(&kind).ok_or_else(|| {
            BridgeError::Malformed(format!("no handler for gateway reply {}", reply.name()))
        })?;
        handler(self, ctx, reply)
    }

    fn on_file_to_migrate(&mut self, ctx: ReplyCtx, reply: GatewayMessage) -> Result<()> {
        let GatewayMessage::FilesToMigrateList { files, .. } = reply else {
            return Err(BridgeError::Malformed("migrate list mismatch".into()));
        };
        let file = files
            .into_iter()
            .next()
            .ok_or_else(|| BridgeError::Malformed("empty files-to-migrate list".into()))?;
        self.check_migrate_fseq(file.tape_fseq)?;
        let slot = self.pending.insert(file.file_transaction_id)?;
        self.give_file_on_io_conn(
            ctx.daemon_fd,
            ctx.magic,
            FileRequest {
                tape_path: file.disk_path,
                tape_fseq: file.tape_fseq,
                disk_fseq: slot as i32,
                proc_status: proc_status::WAITING,
                bytes: file.size,
            },
        )
    }

    fn on_file_to_recall(&mut self, ctx: ReplyCtx, reply: GatewayMessage) -> Result<()> {
        let GatewayMessage::FilesToRecallList { files, .. } = reply else {
            return Err(BridgeError::Malformed("recall list mismatch".into()));
        };
        let file: FileToRecall = files
            .into_iter()
            .next()
            .ok_or_else(|| BridgeError::Malformed("empty files-to-recall list".into()))?;
        let slot = self.pending.insert(file.file_transaction_id)?;
        self.give_file_on_io_conn(
            ctx.daemon_fd,
            ctx.magic,
            FileRequest {
                tape_path: file.disk_path,
                tape_fseq: file.tape_fseq,
                disk_fseq: slot as i32,
                proc_status: proc_status::WAITING,
                bytes: 0,
            },
        )
    }

    /// Hand-off to the daemon on the connection that asked for work, then
    /// the delayed acknowledgement of the original request.
    fn give_file_on_io_conn(&mut self, fd: RawFd, magic: u32, file: FileRequest) -> Result<()> {
        let timeout = self.cfg.daemon_timeout;
        let conn = self.catalogue.io_conn_mut(fd)?;
        tape_net::send_message(conn, magic, &Body::File(file), timeout)?;
        self.ack_io(fd, 0)
    }

    fn on_no_more_files(&mut self, ctx: ReplyCtx, _reply: GatewayMessage) -> Result<()> {
        debug!("gateway has no more files");
        let timeout = self.cfg.daemon_timeout;
        let conn = self.catalogue.io_conn_mut(ctx.daemon_fd)?;
        let hdr = MessageHeader::new(ctx.magic, msg::NO_MORE, 0);
        tape_net::send_header(conn, &hdr, timeout)?;
        self.ack_io(ctx.daemon_fd, 0)
    }

    fn on_notification_ack(&mut self, ctx: ReplyCtx, _reply: GatewayMessage) -> Result<()> {
        // Gateway took the notification; release the daemon
        self.ack_io(ctx.daemon_fd, 0)
    }

    fn on_error_report(&mut self, ctx: ReplyCtx, reply: GatewayMessage) -> Result<()> {
        let GatewayMessage::EndNotificationErrorReport { code, message, .. } = reply else {
            return Err(BridgeError::Malformed("error report mismatch".into()));
        };
        warn!(
            code,
            tape_path = %ctx.tape_path,
            "gateway reported an error"
        );
        Err(BridgeError::ReportedError { code, message })
    }

    // -----------------------------------------------------------------
    // Shared helpers
    // -----------------------------------------------------------------

    fn mode(&self) -> Result<MountMode> {
        self.volume
            .as_ref()
            .map(|v| v.mode)
            .ok_or_else(|| BridgeError::Malformed("no volume for session".into()))
    }

    /// Session request id used as the mount transaction id on every gateway
    /// message.
    fn mount_tx(&self) -> u64 {
        self.job.volume_req_id as u64
    }

    fn next_tx(&mut self) -> u64 {
        self.tx_counter.fetch_add(1, Ordering::SeqCst)
    }

    fn gateway_request_reply(&self, request: &GatewayMessage) -> Result<GatewayMessage> {
        client_net::request_reply(
            &self.job.client_host,
            self.job.client_port,
            self.cfg.gateway_timeout,
            request,
        )
    }

    /// Strictly increasing file sequence while writing; gateway-kind clients
    /// must match exactly.
    fn check_migrate_fseq(&mut self, fseq: i32) -> Result<()> {
        let gateway_kind = self
            .volume
            .as_ref()
            .map(|v| v.client_kind == ClientKind::Gateway)
            // The first list request runs before the volume is known only in
            // tests; sequencing applies from the volume reply onwards
            .unwrap_or(true);
        if !gateway_kind {
            return Ok(());
        }
        if fseq != self.next_fseq {
            return Err(BridgeError::SequenceViolation {
                expected: self.next_fseq,
                got: fseq,
            });
        }
        self.next_fseq += 1;
        Ok(())
    }

    fn notify_end_of_session(&mut self) -> Result<()> {
        let request = GatewayMessage::EndNotification {
            mount_transaction_id: self.mount_tx(),
            transaction_id: self.next_tx(),
        };
        match self.gateway_request_reply(&request)? {
            GatewayMessage::NotificationAcknowledge { .. } => Ok(()),
            other => Err(BridgeError::Malformed(format!(
                "expected notification acknowledge, got {}",
                other.name()
            ))),
        }
    }

    /// Best-effort failure notification; the session error stands either way.
    fn notify_end_of_session_error(&mut self, error: &BridgeError) {
        let code = match error {
            BridgeError::ReportedError { code, .. } => *code,
            BridgeError::NegativeAck { status } => *status,
            _ => -1,
        };
        let request = GatewayMessage::EndNotificationError {
            mount_transaction_id: self.mount_tx(),
            transaction_id: self.next_tx(),
            code,
            message: error.to_string(),
        };
        if let Err(e) = self.gateway_request_reply(&request) {
            debug!("end-of-session error notification not delivered: {e}");
        }
    }
}

/// First file-sequence number to write, derived from the gateway's count of
/// files already on the tape. The count must leave the sequence
/// representable in the legacy protocol's signed field.
fn first_write_fseq(nb_files_on_tape: u32) -> Result<i32> {
    if nb_files_on_tape >= i32::MAX as u32 {
        return Err(BridgeError::Malformed(format!(
            "implausible files-on-tape count {nb_files_on_tape}"
        )));
    }
    Ok(nb_files_on_tape as i32 + 1)
}

fn connect_with_timeout(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let context = "connect to daemon";
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| BridgeError::comm(context, e))?;
    let mut last = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(conn) => return Ok(conn),
            Err(e) => last = Some(e),
        }
    }
    Err(BridgeError::comm(
        context,
        last.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "no address resolved")
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> MountJob {
        MountJob {
            volume_req_id: 7,
            drive_unit: "drive0".into(),
            device_group: "LTO9".into(),
            client_host: "127.0.0.1".into(),
            client_port: 0,
            client_user: "stage".into(),
            client_euid: 1001,
            client_egid: 1001,
        }
    }

    fn engine() -> BridgeEngine {
        BridgeEngine::new(
            job(),
            BridgeConfig::default(),
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicU64::new(1)),
        )
    }

    #[test]
    fn mount_mode_maps_both_ways() {
        assert_eq!(
            MountMode::from_wire(tape_mode::WRITE).unwrap(),
            MountMode::Migrate
        );
        assert_eq!(
            MountMode::from_wire(tape_mode::READ).unwrap(),
            MountMode::Recall
        );
        assert_eq!(
            MountMode::from_wire(tape_mode::DUMP).unwrap(),
            MountMode::Dump
        );
        assert!(MountMode::from_wire(99).is_err());
        assert_eq!(MountMode::Migrate.to_wire(), tape_mode::WRITE);
    }

    #[test]
    fn engine_starts_awaiting_mount() {
        let engine = engine();
        assert_eq!(engine.state(), EngineState::AwaitingMount);
        assert!(engine.volume().is_none());
    }

    #[test]
    fn transaction_ids_increase_monotonically() {
        let mut engine = engine();
        let a = engine.next_tx();
        let b = engine.next_tx();
        let c = engine.next_tx();
        assert!(a < b && b < c);
    }

    #[test]
    fn migrate_fseq_must_advance_by_one() {
        let mut engine = engine();
        engine.volume = Some(VolumeDescriptor {
            vid: "T00042".into(),
            label: "aul".into(),
            density: "18TC".into(),
            mode: MountMode::Migrate,
            client_kind: ClientKind::Gateway,
            nb_files_on_tape: 3,
        });
        engine.next_fseq = 4;
        engine.check_migrate_fseq(4).unwrap();
        engine.check_migrate_fseq(5).unwrap();
        let err = engine.check_migrate_fseq(7).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::SequenceViolation {
                expected: 6,
                got: 7
            }
        ));
    }

    #[test]
    fn legacy_tool_clients_skip_sequencing() {
        let mut engine = engine();
        engine.volume = Some(VolumeDescriptor {
            vid: "T00042".into(),
            label: "aul".into(),
            density: "18TC".into(),
            mode: MountMode::Migrate,
            client_kind: ClientKind::LegacyTool,
            nb_files_on_tape: 0,
        });
        engine.next_fseq = 1;
        engine.check_migrate_fseq(9).unwrap();
        engine.check_migrate_fseq(2).unwrap();
    }

    #[test]
    fn files_on_tape_count_is_bounded() {
        assert_eq!(first_write_fseq(0).unwrap(), 1);
        assert_eq!(first_write_fseq(3).unwrap(), 4);
        assert_eq!(first_write_fseq(i32::MAX as u32 - 1).unwrap(), i32::MAX);
        assert!(first_write_fseq(i32::MAX as u32).is_err());
        assert!(first_write_fseq(u32::MAX).is_err());
    }

    #[test]
    fn cancelled_before_any_network_contact() {
        let stop = Arc::new(AtomicBool::new(true));
        let mut engine = BridgeEngine::new(
            job(),
            BridgeConfig::default(),
            stop,
            Arc::new(AtomicU64::new(1)),
        );
        // client_port 0 means any gateway contact would fail loudly; the
        // stop flag must win first
        let err = engine.run_inner().unwrap_err();
        assert!(matches!(err, BridgeError::Cancelled));
    }
}
