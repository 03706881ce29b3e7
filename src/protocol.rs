//! Shared wire constants for the legacy tape-daemon protocol

// Protocol family magics (header field 0)
pub const TAPE_MAGIC: u32 = 0x5450_4252; // "TPBR"
pub const JOB_MAGIC: u32 = 0x5450_4A42; // "TPJB"

/// Header is three big-endian u32 fields: magic, req_type, len_or_status
pub const HDR_LEN: usize = 12;

// Maximum marshalled body size - bounds every read before it happens
pub const MAX_BODY: usize = 4096;
pub const MAX_MESSAGE: usize = HDR_LEN + MAX_BODY;

// Fixed text field widths (NUL-padded on the wire)
pub const HOST_LEN: usize = 64;
pub const NAME_LEN: usize = 16;
pub const VID_LEN: usize = 8;
pub const LABEL_LEN: usize = 4;
pub const DENSITY_LEN: usize = 8;
pub const PATH_LEN: usize = 64;
pub const ERRMSG_LEN: usize = 256;

// Request type IDs (keep numeric stable for compat with the legacy daemon)
pub mod msg {
    pub const JOB: u32 = 1;
    pub const JOB_REPLY: u32 = 2;
    pub const TAPE: u32 = 3;
    pub const TAPE_ERR: u32 = 4;
    pub const FILE: u32 = 5;
    pub const FILE_ERR: u32 = 6;
    pub const DUMP: u32 = 7;
    pub const NO_MORE: u32 = 8;
    pub const END_OF_REQ: u32 = 9;
    pub const ABORT: u32 = 10;
    pub const PING: u32 = 11;
    pub const OUTPUT_LINE: u32 = 12;
    pub const ACK: u32 = 13;
}

// FileRequest.proc_status values
pub mod proc_status {
    pub const WAITING: i32 = 0;
    pub const REQUEST_MORE_WORK: i32 = 1;
    pub const POSITIONED: i32 = 2;
    pub const FINISHED: i32 = 3;
}

// Tape access modes carried in TapeRequest.mode
pub mod tape_mode {
    pub const READ: u32 = 0;
    pub const WRITE: u32 = 1;
    pub const DUMP: u32 = 2;
}

// Centralized timeout defaults; BridgeConfig carries the live values
pub mod timeouts {
    use std::time::Duration;

    // Reads/writes against the tape daemon
    pub const DAEMON_NET: Duration = Duration::from_secs(5);

    // One gateway round trip (connect + send + receive)
    pub const GATEWAY_NET: Duration = Duration::from_secs(5);

    // Readiness wait per loop iteration; bounds how stale the stop flag
    // and the ping clock can get
    pub const SELECT_TICK: Duration = Duration::from_secs(1);

    // Minimum budget left for a late gateway reply
    pub const REPLY_FLOOR: Duration = Duration::from_millis(100);
}
