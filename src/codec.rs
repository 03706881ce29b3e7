//! Fixed-layout marshalling for the legacy tape-daemon protocol
//!
//! Every message is a 12-byte header (magic, request type, length-or-status,
//! all big-endian u32) optionally followed by a body of exactly
//! `len_or_status` bytes. Numeric fields are fixed-width big-endian; text
//! fields are fixed-length and NUL-padded. Acknowledgement messages are
//! header-only and reuse the length field as a status code.

use crate::error::{BridgeError, Result};
use crate::protocol::{
    self, msg, DENSITY_LEN, ERRMSG_LEN, HDR_LEN, HOST_LEN, LABEL_LEN, MAX_BODY, NAME_LEN,
    PATH_LEN, VID_LEN,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub magic: u32,
    pub req_type: u32,
    pub len_or_status: u32,
}

impl MessageHeader {
    pub fn new(magic: u32, req_type: u32, len_or_status: u32) -> Self {
        Self {
            magic,
            req_type,
            len_or_status,
        }
    }

    pub fn encode(&self) -> [u8; HDR_LEN] {
        let mut raw = [0u8; HDR_LEN];
        raw[0..4].copy_from_slice(&self.magic.to_be_bytes());
        raw[4..8].copy_from_slice(&self.req_type.to_be_bytes());
        raw[8..12].copy_from_slice(&self.len_or_status.to_be_bytes());
        raw
    }

    pub fn decode(raw: &[u8; HDR_LEN]) -> Result<Self> {
        let magic = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
        if magic != protocol::TAPE_MAGIC && magic != protocol::JOB_MAGIC {
            return Err(BridgeError::Malformed(format!(
                "bad magic 0x{magic:08x} in message header"
            )));
        }
        Ok(Self {
            magic,
            req_type: u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]),
            len_or_status: u32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]),
        })
    }

    /// Interpret `len_or_status` as a body length and bound it.
    pub fn body_len(&self) -> Result<usize> {
        let len = self.len_or_status as usize;
        if len > MAX_BODY {
            return Err(BridgeError::Malformed(format!(
                "body length {len} exceeds maximum {MAX_BODY}"
            )));
        }
        Ok(len)
    }

    /// Interpret `len_or_status` as an acknowledgement status code.
    pub fn status(&self) -> i32 {
        self.len_or_status as i32
    }
}

// ---------------------------------------------------------------------------
// Body types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobRequest {
    pub volume_req_id: u32,
    pub client_port: u32,
    pub client_euid: u32,
    pub client_egid: u32,
    pub client_host: String,
    pub device_group: String,
    pub drive_unit: String,
    pub client_user: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobReply {
    pub status: i32,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TapeRequest {
    pub vid: String,
    pub label: String,
    pub density: String,
    pub mode: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileRequest {
    pub tape_path: String,
    pub tape_fseq: i32,
    /// Overloaded field: carries the pending-transfer slot index, not a real
    /// disk position. See PendingTransferTable.
    pub disk_fseq: i32,
    pub proc_status: i32,
    pub bytes: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorReport {
    pub message: String,
    pub code: i32,
    pub severity: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DumpRequest {
    pub max_blocks: i32,
    pub max_files: i32,
    pub block_size: i32,
    pub from_file: i32,
    pub to_file: i32,
}

/// One decoded message body, tagged the same way the wire tags it.
#[derive(Clone, Debug, PartialEq)]
pub enum Body {
    Job(JobRequest),
    JobReply(JobReply),
    Tape(TapeRequest),
    TapeErr(TapeRequest, ErrorReport),
    File(FileRequest),
    FileErr(FileRequest, ErrorReport),
    Dump(DumpRequest),
    OutputLine(String),
}

impl Body {
    pub fn req_type(&self) -> u32 {
        match self {
            Body::Job(_) => msg::JOB,
            Body::JobReply(_) => msg::JOB_REPLY,
            Body::Tape(_) => msg::TAPE,
            Body::TapeErr(..) => msg::TAPE_ERR,
            Body::File(_) => msg::FILE,
            Body::FileErr(..) => msg::FILE_ERR,
            Body::Dump(_) => msg::DUMP,
            Body::OutputLine(_) => msg::OUTPUT_LINE,
        }
    }
}

// ---------------------------------------------------------------------------
// Cursor helpers
// ---------------------------------------------------------------------------

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        if self.pos + bytes.len() > self.buf.len() {
            return Err(BridgeError::Malformed(format!(
                "marshal overflow: need {} bytes, {} left",
                bytes.len(),
                self.buf.len() - self.pos
            )));
        }
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        Ok(())
    }

    fn put_u32(&mut self, v: u32) -> Result<()> {
        self.put(&v.to_be_bytes())
    }

    fn put_i32(&mut self, v: i32) -> Result<()> {
        self.put(&v.to_be_bytes())
    }

    fn put_u64(&mut self, v: u64) -> Result<()> {
        self.put(&v.to_be_bytes())
    }

    /// Fixed-width NUL-padded text field. The string must leave room for at
    /// least one terminating NUL.
    fn put_str(&mut self, s: &str, width: usize) -> Result<()> {
        let raw = s.as_bytes();
        if raw.len() >= width {
            return Err(BridgeError::Malformed(format!(
                "string {:?} does not fit a {width}-byte field",
                s
            )));
        }
        if raw.contains(&0) {
            return Err(BridgeError::Malformed(format!(
                "string {s:?} contains NUL"
            )));
        }
        let start = self.pos;
        self.put(raw)?;
        let pad = width - raw.len();
        self.put(&vec![0u8; pad])?;
        debug_assert_eq!(self.pos - start, width);
        Ok(())
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(BridgeError::Malformed(format!(
                "truncated body: need {n} bytes, {} left",
                self.buf.len() - self.pos
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn get_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn get_i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn get_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn get_str(&mut self, width: usize) -> Result<String> {
        let raw = self.take(width)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        let s = std::str::from_utf8(&raw[..end])
            .map_err(|_| BridgeError::Malformed("non-UTF8 text field".into()))?;
        Ok(s.to_string())
    }

    fn finish(self) -> Result<()> {
        if self.pos != self.buf.len() {
            return Err(BridgeError::Malformed(format!(
                "{} trailing bytes after body",
                self.buf.len() - self.pos
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Marshal / unmarshal
// ---------------------------------------------------------------------------

/// Write `body` into `buf` and return the marshalled length.
pub fn marshal_body(body: &Body, buf: &mut [u8]) -> Result<usize> {
    let mut w = Writer::new(buf);
    match body {
        Body::Job(j) => {
            w.put_u32(j.volume_req_id)?;
            w.put_u32(j.client_port)?;
            w.put_u32(j.client_euid)?;
            w.put_u32(j.client_egid)?;
            w.put_str(&j.client_host, HOST_LEN)?;
            w.put_str(&j.device_group, NAME_LEN)?;
            w.put_str(&j.drive_unit, NAME_LEN)?;
            w.put_str(&j.client_user, NAME_LEN)?;
        }
        Body::JobReply(r) => {
            w.put_i32(r.status)?;
            w.put_str(&r.message, ERRMSG_LEN)?;
        }
        Body::Tape(t) => marshal_tape(&mut w, t)?,
        Body::TapeErr(t, e) => {
            marshal_tape(&mut w, t)?;
            marshal_err(&mut w, e)?;
        }
        Body::File(f) => marshal_file(&mut w, f)?,
        Body::FileErr(f, e) => {
            marshal_file(&mut w, f)?;
            marshal_err(&mut w, e)?;
        }
        Body::Dump(d) => {
            w.put_i32(d.max_blocks)?;
            w.put_i32(d.max_files)?;
            w.put_i32(d.block_size)?;
            w.put_i32(d.from_file)?;
            w.put_i32(d.to_file)?;
        }
        Body::OutputLine(line) => {
            // Free text, NUL-terminated, bounded only by MAX_BODY
            if line.len() + 1 > MAX_BODY {
                return Err(BridgeError::Malformed(format!(
                    "output line of {} bytes exceeds maximum body size",
                    line.len()
                )));
            }
            if line.as_bytes().contains(&0) {
                return Err(BridgeError::Malformed("output line contains NUL".into()));
            }
            w.put(line.as_bytes())?;
            w.put(&[0u8])?;
        }
    }
    Ok(w.pos)
}

fn marshal_tape(w: &mut Writer<'_>, t: &TapeRequest) -> Result<()> {
    w.put_str(&t.vid, VID_LEN)?;
    w.put_str(&t.label, LABEL_LEN)?;
    w.put_str(&t.density, DENSITY_LEN)?;
    w.put_u32(t.mode)
}

fn marshal_file(w: &mut Writer<'_>, f: &FileRequest) -> Result<()> {
    w.put_str(&f.tape_path, PATH_LEN)?;
    w.put_i32(f.tape_fseq)?;
    w.put_i32(f.disk_fseq)?;
    w.put_i32(f.proc_status)?;
    w.put_u64(f.bytes)
}

fn marshal_err(w: &mut Writer<'_>, e: &ErrorReport) -> Result<()> {
    w.put_str(&e.message, ERRMSG_LEN)?;
    w.put_i32(e.code)?;
    w.put_i32(e.severity)
}

/// Decode the body for `req_type` from exactly `buf`. Trailing or missing
/// bytes are malformed.
pub fn unmarshal_body(req_type: u32, buf: &[u8]) -> Result<Body> {
    let mut r = Reader::new(buf);
    let body = match req_type {
        msg::JOB => Body::Job(JobRequest {
            volume_req_id: r.get_u32()?,
            client_port: r.get_u32()?,
            client_euid: r.get_u32()?,
            client_egid: r.get_u32()?,
            client_host: r.get_str(HOST_LEN)?,
            device_group: r.get_str(NAME_LEN)?,
            drive_unit: r.get_str(NAME_LEN)?,
            client_user: r.get_str(NAME_LEN)?,
        }),
        msg::JOB_REPLY => Body::JobReply(JobReply {
            status: r.get_i32()?,
            message: r.get_str(ERRMSG_LEN)?,
        }),
        msg::TAPE => Body::Tape(unmarshal_tape(&mut r)?),
        msg::TAPE_ERR => {
            let t = unmarshal_tape(&mut r)?;
            let e = unmarshal_err(&mut r)?;
            Body::TapeErr(t, e)
        }
        msg::FILE => Body::File(unmarshal_file(&mut r)?),
        msg::FILE_ERR => {
            let f = unmarshal_file(&mut r)?;
            let e = unmarshal_err(&mut r)?;
            Body::FileErr(f, e)
        }
        msg::DUMP => Body::Dump(DumpRequest {
            max_blocks: r.get_i32()?,
            max_files: r.get_i32()?,
            block_size: r.get_i32()?,
            from_file: r.get_i32()?,
            to_file: r.get_i32()?,
        }),
        msg::OUTPUT_LINE => {
            let raw = r.take(buf.len())?;
            let end = raw.iter().position(|&b| b == 0).ok_or_else(|| {
                BridgeError::Malformed("output line missing NUL terminator".into())
            })?;
            if end + 1 != raw.len() {
                return Err(BridgeError::Malformed(
                    "trailing bytes after output line terminator".into(),
                ));
            }
            let s = std::str::from_utf8(&raw[..end])
                .map_err(|_| BridgeError::Malformed("non-UTF8 output line".into()))?;
            Body::OutputLine(s.to_string())
        }
        other => {
            return Err(BridgeError::Malformed(format!(
                "unexpected request type {other}"
            )))
        }
    };
    r.finish()?;
    Ok(body)
}

fn unmarshal_tape(r: &mut Reader<'_>) -> Result<TapeRequest> {
    Ok(TapeRequest {
        vid: r.get_str(VID_LEN)?,
        label: r.get_str(LABEL_LEN)?,
        density: r.get_str(DENSITY_LEN)?,
        mode: r.get_u32()?,
    })
}

fn unmarshal_file(r: &mut Reader<'_>) -> Result<FileRequest> {
    Ok(FileRequest {
        tape_path: r.get_str(PATH_LEN)?,
        tape_fseq: r.get_i32()?,
        disk_fseq: r.get_i32()?,
        proc_status: r.get_i32()?,
        bytes: r.get_u64()?,
    })
}

fn unmarshal_err(r: &mut Reader<'_>) -> Result<ErrorReport> {
    Ok(ErrorReport {
        message: r.get_str(ERRMSG_LEN)?,
        code: r.get_i32()?,
        severity: r.get_i32()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{TAPE_MAGIC, JOB_MAGIC};

    fn round_trip(body: Body) {
        let mut buf = [0u8; MAX_BODY];
        let n = marshal_body(&body, &mut buf).unwrap();
        let back = unmarshal_body(body.req_type(), &buf[..n]).unwrap();
        assert_eq!(back, body);
    }

    #[test]
    fn header_is_twelve_bytes_and_round_trips() {
        let hdr = MessageHeader::new(TAPE_MAGIC, msg::FILE, 84);
        let raw = hdr.encode();
        assert_eq!(raw.len(), HDR_LEN);
        assert_eq!(MessageHeader::decode(&raw).unwrap(), hdr);
    }

    #[test]
    fn header_rejects_unknown_magic() {
        let mut raw = MessageHeader::new(TAPE_MAGIC, msg::FILE, 0).encode();
        raw[0] = 0xff;
        assert!(matches!(
            MessageHeader::decode(&raw),
            Err(BridgeError::Malformed(_))
        ));
    }

    #[test]
    fn ack_status_is_read_from_the_length_field() {
        let hdr = MessageHeader::new(TAPE_MAGIC, msg::ACK, (-5i32) as u32);
        assert_eq!(hdr.status(), -5);
    }

    #[test]
    fn header_bounds_body_length() {
        let hdr = MessageHeader::new(TAPE_MAGIC, msg::FILE, (MAX_BODY + 1) as u32);
        assert!(hdr.body_len().is_err());
        let hdr = MessageHeader::new(TAPE_MAGIC, msg::FILE, MAX_BODY as u32);
        assert_eq!(hdr.body_len().unwrap(), MAX_BODY);
    }

    #[test]
    fn job_round_trip() {
        round_trip(Body::Job(JobRequest {
            volume_req_id: 4321,
            client_port: 50123,
            client_euid: 1001,
            client_egid: 1002,
            client_host: "bridge01.example.org".into(),
            device_group: "LTO9".into(),
            drive_unit: "drive0".into(),
            client_user: "stage".into(),
        }));
    }

    #[test]
    fn job_reply_round_trip() {
        round_trip(Body::JobReply(JobReply {
            status: -2,
            message: "drive busy".into(),
        }));
    }

    #[test]
    fn tape_round_trips_plain_and_with_error() {
        let tape = TapeRequest {
            vid: "T12345".into(),
            label: "aul".into(),
            density: "18TC".into(),
            mode: crate::protocol::tape_mode::WRITE,
        };
        round_trip(Body::Tape(tape.clone()));
        round_trip(Body::TapeErr(
            tape,
            ErrorReport {
                message: "position lost".into(),
                code: 1017,
                severity: 2,
            },
        ));
    }

    #[test]
    fn file_round_trips_plain_and_with_error() {
        let file = FileRequest {
            tape_path: "/dev/tape0".into(),
            tape_fseq: 42,
            disk_fseq: 3,
            proc_status: crate::protocol::proc_status::FINISHED,
            bytes: 7_340_032,
        };
        round_trip(Body::File(file.clone()));
        round_trip(Body::FileErr(
            file,
            ErrorReport {
                message: "read error past EOD".into(),
                code: 902,
                severity: 1,
            },
        ));
    }

    #[test]
    fn file_fields_decode_in_wire_order() {
        let mut buf = [0u8; MAX_BODY];
        let n = marshal_body(
            &Body::File(FileRequest {
                tape_path: "/dev/tape0".into(),
                tape_fseq: 7,
                disk_fseq: 2,
                proc_status: crate::protocol::proc_status::WAITING,
                bytes: 99,
            }),
            &mut buf,
        )
        .unwrap();
        // tape_fseq sits right after the fixed-width path field
        assert_eq!(&buf[PATH_LEN..PATH_LEN + 4], &7i32.to_be_bytes());
        let Body::File(back) = unmarshal_body(msg::FILE, &buf[..n]).unwrap() else {
            panic!("file body mismatch");
        };
        assert_eq!(back.tape_fseq, 7);
        assert_eq!(back.disk_fseq, 2);
        assert_eq!(back.bytes, 99);
    }

    #[test]
    fn dump_round_trip() {
        round_trip(Body::Dump(DumpRequest {
            max_blocks: -1,
            max_files: 100,
            block_size: 262144,
            from_file: 1,
            to_file: 100,
        }));
    }

    #[test]
    fn output_line_round_trip() {
        round_trip(Body::OutputLine("vol T12345 file 12 of 100 done".into()));
    }

    #[test]
    fn marshal_never_writes_past_declared_bound() {
        let body = Body::Tape(TapeRequest {
            vid: "T1".into(),
            label: "al".into(),
            density: "D".into(),
            mode: 0,
        });
        let mut buf = [0xAAu8; MAX_BODY];
        let n = marshal_body(&body, &mut buf).unwrap();
        assert!(buf[n..].iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn marshal_rejects_too_small_buffer() {
        let body = Body::JobReply(JobReply {
            status: 0,
            message: String::new(),
        });
        let mut buf = [0u8; 16];
        assert!(marshal_body(&body, &mut buf).is_err());
    }

    #[test]
    fn marshal_rejects_oversized_string_field() {
        let body = Body::Tape(TapeRequest {
            vid: "WAY-TOO-LONG-VID".into(),
            label: "aul".into(),
            density: "18TC".into(),
            mode: 0,
        });
        let mut buf = [0u8; MAX_BODY];
        assert!(marshal_body(&body, &mut buf).is_err());
    }

    #[test]
    fn unmarshal_rejects_truncated_body() {
        let body = Body::File(FileRequest {
            tape_path: "/dev/tape0".into(),
            tape_fseq: 1,
            disk_fseq: 0,
            proc_status: 0,
            bytes: 0,
        });
        let mut buf = [0u8; MAX_BODY];
        let n = marshal_body(&body, &mut buf).unwrap();
        assert!(matches!(
            unmarshal_body(msg::FILE, &buf[..n - 1]),
            Err(BridgeError::Malformed(_))
        ));
    }

    #[test]
    fn unmarshal_rejects_trailing_bytes() {
        let body = Body::Dump(DumpRequest {
            max_blocks: 0,
            max_files: 0,
            block_size: 0,
            from_file: 0,
            to_file: 0,
        });
        let mut buf = [0u8; MAX_BODY];
        let n = marshal_body(&body, &mut buf).unwrap();
        assert!(matches!(
            unmarshal_body(msg::DUMP, &buf[..n + 4]),
            Err(BridgeError::Malformed(_))
        ));
    }

    #[test]
    fn unmarshal_rejects_unknown_request_type() {
        assert!(matches!(
            unmarshal_body(999, &[]),
            Err(BridgeError::Malformed(_))
        ));
    }

    #[test]
    fn job_magic_header_accepted() {
        let hdr = MessageHeader::new(JOB_MAGIC, msg::JOB, 0);
        assert_eq!(MessageHeader::decode(&hdr.encode()).unwrap(), hdr);
    }
}
