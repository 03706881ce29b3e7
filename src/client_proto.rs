//! Typed message objects exchanged with the tape gateway
//!
//! Unlike the legacy daemon protocol these are structured objects: one
//! bincode-encoded `GatewayMessage` per frame, prefixed by a little-endian
//! u32 length. Every message carries two correlation fields, the session's
//! mount transaction id and a per-call transaction id.

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Hard bound on one encoded gateway frame.
pub const MAX_GATEWAY_FRAME: usize = 1024 * 1024;

/// What sort of requester is on the other end of the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientKind {
    /// The tape gateway proper; supports pings and strict file sequencing.
    Gateway,
    /// A legacy command-line tool (dump/verify style use).
    LegacyTool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileToMigrate {
    pub file_transaction_id: u64,
    pub disk_path: String,
    /// Tape-position file sequence number; strictly increasing while writing.
    pub tape_fseq: i32,
    pub size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileToRecall {
    pub file_transaction_id: u64,
    pub disk_path: String,
    pub tape_fseq: i32,
    pub block_id: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayMessage {
    // --- requests issued by the bridge ---
    VolumeRequest {
        mount_transaction_id: u64,
        transaction_id: u64,
        drive_unit: String,
        device_group: String,
    },
    FilesToMigrateListRequest {
        mount_transaction_id: u64,
        transaction_id: u64,
        max_files: u32,
        max_bytes: u64,
    },
    FilesToRecallListRequest {
        mount_transaction_id: u64,
        transaction_id: u64,
        max_files: u32,
        max_bytes: u64,
    },
    DumpParametersRequest {
        mount_transaction_id: u64,
        transaction_id: u64,
    },
    FileMigratedNotification {
        mount_transaction_id: u64,
        transaction_id: u64,
        file_transaction_id: u64,
        tape_fseq: i32,
        bytes: u64,
    },
    FileRecalledNotification {
        mount_transaction_id: u64,
        transaction_id: u64,
        file_transaction_id: u64,
        tape_fseq: i32,
        bytes: u64,
    },
    DumpNotification {
        mount_transaction_id: u64,
        transaction_id: u64,
        message: String,
    },
    Ping {
        mount_transaction_id: u64,
        transaction_id: u64,
    },
    EndNotification {
        mount_transaction_id: u64,
        transaction_id: u64,
    },
    EndNotificationError {
        mount_transaction_id: u64,
        transaction_id: u64,
        code: i32,
        message: String,
    },

    // --- replies issued by the gateway ---
    Volume {
        mount_transaction_id: u64,
        transaction_id: u64,
        vid: String,
        label: String,
        density: String,
        mode: u32,
        client_kind: ClientKind,
        /// Files already on the tape; migration sequencing starts right
        /// after this.
        nb_files_on_tape: u32,
    },
    FilesToMigrateList {
        mount_transaction_id: u64,
        transaction_id: u64,
        files: Vec<FileToMigrate>,
    },
    FilesToRecallList {
        mount_transaction_id: u64,
        transaction_id: u64,
        files: Vec<FileToRecall>,
    },
    NoMoreFiles {
        mount_transaction_id: u64,
        transaction_id: u64,
    },
    DumpParameters {
        mount_transaction_id: u64,
        transaction_id: u64,
        max_blocks: i32,
        max_files: i32,
        block_size: i32,
        from_file: i32,
        to_file: i32,
    },
    NotificationAcknowledge {
        mount_transaction_id: u64,
        transaction_id: u64,
    },
    /// Failure reply; valid for any request and always converted into an
    /// error by the receiver.
    EndNotificationErrorReport {
        mount_transaction_id: u64,
        transaction_id: u64,
        code: i32,
        message: String,
    },
}

/// Reply kinds the event loop dispatches on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReplyKind {
    Volume,
    FilesToMigrateList,
    FilesToRecallList,
    NoMoreFiles,
    DumpParameters,
    NotificationAcknowledge,
    EndNotificationErrorReport,
}

impl GatewayMessage {
    pub fn mount_transaction_id(&self) -> u64 {
        use GatewayMessage::*;
        match self {
            VolumeRequest {
                mount_transaction_id,
                ..
            }
            | FilesToMigrateListRequest {
                mount_transaction_id,
                ..
            }
            | FilesToRecallListRequest {
                mount_transaction_id,
                ..
            }
            | DumpParametersRequest {
                mount_transaction_id,
                ..
            }
            | FileMigratedNotification {
                mount_transaction_id,
                ..
            }
            | FileRecalledNotification {
                mount_transaction_id,
                ..
            }
            | DumpNotification {
                mount_transaction_id,
                ..
            }
            | Ping {
                mount_transaction_id,
                ..
            }
            | EndNotification {
                mount_transaction_id,
                ..
            }
            | EndNotificationError {
                mount_transaction_id,
                ..
            }
            | Volume {
                mount_transaction_id,
                ..
            }
            | FilesToMigrateList {
                mount_transaction_id,
                ..
            }
            | FilesToRecallList {
                mount_transaction_id,
                ..
            }
            | NoMoreFiles {
                mount_transaction_id,
                ..
            }
            | DumpParameters {
                mount_transaction_id,
                ..
            }
            | NotificationAcknowledge {
                mount_transaction_id,
                ..
            }
            | EndNotificationErrorReport {
                mount_transaction_id,
                ..
            } => *mount_transaction_id,
        }
    }

    pub fn transaction_id(&self) -> u64 {
        use GatewayMessage::*;
        match self {
            VolumeRequest { transaction_id, .. }
            | FilesToMigrateListRequest { transaction_id, .. }
            | FilesToRecallListRequest { transaction_id, .. }
            | DumpParametersRequest { transaction_id, .. }
            | FileMigratedNotification { transaction_id, .. }
            | FileRecalledNotification { transaction_id, .. }
            | DumpNotification { transaction_id, .. }
            | Ping { transaction_id, .. }
            | EndNotification { transaction_id, .. }
            | EndNotificationError { transaction_id, .. }
            | Volume { transaction_id, .. }
            | FilesToMigrateList { transaction_id, .. }
            | FilesToRecallList { transaction_id, .. }
            | NoMoreFiles { transaction_id, .. }
            | DumpParameters { transaction_id, .. }
            | NotificationAcknowledge { transaction_id, .. }
            | EndNotificationErrorReport { transaction_id, .. } => *transaction_id,
        }
    }

    /// The dispatch key for reply messages; `None` for request kinds, which
    /// the gateway never sends to the bridge.
    pub fn reply_kind(&self) -> Option<ReplyKind> {
        use GatewayMessage::*;
        Some(match self {
            Volume { .. } => ReplyKind::Volume,
            FilesToMigrateList { .. } => ReplyKind::FilesToMigrateList,
            FilesToRecallList { .. } => ReplyKind::FilesToRecallList,
            NoMoreFiles { .. } => ReplyKind::NoMoreFiles,
            DumpParameters { .. } => ReplyKind::DumpParameters,
            NotificationAcknowledge { .. } => ReplyKind::NotificationAcknowledge,
            EndNotificationErrorReport { .. } => ReplyKind::EndNotificationErrorReport,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        use GatewayMessage::*;
        match self {
            VolumeRequest { .. } => "VolumeRequest",
            FilesToMigrateListRequest { .. } => "FilesToMigrateListRequest",
            FilesToRecallListRequest { .. } => "FilesToRecallListRequest",
            DumpParametersRequest { .. } => "DumpParametersRequest",
            FileMigratedNotification { .. } => "FileMigratedNotification",
            FileRecalledNotification { .. } => "FileRecalledNotification",
            DumpNotification { .. } => "DumpNotification",
            Ping { .. } => "Ping",
            EndNotification { .. } => "EndNotification",
            EndNotificationError { .. } => "EndNotificationError",
            Volume { .. } => "Volume",
            FilesToMigrateList { .. } => "FilesToMigrateList",
            FilesToRecallList { .. } => "FilesToRecallList",
            NoMoreFiles { .. } => "NoMoreFiles",
            DumpParameters { .. } => "DumpParameters",
            NotificationAcknowledge { .. } => "NotificationAcknowledge",
            EndNotificationErrorReport { .. } => "EndNotificationErrorReport",
        }
    }
}

/// Encode one message into a length-prefixed frame.
pub fn encode_frame(message: &GatewayMessage) -> Result<Vec<u8>> {
    let payload = bincode::serialize(message)
        .map_err(|e| BridgeError::Malformed(format!("gateway encode failed: {e}")))?;
    if payload.len() > MAX_GATEWAY_FRAME {
        return Err(BridgeError::Malformed(format!(
            "gateway frame of {} bytes exceeds maximum {MAX_GATEWAY_FRAME}",
            payload.len()
        )));
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Validate a frame's announced payload length before reading it.
pub fn decode_frame_len(prefix: [u8; 4]) -> Result<usize> {
    let len = u32::from_le_bytes(prefix) as usize;
    if len > MAX_GATEWAY_FRAME {
        return Err(BridgeError::Malformed(format!(
            "gateway frame length {len} exceeds maximum {MAX_GATEWAY_FRAME}"
        )));
    }
    Ok(len)
}

/// Decode one message from a frame payload.
pub fn decode_payload(payload: &[u8]) -> Result<GatewayMessage> {
    bincode::deserialize(payload)
        .map_err(|e| BridgeError::Malformed(format!("gateway decode failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let message = GatewayMessage::FilesToMigrateList {
            mount_transaction_id: 77,
            transaction_id: 5,
            files: vec![FileToMigrate {
                file_transaction_id: 9001,
                disk_path: "/castor/user/a/file.dat".into(),
                tape_fseq: 12,
                size: 1 << 20,
            }],
        };
        let frame = encode_frame(&message).unwrap();
        let len = decode_frame_len([frame[0], frame[1], frame[2], frame[3]]).unwrap();
        assert_eq!(len, frame.len() - 4);
        assert_eq!(decode_payload(&frame[4..]).unwrap(), message);
    }

    #[test]
    fn correlation_accessors_cover_every_variant() {
        let message = GatewayMessage::NotificationAcknowledge {
            mount_transaction_id: 3,
            transaction_id: 41,
        };
        assert_eq!(message.mount_transaction_id(), 3);
        assert_eq!(message.transaction_id(), 41);
        assert_eq!(
            message.reply_kind(),
            Some(ReplyKind::NotificationAcknowledge)
        );
    }

    #[test]
    fn requests_have_no_reply_kind() {
        let message = GatewayMessage::Ping {
            mount_transaction_id: 1,
            transaction_id: 2,
        };
        assert_eq!(message.reply_kind(), None);
    }

    #[test]
    fn oversized_frame_length_rejected() {
        let prefix = ((MAX_GATEWAY_FRAME + 1) as u32).to_le_bytes();
        assert!(decode_frame_len(prefix).is_err());
    }

    #[test]
    fn garbage_payload_is_malformed() {
        assert!(matches!(
            decode_payload(&[0xff; 16]),
            Err(crate::error::BridgeError::Malformed(_))
        ));
    }
}
