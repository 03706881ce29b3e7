//! Slot bookkeeping for file transfers handed to the daemon
//!
//! The legacy protocol has no field for the gateway's opaque file
//! transaction id, so the bridge hands the daemon a small slot index in the
//! `disk_fseq` field and maps it back here when the transfer completes.

use crate::error::{BridgeError, Result};

pub struct PendingTransferTable {
    slots: Vec<Option<u64>>,
}

impl PendingTransferTable {
    /// Capacity is fixed at session start, sized generously relative to the
    /// daemon's buffering depth.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.is_none())
    }

    /// Allocate a slot for `file_transaction_id`.
    pub fn insert(&mut self, file_transaction_id: u64) -> Result<usize> {
        match self.slots.iter().position(|s| s.is_none()) {
            Some(slot) => {
                self.slots[slot] = Some(file_transaction_id);
                Ok(slot)
            }
            None => Err(BridgeError::CapacityExceeded(format!(
                "pending-transfer table full ({} slots)",
                self.slots.len()
            ))),
        }
    }

    /// Release `slot` and return the file transaction id it carried.
    pub fn remove(&mut self, slot: usize) -> Result<u64> {
        match self.slots.get_mut(slot).and_then(|entry| entry.take()) {
            Some(file_transaction_id) => Ok(file_transaction_id),
            None => Err(BridgeError::Malformed(format!(
                "unknown pending-transfer slot {slot}"
            ))),
        }
    }
}
