//! Shared CLI helpers and small reusable Clap fragments

use clap::Parser;
use std::time::Duration;

use crate::engine::{BridgeConfig, MountJob};

/// Options for one bridged mount session, as handed over by the scheduler.
#[derive(Clone, Debug, Parser)]
pub struct BridgeOpts {
    /// Volume request id assigned by the scheduler
    #[arg(long)]
    pub volume_req_id: u32,

    /// Drive unit name (e.g. drive0)
    #[arg(long)]
    pub drive_unit: String,

    /// Device group name (e.g. LTO9)
    #[arg(long)]
    pub device_group: String,

    /// Gateway host to contact for volume and file lists
    #[arg(long)]
    pub client_host: String,

    /// Gateway port
    #[arg(long)]
    pub client_port: u16,

    /// Requesting user name
    #[arg(long, default_value = "stage")]
    pub client_user: String,

    /// Requesting effective uid
    #[arg(long, default_value_t = 0)]
    pub client_euid: u32,

    /// Requesting effective gid
    #[arg(long, default_value_t = 0)]
    pub client_egid: u32,

    /// Tape daemon host
    #[arg(long, default_value = "127.0.0.1")]
    pub daemon_host: String,

    /// Tape daemon port
    #[arg(long, default_value_t = 5011)]
    pub daemon_port: u16,

    /// Network timeout against the daemon, in seconds
    #[arg(long, default_value_t = 5)]
    pub daemon_timeout_secs: u64,

    /// One gateway round trip timeout, in seconds
    #[arg(long, default_value_t = 5)]
    pub gateway_timeout_secs: u64,
}

impl BridgeOpts {
    pub fn job(&self) -> MountJob {
        MountJob {
            volume_req_id: self.volume_req_id,
            drive_unit: self.drive_unit.clone(),
            device_group: self.device_group.clone(),
            client_host: self.client_host.clone(),
            client_port: self.client_port,
            client_user: self.client_user.clone(),
            client_euid: self.client_euid,
            client_egid: self.client_egid,
        }
    }

    pub fn config(&self) -> BridgeConfig {
        BridgeConfig {
            daemon_host: self.daemon_host.clone(),
            daemon_port: self.daemon_port,
            daemon_timeout: Duration::from_secs(self.daemon_timeout_secs),
            gateway_timeout: Duration::from_secs(self.gateway_timeout_secs),
            ..BridgeConfig::default()
        }
    }
}
