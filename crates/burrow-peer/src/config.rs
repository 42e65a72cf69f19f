use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};

/// Peer process configuration, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub peer_id: u64,
    pub version: String,
    /// Control group (STORED, GETCHUNK, DELETE, REMOVED, DEBUG).
    pub control_group: SocketAddr,
    /// Backup-data group (PUTCHUNK).
    pub backup_group: SocketAddr,
    /// Restore-data group (CHUNK).
    pub restore_group: SocketAddr,
    pub api_port: u16,
    /// Peer-scoped directory holding stored chunks, restored files and the
    /// state snapshot.
    pub root: PathBuf,
    /// Byte budget for locally stored chunks, until an operator reclaim
    /// changes it.
    pub default_capacity: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let peer_id: u64 = std::env::var("BURROW_PEER_ID")
            .context("BURROW_PEER_ID must be set")?
            .parse()
            .context("BURROW_PEER_ID must be an integer")?;

        let version = std::env::var("BURROW_VERSION").unwrap_or_else(|_| "1.0".into());

        let control_group = parse_group("BURROW_MC", "239.0.0.1:8001")?;
        let backup_group = parse_group("BURROW_MDB", "239.0.0.2:8002")?;
        let restore_group = parse_group("BURROW_MDR", "239.0.0.3:8003")?;

        let api_port: u16 = std::env::var("BURROW_API_PORT")
            .unwrap_or_else(|_| "3210".into())
            .parse()
            .context("BURROW_API_PORT must be a port number")?;

        let root: PathBuf = std::env::var("BURROW_ROOT")
            .unwrap_or_else(|_| format!("./peer{}", peer_id))
            .into();

        let default_capacity: u64 = std::env::var("BURROW_CAPACITY")
            .unwrap_or_else(|_| "1000000000".into())
            .parse()
            .context("BURROW_CAPACITY must be a byte count")?;

        Ok(Self {
            peer_id,
            version,
            control_group,
            backup_group,
            restore_group,
            api_port,
            root,
            default_capacity,
        })
    }
}

fn parse_group(var: &str, default: &str) -> Result<SocketAddr> {
    std::env::var(var)
        .unwrap_or_else(|_| default.into())
        .parse()
        .with_context(|| format!("{} must be a multicast addr:port pair", var))
}
