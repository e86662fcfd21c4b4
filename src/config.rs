use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use crate::error::{DistbuildError, Result};
use crate::system;

/// Default port the master listens on for slave connections.
pub const DEFAULT_PORT: u16 = 20015;

/// Default port a slave serves its working directory on.
pub const DEFAULT_FILE_SERVER_PORT: u16 = 18080;

/// Default manifest file name, relative to the working directory.
pub const DEFAULT_MANIFEST: &str = "build.json";

/// Largest value either side of a connection buffers before failing.
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Tuning for the RPC transport.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Hard cap on the read buffer and on the outbound write queue.
    pub max_buffer_size: usize,
    /// Listen backlog for the master socket.
    pub backlog: u32,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            backlog: 128,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub bind_ip: IpAddr,
    pub port: u16,
    /// Directory the build runs in. Manifest paths are relative to it.
    pub work_dir: PathBuf,
    pub manifest: PathBuf,
    /// Targets to build. Empty means the manifest defaults.
    pub targets: Vec<String>,
    /// Maximum number of local commands running or queued at once.
    pub parallelism: usize,
    /// Slaves to wait for before dispatching. Zero starts immediately.
    pub min_slaves: usize,
    pub slave_wait_timeout_ms: u64,
    /// Interval between GetStatus polls of every slave.
    pub status_interval_ms: u64,
    /// Remote work older than this is re-queued for local execution.
    pub remote_timeout_ms: u64,
    /// Port of the slaves' artifact file servers.
    pub file_server_port: u16,
    /// Run the oldest outstanding remote edge locally when the local
    /// executor would otherwise sit idle.
    pub borrow_remote_work: bool,
    pub dashboard_addr: Option<SocketAddr>,
    pub rpc: RpcConfig,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            work_dir: PathBuf::from("."),
            manifest: PathBuf::from(DEFAULT_MANIFEST),
            targets: Vec::new(),
            parallelism: system::guess_parallelism(),
            min_slaves: 1,
            slave_wait_timeout_ms: 10_000,
            status_interval_ms: 2_000,
            remote_timeout_ms: 600_000,
            file_server_port: DEFAULT_FILE_SERVER_PORT,
            borrow_remote_work: true,
            dashboard_addr: None,
            rpc: RpcConfig::default(),
        }
    }
}

impl MasterConfig {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.targets.push(target.into());
        self
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.port)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.work_dir.join(&self.manifest)
    }
}

#[derive(Debug, Clone)]
pub struct SlaveConfig {
    pub master_addr: SocketAddr,
    pub work_dir: PathBuf,
    pub manifest: PathBuf,
    pub parallelism: usize,
    /// Processor count reported to the master. Defaults to the host's.
    pub advertised_processors: Option<u32>,
    pub file_server_addr: SocketAddr,
    pub rpc: RpcConfig,
}

impl SlaveConfig {
    pub fn new(master_addr: SocketAddr, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            master_addr,
            work_dir: work_dir.into(),
            manifest: PathBuf::from(DEFAULT_MANIFEST),
            parallelism: system::guess_parallelism(),
            advertised_processors: None,
            file_server_addr: SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                DEFAULT_FILE_SERVER_PORT,
            ),
            rpc: RpcConfig::default(),
        }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.work_dir.join(&self.manifest)
    }
}

/// Ports below 1024 are reserved and refused.
pub fn validate_port(port: u16) -> Result<u16> {
    if port < 1024 {
        return Err(DistbuildError::InvalidPort(port));
    }
    Ok(port)
}
