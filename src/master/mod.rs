//! Master coordinator.
//!
//! The master owns the build graph. It listens for slaves, admits those
//! whose OS and architecture match its own, and runs the build: each ready
//! edge goes to the local executor while it has room, otherwise to the
//! slave with the most spare capacity. Edges that consume outputs of other
//! commands always run locally, so intermediate artifacts never travel
//! between slaves.
//!
//! A successful remote edge only counts once its outputs are fetched back
//! over HTTP and match the digests the slave reported. Anything that goes
//! wrong with remote work (a failed fetch, a digest mismatch, a slave that
//! disconnects or stops answering) sends the edge back to the local queue.
//!
//! # Components
//!
//! - [`BuildDriver`]: the main loop
//! - [`MasterRunner`]: capacity checks, placement, outstanding remote work
//! - [`MasterRpc`]: typed calls to the slave service
//! - [`fetch`]: artifact download and verification

pub mod builder;
pub mod fetch;
pub mod report;
pub mod rpc;
pub mod runner;

pub use builder::BuildDriver;
pub use report::{BuildOutcome, BuildPhase, BuildReport, BuildSnapshot};
pub use rpc::{MasterEvent, MasterRpc, SlaveObserver};
pub use runner::{MasterRunner, OutstandingEntry, StartOutcome};

use std::net::SocketAddr;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::MasterConfig;
use crate::dashboard::{self, DashboardState};
use crate::error::Result;
use crate::rpc::{RpcChannel, ServiceRegistry};
use crate::scheduler::{Graph, Plan};

/// A master bound to its port, ready to build.
pub struct Master {
    driver: BuildDriver,
    local_addr: SocketAddr,
    snapshot: watch::Receiver<BuildSnapshot>,
    rpc_shutdown: CancellationToken,
}

impl Master {
    /// Loads the manifest, plans the requested targets and starts listening
    /// for slaves. Must be called from within a tokio runtime.
    pub fn start(config: MasterConfig, shutdown: CancellationToken) -> Result<Self> {
        let graph = Graph::load(&config.manifest_path())?;
        let targets = if config.targets.is_empty() {
            graph.default_targets()
        } else {
            config.targets.clone()
        };
        let mut plan = Plan::new();
        for target in &targets {
            plan.add_target(&graph, target)?;
        }

        let rpc_shutdown = shutdown.child_token();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut channel =
            RpcChannel::new(config.rpc.clone(), ServiceRegistry::new(), rpc_shutdown.clone());
        channel.add_observer(Box::new(SlaveObserver::new(events_tx.clone())));
        let local_addr = channel.listen(config.listen_addr(), config.rpc.backlog)?;
        let rpc = MasterRpc::new(channel.handle(), events_tx.clone());
        tokio::spawn(channel.run());

        let (snapshot_tx, snapshot) = watch::channel(BuildSnapshot::default());
        if let Some(addr) = config.dashboard_addr {
            let state = DashboardState {
                snapshot: snapshot.clone(),
            };
            tokio::spawn(dashboard::run_dashboard(addr, state, rpc_shutdown.clone()));
        }

        tracing::info!(
            addr = %local_addr,
            work_dir = %config.work_dir.display(),
            targets = ?targets,
            commands = plan.command_edge_count(),
            "Master started"
        );

        let driver = BuildDriver::new(
            config,
            graph,
            plan,
            rpc,
            events_tx,
            events_rx,
            snapshot_tx,
            shutdown,
        )?;

        Ok(Self {
            driver,
            local_addr,
            snapshot,
            rpc_shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn subscribe(&self) -> watch::Receiver<BuildSnapshot> {
        self.snapshot.clone()
    }

    /// Runs the build to completion and shuts the RPC loop down.
    pub async fn run(self) -> BuildReport {
        let report = self.driver.run().await;
        self.rpc_shutdown.cancel();
        report
    }
}
