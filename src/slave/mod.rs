//! Slave coordinator.
//!
//! A slave loads the same manifest as its master and only runs commands
//! it finds there: a RunCommand request is looked up by edge hash and its
//! command text must match the known edge. Accepted commands run on the
//! local executor; their outputs are hashed and served over HTTP so the
//! master can fetch and verify them.
//!
//! Requests are never refused for lack of capacity. They queue in the
//! executor, and the master keeps its dispatch within the processor count
//! the slave advertised.

pub mod file_server;
pub mod rpc;
pub mod runner;

pub use rpc::{register_slave_service, SlaveEvent, SlaveServiceContext, NOT_ALLOWED_OUTPUT};
pub use runner::{SlaveRunner, OUTPUT_TRUNCATED};

use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::SlaveConfig;
use crate::error::Result;
use crate::rpc::{RpcChannel, ServiceRegistry};
use crate::scheduler::Graph;

/// A slave connected to its master.
pub struct Slave {
    runner: SlaveRunner,
    file_server_addr: SocketAddr,
}

impl Slave {
    pub async fn start(config: SlaveConfig, shutdown: CancellationToken) -> Result<Self> {
        let listener = TcpListener::bind(config.file_server_addr).await?;
        Self::start_with_listener(config, listener, shutdown).await
    }

    /// Starts with an already bound file server socket.
    pub async fn start_with_listener(
        config: SlaveConfig,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let graph = Graph::load(&config.manifest_path())?;
        let file_server_addr = listener.local_addr()?;
        let running = Arc::new(AtomicUsize::new(0));
        let (events_tx, events) = mpsc::unbounded_channel();

        let context = Arc::new(SlaveServiceContext {
            allow_list: graph.allow_list(),
            advertised_processors: config.advertised_processors,
            running: running.clone(),
            events: events_tx.clone(),
        });
        let mut registry = ServiceRegistry::new();
        register_slave_service(&mut registry, context);

        let rpc_shutdown = shutdown.child_token();
        let mut channel = RpcChannel::new(config.rpc.clone(), registry, rpc_shutdown.clone());
        channel.add_observer(Box::new(rpc::MasterLinkObserver::new(events_tx)));
        let rpc = channel.handle();
        tokio::spawn(channel.run());

        let file_server = tokio::spawn(file_server::serve(
            listener,
            file_server::router(&config.work_dir),
            rpc_shutdown.clone(),
        ));

        if let Err(e) = rpc.connect(config.master_addr).await {
            rpc_shutdown.cancel();
            return Err(e);
        }
        tracing::info!(
            master = %config.master_addr,
            work_dir = %config.work_dir.display(),
            parallelism = config.parallelism,
            "Slave started"
        );

        Ok(Self {
            runner: SlaveRunner::new(
                config.work_dir,
                config.parallelism,
                config.rpc.max_buffer_size,
                running,
                events,
                file_server,
                rpc_shutdown,
                shutdown,
            ),
            file_server_addr,
        })
    }

    pub fn file_server_addr(&self) -> SocketAddr {
        self.file_server_addr
    }

    /// Serves the master until it sends Quit or disconnects.
    pub async fn run(self) {
        self.runner.run().await;
    }
}
