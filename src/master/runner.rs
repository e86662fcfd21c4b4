use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::error::{DistbuildError, Result};
use crate::proto::RunCommandRequest;
use crate::rpc::ConnectionId;
use crate::scheduler::{EdgeId, Graph, SlaveTable};
use crate::worker::{prepare_outputs, CommandExecutor, CommandObserver, FinishedCommand};

use super::rpc::MasterRpc;

/// How [`MasterRunner::start_command`] placed an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Local,
    Remote { connection: ConnectionId },
    NoSlaveAvailable,
}

/// An edge dispatched to a slave whose reply has not been seen.
#[derive(Debug, Clone)]
pub struct OutstandingEntry {
    pub edge: EdgeId,
    pub connection: ConnectionId,
    pub dispatched_at: Instant,
    /// Also running locally; the local result wins.
    pub borrowed: bool,
}

/// Places edges on the local executor or on slaves, and tracks remote
/// work until it is answered.
pub struct MasterRunner {
    work_dir: PathBuf,
    parallelism: usize,
    executor: CommandExecutor<EdgeId>,
    slaves: SlaveTable,
    /// Keyed by edge hash.
    outstanding: HashMap<u32, OutstandingEntry>,
    /// Borrowed edges already finished here whose slave is still busy
    /// with them. They hold a slave slot until the reply or disconnect.
    superseded: HashMap<u32, OutstandingEntry>,
    rpc: MasterRpc,
}

impl MasterRunner {
    pub fn new(work_dir: impl Into<PathBuf>, parallelism: usize, slaves: SlaveTable, rpc: MasterRpc) -> Self {
        let work_dir = work_dir.into();
        let parallelism = parallelism.max(1);
        Self {
            executor: CommandExecutor::new(parallelism, work_dir.clone()),
            work_dir,
            parallelism,
            slaves,
            outstanding: HashMap::new(),
            superseded: HashMap::new(),
            rpc,
        }
    }

    pub fn add_observer(&mut self, observer: Box<dyn CommandObserver<EdgeId>>) {
        self.executor.add_observer(observer);
    }

    pub fn rpc(&self) -> &MasterRpc {
        &self.rpc
    }

    pub fn slaves(&self) -> &SlaveTable {
        &self.slaves
    }

    pub fn slaves_mut(&mut self) -> &mut SlaveTable {
        &mut self.slaves
    }

    /// Running plus queued local commands are below the parallelism.
    pub fn local_can_run_more(&self) -> bool {
        self.executor.pending_count() < self.parallelism
    }

    /// Outstanding remote commands are below the slaves' total processors.
    pub fn remote_can_run_more(&self) -> bool {
        self.outstanding.len() + self.superseded.len() < self.slaves.total_processors()
    }

    pub fn local_pending(&self) -> usize {
        self.executor.pending_count()
    }

    pub fn has_local_work(&self) -> bool {
        self.executor.has_pending()
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_outstanding(&self, hash: u32) -> bool {
        self.outstanding.contains_key(&hash)
    }

    /// Prepares the edge's outputs and runs it here, or sends it to the
    /// slave with the most spare capacity.
    pub fn start_command(
        &mut self,
        graph: &Graph,
        edge: EdgeId,
        run_locally: bool,
    ) -> Result<StartOutcome> {
        let spec = &graph.edge(edge).spec;

        if run_locally {
            prepare_outputs(&self.work_dir, &spec.outputs, spec.rspfile())?;
            self.executor.submit(edge, spec.command.clone());
            return Ok(StartOutcome::Local);
        }

        let hash = graph.edge(edge).hash;
        if self.outstanding.contains_key(&hash) {
            return Err(DistbuildError::Internal(format!(
                "edge {:08x} is already outstanding",
                hash
            )));
        }
        let Some(connection) = self.slaves.select_slave() else {
            return Ok(StartOutcome::NoSlaveAvailable);
        };

        prepare_outputs(&self.work_dir, &spec.outputs, None)?;
        let request = RunCommandRequest {
            command: spec.command.clone(),
            edge_id: hash,
            rspfile_name: spec.rspfile.clone(),
            rspfile_content: spec.rspfile.as_ref().map(|_| {
                spec.rspfile_content.clone().unwrap_or_default()
            }),
            output_paths: spec.outputs.clone(),
        };
        self.rpc.run_command(connection, &request)?;

        tracing::info!(edge_id = hash, connection, command = %spec.command, "Dispatched remotely");
        self.slaves.record_dispatch(connection);
        self.outstanding.insert(
            hash,
            OutstandingEntry {
                edge,
                connection,
                dispatched_at: Instant::now(),
                borrowed: false,
            },
        );
        Ok(StartOutcome::Remote { connection })
    }

    pub async fn wait_for_local(&mut self) -> Option<FinishedCommand<EdgeId>> {
        self.executor.wait_for_command().await
    }

    pub fn abort_local(&mut self) {
        self.executor.abort();
    }

    /// Removes the entry for a remote reply. `None` for replies to work
    /// that was already given up on or finished locally.
    pub fn remote_done(&mut self, hash: u32) -> Option<OutstandingEntry> {
        if let Some(entry) = self.superseded.remove(&hash) {
            self.slaves.record_completion(entry.connection);
            return None;
        }
        let entry = self.outstanding.remove(&hash)?;
        self.slaves.record_completion(entry.connection);
        Some(entry)
    }

    /// A local run of `hash` finished. Borrowed remote work stops counting
    /// toward the build but keeps its slave slot until the slave answers.
    pub fn local_done(&mut self, hash: u32) -> bool {
        match self.outstanding.remove(&hash) {
            Some(entry) => {
                self.superseded.insert(hash, entry);
                true
            }
            None => false,
        }
    }

    /// Gives up on every edge outstanding on `connection`.
    pub fn take_outstanding_for(&mut self, connection: ConnectionId) -> Vec<OutstandingEntry> {
        self.release_superseded(|entry| entry.connection == connection);
        self.drain_where(|entry| entry.connection == connection)
    }

    /// Gives up on edges that have been outstanding longer than `timeout`.
    pub fn take_expired(&mut self, timeout: Duration) -> Vec<OutstandingEntry> {
        let now = Instant::now();
        let expired = |entry: &OutstandingEntry| now.duration_since(entry.dispatched_at) >= timeout;
        self.release_superseded(expired);
        self.drain_where(expired)
    }

    pub fn take_all_outstanding(&mut self) -> Vec<OutstandingEntry> {
        self.release_superseded(|_| true);
        self.drain_where(|_| true)
    }

    /// Marks the oldest outstanding edge as borrowed, for local execution.
    pub fn borrow_oldest(&mut self) -> Option<EdgeId> {
        let entry = self
            .outstanding
            .values_mut()
            .filter(|entry| !entry.borrowed)
            .min_by_key(|entry| entry.dispatched_at)?;
        entry.borrowed = true;
        Some(entry.edge)
    }

    fn release_superseded(&mut self, pred: impl Fn(&OutstandingEntry) -> bool) {
        let slaves = &mut self.slaves;
        self.superseded.retain(|_, entry| {
            if pred(entry) {
                slaves.record_completion(entry.connection);
                false
            } else {
                true
            }
        });
    }

    fn drain_where(&mut self, pred: impl Fn(&OutstandingEntry) -> bool) -> Vec<OutstandingEntry> {
        let hashes: Vec<u32> = self
            .outstanding
            .iter()
            .filter(|(_, entry)| pred(entry))
            .map(|(hash, _)| *hash)
            .collect();
        let mut taken = Vec::with_capacity(hashes.len());
        for hash in hashes {
            if let Some(entry) = self.remote_done(hash) {
                taken.push(entry);
            }
        }
        taken.sort_by_key(|entry| entry.dispatched_at);
        taken
    }
}
