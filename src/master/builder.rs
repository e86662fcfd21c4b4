use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::fetch;
use super::report::{BuildOutcome, BuildPhase, BuildReport, BuildSnapshot};
use super::rpc::{MasterEvent, MasterRpc};
use super::runner::{MasterRunner, OutstandingEntry, StartOutcome};
use crate::config::MasterConfig;
use crate::error::Result;
use crate::proto::{ExitStatus, RunCommandResponse};
use crate::rpc::ConnectionId;
use crate::scheduler::{EdgeId, Graph, Plan, SlaveTable};
use crate::worker::{remove_rspfile, CommandObserver, CommandResult, FinishedCommand};

const QUIT_ACK_TIMEOUT: Duration = Duration::from_secs(2);

struct LocalCommandLog;

impl CommandObserver<EdgeId> for LocalCommandLog {
    fn on_command_started(&mut self, edge: &EdgeId, command: &str) {
        tracing::debug!(edge, command, "Local command started");
    }

    fn on_command_finished(&mut self, edge: &EdgeId, _command: &str, result: &CommandResult) {
        tracing::debug!(edge, status = %result.status, "Local command finished");
    }
}

/// The master's main loop: pulls ready edges from the plan, places them
/// locally or on slaves, and feeds results back until the build ends.
pub struct BuildDriver {
    config: MasterConfig,
    graph: Graph,
    plan: Plan,
    runner: MasterRunner,
    events: mpsc::UnboundedReceiver<MasterEvent>,
    events_tx: mpsc::UnboundedSender<MasterEvent>,
    http: reqwest::Client,
    /// Peer address of every connected slave, admitted or not.
    peers: HashMap<ConnectionId, SocketAddr>,
    /// Slaves sent a Quit whose acknowledgement is pending.
    quitting: HashSet<ConnectionId>,
    /// Edges waiting for a local slot: must-run-locally edges and remote
    /// work given up on.
    deferred_local: VecDeque<EdgeId>,
    fetching: usize,
    failed: bool,
    interrupted: bool,
    finished_commands: usize,
    local_commands: usize,
    remote_commands: usize,
    remote_failures: usize,
    requeued_locally: usize,
    artifact_fetches: usize,
    failed_edges: Vec<String>,
    phase: BuildPhase,
    snapshot: watch::Sender<BuildSnapshot>,
    shutdown: CancellationToken,
}

impl BuildDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: MasterConfig,
        graph: Graph,
        plan: Plan,
        rpc: MasterRpc,
        events_tx: mpsc::UnboundedSender<MasterEvent>,
        events: mpsc::UnboundedReceiver<MasterEvent>,
        snapshot: watch::Sender<BuildSnapshot>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let mut runner = MasterRunner::new(
            config.work_dir.clone(),
            config.parallelism,
            SlaveTable::for_local_host(),
            rpc,
        );
        runner.add_observer(Box::new(LocalCommandLog));

        Ok(Self {
            http: fetch::client()?,
            config,
            graph,
            plan,
            runner,
            events,
            events_tx,
            peers: HashMap::new(),
            quitting: HashSet::new(),
            deferred_local: VecDeque::new(),
            fetching: 0,
            failed: false,
            interrupted: false,
            finished_commands: 0,
            local_commands: 0,
            remote_commands: 0,
            remote_failures: 0,
            requeued_locally: 0,
            artifact_fetches: 0,
            failed_edges: Vec::new(),
            phase: BuildPhase::WaitingForSlaves,
            snapshot,
            shutdown,
        })
    }

    pub async fn run(mut self) -> BuildReport {
        self.wait_for_slaves().await;

        self.phase = BuildPhase::Building;
        tracing::info!(
            commands = self.plan.command_edge_count(),
            parallelism = self.config.parallelism,
            slaves = self.runner.slaves().len(),
            "Build started"
        );
        self.build().await;

        let outcome = if self.interrupted {
            BuildOutcome::Interrupted
        } else if self.failed {
            BuildOutcome::Failure
        } else {
            BuildOutcome::Success
        };
        self.phase = BuildPhase::Finished;

        if !self.interrupted {
            self.quit_slaves(outcome).await;
        }

        tracing::info!(
            outcome = %outcome,
            local = self.local_commands,
            remote = self.remote_commands,
            "Build finished"
        );
        let report = BuildReport {
            outcome,
            total_commands: self.plan.command_edge_count(),
            local_commands: self.local_commands,
            remote_commands: self.remote_commands,
            remote_failures: self.remote_failures,
            requeued_locally: self.requeued_locally,
            artifact_fetches: self.artifact_fetches,
            failed_edges: std::mem::take(&mut self.failed_edges),
        };
        self.publish(Some(outcome));
        report
    }

    async fn wait_for_slaves(&mut self) {
        if self.config.min_slaves == 0 {
            return;
        }
        tracing::info!(min_slaves = self.config.min_slaves, "Waiting for slaves");

        let deadline = tokio::time::sleep(Duration::from_millis(self.config.slave_wait_timeout_ms));
        tokio::pin!(deadline);

        while self.runner.slaves().len() < self.config.min_slaves {
            self.publish(None);
            tokio::select! {
                _ = &mut deadline => {
                    tracing::warn!(
                        admitted = self.runner.slaves().len(),
                        "Timed out waiting for slaves, building with what is connected"
                    );
                    break;
                }
                Some(event) = self.events.recv() => self.handle_event(event),
                _ = self.shutdown.cancelled() => {
                    self.interrupted = true;
                    self.failed = true;
                    break;
                }
            }
        }
    }

    async fn build(&mut self) {
        let mut status_tick =
            tokio::time::interval(Duration::from_millis(self.config.status_interval_ms.max(1)));
        status_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            self.dispatch();
            self.publish(None);
            if self.is_done() {
                break;
            }

            tokio::select! {
                Some(finished) = self.runner.wait_for_local(), if self.runner.has_local_work() => {
                    self.on_local_finished(finished);
                }
                Some(event) = self.events.recv() => self.handle_event(event),
                _ = status_tick.tick() => self.on_status_tick(),
                _ = self.shutdown.cancelled(), if !self.interrupted => self.interrupt(),
            }
        }
    }

    /// Starts as much ready work as local and remote capacity allow.
    fn dispatch(&mut self) {
        if self.failed {
            return;
        }

        while self.runner.local_can_run_more() {
            let Some(edge) = self.deferred_local.pop_front() else {
                break;
            };
            self.start_local(edge);
        }

        while !self.failed
            && (self.runner.local_can_run_more() || self.runner.remote_can_run_more())
        {
            let Some(edge) = self.plan.find_work() else {
                break;
            };
            if self.graph.edge(edge).is_phony() {
                self.plan.edge_finished(&self.graph, edge, true);
                continue;
            }

            if self.runner.local_can_run_more() {
                self.start_local(edge);
            } else if self.graph.must_run_locally(edge) {
                self.deferred_local.push_back(edge);
            } else {
                self.start_remote(edge);
            }
        }

        if self.config.borrow_remote_work
            && !self.failed
            && !self.runner.has_local_work()
            && self.deferred_local.is_empty()
        {
            if let Some(edge) = self.runner.borrow_oldest() {
                tracing::info!(
                    edge_id = self.graph.edge(edge).hash,
                    "Local executor idle, running remote work locally too"
                );
                self.start_local(edge);
            }
        }
    }

    fn start_local(&mut self, edge: EdgeId) {
        if let Err(e) = self.runner.start_command(&self.graph, edge, true) {
            tracing::error!(edge_id = self.graph.edge(edge).hash, error = %e, "Failed to start command");
            self.edge_failed(edge);
        }
    }

    fn start_remote(&mut self, edge: EdgeId) {
        match self.runner.start_command(&self.graph, edge, false) {
            Ok(StartOutcome::Remote { .. }) | Ok(StartOutcome::Local) => {}
            Ok(StartOutcome::NoSlaveAvailable) => self.deferred_local.push_back(edge),
            Err(e) => {
                tracing::warn!(edge_id = self.graph.edge(edge).hash, error = %e, "Remote dispatch failed, running locally");
                self.deferred_local.push_back(edge);
            }
        }
    }

    fn is_done(&mut self) -> bool {
        if self.runner.has_local_work() {
            return false;
        }
        if self.interrupted {
            return true;
        }
        if self.fetching > 0 || self.runner.outstanding_count() > 0 {
            return false;
        }
        if self.failed || !self.plan.more_to_do() {
            return true;
        }
        if self.deferred_local.is_empty() && self.plan.ready_count() == 0 {
            tracing::error!("Build stalled with unfinished edges and nothing running");
            self.failed = true;
            return true;
        }
        false
    }

    fn on_local_finished(&mut self, finished: FinishedCommand<EdgeId>) {
        let FinishedCommand {
            tag: edge,
            command,
            result,
        } = finished;

        let hash = self.graph.edge(edge).hash;
        if self.runner.local_done(hash) {
            tracing::debug!(edge_id = hash, "Local run supersedes borrowed remote work");
        }

        match result.status {
            ExitStatus::Success => {
                if let Some(rspfile) = &self.graph.edge(edge).spec.rspfile {
                    remove_rspfile(&self.config.work_dir, rspfile);
                }
                self.local_commands += 1;
                self.command_succeeded(edge, &command);
            }
            ExitStatus::Failure => {
                self.report_failure(edge, &command, &result.output);
                self.edge_failed(edge);
            }
            ExitStatus::Interrupted => {
                self.interrupted = true;
                self.edge_failed(edge);
            }
        }
    }

    fn command_succeeded(&mut self, edge: EdgeId, command: &str) {
        self.plan.edge_finished(&self.graph, edge, true);
        self.finished_commands += 1;
        tracing::info!(
            "[{}/{}] {}",
            self.finished_commands,
            self.plan.command_edge_count(),
            command
        );
    }

    fn edge_failed(&mut self, edge: EdgeId) {
        self.plan.edge_finished(&self.graph, edge, false);
        self.failed = true;
        self.failed_edges
            .push(self.graph.edge(edge).spec.outputs.join(" "));
    }

    fn report_failure(&self, edge: EdgeId, command: &str, output: &str) {
        let outputs = self.graph.edge(edge).spec.outputs.join(" ");
        tracing::error!(outputs = %outputs, "Command failed");
        eprintln!("FAILED: {}\n{}", outputs, command);
        if !output.is_empty() {
            eprint!("{}", output);
        }
    }

    fn handle_event(&mut self, event: MasterEvent) {
        match event {
            MasterEvent::SlaveConnected { connection, peer } => {
                tracing::info!(connection, peer = %peer, "Slave connected");
                self.peers.insert(connection, peer);
            }
            MasterEvent::SlaveSystemInfo { connection, info } => {
                let Some(peer) = self.peers.get(&connection) else {
                    return;
                };
                let ip = peer.ip();
                match self.runner.slaves_mut().admit(connection, ip, &info) {
                    crate::scheduler::Admission::Admitted => {}
                    crate::scheduler::Admission::Rejected { reason } => {
                        match self.runner.rpc().quit(connection, &reason) {
                            Ok(()) => {
                                self.quitting.insert(connection);
                            }
                            Err(e) => {
                                tracing::warn!(connection, error = %e, "Failed to send quit");
                            }
                        }
                    }
                }
            }
            MasterEvent::SlaveStatus { connection, status } => {
                self.runner.slaves_mut().update_status(connection, &status);
            }
            MasterEvent::QuitAcknowledged { connection } => {
                if self.quitting.remove(&connection) {
                    let _ = self.runner.rpc().close(connection);
                }
            }
            MasterEvent::SlaveClosed { connection } => {
                self.peers.remove(&connection);
                self.quitting.remove(&connection);
                if self.runner.slaves_mut().remove(connection).is_some() {
                    tracing::warn!(connection, "Slave disconnected");
                }
                for entry in self.runner.take_outstanding_for(connection) {
                    self.requeue_locally(entry, "slave disconnected");
                }
            }
            MasterEvent::RemoteCommandDone {
                connection,
                response,
            } => self.on_remote_done(connection, response),
            MasterEvent::FetchDone { edge, hash, result } => {
                self.fetching -= 1;
                match result {
                    Ok(()) => {
                        self.remote_commands += 1;
                        let command = self.graph.edge(edge).spec.command.clone();
                        self.command_succeeded(edge, &command);
                    }
                    Err(e) => {
                        tracing::warn!(edge_id = hash, error = %e, "Artifact fetch failed, re-executing locally");
                        self.requeued_locally += 1;
                        self.deferred_local.push_back(edge);
                    }
                }
            }
        }
    }

    fn on_remote_done(&mut self, connection: ConnectionId, response: RunCommandResponse) {
        let hash = response.edge_id;
        let Some(entry) = self.runner.remote_done(hash) else {
            tracing::debug!(edge_id = hash, connection, "Ignoring reply for abandoned remote work");
            return;
        };
        if entry.borrowed {
            tracing::debug!(edge_id = hash, "Remote reply superseded by local run");
            return;
        }
        let edge = entry.edge;

        // An unknown status is a failure, never the enum default.
        let status = ExitStatus::try_from(response.status).ok();
        if status != Some(ExitStatus::Success) {
            self.remote_failures += 1;
            let command = self.graph.edge(edge).spec.command.clone();
            self.report_failure(edge, &command, &response.output);
            match status {
                Some(ExitStatus::Interrupted) => {
                    tracing::warn!(edge_id = hash, connection, "Remote command interrupted");
                }
                None => {
                    tracing::warn!(edge_id = hash, connection, status = response.status, "Unknown remote exit status");
                }
                Some(_) => {}
            }
            self.edge_failed(edge);
            return;
        }

        let Some(peer) = self.peers.get(&connection) else {
            self.requeue_locally(entry, "slave gone before fetch");
            return;
        };
        let slave = SocketAddr::new(peer.ip(), self.config.file_server_port);
        let client = self.http.clone();
        let work_dir = self.config.work_dir.clone();
        let outputs = self.graph.edge(edge).spec.outputs.clone();
        let digests = response.output_digests;
        let events = self.events_tx.clone();

        self.fetching += 1;
        self.artifact_fetches += 1;
        tokio::spawn(async move {
            let result = fetch::fetch_outputs(&client, slave, &work_dir, &outputs, &digests).await;
            let _ = events.send(MasterEvent::FetchDone { edge, hash, result });
        });
    }

    fn requeue_locally(&mut self, entry: OutstandingEntry, why: &str) {
        if entry.borrowed {
            return;
        }
        tracing::warn!(
            edge_id = self.graph.edge(entry.edge).hash,
            connection = entry.connection,
            reason = why,
            "Re-queueing remote work locally"
        );
        self.requeued_locally += 1;
        self.deferred_local.push_back(entry.edge);
    }

    fn on_status_tick(&mut self) {
        for connection in self.runner.slaves().connections() {
            if let Err(e) = self.runner.rpc().get_status(connection) {
                tracing::debug!(connection, error = %e, "Status poll failed");
            }
        }
        let timeout = Duration::from_millis(self.config.remote_timeout_ms);
        for entry in self.runner.take_expired(timeout) {
            self.requeue_locally(entry, "remote timeout");
        }
    }

    fn interrupt(&mut self) {
        tracing::warn!("Interrupted, aborting build");
        self.interrupted = true;
        self.failed = true;
        self.runner.abort_local();
        self.deferred_local.clear();
        self.runner.take_all_outstanding();
    }

    async fn quit_slaves(&mut self, outcome: BuildOutcome) {
        let reason = if outcome.is_success() {
            "Build finished successfully."
        } else {
            "Build failed."
        };
        let connections: Vec<ConnectionId> = self.peers.keys().copied().collect();
        for connection in connections {
            if self.runner.rpc().quit(connection, reason).is_ok() {
                self.quitting.insert(connection);
            }
        }

        let deadline = tokio::time::sleep(QUIT_ACK_TIMEOUT);
        tokio::pin!(deadline);
        while !self.quitting.is_empty() {
            tokio::select! {
                _ = &mut deadline => {
                    tracing::debug!(pending = self.quitting.len(), "Timed out waiting for quit acknowledgements");
                    break;
                }
                Some(event) = self.events.recv() => self.handle_event(event),
            }
        }
    }

    fn publish(&self, outcome: Option<BuildOutcome>) {
        self.snapshot.send_replace(BuildSnapshot {
            phase: self.phase,
            total_commands: self.plan.command_edge_count(),
            finished_commands: self.finished_commands,
            local_commands: self.local_commands,
            remote_commands: self.remote_commands,
            running_local: self.runner.local_pending(),
            outstanding_remote: self.runner.outstanding_count(),
            failed: self.failed,
            outcome,
            slaves: self.runner.slaves().summaries(),
            updated_at: chrono::Utc::now(),
        });
    }
}
