use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use prost::Message;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use super::rpc::SlaveEvent;
use crate::digest::file_digest;
use crate::proto::{ExitStatus, RunCommandResponse};
use crate::rpc::envelope::FRAME_HEADER_LEN;
use crate::rpc::Reply;
use crate::scheduler::EdgeSpec;
use crate::worker::{prepare_outputs, remove_rspfile, CommandExecutor, FinishedCommand};

/// Appended to command output cut short to fit in one reply frame.
pub const OUTPUT_TRUNCATED: &str = "\n[output truncated]";

/// Bytes reserved for the envelope fields around a reply payload.
const ENVELOPE_SLACK: usize = 256;

struct PendingCommand {
    reply: Reply<RunCommandResponse>,
    outputs: Vec<String>,
    rspfile: Option<String>,
}

/// The slave's main loop: runs accepted commands on the local executor
/// and answers the master once outputs are hashed.
pub struct SlaveRunner {
    work_dir: PathBuf,
    executor: CommandExecutor<u32>,
    pending: HashMap<u32, PendingCommand>,
    running: Arc<AtomicUsize>,
    events: mpsc::UnboundedReceiver<SlaveEvent>,
    replies: JoinSet<()>,
    max_buffer_size: usize,
    file_server: JoinHandle<()>,
    /// Stops the RPC loop and the file server.
    rpc_shutdown: CancellationToken,
    shutdown: CancellationToken,
}

impl SlaveRunner {
    pub(crate) fn new(
        work_dir: PathBuf,
        parallelism: usize,
        max_buffer_size: usize,
        running: Arc<AtomicUsize>,
        events: mpsc::UnboundedReceiver<SlaveEvent>,
        file_server: JoinHandle<()>,
        rpc_shutdown: CancellationToken,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            executor: CommandExecutor::new(parallelism, work_dir.clone()),
            work_dir,
            pending: HashMap::new(),
            running,
            events,
            replies: JoinSet::new(),
            max_buffer_size,
            file_server,
            rpc_shutdown,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let reason = loop {
            tokio::select! {
                Some(finished) = self.executor.wait_for_command(), if self.executor.has_pending() => {
                    self.on_command_finished(finished);
                }
                event = self.events.recv() => match event {
                    Some(SlaveEvent::RunCommand { edge_id, edge, reply }) => {
                        self.on_run_command(edge_id, edge, reply);
                    }
                    Some(SlaveEvent::Quit { reason }) => break format!("quit requested: {}", reason),
                    Some(SlaveEvent::MasterClosed) | None => break "master connection closed".to_string(),
                },
                Some(_) = self.replies.join_next(), if !self.replies.is_empty() => {}
                _ = self.shutdown.cancelled() => break "interrupted".to_string(),
            }
        };

        tracing::info!(reason = %reason, "Slave stopping");
        self.executor.abort();
        while self.executor.has_pending() {
            if let Some(finished) = self.executor.wait_for_command().await {
                self.on_command_finished(finished);
            }
        }
        while self.replies.join_next().await.is_some() {}

        self.rpc_shutdown.cancel();
        let _ = (&mut self.file_server).await;
    }

    fn on_run_command(&mut self, edge_id: u32, edge: EdgeSpec, reply: Reply<RunCommandResponse>) {
        if self.pending.contains_key(&edge_id) {
            self.reply_failure(reply, edge_id, "command is already running".to_string());
            return;
        }
        if let Err(e) = prepare_outputs(&self.work_dir, &edge.outputs, edge.rspfile()) {
            tracing::error!(edge_id, error = %e, "Failed to prepare outputs");
            self.reply_failure(reply, edge_id, format!("failed to prepare outputs: {}", e));
            return;
        }

        tracing::info!(edge_id, command = %edge.command, "Running remote command");
        self.pending.insert(
            edge_id,
            PendingCommand {
                reply,
                outputs: edge.outputs,
                rspfile: edge.rspfile,
            },
        );
        self.executor.submit(edge_id, edge.command);
    }

    fn reply_failure(&self, reply: Reply<RunCommandResponse>, edge_id: u32, output: String) {
        self.running.fetch_sub(1, Ordering::SeqCst);
        reply.send(RunCommandResponse {
            edge_id,
            status: ExitStatus::Failure as i32,
            output,
            output_digests: Vec::new(),
        });
    }

    /// Hashes the outputs off the main loop, then replies.
    fn on_command_finished(&mut self, finished: FinishedCommand<u32>) {
        let edge_id = finished.tag;
        let Some(pending) = self.pending.remove(&edge_id) else {
            return;
        };
        let result = finished.result;
        tracing::info!(edge_id, status = %result.status, "Remote command finished");

        let work_dir = self.work_dir.clone();
        let running = self.running.clone();
        let max_buffer_size = self.max_buffer_size;
        self.replies.spawn(async move {
            let output_digests = if result.success() {
                if let Some(rspfile) = &pending.rspfile {
                    remove_rspfile(&work_dir, rspfile);
                }
                let outputs = pending.outputs.clone();
                match tokio::task::spawn_blocking(move || hash_outputs(&work_dir, &outputs)).await {
                    Ok(digests) => digests,
                    Err(e) => {
                        tracing::error!(edge_id, error = %e, "Hashing outputs failed");
                        Vec::new()
                    }
                }
            } else {
                Vec::new()
            };

            let response = RunCommandResponse {
                edge_id,
                status: result.status as i32,
                output: result.output,
                output_digests,
            };
            running.fetch_sub(1, Ordering::SeqCst);
            pending.reply.send(fit_to_frame(response, max_buffer_size));
        });
    }
}

/// Shortens the output so the encoded reply stays under the peer's
/// frame limit.
fn fit_to_frame(mut response: RunCommandResponse, max_buffer_size: usize) -> RunCommandResponse {
    let limit = max_buffer_size.saturating_sub(FRAME_HEADER_LEN + ENVELOPE_SLACK);
    if response.encoded_len() <= limit {
        return response;
    }
    let output = std::mem::take(&mut response.output);
    // Field tag plus a length varint of at most five bytes.
    let overhead = response.encoded_len() + 6 + OUTPUT_TRUNCATED.len();
    let keep = limit.saturating_sub(overhead);
    tracing::warn!(
        edge_id = response.edge_id,
        len = output.len(),
        keep,
        "Truncating command output"
    );
    response.output = truncate_output(output, keep);
    response
}

fn truncate_output(mut output: String, keep: usize) -> String {
    let mut end = keep.min(output.len());
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    output.truncate(end);
    output.push_str(OUTPUT_TRUNCATED);
    output
}

/// Digest per output, in order. A missing output gets an empty digest.
fn hash_outputs(work_dir: &Path, outputs: &[String]) -> Vec<String> {
    outputs
        .iter()
        .map(|output| {
            file_digest(&work_dir.join(output)).unwrap_or_else(|e| {
                tracing::warn!(output = %output, error = %e, "Output not produced");
                String::new()
            })
        })
        .collect()
}
