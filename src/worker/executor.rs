use std::collections::{HashMap, VecDeque};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::proto::ExitStatus;

const SIGINT: i32 = 2;

/// Outcome of one shell command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    pub status: ExitStatus,
    /// Captured stdout followed by stderr.
    pub output: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.status == ExitStatus::Success
    }
}

/// A finished command together with the tag it was submitted under.
#[derive(Debug)]
pub struct FinishedCommand<T> {
    pub tag: T,
    pub command: String,
    pub result: CommandResult,
}

/// Notified as commands start and finish, in registration order.
pub trait CommandObserver<T>: Send {
    fn on_command_started(&mut self, tag: &T, command: &str);
    fn on_command_finished(&mut self, tag: &T, command: &str, result: &CommandResult);
}

/// Bounded pool of `sh -c` subprocesses.
///
/// Up to `parallelism` commands run at once; the rest wait in FIFO order
/// and start as slots free up. Each command carries a caller-chosen tag
/// that comes back with its result.
pub struct CommandExecutor<T> {
    parallelism: usize,
    work_dir: PathBuf,
    queued: VecDeque<(T, String)>,
    running: JoinSet<(u64, CommandResult)>,
    pending: HashMap<u64, (T, String)>,
    next_seq: u64,
    observers: Vec<Box<dyn CommandObserver<T>>>,
    interrupt: CancellationToken,
}

impl<T: Send + 'static> CommandExecutor<T> {
    pub fn new(parallelism: usize, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            parallelism: parallelism.max(1),
            work_dir: work_dir.into(),
            queued: VecDeque::new(),
            running: JoinSet::new(),
            pending: HashMap::new(),
            next_seq: 0,
            observers: Vec::new(),
            interrupt: CancellationToken::new(),
        }
    }

    pub fn add_observer(&mut self, observer: Box<dyn CommandObserver<T>>) {
        self.observers.push(observer);
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Starts `command` now if a slot is free, otherwise queues it.
    pub fn submit(&mut self, tag: T, command: impl Into<String>) {
        let command = command.into();
        if self.running_count() < self.parallelism && self.queued.is_empty() {
            self.spawn(tag, command);
        } else {
            tracing::debug!(command = %command, queued = self.queued.len() + 1, "Command queued");
            self.queued.push_back((tag, command));
        }
    }

    /// True while running plus queued commands are below the parallelism.
    pub fn can_run_more(&self) -> bool {
        self.pending_count() < self.parallelism
    }

    pub fn running_count(&self) -> usize {
        self.pending.len()
    }

    pub fn queued_count(&self) -> usize {
        self.queued.len()
    }

    /// Running plus queued.
    pub fn pending_count(&self) -> usize {
        self.running_count() + self.queued_count()
    }

    pub fn has_pending(&self) -> bool {
        self.pending_count() > 0
    }

    /// Waits for the next running command to finish, then starts queued
    /// commands into the freed slots. Returns `None` when nothing is running.
    ///
    /// Cancel safe: a finish is only taken off the pool when it is returned.
    pub async fn wait_for_command(&mut self) -> Option<FinishedCommand<T>> {
        loop {
            let joined = self.running.join_next().await?;
            let (seq, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    tracing::error!(error = %e, "Command task failed");
                    continue;
                }
            };
            let Some((tag, command)) = self.pending.remove(&seq) else {
                continue;
            };

            for observer in self.observers.iter_mut() {
                observer.on_command_finished(&tag, &command, &result);
            }
            self.start_queued();

            return Some(FinishedCommand {
                tag,
                command,
                result,
            });
        }
    }

    /// Interrupts every running command and drops the queue. Running
    /// commands still report, with [`ExitStatus::Interrupted`].
    pub fn abort(&mut self) {
        if !self.queued.is_empty() {
            tracing::warn!(dropped = self.queued.len(), "Dropping queued commands");
        }
        self.queued.clear();
        self.interrupt.cancel();
    }

    fn start_queued(&mut self) {
        while self.running_count() < self.parallelism {
            let Some((tag, command)) = self.queued.pop_front() else {
                break;
            };
            self.spawn(tag, command);
        }
    }

    fn spawn(&mut self, tag: T, command: String) {
        let seq = self.next_seq;
        self.next_seq += 1;

        for observer in self.observers.iter_mut() {
            observer.on_command_started(&tag, &command);
        }
        tracing::debug!(seq, command = %command, "Starting command");

        self.running.spawn(run_shell(
            seq,
            command.clone(),
            self.work_dir.clone(),
            self.interrupt.clone(),
        ));
        self.pending.insert(seq, (tag, command));
    }
}

async fn run_shell(
    seq: u64,
    command: String,
    work_dir: PathBuf,
    interrupt: CancellationToken,
) -> (u64, CommandResult) {
    if interrupt.is_cancelled() {
        return (seq, interrupted());
    }

    let child = Command::new("sh")
        .arg("-c")
        .arg(&command)
        .current_dir(&work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let child = match child {
        Ok(child) => child,
        Err(e) => {
            tracing::error!(command = %command, error = %e, "Failed to spawn command");
            return (
                seq,
                CommandResult {
                    status: ExitStatus::Failure,
                    output: format!("failed to spawn: {}", e),
                },
            );
        }
    };

    let result = tokio::select! {
        output = child.wait_with_output() => process_output(output),
        _ = interrupt.cancelled() => interrupted(),
    };
    (seq, result)
}

fn interrupted() -> CommandResult {
    CommandResult {
        status: ExitStatus::Interrupted,
        output: "interrupted by user".to_string(),
    }
}

fn process_output(result: std::io::Result<std::process::Output>) -> CommandResult {
    match result {
        Ok(output) => {
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stderr));

            let status = if output.status.success() {
                ExitStatus::Success
            } else if output.status.signal() == Some(SIGINT) {
                ExitStatus::Interrupted
            } else {
                ExitStatus::Failure
            };
            CommandResult {
                status,
                output: text,
            }
        }
        Err(e) => CommandResult {
            status: ExitStatus::Failure,
            output: e.to_string(),
        },
    }
}
