use std::time::Duration;

use host_exec::{ExecOptions, Executor, SpawnedProcess};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tracing::Level;

use crate::pids::{descendants, parse_process_table};

/// Signal escalation tiers for forced termination, in order.
pub const SIGNAL_TIERS: [&str; 3] = ["SIGINT", "SIGTERM", "SIGKILL"];

#[derive(Debug, Clone)]
pub struct KillPolicy {
    pub polls_per_tier: u32,
    pub poll_interval: Duration,
}

impl Default for KillPolicy {
    fn default() -> Self {
        Self {
            polls_per_tier: 5,
            poll_interval: Duration::from_millis(100),
        }
    }
}

struct TrackedProcess {
    child: Child,
    pid: u32,
    level: Level,
    elevated_nonroot: bool,
}

/// Sole owner of all background processes launched non-blocking. An entry
/// exists exactly from registration until it is waited on or terminated.
pub struct ProcessRegistry {
    entries: Vec<TrackedProcess>,
    policy: KillPolicy,
    kill_cmd: String,
}

impl ProcessRegistry {
    pub fn new(policy: KillPolicy, kill_cmd: impl Into<String>) -> Self {
        Self {
            entries: Vec::new(),
            policy,
            kill_cmd: kill_cmd.into(),
        }
    }

    pub fn register(&mut self, proc: SpawnedProcess) -> u32 {
        let pid = proc.pid;
        self.entries.push(TrackedProcess {
            child: proc.child,
            pid,
            level: proc.level,
            elevated_nonroot: proc.elevated_nonroot,
        });
        pid
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.entries.iter().any(|p| p.pid == pid)
    }

    pub fn pids(&self) -> Vec<u32> {
        self.entries.iter().map(|p| p.pid).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn take_stdout(&mut self, pid: u32) -> Option<ChildStdout> {
        self.entries
            .iter_mut()
            .find(|p| p.pid == pid)
            .and_then(|p| p.child.stdout.take())
    }

    pub fn take_stderr(&mut self, pid: u32) -> Option<ChildStderr> {
        self.entries
            .iter_mut()
            .find(|p| p.pid == pid)
            .and_then(|p| p.child.stderr.take())
    }

    /// Exit code of an already-exited tracked process, without reaping it
    /// from the registry; `None` while it is still running.
    pub fn try_exit_code(&mut self, pid: u32) -> Option<i32> {
        let entry = self.entries.iter_mut().find(|p| p.pid == pid)?;
        match entry.child.try_wait() {
            Ok(Some(status)) => Some(status.code().unwrap_or(-1)),
            _ => None,
        }
    }

    /// Wait for one tracked process, or for all of them when `target` is
    /// `None`. The target set is snapshotted at call time. With `terminate`
    /// the processes are stopped first: entries launched elevated by a
    /// non-root caller get escalating elevated kill commands across their
    /// full descendant tree, everything else gets an ordinary signal.
    /// Returns the last observed exit code.
    pub async fn wait(
        &mut self,
        exec: &Executor,
        target: Option<u32>,
        terminate: bool,
        level: Option<Level>,
        msg: &str,
    ) -> Option<i32> {
        let targets: Vec<u32> = match target {
            Some(pid) => vec![pid],
            None => self.entries.iter().map(|p| p.pid).collect(),
        };

        let mut last = None;
        for pid in targets {
            let Some(idx) = self.entries.iter().position(|p| p.pid == pid) else {
                continue;
            };
            let mut entry = self.entries.remove(idx);
            let level = level.unwrap_or(entry.level);
            if terminate {
                if entry.elevated_nonroot {
                    self.terminate_elevated(exec, &mut entry, level, msg).await;
                } else {
                    host_exec::log::log_command(
                        level,
                        msg,
                        &format!("stopping process {}", entry.pid),
                    );
                    signal_pid(entry.pid, libc::SIGTERM);
                }
            } else {
                host_exec::log::log_command(
                    level,
                    msg,
                    &format!("waiting for process {}", entry.pid),
                );
            }
            // Always reap to exit status, even after termination, so no
            // zombie or leaked handle survives.
            match entry.child.wait().await {
                Ok(status) => last = Some(status.code().unwrap_or(-1)),
                Err(err) => {
                    tracing::warn!(pid = entry.pid, error = %err, "failed to reap process");
                }
            }
        }
        last
    }

    pub async fn stop(
        &mut self,
        exec: &Executor,
        target: Option<u32>,
        level: Option<Level>,
        msg: &str,
    ) -> Option<i32> {
        self.wait(exec, target, true, level, msg).await
    }

    async fn terminate_elevated(
        &self,
        exec: &Executor,
        entry: &mut TrackedProcess,
        level: Level,
        msg: &str,
    ) {
        for signal in SIGNAL_TIERS {
            let mut polls = 0;
            let mut remaining: Vec<u32> = Vec::new();
            while polls < self.policy.polls_per_tier {
                if matches!(entry.child.try_wait(), Ok(Some(_))) {
                    break;
                }
                remaining = self.query_descendants(exec, entry.pid).await;
                if remaining.is_empty() {
                    break;
                }
                // Deepest descendants first, so children do not get
                // reparented mid-kill.
                for pid in remaining.iter().rev() {
                    let cmd = format!("{} -{signal} {pid}", self.kill_cmd);
                    let opts = ExecOptions::elevated().at(level).with_msg(msg);
                    if let Err(err) = exec.run(&cmd, &opts).await {
                        tracing::trace!(pid, error = %err, "kill attempt failed");
                    }
                }
                polls += 1;
                tokio::time::sleep(self.policy.poll_interval).await;
            }
            if remaining.is_empty() {
                break;
            }
        }
    }

    async fn query_descendants(&self, exec: &Executor, pid: u32) -> Vec<u32> {
        let opts = ExecOptions::default()
            .at(Level::TRACE)
            .with_msg("Get all processes: ");
        match exec.run("ps -ef", &opts).await {
            Ok(out) => descendants(&parse_process_table(&out.stdout), pid),
            Err(err) => {
                tracing::trace!(error = %err, "process table query failed");
                Vec::new()
            }
        }
    }
}

#[cfg(unix)]
fn signal_pid(pid: u32, signal: i32) {
    unsafe {
        libc::kill(pid as i32, signal);
    }
}

#[cfg(not(unix))]
fn signal_pid(_pid: u32, _signal: i32) {}
