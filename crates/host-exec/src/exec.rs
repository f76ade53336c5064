use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::Level;

use crate::endpoint::Endpoint;
use crate::error::ExecError;
use crate::log::log_command;

pub const DEFAULT_SUDO: &str = "/usr/bin/sudo";

const REMOTE_TRANSPORT_EXIT: i32 = 255;

#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub elevate: bool,
    pub level: Level,
    pub msg: String,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            elevate: false,
            level: Level::DEBUG,
            msg: String::new(),
        }
    }
}

impl ExecOptions {
    pub fn elevated() -> Self {
        Self {
            elevate: true,
            ..Self::default()
        }
    }

    pub fn at(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_msg(mut self, msg: impl Into<String>) -> Self {
        self.msg = msg.into();
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// A process launched non-blocking. Ownership is expected to move into the
/// process registry right after the spawn.
pub struct SpawnedProcess {
    pub child: Child,
    pub pid: u32,
    pub level: Level,
    /// Launched with elevation by a non-root caller; such a process cannot
    /// be stopped with an ordinary signal later.
    pub elevated_nonroot: bool,
}

#[derive(Debug, Clone)]
pub struct Executor {
    endpoint: Endpoint,
    sudo: String,
}

impl Executor {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            sudo: DEFAULT_SUDO.to_string(),
        }
    }

    pub fn with_sudo(mut self, sudo: impl Into<String>) -> Self {
        self.sudo = sudo.into();
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_local(&self) -> bool {
        self.endpoint.local
    }

    pub fn compose(&self, cmd: &str, elevate: bool) -> String {
        compose_with_root(&self.endpoint, &self.sudo, cmd, elevate, effective_root())
    }

    pub async fn run(&self, cmd: &str, opts: &ExecOptions) -> Result<ExecOutput, ExecError> {
        let full = self.compose(cmd, opts.elevate);
        log_command(opts.level, &opts.msg, &full);
        let mut command = shell_command(&full);
        // A caller abandoning the wait (e.g. via a timeout) must not
        // leave the child running.
        command.kill_on_drop(true);
        let output = command.output().await.map_err(ExecError::Spawn)?;
        let result = ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        };
        classify(self.endpoint.local, result)
    }

    pub async fn spawn(&self, cmd: &str, opts: &ExecOptions) -> Result<SpawnedProcess, ExecError> {
        let full = self.compose(cmd, opts.elevate);
        log_command(opts.level, &opts.msg, &full);
        let child = shell_command(&full).spawn().map_err(ExecError::Spawn)?;
        Ok(SpawnedProcess {
            pid: child.id().unwrap_or(0),
            child,
            level: opts.level,
            elevated_nonroot: opts.elevate && !effective_root(),
        })
    }
}

fn shell_command(full: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(full)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd
}

fn compose_with_root(
    endpoint: &Endpoint,
    sudo: &str,
    cmd: &str,
    elevate: bool,
    effective_root: bool,
) -> String {
    let mut cmd = cmd.to_string();
    if elevate && !effective_root {
        cmd = format!("{sudo} {cmd}");
    }
    if !endpoint.local {
        let user = if endpoint.user.is_empty() {
            String::new()
        } else {
            format!("{}@", endpoint.user)
        };
        cmd = format!(
            "ssh -t -t {user}{} \"{}\"",
            endpoint.address,
            cmd.replace('"', "\\\"")
        );
    }
    cmd
}

fn classify(local: bool, output: ExecOutput) -> Result<ExecOutput, ExecError> {
    if output.exit_code == 0 {
        return Ok(output);
    }
    if local {
        Err(ExecError::Command {
            output: output.stderr,
        })
    } else if output.exit_code == REMOTE_TRANSPORT_EXIT {
        Err(ExecError::Transport {
            stderr: output.stderr,
        })
    } else {
        Err(ExecError::Command {
            output: output.stdout,
        })
    }
}

#[cfg(unix)]
pub fn effective_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
pub fn effective_root() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(exit_code: i32, stdout: &str, stderr: &str) -> ExecOutput {
        ExecOutput {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code,
        }
    }

    #[test]
    fn classify_local_failure_carries_stderr() {
        let err = classify(true, output(1, "out", "err")).unwrap_err();
        match err {
            ExecError::Command { output } => assert_eq!(output, "err"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn classify_remote_transport_failure_carries_stderr() {
        let err = classify(false, output(255, "out", "ssh failure")).unwrap_err();
        match err {
            ExecError::Transport { stderr } => assert_eq!(stderr, "ssh failure"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn classify_remote_command_failure_carries_stdout() {
        let err = classify(false, output(1, "remote error text", "noise")).unwrap_err();
        match err {
            ExecError::Command { output } => assert_eq!(output, "remote error text"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn classify_success_returns_output() {
        let result = classify(false, output(0, "data", "")).unwrap();
        assert_eq!(result.stdout, "data");
    }

    #[test]
    fn compose_prefixes_sudo_for_non_root() {
        let endpoint = Endpoint::local();
        let cmd = compose_with_root(&endpoint, "/usr/bin/sudo", "ls -l", true, false);
        assert_eq!(cmd, "/usr/bin/sudo ls -l");
    }

    #[test]
    fn compose_skips_sudo_when_already_root() {
        let endpoint = Endpoint::local();
        let cmd = compose_with_root(&endpoint, "/usr/bin/sudo", "ls -l", true, true);
        assert_eq!(cmd, "ls -l");
    }

    #[test]
    fn compose_wraps_remote_commands_in_ssh() {
        let endpoint = Endpoint::remote("192.168.0.11", "tester");
        let cmd = compose_with_root(&endpoint, "/usr/bin/sudo", "echo \"hi\"", false, false);
        assert_eq!(cmd, "ssh -t -t tester@192.168.0.11 \"echo \\\"hi\\\"\"");
    }

    #[test]
    fn compose_omits_login_user_when_empty() {
        let endpoint = Endpoint::remote("192.168.0.11", "");
        let cmd = compose_with_root(&endpoint, "/usr/bin/sudo", "ls", false, false);
        assert_eq!(cmd, "ssh -t -t 192.168.0.11 \"ls\"");
    }

    #[tokio::test]
    async fn run_captures_stdout() {
        let exec = Executor::new(Endpoint::local());
        let out = exec
            .run("echo hello", &ExecOptions::default())
            .await
            .unwrap();
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.exit_code, 0);
    }

    #[tokio::test]
    async fn run_local_failure_surfaces_stderr() {
        let exec = Executor::new(Endpoint::local());
        let err = exec
            .run("echo oops >&2; exit 3", &ExecOptions::default())
            .await
            .unwrap_err();
        match err {
            ExecError::Command { output } => assert_eq!(output, "oops\n"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn spawn_returns_live_child() {
        let exec = Executor::new(Endpoint::local());
        let mut proc = exec
            .spawn("sleep 30", &ExecOptions::default())
            .await
            .unwrap();
        assert!(proc.pid > 0);
        assert!(!proc.elevated_nonroot);
        assert!(matches!(proc.child.try_wait(), Ok(None)));
        let _ = proc.child.kill().await;
        let _ = proc.child.wait().await;
    }
}
