use std::path::Path;
use std::time::Duration;

use host_exec::ExecOptions;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{ChildStderr, ChildStdout};
use tracing::Level;

use crate::controller::HostController;
use crate::session::SessionError;

const STARTUP_READ_TIMEOUT: Duration = Duration::from_secs(1);
const STARTUP_EXIT_GRACE: Duration = Duration::from_secs(1);

/// Read end of the capture child's startup output, kept alive for the
/// capture's lifetime.
#[derive(Debug)]
pub(crate) enum CapturePipe {
    Stdout(ChildStdout),
    Stderr(ChildStderr),
}

impl HostController {
    pub(crate) async fn capture_start(
        &mut self,
        file: &Path,
        interface: Option<&str>,
        split_size: Option<u32>,
        peers: &[String],
    ) -> anyhow::Result<()> {
        let mut flags = String::new();
        if let Some(iface) = interface.or(self.interface.as_deref()) {
            flags.push_str(&format!(" -i {iface}"));
        }
        if let Some(size) = split_size {
            flags.push_str(&format!(" -C {size}"));
        }
        let hosts = host_filter(&self.ipaddr, peers);
        let cmd = format!(
            "{}{} -n -B {} -s 0 -w {} host {hosts}",
            self.config.tcpdump,
            flags,
            self.config.capture_buffer_kb,
            file.display(),
        );
        let opts = ExecOptions::elevated()
            .at(Level::DEBUG)
            .with_msg("Trace start: ");
        let pid = self.spawn_cmd(&cmd, &opts).await?;
        self.session.capture.pid = Some(pid);
        self.confirm_capture_started(pid).await
    }

    /// tcpdump reports "listening on <iface>" once the capture is live. A
    /// missing report alone is not fatal; an already-exited process is.
    /// The pipe's read end stays stashed in the session state so the tool
    /// can keep writing diagnostics while the capture runs.
    async fn confirm_capture_started(&mut self, pid: u32) -> anyhow::Result<()> {
        // ssh -t -t folds the remote stderr into stdout.
        let pipe = if self.exec.is_local() {
            self.registry.take_stderr(pid).map(CapturePipe::Stderr)
        } else {
            self.registry.take_stdout(pid).map(CapturePipe::Stdout)
        };
        let (line, pipe) = match pipe {
            Some(CapturePipe::Stderr(pipe)) => {
                let (line, pipe) = read_first_line(pipe).await;
                (line, Some(CapturePipe::Stderr(pipe)))
            }
            Some(CapturePipe::Stdout(pipe)) => {
                let (line, pipe) = read_first_line(pipe).await;
                (line, Some(CapturePipe::Stdout(pipe)))
            }
            None => (None, None),
        };
        self.session.capture.pipe = pipe;
        let line = line.unwrap_or_default();
        if line.contains("listening") {
            return Ok(());
        }
        tokio::time::sleep(STARTUP_EXIT_GRACE).await;
        if self.registry.try_exit_code(pid).is_some() {
            self.registry
                .wait(&self.exec, Some(pid), false, Some(Level::TRACE), "")
                .await;
            self.session.capture.pid = None;
            self.session.capture.pipe = None;
            return Err(SessionError::Startup { output: line }.into());
        }
        Ok(())
    }

    pub(crate) async fn capture_stop(&mut self) -> anyhow::Result<()> {
        if let Some(pid) = self.session.capture.pid.take() {
            if self.config.trace_delay_secs > 0.0 {
                // Keep capturing trailing packets before tearing down.
                tokio::time::sleep(Duration::from_secs_f64(self.config.trace_delay_secs)).await;
            }
            self.registry
                .stop(
                    &self.exec,
                    Some(pid),
                    Some(Level::TRACE),
                    "Stopping packet trace capture: ",
                )
                .await;
            self.session.capture.pipe = None;
        }
        Ok(())
    }
}

fn host_filter(own: &str, peers: &[String]) -> String {
    let mut seen: Vec<&str> = Vec::new();
    for addr in std::iter::once(own).chain(peers.iter().map(String::as_str)) {
        if !addr.is_empty() && !seen.contains(&addr) {
            seen.push(addr);
        }
    }
    seen.join(" or ")
}

async fn read_first_line<R: AsyncRead + Unpin>(pipe: R) -> (Option<String>, R) {
    let mut lines = BufReader::new(pipe).lines();
    let line = match tokio::time::timeout(STARTUP_READ_TIMEOUT, lines.next_line()).await {
        Ok(Ok(line)) => line,
        _ => None,
    };
    (line, lines.into_inner().into_inner())
}
