use host_exec::ExecOptions;
use tracing::Level;

use crate::controller::HostController;
use crate::session::numbered_path;

impl HostController {
    /// Write the enable flag for every configured trace point; a single
    /// point failing is logged and skipped. When at least one point is
    /// live, start the background trace-pipe copy process.
    pub(crate) async fn tracepoints_enable(&mut self) -> anyhow::Result<()> {
        if self.config.tracepoints.is_empty() {
            return Ok(());
        }
        let index = self.session.tracepoints.next_index;
        self.session.tracepoints.next_index += 1;
        let out_file = numbered_path(
            &self.config.tmpdir,
            &self.config.tracepoint_name,
            index,
            "out",
        );
        self.session.tracepoints.out_file = Some(out_file.clone());

        let mut count = 0;
        for name in self.config.tracepoints.clone() {
            let control = self.config.trace_events_dir.join(&name).join("enable");
            let cmd = format!("sh -c \"echo 1 > {}\"", control.display());
            let opts = ExecOptions::elevated()
                .at(Level::DEBUG)
                .with_msg("Enable trace points: ");
            match self.run_cmd(&cmd, &opts).await {
                Ok(_) => {
                    self.session.tracepoints.enabled.insert(name, true);
                    count += 1;
                }
                Err(err) => {
                    tracing::debug!(trace_point = %name, error = %err, "failed to enable trace point");
                }
            }
        }

        if count > 0 {
            let cmd = format!(
                "sh -c \"cat {} > {}\"",
                self.config.trace_pipe.display(),
                out_file.display()
            );
            let opts = ExecOptions::elevated()
                .at(Level::DEBUG)
                .with_msg("Capturing trace points: ");
            let pid = self.spawn_cmd(&cmd, &opts).await?;
            self.session.tracepoints.pid = Some(pid);
        }
        Ok(())
    }

    /// Disable every trace point still flagged enabled, then stop the
    /// trace-pipe copy process.
    pub(crate) async fn tracepoints_reset(&mut self) -> anyhow::Result<()> {
        let enabled: Vec<String> = self
            .session
            .tracepoints
            .enabled
            .iter()
            .filter(|(_, on)| **on)
            .map(|(name, _)| name.clone())
            .collect();
        for name in enabled {
            let control = self.config.trace_events_dir.join(&name).join("enable");
            let cmd = format!("sh -c \"echo 0 > {}\"", control.display());
            let opts = ExecOptions::elevated()
                .at(Level::DEBUG)
                .with_msg("Disable trace points: ");
            match self.run_cmd(&cmd, &opts).await {
                Ok(_) => {
                    self.session.tracepoints.enabled.insert(name, false);
                }
                Err(err) => {
                    tracing::debug!(trace_point = %name, error = %err, "failed to disable trace point");
                }
            }
        }
        if let Some(pid) = self.session.tracepoints.pid.take() {
            self.registry
                .stop(
                    &self.exec,
                    Some(pid),
                    Some(Level::DEBUG),
                    "Stopping trace points capture: ",
                )
                .await;
        }
        Ok(())
    }
}
