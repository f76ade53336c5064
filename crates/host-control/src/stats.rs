use host_exec::ExecOptions;
use tracing::Level;

use crate::controller::HostController;
use crate::session::numbered_path;

impl HostController {
    /// Snapshot the current NFS statistics into a reference file so the
    /// collection pass can report counters relative to it.
    pub(crate) async fn stats_init(&mut self) -> anyhow::Result<()> {
        if !self.config.nfs_stats {
            return Ok(());
        }
        let reference = self
            .config
            .tmpdir
            .join(format!("nfsstat_ref_{}", std::process::id()));
        std::fs::File::create(&reference)?;
        let cmd = format!("{} > {}", self.config.nfsstat, reference.display());
        let opts = ExecOptions::default()
            .at(Level::DEBUG)
            .with_msg("Capture reference NFS stats: ");
        self.run_cmd(&cmd, &opts).await?;
        self.session.stats.reference = Some(reference);
        Ok(())
    }

    /// Collect NFS statistics relative to the reference snapshot. The
    /// reference file is removed whether or not collection succeeds.
    pub(crate) async fn stats_collect(&mut self) -> anyhow::Result<()> {
        let Some(reference) = self.session.stats.reference.take() else {
            return Ok(());
        };
        let index = self.session.stats.next_index;
        self.session.stats.next_index += 1;
        let out_file = numbered_path(
            &self.config.tmpdir,
            &self.config.stats_name,
            index,
            "stat",
        );
        self.session.stats.out_file = Some(out_file.clone());

        let empty_reference = std::fs::metadata(&reference)
            .map(|meta| meta.len() == 0)
            .unwrap_or(true);
        let cmd = if empty_reference {
            format!("{} -l > {}", self.config.nfsstat, out_file.display())
        } else {
            format!(
                "{} -l -S {} > {}",
                self.config.nfsstat,
                reference.display(),
                out_file.display()
            )
        };
        let opts = ExecOptions::default()
            .at(Level::DEBUG)
            .with_msg("Capture relative NFS stats: ");
        let result = self.run_cmd(&cmd, &opts).await;
        let _ = std::fs::remove_file(&reference);
        result?;
        Ok(())
    }
}
