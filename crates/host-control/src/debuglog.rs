use std::io::{Seek, SeekFrom};
use std::path::Path;

use anyhow::Context;
use host_exec::ExecOptions;
use tracing::Level;

use crate::controller::HostController;
use crate::session::numbered_path;

const DEBUG_MODULES: [&str; 2] = ["nfs", "rpc"];

impl HostController {
    /// Enable kernel debug flags and record the messages-log baseline so
    /// only lines written during the session are extracted later.
    pub(crate) async fn debug_log_enable(&mut self) -> anyhow::Result<()> {
        let index = self.session.debug.next_index;
        self.session.debug.next_index += 1;
        self.session.debug.out_file = Some(numbered_path(
            &self.config.tmpdir,
            &self.config.debug_name,
            index,
            "msg",
        ));

        let modules = [
            ("nfs", self.config.nfs_debug.clone()),
            ("rpc", self.config.rpc_debug.clone()),
        ];
        if modules.iter().all(|(_, flags)| flags.is_empty()) {
            return Ok(());
        }

        let Ok(meta) = std::fs::metadata(&self.config.messages) else {
            return Ok(());
        };
        self.session.debug.offset = meta.len();
        self.session.debug.mode = file_mode(&meta);

        for (module, flags) in modules {
            if flags.is_empty() {
                continue;
            }
            let cmd = format!("rpcdebug -v -m {module} -s {flags}");
            let opts = ExecOptions::elevated()
                .at(Level::DEBUG)
                .with_msg("NFS debug enable: ");
            self.run_cmd(&cmd, &opts).await?;
            self.session.debug.enabled = true;
        }
        Ok(())
    }

    /// Clear the kernel debug flags and extract the log lines appended
    /// since the session started into the debug out-file.
    pub(crate) async fn debug_log_reset(&mut self) -> anyhow::Result<()> {
        for module in DEBUG_MODULES {
            let cmd = format!("rpcdebug -v -m {module} -c");
            let opts = ExecOptions::elevated()
                .at(Level::DEBUG)
                .with_msg("NFS debug reset: ");
            if let Err(err) = self.run_cmd(&cmd, &opts).await {
                tracing::debug!(module, error = %err, "debug flag reset failed");
            }
        }
        if !self.session.debug.enabled {
            return Ok(());
        }
        self.session.debug.enabled = false;

        let Some(out_file) = self.session.debug.out_file.clone() else {
            return Ok(());
        };
        let messages = self.config.messages.clone();
        let mode = self.session.debug.mode;

        // The messages log is often not world-readable; widen it for the
        // extraction and restore the recorded mode afterwards.
        let widen = format!("chmod {:o} {}", mode | 0o444, messages.display());
        let opts = ExecOptions::elevated()
            .at(Level::DEBUG)
            .with_msg("Widen log permissions: ");
        if let Err(err) = self.run_cmd(&widen, &opts).await {
            tracing::debug!(error = %err, "failed to widen log permissions");
        }
        tracing::debug!(file = %out_file.display(), "creating log messages file");
        let result = extract_from_offset(&messages, self.session.debug.offset, &out_file);
        let restore = format!("chmod {:o} {}", mode, messages.display());
        let opts = ExecOptions::elevated()
            .at(Level::DEBUG)
            .with_msg("Restore log permissions: ");
        if let Err(err) = self.run_cmd(&restore, &opts).await {
            tracing::debug!(error = %err, "failed to restore log permissions");
        }
        result
    }
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn file_mode(_meta: &std::fs::Metadata) -> u32 {
    0o644
}

/// Copy every byte of `src` past `offset` into `dst`.
pub(crate) fn extract_from_offset(src: &Path, offset: u64, dst: &Path) -> anyhow::Result<()> {
    let mut reader = std::fs::File::open(src)
        .with_context(|| format!("failed to open {}", src.display()))?;
    reader.seek(SeekFrom::Start(offset))?;
    let mut writer = std::fs::File::create(dst)
        .with_context(|| format!("failed to create {}", dst.display()))?;
    std::io::copy(&mut reader, &mut writer)
        .with_context(|| format!("failed to extract log into {}", dst.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn extraction_is_byte_exact() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("messages");
        let out = dir.path().join("dbgfile_001.msg");

        let mut file = std::fs::File::create(&log).unwrap();
        file.write_all(b"old line 1\nold line 2\n").unwrap();
        let offset = file.metadata().unwrap().len();
        file.write_all(b"new line 1\nnew line 2\n").unwrap();
        drop(file);

        extract_from_offset(&log, offset, &out).unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"new line 1\nnew line 2\n");
    }

    #[test]
    fn extraction_of_untouched_log_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("messages");
        std::fs::write(&log, b"existing\n").unwrap();
        let out = dir.path().join("out.msg");
        extract_from_offset(&log, 9, &out).unwrap();
        assert!(std::fs::read(&out).unwrap().is_empty());
    }

    #[test]
    fn extraction_fails_on_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.msg");
        assert!(extract_from_offset(&dir.path().join("nope"), 0, &out).is_err());
    }
}
