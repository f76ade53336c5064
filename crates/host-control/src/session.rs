use std::collections::HashMap;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::capture::CapturePipe;
use crate::controller::HostController;

#[derive(Debug, Error)]
pub enum SessionError {
    /// The capture process exited before confirming readiness.
    #[error("capture process failed to start: {output}")]
    Startup { output: String },
    #[error("mount point {0} is not a directory")]
    InvalidMountPoint(PathBuf),
    #[error("no capture file for this session")]
    NoCaptureFile,
}

/// Per-session overrides for `trace_start`. Fields left unset fall back to
/// the controller configuration.
#[derive(Debug, Clone, Default)]
pub struct TraceOptions {
    pub trace_file: Option<PathBuf>,
    pub interface: Option<String>,
    /// tcpdump `-C` ring-buffer split size, in millions of bytes.
    pub split_size: Option<u32>,
    /// Peer addresses included in the capture host filter; the
    /// controller's own peers are used when empty.
    pub peers: Vec<String>,
}

#[derive(Debug, Default)]
pub(crate) struct SessionState {
    pub(crate) debug: DebugLogState,
    pub(crate) tracepoints: TracePointState,
    pub(crate) stats: StatsState,
    pub(crate) capture: CaptureState,
}

#[derive(Debug)]
pub(crate) struct DebugLogState {
    pub(crate) enabled: bool,
    /// Size of the messages log at session start. Assumes no concurrent
    /// writer repositions the baseline before extraction; that is an
    /// accepted external assumption, not enforced here.
    pub(crate) offset: u64,
    pub(crate) mode: u32,
    pub(crate) out_file: Option<PathBuf>,
    pub(crate) next_index: u32,
}

impl Default for DebugLogState {
    fn default() -> Self {
        Self {
            enabled: false,
            offset: 0,
            mode: 0,
            out_file: None,
            next_index: 1,
        }
    }
}

#[derive(Debug)]
pub(crate) struct TracePointState {
    pub(crate) enabled: HashMap<String, bool>,
    pub(crate) pid: Option<u32>,
    pub(crate) out_file: Option<PathBuf>,
    pub(crate) next_index: u32,
}

impl Default for TracePointState {
    fn default() -> Self {
        Self {
            enabled: HashMap::new(),
            pid: None,
            out_file: None,
            next_index: 1,
        }
    }
}

#[derive(Debug)]
pub(crate) struct StatsState {
    pub(crate) reference: Option<PathBuf>,
    pub(crate) out_file: Option<PathBuf>,
    pub(crate) next_index: u32,
}

impl Default for StatsState {
    fn default() -> Self {
        Self {
            reference: None,
            out_file: None,
            next_index: 1,
        }
    }
}

#[derive(Debug)]
pub(crate) struct CaptureState {
    pub(crate) pid: Option<u32>,
    pub(crate) file: Option<PathBuf>,
    /// Read end of the capture tool's startup pipe, held open so later
    /// diagnostic writes from the tool do not hit a closed pipe.
    pub(crate) pipe: Option<CapturePipe>,
    pub(crate) next_index: u32,
}

impl Default for CaptureState {
    fn default() -> Self {
        Self {
            pid: None,
            file: None,
            pipe: None,
            next_index: 1,
        }
    }
}

impl HostController {
    /// Start an observation session: kernel debug logging, trace points,
    /// a statistics snapshot, then the packet capture, in that order. An
    /// active session is stopped first. Returns the capture file path.
    pub async fn trace_start(&mut self, opts: &TraceOptions) -> anyhow::Result<PathBuf> {
        self.trace_stop().await;
        let file = match &opts.trace_file {
            Some(path) => path.clone(),
            None => {
                let index = self.session.capture.next_index;
                self.session.capture.next_index += 1;
                numbered_path(&self.config.tmpdir, &self.config.trace_name, index, "cap")
            }
        };
        self.session.capture.file = Some(file.clone());
        if self.config.no_trace {
            return Ok(file);
        }

        if !self.config.nfs_debug.is_empty() || !self.config.rpc_debug.is_empty() {
            self.debug_log_enable().await?;
        }
        self.tracepoints_enable().await?;
        self.stats_init().await?;

        self.capture_files.push(file.clone());
        let peers = if opts.peers.is_empty() {
            self.peers.clone()
        } else {
            opts.peers.clone()
        };
        self.capture_start(&file, opts.interface.as_deref(), opts.split_size, &peers)
            .await?;
        Ok(file)
    }

    /// Stop the session in reverse stage order. Every step is best-effort:
    /// a failing stage is logged and the remaining stages still run.
    pub async fn trace_stop(&mut self) {
        if let Err(err) = self.capture_stop().await {
            tracing::warn!(error = %err, "packet capture stop failed");
        }
        if !self.config.no_trace && self.session.debug.enabled {
            if let Err(err) = self.debug_log_reset().await {
                tracing::warn!(error = %err, "kernel debug reset failed");
            }
        }
        if let Err(err) = self.tracepoints_reset().await {
            tracing::warn!(error = %err, "trace point reset failed");
        }
        if let Err(err) = self.stats_collect().await {
            tracing::warn!(error = %err, "stats capture failed");
        }
    }

    /// Resolve a session artifact for the external trace reader; falls
    /// back to the current session's capture file.
    pub fn trace_open(&self, trace_file: Option<&Path>) -> anyhow::Result<PathBuf> {
        let path = match trace_file {
            Some(path) => path.to_path_buf(),
            None => self
                .session
                .capture
                .file
                .clone()
                .ok_or(SessionError::NoCaptureFile)?,
        };
        let resolved = resolve_trace_path(path);
        tracing::debug!(file = %resolved.display(), "opening trace file");
        Ok(resolved)
    }
}

pub(crate) fn numbered_path(tmpdir: &Path, base: &str, index: u32, ext: &str) -> PathBuf {
    tmpdir.join(format!("{base}_{index:03}.{ext}"))
}

/// Resolve a finished session artifact: when the raw file is gone but a
/// gzip-compressed variant exists, substitute the compressed path.
pub(crate) fn resolve_trace_path(path: PathBuf) -> PathBuf {
    if path.exists() {
        return path;
    }
    if path.extension().is_none_or(|ext| ext != "gz") {
        let mut compressed = path.clone().into_os_string();
        compressed.push(".gz");
        let compressed = PathBuf::from(compressed);
        if compressed.exists() {
            return compressed;
        }
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbered_paths_are_zero_padded() {
        let path = numbered_path(Path::new("/tmp"), "tracefile", 7, "cap");
        assert_eq!(path, PathBuf::from("/tmp/tracefile_007.cap"));
    }

    #[test]
    fn resolve_prefers_existing_raw_file() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("trace_001.cap");
        std::fs::write(&raw, b"data").unwrap();
        std::fs::write(dir.path().join("trace_001.cap.gz"), b"gz").unwrap();
        assert_eq!(resolve_trace_path(raw.clone()), raw);
    }

    #[test]
    fn resolve_substitutes_compressed_variant() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("trace_001.cap");
        let gz = dir.path().join("trace_001.cap.gz");
        std::fs::write(&gz, b"gz").unwrap();
        assert_eq!(resolve_trace_path(raw), gz);
    }

    #[test]
    fn resolve_returns_missing_path_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("trace_001.cap");
        assert_eq!(resolve_trace_path(raw.clone()), raw);
    }
}
