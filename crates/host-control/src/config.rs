use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

/// Controller configuration. Every field has a documented default so a
/// config file only needs to name what it overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    /// NFS server name or address; empty means no server is involved.
    pub server: String,
    /// Exported file system to mount.
    pub export: String,
    /// Mount point.
    pub mount_point: PathBuf,
    /// Directory under the mount point where test files are created.
    pub data_dir: String,
    /// Extra mount options appended to the composed option string.
    pub mount_opts: String,
    /// NFS version, fractional (4.1 means minor version 1).
    pub nfs_version: f64,
    /// Protocol name; a trailing '6' selects IPv6 resolution.
    pub proto: String,
    pub port: u16,
    /// Security flavor.
    pub sec: String,
    /// Multiple TCP connections option; only emitted when > 1.
    pub nconnect: u32,
    /// Capture interface; resolved from the route to the server when unset.
    pub interface: Option<String>,
    /// Temporary directory where session artifacts are created.
    pub tmpdir: PathBuf,
    /// Base names for auto-numbered artifact files.
    pub trace_name: String,
    pub debug_name: String,
    pub tracepoint_name: String,
    pub stats_name: String,
    /// System log file read by the kernel debug stage.
    pub messages: PathBuf,
    /// Trace point control directory and pipe.
    pub trace_events_dir: PathBuf,
    pub trace_pipe: PathBuf,
    /// External tool paths.
    pub tcpdump: String,
    pub nfsstat: String,
    pub iptables: String,
    pub kill: String,
    pub sudo: String,
    /// tcpdump capture buffer size in kB.
    pub capture_buffer_kb: u32,
    /// Seconds to keep capturing after a stop is requested.
    pub trace_delay_secs: f64,
    /// NFS / RPC kernel debug flag strings; empty disables the stage.
    pub nfs_debug: String,
    pub rpc_debug: String,
    /// Trace point modules to enable.
    pub tracepoints: Vec<String>,
    /// Capture NFS statistics around the session.
    pub nfs_stats: bool,
    /// Skip the observation stages entirely (file names still allocated).
    pub no_trace: bool,
    /// Never actually mount or unmount.
    pub no_mount: bool,
    /// Leave registered artifacts behind at cleanup.
    pub keep_artifacts: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            export: "/".to_string(),
            mount_point: PathBuf::from("/mnt/t"),
            data_dir: String::new(),
            mount_opts: "hard,rsize=4096,wsize=4096".to_string(),
            nfs_version: 4.1,
            proto: "tcp".to_string(),
            port: 2049,
            sec: "sys".to_string(),
            nconnect: 1,
            interface: None,
            tmpdir: PathBuf::from("/tmp"),
            trace_name: "tracefile".to_string(),
            debug_name: "dbgfile".to_string(),
            tracepoint_name: "trcpfile".to_string(),
            stats_name: "nfsstatfile".to_string(),
            messages: PathBuf::from("/var/log/messages"),
            trace_events_dir: PathBuf::from("/sys/kernel/debug/tracing/events"),
            trace_pipe: PathBuf::from("/sys/kernel/debug/tracing/trace_pipe"),
            tcpdump: "/usr/sbin/tcpdump".to_string(),
            nfsstat: "/usr/bin/nfsstat".to_string(),
            iptables: "/usr/sbin/iptables".to_string(),
            kill: "/usr/bin/kill".to_string(),
            sudo: "/usr/bin/sudo".to_string(),
            capture_buffer_kb: 150_000,
            trace_delay_secs: 0.0,
            nfs_debug: String::new(),
            rpc_debug: String::new(),
            tracepoints: Vec::new(),
            nfs_stats: false,
            no_trace: false,
            no_mount: false,
            keep_artifacts: false,
        }
    }
}

impl HostConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.port == 0 {
            anyhow::bail!("port cannot be 0");
        }
        if self.nconnect == 0 {
            anyhow::bail!("nconnect must be at least 1");
        }
        if self.nfs_version < 2.0 {
            anyhow::bail!("unsupported NFS version {}", self.nfs_version);
        }
        if self.trace_delay_secs < 0.0 {
            anyhow::bail!("trace_delay_secs cannot be negative");
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<HostConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: HostConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: HostConfig = toml::from_str("").unwrap();
        assert_eq!(config.mount_point, PathBuf::from("/mnt/t"));
        assert_eq!(config.nfs_version, 4.1);
        assert_eq!(config.port, 2049);
        assert!(!config.nfs_stats);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_overrides_take_effect() {
        let input = r#"
server = "192.168.0.11"
export = "/exports/data"
nfs_version = 3.0
tracepoints = ["nfs4", "sunrpc"]
trace_delay_secs = 2.5
"#;
        let config: HostConfig = toml::from_str(input).unwrap();
        assert_eq!(config.server, "192.168.0.11");
        assert_eq!(config.nfs_version, 3.0);
        assert_eq!(config.tracepoints, vec!["nfs4", "sunrpc"]);
        assert_eq!(config.trace_delay_secs, 2.5);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let parsed: Result<HostConfig, _> = toml::from_str("no_such_option = true");
        assert!(parsed.is_err());
    }

    #[test]
    fn zero_port_fails_validation() {
        let config: HostConfig = toml::from_str("port = 0").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_nconnect_fails_validation() {
        let config: HostConfig = toml::from_str("nconnect = 0").unwrap();
        assert!(config.validate().is_err());
    }
}
