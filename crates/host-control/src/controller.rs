use std::collections::HashMap;
use std::path::{Path, PathBuf};

use host_exec::{net, Endpoint, ExecError, ExecOptions, ExecOutput, Executor};
use tracing::Level;

use crate::config::HostConfig;
use crate::registry::{KillPolicy, ProcessRegistry};
use crate::session::SessionState;

const DEFAULT_INTERFACE: &str = "eth0";

/// Controller for one local or remote test host. Owns the process
/// registry, the observation session state, and the cleanup bookkeeping
/// for the lifetime of one test run.
pub struct HostController {
    pub(crate) exec: Executor,
    pub(crate) config: HostConfig,
    pub(crate) registry: ProcessRegistry,
    pub(crate) session: SessionState,
    /// Own address, used in capture host filters.
    pub(crate) ipaddr: String,
    pub(crate) server_ipaddr: String,
    pub(crate) interface: Option<String>,
    /// Default peer addresses monitored by packet captures.
    pub(crate) peers: Vec<String>,
    pub(crate) mount_point: PathBuf,
    /// Mount point joined with the data directory, when one is set.
    pub(crate) data_path: PathBuf,
    pub(crate) mounted: bool,
    pub(crate) mount_opts: HashMap<String, String>,
    pub(crate) nfs_version: f64,
    pub(crate) capture_files: Vec<PathBuf>,
    pub(crate) remove_list: Vec<PathBuf>,
    pub(crate) need_network_reset: bool,
    pub(crate) cleanup_done: bool,
    pub(crate) checked_mount_points: Vec<PathBuf>,
    pub(crate) invalid_mount_points: Vec<PathBuf>,
    pub(crate) checked_data_dirs: Vec<PathBuf>,
}

impl HostController {
    pub async fn new(endpoint: Endpoint, config: HostConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let exec = Executor::new(endpoint.clone()).with_sudo(config.sudo.clone());
        let ipv6 = config.proto.ends_with('6');
        let mut ipaddr = net::ip_address(&endpoint.address, ipv6)?.to_string();
        let server_ipaddr = if config.server.is_empty() {
            String::new()
        } else {
            net::ip_address(&config.server, ipv6)?.to_string()
        };

        let mut interface = config.interface.clone();
        if interface.is_none() {
            interface = Some(DEFAULT_INTERFACE.to_string());
            if !server_ipaddr.is_empty() && endpoint.local {
                let info = net::route(&exec, &server_ipaddr).await;
                if let Some(device) = info.device {
                    interface = Some(device);
                }
                if let Some(source) = info.source {
                    ipaddr = source;
                }
            }
        }

        let mount_point = trim_trailing_slash(&config.mount_point);
        let data_path = join_data_dir(&mount_point, &config.data_dir);
        let nfs_version = config.nfs_version;
        let registry = ProcessRegistry::new(KillPolicy::default(), config.kill.clone());

        Ok(Self {
            exec,
            config,
            registry,
            session: SessionState::default(),
            ipaddr,
            server_ipaddr,
            interface,
            peers: Vec::new(),
            mount_point,
            data_path,
            mounted: false,
            mount_opts: HashMap::new(),
            nfs_version,
            capture_files: Vec::new(),
            remove_list: Vec::new(),
            need_network_reset: false,
            cleanup_done: false,
            checked_mount_points: Vec::new(),
            invalid_mount_points: Vec::new(),
            checked_data_dirs: Vec::new(),
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn ipaddr(&self) -> &str {
        &self.ipaddr
    }

    pub fn server_ipaddr(&self) -> &str {
        &self.server_ipaddr
    }

    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    pub fn mounted(&self) -> bool {
        self.mounted
    }

    pub fn mount_opts(&self) -> &HashMap<String, String> {
        &self.mount_opts
    }

    pub fn nfs_version(&self) -> f64 {
        self.nfs_version
    }

    pub fn capture_files(&self) -> &[PathBuf] {
        &self.capture_files
    }

    /// Address of the file a test creates under the data directory.
    pub fn data_path(&self, name: &str) -> PathBuf {
        self.data_path.join(name)
    }

    pub fn add_peer(&mut self, addr: impl Into<String>) {
        self.peers.push(addr.into());
    }

    /// Stage a path for removal at cleanup. Paths are removed in reverse
    /// registration order; only files, symlinks, and empty directories.
    pub fn register_artifact(&mut self, path: impl Into<PathBuf>) {
        self.remove_list.push(path.into());
    }

    pub async fn run_cmd(
        &self,
        cmd: &str,
        opts: &ExecOptions,
    ) -> Result<ExecOutput, ExecError> {
        self.exec.run(cmd, opts).await
    }

    /// Launch a command non-blocking; the process is owned by the registry
    /// until waited on or stopped.
    pub async fn spawn_cmd(&mut self, cmd: &str, opts: &ExecOptions) -> Result<u32, ExecError> {
        let proc = self.exec.spawn(cmd, opts).await?;
        Ok(self.registry.register(proc))
    }

    /// Wait for one tracked process, or all of them; returns the last
    /// observed exit code.
    pub async fn wait_cmd(&mut self, target: Option<u32>) -> Option<i32> {
        self.registry.wait(&self.exec, target, false, None, "").await
    }

    /// Terminate one tracked process, or all of them, with escalation.
    pub async fn stop_cmd(&mut self, target: Option<u32>) -> Option<i32> {
        self.registry.stop(&self.exec, target, None, "").await
    }

    /// Exit-status probe used where the probed command's failure is part
    /// of the answer rather than an error.
    pub(crate) async fn probe(&self, cmd: &str, msg: &str) -> bool {
        let opts = ExecOptions::default().at(Level::TRACE).with_msg(msg);
        self.exec.run(cmd, &opts).await.is_ok()
    }
}

pub(crate) fn trim_trailing_slash(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    let trimmed = raw.trim_end_matches('/');
    if trimmed.is_empty() {
        PathBuf::from("/")
    } else {
        PathBuf::from(trimmed)
    }
}

pub(crate) fn join_data_dir(mount_point: &Path, data_dir: &str) -> PathBuf {
    if data_dir.is_empty() {
        mount_point.to_path_buf()
    } else {
        mount_point.join(data_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slashes_are_trimmed() {
        assert_eq!(trim_trailing_slash(Path::new("/mnt/t/")), PathBuf::from("/mnt/t"));
        assert_eq!(trim_trailing_slash(Path::new("/mnt/t")), PathBuf::from("/mnt/t"));
        assert_eq!(trim_trailing_slash(Path::new("/")), PathBuf::from("/"));
    }

    #[test]
    fn data_path_joins_under_mount_point() {
        assert_eq!(
            join_data_dir(Path::new("/mnt/t"), "data"),
            PathBuf::from("/mnt/t/data")
        );
        assert_eq!(join_data_dir(Path::new("/mnt/t"), ""), PathBuf::from("/mnt/t"));
    }

    #[tokio::test]
    async fn timed_out_run_does_not_leak_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let config = HostConfig {
            sudo: "env".to_string(),
            no_mount: true,
            no_trace: true,
            tmpdir: dir.path().to_path_buf(),
            mount_point: dir.path().join("mnt"),
            ..HostConfig::default()
        };
        let controller = HostController::new(Endpoint::local(), config)
            .await
            .expect("local controller");

        let marker = dir.path().join("alive");
        let cmd = format!("sleep 2; touch {}", marker.display());
        let opts = ExecOptions::default();
        let result = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            controller.run_cmd(&cmd, &opts),
        )
        .await;
        assert!(result.is_err());

        // The abandoned shell must be gone before it reaches the touch.
        tokio::time::sleep(std::time::Duration::from_secs(3)).await;
        assert!(!marker.exists());
    }
}
