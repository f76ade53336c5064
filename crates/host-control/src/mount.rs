use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use host_exec::ExecOptions;
use regex::Regex;
use tracing::Level;

use crate::controller::{join_data_dir, trim_trailing_slash, HostController};
use crate::session::SessionError;

const UMOUNT_ATTEMPTS: u32 = 5;
const UMOUNT_RETRY_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_NFS_PORT: u16 = 2049;

/// Per-call overrides for [`HostController::mount`]. Any field left
/// unset falls back to the controller's configuration.
#[derive(Debug, Default, Clone)]
pub struct MountOptions {
    pub server: Option<String>,
    pub export: Option<String>,
    pub mount_point: Option<PathBuf>,
    pub data_dir: Option<String>,
    pub nfs_version: Option<f64>,
    pub proto: Option<String>,
    pub port: Option<u16>,
    pub sec: Option<String>,
    pub nconnect: Option<u32>,
    pub extra_opts: Option<String>,
}

impl HostController {
    /// Mount the configured export, creating the mount point and the data
    /// directory as needed. Returns the effective data path, or `None`
    /// when mounting is disabled or the mount point is unusable.
    pub async fn mount(&mut self, opts: &MountOptions) -> anyhow::Result<Option<PathBuf>> {
        let server = opts.server.clone().unwrap_or_else(|| self.config.server.clone());
        let export = opts.export.clone().unwrap_or_else(|| self.config.export.clone());
        let mount_point = opts
            .mount_point
            .as_deref()
            .map(trim_trailing_slash)
            .unwrap_or_else(|| self.mount_point.clone());
        let data_dir = opts.data_dir.clone().unwrap_or_else(|| self.config.data_dir.clone());
        let nfs_version = opts.nfs_version.unwrap_or(self.config.nfs_version);
        let proto = opts.proto.clone().unwrap_or_else(|| self.config.proto.clone());
        let port = opts.port.unwrap_or(self.config.port);
        let sec = opts.sec.clone().unwrap_or_else(|| self.config.sec.clone());
        let nconnect = opts.nconnect.unwrap_or(self.config.nconnect);
        let extra = opts.extra_opts.clone().unwrap_or_else(|| self.config.mount_opts.clone());

        self.check_mount_point(&mount_point).await?;
        if self.config.no_mount || self.invalid_mount_points.contains(&mount_point) {
            return Ok(None);
        }

        let version = nfs_version_string(nfs_version);
        let cmd = compose_mount_command(
            &server,
            &export,
            &mount_point,
            &version,
            &proto,
            port,
            &sec,
            nconnect,
            &extra,
        );
        let run_opts = ExecOptions::elevated()
            .at(Level::DEBUG)
            .with_msg("Mount volume: ");
        self.run_cmd(&cmd, &run_opts)
            .await
            .with_context(|| format!("failed to mount {server}:{export}"))?;
        self.mounted = true;
        self.mount_point = mount_point.clone();
        self.nfs_version = nfs_version;
        self.data_path = join_data_dir(&mount_point, &data_dir);

        self.refresh_mount_info(&mount_point).await;
        self.check_data_dir().await?;
        Ok(Some(self.data_path.clone()))
    }

    /// Unmount the mount point, retrying while the volume reports busy.
    /// An error saying the volume is not mounted counts as success.
    pub async fn umount(&mut self) -> anyhow::Result<()> {
        #[cfg(unix)]
        unsafe {
            libc::sync();
        }
        let benign =
            Regex::new(r"not (mounted|found)|Invalid argument").expect("valid umount regex");
        let cmd = format!("umount -f {}", self.mount_point.display());
        let run_opts = ExecOptions::elevated()
            .at(Level::DEBUG)
            .with_msg("Unmount volume: ");
        let mut last_err = None;
        for attempt in 0..UMOUNT_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(UMOUNT_RETRY_DELAY).await;
            }
            match self.run_cmd(&cmd, &run_opts).await {
                Ok(_) => {
                    self.mounted = false;
                    return Ok(());
                }
                Err(err) => {
                    if benign.is_match(&err.to_string()) {
                        self.mounted = false;
                        return Ok(());
                    }
                    tracing::debug!(error = %err, attempt, "umount failed, retrying");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.expect("umount loop ran at least once"))
            .with_context(|| format!("failed to unmount {}", self.mount_point.display()))
    }

    /// Verify the mount point exists and is a directory, creating it when
    /// missing. Each path is checked at most once; a path that turns out
    /// not to be a directory is remembered as invalid.
    async fn check_mount_point(&mut self, mount_point: &Path) -> anyhow::Result<()> {
        if self.checked_mount_points.contains(&PathBuf::from(mount_point)) {
            return Ok(());
        }
        self.checked_mount_points.push(mount_point.to_path_buf());

        let exists = if self.exec.is_local() {
            mount_point.exists()
        } else {
            let cmd = format!("test -e {}", mount_point.display());
            self.probe(&cmd, "Check mount point exists: ").await
        };
        if !exists {
            let cmd = format!("mkdir -p {}", mount_point.display());
            let run_opts = ExecOptions::elevated()
                .at(Level::DEBUG)
                .with_msg("Create mount point: ");
            self.run_cmd(&cmd, &run_opts)
                .await
                .with_context(|| format!("failed to create mount point {}", mount_point.display()))?;
            return Ok(());
        }

        let is_dir = if self.exec.is_local() {
            mount_point.is_dir()
        } else {
            let cmd = format!("test -d {}", mount_point.display());
            self.probe(&cmd, "Check mount point is a directory: ").await
        };
        if !is_dir {
            self.invalid_mount_points.push(mount_point.to_path_buf());
            return Err(SessionError::InvalidMountPoint(mount_point.to_path_buf()).into());
        }
        Ok(())
    }

    /// Create the data directory under the mount point, world-writable so
    /// unprivileged test processes can use it. Checked once per path.
    async fn check_data_dir(&mut self) -> anyhow::Result<()> {
        if self.data_path == self.mount_point
            || self.checked_data_dirs.contains(&self.data_path)
        {
            return Ok(());
        }
        self.checked_data_dirs.push(self.data_path.clone());
        if self.exec.is_local() {
            if !self.data_path.exists() {
                std::fs::create_dir_all(&self.data_path).with_context(|| {
                    format!("failed to create data dir {}", self.data_path.display())
                })?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let perms = std::fs::Permissions::from_mode(0o777);
                    std::fs::set_permissions(&self.data_path, perms)?;
                }
            }
        } else {
            let cmd = format!("mkdir -m 0777 -p {}", self.data_path.display());
            let run_opts = ExecOptions::default()
                .at(Level::DEBUG)
                .with_msg("Create data dir: ");
            self.run_cmd(&cmd, &run_opts).await.with_context(|| {
                format!("failed to create data dir {}", self.data_path.display())
            })?;
        }
        Ok(())
    }

    /// Read back the kernel's view of the mount and record the actual
    /// option set and NFS version in effect. Best effort.
    async fn refresh_mount_info(&mut self, mount_point: &Path) {
        let run_opts = ExecOptions::default()
            .at(Level::TRACE)
            .with_msg("Get mount table: ");
        let output = match self.run_cmd("mount", &run_opts).await {
            Ok(output) => output,
            Err(err) => {
                tracing::debug!(error = %err, "unable to read mount table");
                return;
            }
        };
        if let Some(opts) = parse_mount_table(&output.stdout, mount_point) {
            self.mount_opts = opts;
            if let Some(vers) = self.mount_opts.get("vers").and_then(|v| v.parse::<f64>().ok()) {
                self.nfs_version = vers;
                if let Some(minor) = self
                    .mount_opts
                    .get("minorversion")
                    .and_then(|v| v.parse::<f64>().ok())
                {
                    self.nfs_version += minor / 10.0;
                }
            }
        }
    }
}

pub(crate) fn nfs_version_parts(version: f64) -> (u32, u32) {
    let major = version.trunc() as u32;
    let minor = ((version - version.trunc()) * 10.0).round() as u32;
    (major, minor)
}

/// Render the `vers=` mount option value. Versions below 4 have no minor
/// component.
pub(crate) fn nfs_version_string(version: f64) -> String {
    let (major, minor) = nfs_version_parts(version);
    if major < 4 {
        format!("{major}")
    } else {
        format!("{major}.{minor}")
    }
}

pub(crate) fn compose_mount_command(
    server: &str,
    export: &str,
    mount_point: &Path,
    version: &str,
    proto: &str,
    port: u16,
    sec: &str,
    nconnect: u32,
    extra: &str,
) -> String {
    let mut opts = vec![format!("vers={version}")];
    if port != DEFAULT_NFS_PORT {
        opts.push(format!("port={port}"));
    }
    opts.push(format!("proto={proto}"));
    opts.push(format!("sec={sec}"));
    if !extra.is_empty() {
        opts.push(extra.to_string());
    }
    if nconnect > 1 {
        opts.push(format!("nconnect={nconnect}"));
    }
    let server = if server.contains(':') {
        format!("[{server}]")
    } else {
        server.to_string()
    };
    let export = if export.len() > 1 {
        export.trim_end_matches('/')
    } else {
        export
    };
    format!(
        "mount -o {} {}:{} {}",
        opts.join(","),
        server,
        export,
        mount_point.display()
    )
}

/// Pull the option list for one mount point out of `mount` output.
pub(crate) fn parse_mount_table(
    output: &str,
    mount_point: &Path,
) -> Option<std::collections::HashMap<String, String>> {
    let re = Regex::new(r"on\s+(.*)\s+type.*\((.*)\)").expect("valid mount table regex");
    for line in output.lines() {
        let Some(caps) = re.captures(line) else {
            continue;
        };
        if Path::new(&caps[1]) != mount_point {
            continue;
        }
        let mut opts = std::collections::HashMap::new();
        for item in caps[2].split(',') {
            match item.split_once('=') {
                Some((key, value)) => opts.insert(key.to_string(), value.to_string()),
                None => opts.insert(item.to_string(), String::new()),
            };
        }
        return Some(opts);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_string_drops_minor_below_v4() {
        assert_eq!(nfs_version_string(3.0), "3");
        assert_eq!(nfs_version_string(3.5), "3");
        assert_eq!(nfs_version_string(4.1), "4.1");
        assert_eq!(nfs_version_string(4.0), "4.0");
    }

    #[test]
    fn mount_command_includes_requested_options() {
        let cmd = compose_mount_command(
            "server1",
            "/exports/",
            Path::new("/mnt/t"),
            "4.1",
            "tcp",
            2049,
            "sys",
            1,
            "hard,rsize=4096",
        );
        assert_eq!(
            cmd,
            "mount -o vers=4.1,proto=tcp,sec=sys,hard,rsize=4096 server1:/exports /mnt/t"
        );
    }

    #[test]
    fn mount_command_adds_port_and_nconnect() {
        let cmd = compose_mount_command(
            "server1",
            "/",
            Path::new("/mnt/t"),
            "4.2",
            "tcp",
            3049,
            "krb5",
            8,
            "",
        );
        assert_eq!(
            cmd,
            "mount -o vers=4.2,port=3049,proto=tcp,sec=krb5,nconnect=8 server1:/ /mnt/t"
        );
    }

    #[test]
    fn mount_command_brackets_ipv6_server() {
        let cmd = compose_mount_command(
            "fd00::1",
            "/exports",
            Path::new("/mnt/t"),
            "4.1",
            "tcp6",
            2049,
            "sys",
            1,
            "",
        );
        assert!(cmd.contains("[fd00::1]:/exports"));
    }

    #[test]
    fn mount_table_parses_option_map() {
        let output = "\
sysfs on /sys type sysfs (rw,nosuid,nodev,noexec)
server1:/exports on /mnt/t type nfs4 (rw,vers=4.1,proto=tcp,hard)
";
        let opts = parse_mount_table(output, Path::new("/mnt/t")).unwrap();
        assert_eq!(opts.get("vers").map(String::as_str), Some("4.1"));
        assert_eq!(opts.get("proto").map(String::as_str), Some("tcp"));
        assert!(opts.contains_key("hard"));
        assert_eq!(opts.get("hard").map(String::as_str), Some(""));
    }

    #[test]
    fn mount_table_ignores_other_mount_points() {
        let output = "server1:/exports on /mnt/other type nfs4 (rw,vers=4.1)";
        assert!(parse_mount_table(output, Path::new("/mnt/t")).is_none());
    }
}
