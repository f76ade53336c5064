use std::path::Path;

use crate::controller::HostController;
use crate::mount::MountOptions;

impl HostController {
    /// Restore the host to its pre-run state: stop the observation
    /// session and any tracked processes, lift firewall rules, remove
    /// registered artifacts, and unmount the volume. Idempotent; a second
    /// call does nothing.
    pub async fn cleanup(&mut self) {
        if self.cleanup_done {
            return;
        }
        self.cleanup_done = true;
        if self.config.keep_artifacts {
            self.remove_list.clear();
        }
        self.trace_stop().await;
        self.stop_cmd(None).await;
        if self.need_network_reset {
            self.network_reset().await;
        }
        // Artifacts may live under the mount point; bring it back if a
        // test already unmounted.
        if !self.mounted && !self.remove_list.is_empty() {
            if let Err(err) = self.mount(&MountOptions::default()).await {
                tracing::warn!(error = %err, "cleanup mount failed");
            }
        }
        for path in self.remove_list.split_off(0).into_iter().rev() {
            remove_artifact(&path);
        }
        if self.mounted {
            if let Err(err) = self.umount().await {
                tracing::warn!(error = %err, "cleanup unmount failed");
            }
        }
    }
}

/// Remove one registered artifact. Only empty directories are removed;
/// a missing path is not an error.
fn remove_artifact(path: &Path) {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(_) => return,
    };
    let result = if meta.is_dir() {
        std::fs::remove_dir(path)
    } else {
        std::fs::remove_file(path)
    };
    if let Err(err) = result {
        tracing::debug!(path = %path.display(), error = %err, "failed to remove artifact");
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use host_exec::Endpoint;

    use crate::config::HostConfig;
    use crate::controller::HostController;

    async fn local_controller(tmpdir: &Path) -> HostController {
        let config = HostConfig {
            sudo: "env".to_string(),
            no_mount: true,
            no_trace: true,
            tmpdir: tmpdir.to_path_buf(),
            mount_point: tmpdir.join("mnt"),
            ..HostConfig::default()
        };
        HostController::new(Endpoint::local(), config)
            .await
            .expect("local controller")
    }

    #[tokio::test]
    async fn cleanup_removes_artifacts_in_reverse_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = local_controller(dir.path()).await;

        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        let file = sub.join("data.txt");
        std::fs::write(&file, b"x").unwrap();
        // The directory is registered first, so it is removed last and
        // is empty by then.
        controller.register_artifact(&sub);
        controller.register_artifact(&file);

        controller.cleanup().await;
        assert!(!file.exists());
        assert!(!sub.exists());
    }

    #[tokio::test]
    async fn cleanup_runs_only_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = local_controller(dir.path()).await;

        let file = dir.path().join("once.txt");
        std::fs::write(&file, b"x").unwrap();
        controller.register_artifact(&file);
        controller.cleanup().await;
        assert!(!file.exists());

        // Recreate the artifact; a second cleanup must not touch it.
        std::fs::write(&file, b"x").unwrap();
        controller.cleanup().await;
        assert!(file.exists());
    }

    #[tokio::test]
    async fn keep_artifacts_skips_removal() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = local_controller(dir.path()).await;
        controller.config.keep_artifacts = true;

        let file = dir.path().join("kept.txt");
        std::fs::write(&file, b"x").unwrap();
        controller.register_artifact(&file);
        controller.cleanup().await;
        assert!(file.exists());
    }

    #[tokio::test]
    async fn cleanup_stops_tracked_processes() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = local_controller(dir.path()).await;

        let opts = host_exec::ExecOptions::default();
        let pid = controller.spawn_cmd("sleep 30", &opts).await.unwrap();
        assert!(controller.registry().contains(pid));
        controller.cleanup().await;
        assert!(controller.registry().is_empty());
    }
}
