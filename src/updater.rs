use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::Config;
use crate::lock::RoleLock;
use crate::process;

const PEER_STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct CommitInfo {
    sha: String,
}

/// Why an update cycle did not apply anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateGate {
    Enabled,
    EmergencyStop,
    ManualMode,
}

pub fn gate(emergency_stop: bool, manual_mode: bool) -> UpdateGate {
    if emergency_stop {
        UpdateGate::EmergencyStop
    } else if manual_mode {
        UpdateGate::ManualMode
    } else {
        UpdateGate::Enabled
    }
}

pub fn needs_update(deployed: Option<&str>, remote: &str) -> bool {
    deployed != Some(remote)
}

/// Reconciles the local tree with the remote ref: backup, fast-forward,
/// record the new commit, signal dependents. Never leaves the tree in a
/// half-updated state; a failed pull keeps the old `UpdateState` so the
/// next cycle retries.
pub struct Updater {
    config: Config,
    http: reqwest::Client,
    shutdown: Arc<AtomicBool>,
    _lock: RoleLock,
}

impl Updater {
    pub fn new(config: Config, shutdown: Arc<AtomicBool>) -> Result<Updater> {
        let lock = RoleLock::acquire(&config.run_dir(), "updater")?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_seconds))
            .user_agent("wavealert360-updater")
            .build()
            .context("Building updater HTTP client")?;
        Ok(Updater {
            config,
            http,
            shutdown,
            _lock: lock,
        })
    }

    pub async fn run(self) -> Result<()> {
        info!(
            "Updater running (branch {}, poll {}s)",
            self.config.repo_branch, self.config.updater_poll_seconds
        );
        let interval = Duration::from_secs(self.config.updater_poll_seconds);
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                info!("Updater shutting down");
                return Ok(());
            }
            // Transient network errors are a no-op; the next cycle retries.
            if let Err(err) = self.check_once().await {
                warn!("Update cycle failed: {:#}", err);
            }
            self.idle(interval).await;
        }
    }

    pub async fn check_once(&self) -> Result<()> {
        match gate(
            self.config.emergency_stop_path().exists(),
            self.config.manual_mode_path().exists(),
        ) {
            UpdateGate::EmergencyStop => {
                info!("Emergency stop marker present, updater idle");
                return Ok(());
            }
            UpdateGate::ManualMode => {
                let remote = self.fetch_remote_commit().await?;
                if needs_update(self.read_deployed_commit()?.as_deref(), &remote) {
                    info!("Update {} available, manual mode prevents applying it", remote);
                }
                return Ok(());
            }
            UpdateGate::Enabled => {}
        }

        let remote = self.fetch_remote_commit().await?;
        let deployed = self.read_deployed_commit()?;
        if !needs_update(deployed.as_deref(), &remote) {
            return Ok(());
        }
        info!(
            "New commit {} (deployed: {})",
            remote,
            deployed.as_deref().unwrap_or("none")
        );
        self.apply_update(&remote)
    }

    async fn fetch_remote_commit(&self) -> Result<String> {
        let url = format!(
            "{}/commits/{}",
            self.config.repo_api_url.trim_end_matches('/'),
            self.config.repo_branch
        );
        let mut request = self.http.get(&url);
        if let Some(token) = self.read_api_token() {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("GET {}", url))?;
        let status = response.status();
        if !status.is_success() {
            bail!("Commit lookup returned {}", status);
        }
        let info: CommitInfo = response
            .json()
            .await
            .context("Decoding commit lookup response")?;
        Ok(info.sha)
    }

    // Token file is env-file style: KEY=VALUE lines.
    fn read_api_token(&self) -> Option<String> {
        let path = self.config.repo_token_file.as_ref()?;
        let content = fs::read_to_string(path).ok()?;
        read_env_value(&content, "GITHUB_TOKEN")
    }

    fn read_deployed_commit(&self) -> Result<Option<String>> {
        let path = self.config.update_state_path();
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Reading update state at {}", path.display()))?;
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        Ok(Some(trimmed.to_string()))
    }

    fn write_deployed_commit(&self, commit: &str) -> Result<()> {
        let path = self.config.update_state_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Creating state directory {}", parent.display()))?;
        }
        let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
        fs::write(&tmp, format!("{}\n", commit))
            .and_then(|_| fs::rename(&tmp, &path))
            .with_context(|| format!("Recording deployed commit at {}", path.display()))
    }

    fn apply_update(&self, remote: &str) -> Result<()> {
        let backup = self.create_backup()?;
        info!("Backup archive created at {}", backup.display());

        // Single tool invocation, so consumers see either the old tree or
        // the new one. The backup is for operator use; a failed pull is not
        // rolled back automatically.
        self.fast_forward()
            .context("Fast-forwarding working tree (old UpdateState retained)")?;

        self.write_deployed_commit(remote)?;
        info!("Deployed commit is now {}", remote);

        if let Some(ref hook) = self.config.post_update_command {
            // Stale packages are preferable to stale code; hook failures
            // never block the update.
            if let Err(err) = run_shell(hook) {
                warn!("Post-update command failed: {:#}", err);
            }
        }

        self.signal_dependents();
        Ok(())
    }

    fn create_backup(&self) -> Result<PathBuf> {
        let backup_dir = self.config.backup_dir();
        fs::create_dir_all(&backup_dir)
            .with_context(|| format!("Creating backup directory {}", backup_dir.display()))?;
        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        let archive = backup_dir.join(format!("tree-{}.tar.gz", stamp));
        let status = Command::new("tar")
            .arg("-czf")
            .arg(&archive)
            .arg("-C")
            .arg(&self.config.install_dir)
            .arg(".")
            .status()
            .context("Running tar")?;
        if !status.success() {
            bail!("Backup archive creation failed with {}", status);
        }
        Ok(archive)
    }

    fn fast_forward(&self) -> Result<()> {
        run_git(
            &self.config.install_dir,
            &["fetch", &self.config.repo_remote, &self.config.repo_branch],
        )?;
        run_git(&self.config.install_dir, &["merge", "--ff-only", "FETCH_HEAD"])
    }

    /// Terminates peers that must pick up the new code. Respawn is always
    /// the supervisor's job, keeping exactly one spawner per role.
    fn signal_dependents(&self) {
        let run_dir = self.config.run_dir();
        for role in ["resolver", "led"] {
            match RoleLock::holder(&run_dir, role) {
                Some(pid) if process::pid_alive(pid) => {
                    info!("Signalling {} (pid {}) to restart on new code", role, pid);
                    if let Err(err) = process::terminate(pid, PEER_STOP_GRACE) {
                        warn!("Failed to terminate {}: {:#}", role, err);
                    }
                }
                _ => {}
            }
        }
        if let Some(pid) = read_pid_file(&self.config.dashboard_pid_path()) {
            if process::pid_alive(pid) {
                info!("Restarting dashboard (pid {})", pid);
                if let Err(err) = process::terminate(pid, PEER_STOP_GRACE) {
                    warn!("Failed to terminate dashboard: {:#}", err);
                }
            }
        }
    }

    async fn idle(&self, total: Duration) {
        let step = Duration::from_millis(250);
        let mut waited = Duration::ZERO;
        while waited < total {
            if self.shutdown.load(Ordering::Relaxed) {
                return;
            }
            let chunk = step.min(total - waited);
            tokio::time::sleep(chunk).await;
            waited += chunk;
        }
    }
}

fn read_env_value(content: &str, key: &str) -> Option<String> {
    content.lines().find_map(|line| {
        let line = line.trim();
        if line.starts_with('#') {
            return None;
        }
        let (k, v) = line.split_once('=')?;
        if k.trim() == key {
            Some(v.trim().trim_matches('"').to_string())
        } else {
            None
        }
    })
}

fn read_pid_file(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn run_shell(command: &str) -> Result<()> {
    info!("Executing command '{}'", command);
    let status = Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .status()
        .with_context(|| format!("Executing '{}'", command))?;
    if !status.success() {
        bail!("Command '{}' terminated with {}", command, status);
    }
    Ok(())
}

fn run_git(install_dir: &str, args: &[&str]) -> Result<()> {
    let status = Command::new("git")
        .arg("-C")
        .arg(install_dir)
        .args(args)
        .status()
        .with_context(|| format!("Running git {:?}", args))?;
    if !status.success() {
        bail!("git {:?} terminated with {}", args, status);
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_updater(dir: &Path) -> Updater {
        let mut config = Config::default();
        config.run_dir = dir.join("run").to_string_lossy().into_owned();
        config.data_dir = dir.join("data").to_string_lossy().into_owned();
        config.install_dir = dir.join("tree").to_string_lossy().into_owned();
        config.http_timeout_seconds = 1;
        let shutdown = Arc::new(AtomicBool::new(false));
        Updater::new(config, shutdown).unwrap()
    }

    #[test]
    fn gate_prefers_emergency_stop() {
        assert_eq!(gate(true, true), UpdateGate::EmergencyStop);
        assert_eq!(gate(false, true), UpdateGate::ManualMode);
        assert_eq!(gate(false, false), UpdateGate::Enabled);
    }

    #[test]
    fn needs_update_compares_hashes() {
        assert!(needs_update(None, "abc123"));
        assert!(needs_update(Some("abc122"), "abc123"));
        assert!(!needs_update(Some("abc123"), "abc123"));
    }

    #[test]
    fn deployed_commit_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let updater = test_updater(dir.path());
        assert_eq!(updater.read_deployed_commit().unwrap(), None);
        updater.write_deployed_commit("deadbeef").unwrap();
        assert_eq!(
            updater.read_deployed_commit().unwrap(),
            Some("deadbeef".to_string())
        );
    }

    #[test]
    fn no_change_cycle_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let updater = test_updater(dir.path());
        updater.write_deployed_commit("deadbeef").unwrap();
        let path = updater.config.update_state_path();
        let before = fs::metadata(&path).unwrap().modified().unwrap();
        // Same remote hash: nothing to do, nothing written.
        assert!(!needs_update(
            updater.read_deployed_commit().unwrap().as_deref(),
            "deadbeef"
        ));
        let after = fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn env_file_token_parsing() {
        let content = "# credentials\nGITHUB_TOKEN=\"ghp_abc123\"\nOTHER=x\n";
        assert_eq!(
            read_env_value(content, "GITHUB_TOKEN"),
            Some("ghp_abc123".to_string())
        );
        assert_eq!(read_env_value(content, "MISSING"), None);
        assert_eq!(read_env_value("", "GITHUB_TOKEN"), None);
    }

    #[tokio::test]
    async fn unreachable_remote_is_a_transient_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut updater = test_updater(dir.path());
        updater.config.repo_api_url = "http://127.0.0.1:1/repos/x/y".to_string();
        // check_once surfaces the network error; run() logs and retries.
        assert!(updater.check_once().await.is_err());
        // No state was created as a side effect.
        assert!(!updater.config.update_state_path().exists());
    }

    #[tokio::test]
    async fn emergency_stop_disables_the_updater() {
        let dir = tempfile::tempdir().unwrap();
        let mut updater = test_updater(dir.path());
        updater.config.repo_api_url = "http://127.0.0.1:1/repos/x/y".to_string();
        fs::create_dir_all(updater.config.data_dir()).unwrap();
        fs::write(updater.config.emergency_stop_path(), "").unwrap();
        // Even with an unreachable remote the cycle is a clean no-op.
        assert!(updater.check_once().await.is_ok());
    }

    #[test]
    fn backup_archives_are_timestamped_under_the_backup_dir() {
        let dir = tempfile::tempdir().unwrap();
        let updater = test_updater(dir.path());
        fs::create_dir_all(&updater.config.install_dir).unwrap();
        fs::write(Path::new(&updater.config.install_dir).join("file.txt"), "x").unwrap();
        let archive = updater.create_backup().unwrap();
        assert!(archive.starts_with(updater.config.backup_dir()));
        assert!(archive.extension().is_some());
        assert!(archive.metadata().unwrap().len() > 0);
    }
}
