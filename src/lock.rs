use anyhow::{bail, Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::process::pid_alive;

/// Advisory PID-bearing lock enforcing at most one process per role. A lock
/// whose recorded PID is no longer alive is stale and gets reclaimed.
pub struct RoleLock {
    path: PathBuf,
    role: String,
    held: bool,
}

impl RoleLock {
    pub fn acquire(run_dir: &PathBuf, role: &str) -> Result<RoleLock> {
        fs::create_dir_all(run_dir)
            .with_context(|| format!("Creating runtime directory {}", run_dir.display()))?;
        let path = run_dir.join(format!("{}.lock", role));

        if path.exists() {
            match read_holder(&path) {
                Some(holder) if holder == std::process::id() => {
                    bail!("Role lock for '{}' already held by this process", role);
                }
                Some(holder) if pid_alive(holder) => {
                    bail!(
                        "Role lock for '{}' held by live process {} at {}",
                        role,
                        holder,
                        path.display()
                    );
                }
                Some(holder) => {
                    warn!(
                        "Reclaiming stale '{}' lock left behind by dead process {}",
                        role, holder
                    );
                    fs::remove_file(&path)
                        .with_context(|| format!("Removing stale lock at {}", path.display()))?;
                }
                None => {
                    warn!("Discarding unreadable '{}' lock at {}", role, path.display());
                    fs::remove_file(&path)
                        .with_context(|| format!("Removing unreadable lock at {}", path.display()))?;
                }
            }
        }

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => {
                use std::io::Write;
                let mut file = file;
                write!(file, "{}", std::process::id())
                    .with_context(|| format!("Writing PID into lock at {}", path.display()))?;
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                // Lost the creation race to another instance.
                let holder = read_holder(&path);
                bail!(
                    "Role lock for '{}' grabbed concurrently by {:?}",
                    role,
                    holder
                );
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Creating role lock at {}", path.display()));
            }
        }

        info!("Acquired '{}' role lock ({})", role, path.display());
        Ok(RoleLock {
            path,
            role: role.to_string(),
            held: true,
        })
    }

    /// PID recorded in a role's lock file, if any.
    pub fn holder(run_dir: &PathBuf, role: &str) -> Option<u32> {
        read_holder(&run_dir.join(format!("{}.lock", role)))
    }

    pub fn release(mut self) {
        self.unlink();
    }

    fn unlink(&mut self) {
        if self.held {
            if let Err(err) = fs::remove_file(&self.path) {
                warn!("Failed to release '{}' role lock: {}", self.role, err);
            }
            self.held = false;
        }
    }
}

impl Drop for RoleLock {
    fn drop(&mut self) {
        self.unlink();
    }
}

fn read_holder(path: &PathBuf) -> Option<u32> {
    let content = fs::read_to_string(path).ok()?;
    content.trim().parse().ok()
}
