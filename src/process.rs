use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use std::process::Command;
use std::thread;
use std::time::Duration;

/// Returns whether a process is currently alive. Zombies count as dead for
/// supervision purposes.
pub fn pid_alive(pid: u32) -> bool {
    let stat_path = format!("/proc/{}/stat", pid);
    if Path::new("/proc").exists() {
        match fs::read_to_string(&stat_path) {
            Ok(stat) => !is_zombie_stat(&stat),
            Err(_) => false,
        }
    } else {
        Command::new("kill")
            .args(["-0", &pid.to_string()])
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

// /proc/<pid>/stat: "<pid> (<comm>) <state> ..."; comm may contain spaces.
fn is_zombie_stat(stat: &str) -> bool {
    stat.rsplit(')')
        .next()
        .map(|rest| rest.trim_start().starts_with('Z'))
        .unwrap_or(false)
}

/// Sends SIGTERM, waits up to `grace` for exit, then escalates to SIGKILL.
pub fn terminate(pid: u32, grace: Duration) -> Result<()> {
    signal(pid, None)?;
    if wait_for_exit(pid, grace) {
        return Ok(());
    }
    signal(pid, Some("-9"))?;
    wait_for_exit(pid, Duration::from_millis(500));
    Ok(())
}

fn signal(pid: u32, flag: Option<&str>) -> Result<()> {
    let mut cmd = Command::new("kill");
    if let Some(flag) = flag {
        cmd.arg(flag);
    }
    let status = cmd
        .arg(pid.to_string())
        .status()
        .with_context(|| format!("Signalling process {}", pid))?;
    if !status.success() {
        // Process already gone; nothing left to do.
        return Ok(());
    }
    Ok(())
}

fn wait_for_exit(pid: u32, within: Duration) -> bool {
    let step = Duration::from_millis(50);
    let mut waited = Duration::from_millis(0);
    while waited < within {
        if !pid_alive(pid) {
            return true;
        }
        thread::sleep(step);
        waited += step;
    }
    !pid_alive(pid)
}
