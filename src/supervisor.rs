use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::lock::RoleLock;
use crate::model::LedServiceStatus;
use crate::process;

const STOP_GRACE: Duration = Duration::from_secs(5);

/// Supervised roles, in spawn order: the hardware owner first so control
/// tokens are consumed quickly, then the resolver, updater, and dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Led,
    Resolver,
    Updater,
    Dashboard,
}

impl Role {
    pub fn all() -> [Role; 4] {
        [Role::Led, Role::Resolver, Role::Updater, Role::Dashboard]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Role::Led => "led",
            Role::Resolver => "resolver",
            Role::Updater => "updater",
            Role::Dashboard => "dashboard",
        }
    }

    fn binary(&self) -> Option<&'static str> {
        match self {
            Role::Led => Some("wavealert-led"),
            Role::Resolver => Some("wavealert-resolver"),
            Role::Updater => Some("wavealert-updater"),
            Role::Dashboard => None,
        }
    }
}

/// Windowed restart bookkeeping for one role.
#[derive(Debug, Clone)]
pub struct RestartRecord {
    pub last_start: Option<DateTime<Utc>>,
    pub window_started: Instant,
    pub count_in_window: u32,
    pub last_failure_reason: Option<String>,
    cooldown_logged: bool,
}

impl RestartRecord {
    fn new() -> RestartRecord {
        RestartRecord {
            last_start: None,
            window_started: Instant::now(),
            count_in_window: 0,
            last_failure_reason: None,
            cooldown_logged: false,
        }
    }
}

/// Bounded-restart policy: at most `max_per_window` starts per role within
/// a rolling window; beyond that the role sits in cool-down until the
/// window rolls over. Counters are independent per role.
#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    pub window: Duration,
    pub max_per_window: u32,
}

impl RestartPolicy {
    /// Checks (and advances) the window; returns whether a start is allowed
    /// right now, incrementing the counter when it is.
    pub fn admit(&self, record: &mut RestartRecord, now: Instant) -> bool {
        if now.duration_since(record.window_started) >= self.window {
            record.window_started = now;
            record.count_in_window = 0;
            record.cooldown_logged = false;
        }
        if record.count_in_window >= self.max_per_window {
            return false;
        }
        record.count_in_window += 1;
        true
    }

    pub fn in_cooldown(&self, record: &RestartRecord, now: Instant) -> bool {
        now.duration_since(record.window_started) < self.window
            && record.count_in_window >= self.max_per_window
    }
}

struct Supervised {
    role: Role,
    child: Option<Child>,
    record: RestartRecord,
}

/// Process guardian: ensures exactly one live instance per role and
/// respawns crashed peers under the bounded-restart policy. A failing role
/// never starves the others.
pub struct Supervisor {
    config: Config,
    policy: RestartPolicy,
    children: Vec<Supervised>,
    shutdown: Arc<AtomicBool>,
    _lock: RoleLock,
}

impl Supervisor {
    pub fn new(config: Config, shutdown: Arc<AtomicBool>) -> Result<Supervisor> {
        let lock = RoleLock::acquire(&config.run_dir(), "supervisor")
            .context("Another supervisor instance appears to be running")?;
        let policy = RestartPolicy {
            window: Duration::from_secs(config.restart_window_seconds),
            max_per_window: config.restart_max_per_window,
        };
        let children = Role::all()
            .into_iter()
            .map(|role| Supervised {
                role,
                child: None,
                record: RestartRecord::new(),
            })
            .collect();
        Ok(Supervisor {
            config,
            policy,
            children,
            shutdown,
            _lock: lock,
        })
    }

    pub async fn run(mut self) -> Result<()> {
        info!("Supervisor running (pid {})", std::process::id());
        self.start_all();
        let tick = Duration::from_secs(self.config.supervisor_tick_seconds);

        loop {
            self.idle(tick).await;
            if self.shutdown.load(Ordering::Relaxed) {
                info!("Supervisor shutting down");
                self.stop_all();
                return Ok(());
            }
            self.monitor_tick(Instant::now());
        }
    }

    fn start_all(&mut self) {
        let now = Instant::now();
        for idx in 0..self.children.len() {
            if self.children[idx].role == Role::Dashboard
                && self.config.dashboard_command.is_none()
            {
                continue;
            }
            self.spawn_role(idx, now);
        }
    }

    /// One liveness pass over all roles. Exited or stale children are
    /// respawned subject to the policy.
    fn monitor_tick(&mut self, now: Instant) {
        for idx in 0..self.children.len() {
            let role = self.children[idx].role;
            if role == Role::Dashboard && self.config.dashboard_command.is_none() {
                continue;
            }
            match self.probe(idx) {
                Liveness::Alive => {}
                Liveness::NeverStarted | Liveness::Exited => {
                    self.spawn_role(idx, now);
                }
                Liveness::Stale => {
                    warn!("{} status document is stale, restarting it", role.name());
                    self.kill_child(idx);
                    self.spawn_role(idx, now);
                }
            }
        }
        self.heartbeat(now);
    }

    fn probe(&mut self, idx: usize) -> Liveness {
        let role = self.children[idx].role;
        let led_stale = role == Role::Led && self.led_status_is_stale();
        let entry = &mut self.children[idx];
        let Some(child) = entry.child.as_mut() else {
            return Liveness::NeverStarted;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                warn!("{} exited with {}", role.name(), status);
                entry.record.last_failure_reason = Some(format!("exited with {}", status));
                entry.child = None;
                Liveness::Exited
            }
            Ok(None) => {
                if led_stale {
                    Liveness::Stale
                } else {
                    Liveness::Alive
                }
            }
            Err(err) => {
                warn!("Failed to probe {}: {}", role.name(), err);
                Liveness::Alive
            }
        }
    }

    // The LED service publishes status every monitor tick; silence beyond
    // the configured bound means it is wedged even if the process exists.
    fn led_status_is_stale(&self) -> bool {
        let path = self.config.led_status_path();
        let Ok(content) = fs::read(&path) else {
            return false;
        };
        let Ok(status) = serde_json::from_slice::<LedServiceStatus>(&content) else {
            return false;
        };
        let age = Utc::now().signed_duration_since(status.last_updated);
        age.num_seconds() > self.config.led_status_stale_seconds as i64
    }

    fn spawn_role(&mut self, idx: usize, now: Instant) {
        let role = self.children[idx].role;
        {
            let record = &mut self.children[idx].record;
            if !self.policy.admit(record, now) {
                if !record.cooldown_logged {
                    warn!(
                        "{} hit the restart cap ({} per {:?}), cooling down",
                        role.name(),
                        self.policy.max_per_window,
                        self.policy.window
                    );
                    record.cooldown_logged = true;
                }
                return;
            }
        }
        match self.launch(role) {
            Ok(child) => {
                info!("Started {} (pid {})", role.name(), child.id());
                if role == Role::Dashboard {
                    self.record_dashboard_pid(child.id());
                }
                let entry = &mut self.children[idx];
                entry.child = Some(child);
                entry.record.last_start = Some(Utc::now());
            }
            Err(err) => {
                error!("Failed to start {}: {:#}", role.name(), err);
                self.children[idx].record.last_failure_reason = Some(format!("{:#}", err));
            }
        }
    }

    fn launch(&self, role: Role) -> Result<Child> {
        let mut command = match role.binary() {
            Some(binary) => {
                let path = sibling_binary(binary)?;
                Command::new(path)
            }
            None => {
                let Some(ref dashboard) = self.config.dashboard_command else {
                    bail!("No dashboard command configured");
                };
                let mut command = Command::new("/bin/sh");
                command.arg("-c").arg(dashboard);
                command
            }
        };
        command
            .stdin(Stdio::null())
            .spawn()
            .with_context(|| format!("Spawning {}", role.name()))
    }

    // The updater terminates the dashboard after an update; it finds the
    // pid here since the dashboard holds no role lock of its own.
    fn record_dashboard_pid(&self, pid: u32) {
        let path = self.config.dashboard_pid_path();
        if let Err(err) = fs::create_dir_all(self.config.run_dir())
            .and_then(|_| fs::write(&path, pid.to_string()))
        {
            warn!("Failed to record dashboard pid: {}", err);
        }
    }

    fn kill_child(&mut self, idx: usize) {
        let entry = &mut self.children[idx];
        if let Some(mut child) = entry.child.take() {
            let pid = child.id();
            if let Err(err) = process::terminate(pid, STOP_GRACE) {
                warn!("Failed to terminate {} (pid {}): {:#}", entry.role.name(), pid, err);
            }
            let _ = child.wait();
        }
    }

    fn stop_all(&mut self) {
        // Reverse start order: dependents first, hardware owner last.
        for idx in (0..self.children.len()).rev() {
            let role = self.children[idx].role;
            if self.children[idx].child.is_some() {
                info!("Stopping {}", role.name());
                self.kill_child(idx);
            }
        }
    }

    fn heartbeat(&mut self, now: Instant) {
        let summary: Vec<String> = self
            .children
            .iter()
            .map(|entry| {
                let state = if entry.child.is_some() {
                    "running".to_string()
                } else if self.policy.in_cooldown(&entry.record, now) {
                    "cooldown".to_string()
                } else {
                    "down".to_string()
                };
                format!(
                    "{}={} restarts_in_window={}",
                    entry.role.name(),
                    state,
                    entry.record.count_in_window
                )
            })
            .collect();
        info!("Heartbeat: {}", summary.join(", "));
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

enum Liveness {
    NeverStarted,
    Alive,
    Exited,
    Stale,
}

fn sibling_binary(name: &str) -> Result<PathBuf> {
    let exe = std::env::current_exe().context("Locating current executable")?;
    let dir = exe
        .parent()
        .context("Current executable has no parent directory")?;
    Ok(dir.join(name))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn policy_admits_up_to_the_cap() {
        let policy = RestartPolicy {
            window: Duration::from_secs(600),
            max_per_window: 5,
        };
        let mut record = RestartRecord::new();
        let now = Instant::now();
        let admitted = (0..6).filter(|_| policy.admit(&mut record, now)).count();
        assert_eq!(admitted, 5);
        assert!(policy.in_cooldown(&record, now));
    }

    #[test]
    fn window_rollover_resets_the_counter() {
        let policy = RestartPolicy {
            window: Duration::from_secs(600),
            max_per_window: 2,
        };
        let mut record = RestartRecord::new();
        let start = Instant::now();
        assert!(policy.admit(&mut record, start));
        assert!(policy.admit(&mut record, start));
        assert!(!policy.admit(&mut record, start));

        let next_window = start + Duration::from_secs(601);
        assert!(policy.admit(&mut record, next_window));
        assert_eq!(record.count_in_window, 1);
        assert!(!policy.in_cooldown(&record, next_window));
    }

    #[test]
    fn counters_are_independent_per_role() {
        let policy = RestartPolicy {
            window: Duration::from_secs(600),
            max_per_window: 1,
        };
        let mut resolver = RestartRecord::new();
        let mut led = RestartRecord::new();
        let now = Instant::now();
        assert!(policy.admit(&mut resolver, now));
        assert!(!policy.admit(&mut resolver, now));
        // Resolver exhaustion must not affect the LED service.
        assert!(policy.admit(&mut led, now));
    }

    #[test]
    fn spawn_order_starts_hardware_owner_first() {
        let roles = Role::all();
        assert_eq!(roles[0], Role::Led);
        assert_eq!(roles[1], Role::Resolver);
        assert_eq!(roles.last(), Some(&Role::Dashboard));
    }

    #[test]
    fn supervisor_respawns_a_crashing_dashboard_within_the_cap() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.run_dir = dir.path().join("run").to_string_lossy().into_owned();
        config.data_dir = dir.path().join("data").to_string_lossy().into_owned();
        config.dashboard_command = Some("true".to_string());
        config.restart_max_per_window = 3;

        let shutdown = Arc::new(AtomicBool::new(false));
        let mut supervisor = Supervisor::new(config, shutdown).unwrap();

        // Only the dashboard has a runnable command in this environment;
        // drive ticks directly instead of the full loop.
        let dash = Role::all()
            .iter()
            .position(|r| *r == Role::Dashboard)
            .unwrap();
        let now = Instant::now();
        supervisor.spawn_role(dash, now);
        assert!(supervisor.children[dash].child.is_some());

        // Let `true` exit, then observe bounded respawns.
        std::thread::sleep(Duration::from_millis(200));
        supervisor.monitor_tick(now);
        std::thread::sleep(Duration::from_millis(200));
        supervisor.monitor_tick(now);
        std::thread::sleep(Duration::from_millis(200));
        supervisor.monitor_tick(now);
        assert!(supervisor.children[dash].record.count_in_window <= 3);
        assert!(supervisor
            .policy
            .in_cooldown(&supervisor.children[dash].record, now));
        supervisor.stop_all();
    }
}
