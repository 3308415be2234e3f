use anyhow::{Context, Result};
use chrono::Utc;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::channel::{ControlToken, TokenChannel};
use crate::config::Config;
use crate::led::blinker;
use crate::led::driver::{init_driver, LedDriver};
use crate::lock::RoleLock;
use crate::model::LedServiceStatus;

/// Sole owner of the LED hardware. Follows the file-backed control channel
/// and publishes a status document every monitor tick. Hardware failures
/// degrade the service to simulation; they never crash it.
pub struct LedService {
    config: Config,
    driver: Box<dyn LedDriver>,
    hardware_available: bool,
    channel: TokenChannel,
    status_path: PathBuf,
    current: Option<ControlToken>,
    shutdown: Arc<AtomicBool>,
    _lock: RoleLock,
}

impl LedService {
    /// Acquires the role lock (exiting if another instance is alive) and
    /// initializes hardware, degrading to simulation on failure.
    pub fn new(config: Config, shutdown: Arc<AtomicBool>) -> Result<LedService> {
        let (driver, hardware_available) = init_driver(&config);
        Self::with_driver(config, driver, hardware_available, shutdown)
    }

    pub fn with_driver(
        config: Config,
        driver: Box<dyn LedDriver>,
        hardware_available: bool,
        shutdown: Arc<AtomicBool>,
    ) -> Result<LedService> {
        let lock = RoleLock::acquire(&config.run_dir(), "led")
            .context("LED service requires exclusive hardware ownership")?;
        let channel = TokenChannel::new(config.token_path());
        let status_path = config.led_status_path();
        Ok(LedService {
            config,
            driver,
            hardware_available,
            channel,
            status_path,
            current: None,
            shutdown,
            _lock: lock,
        })
    }

    pub async fn run(mut self) -> Result<()> {
        info!(
            "LED service running (hardware_available: {})",
            self.hardware_available
        );
        self.clear_strips();
        self.publish_status();
        let tick = Duration::from_secs(self.config.led_monitor_seconds);

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                info!("LED service shutting down");
                self.clear_strips();
                self.publish_status();
                return Ok(());
            }

            match self.channel.read_latest() {
                Some(token) if Some(token) != self.current => self.apply(token).await,
                _ => self.publish_status(),
            }

            tokio::time::sleep(tick).await;
        }
    }

    async fn apply(&mut self, token: ControlToken) {
        info!("Applying control token {}", token.as_line());
        match token {
            ControlToken::Off => {
                self.clear_strips();
                self.current = Some(token);
            }
            ControlToken::Pattern(color) => {
                // Only one strip is ever active.
                self.clear_strips();
                let cmd = blinker::blink(
                    self.config.blink_iterations,
                    Duration::from_millis(self.config.blink_on_ms),
                    Duration::from_millis(self.config.blink_off_ms),
                );
                let driver = self.driver.as_mut();
                let channel = &self.channel;
                let outcome =
                    blinker::run(driver, color, &cmd, || channel.read_latest() != Some(token))
                        .await;
                match outcome {
                    // Steady on after the blink cycle. Only a completed
                    // animation counts as the current token; interrupted or
                    // failed patterns must not show up in the status
                    // document.
                    Ok(false) => {
                        if let Err(err) = driver.set_strip(color, true) {
                            warn!("LED write failed, marking hardware degraded: {:#}", err);
                            self.hardware_available = false;
                        }
                        self.current = Some(token);
                    }
                    Ok(true) => info!("Animation interrupted by newer control token"),
                    Err(err) => {
                        warn!("LED write failed, marking hardware degraded: {:#}", err);
                        self.hardware_available = false;
                    }
                }
            }
        }
        self.publish_status();
    }

    fn clear_strips(&mut self) {
        if let Err(err) = self.driver.clear_all() {
            warn!("LED clear failed, marking hardware degraded: {:#}", err);
            self.hardware_available = false;
        }
    }

    fn publish_status(&self) {
        let status = LedServiceStatus {
            pid: std::process::id(),
            hardware_available: self.hardware_available,
            current_level: match self.current {
                Some(ControlToken::Pattern(color)) => Some(color.level()),
                _ => None,
            },
            last_updated: Utc::now(),
        };
        if let Err(err) = self.write_status(&status) {
            warn!("Failed to publish LED status: {:#}", err);
        }
    }

    fn write_status(&self, status: &LedServiceStatus) -> Result<()> {
        if let Some(parent) = self.status_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Creating status directory {}", parent.display()))?;
        }
        let serialized = serde_json::to_vec(status).context("Serializing LED status")?;
        let tmp = self
            .status_path
            .with_extension(format!("tmp.{}", std::process::id()));
        fs::write(&tmp, &serialized)
            .and_then(|_| fs::rename(&tmp, &self.status_path))
            .with_context(|| format!("Writing LED status at {}", self.status_path.display()))
    }
}
