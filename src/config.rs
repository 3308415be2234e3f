use anyhow::{Context, Result};
use serde::Deserialize;
use std::default::Default;
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_SETTINGS_FILE: &str = "/etc/wavealert360/settings.yaml";

/// Immutable runtime configuration. Built once at startup from defaults,
/// an optional YAML settings file, and the environment (in that order),
/// then passed explicitly into component constructors.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub cloud_base_url: String,
    pub weather_api_url: String,
    pub latitude: f64,
    pub longitude: f64,

    pub run_dir: String,
    pub data_dir: String,
    pub install_dir: String,

    pub repo_api_url: String,
    pub repo_remote: String,
    pub repo_branch: String,
    pub repo_token_file: Option<String>,
    pub post_update_command: Option<String>,
    pub dashboard_command: Option<String>,

    pub network_interface: Option<String>,

    pub resolver_poll_seconds: u64,
    pub supervisor_tick_seconds: u64,
    pub updater_poll_seconds: u64,
    pub led_monitor_seconds: u64,
    pub led_status_stale_seconds: u64,
    pub http_timeout_seconds: u64,
    pub audio_timeout_seconds: u64,
    pub lkg_max_age_seconds: u64,
    pub demo_pause_seconds: u64,
    pub restart_window_seconds: u64,
    pub restart_max_per_window: u32,

    pub spi_device_red: String,
    pub spi_device_yellow: String,
    pub spi_device_green: String,
    pub leds_per_strip: usize,
    pub blink_iterations: u32,
    pub blink_on_ms: u64,
    pub blink_off_ms: u64,

    pub debug: bool,
}

/// Overlay with every field optional, as decoded from the settings file or
/// the environment. Set fields overwrite values in `Config`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartialConfig {
    pub cloud_base_url: Option<String>,
    pub weather_api_url: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub run_dir: Option<String>,
    pub data_dir: Option<String>,
    pub install_dir: Option<String>,
    pub repo_api_url: Option<String>,
    pub repo_remote: Option<String>,
    pub repo_branch: Option<String>,
    pub repo_token_file: Option<String>,
    pub post_update_command: Option<String>,
    pub dashboard_command: Option<String>,
    pub network_interface: Option<String>,
    pub resolver_poll_seconds: Option<u64>,
    pub supervisor_tick_seconds: Option<u64>,
    pub updater_poll_seconds: Option<u64>,
    pub led_monitor_seconds: Option<u64>,
    pub led_status_stale_seconds: Option<u64>,
    pub http_timeout_seconds: Option<u64>,
    pub audio_timeout_seconds: Option<u64>,
    pub lkg_max_age_seconds: Option<u64>,
    pub demo_pause_seconds: Option<u64>,
    pub restart_window_seconds: Option<u64>,
    pub restart_max_per_window: Option<u32>,
    pub spi_device_red: Option<String>,
    pub spi_device_yellow: Option<String>,
    pub spi_device_green: Option<String>,
    pub leds_per_strip: Option<usize>,
    pub blink_iterations: Option<u32>,
    pub blink_on_ms: Option<u64>,
    pub blink_off_ms: Option<u64>,
    pub debug: Option<bool>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cloud_base_url: "https://api.wavealert360.net".to_string(),
            weather_api_url: "https://api.weather.gov".to_string(),
            latitude: 0.0,
            longitude: 0.0,
            run_dir: "/run/wavealert360".to_string(),
            data_dir: "/var/lib/wavealert360".to_string(),
            install_dir: "/opt/wavealert360".to_string(),
            repo_api_url: "https://api.github.com/repos/wavealert360/wavealert360".to_string(),
            repo_remote: "origin".to_string(),
            repo_branch: "main".to_string(),
            repo_token_file: None,
            post_update_command: None,
            dashboard_command: None,
            network_interface: None,
            resolver_poll_seconds: 30,
            supervisor_tick_seconds: 60,
            updater_poll_seconds: 120,
            led_monitor_seconds: 2,
            // Three LED monitor ticks without a status update means wedged.
            led_status_stale_seconds: 6,
            http_timeout_seconds: 10,
            audio_timeout_seconds: 90,
            lkg_max_age_seconds: 6 * 3600,
            demo_pause_seconds: 3,
            restart_window_seconds: 600,
            restart_max_per_window: 5,
            spi_device_red: "/dev/spidev0.0".to_string(),
            spi_device_yellow: "/dev/spidev0.1".to_string(),
            spi_device_green: "/dev/spidev1.0".to_string(),
            leds_per_strip: 48,
            blink_iterations: 10,
            blink_on_ms: 500,
            blink_off_ms: 500,
            debug: false,
        }
    }
}

impl Config {
    // cfg overwrites values in self.
    pub fn merge_partial(&mut self, cfg: PartialConfig) {
        if let Some(cloud_base_url) = cfg.cloud_base_url {
            self.cloud_base_url = cloud_base_url;
        }
        if let Some(weather_api_url) = cfg.weather_api_url {
            self.weather_api_url = weather_api_url;
        }
        if let Some(latitude) = cfg.latitude {
            self.latitude = latitude;
        }
        if let Some(longitude) = cfg.longitude {
            self.longitude = longitude;
        }
        if let Some(run_dir) = cfg.run_dir {
            self.run_dir = run_dir;
        }
        if let Some(data_dir) = cfg.data_dir {
            self.data_dir = data_dir;
        }
        if let Some(install_dir) = cfg.install_dir {
            self.install_dir = install_dir;
        }
        if let Some(repo_api_url) = cfg.repo_api_url {
            self.repo_api_url = repo_api_url;
        }
        if let Some(repo_remote) = cfg.repo_remote {
            self.repo_remote = repo_remote;
        }
        if let Some(repo_branch) = cfg.repo_branch {
            self.repo_branch = repo_branch;
        }
        if let Some(repo_token_file) = cfg.repo_token_file {
            self.repo_token_file = Some(repo_token_file);
        }
        if let Some(post_update_command) = cfg.post_update_command {
            self.post_update_command = Some(post_update_command);
        }
        if let Some(dashboard_command) = cfg.dashboard_command {
            self.dashboard_command = Some(dashboard_command);
        }
        if let Some(network_interface) = cfg.network_interface {
            self.network_interface = Some(network_interface);
        }
        if let Some(resolver_poll_seconds) = cfg.resolver_poll_seconds {
            self.resolver_poll_seconds = resolver_poll_seconds;
        }
        if let Some(supervisor_tick_seconds) = cfg.supervisor_tick_seconds {
            self.supervisor_tick_seconds = supervisor_tick_seconds;
        }
        if let Some(updater_poll_seconds) = cfg.updater_poll_seconds {
            self.updater_poll_seconds = updater_poll_seconds;
        }
        if let Some(led_monitor_seconds) = cfg.led_monitor_seconds {
            self.led_monitor_seconds = led_monitor_seconds;
        }
        if let Some(led_status_stale_seconds) = cfg.led_status_stale_seconds {
            self.led_status_stale_seconds = led_status_stale_seconds;
        }
        if let Some(http_timeout_seconds) = cfg.http_timeout_seconds {
            self.http_timeout_seconds = http_timeout_seconds;
        }
        if let Some(audio_timeout_seconds) = cfg.audio_timeout_seconds {
            self.audio_timeout_seconds = audio_timeout_seconds;
        }
        if let Some(lkg_max_age_seconds) = cfg.lkg_max_age_seconds {
            self.lkg_max_age_seconds = lkg_max_age_seconds;
        }
        if let Some(demo_pause_seconds) = cfg.demo_pause_seconds {
            self.demo_pause_seconds = demo_pause_seconds;
        }
        if let Some(restart_window_seconds) = cfg.restart_window_seconds {
            self.restart_window_seconds = restart_window_seconds;
        }
        if let Some(restart_max_per_window) = cfg.restart_max_per_window {
            self.restart_max_per_window = restart_max_per_window;
        }
        if let Some(spi_device_red) = cfg.spi_device_red {
            self.spi_device_red = spi_device_red;
        }
        if let Some(spi_device_yellow) = cfg.spi_device_yellow {
            self.spi_device_yellow = spi_device_yellow;
        }
        if let Some(spi_device_green) = cfg.spi_device_green {
            self.spi_device_green = spi_device_green;
        }
        if let Some(leds_per_strip) = cfg.leds_per_strip {
            self.leds_per_strip = leds_per_strip;
        }
        if let Some(blink_iterations) = cfg.blink_iterations {
            self.blink_iterations = blink_iterations;
        }
        if let Some(blink_on_ms) = cfg.blink_on_ms {
            self.blink_on_ms = blink_on_ms;
        }
        if let Some(blink_off_ms) = cfg.blink_off_ms {
            self.blink_off_ms = blink_off_ms;
        }
        if let Some(debug) = cfg.debug {
            self.debug = debug
        }
    }

    /// Loads configuration: defaults, then the settings file (if present),
    /// then environment variables.
    pub fn load() -> Result<Config> {
        let settings_file = std::env::var("WAVEALERT_SETTINGS")
            .unwrap_or_else(|_| DEFAULT_SETTINGS_FILE.to_string());
        Self::load_from(Path::new(&settings_file))
    }

    pub fn load_from(settings_file: &Path) -> Result<Config> {
        let mut cfg = Config::default();
        if settings_file.exists() {
            let content = fs::read_to_string(settings_file).with_context(|| {
                format!("Reading settings file at {}", settings_file.display())
            })?;
            let file_cfg: PartialConfig = serde_yaml::from_str(&content).with_context(|| {
                format!("YAML unmarshalling settings at {}", settings_file.display())
            })?;
            cfg.merge_partial(file_cfg);
        }
        let env_cfg = envy::from_env::<PartialConfig>().context("Reading environment overrides")?;
        cfg.merge_partial(env_cfg);
        Ok(cfg)
    }

    pub fn run_dir(&self) -> PathBuf {
        PathBuf::from(&self.run_dir)
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }

    /// Single-line control token consumed by the LED service.
    pub fn token_path(&self) -> PathBuf {
        self.run_dir().join("led-control")
    }

    /// Status JSON document published by the LED service.
    pub fn led_status_path(&self) -> PathBuf {
        self.run_dir().join("led-status.json")
    }

    pub fn lkg_path(&self) -> PathBuf {
        self.data_dir().join("last-known-good.json")
    }

    pub fn update_state_path(&self) -> PathBuf {
        self.data_dir().join("deployed-commit")
    }

    pub fn lock_path(&self, role: &str) -> PathBuf {
        self.run_dir().join(format!("{}.lock", role))
    }

    pub fn dashboard_pid_path(&self) -> PathBuf {
        self.run_dir().join("dashboard.pid")
    }

    pub fn emergency_stop_path(&self) -> PathBuf {
        self.data_dir().join("emergency-stop")
    }

    pub fn manual_mode_path(&self) -> PathBuf {
        self.data_dir().join("manual-mode")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.data_dir().join("backups")
    }

    pub fn audio_cache_dir(&self) -> PathBuf {
        self.data_dir().join("audio-cache")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_overwrites_defaults() {
        let mut cfg = Config::default();
        cfg.merge_partial(PartialConfig {
            resolver_poll_seconds: Some(15),
            dashboard_command: Some("python3 -m dashboard".to_string()),
            ..Default::default()
        });
        assert_eq!(cfg.resolver_poll_seconds, 15);
        assert_eq!(cfg.dashboard_command.as_deref(), Some("python3 -m dashboard"));
        assert_eq!(cfg.updater_poll_seconds, 120);
    }

    #[test]
    fn settings_file_is_merged() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "latitude: 21.28\nlongitude: -157.83\ndebug: true").unwrap();
        let cfg = Config::load_from(file.path()).unwrap();
        assert!(cfg.debug);
        assert!((cfg.latitude - 21.28).abs() < f64::EPSILON);
        assert_eq!(cfg.leds_per_strip, 48);
    }

    #[test]
    fn missing_settings_file_yields_defaults() {
        let cfg = Config::load_from(Path::new("/nonexistent/settings.yaml")).unwrap();
        assert_eq!(cfg.resolver_poll_seconds, 30);
        assert_eq!(cfg.restart_max_per_window, 5);
    }

    #[test]
    fn derived_paths_land_in_configured_dirs() {
        let cfg = Config::default();
        assert_eq!(cfg.token_path(), PathBuf::from("/run/wavealert360/led-control"));
        assert_eq!(cfg.lock_path("resolver"), PathBuf::from("/run/wavealert360/resolver.lock"));
        assert_eq!(cfg.lkg_path(), PathBuf::from("/var/lib/wavealert360/last-known-good.json"));
    }
}
