use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::audio::{default_audio_sink, AudioCache, AudioSink};
use crate::channel::{ControlToken, TokenChannel};
use crate::cloud::{classify_titles, CloudClient, WeatherClient};
use crate::config::Config;
use crate::device::DeviceIdentity;
use crate::lkg::LkgCache;
use crate::lock::RoleLock;
use crate::model::{
    AlertLevel, AlertResponse, DecisionSource, DeviceMode, ResolverDecision,
};

/// Builds a decision from a successful cloud response. Unknown levels and
/// modes are normalized fail-safe.
pub fn decision_from_response(
    response: &AlertResponse,
    default_demo_pause: u64,
    now: DateTime<Utc>,
) -> ResolverDecision {
    let level = AlertLevel::normalize(response.alert_level.as_deref());
    let device_mode = DeviceMode::normalize(response.device_mode.as_deref());
    let demo = device_mode == DeviceMode::Demo || level == AlertLevel::Demo;
    let source = if demo {
        DecisionSource::Demo
    } else if device_mode == DeviceMode::Test {
        DecisionSource::Test
    } else {
        DecisionSource::Live
    };
    ResolverDecision {
        level,
        audio_url: response.audio_url.clone(),
        source,
        obtained_at: now,
        device_mode,
        demo_pause_seconds: response.demo_pause_seconds.unwrap_or(default_demo_pause),
    }
}

/// Double-failure path: fall back to the cached record. Demo mode survives
/// past the freshness bound; anything else stale collapses to fail-safe.
pub fn decision_from_cache(
    cached: Option<ResolverDecision>,
    lkg: &LkgCache,
    now: DateTime<Utc>,
) -> ResolverDecision {
    match cached {
        Some(cached) if cached.is_demo() => ResolverDecision {
            source: DecisionSource::Cache,
            ..cached
        },
        Some(cached) if lkg.is_fresh(&cached, now) => ResolverDecision {
            source: DecisionSource::Cache,
            ..cached
        },
        _ => ResolverDecision::failsafe(now),
    }
}

/// Drives the appliance's visible behavior: each poll obtains a decision,
/// writes the control token, then plays the matching audio.
pub struct Resolver {
    config: Config,
    device: DeviceIdentity,
    cloud: CloudClient,
    weather: WeatherClient,
    lkg: LkgCache,
    channel: TokenChannel,
    audio_cache: AudioCache,
    audio: Box<dyn AudioSink>,
    shutdown: Arc<AtomicBool>,
    _lock: RoleLock,
}

impl Resolver {
    pub fn new(config: Config, shutdown: Arc<AtomicBool>) -> Result<Resolver> {
        let lock = RoleLock::acquire(&config.run_dir(), "resolver")?;
        let device = DeviceIdentity::detect(config.network_interface.as_deref())
            .context("Resolving device identity")?;
        let cloud = CloudClient::new(&config)?;
        let weather = WeatherClient::new(&config)?;
        let lkg = LkgCache::new(
            config.lkg_path(),
            Duration::from_secs(config.lkg_max_age_seconds),
        );
        let channel = TokenChannel::new(config.token_path());
        let audio_cache = AudioCache::new(
            config.audio_cache_dir(),
            Duration::from_secs(config.http_timeout_seconds),
        )?;
        let audio = default_audio_sink(Duration::from_secs(config.audio_timeout_seconds));
        Ok(Resolver {
            config,
            device,
            cloud,
            weather,
            lkg,
            channel,
            audio_cache,
            audio,
            shutdown,
            _lock: lock,
        })
    }

    pub async fn run(self) -> Result<()> {
        info!("Resolver running (device identity {})", self.device);
        let interval = Duration::from_secs(self.config.resolver_poll_seconds);

        // Polls never overlap: a long cycle delays the next one.
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                info!("Resolver shutting down");
                return Ok(());
            }
            let started = Instant::now();
            let decision = self.resolve().await;
            if decision.is_demo() {
                while !self.shutdown.load(Ordering::Relaxed) && started.elapsed() < interval {
                    self.demo_sweep(&decision).await;
                }
                continue;
            }
            self.dispatch(&decision).await;
            let elapsed = started.elapsed();
            if elapsed < interval {
                self.idle(interval - elapsed).await;
            }
        }
    }

    async fn resolve(&self) -> ResolverDecision {
        let now = Utc::now();
        match self.cloud.fetch_alert(&self.device).await {
            Ok(response) => {
                let decision =
                    decision_from_response(&response, self.config.demo_pause_seconds, now);
                self.remember(&decision);
                decision
            }
            Err(err) => {
                warn!("Cloud resolution failed, trying upstream fallback: {:#}", err);
                self.resolve_fallback(now).await
            }
        }
    }

    async fn resolve_fallback(&self, now: DateTime<Utc>) -> ResolverDecision {
        match self.weather.fetch_alert_titles().await {
            Ok(titles) => {
                let level = classify_titles(&titles);
                info!("Upstream fallback classified {} active alerts as {:?}", titles.len(), level);
                let decision = ResolverDecision {
                    level,
                    audio_url: None,
                    source: DecisionSource::Live,
                    obtained_at: now,
                    device_mode: DeviceMode::Live,
                    demo_pause_seconds: self.config.demo_pause_seconds,
                };
                self.remember(&decision);
                decision
            }
            Err(err) => {
                warn!("Upstream fallback failed, using cached record: {:#}", err);
                decision_from_cache(self.lkg.load(), &self.lkg, now)
            }
        }
    }

    // LKG is written only after a successful resolution.
    fn remember(&self, decision: &ResolverDecision) {
        if let Err(err) = self.lkg.store(decision) {
            warn!("Failed to persist LKG record: {:#}", err);
        }
    }

    /// Control token first, audio second: the LEDs light up no later than
    /// the audio starts. Audio failures are not retried within the cycle.
    async fn dispatch(&self, decision: &ResolverDecision) {
        let token = ControlToken::Pattern(decision.level.color());
        if let Err(err) = self.channel.publish(&token) {
            error!("Failed to publish control token: {:#}", err);
        }
        if let Some(url) = &decision.audio_url {
            match self.audio_cache.fetch(url).await {
                Ok(path) => {
                    if let Err(err) = self.audio.play(&path).await {
                        warn!("Audio playback failed, next cycle retries: {:#}", err);
                    }
                }
                Err(err) => warn!("Audio fetch failed, next cycle retries: {:#}", err),
            }
        }
        info!(
            "Dispatched {:?} as {} (source {:?})",
            decision.level,
            token.as_line(),
            decision.source
        );
    }

    /// One demo sweep: SAFE -> CAUTION -> DANGER, each step held for the
    /// configured pause.
    async fn demo_sweep(&self, decision: &ResolverDecision) {
        let pause = Duration::from_secs(decision.demo_pause_seconds.max(1));
        info!("Demo sweep starting (pause {:?})", pause);
        for level in [AlertLevel::Safe, AlertLevel::Caution, AlertLevel::Danger] {
            if self.shutdown.load(Ordering::Relaxed) {
                return;
            }
            let step = ResolverDecision {
                level,
                audio_url: decision.audio_url.clone(),
                source: DecisionSource::Demo,
                obtained_at: decision.obtained_at,
                device_mode: DeviceMode::Demo,
                demo_pause_seconds: decision.demo_pause_seconds,
            };
            self.dispatch(&step).await;
            self.idle(pause).await;
        }
    }

    // Shutdown-aware sleep so SIGTERM is honored promptly.
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

#[cfg(test)]
mod test {
    use super::*;
    use crate::audio::test::CapturingSink;
    use crate::model::LedColor;
    use std::fs;

    fn response(level: Option<&str>, mode: Option<&str>) -> AlertResponse {
        AlertResponse {
            alert_level: level.map(|s| s.to_string()),
            led_color: None,
            audio_url: Some("https://audio.example/alert.mp3".to_string()),
            device_mode: mode.map(|s| s.to_string()),
            demo_pause_seconds: None,
            timestamp: None,
        }
    }

    fn now() -> DateTime<Utc> {
        "2026-07-01T12:00:00Z".parse().unwrap()
    }

    #[test]
    fn live_response_maps_to_live_decision() {
        let decision = decision_from_response(&response(Some("DANGER"), Some("LIVE")), 3, now());
        assert_eq!(decision.level, AlertLevel::Danger);
        assert_eq!(decision.source, DecisionSource::Live);
        assert_eq!(decision.level.color(), LedColor::Red);
    }

    #[test]
    fn missing_and_unknown_levels_resolve_safe() {
        let decision = decision_from_response(&response(None, None), 3, now());
        assert_eq!(decision.level, AlertLevel::Safe);
        let decision = decision_from_response(&response(Some("MELTDOWN"), None), 3, now());
        assert_eq!(decision.level, AlertLevel::Safe);
    }

    #[test]
    fn test_mode_is_tagged_but_dispatchable() {
        let decision = decision_from_response(&response(Some("CAUTION"), Some("TEST")), 3, now());
        assert_eq!(decision.source, DecisionSource::Test);
        assert!(!decision.is_demo());
    }

    #[test]
    fn demo_mode_wins_over_reported_level() {
        let decision = decision_from_response(&response(Some("DANGER"), Some("DEMO")), 3, now());
        assert!(decision.is_demo());
        assert_eq!(decision.source, DecisionSource::Demo);
        assert_eq!(decision.demo_pause_seconds, 3);
    }

    #[test]
    fn cache_fallback_retains_fresh_level() {
        let dir = tempfile::tempdir().unwrap();
        let lkg = LkgCache::new(dir.path().join("lkg.json"), Duration::from_secs(3600));
        let cached = ResolverDecision {
            level: AlertLevel::Caution,
            audio_url: None,
            source: DecisionSource::Live,
            obtained_at: now(),
            device_mode: DeviceMode::Live,
            demo_pause_seconds: 3,
        };
        let later: DateTime<Utc> = "2026-07-01T12:30:00Z".parse().unwrap();
        let decision = decision_from_cache(Some(cached), &lkg, later);
        assert_eq!(decision.level, AlertLevel::Caution);
        assert_eq!(decision.source, DecisionSource::Cache);
    }

    #[test]
    fn stale_cache_collapses_to_failsafe() {
        let dir = tempfile::tempdir().unwrap();
        let lkg = LkgCache::new(dir.path().join("lkg.json"), Duration::from_secs(3600));
        let cached = ResolverDecision {
            level: AlertLevel::Danger,
            audio_url: None,
            source: DecisionSource::Live,
            obtained_at: now(),
            device_mode: DeviceMode::Live,
            demo_pause_seconds: 3,
        };
        let much_later: DateTime<Utc> = "2026-07-02T12:00:00Z".parse().unwrap();
        let decision = decision_from_cache(Some(cached), &lkg, much_later);
        assert_eq!(decision.level, AlertLevel::Safe);
        assert_eq!(decision.source, DecisionSource::Failsafe);
    }

    #[test]
    fn missing_cache_collapses_to_failsafe() {
        let dir = tempfile::tempdir().unwrap();
        let lkg = LkgCache::new(dir.path().join("lkg.json"), Duration::from_secs(3600));
        let decision = decision_from_cache(None, &lkg, now());
        assert_eq!(decision.level, AlertLevel::Safe);
        assert_eq!(decision.source, DecisionSource::Failsafe);
    }

    #[test]
    fn demo_flag_survives_past_freshness_bound() {
        let dir = tempfile::tempdir().unwrap();
        let lkg = LkgCache::new(dir.path().join("lkg.json"), Duration::from_secs(3600));
        let cached = ResolverDecision {
            level: AlertLevel::Demo,
            audio_url: None,
            source: DecisionSource::Demo,
            obtained_at: now(),
            device_mode: DeviceMode::Demo,
            demo_pause_seconds: 5,
        };
        let much_later: DateTime<Utc> = "2026-07-03T12:00:00Z".parse().unwrap();
        let decision = decision_from_cache(Some(cached), &lkg, much_later);
        assert!(decision.is_demo());
        assert_eq!(decision.demo_pause_seconds, 5);
    }

    fn test_resolver(dir: &std::path::Path, audio: Box<dyn AudioSink>) -> Resolver {
        let mut config = Config::default();
        config.run_dir = dir.join("run").to_string_lossy().into_owned();
        config.data_dir = dir.join("data").to_string_lossy().into_owned();
        config.http_timeout_seconds = 1;
        let lock = RoleLock::acquire(&config.run_dir(), "resolver").unwrap();
        let lkg = LkgCache::new(
            config.lkg_path(),
            Duration::from_secs(config.lkg_max_age_seconds),
        );
        Resolver {
            device: DeviceIdentity::from_address("b8:27:eb:00:00:01"),
            cloud: CloudClient::new(&config).unwrap(),
            weather: WeatherClient::new(&config).unwrap(),
            lkg,
            channel: TokenChannel::new(config.token_path()),
            audio_cache: AudioCache::new(
                config.audio_cache_dir(),
                Duration::from_secs(config.http_timeout_seconds),
            )
            .unwrap(),
            audio,
            shutdown: Arc::new(AtomicBool::new(false)),
            _lock: lock,
            config,
        }
    }

    #[tokio::test]
    async fn token_is_written_before_audio_starts() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sink, rx) = CapturingSink::new();
        let mut config_probe = Config::default();
        config_probe.run_dir = dir.path().join("run").to_string_lossy().into_owned();
        sink.observe_file = Some(config_probe.token_path());

        let resolver = test_resolver(dir.path(), Box::new(sink));

        // Seed the audio cache so no network is needed.
        let url = "http://127.0.0.1:1/safe.mp3";
        let cached_audio = resolver.audio_cache.cache_path(url);
        fs::create_dir_all(cached_audio.parent().unwrap()).unwrap();
        fs::write(&cached_audio, b"mp3").unwrap();

        let decision = ResolverDecision {
            level: AlertLevel::Safe,
            audio_url: Some(url.to_string()),
            source: DecisionSource::Live,
            obtained_at: now(),
            device_mode: DeviceMode::Live,
            demo_pause_seconds: 3,
        };
        resolver.dispatch(&decision).await;

        let event = rx.try_recv().unwrap();
        assert_eq!(event.path, cached_audio);
        // The control token was already on disk when playback began.
        assert_eq!(event.observed.as_deref(), Some("PATTERN:GREEN"));
    }

    #[tokio::test]
    async fn audio_failure_does_not_block_token_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, rx) = CapturingSink::new();
        let resolver = test_resolver(dir.path(), Box::new(sink));

        let decision = ResolverDecision {
            level: AlertLevel::Danger,
            audio_url: Some("http://127.0.0.1:1/missing.mp3".to_string()),
            source: DecisionSource::Live,
            obtained_at: now(),
            device_mode: DeviceMode::Live,
            demo_pause_seconds: 3,
        };
        resolver.dispatch(&decision).await;

        assert_eq!(
            resolver.channel.read_latest(),
            Some(ControlToken::Pattern(LedColor::Red))
        );
        // Audio fetch failed without a cached copy, so nothing played.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn demo_sweep_cycles_green_yellow_red() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, _rx) = CapturingSink::new();
        let mut resolver = test_resolver(dir.path(), Box::new(sink));
        resolver.config.demo_pause_seconds = 0;

        let decision = ResolverDecision {
            level: AlertLevel::Demo,
            audio_url: None,
            source: DecisionSource::Demo,
            obtained_at: now(),
            device_mode: DeviceMode::Demo,
            demo_pause_seconds: 0,
        };

        // Capture the token after each dispatch by sweeping step by step.
        resolver
            .dispatch(&ResolverDecision {
                level: AlertLevel::Safe,
                ..decision.clone()
            })
            .await;
        assert_eq!(
            resolver.channel.read_latest(),
            Some(ControlToken::Pattern(LedColor::Green))
        );
        resolver
            .dispatch(&ResolverDecision {
                level: AlertLevel::Danger,
                ..decision.clone()
            })
            .await;
        assert_eq!(
            resolver.channel.read_latest(),
            Some(ControlToken::Pattern(LedColor::Red))
        );

        // A full sweep with pause 0 terminates promptly.
        resolver.demo_sweep(&decision).await;
        assert_eq!(
            resolver.channel.read_latest(),
            Some(ControlToken::Pattern(LedColor::Red))
        );
    }
}
