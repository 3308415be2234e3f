use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Canonical alert severity. Anything the cloud sends that is not one of the
/// known values normalizes to `Safe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertLevel {
    Safe,
    Caution,
    Danger,
    Demo,
}

impl AlertLevel {
    /// Fail-safe normalization of a wire value. Missing and unknown levels
    /// collapse to `Safe`.
    pub fn normalize(raw: Option<&str>) -> AlertLevel {
        match raw.map(|s| s.trim().to_uppercase()).as_deref() {
            Some("SAFE") => AlertLevel::Safe,
            Some("CAUTION") => AlertLevel::Caution,
            Some("DANGER") => AlertLevel::Danger,
            Some("DEMO") => AlertLevel::Demo,
            _ => AlertLevel::Safe,
        }
    }

    /// Canonical LED color for this level. `Demo` is never dispatched
    /// directly; the demo cycle substitutes concrete levels.
    pub fn color(self) -> LedColor {
        match self {
            AlertLevel::Safe | AlertLevel::Demo => LedColor::Green,
            AlertLevel::Caution => LedColor::Yellow,
            AlertLevel::Danger => LedColor::Red,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LedColor {
    Red,
    Yellow,
    Green,
}

impl LedColor {
    pub fn name(self) -> &'static str {
        match self {
            LedColor::Red => "RED",
            LedColor::Yellow => "YELLOW",
            LedColor::Green => "GREEN",
        }
    }

    pub fn level(self) -> AlertLevel {
        match self {
            LedColor::Red => AlertLevel::Danger,
            LedColor::Yellow => AlertLevel::Caution,
            LedColor::Green => AlertLevel::Safe,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceMode {
    Live,
    Test,
    Demo,
}

impl DeviceMode {
    pub fn normalize(raw: Option<&str>) -> DeviceMode {
        match raw.map(|s| s.trim().to_uppercase()).as_deref() {
            Some("TEST") => DeviceMode::Test,
            Some("DEMO") => DeviceMode::Demo,
            _ => DeviceMode::Live,
        }
    }
}

/// Provenance of a resolver decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DecisionSource {
    Live,
    Test,
    Demo,
    Cache,
    Failsafe,
}

/// Outcome of one resolver poll. Persisted verbatim as the last-known-good
/// cache record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolverDecision {
    pub level: AlertLevel,
    pub audio_url: Option<String>,
    pub source: DecisionSource,
    pub obtained_at: DateTime<Utc>,
    pub device_mode: DeviceMode,
    pub demo_pause_seconds: u64,
}

impl ResolverDecision {
    pub fn is_demo(&self) -> bool {
        self.device_mode == DeviceMode::Demo || self.level == AlertLevel::Demo
    }

    pub fn failsafe(now: DateTime<Utc>) -> ResolverDecision {
        ResolverDecision {
            level: AlertLevel::Safe,
            audio_url: None,
            source: DecisionSource::Failsafe,
            obtained_at: now,
            device_mode: DeviceMode::Live,
            demo_pause_seconds: 0,
        }
    }
}

/// Wire format of the cloud alert endpoint. Unknown fields are ignored,
/// known fields are all optional so a sparse payload still decodes.
#[derive(Debug, Clone, Deserialize)]
pub struct AlertResponse {
    #[serde(default)]
    pub alert_level: Option<String>,
    #[serde(default)]
    pub led_color: Option<String>,
    #[serde(default)]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub device_mode: Option<String>,
    #[serde(default)]
    pub demo_pause_seconds: Option<u64>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Status document published by the LED service on every monitor tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedServiceStatus {
    pub pid: u32,
    pub hardware_available: bool,
    pub current_level: Option<AlertLevel>,
    pub last_updated: DateTime<Utc>,
}
