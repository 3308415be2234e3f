use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::model::ResolverDecision;

/// Last-known-good cache: the most recent successful resolver decision,
/// persisted as JSON. Written only on success; a corrupt or absent record
/// reads back as `None`, which callers treat as fail-safe.
pub struct LkgCache {
    path: PathBuf,
    max_age: Duration,
}

impl LkgCache {
    pub fn new(path: PathBuf, max_age: Duration) -> LkgCache {
        LkgCache { path, max_age }
    }

    pub fn store(&self, decision: &ResolverDecision) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Creating cache directory {}", parent.display()))?;
        }
        let serialized = serde_json::to_vec(decision).context("Serializing LKG record")?;
        let tmp = self.path.with_extension(format!("tmp.{}", std::process::id()));
        fs::write(&tmp, &serialized)
            .and_then(|_| fs::rename(&tmp, &self.path))
            .with_context(|| format!("Persisting LKG record at {}", self.path.display()))
    }

    /// Loads the record regardless of age. The demo-mode flag survives in
    /// the cache even past the freshness bound.
    pub fn load(&self) -> Option<ResolverDecision> {
        let content = fs::read(&self.path).ok()?;
        match serde_json::from_slice(&content) {
            Ok(decision) => Some(decision),
            Err(err) => {
                warn!("Corrupt LKG record at {}: {}", self.path.display(), err);
                None
            }
        }
    }

    pub fn is_fresh(&self, decision: &ResolverDecision, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(decision.obtained_at);
        age >= chrono::Duration::zero()
            && age.to_std().map(|age| age <= self.max_age).unwrap_or(false)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{AlertLevel, DecisionSource, DeviceMode};

    fn decision(obtained_at: &str) -> ResolverDecision {
        ResolverDecision {
            level: AlertLevel::Caution,
            audio_url: Some("https://audio.example/caution.mp3".to_string()),
            source: DecisionSource::Live,
            obtained_at: obtained_at.parse().unwrap(),
            device_mode: DeviceMode::Live,
            demo_pause_seconds: 0,
        }
    }

    #[test]
    fn store_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LkgCache::new(dir.path().join("lkg.json"), Duration::from_secs(3600));
        let d = decision("2026-07-01T12:00:00Z");
        cache.store(&d).unwrap();
        assert_eq!(cache.load(), Some(d));
    }

    #[test]
    fn repeated_store_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LkgCache::new(dir.path().join("lkg.json"), Duration::from_secs(3600));
        let d = decision("2026-07-01T12:00:00Z");
        cache.store(&d).unwrap();
        let first = fs::read(dir.path().join("lkg.json")).unwrap();
        cache.store(&d).unwrap();
        let second = fs::read(dir.path().join("lkg.json")).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn absent_and_corrupt_records_read_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lkg.json");
        let cache = LkgCache::new(path.clone(), Duration::from_secs(3600));
        assert_eq!(cache.load(), None);

        fs::write(&path, b"{not json").unwrap();
        assert_eq!(cache.load(), None);
    }

    #[test]
    fn freshness_bound_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LkgCache::new(dir.path().join("lkg.json"), Duration::from_secs(3600));
        let d = decision("2026-07-01T12:00:00Z");
        let now_fresh: DateTime<Utc> = "2026-07-01T12:30:00Z".parse().unwrap();
        let now_stale: DateTime<Utc> = "2026-07-01T14:00:01Z".parse().unwrap();
        let now_before: DateTime<Utc> = "2026-07-01T11:00:00Z".parse().unwrap();
        assert!(cache.is_fresh(&d, now_fresh));
        assert!(!cache.is_fresh(&d, now_stale));
        assert!(!cache.is_fresh(&d, now_before));
    }
}
