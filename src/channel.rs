use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

use crate::model::LedColor;

/// Latest-wins signal written by the resolver and consumed by the LED
/// service. Exactly one line; intermediate values may be skipped by slow
/// readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlToken {
    Pattern(LedColor),
    Off,
}

impl ControlToken {
    pub fn as_line(&self) -> String {
        match self {
            ControlToken::Pattern(color) => format!("PATTERN:{}", color.name()),
            ControlToken::Off => "OFF".to_string(),
        }
    }

    pub fn parse(raw: &str) -> Option<ControlToken> {
        match raw.trim() {
            "PATTERN:RED" => Some(ControlToken::Pattern(LedColor::Red)),
            "PATTERN:YELLOW" => Some(ControlToken::Pattern(LedColor::Yellow)),
            "PATTERN:GREEN" => Some(ControlToken::Pattern(LedColor::Green)),
            "OFF" => Some(ControlToken::Off),
            _ => None,
        }
    }
}

/// File-backed control channel. Writes are atomic (write-then-rename), so a
/// concurrent reader observes either the previous or the new token, never a
/// torn value. After a failed atomic write the channel degrades to in-place
/// writes on subsequent publishes.
pub struct TokenChannel {
    path: PathBuf,
    degraded: AtomicBool,
}

impl TokenChannel {
    pub fn new(path: PathBuf) -> TokenChannel {
        TokenChannel {
            path,
            degraded: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn publish(&self, token: &ControlToken) -> Result<()> {
        let line = format!("{}\n", token.as_line());
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Creating control channel directory {}", parent.display()))?;
        }

        if self.degraded.load(Ordering::Relaxed) {
            return fs::write(&self.path, &line)
                .with_context(|| format!("Writing control token at {}", self.path.display()));
        }

        let tmp = self.path.with_extension(format!("tmp.{}", std::process::id()));
        let res = fs::write(&tmp, &line)
            .and_then(|_| fs::rename(&tmp, &self.path))
            .with_context(|| format!("Atomically writing control token at {}", self.path.display()));
        if res.is_err() {
            warn!(
                "Atomic control token write failed, falling back to in-place writes: {}",
                self.path.display()
            );
            let _ = fs::remove_file(&tmp);
            self.degraded.store(true, Ordering::Relaxed);
        }
        res
    }

    /// Reads the newest token. Absent or unparseable contents yield `None`.
    pub fn read_latest(&self) -> Option<ControlToken> {
        let content = fs::read_to_string(&self.path).ok()?;
        ControlToken::parse(&content)
    }
}
