use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Playback capability. The only contract is "play this file path
/// synchronously with a bounded timeout"; selection between the real sink
/// and the logging no-op happens at startup.
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn play(&self, path: &Path) -> Result<()>;
}

pub struct RodioSink {
    timeout: Duration,
}

impl RodioSink {
    pub fn new(timeout: Duration) -> RodioSink {
        RodioSink { timeout }
    }
}

#[async_trait]
impl AudioSink for RodioSink {
    async fn play(&self, path: &Path) -> Result<()> {
        let path = path.to_path_buf();
        let playback = tokio::task::spawn_blocking(move || -> Result<()> {
            let (_stream, handle) =
                rodio::OutputStream::try_default().context("Opening default audio output")?;
            let sink = rodio::Sink::try_new(&handle).context("Creating audio sink")?;
            let file = fs::File::open(&path)
                .with_context(|| format!("Opening audio file {}", path.display()))?;
            let source = rodio::Decoder::new(BufReader::new(file))
                .with_context(|| format!("Decoding audio file {}", path.display()))?;
            sink.append(source);
            sink.sleep_until_end();
            Ok(())
        });
        match tokio::time::timeout(self.timeout, playback).await {
            Ok(joined) => joined.context("Audio playback task")?,
            Err(_) => bail!("Audio playback exceeded {:?}", self.timeout),
        }
    }
}

/// Probes the default audio output once at startup and selects the real
/// sink or the logging no-op accordingly.
pub fn default_audio_sink(timeout: Duration) -> Box<dyn AudioSink> {
    match rodio::OutputStream::try_default() {
        Ok(_) => Box::new(RodioSink::new(timeout)),
        Err(err) => {
            warn!("Audio output unavailable, playback disabled: {}", err);
            Box::new(NullSink)
        }
    }
}

/// No-op sink for headless operation; only logs what would have played.
pub struct NullSink;

#[async_trait]
impl AudioSink for NullSink {
    async fn play(&self, path: &Path) -> Result<()> {
        info!("Audio disabled, skipping playback of {}", path.display());
        Ok(())
    }
}

/// Local audio file cache keyed by URL. Downloads only when the cached copy
/// is missing or the server reports a newer file; on network failure a stale
/// cached copy is still served.
pub struct AudioCache {
    dir: PathBuf,
    http: reqwest::Client,
}

impl AudioCache {
    pub fn new(dir: PathBuf, http_timeout: Duration) -> Result<AudioCache> {
        let http = reqwest::Client::builder()
            .timeout(http_timeout)
            .build()
            .context("Building audio HTTP client")?;
        Ok(AudioCache { dir, http })
    }

    pub fn cache_path(&self, url: &str) -> PathBuf {
        self.dir.join(format!("{}.mp3", URL_SAFE_NO_PAD.encode(url)))
    }

    pub async fn fetch(&self, url: &str) -> Result<PathBuf> {
        Url::parse(url).with_context(|| format!("Invalid audio URL {}", url))?;
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Creating audio cache directory {}", self.dir.display()))?;
        let target = self.cache_path(url);
        let cached_since = modified_at(&target);

        let mut request = self.http.get(url);
        if let Some(since) = cached_since {
            request = request.header(
                reqwest::header::IF_MODIFIED_SINCE,
                since.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
            );
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                if target.exists() {
                    warn!("Audio fetch failed ({}), serving cached copy of {}", err, url);
                    return Ok(target);
                }
                return Err(err).with_context(|| format!("GET {}", url));
            }
        };

        let status = response.status();
        if status == reqwest::StatusCode::NOT_MODIFIED {
            debug!("Audio unchanged upstream: {}", url);
            return Ok(target);
        }
        if !status.is_success() {
            if target.exists() {
                warn!("Audio fetch returned {}, serving cached copy of {}", status, url);
                return Ok(target);
            }
            bail!("Audio fetch for {} returned {}", url, status);
        }

        let body = response
            .bytes()
            .await
            .with_context(|| format!("Downloading audio body from {}", url))?;
        let tmp = target.with_extension(format!("tmp.{}", std::process::id()));
        fs::write(&tmp, &body)
            .and_then(|_| fs::rename(&tmp, &target))
            .with_context(|| format!("Storing audio file at {}", target.display()))?;
        info!("Downloaded audio {} ({} bytes)", url, body.len());
        Ok(target)
    }
}

fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    Some(DateTime::<Utc>::from(modified))
}

pub mod test {
    use super::*;
    use crossbeam_channel::{self, Receiver, Sender};

    /// Sink double that records every play request, optionally snapshotting
    /// another file's contents at play time (used to assert dispatch order).
    pub struct CapturingSink {
        tx: Sender<PlayEvent>,
        pub observe_file: Option<PathBuf>,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct PlayEvent {
        pub path: PathBuf,
        pub observed: Option<String>,
    }

    impl CapturingSink {
        pub fn new() -> (CapturingSink, Receiver<PlayEvent>) {
            let (tx, rx) = crossbeam_channel::unbounded();
            (
                CapturingSink {
                    tx,
                    observe_file: None,
                },
                rx,
            )
        }
    }

    #[async_trait]
    impl AudioSink for CapturingSink {
        async fn play(&self, path: &Path) -> Result<()> {
            let observed = self
                .observe_file
                .as_ref()
                .and_then(|file| fs::read_to_string(file).ok())
                .map(|s| s.trim().to_string());
            self.tx
                .send(PlayEvent {
                    path: path.to_path_buf(),
                    observed,
                })
                .context("Recording play event")?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_paths_are_stable_and_distinct() {
        let cache = AudioCache::new(PathBuf::from("/tmp/audio"), Duration::from_secs(5)).unwrap();
        let a = cache.cache_path("https://audio.example/safe.mp3");
        let b = cache.cache_path("https://audio.example/danger.mp3");
        assert_ne!(a, b);
        assert_eq!(a, cache.cache_path("https://audio.example/safe.mp3"));
        assert!(a.starts_with("/tmp/audio"));
    }

    #[tokio::test]
    async fn unreachable_host_serves_cached_copy() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AudioCache::new(dir.path().to_path_buf(), Duration::from_secs(1)).unwrap();
        let url = "http://127.0.0.1:1/safe.mp3";
        let target = cache.cache_path(url);
        fs::create_dir_all(dir.path()).unwrap();
        fs::write(&target, b"mp3-bytes").unwrap();

        let served = cache.fetch(url).await.unwrap();
        assert_eq!(served, target);
        assert_eq!(fs::read(served).unwrap(), b"mp3-bytes");
    }

    #[tokio::test]
    async fn unreachable_host_without_cache_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AudioCache::new(dir.path().to_path_buf(), Duration::from_secs(1)).unwrap();
        assert!(cache.fetch("http://127.0.0.1:1/missing.mp3").await.is_err());
    }

    #[tokio::test]
    async fn invalid_url_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AudioCache::new(dir.path().to_path_buf(), Duration::from_secs(1)).unwrap();
        assert!(cache.fetch("not a url").await.is_err());
    }
}
