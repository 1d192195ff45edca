//! In-memory collaborators shared by the unit tests.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;

use crate::collaborators::{
    ClipRequest, Collaborators, FrameSampler, MediaFetcher, MetadataProvider, VideoEncoder,
};
use crate::error::{DiscoveryError, EncodeError, FetchError, SampleError};
use crate::model::VideoDescriptor;
use crate::retry::RetryPolicy;

/// An eligible ten-minute video uploaded `ts_secs` after the epoch.
pub fn descriptor(id: &str, ts_secs: i64) -> VideoDescriptor {
    VideoDescriptor {
        id: id.to_string(),
        title: format!("Video {id}"),
        upload_timestamp: Utc.timestamp_opt(ts_secs, 0).single(),
        duration_seconds: Some(600.0),
        is_short: false,
        is_live: false,
        is_available: true,
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
        jitter: true,
        stagger_step: Duration::from_millis(1),
        stagger_cap: Duration::from_millis(3),
    }
}

#[derive(Debug, Clone)]
pub struct EncodeCall {
    pub images: Vec<PathBuf>,
    pub seconds_per_image: f64,
    pub output: PathBuf,
}

#[derive(Default)]
struct WorldState {
    listing: Option<Result<Vec<VideoDescriptor>, DiscoveryError>>,
    listing_calls: usize,
    fetch_failures: HashMap<String, FetchError>,
    fetch_delays: HashMap<String, Duration>,
    fetch_panics: HashSet<String>,
    fetch_calls: HashMap<String, usize>,
    seek_limits: HashMap<String, f64>,
    sample_offsets: HashMap<String, Vec<f64>>,
    encode_calls: Vec<EncodeCall>,
    encode_failure: Option<String>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<WorldState>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Scriptable stand-in for the provider, fetcher, sampler and encoder.
#[derive(Clone, Default)]
pub struct FakeWorld {
    inner: Arc<Inner>,
}

impl FakeWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_videos(videos: Vec<VideoDescriptor>) -> Self {
        let world = Self::new();
        world.set_listing(Ok(videos));
        world
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            provider: self.inner.clone(),
            fetcher: self.inner.clone(),
            sampler: self.inner.clone(),
            encoder: self.inner.clone(),
        }
    }

    pub fn set_listing(&self, listing: Result<Vec<VideoDescriptor>, DiscoveryError>) {
        self.inner.state.lock().listing = Some(listing);
    }

    /// Makes the fetcher panic for `video_id`.
    pub fn panic_fetch(&self, video_id: &str) {
        self.inner
            .state
            .lock()
            .fetch_panics
            .insert(video_id.to_string());
    }

    pub fn fail_fetch(&self, video_id: &str, error: FetchError) {
        self.inner
            .state
            .lock()
            .fetch_failures
            .insert(video_id.to_string(), error);
    }

    pub fn delay_fetch(&self, video_id: &str, delay: Duration) {
        self.inner
            .state
            .lock()
            .fetch_delays
            .insert(video_id.to_string(), delay);
    }

    /// Offsets past `limit` seconds fail with `SeekOutOfRange`.
    pub fn seek_limit(&self, video_id: &str, limit: f64) {
        self.inner
            .state
            .lock()
            .seek_limits
            .insert(video_id.to_string(), limit);
    }

    pub fn fail_encode(&self, reason: &str) {
        self.inner.state.lock().encode_failure = Some(reason.to_string());
    }

    pub fn listing_calls(&self) -> usize {
        self.inner.state.lock().listing_calls
    }

    pub fn fetch_calls(&self, video_id: &str) -> usize {
        self.inner
            .state
            .lock()
            .fetch_calls
            .get(video_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_fetch_calls(&self) -> usize {
        self.inner.state.lock().fetch_calls.values().sum()
    }

    pub fn total_sample_calls(&self) -> usize {
        self.inner
            .state
            .lock()
            .sample_offsets
            .values()
            .map(Vec::len)
            .sum()
    }

    pub fn sample_offsets(&self, video_id: &str) -> Vec<f64> {
        self.inner
            .state
            .lock()
            .sample_offsets
            .get(video_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn encode_calls(&self) -> Vec<EncodeCall> {
        self.inner.state.lock().encode_calls.clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataProvider for Inner {
    async fn list_channel_videos(
        &self,
        channel: &str,
    ) -> Result<Vec<VideoDescriptor>, DiscoveryError> {
        let mut state = self.state.lock();
        state.listing_calls += 1;
        state.listing.clone().unwrap_or_else(|| {
            Err(DiscoveryError::ChannelNotFound {
                channel: channel.to_string(),
                reason: "no listing scripted".into(),
            })
        })
    }
}

#[async_trait]
impl MediaFetcher for Inner {
    async fn download_clip(&self, request: ClipRequest<'_>) -> Result<PathBuf, FetchError> {
        let (failure, delay, panics) = {
            let mut state = self.state.lock();
            *state
                .fetch_calls
                .entry(request.video_id.to_string())
                .or_default() += 1;
            (
                state.fetch_failures.get(request.video_id).cloned(),
                state.fetch_delays.get(request.video_id).copied(),
                state.fetch_panics.contains(request.video_id),
            )
        };
        if panics {
            panic!("fetcher blew up on {}", request.video_id);
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        } else {
            tokio::task::yield_now().await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(error) = failure {
            return Err(error);
        }
        let path = request
            .destination_dir
            .join(format!("{}.mp4", request.video_id));
        fs::write(&path, request.video_id).map_err(|err| FetchError::Network(err.to_string()))?;
        Ok(path)
    }
}

#[async_trait]
impl FrameSampler for Inner {
    async fn extract_frame(
        &self,
        source: &Path,
        timestamp_seconds: f64,
        destination: &Path,
    ) -> Result<PathBuf, SampleError> {
        let video_id = source
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or_default()
            .to_string();
        let limit = {
            let mut state = self.state.lock();
            state
                .sample_offsets
                .entry(video_id.clone())
                .or_default()
                .push(timestamp_seconds);
            state.seek_limits.get(&video_id).copied()
        };

        if let Some(limit) = limit
            && timestamp_seconds > limit
        {
            return Err(SampleError::SeekOutOfRange {
                timestamp: timestamp_seconds,
                reason: format!("clip is only {limit}s long"),
            });
        }
        if !source.exists() {
            return Err(SampleError::Decode(format!("{} missing", source.display())));
        }
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|err| SampleError::Process(err.to_string()))?;
        }
        fs::write(destination, &video_id).map_err(|err| SampleError::Process(err.to_string()))?;
        Ok(destination.to_path_buf())
    }
}

#[async_trait]
impl VideoEncoder for Inner {
    async fn encode(
        &self,
        images: &[PathBuf],
        seconds_per_image: f64,
        output: &Path,
    ) -> Result<(), EncodeError> {
        let failure = {
            let mut state = self.state.lock();
            state.encode_calls.push(EncodeCall {
                images: images.to_vec(),
                seconds_per_image,
                output: output.to_path_buf(),
            });
            state.encode_failure.clone()
        };
        if let Some(reason) = failure {
            return Err(EncodeError::Failed(reason));
        }
        if images.is_empty() {
            return Err(EncodeError::NoFrames);
        }
        fs::write(output, b"mp4")?;
        Ok(())
    }
}

/// Writes an executable shell script standing in for an external program.
pub fn install_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let script_path = dir.join(name);
    fs::write(&script_path, body).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&script_path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script_path, perms).unwrap();
    }
    script_path
}
