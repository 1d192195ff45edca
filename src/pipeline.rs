#![forbid(unsafe_code)]

//! Run coordinator: discovery, resume, dispatch, assembly.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, CacheStore, EntryStatus, Transition};
use crate::collaborators::{AuthTokens, Collaborators};
use crate::error::{CacheError, ConfigError, DiscoveryError, EncodeError, Result, RunError};
use crate::model::{VideoDescriptor, chronological, eligible_in_order};
use crate::pool::{WorkerPool, available_parallelism, resolve_worker_count};
use crate::retry::RetryPolicy;
use crate::summary::{RunSummary, VideoIssue};
use crate::task::{self, TaskContext, TaskOutcome, VideoTaskResult};

pub const DEFAULT_OUTPUT: &str = "channel_compilation.mp4";
/// Sample the first frame unless told otherwise.
pub const DEFAULT_POSITION_PERCENT: f64 = 0.0;
pub const DEFAULT_FRAME_DURATION: f64 = 0.2;
pub const DEFAULT_MAX_FORMAT_HEIGHT: u32 = 720;
/// Lowest resolution cap handed to the fetcher.
pub const MIN_FORMAT_HEIGHT: u32 = 144;
const TEMP_PREFIX: &str = "tubereel_";

#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    /// Where in each video the frame is taken, 0 to 100.
    pub position_percent: f64,
    /// Seconds each frame stays on screen.
    pub frame_duration: f64,
    pub max_format_height: u32,
    /// `None` picks a count from the auth state.
    pub max_workers: Option<usize>,
    /// Only the N chronologically earliest videos are processed.
    pub limit: Option<usize>,
    pub resume: bool,
    pub keep_temp: bool,
    /// Drop cached entries for videos that are no longer eligible.
    pub revalidate: bool,
    pub output: PathBuf,
    pub auth: Option<AuthTokens>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            position_percent: DEFAULT_POSITION_PERCENT,
            frame_duration: DEFAULT_FRAME_DURATION,
            max_format_height: DEFAULT_MAX_FORMAT_HEIGHT,
            max_workers: None,
            limit: None,
            resume: false,
            keep_temp: false,
            revalidate: false,
            output: PathBuf::from(DEFAULT_OUTPUT),
            auth: None,
        }
    }
}

impl RunOptions {
    pub fn validate(&self, channel: &str) -> std::result::Result<(), ConfigError> {
        if channel.trim().is_empty() {
            return Err(ConfigError::EmptyChannel);
        }
        if !(0.0..=100.0).contains(&self.position_percent) {
            return Err(ConfigError::PositionOutOfRange(self.position_percent));
        }
        if !(self.frame_duration.is_finite() && self.frame_duration > 0.0) {
            return Err(ConfigError::NonPositiveFrameDuration(self.frame_duration));
        }
        if self.limit == Some(0) {
            return Err(ConfigError::ZeroLimit);
        }
        if self.max_workers == Some(0) {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.max_format_height == 0 {
            return Err(ConfigError::ZeroFormatHeight);
        }
        Ok(())
    }

    fn effective_height(&self) -> u32 {
        self.max_format_height.max(MIN_FORMAT_HEIGHT)
    }
}

/// Appends `.mp4` when missing, substitutes the default file name for a bare
/// directory and creates the parent directory.
pub fn normalize_output_path(path: &Path) -> std::io::Result<PathBuf> {
    let is_dir_like = path.as_os_str().is_empty()
        || path.file_name().is_none()
        || path.as_os_str().to_string_lossy().ends_with(std::path::MAIN_SEPARATOR)
        || path.is_dir();
    let (directory, file_name) = if is_dir_like {
        (path.to_path_buf(), DEFAULT_OUTPUT.to_string())
    } else {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| DEFAULT_OUTPUT.to_string());
        let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
        (parent, name)
    };

    let directory = if directory.as_os_str().is_empty() {
        std::env::current_dir()?
    } else {
        directory
    };
    fs::create_dir_all(&directory)?;

    let file_name = if file_name.to_lowercase().ends_with(".mp4") {
        file_name
    } else {
        format!("{file_name}.mp4")
    };
    Ok(directory.join(file_name))
}

/// Progress hooks. All methods default to doing nothing.
pub trait RunObserver: Send + Sync {
    /// `done` counts videos settled by an earlier run.
    fn run_started(&self, _total: usize, _done: usize, _workers: usize) {}
    fn video_finished(&self, _result: &VideoTaskResult) {}
    fn run_finished(&self, _summary: &RunSummary) {}
}

pub struct NoopObserver;

impl RunObserver for NoopObserver {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunCounters {
    pub succeeded: usize,
    pub reused: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Everything one run knows about its channel. Built once per run and
/// threaded through explicitly.
#[derive(Debug, Clone)]
pub struct ChannelRunState {
    pub channel: String,
    /// Eligible videos in chronological order, limit applied.
    pub videos: Vec<VideoDescriptor>,
    /// Frames taken over from an earlier run.
    pub reused: HashMap<String, PathBuf>,
    pub counters: RunCounters,
    frames: HashMap<String, PathBuf>,
    skipped: Vec<VideoIssue>,
    failed: Vec<VideoIssue>,
}

impl ChannelRunState {
    pub fn new(channel: &str, videos: Vec<VideoDescriptor>) -> Self {
        Self {
            channel: channel.to_string(),
            videos,
            reused: HashMap::new(),
            counters: RunCounters::default(),
            frames: HashMap::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
        }
    }

    fn reuse(&mut self, video_id: &str, frame: PathBuf) {
        self.counters.reused += 1;
        self.reused.insert(video_id.to_string(), frame.clone());
        self.frames.insert(video_id.to_string(), frame);
    }

    fn skip_settled(&mut self, video: &VideoDescriptor, reason: String) {
        self.counters.skipped += 1;
        self.skipped.push(VideoIssue {
            video_id: video.id.clone(),
            title: video.title.clone(),
            reason,
        });
    }

    pub fn record(&mut self, result: &VideoTaskResult) {
        let issue = |reason: &str| VideoIssue {
            video_id: result.video_id.clone(),
            title: result.title.clone(),
            reason: reason.to_string(),
        };
        match &result.outcome {
            TaskOutcome::Extracted(frame) => {
                self.counters.succeeded += 1;
                self.frames.insert(result.video_id.clone(), frame.clone());
            }
            TaskOutcome::Skipped(reason) => {
                self.counters.skipped += 1;
                self.skipped.push(issue(reason));
            }
            TaskOutcome::Failed(reason) => {
                self.counters.failed += 1;
                self.failed.push(issue(reason));
            }
            TaskOutcome::Cancelled => self.counters.cancelled += 1,
        }
    }

    /// Frames of every video that has one, in chronological order.
    pub fn ordered_frames(&self) -> Vec<PathBuf> {
        let mut with_frames: Vec<(Option<&DateTime<Utc>>, &str, &PathBuf)> = self
            .videos
            .iter()
            .filter_map(|video| {
                self.frames
                    .get(&video.id)
                    .map(|frame| (video.upload_timestamp.as_ref(), video.id.as_str(), frame))
            })
            .collect();
        with_frames.sort_by(|a, b| chronological(a.0, a.1, b.0, b.1));
        with_frames
            .into_iter()
            .map(|(_, _, frame)| frame.clone())
            .collect()
    }

    fn summary(&self, started: Instant) -> RunSummary {
        let order: HashMap<&str, usize> = self
            .videos
            .iter()
            .enumerate()
            .map(|(index, video)| (video.id.as_str(), index))
            .collect();
        let by_position = |issues: &[VideoIssue]| {
            let mut sorted = issues.to_vec();
            sorted.sort_by_key(|issue| order.get(issue.video_id.as_str()).copied());
            sorted
        };
        RunSummary {
            channel: self.channel.clone(),
            total_videos: self.videos.len(),
            succeeded: self.counters.succeeded,
            reused: self.counters.reused,
            skipped: by_position(&self.skipped),
            failed: by_position(&self.failed),
            cancelled: self.counters.cancelled,
            frames: self.ordered_frames(),
            output: None,
            temp_location: None,
            elapsed: started.elapsed(),
        }
    }
}

/// Scratch space for downloads; kept roots survive the run.
enum TempRoot {
    Owned(TempDir),
    Kept(PathBuf),
}

impl TempRoot {
    fn create(options: &RunOptions) -> std::result::Result<Self, CacheError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(TEMP_PREFIX);
        if options.keep_temp {
            let parent = options
                .output
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let dir = builder
                .tempdir_in(parent)
                .map_err(|err| CacheError::io(parent, err))?;
            Ok(TempRoot::Kept(dir.keep()))
        } else {
            let dir = builder
                .tempdir()
                .map_err(|err| CacheError::io(std::env::temp_dir(), err))?;
            Ok(TempRoot::Owned(dir))
        }
    }

    fn path(&self) -> &Path {
        match self {
            TempRoot::Owned(dir) => dir.path(),
            TempRoot::Kept(path) => path,
        }
    }

    fn kept(&self) -> Option<PathBuf> {
        match self {
            TempRoot::Owned(_) => None,
            TempRoot::Kept(path) => Some(path.clone()),
        }
    }
}

pub struct Pipeline {
    store: Arc<CacheStore>,
    collaborators: Collaborators,
    retry: RetryPolicy,
    observer: Arc<dyn RunObserver>,
    parallelism: usize,
}

impl Pipeline {
    pub fn new(store: Arc<CacheStore>, collaborators: Collaborators) -> Self {
        Self {
            store,
            collaborators,
            retry: RetryPolicy::default(),
            observer: Arc::new(NoopObserver),
            parallelism: available_parallelism(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Processes every eligible video of `channel` and compiles the frames.
    ///
    /// Per-video failures end up in the summary. The run itself fails on bad
    /// options, failed discovery, cache I/O, a failed encode or cancellation;
    /// the last two still carry the summary of the work done.
    pub async fn run(
        &self,
        channel: &str,
        options: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<RunSummary> {
        options.validate(channel)?;
        let channel = channel.trim();
        let started = Instant::now();

        self.store.prepare(channel)?;
        let listing = self.discover(channel).await?;
        let eligible = eligible_in_order(listing, None);
        if eligible.is_empty() {
            return Err(DiscoveryError::NoEligibleVideos {
                channel: channel.to_string(),
            }
            .into());
        }
        let videos: Vec<VideoDescriptor> = match options.limit {
            Some(limit) => eligible.iter().take(limit).cloned().collect(),
            None => eligible.clone(),
        };
        info!(channel, eligible = eligible.len(), selected = videos.len(), "discovered videos");

        if !options.resume {
            self.store.clear(channel)?;
            self.store.prepare(channel)?;
        } else if options.revalidate {
            self.revalidate(channel, &eligible)?;
        }

        let mut state = ChannelRunState::new(channel, videos);
        let pending = self.partition(&mut state, options.resume)?;

        let temp_root = TempRoot::create(options)?;
        let workers = resolve_worker_count(
            options.auth.is_some(),
            options.max_workers,
            self.parallelism,
        )
        .min(pending.len())
        .max(1);
        info!(
            pending = pending.len(),
            reused = state.counters.reused,
            workers,
            "dispatching video tasks"
        );
        self.observer.run_started(
            state.videos.len(),
            state.counters.reused + state.counters.skipped,
            workers,
        );

        let ctx = Arc::new(TaskContext {
            channel: channel.to_string(),
            position_percent: options.position_percent,
            max_height: options.effective_height(),
            auth: options.auth.clone(),
            temp_root: temp_root.path().to_path_buf(),
            keep_temp: options.keep_temp,
            store: self.store.clone(),
            collaborators: self.collaborators.clone(),
            retry: self.retry.clone(),
            cancel: cancel.clone(),
        });
        let pool = WorkerPool::new(workers, self.retry.clone());
        let observer = self.observer.clone();
        let outcome = pool
            .run(
                pending,
                cancel,
                move |video: VideoDescriptor| {
                    let ctx = ctx.clone();
                    async move { task::process(&video, &ctx).await }
                },
                |result| observer.video_finished(result),
            )
            .await;

        for result in &outcome.completed {
            state.record(result);
        }
        for video in &outcome.panicked {
            let result = self.record_panicked(channel, video);
            state.record(&result);
            self.observer.video_finished(&result);
        }
        state.counters.cancelled += outcome.not_started.len();

        let mut summary = state.summary(started);
        summary.temp_location = temp_root.kept();

        if cancel.is_cancelled() {
            warn!(
                cancelled = summary.cancelled,
                "run interrupted, skipping compilation"
            );
            summary.elapsed = started.elapsed();
            self.observer.run_finished(&summary);
            return Err(RunError::Cancelled {
                summary: Box::new(summary),
            });
        }

        let encoded = if summary.frames.is_empty() {
            Err(EncodeError::NoFrames)
        } else {
            info!(
                frames = summary.frames.len(),
                output = %options.output.display(),
                "compiling video"
            );
            self.collaborators
                .encoder
                .encode(&summary.frames, options.frame_duration, &options.output)
                .await
        };
        summary.elapsed = started.elapsed();
        self.observer.run_finished(&summary);

        match encoded {
            Ok(()) => {
                summary.output = Some(options.output.clone());
                Ok(summary)
            }
            Err(source) => Err(RunError::Encode {
                summary: Box::new(summary),
                source,
            }),
        }
    }

    /// A task that panicked never recorded its own end state.
    fn record_panicked(&self, channel: &str, video: &VideoDescriptor) -> VideoTaskResult {
        const REASON: &str = "worker panicked";
        if let Err(err) = self
            .store
            .update(channel, &video.id, Transition::Failed(REASON.to_string()))
        {
            warn!(video = %video.id, error = %err, "could not record panicked task");
        }
        VideoTaskResult {
            video_id: video.id.clone(),
            title: video.title.clone(),
            upload_timestamp: video.upload_timestamp,
            outcome: TaskOutcome::Failed(REASON.to_string()),
        }
    }

    async fn discover(&self, channel: &str) -> Result<Vec<VideoDescriptor>> {
        match self.collaborators.provider.list_channel_videos(channel).await {
            Ok(listing) => {
                if let Err(err) = self.store.save_listing(channel, &listing) {
                    warn!(error = %err, "could not cache channel listing");
                }
                Ok(listing)
            }
            Err(err) => match self.store.load_listing(channel) {
                Some(cached) => {
                    warn!(error = %err, videos = cached.len(), "discovery failed, using cached listing");
                    Ok(cached)
                }
                None => Err(err.into()),
            },
        }
    }

    fn revalidate(&self, channel: &str, eligible: &[VideoDescriptor]) -> Result<()> {
        let current: HashSet<&str> = eligible.iter().map(|video| video.id.as_str()).collect();
        for entry in self.store.list_all(channel)? {
            if !current.contains(entry.video_id.as_str()) {
                debug!(video = %entry.video_id, "dropping stale cache entry");
                self.store.remove(channel, &entry.video_id)?;
            }
        }
        Ok(())
    }

    /// Splits the selected videos into settled ones (recorded in `state`)
    /// and the ones that still need a task. Every selected video has a cache
    /// entry afterwards.
    fn partition(
        &self,
        state: &mut ChannelRunState,
        resume: bool,
    ) -> Result<Vec<VideoDescriptor>> {
        let channel = state.channel.clone();
        let mut pending = Vec::new();
        for video in state.videos.clone() {
            let existing = if resume {
                self.readable_entry(&channel, &video.id)?
            } else {
                None
            };
            match existing {
                Some(CacheEntry {
                    status: EntryStatus::FrameExtracted,
                    frame_path: Some(frame),
                    ..
                }) if frame.exists() => state.reuse(&video.id, frame),
                Some(CacheEntry {
                    status: EntryStatus::Skipped,
                    skip_reason,
                    ..
                }) => state.skip_settled(&video, skip_reason.unwrap_or_default()),
                Some(entry) if !entry.status.is_settled() => {
                    pending.push(video);
                }
                stale => {
                    if stale.is_some() {
                        // Frame file vanished; start the video over.
                        self.store.remove(&channel, &video.id)?;
                    }
                    self.store.put(&channel, &CacheEntry::pending(&video))?;
                    pending.push(video);
                }
            }
        }
        Ok(pending)
    }

    /// Cached record of `video_id`. A record that no longer parses is
    /// dropped so the video is processed again.
    fn readable_entry(&self, channel: &str, video_id: &str) -> Result<Option<CacheEntry>> {
        match self.store.get(channel, video_id) {
            Err(CacheError::Corrupt { path, source }) => {
                warn!(path = %path.display(), error = %source, "discarding corrupt cache record");
                self.store.remove(channel, video_id)?;
                Ok(None)
            }
            other => Ok(other?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::testing::{FakeWorld, descriptor, fast_retry};
    use std::time::Duration;
    use tempfile::tempdir;

    const CHANNEL: &str = "https://www.youtube.com/@Pipeline";

    struct Harness {
        _cache: TempDir,
        out: TempDir,
        store: Arc<CacheStore>,
        world: FakeWorld,
    }

    impl Harness {
        fn new(videos: Vec<VideoDescriptor>) -> Self {
            let cache = tempdir().unwrap();
            let store = Arc::new(CacheStore::new(cache.path()));
            Self {
                _cache: cache,
                out: tempdir().unwrap(),
                store,
                world: FakeWorld::with_videos(videos),
            }
        }

        fn pipeline(&self) -> Pipeline {
            Pipeline::new(self.store.clone(), self.world.collaborators())
                .with_retry_policy(fast_retry())
                .with_parallelism(4)
        }

        fn options(&self) -> RunOptions {
            RunOptions {
                output: self.out.path().join("out.mp4"),
                max_workers: Some(4),
                ..RunOptions::default()
            }
        }

        fn frame(&self, id: &str) -> PathBuf {
            self.store.frame_path(CHANNEL, id)
        }

        async fn run(&self, options: &RunOptions) -> Result<RunSummary> {
            self.pipeline()
                .run(CHANNEL, options, &CancellationToken::new())
                .await
        }
    }

    #[test]
    fn validation_rejects_out_of_range_options() {
        let base = RunOptions::default();
        assert!(base.validate(CHANNEL).is_ok());
        let with = |tweak: fn(&mut RunOptions)| {
            let mut options = base.clone();
            tweak(&mut options);
            options.validate(CHANNEL)
        };
        assert_eq!(
            with(|o| o.position_percent = 101.0),
            Err(ConfigError::PositionOutOfRange(101.0))
        );
        assert_eq!(
            with(|o| o.position_percent = -1.0),
            Err(ConfigError::PositionOutOfRange(-1.0))
        );
        assert_eq!(
            with(|o| o.frame_duration = 0.0),
            Err(ConfigError::NonPositiveFrameDuration(0.0))
        );
        assert_eq!(with(|o| o.limit = Some(0)), Err(ConfigError::ZeroLimit));
        assert_eq!(with(|o| o.max_workers = Some(0)), Err(ConfigError::ZeroWorkers));
        assert_eq!(
            with(|o| o.max_format_height = 0),
            Err(ConfigError::ZeroFormatHeight)
        );
        assert_eq!(base.validate("  "), Err(ConfigError::EmptyChannel));
    }

    #[test]
    fn resolution_cap_has_a_floor() {
        let options = RunOptions {
            max_format_height: 90,
            ..RunOptions::default()
        };
        assert_eq!(options.effective_height(), MIN_FORMAT_HEIGHT);
    }

    #[test]
    fn output_path_gets_mp4_suffix_and_parent() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a/b/compilation");
        let normalized = normalize_output_path(&nested).unwrap();
        assert_eq!(normalized, dir.path().join("a/b/compilation.mp4"));
        assert!(dir.path().join("a/b").is_dir());

        let kept = normalize_output_path(&dir.path().join("x.MP4")).unwrap();
        assert_eq!(kept, dir.path().join("x.MP4"));

        let bare = normalize_output_path(dir.path()).unwrap();
        assert_eq!(bare, dir.path().join(DEFAULT_OUTPUT));
    }

    #[tokio::test]
    async fn invalid_options_fail_before_any_work() {
        let harness = Harness::new(vec![descriptor("a", 1)]);
        let options = RunOptions {
            position_percent: 150.0,
            ..harness.options()
        };
        let err = harness.run(&options).await.unwrap_err();
        assert!(matches!(err, RunError::Configuration(_)));
        assert_eq!(harness.world.listing_calls(), 0);
    }

    #[tokio::test]
    async fn three_videos_compile_in_upload_order() {
        let harness = Harness::new(vec![
            descriptor("t3", 300),
            descriptor("t1", 100),
            descriptor("t2", 200),
        ]);
        // Finish in reverse chronological order.
        harness.world.delay_fetch("t1", Duration::from_millis(40));
        harness.world.delay_fetch("t2", Duration::from_millis(20));

        let summary = harness.run(&harness.options()).await.unwrap();

        let expected = vec![harness.frame("t1"), harness.frame("t2"), harness.frame("t3")];
        assert_eq!(summary.frames, expected);
        let calls = harness.world.encode_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].images, expected);
        assert_eq!(calls[0].seconds_per_image, DEFAULT_FRAME_DURATION);
        assert_eq!(summary.succeeded, 3);
        assert_eq!(summary.output, Some(harness.options().output));
    }

    #[tokio::test]
    async fn order_ignores_completion_order() {
        let videos: Vec<_> = (0..12).map(|i| descriptor(&format!("v{i:02}"), 1_000 + i)).collect();
        let harness = Harness::new(videos.clone());
        for (i, video) in videos.iter().enumerate() {
            let jitter = (i as u64 * 7919) % 23;
            harness.world.delay_fetch(&video.id, Duration::from_millis(jitter));
        }

        let summary = harness.run(&harness.options()).await.unwrap();

        let expected: Vec<_> = videos.iter().map(|video| harness.frame(&video.id)).collect();
        assert_eq!(summary.frames, expected);
    }

    #[tokio::test]
    async fn resume_reuses_extracted_frames_without_collaborator_calls() {
        let harness = Harness::new(vec![descriptor("a", 1), descriptor("b", 2)]);
        harness.run(&harness.options()).await.unwrap();
        let fetches = harness.world.total_fetch_calls();
        let samples = harness.world.total_sample_calls();

        let resumed = RunOptions {
            resume: true,
            ..harness.options()
        };
        let summary = harness.run(&resumed).await.unwrap();

        assert_eq!(harness.world.total_fetch_calls(), fetches);
        assert_eq!(harness.world.total_sample_calls(), samples);
        assert_eq!(summary.reused, 2);
        assert_eq!(summary.succeeded, 0);
        assert_eq!(summary.frames, vec![harness.frame("a"), harness.frame("b")]);
    }

    #[tokio::test]
    async fn resume_retries_failed_and_redoes_missing_frames() {
        let harness = Harness::new(vec![descriptor("a", 1), descriptor("b", 2), descriptor("c", 3)]);
        harness
            .world
            .fail_fetch("b", FetchError::Network("reset".into()));
        let first = harness.run(&harness.options()).await.unwrap();
        assert_eq!(first.failed.len(), 1);

        fs::remove_file(harness.frame("c")).unwrap();
        let fresh = FakeWorld::with_videos(vec![descriptor("a", 1), descriptor("b", 2), descriptor("c", 3)]);
        let pipeline = Pipeline::new(harness.store.clone(), fresh.collaborators())
            .with_retry_policy(fast_retry());
        let resumed = RunOptions {
            resume: true,
            ..harness.options()
        };
        let summary = pipeline
            .run(CHANNEL, &resumed, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(fresh.fetch_calls("a"), 0);
        assert_eq!(fresh.fetch_calls("b"), 1);
        assert_eq!(fresh.fetch_calls("c"), 1);
        assert_eq!(summary.reused, 1);
        assert_eq!(summary.succeeded, 2);
        assert!(summary.failed.is_empty());
    }

    #[tokio::test]
    async fn corrupt_record_is_discarded_on_resume() {
        let harness = Harness::new(vec![descriptor("a", 1), descriptor("b", 2)]);
        harness.run(&harness.options()).await.unwrap();
        let record = harness.store.channel_dir(CHANNEL).join("entries/b.json");
        fs::write(&record, b"{\"video_id\": \"b\", \"stat").unwrap();

        let resumed = RunOptions {
            resume: true,
            ..harness.options()
        };
        let summary = harness.run(&resumed).await.unwrap();

        assert_eq!(summary.reused, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(harness.world.fetch_calls("a"), 1);
        assert_eq!(harness.world.fetch_calls("b"), 2);
        assert_eq!(
            harness.store.get(CHANNEL, "b").unwrap().unwrap().status,
            EntryStatus::FrameExtracted
        );
        assert_eq!(summary.frames, vec![harness.frame("a"), harness.frame("b")]);
    }

    struct CancelAfterFirst(CancellationToken);

    impl RunObserver for CancelAfterFirst {
        fn video_finished(&self, _result: &VideoTaskResult) {
            self.0.cancel();
        }
    }

    #[tokio::test]
    async fn interrupted_run_resumes_with_the_remainder() {
        let ids = ["a", "b", "c", "d"];
        let videos: Vec<_> = ids
            .iter()
            .zip(1..)
            .map(|(id, ts)| descriptor(id, ts))
            .collect();
        let harness = Harness::new(videos);
        let cancel = CancellationToken::new();
        let options = RunOptions {
            max_workers: Some(1),
            ..harness.options()
        };

        let err = harness
            .pipeline()
            .with_observer(Arc::new(CancelAfterFirst(cancel.clone())))
            .run(CHANNEL, &options, &cancel)
            .await
            .unwrap_err();

        let first = match err {
            RunError::Cancelled { summary } => summary,
            other => panic!("expected cancellation, got {other:?}"),
        };
        assert!(first.succeeded >= 1);
        assert_eq!(first.succeeded + first.cancelled, ids.len());
        assert!(harness.world.encode_calls().is_empty());

        let mut finished = Vec::new();
        for id in ids {
            let entry = harness.store.get(CHANNEL, id).unwrap().unwrap();
            match entry.status {
                EntryStatus::FrameExtracted => finished.push(id),
                EntryStatus::Pending | EntryStatus::Downloaded => {}
                other => panic!("{id} left in {other:?}"),
            }
        }
        assert_eq!(finished.len(), first.succeeded);

        let resumed = RunOptions {
            resume: true,
            ..options
        };
        let summary = harness.run(&resumed).await.unwrap();

        assert_eq!(summary.reused, finished.len());
        assert_eq!(summary.succeeded, ids.len() - finished.len());
        for id in &finished {
            assert_eq!(harness.world.fetch_calls(id), 1);
        }
        let expected: Vec<_> = ids.iter().map(|id| harness.frame(id)).collect();
        assert_eq!(summary.frames, expected);
    }

    #[tokio::test]
    async fn panicking_task_is_recorded_as_failed() {
        let harness = Harness::new(vec![descriptor("a", 1), descriptor("b", 2), descriptor("c", 3)]);
        harness.world.panic_fetch("b");

        let summary = harness.run(&harness.options()).await.unwrap();

        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].video_id, "b");
        assert_eq!(summary.failed[0].reason, "worker panicked");
        assert_eq!(
            summary.succeeded + summary.failed.len() + summary.skipped.len(),
            summary.total_videos
        );
        assert_eq!(
            harness.store.get(CHANNEL, "b").unwrap().unwrap().status,
            EntryStatus::Failed
        );
        assert_eq!(summary.frames, vec![harness.frame("a"), harness.frame("c")]);
    }

    #[tokio::test]
    async fn fresh_run_clears_previous_progress() {
        let harness = Harness::new(vec![descriptor("a", 1)]);
        harness.run(&harness.options()).await.unwrap();
        harness.run(&harness.options()).await.unwrap();
        assert_eq!(harness.world.fetch_calls("a"), 2);
    }

    #[tokio::test]
    async fn shorts_and_live_never_reach_the_cache() {
        let mut short = descriptor("short", 1);
        short.is_short = true;
        let mut live = descriptor("live", 2);
        live.is_live = true;
        let mut private = descriptor("private", 3);
        private.is_available = false;
        let harness = Harness::new(vec![short, live, private, descriptor("ok", 4)]);

        harness.run(&harness.options()).await.unwrap();

        let ids: Vec<_> = harness
            .store
            .list_all(CHANNEL)
            .unwrap()
            .into_iter()
            .map(|entry| entry.video_id)
            .collect();
        assert_eq!(ids, vec!["ok"]);
        assert_eq!(harness.world.total_fetch_calls(), 1);
    }

    #[tokio::test]
    async fn unavailable_video_is_skipped_and_run_succeeds() {
        let harness = Harness::new(vec![descriptor("a", 1), descriptor("gone", 2), descriptor("c", 3)]);
        harness
            .world
            .fail_fetch("gone", FetchError::Unavailable("This video is unavailable".into()));

        let summary = harness.run(&harness.options()).await.unwrap();

        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.skipped.len(), 1);
        assert_eq!(summary.skipped[0].video_id, "gone");
        assert_eq!(harness.world.fetch_calls("gone"), 1);
        assert_eq!(summary.frames, vec![harness.frame("a"), harness.frame("c")]);

        let resumed = RunOptions {
            resume: true,
            ..harness.options()
        };
        let again = harness.run(&resumed).await.unwrap();
        assert_eq!(harness.world.fetch_calls("gone"), 1);
        assert_eq!(again.skipped.len(), 1);
    }

    #[tokio::test]
    async fn limit_takes_the_earliest_videos() {
        let harness = Harness::new(vec![
            descriptor("e", 5),
            descriptor("b", 2),
            descriptor("d", 4),
            descriptor("a", 1),
            descriptor("c", 3),
        ]);
        let options = RunOptions {
            limit: Some(2),
            ..harness.options()
        };

        let summary = harness.run(&options).await.unwrap();

        assert_eq!(summary.total_videos, 2);
        assert_eq!(summary.frames, vec![harness.frame("a"), harness.frame("b")]);
        assert_eq!(harness.world.total_fetch_calls(), 2);
    }

    #[tokio::test]
    async fn worker_bound_is_respected() {
        let videos: Vec<_> = (0..10).map(|i| descriptor(&format!("w{i}"), i)).collect();
        let harness = Harness::new(videos.clone());
        for video in &videos {
            harness.world.delay_fetch(&video.id, Duration::from_millis(10));
        }
        let options = RunOptions {
            max_workers: Some(2),
            ..harness.options()
        };

        harness.run(&options).await.unwrap();
        assert!(harness.world.max_in_flight() <= 2);
    }

    #[tokio::test]
    async fn discovery_failure_without_cached_listing_is_fatal() {
        let harness = Harness::new(Vec::new());
        harness.world.set_listing(Err(DiscoveryError::ChannelNotFound {
            channel: CHANNEL.into(),
            reason: "404".into(),
        }));

        let err = harness.run(&harness.options()).await.unwrap_err();
        assert!(matches!(err, RunError::Discovery(DiscoveryError::ChannelNotFound { .. })));
        assert!(err.summary().is_none());
    }

    #[tokio::test]
    async fn discovery_failure_falls_back_to_cached_listing() {
        let harness = Harness::new(vec![descriptor("a", 1)]);
        harness.run(&harness.options()).await.unwrap();
        harness.world.set_listing(Err(DiscoveryError::ProviderUnavailable {
            channel: CHANNEL.into(),
            reason: "offline".into(),
        }));

        let summary = harness.run(&harness.options()).await.unwrap();
        assert_eq!(summary.frames, vec![harness.frame("a")]);
    }

    #[tokio::test]
    async fn channel_without_eligible_videos_is_a_discovery_error() {
        let mut short = descriptor("s", 1);
        short.is_short = true;
        let harness = Harness::new(vec![short]);

        let err = harness.run(&harness.options()).await.unwrap_err();
        assert!(matches!(err, RunError::Discovery(DiscoveryError::NoEligibleVideos { .. })));
    }

    #[tokio::test]
    async fn encode_failure_still_reports_summary() {
        let harness = Harness::new(vec![descriptor("a", 1)]);
        harness.world.fail_encode("disk full");

        let err = harness.run(&harness.options()).await.unwrap_err();
        let summary = err.summary().unwrap();
        assert_eq!(summary.succeeded, 1);
        assert!(summary.output.is_none());
        assert!(matches!(err, RunError::Encode { .. }));
    }

    #[tokio::test]
    async fn no_usable_frames_skips_the_encoder() {
        let harness = Harness::new(vec![descriptor("a", 1)]);
        harness
            .world
            .fail_fetch("a", FetchError::Unavailable("removed".into()));

        let err = harness.run(&harness.options()).await.unwrap_err();
        assert!(matches!(err, RunError::Encode { source: EncodeError::NoFrames, .. }));
        assert!(harness.world.encode_calls().is_empty());
    }

    #[tokio::test]
    async fn cancelled_run_does_not_encode() {
        let harness = Harness::new(vec![descriptor("a", 1), descriptor("b", 2)]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = harness
            .pipeline()
            .run(CHANNEL, &harness.options(), &cancel)
            .await
            .unwrap_err();

        let summary = err.summary().unwrap();
        assert_eq!(summary.cancelled, 2);
        assert!(matches!(err, RunError::Cancelled { .. }));
        assert!(harness.world.encode_calls().is_empty());
        assert_eq!(harness.world.total_fetch_calls(), 0);
    }

    #[tokio::test]
    async fn revalidate_drops_entries_of_vanished_videos() {
        let harness = Harness::new(vec![descriptor("a", 1), descriptor("b", 2)]);
        harness.run(&harness.options()).await.unwrap();
        harness.world.set_listing(Ok(vec![descriptor("a", 1)]));

        let options = RunOptions {
            resume: true,
            revalidate: true,
            ..harness.options()
        };
        harness.run(&options).await.unwrap();

        assert!(harness.store.get(CHANNEL, "b").unwrap().is_none());
        assert!(!harness.frame("b").exists());
        assert!(harness.store.get(CHANNEL, "a").unwrap().is_some());
    }

    #[tokio::test]
    async fn keep_temp_reports_the_scratch_location() {
        let harness = Harness::new(vec![descriptor("a", 1)]);
        let options = RunOptions {
            keep_temp: true,
            ..harness.options()
        };

        let summary = harness.run(&options).await.unwrap();

        let temp = summary.temp_location.unwrap();
        assert!(temp.starts_with(harness.out.path()));
        assert!(temp.join("a").is_dir());
    }
}
