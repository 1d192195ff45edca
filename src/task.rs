#![forbid(unsafe_code)]

//! One video's pipeline: clipped download, frame grab, cache update, cleanup.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheStore, Transition, file_stem};
use crate::collaborators::{AuthTokens, ClipRequest, Collaborators};
use crate::error::{FetchError, SampleError};
use crate::model::VideoDescriptor;
use crate::retry::{RetryError, RetryPolicy, with_retry};

/// Seconds downloaded on either side of the target frame.
pub const CLIP_HALF_WINDOW: f64 = 1.5;
pub const MIN_CLIP_SPAN: f64 = 0.75;
/// Distance kept from the very end of a video, where no frame may exist.
const END_MARGIN: f64 = 0.1;

/// Shared, read-only inputs of every task in a run.
#[derive(Clone)]
pub struct TaskContext {
    pub channel: String,
    pub position_percent: f64,
    pub max_height: u32,
    pub auth: Option<AuthTokens>,
    /// Parent of the per-task scratch directories.
    pub temp_root: PathBuf,
    pub keep_temp: bool,
    pub store: Arc<CacheStore>,
    pub collaborators: Collaborators,
    pub retry: RetryPolicy,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Extracted(PathBuf),
    Skipped(String),
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoTaskResult {
    pub video_id: String,
    pub title: String,
    pub upload_timestamp: Option<DateTime<Utc>>,
    pub outcome: TaskOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipWindow {
    pub start: f64,
    pub end: f64,
}

/// Where in the video the frame is taken. Unknown or non-positive durations
/// sample the very beginning.
pub fn target_timestamp(duration: Option<f64>, position_percent: f64) -> f64 {
    let Some(duration) = duration.filter(|d| d.is_finite() && *d > 0.0) else {
        return 0.0;
    };
    let percent = position_percent.clamp(0.0, 100.0);
    let upper = (duration - END_MARGIN).max(0.0);
    (duration * percent / 100.0).clamp(0.0, upper)
}

/// The slice of the video that gets downloaded around `target`.
pub fn clip_window(target: f64, duration: Option<f64>) -> ClipWindow {
    let start = (target - CLIP_HALF_WINDOW).max(0.0);
    let mut end = target + CLIP_HALF_WINDOW;
    if let Some(duration) = duration.filter(|d| d.is_finite() && *d > 0.0) {
        end = end.min(duration);
    }
    if end - start < MIN_CLIP_SPAN {
        end = start + MIN_CLIP_SPAN;
    }
    ClipWindow { start, end }
}

/// Scratch directory of a single task, removed on drop unless kept.
struct TaskTempDir {
    path: PathBuf,
    keep: bool,
}

impl TaskTempDir {
    fn create(root: &Path, video_id: &str, keep: bool) -> std::io::Result<Self> {
        let path = root.join(file_stem(video_id));
        fs::create_dir_all(&path)?;
        Ok(Self { path, keep })
    }
}

impl Drop for TaskTempDir {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Err(err) = fs::remove_dir_all(&self.path)
            && err.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %err, "failed to remove task directory");
        }
    }
}

/// Runs the full pipeline for `video`. Task-level failures are reported in
/// the outcome and recorded in the cache; they never escape as errors.
pub async fn process(video: &VideoDescriptor, ctx: &TaskContext) -> VideoTaskResult {
    let outcome = run_steps(video, ctx).await;
    match &outcome {
        TaskOutcome::Extracted(path) => {
            debug!(video = %video.id, frame = %path.display(), "frame extracted")
        }
        TaskOutcome::Skipped(reason) => info!(video = %video.id, reason = %reason, "video skipped"),
        TaskOutcome::Failed(reason) => warn!(video = %video.id, reason = %reason, "video failed"),
        TaskOutcome::Cancelled => debug!(video = %video.id, "task cancelled"),
    }
    VideoTaskResult {
        video_id: video.id.clone(),
        title: video.title.clone(),
        upload_timestamp: video.upload_timestamp,
        outcome,
    }
}

async fn run_steps(video: &VideoDescriptor, ctx: &TaskContext) -> TaskOutcome {
    if ctx.cancel.is_cancelled() {
        return TaskOutcome::Cancelled;
    }
    if let Err(err) = ctx.store.update(&ctx.channel, &video.id, Transition::AttemptStarted) {
        return TaskOutcome::Failed(format!("cache update failed: {err}"));
    }

    let temp = match TaskTempDir::create(&ctx.temp_root, &video.id, ctx.keep_temp) {
        Ok(temp) => temp,
        Err(err) => return record(ctx, video, TaskOutcome::Failed(format!("temp dir: {err}"))),
    };

    let target = target_timestamp(video.duration_seconds, ctx.position_percent);
    let window = clip_window(target, video.duration_seconds);

    let clip = match fetch_clip(video, ctx, &temp.path, window).await {
        Ok(clip) => clip,
        Err(outcome) => return record(ctx, video, outcome),
    };
    if let Err(err) = ctx.store.update(&ctx.channel, &video.id, Transition::Downloaded) {
        return TaskOutcome::Failed(format!("cache update failed: {err}"));
    }
    if ctx.cancel.is_cancelled() {
        return TaskOutcome::Cancelled;
    }

    let destination = ctx.store.frame_path(&ctx.channel, &video.id);
    let offset = (target - window.start).max(0.0);
    let outcome = match sample_frame(ctx, &video.id, &clip, offset, &destination).await {
        Ok(frame) => TaskOutcome::Extracted(frame),
        Err(outcome) => outcome,
    };
    drop(temp);
    record(ctx, video, outcome)
}

async fn fetch_clip(
    video: &VideoDescriptor,
    ctx: &TaskContext,
    destination_dir: &Path,
    window: ClipWindow,
) -> Result<PathBuf, TaskOutcome> {
    let label = format!("download {}", video.id);
    let result = with_retry(&ctx.retry, &ctx.cancel, &label, |_| {
        ctx.collaborators.fetcher.download_clip(ClipRequest {
            video_id: &video.id,
            max_height: ctx.max_height,
            start_seconds: window.start,
            end_seconds: window.end,
            destination_dir,
            auth: ctx.auth.as_ref(),
        })
    })
    .await;

    result.map_err(|err| match err {
        RetryError::Cancelled => TaskOutcome::Cancelled,
        RetryError::Permanent {
            error: FetchError::Unavailable(reason),
            ..
        } => TaskOutcome::Skipped(reason),
        RetryError::Permanent {
            error: FetchError::Unauthorized(reason),
            ..
        } if ctx.auth.is_none() => TaskOutcome::Skipped(format!("requires authentication: {reason}")),
        other => TaskOutcome::Failed(other.to_string()),
    })
}

async fn sample_frame(
    ctx: &TaskContext,
    video_id: &str,
    clip: &Path,
    offset: f64,
    destination: &Path,
) -> Result<PathBuf, TaskOutcome> {
    let sample_at = |timestamp: f64| {
        let label = format!("sample {video_id}@{timestamp:.3}");
        async move {
            with_retry(&ctx.retry, &ctx.cancel, &label, |_| {
                ctx.collaborators
                    .sampler
                    .extract_frame(clip, timestamp, destination)
            })
            .await
        }
    };

    let first = match sample_at(offset).await {
        Err(RetryError::Permanent {
            error: SampleError::SeekOutOfRange { timestamp, .. },
            ..
        }) if offset > 0.0 => {
            debug!(video = video_id, timestamp, "seek past clip end, using clip start");
            sample_at(0.0).await
        }
        other => other,
    };
    first.map_err(|err| match err {
        RetryError::Cancelled => TaskOutcome::Cancelled,
        other => TaskOutcome::Failed(other.to_string()),
    })
}

/// Persists a terminal outcome. Cancelled tasks leave the entry as it was so
/// the next resume picks them up again.
fn record(ctx: &TaskContext, video: &VideoDescriptor, outcome: TaskOutcome) -> TaskOutcome {
    let transition = match &outcome {
        TaskOutcome::Extracted(path) => Transition::FrameExtracted(path.clone()),
        TaskOutcome::Skipped(reason) => Transition::Skipped(reason.clone()),
        TaskOutcome::Failed(reason) => Transition::Failed(reason.clone()),
        TaskOutcome::Cancelled => return outcome,
    };
    match ctx.store.update(&ctx.channel, &video.id, transition) {
        Ok(_) => outcome,
        Err(err) => TaskOutcome::Failed(format!("cache update failed: {err}")),
    }
}
