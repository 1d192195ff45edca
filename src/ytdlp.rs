#![forbid(unsafe_code)]

//! yt-dlp backed metadata provider and clip fetcher.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::cache::file_stem;
use crate::collaborators::{AuthTokens, ClipRequest, MediaFetcher, MetadataProvider};
use crate::error::{DiscoveryError, FetchError};
use crate::model::{VideoDescriptor, watch_url};

const SHORTS_SEGMENT: &str = "/shorts/";
/// Uploads shorter than this are treated as Shorts even outside `/shorts/`.
const MIN_FULL_LENGTH_SECONDS: f64 = 60.0;
const LIVE_STATES: [&str; 3] = ["is_live", "is_upcoming", "post_live"];
const RESTRICTED_AVAILABILITY: [&str; 4] =
    ["private", "needs_auth", "subscriber_only", "premium_only"];
const PLACEHOLDER_TITLES: [&str; 2] = ["[Private video]", "[Deleted video]"];

/// Sleep and bandwidth flags passed to every yt-dlp call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPacing {
    pub sleep_requests: u32,
    pub sleep_interval: u32,
    pub max_sleep_interval: u32,
    pub rate_limit: String,
}

impl Default for RequestPacing {
    fn default() -> Self {
        Self {
            sleep_requests: 5,
            sleep_interval: 8,
            max_sleep_interval: 20,
            rate_limit: "3M".to_string(),
        }
    }
}

impl RequestPacing {
    /// No sleeping at all; for tests and local mirrors.
    pub fn none() -> Self {
        Self {
            sleep_requests: 0,
            sleep_interval: 0,
            max_sleep_interval: 0,
            rate_limit: String::new(),
        }
    }

    fn push_args(&self, args: &mut Vec<OsString>) {
        if self.sleep_requests > 0 {
            args.push("--sleep-requests".into());
            args.push(self.sleep_requests.to_string().into());
        }
        if self.sleep_interval > 0 {
            args.push("--sleep-interval".into());
            args.push(self.sleep_interval.to_string().into());
            args.push("--max-sleep-interval".into());
            args.push(self.max_sleep_interval.max(self.sleep_interval).to_string().into());
        }
        if !self.rate_limit.is_empty() {
            args.push("--limit-rate".into());
            args.push(self.rate_limit.clone().into());
        }
    }
}

#[derive(Debug, Clone)]
pub struct YtDlp {
    program: PathBuf,
    /// Credentials used for channel listings; downloads take theirs from the
    /// request.
    listing_auth: Option<AuthTokens>,
    pacing: RequestPacing,
}

impl YtDlp {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            listing_auth: None,
            pacing: RequestPacing::default(),
        }
    }

    pub fn with_listing_auth(mut self, auth: Option<AuthTokens>) -> Self {
        self.listing_auth = auth;
        self
    }

    pub fn with_pacing(mut self, pacing: RequestPacing) -> Self {
        self.pacing = pacing;
        self
    }

    async fn run(&self, args: &[OsString]) -> std::io::Result<Output> {
        Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
    }

    /// Runs `build_args`, repeating once without credentials when the
    /// browser cookie store could not be read.
    async fn run_with_cookie_fallback(
        &self,
        auth: Option<&AuthTokens>,
        build_args: impl Fn(Option<&AuthTokens>) -> Vec<OsString>,
    ) -> std::io::Result<Output> {
        let output = self.run(&build_args(auth)).await?;
        if !output.status.success()
            && matches!(auth, Some(AuthTokens::Browser(_)))
            && is_cookie_failure(&String::from_utf8_lossy(&output.stderr))
        {
            warn!("browser cookie extraction failed, retrying without cookies");
            return self.run(&build_args(None)).await;
        }
        Ok(output)
    }
}

#[async_trait]
impl MetadataProvider for YtDlp {
    async fn list_channel_videos(
        &self,
        channel: &str,
    ) -> Result<Vec<VideoDescriptor>, DiscoveryError> {
        let list_url = build_channel_list_url(channel);
        debug!(url = %list_url, "listing channel uploads");

        let output = self
            .run_with_cookie_fallback(self.listing_auth.as_ref(), |auth| {
                listing_args(&list_url, auth, &self.pacing)
            })
            .await
            .map_err(|err| DiscoveryError::ProviderUnavailable {
                channel: channel.to_string(),
                reason: format!("failed to start {}: {err}", self.program.display()),
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() && output.stdout.is_empty() {
            return Err(classify_listing_error(channel, &stderr));
        }

        let payload: PlaylistEntry = serde_json::from_slice(&output.stdout).map_err(|err| {
            DiscoveryError::ProviderUnavailable {
                channel: channel.to_string(),
                reason: format!("unreadable listing: {err}"),
            }
        })?;
        let videos = descriptors_from_listing(payload);
        debug!(count = videos.len(), "channel listing parsed");
        Ok(videos)
    }
}

#[async_trait]
impl MediaFetcher for YtDlp {
    async fn download_clip(&self, request: ClipRequest<'_>) -> Result<PathBuf, FetchError> {
        let output = self
            .run_with_cookie_fallback(request.auth, |auth| {
                clip_args(&request, auth, &self.pacing)
            })
            .await
            .map_err(|err| {
                FetchError::Network(format!("failed to start {}: {err}", self.program.display()))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_fetch_error(&stderr));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        reported_media_path(&stdout)
            .or_else(|| newest_media_file(request.destination_dir))
            .ok_or_else(|| {
                FetchError::Network(format!(
                    "yt-dlp finished but no media file for {} was found",
                    request.video_id
                ))
            })
    }
}

/// Normalizes a channel URL so `/videos` is not appended twice.
pub fn build_channel_list_url(channel_url: &str) -> String {
    let channel_url = channel_url.trim();
    let (without_fragment, fragment) = match channel_url.split_once('#') {
        Some((base, fragment)) => (base, Some(fragment)),
        None => (channel_url, None),
    };
    let (base, query) = match without_fragment.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (without_fragment, None),
    };

    let base = base.trim_end_matches('/');
    let mut result = if base.ends_with("/videos") {
        base.to_string()
    } else {
        format!("{base}/videos")
    };

    if let Some(query) = query {
        result.push('?');
        result.push_str(query);
    }
    if let Some(fragment) = fragment {
        result.push('#');
        result.push_str(fragment);
    }

    result
}

fn push_auth(args: &mut Vec<OsString>, auth: Option<&AuthTokens>) {
    match auth {
        Some(AuthTokens::Browser(browser)) => {
            args.push("--cookies-from-browser".into());
            args.push(browser.into());
        }
        Some(AuthTokens::CookieFile(path)) => {
            args.push("--cookies".into());
            args.push(path.into());
        }
        None => {}
    }
}

fn listing_args(list_url: &str, auth: Option<&AuthTokens>, pacing: &RequestPacing) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "--flat-playlist".into(),
        "--dump-single-json".into(),
        "--ignore-errors".into(),
        "--no-warnings".into(),
    ];
    if pacing.sleep_requests > 0 {
        args.push("--sleep-requests".into());
        args.push(pacing.sleep_requests.to_string().into());
    }
    push_auth(&mut args, auth);
    args.push(list_url.into());
    args
}

/// mp4 first so most clips need no remux, any container as a last resort.
pub fn format_selector(max_height: u32) -> String {
    format!(
        "bestvideo[height<={max_height}][ext=mp4]+bestaudio[ext=m4a]/\
         best[height<={max_height}][ext=mp4]/\
         bestvideo[height<={max_height}]+bestaudio/\
         best[height<={max_height}]/best"
    )
}

fn clip_args(
    request: &ClipRequest<'_>,
    auth: Option<&AuthTokens>,
    pacing: &RequestPacing,
) -> Vec<OsString> {
    let template = request
        .destination_dir
        .join(format!("{}.%(ext)s", file_stem(request.video_id)));
    let mut args: Vec<OsString> = vec![
        "--no-playlist".into(),
        "--no-warnings".into(),
        "--no-progress".into(),
        "--format".into(),
        format_selector(request.max_height).into(),
        "--merge-output-format".into(),
        "mp4".into(),
        "--download-sections".into(),
        format!("*{:.3}-{:.3}", request.start_seconds, request.end_seconds).into(),
        "--force-keyframes-at-cuts".into(),
        "--output".into(),
        template.into(),
        "--print".into(),
        "after_move:filepath".into(),
    ];
    pacing.push_args(&mut args);
    push_auth(&mut args, auth);
    args.push(watch_url(request.video_id).into());
    args
}

/// Errors yt-dlp raises while reading a browser's cookie store. Hints such
/// as "use --cookies-from-browser" in a bot check do not count.
const COOKIE_STORE_ERRORS: [&str; 6] = [
    "cookies database",
    "cookie database",
    "failed to decrypt",
    "unsupported browser specified for cookies",
    "secretstorage not available",
    "failed to read cookies",
];

fn is_cookie_failure(stderr: &str) -> bool {
    let lowered = stderr.to_lowercase();
    COOKIE_STORE_ERRORS
        .iter()
        .any(|marker| lowered.contains(marker))
}

fn classify_listing_error(channel: &str, stderr: &str) -> DiscoveryError {
    let lowered = stderr.to_lowercase();
    let reason = last_error_line(stderr);
    if lowered.contains("does not exist")
        || lowered.contains("404")
        || lowered.contains("not found")
        || lowered.contains("unable to recognize channel")
    {
        DiscoveryError::ChannelNotFound {
            channel: channel.to_string(),
            reason,
        }
    } else {
        DiscoveryError::ProviderUnavailable {
            channel: channel.to_string(),
            reason,
        }
    }
}

/// Maps yt-dlp's stderr onto the fetch error taxonomy.
pub fn classify_fetch_error(stderr: &str) -> FetchError {
    let lowered = stderr.to_lowercase();
    let reason = last_error_line(stderr);
    if lowered.contains("confirm your age")
        || lowered.contains("age-restricted")
        || lowered.contains("members-only")
        || lowered.contains("join this channel")
        || lowered.contains("sign in to confirm")
        || lowered.contains("login required")
    {
        FetchError::Unauthorized(reason)
    } else if lowered.contains("private video")
        || lowered.contains("video unavailable")
        || lowered.contains("has been removed")
        || lowered.contains("is not available")
        || lowered.contains("account associated with this video has been terminated")
        || lowered.contains("copyright")
    {
        FetchError::Unavailable(reason)
    } else if lowered.contains("429")
        || lowered.contains("too many requests")
        || lowered.contains("rate-limited")
        || lowered.contains("rate limited")
        || lowered.contains("try again later")
    {
        FetchError::RateLimited(reason)
    } else {
        FetchError::Network(reason)
    }
}

fn last_error_line(stderr: &str) -> String {
    stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .rev()
        .find(|line| line.starts_with("ERROR"))
        .or_else(|| stderr.lines().map(str::trim).rfind(|line| !line.is_empty()))
        .map(|line| line.trim_start_matches("ERROR:").trim().to_string())
        .unwrap_or_else(|| "unknown error".to_string())
}

/// The path printed by `--print after_move:filepath`, if it exists.
fn reported_media_path(stdout: &str) -> Option<PathBuf> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(PathBuf::from)
        .rfind(|path| path.is_file())
}

/// Newest video file under `dir`. Each task downloads into its own
/// directory, so anything found there belongs to the request.
fn newest_media_file(dir: &Path) -> Option<PathBuf> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            mime_guess::from_path(entry.path())
                .first()
                .is_some_and(|mime| mime.type_() == mime_guess::mime::VIDEO)
        })
        .filter_map(|entry| {
            let modified = entry.metadata().ok()?.modified().ok()?;
            Some((modified, entry.into_path()))
        })
        .max_by_key(|(modified, _)| *modified)
        .map(|(_, path)| path)
}

/// One node of `--flat-playlist --dump-single-json` output. Channel pages
/// nest tabs as playlists, so entries may hold further entries.
#[derive(Debug, Deserialize, Default)]
struct PlaylistEntry {
    id: Option<String>,
    title: Option<String>,
    url: Option<String>,
    webpage_url: Option<String>,
    duration: Option<f64>,
    timestamp: Option<i64>,
    release_timestamp: Option<i64>,
    upload_date: Option<String>,
    live_status: Option<String>,
    availability: Option<String>,
    #[serde(default)]
    entries: Option<Vec<Option<PlaylistEntry>>>,
}

fn descriptors_from_listing(root: PlaylistEntry) -> Vec<VideoDescriptor> {
    let mut descriptors = Vec::new();
    let mut stack = vec![root];
    while let Some(mut node) = stack.pop() {
        if let Some(children) = node.entries.take() {
            // Reverse so the stack pops in listing order.
            stack.extend(children.into_iter().flatten().rev());
            continue;
        }
        if let Some(descriptor) = entry_to_descriptor(node) {
            descriptors.push(descriptor);
        }
    }
    descriptors
}

fn entry_to_descriptor(entry: PlaylistEntry) -> Option<VideoDescriptor> {
    let id = entry.id.filter(|id| !id.trim().is_empty())?;
    let url = entry
        .webpage_url
        .as_deref()
        .or(entry.url.as_deref())
        .unwrap_or_default()
        .to_lowercase();
    let duration = entry.duration.filter(|d| d.is_finite() && *d >= 0.0);
    let title = entry
        .title
        .filter(|title| !title.trim().is_empty())
        .unwrap_or_else(|| "Untitled".to_string());

    let is_short = url.contains(SHORTS_SEGMENT)
        || duration.is_some_and(|duration| duration < MIN_FULL_LENGTH_SECONDS);
    let is_live = entry
        .live_status
        .as_deref()
        .is_some_and(|status| LIVE_STATES.contains(&status));
    let is_available = !entry
        .availability
        .as_deref()
        .is_some_and(|availability| RESTRICTED_AVAILABILITY.contains(&availability))
        && !PLACEHOLDER_TITLES.contains(&title.as_str());
    let upload_timestamp = entry
        .timestamp
        .or(entry.release_timestamp)
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .or_else(|| entry.upload_date.as_deref().and_then(parse_upload_date));

    Some(VideoDescriptor {
        id,
        title,
        upload_timestamp,
        duration_seconds: duration,
        is_short,
        is_live,
        is_available,
    })
}

/// yt-dlp's `YYYYMMDD` upload date at midnight UTC.
fn parse_upload_date(value: &str) -> Option<DateTime<Utc>> {
    if value.len() != 8 {
        return None;
    }
    NaiveDate::parse_from_str(value, "%Y%m%d")
        .ok()?
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
}
