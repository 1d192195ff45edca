#![forbid(unsafe_code)]

//! Durable per-video progress, one JSON record per video.
//!
//! Layout under the cache root:
//!
//! ```text
//! <root>/<channel key>/channel.json        last descriptor listing
//! <root>/<channel key>/entries/<id>.json   one CacheEntry per video
//! <root>/<channel key>/frames/<id>.png     extracted frames
//! ```
//!
//! Records are replaced through a temp file + rename, so readers never see a
//! half-written entry. Writers take a lock scoped to the (channel, video)
//! pair; writes to different videos never contend.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::CacheError;
use crate::model::VideoDescriptor;

const ENTRIES_SUBDIR: &str = "entries";
const FRAMES_SUBDIR: &str = "frames";
const LISTING_FILE: &str = "channel.json";
const LISTING_VERSION: u32 = 1;
const FRAME_EXTENSION: &str = "png";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Downloaded,
    FrameExtracted,
    Failed,
    Skipped,
}

impl EntryStatus {
    /// Work for this video is finished and must not be redone on resume.
    pub fn is_settled(self) -> bool {
        matches!(self, EntryStatus::FrameExtracted | EntryStatus::Skipped)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub video_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_timestamp: Option<DateTime<Utc>>,
    pub status: EntryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_time: Option<DateTime<Utc>>,
}

impl CacheEntry {
    pub fn pending(video: &VideoDescriptor) -> Self {
        Self {
            video_id: video.id.clone(),
            title: video.title.clone(),
            upload_timestamp: video.upload_timestamp,
            status: EntryStatus::Pending,
            frame_path: None,
            failure_reason: None,
            skip_reason: None,
            attempts: 0,
            last_attempt_time: None,
        }
    }

    /// Applies a lifecycle step. Nothing moves an entry out of
    /// `FrameExtracted` except a fresher frame.
    fn apply(&mut self, transition: Transition) -> Result<(), CacheError> {
        if self.status == EntryStatus::FrameExtracted
            && !matches!(transition, Transition::FrameExtracted(_))
        {
            return Err(CacheError::Regression {
                video_id: self.video_id.clone(),
            });
        }

        match transition {
            Transition::AttemptStarted => {
                self.status = EntryStatus::Pending;
                self.attempts = self.attempts.saturating_add(1);
                self.last_attempt_time = Some(Utc::now());
                self.failure_reason = None;
                self.skip_reason = None;
            }
            Transition::Downloaded => {
                self.status = EntryStatus::Downloaded;
            }
            Transition::FrameExtracted(path) => {
                self.status = EntryStatus::FrameExtracted;
                self.frame_path = Some(path);
                self.failure_reason = None;
                self.skip_reason = None;
            }
            Transition::Failed(reason) => {
                self.status = EntryStatus::Failed;
                self.failure_reason = Some(reason);
                self.skip_reason = None;
                self.frame_path = None;
            }
            Transition::Skipped(reason) => {
                self.status = EntryStatus::Skipped;
                self.skip_reason = Some(reason);
                self.failure_reason = None;
                self.frame_path = None;
            }
        }
        Ok(())
    }
}

/// Lifecycle steps a task reports while it works on a video.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    AttemptStarted,
    Downloaded,
    FrameExtracted(PathBuf),
    Failed(String),
    Skipped(String),
}

/// On-disk copy of the last successful channel listing.
#[derive(Debug, Serialize, Deserialize)]
struct ChannelListing {
    version: u32,
    channel: String,
    generated_at: DateTime<Utc>,
    videos: Vec<VideoDescriptor>,
}

pub struct CacheStore {
    root: PathBuf,
    locks: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Directory holding everything cached for `channel`.
    pub fn channel_dir(&self, channel: &str) -> PathBuf {
        self.root.join(channel_key(channel))
    }

    /// Where the frame for `video_id` lives once extracted.
    pub fn frame_path(&self, channel: &str, video_id: &str) -> PathBuf {
        self.channel_dir(channel)
            .join(FRAMES_SUBDIR)
            .join(format!("{}.{FRAME_EXTENSION}", file_stem(video_id)))
    }

    /// Creates the entry and frame directories for `channel`.
    pub fn prepare(&self, channel: &str) -> Result<(), CacheError> {
        let dir = self.channel_dir(channel);
        for sub in [ENTRIES_SUBDIR, FRAMES_SUBDIR] {
            let path = dir.join(sub);
            fs::create_dir_all(&path).map_err(|err| CacheError::io(&path, err))?;
        }
        Ok(())
    }

    pub fn get(&self, channel: &str, video_id: &str) -> Result<Option<CacheEntry>, CacheError> {
        read_entry(&self.entry_path(channel, video_id))
    }

    /// Stores `entry` as-is, refusing to overwrite a FrameExtracted record
    /// with anything else.
    pub fn put(&self, channel: &str, entry: &CacheEntry) -> Result<(), CacheError> {
        let lock = self.key_lock(channel, &entry.video_id);
        let _guard = lock.lock();
        let path = self.entry_path(channel, &entry.video_id);
        if let Some(existing) = read_entry(&path)?
            && existing.status == EntryStatus::FrameExtracted
            && entry.status != EntryStatus::FrameExtracted
        {
            return Err(CacheError::Regression {
                video_id: entry.video_id.clone(),
            });
        }
        write_json_atomic(&path, entry)
    }

    /// Applies `transition` to the stored entry under the key lock and
    /// returns the updated record.
    pub fn update(
        &self,
        channel: &str,
        video_id: &str,
        transition: Transition,
    ) -> Result<CacheEntry, CacheError> {
        let lock = self.key_lock(channel, video_id);
        let _guard = lock.lock();
        let path = self.entry_path(channel, video_id);
        let mut entry = read_entry(&path)?.unwrap_or_else(|| CacheEntry {
            video_id: video_id.to_string(),
            title: String::new(),
            upload_timestamp: None,
            status: EntryStatus::Pending,
            frame_path: None,
            failure_reason: None,
            skip_reason: None,
            attempts: 0,
            last_attempt_time: None,
        });
        entry.apply(transition)?;
        write_json_atomic(&path, &entry)?;
        Ok(entry)
    }

    /// All readable entries for `channel`. Unreadable records are logged and
    /// left out so the affected videos simply get processed again.
    pub fn list_all(&self, channel: &str) -> Result<Vec<CacheEntry>, CacheError> {
        let dir = self.channel_dir(channel).join(ENTRIES_SUBDIR);
        let read_dir = match fs::read_dir(&dir) {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(CacheError::io(&dir, err)),
        };

        let mut entries = Vec::new();
        for item in read_dir.flatten() {
            let path = item.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match read_entry(&path) {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => {}
                Err(err) => warn!(path = %path.display(), error = %err, "ignoring cache record"),
            }
        }
        entries.sort_by(|a, b| a.video_id.cmp(&b.video_id));
        Ok(entries)
    }

    /// Drops the record and frame of a single video.
    pub fn remove(&self, channel: &str, video_id: &str) -> Result<(), CacheError> {
        let lock = self.key_lock(channel, video_id);
        let _guard = lock.lock();
        remove_if_exists(&self.entry_path(channel, video_id))?;
        remove_if_exists(&self.frame_path(channel, video_id))
    }

    /// Forgets every entry and frame recorded for `channel`. The descriptor
    /// listing is kept.
    pub fn clear(&self, channel: &str) -> Result<(), CacheError> {
        let dir = self.channel_dir(channel);
        for sub in [ENTRIES_SUBDIR, FRAMES_SUBDIR] {
            let path = dir.join(sub);
            match fs::remove_dir_all(&path) {
                Ok(()) => debug!(path = %path.display(), "cleared cache directory"),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(CacheError::io(&path, err)),
            }
        }
        Ok(())
    }

    pub fn save_listing(&self, channel: &str, videos: &[VideoDescriptor]) -> Result<(), CacheError> {
        let listing = ChannelListing {
            version: LISTING_VERSION,
            channel: channel.to_string(),
            generated_at: Utc::now(),
            videos: videos.to_vec(),
        };
        write_json_atomic(&self.channel_dir(channel).join(LISTING_FILE), &listing)
    }

    /// Last saved listing, if present and written by a compatible version.
    pub fn load_listing(&self, channel: &str) -> Option<Vec<VideoDescriptor>> {
        let path = self.channel_dir(channel).join(LISTING_FILE);
        let raw = fs::read_to_string(&path).ok()?;
        match serde_json::from_str::<ChannelListing>(&raw) {
            Ok(listing) if listing.version == LISTING_VERSION => Some(listing.videos),
            Ok(listing) => {
                debug!(version = listing.version, "ignoring listing from another version");
                None
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "ignoring unreadable listing");
                None
            }
        }
    }

    fn entry_path(&self, channel: &str, video_id: &str) -> PathBuf {
        self.channel_dir(channel)
            .join(ENTRIES_SUBDIR)
            .join(format!("{}.json", file_stem(video_id)))
    }

    fn key_lock(&self, channel: &str, video_id: &str) -> Arc<Mutex<()>> {
        let key = (channel_key(channel), video_id.to_string());
        self.locks.lock().entry(key).or_default().clone()
    }
}

/// Short, filesystem-safe directory name for a channel URL.
pub fn channel_key(channel: &str) -> String {
    blake3::hash(channel.trim().as_bytes()).to_hex()[..16].to_string()
}

/// Video ids become file names, so anything outside `[A-Za-z0-9_-]` is
/// replaced.
pub(crate) fn file_stem(video_id: &str) -> String {
    video_id
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

fn read_entry(path: &Path) -> Result<Option<CacheEntry>, CacheError> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(CacheError::io(path, err)),
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|source| CacheError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), CacheError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| CacheError::io(parent, err))?;
    }
    let payload = serde_json::to_vec_pretty(value).map_err(|source| CacheError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, payload).map_err(|err| CacheError::io(&tmp_path, err))?;
    fs::rename(&tmp_path, path).map_err(|err| CacheError::io(path, err))?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<(), CacheError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(CacheError::io(path, err)),
    }
}
