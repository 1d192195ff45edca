#![forbid(unsafe_code)]

//! Seams between the pipeline and the outside world. `ytdlp` and `ffmpeg`
//! provide the production implementations; tests swap in fakes.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{DiscoveryError, EncodeError, FetchError, SampleError};
use crate::model::VideoDescriptor;

/// Credentials handed to the media host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthTokens {
    /// Cookies read from a local browser profile.
    Browser(String),
    /// Netscape-format cookie jar.
    CookieFile(PathBuf),
}

/// Everything the fetcher needs to grab one clipped download.
#[derive(Debug, Clone)]
pub struct ClipRequest<'a> {
    pub video_id: &'a str,
    pub max_height: u32,
    pub start_seconds: f64,
    pub end_seconds: f64,
    pub destination_dir: &'a Path,
    pub auth: Option<&'a AuthTokens>,
}

#[async_trait]
pub trait MetadataProvider: Send + Sync {
    async fn list_channel_videos(
        &self,
        channel: &str,
    ) -> Result<Vec<VideoDescriptor>, DiscoveryError>;
}

#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Downloads the requested window into `destination_dir` and returns the
    /// path of the media file.
    async fn download_clip(&self, request: ClipRequest<'_>) -> Result<PathBuf, FetchError>;
}

#[async_trait]
pub trait FrameSampler: Send + Sync {
    /// Writes the frame at `timestamp_seconds` of `source` to `destination`.
    async fn extract_frame(
        &self,
        source: &Path,
        timestamp_seconds: f64,
        destination: &Path,
    ) -> Result<PathBuf, SampleError>;
}

#[async_trait]
pub trait VideoEncoder: Send + Sync {
    async fn encode(
        &self,
        images: &[PathBuf],
        seconds_per_image: f64,
        output: &Path,
    ) -> Result<(), EncodeError>;
}

/// The four collaborators a run talks to, shared across worker tasks.
#[derive(Clone)]
pub struct Collaborators {
    pub provider: Arc<dyn MetadataProvider>,
    pub fetcher: Arc<dyn MediaFetcher>,
    pub sampler: Arc<dyn FrameSampler>,
    pub encoder: Arc<dyn VideoEncoder>,
}

/// Runs `<program> <version_arg>` so a missing dependency fails the run up
/// front instead of failing every video.
pub async fn ensure_program_available(program: &Path, version_arg: &str) -> Result<()> {
    let status = Command::new(program)
        .arg(version_arg)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;

    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(_) => bail!(
            "{} is installed but returned a failure status",
            program.display()
        ),
        Err(err) => bail!("{} is not installed or not in PATH: {}", program.display(), err),
    }
}
