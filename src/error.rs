#![forbid(unsafe_code)]

//! Error taxonomy. Only configuration, discovery, cache and final-encode
//! failures end a run; fetch and sample errors stay inside their task.

use std::path::PathBuf;

use thiserror::Error;

use crate::retry::{Classify, ErrorClass};
use crate::summary::RunSummary;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("position must be between 0 and 100 (got {0})")]
    PositionOutOfRange(f64),

    #[error("frame duration must be greater than zero (got {0})")]
    NonPositiveFrameDuration(f64),

    #[error("limit must be greater than zero")]
    ZeroLimit,

    #[error("worker count must be greater than zero")]
    ZeroWorkers,

    #[error("maximum format height must be greater than zero")]
    ZeroFormatHeight,

    #[error("channel URL must not be empty")]
    EmptyChannel,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DiscoveryError {
    #[error("channel {channel} does not exist: {reason}")]
    ChannelNotFound { channel: String, reason: String },

    #[error("metadata provider unavailable for {channel}: {reason}")]
    ProviderUnavailable { channel: String, reason: String },

    #[error("no eligible videos found on {channel}")]
    NoEligibleVideos { channel: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("requires authentication: {0}")]
    Unauthorized(String),

    #[error("video unavailable: {0}")]
    Unavailable(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("network error: {0}")]
    Network(String),
}

impl Classify for FetchError {
    fn class(&self) -> ErrorClass {
        match self {
            FetchError::Unauthorized(_) | FetchError::Unavailable(_) => ErrorClass::Permanent,
            FetchError::RateLimited(_) | FetchError::Network(_) => ErrorClass::Transient,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SampleError {
    #[error("seek to {timestamp:.3}s is past the end of the clip: {reason}")]
    SeekOutOfRange { timestamp: f64, reason: String },

    #[error("could not decode a frame: {0}")]
    Decode(String),

    #[error("frame sampler process failed: {0}")]
    Process(String),
}

impl Classify for SampleError {
    fn class(&self) -> ErrorClass {
        match self {
            SampleError::Process(_) => ErrorClass::Transient,
            SampleError::SeekOutOfRange { .. } | SampleError::Decode(_) => ErrorClass::Permanent,
        }
    }
}

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("no frames available for compilation")]
    NoFrames,

    #[error("frame duration must be greater than zero (got {0})")]
    InvalidDuration(f64),

    #[error("encoder failed: {0}")]
    Failed(String),

    #[error("encoder I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt cache record at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("refusing to move {video_id} out of FrameExtracted")]
    Regression { video_id: String },
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Error, Debug)]
pub enum RunError {
    #[error("invalid configuration: {0}")]
    Configuration(#[from] ConfigError),

    #[error("discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("cache failure: {0}")]
    Cache(#[from] CacheError),

    #[error("failed to compile video: {source}")]
    Encode {
        summary: Box<RunSummary>,
        #[source]
        source: EncodeError,
    },

    #[error("run interrupted before assembly")]
    Cancelled { summary: Box<RunSummary> },
}

impl RunError {
    /// Summary of the work done before the run failed, when discovery got
    /// far enough to produce one.
    pub fn summary(&self) -> Option<&RunSummary> {
        match self {
            RunError::Encode { summary, .. } | RunError::Cancelled { summary } => Some(summary),
            _ => None,
        }
    }
}

pub type Result<T, E = RunError> = std::result::Result<T, E>;
