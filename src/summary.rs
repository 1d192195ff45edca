#![forbid(unsafe_code)]

//! End-of-run report.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Coarse buckets for why a video produced no frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FailureCategory {
    AgeRestricted,
    Unavailable,
    Blocked,
    RateLimited,
    Other,
}

impl FailureCategory {
    pub fn from_reason(reason: &str) -> Self {
        let lowered = reason.to_lowercase();
        if lowered.contains("confirm your age")
            || lowered.contains("age restrict")
            || lowered.contains("age-restrict")
        {
            FailureCategory::AgeRestricted
        } else if lowered.contains("unavailable") || lowered.contains("private") {
            FailureCategory::Unavailable
        } else if lowered.contains("blocked") || lowered.contains("forbidden") {
            FailureCategory::Blocked
        } else if lowered.contains("rate limit") || lowered.contains("too many requests") {
            FailureCategory::RateLimited
        } else {
            FailureCategory::Other
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            FailureCategory::AgeRestricted => "Age-restricted",
            FailureCategory::Unavailable => "Unavailable",
            FailureCategory::Blocked => "Blocked",
            FailureCategory::RateLimited => "Rate-limited",
            FailureCategory::Other => "Other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoIssue {
    pub video_id: String,
    pub title: String,
    pub reason: String,
}

impl VideoIssue {
    pub fn category(&self) -> FailureCategory {
        FailureCategory::from_reason(&self.reason)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub channel: String,
    /// Eligible videos after filtering and the limit.
    pub total_videos: usize,
    /// Frames extracted during this run.
    pub succeeded: usize,
    /// Frames taken from an earlier run.
    pub reused: usize,
    pub skipped: Vec<VideoIssue>,
    pub failed: Vec<VideoIssue>,
    pub cancelled: usize,
    /// Frames handed to the encoder, in chronological order.
    pub frames: Vec<PathBuf>,
    pub output: Option<PathBuf>,
    pub temp_location: Option<PathBuf>,
    pub elapsed: Duration,
}

impl RunSummary {
    /// Skipped and failed videos counted per category, most frequent first.
    pub fn breakdown(&self) -> Vec<(FailureCategory, usize)> {
        let mut counts: BTreeMap<FailureCategory, usize> = BTreeMap::new();
        for issue in self.skipped.iter().chain(&self.failed) {
            *counts.entry(issue.category()).or_default() += 1;
        }
        let mut breakdown: Vec<_> = counts.into_iter().collect();
        breakdown.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        breakdown
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== SUMMARY ===")?;
        writeln!(f, "Channel: {}", self.channel)?;
        writeln!(f, "Total videos: {}", self.total_videos)?;
        writeln!(
            f,
            "Frames extracted: {} (reused from cache: {})",
            self.succeeded, self.reused
        )?;
        writeln!(f, "Skipped: {}", self.skipped.len())?;
        writeln!(f, "Failed: {}", self.failed.len())?;
        if self.cancelled > 0 {
            writeln!(f, "Cancelled: {}", self.cancelled)?;
        }
        for (category, count) in self.breakdown() {
            writeln!(f, "  - {}: {count}", category.label())?;
        }
        for issue in self.skipped.iter().chain(&self.failed) {
            writeln!(f, "    - {} ({}): {}", issue.title, issue.video_id, issue.reason)?;
        }
        if let Some(temp) = &self.temp_location {
            writeln!(f, "Temporary files retained at: {}", temp.display())?;
        }
        match &self.output {
            Some(output) => writeln!(f, "Output file: {}", output.display())?,
            None => writeln!(f, "Output file: (not written)")?,
        }
        write!(f, "Total time: {}", format_duration(self.elapsed))
    }
}

/// `M:SS` below an hour, `H:MM:SS` above, `--:--` for nothing.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs_f64().round() as u64;
    if total == 0 {
        return "--:--".to_string();
    }
    let (hours, rest) = (total / 3600, total % 3600);
    let (minutes, seconds) = (rest / 60, rest % 60);
    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}
