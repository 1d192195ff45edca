#![forbid(unsafe_code)]

//! Plain data shared by the pipeline stages.

use std::cmp::Ordering;
use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single upload as reported by the metadata provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoDescriptor {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub is_short: bool,
    #[serde(default)]
    pub is_live: bool,
    #[serde(default = "default_true")]
    pub is_available: bool,
}

fn default_true() -> bool {
    true
}

impl VideoDescriptor {
    /// Shorts, live streams and private/removed uploads never get processed.
    pub fn is_eligible(&self) -> bool {
        !self.is_short && !self.is_live && self.is_available
    }
}

pub fn watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={video_id}")
}

/// Chronological order used everywhere a stable video order is needed.
///
/// Known timestamps come first in ascending order, unknown ones last; equal
/// keys fall back to the video id so the result never depends on input order.
pub fn chronological(
    a_time: Option<&DateTime<Utc>>,
    a_id: &str,
    b_time: Option<&DateTime<Utc>>,
    b_id: &str,
) -> Ordering {
    let by_time = match (a_time, b_time) {
        (Some(a), Some(b)) => a.cmp(b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_time.then_with(|| a_id.cmp(b_id))
}

/// Drops ineligible uploads, sorts the rest chronologically and applies the
/// optional processing limit to the sorted list.
pub fn eligible_in_order(
    descriptors: impl IntoIterator<Item = VideoDescriptor>,
    limit: Option<usize>,
) -> Vec<VideoDescriptor> {
    // Listings occasionally repeat an id across nested tabs.
    let mut seen = HashSet::new();
    let mut eligible: Vec<VideoDescriptor> = descriptors
        .into_iter()
        .filter(|video| video.is_eligible() && seen.insert(video.id.clone()))
        .collect();
    eligible.sort_by(|a, b| {
        chronological(
            a.upload_timestamp.as_ref(),
            &a.id,
            b.upload_timestamp.as_ref(),
            &b.id,
        )
    });
    if let Some(limit) = limit {
        eligible.truncate(limit);
    }
    eligible
}
