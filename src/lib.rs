#![forbid(unsafe_code)]

//! Building blocks for `compile_channel`: sample one frame from every
//! full-length upload of a channel and stitch the frames into a chronological
//! slideshow.

pub mod cache;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod ffmpeg;
pub mod model;
pub mod pipeline;
pub mod pool;
pub mod retry;
pub mod summary;
pub mod task;
pub mod ytdlp;

#[cfg(test)]
pub(crate) mod testing;
