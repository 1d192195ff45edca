#![forbid(unsafe_code)]

//! ffmpeg backed frame sampler and slideshow encoder.

use std::ffi::OsString;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::collaborators::{FrameSampler, VideoEncoder};
use crate::error::{EncodeError, SampleError};

pub const TARGET_WIDTH: u32 = 1920;
pub const TARGET_HEIGHT: u32 = 1080;
pub const TARGET_FPS: u32 = 30;

#[derive(Debug, Clone)]
pub struct Ffmpeg {
    program: PathBuf,
}

impl Ffmpeg {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: Vec<OsString>) -> std::io::Result<Output> {
        Command::new(&self.program)
            .args(["-hide_banner", "-loglevel", "error", "-y"])
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
    }
}

#[async_trait]
impl FrameSampler for Ffmpeg {
    async fn extract_frame(
        &self,
        source: &Path,
        timestamp_seconds: f64,
        destination: &Path,
    ) -> Result<PathBuf, SampleError> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| SampleError::Process(format!("{}: {err}", parent.display())))?;
        }
        // A stale frame from an earlier attempt must not pass as output.
        match fs::remove_file(destination) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(SampleError::Process(format!(
                    "{}: {err}",
                    destination.display()
                )));
            }
        }

        let mut args: Vec<OsString> = Vec::new();
        if timestamp_seconds > 0.0 {
            args.push("-ss".into());
            args.push(format!("{timestamp_seconds:.3}").into());
        }
        args.extend([
            "-i".into(),
            source.into(),
            "-frames:v".into(),
            "1".into(),
            destination.into(),
        ]);

        let output = self.run(args).await.map_err(|err| {
            SampleError::Process(format!("failed to start {}: {err}", self.program.display()))
        })?;
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            return Err(classify_sample_failure(
                output.status.code(),
                timestamp_seconds,
                &stderr,
            ));
        }
        if !destination.is_file() {
            // ffmpeg exits cleanly when the seek lands past the last frame.
            return Err(SampleError::SeekOutOfRange {
                timestamp: timestamp_seconds,
                reason: "no frame decoded at that position".to_string(),
            });
        }
        Ok(destination.to_path_buf())
    }
}

fn classify_sample_failure(code: Option<i32>, timestamp: f64, stderr: &str) -> SampleError {
    let reason = last_line(stderr);
    if code.is_none() {
        return SampleError::Process(format!("ffmpeg terminated by signal: {reason}"));
    }
    if stderr.to_lowercase().contains("output file is empty") {
        SampleError::SeekOutOfRange { timestamp, reason }
    } else {
        SampleError::Decode(reason)
    }
}

#[async_trait]
impl VideoEncoder for Ffmpeg {
    async fn encode(
        &self,
        images: &[PathBuf],
        seconds_per_image: f64,
        output: &Path,
    ) -> Result<(), EncodeError> {
        if images.is_empty() {
            return Err(EncodeError::NoFrames);
        }
        if !(seconds_per_image.is_finite() && seconds_per_image > 0.0) {
            return Err(EncodeError::InvalidDuration(seconds_per_image));
        }

        let parent = output
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;

        let mut list = tempfile::Builder::new()
            .prefix(".tubereel-concat-")
            .suffix(".txt")
            .tempfile_in(parent)?;
        list.write_all(concat_list(images, seconds_per_image)?.as_bytes())?;
        list.flush()?;

        let partial = partial_path(output);
        let args: Vec<OsString> = vec![
            "-f".into(),
            "concat".into(),
            "-safe".into(),
            "0".into(),
            "-i".into(),
            list.path().into(),
            "-vf".into(),
            video_filter().into(),
            "-r".into(),
            TARGET_FPS.to_string().into(),
            "-c:v".into(),
            "libx264".into(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-movflags".into(),
            "+faststart".into(),
            "-f".into(),
            "mp4".into(),
            partial.clone().into(),
        ];

        debug!(frames = images.len(), output = %output.display(), "running ffmpeg concat");
        let result = self.run(args).await?;
        if !result.status.success() {
            let _ = fs::remove_file(&partial);
            return Err(EncodeError::Failed(last_line(&String::from_utf8_lossy(
                &result.stderr,
            ))));
        }
        fs::rename(&partial, output)?;
        Ok(())
    }
}

/// Letterbox into the target frame, then pin rate and pixel format.
fn video_filter() -> String {
    format!(
        "scale={TARGET_WIDTH}:{TARGET_HEIGHT}:force_original_aspect_ratio=decrease,\
         pad={TARGET_WIDTH}:{TARGET_HEIGHT}:(ow-iw)/2:(oh-ih)/2:color=black,\
         setsar=1,fps={TARGET_FPS},format=yuv420p"
    )
}

fn partial_path(output: &Path) -> PathBuf {
    let mut name = output
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    output.with_file_name(name)
}

/// Concat demuxer script. The last file is listed twice because the demuxer
/// ignores the duration of the final entry.
fn concat_list(images: &[PathBuf], seconds_per_image: f64) -> std::io::Result<String> {
    let mut script = String::from("ffconcat version 1.0\n");
    let mut last = String::new();
    for image in images {
        let absolute = std::path::absolute(image)?;
        last = format!("file '{}'\n", escape_concat_path(&absolute));
        script.push_str(&last);
        script.push_str(&format!("duration {seconds_per_image:.6}\n"));
    }
    script.push_str(&last);
    Ok(script)
}

fn escape_concat_path(path: &Path) -> String {
    path.to_string_lossy().replace('\'', r"'\''")
}

fn last_line(stderr: &str) -> String {
    stderr
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .unwrap_or("unknown error")
        .to_string()
}
