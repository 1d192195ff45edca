#![forbid(unsafe_code)]

//! Samples one frame from every full-length upload of a channel and encodes
//! the frames, oldest first, into a single slideshow video.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tubereel_tools::cache::CacheStore;
use tubereel_tools::collaborators::{AuthTokens, Collaborators, ensure_program_available};
use tubereel_tools::config::{RuntimeOverrides, resolve_runtime_paths};
use tubereel_tools::error::RunError;
use tubereel_tools::ffmpeg::Ffmpeg;
use tubereel_tools::pipeline::{
    DEFAULT_FRAME_DURATION, DEFAULT_MAX_FORMAT_HEIGHT, DEFAULT_OUTPUT, DEFAULT_POSITION_PERCENT,
    Pipeline, RunObserver, RunOptions, normalize_output_path,
};
use tubereel_tools::summary::RunSummary;
use tubereel_tools::task::{TaskOutcome, VideoTaskResult};
use tubereel_tools::ytdlp::YtDlp;

const EXIT_FAILURE: u8 = 1;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "compile_channel", version, about)]
struct Args {
    /// Channel URL, handle or id
    #[arg(value_name = "CHANNEL", conflicts_with = "channel_flag")]
    channel: Option<String>,

    /// Same as the positional argument
    #[arg(long = "channel", value_name = "CHANNEL")]
    channel_flag: Option<String>,

    /// Position inside each video to sample, in percent
    #[arg(short, long, default_value_t = DEFAULT_POSITION_PERCENT)]
    position: f64,

    /// Seconds each frame is shown
    #[arg(short = 'd', long, default_value_t = DEFAULT_FRAME_DURATION)]
    frame_duration: f64,

    /// Output video path
    #[arg(short, long, default_value = DEFAULT_OUTPUT)]
    output: PathBuf,

    /// Highest video resolution to download
    #[arg(long, default_value_t = DEFAULT_MAX_FORMAT_HEIGHT)]
    max_format_height: u32,

    /// Parallel downloads (defaults to 2 without cookies, CPU count with)
    #[arg(short = 'w', long)]
    max_workers: Option<usize>,

    /// Only process the N oldest videos
    #[arg(short, long)]
    limit: Option<usize>,

    /// Read cookies from this browser profile
    #[arg(long, conflicts_with = "cookies")]
    browser: Option<String>,

    /// Netscape cookie file
    #[arg(long, value_name = "FILE")]
    cookies: Option<PathBuf>,

    /// Reuse frames from an earlier run
    #[arg(long)]
    resume: bool,

    /// Keep downloaded clips after the run
    #[arg(long)]
    keep_temp: bool,

    /// Drop cached videos that are no longer listed (needs --resume)
    #[arg(long, requires = "resume")]
    revalidate: bool,

    /// Cache directory (overrides TUBEREEL_CACHE_DIR)
    #[arg(long, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    fn channel(&self) -> Result<String> {
        match self.channel.as_ref().or(self.channel_flag.as_ref()) {
            Some(channel) => Ok(channel.clone()),
            None => bail!("a channel is required (positional or --channel)"),
        }
    }

    fn auth(&self) -> Option<AuthTokens> {
        if let Some(browser) = &self.browser {
            Some(AuthTokens::Browser(browser.clone()))
        } else {
            self.cookies.clone().map(AuthTokens::CookieFile)
        }
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else if quiet {
        EnvFilter::new("error")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Progress bar over the pending videos.
struct ProgressObserver {
    bar: ProgressBar,
}

impl ProgressObserver {
    fn new(hidden: bool) -> Self {
        let bar = if hidden {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(0)
        };
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.cyan} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
        {
            bar.set_style(style.progress_chars("=> "));
        }
        Self { bar }
    }
}

impl RunObserver for ProgressObserver {
    fn run_started(&self, total: usize, done: usize, workers: usize) {
        self.bar.set_length(total as u64);
        self.bar.set_position(done as u64);
        self.bar.set_message(format!("{workers} worker(s)"));
        self.bar.enable_steady_tick(Duration::from_millis(120));
    }

    fn video_finished(&self, result: &VideoTaskResult) {
        let label = match &result.outcome {
            TaskOutcome::Extracted(_) => "ok",
            TaskOutcome::Skipped(_) => "skipped",
            TaskOutcome::Failed(_) => "failed",
            TaskOutcome::Cancelled => "cancelled",
        };
        self.bar.set_message(format!("{label}: {}", result.title));
        self.bar.inc(1);
    }

    fn run_finished(&self, _summary: &RunSummary) {
        self.bar.finish_and_clear();
    }
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("{summary}");
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    match run(args).await {
        Ok(summary) => {
            print_summary(&summary);
            ExitCode::SUCCESS
        }
        Err(err) => match err.downcast_ref::<RunError>() {
            Some(RunError::Cancelled { summary }) => {
                warn!("run interrupted");
                print_summary(summary);
                ExitCode::from(EXIT_INTERRUPTED)
            }
            Some(run_err) => {
                error!("{run_err}");
                if let Some(summary) = run_err.summary() {
                    print_summary(summary);
                }
                ExitCode::from(EXIT_FAILURE)
            }
            None => {
                error!("{err:#}");
                ExitCode::from(EXIT_FAILURE)
            }
        },
    }
}

async fn run(args: Args) -> Result<RunSummary> {
    let channel = args.channel()?;
    let auth = args.auth();
    if let Some(AuthTokens::CookieFile(path)) = &auth
        && !path.is_file()
    {
        bail!("cookie file {} does not exist", path.display());
    }

    let paths = resolve_runtime_paths(RuntimeOverrides {
        cache_root: args.cache_dir.clone(),
        ..RuntimeOverrides::default()
    })?;

    let output = normalize_output_path(&args.output)
        .with_context(|| format!("preparing output path {}", args.output.display()))?;

    let options = RunOptions {
        position_percent: args.position,
        frame_duration: args.frame_duration,
        max_format_height: args.max_format_height,
        max_workers: args.max_workers,
        limit: args.limit,
        resume: args.resume,
        keep_temp: args.keep_temp,
        revalidate: args.revalidate,
        output,
        auth: auth.clone(),
    };
    options.validate(&channel)?;
    ensure_program_available(&paths.yt_dlp, "--version").await?;
    ensure_program_available(&paths.ffmpeg, "-version").await?;

    info!(
        channel = %channel,
        output = %options.output.display(),
        cache = %paths.cache_root.display(),
        "compiling channel"
    );

    let ytdlp = Arc::new(YtDlp::new(&paths.yt_dlp).with_listing_auth(auth));
    let ffmpeg = Arc::new(Ffmpeg::new(&paths.ffmpeg));
    let collaborators = Collaborators {
        provider: ytdlp.clone(),
        fetcher: ytdlp,
        sampler: ffmpeg.clone(),
        encoder: ffmpeg,
    };
    let store = Arc::new(CacheStore::new(&paths.cache_root));
    let pipeline = Pipeline::new(store, collaborators)
        .with_observer(Arc::new(ProgressObserver::new(args.quiet)));

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing running downloads");
            interrupt.cancel();
        }
    });

    Ok(pipeline.run(&channel, &options, &cancel).await?)
}
