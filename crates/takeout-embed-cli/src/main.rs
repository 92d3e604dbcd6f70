use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use takeout_embed_core::date::{DEFAULT_MIN_AGE_DAYS, DEFAULT_MIN_YEAR};
use takeout_embed_core::exiftool::{ExifTool, MetadataTool};
use takeout_embed_core::reorganize::{reorganize, ReorganizeOptions};
use takeout_embed_core::{
    run_with_control, verify, CancellationToken, FatalError, ProcessControl, RunOptions, RunSummary,
    SiblingMode,
};

const LOG_FILENAME: &str = "takeout-embed.log";
const DEFAULT_LOG_FILTER: &str = "takeout_embed_core=info,takeout_embed=info";

#[derive(Parser)]
#[command(
    name = "takeout-embed",
    version,
    about = "Embed Google Takeout sidecar metadata and sort media into date folders"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Show info-level logs on stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Copy media from a Takeout tree into <OUTPUT>/<YYYY>/<Month>, embedding metadata
    Run(RunArgs),
    /// Re-resolve files in an Unknown folder and move the newly dated ones
    Reorganize(ReorganizeArgs),
    /// Check an output tree for unreadable or misplaced files
    Verify {
        /// Output root to check
        output: PathBuf,
    },
}

#[derive(Args)]
struct DateArgs {
    /// Ignore file modification times younger than this many days
    #[arg(long, default_value_t = DEFAULT_MIN_AGE_DAYS)]
    min_age_days: i64,

    /// Reject dates before January 1st of this year
    #[arg(long, default_value_t = DEFAULT_MIN_YEAR)]
    min_year: i32,

    /// Infer dates from numbered sibling files (IMG_0101 from IMG_0100)
    #[arg(long)]
    guess_from_siblings: bool,

    /// Copy and sort only, do not write metadata
    #[arg(long)]
    no_metadata: bool,

    /// Worker threads (default: one fewer than the cores, 4 to 8)
    #[arg(long)]
    workers: Option<usize>,
}

#[derive(Args)]
struct RunArgs {
    /// Takeout root directory
    input: PathBuf,

    /// Output directory (default: <INPUT>/Output)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Fall back to the file modification time
    #[arg(long)]
    use_file_mtime: bool,

    /// Resolve and infer in path order, letting inferred dates date later files
    #[arg(long)]
    single_pass: bool,

    #[command(flatten)]
    dates: DateArgs,
}

#[derive(Args)]
struct ReorganizeArgs {
    /// An existing Unknown folder
    unknown_dir: PathBuf,

    /// Do not fall back to the file modification time
    #[arg(long)]
    no_file_mtime: bool,

    #[command(flatten)]
    dates: DateArgs,
}

/// Log to `<log_dir>/takeout-embed.log` (when given) and to stderr.
fn init_logging(log_dir: Option<&Path>, verbose: bool) -> anyhow::Result<()> {
    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let console_filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    } else {
        EnvFilter::new("warn")
    };

    let file_layer = match log_dir {
        Some(dir) => {
            let path = dir.join(LOG_FILENAME);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .with_filter(file_filter),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .init();
    Ok(())
}

/// The tool, located before anything is written. Without metadata writing a
/// missing tool is tolerated; the core then reads embedded dates in-process
/// only.
fn locate_tool(required: bool) -> Result<ExifTool, FatalError> {
    match ExifTool::locate() {
        Ok(tool) => Ok(tool),
        Err(e) if required => Err(FatalError::ToolUnavailable(e)),
        Err(_) => Ok(ExifTool::new("exiftool")),
    }
}

fn progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::with_template("[{bar:40}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    pb
}

fn cancel_on_ctrlc() -> anyhow::Result<CancellationToken> {
    let token = CancellationToken::new();
    let handler_token = token.clone();
    ctrlc::set_handler(move || {
        tracing::warn!("interrupted, finishing files in flight");
        handler_token.cancel();
    })
    .context("installing Ctrl-C handler")?;
    Ok(token)
}

fn print_summary(summary: &RunSummary, elapsed: std::time::Duration) {
    println!(
        "Done! {} files: {} succeeded, {} failed, {} moved to dated folders, {} in Unknown, {} already processed ({:.2}s)",
        summary.total,
        summary.succeeded,
        summary.failed,
        summary.moved_to_dated,
        summary.remained_unknown,
        summary.skipped,
        elapsed.as_secs_f64()
    );
    for f in &summary.failures {
        println!("  FAILED {}: {}", f.path.display(), f.reason);
    }
    if summary.cancelled {
        println!("Cancelled before all files were processed; run again to continue.");
    }
}

fn exit_code(summary: &RunSummary) -> ExitCode {
    if summary.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}

fn cmd_run(args: RunArgs, verbose: bool) -> anyhow::Result<ExitCode> {
    let write_metadata = !args.dates.no_metadata;
    let tool = locate_tool(write_metadata)?;
    if !args.input.is_dir() {
        return Err(FatalError::InputMissing(args.input).into());
    }

    let mut options = RunOptions::new(&args.input);
    options.output = args.output;
    options.resolve.use_file_mtime = args.use_file_mtime;
    options.resolve.min_age_days = args.dates.min_age_days;
    options.resolve.min_year = args.dates.min_year;
    options.resolve.guess_from_siblings = args.dates.guess_from_siblings;
    options.write_metadata = write_metadata;
    options.workers = args.dates.workers;
    if args.single_pass {
        options.sibling_mode = SiblingMode::SinglePass;
    }

    let output_root = options.output_root();
    fs::create_dir_all(&output_root).map_err(|source| FatalError::OutputNotCreatable {
        path: output_root.clone(),
        source,
    })?;
    init_logging(Some(&output_root), verbose)?;
    tracing::info!(
        input = %args.input.display(),
        output = %output_root.display(),
        exiftool = %tool.program().display(),
        "starting run"
    );

    let control = ProcessControl::new().with_cancel_token(cancel_on_ctrlc()?);
    let pb = progress_bar();
    let started = std::time::Instant::now();
    let pb_cb = pb.clone();
    let summary = run_with_control(&options, &tool as &dyn MetadataTool, &control, &move |stage, current, total, message| {
        pb_cb.set_length(total);
        pb_cb.set_position((current + 1).min(total));
        pb_cb.set_message(format!("{}: {}", stage, message));
    })?;
    pb.finish_and_clear();

    print_summary(&summary, started.elapsed());
    println!("Log written to {}", output_root.join(LOG_FILENAME).display());
    Ok(exit_code(&summary))
}

fn cmd_reorganize(args: ReorganizeArgs, verbose: bool) -> anyhow::Result<ExitCode> {
    let write_metadata = !args.dates.no_metadata;
    let tool = locate_tool(write_metadata)?;
    let Some(output_root) = args
        .unknown_dir
        .is_dir()
        .then(|| args.unknown_dir.parent().map(Path::to_path_buf))
        .flatten()
    else {
        return Err(FatalError::InputMissing(args.unknown_dir).into());
    };
    init_logging(Some(&output_root), verbose)?;

    let mut options = ReorganizeOptions::new(&args.unknown_dir);
    options.resolve.use_file_mtime = !args.no_file_mtime;
    options.resolve.min_age_days = args.dates.min_age_days;
    options.resolve.min_year = args.dates.min_year;
    options.resolve.guess_from_siblings = args.dates.guess_from_siblings;
    options.write_metadata = write_metadata;
    options.workers = args.dates.workers;
    tracing::info!(unknown = %args.unknown_dir.display(), "starting reorganize");

    let control = ProcessControl::new().with_cancel_token(cancel_on_ctrlc()?);
    let pb = progress_bar();
    let started = std::time::Instant::now();
    let pb_cb = pb.clone();
    let summary = reorganize(&options, &tool as &dyn MetadataTool, &control, &move |stage, current, total, message| {
        pb_cb.set_length(total);
        pb_cb.set_position((current + 1).min(total));
        pb_cb.set_message(format!("{}: {}", stage, message));
    })?;
    pb.finish_and_clear();

    print_summary(&summary, started.elapsed());
    Ok(exit_code(&summary))
}

fn cmd_verify(output: PathBuf, verbose: bool) -> anyhow::Result<ExitCode> {
    init_logging(None, verbose)?;
    let tool = ExifTool::locate().ok();
    let report = verify::verify(&output, tool.as_ref().map(|t| t as &dyn MetadataTool))?;

    println!(
        "{} media files: {} readable, {} unreadable, {} images dated, {} images without a date, {} misplaced",
        report.total,
        report.readable,
        report.unreadable.len(),
        report.with_date,
        report.without_date.len(),
        report.misplaced.len()
    );
    for p in &report.unreadable {
        println!("  UNREADABLE {}", p.display());
    }
    for p in &report.misplaced {
        println!("  MISPLACED  {}", p.display());
    }
    if tool.is_none() {
        println!("exiftool not found: video dates were not checked");
    }

    if report.unreadable.is_empty() && report.misplaced.is_empty() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(1))
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Run(args) => cmd_run(args, cli.verbose),
        Command::Reorganize(args) => cmd_reorganize(args, cli.verbose),
        Command::Verify { output } => cmd_verify(output, cli.verbose),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::from(2)
        }
    }
}
