use std::io::BufRead as _;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Parser;
use fs_err as fs;
use recook::asset_registry::AssetRegistry;
use recook::chunk_manifest::ChunkDependencyTree;
use recook::distributed::{DistributedCoordinator, ProcessWorker, cook_slice};
use recook::logging::Log;
use recook::manifest::WorkerResponseFile;
use recook::platform::Platforms;
use recook::project::ProjectRepository;
use recook::replay_format::ReplayFlags;
use recook::replay_streamer::{FileStreamer, ReplayStreamer, verify_stream};
use recook::sandbox::Sandbox;
use recook::scheduler::{CookMode, CookOptions, CookState, Cooker, requested_packages};
use recook::settings::CookSettings;
use tracing::info;

#[derive(Parser, Debug, Clone)]
struct ActionCook {
    /// Project description (JSON)
    #[arg(long)]
    project: PathBuf,
    /// Output directory, one subdirectory per platform
    #[arg(long)]
    sandbox: PathBuf,
    #[arg(long = "platform", required = true)]
    platforms: Vec<String>,
    #[arg(long, default_value = "by-the-book")]
    mode: CookMode,
    /// Keep cooked packages whose inputs did not change
    #[arg(long)]
    iterative: bool,
    #[arg(long)]
    compressed: bool,
    /// Missing assets abort the cook
    #[arg(long)]
    strict: bool,
    #[arg(long)]
    dlc_name: Option<String>,
    /// Asset registry of the release a DLC is based on, its packages are not cooked again
    #[arg(long)]
    based_on_release: Option<PathBuf>,
    #[arg(long, default_value_t = 0)]
    num_workers: usize,
    #[arg(long = "map")]
    maps: Vec<String>,
    #[arg(long = "dir")]
    dirs: Vec<String>,
    /// Cook settings (JSON)
    #[arg(long)]
    settings: Option<PathBuf>,
    /// Chunk parents (JSON)
    #[arg(long)]
    chunk_tree: Option<PathBuf>,
    /// Seconds a cook on the fly request may go without progress
    #[arg(long, default_value_t = 300)]
    idle_timeout: u64,
    /// Worker mode: packages to cook
    #[arg(long, requires = "report_file")]
    response_file: Option<PathBuf>,
    /// Worker mode: where to write what happened
    #[arg(long, requires = "response_file")]
    report_file: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct ActionReplayFile {
    #[arg(index = 1)]
    replay: PathBuf,
}

#[derive(Parser, Debug)]
enum ReplayAction {
    /// Print header and checkpoints of a replay file
    Info(ActionReplayFile),
    /// Read every frame and checkpoint of a replay file
    Verify(ActionReplayFile),
}

#[derive(Parser, Debug)]
enum Action {
    /// Cook project assets into a sandbox
    Cook(ActionCook),
    /// Inspect recorded replays
    #[command(subcommand)]
    Replay(ReplayAction),
}

#[derive(Parser, Debug)]
struct Args {
    #[arg(short, long, global = true)]
    verbose: bool,
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    action: Action,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("recook=info")))
        .with_writer(std::io::stderr)
        .init();

    let log = Log::new(args.verbose, args.debug);
    match args.action {
        Action::Cook(action) => action_cook(action, &log),
        Action::Replay(ReplayAction::Info(action)) => action_replay_info(action, &log),
        Action::Replay(ReplayAction::Verify(action)) => action_replay_verify(action, &log),
    }
}

fn cook_options(args: &ActionCook) -> Result<CookOptions> {
    let chunk_tree = match &args.chunk_tree {
        Some(path) => ChunkDependencyTree::load(path)?,
        None => ChunkDependencyTree::new(),
    };
    let based_on_release = match &args.based_on_release {
        Some(path) => Some(AssetRegistry::load(path).with_context(|| format!("loading release registry {}", path.display()))?.package_names()),
        None => None,
    };
    Ok(CookOptions {
        mode: args.mode,
        iterative: args.iterative,
        compressed: args.compressed,
        strict: args.strict,
        dlc_name: args.dlc_name.clone(),
        based_on_release,
        chunk_tree,
        ..Default::default()
    })
}

fn action_cook(args: ActionCook, log: &Log) -> Result<()> {
    let settings = match &args.settings {
        Some(path) => CookSettings::load(path)?,
        None => CookSettings::default(),
    };
    settings.validate()?;
    let repo = ProjectRepository::load(&args.project)?;
    let options = cook_options(&args)?;

    if let (Some(response_file), Some(report_file)) = (&args.response_file, &args.report_file) {
        let response: WorkerResponseFile = serde_json::from_slice(&fs::read(response_file)?).context("parsing response file")?;
        let platforms = if response.platforms.is_empty() { &args.platforms } else { &response.platforms };
        let options = CookOptions {
            restrict_to_requested: true,
            write_metadata: false,
            clean_sandbox: false,
            ..options
        };
        let mut cooker = Cooker::new(repo, Platforms::from_names(platforms)?, Sandbox::open(&args.sandbox)?, settings, options, Log::quiet());
        let report = cook_slice(&mut cooker, &response)?;
        fs::write(report_file, serde_json::to_vec_pretty(&report)?)?;
        return Ok(());
    }

    let platforms = Platforms::from_names(&args.platforms)?;
    let sandbox = Sandbox::open(&args.sandbox)?;
    let packages = requested_packages(&repo, &args.maps, &args.dirs)?;
    let min_worker_slice = settings.min_worker_slice;
    let mut cooker = Cooker::new(repo, platforms, sandbox, settings, options, log.clone());

    if args.mode == CookMode::OnTheFly {
        return serve_on_the_fly(&mut cooker, Duration::from_secs(args.idle_timeout), log);
    }

    let progress = indicatif::ProgressBar::new(0).with_style(
        indicatif::ProgressStyle::with_template("{spinner} [{elapsed_precise}] [{wide_bar}] {pos}/{len} ({eta})").context("progress template")?,
    );
    log.set_progress(Some(&progress));
    cooker.start(&packages)?;

    let result = if args.num_workers > 0 {
        cook_distributed(&mut cooker, &args, min_worker_slice)
    } else {
        cooker.run_to_completion().map(|_| ())
    };
    progress.finish_and_clear();
    log.set_progress(None);
    result?;

    // partial failures are reported in the registry, not through the exit code
    let stats = cooker.stats();
    if stats.failed > 0 {
        log.log(&format!("{} packages failed to cook, see the asset registry for details", stats.failed));
    }
    Ok(())
}

fn worker_args(args: &ActionCook) -> Vec<String> {
    let mut out = vec!["cook".to_string(), "--project".into(), args.project.display().to_string(), "--sandbox".into(), args.sandbox.display().to_string()];
    for platform in &args.platforms {
        out.extend(["--platform".to_string(), platform.clone()]);
    }
    for (flag, set) in [("--iterative", args.iterative), ("--compressed", args.compressed), ("--strict", args.strict)] {
        if set {
            out.push(flag.to_string());
        }
    }
    for (flag, path) in [("--settings", &args.settings), ("--based-on-release", &args.based_on_release)] {
        if let Some(path) = path {
            out.extend([flag.to_string(), path.display().to_string()]);
        }
    }
    out
}

fn cook_distributed(cooker: &mut Cooker<ProjectRepository>, args: &ActionCook, min_worker_slice: usize) -> Result<()> {
    let exe = std::env::current_exe()?;
    let shared_args = worker_args(args);
    let dir = args.sandbox.join("Workers");
    let mut coordinator = DistributedCoordinator::distribute(cooker, args.num_workers, min_worker_slice, |index| {
        Box::new(ProcessWorker::new(index, exe.clone(), shared_args.clone(), dir.clone()))
    })?;
    while cooker.state() != CookState::Idle {
        let outstanding = coordinator.poll(cooker);
        if let Err(err) = cooker.tick() {
            coordinator.abandon(cooker);
            return Err(err);
        }
        if outstanding > 0 && cooker.queue().is_empty() {
            std::thread::sleep(Duration::from_millis(50));
        }
    }
    if !coordinator.failed_workers().is_empty() {
        info!(workers = ?coordinator.failed_workers(), "some workers failed, their packages are marked as failed");
    }
    Ok(())
}

/// Serves package names read from stdin one per line, printing the result of each
fn serve_on_the_fly(cooker: &mut Cooker<ProjectRepository>, idle_timeout: Duration, log: &Log) -> Result<()> {
    let all = cooker.platforms().all();
    for line in std::io::stdin().lock().lines() {
        let line = line?;
        let name = line.trim();
        if name.is_empty() {
            continue;
        }
        match cooker.cook_on_the_fly(name, all, idle_timeout) {
            Ok(result) if result.skipped => log.log(&format!("{name}: nothing to cook")),
            Ok(result) => {
                log.log(&format!("{name}: {} platforms cooked, {} failed", result.succeeded.len(), result.failed.len()));
                for other in result.unsolicited {
                    log.log(&format!("  also cooked {other}"));
                }
            }
            Err(err) if err.downcast_ref::<recook::CookError>().is_some() => log.log(&format!("{name}: {err}")),
            Err(err) => return Err(err),
        }
    }
    cooker.cancel();
    while cooker.state() != CookState::Idle {
        cooker.tick()?;
    }
    Ok(())
}

fn action_replay_info(args: ActionReplayFile, log: &Log) -> Result<()> {
    let streamer = FileStreamer::open(&args.replay)?;
    let Some(header) = streamer.header() else {
        anyhow::bail!("{} has no replay header", args.replay.display());
    };
    log.log(&format!("map:           {}", header.map_name));
    log.log(&format!("version:       {} (changelist {})", header.network_version, header.changelist));
    log.log(&format!("checksums:     {}", header.flags.contains(ReplayFlags::HAS_CHECKSUMS)));
    log.log(&format!("compressed:    {}", header.flags.contains(ReplayFlags::COMPRESSED_CHECKPOINTS)));
    log.log(&format!("duration:      {:.2}s{}", streamer.total_time_ms() as f32 / 1000.0, if streamer.is_live() { " (live)" } else { "" }));
    log.log(&format!("data:          {} bytes", streamer.with_data(|d| d.len())));
    for (index, checkpoint) in streamer.checkpoints().iter().enumerate() {
        log.log(&format!("checkpoint {index:3}: {:>9.2}s at offset {}", checkpoint.time_ms as f32 / 1000.0, checkpoint.data_offset));
    }
    Ok(())
}

fn action_replay_verify(args: ActionReplayFile, log: &Log) -> Result<()> {
    let streamer = FileStreamer::open(&args.replay)?;
    let summary = verify_stream(&streamer).with_context(|| format!("verifying {}", args.replay.display()))?;
    log.log(&format!(
        "{} frames, {} packets, {} external data blocks, {} checkpoints, last frame at {:.2}s{}",
        summary.frames,
        summary.packets,
        summary.external_data,
        summary.checkpoints,
        summary.last_frame_time,
        if summary.live { ", still being recorded" } else { "" }
    ));
    Ok(())
}
