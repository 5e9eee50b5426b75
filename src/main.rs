use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use podcast_sync::episode::{format_bytes, format_duration};
use podcast_sync::volume_watcher::is_on_removable_volume;
use podcast_sync::{
    config, detect_drives, logging, AppConfig, Catalog, Drive, DriveEvent, DriveWatcher, Episode,
    JsonCatalog, ProgressSnapshot, SyncEngine,
};

#[derive(Debug, Parser)]
#[command(name = "podcast-sync")]
#[command(about = "Copy podcast episodes onto a removable drive", long_about = None)]
struct Cli {
    /// Config file (defaults to the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List candidate destination drives
    Drives {
        /// Keep running and report drives as they come and go
        #[arg(long)]
        watch: bool,
    },
    /// Show which catalog episodes are already on a drive
    Scan {
        #[arg(long)]
        catalog: PathBuf,
        /// Mount path of the drive
        #[arg(long)]
        drive: PathBuf,
    },
    /// Copy selected catalog episodes onto a drive
    Sync {
        #[arg(long)]
        catalog: PathBuf,
        #[arg(long)]
        drive: PathBuf,
        /// Select every catalog episode, ignoring the file's flags
        #[arg(long)]
        all: bool,
    },
    /// Remove selected catalog episodes from a drive
    Delete {
        #[arg(long)]
        catalog: PathBuf,
        #[arg(long)]
        drive: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Cli::parse();

    let config = match config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error loading configuration: {}", err);
            process::exit(1);
        }
    };
    logging::init_logging(&config.log_level);

    let result = match args.command {
        Some(Commands::Drives { watch: false }) => run_drives(&config),
        Some(Commands::Drives { watch: true }) => watch_drives(config).await,
        Some(Commands::Scan { catalog, drive }) => run_scan(config, &catalog, &drive).await,
        Some(Commands::Sync {
            catalog,
            drive,
            all,
        }) => run_sync(config, &catalog, &drive, all).await,
        Some(Commands::Delete { catalog, drive }) => run_delete(config, &catalog, &drive).await,
        None => {
            let _ = Cli::command().print_long_help();
            Ok(())
        }
    };

    if let Err(err) = result {
        error!("Error: {}", err);
        process::exit(1);
    }
    Ok(())
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

fn drive_at(path: &Path, config: &AppConfig) -> Drive {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    Drive::new(name, path, config.destination_folder.clone())
}

fn run_drives(config: &AppConfig) -> CliResult {
    let drives = detect_drives(config)?;
    if drives.is_empty() {
        println!("No drives found under {}", config.volumes_path.display());
    }
    for drive in drives {
        let removable = if is_on_removable_volume(&drive.mount_path) {
            " (removable)"
        } else {
            ""
        };
        println!("{}  {}{}", drive.name, drive.mount_path.display(), removable);
    }
    Ok(())
}

async fn watch_drives(config: AppConfig) -> CliResult {
    let (tx, mut rx) = mpsc::channel(16);
    let mut watcher = DriveWatcher::start(config, DriveWatcher::DEFAULT_POLL_INTERVAL, tx);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = rx.recv() => match event {
                Some(DriveEvent::DrivesChanged(drives)) => {
                    if drives.is_empty() {
                        println!("Drives: (none)");
                    } else {
                        let names: Vec<_> = drives.iter().map(|d| d.name.as_str()).collect();
                        println!("Drives: {}", names.join(", "));
                    }
                }
                Some(DriveEvent::ScanFailed(err)) => warn!("drive scan failed: {}", err),
                None => break,
            },
        }
    }

    watcher.stop().await;
    Ok(())
}

async fn scan(
    engine: Arc<SyncEngine>,
    drive: Drive,
    catalog: Vec<Episode>,
) -> Result<podcast_sync::DriveScan, Box<dyn std::error::Error>> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
    );
    spinner.set_message(format!("Scanning {}...", drive.name));
    spinner.enable_steady_tick(Duration::from_millis(80));

    let result = tokio::task::spawn_blocking(move || engine.scan_drive(&drive, catalog)).await?;
    spinner.finish_and_clear();
    Ok(result?)
}

async fn run_scan(config: AppConfig, catalog: &Path, drive: &Path) -> CliResult {
    let drive = drive_at(drive, &config);
    let episodes = JsonCatalog::new(catalog).load()?;
    let engine = Arc::new(SyncEngine::new(config));

    let result = scan(engine, drive, episodes).await?;

    for episode in &result.catalog {
        let mark = if episode.on_drive { "✓" } else { " " };
        println!("[{}] {}  ({})", mark, episode.title, episode.description());
    }
    let unknown: Vec<_> = result.drive_episodes.iter().filter(|e| !e.on_drive).collect();
    if !unknown.is_empty() {
        println!();
        println!("Not in catalog:");
        for episode in unknown {
            println!("    {}", episode.file_path);
        }
    }
    Ok(())
}

async fn run_sync(config: AppConfig, catalog: &Path, drive: &Path, all: bool) -> CliResult {
    let drive = drive_at(drive, &config);
    let mut episodes = JsonCatalog::new(catalog).load()?;
    if all {
        for episode in &mut episodes {
            episode.selected = true;
        }
    }

    let engine = SyncEngine::new(config.clone());
    let (tx, rx) = mpsc::channel(config.sync.queue_capacity);
    let handle = engine.start_sync(episodes, &drive, tx).await;
    let render = tokio::spawn(render_progress(rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, stopping sync");
            handle.stop().await;
        }
        _ = handle.wait() => {}
    }

    let Some(last) = render.await? else {
        return Err("sync ended without a final report".into());
    };
    if let Some(err) = last.error {
        return Err(err.into());
    }
    if last.cancelled {
        println!(
            "Cancelled after {} of {} files",
            last.files_done, last.total_files
        );
    } else {
        println!(
            "Copied {} files ({})",
            last.files_done,
            format_bytes(last.bytes_transferred)
        );
    }
    Ok(())
}

/// Draws snapshots until the queue closes and returns the last one.
async fn render_progress(mut rx: mpsc::Receiver<ProgressSnapshot>) -> Option<ProgressSnapshot> {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template(
            "  {spinner:.cyan} [{bar:30.cyan/dim}] {percent:>3}% {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("━╸─")
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
    );
    bar.enable_steady_tick(Duration::from_millis(80));

    let mut last = None;
    while let Some(snapshot) = rx.recv().await {
        bar.set_length(snapshot.total_bytes.max(1));
        bar.set_position(snapshot.bytes_transferred);
        bar.set_message(progress_message(&snapshot));
        last = Some(snapshot);
    }
    bar.finish_and_clear();
    last
}

fn progress_message(snapshot: &ProgressSnapshot) -> String {
    let mut message = format!(
        "{}/{} files  {} / {}",
        snapshot.files_done,
        snapshot.total_files,
        format_bytes(snapshot.bytes_transferred),
        format_bytes(snapshot.total_bytes)
    );
    if snapshot.speed_bytes_per_sec > 0.0 {
        message.push_str(&format!(
            "  {}/s  {} left",
            format_bytes(snapshot.speed_bytes_per_sec as u64),
            format_duration(Duration::from_secs(snapshot.eta_secs))
        ));
    }
    if !snapshot.current_file.is_empty() {
        message.push_str(&format!("  {}", snapshot.current_file));
    }
    message
}

async fn run_delete(config: AppConfig, catalog: &Path, drive: &Path) -> CliResult {
    let drive = drive_at(drive, &config);
    let episodes = JsonCatalog::new(catalog).load()?;
    let wanted: HashSet<(String, String)> = episodes
        .iter()
        .filter(|e| e.selected)
        .map(|e| (e.show.clone(), e.title.clone()))
        .collect();

    let engine = Arc::new(SyncEngine::new(config));
    let mut result = scan(engine.clone(), drive, episodes).await?;

    for episode in &mut result.drive_episodes {
        episode.selected =
            episode.on_drive && wanted.contains(&(episode.show.clone(), episode.title.clone()));
    }

    let outcome = engine.delete_selected(&result.drive_episodes);
    info!(deleted = outcome.completed, "delete finished");
    println!("Deleted {} files", outcome.completed);
    match outcome.error {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}
