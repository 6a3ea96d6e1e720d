//! leech - Main entry point

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use leech::{
    CliArgs, Config, DownloadStats, DownloadStatus, Engine, ProgressDisplay, TorrentDescriptor, TorrentError,
    TorrentParser,
};
use tracing::{debug, error, info, warn};

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();
        match panic_info.location() {
            Some(location) => error!(
                "PANIC occurred at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            ),
            None => error!("PANIC occurred at unknown location"),
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_panic_handler();

    let args = CliArgs::parse_args();
    init_logging(&args);
    debug!("CLI arguments: {:?}", args);

    match run(&args).await {
        // bad torrent or options
        Err(e) if e.downcast_ref::<TorrentError>().is_some_and(TorrentError::is_fatal) => {
            error!("Cannot start download: {:#}", e);
            eprintln!("error: {:#}", e);
            std::process::exit(2);
        }
        other => other,
    }
}

async fn run(args: &CliArgs) -> Result<()> {
    let descriptor = load_torrent_file(&args.torrent_file).context("Failed to load torrent file")?;

    let config = Config::from_args(args);
    config.validate().context("Invalid configuration")?;

    display_torrent_info(&descriptor, &config);

    let mut progress = ProgressDisplay::new(config.is_quiet());
    progress.print_status("Starting download...")?;

    let engine = Engine::new(Arc::new(descriptor), config.engine_settings());
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    match engine.run(&mut progress, shutdown).await {
        Ok(report) => match report.status {
            DownloadStatus::Complete => info!("Download completed successfully"),
            DownloadStatus::Interrupted => {
                progress.print_status(&format!(
                    "Interrupted with {}/{} pieces on disk",
                    report.pieces_persisted, report.scheduler.pieces_total
                ))?;
            }
        },
        Err(e) => {
            error!("Download failed: {}", e);
            progress.print_error(&format!("Download failed: {}", e))?;
            return Err(e);
        }
    }

    info!("leech finished");
    Ok(())
}

/// Initialize logging based on verbosity settings
fn init_logging(args: &CliArgs) {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level())
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if args.is_verbose() {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }
    debug!("Logging initialized at {:?}", args.log_level());
}

fn load_torrent_file(path: &Path) -> Result<TorrentDescriptor> {
    debug!(
        "Torrent file path: {}",
        path.canonicalize().unwrap_or_else(|_| path.to_path_buf()).display()
    );
    let descriptor = TorrentParser::parse_file(path).map_err(|e| {
        error!("Failed to parse torrent file '{}': {}", path.display(), e);
        e
    })?;
    info!("Loaded torrent: {}", descriptor.name);
    Ok(descriptor)
}

fn display_torrent_info(descriptor: &TorrentDescriptor, config: &Config) {
    if config.is_quiet() {
        return;
    }
    println!("Torrent Information:");
    println!(
        "  Name: {}",
        descriptor.name
    );
    println!(
        "  Size: {} ({})",
        descriptor.total_length(),
        DownloadStats::format_bytes(descriptor.total_length())
    );
    println!("  Files: {}", descriptor.files.len());
    println!(
        "  Pieces: {} x {}",
        descriptor.piece_count(),
        DownloadStats::format_bytes(descriptor.piece_length as u64)
    );
    println!("  Info hash: {}", descriptor.info_hash_hex());
    println!("  Trackers: {}", descriptor.announce_list.len());
    println!();
    println!("Configuration:");
    println!("  Output directory: {}", config.output_dir.display());
    println!("  Listen port: {}", config.port);
    println!("  Max connections: {}", config.max_connections);
    println!("  Pipeline depth: {}", config.pipeline_depth);
    println!();
}
