use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use ssync::observer::{SessionState, SyncObserver};
use ssync::sparse::{coalesce, retrieve_layout, Extent, Interval, Kind};
use ssync::{sync_file_with, ApplyServer, Config, Endpoint};

#[derive(Parser, Debug)]
#[command(name = "ssync", version)]
#[command(about = "Sparse file sync - transfers data extents, preserves holes", long_about = None)]
struct Cli {
    /// More logging (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Receive sync sessions
    Serve {
        /// Address to listen on
        #[arg(long, env = "SSYNC_LISTEN")]
        listen: String,

        /// Only accept destination paths under this directory
        #[arg(long)]
        root: Option<PathBuf>,

        /// Idle timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Exit after one session
        #[arg(long)]
        once: bool,

        /// TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Sync a local file to a server
    Push {
        source: PathBuf,

        /// Server address (host:port)
        endpoint: String,

        /// Destination path on the server
        dest: String,

        /// Idle timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Compare layout digests after the transfer
        #[arg(long)]
        verify: bool,

        /// Send every data batch, even if the destination already has it
        #[arg(long)]
        no_checksums: bool,

        /// TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Hide the progress bar
        #[arg(long)]
        quiet: bool,
    },

    /// Print the data/hole layout of a file
    Layout {
        file: PathBuf,

        #[arg(long, default_value_t = 0)]
        begin: u64,

        /// End offset (default: file size)
        #[arg(long)]
        end: Option<u64>,

        /// Merge adjacent extents of the same kind
        #[arg(long)]
        coalesce: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Serve {
            listen,
            root,
            timeout,
            once,
            config,
        } => serve(listen, root, timeout, once, config).await,
        Command::Push {
            source,
            endpoint,
            dest,
            timeout,
            verify,
            no_checksums,
            config,
            quiet,
        } => {
            let mut session = load_config(config.as_ref())?.session;
            if let Some(secs) = timeout {
                session.timeout_secs = secs;
            }
            session.verify |= verify;
            session.checksums &= !no_checksums;
            push(source, endpoint, dest, session, quiet).await
        }
        Command::Layout {
            file,
            begin,
            end,
            coalesce,
        } => layout(file, begin, end, coalesce),
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "ssync=info",
        1 => "ssync=debug",
        _ => "ssync=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path).with_context(|| format!("Loading {}", path.display())),
        None => Ok(Config::default()),
    }
}

async fn serve(
    listen: String,
    root: Option<PathBuf>,
    timeout: Option<u64>,
    once: bool,
    config: Option<PathBuf>,
) -> Result<()> {
    let mut server_config = load_config(config.as_ref())?.server;
    if root.is_some() {
        server_config.root = root;
    }
    if let Some(secs) = timeout {
        server_config.timeout_secs = secs;
    }

    let endpoint: Endpoint = listen.parse()?;
    let server = ApplyServer::bind(&endpoint, server_config).await?;
    eprintln!(
        "{} listening on {}",
        "ssync".bold(),
        server.local_endpoint()?.to_string().cyan()
    );

    if once {
        let stats = server.serve_one().await?;
        eprintln!(
            "{} {} batches, {} bytes written, {} bytes punched, {} bytes already identical",
            "✓".green(),
            stats.batches_applied,
            stats.bytes_written,
            stats.bytes_punched,
            stats.bytes_skipped
        );
        return Ok(());
    }

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupted, shutting down"),
    }
    Ok(())
}

async fn push(
    source: PathBuf,
    endpoint: String,
    dest: String,
    session: ssync::SessionConfig,
    quiet: bool,
) -> Result<()> {
    let endpoint: Endpoint = endpoint.parse()?;
    let size = std::fs::metadata(&source)
        .with_context(|| format!("Cannot read {}", source.display()))?
        .len();

    let bar = if quiet {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(size)
    };
    bar.set_style(
        ProgressStyle::with_template(
            "{msg:>12} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
        )?
        .progress_chars("=> "),
    );
    let observer = Arc::new(ProgressObserver { bar: bar.clone() });

    let result = sync_file_with(&source, &endpoint, &dest, session, observer).await;
    bar.finish_and_clear();
    let stats = result?;

    println!(
        "{} {} -> {}:{}",
        "✓".green(),
        source.display(),
        endpoint,
        dest
    );
    println!(
        "  {} sent in {} batches, {} skipped as identical, {} punched",
        format_bytes(stats.bytes_transferred).bold(),
        stats.batches_sent,
        format_bytes(stats.bytes_skipped),
        format_bytes(stats.bytes_punched)
    );
    if stats.degraded {
        println!(
            "  {}",
            "destination layout unavailable, all data was sent".yellow()
        );
    }
    if stats.verified {
        println!("  {}", "layout digest verified".green());
    }
    println!("  done in {:.2?}", stats.duration);
    Ok(())
}

fn layout(file: PathBuf, begin: u64, end: Option<u64>, merge: bool) -> Result<()> {
    let handle = std::fs::File::open(&file)
        .with_context(|| format!("Cannot open {}", file.display()))?;
    let size = handle.metadata()?.len();
    let end = end.unwrap_or(size);
    if begin > end {
        anyhow::bail!("begin {} is past end {}", begin, end);
    }
    let interval = Interval::new(begin, end);

    let mut extents = retrieve_layout(&handle, interval)?;
    if merge {
        extents = coalesce(&extents);
    }

    for extent in &extents {
        println!("{}", paint(extent));
    }

    let data: u64 = extents.iter().filter(|e| e.is_data()).map(Extent::len).sum();
    println!(
        "{} extents, {} data, {} holes in {}",
        extents.len(),
        format_bytes(data),
        format_bytes(interval.len() - data),
        interval
    );
    Ok(())
}

fn paint(extent: &Extent) -> ColoredString {
    let line = format!("{:>5} {} ({})", extent.kind, extent.interval, format_bytes(extent.len()));
    match extent.kind {
        Kind::Data => line.green(),
        Kind::Hole => line.dimmed(),
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Drives the progress bar: source holes count as done when scanned, data
/// when its batch is sent or skipped.
struct ProgressObserver {
    bar: ProgressBar,
}

impl SyncObserver for ProgressObserver {
    fn on_state(&self, state: SessionState) {
        tracing::debug!("session state -> {}", state);
        self.bar.set_message(state.to_string());
    }

    fn on_extent(&self, extent: &Extent) {
        if extent.is_hole() {
            self.bar.inc(extent.len());
        }
    }

    fn on_dest_layout(&self, extents: Option<usize>) {
        if extents.is_none() {
            self.bar
                .println(format!("{}", "destination layout unavailable".yellow()));
        }
    }

    fn on_batch_sent(&self, interval: &Interval) {
        self.bar.inc(interval.len());
    }

    fn on_batch_skipped(&self, interval: &Interval) {
        self.bar.inc(interval.len());
    }
}
