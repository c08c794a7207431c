//! cfsync command line.

use anyhow::{Context, Result};
use cfsync::config::{SyncConfig, TransportKind};
use cfsync::platform::{FileMetadataProvider, MetadataProvider};
use cfsync::ssh::{ConnectTarget, ForwardSpec, HostKeyCheck, SecureShell};
use cfsync::transport::{connect_transport, ProgressSink};
use cfsync::{SyncIgnore, SyncOptions, SyncSession};
use clap::Parser;
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Mirror a local folder into a running application container.
#[derive(Parser, Debug)]
#[command(name = "cfsync", version, about, long_about = None)]
struct Cli {
    /// Application name
    app: String,

    /// Local folder to mirror (default: ./sync-<APP>)
    #[arg(short, long)]
    source: Option<String>,

    /// Remote folder, relative to the remote root
    #[arg(short, long)]
    target: Option<String>,

    /// Pull from the container even if the local folder is not empty
    #[arg(short, long)]
    force: bool,

    /// Transfer protocol (sftp or scp)
    #[arg(long)]
    transport: Option<TransportKind>,

    /// Platform metadata snapshot (JSON)
    #[arg(long, env = "CFSYNC_METADATA", default_value = "cfsync-metadata.json")]
    metadata: PathBuf,

    /// Configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Forward a local port through the tunnel
    #[arg(short = 'L', long = "forward", value_name = "[BIND:]PORT:HOST:HOSTPORT")]
    forward: Vec<ForwardSpec>,

    /// Do not draw transfer progress bars
    #[arg(long)]
    no_progress: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("cfsync=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cfsync=info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = SyncConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(kind) = cli.transport {
        config.transport = kind;
    }
    config.forward.extend(cli.forward.iter().cloned());

    let source_dir = prepare_source(&config.source_dir(&cli.app, cli.source.as_deref()))?;
    let target_dir = config.target_dir(cli.target.as_deref());

    info!("Retrieving information about your app ...");
    let metadata = FileMetadataProvider::load(&cli.metadata)?;
    let ssh_info = metadata.ssh_info()?;
    let app = metadata.app(&cli.app)?;
    let token = metadata.ssh_code()?;
    info!("Finished retrieving information about your app.");

    let target = ConnectTarget {
        app_name: cli.app.clone(),
        app,
        endpoint: ssh_info.app_ssh_endpoint,
        instance_index: config.instance_index,
    };
    let host_key = HostKeyCheck::new(
        metadata.skip_host_validation(),
        ssh_info.app_ssh_host_key_fingerprint,
    );

    let mut shell = SecureShell::connect(target, token, host_key).await?;
    shell.start_keepalive(config.keepalive_interval());

    let outcome = mirror(&mut shell, &config, &cli, source_dir, target_dir).await;
    if let Err(e) = shell.close().await {
        warn!("Closing connection: {}", e);
    }
    outcome
}

async fn mirror(
    shell: &mut SecureShell,
    config: &SyncConfig,
    cli: &Cli,
    source_dir: PathBuf,
    target_dir: String,
) -> Result<()> {
    shell
        .local_port_forward(&config.forward)
        .await
        .context("starting port forwarding")?;

    let ignore = Arc::new(
        SyncIgnore::load(&source_dir, &target_dir, &config.ignore_file)
            .context("loading ignore file")?,
    );
    let transport = connect_transport(
        config.transport,
        shell.client().clone(),
        ignore.clone(),
        ProgressSink::new(!cli.no_progress),
    )?;
    let options = SyncOptions::from_config(config, ignore, cli.force);
    let session = SyncSession::new(transport, source_dir, target_dir, options)?;

    let cancel = CancellationToken::new();
    let interrupt = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, shutting down ...");
                cancel.cancel();
            }
        }
    });

    let result = session.run(cancel).await;
    interrupt.abort();
    Ok(result?)
}

/// Create the local folder on first use and make it absolute, so watcher
/// paths line up with the session root.
fn prepare_source(dir: &Path) -> Result<PathBuf> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating local folder {}", dir.display()))?;
        info!("Created local folder '{}'", dir.display());
    }
    dir.canonicalize()
        .with_context(|| format!("resolving local folder {}", dir.display()))
}
