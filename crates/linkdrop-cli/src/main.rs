//! linkdrop CLI
//!
//! Peer-to-peer file drop between clients linked by single-use codes

mod config;
mod progress;

use clap::{Parser, Subcommand};
use console::style;
use linkdrop_core::client::{Client, ClientConfig, Collaborators, MemoryProfileStore};
use linkdrop_core::link::LoopbackNetwork;
use linkdrop_core::{ClientEvent, Direction, LocalRelay, TransferStatus};
use linkdrop_files::{DiskFileStore, FileId, FileReader, FileStore, LocalFile, MemoryFileStore};
use linkdrop_registry::{LinkRegistry, MemoryRegistryStore, RegistryConfig};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use config::Config;
use progress::{TransferProgress, format_age, format_bytes};

/// linkdrop - drop files onto a linked peer
#[derive(Parser)]
#[command(name = "linkdrop")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Link two local clients and drop files into the store
    Send {
        /// Files to send
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// List received files, newest first
    List,

    /// Write a received file back to disk
    Export {
        /// Entry id
        id: FileId,

        /// Output file or directory
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Delete received files
    Delete {
        /// Entry ids
        #[arg(required = true)]
        ids: Vec<FileId>,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };

    // Initialize logging
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();

    // Validate configuration
    config.validate()?;

    match cli.command {
        Commands::Send { files } => send_files(files, &config).await?,
        Commands::List => list_files(&config).await?,
        Commands::Export { id, path } => export_file(id, path, &config).await?,
        Commands::Delete { ids } => delete_files(&ids, &config).await?,
        Commands::Config => print!("{}", toml::to_string_pretty(&config)?),
    }

    Ok(())
}

async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn FileStore>> {
    Ok(Arc::new(DiskFileStore::open(config.files_dir()).await?))
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Link an in-process sender to a receiver backed by the on-disk store and
/// push `paths` across.
async fn send_files(paths: Vec<PathBuf>, config: &Config) -> anyhow::Result<()> {
    let mut files = Vec::with_capacity(paths.len());
    let mut names = HashSet::new();
    for path in &paths {
        let file = LocalFile::from_path(path).await?;
        if !names.insert(file.name().to_string()) {
            anyhow::bail!("Duplicate file name: {}", file.name());
        }
        files.push(file);
    }

    let registry = Arc::new(LinkRegistry::new(
        Arc::new(MemoryRegistryStore::new()),
        RegistryConfig::default(),
    ));
    let relay = Arc::new(LocalRelay::new(Arc::clone(&registry)));
    let network = Arc::new(LoopbackNetwork::new());
    let collaborators = |files: Arc<dyn FileStore>| Collaborators {
        registry: Arc::clone(&registry),
        relay: relay.clone(),
        links: network.clone(),
        files,
        profiles: Arc::new(MemoryProfileStore::new()),
    };

    let receiver = Client::setup(collaborators(open_store(config).await?), config.client_config())
        .await?;
    let sender_config = ClientConfig {
        display_name: Some("linkdrop-send".to_string()),
        ..config.client_config()
    };
    let sender = Client::setup(collaborators(Arc::new(MemoryFileStore::new())), sender_config)
        .await?;

    let code = receiver.create_link_code().await?;
    let peer = sender.connect(code.as_str()).await?;
    println!(
        "{} linked with {} using code {}",
        style("✓").green(),
        peer.display_name(),
        style(code.as_str()).bold()
    );

    let progress = TransferProgress::new(files.iter().map(|f| (f.name(), f.size())));
    let events = receiver.subscribe();
    sender.offer_files(receiver.public_id(), files)?;
    let failed = track(events, &progress, names).await;

    sender.shutdown().await;
    receiver.shutdown().await;

    if failed > 0 {
        anyhow::bail!("{failed} of {} files failed", paths.len());
    }
    println!("{} stored {} files in {}", style("✓").green(), paths.len(), config.files_dir().display());
    Ok(())
}

/// Follow receive events until every name is terminal; returns the failures
async fn track(
    mut events: broadcast::Receiver<ClientEvent>,
    progress: &TransferProgress,
    mut pending: HashSet<String>,
) -> usize {
    let mut failed = 0;
    while !pending.is_empty() {
        let event = match events.recv().await {
            Ok(ClientEvent::Transfer(event)) if event.direction == Direction::Receive => event,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match event.status {
            TransferStatus::Opened => {}
            TransferStatus::Progress { bytes, .. } => progress.update(&event.file, bytes),
            TransferStatus::Completed { file_id } => {
                let id = file_id.map(|id| id.to_string()).unwrap_or_default();
                progress.finish(&event.file, format!("{} #{id}", event.file));
                pending.remove(&event.file);
            }
            TransferStatus::Failed { reason, .. } => {
                progress.abandon(&event.file, format!("{} failed", event.file));
                progress.println(format!("{} {}: {}", style("✗").red(), event.file, reason));
                pending.remove(&event.file);
                failed += 1;
            }
        }
    }
    failed + pending.len()
}

/// List completed files, newest first
async fn list_files(config: &Config) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let mut records = store.list().await?;
    if records.is_empty() {
        println!("No files received yet");
        return Ok(());
    }
    records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.0.cmp(&a.id.0)));

    let now = now_millis();
    println!(
        "{:>6}  {:<32} {:>12}  {:<24} {}",
        style("ID").bold(),
        style("NAME").bold(),
        style("SIZE").bold(),
        style("TYPE").bold(),
        style("RECEIVED").bold()
    );
    for record in records {
        println!(
            "{:>6}  {:<32} {:>12}  {:<24} {}",
            record.id,
            record.name,
            format_bytes(record.size),
            record.mime_type,
            format_age(record.created_at, now)
        );
    }
    Ok(())
}

/// Stream a stored file back to disk
async fn export_file(id: FileId, path: PathBuf, config: &Config) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let mut reader = FileReader::open(store, id).await?;

    let target = if path.is_dir() {
        path.join(&reader.record().name)
    } else {
        path
    };
    if target.exists() {
        anyhow::bail!("Refusing to overwrite {}", target.display());
    }

    let mut out = tokio::fs::File::create(&target).await?;
    let written = reader.copy_to(&mut out).await?;
    tracing::info!("Exported entry {} to {:?}", id, target);
    println!("{} wrote {} to {}", style("✓").green(), format_bytes(written), target.display());
    Ok(())
}

/// Delete entries, reporting each failure
async fn delete_files(ids: &[FileId], config: &Config) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let mut failed = 0;
    for (id, result) in store.delete_entries(ids).await {
        match result {
            Ok(()) => println!("{} deleted {}", style("✓").green(), id),
            Err(e) => {
                println!("{} {}: {}", style("✗").red(), id, e);
                failed += 1;
            }
        }
    }
    if failed > 0 {
        anyhow::bail!("{failed} of {} deletions failed", ids.len());
    }
    Ok(())
}
