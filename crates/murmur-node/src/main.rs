//! murmur: identity, contact and backup management for a local peer, plus
//! an in-process self-test of the room protocol.
//!
//! # Usage
//!
//! ```bash
//! murmur whoami
//! murmur contacts
//! murmur rooms
//! murmur backup --out murmur-backup.json
//! murmur restore murmur-backup.json --replace
//! murmur selftest
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use murmur_db::memory::MemoryStore;
use murmur_db::sqlite::SqliteStore;
use murmur_db::KvStore;
use murmur_node::{Event, EventKind, Node, NodeConfig, RoomMode};
use murmur_room::Room;
use murmur_transport::memory::MemoryHub;
use murmur_transport::Transport;
use murmur_trust::backup::RestoreMode;
use murmur_trust::{get_or_create_identity, TrustStore};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::info;

/// Murmur end-to-end encrypted room chat
#[derive(Parser, Debug)]
#[command(name = "murmur")]
#[command(about = "End-to-end encrypted room chat over pub/sub")]
#[command(version)]
struct Args {
    /// Path to config.toml (defaults to the data directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error). Overrides the config file.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the local fingerprint and public key
    Whoami,
    /// List pinned contacts
    Contacts,
    /// List rooms with stored state
    Rooms,
    /// Write identity and contacts to a backup file
    Backup {
        /// Destination file
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Restore identity and contacts from a backup file
    Restore {
        /// Backup file to read
        path: PathBuf,
        /// Wipe local state and adopt the backup's identity
        #[arg(long)]
        replace: bool,
    },
    /// Run two in-process peers through create, join, approve and chat
    Selftest {
        /// Room topic to use
        #[arg(long, default_value = "murmur-selftest")]
        room: String,
        /// Give up after this many seconds
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => NodeConfig::load_from(path)?,
        None => NodeConfig::load()?,
    };
    let level = args.log_level.as_deref().unwrap_or(&config.logging.log_level);
    murmur_node::logging::init(level)?;

    match args.command {
        Command::Whoami => whoami(&config),
        Command::Contacts => contacts(&config),
        Command::Rooms => rooms(&config),
        Command::Backup { out } => backup(&config, &out),
        Command::Restore { path, replace } => restore(&config, &path, replace),
        Command::Selftest { room, timeout_secs } => {
            selftest(&config, &room, Duration::from_secs(timeout_secs)).await
        }
    }
}

fn open_store(config: &NodeConfig) -> anyhow::Result<Arc<dyn KvStore>> {
    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;
    let store = SqliteStore::open(&config.db_path())?;
    Ok(Arc::new(store))
}

fn whoami(config: &NodeConfig) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let identity = get_or_create_identity(store.as_ref())?;
    println!("fingerprint: {}", identity.fingerprint());
    println!("public key:  {}", identity.public_key().to_base64());
    Ok(())
}

fn contacts(config: &NodeConfig) -> anyhow::Result<()> {
    let trust = TrustStore::new(open_store(config)?);
    let contacts = trust.contacts()?;
    if contacts.is_empty() {
        println!("no pinned contacts");
    }
    for (fingerprint, public_key) in contacts {
        println!("{fingerprint}  {public_key}");
    }
    Ok(())
}

fn rooms(config: &NodeConfig) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let identity = get_or_create_identity(store.as_ref())?;
    let names = murmur_room::known_rooms(store.as_ref())?;
    if names.is_empty() {
        println!("no rooms");
    }
    for name in names {
        let room = Room::new(name.as_str(), store.clone());
        let members = room.members()?;
        let owner = room.owner_fingerprint(identity.fingerprint())?;
        let key_id = room.current_key_id()?.unwrap_or_else(|| "none".to_string());
        println!(
            "{name}: {} members, {} pending, owner {owner}, key {key_id}",
            members.len(),
            room.pending()?.len()
        );
    }
    Ok(())
}

fn backup(config: &NodeConfig, out: &Path) -> anyhow::Result<()> {
    let store = open_store(config)?;
    get_or_create_identity(store.as_ref())?;
    let trust = TrustStore::new(store);
    let file = trust.make_backup()?;
    std::fs::write(out, file.to_json()?)
        .with_context(|| format!("writing backup to {}", out.display()))?;
    println!(
        "wrote {} contacts to {} (contains your secret key)",
        file.contacts.len(),
        out.display()
    );
    Ok(())
}

fn restore(config: &NodeConfig, path: &Path, replace: bool) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading backup {}", path.display()))?;
    let mode = if replace {
        RestoreMode::Replace
    } else {
        RestoreMode::Merge
    };
    let trust = TrustStore::new(open_store(config)?);
    let report = trust.restore_backup_json(&text, mode)?;
    println!(
        "identity {}, {} contacts added",
        if report.identity_restored { "restored" } else { "kept" },
        report.contacts_added
    );
    for fingerprint in &report.conflicts {
        println!("kept existing key for {fingerprint} (backup disagrees)");
    }
    for fingerprint in &report.invalid {
        println!("skipped invalid entry {fingerprint}");
    }
    Ok(())
}

async fn wait_for(
    events: &mut broadcast::Receiver<Event>,
    what: &str,
    matches: impl Fn(&EventKind) -> bool,
) -> anyhow::Result<()> {
    loop {
        match events.recv().await {
            Ok(event) if matches(&event.kind) => {
                info!(what, "self-test step passed");
                return Ok(());
            }
            Ok(_) | Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => bail!("event bus closed while waiting for {what}"),
        }
    }
}

fn selftest_node(hub: &MemoryHub, config: &NodeConfig) -> anyhow::Result<Node> {
    let transport: Arc<dyn Transport> = Arc::new(hub.connect()?);
    Ok(Node::start(Arc::new(MemoryStore::new()), transport, config.clone())?)
}

async fn selftest(config: &NodeConfig, room: &str, timeout: Duration) -> anyhow::Result<()> {
    let mut config = config.clone();
    config.protocol.rebroadcast_interval_ms = 200;

    let hub = MemoryHub::new();
    let first = selftest_node(&hub, &config)?;
    let second = selftest_node(&hub, &config)?;
    // The smaller fingerprint is the owner once both are members.
    let (owner, joiner) = if first.fingerprint() < second.fingerprint() {
        (first, second)
    } else {
        (second, first)
    };
    let joiner_fp = joiner.fingerprint().to_string();
    let owner_fp = owner.fingerprint().to_string();
    println!("owner  {owner_fp}");
    println!("joiner {joiner_fp}");

    let mut owner_events = owner.events().subscribe();
    let mut joiner_events = joiner.events().subscribe();
    let owner_room = owner.open_room(room, RoomMode::Create).await?;
    let joiner_room = joiner.open_room(room, RoomMode::Join).await?;

    let steps = async {
        wait_for(&mut owner_events, "join request", |kind| {
            matches!(kind, EventKind::JoinRequested { fingerprint } if *fingerprint == joiner_fp)
        })
        .await?;
        owner_room.approve(&joiner_fp).await?;
        wait_for(&mut joiner_events, "admission", |kind| {
            matches!(kind, EventKind::Admitted { .. })
        })
        .await?;

        owner_room.send("hello-from-owner").await?;
        joiner_room.send("hello-from-joiner").await?;
        wait_for(&mut joiner_events, "owner message", |kind| {
            matches!(kind, EventKind::GroupMessage { from, text } if *from == owner_fp && text == "hello-from-owner")
        })
        .await?;
        wait_for(&mut owner_events, "joiner message", |kind| {
            matches!(kind, EventKind::GroupMessage { from, text } if *from == joiner_fp && text == "hello-from-joiner")
        })
        .await?;
        anyhow::Ok(())
    };

    let result = tokio::time::timeout(timeout, steps).await;
    owner.shutdown();
    joiner.shutdown();
    match result {
        Ok(Ok(())) => {
            let stats = hub.stats()?;
            println!("self-test passed ({} deliveries)", stats.delivered);
            Ok(())
        }
        Ok(Err(e)) => Err(e.context("self-test failed")),
        Err(_) => bail!("self-test timed out after {}s", timeout.as_secs()),
    }
}
