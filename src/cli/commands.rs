//! CLI commands implementation.

use std::path::PathBuf;

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use console::style;

use crate::collector::CollectionQuery;
use crate::config::Settings;
use crate::repository::MarkerRepository;
use crate::segments::SegmentStore;
use crate::session::{compute_session_id, SessionManager};

#[derive(Parser)]
#[command(name = "tela")]
#[command(about = "Telegram channel acquisition and archival system")]
#[command(version)]
pub struct Cli {
    /// Data directory (overrides config file)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Derive the session id for a set of API credentials
    SessionId {
        /// Phone number the credentials belong to
        #[arg(long, env = "TELACQUIRE_PHONE")]
        phone: String,
        /// Telegram API ID
        #[arg(long, env = "TELACQUIRE_API_ID")]
        api_id: i32,
        /// Telegram API hash
        #[arg(long, env = "TELACQUIRE_API_HASH")]
        api_hash: String,
    },

    /// Validate collection query parameters without collecting
    Validate {
        /// Entities to collect, separated by commas
        entities: String,
        /// Earliest message date (YYYY-MM-DD)
        #[arg(long)]
        min_date: Option<String>,
        /// Latest message date (YYYY-MM-DD)
        #[arg(long)]
        max_date: Option<String>,
        /// Messages per entity
        #[arg(long, default_value = "10")]
        max_items: usize,
        /// Lift the entity-count cap
        #[arg(long)]
        privileged: bool,
    },

    /// Inspect and manage output segments of a dataset
    Segments {
        /// Dataset key
        key: String,
        #[command(subcommand)]
        command: SegmentCommands,
    },

    /// Show checkpoint markers of a dataset
    Markers {
        /// Dataset key
        key: String,
    },

    /// Show configuration and data directory status
    Status,
}

#[derive(Subcommand)]
enum SegmentCommands {
    /// List registered segments
    List,
    /// Bundle every registered segment into a zip archive
    Bundle,
    /// Promote an initial-named segment to the primary output path
    Promote,
}

/// Parse and dispatch CLI arguments.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(data_dir) = cli.data_dir {
        settings.data_dir = data_dir;
    }

    match cli.command {
        Commands::SessionId {
            phone,
            api_id,
            api_hash,
        } => session_id_command(&settings, &phone, api_id, &api_hash),
        Commands::Validate {
            entities,
            min_date,
            max_date,
            max_items,
            privileged,
        } => validate_command(&entities, min_date, max_date, max_items, privileged),
        Commands::Segments { key, command } => segments_command(&settings, &key, command),
        Commands::Markers { key } => markers_command(&settings, &key),
        Commands::Status => status_command(&settings),
    }
}

fn session_id_command(
    settings: &Settings,
    phone: &str,
    api_id: i32,
    api_hash: &str,
) -> anyhow::Result<()> {
    settings.ensure_directories()?;
    let session_id = compute_session_id(phone, api_id, api_hash);
    let manager = SessionManager::new(settings.sessions_dir())?;

    println!("{} {}", style("Session id:").bold(), session_id);
    println!(
        "{} {}",
        style("Artifact:").bold(),
        manager.session_path(&session_id).display()
    );
    if manager.artifact_exists(&session_id) {
        println!("{}", style("An artifact exists for this session.").green());
    } else {
        println!(
            "{}",
            style("No artifact yet; the first collection will request a login code.").yellow()
        );
    }
    Ok(())
}

fn validate_command(
    entities: &str,
    min_date: Option<String>,
    max_date: Option<String>,
    max_items: usize,
    privileged: bool,
) -> anyhow::Result<()> {
    let parsed = CollectionQuery::parse_entities(entities);
    let mut query = CollectionQuery::new(parsed)
        .with_date_range(parse_date(min_date.as_deref())?, parse_date(max_date.as_deref())?);
    query.max_items_per_entity = max_items;

    match query.validate(privileged) {
        Ok(()) => {
            println!(
                "{} {} entities",
                style("Query is valid:").green().bold(),
                query.entities.len()
            );
            for entity in &query.entities {
                println!("  {}", entity);
            }
            Ok(())
        }
        Err(e) => {
            println!("{} {}", style("Invalid query:").red().bold(), e);
            std::process::exit(1)
        }
    }
}

fn parse_date(raw: Option<&str>) -> anyhow::Result<Option<i64>> {
    raw.map(|text| {
        NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .with_context(|| format!("invalid date '{}', expected YYYY-MM-DD", text))
            .map(|date| date.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp())
    })
    .transpose()
}

fn open_store(settings: &Settings, key: &str) -> anyhow::Result<SegmentStore> {
    settings.ensure_directories()?;
    Ok(SegmentStore::open(
        &settings.collections_dir(),
        &settings.database_path(),
        key,
        settings.output_format()?,
        &settings.owner,
    )?)
}

fn segments_command(
    settings: &Settings,
    key: &str,
    command: SegmentCommands,
) -> anyhow::Result<()> {
    let store = open_store(settings, key)?;

    match command {
        SegmentCommands::List => {
            let segments = store.registered_segments()?;
            if segments.is_empty() {
                println!("No segments registered for dataset '{}'", key);
                return Ok(());
            }
            for segment in segments {
                let uploaded = match segment.uploaded_date {
                    Some(date) => format!("uploaded {}", date.format("%Y-%m-%d %H:%M:%S")),
                    None => "not uploaded".to_string(),
                };
                println!(
                    "{}  {}  saved {}  {}",
                    segment.file_path,
                    segment.file_type,
                    segment.saved_date.format("%Y-%m-%d %H:%M:%S"),
                    uploaded
                );
            }
        }
        SegmentCommands::Bundle => {
            let archive = store.bundle_archive()?;
            println!("{} {}", style("Archive written:").green(), archive.display());
        }
        SegmentCommands::Promote => {
            if store.promote_initial_segment()? {
                println!(
                    "{} {}",
                    style("Promoted initial segment to").green(),
                    store.primary_path().display()
                );
            } else {
                println!("No initial segment to promote.");
            }
        }
    }
    Ok(())
}

fn markers_command(settings: &Settings, key: &str) -> anyhow::Result<()> {
    settings.ensure_directories()?;
    let repo = MarkerRepository::new(&settings.database_path())?;
    let markers = repo.get_markers(key)?;

    if markers.is_empty() {
        println!("No checkpoint markers for dataset '{}'", key);
        return Ok(());
    }
    let mut channels: Vec<_> = markers.into_iter().collect();
    channels.sort();
    for (channel, message_id) in channels {
        println!("{}  last message id {}", channel, message_id);
    }
    Ok(())
}

fn status_command(settings: &Settings) -> anyhow::Result<()> {
    println!("{}", style("telacquire status").bold());
    println!("  data dir:     {}", settings.data_dir.display());
    println!("  database:     {}", settings.database_path().display());
    println!("  sessions:     {}", settings.sessions_dir().display());
    println!("  collections:  {}", settings.collections_dir().display());
    println!("  format:       {}", settings.output_format);
    println!(
        "  drive sink:   {}",
        if settings.drive_folder_id.is_some() {
            "configured"
        } else {
            "not configured"
        }
    );

    if settings.sessions_dir().exists() {
        let manager = SessionManager::new(settings.sessions_dir())?;
        let sessions = manager.list_sessions()?;
        println!("  sessions on disk: {}", sessions.len());
    }
    Ok(())
}
