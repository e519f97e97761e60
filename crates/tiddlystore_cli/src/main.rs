//! Command-line host for the tiddler store.
//!
//! # Responsibility
//! - Open one backend from config/flags and drive every store operation.
//! - Keep stdout machine-readable: JSON or one value per line.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::debug;
use std::io::{Read, Write};
use std::path::PathBuf;
use tiddlystore_core::{
    core_version, default_log_level, init_logging, registry, Revision, StoreConfig,
    TiddlerService,
};

#[derive(Parser, Debug)]
#[command(name = "tiddlystore", version, about = "Versioned tiddler storage")]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Storage backend (flatfile, kv, sqlite)
    #[arg(long, global = true)]
    backend: Option<String>,

    /// Database path, directory or `:memory:`
    #[arg(long, global = true)]
    db: Option<String>,

    /// Max history kept per tiddler; 0 disables, -1 keeps everything
    #[arg(long, global = true, allow_negative_numbers = true)]
    rev: Option<i64>,

    /// Log level (trace|debug|info|warn|error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Directory for rolling log files; logging is off without it
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List registered storage backends
    Backends,
    /// Print every tiddler as a JSON array
    List,
    /// Print one tiddler as JSON
    Get { key: String },
    /// Store a tiddler from a JSON file or stdin
    Put {
        key: String,
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// Delete a tiddler and its history
    Delete { key: String },
    /// List history revisions, or print one with --revision
    History {
        key: String,
        #[arg(short, long)]
        revision: Option<Revision>,
    },
    /// Print the server status document
    Status,
    /// Print the core version
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    start_logging(&cli)?;

    match &cli.command {
        Command::Backends => {
            let registry = registry::global()
                .read()
                .map_err(|_| anyhow::anyhow!("backend registry lock poisoned"))?;
            for name in registry.list_registered() {
                println!("{name}");
            }
            return Ok(());
        }
        Command::Version => {
            println!("{}", core_version());
            return Ok(());
        }
        _ => {}
    }

    let config = resolve_config(&cli)?;
    let store = {
        let registry = registry::global()
            .read()
            .map_err(|_| anyhow::anyhow!("backend registry lock poisoned"))?;
        config
            .open_store(&registry)
            .with_context(|| format!("failed to open `{}` backend", config.backend))?
    };
    let service = TiddlerService::new(store);

    let result = run(&service, &cli.command);
    service.store().close().context("failed to close store")?;
    result
}

fn run(service: &TiddlerService, command: &Command) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    match command {
        Command::List => {
            stdout.write_all(&service.list_json()?)?;
            writeln!(stdout)?;
        }
        Command::Get { key } => {
            stdout.write_all(&service.get_json(key)?)?;
            writeln!(stdout)?;
        }
        Command::Put { key, file } => {
            let body = read_body(file.as_ref())?;
            let outcome = service.put_json(key, &body)?;
            writeln!(stdout, "revision={}", outcome.revision)?;
            writeln!(stdout, "etag={}", outcome.etag)?;
        }
        Command::Delete { key } => service.delete(key)?,
        Command::History {
            key,
            revision: Some(revision),
        } => {
            stdout.write_all(&service.history_json(key, *revision)?)?;
            writeln!(stdout)?;
        }
        Command::History {
            key,
            revision: None,
        } => {
            for revision in service.history(key)? {
                writeln!(stdout, "{revision}")?;
            }
        }
        Command::Status => writeln!(stdout, "{}", service.status_json())?,
        Command::Backends | Command::Version => {}
    }
    Ok(())
}

/// Config file first, then command-line overrides.
fn resolve_config(cli: &Cli) -> Result<StoreConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            debug!("event=config_load module=cli status=start");
            StoreConfig::load(path)?
        }
        None => StoreConfig::default(),
    };
    if let Some(backend) = &cli.backend {
        config.backend = backend.clone();
    }
    if let Some(db) = &cli.db {
        config.data_source = db.clone();
    }
    if let Some(rev) = cli.rev {
        config.max_history = rev;
    }
    Ok(config)
}

fn start_logging(cli: &Cli) -> Result<()> {
    let Some(log_dir) = &cli.log_dir else {
        return Ok(());
    };
    let log_dir = if log_dir.is_absolute() {
        log_dir.clone()
    } else {
        std::env::current_dir()?.join(log_dir)
    };
    let level = cli.log_level.as_deref().unwrap_or(default_log_level());
    init_logging(level, &log_dir.to_string_lossy())?;
    Ok(())
}

fn read_body(file: Option<&PathBuf>) -> Result<Vec<u8>> {
    match file {
        Some(path) => {
            std::fs::read(path).with_context(|| format!("failed to read `{}`", path.display()))
        }
        None => {
            let mut body = Vec::new();
            std::io::stdin()
                .read_to_end(&mut body)
                .context("failed to read tiddler from stdin")?;
            Ok(body)
        }
    }
}
