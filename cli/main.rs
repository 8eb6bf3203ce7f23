use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use dropvault::archive::{ArchiveReader, ArchiveSource};
use dropvault::clock::SystemClock;
use dropvault::config::{self, Config};
use dropvault::vault::{NewTransfer, Vault};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// DropVault - archive, seal and expire file transfers
#[derive(Parser)]
#[command(name = "dropvault")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "dropvault.json")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default configuration file and create its directories
    Init {
        /// Durable archive directory
        #[arg(short, long, default_value = "./storage")]
        storage_dir: String,

        /// Temp directory for partial archives and decrypted copies
        #[arg(short, long, default_value = "./tmp")]
        temp_dir: String,

        /// SQLite database path
        #[arg(short, long, default_value = "./dropvault.db")]
        database: String,
    },

    /// Archive and seal files as a new transfer
    Send {
        /// Files to include
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Transfer name (also the default key material)
        #[arg(short, long)]
        name: String,

        /// Hours until the transfer expires; omit for no expiry
        #[arg(short, long)]
        expires_in: Option<i64>,

        /// Recipient email address
        #[arg(long)]
        email: Option<String>,

        /// Download password
        #[arg(short, long)]
        password: Option<String>,
    },

    /// Decrypt a transfer's archive
    Fetch {
        /// Transfer id
        id: String,

        /// Download password, if the transfer has one
        #[arg(short, long)]
        password: Option<String>,

        /// Copy the archive here (defaults to the archive name)
        #[arg(short, long, conflicts_with = "extract")]
        output: Option<PathBuf>,

        /// Unpack the archive's files into this directory instead
        #[arg(short = 'x', long)]
        extract: Option<PathBuf>,
    },

    /// List transfers
    List {
        /// Show files of each transfer
        #[arg(short, long)]
        verbose: bool,
    },

    /// Remove a transfer and its archive
    Remove {
        /// Transfer id
        id: String,

        /// Skip confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Run a retention sweep now
    Sweep {
        /// Sweep stale decrypted copies instead of expired transfers
        #[arg(long)]
        cache: bool,
    },

    /// Run the periodic retention sweeps until interrupted
    Daemon,

    /// Show configuration and storage statistics
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Use RUST_LOG to control log level (e.g., RUST_LOG=dropvault=debug)
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dropvault=info")),
        )
        .with_target(true)
        .with_thread_ids(false)
        .init();

    let cli = Cli::parse();
    // Subcommand args may carry passwords
    info!(config = %cli.config, "DropVault starting");

    match cli.command {
        Commands::Init {
            storage_dir,
            temp_dir,
            database,
        } => cmd_init(&cli.config, storage_dir, temp_dir, database).await,

        Commands::Send {
            files,
            name,
            expires_in,
            email,
            password,
        } => cmd_send(&cli.config, files, name, expires_in, email, password).await,

        Commands::Fetch {
            id,
            password,
            output,
            extract,
        } => cmd_fetch(&cli.config, &id, password, output, extract).await,

        Commands::List { verbose } => cmd_list(&cli.config, verbose).await,

        Commands::Remove { id, yes } => cmd_remove(&cli.config, &id, yes).await,

        Commands::Sweep { cache } => cmd_sweep(&cli.config, cache).await,

        Commands::Daemon => cmd_daemon(&cli.config).await,

        Commands::Status => cmd_status(&cli.config).await,
    }
}

/// Create a styled progress bar for per-file work
fn create_progress_bar(total: u64, message: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );
    pb.set_message(message.to_string());
    Ok(pb)
}

/// Create a spinner for indeterminate operations
fn create_spinner(message: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    Ok(pb)
}

async fn open_vault(config_path: &str) -> Result<(Config, Vault)> {
    let cfg = Config::load_with_env(Some(config_path))?;
    let vault = Vault::open(&cfg, Arc::new(SystemClock))
        .await
        .context("opening vault")?;
    Ok((cfg, vault))
}

/// Write a default config and create the directories it names
async fn cmd_init(
    config_path: &str,
    storage_dir: String,
    temp_dir: String,
    database: String,
) -> Result<()> {
    println!("Initializing DropVault...");

    if fs::try_exists(config_path).await.unwrap_or(false) {
        anyhow::bail!(
            "Configuration file '{}' already exists. Remove it first or use a different path.",
            config_path
        );
    }

    let cfg = Config::new(storage_dir, temp_dir, database);
    cfg.validate()?;

    let vault = Vault::open(&cfg, Arc::new(SystemClock))
        .await
        .context("creating storage directories and database")?;
    drop(vault);

    let config_json = serde_json::to_string_pretty(&cfg)?;
    fs::write(config_path, config_json)
        .await
        .with_context(|| format!("writing config to '{}'", config_path))?;

    println!("Initialization complete!");
    println!("Config:   {}", config_path);
    println!("Storage:  {}", cfg.storage_dir);
    println!("Temp:     {}", cfg.temp_dir);
    println!("Database: {}", cfg.database_path);
    println!("Key from: {}", cfg.encryption.key_source);
    println!();
    println!(
        "Override paths with {}, {} and {}.",
        config::ENV_STORAGE_DIR,
        config::ENV_TEMP_DIR,
        config::ENV_DATABASE
    );

    Ok(())
}

async fn cmd_send(
    config_path: &str,
    files: Vec<PathBuf>,
    name: String,
    expires_in: Option<i64>,
    email: Option<String>,
    password: Option<String>,
) -> Result<()> {
    let (_cfg, vault) = open_vault(config_path).await?;

    let pb = create_progress_bar(files.len() as u64, "Collecting files")?;
    let mut sources = Vec::with_capacity(files.len());
    for path in &files {
        let meta = fs::metadata(path)
            .await
            .with_context(|| format!("reading metadata for {:?}", path))?;
        if !meta.is_file() {
            anyhow::bail!("{:?} is not a regular file", path);
        }
        let dest = path
            .file_name()
            .context("input file has no filename")?
            .to_string_lossy()
            .to_string();
        sources.push(ArchiveSource::new(path, dest, meta.len()));
        pb.inc(1);
    }
    pb.finish_with_message(format!("{} file(s) queued", sources.len()));

    let spinner = create_spinner(&format!("Archiving and sealing '{}'...", name))?;
    let transfer = vault
        .create_transfer(NewTransfer {
            id: None,
            name,
            files: sources,
            expires_at: expires_in.map(|h| Utc::now() + ChronoDuration::hours(h)),
            recipient_email: email,
            password,
        })
        .await?;
    spinner.finish_with_message(format!(
        "Sealed {} bytes ({})",
        transfer.size_bytes,
        if transfer.is_encrypted { "encrypted" } else { "plaintext" }
    ));

    println!("Transfer id: {}", transfer.id);
    println!("Archive:     {}", transfer.archive_name);
    match transfer.expires_at {
        Some(at) => println!("Expires:     {}", at.to_rfc3339()),
        None => println!("Expires:     never"),
    }
    Ok(())
}

async fn cmd_fetch(
    config_path: &str,
    id: &str,
    password: Option<String>,
    output: Option<PathBuf>,
    extract: Option<PathBuf>,
) -> Result<()> {
    let (_cfg, vault) = open_vault(config_path).await?;

    let transfer = vault
        .get_transfer(id)
        .await?
        .with_context(|| format!("transfer '{}' not found", id))?;

    if transfer.password_hash.is_some() && password.is_none() {
        anyhow::bail!("transfer '{}' requires --password", id);
    }

    let spinner = create_spinner(&format!("Decrypting {}...", transfer.archive_name))?;
    let download = vault.open_download(id, password).await?;
    let source = if download.cache_hit { "cached copy" } else { "fresh decrypt" };

    match extract {
        Some(dir) => {
            let entries = ArchiveReader::extract(&download.path, &dir).await?;
            spinner.finish_with_message(format!(
                "Extracted {} file(s) -> {:?} ({})",
                entries.len(),
                dir,
                source
            ));
        }
        None => {
            let out = output.unwrap_or_else(|| PathBuf::from(&transfer.archive_name));
            let bytes = fs::copy(&download.path, &out)
                .await
                .with_context(|| format!("writing to {:?}", out))?;
            spinner.finish_with_message(format!("Wrote {} bytes -> {:?} ({})", bytes, out, source));
        }
    }

    Ok(())
}

async fn cmd_list(config_path: &str, verbose: bool) -> Result<()> {
    let (_cfg, vault) = open_vault(config_path).await?;
    let transfers = vault.list_transfers().await?;

    if transfers.is_empty() {
        println!("No transfers found");
        return Ok(());
    }

    println!("Transfers ({} total):", transfers.len());
    println!();
    println!("{:<36} {:<24} {:>12} {:<25}", "ID", "NAME", "SIZE (bytes)", "EXPIRES");
    println!("{}", "-".repeat(100));

    let now = Utc::now();
    for t in transfers {
        let expires = match t.expires_at {
            Some(_) if t.is_expired(now) => "expired".to_string(),
            Some(at) => at.to_rfc3339(),
            None => "never".to_string(),
        };
        println!("{:<36} {:<24} {:>12} {:<25}", t.id, t.name, t.size_bytes, expires);

        if verbose {
            for f in vault.list_files(&t.id).await? {
                println!("    {} ({} bytes)", f.original_name, f.size_bytes);
            }
        }
    }

    Ok(())
}

async fn cmd_remove(config_path: &str, id: &str, yes: bool) -> Result<()> {
    let (_cfg, vault) = open_vault(config_path).await?;

    let transfer = vault
        .get_transfer(id)
        .await?
        .with_context(|| format!("transfer '{}' not found", id))?;

    // Confirm deletion unless --yes flag is set
    if !yes {
        print!(
            "Delete transfer '{}' ({})? This cannot be undone. [y/N]: ",
            transfer.name, id
        );
        io::stdout().flush()?;

        let mut response = String::new();
        io::stdin().read_line(&mut response)?;

        if !response.trim().eq_ignore_ascii_case("y") {
            println!("Cancelled.");
            return Ok(());
        }
    }

    vault.delete_transfer(id).await?;
    println!("Deleted '{}'", id);

    Ok(())
}

async fn cmd_sweep(config_path: &str, cache: bool) -> Result<()> {
    let (_cfg, vault) = open_vault(config_path).await?;
    let retention = vault.retention();

    if cache {
        let report = retention.run_cache_sweep().await?;
        println!(
            "Removed {} stale decrypted copies ({} failures)",
            report.removed, report.failures
        );
    } else {
        let removed = retention.force_expired_sweep().await?;
        println!("Removed {} expired transfer(s)", removed);
    }

    Ok(())
}

async fn cmd_daemon(config_path: &str) -> Result<()> {
    let (cfg, vault) = open_vault(config_path).await?;
    let handle = Arc::new(vault.retention()).spawn(&cfg.retention);

    println!(
        "Retention running: expired sweep every {}s, cache sweep every {}s. Ctrl-C to stop.",
        cfg.retention.expired_sweep_interval_secs, cfg.retention.cache_sweep_interval_secs
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    handle.shutdown().await;
    println!("Stopped.");

    Ok(())
}

async fn cmd_status(config_path: &str) -> Result<()> {
    let (cfg, vault) = open_vault(config_path).await?;

    println!("DropVault Status");
    println!();

    println!("Configuration:");
    println!("  Config file:   {}", config_path);
    println!("  Storage dir:   {}", cfg.storage_dir);
    println!("  Temp dir:      {}", cfg.temp_dir);
    println!("  Database:      {}", cfg.database_path);
    println!(
        "  Encryption:    {}",
        if cfg.encryption.enabled {
            format!("on (key from {})", cfg.encryption.key_source)
        } else {
            "off".to_string()
        }
    );
    println!("  Cache TTL:     {}s", cfg.retention.cache_ttl_secs);
    println!();

    let transfers = vault.list_transfers().await?;
    let blobs = vault.blobs().list_blobs().await?;
    let cached = vault.cache().entries().await?;

    let now = Utc::now();
    let expired = transfers.iter().filter(|t| t.is_expired(now)).count();
    let total_size: u64 = blobs.iter().map(|(_, size)| size).sum();

    println!("Storage Statistics:");
    println!("  Transfers:         {}", transfers.len());
    println!("  Awaiting sweep:    {}", expired);
    println!("  Sealed blobs:      {}", blobs.len());
    println!(
        "  Total size:        {} bytes ({:.2} MB)",
        total_size,
        total_size as f64 / 1_048_576.0
    );
    println!("  Decrypted copies:  {}", cached.len());

    let orphaned = blobs
        .iter()
        .filter(|(id, _)| !transfers.iter().any(|t| &t.id == id))
        .count();
    if orphaned > 0 {
        println!();
        println!("WARNING: {} blob(s) without a transfer record", orphaned);
    }

    Ok(())
}
