//! storesync command-line host.
//!
//! Drives the version-control engine for one data directory: bootstrap,
//! commit, inspect changes and history, and sync with the remote. Commands
//! that return data print JSON on stdout; logs go to stderr.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use storesync_core::config::VcConfig;
use storesync_core::git::remote_url;
use storesync_core::{VcError, VersionControl};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// storesync command-line host.
#[derive(Parser, Debug)]
#[command(
    name = "storesync",
    version,
    about = "Git-backed version control for a document store's data directory"
)]
struct Cli {
    /// Path to the TOML configuration file
    /// [default: <config dir>/storesync/config.toml].
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error). Defaults to the config's
    /// `logging.level`, or `warn` when no config is read.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a default configuration file.
    ConfigInit {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./storesync.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file.
    Validate,

    /// Create, clone or reopen the repository for the data directory.
    Init,

    /// Commit everything in the data directory.
    Commit {
        /// Commit message.
        #[arg(short, long)]
        message: String,
    },

    /// Replace the working tree with a commit's tree (HEAD does not move).
    Checkout {
        /// Full or abbreviated commit id.
        id: String,
    },

    /// Discard all uncommitted changes.
    Revert,

    /// List uncommitted changes.
    Changes,

    /// List commits reachable from HEAD, newest first.
    History,

    /// Show the changes introduced by a commit.
    Diff {
        /// Full or abbreviated commit id.
        id: String,
    },

    /// Fetch and list what the remote has that HEAD lacks.
    Status,

    /// Show whether HEAD is ahead of, behind, or diverged from the remote.
    SyncState,

    /// Merge the remote branch into HEAD.
    Merge,

    /// Push the current branch to the remote.
    Push,

    /// List commits not yet pushed, oldest first.
    LocalCommits {
        /// Branch to compare against its remote-tracking ref.
        #[arg(long)]
        branch: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<VcError>() {
                Some(vc) => eprintln!("Error ({}): {:#}", vc.kind(), e),
                None => eprintln!("Error: {:#}", e),
            }
            ExitCode::FAILURE
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    match cli.command {
        Commands::ConfigInit { output } => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"));
            cmd_config_init(&output)
        }
        Commands::Validate => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"));
            cmd_validate(&config_path)
        }
        command => {
            let config = VcConfig::load_and_validate(&config_path)
                .with_context(|| format!("failed to load configuration from {}", config_path.display()))?;
            init_logging(cli.log_level.as_deref().unwrap_or(&config.logging.level));
            debug!(data_dir = %config.store.data_dir.display(), "configuration loaded");
            let vc = VersionControl::new(&config)?;
            dispatch(&vc, command).await
        }
    }
}

async fn dispatch(vc: &VersionControl, command: Commands) -> Result<()> {
    match command {
        Commands::Init => {
            let plan = vc.init().await?;
            println!("Repository ready at {} ({:?})", vc.data_dir().display(), plan);
        }
        Commands::Commit { message } => print_json(&vc.commit(message).await?)?,
        Commands::Checkout { id } => {
            vc.checkout(id.clone()).await?;
            println!("Working tree replaced with {id}");
        }
        Commands::Revert => {
            vc.revert().await?;
            println!("Working tree reset to HEAD");
        }
        Commands::Changes => print_json(&vc.local_changes().await?)?,
        Commands::History => print_json(&vc.history().await?)?,
        Commands::Diff { id } => print_json(&vc.diff(id).await?)?,
        Commands::Status => print_json(&vc.status().await?)?,
        Commands::SyncState => print_json(&vc.sync_state().await?)?,
        Commands::Merge => print_json(&vc.merge().await?)?,
        Commands::Push => {
            vc.push().await?;
            println!("Pushed");
        }
        Commands::LocalCommits { branch } => print_json(&vc.local_commits(branch).await?)?,
        Commands::ConfigInit { .. } | Commands::Validate => {
            anyhow::bail!("command does not operate on a repository")
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    println!("{json}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("storesync").join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("./storesync.toml"))
}

fn cmd_config_init(output: &Path) -> Result<()> {
    let default_config = r#"# storesync configuration

[store]
data_dir = "/var/lib/docstore/data"
# Extra patterns excluded from every commit, on top of the built-in
# .tran/**, fs.lock, settings, storage/** and *.tmp.
ignore = []

# Omit this section to keep history local only.
[remote]
url = "https://git.example.com/acme/store.git"
branch = "master"
allow_push = true
# username = "git"

[identity]
name = "storesync"
email = "storesync@localhost"

[network]
timeout_secs = 60

[logging]
level = "info"
"#;

    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).context("failed to create config directory")?;
    }
    std::fs::write(output, default_config).context("failed to write config file")?;

    println!("Default configuration written to {}", output.display());
    println!();
    println!("Next steps:");
    println!("  1. Set store.data_dir and the remote url (or remove [remote])");
    println!("  2. Keep credentials out of the file with STORESYNC_REMOTE_URL if needed");
    println!(
        "  3. Validate with: storesync validate --config {}",
        output.display()
    );
    println!("  4. Bootstrap with: storesync init --config {}", output.display());

    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let mut config = VcConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  [OK] TOML structure is valid");

    config.apply_env_overrides();
    println!("  [OK] Environment overrides applied");

    match config.validate() {
        Ok(()) => println!("  [OK] All required fields are valid"),
        Err(e) => {
            println!("  [FAIL] Validation error: {}", e);
            anyhow::bail!("configuration validation failed");
        }
    }

    println!();
    println!("Configuration summary:");
    println!("  Data directory: {}", config.store.data_dir.display());
    println!("  Extra ignores : {}", config.store.ignore.len());
    match &config.remote {
        Some(remote) => {
            println!("  Remote URL    : {}", remote_url::redact(&remote.url));
            println!("  Branch        : {}", remote.branch);
            println!("  Push allowed  : {}", remote.allow_push);
        }
        None => println!("  Remote        : none (local history only)"),
    }
    println!(
        "  Identity      : {} <{}>",
        config.identity.name, config.identity.email
    );
    println!("  Timeout       : {}s", config.network.timeout_secs);
    println!();
    println!("Configuration is valid.");

    Ok(())
}
