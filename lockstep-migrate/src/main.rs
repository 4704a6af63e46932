//! Lockstep Migration CLI Tool
//!
//! Command-line interface for managing database migrations, meant to run as a
//! container entrypoint step or from CI/CD pipelines. The process exit code
//! tells a supervisor whether a retry can help:
//!
//! - `0` success, including a run with nothing to do
//! - `1` store, connection or configuration failure
//! - `2` broken migration source
//! - `3` failed migration or ledger drift
//! - `4` ledger assertion
//! - `75` lock contention, safe to retry

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use lockstep::config::LockstepConfig;
use lockstep::connection::redact_connection_string;
use lockstep::migration::error::{EXIT_STORE, EXIT_SUCCESS};
use lockstep::migration::{startup_migrations, StartupPolicy};
use lockstep::{MigrateError, Migrator, PgStore};
use lockstep_migrate::generate::generate_migration;
use lockstep_migrate::output;
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "lockstep-migrate")]
#[command(about = "Migration management tool for Lockstep")]
#[command(version = "0.1.0")]
struct Cli {
    /// Configuration file (default: config/lockstep.toml if present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Database connection URL
    #[arg(long)]
    database_url: Option<String>,

    /// Migrations directory path
    #[arg(long)]
    migrations_dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Quiet output (errors only)
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show migration status (applied vs pending)
    Status {
        /// Print the status as JSON
        #[arg(long)]
        json: bool,
    },

    /// Apply pending migrations
    Up {
        /// Number of migrations to apply (default: all pending)
        #[arg(long)]
        steps: Option<usize>,

        /// Dry run - show what would be executed without running
        #[arg(long)]
        dry_run: bool,

        /// Fail immediately on lock timeout instead of retrying
        #[arg(long)]
        no_retry: bool,
    },

    /// Revert applied migrations, newest first
    Down {
        /// Number of migrations to revert (default: 1)
        #[arg(long, default_value = "1")]
        steps: usize,

        /// Revert exactly this migration, which must be the latest applied
        #[arg(long, conflicts_with = "steps")]
        identifier: Option<String>,

        /// Dry run - show what would be reverted
        #[arg(long)]
        dry_run: bool,
    },

    /// Check the migration source and the ledger against each other
    Validate,

    /// Generate a new migration file
    Generate {
        /// Migration name (e.g., "create_users_table")
        name: String,
    },

    /// Show detailed migration information
    Info {
        /// Show information for a specific migration
        #[arg(long)]
        identifier: Option<String>,
    },
}

fn main() {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let default_filter = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let code = match run(&cli) {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = e.downcast_ref::<MigrateError>().map_or(EXIT_STORE, MigrateError::exit_code);
            eprintln!("Error: {e:#}");
            code
        }
    };
    process::exit(code);
}

fn load_config(cli: &Cli) -> anyhow::Result<LockstepConfig> {
    let mut config = match &cli.config {
        Some(path) => LockstepConfig::load_from(path, true),
        None => LockstepConfig::load(),
    }
    .context("Failed to load configuration")?;

    if let Some(url) = &cli.database_url {
        config.database.url.clone_from(url);
    }
    if let Some(dir) = &cli.migrations_dir {
        config.migrations.dir.clone_from(dir);
    }
    Ok(config)
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let config = load_config(cli)?;

    if let Commands::Generate { name } = &cli.command {
        return handle_generate(&config, name);
    }

    log::debug!(
        "Connecting to {}",
        redact_connection_string(&config.database.url)
    );
    let migrator = lockstep::postgres_migrator(&config)?;

    match &cli.command {
        Commands::Status { json } => handle_status(&migrator, *json),
        Commands::Up {
            steps,
            dry_run,
            no_retry,
        } => handle_up(&migrator, &config, *steps, *dry_run, *no_retry),
        Commands::Down {
            steps,
            identifier,
            dry_run,
        } => handle_down(&migrator, *steps, identifier.as_deref(), *dry_run),
        Commands::Validate => handle_validate(&migrator),
        Commands::Info { identifier } => handle_info(&migrator, &config, identifier.as_deref()),
        Commands::Generate { .. } => Ok(()),
    }
}

fn handle_status(migrator: &Migrator<PgStore, PgStore>, json: bool) -> anyhow::Result<()> {
    let status = migrator.status()?;
    if json {
        println!("{}", output::status_json(&status)?);
    } else {
        print!("{}", output::status_text(&status));
    }
    Ok(())
}

fn handle_up(
    migrator: &Migrator<PgStore, PgStore>,
    config: &LockstepConfig,
    steps: Option<usize>,
    dry_run: bool,
    no_retry: bool,
) -> anyhow::Result<()> {
    if dry_run {
        print!("{}", output::plan_text("apply", &migrator.plan(steps)?));
        return Ok(());
    }

    let report = if steps.is_some() || no_retry {
        migrator.up(steps)?
    } else {
        startup_migrations(migrator, &StartupPolicy::from(&config.migrations))?
    };

    if report.is_noop() {
        println!("No migrations to apply ({} already applied)", report.already_applied);
    } else {
        for applied in &report.applied {
            println!("Applied {} ({}ms)", applied.identifier, applied.elapsed.as_millis());
        }
        println!("Successfully applied {} migration(s)", report.applied.len());
    }
    Ok(())
}

fn handle_down(
    migrator: &Migrator<PgStore, PgStore>,
    steps: usize,
    identifier: Option<&str>,
    dry_run: bool,
) -> anyhow::Result<()> {
    if dry_run {
        let plan = match identifier {
            Some(identifier) => {
                let info = migrator.info(identifier)?;
                if info.is_head {
                    vec![info.record]
                } else {
                    anyhow::bail!("migration '{identifier}' is not the latest applied migration");
                }
            }
            None => migrator.plan_down(steps)?,
        };
        print!("{}", output::plan_text("revert", &plan));
        return Ok(());
    }

    let report = match identifier {
        Some(identifier) => migrator.revert(identifier)?,
        None => migrator.down(steps)?,
    };

    if report.reverted.is_empty() {
        println!("No migrations to revert");
    } else {
        for reverted in &report.reverted {
            println!("Reverted {} ({}ms)", reverted.identifier, reverted.elapsed.as_millis());
        }
        println!(
            "Successfully reverted {} migration(s), {} remain applied",
            report.reverted.len(),
            report.remaining
        );
    }
    Ok(())
}

fn handle_validate(migrator: &Migrator<PgStore, PgStore>) -> anyhow::Result<()> {
    let applied = migrator.validate()?;
    println!("Migration source and ledger agree ({applied} applied)");
    Ok(())
}

fn handle_generate(config: &LockstepConfig, name: &str) -> anyhow::Result<()> {
    let generated = generate_migration(&config.migrations.dir, name, Utc::now())?;
    println!("Generated migration: {}", generated.path.display());
    match &generated.parent {
        Some(parent) => println!("   Parent: {parent}"),
        None => println!("   Parent: none (first migration)"),
    }
    println!("   Edit the file to fill in the up and down sections");
    Ok(())
}

fn handle_info(
    migrator: &Migrator<PgStore, PgStore>,
    config: &LockstepConfig,
    identifier: Option<&str>,
) -> anyhow::Result<()> {
    if let Some(identifier) = identifier {
        print!("{}", output::info_text(&migrator.info(identifier)?));
        return Ok(());
    }

    let status = migrator.status()?;
    println!("\nMigration System Information\n");
    println!("Database: {}", redact_connection_string(&config.database.url));
    println!("Migrations Directory: {}", config.migrations.dir.display());
    println!("Ledger Table: {}", config.migrations.ledger_table);
    println!("Lock Table: {}", config.migrations.lock_table);
    println!("Total Migrations: {}", status.total);
    println!("Applied: {}", status.applied_count);
    println!("Pending: {}", status.pending_count);

    if let Some(latest) = status.latest_applied() {
        println!("Latest Applied: {}", latest.identifier);
    }
    if let Some(next) = status.next_pending() {
        println!("Next Pending: {}", next.identifier());
    }

    match migrator
        .coordinator()
        .holder(&config.migrations.lock_name)
        .map_err(MigrateError::from)?
    {
        Some(holder) if !holder.is_expired() => println!(
            "Lock: held by {} until {}",
            holder.owner,
            holder.expires_at.format("%Y-%m-%d %H:%M:%S UTC")
        ),
        Some(holder) => println!("Lock: free (stale lease from {})", holder.owner),
        None => println!("Lock: free"),
    }

    Ok(())
}
