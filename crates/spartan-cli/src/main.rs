//! Spartan Command-Line Client
//!
//! Runs schema migrations for a Spartan application database.

mod commands;
mod formatter;

use clap::{Parser, Subcommand};
use formatter::OutputFormat;
use spartan_migrate::{DirectorySource, MigrateConfig, MigrationError, Migrator, SqliteBackend};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Log filter used when `RUST_LOG` is unset.
const DEFAULT_LOG_FILTER: &str = "spartan=info";

/// Spartan Command-Line Client
#[derive(Parser, Debug)]
#[command(name = "spartan")]
#[command(version, about = "Spartan schema migrations", long_about = None)]
pub struct Args {
    /// SQLite database file (defaults to ./database/{DB_NAME}.db)
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,

    /// Directory of migration units
    #[arg(long, global = true)]
    pub migrations: Option<PathBuf>,

    /// Name of the migration ledger table
    #[arg(long, global = true)]
    pub table: Option<String>,

    /// How long to wait on a locked database, in milliseconds
    #[arg(long, global = true)]
    pub busy_timeout_ms: Option<u64>,

    /// Output format
    #[arg(long, global = true, default_value = "table", value_enum)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

/// Top-level command groups.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Manage schema migrations
    #[command(subcommand)]
    Migrate(MigrateCommand),
}

/// `migrate` subcommands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum MigrateCommand {
    /// Create the migration ledger if it does not exist
    Init,

    /// Apply pending migrations
    Upgrade {
        /// Stop after applying this migration
        #[arg(long)]
        target: Option<String>,
    },

    /// Revert applied migrations, most recent first
    Rollback {
        /// Number of migrations to revert (default 1)
        #[arg(long, conflicts_with = "to")]
        steps: Option<usize>,

        /// Revert every migration after this one
        #[arg(long)]
        to: Option<String>,
    },

    /// Show applied, pending and drifted migrations
    Status,
}

impl Args {
    /// Apply command-line overrides on top of an environment-derived config.
    pub fn into_config(self, base: MigrateConfig) -> Result<MigrateConfig, MigrationError> {
        let mut config = base;
        if let Some(path) = self.database {
            config = config.with_database_path(path);
        }
        if let Some(dir) = self.migrations {
            config = config.with_migrations_dir(dir);
        }
        if let Some(table) = self.table {
            config = config.with_table_name(table);
        }
        if let Some(ms) = self.busy_timeout_ms {
            config = config.with_busy_timeout(Duration::from_millis(ms));
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let args = Args::parse();

    match run(args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Run the parsed command. Returns whether it fully succeeded.
fn run(args: Args) -> Result<bool, Box<dyn std::error::Error>> {
    let format = args.format;
    let Command::Migrate(command) = args.command.clone();
    let config = args.into_config(MigrateConfig::from_env()?)?;

    tracing::debug!(
        database = %config.database_path.display(),
        migrations = %config.migrations_dir.display(),
        table = %config.table_name,
        "configuration loaded"
    );

    let backend = SqliteBackend::open(&config)?;
    let source = DirectorySource::new(config.migrations_dir.clone());
    let migrator = Migrator::new(&backend, &source);
    let formatter = formatter::create_formatter(format);

    let output = commands::execute(&migrator, &command, &*formatter)?;
    if !output.output.is_empty() {
        println!("{}", output.output);
    }

    match output.failure {
        Some(failure) => {
            eprintln!("Error: {}", failure);
            Ok(false)
        }
        None => Ok(true),
    }
}
