//! tablesync CLI
//!
//! Command-line interface for tablesync - offline table synchronization.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use tablesync_core::{Config, KeyValueStoreType, Store};

mod commands;
mod output;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "tablesync")]
#[command(about = "tablesync - Offline table sync with explicit conflict resolution")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Use this config file instead of the default
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Manage local tables
    Table {
        #[command(subcommand)]
        command: TableCommands,
    },
    /// Manage rows of a table
    Row {
        #[command(subcommand)]
        command: RowCommands,
    },
    /// Synchronize all tables set to sync
    Sync,
    /// List conflicting rows of a table
    Conflicts {
        /// Table ID
        table: String,
    },
    /// Resolve a conflicting row
    Resolve {
        /// Table ID
        table: String,
        /// Row ID
        row: String,
        /// Take one side for every conflicting column
        #[arg(long, value_enum, conflicts_with_all = ["delete"])]
        take: Option<Side>,
        /// Pick a value for a column (key=value), may be repeated
        #[arg(long = "set", value_name = "KEY=VALUE", conflicts_with_all = ["delete"])]
        set: Vec<String>,
        /// Delete the row everywhere
        #[arg(long)]
        delete: bool,
    },
    /// Table properties in the ACTIVE / DEFAULT / SERVER tiers
    Kvs {
        #[command(subcommand)]
        command: KvsCommands,
    },
    /// List server tables available for selection
    Remote,
    /// Store a server credential
    Auth {
        /// Access token
        token: String,
    },
    /// Show status (tables, pending rows, conflicts)
    Status,
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (data_dir, server_path, auth_token, push_attachments, log_file)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[derive(Subcommand)]
enum TableCommands {
    /// Register a new table
    #[command(alias = "create")]
    Add {
        /// Table ID
        table: String,
        /// Display name (defaults to the table ID)
        #[arg(short, long)]
        name: Option<String>,
        /// Column as key[:type], may be repeated
        #[arg(short, long = "column", value_name = "KEY[:TYPE]")]
        columns: Vec<String>,
        /// Include the table in sync runs
        #[arg(long)]
        sync: bool,
    },
    /// List tables
    #[command(alias = "ls")]
    List,
    /// Drop a table with its rows and properties
    #[command(alias = "rm")]
    Drop {
        /// Table ID
        table: String,
    },
    /// Include or exclude a table from sync runs
    Sync {
        /// Table ID
        table: String,
        /// Exclude the table instead
        #[arg(long)]
        off: bool,
    },
}

#[derive(Subcommand)]
enum RowCommands {
    /// Insert a row
    Add {
        /// Table ID
        table: String,
        /// Value as key=value, may be repeated
        #[arg(short, long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
    },
    /// Change values of a row
    Edit {
        /// Table ID
        table: String,
        /// Row ID (full or prefix)
        row: String,
        /// Value as key=value, may be repeated
        #[arg(short, long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
    },
    /// Delete a row
    #[command(alias = "delete")]
    Rm {
        /// Table ID
        table: String,
        /// Row ID (full or prefix)
        row: String,
    },
    /// List rows
    #[command(alias = "ls")]
    List {
        /// Table ID
        table: String,
    },
}

#[derive(Subcommand)]
enum KvsCommands {
    /// Show one tier's entries for a table
    Show {
        /// Table ID
        table: String,
        #[arg(long, value_enum, default_value_t = Tier::Active)]
        tier: Tier,
    },
    /// Set an ACTIVE property
    Set {
        /// Table ID
        table: String,
        partition: String,
        aspect: String,
        key: String,
        value: String,
    },
    /// Copy ACTIVE to DEFAULT if DEFAULT is empty
    Promote { table: String },
    /// Copy DEFAULT to SERVER, to be pushed on the next sync
    PushDefault { table: String },
    /// Merge SERVER into DEFAULT
    Merge { table: String },
    /// Copy DEFAULT to ACTIVE
    Accept { table: String },
    /// Discard ACTIVE edits, going back to DEFAULT
    Revert { table: String },
    /// Make the current ACTIVE settings the DEFAULT
    SetDefault { table: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum Side {
    Local,
    Server,
}

#[derive(Clone, Copy, ValueEnum)]
enum Tier {
    Active,
    Default,
    Server,
}

impl From<Tier> for KeyValueStoreType {
    fn from(tier: Tier) -> Self {
        match tier {
            Tier::Active => KeyValueStoreType::Active,
            Tier::Default => KeyValueStoreType::Default,
            Tier::Server => KeyValueStoreType::Server,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    let config_path = cli.config.as_ref();

    // Config commands work without opening the store
    if let Commands::Config { command } = &cli.command {
        return match command {
            Some(ConfigCommands::Show) | None => commands::config::show(config_path, &output),
            Some(ConfigCommands::Set { key, value }) => {
                commands::config::set(key, value, config_path, &output)
            }
        };
    }

    let config = Config::load_with_cli_override(config_path).context("Failed to load configuration")?;
    init_logging(&config);

    if let Commands::Auth { token } = &cli.command {
        return commands::config::auth(token, config_path, &output);
    }

    let mut store = Store::open_with_config(config)?;

    match cli.command {
        Commands::Config { .. } | Commands::Auth { .. } => unreachable!(), // Handled above
        Commands::Table { command } => handle_table_command(command, &mut store, &output),
        Commands::Row { command } => handle_row_command(command, &mut store, &output),
        Commands::Sync => commands::sync::sync(store, &output).await,
        Commands::Conflicts { table } => commands::conflict::list(&store, &table, &output),
        Commands::Resolve {
            table,
            row,
            take,
            set,
            delete,
        } => {
            let choice = match (delete, take) {
                (true, _) => commands::conflict::Choice::Delete,
                (false, Some(Side::Local)) => commands::conflict::Choice::TakeLocal,
                (false, Some(Side::Server)) => commands::conflict::Choice::TakeServer,
                (false, None) => commands::conflict::Choice::Set(set),
            };
            commands::conflict::resolve(&mut store, &table, &row, choice, &output)
        }
        Commands::Kvs { command } => handle_kvs_command(command, &mut store, &output),
        Commands::Remote => commands::kvs::remote(&mut store, &output),
        Commands::Status => commands::status::show(&store, &output),
    }
}

fn handle_table_command(command: TableCommands, store: &mut Store, output: &Output) -> Result<()> {
    match command {
        TableCommands::Add {
            table,
            name,
            columns,
            sync,
        } => commands::table::add(store, table, name, columns, sync, output),
        TableCommands::List => commands::table::list(store, output),
        TableCommands::Drop { table } => commands::table::drop(store, &table, output),
        TableCommands::Sync { table, off } => commands::table::set_sync(store, &table, !off, output),
    }
}

fn handle_row_command(command: RowCommands, store: &mut Store, output: &Output) -> Result<()> {
    match command {
        RowCommands::Add { table, set } => commands::row::add(store, &table, set, output),
        RowCommands::Edit { table, row, set } => commands::row::edit(store, &table, &row, set, output),
        RowCommands::Rm { table, row } => commands::row::delete(store, &table, &row, output),
        RowCommands::List { table } => commands::row::list(store, &table, output),
    }
}

fn handle_kvs_command(command: KvsCommands, store: &mut Store, output: &Output) -> Result<()> {
    use commands::kvs::Propagation;

    match command {
        KvsCommands::Show { table, tier } => commands::kvs::show(store, &table, tier.into(), output),
        KvsCommands::Set {
            table,
            partition,
            aspect,
            key,
            value,
        } => commands::kvs::set(store, &table, &partition, &aspect, &key, &value, output),
        KvsCommands::Promote { table } => commands::kvs::propagate(store, &table, Propagation::Promote, output),
        KvsCommands::PushDefault { table } => {
            commands::kvs::propagate(store, &table, Propagation::PushDefault, output)
        }
        KvsCommands::Merge { table } => commands::kvs::propagate(store, &table, Propagation::Merge, output),
        KvsCommands::Accept { table } => commands::kvs::propagate(store, &table, Propagation::Accept, output),
        KvsCommands::Revert { table } => commands::kvs::propagate(store, &table, Propagation::Revert, output),
        KvsCommands::SetDefault { table } => {
            commands::kvs::propagate(store, &table, Propagation::SetDefault, output)
        }
    }
}

/// Install the tracing subscriber
///
/// `TABLESYNC_LOG` sets the filter (default `warn`). Logs go to stderr, or to
/// `log_file` when configured.
fn init_logging(config: &Config) {
    let filter = std::env::var("TABLESYNC_LOG").unwrap_or_else(|_| "warn".to_string());
    let env_filter = EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new("warn"));

    let Some(log_path) = &config.log_file else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .try_init();
        return;
    };

    match OpenOptions::new().create(true).append(true).open(log_path) {
        Ok(file) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        Err(e) => {
            eprintln!("Warning: Could not open log file {:?}: {}", log_path, e);
        }
    }
}
