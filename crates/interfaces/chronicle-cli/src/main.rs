use anyhow::Context;
use camino::Utf8PathBuf;
use chronicle_cli::runtime::{default_db_path, load_config};
use chronicle_cli::{commands, parse_instant, Runtime};
use chronicle_core::{TargetId, Timestamp};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Raise log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Engine configuration (JSON)
    #[arg(short, long, global = true, env = "CHRONICLE_CONFIG")]
    config: Option<Utf8PathBuf>,
    /// Database file; defaults to the platform data directory
    #[arg(long, global = true, env = "CHRONICLE_DB")]
    db: Option<Utf8PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the targets whose data is tracked
    Target {
        #[command(subcommand)]
        command: TargetCommands,
    },
    /// Schedule one (target, endpoint) pair
    Schedule {
        target: TargetId,
        endpoint: String,
        /// Epoch millis or RFC 3339; defaults to now
        #[arg(long, value_parser = parse_instant)]
        at: Option<Timestamp>,
    },
    /// Schedule every eligible (target, endpoint) pair
    Bootstrap,
    /// Run due trackers once, or keep polling with --watch
    Run {
        #[arg(long)]
        watch: bool,
    },
    /// List unfinished trackers
    Trackers,
    /// Show finished trackers of one pair, newest first
    History {
        target: TargetId,
        endpoint: String,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Show the records of one kind as they were at a point in time
    Records {
        kind: String,
        target: TargetId,
        /// Epoch millis or RFC 3339; defaults to now
        #[arg(long, value_parser = parse_instant)]
        at: Option<Timestamp>,
    },
}

#[derive(Subcommand)]
enum TargetCommands {
    List,
    Add {
        #[arg(help = "'reference' or 'account:<id>'")]
        id: TargetId,
        #[arg(long, value_delimiter = ',')]
        scopes: Vec<String>,
        #[arg(long, env = "CHRONICLE_TOKEN", hide_env_values = true)]
        token: Option<String>,
        #[arg(long)]
        inactive: bool,
    },
    Remove {
        id: TargetId,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber).context("default subscriber")?;

    let config = load_config(cli.config.as_deref())?;
    let db = match cli.db {
        Some(db) => db,
        None => default_db_path()?,
    };
    let rt = Runtime::open(&db, config)?;

    match cli.command {
        Commands::Target { command } => match command {
            TargetCommands::List => commands::cmd_target_list(&rt)?,
            TargetCommands::Add {
                id,
                scopes,
                token,
                inactive,
            } => {
                commands::cmd_target_add(&rt, id, scopes, token, inactive)?;
            }
            TargetCommands::Remove { id } => {
                commands::cmd_target_remove(&rt, id)?;
            }
        },
        Commands::Schedule {
            target,
            endpoint,
            at,
        } => commands::cmd_schedule(&rt, target, &endpoint, at)?,
        Commands::Bootstrap => {
            commands::cmd_bootstrap(&rt)?;
        }
        Commands::Run { watch } => {
            if watch {
                commands::cmd_watch(&rt).await?;
            } else {
                commands::cmd_run(&rt).await?;
            }
        }
        Commands::Trackers => commands::cmd_trackers(&rt)?,
        Commands::History {
            target,
            endpoint,
            limit,
        } => commands::cmd_history(&rt, target, &endpoint, limit)?,
        Commands::Records { kind, target, at } => {
            commands::cmd_records(&rt, &kind, target, at)?;
        }
    }

    Ok(())
}
