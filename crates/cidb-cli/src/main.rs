//! `cidb` command-line tool.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "cidb")]
#[command(about = "Continuous-integration database tool", long_about = None)]
struct Cli {
    /// KDL configuration file
    #[arg(long, env = "CIDB_CONFIG")]
    config: Option<PathBuf>,

    /// Directory with host.txt, user.txt and friends
    #[arg(long, env = "CIDB_CREDENTIALS_DIR")]
    credentials_dir: Option<PathBuf>,

    /// Database name, overriding the configuration file
    #[arg(long)]
    database: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending schema migrations
    Migrate {
        /// Stop at this schema version
        #[arg(long)]
        target: Option<i64>,
        /// Read migration scripts from this directory instead of the built-in set
        #[arg(long)]
        migrations_dir: Option<PathBuf>,
    },
    /// Print the current schema version
    SchemaVersion,
    /// Recent builds of a config, newest first
    History {
        /// Build config name
        build_config: String,
        #[arg(long, default_value = "10")]
        limit: i64,
        #[arg(long)]
        waterfall: Option<String>,
        #[arg(long)]
        milestone: Option<String>,
        #[arg(long)]
        platform_version: Option<String>,
    },
    /// Slave builds of a master
    Slaves {
        master_id: i64,
        /// Only these slaves; may be repeated. Without it all slaves are
        /// listed, so an empty filter cannot be expressed here.
        #[arg(long = "buildbucket-id")]
        buildbucket_ids: Vec<String>,
    },
    /// Seconds left before a build's deadline
    Deadline { build_id: i64 },
    /// Push a build's deadline back
    ExtendDeadline { build_id: i64, seconds: u64 },
    /// Dump the key/value table
    Keyvals,
    /// Record a simulated master build with parallel slaves
    Simulate {
        #[arg(long, default_value = "5")]
        slaves: usize,
        /// Concurrent workers; defaults to the configured value
        #[arg(long)]
        workers: Option<usize>,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = commands::load_config(
        cli.config.as_deref(),
        cli.credentials_dir,
        cli.database,
    )?;

    match cli.command {
        Commands::Migrate {
            target,
            migrations_dir,
        } => {
            commands::migrate::run(config, target, migrations_dir).await?;
        }
        Commands::SchemaVersion => {
            commands::migrate::schema_version(&config).await?;
        }
        Commands::History {
            build_config,
            limit,
            waterfall,
            milestone,
            platform_version,
        } => {
            let filters = commands::query::HistoryFilters {
                limit,
                waterfall,
                milestone,
                platform_version,
            };
            commands::query::history(&config, &build_config, filters).await?;
        }
        Commands::Slaves {
            master_id,
            buildbucket_ids,
        } => {
            commands::query::slaves(&config, master_id, buildbucket_ids).await?;
        }
        Commands::Deadline { build_id } => {
            commands::query::deadline(&config, build_id).await?;
        }
        Commands::ExtendDeadline { build_id, seconds } => {
            commands::query::extend_deadline(&config, build_id, seconds).await?;
        }
        Commands::Keyvals => {
            commands::query::keyvals(&config).await?;
        }
        Commands::Simulate { slaves, workers } => {
            commands::simulate::run(&config, slaves, workers).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_slaves_with_repeated_ids() {
        let cli = Cli::try_parse_from([
            "cidb",
            "--database",
            "cidb_test",
            "slaves",
            "42",
            "--buildbucket-id",
            "a",
            "--buildbucket-id",
            "b",
        ])
        .unwrap();
        assert_eq!(cli.database.as_deref(), Some("cidb_test"));
        match cli.command {
            Commands::Slaves {
                master_id,
                buildbucket_ids,
            } => {
                assert_eq!(master_id, 42);
                assert_eq!(buildbucket_ids, ["a", "b"]);
            }
            _ => panic!("expected slaves"),
        }
    }

    #[test]
    fn test_slaves_without_ids_lists_all() {
        let cli = Cli::try_parse_from(["cidb", "slaves", "42"]).unwrap();
        match cli.command {
            Commands::Slaves {
                buildbucket_ids, ..
            } => assert!(buildbucket_ids.is_empty()),
            _ => panic!("expected slaves"),
        }

        let command = Cli::command();
        let slaves = command.find_subcommand("slaves").unwrap();
        let flag = slaves
            .get_arguments()
            .find(|arg| arg.get_id() == "buildbucket_ids")
            .unwrap();
        let help = flag.get_long_help().or(flag.get_help()).unwrap().to_string();
        assert!(help.contains("all slaves are"));
    }

    #[test]
    fn test_parse_migrate_target() {
        let cli = Cli::try_parse_from(["cidb", "migrate", "--target", "7"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Migrate {
                target: Some(7),
                migrations_dir: None
            }
        ));
    }
}
