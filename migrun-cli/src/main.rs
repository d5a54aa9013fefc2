//! Command line front end for migrun.
//!
//! Applies a single migration script to a PostgreSQL schema, inspects or forces
//! the recorded version, or previews how a script will be split.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use migrun::multistmt::{self, SplitConfig};
use migrun::postgres::{Config, PostgresDriver};
use migrun::{Driver, Migrator};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "migrun", version, about = "Run PostgreSQL migration scripts")]
struct CliArgs {
    /// Connection string of the target database
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Name of the version table
    #[arg(long, default_value = "schema_migrations", global = true)]
    migrations_table: String,

    /// Schema to migrate instead of the connection's current schema
    #[arg(long, global = true)]
    schema_name: Option<String>,

    /// Session statement timeout in milliseconds
    #[arg(long, global = true)]
    statement_timeout_ms: Option<u64>,

    /// Replace <SCHEMA_NAME> in scripts with the target schema
    #[arg(long, global = true)]
    replace_schema_placeholder: bool,

    /// Log splitter progress at TRACE level
    #[arg(long, global = true)]
    trace_splitter: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply a migration script as the given version
    Apply {
        version: i64,
        file: PathBuf,
    },
    /// Show the recorded version
    Version,
    /// Record a clean version without running anything
    Force {
        #[arg(allow_negative_numbers = true)]
        version: i64,
    },
    /// Print the statements a script splits into (no database required)
    Split {
        file: PathBuf,
    },
}

impl CliArgs {
    fn driver_config(&self) -> Config {
        let mut config = Config::default()
            .with_migrations_table(self.migrations_table.clone())
            .with_schema_placeholder(self.replace_schema_placeholder)
            .with_trace(self.trace_splitter);
        if let Some(schema) = &self.schema_name {
            config = config.with_schema_name(schema.clone());
        }
        if let Some(ms) = self.statement_timeout_ms {
            config = config.with_statement_timeout(Duration::from_millis(ms));
        }
        config
    }

    /// Splitter settings for `split`, which has no connection to resolve the schema from.
    fn split_config(&self) -> Result<SplitConfig, Box<dyn std::error::Error>> {
        let config = SplitConfig::default().with_trace(self.trace_splitter);
        if !self.replace_schema_placeholder {
            return Ok(config);
        }
        let schema = self
            .schema_name
            .as_deref()
            .ok_or("--replace-schema-placeholder needs --schema-name when splitting without a database.")?;
        Ok(config.with_replacement(schema))
    }

    fn open_driver(&self) -> Result<PostgresDriver, Box<dyn std::error::Error>> {
        let url = self
            .database_url
            .as_deref()
            .ok_or("No database given. Pass --database-url or set DATABASE_URL.")?;
        Ok(PostgresDriver::open(url, self.driver_config())?)
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    match &args.command {
        Commands::Split { file } => {
            let config = args.split_config()?;
            tracing::debug!(file = %file.display(), "Splitting migration script");
            let reader = BufReader::new(File::open(file)?);
            let mut count = 0;
            multistmt::split(reader, &config, |statement| {
                count += 1;
                println!("-- statement {}", count);
                println!("{}", statement.trim());
                Ok(())
            })?;
            println!("-- {} statement(s)", count);
        }
        Commands::Apply { version, file } => {
            let mut script = BufReader::new(File::open(file)?);
            let mut driver = args.open_driver()?;
            tracing::info!(
                file = %file.display(),
                schema = %driver.schema_name(),
                "Applying migration script"
            );
            let result = Migrator::new().apply(&mut driver, *version, &mut script);
            Box::new(driver).close()?;
            result?;
            println!("Applied version {}", version);
        }
        Commands::Version => {
            let mut driver = args.open_driver()?;
            let version = Migrator::new().status(&mut driver)?;
            Box::new(driver).close()?;
            println!("{}", version);
        }
        Commands::Force { version } => {
            let mut driver = args.open_driver()?;
            Migrator::new().force(&mut driver, *version)?;
            Box::new(driver).close()?;
            println!("Forced version {}", version);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_placeholder_requires_schema() {
        let args = CliArgs::try_parse_from(["migrun", "split", "--replace-schema-placeholder", "up.sql"]).unwrap();
        let err = args.split_config().unwrap_err();
        assert!(err.to_string().contains("--schema-name"));

        let args = CliArgs::try_parse_from([
            "migrun",
            "split",
            "--replace-schema-placeholder",
            "--schema-name",
            "tenant_a",
            "up.sql",
        ])
        .unwrap();
        assert_eq!(args.split_config().unwrap().replacement.as_deref(), Some("tenant_a"));
    }

    #[test]
    fn split_without_placeholder_needs_nothing() {
        let args = CliArgs::try_parse_from(["migrun", "split", "up.sql"]).unwrap();
        assert_eq!(args.split_config().unwrap(), SplitConfig::default());
    }
}
