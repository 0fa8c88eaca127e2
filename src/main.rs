use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vaultjwt::config::default_config_path;
use vaultjwt::{SecretStore, Vault, VaultConfig};

#[derive(Parser, Debug)]
#[command(name = "vaultjwt")]
#[command(about = "Read and manage Vault KV v2 secrets with an OIDC client login")]
struct Cli {
    /// Path to vaultjwt config file.
    #[arg(short, long, default_value_os_t = default_config_path())]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List keys at the root of the engine
    List,
    /// Print a secret's data
    Read {
        key: String,
        /// Read a specific version instead of the latest
        #[arg(long)]
        version: Option<u64>,
    },
    /// Write a JSON object as a new version
    Write { key: String, json: String },
    /// Soft-delete the latest version
    Delete { key: String },
    /// Restore soft-deleted versions
    Undelete {
        key: String,
        #[arg(required = true)]
        versions: Vec<u64>,
    },
    /// Permanently destroy versions
    Destroy {
        key: String,
        #[arg(required = true)]
        versions: Vec<u64>,
    },
    /// Permanently remove a key and all of its versions
    Purge { key: String },
    /// Print metadata of the latest version
    Metadata { key: String },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(secrets: &SecretStore, command: Command) -> Result<()> {
    match command {
        Command::List => print_json(&secrets.list_keys().await?)?,
        Command::Read { key, version } => match version {
            Some(version) => print_json(&secrets.read_version(&key, version).await?)?,
            None => print_json(&secrets.read_record(&key).await?)?,
        },
        Command::Write { key, json } => {
            let data = match serde_json::from_str::<Value>(&json)
                .context("Secret value is not valid JSON")?
            {
                Value::Object(data) => data,
                _ => bail!("Secret value must be a JSON object"),
            };
            print_json(&secrets.write(&key, &data).await?)?;
        }
        Command::Delete { key } => {
            secrets.delete(&key).await?;
            print_json(&status("deleted", &key))?;
        }
        Command::Undelete { key, versions } => {
            secrets.undelete(&key, &versions).await?;
            print_json(&status("undeleted", &key))?;
        }
        Command::Destroy { key, versions } => {
            secrets.destroy_versions(&key, &versions).await?;
            print_json(&status("destroyed", &key))?;
        }
        Command::Purge { key } => {
            secrets.purge(&key).await?;
            print_json(&status("purged", &key))?;
        }
        Command::Metadata { key } => print_json(&secrets.get_metadata(&key).await?)?,
    }
    Ok(())
}

fn status(action: &str, key: &str) -> Map<String, Value> {
    let mut out = Map::new();
    out.insert("status".to_string(), Value::from(action));
    out.insert("key".to_string(), Value::from(key));
    out
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_level(true)
                .json(),
        )
        .init();

    let cli = Cli::parse();
    let config = VaultConfig::load(&cli.config)?;

    let cancel = CancellationToken::new();
    let vault = Vault::connect(&config, &cancel)
        .await
        .context("Failed to connect to vault")?;

    let result = tokio::select! {
        result = run(vault.secrets(), cli.command) => result,
        _ = tokio::signal::ctrl_c() => Ok(()),
    };

    vault.shutdown().await;
    result
}
