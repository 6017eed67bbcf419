//! Hearth: live-query subscription cache
//!
//! Main binary with subcommands:
//! - `worker`: serve an in-memory store over stdin/stdout for a bridge client
//! - `key`: print the canonical cache key of a path and constraints
//! - `demo`: run the multiplexing scenario against an in-memory store

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use hearth_bridge::{ConstraintParams, Target};
use hearth_cache::{CacheConfig, QueryInvalidation, TeardownDelay};
use hearth_core::CacheKey;
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod demo;
mod worker;

#[derive(Parser)]
#[command(name = "hearth")]
#[command(about = "Live-query subscription cache", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve a store over stdin/stdout as line-delimited JSON
    Worker {
        /// JSON file of `{ "collection/doc": { fields } }` to seed the store
        #[arg(long, env = "HEARTH_SEED")]
        seed: Option<PathBuf>,
    },

    /// Print the cache key for a path and constraints
    Key {
        /// Document or collection path
        path: String,

        /// Constraints as a JSON array of `{ "type": ..., "payload": [...] }`
        #[arg(long)]
        constraints: Option<String>,

        /// Query every collection with this id instead of `path`
        #[arg(long)]
        group: Option<String>,
    },

    /// Run the flights scenario and narrate the cache's behavior
    Demo {
        /// Cache configuration file (JSON)
        #[arg(long, env = "HEARTH_CONFIG")]
        config: Option<PathBuf>,

        /// Teardown delay: milliseconds, `immediate`, or `never`
        #[arg(long, env = "HEARTH_TEARDOWN")]
        teardown: Option<TeardownDelay>,

        /// Which query keys a write invalidates
        #[arg(long, value_parser = parse_invalidation)]
        invalidate_queries: Option<QueryInvalidation>,
    },
}

fn parse_invalidation(s: &str) -> Result<QueryInvalidation, String> {
    match s.to_lowercase().as_str() {
        "none" => Ok(QueryInvalidation::None),
        "same-collection" | "collection" => Ok(QueryInvalidation::SameCollection),
        "all" => Ok(QueryInvalidation::All),
        _ => Err(format!(
            "invalid policy '{}', expected none, same-collection or all",
            s
        )),
    }
}

/// Build the handle the same way a worker would and return its key.
fn key_for(path: String, constraints: Option<&str>, group: Option<String>) -> Result<CacheKey> {
    let constraints: Vec<ConstraintParams> = match constraints {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| miette::miette!("invalid constraints: {}", e))?,
        None => Vec::new(),
    };
    let target = Target {
        path,
        collection_group: group,
        constraints,
    };
    let handle = target.to_handle().map_err(|e| miette::miette!("{}", e))?;
    Ok(handle.key())
}

async fn load_config(path: Option<&PathBuf>) -> Result<CacheConfig> {
    let Some(path) = path else {
        return Ok(CacheConfig::default());
    };
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| miette::miette!("failed to read {}: {}", path.display(), e))?;
    serde_json::from_str(&raw)
        .map_err(|e| miette::miette!("invalid config {}: {}", path.display(), e))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries the worker protocol.
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "hearth=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Worker { seed } => worker::run(seed.as_deref()).await,

        Commands::Key {
            path,
            constraints,
            group,
        } => {
            let key = key_for(path, constraints.as_deref(), group)?;
            println!("{}", key);
            Ok(())
        }

        Commands::Demo {
            config,
            teardown,
            invalidate_queries,
        } => {
            let mut config = load_config(config.as_ref()).await?;
            if let Some(teardown) = teardown {
                config = config.with_teardown(teardown);
            }
            if let Some(policy) = invalidate_queries {
                config = config.with_query_invalidation(policy);
            }
            demo::run(config).await
        }
    }
}
