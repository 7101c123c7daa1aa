//! Runtime configuration: CLI flags backed by environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use rowsync_engine::MappingConfig;
use rowsync_store::SyncTable;

use crate::error::{Error, Result};

/// Offline-first row synchronization daemon.
#[derive(Debug, Parser)]
#[command(name = "rowsyncd", version, about)]
pub struct Cli {
   /// Database URL: a postgres:// URL or a SQLite path.
   #[arg(long, env = "SYNC_DATABASE_URL")]
   pub database: String,

   /// Address for the sync HTTP surface.
   #[arg(long, default_value = "127.0.0.1:7341", env = "SYNC_LISTEN_ADDR")]
   pub listen: SocketAddr,

   /// Mapping config file (JSON). Omitted: every table passes through.
   #[arg(long, env = "SYNC_MAPPING_CONFIG")]
   pub mapping_config: Option<PathBuf>,

   /// Table to capture, as `Name` or `Name:excluded1;excluded2`.
   #[arg(long = "table", env = "SYNC_TABLES", value_delimiter = ',')]
   pub tables: Vec<String>,

   /// Remote peer, as `name=http://host:port`. Peers are also picked up
   /// from `{NAME}_API_URL` environment variables.
   #[arg(long = "peer")]
   pub peers: Vec<String>,

   /// Seconds between coordinator pull/push cycles.
   #[arg(long, env = "POLL_INTERVAL_SECONDS", default_value_t = 30)]
   pub poll_interval_seconds: u64,

   /// Maximum entries per sync batch.
   #[arg(long, env = "SYNC_BATCH_LIMIT", default_value_t = 500)]
   pub batch_limit: i64,

   /// Milliseconds between local log tail polls feeding subscribers.
   #[arg(long, env = "SYNC_TAILER_INTERVAL_MS", default_value_t = 500)]
   pub tailer_interval_ms: u64,

   /// Seconds between tombstone-retention pruning passes.
   #[arg(long, env = "SYNC_PRUNE_INTERVAL_SECONDS", default_value_t = 60)]
   pub prune_interval_seconds: u64,
}

/// A configured remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
   pub name: String,
   pub endpoint: String,
}

/// Fully parsed runtime settings.
#[derive(Debug)]
pub struct RuntimeConfig {
   pub database: String,
   pub listen: SocketAddr,
   pub tables: Vec<SyncTable>,
   pub peers: Vec<PeerConfig>,
   pub poll_interval: Duration,
   pub batch_limit: i64,
   pub tailer_interval: Duration,
   pub prune_interval: Duration,
   pub mapping: MappingConfig,
   /// Where the mapping came from, for reload-in-place.
   pub mapping_path: Option<PathBuf>,
}

impl RuntimeConfig {
   pub fn from_cli(cli: Cli) -> Result<Self> {
      let mapping = match &cli.mapping_config {
         Some(path) => MappingConfig::from_file(path)
            .map_err(|e| Error::Config(format!("mapping config {}: {e}", path.display())))?,
         None => MappingConfig::default(),
      };

      let tables = cli
         .tables
         .iter()
         .map(|spec| parse_table(spec))
         .collect::<Result<Vec<_>>>()?;

      let mut peers = cli
         .peers
         .iter()
         .map(|spec| parse_peer(spec))
         .collect::<Result<Vec<_>>>()?;
      for peer in peers_from_env() {
         if !peers.iter().any(|p| p.name == peer.name) {
            peers.push(peer);
         }
      }

      if cli.batch_limit < 1 {
         return Err(Error::Config(format!(
            "batch limit must be positive, got {}",
            cli.batch_limit
         )));
      }

      Ok(Self {
         database: cli.database,
         listen: cli.listen,
         tables,
         peers,
         poll_interval: Duration::from_secs(cli.poll_interval_seconds),
         batch_limit: cli.batch_limit,
         tailer_interval: Duration::from_millis(cli.tailer_interval_ms),
         prune_interval: Duration::from_secs(cli.prune_interval_seconds),
         mapping,
         mapping_path: cli.mapping_config,
      })
   }
}

/// `Name` or `Name:excluded1;excluded2`.
fn parse_table(spec: &str) -> Result<SyncTable> {
   let (name, excludes) = match spec.split_once(':') {
      Some((name, excludes)) => (name, excludes),
      None => (spec, ""),
   };
   if name.is_empty() {
      return Err(Error::Config(format!("invalid table spec '{spec}'")));
   }
   let excluded: Vec<String> = excludes
      .split(';')
      .filter(|c| !c.is_empty())
      .map(str::to_string)
      .collect();
   Ok(SyncTable::new(name).with_excluded(excluded))
}

/// `name=http://host:port`.
fn parse_peer(spec: &str) -> Result<PeerConfig> {
   let Some((name, endpoint)) = spec.split_once('=') else {
      return Err(Error::Config(format!(
         "invalid peer spec '{spec}', expected name=url"
      )));
   };
   if name.is_empty() || !endpoint.starts_with("http") {
      return Err(Error::Config(format!("invalid peer spec '{spec}'")));
   }
   Ok(PeerConfig {
      name: name.to_string(),
      endpoint: endpoint.trim_end_matches('/').to_string(),
   })
}

/// Peers declared as `{NAME}_API_URL=http://…` environment variables.
fn peers_from_env() -> Vec<PeerConfig> {
   std::env::vars()
      .filter_map(|(key, value)| {
         let name = key.strip_suffix("_API_URL")?;
         if name.is_empty() || !value.starts_with("http") {
            return None;
         }
         Some(PeerConfig {
            name: name.to_ascii_lowercase(),
            endpoint: value.trim_end_matches('/').to_string(),
         })
      })
      .collect()
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_parse_table_with_excludes() {
      let table = parse_table("User:PasswordHash;Totp").unwrap();
      assert_eq!(table.name, "User");
      assert_eq!(table.excluded_columns, vec!["PasswordHash", "Totp"]);

      let plain = parse_table("Patient").unwrap();
      assert_eq!(plain.name, "Patient");
      assert!(plain.excluded_columns.is_empty());
   }

   #[test]
   fn test_parse_peer_requires_name_and_http_url() {
      let peer = parse_peer("clinical=http://localhost:8080/").unwrap();
      assert_eq!(peer.name, "clinical");
      assert_eq!(peer.endpoint, "http://localhost:8080");

      assert!(parse_peer("no-url").is_err());
      assert!(parse_peer("=http://x").is_err());
      assert!(parse_peer("name=ftp://x").is_err());
   }
}
