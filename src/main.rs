use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use rowsync::{Cli, Node, RuntimeConfig, error::exit};

#[tokio::main]
async fn main() -> ExitCode {
   tracing_subscriber::fmt()
      .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
      .init();

   let cli = Cli::parse();
   let config = match RuntimeConfig::from_cli(cli) {
      Ok(config) => config,
      Err(e) => {
         error!(error = %e, "invalid configuration");
         return ExitCode::from(exit::CONFIG);
      }
   };

   let mapping_path = config.mapping_path.clone();
   let node = match Node::start(config).await {
      Ok(node) => node,
      Err(e) => {
         error!(error = %e, "startup failed");
         return ExitCode::from(e.exit_code());
      }
   };

   #[cfg(unix)]
   if let Some(path) = mapping_path {
      // SIGHUP reloads the mapping config in place.
      let state = node.state.clone();
      tokio::spawn(async move {
         let Ok(mut hup) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
         else {
            return;
         };
         while hup.recv().await.is_some() {
            match rowsync_engine::MappingConfig::from_file(&path) {
               Ok(config) => {
                  state.swap_mapping(config);
                  info!(path = %path.display(), "mapping config reloaded");
               }
               Err(e) => error!(error = %e, "mapping config reload failed"),
            }
         }
      });
   }

   if let Err(e) = tokio::signal::ctrl_c().await {
      error!(error = %e, "signal handler failed");
   }
   info!("shutting down");

   let diagnostics = node.state.diagnostics.clone();
   node.shutdown().await;

   if diagnostics.has_unresolved().await {
      error!("unresolved sync dependencies remain; operator attention required");
      return ExitCode::from(exit::UNRESOLVED);
   }
   ExitCode::from(exit::OK)
}
