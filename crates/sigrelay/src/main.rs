//! # sigrelay
//!
//! Signaling relay binary: loads settings, installs logging and metrics, and
//! serves the relay until ctrl-c.

#![deny(unsafe_code)]

mod logging;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use sigrelay_server::{ServerConfig, SignalServer};
use sigrelay_settings::{SignalSettings, load_settings_from_path, settings_path};
use tracing::info;

/// WebRTC signaling relay server.
#[derive(Parser, Debug)]
#[command(name = "sigrelay", about = "WebRTC signaling relay server", version)]
struct Cli {
    /// Settings file (defaults to `~/.sigrelay/settings.json`).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,
}

impl Cli {
    fn settings_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(settings_path)
    }

    /// Server config from settings, with CLI flags applied last.
    fn server_config(&self, settings: &SignalSettings) -> ServerConfig {
        let mut config = ServerConfig::from(&settings.server);
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    // Settings come first so the configured log level applies from the start.
    let path = args.settings_path();
    let settings = load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    logging::init_subscriber(&settings.logging);

    let metrics = sigrelay_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;

    let config = args.server_config(&settings);
    let server = SignalServer::new(config, metrics);
    let handle = server
        .listen()
        .await
        .with_context(|| format!("Failed to bind {}", server.config().bind_addr()))?;

    info!(
        max_connections = server.config().max_connections,
        heartbeat_interval_secs = server.config().heartbeat_interval_secs,
        "sigrelay listening on ws://{}/ws/{{room_id}}/{{user_id}}",
        handle.addr
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("shutdown signal received");

    server
        .shutdown()
        .graceful_shutdown(vec![handle.into_task()], None)
        .await;
    info!("sigrelay stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_flags_uses_settings() {
        let cli = Cli::try_parse_from(["sigrelay"]).unwrap();
        let config = cli.server_config(&SignalSettings::default());
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 4000);
        assert_eq!(cli.settings_path(), settings_path());
    }

    #[test]
    fn flags_override_settings() {
        let cli = Cli::try_parse_from(["sigrelay", "--host", "127.0.0.1", "--port", "0"]).unwrap();
        let mut settings = SignalSettings::default();
        settings.server.port = 5000;
        let config = cli.server_config(&settings);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 0);
    }

    #[test]
    fn invalid_port_rejected() {
        assert!(Cli::try_parse_from(["sigrelay", "--port", "70000"]).is_err());
    }

    #[test]
    fn config_flag_selects_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.json");
        std::fs::write(
            &path,
            r#"{"server": {"port": 4100, "maxConnections": 8}, "logging": {"format": "json"}}"#,
        )
        .unwrap();

        let cli =
            Cli::try_parse_from(["sigrelay", "--config", path.to_str().unwrap()]).unwrap();
        assert_eq!(cli.settings_path(), path);

        let settings = sigrelay_settings::loader::read_settings_file(&cli.settings_path()).unwrap();
        let config = cli.server_config(&settings);
        assert_eq!(config.port, 4100);
        assert_eq!(config.max_connections, 8);
        assert_eq!(settings.logging.format, sigrelay_settings::LogFormat::Json);
    }
}
