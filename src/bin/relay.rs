use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use sharp_turn::{init_logging, ServerConfig, TurnServer, UserConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "SHARP TURN relay server", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address (overrides the configuration file)
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Address relay sockets bind to
    #[arg(long)]
    relay_ip: Option<IpAddr>,

    /// Address advertised to clients as the relayed address
    #[arg(long)]
    external_ip: Option<IpAddr>,

    /// Authentication realm
    #[arg(long)]
    realm: Option<String>,

    /// Static user as name:password, repeatable
    #[arg(short, long = "user", value_name = "NAME:PASSWORD")]
    users: Vec<String>,

    /// First relay port
    #[arg(long)]
    min_port: Option<u16>,

    /// Last relay port
    #[arg(long)]
    max_port: Option<u16>,

    /// Log level (overridden by RUST_LOG)
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => ServerConfig::default(),
        };

        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(relay_ip) = self.relay_ip {
            config.relay_ip = relay_ip;
        }
        if let Some(external_ip) = self.external_ip {
            config.external_ip = Some(external_ip);
        }
        if let Some(realm) = self.realm {
            config.realm = realm;
        }
        if let Some(min_port) = self.min_port {
            config.min_port = min_port;
        }
        if let Some(max_port) = self.max_port {
            config.max_port = max_port;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        for user in &self.users {
            let Some((username, password)) = user.split_once(':') else {
                bail!("--user expects NAME:PASSWORD, got {:?}", user);
            };
            config.users.push(UserConfig {
                username: username.to_string(),
                password: password.to_string(),
            });
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Args::parse().into_config()?;
    init_logging(&config.log_level);

    if config.users.is_empty() {
        tracing::warn!("No users configured; every authenticated request will be rejected");
    }

    let server = TurnServer::bind(config).await.context("starting TURN server")?;

    let signals = server.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        signals.shutdown();
    });

    server.run().await?;

    let stats = serde_json::to_string(&server.stats())?;
    tracing::info!("Final statistics: {}", stats);
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("Cannot install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
