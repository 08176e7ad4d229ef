// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! OpenTTD Master Server
//!
//! A connectionless UDP registry: game servers advertise themselves, game
//! clients discover them, and a JSON API serves the same data to the web.
//!
//! # Usage
//!
//! ```bash
//! # Run the master server with the in-memory registry
//! master-server --app master-server --db memory
//!
//! # Bind public addresses, behind a PROXY-protocol front-end
//! master-server --bind :: --bind 0.0.0.0 --proxy-protocol
//!
//! # Run the updater role, probing registered servers via a SOCKS relay
//! master-server --app updater --socks-url socks5://relay:1080
//! ```

use clap::{Parser, ValueEnum};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

mod app;
mod config;
mod protocol;
mod query;
mod session;
mod socks;
mod storage;
mod udp;
mod web;

use app::master::{spawn_stale_sweeper, MasterApp};
use app::updater::UpdaterApp;
use config::MasterConfig;
use storage::memory::MemoryRegistry;
use storage::Registry;
use udp::{PacketHandler, UdpEndpoint};

/// Which part of the system this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum AppRole {
    /// Registration handling, UDP server list and the web API.
    MasterServer,
    /// Periodic re-query of registered servers.
    Updater,
    /// Web API only, against a shared registry backend.
    WebApi,
}

/// Registry backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DbBackend {
    /// In-memory registry; state is lost on restart.
    Memory,
}

/// OpenTTD Master Server
#[derive(Parser, Debug)]
#[command(name = "master-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// IP addresses to bind (repeatable)
    #[arg(long = "bind", value_name = "IP")]
    bind: Vec<IpAddr>,

    /// UDP port game servers and clients talk to
    #[arg(long, default_value = "3978", value_name = "PORT")]
    server_port: u16,

    /// Port of the web server
    #[arg(long, default_value = "80", value_name = "PORT")]
    web_port: u16,

    /// Application role to run
    #[arg(long, value_enum, default_value_t = AppRole::MasterServer)]
    app: AppRole,

    /// Registry backend
    #[arg(long, value_enum, default_value_t = DbBackend::Memory)]
    db: DbBackend,

    /// Expect a PROXY protocol (v1) header in front of datagrams
    #[arg(long)]
    proxy_protocol: bool,

    /// SOCKS5 relay for outbound probes (socks5://host:port)
    #[arg(long, value_name = "URL")]
    socks_url: Option<String>,

    /// Configuration file (JSON format); CLI flags are ignored if set
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> Result<MasterConfig, config::ConfigError> {
        if let Some(path) = &self.config {
            return MasterConfig::from_file(path);
        }

        let mut config = MasterConfig {
            server_port: self.server_port,
            web_port: self.web_port,
            proxy_protocol: self.proxy_protocol,
            socks_url: self.socks_url,
            ..Default::default()
        };
        if !self.bind.is_empty() {
            config.bind_addresses = self.bind;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let role = args.app;
    let backend = args.db;
    let config = args.into_config()?;
    config.validate()?;

    let registry: Arc<dyn Registry> = match backend {
        DbBackend::Memory => Arc::new(MemoryRegistry::new(config.stale_timeout())),
    };

    info!("+----------------------------------------------------+");
    info!(
        "|       OpenTTD Master Server v{}                 |",
        env!("CARGO_PKG_VERSION")
    );
    info!("+----------------------------------------------------+");
    info!("|  Role:  {:42} |", format!("{:?}", role));
    info!("|  Binds: {:42} |", format_binds(&config.bind_addresses));
    info!("|  UDP:   {:42} |", config.server_port);
    info!("|  Web:   {:42} |", config.web_port);
    info!(
        "|  Proxy: {:42} |",
        if config.proxy_protocol { "enabled" } else { "disabled" }
    );
    info!("+----------------------------------------------------+");

    let shutdown = Arc::new(Notify::new());

    match role {
        AppRole::MasterServer => {
            let app = MasterApp::new(&config, Arc::clone(&registry));
            spawn_endpoints(&config, app, Arc::clone(&shutdown)).await?;
            spawn_web(&config, Arc::clone(&registry)).await?;
            spawn_stale_sweeper(
                Arc::clone(&registry),
                config.sweep_interval(),
                Arc::clone(&shutdown),
            );
        }
        AppRole::Updater => {
            let app = UpdaterApp::new(&config, Arc::clone(&registry));
            let endpoints = spawn_endpoints(&config, Arc::clone(&app), Arc::clone(&shutdown)).await?;
            app.spawn_requery(endpoints, config.requery_interval(), Arc::clone(&shutdown));
        }
        AppRole::WebApi => {
            spawn_web(&config, Arc::clone(&registry)).await?;
        }
    }

    // Handle shutdown signals
    tokio::signal::ctrl_c().await.ok();
    info!("Shutdown signal received, stopping server...");
    shutdown.notify_waiters();

    info!("Master server stopped");
    Ok(())
}

fn format_binds(addrs: &[IpAddr]) -> String {
    let formatted: Vec<String> = addrs.iter().map(|a| a.to_string()).collect();
    formatted.join(", ")
}

/// Bind one UDP endpoint per configured address and start its receive loop.
async fn spawn_endpoints<H: PacketHandler>(
    config: &MasterConfig,
    handler: Arc<H>,
    shutdown: Arc<Notify>,
) -> std::io::Result<Vec<Arc<UdpEndpoint>>> {
    let mut endpoints = Vec::with_capacity(config.bind_addresses.len());
    for &addr in &config.bind_addresses {
        let endpoint = UdpEndpoint::bind(
            addr,
            config.server_port,
            config.proxy_protocol,
            config.socks_url.clone(),
        )
        .await?;
        tokio::spawn(
            Arc::clone(&endpoint).run(Arc::clone(&handler), Arc::clone(&shutdown)),
        );
        endpoints.push(endpoint);
    }
    Ok(endpoints)
}

/// Bind one HTTP listener per configured address.
async fn spawn_web(config: &MasterConfig, registry: Arc<dyn Registry>) -> std::io::Result<()> {
    let router = web::build_router(registry);
    for &addr in &config.bind_addresses {
        let listener =
            tokio::net::TcpListener::bind(SocketAddr::new(addr, config.web_port)).await?;
        info!("listening on http://{}", listener.local_addr()?);
        let router = router.clone();
        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, router).await {
                tracing::error!("web server error: {}", err);
            }
        });
    }
    Ok(())
}
