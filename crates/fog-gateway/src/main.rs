//! Fog gateway entry point.
//!
//! Wires the store, the device adapters, the control loop, the TLS acceptor
//! and the admin shell together, then runs until Ctrl-C or `exit`.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ load config (file, then CLI/env overrides)
//!  └─ MemoryStore::seeded(...)
//!  └─ InterfaceManager::start_known()   -- one adapter task per platform
//!  └─ ControlLoop::run                  -- admin commands + device routing
//!  └─ run_acceptor                      -- TLS listener, one task per connection
//!  └─ run_shell                         -- stdin admin console (optional)
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fog_core::{MemoryStore, Store};
use fog_gateway::application::admin_shell::{run_shell, AdminShell};
use fog_gateway::application::control_loop::{control_channel, ControlLoop};
use fog_gateway::application::interfaces::InterfaceManager;
use fog_gateway::infrastructure::adapters::ConfiguredAdapterFactory;
use fog_gateway::infrastructure::network::acceptor::{run_acceptor, AcceptorContext};
use fog_gateway::infrastructure::network::session::SessionContext;
use fog_gateway::infrastructure::network::tls::{self, TlsDialer};
use fog_gateway::infrastructure::storage::config::{load_config, save_config, GatewayConfig};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Fog-layer IoT gateway.
///
/// Brokers links between devices on different access networks and relays
/// their traffic once linked.  Flags override the configuration file.
#[derive(Debug, Parser)]
#[command(name = "fog-gateway", version)]
struct Cli {
    /// Configuration file (TOML).  Missing file means built-in defaults.
    #[arg(long, default_value = "fog-gateway.toml", env = "FOG_CONFIG")]
    config: PathBuf,

    /// `host:port` for the TLS listener.
    #[arg(long, env = "FOG_LISTEN")]
    listen: Option<String>,

    /// Gateway certificate chain (PEM).
    #[arg(long, env = "FOG_CERT")]
    cert: Option<PathBuf>,

    /// Gateway private key (PEM).
    #[arg(long, env = "FOG_KEY")]
    key: Option<PathBuf>,

    /// CA bundle platform certificates must chain to (PEM).
    #[arg(long, env = "FOG_CA_CERT")]
    ca_cert: Option<PathBuf>,

    /// LoRaWAN network server downlink endpoint.
    #[arg(long, env = "FOG_LORAWAN_NETWORK_SERVER")]
    lorawan_network_server: Option<String>,

    /// UDP bind address of the 6LoWPAN border-router socket.
    #[arg(long, env = "FOG_SIXLOWPAN_BIND")]
    sixlowpan_bind: Option<SocketAddr>,

    /// Do not read admin commands from stdin.
    #[arg(long)]
    no_shell: bool,

    /// Write the effective configuration to `--config` and exit.
    #[arg(long)]
    init_config: bool,
}

impl Cli {
    fn apply_overrides(&self, config: &mut GatewayConfig) {
        if let Some(listen) = &self.listen {
            config.gateway.listen_address = listen.clone();
        }
        if let Some(cert) = &self.cert {
            config.tls.cert = cert.clone();
        }
        if let Some(key) = &self.key {
            config.tls.key = key.clone();
        }
        if let Some(ca_cert) = &self.ca_cert {
            config.tls.ca_cert = ca_cert.clone();
        }
        if let Some(server) = &self.lorawan_network_server {
            config.adapters.lorawan.network_server = server.clone();
        }
        if let Some(bind) = self.sixlowpan_bind {
            config.adapters.sixlowpan.bind = bind;
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

/// Grace period for blocking tasks when the runtime is dropped.  The stdin
/// reader behind the admin shell is one and cannot be cancelled.
const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    cli.apply_overrides(&mut config);

    // `RUST_LOG` wins over the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.gateway.log_level)),
        )
        .init();

    if cli.init_config {
        save_config(&cli.config, &config)
            .with_context(|| format!("writing {}", cli.config.display()))?;
        info!("configuration written to {}", cli.config.display());
        return Ok(());
    }

    let runtime = tokio::runtime::Runtime::new().context("starting the Tokio runtime")?;
    let result = runtime.block_on(run(config, !cli.no_shell));
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);
    result
}

async fn run(config: GatewayConfig, with_shell: bool) -> anyhow::Result<()> {
    info!("fog gateway starting on {}", config.gateway.listen_address);
    let server_tls = tls::server_config(&config.tls).context("building TLS server config")?;
    let client_tls = tls::client_config(&config.tls).context("building TLS client config")?;
    let shutdown = CancellationToken::new();

    // ── Store and interfaces ──────────────────────────────────────────────────
    let store: Arc<dyn Store> = Arc::new(
        MemoryStore::seeded(&config.seed.platforms, &config.seed.nodes)
            .context("seeding the store")?,
    );
    let (inbound_tx, inbound_rx) = mpsc::channel(config.gateway.inbound_queue_capacity);
    let mut interfaces = InterfaceManager::new(
        Arc::new(ConfiguredAdapterFactory::new(config.adapters.clone())),
        Arc::clone(&store),
        inbound_tx,
        shutdown.clone(),
    );
    let started = interfaces.start_known()?;
    info!("{started} interface(s) started");

    // ── Control loop ──────────────────────────────────────────────────────────
    let (control, commands) = control_channel(
        config.gateway.command_queue_capacity,
        config.gateway.command_timeout(),
    );
    let control_task = tokio::spawn(
        ControlLoop::new(interfaces, Arc::clone(&store), commands, inbound_rx, shutdown.clone()).run(),
    );

    // ── TLS acceptor ──────────────────────────────────────────────────────────
    let ctx = Arc::new(AcceptorContext {
        control: control.clone(),
        session: SessionContext {
            store: Arc::clone(&store),
            dialer: Arc::new(TlsDialer::new(client_tls, config.gateway.dial_timeout())),
            timeout: config.gateway.session_timeout(),
            shutdown: shutdown.clone(),
        },
        handshake_timeout: config.gateway.handshake_timeout(),
    });
    let listener = TcpListener::bind(&config.gateway.listen_address)
        .await
        .with_context(|| format!("binding {}", config.gateway.listen_address))?;
    let acceptor_task = tokio::spawn(run_acceptor(
        listener,
        TlsAcceptor::from(server_tls),
        ctx,
        shutdown.clone(),
    ));

    // ── Ctrl-C ────────────────────────────────────────────────────────────────
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Ctrl-C received, shutting down");
                    shutdown.cancel();
                }
                Err(e) => error!("failed to listen for Ctrl-C: {e}"),
            }
        }
    });

    // ── Admin shell ───────────────────────────────────────────────────────────
    if with_shell {
        let shell = AdminShell::new(control, Arc::clone(&store));
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let stdin = BufReader::new(tokio::io::stdin());
            if let Err(e) = run_shell(&shell, stdin, tokio::io::stdout(), shutdown).await {
                error!("admin shell stopped: {e}");
            }
        });
    }

    info!("fog gateway ready");
    shutdown.cancelled().await;

    acceptor_task.await.context("acceptor task panicked")??;
    control_task.await.context("control loop panicked")?;
    info!("fog gateway stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
