use mcwake::admin::{AdminServer, PKG_NAME, VERSION};
use mcwake::config::Config;
use mcwake::container::ContainerController;
use mcwake::docker::DockerRuntime;
use mcwake::protocol::TextComponent;
use mcwake::proxy::{Gateway, GatewayServer};
use mcwake::status::{sync_from_backend, ListingProvider, ServerListing};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let explicit_path = std::env::args().nth(1).map(PathBuf::from);
    let config_path = explicit_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let mut config = Config::load_or_default(&config_path, explicit_path.is_none())
        .map_err(|e| anyhow::anyhow!("Failed to load configuration from {}: {}", config_path.display(), e))?;
    config.apply_env_overrides(|key| std::env::var(key).ok())?;

    // Initialize logging
    let directive = if config.server.debug { "mcwake=debug" } else { "mcwake=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(directive.parse().expect("valid log directive")),
        )
        .init();

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Docker is required; nothing works without it
    let runtime = DockerRuntime::new(config.backend.docker_host.as_deref())
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to create Docker client");
            e
        })?;
    let controller = Arc::new(ContainerController::new(
        Arc::new(runtime),
        config.backend.container_name.clone(),
    ));

    launch_container(&controller, config.backend.start_on_launch).await;

    let favicon = config.status.favicon_data_uri().unwrap_or_else(|e| {
        warn!(error = %e, "Ignoring server icon");
        None
    });
    let listing: Arc<dyn ListingProvider> = Arc::new(ServerListing::new(
        &config.status.name,
        config.status.protocol_version,
        &TextComponent::plain(config.status.motd.clone()),
        favicon,
    ));

    // Bind before spawning so a taken port aborts startup
    let listener = TcpListener::bind(&config.server.listen).await.map_err(|e| {
        error!(addr = %config.server.listen, error = %e, "Failed to bind listener");
        anyhow::anyhow!("Failed to bind {}: {}", config.server.listen, e)
    })?;

    let gateway = Gateway::new(
        config.backend.endpoint.clone(),
        Arc::clone(&controller),
        Arc::clone(&listing),
    )
    .with_dial_timeout(config.backend.dial_timeout());
    let gateway_server = GatewayServer::new(gateway, shutdown_rx.clone());
    let gateway_handle = tokio::spawn(async move {
        if let Err(e) = gateway_server.serve(listener).await {
            error!(error = %e, "Gateway server error");
        }
    });

    let admin_handle = if config.server.debug_endpoint_enabled() {
        let admin_addr: SocketAddr = config.server.debug_listen.parse().map_err(|e| {
            error!(addr = %config.server.debug_listen, error = %e, "Invalid debug endpoint address");
            anyhow::anyhow!("Invalid debug endpoint address: {}", e)
        })?;
        let admin_server = AdminServer::new(
            admin_addr,
            Arc::clone(&controller),
            Arc::clone(&listing),
            shutdown_rx.clone(),
        );
        Some(tokio::spawn(async move {
            if let Err(e) = admin_server.run().await {
                error!(error = %e, "Debug endpoint error");
            }
        }))
    } else {
        None
    };

    // Show the real server's details once it answers
    if controller.is_running() {
        let listing = Arc::clone(&listing);
        let endpoint = config.backend.endpoint.clone();
        let timeout = config.backend.dial_timeout();
        let (host, port) = config.backend.host_and_port()?;
        tokio::spawn(async move {
            if let Err(e) = sync_from_backend(listing.as_ref(), &endpoint, &host, port, timeout).await {
                warn!(error = %e, "Keeping configured server listing");
            }
        });
    }

    wait_for_signal().await;

    let _ = shutdown_tx.send(true);

    // Wait for servers to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = gateway_handle.await;
        if let Some(handle) = admin_handle {
            let _ = handle.await;
        }
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

/// Look the container up once and start it if asked to
async fn launch_container(controller: &ContainerController, start_on_launch: bool) {
    let exists = match controller.refresh().await {
        Ok(exists) => exists,
        Err(e) => {
            warn!(container = %controller.name(), error = %e, "Failed to look up container");
            return;
        }
    };

    if !exists {
        warn!(container = %controller.name(), "Container does not exist yet");
        return;
    }

    if start_on_launch && !controller.is_running() {
        if let Err(e) = controller.start().await {
            error!(container = %controller.name(), error = %e, "Failed to start container");
        }
    }

    info!(container = %controller.name(), state = %controller.state(), "Container state");
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        listen = %config.server.listen,
        debug_listen = if config.server.debug_endpoint_enabled() {
            Some(config.server.debug_listen.as_str())
        } else {
            None
        },
        debug = config.server.debug,
        "Server configuration"
    );
    info!(
        endpoint = %config.backend.endpoint,
        container = %config.backend.container_name,
        docker_host = config.backend.docker_host.as_deref(),
        dial_timeout_secs = config.backend.dial_timeout_secs,
        start_on_launch = config.backend.start_on_launch,
        "Backend configuration"
    );
    info!(
        name = %config.status.name,
        protocol = config.status.protocol_version,
        motd = %config.status.motd,
        favicon = config.status.favicon.as_deref(),
        "Status listing"
    );
}
