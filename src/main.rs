use idlegate::admin::{AdminServer, PKG_NAME, VERSION};
use idlegate::backend::BackendGroup;
use idlegate::config::{BackendConfig, Config};
use idlegate::docker::DockerDriver;
use idlegate::lifecycle::LifecycleController;
use idlegate::monitor::{ActivitySource, IdleMonitor};
use idlegate::relay::UdpRelay;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Default tracing directive when neither RUST_LOG nor log_level says otherwise
const DEFAULT_LOG_DIRECTIVE: &str = "idlegate=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Configuration comes first so its log level can seed the filter
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("IDLEGATE_CONFIG").ok())
        .map(PathBuf::from);

    let config = Config::load(config_path.as_ref());

    let directive = config
        .as_ref()
        .ok()
        .and_then(|c| c.log_level.clone())
        .unwrap_or_else(|| DEFAULT_LOG_DIRECTIVE.to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(
                directive
                    .parse()
                    .map_err(|e| anyhow::anyhow!("Invalid log level '{}': {}", directive, e))?,
            ),
        )
        .init();

    let config = config.map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;

    match &config_path {
        Some(path) => info!(path = %path.display(), "Configuration loaded"),
        None => info!("No configuration file, using defaults and environment"),
    }
    for warning in config.warnings() {
        warn!("{}", warning);
    }

    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let controller = resolve_backend(&config.backend)
        .await?
        .map(|group| LifecycleController::new(group, config.lifecycle.policy()));

    let relay = UdpRelay::bind(
        &config.proxy,
        controller.as_ref().map(|c| c.traffic_signal()),
    )
    .await?;

    // Admin bind failures abort startup, so bind before spawning anything
    let admin = if config.admin.enabled {
        let admin_addr: SocketAddr = format!("{}:{}", config.admin.bind, config.admin.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid admin bind address: {}", e))?;
        let listener = TcpListener::bind(admin_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind admin API on {}: {}", admin_addr, e))?;

        let admin_token = config.admin.token.clone().unwrap_or_else(|| {
            let token = uuid::Uuid::new_v4().to_string();
            info!(token = %token, "Generated admin API token (configure admin.token to set a fixed value)");
            token
        });

        Some((
            AdminServer::new(
                Arc::clone(&relay),
                controller.clone(),
                shutdown_rx.clone(),
                admin_token,
            ),
            listener,
        ))
    } else {
        info!("Admin API disabled");
        None
    };

    let relay_handle = {
        let relay = Arc::clone(&relay);
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { relay.run(shutdown_rx).await })
    };

    let mut monitor = IdleMonitor::new(
        Arc::clone(&relay) as Arc<dyn ActivitySource>,
        config.proxy.sweep_interval(),
    );
    if let Some(controller) = &controller {
        monitor = monitor.with_controller(controller.clone());
    }
    let monitor_handle = tokio::spawn(monitor.run(shutdown_rx.clone()));

    let controller_handle = controller.clone().map(|controller| {
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { controller.run(shutdown_rx).await })
    });

    let admin_handle = admin.map(|(server, listener)| {
        tokio::spawn(async move {
            if let Err(e) = server.serve(listener).await {
                error!(error = %e, "Admin server error");
            }
        })
    });

    wait_for_shutdown_signal().await?;

    let _ = shutdown_tx.send(true);

    // Wait for tasks to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = relay_handle.await;
        let _ = monitor_handle.await;
        if let Some(handle) = controller_handle {
            let _ = handle.await;
        }
        if let Some(handle) = admin_handle {
            let _ = handle.await;
        }
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

/// Connect to Docker and resolve the managed container or group, if any
async fn resolve_backend(config: &BackendConfig) -> anyhow::Result<Option<BackendGroup>> {
    if !config.enabled() {
        return Ok(None);
    }

    let driver = Arc::new(
        DockerDriver::connect(config.docker_host.as_deref(), config.stop_timeout()).await?,
    );

    let group = match (&config.container, &config.group) {
        (Some(name), _) => driver.resolve_container(name).await?,
        (None, Some(group)) => driver.resolve_group(group).await?,
        (None, None) => return Ok(None),
    };
    Ok(Some(group))
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.map_err(|e| anyhow::anyhow!("Failed to listen for Ctrl+C: {}", e))?;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to listen for Ctrl+C: {}", e))?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting UDP proxy");
    info!(
        listen = %config.proxy.listen_address(),
        target = config.proxy.target_address.as_deref().unwrap_or_default(),
        buffer_size = config.proxy.buffer_size,
        connection_timeout_ms = config.proxy.connection_timeout_ms,
        sweep_interval_ms = config.proxy.sweep_interval_ms,
        "Proxy configuration"
    );
    info!(
        container = config.backend.container.as_deref(),
        group = config.backend.group.as_deref(),
        action = if config.lifecycle.pause { "pause" } else { "stop" },
        shutdown_delay_ms = config.lifecycle.shutdown_delay_ms,
        pause_duration_ms = config.lifecycle.pause_duration_ms,
        "Lifecycle settings"
    );
    info!(
        enabled = config.admin.enabled,
        bind = %config.admin.bind,
        port = config.admin.port,
        "Admin API settings"
    );
}
