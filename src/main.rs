use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use gatehouse::{
    adapters::{
        FileConfigProvider, HttpClientAdapter, HttpConfigProvider, HttpHandler, HttpLogSink,
        TracingLogSink, router,
    },
    config::{GatewayConfig, LogSinkKind, ServerConfigValidator},
    core::GatewayService,
    metrics,
    ports::{config_provider::ConfigProvider, log_sink::LogSink},
    tracing_setup,
    utils::{GracefulShutdown, ShutdownReason},
};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

/// Quiet period after a change notification before the config is reloaded.
const RELOAD_DEBOUNCE: Duration = Duration::from_secs(2);
/// How often fully refilled rate-limit buckets are dropped.
const RATE_LIMIT_PURGE_INTERVAL: Duration = Duration::from_secs(60);
/// Upper bound on flushing queued analytics records at exit.
const LOG_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    /// Configuration file, or an http(s) URL serving JSON
    #[clap(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Start the gateway server (default)
    Serve {
        /// Configuration file, or an http(s) URL serving JSON
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
}

fn create_config_provider(config_path: &str) -> Result<Arc<dyn ConfigProvider>> {
    if config_path.starts_with("http://") || config_path.starts_with("https://") {
        Ok(Arc::new(HttpConfigProvider::new(
            config_path.to_string(),
            Duration::from_secs(10),
        )?))
    } else {
        Ok(Arc::new(FileConfigProvider::new(config_path)?))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Init { config }) => init_config_command(&config).await,
        Some(Commands::Serve { config }) => serve(&config).await,
        None => serve(&args.config).await,
    }
}

async fn serve(config_path: &str) -> Result<()> {
    let provider = create_config_provider(config_path)?;
    let config = provider
        .load_config()
        .await
        .wrap_err_with(|| format!("Failed to load configuration from {config_path}"))?;
    ServerConfigValidator::validate(&config)
        .map_err(|e| eyre!("Invalid configuration in {config_path}: {e}"))?;

    tracing_setup::init_tracing(&config.logging)?;
    metrics::init_metrics()?;

    let connect_timeout = config
        .timeouts
        .connect_duration()
        .wrap_err("Invalid connect timeout")?;
    let client = Arc::new(HttpClientAdapter::new(connect_timeout)?);

    let (sink, shipper): (Arc<dyn LogSink>, Option<JoinHandle<()>>) = match config.log_sink.kind {
        LogSinkKind::Tracing => (Arc::new(TracingLogSink) as Arc<dyn LogSink>, None),
        LogSinkKind::Http => {
            let (sink, handle) = HttpLogSink::spawn(&config.log_sink)?;
            (Arc::new(sink) as Arc<dyn LogSink>, Some(handle))
        }
    };

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .wrap_err("Failed to parse listen address")?;
    let gateway = Arc::new(GatewayService::new(config, client, sink)?);

    let shutdown = GracefulShutdown::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = shutdown.run_signal_handler().await {
                tracing::error!("Signal handler failed: {:?}", e);
            }
        });
    }

    let updates = provider.watch()?;
    let watcher = tokio::spawn(watch_config(
        provider,
        updates,
        gateway.clone(),
        shutdown.token(),
    ));
    let purger = tokio::spawn(purge_rate_limits(gateway.clone(), shutdown.token()));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err("Failed to bind to address")?;
    tracing::info!("Gatehouse API gateway listening on {}", addr);
    println!("Gatehouse API gateway listening on {addr}");

    let app = router(HttpHandler::new(gateway));
    let graceful = shutdown.clone();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let reason = graceful.wait_for_shutdown_signal().await;
        tracing::info!("Shutdown signal received: {:?}", reason);
    });

    let drain = shutdown.clone();
    let server_result = tokio::select! {
        result = server => result.wrap_err("Server error"),
        _ = async {
            drain.wait_for_shutdown_signal().await;
            tokio::time::sleep(drain.drain_timeout()).await;
        } => {
            tracing::warn!(
                "In-flight requests still running after {:?}, forcing shutdown",
                drain.drain_timeout()
            );
            drain.trigger_shutdown(ShutdownReason::Force);
            Ok(())
        }
    };

    shutdown.trigger_shutdown(ShutdownReason::Graceful);
    for task in [watcher, purger] {
        if let Err(e) = task.await {
            tracing::warn!("Background task ended abnormally: {}", e);
        }
    }

    // The shipper drains once the last gateway handle, and with it the
    // sink sender, is gone.
    if let Some(shipper) = shipper {
        match tokio::time::timeout(LOG_FLUSH_TIMEOUT, shipper).await {
            Ok(Ok(())) => tracing::info!("Analytics records flushed"),
            Ok(Err(e)) => tracing::warn!("Log shipper ended abnormally: {}", e),
            Err(_) => tracing::warn!("Timed out flushing analytics records"),
        }
    }

    tracing::info!("Graceful shutdown completed");
    server_result
}

/// Reload the snapshot whenever the provider signals a change. Signals that
/// arrive during the debounce window collapse into one reload.
async fn watch_config(
    provider: Arc<dyn ConfigProvider>,
    mut updates: mpsc::Receiver<()>,
    gateway: Arc<GatewayService>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            received = updates.recv() => if received.is_none() {
                tracing::warn!("Config change channel closed, hot reload disabled");
                return;
            },
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(RELOAD_DEBOUNCE) => {}
        }
        while updates.try_recv().is_ok() {}

        if let Err(e) = reload(provider.as_ref(), &gateway).await {
            tracing::error!("Configuration reload failed, keeping current snapshot: {:?}", e);
        }
    }
}

async fn reload(provider: &dyn ConfigProvider, gateway: &GatewayService) -> Result<()> {
    let config = provider.load_config().await?;
    ServerConfigValidator::validate(&config).map_err(|e| eyre!("Invalid configuration: {e}"))?;
    gateway.reload(config)
}

async fn purge_rate_limits(gateway: Arc<GatewayService>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(RATE_LIMIT_PURGE_INTERVAL);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => gateway.purge_rate_limits(),
        }
    }
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    use gatehouse::config::loader::load_config;

    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config: GatewayConfig = match load_config(config_path).await {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e:?}");
            std::process::exit(1);
        }
    };

    match ServerConfigValidator::validate(&config) {
        Ok(()) => {
            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!("   • Listen Address: {}", config.listen_addr);
            println!("   • APIs: {}", config.apis.len());
            println!("   • API Users: {}", config.api_users.len());
            println!("   • Admin Backend: {}", config.admin.is_some());
            println!("   • Response Cache: {}", config.cache.enabled);
            println!("   • Log Sink: {:?}", config.log_sink.kind);
            println!();
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Verify listen address format (e.g., '127.0.0.1:9080')");
            println!("   • Ensure timeouts and rate limit periods use valid units (ms, s, m, h)");
            println!("   • Check that every API has at least one server and URL match");
            println!("   • Write trusted proxies and geoip ranges as IPs or CIDRs");
            std::process::exit(1);
        }
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let default_config = r#"# Gatehouse API Gateway Configuration

listen_addr = "127.0.0.1:9080"
# Port used when redirecting /admin requests to HTTPS.
https_port = 9081
# Proxies allowed to set X-Forwarded-For / X-Forwarded-Proto.
trusted_proxies = ["127.0.0.1"]

[timeouts]
connect = "10s"
response = "60s"

[limits]
max_request_line = 8192
max_request_body = 10485760

[cache]
enabled = true
max_entries = 10000

# Default quota per API key (or per client IP for keyless APIs).
[rate_limit]
requests = 1000
period = "1h"

[logging]
level = "info"
json = true
include_spans = false

# Analytics records: "tracing" logs them, "http" posts NDJSON batches to url.
[log_sink]
kind = "tracing"
# url = "http://127.0.0.1:9200/_bulk"

[[api_users]]
api_key = "CHANGE-ME"
id = "user-1"
email = "user@example.com"

[[apis]]
name = "example"
frontend_host = "*"
backend_host = "example.com"
backend_protocol = "http"
servers = [{ host = "127.0.0.1", port = 3000 }]
url_matches = [{ frontend_prefix = "/example/", backend_prefix = "/" }]

[apis.settings]
disable_api_key = false
headers = """
X-Example: gatehouse
"""
"#;

    tokio::fs::write(path, default_config)
        .await
        .wrap_err("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");
    println!("   Run 'gatehouse serve --config {config_path}' to start the server");
    Ok(())
}
