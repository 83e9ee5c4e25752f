use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use opentelemetry::global as otel_global;
use opentelemetry::trace::TracerProvider as _;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::prelude::*;

use homedash::config::{Config, StorageBackend};
use homedash::monitor::ServiceMonitor;
use homedash::store::{MemorySnapshotStore, SnapshotStore, SqliteSnapshotStore, StaticServiceSource};
use homedash::vault::CredentialVault;
use homedash::{api, metrics};

#[derive(Parser)]
#[command(name = "homedash")]
#[command(about = "Homelab service liveness and resource dashboard")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to the TOML configuration file
    #[arg(long, default_value = "config/homedash.toml")]
    config: String,
    /// Host interface to bind (overrides server.host)
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on (overrides server.port)
    #[arg(long)]
    port: Option<u16>,
    /// Print an example configuration and exit
    #[arg(long)]
    print_default_config: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Encrypt a credential value with the configured vault key
    Encrypt {
        value: String,
    },
    /// Run a single cycle and print the JSON report
    Check {
        #[arg(value_enum)]
        kind: CheckKind,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum CheckKind {
    Health,
    Metrics,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.print_default_config {
        println!("{}", Config::example_toml());
        return Ok(());
    }

    init_tracing()?;

    let mut config = Config::load(&cli.config).await?;
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    match cli.command {
        Some(Commands::Encrypt { value }) => {
            let vault = CredentialVault::new(&config.vault.encryption_key)
                .context("vault.encryption_key must be set to encrypt credentials")?;
            println!("{}", vault.encrypt(&value)?);
            return Ok(());
        }
        Some(Commands::Check { kind }) => {
            let store: Arc<dyn SnapshotStore> = Arc::new(MemorySnapshotStore::new(config.storage.memory_history_limit));
            let source = Arc::new(StaticServiceSource::new(config.services.clone()));
            let monitor = ServiceMonitor::new(config, source, store)?.into_handle();
            let json = match kind {
                CheckKind::Health => serde_json::to_string_pretty(&monitor.check_all_health().await)?,
                CheckKind::Metrics => serde_json::to_string_pretty(&monitor.check_all_metrics().await)?,
            };
            println!("{json}");
            return Ok(());
        }
        None => {}
    }

    info!("🚀 Starting homedash");
    info!("📊 Monitoring {} services", config.services.iter().filter(|s| s.enabled).count());

    metrics::start_uptime_tracking();
    info!("📈 Prometheus metrics initialized");

    let store = open_store(&config).await?;
    let source = Arc::new(StaticServiceSource::new(config.services.clone()));
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let polling_enabled = config.polling.enabled;
    let monitor = ServiceMonitor::new(config, source, store)?.into_handle();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pollers = if polling_enabled {
        monitor.spawn_polling(shutdown_rx)
    } else {
        info!("background polling disabled, serving on-demand checks only");
        Vec::new()
    };

    let app = api::router(monitor.clone());
    let listener = TcpListener::bind(&addr).await?;
    info!("🌐 homedash listening on http://{}", addr);
    info!("📈 Prometheus metrics: http://{}/metrics", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // let running cycles finish before releasing the store
    let _ = shutdown_tx.send(true);
    for task in pollers {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "poll task ended abnormally");
        }
    }
    monitor.close().await;
    info!("shutdown complete");
    Ok(())
}

async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn SnapshotStore>> {
    Ok(match config.storage.backend {
        StorageBackend::Memory => Arc::new(MemorySnapshotStore::new(config.storage.memory_history_limit)),
        StorageBackend::Sqlite => Arc::new(SqliteSnapshotStore::open(&config.storage.database_path).await?),
    })
}

fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::{fmt, EnvFilter, Registry};
    let json = matches!(std::env::var("HOMEDASH_JSON_LOG").as_deref(), Ok("1") | Ok("true"));
    let otlp_endpoint = std::env::var("HOMEDASH_OTEL_ENDPOINT").ok();
    let service_name = std::env::var("HOMEDASH_SERVICE_NAME").unwrap_or_else(|_| "homedash".into());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let base = Registry::default().with(filter);
    let fmt_layer = if json {
        fmt::layer().compact().with_target(false).boxed()
    } else {
        fmt::layer().boxed()
    };

    if let Some(endpoint) = otlp_endpoint {
        use opentelemetry::KeyValue;
        use opentelemetry_otlp::WithExportConfig;
        use opentelemetry_sdk::{trace as sdktrace, Resource};

        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(endpoint)
            .build()?;
        let resource = Resource::builder_empty()
            .with_attribute(KeyValue::new("service.name", service_name))
            .build();
        let mut builder = sdktrace::SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(resource);

        if let Some(ratio) = std::env::var("HOMEDASH_TRACE_SAMPLE_RATIO")
            .ok()
            .and_then(|r| r.parse::<f64>().ok())
        {
            builder = builder.with_sampler(sdktrace::Sampler::TraceIdRatioBased(ratio));
        }

        let provider = builder.build();
        let tracer = provider.tracer("homedash");
        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        base.with(fmt_layer).with(otel_layer).try_init()?;
        tracing::info!("OTLP tracing enabled");
        otel_global::set_tracer_provider(provider);
    } else {
        base.with(fmt_layer).try_init()?;
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = ?e, "failed to install ctrl_c handler");
    }
    info!("shutdown signal received, stopping pollers");
}
