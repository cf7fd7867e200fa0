//! Bridge runner
//!
//! Entry point for both binary modes: the hosting `serve` mode and the
//! `permission-mcp` helper the CLI launches.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::bridge::{PermissionBridge, PermissionClient, PermissionMcpServer};
use crate::cli::{Cli, Command, ServeArgs};
use crate::console::Console;
use crate::router::Router;
use crate::session::{DriverOptions, SessionRegistry};
use crate::tracing::ResultTraceExt;
use crate::types::BridgeConfig;

// OpenTelemetry imports (only when feature is enabled)
#[cfg(feature = "otel")]
use opentelemetry::global;
#[cfg(feature = "otel")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::trace::SdkTracerProvider;

// Global storage for OpenTelemetry provider (for proper shutdown)
#[cfg(feature = "otel")]
static OTEL_PROVIDER: std::sync::OnceLock<SdkTracerProvider> = std::sync::OnceLock::new();

/// Shutdown OpenTelemetry provider (flush all pending spans)
#[cfg(feature = "otel")]
pub fn shutdown_otel() {
    if let Some(provider) = OTEL_PROVIDER.get() {
        tracing::info!("Shutting down OpenTelemetry provider...");
        if let Err(e) = provider.shutdown() {
            eprintln!("Failed to shutdown OpenTelemetry provider: {e:?}");
        }
    }
}

/// Shutdown OpenTelemetry provider (no-op when feature is disabled)
#[cfg(not(feature = "otel"))]
pub fn shutdown_otel() {}

#[cfg(feature = "otel")]
fn init_otel(endpoint: &str, service_name: &str) -> anyhow::Result<SdkTracerProvider> {
    use opentelemetry_sdk::Resource;

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(
            Resource::builder()
                .with_service_name(service_name.to_owned())
                .build(),
        )
        .build();

    global::set_tracer_provider(provider.clone());
    Ok(provider)
}

/// Build an EnvFilter based on CLI args and RUST_LOG environment variable
///
/// Priority: RUST_LOG environment variable > CLI arguments (-v, -vv, -q)
fn build_env_filter(cli: &Cli) -> tracing_subscriber::EnvFilter {
    if let Ok(rust_log) = std::env::var("RUST_LOG") {
        if !rust_log.is_empty() {
            return tracing_subscriber::EnvFilter::new(rust_log);
        }
    }
    tracing_subscriber::EnvFilter::from_default_env().add_directive(cli.log_level().into())
}

/// Log destination: a file in diagnostic mode, stderr otherwise
///
/// stdout is never used; it carries the console or the MCP JSON-RPC stream.
fn log_writer(cli: &Cli) -> anyhow::Result<BoxMakeWriter> {
    if !cli.is_diagnostic() {
        return Ok(BoxMakeWriter::new(std::io::stderr));
    }

    let log_path = cli.log_path();
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(&log_path)?;
    eprintln!("Diagnostic mode: logging to {}", log_path.display());
    Ok(BoxMakeWriter::new(std::sync::Mutex::new(file)))
}

/// Initialize logging based on CLI arguments
fn init_logging(cli: &Cli) -> anyhow::Result<()> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_writer(cli)?)
        .with_ansi(false);
    let registry = tracing_subscriber::registry()
        .with(build_env_filter(cli))
        .with(fmt_layer);

    #[cfg(feature = "otel")]
    {
        let otel_layer = match (&cli.otel_endpoint, cli.is_otel_enabled()) {
            (Some(endpoint), true) => {
                let service_name = &cli.otel_service_name;
                eprintln!("OpenTelemetry enabled: endpoint={endpoint}, service={service_name}");
                let provider = init_otel(endpoint, service_name)?;
                let tracer = provider.tracer("claude-chat-bridge");
                drop(OTEL_PROVIDER.set(provider));
                Some(tracing_opentelemetry::layer().with_tracer(tracer))
            }
            _ => None,
        };
        registry.with(otel_layer).init();
    }

    #[cfg(not(feature = "otel"))]
    registry.init();

    Ok(())
}

/// Run the mode selected on the command line until it finishes or
/// `shutdown` is cancelled
pub async fn run_with_cli(cli: &Cli, shutdown: CancellationToken) -> anyhow::Result<()> {
    init_logging(cli)?;

    tracing::info!(
        version = %env!("CARGO_PKG_VERSION"),
        pid = %std::process::id(),
        diagnostic = cli.is_diagnostic(),
        "claude-chat-bridge starting"
    );

    match cli.command() {
        Command::Serve(args) => run_serve(&args, shutdown).await,
        Command::PermissionMcp => run_permission_mcp(shutdown).await,
    }
}

/// Host the bridge and drive the console until `/quit`, EOF or shutdown
#[tracing::instrument(name = "serve", skip_all)]
pub async fn run_serve(args: &ServeArgs, shutdown: CancellationToken) -> anyhow::Result<()> {
    let mut config = BridgeConfig::from_env().trace_context()?;
    args.apply(&mut config).trace_context()?;
    tracing::debug!(?config, "Configuration loaded");

    let bridge = PermissionBridge::new();
    if config.skip_permissions {
        tracing::warn!("Permission prompts disabled, the CLI may run any tool");
    } else {
        let addr = bridge
            .start(SocketAddr::from((Ipv4Addr::LOCALHOST, config.ipc_port)))
            .await
            .trace_context()?;
        config.ipc_port = addr.port();
    }

    let registry = Arc::new(SessionRegistry::new(DriverOptions::from_config(&config)));
    let router = Router::new(registry, bridge, config.decision_timeout);
    let console = Console::stdio(Arc::clone(&router), config.working_dir.clone());

    let result = tokio::select! {
        result = console.run(BufReader::new(tokio::io::stdin())) => result.map_err(Into::into),
        () = shutdown.cancelled() => {
            tracing::info!("Shutdown requested");
            Ok(())
        }
    };

    router.shutdown().await;
    result
}

/// Serve the MCP permission tool on stdio
#[tracing::instrument(name = "permission_mcp", skip_all)]
pub async fn run_permission_mcp(shutdown: CancellationToken) -> anyhow::Result<()> {
    let client = PermissionClient::from_env()?;
    tracing::info!(url = %client.url(), "Permission helper started");
    let server = PermissionMcpServer::new(client);

    tokio::select! {
        result = server.run_stdio() => result?,
        () = shutdown.cancelled() => tracing::info!("Permission helper shutting down"),
    }
    Ok(())
}
