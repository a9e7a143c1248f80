use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::config::{LimitOverrides, TurnstileConfig};
use turnstile::http::{AppState, HttpServer};
use turnstile::ratelimit::{tokens_from_json, IdentityResolver, RateLimiter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Token-aware HTTP rate limiting service.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "TURNSTILE_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overriding the configuration
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Listen port, overriding the port of the configured address
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// Per-token quotas as JSON, e.g. '{"abc123":{"limit":100,"block_duration":60}}'
    #[arg(long, env = "TOKEN_LIMITS")]
    token_limits: Option<String>,

    #[command(flatten)]
    limits: LimitOverrides,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match args.log_format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_thread_ids(true)
            .init(),
    }

    info!("Starting Turnstile Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args)?;
    info!(
        http_addr = %config.server.http_addr,
        tokens = config.rate_limiting.tokens.len(),
        "Configuration loaded"
    );

    // Initialize the rate limiter
    let policies = config.rate_limiting.policy_table()?;
    let rate_limiter = RateLimiter::new(policies)
        .with_lock_timeout(config.server.lock_timeout())
        .with_eviction(config.rate_limiting.max_buckets, config.rate_limiting.idle_ttl());
    info!("Rate limiter initialized");

    let resolver = IdentityResolver::new(&config.rate_limiting.api_key_header)
        .with_trusted_proxies(config.rate_limiting.trusted_proxies.clone());
    let state = AppState::new(Arc::new(rate_limiter), resolver);

    let server = HttpServer::new(config.server.http_addr, state, config.server.shutdown_grace());

    // Run the server with graceful shutdown on Ctrl+C
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Turnstile Rate Limiting Service stopped");
    Ok(())
}

/// Merge file, environment and command-line settings, then validate.
fn load_config(args: &Args) -> anyhow::Result<TurnstileConfig> {
    let mut config = TurnstileConfig::load(args.config.as_deref())?;

    if let Some(addr) = args.addr {
        config.server.http_addr = addr;
    }
    if let Some(port) = args.port {
        config.server.http_addr.set_port(port);
    }
    args.limits.apply(&mut config.rate_limiting);
    if let Some(ref json) = args.token_limits {
        config.rate_limiting.tokens.extend(tokens_from_json(json)?);
    }

    config.validate()?;
    Ok(config)
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
