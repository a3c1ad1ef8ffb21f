use anyhow::{Context, Result};
use clap::Parser;
use miam_server::{hash_password, Api, Drawer, MailerConfig, MailerKind, ServerConfig};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() -> Result<()> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .ok()
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            (!trimmed.is_empty()).then_some(trimmed)
        });

    if let Some(endpoint) = endpoint {
        let service_name =
            std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "miam-server".to_string());
        let rate = std::env::var("OTEL_SAMPLING_RATE")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .map(|value| value.clamp(0.0, 1.0))
            .unwrap_or(1.0);
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(endpoint)
            .build()
            .context("failed to build OTLP exporter")?;
        let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
            .with_sampler(opentelemetry_sdk::trace::Sampler::TraceIdRatioBased(rate))
            .with_resource(
                opentelemetry_sdk::Resource::builder_empty()
                    .with_attributes([opentelemetry::KeyValue::new("service.name", service_name)])
                    .build(),
            )
            .with_batch_exporter(exporter)
            .build();
        let tracer = tracer_provider.tracer("miam-server");
        opentelemetry::global::set_tracer_provider(tracer_provider);

        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_filter(LevelFilter::INFO))
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    Ok(())
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Host interface to bind (default: localhost).
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Path to SQLite database for the drawer record (memory-only when omitted).
    #[arg(long)]
    sqlite_path: Option<PathBuf>,

    /// Postgres connection string (overrides SQLite path when set).
    #[arg(long)]
    postgres_url: Option<String>,

    /// Max queued persistence snapshots (0 uses default).
    #[arg(long)]
    persistence_buffer: Option<usize>,

    /// Mail transport: resend, log or outbox (default: resend when RESEND_API_KEY is set, else log).
    #[arg(long)]
    mailer: Option<String>,

    /// Sender address; falls back to EMAIL_FROM.
    #[arg(long)]
    email_from: Option<String>,

    /// Base URL of the Resend API.
    #[arg(long)]
    resend_base_url: Option<String>,

    /// Admin session lifetime in minutes (0 uses default).
    #[arg(long)]
    session_ttl_minutes: Option<u64>,

    /// Max assignment emails sent concurrently (0 uses default).
    #[arg(long)]
    notify_concurrency: Option<usize>,

    /// HTTP rate limit per IP in requests per second (0 disables rate limiting).
    #[arg(long)]
    http_rate_limit_per_second: Option<u64>,

    /// HTTP rate limit burst size (0 disables rate limiting).
    #[arg(long)]
    http_rate_limit_burst: Option<u32>,

    /// Register/login rate limit per IP in requests per minute (0 disables).
    #[arg(long)]
    auth_rate_limit_per_minute: Option<u64>,

    /// Register/login rate limit burst size (0 disables).
    #[arg(long)]
    auth_rate_limit_burst: Option<u32>,

    /// Max request body size in bytes (0 disables limit).
    #[arg(long)]
    http_body_limit_bytes: Option<usize>,

    /// Seed for the draw RNG (reproducible draws; never use in production).
    #[arg(long)]
    draw_seed: Option<u64>,
}

fn is_production() -> bool {
    matches!(
        std::env::var("NODE_ENV").as_deref(),
        Ok("production") | Ok("prod")
    )
}

/// Maps an optional arg value to Option: 0 => None, Some(v) => Some(v), None => default
fn map_optional_limit<T: Copy + PartialEq + From<u8>>(
    arg: Option<T>,
    default: Option<T>,
) -> Option<T> {
    match arg {
        Some(v) if v == T::from(0) => None,
        Some(v) => Some(v),
        None => default,
    }
}

/// Maps an optional arg value keeping default on 0: 0 => default, Some(v) => Some(v), None => default
fn map_optional_default_on_zero<T: Copy + PartialEq + From<u8>>(
    arg: Option<T>,
    default: Option<T>,
) -> Option<T> {
    match arg {
        Some(v) if v == T::from(0) => default,
        Some(v) => Some(v),
        None => default,
    }
}

fn env_value(var: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Builds the server config from arguments. Secrets come from the environment
/// and are filled in by [`apply_env`].
fn build_config(args: &Args) -> Result<ServerConfig> {
    let defaults = ServerConfig::default();
    let mailer_kind = match args.mailer.as_deref() {
        Some(value) => value
            .parse::<MailerKind>()
            .map_err(|err| anyhow::anyhow!("invalid mailer: {err}"))?,
        None => MailerKind::Resend,
    };
    if args.draw_seed.is_some() && is_production() {
        anyhow::bail!("draw_seed must not be set in production");
    }
    let session_ttl_ms = match args.session_ttl_minutes {
        Some(minutes) if minutes > 0 => minutes
            .checked_mul(60_000)
            .context("session_ttl_minutes is too large")?,
        _ => defaults.session_ttl_ms,
    };

    Ok(ServerConfig {
        admin_password_hash: None,
        session_ttl_ms,
        sqlite_path: args.sqlite_path.clone(),
        postgres_url: args.postgres_url.clone(),
        persistence_buffer: map_optional_default_on_zero(args.persistence_buffer, defaults.persistence_buffer),
        mailer: MailerConfig {
            kind: mailer_kind,
            from: args.email_from.clone().unwrap_or(defaults.mailer.from),
            resend_api_key: None,
            resend_base_url: args
                .resend_base_url
                .clone()
                .unwrap_or(defaults.mailer.resend_base_url),
        },
        notify_concurrency: map_optional_default_on_zero(args.notify_concurrency, defaults.notify_concurrency),
        http_rate_limit_per_second: map_optional_limit(args.http_rate_limit_per_second, defaults.http_rate_limit_per_second),
        http_rate_limit_burst: map_optional_limit(args.http_rate_limit_burst, defaults.http_rate_limit_burst),
        auth_rate_limit_per_minute: map_optional_limit(args.auth_rate_limit_per_minute, defaults.auth_rate_limit_per_minute),
        auth_rate_limit_burst: map_optional_limit(args.auth_rate_limit_burst, defaults.auth_rate_limit_burst),
        http_body_limit_bytes: map_optional_limit(args.http_body_limit_bytes, defaults.http_body_limit_bytes),
        draw_seed: args.draw_seed,
        draw_max_attempts: defaults.draw_max_attempts,
    })
}

fn apply_env(args: &Args, config: &mut ServerConfig) -> Result<()> {
    config.admin_password_hash = match (env_value("ADMIN_PASSWORD_HASH"), env_value("ADMIN_PASSWORD")) {
        (Some(hash), _) => Some(hash),
        (None, Some(password)) => Some(hash_password(&password)?),
        (None, None) => None,
    };
    config.mailer.resend_api_key = env_value("RESEND_API_KEY");
    if args.email_from.is_none() {
        if let Some(from) = env_value("EMAIL_FROM") {
            config.mailer.from = from;
        }
    }
    if args.mailer.is_none() && config.mailer.resend_api_key.is_none() {
        config.mailer.kind = MailerKind::Log;
    }
    Ok(())
}

fn require_env(var: &str) -> Result<String> {
    env_value(var).with_context(|| format!("Missing required env: {var}"))
}

fn require_positive_u64(var: &str) -> Result<()> {
    let value = require_env(var)?;
    let parsed: u64 = value
        .parse()
        .with_context(|| format!("Invalid {var}: {value}"))?;
    if parsed == 0 {
        anyhow::bail!("Invalid {var}: {value}");
    }
    Ok(())
}

fn ensure_production_env(config: &ServerConfig) -> Result<()> {
    if !is_production() {
        return Ok(());
    }

    require_env("ALLOWED_HTTP_ORIGINS")?;
    require_env("METRICS_AUTH_TOKEN")?;
    require_positive_u64("RATE_LIMIT_HTTP_PER_SEC")?;
    require_positive_u64("RATE_LIMIT_HTTP_BURST")?;
    require_positive_u64("RATE_LIMIT_AUTH_PER_MIN")?;
    require_positive_u64("RATE_LIMIT_AUTH_BURST")?;
    if config.admin_password_hash.is_none() {
        anyhow::bail!("Missing required env: ADMIN_PASSWORD_HASH or ADMIN_PASSWORD");
    }
    if config.mailer.kind != MailerKind::Resend || config.mailer.resend_api_key.is_none() {
        anyhow::bail!("Missing required env: RESEND_API_KEY");
    }
    if config.sqlite_path.is_none() && config.postgres_url.is_none() {
        anyhow::bail!("a database (--sqlite-path or --postgres-url) is required in production");
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse args
    let args = Args::parse();

    // Create logger
    init_tracing()?;

    let mut config = build_config(&args)?;
    apply_env(&args, &mut config)?;
    ensure_production_env(&config)?;

    let drawer = Arc::new(
        Drawer::open(config)
            .await
            .context("failed to initialize drawer")?,
    );
    let api = Api::new(drawer.clone());
    let app = api.router();

    // Start server
    let addr = SocketAddr::new(args.host, args.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Listening on {}", addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("axum server error")?;

    drawer.flush().await;
    info!("drawer state flushed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_disables_rate_limits_and_keeps_buffer_default() {
        let args = Args::parse_from([
            "miam-server",
            "--http-rate-limit-per-second",
            "0",
            "--auth-rate-limit-burst",
            "0",
            "--persistence-buffer",
            "0",
            "--session-ttl-minutes",
            "5",
        ]);
        let config = build_config(&args).expect("config should parse");
        let defaults = ServerConfig::default();
        assert_eq!(config.http_rate_limit_per_second, None);
        assert_eq!(config.auth_rate_limit_burst, None);
        assert_eq!(config.http_rate_limit_burst, defaults.http_rate_limit_burst);
        assert_eq!(config.persistence_buffer, defaults.persistence_buffer);
        assert_eq!(config.session_ttl_ms, 5 * 60_000);
    }

    #[test]
    fn parses_mailer_and_storage() {
        let args = Args::parse_from([
            "miam-server",
            "--mailer",
            "outbox",
            "--sqlite-path",
            "/tmp/drawer.db",
            "--email-from",
            "Elves <elves@workshop.test>",
        ]);
        let config = build_config(&args).expect("config should parse");
        assert_eq!(config.mailer.kind, MailerKind::Outbox);
        assert_eq!(config.mailer.from, "Elves <elves@workshop.test>");
        assert_eq!(config.sqlite_path, Some(PathBuf::from("/tmp/drawer.db")));
    }

    #[test]
    fn rejects_unknown_mailer() {
        let args = Args::parse_from(["miam-server", "--mailer", "pigeon"]);
        let err = build_config(&args).unwrap_err();
        assert!(err.to_string().contains("invalid mailer"), "unexpected error: {err}");
    }
}
