//! AMQP integration harness CLI
//!
//! Runs one smoke cycle against a broker: provision the inbound and outbound
//! routes, publish a payload through the inbound route, receive it on the
//! application session, then tear everything down.

use anyhow::{bail, Context};
use bytes::Bytes;
use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use amqp_harness_core::config::{HarnessConfig, LoggingConfig};
use amqp_harness_core::{IntegrationHarness, OutboundMessage, SessionRole};

/// AMQP integration harness smoke test.
#[derive(Parser)]
#[command(name = "amqp-harness")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<String>,

    /// Override the broker URI.
    #[arg(long)]
    uri: Option<String>,

    /// Override the receive timeout in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Payload to send through the inbound route.
    #[arg(long, default_value = "amqp-harness smoke test")]
    payload: String,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => HarnessConfig::from_file(path)
            .with_context(|| format!("failed to load configuration from {path}"))?,
        None => HarnessConfig::default(),
    };

    // Apply CLI overrides
    if let Some(uri) = args.uri.clone() {
        config.broker.uri = Some(uri);
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.receive.timeout_ms = timeout_ms;
    }
    config.validate()?;

    let log_config = match args.verbose {
        0 => config.logging.clone(),
        1 => LoggingConfig {
            level: "debug".to_string(),
            ..config.logging.clone()
        },
        _ => LoggingConfig {
            level: "trace".to_string(),
            ..config.logging.clone()
        },
    };
    setup_tracing(&log_config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        broker = %config.broker.display_target(),
        timeout_ms = config.receive.timeout_ms,
        "starting amqp harness smoke test"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move { run_smoke_test(config, Bytes::from(args.payload)).await })
}

fn setup_tracing(config: &LoggingConfig) {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer()).init();
    }
}

async fn run_smoke_test(config: HarnessConfig, payload: Bytes) -> anyhow::Result<()> {
    let expected = payload.clone();

    let (result, report) = IntegrationHarness::amqp(config)
        .run(move |h| {
            Box::pin(async move {
                let inbound = h.inbound().unwrap_or_default().to_string();
                let message = OutboundMessage::new(payload).content_type("text/plain");
                h.publish(SessionRole::Driver, &inbound, &message).await?;
                info!(exchange = %inbound, "published payload");

                h.receive(SessionRole::Application, &inbound).await
            })
        })
        .await;

    for warning in report.warnings() {
        warn!(%warning, "teardown warning");
    }

    let delivery = result.context("smoke test failed")?;
    if delivery.payload != expected {
        bail!(
            "received payload does not match: expected {} bytes, got {}",
            expected.len(),
            delivery.payload.len()
        );
    }
    info!(
        bytes = delivery.payload.len(),
        routes = report.deleted_routes().len(),
        "payload round trip succeeded"
    );

    if !report.is_clean() {
        bail!(
            "teardown left {} warning(s), broker may hold stale resources",
            report.warnings().len()
        );
    }

    info!("smoke test complete");
    Ok(())
}
