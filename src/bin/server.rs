//! Reference relay server binary.
//!
//! Accepts frontend connections on one port, dials a fixed upstream for
//! each one, and hands both to the engine as a channel. Applications that
//! need handshake-driven backend selection or configured middleware should
//! embed `pod_channel::Engine` directly rather than running this binary —
//! dynamic `cls`-string loading is out of scope for the library (spec §1),
//! so this binary never registers any middleware or extension factories.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use pod_channel::config::EngineConfig;
use pod_channel::{Endpoint, Engine};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio::sync::Semaphore;
use tokio::time;
use tracing::{error, info};

#[cfg(feature = "otel")]
use opentelemetry::global;
#[cfg(feature = "otel")]
use opentelemetry::sdk::trace as sdktrace;
#[cfg(feature = "otel")]
use opentelemetry_aws::trace::XrayPropagator;
#[cfg(feature = "otel")]
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, util::TryInitError, EnvFilter};

const DEFAULT_PORT: u16 = 9292;
/// Caps how many upstream dials can be in flight at once; an accepted
/// frontend connection waits for a permit before its backend is dialed.
const MAX_PENDING_CONNECTS: usize = 250;

#[derive(Parser, Debug)]
#[clap(name = "pod-channel-server", version, author, about = "A programmable bidirectional TCP relay")]
struct Cli {
    /// Port to accept frontend connections on.
    #[clap(long)]
    port: Option<u16>,

    /// Upstream address each accepted frontend is relayed to, e.g. 127.0.0.1:8080.
    #[clap(long)]
    upstream: String,

    /// Optional JSON engine configuration file.
    #[clap(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
pub async fn main() -> pod_channel::Result<()> {
    set_up_logging()?;
    let cli = Cli::parse();
    let port = cli.port.unwrap_or(DEFAULT_PORT);

    let config = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            EngineConfig::from_json(&raw)?
        }
        None => {
            let mut config = EngineConfig::default();
            config.apply_env_overrides(&std::env::vars().collect())?;
            config
        }
    };

    let engine = Engine::build(config, &Default::default(), &Default::default());
    engine.on_setup().await;

    let listener = TcpListener::bind(&format!("127.0.0.1:{port}")).await?;
    info!(%port, upstream = %cli.upstream, "accepting frontend connections");

    run(engine.clone(), listener, cli.upstream, signal::ctrl_c()).await;
    Ok(())
}

async fn run(engine: Arc<Engine>, listener: TcpListener, upstream: String, shutdown: impl std::future::Future) {
    let permits = Arc::new(Semaphore::new(MAX_PENDING_CONNECTS));

    tokio::select! {
        _ = accept_loop(&engine, listener, upstream, permits) => {}
        _ = shutdown => {
            info!("shutting down");
        }
    }

    engine.on_stop(Some(Duration::from_secs(10))).await;
}

async fn accept_loop(engine: &Arc<Engine>, listener: TcpListener, upstream: String, permits: Arc<Semaphore>) {
    let mut backoff = 1;
    loop {
        let frontend = match listener.accept().await {
            Ok((socket, _)) => socket,
            Err(err) => {
                if backoff > 64 {
                    error!(%err, "giving up accepting connections");
                    return;
                }
                time::sleep(Duration::from_secs(backoff)).await;
                backoff *= 2;
                continue;
            }
        };
        backoff = 1;

        let engine = Arc::clone(engine);
        let upstream = upstream.clone();
        let permit = Arc::clone(&permits).acquire_owned().await.expect("semaphore is never closed");

        tokio::spawn(async move {
            if let Err(err) = relay_one(&engine, frontend, &upstream).await {
                error!(%err, "failed to establish relay for accepted connection");
            }
            drop(permit);
        });
    }
}

async fn relay_one(engine: &Engine, frontend: TcpStream, upstream: &str) -> pod_channel::Result<()> {
    let backend = TcpStream::connect(upstream).await?;
    engine
        .on_connect(Endpoint::from_tcp_stream(frontend), Some(Endpoint::from_tcp_stream(backend)))
        .await?;
    Ok(())
}

#[cfg(not(feature = "otel"))]
fn set_up_logging() -> pod_channel::Result<()> {
    tracing_subscriber::fmt::try_init().map_err(Into::into)
}

#[cfg(feature = "otel")]
fn set_up_logging() -> Result<(), TryInitError> {
    global::set_text_map_propagator(XrayPropagator::default());

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().tonic())
        .with_trace_config(
            sdktrace::config()
                .with_sampler(sdktrace::Sampler::AlwaysOn)
                .with_id_generator(sdktrace::XrayIdGenerator::default()),
        )
        .install_simple()
        .expect("Unable to initialize OtlpPipeline");

    let opentelemetry = tracing_opentelemetry::layer().with_tracer(tracer);
    let filter = EnvFilter::from_default_env();

    tracing_subscriber::registry().with(opentelemetry).with(filter).with(fmt::Layer::default()).try_init()
}
