use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;
use yaktalk::application::{CallManager, CallManagerConfig};
use yaktalk::config::Config;
use yaktalk::domain::call::{CallStatus, EndReason, MediaKind};
use yaktalk::infrastructure::media::LoopbackMedia;
use yaktalk::infrastructure::peer::LoopbackPeerConnector;
use yaktalk::infrastructure::signaling::MemorySignalingHub;
use yaktalk::interface::api::{build_router, init_metrics, RelayState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut demo = false;
    let mut config_path = None;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--demo" => demo = true,
            path => config_path = Some(PathBuf::from(path)),
        }
    }

    // Load configuration
    let config = Config::load(config_path.as_deref())?;

    // Initialize tracing
    let filter = EnvFilter::try_new(&config.log.filter).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting YakTalk signaling relay");
    info!("Configuration loaded: {:?}", config);

    // Initialize metrics exporter
    info!("Initializing Prometheus metrics exporter");
    let prometheus_handle = init_metrics()?;

    if demo {
        demo_call_lifecycle(&config).await?;
    }

    let relay = Arc::new(RelayState::new());
    let app = build_router(relay, prometheus_handle);
    let listener = tokio::net::TcpListener::bind(config.server.bind_address()).await?;

    info!("Signaling relay listening on {}", config.server.bind_address());

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down...");
        })
        .await?;

    Ok(())
}

/// Demonstrate the call lifecycle with in-process capabilities
async fn demo_call_lifecycle(config: &Config) -> anyhow::Result<()> {
    info!("=== Call Lifecycle Demo ===");

    let hub = MemorySignalingHub::new();
    let spawn = |user: &str| {
        CallManager::spawn(
            CallManagerConfig::new(user).with_grace_window(config.call.grace_window()),
            Arc::new(LoopbackMedia::new()),
            Arc::new(LoopbackPeerConnector::new()),
        )
    };

    let alice = spawn("alice");
    let bob = spawn("bob");
    alice.attach_channel(hub.connect("alice")).await;
    bob.attach_channel(hub.connect("bob")).await;

    // Place the call
    let session_id = alice.start_call("bob", MediaKind::Video).await?;
    info!("Call {} initiated: alice -> bob", session_id);

    // Answer once it rings
    bob.watch()
        .wait_for(|s| s.status == Some(CallStatus::Ringing))
        .await?;
    info!("Call ringing at bob");
    bob.answer().await?;
    info!("Call answered");

    alice
        .watch()
        .wait_for(|s| s.status == Some(CallStatus::Answered))
        .await?;
    let snapshot = alice.snapshot();
    info!(
        "Alice sees remote stream: {:?}",
        snapshot.remote_stream().map(|s| s.info())
    );

    // Hang up after the grace window
    tokio::time::sleep(config.call.grace_window() + Duration::from_millis(100)).await;
    let outcome = alice.end_call(EndReason::Hangup).await;
    info!("Hangup: {:?}", outcome);

    let ended = bob
        .watch()
        .wait_for(|s| s.status == Some(CallStatus::Ended))
        .await?
        .clone();
    info!("Call ended at bob: {:?}", ended.end_reason);

    info!("=== Call Lifecycle Demo Complete ===");
    Ok(())
}
