//! Handoff
//!
//! Demo host for the shared-surface handoff protocol. By default the process
//! acts as the producer: it spawns a copy of itself as the consumer, hands
//! it a pool of memfd surfaces once, then announces each drawn frame.

mod config;
mod consumer;
mod fps;
mod launcher;
mod producer;

use anyhow::Result;
use handoff_ipc::{EndpointEvent, EventReceiver};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Forward endpoint events to the log
async fn log_events(role: &'static str, mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        match event {
            EndpointEvent::FramePresented { .. } | EndpointEvent::ProducerStalled => {
                debug!("[{}] {:?}", role, event)
            }
            EndpointEvent::FrameDropped { slot } => debug!("[{}] Frame in slot {} dropped", role, slot),
            EndpointEvent::MessageDiscarded(error) => warn!("[{}] Discarded message: {}", role, error),
            EndpointEvent::ProtocolViolation { count, error } => {
                warn!("[{}] Protocol violation #{}: {}", role, count, error)
            }
            EndpointEvent::Closed(reason) => info!("[{}] Session closed: {:?}", role, reason),
            other => info!("[{}] {:?}", role, other),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "handoff=debug,handoff_ipc=info,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();
    let is_consumer = args.iter().any(|arg| arg == "--consumer");

    let config = config::Config::load()?;

    if is_consumer {
        info!("Starting handoff consumer");
        return consumer::run(config).await;
    }

    info!("Starting handoff producer");

    // Setup signal handlers for graceful shutdown
    let (shutdown_tx, shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down gracefully");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down gracefully");
                }
            }
            let _ = shutdown_tx.send(()).await;
        });
    }

    producer::run(config, shutdown_rx).await
}
