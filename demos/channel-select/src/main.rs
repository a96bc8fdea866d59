//! Channel select binary
//!
//! Two producers each send one value on their own channel; the multiplexer
//! handles whichever arrives first, then the other. A second multiplexer then
//! drains a buffered email queue until its sender closes it.
//!
//! ```bash
//! RUST_LOG=conflux_runtime=trace cargo run -p channel-select
//! ```

use conflux_core::{Cancellation, source};
use conflux_runtime::metrics::MetricsEndpoint;
use conflux_runtime::{Budget, FanInMultiplexer};
use tokio::sync::{mpsc, oneshot};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const EMAILS: usize = 5;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "channel_select=info,conflux_runtime=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut metrics = MetricsEndpoint::from_env()?;
    if let Some(endpoint) = metrics.as_mut() {
        endpoint.start()?;
    }

    let shutdown = Cancellation::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown signal received");
                shutdown.cancel();
            }
        }
    });

    // Two producers, one value each
    let (chan1_tx, chan1_rx) = oneshot::channel();
    let (chan2_tx, chan2_rx) = oneshot::channel();

    tokio::spawn(async move {
        let _ = chan1_tx.send(10);
    });
    tokio::spawn(async move {
        let _ = chan2_tx.send("P...");
    });

    let mut select = FanInMultiplexer::builder()
        .channel("chan1", source::from_oneshot(chan1_rx), |value: i32| {
            println!("Received data from chan1 {value}");
        })
        .channel("chan2", source::from_oneshot(chan2_rx), |value: &str| {
            println!("Received data from chan2 {value}");
        })
        .cancellation(&shutdown)
        .build()?;

    let rounds = select.run(Budget::rounds(2)).await?;
    tracing::info!(rounds, "Select finished");

    // Buffered email queue, closed once every address is queued
    let (email_tx, email_rx) = mpsc::channel(100);
    tokio::spawn(async move {
        for i in 1..=EMAILS {
            if email_tx.send(format!("{i}@example.com")).await.is_err() {
                break;
            }
        }
        println!("Done sending!");
    });

    let mut sender = FanInMultiplexer::builder()
        .channel("emails", source::from_receiver(email_rx), |email: String| {
            println!("Sending email to: {email}");
        })
        .cancellation(&shutdown)
        .build()?;

    let sent = sender.run(Budget::UntilExhausted).await?;
    tracing::info!(sent, "Email queue drained");

    if let Some(rendered) = metrics.as_ref().and_then(MetricsEndpoint::render) {
        tracing::debug!("\n{rendered}");
    }

    Ok(())
}
