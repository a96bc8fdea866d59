//! Post views binary
//!
//! Spawns one task per viewer; each adds a single view to a shared counter.
//! The total is printed once every viewer has been counted.
//!
//! ```bash
//! POST_VIEWS_WORKERS=1000 cargo run -p post-views
//! ```

use conflux_core::{Cancellation, ConfluxError};
use conflux_runtime::SharedAggregate;
use conflux_runtime::metrics::MetricsEndpoint;
use post_views::Settings;
use tokio::task::JoinSet;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "post_views=info,conflux_runtime=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::from_env()?;
    tracing::info!(workers = settings.workers, "Starting post views");

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

    let views = SharedAggregate::<u64, u64>::builder(0, settings.workers)
        .cancellation(&shutdown)
        .build::<u64>()?;

    let mut viewers = JoinSet::new();
    for _ in 0..settings.workers {
        let views = views.clone();
        viewers.spawn(async move { views.contribute(1).await });
    }

    match views.await_finalized().await {
        Ok(total) => println!("{total}"),
        Err(ConfluxError::Cancelled) => {
            let pending = views.pending().await;
            println!("Interrupted with {pending} viewers still uncounted");
        },
        Err(error) => return Err(error.into()),
    }

    while let Some(joined) = viewers.join_next().await {
        match joined? {
            Ok(()) | Err(ConfluxError::Cancelled) => {},
            Err(error) => return Err(error.into()),
        }
    }

    if let Some(rendered) = metrics.as_ref().and_then(MetricsEndpoint::render) {
        tracing::debug!("\n{rendered}");
    }

    Ok(())
}
