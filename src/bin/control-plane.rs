//! Process entrypoint: load configuration, build the control plane, run it.

use gamehost_control_plane::{Config, ControlPlaneBuilder};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> gamehost_control_plane::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gamehost_control_plane=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    tracing::info!("starting gamehost control plane");

    let plane = Arc::new(ControlPlaneBuilder::new(config).build().await?);
    plane.run().await
}
