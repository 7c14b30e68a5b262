//! Control-plane server binary.

use std::sync::Arc;

use control_plane::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if let Err(e) = config::load_dotenv(None) {
        eprintln!("warning: .env not loaded: {e}");
    }
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let settings = config::ControlPlaneSettings::from_env()?;
    let bind_addr = settings.bind_addr.clone();
    let policy_name = settings.policy.name.clone();
    let state: Arc<AppState> = AppState::new(settings)?;
    tracing::info!("control plane listening on {bind_addr} with policy '{policy_name}'");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    control_plane::serve_on_listener(listener, state).await?;
    Ok(())
}
