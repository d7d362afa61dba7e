// Concierge — server binary.
// Order matters: logger → settings → container → MCP mapping validation
// → HTTP surface.

use concierge::engine::server;
use concierge::{EngineResult, ServiceContainer, Settings};
use log::info;

#[tokio::main]
async fn main() -> EngineResult<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = Settings::from_env()?;
    info!(
        "[main] starting concierge v{} (mock_mode={})",
        env!("CARGO_PKG_VERSION"),
        settings.mock_mode
    );

    let container = ServiceContainer::build(settings)?;
    container.validate_mcp_mapping().await;

    server::run_server(container).await
}
