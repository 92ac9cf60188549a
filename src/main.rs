mod config;
mod envelope;
mod errors;
mod evm;
mod forward;
mod registry;
mod request;
mod response;
mod server;
mod telemetry;

use anyhow::Result;

use crate::config::Config;
use crate::forward::build_http_client;
use crate::registry::Registry;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    telemetry::init()?;
    let registry = Registry::load(&config.networks_path)?;

    tracing::info!(
        listen_addr = %config.listen_addr,
        networks = registry.len(),
        "starting rpcgate"
    );

    let client = build_http_client(config.request_timeout)?;

    server::start_server(config, registry, client).await
}
