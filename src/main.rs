use std::{sync::Arc, time::Duration};

use gatelink::{
    common::{logger, types::AnyResult},
    configs::Config,
    gateway::{ListenerFilter, SessionGateway, opcodes::session as op},
    rest::RestClient,
};
use tracing::{error, info};

#[tokio::main]
async fn main() -> AnyResult<()> {
    let config = Config::load()?;
    logger::init(&config);
    info!("gatelink v{} starting", env!("CARGO_PKG_VERSION"));

    if config.gateway.token.is_empty() {
        return Err("gateway.token is not set (config file or GATELINK_TOKEN)".into());
    }

    let rest = Arc::new(RestClient::new(&config.rest, config.gateway.token.clone())?);
    let url = match config.gateway.url.clone() {
        Some(url) => url,
        None => {
            let bot = rest.gateway_bot().await?;
            info!("Gateway url {} (recommended shards: {})", bot.url, bot.shards);
            bot.url
        }
    };

    let session = SessionGateway::from_config(&config, url);
    session.add_listener(ListenerFilter::op(op::DISPATCH), |payload| async move {
        match payload.event_name() {
            Some("READY") => info!(
                "Logged in as {}",
                payload.d["user"]["username"].as_str().unwrap_or("unknown")
            ),
            Some(name) => info!("Dispatch {} (seq {:?})", name, payload.s),
            None => {}
        }
        Ok(())
    });

    session.connect().await?;
    session.wait_until_ready(Duration::from_secs(30)).await?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
    }
    info!("Shutting down");
    session.stop().await;
    rest.shutdown();
    Ok(())
}
