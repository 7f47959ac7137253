//! WebSocket relay: subscribes once to the upstream market feed and
//! rebroadcasts every frame to all connected clients.

use log::{LevelFilter, info};
use simple_logger::SimpleLogger;
use std::env;

use feed_relay::cli::ArgParser;
use feed_relay::relay::RelayServer;


const USAGE_MESSAGE: &str = "Usage: server [port] [upstream url|-] [echo|no-echo]";


#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    SimpleLogger::new().with_level(LevelFilter::Info).init()?;
    let mut arg_parser = ArgParser::new(env::args(), USAGE_MESSAGE);
    let config = arg_parser.extract_relay_config()?;
    match &config.upstream_url {
        Some(url) => info!("Relaying {} on port {}", url, config.listen_port),
        None => info!("Relaying client messages only on port {}", config.listen_port),
    }
    let server = RelayServer::bind(config).await?;
    tokio::select! {
        result = server.serve() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}
