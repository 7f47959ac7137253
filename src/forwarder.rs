//! Subscribes to the upstream feed and forwards every frame into a running
//! relay, as an ordinary relay client.

use std::env;
use log::{LevelFilter, info};
use simple_logger::SimpleLogger;
use futures::prelude::*;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

use feed_relay::cli::ArgParser;
use feed_relay::core::{Backoff, RelayError};
use feed_relay::upstream::UpstreamSubscriber;


const USAGE_MESSAGE: &str = "Usage: forwarder [relay port] [upstream url]";


#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    SimpleLogger::new().with_level(LevelFilter::Info).init()?;
    let mut arg_parser = ArgParser::new(env::args(), USAGE_MESSAGE);
    let port = arg_parser.extract_port()?;
    let upstream_url = arg_parser.extract_upstream_url()?.ok_or_else(
        || RelayError::Config(format!("an upstream URL is required\n{}", arg_parser.usage())))?;
    arg_parser.finish()?;
    let relay_url = format!("ws://127.0.0.1:{}", port);
    let (mut relay, _) = connect_async(relay_url.clone()).await?;
    info!("Connected to relay {}", relay_url);
    let mut upstream = UpstreamSubscriber::new(upstream_url, None, Backoff::default()).spawn();
    let mut forwarded: u64 = 0;
    loop {
        tokio::select! {
            payload = upstream.next() => match payload {
                Some(payload) => {
                    relay.send(payload.into()).await?;
                    forwarded += 1;
                },
                None => break,
            },
            frame = relay.next() => match frame {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    info!("Relay closed after {} frames", forwarded);
                    upstream.disconnect().await;
                    break;
                },
                Some(Ok(_)) => (),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down after {} frames", forwarded);
                upstream.disconnect().await;
                relay.close(None).await?;
                break;
            },
        }
    }
    Ok(())
}
