//! Display-side client: connects to the relay and logs the rows it receives.

use std::env;
use log::{LevelFilter, info, warn};
use simple_logger::SimpleLogger;
use tokio_stream::StreamExt;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

use feed_relay::cli::ArgParser;
use feed_relay::feed::FeedMessage;


const USAGE_MESSAGE: &str = "Usage: client [#messages] [port]";


fn show(text: &str) {
    match FeedMessage::decode(text) {
        Ok(FeedMessage::Ticker(rows)) => {
            info!("Ticker update: {} rows", rows.len());
            if let Some(row) = rows.first() {
                info!("  {} bid {} x {} ask {} x {}", row.sym, row.bid, row.bidqty, row.ask, row.askqty);
            }
        },
        Ok(FeedMessage::Arbitrage(rows)) => {
            info!("Arbitrage update: {} rows", rows.len());
            for row in rows {
                info!("  {} cheapest {} dearest {}", row.base, row.minasksym, row.maxasksym);
            }
        },
        Err(error) => warn!("Skipping undecodable frame: {}", error),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    SimpleLogger::new().with_level(LevelFilter::Info).init()?;
    let mut arg_parser = ArgParser::new(env::args(), USAGE_MESSAGE);
    let message_num = arg_parser.extract_message_num()?;
    let port = arg_parser.extract_port()?;
    arg_parser.finish()?;
    let relay_url = format!("ws://127.0.0.1:{}", port);
    let (ws, _) = connect_async(relay_url.clone()).await?;
    info!("Connected to {}, streaming {} messages", relay_url, message_num);
    let mut stream = ws.take(message_num);
    while let Some(frame) = stream.next().await {
        match frame? {
            Message::Text(text) => show(&text),
            Message::Binary(data) => info!("Binary frame of {} bytes", data.len()),
            _ => (),
        }
    }
    Ok(())
}
