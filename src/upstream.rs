//! Subscription to the upstream WebSocket feed, delivering every frame as a
//! [Payload](Payload) through a [Stream](Stream).

use log::{debug, error, info};
use futures::prelude::*;
use std::{pin::Pin, task::{Context, Poll}};
use tokio::{time::sleep, sync::mpsc, net::TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};

use crate::core::*;


/// Number of upstream frames buffered between the socket loop and the consumer.
const DATA_QUEUE_CAPACITY: usize = 64;


/// Connected upstream WebSocket.
pub type UpstreamSocket = Pin<Box<WebSocketStream<MaybeTlsStream<TcpStream>>>>;

/// Commands sent from the [UpstreamStream](UpstreamStream) to the socket loop.
enum Command {
    /// Close the connection and exit the loop
    Close,
}

/// Contains all the information to connect to the upstream feed.
#[derive(Clone, Debug)]
pub struct UpstreamSubscriber {
    /// WebSocket URL.
    ws_url: String,
    /// Frame sent right after the handshake, for feeds requiring one.
    subscribe_message: Option<String>,
    /// Delays between reconnection attempts.
    backoff: Backoff,
}

impl UpstreamSubscriber {
    /// Create a new [UpstreamSubscriber](UpstreamSubscriber) object.
    ///
    /// # Arguments
    ///
    /// * `ws_url` - WebSocket URL of the feed.
    ///
    /// * `subscribe_message` - Optional subscription frame.
    ///
    /// * `backoff` - Reconnection delays.
    ///
    /// # Returns
    ///
    /// An [UpstreamSubscriber](UpstreamSubscriber) object.
    pub fn new(ws_url: String, subscribe_message: Option<String>, backoff: Backoff) -> Self {
        Self { ws_url, subscribe_message, backoff }
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Connect to the feed and send the subscription frame, if any.
    ///
    /// # Returns
    ///
    /// The connected socket, or [RelayError::Connection](RelayError::Connection) if the
    /// endpoint is unreachable or the handshake fails.
    pub async fn connect(&self) -> Result<UpstreamSocket, RelayError> {
        info!("Connecting to WebSocket: {}", &self.ws_url);
        let (ws, _) = connect_async(self.ws_url.clone()).await.map_err(
            |error| RelayError::Connection(format!("{}: {}", self.ws_url, error)))?;
        let mut pinned_ws = Box::pin(ws);
        if let Some(subscribe_message) = &self.subscribe_message {
            info!("Subscription '{}'.", subscribe_message);
            pinned_ws.send(Message::Text(subscribe_message.clone())).await.map_err(
                |error| RelayError::Connection(format!("subscription to {} failed: {}", self.ws_url, error)))?;
        }
        info!("Connected to {}", &self.ws_url);
        Ok(pinned_ws)
    }

    /// Start the socket loop in a background task.
    ///
    /// # Returns
    ///
    /// An [UpstreamStream](UpstreamStream) yielding every frame received, in arrival order.
    pub fn spawn(self) -> UpstreamStream {
        let (data_sender, data_receiver) = mpsc::channel::<Payload>(DATA_QUEUE_CAPACITY);
        let (command_sender, command_receiver) = mpsc::channel::<Command>(1);
        tokio::spawn(self.process_stream(data_sender, command_receiver));
        UpstreamStream { data_receiver, command_sender }
    }

    /// Loop reading from the feed and forwarding every frame through `data_sender`.
    /// It answers pings and reconnects with exponential backoff whenever the
    /// connection cannot be established or is lost.
    /// It exits on [Command::Close](Command::Close), or when either side of the
    /// [UpstreamStream](UpstreamStream) is dropped.
    async fn process_stream(
            self,
            data_sender: mpsc::Sender<Payload>,
            mut command_receiver: mpsc::Receiver<Command>) {
        let mut attempt: u32 = 0;
        'connection:
        loop {
            let connected = tokio::select! {
                connected = self.connect() => connected,
                _ = command_receiver.recv() => {
                    info!("Connection to {} cancelled", &self.ws_url);
                    break 'connection;
                },
            };
            match connected {
                Ok(mut pinned_ws) => {
                    attempt = 0;
                    loop {
                        tokio::select! {
                            command = command_receiver.recv() => {
                                match command {
                                    Some(Command::Close) => info!("Disconnecting from {}", &self.ws_url),
                                    None => info!("Upstream consumer gone, disconnecting from {}", &self.ws_url),
                                }
                                match pinned_ws.close().await {
                                    Ok(_) => info!("Disconnected from {}", &self.ws_url),
                                    Err(error) => error!("Error disconnecting from {}: {:?}", &self.ws_url, error),
                                }
                                break 'connection;
                            },
                            frame = pinned_ws.next() => match frame {
                                Some(Ok(Message::Ping(data))) => {
                                    debug!("Received ping from {}", &self.ws_url);
                                    if pinned_ws.send(Message::Pong(data)).await.is_err() {
                                        error!("Error sending ping response to {}", &self.ws_url);
                                    }
                                },
                                Some(Ok(Message::Close(frame))) => {
                                    error!("Connection to {} closed by peer: {:?}", &self.ws_url, frame);
                                    break;
                                },
                                Some(Ok(message)) => {
                                    if let Some(payload) = Payload::from_message(message) {
                                        tokio::select! {
                                            sent = data_sender.send(payload) => {
                                                if sent.is_err() {
                                                    info!("Upstream consumer gone, disconnecting from {}", &self.ws_url);
                                                    let _ = pinned_ws.close().await;
                                                    break 'connection;
                                                }
                                            },
                                            _ = command_receiver.recv() => {
                                                info!("Disconnecting from {} with the consumer behind", &self.ws_url);
                                                let _ = pinned_ws.close().await;
                                                break 'connection;
                                            },
                                        }
                                    }
                                },
                                Some(Err(error)) => {
                                    error!("Connection to {} lost: {}", &self.ws_url, error);
                                    break;
                                },
                                None => {
                                    error!("Connection to {} ended", &self.ws_url);
                                    break;
                                },
                            },
                        }
                    }
                },
                Err(error) => error!("{}", error),
            }
            let delay = self.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            info!("Trying reconnection in {}ms", delay.as_millis());
            tokio::select! {
                _ = sleep(delay) => (),
                _ = command_receiver.recv() => {
                    info!("Reconnection to {} cancelled", &self.ws_url);
                    break 'connection;
                },
            }
        }
    }
}

/// Structure representing a running upstream subscription.
pub struct UpstreamStream {
    /// Frames received from the feed.
    data_receiver: mpsc::Receiver<Payload>,
    /// Commands for the socket loop.
    command_sender: mpsc::Sender<Command>,
}

impl UpstreamStream {
    /// Disconnect from the feed. Frames already queued can still be read.
    pub async fn disconnect(&self) {
        if self.command_sender.send(Command::Close).await.is_err() {
            debug!("Upstream loop already stopped");
        }
    }
}

impl Stream for UpstreamStream {
    type Item = Payload;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.data_receiver.poll_recv(cx)
    }
}
