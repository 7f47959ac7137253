//! WebSocket relay server: accepts downstream clients, feeds them with the
//! upstream subscription and with whatever the clients themselves send.

use log::{debug, error, info, warn};
use futures::prelude::*;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{accept_async, tungstenite::protocol::Message};

use crate::core::*;
use crate::broadcast::{Broadcaster, Subscription};
use crate::upstream::{UpstreamStream, UpstreamSubscriber};


/// Pause after a failed accept, so that fd exhaustion does not spin the loop.
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);
/// Longest wait for the closing handshake of a client.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);


/// Top level object representing a relay process.
pub struct RelayServer {
    config: RelayConfig,
    listener: Arc<TcpListener>,
    broadcaster: Broadcaster,
}

impl RelayServer {
    /// Bind the downstream listener on the loopback interface.
    ///
    /// # Arguments
    ///
    /// * `config` - Ports, upstream URL and delivery policies.
    ///
    /// # Returns
    ///
    /// A [RelayServer](RelayServer) ready to [serve](RelayServer::serve).
    pub async fn bind(config: RelayConfig) -> Result<Self, RelayError> {
        let address = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), config.listen_port);
        let listener = TcpListener::bind(address).await.map_err(
            |error| RelayError::Connection(format!("cannot listen on {}: {}", address, error)))?;
        let broadcaster = Broadcaster::from_config(&config);
        info!("Relay listening on {}", listener.local_addr()?);
        Ok(Self { config, listener: Arc::new(listener), broadcaster })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    /// The broadcaster shared by all connections of this server.
    pub fn broadcaster(&self) -> Broadcaster {
        self.broadcaster.clone()
    }

    /// Start the upstream subscription, if configured, and accept clients
    /// forever. Accept errors are logged and do not stop the relay.
    pub async fn serve(self) -> Result<(), RelayError> {
        if let Some(upstream_url) = &self.config.upstream_url {
            let subscriber = UpstreamSubscriber::new(upstream_url.clone(), None, self.config.backoff);
            tokio::spawn(pump_upstream(subscriber.spawn(), self.broadcaster.clone()));
        }
        let listener = self.listener;
        accept_clients(
            move || {
                let listener = listener.clone();
                async move { listener.accept().await }
            },
            self.broadcaster,
        ).await;
        Ok(())
    }
}

/// Accept loop: every connection gets its own task.
///
/// # Arguments
///
/// * `accept` - Produces the next incoming connection.
///
/// * `broadcaster` - Registry the clients join.
async fn accept_clients<A, F>(mut accept: A, broadcaster: Broadcaster)
where
    A: FnMut() -> F,
    F: Future<Output = io::Result<(TcpStream, SocketAddr)>>,
{
    loop {
        match accept().await {
            Ok((stream, peer)) => {
                tokio::spawn(handle_client(stream, peer, broadcaster.clone()));
            },
            Err(error) => {
                error!("Accept failed: {}", error);
                sleep(ACCEPT_ERROR_DELAY).await;
            },
        }
    }
}

/// Publish every upstream frame, in arrival order.
pub async fn pump_upstream(mut upstream: UpstreamStream, broadcaster: Broadcaster) {
    while let Some(payload) = upstream.next().await {
        broadcaster.publish(payload);
    }
    info!("Upstream subscription ended");
}

/// Serve one downstream client until it closes, a write fails, or the
/// broadcaster removes it.
///
/// The [Subscription](Subscription) is owned by this task, so every exit path
/// removes the client from the broadcaster. A write blocked on a peer that
/// stopped reading is abandoned as soon as the client is removed.
async fn handle_client(stream: TcpStream, peer: SocketAddr, broadcaster: Broadcaster) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(error) => {
            warn!("WebSocket handshake with {} failed: {}", peer, error);
            return;
        }
    };
    let mut subscription = broadcaster.accept();
    info!("{} connected from {}", subscription.id(), peer);
    let (mut ws_sender, mut ws_receiver) = ws.split();
    let result = loop {
        tokio::select! {
            outbound = subscription.next() => match outbound {
                Some(payload) => {
                    tokio::select! {
                        sent = ws_sender.send(payload.into()) => {
                            if sent.is_err() {
                                break Err(RelayError::Delivery);
                            }
                        },
                        _ = subscription.removed() => break Err(RelayError::Delivery),
                    }
                },
                None => break Ok(()),
            },
            inbound = ws_receiver.next() => match inbound {
                Some(Ok(Message::Close(_))) | None => break Ok(()),
                Some(Ok(message)) => relay_inbound(&subscription, message),
                Some(Err(error)) => break Err(RelayError::Connection(error.to_string())),
            },
        }
    };
    match result {
        Ok(_) => {
            info!("{} ({}) closed", subscription.id(), peer);
            let _ = timeout(CLOSE_TIMEOUT, ws_sender.close()).await;
        },
        Err(error) => error!("{} ({}) dropped: {}", subscription.id(), peer, error),
    }
}

/// Rebroadcast a frame sent by a client. Control frames are not relayed.
fn relay_inbound(subscription: &Subscription, message: Message) {
    if let Some(payload) = Payload::from_message(message) {
        let delivered = subscription.publish(payload);
        debug!("{} published to {} clients", subscription.id(), delivered);
    }
}
