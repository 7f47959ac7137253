//! Fan-out of published payloads to every connected downstream client.

use log::{debug, info, warn};
use futures::stream::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::sync::{oneshot, mpsc::{self, error::TrySendError}};

use crate::core::*;


/// A registered downstream client, as seen by the [Broadcaster](Broadcaster).
struct ClientConnection {
    /// Outbound queue, drained by the task owning the client socket.
    sender: mpsc::Sender<Payload>,
    /// Dropped with the entry, waking the owning task if it is stuck writing.
    _removal: oneshot::Sender<()>,
}

/// The set of live clients. Only the [Broadcaster](Broadcaster) touches it.
type ConnectionSet = HashMap<ClientId, ClientConnection>;

/// Shared registry of connected clients, publishing every payload to all of them.
///
/// Cloning a broadcaster is cheap and every clone refers to the same
/// connection set.
#[derive(Clone)]
pub struct Broadcaster {
    connections: Arc<Mutex<ConnectionSet>>,
    next_id: Arc<AtomicU64>,
    queue_capacity: usize,
    echo_policy: EchoPolicy,
    slow_consumer_policy: SlowConsumerPolicy,
}

impl Broadcaster {
    /// Create a new [Broadcaster](Broadcaster) with no clients.
    ///
    /// # Arguments
    ///
    /// * `queue_capacity` - Maximum number of payloads waiting to be written to a client.
    ///
    /// * `echo_policy` - Whether messages coming from a client are sent back to it.
    ///
    /// * `slow_consumer_policy` - What to do with a client whose queue is full.
    ///
    /// # Returns
    ///
    /// A [Broadcaster](Broadcaster) object.
    pub fn new(queue_capacity: usize, echo_policy: EchoPolicy, slow_consumer_policy: SlowConsumerPolicy) -> Self {
        Self {
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            queue_capacity: queue_capacity.max(1),
            echo_policy,
            slow_consumer_policy,
        }
    }

    /// Create a [Broadcaster](Broadcaster) with the policies of a relay configuration.
    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(config.client_queue_capacity, config.echo_policy, config.slow_consumer_policy)
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionSet> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new client.
    ///
    /// # Returns
    ///
    /// The [Subscription](Subscription) of the client: a stream of every payload published
    /// from now on. Dropping it removes the client.
    pub fn accept(&self) -> Subscription {
        let id = ClientId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let (removal_sender, removal_receiver) = oneshot::channel();
        let count = {
            let mut connections = self.lock();
            connections.insert(id, ClientConnection { sender, _removal: removal_sender });
            connections.len()
        };
        info!("Accepted {} ({} connected)", id, count);
        Subscription {
            id,
            receiver,
            removal: Some(removal_receiver),
            broadcaster: self.clone(),
        }
    }

    /// Deliver a payload to every connected client.
    ///
    /// Failures are handled per client and never reported to the caller.
    ///
    /// # Returns
    ///
    /// The number of clients the payload was queued for.
    pub fn publish(&self, payload: Payload) -> usize {
        self.fan_out(None, payload)
    }

    /// Deliver a payload received from the client `origin`, honouring the [EchoPolicy](EchoPolicy).
    ///
    /// # Returns
    ///
    /// The number of clients the payload was queued for.
    pub fn publish_from(&self, origin: ClientId, payload: Payload) -> usize {
        self.fan_out(Some(origin), payload)
    }

    /// Remove a client. Removing an unknown client does nothing.
    ///
    /// # Returns
    ///
    /// `true` if the client was connected.
    pub fn disconnect(&self, id: ClientId) -> bool {
        let removed = self.lock().remove(&id).is_some();
        if removed {
            info!("Disconnected {}", id);
        }
        removed
    }

    pub fn connection_count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_connected(&self, id: ClientId) -> bool {
        self.lock().contains_key(&id)
    }

    /// The lock is held for the whole fan-out, so removals and insertions are
    /// never observed half done.
    fn fan_out(&self, origin: Option<ClientId>, payload: Payload) -> usize {
        let mut connections = self.lock();
        let mut delivered = 0;
        let mut failed: Vec<ClientId> = vec![];
        for (id, connection) in connections.iter() {
            if self.echo_policy == EchoPolicy::ExcludeOrigin && origin == Some(*id) {
                continue;
            }
            match connection.sender.try_send(payload.clone()) {
                Ok(_) => delivered += 1,
                Err(TrySendError::Full(_)) => match self.slow_consumer_policy {
                    SlowConsumerPolicy::Disconnect => {
                        warn!("Queue of {} is full, disconnecting", id);
                        failed.push(*id);
                    },
                    SlowConsumerPolicy::Skip => debug!("Queue of {} is full, message skipped", id),
                },
                Err(TrySendError::Closed(_)) => {
                    debug!("Queue of {} is closed", id);
                    failed.push(*id);
                },
            }
        }
        for id in failed {
            connections.remove(&id);
            info!("Removed {} after delivery failure", id);
        }
        debug!("Published {} bytes to {} clients", payload.len(), delivered);
        delivered
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CLIENT_QUEUE_CAPACITY, EchoPolicy::default(), SlowConsumerPolicy::default())
    }
}


/// Scoped registration of one client in a [Broadcaster](Broadcaster).
///
/// It yields the payloads published to the client, in publish order. The
/// stream ends when the client has been removed and its queue drained.
pub struct Subscription {
    id: ClientId,
    receiver: mpsc::Receiver<Payload>,
    /// Resolves once the client has left the connection set.
    removal: Option<oneshot::Receiver<()>>,
    broadcaster: Broadcaster,
}

impl Subscription {
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Publish a payload received from this client.
    pub fn publish(&self, payload: Payload) -> usize {
        self.broadcaster.publish_from(self.id, payload)
    }

    /// Next payload for this client, `None` once it has been disconnected.
    pub async fn recv(&mut self) -> Option<Payload> {
        self.receiver.recv().await
    }

    /// Wait until the client is removed from the broadcaster, by
    /// [disconnect](Broadcaster::disconnect) or by a delivery failure.
    /// Returns at once if that already happened.
    pub async fn removed(&mut self) {
        if let Some(removal) = self.removal.as_mut() {
            let _ = removal.await;
            self.removal = None;
        }
    }

    /// Next payload if one is already queued.
    pub fn try_recv(&mut self) -> Option<Payload> {
        self.receiver.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = Payload;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broadcaster.disconnect(self.id);
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn text(s: &str) -> Payload {
        Payload::Text(s.to_string())
    }

    #[test]
    fn test_publish_without_clients() {
        let broadcaster = Broadcaster::default();
        assert_eq!(broadcaster.publish(text("{}")), 0);
    }

    #[test]
    fn test_publish_to_two_clients() {
        let broadcaster = Broadcaster::default();
        let mut a = broadcaster.accept();
        let mut b = broadcaster.accept();
        let msg = text(r#"{"sym":"BTCUSDT","bid":100,"ask":101}"#);
        assert_eq!(broadcaster.publish(msg.clone()), 2);
        assert_eq!(a.try_recv(), Some(msg.clone()));
        assert_eq!(b.try_recv(), Some(msg));
        assert_eq!(a.try_recv(), None);
        assert_eq!(b.try_recv(), None);
    }

    #[test]
    fn test_order_is_preserved() {
        let broadcaster = Broadcaster::default();
        let mut a = broadcaster.accept();
        for n in 0..100 {
            broadcaster.publish(text(&n.to_string()));
        }
        for n in 0..100 {
            assert_eq!(a.try_recv(), Some(text(&n.to_string())));
        }
    }

    #[test]
    fn test_disconnected_client_is_skipped() {
        let broadcaster = Broadcaster::default();
        let a = broadcaster.accept();
        let mut b = broadcaster.accept();
        let a_id = a.id();
        drop(a);
        assert!(!broadcaster.is_connected(a_id));
        let msg = text(r#"{"sym":"ETHUSDT","bid":10,"ask":11}"#);
        assert_eq!(broadcaster.publish(msg.clone()), 1);
        assert_eq!(b.try_recv(), Some(msg));
    }

    #[test]
    fn test_repeated_disconnect_is_noop() {
        let broadcaster = Broadcaster::default();
        let a = broadcaster.accept();
        let _b = broadcaster.accept();
        assert!(broadcaster.disconnect(a.id()));
        assert!(!broadcaster.disconnect(a.id()));
        assert_eq!(broadcaster.connection_count(), 1);
        drop(a);
        assert_eq!(broadcaster.connection_count(), 1);
    }

    #[test]
    fn test_disconnected_subscription_ends() {
        let broadcaster = Broadcaster::default();
        let mut a = broadcaster.accept();
        broadcaster.publish(text("before"));
        broadcaster.disconnect(a.id());
        broadcaster.publish(text("after"));
        assert_eq!(a.try_recv(), Some(text("before")));
        assert_eq!(a.try_recv(), None);
    }

    #[tokio::test]
    async fn test_removed_after_slow_consumer_eviction() {
        let broadcaster = Broadcaster::new(1, EchoPolicy::All, SlowConsumerPolicy::Disconnect);
        let mut slow = broadcaster.accept();
        broadcaster.publish(text("0"));
        assert!(timeout(Duration::from_millis(50), slow.removed()).await.is_err());
        broadcaster.publish(text("1"));
        timeout(Duration::from_secs(1), slow.removed()).await.unwrap();
        timeout(Duration::from_secs(1), slow.removed()).await.unwrap();
    }

    #[tokio::test]
    async fn test_removed_after_disconnect() {
        let broadcaster = Broadcaster::default();
        let mut a = broadcaster.accept();
        broadcaster.disconnect(a.id());
        timeout(Duration::from_secs(1), a.removed()).await.unwrap();
    }

    #[test]
    fn test_late_join() {
        let broadcaster = Broadcaster::default();
        let mut early = broadcaster.accept();
        broadcaster.publish(text("m1"));
        let mut late = broadcaster.accept();
        broadcaster.publish(text("m2"));
        assert_eq!(early.try_recv(), Some(text("m1")));
        assert_eq!(early.try_recv(), Some(text("m2")));
        assert_eq!(late.try_recv(), Some(text("m2")));
        assert_eq!(late.try_recv(), None);
    }

    #[test]
    fn test_slow_client_is_disconnected() {
        let broadcaster = Broadcaster::new(2, EchoPolicy::All, SlowConsumerPolicy::Disconnect);
        let slow = broadcaster.accept();
        let mut fast = broadcaster.accept();
        for n in 0..3 {
            broadcaster.publish(text(&n.to_string()));
            assert_eq!(fast.try_recv(), Some(text(&n.to_string())));
        }
        assert!(!broadcaster.is_connected(slow.id()));
        assert_eq!(broadcaster.publish(text("3")), 1);
        assert_eq!(fast.try_recv(), Some(text("3")));
    }

    #[test]
    fn test_slow_client_skips_messages() {
        let broadcaster = Broadcaster::new(2, EchoPolicy::All, SlowConsumerPolicy::Skip);
        let mut slow = broadcaster.accept();
        for n in 0..4 {
            broadcaster.publish(text(&n.to_string()));
        }
        assert!(broadcaster.is_connected(slow.id()));
        assert_eq!(slow.try_recv(), Some(text("0")));
        assert_eq!(slow.try_recv(), Some(text("1")));
        assert_eq!(slow.try_recv(), None);
        broadcaster.publish(text("4"));
        assert_eq!(slow.try_recv(), Some(text("4")));
    }

    #[test]
    fn test_echo_to_origin() {
        let broadcaster = Broadcaster::default();
        let mut a = broadcaster.accept();
        let mut b = broadcaster.accept();
        assert_eq!(a.publish(text("hello")), 2);
        assert_eq!(a.try_recv(), Some(text("hello")));
        assert_eq!(b.try_recv(), Some(text("hello")));
    }

    #[test]
    fn test_echo_excludes_origin() {
        let broadcaster = Broadcaster::new(8, EchoPolicy::ExcludeOrigin, SlowConsumerPolicy::Disconnect);
        let mut a = broadcaster.accept();
        let mut b = broadcaster.accept();
        assert_eq!(a.publish(text("hello")), 1);
        assert_eq!(a.try_recv(), None);
        assert_eq!(b.try_recv(), Some(text("hello")));
        assert_eq!(broadcaster.publish(text("upstream")), 2);
        assert_eq!(a.try_recv(), Some(text("upstream")));
    }

    #[tokio::test]
    async fn test_concurrent_publishers() {
        let broadcaster = Broadcaster::new(4096, EchoPolicy::All, SlowConsumerPolicy::Disconnect);
        let mut subscriptions: Vec<Subscription> = (0..4).map(|_| broadcaster.accept()).collect();
        let mut handles = vec![];
        for p in 0..4 {
            let broadcaster = broadcaster.clone();
            handles.push(tokio::spawn(async move {
                for n in 0..100 {
                    broadcaster.publish(text(&format!("{}-{}", p, n)));
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        for subscription in subscriptions.iter_mut() {
            let mut last_seen = [-1i64; 4];
            let mut received = 0;
            while let Some(Payload::Text(msg)) = subscription.try_recv() {
                let (p, n) = msg.split_once('-').unwrap();
                let (p, n): (usize, i64) = (p.parse().unwrap(), n.parse().unwrap());
                assert!(n > last_seen[p]);
                last_seen[p] = n;
                received += 1;
            }
            assert_eq!(received, 400);
        }
    }
}
