//! Types shared by the relay components: the opaque payload, client handles,
//! delivery policies, configuration and the error type.

use std::fmt::{Display, Formatter};
use std::time::Duration;
use tokio_tungstenite::tungstenite::protocol::Message;


/// Default port the relay listens on for downstream clients.
pub const DEFAULT_LISTEN_PORT: u16 = 8080;
/// Default upstream feed: all Binance tickers, pushed every second.
pub const DEFAULT_UPSTREAM_URL: &str = "wss://stream.binance.com:9443/ws/!ticker@arr";
/// Default capacity of the outbound queue of each downstream client.
pub const DEFAULT_CLIENT_QUEUE_CAPACITY: usize = 1024;


/// A message passed through the relay without interpretation.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    /// Convert a WebSocket frame into a payload. Control frames carry no
    /// payload and return `None`.
    pub fn from_message(message: Message) -> Option<Payload> {
        match message {
            Message::Text(text) => Some(Payload::Text(text)),
            Message::Binary(data) => Some(Payload::Binary(data)),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Payload::Text(text) => text.len(),
            Payload::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Payload> for Message {
    fn from(value: Payload) -> Self {
        match value {
            Payload::Text(text) => Message::Text(text),
            Payload::Binary(data) => Message::Binary(data),
        }
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Text(value.to_string())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Text(value)
    }
}


/// Unique handle of a downstream connection, allocated by the
/// [Broadcaster](crate::broadcast::Broadcaster).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct ClientId(pub u64);

impl Display for ClientId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "client#{}", self.0)
    }
}


/// Whether a message received from a client is sent back to that client.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum EchoPolicy {
    /// Every connected client receives it, the origin included.
    #[default]
    All,
    /// Every connected client except the origin receives it.
    ExcludeOrigin,
}

/// What happens when the outbound queue of a client is full.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum SlowConsumerPolicy {
    /// The client is removed from the connection set, its pending write is
    /// abandoned and its socket closed.
    #[default]
    Disconnect,
    /// The payload is dropped for that client only.
    Skip,
}


/// Bounded exponential backoff used between upstream connection attempts.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct Backoff {
    /// Delay before the first retry.
    pub first: Duration,
    /// Upper bound of the delay.
    pub max: Duration,
    /// Growth factor between consecutive attempts.
    pub factor: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            first: Duration::from_millis(200),
            max: Duration::from_secs(30),
            factor: 2.0,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based): `first * factor^attempt`,
    /// capped at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exponent);
        if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}


/// Settings of a relay process.
#[derive(Clone, PartialEq, Debug)]
pub struct RelayConfig {
    /// TCP port of the downstream WebSocket server. `0` picks a free port.
    pub listen_port: u16,
    /// WebSocket URL of the upstream feed. Without it the relay only
    /// rebroadcasts what its clients send.
    pub upstream_url: Option<String>,
    pub echo_policy: EchoPolicy,
    pub slow_consumer_policy: SlowConsumerPolicy,
    pub client_queue_capacity: usize,
    pub backoff: Backoff,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_LISTEN_PORT,
            upstream_url: Some(DEFAULT_UPSTREAM_URL.to_string()),
            echo_policy: EchoPolicy::default(),
            slow_consumer_policy: SlowConsumerPolicy::default(),
            client_queue_capacity: DEFAULT_CLIENT_QUEUE_CAPACITY,
            backoff: Backoff::default(),
        }
    }
}


/// Errors raised by the relay components.
#[derive(Debug)]
pub enum RelayError {
    /// A connection could not be established or was lost.
    Connection(String),
    /// A frame could not be written to a client.
    Delivery,
    /// Invalid startup setting.
    Config(String),
    Io(std::io::Error),
}

impl Display for RelayError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayError::Connection(reason) => write!(f, "connection error: {}", reason),
            RelayError::Delivery => write!(f, "delivery error"),
            RelayError::Config(reason) => write!(f, "configuration error: {}", reason),
            RelayError::Io(error) => write!(f, "io error: {}", error),
        }
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RelayError::Io(error) => Some(error),
            _ => None,
        }
    }
}

impl From<std::io::Error> for RelayError {
    fn from(value: std::io::Error) -> Self {
        RelayError::Io(value)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_first_attempt() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(0), Duration::from_millis(200));
    }

    #[test]
    fn test_backoff_doubles() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(1), Duration::from_millis(400));
        assert_eq!(backoff.delay(3), Duration::from_millis(1600));
    }

    #[test]
    fn test_backoff_is_capped() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(20), Duration::from_secs(30));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_payload_from_control_frame() {
        assert_eq!(Payload::from_message(Message::Ping(vec![1])), None);
        assert_eq!(
            Payload::from_message(Message::Text("abc".to_string())),
            Some(Payload::Text("abc".to_string()))
        );
    }

    #[test]
    fn test_payload_into_message() {
        let message: Message = Payload::Binary(vec![1, 2, 3]).into();
        assert_eq!(message, Message::Binary(vec![1, 2, 3]));
    }

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.listen_port, DEFAULT_LISTEN_PORT);
        assert_eq!(config.upstream_url.as_deref(), Some(DEFAULT_UPSTREAM_URL));
        assert_eq!(config.echo_policy, EchoPolicy::All);
        assert_eq!(config.slow_consumer_policy, SlowConsumerPolicy::Disconnect);
    }
}
