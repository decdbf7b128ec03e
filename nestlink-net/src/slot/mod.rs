//! Minimal pub/sub slot adapter.
//!
//! A *slot* is a directional binding between one process role and a
//! transport endpoint. A [`PubSlot`] binds a port and serves topic-labeled
//! byte frames; a [`SubSlot`] connects to one remote publisher and drains
//! frames for a single topic. Slots are created once at coordinator
//! construction and never rebound.
//!
//! Backends are wrapped the same way the rest of the crate wraps
//! variants: a facade struct over a per-transport inner enum. The TCP
//! backend is always available; ZeroMQ sits behind the `zmq_transport`
//! feature.

use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::{Error, Result};

mod tcp;
#[cfg(feature = "zmq_transport")]
mod zmq;

/// Transport address plus the topic label identifying a logical slot at
/// that address. Immutable once bound.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub addr: SocketAddr,
    pub topic: String,
}

impl Endpoint {
    pub fn new<S: Into<String>>(addr: SocketAddr, topic: S) -> Self {
        Self {
            addr,
            topic: topic.into(),
        }
    }
}

impl FromStr for Endpoint {
    type Err = Error;
    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((addr, topic)) if !topic.is_empty() => Ok(Self {
                addr: addr.parse()?,
                topic: topic.to_string(),
            }),
            _ => Err(Error::Other(format!(
                "expected `host:port/topic`, got: {}",
                s
            ))),
        }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.topic)
    }
}

/// List of possible slot transports.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transport {
    /// Length-prefixed frames over plain TCP, built with the standard
    /// library. Retains the last frame per topic and replays it to late
    /// subscribers.
    Tcp,
    /// ZeroMQ PUB/SUB over TCP.
    ZmqTcp,
}

impl Display for Transport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::ZmqTcp => write!(f, "zmq_tcp"),
        }
    }
}

impl FromStr for Transport {
    type Err = Error;
    fn from_str(s: &str) -> core::result::Result<Self, Error> {
        match s.to_lowercase().as_str() {
            "tcp" => Ok(Transport::Tcp),
            "zmq_tcp" | "zmq" | "zeromq" => {
                #[cfg(feature = "zmq_transport")]
                return Ok(Transport::ZmqTcp);
                #[cfg(not(feature = "zmq_transport"))]
                return Err(Error::TransportUnavailable(format!(
                    "trying to use transport: {}, but crate feature zmq_transport is not enabled",
                    s
                )));
            }
            _ => Err(Error::Other(format!(
                "failed parsing transport from string: {}",
                s
            ))),
        }
    }
}

/// Knobs shared by both slot directions.
#[derive(Copy, Clone, Debug)]
pub struct SlotConfig {
    /// Encoding scheme used for typed messages on this slot
    pub encoding: Encoding,
    /// Budget for an eager `SubSlot::connect`
    pub connect_timeout: Duration,
    /// Pause between connection attempts
    pub retry_interval: Duration,
}

impl Default for SlotConfig {
    fn default() -> Self {
        Self {
            encoding: Encoding::Bincode,
            connect_timeout: Duration::from_secs(10),
            retry_interval: Duration::from_millis(100),
        }
    }
}

/// Explicit per-process transport context. Replaces process-global
/// transport initialization; create one at startup, pass it to the
/// coordinators, drop it on shutdown.
pub struct TransportContext {
    transport: Transport,
    config: SlotConfig,
    #[cfg(feature = "zmq_transport")]
    zmq_ctx: ::zmq::Context,
}

impl TransportContext {
    pub fn new(transport: Transport) -> Result<Self> {
        Self::new_with_config(transport, SlotConfig::default())
    }

    pub fn new_with_config(transport: Transport, config: SlotConfig) -> Result<Self> {
        #[cfg(not(feature = "zmq_transport"))]
        if transport == Transport::ZmqTcp {
            return Err(Error::TransportUnavailable(transport.to_string()));
        }
        Ok(Self {
            transport,
            config,
            #[cfg(feature = "zmq_transport")]
            zmq_ctx: ::zmq::Context::new(),
        })
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn config(&self) -> SlotConfig {
        self.config
    }

    /// Binds a publisher slot on the given local address.
    pub fn publisher(&self, addr: SocketAddr) -> Result<PubSlot> {
        let inner = match self.transport {
            Transport::Tcp => InnerPub::Tcp(tcp::TcpPublisher::bind(addr)?),
            Transport::ZmqTcp => {
                #[cfg(not(feature = "zmq_transport"))]
                return Err(Error::TransportUnavailable(self.transport.to_string()));
                #[cfg(feature = "zmq_transport")]
                InnerPub::Zmq(zmq::ZmqPublisher::bind(&self.zmq_ctx, addr)?)
            }
        };
        Ok(PubSlot { inner })
    }

    /// Creates a subscriber slot for the given remote endpoint. The
    /// connection itself is established lazily on the receiving thread,
    /// retrying until the peer's publisher exists; use
    /// [`SubSlot::connect`] to force an eagerly bounded connect.
    pub fn subscriber(&self, endpoint: Endpoint) -> Result<SubSlot> {
        let inner = match self.transport {
            Transport::Tcp => InnerSub::Tcp(tcp::TcpSubscriber::new(endpoint.clone())),
            Transport::ZmqTcp => {
                #[cfg(not(feature = "zmq_transport"))]
                return Err(Error::TransportUnavailable(self.transport.to_string()));
                #[cfg(feature = "zmq_transport")]
                InnerSub::Zmq(zmq::ZmqSubscriber::new(&self.zmq_ctx, endpoint.clone())?)
            }
        };
        Ok(SubSlot {
            endpoint,
            config: self.config,
            inner,
        })
    }
}

/// Outbound slot: binds one port, serves many topics.
pub struct PubSlot {
    inner: InnerPub,
}

enum InnerPub {
    Tcp(tcp::TcpPublisher),
    #[cfg(feature = "zmq_transport")]
    Zmq(zmq::ZmqPublisher),
}

impl PubSlot {
    /// Publishes one frame under the given topic. Fire-and-forget: does
    /// not block on subscriber presence and gives no delivery
    /// confirmation.
    pub fn send(&self, topic: &str, bytes: Vec<u8>) -> Result<()> {
        match &self.inner {
            InnerPub::Tcp(p) => p.send(topic, bytes),
            #[cfg(feature = "zmq_transport")]
            InnerPub::Zmq(p) => p.send(topic, bytes),
        }
    }

    /// Address the publisher actually bound, useful with port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        match &self.inner {
            InnerPub::Tcp(p) => p.local_addr(),
            #[cfg(feature = "zmq_transport")]
            InnerPub::Zmq(p) => p.local_addr(),
        }
    }
}

/// Inbound slot: drains frames for one topic from one remote publisher.
pub struct SubSlot {
    endpoint: Endpoint,
    config: SlotConfig,
    inner: InnerSub,
}

enum InnerSub {
    Tcp(tcp::TcpSubscriber),
    #[cfg(feature = "zmq_transport")]
    Zmq(zmq::ZmqSubscriber),
}

impl SubSlot {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Eagerly connects to the remote publisher, retrying until the
    /// configured connect budget is exhausted.
    pub fn connect(&mut self) -> Result<()> {
        let deadline = std::time::Instant::now() + self.config.connect_timeout;
        loop {
            match &mut self.inner {
                InnerSub::Tcp(s) => {
                    if s.try_connect(self.config.retry_interval)? {
                        return Ok(());
                    }
                }
                #[cfg(feature = "zmq_transport")]
                InnerSub::Zmq(s) => return s.connect(),
            }
            if std::time::Instant::now() >= deadline {
                return Err(Error::Connection(format!(
                    "publisher at {} unreachable after {:?}",
                    self.endpoint, self.config.connect_timeout
                )));
            }
            std::thread::sleep(self.config.retry_interval);
        }
    }

    /// Blocks for up to `timeout`, returning `Ok(None)` when no frame
    /// arrived within it. Connects lazily when needed, so the very first
    /// polls may be spent waiting for the peer's publisher to appear.
    /// Queued frames are never dropped; a closed channel surfaces as
    /// `Error::Connection`.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        match &mut self.inner {
            InnerSub::Tcp(s) => s.recv_timeout(timeout),
            #[cfg(feature = "zmq_transport")]
            InnerSub::Zmq(s) => s.recv_timeout(timeout),
        }
    }
}

/// List of possible formats for encoding typed messages.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize_repr, Serialize_repr)]
#[repr(u8)]
pub enum Encoding {
    /// Fast binary format, the default between Rust processes
    Bincode,
    /// Verbose but language-agnostic
    Json,
}

impl FromStr for Encoding {
    type Err = Error;
    fn from_str(s: &str) -> core::result::Result<Self, Error> {
        match s.to_lowercase().as_str() {
            "bincode" | "bin" => Ok(Self::Bincode),
            "json" => Ok(Self::Json),
            _ => Err(Error::Other(format!(
                "failed parsing encoding from string: {}",
                s
            ))),
        }
    }
}

impl Display for Encoding {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bincode => write!(f, "bincode"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Packs a serializable object to bytes based on selected encoding.
pub fn pack<S: Serialize>(obj: &S, encoding: &Encoding) -> Result<Vec<u8>> {
    let packed = match encoding {
        Encoding::Bincode => bincode::serialize(obj)?,
        Encoding::Json => serde_json::to_vec(obj)?,
    };
    Ok(packed)
}

/// Unpacks an object from bytes based on selected encoding.
pub fn unpack<P: DeserializeOwned>(bytes: &[u8], encoding: &Encoding) -> Result<P> {
    let unpacked = match encoding {
        Encoding::Bincode => {
            bincode::deserialize(bytes).map_err(|e| Error::Decode(e.to_string()))?
        }
        Encoding::Json => serde_json::from_slice(bytes).map_err(|e| Error::Decode(e.to_string()))?,
    };
    Ok(unpacked)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parse_and_display() {
        let ep: Endpoint = "127.0.0.1:8000/task_complete".parse().unwrap();
        assert_eq!(ep.addr.port(), 8000);
        assert_eq!(ep.topic, "task_complete");
        assert_eq!(ep.to_string(), "127.0.0.1:8000/task_complete");
    }

    #[test]
    fn endpoint_requires_topic() {
        assert!("127.0.0.1:8000".parse::<Endpoint>().is_err());
        assert!("127.0.0.1:8000/".parse::<Endpoint>().is_err());
    }

    #[test]
    fn subscriber_connect_fails_when_unreachable() {
        let config = SlotConfig {
            connect_timeout: Duration::from_millis(200),
            retry_interval: Duration::from_millis(50),
            ..Default::default()
        };
        let ctx = TransportContext::new_with_config(Transport::Tcp, config).unwrap();
        // port 9 (discard) is assumed to have no listener
        let mut sub = ctx
            .subscriber("127.0.0.1:9/data".parse().unwrap())
            .unwrap();
        match sub.connect() {
            Err(Error::Connection(_)) => (),
            other => panic!("expected connection error, got: {:?}", other),
        }
    }
}
