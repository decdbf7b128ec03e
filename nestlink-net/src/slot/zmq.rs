//! ZeroMQ PUB/SUB backend.
//!
//! Topics ride as the first frame of a two-part message, matching zmq's
//! prefix subscription model. Unlike the TCP backend there is no retained
//! frame replay; the protocol's rendezvous still works because the client
//! keeps answering commands, but a pulse published before the subscriber
//! finished connecting can be lost to the slow-joiner race.

use std::net::SocketAddr;
use std::time::Duration;

use crate::slot::Endpoint;
use crate::{Error, Result};

pub struct ZmqPublisher {
    inner: zmq::Socket,
    local_addr: SocketAddr,
}

impl ZmqPublisher {
    pub fn bind(ctx: &zmq::Context, addr: SocketAddr) -> Result<Self> {
        let socket = ctx.socket(zmq::PUB)?;
        socket.bind(&format!("tcp://{}", addr))?;
        let endpoint = socket
            .get_last_endpoint()?
            .map_err(|_| Error::Other("endpoint not utf-8".to_string()))?;
        let local_addr = endpoint
            .trim_start_matches("tcp://")
            .parse()
            .map_err(|e| Error::Other(format!("failed parsing bound endpoint: {}", e)))?;
        Ok(Self {
            inner: socket,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local_addr)
    }

    pub fn send(&self, topic: &str, bytes: Vec<u8>) -> Result<()> {
        self.inner.send(topic.as_bytes(), zmq::SNDMORE)?;
        self.inner.send(bytes, 0)?;
        Ok(())
    }
}

pub struct ZmqSubscriber {
    endpoint: Endpoint,
    inner: zmq::Socket,
    connected: bool,
}

impl ZmqSubscriber {
    pub fn new(ctx: &zmq::Context, endpoint: Endpoint) -> Result<Self> {
        let socket = ctx.socket(zmq::SUB)?;
        socket.set_subscribe(endpoint.topic.as_bytes())?;
        Ok(Self {
            endpoint,
            inner: socket,
            connected: false,
        })
    }

    /// zmq connects asynchronously and keeps retrying on its own, so this
    /// only registers the endpoint once.
    pub fn connect(&mut self) -> Result<()> {
        if !self.connected {
            self.inner
                .connect(&format!("tcp://{}", self.endpoint.addr))?;
            self.connected = true;
        }
        Ok(())
    }

    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        self.connect()?;
        self.inner.set_rcvtimeo(timeout.as_millis() as i32)?;
        let _topic = match self.inner.recv_bytes(0) {
            Ok(b) => b,
            Err(zmq::Error::EAGAIN) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if !self.inner.get_rcvmore()? {
            return Err(Error::Decode(format!(
                "missing payload frame from {}",
                self.endpoint
            )));
        }
        let payload = self.inner.recv_bytes(0)?;
        Ok(Some(payload))
    }
}
