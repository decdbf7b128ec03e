//! Pure-Rust TCP backend for pub/sub slots.
//!
//! Frames are length-prefixed byte blobs. A subscriber opens the
//! connection with a handshake naming the one topic it wants; the
//! publisher then only sends it frames for that topic. The publisher
//! keeps the last frame per topic and replays it to late subscribers,
//! so a pulse published during the subscribe race is not lost.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use fnv::FnvHashMap;

use crate::slot::Endpoint;
use crate::{Error, Result};

const ACCEPT_POLL: Duration = Duration::from_millis(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);
/// Upper bound on a decoded frame length. Anything larger means the
/// stream desynchronized and the prefix is garbage.
const MAX_FRAME: usize = 16 * 1024 * 1024;

struct SubConn {
    stream: TcpStream,
    topic: String,
}

#[derive(Default)]
struct PubShared {
    subs: Vec<SubConn>,
    retained: FnvHashMap<String, Vec<u8>>,
}

pub struct TcpPublisher {
    local_addr: SocketAddr,
    shared: Arc<Mutex<PubShared>>,
    cancel: Arc<AtomicBool>,
    accept_handle: Option<JoinHandle<()>>,
}

impl TcpPublisher {
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(Mutex::new(PubShared::default()));
        let cancel = Arc::new(AtomicBool::new(false));

        let shared_c = shared.clone();
        let cancel_c = cancel.clone();
        let accept_handle = std::thread::Builder::new()
            .name(format!("pub-accept-{}", local_addr.port()))
            .spawn(move || accept_loop(listener, shared_c, cancel_c))?;

        Ok(Self {
            local_addr,
            shared,
            cancel,
            accept_handle: Some(accept_handle),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local_addr)
    }

    pub fn send(&self, topic: &str, bytes: Vec<u8>) -> Result<()> {
        let mut frame = Vec::with_capacity(bytes.len() + 4);
        frame.write_u32::<LittleEndian>(bytes.len() as u32)?;
        frame.extend_from_slice(&bytes);

        let mut shared = self.shared.lock().unwrap();
        shared.retained.insert(topic.to_string(), frame.clone());
        // drop subscribers whose connection went away
        shared.subs.retain_mut(|sub| {
            if sub.topic != topic {
                return true;
            }
            match sub.stream.write_all(&frame) {
                Ok(()) => true,
                Err(e) => {
                    debug!("dropping subscriber for `{}`: {}", topic, e);
                    false
                }
            }
        });
        Ok(())
    }
}

impl Drop for TcpPublisher {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(handle) = self.accept_handle.take() {
            let _ = handle.join();
        }
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<Mutex<PubShared>>, cancel: Arc<AtomicBool>) {
    loop {
        if cancel.load(Ordering::Relaxed) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = admit_subscriber(stream, &shared) {
                    warn!("rejecting subscriber from {}: {}", peer, e);
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                error!("publisher accept failed: {}", e);
                break;
            }
        }
    }
}

/// Reads the topic handshake, replays the retained frame if one exists,
/// then registers the connection.
fn admit_subscriber(mut stream: TcpStream, shared: &Mutex<PubShared>) -> Result<()> {
    // accepted streams can inherit the listener's non-blocking mode
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
    // a subscriber that stops reading gets dropped instead of wedging
    // the sender behind the shared lock
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    stream.set_nodelay(true)?;

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = LittleEndian::read_u32(&len_buf) as usize;
    if len > 1024 {
        return Err(Error::Protocol(format!("topic name too long: {}", len)));
    }
    let mut topic_buf = vec![0u8; len];
    stream.read_exact(&mut topic_buf)?;
    let topic = String::from_utf8(topic_buf)
        .map_err(|e| Error::Protocol(format!("topic not utf-8: {}", e)))?;

    let mut shared = shared.lock().unwrap();
    if let Some(frame) = shared.retained.get(&topic) {
        stream.write_all(frame)?;
    }
    trace!("subscriber admitted for topic `{}`", topic);
    shared.subs.push(SubConn { stream, topic });
    Ok(())
}

pub struct TcpSubscriber {
    endpoint: Endpoint,
    stream: Option<TcpStream>,
    // bytes read off the stream that do not yet form a complete frame;
    // carried across polls so a prefix split over a timeout boundary is
    // never lost
    pending: Vec<u8>,
}

impl TcpSubscriber {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            stream: None,
            pending: Vec::new(),
        }
    }

    /// Single connection attempt with the given budget. `Ok(false)` means
    /// the publisher is not there yet.
    pub fn try_connect(&mut self, timeout: Duration) -> Result<bool> {
        if self.stream.is_some() {
            return Ok(true);
        }
        let mut stream = match TcpStream::connect_timeout(&self.endpoint.addr, timeout) {
            Ok(s) => s,
            Err(e) => {
                trace!("connect to {} failed: {}", self.endpoint, e);
                return Ok(false);
            }
        };
        stream.set_nodelay(true)?;
        let topic = self.endpoint.topic.as_bytes();
        let mut handshake = Vec::with_capacity(topic.len() + 4);
        handshake.write_u32::<LittleEndian>(topic.len() as u32)?;
        handshake.extend_from_slice(topic);
        stream.write_all(&handshake)?;
        self.pending.clear();
        self.stream = Some(stream);
        debug!("subscribed to {}", self.endpoint);
        Ok(true)
    }

    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let deadline = Instant::now() + timeout;
        if self.stream.is_none() {
            if !self.try_connect(timeout)? {
                // refused connects return immediately, keep the poll cadence
                std::thread::sleep(timeout.min(Duration::from_millis(50)));
                return Ok(None);
            }
        }
        loop {
            match take_frame(&mut self.pending) {
                Ok(Some(frame)) => return Ok(Some(frame)),
                Ok(None) => (),
                Err(e) => return Err(self.fail(&e.to_string())),
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let stream = self.stream.as_mut().unwrap();
            stream.set_read_timeout(Some(deadline - now))?;
            let mut chunk = [0u8; 4096];
            match stream.read(&mut chunk) {
                Ok(0) => return Err(self.fail("peer closed the stream")),
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(e)
                    if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
                {
                    return Ok(None)
                }
                Err(e) => return Err(self.fail(&e.to_string())),
            }
        }
    }

    fn fail(&mut self, reason: &str) -> Error {
        self.stream = None;
        self.pending.clear();
        Error::Connection(format!(
            "publisher at {} closed the channel: {}",
            self.endpoint, reason
        ))
    }
}

/// Pops one complete length-prefixed frame off the accumulator.
/// `Ok(None)` means more bytes are needed; an oversized length prefix is
/// a desynchronized stream.
fn take_frame(pending: &mut Vec<u8>) -> std::io::Result<Option<Vec<u8>>> {
    if pending.len() < 4 {
        return Ok(None);
    }
    let len = LittleEndian::read_u32(pending) as usize;
    if len > MAX_FRAME {
        return Err(std::io::Error::new(
            ErrorKind::InvalidData,
            format!("frame length {} exceeds the {} byte cap", len, MAX_FRAME),
        ));
    }
    if pending.len() < 4 + len {
        return Ok(None);
    }
    let frame = pending[4..4 + len].to_vec();
    pending.drain(..4 + len);
    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_pub() -> TcpPublisher {
        TcpPublisher::bind("127.0.0.1:0".parse().unwrap()).unwrap()
    }

    /// Hand-rolled publisher end that accepts one subscriber, drains its
    /// topic handshake and then hands the raw stream to `serve`.
    fn raw_publisher<F>(serve: F) -> SocketAddr
    where
        F: FnOnce(TcpStream) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut len_buf = [0u8; 4];
            stream.read_exact(&mut len_buf).unwrap();
            let mut topic = vec![0u8; LittleEndian::read_u32(&len_buf) as usize];
            stream.read_exact(&mut topic).unwrap();
            serve(stream);
        });
        addr
    }

    #[test]
    fn frame_reaches_subscriber() {
        let publisher = local_pub();
        let addr = publisher.local_addr().unwrap();
        let mut sub = TcpSubscriber::new(Endpoint::new(addr, "data"));
        assert!(sub.try_connect(Duration::from_secs(1)).unwrap());
        // give the accept loop a moment to register the handshake
        std::thread::sleep(Duration::from_millis(100));

        publisher.send("data", b"hello".to_vec()).unwrap();
        let frame = sub.recv_timeout(Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!(frame, b"hello");
    }

    #[test]
    fn topics_are_isolated() {
        let publisher = local_pub();
        let addr = publisher.local_addr().unwrap();
        let mut sub = TcpSubscriber::new(Endpoint::new(addr, "task_complete"));
        assert!(sub.try_connect(Duration::from_secs(1)).unwrap());
        std::thread::sleep(Duration::from_millis(100));

        publisher.send("nconnections", b"other".to_vec()).unwrap();
        assert!(sub
            .recv_timeout(Duration::from_millis(200))
            .unwrap()
            .is_none());
    }

    #[test]
    fn split_length_prefix_is_reassembled_across_polls() {
        let addr = raw_publisher(|mut stream| {
            let mut frame = Vec::new();
            frame.write_u32::<LittleEndian>(5).unwrap();
            frame.extend_from_slice(b"hello");
            // prefix split across the subscriber's poll boundary
            stream.write_all(&frame[..2]).unwrap();
            std::thread::sleep(Duration::from_millis(400));
            stream.write_all(&frame[2..]).unwrap();
            std::thread::sleep(Duration::from_millis(500));
        });

        let mut sub = TcpSubscriber::new(Endpoint::new(addr, "data"));
        assert!(sub.try_connect(Duration::from_secs(1)).unwrap());
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match sub.recv_timeout(Duration::from_millis(100)).unwrap() {
                Some(frame) => {
                    assert_eq!(frame, b"hello");
                    break;
                }
                None => assert!(Instant::now() < deadline, "frame never reassembled"),
            }
        }
    }

    #[test]
    fn oversized_length_prefix_fails_the_channel() {
        let addr = raw_publisher(|mut stream| {
            stream.write_u32::<LittleEndian>(u32::MAX).unwrap();
            std::thread::sleep(Duration::from_millis(500));
        });

        let mut sub = TcpSubscriber::new(Endpoint::new(addr, "data"));
        assert!(sub.try_connect(Duration::from_secs(1)).unwrap());
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match sub.recv_timeout(Duration::from_millis(100)) {
                Err(Error::Connection(_)) => break,
                Ok(None) => assert!(Instant::now() < deadline, "cap never enforced"),
                other => panic!("expected connection error, got: {:?}", other),
            }
        }
    }

    #[test]
    fn stalled_subscriber_is_dropped_instead_of_wedging_the_publisher() {
        let publisher = local_pub();
        let addr = publisher.local_addr().unwrap();
        // connects, then never reads
        let mut stalled = TcpSubscriber::new(Endpoint::new(addr, "data"));
        assert!(stalled.try_connect(Duration::from_secs(1)).unwrap());
        std::thread::sleep(Duration::from_millis(100));

        let payload = vec![0u8; 1024 * 1024];
        let started = Instant::now();
        for _ in 0..64 {
            publisher.send("data", payload.clone()).unwrap();
        }
        // once the socket buffers fill, the write times out exactly once
        // and the stalled connection is discarded
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn late_subscriber_gets_retained_frame() {
        let publisher = local_pub();
        let addr = publisher.local_addr().unwrap();
        publisher.send("task_complete", b"pulse".to_vec()).unwrap();

        let mut sub = TcpSubscriber::new(Endpoint::new(addr, "task_complete"));
        assert!(sub.try_connect(Duration::from_secs(1)).unwrap());
        let frame = sub.recv_timeout(Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!(frame, b"pulse");
    }
}
