//! Observe loop draining one inbound slot on its own thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::msg::SlotMessage;
use crate::slot::{Encoding, SubSlot};
use crate::Result;

const RECV_POLL: Duration = Duration::from_millis(100);
const UPDATE_POLL: Duration = Duration::from_millis(5);

/// Callback invoked synchronously on the listener thread for every
/// decoded message. Must be short and non-blocking; anything
/// long-running belongs on a work queue consumed elsewhere.
pub type Callback<M> = Box<dyn Fn(&M) + Send>;

/// A dedicated thread that drains one subscriber slot: receive, decode,
/// publish a snapshot, fan out to the callback.
///
/// The snapshot is a mutex-guarded copy, safe to read from any thread. A
/// monotonically increasing sequence number counts delivered messages and
/// doubles as a liveness indicator. Malformed frames are logged and
/// skipped; the loop only stops on cancellation or when the channel
/// closes underneath it, in which case the terminal failure is recorded
/// and readable through [`fault`](Self::fault).
pub struct Listener<M: SlotMessage> {
    name: String,
    last: Arc<Mutex<Option<M>>>,
    seq: Arc<AtomicU64>,
    fault: Arc<Mutex<Option<String>>>,
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl<M: SlotMessage> Listener<M> {
    /// Starts observing the given slot. Runs until [`shutdown`](Self::shutdown)
    /// or drop.
    pub fn spawn(
        name: &str,
        mut slot: SubSlot,
        encoding: Encoding,
        callback: Option<Callback<M>>,
    ) -> Result<Self> {
        let last = Arc::new(Mutex::new(None));
        let seq = Arc::new(AtomicU64::new(0));
        let fault = Arc::new(Mutex::new(None));
        let cancel = Arc::new(AtomicBool::new(false));

        let thread_name = format!("observe-{}", name);
        let name_c = name.to_string();
        let last_c = last.clone();
        let seq_c = seq.clone();
        let fault_c = fault.clone();
        let cancel_c = cancel.clone();

        let handle = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || loop {
                if cancel_c.load(Ordering::Relaxed) {
                    break;
                }
                let bytes = match slot.recv_timeout(RECV_POLL) {
                    Ok(Some(bytes)) => bytes,
                    Ok(None) => continue,
                    Err(e) => {
                        error!("listener `{}` lost its channel: {}", name_c, e);
                        *fault_c.lock().unwrap() = Some(e.to_string());
                        break;
                    }
                };
                match M::from_bytes(&bytes, &encoding) {
                    Ok(msg) => {
                        *last_c.lock().unwrap() = Some(msg.clone());
                        if let Some(cb) = &callback {
                            cb(&msg);
                        }
                        seq_c.fetch_add(1, Ordering::Release);
                    }
                    // message-local failure, keep draining
                    Err(e) => warn!("listener `{}` dropping malformed frame: {}", name_c, e),
                }
            })?;

        Ok(Self {
            name: name.to_string(),
            last,
            seq,
            fault,
            cancel,
            handle: Some(handle),
        })
    }

    /// Terminal transport failure that stopped the observe loop, if any.
    /// A faulted listener will never deliver another message.
    pub fn fault(&self) -> Option<String> {
        self.fault.lock().unwrap().clone()
    }

    /// Non-blocking snapshot of the most recently decoded message.
    pub fn last_message(&self) -> Option<M> {
        self.last.lock().unwrap().clone()
    }

    /// Number of messages delivered so far.
    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Waits until the delivery count moves past `prev_seq`. Used to
    /// bridge the gap between the completion slot and a result slot,
    /// which carry no ordering relative to each other.
    pub fn wait_for_update(&self, prev_seq: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.seq() <= prev_seq {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(UPDATE_POLL);
        }
        true
    }

    /// Stops the observe loop and joins the thread.
    pub fn shutdown(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("listener `{}` panicked", self.name);
            }
        }
    }
}

impl<M: SlotMessage> Drop for Listener<M> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::FloatMessage;
    use crate::slot::{Endpoint, Transport, TransportContext};
    use std::sync::mpsc;

    fn loopback() -> (crate::slot::PubSlot, TransportContext, std::net::SocketAddr) {
        let ctx = TransportContext::new(Transport::Tcp).unwrap();
        let publisher = ctx.publisher("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = publisher.local_addr().unwrap();
        (publisher, ctx, addr)
    }

    #[test]
    fn delivers_snapshot_and_callback() {
        let (publisher, ctx, addr) = loopback();
        let sub = ctx.subscriber(Endpoint::new(addr, "nconnections")).unwrap();

        let (tx, rx) = mpsc::channel();
        let listener = Listener::<FloatMessage>::spawn(
            "nconnections",
            sub,
            Encoding::Bincode,
            Some(Box::new(move |m: &FloatMessage| {
                tx.send(m.value).unwrap();
            })),
        )
        .unwrap();

        let msg = FloatMessage::new(42.0);
        publisher
            .send("nconnections", msg.to_bytes(&Encoding::Bincode).unwrap())
            .unwrap();

        let value = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(value, 42.0);
        assert!(listener.wait_for_update(0, Duration::from_secs(1)));
        assert_eq!(listener.last_message().unwrap().value, 42.0);
        assert_eq!(listener.seq(), 1);
    }

    #[test]
    fn malformed_frame_does_not_stop_the_loop() {
        let (publisher, ctx, addr) = loopback();
        let sub = ctx.subscriber(Endpoint::new(addr, "task_complete")).unwrap();
        let listener =
            Listener::<FloatMessage>::spawn("task_complete", sub, Encoding::Bincode, None).unwrap();

        // not a valid FloatMessage
        publisher.send("task_complete", vec![0xde]).unwrap();
        let good = FloatMessage::new(1.0);
        publisher
            .send("task_complete", good.to_bytes(&Encoding::Bincode).unwrap())
            .unwrap();

        assert!(listener.wait_for_update(0, Duration::from_secs(5)));
        assert_eq!(listener.last_message().unwrap().value, 1.0);
    }

    #[test]
    fn channel_death_is_recorded_as_a_fault() {
        let (publisher, ctx, addr) = loopback();
        let sub = ctx.subscriber(Endpoint::new(addr, "data")).unwrap();
        let listener =
            Listener::<FloatMessage>::spawn("data", sub, Encoding::Bincode, None).unwrap();
        // let the observe thread establish its subscription
        std::thread::sleep(Duration::from_millis(300));
        assert!(listener.fault().is_none());

        drop(publisher);
        let deadline = Instant::now() + Duration::from_secs(5);
        while listener.fault().is_none() {
            assert!(Instant::now() < deadline, "fault never recorded");
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}
