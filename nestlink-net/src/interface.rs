//! Interface role: the driving side of the session.
//!
//! Owns the command publisher, the three inbound listeners and the
//! completion latch, and layers the barrier discipline on top: clear the
//! latch, publish exactly one command, block until the peer's completion
//! pulse sets the latch again. At most one command is in flight per
//! session; a timed-out barrier leaves the session back in `Ready`.

use std::net::SocketAddr;
use std::process::{Child, Command as ProcessCommand, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::cmd::{topic, Command};
use crate::listener::Listener;
use crate::msg::{FloatMessage, SlotMessage, StringMessage};
use crate::signal::CompletionLatch;
use crate::sim::NetworkSpec;
use crate::slot::{Encoding, Endpoint, PubSlot, TransportContext};
use crate::{Error, Result};

const MONITOR_POLL: Duration = Duration::from_millis(200);
/// Grace period for a result frame to trail its completion pulse; the
/// two travel on unrelated channels.
const RESULT_GRACE: Duration = Duration::from_secs(2);

/// Session configuration for the interface role.
#[derive(Clone, Debug)]
pub struct InterfaceConfig {
    /// Local address the command publisher binds
    pub bind_addr: SocketAddr,
    /// Address of the client's publisher
    pub client_addr: SocketAddr,
    pub encoding: Encoding,
    /// Deadline applied to every command barrier
    pub barrier_timeout: Duration,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:2001".parse().unwrap(),
            client_addr: "127.0.0.1:8000".parse().unwrap(),
            encoding: Encoding::Bincode,
            barrier_timeout: Duration::from_secs(10),
        }
    }
}

/// Lifecycle of one session, as seen by the command caller.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Ready,
    AwaitingCompletion,
    Terminated,
}

/// The driving side of a simulator session.
pub struct NestInterface {
    config: InterfaceConfig,
    data_pub: PubSlot,
    complete: Listener<FloatMessage>,
    nconnections: Listener<FloatMessage>,
    device_results: Listener<StringMessage>,
    latch: Arc<CompletionLatch>,
    state: SessionState,
    child: Option<Arc<Mutex<Child>>>,
    monitor_stop: Arc<AtomicBool>,
    monitor: Option<JoinHandle<()>>,
}

impl NestInterface {
    /// Binds all slots and starts the listeners. The subscribers connect
    /// lazily on their listener threads, so this does not require the
    /// client to be running yet.
    pub fn new(ctx: &TransportContext, config: InterfaceConfig) -> Result<Self> {
        let data_pub = ctx.publisher(config.bind_addr)?;
        let latch = Arc::new(CompletionLatch::new());

        let latch_c = latch.clone();
        let complete = Listener::spawn(
            "complete",
            ctx.subscriber(Endpoint::new(config.client_addr, topic::TASK_COMPLETE))?,
            config.encoding,
            Some(Box::new(move |_msg: &FloatMessage| {
                debug!("received complete signal");
                latch_c.set();
            })),
        )?;
        let nconnections = Listener::spawn(
            "nconnections",
            ctx.subscriber(Endpoint::new(config.client_addr, topic::NCONNECTIONS))?,
            config.encoding,
            None,
        )?;
        let device_results = Listener::spawn(
            "device_results",
            ctx.subscriber(Endpoint::new(config.client_addr, topic::DEVICE_RESULTS))?,
            config.encoding,
            Some(Box::new(|msg: &StringMessage| {
                info!("received device results: {}", msg.value);
            })),
        )?;

        Ok(Self {
            config,
            data_pub,
            complete,
            nconnections,
            device_results,
            latch,
            state: SessionState::Ready,
            child: None,
            monitor_stop: Arc::new(AtomicBool::new(false)),
            monitor: None,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Spawns the simulator-hosting client process and blocks until its
    /// initial ready pulse arrives. A monitor thread watches the child
    /// and fails any outstanding barrier if it exits.
    pub fn start_client(&mut self, program: &str, args: &[&str], silent: bool) -> Result<()> {
        // clear before spawning so the ready pulse cannot be missed
        self.latch.reset();
        self.state = SessionState::AwaitingCompletion;

        let mut command = ProcessCommand::new(program);
        command.args(args);
        if silent {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }
        let child = Arc::new(Mutex::new(command.spawn()?));
        info!("client process started");

        self.monitor_stop.store(false, Ordering::Relaxed);
        let stop = self.monitor_stop.clone();
        let latch = self.latch.clone();
        let child_c = child.clone();
        self.monitor = Some(std::thread::Builder::new()
            .name("client-monitor".to_string())
            .spawn(move || loop {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                match child_c.lock().unwrap().try_wait() {
                    Ok(Some(status)) => {
                        warn!("client process exited: {}", status);
                        latch.peer_died();
                        break;
                    }
                    Ok(None) => (),
                    Err(e) => {
                        error!("failed polling client process: {}", e);
                        break;
                    }
                }
                std::thread::sleep(MONITOR_POLL);
            })?);

        self.child = Some(child);
        self.finish_barrier()
    }

    /// Blocks until the client's initial ready pulse arrives. Used when
    /// the client process is managed externally instead of through
    /// [`start_client`](Self::start_client). The latch is deliberately
    /// not cleared first: a pulse that already arrived counts.
    pub fn wait_ready(&mut self) -> Result<()> {
        self.state = SessionState::AwaitingCompletion;
        self.finish_barrier()
    }

    /// Kills the client process, unblocks any pending wait and stops the
    /// listeners. The session cannot be used afterwards.
    pub fn shutdown(&mut self) {
        if self.state == SessionState::Terminated {
            return;
        }
        self.state = SessionState::Terminated;
        self.latch.terminate();
        self.monitor_stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.monitor.take() {
            let _ = handle.join();
        }
        if let Some(child) = self.child.take() {
            let mut child = child.lock().unwrap();
            if let Err(e) = child.kill() {
                debug!("client process already gone: {}", e);
            }
            let _ = child.wait();
            info!("client process terminated");
        }
        self.complete.shutdown();
        self.nconnections.shutdown();
        self.device_results.shutdown();
    }

    /// Clears and reinitializes all simulator state on the peer.
    pub fn reset(&mut self) -> Result<()> {
        self.barrier(&Command::Reset)?;
        info!("sent reset");
        Ok(())
    }

    /// Ships the network description; the peer constructs every layer
    /// before pulsing completion, so the network exists once this
    /// returns.
    pub fn build_network(&mut self, spec: &NetworkSpec) -> Result<()> {
        let json = serde_json::to_string(spec)?;
        self.barrier(&Command::MakeNetwork(json))?;
        info!("sent make network");
        Ok(())
    }

    /// Hands the device projections over for the next connect. Skipped
    /// entirely when the set is empty.
    pub fn send_device_projections(&mut self, projections: &str) -> Result<()> {
        if projections.is_empty() || projections == "[]" {
            return Ok(());
        }
        self.barrier(&Command::Projections(projections.to_string()))?;
        info!("sent projections");
        Ok(())
    }

    /// Connects both layer-layer and layer-device projections.
    pub fn connect_all(&mut self) -> Result<()> {
        self.barrier(&Command::Connect)?;
        info!("connection complete");
        Ok(())
    }

    /// Runs the simulation for `time_ms` milliseconds; the peer simulates
    /// synchronously before acknowledging.
    pub fn simulate(&mut self, time_ms: f64) -> Result<()> {
        debug!("sending simulate for {} ms", time_ms);
        self.barrier(&Command::Simulate(time_ms))
    }

    /// Asks the peer for its connection count and reads the answer off
    /// the numeric result listener.
    pub fn get_num_connections(&mut self) -> Result<u64> {
        let seq_before = self.nconnections.seq();
        self.barrier(&Command::GetNconnections)?;
        // the count rides a different channel than the pulse
        if !self.nconnections.wait_for_update(seq_before, RESULT_GRACE) {
            return Err(Error::Protocol(
                "completion pulse arrived without a connection count".to_string(),
            ));
        }
        let nconnections = self
            .nconnections
            .last_message()
            .map(|msg| msg.value as u64)
            .ok_or_else(|| Error::Protocol("no connection count received".to_string()))?;
        debug!("nconnections: {}", nconnections);
        Ok(nconnections)
    }

    /// Selects global ids matching the given criteria.
    pub fn query_selection(&mut self, selection: &serde_json::Value) -> Result<Vec<u64>> {
        let seq_before = self.device_results.seq();
        self.barrier(&Command::GetGids(serde_json::to_string(selection)?))?;
        if !self.device_results.wait_for_update(seq_before, RESULT_GRACE) {
            return Err(Error::Protocol(
                "completion pulse arrived without a selection result".to_string(),
            ));
        }
        let raw = self
            .device_results
            .last_message()
            .ok_or_else(|| Error::Protocol("no selection result received".to_string()))?;
        let gids: Vec<u64> = serde_json::from_str(&raw.value)?;
        Ok(gids)
    }

    /// Issues one command under the barrier: reset the latch, publish,
    /// wait for the completion pulse.
    fn barrier(&mut self, command: &Command) -> Result<()> {
        if self.state == SessionState::Terminated {
            return Err(Error::Terminated);
        }
        self.check_complete_channel()?;
        self.latch.reset();
        self.state = SessionState::AwaitingCompletion;
        debug!("sending `{}`", command.label());
        let msg = StringMessage::new(command.to_wire());
        self.data_pub
            .send(topic::DATA, msg.to_bytes(&self.config.encoding)?)?;
        self.finish_barrier()
    }

    fn finish_barrier(&mut self) -> Result<()> {
        match self.latch.wait(self.config.barrier_timeout) {
            Ok(()) => {
                self.state = SessionState::Ready;
                Ok(())
            }
            // the in-flight bookkeeping is cleared so later commands can
            // still be attempted
            Err(Error::TimedOut) => {
                self.state = SessionState::Ready;
                self.check_complete_channel()?;
                Err(Error::TimedOut)
            }
            Err(e) => {
                self.state = SessionState::Terminated;
                Err(e)
            }
        }
    }

    /// A completion listener that lost its channel can never set the
    /// latch again; that surfaces as a connection failure instead of an
    /// indistinguishable barrier timeout.
    fn check_complete_channel(&self) -> Result<()> {
        match self.complete.fault() {
            Some(fault) => Err(Error::Connection(format!(
                "completion channel lost: {}",
                fault
            ))),
            None => Ok(()),
        }
    }
}

impl Drop for NestInterface {
    fn drop(&mut self) {
        self.shutdown();
    }
}
