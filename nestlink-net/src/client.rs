//! Client role: the simulator-hosting side of the session.
//!
//! The command listener only decodes and enqueues; a dedicated dispatch
//! loop pulls commands off a single-consumer queue and executes them
//! against the [`Simulator`] in arrival order, so a slow simulator
//! operation never stalls frame delivery. Exactly one completion pulse
//! is published per handled command, plus one initial pulse at startup
//! so the interface's first barrier cannot deadlock on a client that is
//! still initializing.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use fnv::FnvHashMap;
use serde_json::Value;

use crate::cmd::{topic, Command};
use crate::listener::Listener;
use crate::msg::{FloatMessage, SlotMessage, StringMessage};
use crate::sim::{LayerDefinition, LayerHandle, NetworkSpec, Simulator};
use crate::slot::{Encoding, Endpoint, PubSlot, TransportContext};
use crate::Result;

const DISPATCH_POLL: Duration = Duration::from_millis(100);

/// Session configuration for the client role. Mirror image of the
/// interface config: we bind the result publisher and subscribe to the
/// interface's command slot.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Local address the result publisher binds
    pub bind_addr: SocketAddr,
    /// Address of the interface's command publisher
    pub interface_addr: SocketAddr,
    pub encoding: Encoding,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".parse().unwrap(),
            interface_addr: "127.0.0.1:2001".parse().unwrap(),
            encoding: Encoding::Bincode,
        }
    }
}

/// Cancellation handle for a running client, cloneable across threads.
#[derive(Clone)]
pub struct ClientShutdown {
    cancel: Arc<AtomicBool>,
}

impl ClientShutdown {
    pub fn shutdown(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }
}

/// The simulator-hosting side of a session.
pub struct NestClient {
    config: ClientConfig,
    result_pub: PubSlot,
    // kept alive for the lifetime of the session
    _command_listener: Listener<StringMessage>,
    queue: Receiver<Command>,
    sim: Box<dyn Simulator>,
    layers: FnvHashMap<String, LayerHandle>,
    device_projections: Vec<Value>,
    cancel: Arc<AtomicBool>,
}

impl NestClient {
    /// Binds the result publisher, subscribes to the command slot and
    /// starts the decode listener.
    pub fn new(
        ctx: &TransportContext,
        config: ClientConfig,
        sim: Box<dyn Simulator>,
    ) -> Result<Self> {
        let result_pub = ctx.publisher(config.bind_addr)?;

        let (tx, rx): (Sender<Command>, Receiver<Command>) = unbounded();
        let command_listener = Listener::spawn(
            "command",
            ctx.subscriber(Endpoint::new(config.interface_addr, topic::DATA))?,
            config.encoding,
            Some(Box::new(move |msg: &StringMessage| {
                // decode only; execution happens on the dispatch thread
                match Command::from_wire(&msg.value) {
                    Ok(command) => {
                        let _ = tx.send(command);
                    }
                    Err(e) => warn!("ignoring bad command line: {}", e),
                }
            })),
        )?;

        Ok(Self {
            config,
            result_pub,
            _command_listener: command_listener,
            queue: rx,
            sim,
            layers: FnvHashMap::default(),
            device_projections: Vec::new(),
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Handle that stops [`run`](Self::run) from another thread.
    pub fn shutdown_handle(&self) -> ClientShutdown {
        ClientShutdown {
            cancel: self.cancel.clone(),
        }
    }

    /// Dispatch loop: announces readiness, then executes commands in
    /// arrival order until shut down. Simulator failures are logged and
    /// acknowledged anyway so the interface never hangs on a failed
    /// operation.
    pub fn run(&mut self) -> Result<()> {
        self.send_complete_signal()?;
        info!("client ready, starting to observe");
        loop {
            match self.queue.recv_timeout(DISPATCH_POLL) {
                Ok(command) => {
                    let label = command.label();
                    if let Err(e) = self.dispatch(command) {
                        error!("`{}` failed: {}", label, e);
                    }
                    self.send_complete_signal()?;
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.cancel.load(Ordering::Relaxed) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("client stopping");
        Ok(())
    }

    /// Publishes one completion pulse.
    fn send_complete_signal(&self) -> Result<()> {
        let msg = FloatMessage::new(1.0);
        self.result_pub
            .send(topic::TASK_COMPLETE, msg.to_bytes(&self.config.encoding)?)
    }

    fn dispatch(&mut self, command: Command) -> Result<()> {
        debug!("handling `{}`", command.label());
        match command {
            Command::Reset => {
                self.layers.clear();
                self.device_projections.clear();
                self.sim.reset_all_state()
            }
            Command::MakeNetwork(json) => self.handle_make_network(&json),
            Command::Projections(json) => {
                self.device_projections = serde_json::from_str(&json)?;
                Ok(())
            }
            Command::Connect => self.sim.connect(&self.device_projections),
            Command::Simulate(time_ms) => self.sim.run(time_ms),
            Command::GetNconnections => self.handle_get_nconnections(),
            Command::GetGids(json) => self.handle_get_gids(&json),
        }
    }

    /// Builds every layer named in the spec. The completion pulse for
    /// this command is only sent once all layers exist.
    fn handle_make_network(&mut self, json: &str) -> Result<()> {
        let spec: NetworkSpec = serde_json::from_str(json)?;
        for layer in &spec.layers {
            let def = LayerDefinition::from_spec(layer, &spec.models, spec.is_3d);
            let handle = self.sim.create_layer(&def)?;
            self.layers.insert(layer.name.clone(), handle);
        }
        debug!("constructed {} layers", self.layers.len());
        Ok(())
    }

    /// The count is published before the pulse; the interface reads it
    /// off its numeric listener after the barrier returns.
    fn handle_get_nconnections(&mut self) -> Result<()> {
        let nconnections = self.sim.count_connections()?;
        let msg = FloatMessage::new(nconnections as f64);
        self.result_pub
            .send(topic::NCONNECTIONS, msg.to_bytes(&self.config.encoding)?)
    }

    fn handle_get_gids(&mut self, json: &str) -> Result<()> {
        let criteria: Value = serde_json::from_str(json)?;
        let gids = self.sim.select(&criteria)?;
        let msg = StringMessage::new(serde_json::to_string(&gids)?);
        self.result_pub
            .send(topic::DEVICE_RESULTS, msg.to_bytes(&self.config.encoding)?)
    }
}
