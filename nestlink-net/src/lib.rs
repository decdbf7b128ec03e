//! This library implements the control and synchronization layer used to
//! drive a NEST-style simulator hosted in a separate OS process.
//!
//! Two roles talk to each other over directional pub/sub *slots*:
//!
//! - the [`NestInterface`] role lives in the driving process; it publishes
//!   commands on its `data` slot and listens for completion pulses and
//!   query results coming back from the peer,
//! - the [`NestClient`] role lives next to the simulator; it listens for
//!   commands, executes them against a [`Simulator`] implementation and
//!   publishes exactly one completion pulse per handled command.
//!
//! Ordering between the two sides is established with the *barrier*
//! discipline: the interface clears its completion latch, publishes a
//! single command, then blocks until the latch is set by the listener that
//! drains the peer's `task_complete` slot. At most one command is ever in
//! flight per session.
//!
//! The transport underneath is deliberately minimal: a publisher binds one
//! port and serves topic-labeled byte frames to any number of subscribers.
//! A pure-Rust TCP backend is built in; a ZeroMQ backend is available
//! behind the `zmq_transport` crate feature.

#[macro_use]
extern crate serde;
#[macro_use]
extern crate log;

pub mod cmd;
pub mod msg;
pub mod sim;
pub mod slot;

mod client;
mod error;
mod interface;
mod listener;
mod signal;

pub use client::{ClientConfig, ClientShutdown, NestClient};
pub use interface::{InterfaceConfig, NestInterface, SessionState};
pub use listener::Listener;
pub use signal::CompletionLatch;
pub use sim::{RecordingSim, Simulator};
pub use slot::{Encoding, Endpoint, Transport, TransportContext};

pub use error::{Error, Result};
