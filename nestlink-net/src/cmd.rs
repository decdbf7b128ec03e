//! Command vocabulary shared by the two session roles.
//!
//! Commands travel as string messages on the interface's `data` slot:
//! a case-sensitive label, optionally followed by a single space and a
//! string-encoded argument (JSON for structured data, a stringified
//! number for `simulate`). Transport-level delivery is fire-and-forget;
//! acknowledgement is layered on top via the completion pulse.

use crate::{Error, Result};

/// Well-known topic labels used by the protocol.
pub mod topic {
    /// Interface-bound slot carrying command lines.
    pub const DATA: &str = "data";
    /// Completion pulses published by the client after each command.
    pub const TASK_COMPLETE: &str = "task_complete";
    /// Connection counts answering `get_nconnections`.
    pub const NCONNECTIONS: &str = "nconnections";
    /// Structured string results: device recordings and `get_gids` answers.
    pub const DEVICE_RESULTS: &str = "device_results";
}

/// Instruction sent from the interface to the simulator-hosting client.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// Clear and reinitialize all simulator state.
    Reset,
    /// Construct the network described by the JSON topology spec.
    MakeNetwork(String),
    /// Store device projections to apply on the next `Connect`.
    Projections(String),
    /// Connect all projections, both layer-layer and layer-device.
    Connect,
    /// Run the simulation for the given duration in milliseconds.
    Simulate(f64),
    /// Report the current connection count on the `nconnections` slot.
    GetNconnections,
    /// Select ids matching the JSON criteria, answered on `device_results`.
    GetGids(String),
}

impl Command {
    pub fn label(&self) -> &'static str {
        match self {
            Command::Reset => "reset",
            Command::MakeNetwork(_) => "make_network",
            Command::Projections(_) => "projections",
            Command::Connect => "connect",
            Command::Simulate(_) => "simulate",
            Command::GetNconnections => "get_nconnections",
            Command::GetGids(_) => "get_gids",
        }
    }

    /// Serializes to the wire form: `label[ argument]`.
    pub fn to_wire(&self) -> String {
        match self {
            Command::Reset | Command::Connect | Command::GetNconnections => {
                self.label().to_string()
            }
            Command::MakeNetwork(json) | Command::Projections(json) | Command::GetGids(json) => {
                format!("{} {}", self.label(), json)
            }
            Command::Simulate(t) => format!("{} {}", self.label(), t),
        }
    }

    /// Parses a received command line. Unknown labels and missing or
    /// malformed arguments are protocol errors; the dispatch loop logs
    /// them and keeps going.
    pub fn from_wire(line: &str) -> Result<Command> {
        let (label, arg) = match line.split_once(' ') {
            Some((l, a)) => (l, Some(a)),
            None => (line, None),
        };
        let require_arg = || {
            arg.map(|a| a.to_string())
                .ok_or_else(|| Error::Protocol(format!("command `{}` requires an argument", label)))
        };
        match label {
            "reset" => Ok(Command::Reset),
            "connect" => Ok(Command::Connect),
            "get_nconnections" => Ok(Command::GetNconnections),
            "make_network" => Ok(Command::MakeNetwork(require_arg()?)),
            "projections" => Ok(Command::Projections(require_arg()?)),
            "get_gids" => Ok(Command::GetGids(require_arg()?)),
            "simulate" => {
                let t = require_arg()?.parse::<f64>().map_err(|e| {
                    Error::Protocol(format!("bad simulate duration `{:?}`: {}", arg, e))
                })?;
                Ok(Command::Simulate(t))
            }
            _ => Err(Error::Protocol(format!("unknown command label: {}", label))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip() {
        let cmds = vec![
            Command::Reset,
            Command::Connect,
            Command::GetNconnections,
            Command::MakeNetwork("{\"layers\":[]}".to_string()),
            Command::Projections("[]".to_string()),
            Command::GetGids("{\"x\":0}".to_string()),
            Command::Simulate(500.0),
        ];
        for cmd in cmds {
            assert_eq!(Command::from_wire(&cmd.to_wire()).unwrap(), cmd);
        }
    }

    #[test]
    fn argument_may_contain_spaces() {
        let cmd = Command::from_wire("make_network {\"layers\": [1, 2]}").unwrap();
        assert_eq!(
            cmd,
            Command::MakeNetwork("{\"layers\": [1, 2]}".to_string())
        );
    }

    #[test]
    fn unknown_label_is_a_protocol_error() {
        match Command::from_wire("explode now") {
            Err(Error::Protocol(_)) => (),
            other => panic!("expected protocol error, got: {:?}", other),
        }
    }

    #[test]
    fn labels_are_case_sensitive() {
        assert!(Command::from_wire("Reset").is_err());
    }

    #[test]
    fn missing_argument_is_a_protocol_error() {
        assert!(Command::from_wire("make_network").is_err());
        assert!(Command::from_wire("simulate").is_err());
        assert!(Command::from_wire("simulate abc").is_err());
    }
}
