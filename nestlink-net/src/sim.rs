//! Simulator collaborator interface and the topology data model.
//!
//! The actual simulator is an external collaborator; this crate only
//! sequences its operations. [`Simulator`] is the seam the client role
//! dispatches into. The topology types mirror the JSON the interface
//! side hands over as an opaque payload: layers with explicit neuron
//! positions, a model alias table, and a flag selecting 2-D or 3-D
//! geometry.

use fnv::FnvHashMap;
use serde_json::Value;
use std::sync::{Arc, Mutex};

use crate::Result;

/// Opaque handle to a constructed layer.
pub type LayerHandle = u64;

/// Operations the client role invokes against the hosted simulator.
/// Implementations map their own failures into [`crate::Error::Simulation`].
pub trait Simulator: Send {
    /// Clears and reinitializes all simulator state.
    fn reset_all_state(&mut self) -> Result<()>;
    /// Constructs one layer from resolved geometry and elements.
    fn create_layer(&mut self, layer: &LayerDefinition) -> Result<LayerHandle>;
    /// Connects the given projections, both layer-layer and layer-device.
    fn connect(&mut self, projections: &[Value]) -> Result<()>;
    /// Runs the simulation for the given duration in milliseconds.
    fn run(&mut self, duration_ms: f64) -> Result<()>;
    /// Current number of connections in the network.
    fn count_connections(&self) -> Result<u64>;
    /// Ids of elements matching the selection criteria.
    fn select(&self, criteria: &Value) -> Result<Vec<u64>>;
}

/// Network description as received on the wire.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NetworkSpec {
    pub layers: Vec<LayerSpec>,
    /// Model alias table: user-facing name to concrete simulator model
    #[serde(default)]
    pub models: FnvHashMap<String, String>,
    #[serde(rename = "is3DLayer", default)]
    pub is_3d: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LayerSpec {
    pub name: String,
    pub neurons: Vec<NeuronPos>,
    pub elements: ElementSpec,
    pub extent: Vec<f64>,
    pub center: Vec<f64>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NeuronPos {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub z: Option<f64>,
}

/// Layer elements: a single model name or a composite list mixing model
/// names and per-model counts.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ElementSpec {
    Name(String),
    Composite(Vec<ElementItem>),
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ElementItem {
    Name(String),
    Count(u64),
}

impl ElementSpec {
    /// Resolves model aliases through the spec's model table. Names
    /// without an alias entry pass through unchanged.
    pub fn resolve(&self, models: &FnvHashMap<String, String>) -> ElementSpec {
        let lookup = |name: &String| models.get(name).cloned().unwrap_or_else(|| name.clone());
        match self {
            ElementSpec::Name(name) => ElementSpec::Name(lookup(name)),
            ElementSpec::Composite(items) => ElementSpec::Composite(
                items
                    .iter()
                    .map(|item| match item {
                        ElementItem::Name(name) => ElementItem::Name(lookup(name)),
                        ElementItem::Count(n) => ElementItem::Count(*n),
                    })
                    .collect(),
            ),
        }
    }
}

/// What `create_layer` actually receives: positions flattened to the
/// layer dimensionality, extent and center truncated to match, aliases
/// resolved.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LayerDefinition {
    pub name: String,
    pub positions: Vec<Vec<f64>>,
    pub extent: Vec<f64>,
    pub center: Vec<f64>,
    pub elements: ElementSpec,
}

impl LayerDefinition {
    /// Lowers one wire-form layer into the form handed to the simulator.
    /// For 2-D networks the third extent/center component is dropped, the
    /// way the original topology payloads carry a trailing z entry.
    pub fn from_spec(layer: &LayerSpec, models: &FnvHashMap<String, String>, is_3d: bool) -> Self {
        let positions = layer
            .neurons
            .iter()
            .map(|n| {
                if is_3d {
                    vec![n.x, n.y, n.z.unwrap_or(0.0)]
                } else {
                    vec![n.x, n.y]
                }
            })
            .collect();
        let dims = if is_3d { 3 } else { 2 };
        Self {
            name: layer.name.clone(),
            positions,
            extent: layer.extent.iter().take(dims).copied().collect(),
            center: layer.center.iter().take(dims).copied().collect(),
            elements: layer.elements.resolve(models),
        }
    }
}

/// Shared view into a [`RecordingSim`], for inspection from outside the
/// client that owns the simulator.
#[derive(Default, Debug)]
pub struct RecordingState {
    pub resets: u64,
    pub layers: Vec<LayerDefinition>,
    pub connections: u64,
    pub connected_projections: Vec<Value>,
    pub simulated_ms: f64,
}

/// In-memory stand-in for the external simulator process. Records every
/// operation; used by the bundled client binary and the protocol tests.
#[derive(Clone, Default)]
pub struct RecordingSim {
    state: Arc<Mutex<RecordingState>>,
}

impl RecordingSim {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for inspecting recorded state while the sim itself lives
    /// inside a client.
    pub fn state(&self) -> Arc<Mutex<RecordingState>> {
        self.state.clone()
    }
}

impl Simulator for RecordingSim {
    fn reset_all_state(&mut self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.resets += 1;
        state.layers.clear();
        state.connections = 0;
        state.connected_projections.clear();
        state.simulated_ms = 0.0;
        Ok(())
    }

    fn create_layer(&mut self, layer: &LayerDefinition) -> Result<LayerHandle> {
        let mut state = self.state.lock().unwrap();
        state.layers.push(layer.clone());
        Ok(state.layers.len() as LayerHandle)
    }

    fn connect(&mut self, projections: &[Value]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        // one connection per projection entry, plus one per neuron
        let dense: u64 = state.layers.iter().map(|l| l.positions.len() as u64).sum();
        state.connections += projections.len() as u64 + dense;
        state.connected_projections.extend_from_slice(projections);
        Ok(())
    }

    fn run(&mut self, duration_ms: f64) -> Result<()> {
        self.state.lock().unwrap().simulated_ms += duration_ms;
        Ok(())
    }

    fn count_connections(&self) -> Result<u64> {
        Ok(self.state.lock().unwrap().connections)
    }

    fn select(&self, _criteria: &Value) -> Result<Vec<u64>> {
        // global ids are assigned densely in creation order, starting at 1
        let state = self.state.lock().unwrap();
        let total: usize = state.layers.iter().map(|l| l.positions.len()).sum();
        Ok((1..=total as u64).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_LAYER_SPEC: &str = r#"{
        "layers": [
            {
                "name": "excitatory",
                "neurons": [{"x": 0.0, "y": 0.1}, {"x": 0.2, "y": 0.3}],
                "elements": "exc",
                "extent": [1.0, 1.0, 1.0],
                "center": [0.0, 0.0, 0.0]
            },
            {
                "name": "inhibitory",
                "neurons": [{"x": -0.1, "y": -0.2}],
                "elements": ["inh", 2],
                "extent": [2.0, 2.0, 2.0],
                "center": [0.5, 0.5, 0.5]
            }
        ],
        "models": {"exc": "iaf_psc_alpha", "inh": "iaf_psc_delta"},
        "is3DLayer": false
    }"#;

    #[test]
    fn decodes_wire_spec() {
        let spec: NetworkSpec = serde_json::from_str(TWO_LAYER_SPEC).unwrap();
        assert_eq!(spec.layers.len(), 2);
        assert!(!spec.is_3d);
        assert_eq!(spec.models["exc"], "iaf_psc_alpha");
        assert_eq!(
            spec.layers[1].elements,
            ElementSpec::Composite(vec![
                ElementItem::Name("inh".to_string()),
                ElementItem::Count(2)
            ])
        );
    }

    #[test]
    fn lowering_truncates_2d_geometry_and_resolves_aliases() {
        let spec: NetworkSpec = serde_json::from_str(TWO_LAYER_SPEC).unwrap();
        let def = LayerDefinition::from_spec(&spec.layers[0], &spec.models, spec.is_3d);
        assert_eq!(def.positions, vec![vec![0.0, 0.1], vec![0.2, 0.3]]);
        assert_eq!(def.extent, vec![1.0, 1.0]);
        assert_eq!(def.center, vec![0.0, 0.0]);
        assert_eq!(def.elements, ElementSpec::Name("iaf_psc_alpha".to_string()));
    }

    #[test]
    fn lowering_keeps_3d_geometry() {
        let mut spec: NetworkSpec = serde_json::from_str(TWO_LAYER_SPEC).unwrap();
        spec.is_3d = true;
        spec.layers[0].neurons[0].z = Some(0.7);
        let def = LayerDefinition::from_spec(&spec.layers[0], &spec.models, spec.is_3d);
        assert_eq!(def.positions[0], vec![0.0, 0.1, 0.7]);
        assert_eq!(def.extent.len(), 3);
    }

    #[test]
    fn recording_sim_counts_and_selects() {
        let sim = RecordingSim::new();
        let state = sim.state();
        let mut boxed: Box<dyn Simulator> = Box::new(sim);

        let spec: NetworkSpec = serde_json::from_str(TWO_LAYER_SPEC).unwrap();
        for layer in &spec.layers {
            boxed
                .create_layer(&LayerDefinition::from_spec(layer, &spec.models, spec.is_3d))
                .unwrap();
        }
        boxed.connect(&[]).unwrap();
        assert_eq!(boxed.count_connections().unwrap(), 3);
        assert_eq!(
            boxed.select(&serde_json::json!({})).unwrap(),
            vec![1, 2, 3]
        );

        boxed.reset_all_state().unwrap();
        assert_eq!(state.lock().unwrap().resets, 1);
        assert_eq!(boxed.count_connections().unwrap(), 0);
    }
}
