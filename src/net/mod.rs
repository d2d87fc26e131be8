pub mod builder;
pub mod synapse;
pub mod transfer;

pub use builder::NetworkBuilder;
pub use synapse::{IndexInterval, InputInterval, Interval, SynapseIterator};
pub use transfer::TransferKind;

use serde::{Deserialize, Serialize};

use crate::errors::{LatResult, LatticaError};

/// Neuron-group feature tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureKind {
    Softmax,
    Dropout,
    L1Regularization,
    L2Regularization,
}

impl FeatureKind {
    /// Features mutating neuron data during a solve run.
    pub fn is_solution_relevant(self) -> bool {
        matches!(self, FeatureKind::Softmax | FeatureKind::Dropout)
    }

    /// Features contributing to the error value after a solve run.
    pub fn is_performance_relevant(self) -> bool {
        matches!(
            self,
            FeatureKind::L1Regularization | FeatureKind::L2Regularization
        )
    }
}

/// One feature applied over a set of neurons.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FeatureGroup {
    pub kind: FeatureKind,
    pub relevant_neurons: Vec<IndexInterval>,
}

impl FeatureGroup {
    pub fn new(kind: FeatureKind, relevant_neurons: Vec<IndexInterval>) -> Self {
        Self {
            kind,
            relevant_neurons,
        }
    }

    pub fn neuron_indices(&self) -> Vec<usize> {
        let mut indices = Vec::new();
        SynapseIterator::new(&self.relevant_neurons).iterate(|index| indices.push(index as usize));
        indices
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Neuron {
    pub transfer: TransferKind,
    /// Where this neuron's inputs come from; negative starts are external.
    pub input_indices: Vec<InputInterval>,
    /// Which network weights this neuron applies, in input order; the one
    /// surplus weight is the bias.
    pub input_weights: Vec<IndexInterval>,
}

impl Neuron {
    pub fn input_count(&self) -> usize {
        SynapseIterator::new(&self.input_indices).size()
    }

    pub fn weight_count(&self) -> usize {
        SynapseIterator::new(&self.input_weights).size()
    }
}

/// The declarative description the solution compiler consumes: neurons wired
/// by index and weight synapses over one shared weight table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Network {
    pub input_size: usize,
    pub output_neuron_number: usize,
    pub weight_table: Vec<f64>,
    pub neurons: Vec<Neuron>,
    pub features: Vec<FeatureGroup>,
}

impl Network {
    pub fn neuron_count(&self) -> usize {
        self.neurons.len()
    }

    /// Ring depth required to evaluate the network: one slot for the current
    /// step plus the deepest temporal reach of any input synapse.
    pub fn memory_length(&self) -> usize {
        1 + self
            .neurons
            .iter()
            .flat_map(|neuron| neuron.input_indices.iter())
            .map(|interval| interval.reach_past as usize)
            .max()
            .unwrap_or(0)
    }

    /// Size estimate used by the neuron router's device memory budget.
    pub fn estimated_neuron_bytes(&self, neuron_index: usize) -> usize {
        let neuron = &self.neurons[neuron_index];
        (neuron.input_count() + neuron.weight_count()) * std::mem::size_of::<f64>() + 64
    }

    /// No persisted format is prescribed; JSON is offered for convenience.
    pub fn to_json(&self) -> LatResult<String> {
        serde_json::to_string(self).map_err(|error| LatticaError::Serialization(error.to_string()))
    }

    pub fn from_json(data: &str) -> LatResult<Self> {
        let network: Network = serde_json::from_str(data)
            .map_err(|error| LatticaError::Serialization(error.to_string()))?;
        network.validate()?;
        Ok(network)
    }

    /// Structural invariants of the data model: per-neuron weight totals,
    /// referenced index ranges, weight table coverage.
    pub fn validate(&self) -> LatResult<()> {
        if 0 == self.neurons.len() {
            return Err(LatticaError::InvalidNetwork("no neurons".into()));
        }
        if self.output_neuron_number > self.neurons.len() {
            return Err(LatticaError::InvalidNetwork(format!(
                "output neuron number {} exceeds neuron count {}",
                self.output_neuron_number,
                self.neurons.len()
            )));
        }
        for (neuron_index, neuron) in self.neurons.iter().enumerate() {
            if neuron.weight_count() != neuron.input_count() + 1 {
                return Err(LatticaError::InvalidNetwork(format!(
                    "neuron {} has {} weights for {} inputs; expected inputs + 1",
                    neuron_index,
                    neuron.weight_count(),
                    neuron.input_count()
                )));
            }
            let mut bad_index = None;
            SynapseIterator::new(&neuron.input_indices).iterate(|index| {
                if !synapse::is_external(index) && index as usize >= self.neurons.len() {
                    bad_index = Some(index);
                } else if synapse::is_external(index)
                    && synapse::array_from_external(index) >= self.input_size
                {
                    bad_index = Some(index);
                }
            });
            if let Some(index) = bad_index {
                return Err(LatticaError::InvalidNetwork(format!(
                    "neuron {neuron_index} references input index {index} outside the network"
                )));
            }
            let mut bad_weight = None;
            SynapseIterator::new(&neuron.input_weights).iterate(|index| {
                if index as usize >= self.weight_table.len() {
                    bad_weight = Some(index);
                }
            });
            if let Some(index) = bad_weight {
                return Err(LatticaError::InvalidNetwork(format!(
                    "neuron {neuron_index} references weight {index} outside the weight table"
                )));
            }
        }
        Ok(())
    }
}
