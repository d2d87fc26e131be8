use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::errors::{LatResult, LatticaError};
use crate::net::synapse::{array_from_external, is_external, SynapseIterator};
use crate::net::{Network, TransferKind};

pub type OpIndex = usize;

/// Where one collected input of a neuron-input operation comes from.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub enum InputSource {
    External(usize),
    /// The spike of a neuron, `reach_past` steps back; 0 reads the current
    /// step. Past-reaching sources may only name the owning neuron itself.
    Spike { neuron: usize, reach_past: u32 },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum OperationKind {
    /// Weighted input sum of one neuron, bias included.
    NeuronInput {
        neuron: usize,
        sources: Vec<InputSource>,
        /// Network weight indices pairing the sources, in synapse order.
        weights: Vec<usize>,
        bias_weight: usize,
    },
    /// Transfer function application over the neuron's input operation.
    NeuronTransfer {
        neuron: usize,
        transfer: TransferKind,
        input_op: OpIndex,
    },
    /// The output value of a neuron at the current step.
    NeuronSpike { neuron: usize, transfer_op: OpIndex },
    /// A solution-relevant feature over already placed spikes. Mutates the
    /// spike values of its members; carries no derivative of its own.
    SolutionFeature {
        feature_index: usize,
        member_spikes: Vec<OpIndex>,
    },
    /// Per-feature cost of one output neuron against the current label.
    Objective {
        output_index: usize,
        spike_op: OpIndex,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OperationKind,
    /// Evaluation-order dependencies into the same array; every dependency
    /// index is smaller than the operation's own.
    pub dependencies: Vec<OpIndex>,
}

/// The compiled operation DAG of a network under an objective: dependencies
/// strictly precede dependents, objective operations come last.
#[derive(Clone, Debug)]
pub struct OperationGraph {
    pub operations: Vec<Operation>,
    /// Neuron index → its spike operation, for resolving recurrent reads.
    pub spike_to_operation_map: HashMap<usize, OpIndex>,
    pub objective_ops: Vec<OpIndex>,
}

impl OperationGraph {
    pub fn build(network: &Network) -> LatResult<Self> {
        let mut builder = GraphBuilder {
            network,
            operations: Vec::new(),
            spike_map: HashMap::new(),
            placed_features: vec![false; network.features.len()],
            in_progress: vec![false; network.neuron_count()],
        };
        let output_start = network.neuron_count() - network.output_neuron_number;
        let mut output_spikes = Vec::new();
        for neuron_index in output_start..network.neuron_count() {
            output_spikes.push(builder.spike_of(neuron_index)?);
        }
        let mut objective_ops = Vec::new();
        for (output_index, &spike_op) in output_spikes.iter().enumerate() {
            let op_index = builder.operations.len();
            builder.operations.push(Operation {
                kind: OperationKind::Objective {
                    output_index,
                    spike_op,
                },
                dependencies: vec![spike_op],
            });
            objective_ops.push(op_index);
        }
        Ok(Self {
            operations: builder.operations,
            spike_to_operation_map: builder.spike_map,
            objective_ops,
        })
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn spike_of(&self, neuron_index: usize) -> Option<OpIndex> {
        self.spike_to_operation_map.get(&neuron_index).copied()
    }
}

struct GraphBuilder<'a> {
    network: &'a Network,
    operations: Vec<Operation>,
    spike_map: HashMap<usize, OpIndex>,
    placed_features: Vec<bool>,
    in_progress: Vec<bool>,
}

impl GraphBuilder<'_> {
    /// Materialize input → transfer → spike for the neuron, depth first, so
    /// every zero-reach dependency lands before its consumer. Queued feature
    /// groups flush as soon as their last member spike is placed, putting
    /// feature effects ahead of downstream consumers.
    fn spike_of(&mut self, neuron_index: usize) -> LatResult<OpIndex> {
        if let Some(&existing) = self.spike_map.get(&neuron_index) {
            return Ok(existing);
        }
        if self.in_progress[neuron_index] {
            return Err(LatticaError::InvalidNetwork(format!(
                "zero-reach cycle through neuron {neuron_index}"
            )));
        }
        self.in_progress[neuron_index] = true;

        let neuron = &self.network.neurons[neuron_index];
        let mut sources = Vec::new();
        let mut dependencies = Vec::new();
        let mut failure = None;
        let intervals = neuron.input_indices.clone();
        SynapseIterator::new(&intervals).iterate_with_intervals_terminatable(|interval, index| {
            if is_external(index) {
                sources.push(InputSource::External(array_from_external(index)));
                return true;
            }
            let referenced = index as usize;
            if 0 == interval.reach_past {
                match self.spike_of(referenced) {
                    Ok(spike_op) => {
                        dependencies.push(spike_op);
                        sources.push(InputSource::Spike {
                            neuron: referenced,
                            reach_past: 0,
                        });
                        true
                    }
                    Err(error) => {
                        failure = Some(error);
                        false
                    }
                }
            } else if referenced == neuron_index {
                // Resolved through the derivative ring at run time; no
                // placement-order dependency.
                sources.push(InputSource::Spike {
                    neuron: referenced,
                    reach_past: interval.reach_past,
                });
                true
            } else {
                failure = Some(LatticaError::UnsupportedRecurrence {
                    neuron: neuron_index,
                    referenced,
                });
                false
            }
        });
        if let Some(error) = failure {
            return Err(error);
        }

        let mut weights = Vec::new();
        SynapseIterator::new(&neuron.input_weights)
            .iterate(|weight_index| weights.push(weight_index as usize));
        let bias_weight = weights.pop().ok_or_else(|| {
            LatticaError::InvalidNetwork(format!("neuron {neuron_index} has no weights"))
        })?;

        let input_op = self.operations.len();
        self.operations.push(Operation {
            kind: OperationKind::NeuronInput {
                neuron: neuron_index,
                sources,
                weights,
                bias_weight,
            },
            dependencies,
        });
        let transfer_op = self.operations.len();
        self.operations.push(Operation {
            kind: OperationKind::NeuronTransfer {
                neuron: neuron_index,
                transfer: neuron.transfer,
                input_op,
            },
            dependencies: vec![input_op],
        });
        let spike_op = self.operations.len();
        self.operations.push(Operation {
            kind: OperationKind::NeuronSpike {
                neuron: neuron_index,
                transfer_op,
            },
            dependencies: vec![transfer_op],
        });
        self.spike_map.insert(neuron_index, spike_op);
        self.in_progress[neuron_index] = false;
        self.flush_completed_features();
        Ok(spike_op)
    }

    fn flush_completed_features(&mut self) {
        for feature_index in 0..self.network.features.len() {
            if self.placed_features[feature_index]
                || !self.network.features[feature_index]
                    .kind
                    .is_solution_relevant()
            {
                continue;
            }
            let members = self.network.features[feature_index].neuron_indices();
            let member_spikes: Option<Vec<OpIndex>> = members
                .iter()
                .map(|neuron| self.spike_map.get(neuron).copied())
                .collect();
            if let Some(member_spikes) = member_spikes {
                self.placed_features[feature_index] = true;
                self.operations.push(Operation {
                    kind: OperationKind::SolutionFeature {
                        feature_index,
                        member_spikes: member_spikes.clone(),
                    },
                    dependencies: member_spikes,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{NetworkBuilder, TransferKind};

    #[test]
    fn dependencies_precede_their_operations() {
        let network = NetworkBuilder::new()
            .input_size(2)
            .dense_layers(&[3, 2])
            .transfer_functions_by_layer(&[TransferKind::Selu, TransferKind::Sigmoid])
            .seed(17)
            .build()
            .unwrap();
        let graph = OperationGraph::build(&network).unwrap();
        for (op_index, operation) in graph.operations.iter().enumerate() {
            for &dependency in &operation.dependencies {
                assert!(dependency < op_index);
            }
        }
        assert_eq!(2, graph.objective_ops.len());
        assert_eq!(5, graph.spike_to_operation_map.len());
    }

    #[test]
    fn cross_neuron_recurrence_is_rejected() {
        use crate::net::synapse::external_from_array;
        use crate::net::{IndexInterval, InputInterval, Network, Neuron};
        let network = Network {
            input_size: 1,
            output_neuron_number: 1,
            weight_table: vec![0.1, 0.2, 0.3, 0.4, 0.5],
            neurons: vec![
                Neuron {
                    transfer: TransferKind::Identity,
                    input_indices: vec![InputInterval::new(external_from_array(0), 1)],
                    input_weights: vec![IndexInterval::new(0, 2)],
                },
                Neuron {
                    transfer: TransferKind::Identity,
                    input_indices: vec![
                        InputInterval::new(0, 1),
                        InputInterval::with_reach(0, 1, 1),
                    ],
                    input_weights: vec![IndexInterval::new(2, 3)],
                },
            ],
            features: Vec::new(),
        };
        let result = OperationGraph::build(&network);
        assert!(matches!(
            result,
            Err(LatticaError::UnsupportedRecurrence {
                neuron: 1,
                referenced: 0
            })
        ));
    }
}
