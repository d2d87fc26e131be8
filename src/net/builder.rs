use ndarray_rand::rand_distr::Uniform;
use rand::prelude::*;

use crate::errors::{LatResult, LatticaError};
use crate::net::synapse::{external_from_array, IndexInterval, InputInterval};
use crate::net::{FeatureGroup, FeatureKind, Network, Neuron, TransferKind};

/// Builds fully connected layered networks, the construction path every
/// end-to-end scenario uses. Sparse topologies can be assembled directly
/// through the [`Network`] data model.
pub struct NetworkBuilder {
    input_size: usize,
    layers: Vec<usize>,
    transfers: Vec<TransferKind>,
    layer_features: Vec<(usize, FeatureKind)>,
    recurrence_to_self: bool,
    expected_input_range: f64,
    seed: Option<u64>,
}

impl NetworkBuilder {
    pub fn new() -> Self {
        Self {
            input_size: 0,
            layers: Vec::new(),
            transfers: Vec::new(),
            layer_features: Vec::new(),
            recurrence_to_self: false,
            expected_input_range: 1.0,
            seed: None,
        }
    }

    pub fn input_size(mut self, size: usize) -> Self {
        self.input_size = size;
        self
    }

    /// Layer sizes from first hidden layer to the output layer.
    pub fn dense_layers(mut self, sizes: &[usize]) -> Self {
        self.layers = sizes.to_vec();
        self
    }

    /// One transfer function per layer, matching `dense_layers` in length.
    pub fn transfer_functions_by_layer(mut self, transfers: &[TransferKind]) -> Self {
        self.transfers = transfers.to_vec();
        self
    }

    /// Wire every neuron back onto its own previous-step output.
    pub fn recurrence_to_self(mut self) -> Self {
        self.recurrence_to_self = true;
        self
    }

    /// Attach a neuron-group feature covering one whole layer.
    pub fn layer_feature(mut self, layer_index: usize, kind: FeatureKind) -> Self {
        self.layer_features.push((layer_index, kind));
        self
    }

    /// Scales the random weight initialization.
    pub fn expected_input_range(mut self, range: f64) -> Self {
        self.expected_input_range = range;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn build(self) -> LatResult<Network> {
        if 0 == self.input_size {
            return Err(LatticaError::InvalidNetwork("input size is zero".into()));
        }
        if self.layers.is_empty() {
            return Err(LatticaError::InvalidNetwork("no layers requested".into()));
        }
        if !self.transfers.is_empty() && self.transfers.len() != self.layers.len() {
            return Err(LatticaError::InvalidNetwork(format!(
                "{} transfer functions for {} layers",
                self.transfers.len(),
                self.layers.len()
            )));
        }

        let mut rng: StdRng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut neurons = Vec::new();
        let mut weight_table = Vec::new();
        let mut features = Vec::new();
        let mut layer_start = 0usize;
        for (layer_index, &layer_size) in self.layers.iter().enumerate() {
            let transfer = self
                .transfers
                .get(layer_index)
                .copied()
                .unwrap_or(TransferKind::Selu);
            let (previous_start, previous_size) = if 0 == layer_index {
                (0, self.input_size)
            } else {
                (layer_start - self.layers[layer_index - 1], self.layers[layer_index - 1])
            };
            for inner_index in 0..layer_size {
                let own_index = layer_start + inner_index;
                let mut input_indices = vec![if 0 == layer_index {
                    InputInterval::new(external_from_array(0), previous_size as u32)
                } else {
                    InputInterval::new(previous_start as i32, previous_size as u32)
                }];
                if self.recurrence_to_self {
                    input_indices.push(InputInterval::with_reach(own_index as i32, 1, 1));
                }
                let input_count: usize = input_indices
                    .iter()
                    .map(|interval| interval.size as usize)
                    .sum();

                let weight_start = weight_table.len() as u32;
                let range = Uniform::new(
                    -self.expected_input_range,
                    self.expected_input_range,
                );
                let scale = 1.0 / (input_count as f64).sqrt();
                for _ in 0..input_count {
                    weight_table.push(rng.sample(range) * scale);
                }
                weight_table.push(0.0); // bias
                neurons.push(Neuron {
                    transfer,
                    input_indices,
                    input_weights: vec![IndexInterval::new(weight_start, input_count as u32 + 1)],
                });
            }
            for &(feature_layer, kind) in &self.layer_features {
                if feature_layer == layer_index {
                    features.push(FeatureGroup::new(
                        kind,
                        vec![IndexInterval::new(layer_start as u32, layer_size as u32)],
                    ));
                }
            }
            layer_start += layer_size;
        }

        let network = Network {
            input_size: self.input_size,
            output_neuron_number: *self.layers.last().expect("checked above"),
            weight_table,
            neurons,
            features,
        };
        network.validate()?;
        Ok(network)
    }
}

impl Default for NetworkBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layered_net_has_bias_per_neuron() {
        let network = NetworkBuilder::new()
            .input_size(2)
            .dense_layers(&[3, 1])
            .transfer_functions_by_layer(&[TransferKind::Selu, TransferKind::Selu])
            .seed(42)
            .build()
            .unwrap();
        assert_eq!(4, network.neuron_count());
        assert_eq!(1, network.output_neuron_number);
        // 3 neurons of (2 inputs + bias) and 1 neuron of (3 inputs + bias)
        assert_eq!(3 * 3 + 4, network.weight_table.len());
        for neuron in &network.neurons {
            assert_eq!(neuron.input_count() + 1, neuron.weight_count());
        }
    }

    #[test]
    fn self_recurrence_adds_a_past_reaching_synapse() {
        let network = NetworkBuilder::new()
            .input_size(1)
            .dense_layers(&[2, 1])
            .recurrence_to_self()
            .seed(7)
            .build()
            .unwrap();
        assert_eq!(2, network.memory_length());
        for (index, neuron) in network.neurons.iter().enumerate() {
            let own = neuron
                .input_indices
                .iter()
                .find(|interval| interval.reach_past == 1)
                .unwrap();
            assert_eq!(index as i32, own.start);
        }
    }
}
