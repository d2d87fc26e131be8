use std::collections::HashMap;
use std::sync::Mutex;

use crate::errors::{LatResult, LatticaError};
use crate::net::synapse::SynapseIterator;
use crate::net::Network;
use crate::solve::{PartialSolution, Solution};

/// Bidirectional mapping between the network weight table and the private
/// per-partial tables of a compiled solution.
///
/// The caches are built lazily under a mutex and never invalidated: they are
/// bound to the topology, which outlives any number of weight refreshes.
#[derive(Default)]
pub struct WeightAdapter {
    caches: Mutex<Option<Caches>>,
}

struct Caches {
    /// Neuron index → flat partial index.
    neurons_in_partials: HashMap<usize, usize>,
    /// Weight index → every `(flat partial index, inner weight position)`
    /// holding a copy of it, sorted by partial index descending.
    weights_in_partials: HashMap<usize, Vec<(usize, usize)>>,
}

impl WeightAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flat index of the partial solving the given neuron.
    pub fn partial_index_for(
        &self,
        network: &Network,
        solution: &Solution,
        neuron_index: usize,
    ) -> Option<usize> {
        self.with_caches(network, solution, |caches| {
            caches.neurons_in_partials.get(&neuron_index).copied()
        })
    }

    /// Every private weight-table location mirroring the given network
    /// weight, sorted by partial index descending.
    pub fn weight_locations_for(
        &self,
        network: &Network,
        solution: &Solution,
        weight_index: usize,
    ) -> Vec<(usize, usize)> {
        self.with_caches(network, solution, |caches| {
            caches
                .weights_in_partials
                .get(&weight_index)
                .cloned()
                .unwrap_or_default()
        })
    }

    /// Copy one network weight into every partial location mapping it.
    pub fn update_solution_with_weight(
        &self,
        network: &Network,
        solution: &mut Solution,
        weight_index: usize,
    ) -> LatResult<()> {
        if weight_index >= network.weight_table.len() {
            return Err(LatticaError::IndexOutOfBounds {
                what: "network weight",
                index: weight_index,
                bound: network.weight_table.len(),
            });
        }
        let locations = self.weight_locations_for(network, solution, weight_index);
        let value = network.weight_table[weight_index];
        let mut partials: Vec<&mut PartialSolution> =
            solution.rows.iter_mut().flatten().collect();
        for (partial_index, inner_position) in locations {
            partials[partial_index].weight_table[inner_position] = value;
        }
        Ok(())
    }

    /// Refresh every partial's private table from the network weights,
    /// fanned across the given number of threads.
    pub fn update_solution_with_weights(
        &self,
        network: &Network,
        solution: &mut Solution,
        max_threads: usize,
    ) {
        let mut partials: Vec<&mut PartialSolution> =
            solution.rows.iter_mut().flatten().collect();
        let per_thread = 1 + partials.len() / max_threads.max(1);
        std::thread::scope(|scope| {
            for chunk in partials.chunks_mut(per_thread) {
                scope.spawn(move || {
                    for partial in chunk {
                        refresh_partial(network, partial);
                    }
                });
            }
        });
    }

    fn with_caches<R>(
        &self,
        network: &Network,
        solution: &Solution,
        read: impl FnOnce(&Caches) -> R,
    ) -> R {
        let mut guard = self
            .caches
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let caches = guard.get_or_insert_with(|| build_caches(network, solution));
        read(caches)
    }
}

fn build_caches(network: &Network, solution: &Solution) -> Caches {
    let mut neurons_in_partials = HashMap::new();
    let mut weights_in_partials: HashMap<usize, Vec<(usize, usize)>> = HashMap::new();
    for (partial_index, partial) in solution.partials() {
        let mut inner_position = 0usize;
        for inner in 0..partial.output_size {
            let neuron_index = partial.output_start + inner;
            neurons_in_partials.insert(neuron_index, partial_index);
            // The private table holds this neuron's weights in network
            // order, so positions advance in lockstep with the iteration.
            SynapseIterator::new(&network.neurons[neuron_index].input_weights).iterate(
                |weight_index| {
                    weights_in_partials
                        .entry(weight_index as usize)
                        .or_default()
                        .push((partial_index, inner_position));
                    inner_position += 1;
                },
            );
        }
    }
    for locations in weights_in_partials.values_mut() {
        locations.sort_by(|a, b| b.0.cmp(&a.0));
    }
    Caches {
        neurons_in_partials,
        weights_in_partials,
    }
}

fn refresh_partial(network: &Network, partial: &mut PartialSolution) {
    let mut inner_position = 0usize;
    for inner in 0..partial.output_size {
        let neuron_index = partial.output_start + inner;
        SynapseIterator::new(&network.neurons[neuron_index].input_weights).iterate(
            |weight_index| {
                partial.weight_table[inner_position] = network.weight_table[weight_index as usize];
                inner_position += 1;
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{NetworkBuilder, TransferKind};
    use crate::settings::Settings;
    use crate::solve::SolutionBuilder;

    #[test]
    fn refresh_round_trips_every_weight() {
        let mut network = NetworkBuilder::new()
            .input_size(2)
            .dense_layers(&[3, 2])
            .transfer_functions_by_layer(&[TransferKind::Selu, TransferKind::Sigmoid])
            .seed(9)
            .build()
            .unwrap();
        let settings = Settings::default();
        let mut solution = SolutionBuilder::new(&settings).build(&network).unwrap();
        let adapter = WeightAdapter::new();

        for index in 0..network.weight_table.len() {
            network.weight_table[index] = index as f64 * 0.25;
        }
        adapter.update_solution_with_weights(&network, &mut solution, 4);

        for weight_index in 0..network.weight_table.len() {
            let locations = adapter.weight_locations_for(&network, &solution, weight_index);
            assert!(!locations.is_empty(), "weight {weight_index} unmapped");
            let partials: Vec<&PartialSolution> =
                solution.rows.iter().flatten().collect();
            for (partial_index, inner_position) in locations {
                assert_eq!(
                    network.weight_table[weight_index],
                    partials[partial_index].weight_table[inner_position]
                );
            }
        }
    }

    #[test]
    fn single_weight_update_touches_every_mapping() {
        let mut network = NetworkBuilder::new()
            .input_size(2)
            .dense_layers(&[2, 1])
            .seed(13)
            .build()
            .unwrap();
        let settings = Settings::default();
        let mut solution = SolutionBuilder::new(&settings).build(&network).unwrap();
        let adapter = WeightAdapter::new();
        adapter.update_solution_with_weights(&network, &mut solution, 2);

        network.weight_table[0] = 42.0;
        adapter
            .update_solution_with_weight(&network, &mut solution, 0)
            .unwrap();
        for (partial_index, inner_position) in
            adapter.weight_locations_for(&network, &solution, 0)
        {
            let partials: Vec<&PartialSolution> = solution.rows.iter().flatten().collect();
            assert_eq!(42.0, partials[partial_index].weight_table[inner_position]);
        }
    }
}
