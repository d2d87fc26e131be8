use tracing::debug;

use crate::errors::{LatResult, LatticaError};
use crate::net::synapse::SynapseIterator;
use crate::net::{IndexInterval, Network};
use crate::settings::Settings;
use crate::solve::partial::PartialSolution;
use crate::solve::router::NeuronRouter;
use crate::solve::solution::Solution;

/// Compiles a network into the row/column plan of partial solutions.
///
/// Each strict router subset becomes one row: its members depend only on
/// already processed neurons, so the row's partials are mutually independent
/// and bounded together by the device memory budget. Contiguous index runs
/// within a subset become the row's columns.
pub struct SolutionBuilder<'a> {
    settings: &'a Settings,
}

impl<'a> SolutionBuilder<'a> {
    pub fn new(settings: &'a Settings) -> Self {
        Self { settings }
    }

    pub fn build(&self, network: &Network) -> LatResult<Solution> {
        network.validate()?;
        let router = NeuronRouter::new(network);
        let mut rows: Vec<Vec<PartialSolution>> = Vec::new();
        while !router.finished() {
            router.collect_subset(
                self.settings.max_solve_threads,
                self.settings.device_max_megabytes,
                true,
            );
            let subset = router.subset();
            if subset.is_empty() {
                return Err(LatticaError::EmptySubset {
                    unprocessed: router.unprocessed_count(),
                });
            }
            let mut row = Vec::new();
            for run in contiguous_runs(&subset) {
                row.push(build_partial(network, run)?);
            }
            for neuron in subset {
                // Collection order equals sorted order in strict mode.
                if !router.pop_front_if(neuron) {
                    return Err(LatticaError::InvalidNetwork(format!(
                        "subset confirmation diverged at neuron {neuron}"
                    )));
                }
            }
            rows.push(row);
        }

        let features_by_row = attach_features(network, &rows);
        let solution = Solution {
            memory_length: network.memory_length(),
            neuron_number: network.neuron_count(),
            output_neuron_number: network.output_neuron_number,
            network_input_size: network.input_size,
            features_by_row,
            rows,
        };
        solution.validate()?;
        debug!(
            rows = solution.rows.len(),
            partials = solution.partial_count(),
            "solution compiled"
        );
        Ok(solution)
    }
}

fn contiguous_runs(sorted_subset: &[usize]) -> Vec<&[usize]> {
    let mut runs = Vec::new();
    let mut run_start = 0usize;
    for position in 1..=sorted_subset.len() {
        let run_ended = position == sorted_subset.len()
            || sorted_subset[position] != sorted_subset[position - 1] + 1;
        if run_ended {
            runs.push(&sorted_subset[run_start..position]);
            run_start = position;
        }
    }
    runs
}

fn build_partial(network: &Network, run: &[usize]) -> LatResult<PartialSolution> {
    let output_start = run[0];
    let mut partial = PartialSolution {
        output_start,
        output_size: run.len(),
        weight_table: Vec::new(),
        transfer_functions: Vec::new(),
        input_intervals: Vec::new(),
        weight_intervals: Vec::new(),
        index_synapse_counts: Vec::new(),
        weight_synapse_counts: Vec::new(),
    };
    for &neuron_index in run {
        let neuron = &network.neurons[neuron_index];
        partial.transfer_functions.push(neuron.transfer);
        partial
            .index_synapse_counts
            .push(neuron.input_indices.len() as u32);
        partial.input_intervals.extend_from_slice(&neuron.input_indices);

        // The private table keeps this neuron's weights as one contiguous
        // run in network order, bias included.
        let private_start = partial.weight_table.len() as u32;
        let mut weight_count = 0u32;
        SynapseIterator::new(&neuron.input_weights).iterate(|weight_index| {
            partial
                .weight_table
                .push(network.weight_table[weight_index as usize]);
            weight_count += 1;
        });
        partial
            .weight_intervals
            .push(IndexInterval::new(private_start, weight_count));
        partial.weight_synapse_counts.push(1);
    }
    partial.validate()?;
    Ok(partial)
}

/// Attach each solution-relevant feature group to the row completing its
/// neuron set; features applied earlier would see missing members.
fn attach_features(network: &Network, rows: &[Vec<PartialSolution>]) -> Vec<Vec<crate::net::FeatureGroup>> {
    let mut row_of_neuron = vec![0usize; network.neuron_count()];
    for (row_index, row) in rows.iter().enumerate() {
        for partial in row {
            for neuron in partial.output_start..partial.output_start + partial.output_size {
                row_of_neuron[neuron] = row_index;
            }
        }
    }
    let mut features_by_row = vec![Vec::new(); rows.len()];
    for feature in &network.features {
        if !feature.kind.is_solution_relevant() {
            continue;
        }
        let completion_row = feature
            .neuron_indices()
            .into_iter()
            .map(|neuron| row_of_neuron[neuron])
            .max();
        if let Some(row_index) = completion_row {
            features_by_row[row_index].push(feature.clone());
        }
    }
    features_by_row
}
