use serde::{Deserialize, Serialize};

use crate::errors::{LatResult, LatticaError};
use crate::net::synapse::{array_from_external, is_external, SynapseIterator};
use crate::net::{IndexInterval, InputInterval, TransferKind};
use crate::utils::DataRing;

/// One dense slab of the compiled plan: the contiguous neurons
/// `[output_start, output_start + output_size)` with a private copy of the
/// network weights they reference.
///
/// The two `*_synapse_counts` arrays run parallel to the inner neurons, so a
/// given neuron's synapses are located without walking its predecessors'
/// interval lists element by element.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PartialSolution {
    pub output_start: usize,
    pub output_size: usize,
    pub weight_table: Vec<f64>,
    pub transfer_functions: Vec<TransferKind>,
    /// Input runs of every inner neuron, concatenated; absolute neuron
    /// indices, negative starts for external inputs.
    pub input_intervals: Vec<InputInterval>,
    /// Weight runs of every inner neuron, concatenated; indices into the
    /// private `weight_table`.
    pub weight_intervals: Vec<IndexInterval>,
    pub index_synapse_counts: Vec<u32>,
    pub weight_synapse_counts: Vec<u32>,
}

impl PartialSolution {
    /// Scratch elements needed to collect any single inner neuron's inputs.
    pub fn required_scratch_size(&self) -> usize {
        let mut largest = 0usize;
        let mut offset = 0usize;
        for &count in &self.index_synapse_counts {
            let synapses = &self.input_intervals[offset..offset + count as usize];
            largest = largest.max(SynapseIterator::new(synapses).size());
            offset += count as usize;
        }
        largest
    }

    /// First interval of the given inner neuron inside `weight_intervals`.
    pub fn weight_synapse_start_of(&self, inner_neuron: usize) -> usize {
        self.weight_synapse_counts[..inner_neuron]
            .iter()
            .map(|&count| count as usize)
            .sum()
    }

    /// First interval of the given inner neuron inside `input_intervals`.
    pub fn index_synapse_start_of(&self, inner_neuron: usize) -> usize {
        self.index_synapse_counts[..inner_neuron]
            .iter()
            .map(|&count| count as usize)
            .sum()
    }

    pub fn validate(&self) -> LatResult<()> {
        if self.transfer_functions.len() != self.output_size
            || self.index_synapse_counts.len() != self.output_size
            || self.weight_synapse_counts.len() != self.output_size
        {
            return Err(LatticaError::InvalidNetwork(format!(
                "partial solution at {} has inconsistent inner arrays",
                self.output_start
            )));
        }
        let mut weight_offset = 0usize;
        let mut input_offset = 0usize;
        for inner in 0..self.output_size {
            let inputs = SynapseIterator::new(
                &self.input_intervals
                    [input_offset..input_offset + self.index_synapse_counts[inner] as usize],
            )
            .size();
            let weights = SynapseIterator::new(
                &self.weight_intervals
                    [weight_offset..weight_offset + self.weight_synapse_counts[inner] as usize],
            )
            .size();
            if weights != inputs + 1 {
                return Err(LatticaError::InvalidNetwork(format!(
                    "inner neuron {} of partial at {} has {} weights for {} inputs",
                    inner, self.output_start, weights, inputs
                )));
            }
            input_offset += self.index_synapse_counts[inner] as usize;
            weight_offset += self.weight_synapse_counts[inner] as usize;
        }
        Ok(())
    }
}

/// Evaluates one partial solution against external inputs and the activation
/// ring, writing transfer outputs into the ring's current head.
pub struct PartialSolver<'a> {
    partial: &'a PartialSolution,
}

impl<'a> PartialSolver<'a> {
    pub fn new(partial: &'a PartialSolution) -> Self {
        Self { partial }
    }

    pub fn partial(&self) -> &PartialSolution {
        self.partial
    }

    pub fn required_scratch_size(&self) -> usize {
        self.partial.required_scratch_size()
    }

    /// Solve into the ring head directly.
    pub fn solve(
        &self,
        input: &[f64],
        ring: &mut DataRing,
        scratch: &mut Vec<f64>,
    ) -> LatResult<()> {
        let mut output = vec![0.0; self.partial.output_size];
        self.solve_into(input, ring, scratch, &mut output)?;
        let bound = ring.slot_size();
        let head = ring.slot_mut(0)?;
        let range = self.partial.output_start..self.partial.output_start + self.partial.output_size;
        head.get_mut(range.clone())
            .ok_or(LatticaError::IndexOutOfBounds {
                what: "partial output neuron",
                index: range.end - 1,
                bound,
            })?
            .copy_from_slice(&output);
        Ok(())
    }

    /// Solve against a read-only ring, writing the slab's outputs into `out`.
    /// Lets independent partials of one row run in parallel over the shared
    /// head slot before their results are merged.
    pub fn solve_into(
        &self,
        input: &[f64],
        ring: &DataRing,
        scratch: &mut Vec<f64>,
        out: &mut [f64],
    ) -> LatResult<()> {
        if out.len() != self.partial.output_size {
            return Err(LatticaError::ShapeMismatch {
                context: "partial output buffer",
                expected: self.partial.output_size,
                found: out.len(),
            });
        }
        scratch.resize(self.partial.required_scratch_size(), 0.0);
        let mut input_offset = 0usize;
        let mut weight_offset = 0usize;
        for inner in 0..self.partial.output_size {
            let input_synapses = &self.partial.input_intervals
                [input_offset..input_offset + self.partial.index_synapse_counts[inner] as usize];
            let mut collected = 0usize;
            let mut failure = None;
            SynapseIterator::new(input_synapses).iterate_with_intervals_terminatable(
                |interval, index| {
                    let value = if is_external(index) {
                        let external = array_from_external(index);
                        match input.get(external) {
                            Some(&value) => value,
                            None => {
                                failure = Some(LatticaError::IndexOutOfBounds {
                                    what: "external input",
                                    index: external,
                                    bound: input.len(),
                                });
                                return false;
                            }
                        }
                    } else {
                        match ring.element(interval.reach_past as usize, index as usize) {
                            Ok(value) => value,
                            Err(error) => {
                                failure = Some(error);
                                return false;
                            }
                        }
                    };
                    scratch[collected] = value;
                    collected += 1;
                    true
                },
            );
            if let Some(error) = failure {
                return Err(error);
            }

            let weight_synapses = &self.partial.weight_intervals
                [weight_offset..weight_offset + self.partial.weight_synapse_counts[inner] as usize];
            let mut sum = 0.0;
            let mut weight_ordinal = 0usize;
            SynapseIterator::new(weight_synapses).iterate(|weight_index| {
                let weight = self.partial.weight_table[weight_index as usize];
                if weight_ordinal < collected {
                    sum += weight * scratch[weight_ordinal];
                } else {
                    sum += weight; // the surplus weight is the bias
                }
                weight_ordinal += 1;
            });

            out[inner] = self.partial.transfer_functions[inner].activate(sum);
            input_offset += self.partial.index_synapse_counts[inner] as usize;
            weight_offset += self.partial.weight_synapse_counts[inner] as usize;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::synapse::external_from_array;

    /// Two neurons over the external inputs, identity transfer.
    fn two_neuron_partial() -> PartialSolution {
        PartialSolution {
            output_start: 0,
            output_size: 2,
            weight_table: vec![0.5, 0.25, 0.1, 2.0, 1.0, 0.05],
            transfer_functions: vec![TransferKind::Identity, TransferKind::Identity],
            input_intervals: vec![
                InputInterval::new(external_from_array(0), 2),
                InputInterval::new(external_from_array(0), 2),
            ],
            weight_intervals: vec![IndexInterval::new(0, 3), IndexInterval::new(3, 3)],
            index_synapse_counts: vec![1, 1],
            weight_synapse_counts: vec![1, 1],
        }
    }

    #[test]
    fn weighted_sum_with_bias_lands_in_the_ring_head() {
        let partial = two_neuron_partial();
        partial.validate().unwrap();
        let mut ring = DataRing::new(1, 2);
        ring.copy_step();
        let mut scratch = Vec::new();
        PartialSolver::new(&partial)
            .solve(&[2.0, 4.0], &mut ring, &mut scratch)
            .unwrap();
        let expected_first = 2.0 * 0.5 + 4.0 * 0.25 + 0.1;
        let expected_second = 2.0 * 2.0 + 4.0 * 1.0 + 0.05;
        assert!((ring.element(0, 0).unwrap() - expected_first).abs() < 1e-13);
        assert!((ring.element(0, 1).unwrap() - expected_second).abs() < 1e-13);
    }

    #[test]
    fn input_size_mismatch_is_fatal() {
        let partial = two_neuron_partial();
        let mut ring = DataRing::new(1, 2);
        ring.copy_step();
        let mut scratch = Vec::new();
        let result = PartialSolver::new(&partial).solve(&[2.0], &mut ring, &mut scratch);
        assert!(result.is_err());
    }
}
