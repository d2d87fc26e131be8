use serde::{Deserialize, Serialize};

use crate::errors::{LatResult, LatticaError};
use crate::net::FeatureGroup;
use crate::solve::partial::PartialSolution;

/// The compiled execution plan: a grid of partial solutions where a partial
/// in row `r` reads only external inputs, past activations, or neurons of
/// rows before `r`. Partials within a row are mutually independent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Solution {
    pub rows: Vec<Vec<PartialSolution>>,
    /// Ring depth required by the deepest temporal reach.
    pub memory_length: usize,
    pub neuron_number: usize,
    pub output_neuron_number: usize,
    pub network_input_size: usize,
    /// Solution-relevant feature groups applied after the row completing
    /// their neuron set; indexed parallel to `rows`.
    pub features_by_row: Vec<Vec<FeatureGroup>>,
}

impl Solution {
    pub fn partial_count(&self) -> usize {
        self.rows.iter().map(|row| row.len()).sum()
    }

    pub fn cols(&self, row_index: usize) -> usize {
        self.rows[row_index].len()
    }

    /// Iterate partials in row-major order with their flat index.
    pub fn partials(&self) -> impl Iterator<Item = (usize, &PartialSolution)> {
        self.rows.iter().flatten().enumerate()
    }

    /// Locate the partial containing the given neuron.
    pub fn find_partial(&self, neuron_index: usize) -> Option<(usize, usize)> {
        for (row_index, row) in self.rows.iter().enumerate() {
            for (col_index, partial) in row.iter().enumerate() {
                if (partial.output_start..partial.output_start + partial.output_size)
                    .contains(&neuron_index)
                {
                    return Some((row_index, col_index));
                }
            }
        }
        None
    }

    /// Plan soundness: non-empty, every neuron covered exactly once, inner
    /// arrays consistent.
    pub fn validate(&self) -> LatResult<()> {
        if self.rows.is_empty() {
            return Err(LatticaError::EmptyPlan);
        }
        if self.features_by_row.len() != self.rows.len() {
            return Err(LatticaError::InvalidNetwork(format!(
                "{} feature rows for {} plan rows",
                self.features_by_row.len(),
                self.rows.len()
            )));
        }
        let mut covered = vec![0usize; self.neuron_number];
        for (row_index, row) in self.rows.iter().enumerate() {
            if row.is_empty() {
                return Err(LatticaError::EmptyRow(row_index));
            }
            for partial in row {
                partial.validate()?;
                for neuron in partial.output_start..partial.output_start + partial.output_size {
                    if neuron >= self.neuron_number {
                        return Err(LatticaError::IndexOutOfBounds {
                            what: "partial output neuron",
                            index: neuron,
                            bound: self.neuron_number,
                        });
                    }
                    covered[neuron] += 1;
                }
            }
        }
        if let Some(neuron) = covered.iter().position(|&count| count != 1) {
            return Err(LatticaError::InvalidNetwork(format!(
                "neuron {} covered {} times by the plan",
                neuron, covered[neuron]
            )));
        }
        Ok(())
    }
}
