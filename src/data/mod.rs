use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::errors::{LatResult, LatticaError};

/// The environment collaborator: labelled input sequences. Each sample is a
/// sequence of `sequence_size` steps preceded by `prefill_inputs_number`
/// state-setting inputs, stored flat in raw sample order.
pub trait DataSet: Send + Sync {
    fn input_size(&self) -> usize;
    fn feature_size(&self) -> usize;
    fn number_of_sequences(&self) -> usize;
    fn sequence_size(&self) -> usize;
    fn prefill_inputs_number(&self) -> usize;

    fn number_of_label_samples(&self) -> usize {
        self.number_of_sequences() * self.sequence_size()
    }

    fn input_sample(&self, raw_index: usize) -> &[f64];
    fn label_sample(&self, raw_index: usize) -> &[f64];
}

/// Owned sequence data. Inputs carry `prefill + sequence_size` vectors per
/// sequence, labels `sequence_size`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SequenceData {
    input_size: usize,
    feature_size: usize,
    sequence_size: usize,
    prefill_inputs: usize,
    inputs: Vec<Vec<f64>>,
    labels: Vec<Vec<f64>>,
}

impl SequenceData {
    pub fn new(input_size: usize, feature_size: usize, sequence_size: usize) -> Self {
        Self {
            input_size,
            feature_size,
            sequence_size: sequence_size.max(1),
            prefill_inputs: 0,
            inputs: Vec::new(),
            labels: Vec::new(),
        }
    }

    pub fn with_prefill(mut self, prefill_inputs: usize) -> Self {
        self.prefill_inputs = prefill_inputs;
        self
    }

    /// Append one sequence of `prefill + sequence_size` inputs and
    /// `sequence_size` labels.
    pub fn push_sequence(&mut self, inputs: &[Vec<f64>], labels: &[Vec<f64>]) -> LatResult<()> {
        if inputs.len() != self.sequence_size + self.prefill_inputs {
            return Err(LatticaError::ShapeMismatch {
                context: "sequence inputs",
                expected: self.sequence_size + self.prefill_inputs,
                found: inputs.len(),
            });
        }
        if labels.len() != self.sequence_size {
            return Err(LatticaError::ShapeMismatch {
                context: "sequence labels",
                expected: self.sequence_size,
                found: labels.len(),
            });
        }
        for input in inputs {
            if input.len() != self.input_size {
                return Err(LatticaError::ShapeMismatch {
                    context: "input sample",
                    expected: self.input_size,
                    found: input.len(),
                });
            }
            self.inputs.push(input.clone());
        }
        for label in labels {
            if label.len() != self.feature_size {
                return Err(LatticaError::ShapeMismatch {
                    context: "label sample",
                    expected: self.feature_size,
                    found: label.len(),
                });
            }
            self.labels.push(label.clone());
        }
        Ok(())
    }

    /// Build from dense sample tables: one row per raw sample.
    pub fn from_arrays(
        inputs: Array2<f64>,
        labels: Array2<f64>,
        sequence_size: usize,
        prefill_inputs: usize,
    ) -> LatResult<Self> {
        let sequence_size = sequence_size.max(1);
        let inputs_per_sequence = sequence_size + prefill_inputs;
        if 0 != labels.nrows() % sequence_size {
            return Err(LatticaError::ShapeMismatch {
                context: "label rows per sequence",
                expected: sequence_size,
                found: labels.nrows(),
            });
        }
        let sequences = labels.nrows() / sequence_size;
        if inputs.nrows() != sequences * inputs_per_sequence {
            return Err(LatticaError::ShapeMismatch {
                context: "input rows",
                expected: sequences * inputs_per_sequence,
                found: inputs.nrows(),
            });
        }
        Ok(Self {
            input_size: inputs.ncols(),
            feature_size: labels.ncols(),
            sequence_size,
            prefill_inputs,
            inputs: inputs.rows().into_iter().map(|row| row.to_vec()).collect(),
            labels: labels.rows().into_iter().map(|row| row.to_vec()).collect(),
        })
    }
}

impl DataSet for SequenceData {
    fn input_size(&self) -> usize {
        self.input_size
    }

    fn feature_size(&self) -> usize {
        self.feature_size
    }

    fn number_of_sequences(&self) -> usize {
        self.labels.len() / self.sequence_size
    }

    fn sequence_size(&self) -> usize {
        self.sequence_size
    }

    fn prefill_inputs_number(&self) -> usize {
        self.prefill_inputs
    }

    fn input_sample(&self, raw_index: usize) -> &[f64] {
        &self.inputs[raw_index]
    }

    fn label_sample(&self, raw_index: usize) -> &[f64] {
        &self.labels[raw_index]
    }
}
