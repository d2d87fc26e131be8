use serde::{Deserialize, Serialize};

use crate::data::DataSet;
use crate::errors::{LatResult, LatticaError};

/// Cost function tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CostKind {
    /// Squared error averaged over the feature dimension.
    MeanSquaredError,
    /// Plain summed squared error.
    SquaredError,
    /// Multi-class cross entropy over a probability-shaped prediction.
    CrossEntropy,
    /// Per-feature binary cross entropy.
    BinaryCrossEntropy,
}

/// Keeps logarithms and divisions away from exact zeros and ones.
const PROBABILITY_EPSILON: f64 = 1e-15;

fn clamp_probability(value: f64) -> f64 {
    value.clamp(PROBABILITY_EPSILON, 1.0 - PROBABILITY_EPSILON)
}

/// Scalar loss and per-feature derivatives for one label/prediction pair.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CostFunction {
    pub kind: CostKind,
}

impl CostFunction {
    pub fn new(kind: CostKind) -> Self {
        Self { kind }
    }

    /// Error of one pair; `sample_count` is the normalization base (the
    /// feature dimension for averaged kinds).
    pub fn feature_error(&self, label: &[f64], prediction: &[f64], sample_count: usize) -> f64 {
        let sample_count = sample_count.max(1) as f64;
        match self.kind {
            CostKind::MeanSquaredError | CostKind::SquaredError => {
                let squared_sum: f64 = label
                    .iter()
                    .zip(prediction)
                    .map(|(&label_value, &predicted)| (label_value - predicted).powi(2))
                    .sum();
                if CostKind::MeanSquaredError == self.kind {
                    squared_sum / (2.0 * sample_count)
                } else {
                    squared_sum / 2.0
                }
            }
            CostKind::CrossEntropy => {
                label
                    .iter()
                    .zip(prediction)
                    .map(|(&label_value, &predicted)| {
                        -label_value * clamp_probability(predicted).ln()
                    })
                    .sum::<f64>()
                    / sample_count
            }
            CostKind::BinaryCrossEntropy => {
                label
                    .iter()
                    .zip(prediction)
                    .map(|(&label_value, &predicted)| {
                        let predicted = clamp_probability(predicted);
                        -(label_value * predicted.ln()
                            + (1.0 - label_value) * (1.0 - predicted).ln())
                    })
                    .sum::<f64>()
                    / sample_count
            }
        }
    }

    /// Derivative of the error with respect to `prediction[feature_index]`.
    pub fn d_cost_d_feature(
        &self,
        feature_index: usize,
        label: &[f64],
        prediction: &[f64],
        sample_count: usize,
    ) -> f64 {
        let sample_count = sample_count.max(1) as f64;
        match self.kind {
            CostKind::MeanSquaredError => {
                (prediction[feature_index] - label[feature_index]) / sample_count
            }
            CostKind::SquaredError => prediction[feature_index] - label[feature_index],
            CostKind::CrossEntropy => {
                -label[feature_index] / clamp_probability(prediction[feature_index]) / sample_count
            }
            CostKind::BinaryCrossEntropy => {
                let predicted = clamp_probability(prediction[feature_index]);
                (predicted - label[feature_index]) / (predicted * (1.0 - predicted)) / sample_count
            }
        }
    }
}

/// An evaluation interface over a cost function: compares network output
/// against environment labels, per label or batched over a rectangle of
/// (sequence, in-sequence-step) pairs.
pub trait Objective: Send + Sync {
    fn feature_error(&self, label: &[f64], prediction: &[f64], sample_count: usize) -> f64;

    fn d_cost_d_feature(
        &self,
        feature_index: usize,
        label: &[f64],
        prediction: &[f64],
        sample_count: usize,
    ) -> f64;

    /// Aggregate error over `count` sequences starting at `sequence_start`,
    /// evaluating `truncation` steps from `start_in_sequence` in each.
    ///
    /// `predictions` holds one output vector per (evaluated sequence, step),
    /// laid out as `predictions[sequence_slot * sequence_size + step]`.
    /// Per-label errors are written into `error_buffer` at raw label
    /// indices; the evaluated labels' error sum is returned.
    #[allow(clippy::too_many_arguments)]
    fn set_features_for_sequences(
        &self,
        environment: &dyn DataSet,
        predictions: &[Vec<f64>],
        sequence_start: usize,
        count: usize,
        start_in_sequence: usize,
        truncation: usize,
        error_buffer: &mut [f64],
    ) -> LatResult<f64>;
}

/// The default [`Objective`]: one [`CostFunction`] applied uniformly.
#[derive(Clone, Copy, Debug)]
pub struct CostObjective {
    cost: CostFunction,
}

impl CostObjective {
    pub fn new(kind: CostKind) -> Self {
        Self {
            cost: CostFunction::new(kind),
        }
    }

    pub fn cost(&self) -> &CostFunction {
        &self.cost
    }
}

impl Objective for CostObjective {
    fn feature_error(&self, label: &[f64], prediction: &[f64], sample_count: usize) -> f64 {
        self.cost.feature_error(label, prediction, sample_count)
    }

    fn d_cost_d_feature(
        &self,
        feature_index: usize,
        label: &[f64],
        prediction: &[f64],
        sample_count: usize,
    ) -> f64 {
        self.cost
            .d_cost_d_feature(feature_index, label, prediction, sample_count)
    }

    fn set_features_for_sequences(
        &self,
        environment: &dyn DataSet,
        predictions: &[Vec<f64>],
        sequence_start: usize,
        count: usize,
        start_in_sequence: usize,
        truncation: usize,
        error_buffer: &mut [f64],
    ) -> LatResult<f64> {
        if sequence_start + count > environment.number_of_sequences() {
            return Err(LatticaError::SequenceIntervalOutOfBounds {
                start: sequence_start,
                count,
                available: environment.number_of_sequences(),
            });
        }
        let sequence_size = environment.sequence_size();
        if start_in_sequence + truncation > sequence_size {
            return Err(LatticaError::SequenceIntervalOutOfBounds {
                start: start_in_sequence,
                count: truncation,
                available: sequence_size,
            });
        }
        let feature_size = environment.feature_size();
        let mut error_sum = 0.0;
        for sequence_slot in 0..count {
            for step in start_in_sequence..start_in_sequence + truncation {
                let raw_label_index = (sequence_start + sequence_slot) * sequence_size + step;
                let prediction = &predictions[sequence_slot * sequence_size + step];
                let error = self.feature_error(
                    environment.label_sample(raw_label_index),
                    &prediction[..feature_size.min(prediction.len())],
                    feature_size,
                );
                error_buffer[raw_label_index] = error;
                error_sum += error;
            }
        }
        Ok(error_sum)
    }
}
