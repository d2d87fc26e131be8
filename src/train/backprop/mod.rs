pub mod operations;

pub use operations::{InputSource, Operation, OperationGraph, OperationKind};

use rand::prelude::*;
use tracing::{debug, trace};

use crate::context::CpuContext;
use crate::data::DataSet;
use crate::errors::{LatResult, LatticaError};
use crate::net::{FeatureKind, Network};
use crate::objective::Objective;
use crate::settings::{training_strategy, Settings};
use crate::train::updater::{UpdaterKind, WeightUpdater};

/// Reverse-mode-over-time gradient engine: evaluates the operation DAG
/// forward for every step of a sequence, then accumulates each operation's
/// derivative per weight in ascending operation order, reusing the stored
/// derivatives of earlier steps for recurrent edges.
///
/// Weights are independent of each other in the derivative pass, so the
/// per-weight chains are fanned across processing threads, each owning a
/// private slice of the gradient accumulator.
pub struct BackpropOptimizer {
    settings: Settings,
    graph: OperationGraph,
    objective: Box<dyn Objective>,
    updater: WeightUpdater,
    gradient: Vec<f64>,
    test_set: Option<Box<dyn DataSet>>,
    weight_count: usize,
    iteration: usize,
    last_training_error: f64,
    last_testing_error: f64,
}

impl BackpropOptimizer {
    pub fn build(
        settings: &Settings,
        network: &Network,
        objective: Box<dyn Objective>,
        updater: UpdaterKind,
    ) -> LatResult<Self> {
        let graph = OperationGraph::build(network)?;
        debug!(
            operations = graph.len(),
            weights = network.weight_table.len(),
            "backprop operation graph built"
        );
        Ok(Self {
            settings: settings.clone(),
            graph,
            objective,
            updater: WeightUpdater::new(updater, network.weight_table.len()),
            gradient: vec![0.0; network.weight_table.len()],
            test_set: None,
            weight_count: network.weight_table.len(),
            iteration: 0,
            last_training_error: f64::NAN,
            last_testing_error: f64::NAN,
        })
    }

    /// Swap the active update rule; accumulated velocity starts over.
    pub fn set_weight_updater(&mut self, kind: UpdaterKind) {
        self.updater = WeightUpdater::new(kind, self.weight_count);
    }

    /// Provide a held-out set for the early-stopping strategy and testing
    /// error reporting.
    pub fn with_test_set(mut self, test_set: Box<dyn DataSet>) -> Self {
        self.test_set = Some(test_set);
        self
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn last_training_error(&self) -> f64 {
        self.last_training_error
    }

    pub fn last_testing_error(&self) -> f64 {
        self.last_testing_error
    }

    /// Average gradient of one weight from the last iteration.
    pub fn avg_gradient(&self, weight_index: usize) -> f64 {
        self.gradient[weight_index]
    }

    /// Mean of absolute per-weight gradients; a blurry view of the training
    /// surface.
    pub fn avg_of_abs_gradient(&self) -> f64 {
        self.gradient.iter().map(|gradient| gradient.abs()).sum::<f64>()
            / self.weight_count.max(1) as f64
    }

    /// Stop conditions from the configured training strategies.
    pub fn stop_triggered(&self) -> bool {
        (self
            .settings
            .has_training_strategy(training_strategy::STOP_IF_TRAINING_ERROR_ZERO)
            && 0.0 == self.last_training_error)
            || (self
                .settings
                .has_training_strategy(training_strategy::EARLY_STOPPING)
                && self.test_set.is_some()
                && !self.last_testing_error.is_nan()
                && !self.last_training_error.is_nan()
                && self.last_training_error
                    > self.last_testing_error * (1.0 + self.settings.delta))
    }

    /// One training iteration: sample a minibatch, run the truncated
    /// forward/derivative passes, average, update weights through the
    /// context, and periodically refresh the context error measurements.
    pub fn iterate(&mut self, context: &mut CpuContext) -> LatResult<()> {
        let environment = context.environment();
        let number_of_sequences = environment.number_of_sequences();
        if 0 == number_of_sequences {
            return Err(LatticaError::SequenceIntervalOutOfBounds {
                start: 0,
                count: self.settings.minibatch_size,
                available: 0,
            });
        }
        {
            let network = context.network();
            if environment.feature_size() != network.output_neuron_number {
                return Err(LatticaError::ShapeMismatch {
                    context: "environment feature size",
                    expected: network.output_neuron_number,
                    found: environment.feature_size(),
                });
            }
            if environment.input_size() != network.input_size {
                return Err(LatticaError::ShapeMismatch {
                    context: "environment input size",
                    expected: network.input_size,
                    found: environment.input_size(),
                });
            }
        }

        let sequence_size = environment.sequence_size();
        let prefill = environment.prefill_inputs_number();
        let used_minibatch = self
            .settings
            .minibatch_size
            .clamp(1, number_of_sequences);
        let used_truncation = self.settings.memory_truncation.clamp(1, sequence_size);
        let sequence_indices: Vec<usize> = if used_minibatch == number_of_sequences {
            (0..number_of_sequences).collect()
        } else {
            rand::seq::index::sample(&mut thread_rng(), number_of_sequences, used_minibatch)
                .into_vec()
        };

        let mut gradient_sum = vec![0.0; self.weight_count];
        for &sequence_index in &sequence_indices {
            self.accumulate_sequence_gradient(
                context.network(),
                environment.as_ref(),
                sequence_index,
                prefill,
                sequence_size,
                used_truncation,
                &mut gradient_sum,
            )?;
        }
        let scale = 1.0 / (used_minibatch * sequence_size) as f64;
        for (slot, sum) in self.gradient.iter_mut().zip(&gradient_sum) {
            *slot = sum * scale;
        }
        trace!(
            iteration = self.iteration,
            avg_abs_gradient = self.avg_of_abs_gradient(),
            "gradient accumulated"
        );

        if self.updater.is_finished() {
            self.updater.start();
        }
        self.updater
            .iterate(&self.settings, context.network_mut(), &self.gradient);
        context.refresh_solution_weights();

        self.iteration += 1;
        if 0 == self.iteration % self.settings.training_relevant_loop_count {
            self.last_training_error = context.full_evaluation()?;
            if let Some(test_set) = &self.test_set {
                self.last_testing_error = context.evaluate_set(test_set.as_ref())?;
            }
            debug!(
                iteration = self.iteration,
                training_error = self.last_training_error,
                testing_error = self.last_testing_error,
                "context errors refreshed"
            );
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn accumulate_sequence_gradient(
        &self,
        network: &Network,
        environment: &dyn DataSet,
        sequence_index: usize,
        prefill: usize,
        sequence_size: usize,
        used_truncation: usize,
        gradient_sum: &mut [f64],
    ) -> LatResult<()> {
        let steps = prefill + sequence_size;
        let raw_input_start = sequence_index * steps;
        let raw_label_start = sequence_index * sequence_size;
        let feature_size = environment.feature_size();

        let mut values_by_step: Vec<Vec<f64>> = Vec::with_capacity(steps);
        let mut predictions_by_step: Vec<Vec<f64>> = Vec::with_capacity(steps);
        for step in 0..steps {
            let label = (step >= prefill)
                .then(|| environment.label_sample(raw_label_start + step - prefill));
            self.compute_step_values(
                network,
                environment.input_sample(raw_input_start + step),
                label,
                feature_size,
                &mut values_by_step,
            )?;
            predictions_by_step.push(self.collect_outputs(
                network,
                values_by_step.last().expect("slot was just pushed"),
            ));
        }

        // Later steps contribute to values only; derivatives are cut at the
        // truncation window.
        let derivative_steps = prefill + used_truncation;
        let per_thread = 1 + self.weight_count / self.settings.max_processing_threads.max(1);
        let graph = &self.graph;
        let objective = self.objective.as_ref();
        let values = &values_by_step;
        let predictions = &predictions_by_step;
        std::thread::scope(|scope| {
            for (chunk_index, chunk) in gradient_sum.chunks_mut(per_thread).enumerate() {
                let chunk_start = chunk_index * per_thread;
                scope.spawn(move || {
                    let mut derivatives_by_step: Vec<Vec<f64>> = Vec::with_capacity(derivative_steps);
                    for (offset, gradient_slot) in chunk.iter_mut().enumerate() {
                        let weight_index = chunk_start + offset;
                        derivatives_by_step.clear();
                        for step in 0..derivative_steps {
                            let label = (step >= prefill).then(|| {
                                environment.label_sample(raw_label_start + step - prefill)
                            });
                            let contribution = derive_step(
                                graph,
                                network,
                                objective,
                                weight_index,
                                step,
                                environment.input_sample(raw_input_start + step),
                                values,
                                &predictions[step],
                                label,
                                feature_size,
                                &mut derivatives_by_step,
                            );
                            if step >= prefill {
                                *gradient_slot += contribution;
                            }
                        }
                    }
                });
            }
        });
        Ok(())
    }

    /// Evaluate every operation for one step, appending the new value slot.
    fn compute_step_values(
        &self,
        network: &Network,
        input: &[f64],
        label: Option<&[f64]>,
        feature_size: usize,
        values_by_step: &mut Vec<Vec<f64>>,
    ) -> LatResult<()> {
        let step = values_by_step.len();
        let mut slot = vec![0.0; self.graph.len()];
        let mut rng = thread_rng();
        for op_index in 0..self.graph.len() {
            match &self.graph.operations[op_index].kind {
                OperationKind::NeuronInput {
                    sources,
                    weights,
                    bias_weight,
                    ..
                } => {
                    let mut sum = network.weight_table[*bias_weight];
                    for (source, &weight_index) in sources.iter().zip(weights) {
                        let value = match source {
                            InputSource::External(external) =>

                                *input.get(*external).ok_or(
                                    LatticaError::IndexOutOfBounds {
                                        what: "external input",
                                        index: *external,
                                        bound: input.len(),
                                    },
                                )?,
                            InputSource::Spike { neuron, reach_past } => self.spike_value(
                                *neuron,
                                *reach_past as usize,
                                step,
                                &slot,
                                values_by_step,
                            ),
                        };
                        sum += network.weight_table[weight_index] * value;
                    }
                    slot[op_index] = sum;
                }
                OperationKind::NeuronTransfer {
                    transfer, input_op, ..
                } => slot[op_index] = transfer.activate(slot[*input_op]),
                OperationKind::NeuronSpike { transfer_op, .. } => {
                    slot[op_index] = slot[*transfer_op]
                }
                OperationKind::SolutionFeature {
                    feature_index,
                    member_spikes,
                } => {
                    apply_feature_over_spikes(
                        network.features[*feature_index].kind,
                        &self.settings,
                        member_spikes,
                        &mut slot,
                        &mut rng,
                    );
                }
                OperationKind::Objective {
                    output_index,
                    spike_op,
                } => {
                    slot[op_index] = match label {
                        Some(label) => self.objective.feature_error(
                            &label[*output_index..*output_index + 1],
                            &slot[*spike_op..*spike_op + 1],
                            feature_size,
                        ),
                        None => 0.0,
                    };
                }
            }
        }
        values_by_step.push(slot);
        Ok(())
    }

    fn spike_value(
        &self,
        neuron: usize,
        reach_past: usize,
        step: usize,
        current_slot: &[f64],
        values_by_step: &[Vec<f64>],
    ) -> f64 {
        let spike_op = self
            .graph
            .spike_of(neuron)
            .expect("every referenced neuron has a placed spike");
        if 0 == reach_past {
            current_slot[spike_op]
        } else if reach_past <= step {
            values_by_step[step - reach_past][spike_op]
        } else {
            0.0
        }
    }

    fn collect_outputs(&self, network: &Network, slot: &[f64]) -> Vec<f64> {
        let output_start = network.neuron_count() - network.output_neuron_number;
        (output_start..network.neuron_count())
            .map(|neuron| {
                slot[self
                    .graph
                    .spike_of(neuron)
                    .expect("output neurons always carry spikes")]
            })
            .collect()
    }
}

/// Derivative of every operation with respect to one weight at one step,
/// appended as a new slot; returns the step's objective contribution.
#[allow(clippy::too_many_arguments)]
fn derive_step(
    graph: &OperationGraph,
    network: &Network,
    objective: &dyn Objective,
    weight_index: usize,
    step: usize,
    input: &[f64],
    values_by_step: &[Vec<f64>],
    prediction: &[f64],
    label: Option<&[f64]>,
    feature_size: usize,
    derivatives_by_step: &mut Vec<Vec<f64>>,
) -> f64 {
    let mut slot = vec![0.0; graph.len()];
    let mut objective_contribution = 0.0;
    for op_index in 0..graph.len() {
        match &graph.operations[op_index].kind {
            OperationKind::NeuronInput {
                sources,
                weights,
                bias_weight,
                ..
            } => {
                let mut derivative = if *bias_weight == weight_index { 1.0 } else { 0.0 };
                for (source, &paired_weight) in sources.iter().zip(weights) {
                    let (source_value, source_derivative) = match source {
                        // External inputs are constants with respect to the
                        // weights.
                        InputSource::External(external) => (input[*external], 0.0),
                        InputSource::Spike { neuron, reach_past } => {
                            let spike_op = graph
                                .spike_of(*neuron)
                                .expect("every referenced neuron has a placed spike");
                            let reach = *reach_past as usize;
                            if 0 == reach {
                                (values_by_step[step][spike_op], slot[spike_op])
                            } else if reach <= step {
                                (
                                    values_by_step[step - reach][spike_op],
                                    derivatives_by_step[step - reach][spike_op],
                                )
                            } else {
                                (0.0, 0.0)
                            }
                        }
                    };
                    derivative += network.weight_table[paired_weight] * source_derivative;
                    if paired_weight == weight_index {
                        derivative += source_value;
                    }
                }
                slot[op_index] = derivative;
            }
            OperationKind::NeuronTransfer {
                transfer, input_op, ..
            } => {
                slot[op_index] =
                    transfer.derivative(values_by_step[step][*input_op]) * slot[*input_op];
            }
            OperationKind::NeuronSpike { transfer_op, .. } => slot[op_index] = slot[*transfer_op],
            OperationKind::SolutionFeature { .. } => {
                // Solution features have no derivative of their own.
            }
            OperationKind::Objective {
                output_index,
                spike_op,
            } => {
                if let Some(label) = label {
                    let derivative = objective.d_cost_d_feature(
                        *output_index,
                        label,
                        prediction,
                        feature_size,
                    ) * slot[*spike_op];
                    slot[op_index] = derivative;
                    objective_contribution += derivative;
                }
            }
        }
    }
    derivatives_by_step.push(slot);
    objective_contribution
}

fn apply_feature_over_spikes(
    kind: FeatureKind,
    settings: &Settings,
    member_spikes: &[usize],
    slot: &mut [f64],
    rng: &mut impl Rng,
) {
    match kind {
        FeatureKind::Softmax => {
            let max = member_spikes
                .iter()
                .map(|&spike| slot[spike])
                .fold(f64::NEG_INFINITY, f64::max);
            let exp_sum: f64 = member_spikes
                .iter()
                .map(|&spike| (slot[spike] - max).exp())
                .sum();
            let exp_sum = exp_sum.max(f64::EPSILON);
            for &spike in member_spikes {
                slot[spike] = (slot[spike] - max).exp() / exp_sum;
            }
        }
        FeatureKind::Dropout => {
            for &spike in member_spikes {
                if rng.gen::<f64>() < settings.dropout_probability {
                    slot[spike] = 0.0;
                }
            }
        }
        _ => {}
    }
}
