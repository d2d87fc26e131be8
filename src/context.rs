use std::sync::{Arc, Mutex, MutexGuard};

use rand::prelude::*;
use tracing::debug;

use crate::data::{DataSet, SequenceData};
use crate::errors::{LatResult, LatticaError};
use crate::net::Network;
use crate::objective::Objective;
use crate::settings::Settings;
use crate::solve::{FeatureExecutor, SolutionBuilder, SolutionSolver};
use crate::train::adapter::WeightAdapter;
use crate::train::updater::{UpdaterKind, WeightUpdater};
use crate::utils::ThreadGroup;

/// The evaluation façade: owns a network, its compiled solution and solver,
/// the weight adapter and updater, an objective and the current environment.
/// Exposes full and stochastic evaluation, standalone solving and the
/// error-state checkpointing the optimizers drive.
pub struct CpuContext {
    settings: Settings,
    network: Network,
    solver: SolutionSolver,
    adapter: WeightAdapter,
    updater: WeightUpdater,
    objective: Box<dyn Objective>,
    environment: Arc<dyn DataSet>,
    processing_threads: ThreadGroup,
    error_values: Vec<f64>,
    state_stack: Vec<Vec<f64>>,
    used_minibatch_size: usize,
    used_sequence_truncation: usize,
    loops_unchecked: usize,
}

impl CpuContext {
    pub fn new(
        network: Network,
        settings: &Settings,
        objective: Box<dyn Objective>,
    ) -> LatResult<Self> {
        let solution = SolutionBuilder::new(settings).build(&network)?;
        let solver = SolutionSolver::new(solution, settings)?;
        let environment: Arc<dyn DataSet> = Arc::new(SequenceData::new(
            network.input_size,
            network.output_neuron_number,
            1,
        ));
        let updater = WeightUpdater::new(UpdaterKind::Plain, network.weight_table.len());
        Ok(Self {
            settings: settings.clone(),
            network,
            solver,
            adapter: WeightAdapter::new(),
            updater,
            objective,
            environment,
            processing_threads: ThreadGroup::new(settings.max_processing_threads),
            error_values: Vec::new(),
            state_stack: Vec::new(),
            used_minibatch_size: 1,
            used_sequence_truncation: 1,
            loops_unchecked: 0,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    /// Direct weight access for the optimizers; call
    /// [`refresh_solution_weights`](Self::refresh_solution_weights) after
    /// mutating.
    pub fn network_mut(&mut self) -> &mut Network {
        &mut self.network
    }

    pub fn solver(&self) -> &SolutionSolver {
        &self.solver
    }

    pub fn environment(&self) -> Arc<dyn DataSet> {
        Arc::clone(&self.environment)
    }

    /// Swap the evaluated environment. Sizes must match the network; the
    /// per-label error buffer and the clamped minibatch/truncation windows
    /// follow the new set.
    pub fn set_environment(&mut self, environment: Arc<dyn DataSet>) -> LatResult<()> {
        if environment.feature_size() != self.network.output_neuron_number {
            return Err(LatticaError::ShapeMismatch {
                context: "environment feature size",
                expected: self.network.output_neuron_number,
                found: environment.feature_size(),
            });
        }
        if environment.input_size() != self.network.input_size {
            return Err(LatticaError::ShapeMismatch {
                context: "environment input size",
                expected: self.network.input_size,
                found: environment.input_size(),
            });
        }
        self.error_values = vec![0.0; environment.number_of_label_samples()];
        self.used_minibatch_size = self
            .settings
            .minibatch_size
            .clamp(1, environment.number_of_sequences().max(1));
        self.used_sequence_truncation = self
            .settings
            .memory_truncation
            .clamp(1, environment.sequence_size());
        self.environment = environment;
        debug!(
            sequences = self.environment.number_of_sequences(),
            minibatch = self.used_minibatch_size,
            truncation = self.used_sequence_truncation,
            "environment set"
        );
        Ok(())
    }

    pub fn set_objective(&mut self, objective: Box<dyn Objective>) {
        self.objective = objective;
    }

    pub fn set_weight_updater(&mut self, kind: UpdaterKind) {
        self.updater = WeightUpdater::new(kind, self.network.weight_table.len());
    }

    /// Copy the network weights into every partial of the compiled solution.
    pub fn refresh_solution_weights(&mut self) {
        self.adapter.update_solution_with_weights(
            &self.network,
            self.solver.solution_mut(),
            self.settings.max_solve_threads,
        );
    }

    pub fn set_network_weight(&mut self, weight_index: usize, value: f64) -> LatResult<()> {
        let bound = self.network.weight_table.len();
        *self
            .network
            .weight_table
            .get_mut(weight_index)
            .ok_or(LatticaError::IndexOutOfBounds {
                what: "network weight",
                index: weight_index,
                bound,
            })? = value;
        self.adapter
            .update_solution_with_weight(&self.network, self.solver.solution_mut(), weight_index)
    }

    pub fn set_network_weights(&mut self, weights: &[f64]) -> LatResult<()> {
        if weights.len() != self.network.weight_table.len() {
            return Err(LatticaError::ShapeMismatch {
                context: "network weights",
                expected: self.network.weight_table.len(),
                found: weights.len(),
            });
        }
        self.network.weight_table.copy_from_slice(weights);
        self.refresh_solution_weights();
        Ok(())
    }

    /// Run one weight-update pass through the owned updater and refresh the
    /// solution.
    pub fn apply_weight_update(&mut self, gradients: &[f64]) -> LatResult<()> {
        if gradients.len() != self.network.weight_table.len() {
            return Err(LatticaError::ShapeMismatch {
                context: "weight update",
                expected: self.network.weight_table.len(),
                found: gradients.len(),
            });
        }
        if self.updater.is_finished() {
            self.updater.start();
        }
        self.updater
            .iterate(&self.settings, &mut self.network, gradients);
        self.refresh_solution_weights();
        Ok(())
    }

    /// Solve a single input against thread slot 0.
    pub fn solve(&self, input: &[f64], reset_neuron_data: bool) -> LatResult<Vec<f64>> {
        self.solver.solve(input, reset_neuron_data, 0)
    }

    /// Error over every sequence of the environment.
    pub fn full_evaluation(&mut self) -> LatResult<f64> {
        let environment = Arc::clone(&self.environment);
        let sequences = environment.number_of_sequences();
        if 0 == sequences {
            return Ok(0.0);
        }
        self.loops_unchecked = 0;
        let sequence_size = environment.sequence_size();
        let raw_error = Self::evaluate(
            &self.solver,
            &self.processing_threads,
            self.objective.as_ref(),
            environment.as_ref(),
            &mut self.error_values,
            0,
            sequences,
            0,
            sequence_size,
        )?;
        Ok(self.error_post_process(raw_error, sequences * sequence_size))
    }

    /// Error over a random minibatch with a random truncation window. Every
    /// `tolerance_loop_value` stochastic passes the partial picture is
    /// re-anchored with one full evaluation.
    pub fn stochastic_evaluation(&mut self, seed: Option<u64>) -> LatResult<f64> {
        let environment = Arc::clone(&self.environment);
        let sequences = environment.number_of_sequences();
        if 0 == sequences {
            return Ok(0.0);
        }
        self.loops_unchecked += 1;
        if self.loops_unchecked > self.settings.tolerance_loop_value {
            self.loops_unchecked = 0;
            return self.full_evaluation();
        }
        let mut rng: StdRng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let sequence_start = rng.gen_range(0..=sequences - self.used_minibatch_size);
        let start_in_sequence =
            rng.gen_range(0..=environment.sequence_size() - self.used_sequence_truncation);
        let raw_error = Self::evaluate(
            &self.solver,
            &self.processing_threads,
            self.objective.as_ref(),
            environment.as_ref(),
            &mut self.error_values,
            sequence_start,
            self.used_minibatch_size,
            start_in_sequence,
            self.used_sequence_truncation,
        )?;
        Ok(self.error_post_process(
            raw_error,
            self.used_minibatch_size * environment.sequence_size(),
        ))
    }

    /// Full evaluation of a foreign data set, without touching the owned
    /// error buffer.
    pub fn evaluate_set(&mut self, environment: &dyn DataSet) -> LatResult<f64> {
        let sequences = environment.number_of_sequences();
        if 0 == sequences {
            return Ok(0.0);
        }
        let mut error_values = vec![0.0; environment.number_of_label_samples()];
        let sequence_size = environment.sequence_size();
        let raw_error = Self::evaluate(
            &self.solver,
            &self.processing_threads,
            self.objective.as_ref(),
            environment,
            &mut error_values,
            0,
            sequences,
            0,
            sequence_size,
        )?;
        Ok(self.error_post_process(raw_error, sequences * sequence_size))
    }

    /// Checkpoint the per-label error state.
    pub fn push_state(&mut self) {
        self.state_stack.push(self.error_values.clone());
    }

    /// Restore the last checkpointed error state.
    pub fn pop_state(&mut self) {
        if let Some(saved) = self.state_stack.pop() {
            self.error_values = saved;
        }
    }

    /// Raw loss plus every performance-relevant feature's contribution,
    /// divided by the number of evaluated labels.
    fn error_post_process(&self, raw_error: f64, labels_evaluated: usize) -> f64 {
        let mut result = raw_error;
        for feature in &self.network.features {
            if feature.kind.is_performance_relevant() {
                result += FeatureExecutor::calculate_performance_relevant(
                    feature,
                    &self.network,
                    &self.processing_threads,
                );
            }
        }
        result / labels_evaluated.max(1) as f64
    }

    #[allow(clippy::too_many_arguments)]
    fn evaluate(
        solver: &SolutionSolver,
        processing_threads: &ThreadGroup,
        objective: &dyn Objective,
        environment: &dyn DataSet,
        error_values: &mut Vec<f64>,
        sequence_start: usize,
        sequences_to_evaluate: usize,
        start_in_sequence: usize,
        truncation: usize,
    ) -> LatResult<f64> {
        if environment.number_of_sequences() < sequence_start + sequences_to_evaluate {
            return Err(LatticaError::SequenceIntervalOutOfBounds {
                start: sequence_start,
                count: sequences_to_evaluate,
                available: environment.number_of_sequences(),
            });
        }
        if error_values.len() < environment.number_of_label_samples() {
            error_values.resize(environment.number_of_label_samples(), 0.0);
        }
        solver.set_eval_mode(true);

        let threads = processing_threads.thread_count();
        let sequence_size = environment.sequence_size();
        let prefill = environment.prefill_inputs_number();
        let mut error_sum = 0.0;
        let mut sequence_index = sequence_start;
        while sequence_index < sequence_start + sequences_to_evaluate {
            let outputs: Vec<Mutex<Vec<f64>>> = (0..threads * sequence_size)
                .map(|_| Mutex::new(Vec::new()))
                .collect();
            let failure: Mutex<Option<LatticaError>> = Mutex::new(None);
            processing_threads.start_and_block(&|thread_index| {
                let sequence = sequence_index + thread_index;
                // Thread fan-out may point past the evaluated range when the
                // range is not a multiple of the thread count.
                if sequence >= sequence_start + sequences_to_evaluate {
                    return;
                }
                let mut raw_inputs_index = sequence * (sequence_size + prefill);
                for prefill_iterator in 0..prefill {
                    // The first few inputs only set up the network state.
                    if let Err(error) = solver.solve(
                        environment.input_sample(raw_inputs_index),
                        0 == prefill_iterator,
                        thread_index,
                    ) {
                        lock(&failure).get_or_insert(error);
                        return;
                    }
                    raw_inputs_index += 1;
                }
                for step in 0..sequence_size {
                    let reset = 0 == prefill && 0 == step;
                    match solver.solve(
                        environment.input_sample(raw_inputs_index),
                        reset,
                        thread_index,
                    ) {
                        Ok(output) => {
                            *lock(&outputs[thread_index * sequence_size + step]) = output
                        }
                        Err(error) => {
                            lock(&failure).get_or_insert(error);
                            return;
                        }
                    }
                    raw_inputs_index += 1;
                }
            });
            if let Some(error) = failure.into_inner().unwrap_or_else(|e| e.into_inner()) {
                return Err(error);
            }
            let predictions: Vec<Vec<f64>> = outputs
                .into_iter()
                .map(|output| output.into_inner().unwrap_or_else(|e| e.into_inner()))
                .collect();
            let evaluated_now =
                (sequence_start + sequences_to_evaluate - sequence_index).min(threads);
            error_sum += objective.set_features_for_sequences(
                environment,
                &predictions,
                sequence_index,
                evaluated_now,
                start_in_sequence,
                truncation,
                error_values,
            )?;
            sequence_index += threads;
        }
        Ok(error_sum)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
