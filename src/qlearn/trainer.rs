use std::sync::Arc;

use ndarray_rand::rand_distr::Normal;
use rand::prelude::*;
use tracing::debug;

use crate::context::CpuContext;
use crate::errors::{LatResult, LatticaError};
use crate::net::Network;
use crate::objective::{CostKind, CostObjective};
use crate::qlearn::environment::QEnvironment;
use crate::qlearn::set::{action_slot_size, action_table_size, QSet};
use crate::settings::Settings;
use crate::train::updater::UpdaterKind;
use crate::train::BackpropOptimizer;

/// Exploration/exploitation loop over a [`QEnvironment`]: discovers
/// experiences with the stable policy network, folds them into the q-set,
/// trains the volatile network on the set, and periodically promotes the
/// volatile weights into the stable network used for action selection.
pub struct QTrainer {
    settings: Settings,
    policy_context: CpuContext,
    learner_context: CpuContext,
    optimizer: BackpropOptimizer,
    q_set: QSet,
    state_size: usize,
    action_size: usize,
    iteration: usize,
}

impl QTrainer {
    /// The policy network maps a state to a full ranked action table:
    /// its input size must equal the environment state size and its output
    /// count `action_table_size(action_size, action_count)`.
    pub fn new(
        network: Network,
        state_size: usize,
        action_size: usize,
        action_count: usize,
        max_set_size: usize,
        cost: CostKind,
        settings: &Settings,
    ) -> LatResult<Self> {
        if network.input_size != state_size {
            return Err(LatticaError::ShapeMismatch {
                context: "policy network input",
                expected: state_size,
                found: network.input_size,
            });
        }
        let expected_outputs = action_table_size(action_size, action_count);
        if network.output_neuron_number != expected_outputs {
            return Err(LatticaError::ShapeMismatch {
                context: "policy network output",
                expected: expected_outputs,
                found: network.output_neuron_number,
            });
        }
        let policy_context =
            CpuContext::new(network.clone(), settings, Box::new(CostObjective::new(cost)))?;
        let learner_context =
            CpuContext::new(network, settings, Box::new(CostObjective::new(cost)))?;
        let optimizer = BackpropOptimizer::build(
            settings,
            learner_context.network(),
            Box::new(CostObjective::new(cost)),
            UpdaterKind::Plain,
        )?;
        let q_set = QSet::new(
            settings,
            state_size,
            action_size,
            action_count,
            max_set_size,
            settings.delta,
        );
        Ok(Self {
            settings: settings.clone(),
            policy_context,
            learner_context,
            optimizer,
            q_set,
            state_size,
            action_size,
            iteration: 0,
        })
    }

    pub fn set_weight_updater(&mut self, kind: UpdaterKind) {
        self.optimizer.set_weight_updater(kind);
    }

    pub fn q_set(&self) -> &QSet {
        &self.q_set
    }

    pub fn q_set_size(&self) -> usize {
        self.q_set.len()
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// Training error of the volatile network over the q-set.
    pub fn full_evaluation(&mut self) -> LatResult<f64> {
        self.learner_context.full_evaluation()
    }

    pub fn stochastic_evaluation(&mut self, seed: Option<u64>) -> LatResult<f64> {
        self.learner_context.stochastic_evaluation(seed)
    }

    /// One q-learning iteration: discovery walk, q-set incorporation,
    /// policy training epochs, and the periodic stable-network sync.
    pub fn iterate(
        &mut self,
        environment: &mut dyn QEnvironment,
        max_discovery_length: usize,
        exploration_ratio: f64,
        q_set_training_epochs: usize,
    ) -> LatResult<()> {
        let mut experience_states: Vec<Vec<f64>> = Vec::new();
        let mut experience_actions: Vec<Vec<f64>> = Vec::new();
        if 0 < max_discovery_length {
            let mut current_state = environment.current_state();
            let mut discovery_step = 0usize;
            while let Some(state) = current_state.take() {
                if discovery_step >= max_discovery_length {
                    break;
                }
                let action = self.generate_action(&state, exploration_ratio, environment)?;
                let transition = environment.next(&action);
                let mut action_slot = Vec::with_capacity(action_slot_size(self.action_size));
                action_slot.push(transition.q_value);
                action_slot.extend_from_slice(&action);
                experience_states.push(state);
                experience_actions.push(action_slot);
                if transition.terminal {
                    break;
                }
                current_state = transition.state;
                discovery_step += 1;
            }
        }
        debug!(
            iteration = self.iteration,
            discovered = experience_states.len(),
            "discovery walk finished"
        );

        if !experience_states.is_empty() {
            self.q_set
                .incorporate(&experience_states, &experience_actions, environment)?;
        }

        if 0 < q_set_training_epochs && !self.q_set.is_empty() {
            self.learner_context
                .set_environment(Arc::new(self.q_set.training_snapshot()))?;
            for _ in 0..q_set_training_epochs {
                self.optimizer.iterate(&mut self.learner_context)?;
            }
        }

        if 0 == self.iteration % self.settings.training_relevant_loop_count {
            let volatile_weights = self.learner_context.network().weight_table.clone();
            self.policy_context.set_network_weights(&volatile_weights)?;
            debug!(iteration = self.iteration, "stable network synchronized");
        }
        self.iteration += 1;
        Ok(())
    }

    /// The policy's best action for the state, with elements resampled from
    /// the environment's action distribution at the exploration ratio.
    fn generate_action(
        &self,
        state: &[f64],
        exploration_ratio: f64,
        environment: &dyn QEnvironment,
    ) -> LatResult<Vec<f64>> {
        debug_assert_eq!(state.len(), self.state_size);
        let policy_output = self.policy_context.solve(state, true)?;
        // Slot 0 of the predicted table carries the best action.
        let mut action = policy_output[1..1 + self.action_size].to_vec();
        let mut rng = thread_rng();
        if rng.gen::<f64>() < exploration_ratio {
            let properties = environment.action_properties();
            let distribution = Normal::new(properties.mean, properties.standard_deviation)
                .unwrap_or(Normal::new(0.0, 1.0).expect("unit normal is well formed"));
            let mut randomized = 0usize;
            for element in action.iter_mut() {
                if rng.gen::<f64>() < exploration_ratio {
                    *element = rng.sample(distribution);
                    randomized += 1;
                }
            }
            if 0 == randomized {
                // Exploring with an unchanged action would be exploitation.
                let index = rng.gen_range(0..action.len());
                action[index] = rng.sample(distribution);
            }
        }
        Ok(action)
    }
}
