use serde::{Deserialize, Serialize};

use crate::net::Network;
use crate::settings::Settings;

/// Which update rule a [`WeightUpdater`] applies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdaterKind {
    Plain,
    Momentum,
    Nesterov,
    Adam,
    AmsGrad,
}

/// Variant-specific accumulators. One tagged union instead of an
/// inheritance chain; the shared velocity vector lives in the updater.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum UpdateRule {
    Plain,
    Momentum {
        previous_velocity: Vec<f64>,
    },
    Nesterov {
        previous_velocity: Vec<f64>,
        velocity_at_start: Vec<f64>,
    },
    Adam {
        moment: Vec<f64>,
        second_moment: Vec<f64>,
        iteration_count: u32,
    },
    AmsGrad {
        moment: Vec<f64>,
        second_moment_max: Vec<f64>,
    },
}

/// Mutates network weights from gradient vectors under a pluggable rule.
///
/// Contract: `start()`, then `iterate(..)` once per optimizer pass until
/// `is_finished()`. Every variant computes a per-weight velocity and applies
/// `w += v`; velocities always point down the gradient. Nesterov needs two
/// iterations per completed step, every other variant one.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WeightUpdater {
    velocity: Vec<f64>,
    rule: UpdateRule,
    required_iterations_for_step: usize,
    iteration: usize,
    finished: bool,
}

impl WeightUpdater {
    pub fn new(kind: UpdaterKind, weight_count: usize) -> Self {
        let zeroes = || vec![0.0; weight_count];
        let (rule, required_iterations_for_step) = match kind {
            UpdaterKind::Plain => (UpdateRule::Plain, 1),
            UpdaterKind::Momentum => (
                UpdateRule::Momentum {
                    previous_velocity: zeroes(),
                },
                1,
            ),
            UpdaterKind::Nesterov => (
                UpdateRule::Nesterov {
                    previous_velocity: zeroes(),
                    velocity_at_start: zeroes(),
                },
                2,
            ),
            UpdaterKind::Adam => (
                UpdateRule::Adam {
                    moment: zeroes(),
                    second_moment: zeroes(),
                    iteration_count: 1,
                },
                1,
            ),
            UpdaterKind::AmsGrad => (
                UpdateRule::AmsGrad {
                    moment: zeroes(),
                    second_moment_max: zeroes(),
                },
                1,
            ),
        };
        Self {
            velocity: vec![0.0; weight_count],
            rule,
            required_iterations_for_step,
            iteration: 0,
            finished: true,
        }
    }

    /// Signal that a weight-update step begins.
    pub fn start(&mut self) {
        self.iteration = 0;
        self.finished = false;
        if let UpdateRule::Nesterov {
            previous_velocity,
            velocity_at_start,
        } = &mut self.rule
        {
            velocity_at_start.copy_from_slice(previous_velocity);
        }
    }

    /// One update pass: compute the velocity from the gradients and apply it
    /// to the network weight table. A step counts as complete once
    /// `required_iterations_for_step` passes happened.
    pub fn iterate(&mut self, settings: &Settings, network: &mut Network, gradients: &[f64]) {
        debug_assert_eq!(gradients.len(), network.weight_table.len());
        self.calculate_velocity(settings, gradients);
        for (weight, &velocity) in network.weight_table.iter_mut().zip(&self.velocity) {
            *weight += velocity;
        }
        match &mut self.rule {
            UpdateRule::Momentum { previous_velocity }
            | UpdateRule::Nesterov {
                previous_velocity, ..
            } => previous_velocity.copy_from_slice(&self.velocity),
            UpdateRule::Adam {
                iteration_count, ..
            } => *iteration_count += 1,
            _ => {}
        }
        self.iteration = (self.iteration + 1) % self.required_iterations_for_step;
        self.finished = 0 == self.iteration;
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn required_iterations_for_step(&self) -> usize {
        self.required_iterations_for_step
    }

    pub fn velocity(&self) -> &[f64] {
        &self.velocity
    }

    fn calculate_velocity(&mut self, settings: &Settings, gradients: &[f64]) {
        match &mut self.rule {
            UpdateRule::Plain => {
                for (velocity, &gradient) in self.velocity.iter_mut().zip(gradients) {
                    *velocity = -gradient * settings.learning_rate;
                }
            }
            UpdateRule::Momentum { previous_velocity } => {
                for index in 0..self.velocity.len() {
                    self.velocity[index] = previous_velocity[index] * settings.gamma
                        - gradients[index] * settings.learning_rate;
                }
            }
            UpdateRule::Nesterov {
                previous_velocity,
                velocity_at_start,
            } => {
                // The first pass of a step extrapolates from the velocity the
                // step started with; the second from the updated one.
                let source = if 0 == self.iteration {
                    velocity_at_start
                } else {
                    previous_velocity
                };
                for index in 0..self.velocity.len() {
                    self.velocity[index] = source[index] * settings.gamma
                        - gradients[index] * settings.learning_rate;
                }
            }
            UpdateRule::Adam {
                moment,
                second_moment,
                iteration_count,
            } => {
                let t = *iteration_count as i32;
                for index in 0..self.velocity.len() {
                    moment[index] =
                        settings.beta * moment[index] + (1.0 - settings.beta) * gradients[index];
                    second_moment[index] = settings.beta_2 * second_moment[index]
                        + (1.0 - settings.beta_2) * gradients[index].powi(2);
                    let corrected_moment = moment[index] / (1.0 - settings.beta.powi(t));
                    let corrected_second = second_moment[index] / (1.0 - settings.beta_2.powi(t));
                    self.velocity[index] = -settings.learning_rate * corrected_moment
                        / (corrected_second.sqrt() + settings.epsilon);
                }
            }
            UpdateRule::AmsGrad {
                moment,
                second_moment_max,
            } => {
                for index in 0..self.velocity.len() {
                    moment[index] =
                        settings.beta * moment[index] + (1.0 - settings.beta) * gradients[index];
                    let raw_moment = settings.beta_2 * second_moment_max[index]
                        + (1.0 - settings.beta_2) * gradients[index].powi(2);
                    if raw_moment > second_moment_max[index] {
                        second_moment_max[index] = raw_moment;
                    }
                    self.velocity[index] = -settings.learning_rate * moment[index]
                        / (second_moment_max[index].sqrt() + settings.epsilon);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{NetworkBuilder, TransferKind};

    fn network() -> Network {
        NetworkBuilder::new()
            .input_size(2)
            .dense_layers(&[2, 1])
            .transfer_functions_by_layer(&[TransferKind::Selu, TransferKind::Identity])
            .seed(21)
            .build()
            .unwrap()
    }

    #[test]
    fn zero_gradient_leaves_weights_unchanged() {
        let settings = Settings::default();
        for kind in [
            UpdaterKind::Plain,
            UpdaterKind::Momentum,
            UpdaterKind::Nesterov,
            UpdaterKind::Adam,
            UpdaterKind::AmsGrad,
        ] {
            let mut network = network();
            let before = network.weight_table.clone();
            let mut updater = WeightUpdater::new(kind, before.len());
            let zero = vec![0.0; before.len()];
            updater.start();
            while !updater.is_finished() {
                updater.iterate(&settings, &mut network, &zero);
            }
            assert_eq!(before, network.weight_table, "{kind:?} moved weights");
        }
    }

    #[test]
    fn nesterov_needs_two_iterations_per_step() {
        let settings = Settings::default();
        let mut network = network();
        let weight_count = network.weight_table.len();
        let mut updater = WeightUpdater::new(UpdaterKind::Nesterov, weight_count);
        assert_eq!(2, updater.required_iterations_for_step());
        let gradient = vec![0.5; weight_count];
        updater.start();
        updater.iterate(&settings, &mut network, &gradient);
        assert!(!updater.is_finished());
        updater.iterate(&settings, &mut network, &gradient);
        assert!(updater.is_finished());
    }

    #[test]
    fn every_variant_descends_a_constant_gradient() {
        let settings = Settings::default();
        for kind in [
            UpdaterKind::Plain,
            UpdaterKind::Momentum,
            UpdaterKind::Nesterov,
            UpdaterKind::Adam,
            UpdaterKind::AmsGrad,
        ] {
            let mut network = network();
            let weight_count = network.weight_table.len();
            let before = network.weight_table.clone();
            let gradient = vec![1.0; weight_count];
            let mut updater = WeightUpdater::new(kind, weight_count);
            updater.start();
            while !updater.is_finished() {
                updater.iterate(&settings, &mut network, &gradient);
            }
            for (after, before) in network.weight_table.iter().zip(&before) {
                assert!(after < before, "{kind:?} did not descend");
            }
        }
    }
}
