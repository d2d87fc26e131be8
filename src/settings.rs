use serde::{Deserialize, Serialize};

/// Training strategy bits for [`Settings::training_strategy`].
pub mod training_strategy {
    /// Stop once the measured training error reaches exactly zero.
    pub const STOP_IF_TRAINING_ERROR_ZERO: u32 = 1 << 0;
    /// Stop once training error exceeds testing error by more than the
    /// configured delta (overfitting guard).
    pub const EARLY_STOPPING: u32 = 1 << 1;
}

/// Every tunable the engine recognizes. Components take this by reference;
/// nothing in the crate owns process-global configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Settings {
    /// Scales the gradient in every weight updater.
    pub learning_rate: f64,
    /// Momentum / Nesterov decay and the Q-learning lookahead discount.
    pub gamma: f64,
    /// First moment decay for Adam / AMSGrad.
    pub beta: f64,
    /// Second moment decay for Adam / AMSGrad.
    pub beta_2: f64,
    /// Numerical stability term for Adam / AMSGrad denominators.
    pub epsilon: f64,
    /// Finite-difference probe stability term.
    pub sqrt_epsilon: f64,
    /// Approximation probe scale.
    pub step_size: f64,
    /// Dampening applied when an approximation probe worsens in both directions.
    pub zetta: f64,
    /// Sequences evaluated per stochastic step.
    pub minibatch_size: usize,
    /// Number of timesteps with derivative contributions.
    pub memory_truncation: usize,
    /// Inner thread budget: partials within a row, neurons within a partial.
    pub max_solve_threads: usize,
    /// Outer thread budget: sequences and weight chunks.
    pub max_processing_threads: usize,
    /// Memory budget for one collected subset of the neuron router.
    pub device_max_megabytes: f64,
    /// Per-neuron zeroing probability of the dropout feature.
    pub dropout_probability: f64,
    /// State-match tolerance of the q-set and early-stopping margin.
    pub delta: f64,
    /// Action-match tolerance of the q-set.
    pub delta_2: f64,
    /// Temporal-difference lookahead depth.
    pub look_ahead_count: usize,
    /// Bitset of [`training_strategy`] flags.
    pub training_strategy: u32,
    /// Cadence of target-network sync and periodic error refresh.
    pub training_relevant_loop_count: usize,
    /// Full re-evaluation cadence in the context.
    pub tolerance_loop_value: usize,
    /// Post-fragment apply reset threshold.
    pub insignificant_changes: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            learning_rate: 1e-2,
            gamma: 0.9,
            beta: 0.9,
            beta_2: 0.99,
            epsilon: 1e-15,
            sqrt_epsilon: 1e-7,
            step_size: 1e-2,
            zetta: 0.3,
            minibatch_size: 64,
            memory_truncation: 2,
            max_solve_threads: 2,
            max_processing_threads: 4,
            device_max_megabytes: 512.0,
            dropout_probability: 0.2,
            delta: 0.1,
            delta_2: 0.05,
            look_ahead_count: 3,
            training_strategy: 0,
            training_relevant_loop_count: 10,
            tolerance_loop_value: 100,
            insignificant_changes: 1e-6,
        }
    }
}

impl Settings {
    pub fn has_training_strategy(&self, flag: u32) -> bool {
        0 != (self.training_strategy & flag)
    }

    pub fn with_learning_rate(mut self, value: f64) -> Self {
        self.learning_rate = value;
        self
    }

    pub fn with_gamma(mut self, value: f64) -> Self {
        self.gamma = value;
        self
    }

    pub fn with_beta(mut self, value: f64) -> Self {
        self.beta = value;
        self
    }

    pub fn with_beta_2(mut self, value: f64) -> Self {
        self.beta_2 = value;
        self
    }

    pub fn with_epsilon(mut self, value: f64) -> Self {
        self.epsilon = value;
        self
    }

    pub fn with_step_size(mut self, value: f64) -> Self {
        self.step_size = value;
        self
    }

    pub fn with_minibatch_size(mut self, value: usize) -> Self {
        self.minibatch_size = value;
        self
    }

    pub fn with_memory_truncation(mut self, value: usize) -> Self {
        self.memory_truncation = value;
        self
    }

    pub fn with_max_solve_threads(mut self, value: usize) -> Self {
        self.max_solve_threads = value.max(1);
        self
    }

    pub fn with_max_processing_threads(mut self, value: usize) -> Self {
        self.max_processing_threads = value.max(1);
        self
    }

    pub fn with_device_max_megabytes(mut self, value: f64) -> Self {
        self.device_max_megabytes = value;
        self
    }

    pub fn with_dropout_probability(mut self, value: f64) -> Self {
        self.dropout_probability = value;
        self
    }

    pub fn with_delta(mut self, value: f64) -> Self {
        self.delta = value;
        self
    }

    pub fn with_delta_2(mut self, value: f64) -> Self {
        self.delta_2 = value;
        self
    }

    pub fn with_look_ahead_count(mut self, value: usize) -> Self {
        self.look_ahead_count = value;
        self
    }

    pub fn with_training_strategy(mut self, flags: u32) -> Self {
        self.training_strategy = flags;
        self
    }

    pub fn with_training_relevant_loop_count(mut self, value: usize) -> Self {
        self.training_relevant_loop_count = value.max(1);
        self
    }
}
