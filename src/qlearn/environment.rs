/// Distribution properties of one vector space of the environment.
#[derive(Clone, Copy, Debug)]
pub struct EnvProperties {
    pub mean: f64,
    pub standard_deviation: f64,
}

impl Default for EnvProperties {
    fn default() -> Self {
        Self {
            mean: 0.0,
            standard_deviation: 1.0,
        }
    }
}

/// Outcome of taking one action: the following state (absent past the edge
/// of the state space), the immediate q value, and whether the episode ends.
#[derive(Clone, Debug)]
pub struct StateTransition {
    pub state: Option<Vec<f64>>,
    pub q_value: f64,
    pub terminal: bool,
}

impl StateTransition {
    pub fn terminal_with(q_value: f64) -> Self {
        Self {
            state: None,
            q_value,
            terminal: true,
        }
    }
}

/// The reinforcement collaborator the q-trainer explores. The pure
/// [`next_of`](Self::next_of) variant backs temporal-difference lookahead
/// without disturbing the walked episode.
pub trait QEnvironment {
    fn state_size(&self) -> usize;
    fn action_size(&self) -> usize;

    fn state_properties(&self) -> EnvProperties {
        EnvProperties::default()
    }

    fn action_properties(&self) -> EnvProperties {
        EnvProperties::default()
    }

    fn reset(&mut self);
    fn current_state(&self) -> Option<Vec<f64>>;

    /// Take the action from the current internal state.
    fn next(&mut self, action: &[f64]) -> StateTransition;

    /// Deterministic transition from an explicit state, leaving the
    /// environment untouched.
    fn next_of(&self, state: &[f64], action: &[f64]) -> StateTransition;
}
