use lattica::qlearn::{EnvProperties, QEnvironment, QSet, StateTransition};
use lattica::Settings;

/// A terminal-only environment: every action ends the episode, so
/// incorporation exercises the set logic without lookahead interference.
struct DeadEndEnvironment {
    state_size: usize,
    action_size: usize,
}

impl QEnvironment for DeadEndEnvironment {
    fn state_size(&self) -> usize {
        self.state_size
    }

    fn action_size(&self) -> usize {
        self.action_size
    }

    fn reset(&mut self) {}

    fn current_state(&self) -> Option<Vec<f64>> {
        None
    }

    fn next(&mut self, _action: &[f64]) -> StateTransition {
        StateTransition::terminal_with(0.0)
    }

    fn next_of(&self, _state: &[f64], _action: &[f64]) -> StateTransition {
        StateTransition::terminal_with(0.0)
    }
}

/// A deterministic chain over scalar states: action value steps the state,
/// rewarding proximity to the goal state.
struct ChainEnvironment {
    position: f64,
    goal: f64,
}

impl QEnvironment for ChainEnvironment {
    fn state_size(&self) -> usize {
        1
    }

    fn action_size(&self) -> usize {
        1
    }

    fn action_properties(&self) -> EnvProperties {
        EnvProperties {
            mean: 0.0,
            standard_deviation: 1.0,
        }
    }

    fn reset(&mut self) {
        self.position = 0.0;
    }

    fn current_state(&self) -> Option<Vec<f64>> {
        Some(vec![self.position])
    }

    fn next(&mut self, action: &[f64]) -> StateTransition {
        let transition = self.next_of(&[self.position], action);
        if let Some(state) = &transition.state {
            self.position = state[0];
        }
        transition
    }

    fn next_of(&self, state: &[f64], action: &[f64]) -> StateTransition {
        let next_position = (state[0] + action[0].round()).clamp(0.0, self.goal);
        StateTransition {
            state: Some(vec![next_position]),
            q_value: self.goal - (self.goal - next_position).abs(),
            terminal: next_position >= self.goal,
        }
    }
}

fn settings() -> Settings {
    Settings::default()
        .with_delta(0.01)
        .with_delta_2(0.01)
        .with_learning_rate(0.5)
        .with_look_ahead_count(0)
}

fn slot(q_value: f64, action: f64) -> Vec<f64> {
    vec![q_value, action]
}

#[test]
fn overwrite_threshold_reorders_without_growing_the_entry() {
    let environment = DeadEndEnvironment {
        state_size: 1,
        action_size: 1,
    };
    let settings = settings();
    let mut set = QSet::new(&settings, 1, 1, 4, 4, 0.1);
    let states = vec![vec![1.0]; 4];
    let actions = vec![slot(9.0, 1.0), slot(8.0, 2.0), slot(7.0, 3.0), slot(6.0, 4.0)];
    set.incorporate(&states, &actions, &environment).unwrap();
    assert_eq!(1, set.len());
    for (action_index, expected_action) in [1.0, 2.0, 3.0, 4.0].iter().enumerate() {
        assert_eq!(&[*expected_action], set.action_of(0, action_index));
    }

    set.incorporate(&[vec![1.0]], &[slot(15.0, 4.0)], &environment)
        .unwrap();
    assert_eq!(1, set.len(), "overwrite must not grow the entry count");
    assert_eq!(&[4.0], set.action_of(0, 0), "the strong action moves first");
}

#[test]
fn action_slots_stay_sorted_by_q_value() {
    let environment = DeadEndEnvironment {
        state_size: 2,
        action_size: 1,
    };
    let settings = settings();
    let mut set = QSet::new(&settings, 2, 1, 3, 8, 0.0);
    let experiences = [
        (vec![0.0, 0.0], slot(1.0, 1.0)),
        (vec![0.0, 0.0], slot(5.0, 2.0)),
        (vec![0.0, 0.0], slot(3.0, 3.0)),
        (vec![1.0, 1.0], slot(-2.0, 1.0)),
        (vec![0.0, 0.0], slot(9.0, 2.0)),
        (vec![1.0, 1.0], slot(4.0, 5.0)),
    ];
    for (state, action) in experiences {
        set.incorporate(&[state], &[action], &environment).unwrap();
        for entry in 0..set.len() {
            for action_index in 1..set.action_count() {
                assert!(
                    set.q_value_of(entry, action_index - 1)
                        >= set.q_value_of(entry, action_index),
                    "entry {entry} lost its ordering"
                );
            }
        }
    }
}

#[test]
fn the_set_never_exceeds_its_size_cap() {
    let environment = DeadEndEnvironment {
        state_size: 1,
        action_size: 1,
    };
    let settings = settings();
    let mut set = QSet::new(&settings, 1, 1, 2, 3, 0.1);
    for state_value in 0..10 {
        set.incorporate(
            &[vec![state_value as f64 * 10.0]],
            &[slot(state_value as f64, 1.0)],
            &environment,
        )
        .unwrap();
        assert!(set.len() <= 3);
    }
    assert_eq!(3, set.len());
}

#[test]
fn eviction_keeps_the_higher_average_entries() {
    let environment = DeadEndEnvironment {
        state_size: 1,
        action_size: 1,
    };
    let settings = settings();
    let mut set = QSet::new(&settings, 1, 1, 1, 16, 0.1);
    for state_value in 0..8 {
        set.incorporate(
            &[vec![state_value as f64 * 10.0]],
            &[slot(state_value as f64, 1.0)],
            &environment,
        )
        .unwrap();
    }
    let mut survivors_before: Vec<f64> = (0..set.len()).map(|i| set.avg_q_value_of(i)).collect();
    survivors_before.sort_by(|a, b| b.partial_cmp(a).unwrap());
    set.erase_worst(3);
    assert_eq!(5, set.len());
    let min_surviving = (0..set.len())
        .map(|i| set.avg_q_value_of(i))
        .fold(f64::INFINITY, f64::min);
    assert!(
        min_surviving >= survivors_before[4],
        "an evicted entry outranked a survivor"
    );
}

#[test]
fn negative_q_values_only_enter_as_new_states() {
    let environment = DeadEndEnvironment {
        state_size: 1,
        action_size: 1,
    };
    let settings = settings();
    let mut set = QSet::new(&settings, 1, 1, 3, 8, 0.1);
    set.incorporate(&[vec![5.0]], &[slot(-4.0, 2.0)], &environment)
        .unwrap();
    assert_eq!(1, set.len());
    // A lone negative action starts from the worst slot.
    assert_eq!(-4.0, set.q_value_of(0, set.action_count() - 1));
    assert_eq!(&[2.0], set.action_of(0, set.action_count() - 1));
}

#[test]
fn lookup_tolerates_states_within_delta() {
    let environment = DeadEndEnvironment {
        state_size: 2,
        action_size: 1,
    };
    let settings = settings().with_delta(0.05);
    let mut set = QSet::new(&settings, 2, 1, 2, 8, 0.1);
    set.incorporate(&[vec![1.0, 2.0]], &[slot(3.0, 1.0)], &environment)
        .unwrap();
    assert!(set.look_up(&[1.0, 2.0]).is_some());
    assert!(set.look_up(&[1.01, 2.01]).is_some());
    assert!(set.look_up(&[4.0, 4.0]).is_none());
}

#[test]
fn best_sequences_chain_states_through_stored_actions() {
    let environment = ChainEnvironment {
        position: 0.0,
        goal: 4.0,
    };
    let settings = settings();
    let mut set = QSet::new(&settings, 1, 1, 2, 16, 0.1);
    // States 0..4, each with a "step forward" action as its best.
    for position in 0..4 {
        set.incorporate(
            &[vec![position as f64]],
            &[slot(4.0 - position as f64, 1.0)],
            &environment,
        )
        .unwrap();
    }
    let generated = set.generate_best_sequences(&environment, 2);
    assert!(generated.number_of_sequences() > 0);
    use lattica::DataSet;
    assert_eq!(1, generated.input_size());
    assert_eq!(2, generated.feature_size()); // q value + action
    assert_eq!(2, generated.sequence_size());
}
