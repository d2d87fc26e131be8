use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing::{debug, trace};

use crate::data::{DataSet, SequenceData};
use crate::errors::{LatResult, LatticaError};
use crate::objective::{CostFunction, CostKind};
use crate::qlearn::environment::QEnvironment;
use crate::settings::Settings;
use crate::utils::ThreadGroup;

/// One action slot is the q value followed by the action vector.
pub fn action_slot_size(action_size: usize) -> usize {
    action_size + 1
}

/// Length of one entry's action table.
pub fn action_table_size(action_size: usize, action_count: usize) -> usize {
    action_slot_size(action_size) * action_count
}

/// Ranked action memory keyed by state. Every entry keeps `action_count`
/// action slots sorted by q value descending (slot 0 is the best action) and
/// an average-q summary used for eviction once `max_set_size` is exceeded.
pub struct QSet {
    settings: Settings,
    state_size: usize,
    action_size: usize,
    action_count: usize,
    overwrite_q_threshold: f64,
    max_set_size: usize,
    states: Vec<Vec<f64>>,
    actions: Vec<Vec<f64>>,
    avg_q_values: Vec<f64>,
    cost: CostFunction,
    lookup_threads: ThreadGroup,
}

impl QSet {
    pub fn new(
        settings: &Settings,
        state_size: usize,
        action_size: usize,
        action_count: usize,
        max_set_size: usize,
        overwrite_q_threshold: f64,
    ) -> Self {
        Self {
            settings: settings.clone(),
            state_size,
            action_size,
            action_count: action_count.max(1),
            overwrite_q_threshold,
            max_set_size,
            states: Vec::new(),
            actions: Vec::new(),
            avg_q_values: Vec::new(),
            cost: CostFunction::new(CostKind::MeanSquaredError),
            lookup_threads: ThreadGroup::new(settings.max_solve_threads),
        }
    }

    /// Rebuild another set with fewer action slots per entry, keeping the
    /// best-ranked slots.
    pub fn from_other(other: &QSet, action_count: usize) -> Self {
        let action_count = action_count.clamp(1, other.action_count);
        let table_size = action_table_size(other.action_size, action_count);
        Self {
            settings: other.settings.clone(),
            state_size: other.state_size,
            action_size: other.action_size,
            action_count,
            overwrite_q_threshold: other.overwrite_q_threshold,
            max_set_size: other.max_set_size,
            states: other.states.clone(),
            actions: other
                .actions
                .iter()
                .map(|table| table[..table_size].to_vec())
                .collect(),
            avg_q_values: other.avg_q_values.clone(),
            cost: other.cost,
            lookup_threads: ThreadGroup::new(other.settings.max_solve_threads),
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_set_size
    }

    pub fn action_count(&self) -> usize {
        self.action_count
    }

    pub fn state_of(&self, index: usize) -> &[f64] {
        &self.states[index]
    }

    pub fn q_value_of(&self, index: usize, action_index: usize) -> f64 {
        self.actions[index][action_index * action_slot_size(self.action_size)]
    }

    pub fn action_of(&self, index: usize, action_index: usize) -> &[f64] {
        let start = action_index * action_slot_size(self.action_size) + 1;
        &self.actions[index][start..start + self.action_size]
    }

    pub fn avg_q_value_of(&self, index: usize) -> f64 {
        self.avg_q_values[index]
    }

    pub fn max_q_value_of(&self, index: usize) -> f64 {
        (0..self.action_count)
            .map(|action_index| self.q_value_of(index, action_index))
            .fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn min_q_value_of(&self, index: usize) -> f64 {
        (0..self.action_count)
            .map(|action_index| self.q_value_of(index, action_index))
            .fold(f64::INFINITY, f64::min)
    }

    /// Linear parallel scan for a state within `settings.delta` tolerance.
    /// The first match wins; the result slot is guarded so concurrent
    /// matches cannot disagree.
    pub fn look_up(&self, state: &[f64]) -> Option<usize> {
        debug_assert_eq!(state.len(), self.state_size);
        let item_count = self.len();
        if 0 == item_count {
            return None;
        }
        let items_per_thread = 1 + item_count / self.lookup_threads.thread_count();
        let found = AtomicBool::new(false);
        let result: Mutex<Option<usize>> = Mutex::new(None);
        self.lookup_threads.start_and_block(&|thread_index| {
            let start = (thread_index * items_per_thread).min(item_count);
            let end = (start + items_per_thread).min(item_count);
            for item_index in start..end {
                if found.load(Ordering::SeqCst) {
                    break;
                }
                if self.cost.feature_error(state, &self.states[item_index], self.state_size)
                    <= self.settings.delta
                {
                    let mut slot = result.lock().unwrap_or_else(|e| e.into_inner());
                    if slot.is_none() {
                        *slot = Some(item_index);
                        found.store(true, Ordering::SeqCst);
                    }
                    break;
                }
            }
        });
        result.into_inner().unwrap_or_else(|e| e.into_inner())
    }

    /// Fold a batch of single-action experiences into the set: temporal
    /// difference targets, action-slot updates with re-sorting, threshold
    /// overwrites, and new entries; finally the size cap is enforced.
    pub fn incorporate(
        &mut self,
        states: &[Vec<f64>],
        actions: &[Vec<f64>],
        environment: &dyn QEnvironment,
    ) -> LatResult<()> {
        if states.len() != actions.len() {
            return Err(LatticaError::ShapeMismatch {
                context: "experience batch",
                expected: states.len(),
                found: actions.len(),
            });
        }
        debug!(batch = states.len(), set = self.len(), "incorporating experiences");
        for (state, action_slot) in states.iter().zip(actions) {
            if state.len() != self.state_size {
                return Err(LatticaError::ShapeMismatch {
                    context: "experience state",
                    expected: self.state_size,
                    found: state.len(),
                });
            }
            if action_slot.len() != action_slot_size(self.action_size) {
                return Err(LatticaError::ShapeMismatch {
                    context: "experience action slot",
                    expected: action_slot_size(self.action_size),
                    found: action_slot.len(),
                });
            }
            let q_raw = action_slot[0];
            let action = &action_slot[1..];
            let new_action_q_value =
                q_raw + self.td_value(q_raw, state, action, q_raw, environment);
            match self.look_up(state) {
                Some(match_index) => {
                    self.incorporate_into_entry(
                        match_index,
                        state,
                        action,
                        q_raw,
                        new_action_q_value,
                        environment,
                    );
                    self.avg_q_values[match_index] = self.recompute_avg_q(match_index);
                }
                None => {
                    // A new state's single action is its best by definition;
                    // negative q values start from the worst slot instead.
                    let target_slot = if 0.0 <= new_action_q_value {
                        0
                    } else {
                        self.action_count - 1
                    };
                    self.states.push(state.clone());
                    self.actions
                        .push(vec![0.0; action_table_size(self.action_size, self.action_count)]);
                    let table = self.actions.last_mut().expect("just pushed");
                    let slot_start = target_slot * action_slot_size(self.action_size);
                    table[slot_start] = new_action_q_value;
                    table[slot_start + 1..slot_start + 1 + self.action_size]
                        .copy_from_slice(action);
                    self.avg_q_values.push(new_action_q_value);
                }
            }
        }
        self.keep_best(self.max_set_size);
        Ok(())
    }

    /// Evict entries until at most `count` remain.
    pub fn keep_best(&mut self, count: usize) {
        if count < self.len() {
            self.erase_worst(self.len() - count);
        }
    }

    /// Remove the `count` entries with the lowest average q value.
    pub fn erase_worst(&mut self, count: usize) {
        let count = count.min(self.len());
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.sort_by(|&a, &b| {
            self.avg_q_values[a]
                .partial_cmp(&self.avg_q_values[b])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let mut to_erase: Vec<usize> = order.into_iter().take(count).collect();
        to_erase.sort_unstable_by(|a, b| b.cmp(a));
        for index in to_erase {
            self.states.remove(index);
            self.actions.remove(index);
            self.avg_q_values.remove(index);
        }
    }

    /// Chain states through their stored best actions and emit fixed-length
    /// sub-sequences of (state, best action slot) pairs for supervised
    /// policy training.
    pub fn generate_best_sequences(
        &self,
        environment: &dyn QEnvironment,
        preferred_sequence_size: usize,
    ) -> SequenceData {
        let preferred_sequence_size = preferred_sequence_size.max(1);
        let mut included = vec![false; self.len()];
        let mut index_sequences: Vec<Vec<usize>> = Vec::new();
        for start_index in 0..self.len() {
            if included[start_index] {
                continue;
            }
            let mut chain = Vec::new();
            let mut current = start_index;
            loop {
                chain.push(current);
                included[current] = true;
                let transition =
                    environment.next_of(self.state_of(current), self.action_of(current, 0));
                if transition.terminal || chain.len() >= self.max_set_size {
                    break;
                }
                let Some(next_state) = transition.state else {
                    break;
                };
                match self.look_up(&next_state) {
                    Some(next_index) if !included[next_index] => current = next_index,
                    _ => break,
                }
            }
            index_sequences.push(chain);
        }

        let slot_size = action_slot_size(self.action_size);
        let mut result =
            SequenceData::new(self.state_size, slot_size, preferred_sequence_size);
        for chain in &index_sequences {
            if chain.len() < preferred_sequence_size {
                continue;
            }
            let mut window_start = 0usize;
            while window_start < chain.len() {
                // The final window is right-aligned so no chain tail is lost.
                let actual_start = window_start
                    - (preferred_sequence_size
                        - preferred_sequence_size.min(chain.len() - window_start));
                let mut inputs = Vec::with_capacity(preferred_sequence_size);
                let mut labels = Vec::with_capacity(preferred_sequence_size);
                for &item_index in &chain[actual_start..actual_start + preferred_sequence_size] {
                    inputs.push(self.state_of(item_index).to_vec());
                    labels.push(self.actions[item_index][..slot_size].to_vec());
                }
                let _ = result.push_sequence(&inputs, &labels);
                window_start += preferred_sequence_size;
            }
        }
        trace!(
            chains = index_sequences.len(),
            sequences = result.number_of_sequences(),
            "best sequences generated"
        );
        result
    }

    /// Snapshot as a supervised training set: states as inputs, full ranked
    /// action tables as labels.
    pub fn training_snapshot(&self) -> SequenceData {
        let mut data = SequenceData::new(
            self.state_size,
            action_table_size(self.action_size, self.action_count),
            1,
        );
        for (state, table) in self.states.iter().zip(&self.actions) {
            let _ = data.push_sequence(&[state.clone()], &[table.clone()]);
        }
        data
    }

    fn incorporate_into_entry(
        &mut self,
        match_index: usize,
        state: &[f64],
        action: &[f64],
        q_raw: f64,
        new_action_q_value: f64,
        environment: &dyn QEnvironment,
    ) {
        // Look for a stored action close enough to count as the same one.
        let matching_action = (0..self.action_count).find(|&action_index| {
            self.cost.feature_error(
                self.action_of(match_index, action_index),
                action,
                self.action_size,
            ) <= self.settings.delta_2
        });
        if let Some(mut action_index) = matching_action {
            let stored_q = self.q_value_of(match_index, action_index);
            let updated_q =
                stored_q + self.td_value(q_raw, state, action, stored_q, environment);
            self.set_q_value(match_index, action_index, updated_q);
            // The new q value may have broken the ordering on either side;
            // bubble the slot until descending order is restored.
            while action_index < self.action_count - 1
                && self.q_value_of(match_index, action_index + 1) > updated_q
            {
                self.swap_actions(match_index, action_index, action_index + 1);
                action_index += 1;
            }
            while action_index > 0 && self.q_value_of(match_index, action_index - 1) < updated_q {
                self.swap_actions(match_index, action_index, action_index - 1);
                action_index -= 1;
            }
            return;
        }

        let min_q = self.min_q_value_of(match_index);
        // Sign-aware comparison: the percentage margin tightens toward the
        // minimum from above for positive values and from below otherwise.
        let overwrites = (0.0 <= new_action_q_value
            && new_action_q_value > min_q * (1.0 + self.overwrite_q_threshold))
            || (0.0 > new_action_q_value
                && new_action_q_value > min_q * (1.0 - self.overwrite_q_threshold));
        if !overwrites {
            return;
        }
        // Find the insertion slot scanning from the worst action upward.
        let mut action_index = self.action_count;
        loop {
            action_index -= 1;
            if 1 == self.action_count {
                break;
            }
            if new_action_q_value < self.q_value_of(match_index, action_index) {
                action_index += 1;
                break;
            }
            if 0 == action_index {
                break;
            }
        }
        // Shift worse slots down, dropping the worst.
        let mut shift_index = self.action_count;
        loop {
            if 1 == self.action_count {
                break;
            }
            shift_index -= 1;
            if shift_index <= action_index {
                break;
            }
            self.copy_action(match_index, shift_index - 1, shift_index);
        }
        self.write_action(match_index, action_index, new_action_q_value, action);
    }

    /// Temporal difference target: the raw reward plus discounted best q
    /// values along the deterministic lookahead chain, scaled against the
    /// stored value by the learning rate.
    fn td_value(
        &self,
        q_raw: f64,
        state: &[f64],
        action: &[f64],
        old_q_value: f64,
        environment: &dyn QEnvironment,
    ) -> f64 {
        let mut temporal_difference = q_raw;
        if 0 < self.settings.look_ahead_count {
            let mut lambda = self.settings.gamma;
            let mut current_state: Vec<f64> = state.to_vec();
            let mut current_action: Vec<f64> = action.to_vec();
            for _ in 0..self.settings.look_ahead_count {
                let transition = environment.next_of(&current_state, &current_action);
                let Some(next_state) = transition.state else {
                    break;
                };
                let Some(next_index) = self.look_up(&next_state) else {
                    break;
                };
                temporal_difference += lambda * self.max_q_value_of(next_index);
                lambda = lambda * lambda;
                current_state = self.state_of(next_index).to_vec();
                current_action = self.action_of(next_index, 0).to_vec();
                if transition.terminal {
                    break;
                }
            }
        }
        (temporal_difference - old_q_value) * self.settings.learning_rate
    }

    /// Average of the populated, positive-q slots over the full slot count;
    /// entries holding only negative values keep their plain sum.
    fn recompute_avg_q(&self, index: usize) -> f64 {
        let mut sum = 0.0;
        let mut populated = 0usize;
        for action_index in 0..self.action_count {
            let action = self.action_of(index, action_index);
            let q_value = self.q_value_of(index, action_index);
            if action.iter().any(|&value| 0.0 != value) && 0.0 < q_value {
                sum += q_value;
                populated += 1;
            }
        }
        if 0 < populated {
            sum / self.action_count as f64
        } else {
            sum
        }
    }

    fn set_q_value(&mut self, index: usize, action_index: usize, value: f64) {
        self.actions[index][action_index * action_slot_size(self.action_size)] = value;
    }

    fn swap_actions(&mut self, index: usize, a: usize, b: usize) {
        let slot = action_slot_size(self.action_size);
        for offset in 0..slot {
            self.actions[index].swap(a * slot + offset, b * slot + offset);
        }
    }

    fn copy_action(&mut self, index: usize, source: usize, target: usize) {
        if source == target {
            return;
        }
        let slot = action_slot_size(self.action_size);
        let copied: Vec<f64> =
            self.actions[index][source * slot..(source + 1) * slot].to_vec();
        self.actions[index][target * slot..(target + 1) * slot].copy_from_slice(&copied);
    }

    fn write_action(&mut self, index: usize, action_index: usize, q_value: f64, action: &[f64]) {
        let slot = action_slot_size(self.action_size);
        let start = action_index * slot;
        self.actions[index][start] = q_value;
        self.actions[index][start + 1..start + 1 + self.action_size].copy_from_slice(action);
    }
}

impl DataSet for QSet {
    fn input_size(&self) -> usize {
        self.state_size
    }

    fn feature_size(&self) -> usize {
        action_table_size(self.action_size, self.action_count)
    }

    fn number_of_sequences(&self) -> usize {
        self.states.len()
    }

    fn sequence_size(&self) -> usize {
        1
    }

    fn prefill_inputs_number(&self) -> usize {
        0
    }

    fn input_sample(&self, raw_index: usize) -> &[f64] {
        &self.states[raw_index]
    }

    fn label_sample(&self, raw_index: usize) -> &[f64] {
        &self.actions[raw_index]
    }
}
