use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use tracing::debug;

use crate::errors::{LatResult, LatticaError};
use crate::net::synapse::{is_external, SynapseIterator};
use crate::net::Network;

/// Builds dependency-respecting subsets of solvable neurons from the sparse
/// graph, one subset at a time, bounded by a device memory budget.
///
/// Per-neuron progress lives in one atomic counter with the ordering
/// `inputs_done(0..=n) < reserved(n+1) < processed(n+2) < deferred(n+2+iter)`;
/// the helpers below encapsulate the compare-exchange transitions.
pub struct NeuronRouter<'a> {
    network: &'a Network,
    neuron_states: Vec<AtomicU32>,
    number_of_inputs: Vec<u32>,
    output_layer_start: usize,
    output_layer_iterator: AtomicUsize,
    iteration: AtomicU32,
    subset: Mutex<VecDeque<usize>>,
    subset_size_bytes: AtomicU64,
    collection_running: AtomicBool,
}

impl<'a> NeuronRouter<'a> {
    pub fn new(network: &'a Network) -> Self {
        let number_of_inputs: Vec<u32> = network
            .neurons
            .iter()
            .map(|neuron| neuron.input_count() as u32)
            .collect();
        let output_layer_start = network.neuron_count() - network.output_neuron_number;
        Self {
            network,
            neuron_states: (0..network.neuron_count())
                .map(|_| AtomicU32::new(0))
                .collect(),
            number_of_inputs,
            output_layer_start,
            output_layer_iterator: AtomicUsize::new(output_layer_start),
            // Has to start at 1, otherwise deferred values mix with processed.
            iteration: AtomicU32::new(1),
            subset: Mutex::new(VecDeque::new()),
            subset_size_bytes: AtomicU64::new(0f64.to_bits()),
            collection_running: AtomicBool::new(false),
        }
    }

    /// Collect the next subset of solvable neurons. In strict mode subset
    /// members depend only on already processed neurons, making them mutually
    /// independent, and the subset is kept sorted.
    pub fn collect_subset(&self, max_solve_threads: usize, device_max_megabytes: f64, strict: bool) {
        self.collection_running.store(true, Ordering::SeqCst);
        // The budget bounds one subset; confirmed neurons of earlier
        // collections no longer occupy it.
        let leftover: f64 = self
            .lock_subset()
            .iter()
            .map(|&neuron| self.network.estimated_neuron_bytes(neuron) as f64)
            .sum();
        self.subset_size_bytes.store(leftover.to_bits(), Ordering::SeqCst);
        let threads = max_solve_threads.max(1);
        std::thread::scope(|scope| {
            for thread_index in 0..threads {
                scope.spawn(move || {
                    self.collect_subset_thread(threads, device_max_megabytes, thread_index, strict)
                });
            }
        });
        if strict {
            let mut subset = self.lock_subset();
            subset.make_contiguous().sort_unstable();
        }
        self.collection_running.store(false, Ordering::SeqCst);
        let iteration = self.iteration.fetch_add(1, Ordering::SeqCst);
        debug!(
            iteration,
            subset_size = self.lock_subset().len(),
            "neuron subset collected"
        );
    }

    pub fn finished(&self) -> bool {
        (0..self.network.neuron_count()).all(|index| self.is_processed(index))
    }

    pub fn unprocessed_count(&self) -> usize {
        (0..self.network.neuron_count())
            .filter(|&index| !self.is_processed(index))
            .count()
    }

    pub fn subset(&self) -> Vec<usize> {
        self.lock_subset().iter().copied().collect()
    }

    pub fn subset_size(&self) -> usize {
        self.lock_subset().len()
    }

    pub fn first_in_subset(&self) -> Option<usize> {
        self.lock_subset().front().copied()
    }

    /// Mark the first subset element processed and remove it, if it is the
    /// expected index.
    pub fn pop_front_if(&self, neuron_index: usize) -> bool {
        let mut subset = self.lock_subset();
        if subset.front() == Some(&neuron_index) {
            subset.pop_front();
            self.neuron_states[neuron_index]
                .store(self.processed_value(neuron_index), Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    /// Remove a neuron and every transitive dependent of it from the current
    /// subset, resetting their progress.
    pub fn omit_from_subset(&self, neuron_index: usize) -> LatResult<()> {
        if self.collection_running.load(Ordering::SeqCst) {
            return Err(LatticaError::CollectionRunning);
        }
        let mut to_remove = Vec::new();
        let mut queue = vec![neuron_index];
        while let Some(neuron) = queue.pop() {
            for dependent in self.dependents_in_subset_of(neuron) {
                if !to_remove.contains(&dependent) {
                    to_remove.push(dependent);
                    queue.push(dependent);
                }
            }
        }
        let mut subset = self.lock_subset();
        for &neuron in &to_remove {
            self.neuron_states[neuron].store(0, Ordering::SeqCst);
            if let Some(position) = subset.iter().position(|&entry| entry == neuron) {
                subset.remove(position);
                self.add_subset_bytes(-(self.network.estimated_neuron_bytes(neuron) as f64));
            }
        }
        Ok(())
    }

    /// The neuron itself plus every subset member depending on it directly.
    pub fn dependents_in_subset_of(&self, neuron_index: usize) -> Vec<usize> {
        let subset = self.lock_subset();
        let mut result = Vec::new();
        if !subset.contains(&neuron_index) {
            return result;
        }
        result.push(neuron_index);
        for &candidate in subset.iter() {
            SynapseIterator::new(&self.network.neurons[candidate].input_indices).iterate(|index| {
                if !is_external(index) && index as usize == neuron_index && candidate != neuron_index
                {
                    result.push(candidate);
                }
            });
        }
        result
    }

    /// True when the neuron is processed, or is positioned in the subset
    /// after every unprocessed input it has.
    pub fn is_neuron_without_dependency(&self, neuron_index: usize) -> bool {
        if self.is_processed(neuron_index) {
            return true;
        }
        let subset = self.lock_subset();
        let Some(own_position) = subset.iter().position(|&entry| entry == neuron_index) else {
            return false;
        };
        let mut independent = true;
        SynapseIterator::new(&self.network.neurons[neuron_index].input_indices)
            .iterate_terminatable(|index| {
                if is_external(index) || self.is_processed(index as usize) {
                    return true;
                }
                let found_before = subset
                    .iter()
                    .take(own_position)
                    .any(|&entry| entry == index as usize);
                if !found_before {
                    independent = false;
                }
                independent
            });
        independent
    }

    fn collect_subset_thread(
        &self,
        threads: usize,
        device_max_megabytes: f64,
        thread_index: usize,
        strict: bool,
    ) {
        let neuron_count = self.network.neuron_count();
        let start = self.output_layer_iterator.load(Ordering::SeqCst)
            + ((neuron_count - 1 - self.output_layer_start) / threads) * thread_index;
        let mut visiting = vec![start];
        while visiting.last().map(|&index| index < neuron_count) == Some(true)
            && self.output_layer_iterator.load(Ordering::SeqCst) < neuron_count
            && self.subset_megabytes() < device_max_megabytes
        {
            let current = *visiting.last().expect("visiting stack never empties");
            let visiting_next = self.next_neuron_of(current, strict);
            if visiting_next == current {
                self.add_neuron_into_subset(current);
            }
            self.step(&mut visiting, visiting_next);
        }
    }

    /// Walk the inputs of the visited neuron: either every input turns out
    /// processed (the neuron itself is returned, ready for the subset), or
    /// the first unprocessed input becomes the next neuron to visit.
    fn next_neuron_of(&self, current: usize, strict: bool) -> usize {
        let iteration = self.iteration.load(Ordering::SeqCst);
        let mut visiting_next = current;
        let mut processed_inputs = 0u32;
        while self.is_subset_candidate(current, iteration)
            && processed_inputs < self.number_of_inputs[current]
            && visiting_next == current
        {
            let expected_state = self.neuron_states[current].load(Ordering::SeqCst);
            let mut synapse_start = 0usize;
            let mut input_index_start = 0u32;
            if self.is_in_progress(current) {
                // Skip synapses this neuron already walked in a previous pass.
                let already_done = expected_state.min(self.number_of_inputs[current]);
                SynapseIterator::new(&self.network.neurons[current].input_indices)
                    .skim_terminatable(|interval| {
                        if input_index_start + interval.size < already_done {
                            synapse_start += 1;
                            input_index_start += interval.size;
                            true
                        } else {
                            false
                        }
                    });
            }
            processed_inputs = input_index_start;
            SynapseIterator::new(&self.network.neurons[current].input_indices[synapse_start..])
                .iterate_with_intervals_terminatable(|interval, index| {
                    if is_external(index)
                        || 0 < interval.reach_past
                        || self.is_processed(index as usize)
                        || (!strict && self.is_reserved(index as usize))
                    {
                        // Inputs from the past count as already processed.
                        processed_inputs += 1;
                        true
                    } else if self.is_subset_candidate(index as usize, iteration) {
                        visiting_next = index as usize;
                        false
                    } else {
                        true
                    }
                });
            let new_state = if processed_inputs < self.number_of_inputs[current]
                && visiting_next == current
            {
                // Stuck on a non-candidate input; defer to the next iteration.
                self.deferred_value(current, iteration)
            } else {
                processed_inputs
            };
            // If another thread updated this neuron meanwhile, leave it be.
            let _ = self.neuron_states[current].compare_exchange(
                expected_state,
                new_state,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
        visiting_next
    }

    fn add_neuron_into_subset(&self, neuron_index: usize) {
        let solvable_state = self.number_of_inputs[neuron_index];
        let mut subset = self.lock_subset();
        if self.neuron_states[neuron_index]
            .compare_exchange(
                solvable_state,
                self.reserved_value(neuron_index),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            subset.push_back(neuron_index);
            self.add_subset_bytes(self.network.estimated_neuron_bytes(neuron_index) as f64);
        }
    }

    fn step(&self, visiting: &mut Vec<usize>, visiting_next: usize) {
        let current = *visiting.last().expect("visiting stack never empties");
        if visiting_next != current {
            visiting.push(visiting_next);
        } else if 1 < visiting.len() {
            visiting.pop();
        }
        if 1 == visiting.len() {
            let iteration = self.iteration.load(Ordering::SeqCst);
            let root = visiting[0];
            if root < self.network.neuron_count()
                && !self.is_in_progress(root)
                && !self.is_subset_candidate(root, iteration)
            {
                // Processed, reserved or deferred roots move the walk onward;
                // running out of bounds ends this thread's collection.
                visiting[0] += 1;
            }
            if root < self.network.neuron_count()
                && self.is_processed(root)
                && root == self.output_layer_iterator.load(Ordering::SeqCst)
                && root < self.network.neuron_count() - 1
            {
                let _ = self.output_layer_iterator.compare_exchange(
                    root,
                    root + 1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
            }
        }
    }

    fn is_in_progress(&self, neuron_index: usize) -> bool {
        self.neuron_states[neuron_index].load(Ordering::SeqCst) < self.number_of_inputs[neuron_index]
    }

    fn is_reserved(&self, neuron_index: usize) -> bool {
        self.neuron_states[neuron_index].load(Ordering::SeqCst)
            == self.reserved_value(neuron_index)
    }

    fn is_processed(&self, neuron_index: usize) -> bool {
        self.neuron_states[neuron_index].load(Ordering::SeqCst)
            == self.processed_value(neuron_index)
    }

    fn is_subset_candidate(&self, neuron_index: usize, iteration: u32) -> bool {
        let state = self.neuron_states[neuron_index].load(Ordering::SeqCst) as i64;
        let deferred_until = state - self.processed_value(neuron_index) as i64;
        deferred_until <= iteration as i64
            && !self.is_processed(neuron_index)
            && !self.is_reserved(neuron_index)
    }

    fn reserved_value(&self, neuron_index: usize) -> u32 {
        self.number_of_inputs[neuron_index] + 1
    }

    fn processed_value(&self, neuron_index: usize) -> u32 {
        self.number_of_inputs[neuron_index] + 2
    }

    fn deferred_value(&self, neuron_index: usize, iteration: u32) -> u32 {
        self.processed_value(neuron_index) + iteration + 1
    }

    fn subset_megabytes(&self) -> f64 {
        f64::from_bits(self.subset_size_bytes.load(Ordering::SeqCst)) / (1024.0 * 1024.0)
    }

    fn add_subset_bytes(&self, bytes: f64) {
        let mut current = self.subset_size_bytes.load(Ordering::SeqCst);
        loop {
            let updated = (f64::from_bits(current) + bytes).max(0.0);
            match self.subset_size_bytes.compare_exchange_weak(
                current,
                updated.to_bits(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    fn lock_subset(&self) -> std::sync::MutexGuard<'_, VecDeque<usize>> {
        self.subset
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
