use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use crate::errors::{LatResult, LatticaError};
use crate::settings::Settings;
use crate::solve::features::FeatureExecutor;
use crate::solve::partial::PartialSolver;
use crate::solve::solution::Solution;
use crate::utils::{DataPool, DataRing, ThreadGroup};

/// Evaluates a compiled [`Solution`] row by row. Every processing thread owns
/// a private activation ring and scratch set, so up to
/// `max_processing_threads` sequences can be solved concurrently; partials
/// within a row fan out over `max_solve_threads` workers.
pub struct SolutionSolver {
    solution: Solution,
    settings: Settings,
    thread_slots: Vec<Mutex<ThreadSlot>>,
    evaluating: AtomicBool,
}

struct ThreadSlot {
    ring: DataRing,
    inner: ThreadGroup,
    pool: DataPool,
}

impl SolutionSolver {
    pub fn new(solution: Solution, settings: &Settings) -> LatResult<Self> {
        solution.validate()?;
        let thread_slots = (0..settings.max_processing_threads.max(1))
            .map(|_| {
                Mutex::new(ThreadSlot {
                    ring: DataRing::new(solution.memory_length, solution.neuron_number),
                    inner: ThreadGroup::new(settings.max_solve_threads),
                    pool: DataPool::new(),
                })
            })
            .collect();
        debug!(
            rows = solution.rows.len(),
            memory_length = solution.memory_length,
            "solution solver ready"
        );
        Ok(Self {
            solution,
            settings: settings.clone(),
            thread_slots,
            evaluating: AtomicBool::new(true),
        })
    }

    pub fn solution(&self) -> &Solution {
        &self.solution
    }

    pub fn solution_mut(&mut self) -> &mut Solution {
        &mut self.solution
    }

    pub fn thread_count(&self) -> usize {
        self.thread_slots.len()
    }

    /// Objective evaluation must see undisturbed outputs; training mode
    /// additionally runs dropout.
    pub fn set_eval_mode(&self, evaluating: bool) {
        self.evaluating.store(evaluating, Ordering::SeqCst);
    }

    /// The newest activation vector of one processing thread.
    pub fn neuron_data(&self, thread_index: usize) -> LatResult<Vec<f64>> {
        let slot = self.slot(thread_index)?;
        Ok(slot.ring.slot(0)?.to_vec())
    }

    /// Consume one input vector: advance the thread's ring (resetting first
    /// when requested), evaluate every row, apply the row's features, and
    /// return the output neuron range of the new head slot.
    pub fn solve(&self, input: &[f64], reset: bool, thread_index: usize) -> LatResult<Vec<f64>> {
        let mut slot = self.slot(thread_index)?;
        if input.len() != self.solution.network_input_size {
            return Err(LatticaError::ShapeMismatch {
                context: "network input",
                expected: self.solution.network_input_size,
                found: input.len(),
            });
        }
        if self.solution.rows.is_empty() {
            return Err(LatticaError::EmptyPlan);
        }
        if reset {
            slot.ring.reset();
        }
        slot.ring.copy_step();

        let training = !self.evaluating.load(Ordering::SeqCst);
        for (row_index, row) in self.solution.rows.iter().enumerate() {
            if row.is_empty() {
                return Err(LatticaError::EmptyRow(row_index));
            }
            // Fewer partials in a row than workers usually means the fan-out
            // costs more than it saves.
            if row.len() < self.settings.max_solve_threads / 2 || row.len() < 2 {
                let ThreadSlot { ring, pool, .. } = &mut *slot;
                for partial in row {
                    let mut scratch = pool.reserve(partial.required_scratch_size());
                    PartialSolver::new(partial).solve(input, ring, &mut scratch)?;
                }
            } else {
                self.solve_row_parallel(&mut slot, row, input)?;
            }
            for feature in &self.solution.features_by_row[row_index] {
                let ThreadSlot { ring, inner, .. } = &mut *slot;
                FeatureExecutor::execute_solution_relevant(
                    feature,
                    &self.settings,
                    ring.slot_mut(0)?,
                    inner,
                    training,
                );
            }
        }

        let head = slot.ring.slot(0)?;
        Ok(head[self.solution.neuron_number - self.solution.output_neuron_number..].to_vec())
    }

    fn solve_row_parallel(
        &self,
        slot: &mut MutexGuard<'_, ThreadSlot>,
        row: &[crate::solve::partial::PartialSolution],
        input: &[f64],
    ) -> LatResult<()> {
        let outputs: Vec<Mutex<Vec<f64>>> = row
            .iter()
            .map(|partial| Mutex::new(vec![0.0; partial.output_size]))
            .collect();
        let failure: Mutex<Option<LatticaError>> = Mutex::new(None);
        {
            let ThreadSlot { ring, inner, pool } = &**slot;
            let worker_count = inner.thread_count();
            let mut column_start = 0usize;
            while column_start < row.len() {
                inner.start_and_block(&|inner_index| {
                    let column = column_start + inner_index;
                    if column < row.len() {
                        let partial = &row[column];
                        let mut scratch = pool.reserve(partial.required_scratch_size());
                        let mut out = lock(&outputs[column]);
                        if let Err(error) =
                            PartialSolver::new(partial).solve_into(input, ring, &mut scratch, &mut out)
                        {
                            lock(&failure).get_or_insert(error);
                        }
                    }
                });
                column_start += worker_count;
            }
        }
        if let Some(error) = failure.into_inner().unwrap_or_else(|e| e.into_inner()) {
            return Err(error);
        }
        let head = slot.ring.slot_mut(0)?;
        for (partial, output) in row.iter().zip(outputs) {
            let output = output.into_inner().unwrap_or_else(|e| e.into_inner());
            head[partial.output_start..partial.output_start + partial.output_size]
                .copy_from_slice(&output);
        }
        Ok(())
    }

    fn slot(&self, thread_index: usize) -> LatResult<MutexGuard<'_, ThreadSlot>> {
        self.thread_slots
            .get(thread_index)
            .map(lock)
            .ok_or(LatticaError::IndexOutOfBounds {
                what: "solver thread",
                index: thread_index,
                bound: self.thread_slots.len(),
            })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
