use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;

use crate::net::synapse::SynapseIterator;
use crate::net::{FeatureGroup, FeatureKind, Network};
use crate::settings::Settings;
use crate::utils::ThreadGroup;

/// Applies neuron-group features over the current head slot (softmax,
/// dropout) or folds them into the error value (l1/l2 regularization).
///
/// Reductions run fanned over a thread group and accumulate through
/// compare-exchange loops on bit-cast `f64` atomics, so their results do not
/// depend on how neurons are distributed across workers.
pub struct FeatureExecutor;

impl FeatureExecutor {
    /// Run a solution-relevant feature over neuron data. Dropout only fires
    /// in training mode; objective evaluation must see undisturbed outputs.
    pub fn execute_solution_relevant(
        group: &FeatureGroup,
        settings: &Settings,
        neuron_data: &mut [f64],
        threads: &ThreadGroup,
        training: bool,
    ) {
        match group.kind {
            FeatureKind::Softmax => Self::execute_softmax(group, neuron_data, threads),
            FeatureKind::Dropout => {
                if training {
                    Self::execute_dropout(group, settings, neuron_data);
                }
            }
            _ => {}
        }
    }

    /// Error contribution of a performance-relevant feature.
    pub fn calculate_performance_relevant(
        group: &FeatureGroup,
        network: &Network,
        threads: &ThreadGroup,
    ) -> f64 {
        match group.kind {
            FeatureKind::L1Regularization => {
                Self::regularization_sum(group, network, threads, |weight| weight.abs())
            }
            FeatureKind::L2Regularization => {
                Self::regularization_sum(group, network, threads, |weight| weight * weight)
            }
            _ => 0.0,
        }
    }

    fn execute_softmax(group: &FeatureGroup, neuron_data: &mut [f64], threads: &ThreadGroup) {
        let relevant = group.neuron_indices();
        if relevant.is_empty() {
            return;
        }
        let max_value = AtomicU64::new(f64::NEG_INFINITY.to_bits());
        let exp_sum = AtomicU64::new(0f64.to_bits());
        let per_thread = 1 + relevant.len() / threads.thread_count();
        let data: &[f64] = neuron_data;
        threads.start_and_block(&|thread_index| {
            let start = (per_thread * thread_index).min(relevant.len());
            let end = (start + per_thread).min(relevant.len());
            for &neuron_index in &relevant[start..end] {
                atomic_max_f64(&max_value, data[neuron_index]);
            }
        });
        // Subtracting the shared maximum keeps every exponent finite.
        let used_max = f64::from_bits(max_value.load(Ordering::SeqCst));
        threads.start_and_block(&|thread_index| {
            let start = (per_thread * thread_index).min(relevant.len());
            let end = (start + per_thread).min(relevant.len());
            for &neuron_index in &relevant[start..end] {
                atomic_add_f64(&exp_sum, (data[neuron_index] - used_max).exp());
            }
        });

        let used_sum = f64::from_bits(exp_sum.load(Ordering::SeqCst)).max(f64::EPSILON);
        for &neuron_index in &relevant {
            neuron_data[neuron_index] = (neuron_data[neuron_index] - used_max).exp() / used_sum;
        }
    }

    fn execute_dropout(group: &FeatureGroup, settings: &Settings, neuron_data: &mut [f64]) {
        let mut rng = rand::thread_rng();
        for neuron_index in group.neuron_indices() {
            if rng.gen::<f64>() < settings.dropout_probability {
                neuron_data[neuron_index] = 0.0;
            }
        }
    }

    fn regularization_sum(
        group: &FeatureGroup,
        network: &Network,
        threads: &ThreadGroup,
        term: impl Fn(f64) -> f64 + Sync,
    ) -> f64 {
        let relevant = group.neuron_indices();
        let sum = AtomicU64::new(0f64.to_bits());
        let per_thread = 1 + relevant.len() / threads.thread_count();
        threads.start_and_block(&|thread_index| {
            let start = (per_thread * thread_index).min(relevant.len());
            let end = (start + per_thread).min(relevant.len());
            for &neuron_index in &relevant[start..end] {
                SynapseIterator::new(&network.neurons[neuron_index].input_weights).iterate(
                    |weight_index| {
                        atomic_add_f64(&sum, term(network.weight_table[weight_index as usize]));
                    },
                );
            }
        });
        f64::from_bits(sum.load(Ordering::SeqCst))
    }
}

fn atomic_add_f64(target: &AtomicU64, value: f64) {
    let mut current = target.load(Ordering::SeqCst);
    loop {
        let updated = (f64::from_bits(current) + value).to_bits();
        match target.compare_exchange_weak(current, updated, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return,
            Err(actual) => current = actual,
        }
    }
}

fn atomic_max_f64(target: &AtomicU64, value: f64) {
    let mut current = target.load(Ordering::SeqCst);
    while value > f64::from_bits(current) {
        match target.compare_exchange_weak(
            current,
            value.to_bits(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => return,
            Err(actual) => current = actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::IndexInterval;

    #[test]
    fn softmax_is_a_probability_distribution() {
        let group = FeatureGroup::new(FeatureKind::Softmax, vec![IndexInterval::new(1, 3)]);
        let mut data = vec![9.0, 1.0, 2.0, 3.0, 9.0];
        let threads = ThreadGroup::new(3);
        let settings = Settings::default();
        FeatureExecutor::execute_solution_relevant(&group, &settings, &mut data, &threads, false);
        let sum: f64 = data[1..4].iter().sum();
        assert!((sum - 1.0).abs() < 1e-12);
        assert!(data[1] < data[2] && data[2] < data[3]);
        assert_eq!(9.0, data[0]);
        assert_eq!(9.0, data[4]);
    }

    #[test]
    fn softmax_survives_large_magnitudes() {
        let group = FeatureGroup::new(FeatureKind::Softmax, vec![IndexInterval::new(0, 3)]);
        let mut data = vec![1000.0, 1001.0, 999.0];
        let threads = ThreadGroup::new(2);
        let settings = Settings::default();
        FeatureExecutor::execute_solution_relevant(&group, &settings, &mut data, &threads, false);
        assert!(data.iter().all(|value| value.is_finite()));
        assert!((data.iter().sum::<f64>() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn dropout_is_skipped_outside_training() {
        let group = FeatureGroup::new(FeatureKind::Dropout, vec![IndexInterval::new(0, 4)]);
        let mut data = vec![1.0; 4];
        let threads = ThreadGroup::new(2);
        let settings = Settings::default().with_dropout_probability(1.0);
        FeatureExecutor::execute_solution_relevant(&group, &settings, &mut data, &threads, false);
        assert_eq!(vec![1.0; 4], data);
        FeatureExecutor::execute_solution_relevant(&group, &settings, &mut data, &threads, true);
        assert_eq!(vec![0.0; 4], data);
    }
}
