use std::sync::Arc;

use ndarray::Array2;
use rand::prelude::*;
use lattica::objective::CostObjective;
use lattica::train::UpdaterKind;
use lattica::{
    BackpropOptimizer, CostKind, CpuContext, Network, NetworkBuilder, SequenceData, Settings,
    TransferKind,
};

/// Input pairs in [0,1] labelled with their sum.
fn addition_data(samples: usize, seed: u64) -> SequenceData {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut inputs = Array2::zeros((samples, 2));
    let mut labels = Array2::zeros((samples, 1));
    for row in 0..samples {
        let a: f64 = rng.gen_range(0.0..1.0);
        let b: f64 = rng.gen_range(0.0..1.0);
        inputs[[row, 0]] = a;
        inputs[[row, 1]] = b;
        labels[[row, 0]] = a + b;
    }
    SequenceData::from_arrays(inputs, labels, 1, 0).unwrap()
}

fn addition_context(
    layers: &[usize],
    settings: &Settings,
    samples: usize,
    seed: u64,
) -> CpuContext {
    let transfers = vec![TransferKind::Selu; layers.len()];
    let mut network = NetworkBuilder::new()
        .input_size(2)
        .dense_layers(layers)
        .transfer_functions_by_layer(&transfers)
        .seed(seed)
        .build()
        .unwrap();
    // A mildly positive starting point keeps SELU on its linear side.
    for weight in network.weight_table.iter_mut() {
        *weight = 0.5;
    }
    let mut context = CpuContext::new(
        network,
        settings,
        Box::new(CostObjective::new(CostKind::MeanSquaredError)),
    )
    .unwrap();
    context.refresh_solution_weights();
    context
        .set_environment(Arc::new(addition_data(samples, seed)))
        .unwrap();
    context
}

fn train_until(
    context: &mut CpuContext,
    optimizer: &mut BackpropOptimizer,
    target_error: f64,
    max_iterations: usize,
) -> f64 {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let mut error = f64::MAX;
    for iteration in 0..max_iterations {
        optimizer.iterate(context).unwrap();
        if 0 == (iteration + 1) % 25 {
            error = context.full_evaluation().unwrap();
            if error < target_error {
                println!("converged to {error} in {} iterations", iteration + 1);
                return error;
            }
        }
    }
    error
}

#[test]
fn single_neuron_addition_with_plain_updater() {
    let settings = Settings::default()
        .with_learning_rate(0.1)
        .with_step_size(0.1)
        .with_minibatch_size(500)
        .with_memory_truncation(1);
    let mut context = addition_context(&[1], &settings, 500, 5);
    let mut optimizer = BackpropOptimizer::build(
        &settings,
        context.network(),
        Box::new(CostObjective::new(CostKind::MeanSquaredError)),
        UpdaterKind::Plain,
    )
    .unwrap();

    let trained = train_until(&mut context, &mut optimizer, 0.1, 5000);
    assert!(trained < 0.1, "training error stuck at {trained}");

    // Held-out set: the learned mapping must generalize.
    let test_error = context
        .evaluate_set(&addition_data(500, 777))
        .unwrap();
    assert!(test_error < 0.15, "test error {test_error}");
}

#[test]
fn one_hidden_layer_addition_with_momentum() {
    let settings = Settings::default()
        .with_learning_rate(0.02)
        .with_gamma(0.9)
        .with_minibatch_size(500)
        .with_memory_truncation(1);
    let mut context = addition_context(&[2, 1], &settings, 500, 6);
    let mut optimizer = BackpropOptimizer::build(
        &settings,
        context.network(),
        Box::new(CostObjective::new(CostKind::MeanSquaredError)),
        UpdaterKind::Momentum,
    )
    .unwrap();

    let trained = train_until(&mut context, &mut optimizer, 0.1, 5000);
    assert!(trained < 0.1, "training error stuck at {trained}");
}

#[test]
fn three_layer_addition_with_nesterov() {
    let settings = Settings::default()
        .with_learning_rate(0.02)
        .with_gamma(0.9)
        .with_minibatch_size(500)
        .with_memory_truncation(1);
    let mut context = addition_context(&[2, 2, 1], &settings, 500, 7);
    let mut optimizer = BackpropOptimizer::build(
        &settings,
        context.network(),
        Box::new(CostObjective::new(CostKind::MeanSquaredError)),
        UpdaterKind::Nesterov,
    )
    .unwrap();

    let trained = train_until(&mut context, &mut optimizer, 0.1, 5000);
    assert!(trained < 0.1, "training error stuck at {trained}");
}

/// Sequences of input pairs; the label accumulates every pair seen so far,
/// so the network has to carry state across steps through its self-loops.
fn sequenced_addition_data(samples: usize, sequence_size: usize, seed: u64) -> SequenceData {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = SequenceData::new(2, 1, sequence_size);
    for _ in 0..samples {
        let mut inputs = Vec::with_capacity(sequence_size);
        let mut labels = Vec::with_capacity(sequence_size);
        let mut running_sum = 0.0;
        for _ in 0..sequence_size {
            let a: f64 = rng.gen_range(0.0..0.1);
            let b: f64 = rng.gen_range(0.0..0.1);
            running_sum += a + b;
            inputs.push(vec![a, b]);
            labels.push(vec![running_sum]);
        }
        data.push_sequence(&inputs, &labels).unwrap();
    }
    data
}

#[test]
fn recurrent_sequenced_addition_with_nesterov() {
    let sequence_size = 5usize;
    let settings = Settings::default()
        .with_learning_rate(0.05)
        .with_gamma(0.9)
        .with_minibatch_size(10)
        .with_memory_truncation(sequence_size);
    // Random init: distinct hidden units must emerge to carry the sum.
    let network: Network = NetworkBuilder::new()
        .input_size(2)
        .dense_layers(&[5, 1])
        .transfer_functions_by_layer(&[TransferKind::Selu, TransferKind::Sigmoid])
        .recurrence_to_self()
        .seed(8)
        .build()
        .unwrap();
    let mut context = CpuContext::new(
        network,
        &settings,
        Box::new(CostObjective::new(CostKind::MeanSquaredError)),
    )
    .unwrap();
    context
        .set_environment(Arc::new(sequenced_addition_data(50, sequence_size, 9)))
        .unwrap();
    let mut optimizer = BackpropOptimizer::build(
        &settings,
        context.network(),
        Box::new(CostObjective::new(CostKind::MeanSquaredError)),
        UpdaterKind::Nesterov,
    )
    .unwrap();

    let trained = train_until(&mut context, &mut optimizer, 0.01, 10000);
    assert!(trained < 0.01, "training error stuck at {trained}");
}
