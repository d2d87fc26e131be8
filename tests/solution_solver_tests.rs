use lattica::net::synapse::external_from_array;
use lattica::net::{IndexInterval, InputInterval, NetworkBuilder, SynapseIterator, TransferKind};
use lattica::solve::{PartialSolution, SolutionBuilder, SolutionSolver};
use lattica::{Settings, Solution};

/// A two-neuron partial over one shared input interval; weights are
/// `(input_count + 1)` per neuron, bias last.
fn two_neuron_partial(
    output_start: usize,
    input: InputInterval,
    weight_table: Vec<f64>,
    transfer: TransferKind,
) -> PartialSolution {
    let input_count = input.size;
    assert_eq!(weight_table.len(), 2 * (input_count as usize + 1));
    PartialSolution {
        output_start,
        output_size: 2,
        weight_table,
        transfer_functions: vec![transfer, transfer],
        input_intervals: vec![input, input],
        weight_intervals: vec![
            IndexInterval::new(0, input_count + 1),
            IndexInterval::new(input_count + 1, input_count + 1),
        ],
        index_synapse_counts: vec![1, 1],
        weight_synapse_counts: vec![1, 1],
    }
}

fn manual_neuron(inputs: &[f64], weights: &[f64], transfer: TransferKind) -> f64 {
    let mut sum = 0.0;
    for (value, weight) in inputs.iter().zip(weights) {
        sum += value * weight;
    }
    sum += weights[inputs.len()]; // bias
    transfer.activate(sum)
}

/// A hand-coded plan of 2 rows x 2 cols:
/// - partial [0][0] takes the whole input, [0][1] the second half,
/// - partial [1][0] takes the whole first row, [1][1] its middle.
fn hand_coded_solution() -> (Solution, Vec<Vec<f64>>) {
    let weights_0_0 = vec![0.3, -0.2, 0.5, 0.1, 0.05, 0.7, 0.25, -0.4, 0.6, 0.0];
    let weights_0_1 = vec![0.9, -0.5, 0.15, 0.45, 0.35, -0.1];
    let weights_1_0 = vec![0.2, 0.3, -0.25, 0.4, 0.1, -0.3, 0.55, 0.05, 0.2, 0.02];
    let weights_1_1 = vec![0.8, -0.6, 0.3, -0.15, 0.7, 0.1];
    let solution = Solution {
        rows: vec![
            vec![
                two_neuron_partial(
                    0,
                    InputInterval::new(external_from_array(0), 4),
                    weights_0_0.clone(),
                    TransferKind::Identity,
                ),
                two_neuron_partial(
                    2,
                    InputInterval::new(external_from_array(2), 2),
                    weights_0_1.clone(),
                    TransferKind::Sigmoid,
                ),
            ],
            vec![
                two_neuron_partial(
                    4,
                    InputInterval::new(0, 4),
                    weights_1_0.clone(),
                    TransferKind::Identity,
                ),
                two_neuron_partial(
                    6,
                    InputInterval::new(1, 2),
                    weights_1_1.clone(),
                    TransferKind::Sigmoid,
                ),
            ],
        ],
        memory_length: 1,
        neuron_number: 8,
        output_neuron_number: 4,
        network_input_size: 4,
        features_by_row: vec![Vec::new(), Vec::new()],
    };
    (
        solution,
        vec![weights_0_0, weights_0_1, weights_1_0, weights_1_1],
    )
}

fn expected_neuron_data(input: &[f64], weights: &[Vec<f64>]) -> Vec<f64> {
    let mut neurons = vec![0.0; 8];
    neurons[0] = manual_neuron(input, &weights[0][0..5], TransferKind::Identity);
    neurons[1] = manual_neuron(input, &weights[0][5..10], TransferKind::Identity);
    neurons[2] = manual_neuron(&input[2..4], &weights[1][0..3], TransferKind::Sigmoid);
    neurons[3] = manual_neuron(&input[2..4], &weights[1][3..6], TransferKind::Sigmoid);
    let first_row = neurons[0..4].to_vec();
    neurons[4] = manual_neuron(&first_row, &weights[2][0..5], TransferKind::Identity);
    neurons[5] = manual_neuron(&first_row, &weights[2][5..10], TransferKind::Identity);
    neurons[6] = manual_neuron(&first_row[1..3], &weights[3][0..3], TransferKind::Sigmoid);
    neurons[7] = manual_neuron(&first_row[1..3], &weights[3][3..6], TransferKind::Sigmoid);
    neurons
}

#[test]
fn hand_coded_plan_agrees_with_manual_computation_across_thread_counts() {
    let input = vec![5.1, 10.3, 3.2, 9.4];
    let (solution, weights) = hand_coded_solution();
    let expected = expected_neuron_data(&input, &weights);
    for thread_count in [1usize, 2, 10] {
        let settings = Settings::default().with_max_solve_threads(thread_count);
        let solver = SolutionSolver::new(solution.clone(), &settings).unwrap();
        let output = solver.solve(&input, true, 0).unwrap();
        assert_eq!(4, output.len());
        let neuron_data = solver.neuron_data(0).unwrap();
        for neuron_index in 0..8 {
            let difference = (neuron_data[neuron_index] - expected[neuron_index]).abs();
            let bound = 1e-13 * expected[neuron_index].abs().max(1.0);
            assert!(
                difference <= bound,
                "threads {thread_count}, neuron {neuron_index}: \
                 {} vs {}",
                neuron_data[neuron_index],
                expected[neuron_index]
            );
        }
        assert_eq!(&neuron_data[4..8], output.as_slice());
    }
}

#[test]
fn compiled_plan_matches_a_manual_forward_pass() {
    let network = NetworkBuilder::new()
        .input_size(3)
        .dense_layers(&[4, 3, 2])
        .transfer_functions_by_layer(&[
            TransferKind::Selu,
            TransferKind::Tanh,
            TransferKind::Sigmoid,
        ])
        .seed(1234)
        .build()
        .unwrap();
    let settings = Settings::default();
    let solution = SolutionBuilder::new(&settings).build(&network).unwrap();
    let solver = SolutionSolver::new(solution, &settings).unwrap();

    let input = vec![0.25, -0.75, 0.5];
    let solved = solver.solve(&input, true, 0).unwrap();
    let solved_neurons = solver.neuron_data(0).unwrap();

    // Layered nets list neurons in dependency order, so one pass suffices.
    let mut manual = vec![0.0; network.neuron_count()];
    for (neuron_index, neuron) in network.neurons.iter().enumerate() {
        let mut collected = Vec::new();
        SynapseIterator::new(&neuron.input_indices).iterate(|index| {
            if index < 0 {
                collected.push(input[(-1 - index) as usize]);
            } else {
                collected.push(manual[index as usize]);
            }
        });
        let mut weights = Vec::new();
        SynapseIterator::new(&neuron.input_weights)
            .iterate(|weight_index| weights.push(network.weight_table[weight_index as usize]));
        manual[neuron_index] = manual_neuron(&collected, &weights, neuron.transfer);
    }
    for neuron_index in 0..network.neuron_count() {
        let difference = (solved_neurons[neuron_index] - manual[neuron_index]).abs();
        assert!(
            difference <= 1e-13 * manual[neuron_index].abs().max(1.0),
            "neuron {neuron_index}: {} vs {}",
            solved_neurons[neuron_index],
            manual[neuron_index]
        );
    }
    let output_start = network.neuron_count() - network.output_neuron_number;
    assert_eq!(&solved_neurons[output_start..], solved.as_slice());
}

#[test]
fn recurrent_solves_depend_on_ring_history() {
    let network = NetworkBuilder::new()
        .input_size(1)
        .dense_layers(&[2, 1])
        .transfer_functions_by_layer(&[TransferKind::Selu, TransferKind::Identity])
        .recurrence_to_self()
        .seed(77)
        .build()
        .unwrap();
    let settings = Settings::default();
    let solution = SolutionBuilder::new(&settings).build(&network).unwrap();
    assert_eq!(2, solution.memory_length);
    let solver = SolutionSolver::new(solution, &settings).unwrap();

    let first = solver.solve(&[0.4], true, 0).unwrap();
    let second = solver.solve(&[0.4], false, 0).unwrap();
    assert_ne!(first, second, "recurrence must feed past activations back");

    let reset_again = solver.solve(&[0.4], true, 0).unwrap();
    assert_eq!(first, reset_again, "reset must clear the ring history");
}

#[test]
fn shape_and_thread_violations_are_fatal() {
    let (solution, _) = hand_coded_solution();
    let settings = Settings::default().with_max_processing_threads(2);
    let solver = SolutionSolver::new(solution, &settings).unwrap();
    assert!(solver.solve(&[1.0, 2.0], true, 0).is_err());
    assert!(solver.solve(&[1.0, 2.0, 3.0, 4.0], true, 7).is_err());
}
