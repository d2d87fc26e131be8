use lattica::net::synapse::{
    array_from_external, external_from_array, is_external, SynapseIterator,
};
use lattica::net::{IndexInterval, InputInterval};

#[test]
fn iteration_visits_every_element_of_every_interval() {
    let intervals = [
        IndexInterval::new(50, 10),
        IndexInterval::new(70, 2),
        IndexInterval::new(0, 2),
    ];
    let iterator = SynapseIterator::new(&intervals);
    assert_eq!(14, iterator.size());

    let mut visited = Vec::new();
    iterator.iterate(|index| visited.push(index));
    let expected: Vec<i32> = (50..60).chain(70..72).chain(0..2).collect();
    assert_eq!(expected, visited);
}

#[test]
fn direct_access_equals_iteration_order() {
    let intervals = [
        InputInterval::new(4, 3),
        InputInterval::new(external_from_array(2), 3),
        InputInterval::new(20, 1),
    ];
    let iterator = SynapseIterator::new(&intervals);
    let mut by_iteration = Vec::new();
    iterator.iterate(|index| by_iteration.push(index));
    for (ordinal, &expected) in by_iteration.iter().enumerate() {
        assert_eq!(expected, iterator.index_at(ordinal).unwrap());
    }
    assert!(iterator.index_at(by_iteration.len()).is_err());
}

#[test]
fn negative_starts_walk_the_external_inputs_downward() {
    let intervals = [InputInterval::new(external_from_array(0), 4)];
    let iterator = SynapseIterator::new(&intervals);
    let mut visited = Vec::new();
    iterator.iterate(|index| visited.push(index));
    assert_eq!(vec![-1, -2, -3, -4], visited);
    for (array_index, &external) in visited.iter().enumerate() {
        assert!(is_external(external));
        assert_eq!(array_index, array_from_external(external));
    }
}

#[test]
fn external_codec_is_an_involution() {
    for array_index in 0..1000usize {
        let external = external_from_array(array_index);
        assert!(is_external(external));
        assert!(external < 0);
        assert_eq!(array_index, array_from_external(external));
    }
}

#[test]
fn skim_sees_each_interval_once() {
    let intervals = [
        IndexInterval::new(0, 5),
        IndexInterval::new(10, 5),
        IndexInterval::new(20, 5),
    ];
    let iterator = SynapseIterator::new(&intervals);
    let mut starts = Vec::new();
    iterator.skim(|interval| starts.push(interval.start));
    assert_eq!(vec![0, 10, 20], starts);

    let mut skimmed = 0;
    iterator.skim_terminatable(|_| {
        skimmed += 1;
        skimmed < 2
    });
    assert_eq!(2, skimmed);
}

#[test]
fn reach_past_and_interval_size_follow_the_element_ordinal() {
    let intervals = [
        InputInterval::with_reach(0, 2, 0),
        InputInterval::with_reach(7, 3, 2),
        InputInterval::with_reach(external_from_array(0), 1, 1),
    ];
    let iterator = SynapseIterator::new(&intervals);
    assert_eq!(0, iterator.reach_past_of(0).unwrap());
    assert_eq!(0, iterator.reach_past_of(1).unwrap());
    assert_eq!(2, iterator.reach_past_of(2).unwrap());
    assert_eq!(2, iterator.reach_past_of(4).unwrap());
    assert_eq!(1, iterator.reach_past_of(5).unwrap());
    assert_eq!(2, iterator.interval_size_of(0).unwrap());
    assert_eq!(3, iterator.interval_size_of(3).unwrap());
    assert_eq!(1, iterator.interval_size_of(5).unwrap());
    assert_eq!(2, iterator.interval_starts_at(1));
    assert_eq!(5, iterator.interval_starts_at(2));
    assert_eq!(-1, iterator.back().unwrap());
}
