mod common;

use common::{below, double, even, graph, list_value, numbers};
use weft::nodes::{data, state};
use weft::transduce::{
    count, filter, first, last, map, range, skip, take, take_while, transduce, transform_items,
};
use weft::{GraphConfig, NodeDefinition, Registry, Value};

#[test]
fn filter_even_then_append() {
    let source = state::mutable_list(numbers([1.0, 2.0, 3.0, 4.0, 5.0, 6.0]));
    let graph = graph(data::nil());
    let mut evens = graph
        .subscribe(transform_items(source.clone(), [filter(even())]))
        .unwrap();
    graph.flush().unwrap();
    assert_eq!(
        evens.drain().iter().map(|d| d.to_value()).collect::<Vec<_>>(),
        vec![Some(list_value([2.0, 4.0, 6.0]))]
    );

    graph
        .dispatch(state::push(source, [data::value(-2.0)]))
        .unwrap();
    let emitted = evens.drain();
    assert_eq!(emitted.len(), 1);
    assert_eq!(emitted[0].to_value(), Some(list_value([2.0, 4.0, 6.0, -2.0])));
}

#[test]
fn reactive_skip_reoffsets_once() {
    let source = data::list(numbers([1.0, 2.0, 3.0, 4.0, 5.0]));
    let offset = state::variable(data::value(2.0));
    let graph = graph(data::nil());
    let mut tail = graph
        .subscribe(transform_items(source, [skip(offset.clone())]))
        .unwrap();
    graph.flush().unwrap();
    assert_eq!(tail.value(), Some(list_value([3.0, 4.0, 5.0])));

    graph
        .dispatch(state::set(offset, data::value(1.0)))
        .unwrap();
    let emitted = tail.drain();
    assert_eq!(emitted.len(), 1);
    assert_eq!(emitted[0].to_value(), Some(list_value([2.0, 3.0, 4.0, 5.0])));
}

#[test]
fn count_yields_length() {
    let graph = graph(data::nil());
    let counted = graph
        .resolve(transduce(range(0.0, 7.0), [count()]))
        .unwrap();
    assert_eq!(counted.to_value(), Some(list_value([7.0])));

    let empty = graph
        .resolve(transform_items(data::list([]), [count()]))
        .unwrap();
    assert_eq!(empty.to_value(), Some(list_value([0.0])));
}

fn both(graph: &weft::Graph, source: NodeDefinition, chain: Vec<NodeDefinition>) -> (Value, Value) {
    let eager = graph
        .resolve(transform_items(source.clone(), chain.clone()))
        .unwrap();
    let pulled = graph.resolve(transduce(source, chain)).unwrap();
    (
        eager.to_value().unwrap_or_default(),
        pulled.to_value().unwrap_or_default(),
    )
}

#[test]
fn eager_and_pull_agree() {
    let graph = graph(data::nil());
    let source = data::list(numbers((1..=10).map(f64::from)));
    let chains: Vec<Vec<NodeDefinition>> = vec![
        vec![],
        vec![map(double())],
        vec![filter(even()), map(double())],
        vec![map(double()), take(data::value(3.0))],
        vec![skip(data::value(8.0)), count()],
        vec![take_while(below(5.0)), last()],
        vec![filter(even()), first()],
        vec![take(data::value(0.0)), count()],
    ];
    for chain in chains {
        let (eager, pulled) = both(&graph, source.clone(), chain.clone());
        assert_eq!(eager, pulled, "chain {chain:?}");
    }
}

#[test]
fn pull_stops_early_on_lazy_sources() {
    let graph = graph(data::nil());
    let first_two = graph
        .resolve(transduce(
            range(0.0, 1_000_000.0),
            [map(double()), take(data::value(2.0))],
        ))
        .unwrap();
    assert_eq!(first_two.to_value(), Some(list_value([0.0, 2.0])));
}

#[test]
fn mutable_sources_feed_the_pull_driver() {
    let source = state::mutable_list(numbers([1.0, 2.0, 3.0]));
    let graph = graph(data::nil());
    let mut doubled = graph
        .subscribe(transduce(source.clone(), [map(double())]))
        .unwrap();
    graph.flush().unwrap();
    assert_eq!(doubled.value(), Some(list_value([2.0, 4.0, 6.0])));

    graph.dispatch(state::pop(source)).unwrap();
    assert_eq!(doubled.value(), Some(list_value([2.0, 4.0])));
}

#[test]
fn long_folds_are_bounded_by_their_input() {
    let graph = graph(data::nil());
    let counted = graph
        .resolve(transduce(range(0.0, 60_000.0), [count()]))
        .unwrap();
    assert_eq!(counted.to_value(), Some(list_value([60_000.0])));
}

#[test]
fn hop_limit_does_not_cap_fold_length() {
    common::init_logger();
    let config = GraphConfig {
        hop_limit: 1_000,
        ..GraphConfig::default()
    };
    let graph = weft::Graph::with_config(Registry::with_builtins(), data::nil(), config);
    let (eager, pulled) = both(&graph, range(0.0, 5_000.0), vec![count()]);
    assert_eq!(eager, list_value([5_000.0]));
    assert_eq!(pulled, eager);

    let (eager, pulled) = both(&graph, range(0.0, 3_000.0), vec![map(double())]);
    assert_eq!(eager, list_value((0..3_000).map(|n| f64::from(n) * 2.0)));
    assert_eq!(pulled, eager);
}

#[test]
fn loop_limit_still_stops_runaway_folds() {
    common::init_logger();
    let config = GraphConfig {
        loop_limit: 100,
        ..GraphConfig::default()
    };
    let graph = weft::Graph::with_config(Registry::with_builtins(), data::nil(), config);
    let result = graph
        .resolve(transduce(range(0.0, 1_000.0), [count()]))
        .unwrap();
    let error = result.as_error().expect("a step-limit error");
    assert_eq!(error.code.as_deref(), Some("step_limit"));
}

#[test]
fn unbounded_ranges_are_rejected() {
    let graph = graph(data::nil());
    for source in [range(0.0, f64::INFINITY), range(f64::NAN, 1.0)] {
        let pulled = graph.resolve(transduce(source.clone(), [count()])).unwrap();
        assert_eq!(
            pulled.as_error().and_then(|error| error.code).as_deref(),
            Some("type_mismatch")
        );
        let eager = graph.resolve(transform_items(source, [count()])).unwrap();
        assert!(eager.is_error());
    }
}
