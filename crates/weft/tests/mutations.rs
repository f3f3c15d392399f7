mod common;

use common::{graph, list_value, numbers};
use weft::nodes::{control, data, state};
use weft::{Func, Value};

#[test]
fn each_mutation_emits_once() {
    let list = state::mutable_list(numbers([1.0, 2.0]));
    let graph = graph(data::nil());
    let mut items = graph.subscribe(list.clone()).unwrap();
    graph.flush().unwrap();
    assert_eq!(items.drain().len(), 1);

    let steps = [
        (state::push(list.clone(), numbers([3.0])), vec![1.0, 2.0, 3.0]),
        (state::unshift(list.clone(), numbers([0.0])), vec![0.0, 1.0, 2.0, 3.0]),
        (state::pop(list.clone()), vec![0.0, 1.0, 2.0]),
        (state::shift(list.clone()), vec![1.0, 2.0]),
        (state::clear(list.clone()), vec![]),
        (state::reset(list.clone()), vec![1.0, 2.0]),
        (
            state::set(list.clone(), data::list(numbers([9.0]))),
            vec![9.0],
        ),
    ];
    for (mutation, expected) in steps {
        graph.dispatch(mutation.clone()).unwrap();
        let emitted = items.drain();
        assert_eq!(emitted.len(), 1, "after {mutation:?}");
        assert_eq!(emitted[0].to_value(), Some(list_value(expected)));
    }
}

#[test]
fn popped_item_is_the_result() {
    let list = state::mutable_list(numbers([1.0, 2.0]));
    let graph = graph(data::nil());
    let _held = graph.subscribe(list.clone()).unwrap();
    graph.flush().unwrap();
    let popped = graph.dispatch(state::pop(list.clone())).unwrap();
    assert_eq!(popped.to_value(), Some(Value::number(2.0)));
    let shifted = graph.dispatch(state::shift(list)).unwrap();
    assert_eq!(shifted.to_value(), Some(Value::number(1.0)));
}

#[test]
fn only_changed_subscribers_are_notified() {
    let a = state::variable(data::value(1.0));
    let b = state::variable(data::value(10.0));
    let sign = control::resolve(
        [a.clone()],
        Func::values("sign", |args| {
            Value::text(if args[0].as_number().unwrap_or_default() < 0.0 {
                "negative"
            } else {
                "positive"
            })
        }),
    );
    let graph = graph(data::nil());
    let mut watch_a = graph.subscribe(a.clone()).unwrap();
    let mut watch_b = graph.subscribe(b).unwrap();
    let mut watch_sign = graph.subscribe(sign).unwrap();
    graph.flush().unwrap();
    watch_a.drain();
    watch_b.drain();
    watch_sign.drain();

    graph.dispatch(state::set(a.clone(), data::value(2.0))).unwrap();
    assert_eq!(watch_a.drain().len(), 1);
    assert!(watch_b.drain().is_empty());
    // The derived value did not change.
    assert!(watch_sign.drain().is_empty());

    graph.dispatch(state::set(a, data::value(-1.0))).unwrap();
    assert_eq!(watch_sign.value(), Some(Value::text("negative")));
}

#[test]
fn variables_set_and_reset() {
    let counter = state::variable(data::value(0.0));
    let graph = graph(data::nil());
    let mut watch = graph.subscribe(counter.clone()).unwrap();
    graph.flush().unwrap();
    assert_eq!(watch.value(), Some(Value::number(0.0)));

    graph
        .dispatch(state::set(counter.clone(), data::value(5.0)))
        .unwrap();
    assert_eq!(watch.value(), Some(Value::number(5.0)));

    graph.dispatch(state::reset(counter)).unwrap();
    assert_eq!(watch.value(), Some(Value::number(0.0)));
}

#[test]
fn mutating_a_non_target_is_an_error() {
    let graph = graph(data::nil());
    let result = graph
        .dispatch(state::push(data::value(1.0), numbers([2.0])))
        .unwrap();
    assert!(result.is_error());
}

#[test]
fn released_subscribers_are_skipped() {
    let list = state::mutable_list(numbers([1.0]));
    let graph = graph(data::nil());
    let mut kept = graph.subscribe(list.clone()).unwrap();
    let released = graph.subscribe(list.clone()).unwrap();
    graph.flush().unwrap();
    assert_eq!(kept.drain().len(), 1);

    drop(released);
    graph
        .dispatch(state::push(list.clone(), numbers([2.0])))
        .unwrap();
    let emitted = kept.drain();
    assert_eq!(emitted.len(), 1);
    assert_eq!(emitted[0].to_value(), Some(list_value([1.0, 2.0])));
    assert_eq!(graph.stats().unwrap().instances, 1);

    // With nobody left the state goes; a later subscriber starts over.
    drop(kept);
    let mut fresh = graph.subscribe(list).unwrap();
    graph.flush().unwrap();
    assert_eq!(fresh.value(), Some(list_value([1.0])));
}

#[test]
fn repeated_mutations_apply_each_time() {
    let list = state::mutable_list(numbers([1.0]));
    let graph = graph(data::nil());
    let mut items = graph.subscribe(list.clone()).unwrap();
    graph.flush().unwrap();
    items.drain();

    let push = state::push(list, numbers([2.0]));
    graph.dispatch(push.clone()).unwrap();
    assert_eq!(items.drain().len(), 1);
    graph.dispatch(push).unwrap();
    let emitted = items.drain();
    assert_eq!(emitted.len(), 1);
    assert_eq!(emitted[0].to_value(), Some(list_value([1.0, 2.0, 2.0])));
}

#[test]
fn mutations_without_subscribers_settle() {
    let list = state::mutable_list(numbers([1.0]));
    let graph = graph(data::nil());
    let result = graph
        .dispatch(state::push(list.clone(), numbers([2.0])))
        .unwrap();
    assert_eq!(result.to_value(), Some(list_value([1.0, 2.0])));
    assert_eq!(graph.stats().unwrap().instances, 0);

    let mut items = graph.subscribe(list).unwrap();
    graph.flush().unwrap();
    assert_eq!(items.value(), Some(list_value([1.0])));
}
