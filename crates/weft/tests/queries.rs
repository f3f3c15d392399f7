mod common;

use common::{double, graph, numbers};
use futures_channel::mpsc;
use futures_util::StreamExt;
use std::cell::RefCell;
use std::rc::Rc;
use weft::nodes::control::{self, StreamFactory};
use weft::nodes::{data, state};
use weft::query::{merge, Field};
use weft::transduce::map;
use weft::{Key, NodeDefinition, Query, Selection, Value};

fn profile() -> NodeDefinition {
    data::record([
        (
            "user",
            data::record([
                ("name", data::value("Ada")),
                ("avatar", data::fail("no avatar")),
                ("age", state::variable(data::value(36.0))),
            ]),
        ),
        ("scores", data::list(numbers([3.0, 5.0]))),
    ])
}

#[test]
fn errors_carry_their_path() {
    let graph = graph(profile());
    let query = Query::new(Selection::fields([
        ("name", Field::leaf("user.name")),
        ("avatar", Field::leaf("user.avatar")),
    ]));
    let mut results = graph.query(query).unwrap();
    graph.flush().unwrap();
    let value = results.latest().unwrap();

    let Value::Record(fields) = &value else {
        panic!("expected a record, got {value:?}");
    };
    assert_eq!(fields.get("name"), Some(&Value::text("Ada")));
    let error = fields
        .get("avatar")
        .and_then(Value::as_error)
        .expect("avatar should fail");
    assert_eq!(error.message.as_ref(), "no avatar");
    assert_eq!(
        error.path,
        Some(vec![Key::name("user"), Key::name("avatar")])
    );
}

#[test]
fn catch_replaces_errors_only() {
    let graph = graph(profile());
    let query = Query::new(Selection::fields([
        ("name", Field::at("user.name", Selection::Leaf.catch("?"))),
        ("avatar", Field::at("user.avatar", Selection::Leaf.catch("default.png"))),
    ]));
    let mut results = graph.query(query).unwrap();
    graph.flush().unwrap();
    assert_eq!(
        results.latest(),
        Some(Value::record([
            ("avatar", Value::text("default.png")),
            ("name", Value::text("Ada")),
        ]))
    );
}

#[test]
fn entries_apply_transforms() {
    let graph = graph(profile());
    let query = Query::new(Selection::fields([(
        "scores",
        Field::at("scores", Selection::transformed([map(double())], Selection::Leaf)),
    )]));
    let mut results = graph.query(query).unwrap();
    graph.flush().unwrap();
    assert_eq!(
        results.latest(),
        Some(Value::record([("scores", Value::numbers([6.0, 10.0]))]))
    );
}

#[test]
fn live_queries_follow_state() {
    let graph = graph(profile());
    let mut results = graph
        .query(Query::new(Selection::fields([("age", Field::leaf("user.age"))])))
        .unwrap();
    graph.flush().unwrap();
    assert_eq!(
        results.drain(),
        vec![Value::record([("age", Value::number(36.0))])]
    );

    graph
        .dispatch(state::set(
            state::variable(data::value(36.0)),
            data::value(37.0),
        ))
        .unwrap();
    assert_eq!(
        results.drain(),
        vec![Value::record([("age", Value::number(37.0))])]
    );
}

#[test]
fn deferred_falls_back_while_pending() {
    let senders = Rc::new(RefCell::new(Vec::new()));
    let registered = senders.clone();
    let slow = control::from_stream(StreamFactory::new(move || {
        let (sender, receiver) = mpsc::unbounded::<NodeDefinition>();
        registered.borrow_mut().push(sender);
        receiver.boxed_local()
    }));
    let graph = graph(data::nil());
    let query = Query::new(Selection::Leaf.deferred("loading")).on(slow);
    let mut results = graph.query(query).unwrap();
    graph.flush().unwrap();
    assert_eq!(results.latest(), Some(Value::text("loading")));

    senders
        .borrow()
        .last()
        .expect("stream should be attached")
        .unbounded_send(data::value("ready"))
        .unwrap();
    graph.flush().unwrap();
    assert_eq!(results.latest(), Some(Value::text("ready")));
}

#[test]
fn identical_queries_share_one_resolution() {
    let graph = graph(profile());
    let query = || Query::new(Selection::fields([("name", Field::leaf("user.name"))]));
    let mut first = graph.query(query()).unwrap();
    graph.flush().unwrap();
    let slots = graph.stats().unwrap().slots;

    let mut second = graph.query(query()).unwrap();
    graph.flush().unwrap();
    assert_eq!(graph.stats().unwrap().slots, slots);
    assert_eq!(first.latest(), second.latest());
}

#[test]
fn shorthand_queries() {
    let graph = graph(profile());
    let query = Query::from_json(r#"{"who": "user.name", "user": {"name": true}}"#).unwrap();
    let mut results = graph.query(query).unwrap();
    graph.flush().unwrap();
    assert_eq!(
        results.latest(),
        Some(Value::record([
            ("user", Value::record([("name", Value::text("Ada"))])),
            ("who", Value::text("Ada")),
        ]))
    );
}

#[test]
fn merged_sets_resolve_like_their_parts() {
    let graph = graph(profile());
    let a = Query::new(Selection::fields([("name", Field::leaf("user.name"))]));
    let b = Query::new(Selection::fields([
        ("scores", Field::leaf("scores")),
        ("name", Field::leaf("user.name")),
    ]));
    let merged = merge(&[a.query_set(), b.query_set()]);
    assert_eq!(merged.set.entries.len(), 2);

    let results = graph
        .resolve(weft::query::query_set(profile(), &merged.set))
        .unwrap()
        .to_value()
        .unwrap();
    assert_eq!(
        b.assemble(&weft::query::project(&results, &merged.projections[1])),
        Value::record([
            ("name", Value::text("Ada")),
            ("scores", Value::numbers([3.0, 5.0])),
        ])
    );
}
