mod common;

use common::graph;
use std::cell::Cell;
use std::rc::Rc;
use weft::nodes::control::reference;
use weft::nodes::{data, state};
use weft::query::Field;
use weft::remote::{
    proxy, BatchingMiddleware, DedupMiddleware, JsonTransport, LoopbackTransport, LoopbackWire,
    Pipeline, RemoteRequest, ResponseStream, TaggingMiddleware, Transport,
};
use weft::{Graph, Key, NodeDefinition, Query, Selection, Value};

fn server_root() -> NodeDefinition {
    data::record([(
        "user",
        data::record([
            ("name", data::value("Ada")),
            ("age", state::variable(data::value(36.0))),
            ("avatar", data::fail("no avatar")),
        ]),
    )])
}

/// Counts calls reaching the end of the pipeline.
struct Counted<T> {
    inner: T,
    calls: Rc<Cell<usize>>,
}

impl<T: Transport> Transport for Counted<T> {
    fn call(&self, request: RemoteRequest) -> ResponseStream {
        self.calls.set(self.calls.get() + 1);
        self.inner.call(request)
    }
}

struct Setup {
    server: Graph,
    client: Graph,
    calls: Rc<Cell<usize>>,
}

fn setup(wire: bool) -> Setup {
    let server = graph(server_root());
    let calls = Rc::new(Cell::new(0));
    let pipeline = if wire {
        Pipeline::new(Counted {
            inner: JsonTransport::new(LoopbackWire::new(server.clone())),
            calls: calls.clone(),
        })
    } else {
        Pipeline::new(Counted {
            inner: LoopbackTransport::new(server.clone()),
            calls: calls.clone(),
        })
    };
    let pipeline = pipeline
        .layer(TaggingMiddleware::default())
        .layer(BatchingMiddleware::new())
        .layer(DedupMiddleware::new());
    let client = graph(proxy(&pipeline));
    Setup {
        server,
        client,
        calls,
    }
}

fn name_query() -> Query {
    Query::new(Selection::fields([("name", Field::leaf("user.name"))]))
}

fn age_query() -> Query {
    Query::new(Selection::fields([("age", Field::leaf("user.age"))]))
}

#[test]
fn identical_queries_make_one_call() {
    let Setup { client, calls, .. } = setup(false);
    let mut a = client.query(name_query()).unwrap();
    let mut b = client.query(name_query()).unwrap();
    client.flush().unwrap();
    assert_eq!(calls.get(), 1);
    let expected = Value::record([("name", Value::text("Ada"))]);
    assert_eq!(a.latest(), Some(expected.clone()));
    assert_eq!(b.latest(), Some(expected.clone()));

    drop(a);
    client.flush().unwrap();
    assert_eq!(b.latest(), Some(expected));
    assert_eq!(calls.get(), 1);
}

#[test]
fn one_tick_is_batched_into_one_call() {
    let Setup { client, calls, .. } = setup(false);
    let mut name = client.query(name_query()).unwrap();
    let mut age = client.query(age_query()).unwrap();
    client.flush().unwrap();
    assert_eq!(calls.get(), 1);
    assert_eq!(
        name.latest(),
        Some(Value::record([("name", Value::text("Ada"))]))
    );
    assert_eq!(
        age.latest(),
        Some(Value::record([("age", Value::number(36.0))]))
    );
}

#[test]
fn narrower_queries_ride_a_live_wider_call() {
    let Setup { client, calls, .. } = setup(false);
    let mut both = client
        .query(Query::new(Selection::fields([
            ("name", Field::leaf("user.name")),
            ("age", Field::leaf("user.age")),
        ])))
        .unwrap();
    client.flush().unwrap();
    assert!(both.latest().is_some());
    assert_eq!(calls.get(), 1);

    let mut name = client.query(name_query()).unwrap();
    client.flush().unwrap();
    assert_eq!(
        name.latest(),
        Some(Value::record([("name", Value::text("Ada"))]))
    );
    assert_eq!(calls.get(), 1);
}

#[test]
fn requerying_costs_nothing() {
    let Setup { client, calls, .. } = setup(false);
    let mut first = client.query(name_query()).unwrap();
    client.flush().unwrap();
    let before = first.latest();

    let mut again = client.query(name_query()).unwrap();
    client.flush().unwrap();
    client.flush().unwrap();
    assert_eq!(again.latest(), before);
    assert_eq!(calls.get(), 1);
}

#[test]
fn server_changes_stream_to_the_client() {
    let Setup {
        server,
        client,
        calls,
    } = setup(false);
    let mut name = client.query(name_query()).unwrap();
    let mut age = client.query(age_query()).unwrap();
    client.flush().unwrap();
    name.drain();
    age.drain();

    server
        .dispatch(state::set(
            state::variable(data::value(36.0)),
            data::value(37.0),
        ))
        .unwrap();
    client.flush().unwrap();
    assert_eq!(
        age.drain(),
        vec![Value::record([("age", Value::number(37.0))])]
    );
    assert!(name.drain().is_empty());
    assert_eq!(calls.get(), 1);
}

#[test]
fn unsubscribing_one_keeps_the_other() {
    let Setup {
        server,
        client,
        calls,
    } = setup(false);
    let name = client.query(name_query()).unwrap();
    let mut age = client.query(age_query()).unwrap();
    client.flush().unwrap();
    drop(name);
    client.flush().unwrap();

    server
        .dispatch(state::set(
            state::variable(data::value(36.0)),
            data::value(40.0),
        ))
        .unwrap();
    client.flush().unwrap();
    assert_eq!(
        age.latest(),
        Some(Value::record([("age", Value::number(40.0))]))
    );
    assert_eq!(calls.get(), 1);
}

#[test]
fn errors_cross_the_wire_with_paths() {
    let Setup { client, .. } = setup(true);
    let query = Query::new(Selection::fields([
        ("name", Field::leaf("user.name")),
        ("avatar", Field::leaf("user.avatar")),
    ]));
    let mut results = client.query(query).unwrap();
    client.flush().unwrap();
    let Some(Value::Record(fields)) = results.latest() else {
        panic!("expected a record");
    };
    assert_eq!(fields.get("name"), Some(&Value::text("Ada")));
    let error = fields.get("avatar").and_then(Value::as_error).unwrap();
    assert_eq!(error.message.as_ref(), "no avatar");
    assert_eq!(
        error.path,
        Some(vec![Key::name("user"), Key::name("avatar")])
    );
}

#[test]
fn wire_and_loopback_agree() {
    let query = || {
        Query::new(Selection::fields([
            ("name", Field::leaf("user.name")),
            ("age", Field::leaf("user.age")),
        ]))
    };
    let loopback = setup(false);
    let wire = setup(true);
    let mut direct = loopback.client.query(query()).unwrap();
    let mut encoded = wire.client.query(query()).unwrap();
    loopback.client.flush().unwrap();
    wire.client.flush().unwrap();
    assert!(direct.latest().is_some());
    assert_eq!(direct.latest(), encoded.latest());
}

#[test]
fn proxied_paths_resolve_through_the_pipeline() {
    let Setup { client, calls, .. } = setup(false);
    let mut name = client.subscribe(reference("user.name")).unwrap();
    client.flush().unwrap();
    assert_eq!(name.value(), Some(Value::text("Ada")));
    assert_eq!(calls.get(), 1);
}
