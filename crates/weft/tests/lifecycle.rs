mod common;

use common::graph;
use futures_channel::mpsc;
use futures_util::StreamExt;
use futures_util::task::noop_waker_ref;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::task::{Context, Poll};
use weft::nodes::action::{action, Resume, Yield};
use weft::nodes::control::{self, StreamFactory};
use weft::nodes::{data, state};
use weft::{ErrorValue, Func, Graph, GraphConfig, NodeDefinition, Registry, Value};

type Senders = Rc<RefCell<Vec<mpsc::UnboundedSender<NodeDefinition>>>>;

fn channel_source() -> (NodeDefinition, Senders) {
    let senders: Senders = Rc::default();
    let registered = senders.clone();
    let source = control::from_stream(StreamFactory::new(move || {
        let (sender, receiver) = mpsc::unbounded();
        registered.borrow_mut().push(sender);
        receiver.boxed_local()
    }));
    (source, senders)
}

#[test]
fn streams_are_torn_down_with_their_last_subscriber() {
    let (source, senders) = channel_source();
    let graph = graph(data::nil());
    let mut watch = graph.subscribe(source).unwrap();
    graph.flush().unwrap();
    assert_eq!(graph.stats().unwrap().streams, 1);

    senders.borrow()[0].unbounded_send(data::value(1.0)).unwrap();
    graph.flush().unwrap();
    assert_eq!(watch.value(), Some(Value::number(1.0)));

    drop(watch);
    graph.flush().unwrap();
    let stats = graph.stats().unwrap();
    assert_eq!(stats.streams, 0);
    assert_eq!(stats.instances, 0);
    assert!(senders.borrow()[0].is_closed());
}

#[test]
fn shared_sources_subscribe_once() {
    let (source, senders) = channel_source();
    let graph = graph(data::nil());
    let first = graph.subscribe(source.clone()).unwrap();
    let second = graph.subscribe(source).unwrap();
    graph.flush().unwrap();
    assert_eq!(senders.borrow().len(), 1);

    drop(first);
    graph.flush().unwrap();
    assert!(!senders.borrow()[0].is_closed());
    drop(second);
    assert!(senders.borrow()[0].is_closed());
}

#[test]
fn actions_recover_from_awaited_failures() {
    let graph = graph(data::nil());
    let body = action(|| {
        Box::new(|input: Resume| -> Result<Yield, ErrorValue> {
            match input {
                Resume::Start => Ok(Yield::Await(data::fail("offline"))),
                Resume::Error(error) => Ok(Yield::Return(data::value(Value::text(format!(
                    "recovered from {}",
                    error.message
                ))))),
                Resume::Value(_) => Ok(Yield::Return(data::value("unreachable"))),
            }
        })
    });
    let result = graph.dispatch(body).unwrap();
    assert_eq!(
        result.to_value(),
        Some(Value::text("recovered from offline"))
    );
}

#[test]
fn actions_chain_awaits() {
    let counter = state::variable(data::value(4.0));
    let graph = graph(data::nil());
    let _held = graph.subscribe(counter.clone()).unwrap();
    graph.flush().unwrap();

    let target = counter.clone();
    let body = action(move || {
        let target = target.clone();
        let mut read = None;
        Box::new(move |input: Resume| -> Result<Yield, ErrorValue> {
            match input {
                Resume::Start => Ok(Yield::Await(target.clone())),
                Resume::Value(value) if read.is_none() => {
                    let current = value.to_value().and_then(|v| v.as_number());
                    let next = current.unwrap_or_default() + 1.0;
                    read = Some(next);
                    Ok(Yield::Await(state::set(target.clone(), data::value(next))))
                }
                Resume::Value(_) => Ok(Yield::Return(data::value(read.unwrap_or_default()))),
                Resume::Error(error) => Err(error),
            }
        })
    });
    let result = graph.dispatch(body).unwrap();
    assert_eq!(result.to_value(), Some(Value::number(5.0)));
    assert_eq!(graph.resolve(counter).unwrap().to_value(), Some(Value::number(5.0)));
}

#[test]
fn failing_bodies_end_in_errors() {
    let graph = graph(data::nil());
    let body = action(|| {
        Box::new(|_: Resume| -> Result<Yield, ErrorValue> { Err(ErrorValue::new("refused")) })
    });
    let result = graph.dispatch(body).unwrap();
    assert_eq!(
        result.as_error().map(|error| error.message.to_string()),
        Some("refused".to_string())
    );
}

#[test]
fn catch_binds_the_error() {
    let graph = graph(data::nil());
    let caught = control::catch_error(data::fail("broken"), control::lookup("error"));
    let result = graph.resolve(caught).unwrap();
    assert_eq!(
        result.as_error().map(|error| error.message.to_string()),
        Some("broken".to_string())
    );

    let fallback = control::catch_error(data::fail("broken"), data::value("fine"));
    assert_eq!(
        graph.resolve(fallback).unwrap().to_value(),
        Some(Value::text("fine"))
    );
    let passthrough = control::catch_error(data::value(1.0), data::value("fine"));
    assert_eq!(
        graph.resolve(passthrough).unwrap().to_value(),
        Some(Value::number(1.0))
    );
}

#[test]
fn events_update_listeners() {
    let graph = graph(data::nil());
    let mut ticks = graph
        .subscribe(control::event("tick", data::value(0.0)))
        .unwrap();
    graph.flush().unwrap();
    assert_eq!(ticks.value(), Some(Value::number(0.0)));

    graph.emit_event("tick", data::value(1.0)).unwrap();
    graph.flush().unwrap();
    assert_eq!(ticks.value(), Some(Value::number(1.0)));

    graph.emit_event("other", data::value(2.0)).unwrap();
    graph.flush().unwrap();
    assert!(ticks.drain().is_empty());
}

#[test]
fn invalidation_restarts_streams() {
    let created = Rc::new(Cell::new(0));
    let counter = created.clone();
    let source = control::from_stream(StreamFactory::new(move || {
        counter.set(counter.get() + 1);
        futures_util::stream::iter([data::value(counter.get() as f64)]).boxed_local()
    }));
    let graph = graph(data::nil());
    let mut watch = graph
        .subscribe(control::invalidate_on("refresh", source.clone()))
        .unwrap();
    graph.flush().unwrap();
    assert_eq!(watch.value(), Some(Value::number(1.0)));

    graph.emit_event("refresh", data::nil()).unwrap();
    graph.flush().unwrap();
    assert_eq!(created.get(), 2);
    assert_eq!(watch.value(), Some(Value::number(2.0)));

    graph.invalidate(source).unwrap();
    graph.flush().unwrap();
    assert_eq!(created.get(), 3);
    assert_eq!(watch.value(), Some(Value::number(3.0)));
}

#[test]
fn driver_completes_when_sources_finish() {
    let source = control::from_stream(StreamFactory::new(|| {
        futures_util::stream::iter([data::value(1.0), data::value(2.0)]).boxed_local()
    }));
    let graph = graph(data::nil());
    let mut watch = graph.subscribe(source).unwrap();
    let mut driver = std::pin::pin!(graph.driver());
    let mut cx = Context::from_waker(noop_waker_ref());
    assert!(matches!(driver.as_mut().poll(&mut cx), Poll::Ready(Ok(()))));
    assert_eq!(watch.value(), Some(Value::number(2.0)));
    assert_eq!(graph.stats().unwrap().streams, 0);
}

#[test]
fn deep_dependency_chains_hit_the_depth_limit() {
    common::init_logger();
    let config = GraphConfig {
        depth_limit: 16,
        ..GraphConfig::default()
    };
    let graph = Graph::with_config(Registry::with_builtins(), data::nil(), config);
    let increment = control::rust_fn(Func::values("increment", |args| {
        Value::number(args[0].as_number().unwrap_or_default() + 1.0)
    }));
    let shallow = control::apply(increment.clone(), [data::value(0.0)]);
    assert_eq!(
        graph.resolve(shallow).unwrap().to_value(),
        Some(Value::number(1.0))
    );

    let deep = (0..64).fold(data::value(0.0), |inner, _| {
        control::apply(increment.clone(), [inner])
    });
    let result = graph.resolve(deep).unwrap();
    let error = result.as_error().expect("a step-limit error");
    assert_eq!(error.code.as_deref(), Some("step_limit"));
}
