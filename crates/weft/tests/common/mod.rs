#![allow(dead_code)]

use weft::nodes::{control, data};
use weft::{Func, Graph, NodeDefinition, Registry, Value};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Graph with the built-in library over `root`.
pub fn graph(root: NodeDefinition) -> Graph {
    init_logger();
    Graph::new(Registry::with_builtins(), root)
}

pub fn numbers(values: impl IntoIterator<Item = f64>) -> Vec<NodeDefinition> {
    values.into_iter().map(data::value).collect()
}

pub fn list_value(values: impl IntoIterator<Item = f64>) -> Value {
    Value::numbers(values)
}

pub fn even() -> NodeDefinition {
    control::rust_fn(Func::values("even", |args| {
        Value::Bool(args[0].as_number().is_some_and(|n| n % 2.0 == 0.0))
    }))
}

pub fn double() -> NodeDefinition {
    control::rust_fn(Func::values("double", |args| {
        Value::number(args[0].as_number().unwrap_or_default() * 2.0)
    }))
}

pub fn below(limit: f64) -> NodeDefinition {
    control::rust_fn(Func::values("below", move |args| {
        Value::Bool(args[0].as_number().is_some_and(|n| n < limit))
    }))
}
