//! Suspendable action bodies.
//!
//! An action body is an explicit state machine: each `resume` either awaits
//! another node or returns. An await becomes an `action_await` node whose
//! only dependency is the awaited node, so suspension is ordinary dependency
//! resolution and a pending await simply leaves the chain pending until the
//! awaited source emits. Failures of the awaited node are handed back to the
//! body at the suspension point, where it may recover.

use super::data;
use crate::address::GraphNode;
use crate::dependency::NodeDependency;
use crate::engine::{DepsContext, RunContext};
use crate::error::NodeError;
use crate::node::{NodeDefinition, Opaque, Prop};
use crate::operation::{OpKind, Operation};
use crate::registry::{NodeType, Outcome, PropKind, Registry};
use crate::value::{ErrorValue, Value};
use std::cell::RefCell;
use std::rc::Rc;

pub const ACTION: &str = "action";
pub const ACTION_AWAIT: &str = "action_await";

/// Input to the next step of a body.
#[derive(Debug, Clone)]
pub enum Resume {
    Start,
    Value(NodeDefinition),
    Error(ErrorValue),
}

#[derive(Debug, Clone)]
pub enum Yield {
    /// Suspend until the node resolves.
    Await(NodeDefinition),
    Return(NodeDefinition),
}

pub trait ActionBody {
    /// An `Err` ends the action with that error.
    fn resume(&mut self, input: Resume) -> Result<Yield, ErrorValue>;
}

impl<F> ActionBody for F
where
    F: FnMut(Resume) -> Result<Yield, ErrorValue>,
{
    fn resume(&mut self, input: Resume) -> Result<Yield, ErrorValue> {
        self(input)
    }
}

type BodyCell = RefCell<Box<dyn ActionBody>>;

/// Creates a fresh body for every run of an `action` node.
pub struct ActionFactory(Box<dyn Fn() -> Box<dyn ActionBody>>);

pub fn action(factory: impl Fn() -> Box<dyn ActionBody> + 'static) -> NodeDefinition {
    NodeDefinition::new(
        ACTION,
        [("body", Prop::Opaque(Opaque::new(ActionFactory(Box::new(factory)))))],
    )
}

fn action_await(body: Rc<BodyCell>, awaited: NodeDefinition, seq: u64) -> NodeDefinition {
    NodeDefinition::new(
        ACTION_AWAIT,
        [
            ("body", Prop::Opaque(Opaque::from_rc(body))),
            ("awaited", Prop::Node(awaited)),
            ("seq", Prop::Value(Value::number(seq as f64))),
        ],
    )
}

fn step(body: Rc<BodyCell>, input: Resume, seq: u64) -> NodeDefinition {
    let result = body.borrow_mut().resume(input);
    match result {
        Ok(Yield::Await(awaited)) => action_await(body, awaited, seq + 1),
        Ok(Yield::Return(output)) => output,
        Err(error) => {
            log::debug!("action body failed: {error}");
            data::error(error)
        }
    }
}

fn action_run(
    cx: &mut RunContext<'_>,
    _op: &Operation,
    _deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let factory = cx.definition().opaque_prop::<ActionFactory>("body")?;
    let body: Rc<BodyCell> = Rc::new(RefCell::new((factory.0)()));
    Ok(Outcome::Done(step(body, Resume::Start, 0)))
}

fn await_deps(cx: &DepsContext<'_>, _op: &Operation) -> Result<Vec<NodeDependency>, NodeError> {
    let awaited = cx.definition().node_prop("awaited")?.clone();
    Ok(vec![NodeDependency::new(awaited)
        .operation(Operation::Resolve)
        .allow_errors()])
}

fn await_run(
    cx: &mut RunContext<'_>,
    _op: &Operation,
    deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let definition = cx.definition();
    let body = definition.opaque_prop::<BodyCell>("body")?;
    let seq = definition.number_prop("seq")? as u64;
    let input = match deps.first() {
        Some(result) => match result.definition.as_error() {
            Some(error) => Resume::Error(error),
            None => Resume::Value(result.definition.clone()),
        },
        None => Resume::Value(data::nil()),
    };
    Ok(Outcome::Done(step(body, input, seq)))
}

pub(crate) fn register(registry: &mut Registry) {
    registry
        .register(
            NodeType::new(ACTION)
                .prop("body", PropKind::Opaque)
                .one_shot()
                .run(OpKind::Evaluate, action_run),
        )
        .register(
            NodeType::new(ACTION_AWAIT)
                .prop("body", PropKind::Opaque)
                .prop("awaited", PropKind::Node)
                .prop("seq", PropKind::Value)
                .one_shot()
                .handler(OpKind::Evaluate, await_deps, await_run),
        );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closures_are_bodies() {
        let mut body = |input: Resume| -> Result<Yield, ErrorValue> {
            match input {
                Resume::Start => Ok(Yield::Await(data::value(1.0))),
                Resume::Value(value) => Ok(Yield::Return(value)),
                Resume::Error(error) => Err(error),
            }
        };
        assert!(matches!(body.resume(Resume::Start), Ok(Yield::Await(_))));
        assert!(body.resume(Resume::Error(ErrorValue::new("x"))).is_err());
    }

    #[test]
    fn step_wraps_failures_as_error_nodes() {
        let failing: Box<dyn ActionBody> =
            Box::new(|_: Resume| Err::<Yield, _>(ErrorValue::new("nope")));
        let output = step(Rc::new(RefCell::new(failing)), Resume::Start, 0);
        assert_eq!(output.as_error().map(|e| e.message), Some("nope".into()));
    }
}
