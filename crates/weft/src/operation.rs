//! Operations: typed, value-comparable requests for a node capability.

use crate::node::NodeDefinition;
use crate::query::QuerySet;
use crate::value::Key;
use std::fmt;
use std::rc::Rc;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Evaluate,
    /// Deep resolution into static data. Handled by the engine for every node.
    Resolve,
    Call(Rc<Vec<NodeDefinition>>),
    Set(NodeDefinition),
    Reset,
    GetChild(Key),
    GetItems,
    Length,
    /// Eager transformation of already materialized items.
    TransformItems(Rc<Vec<NodeDefinition>>),
    Init,
    Step {
        acc: NodeDefinition,
        item: NodeDefinition,
    },
    Result(NodeDefinition),
    /// Start a lazy traversal; yields a cursor supporting `Next`.
    Iterate,
    Next,
    Push(Rc<Vec<NodeDefinition>>),
    Pop,
    Shift,
    Unshift(Rc<Vec<NodeDefinition>>),
    Clear,
    Query(Rc<QuerySet>),
}

/// Operation identity without arguments; the key of a node type's handler map.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OpKind {
    Evaluate,
    Resolve,
    Call,
    Set,
    Reset,
    GetChild,
    GetItems,
    Length,
    TransformItems,
    Init,
    Step,
    Result,
    Iterate,
    Next,
    Push,
    Pop,
    Shift,
    Unshift,
    Clear,
    Query,
}

impl OpKind {
    pub fn name(self) -> &'static str {
        match self {
            OpKind::Evaluate => "evaluate",
            OpKind::Resolve => "resolve",
            OpKind::Call => "call",
            OpKind::Set => "set",
            OpKind::Reset => "reset",
            OpKind::GetChild => "getChild",
            OpKind::GetItems => "getItems",
            OpKind::Length => "length",
            OpKind::TransformItems => "transformItems",
            OpKind::Init => "init",
            OpKind::Step => "step",
            OpKind::Result => "result",
            OpKind::Iterate => "iterate",
            OpKind::Next => "next",
            OpKind::Push => "push",
            OpKind::Pop => "pop",
            OpKind::Shift => "shift",
            OpKind::Unshift => "unshift",
            OpKind::Clear => "clear",
            OpKind::Query => "query",
        }
    }

    /// Mutations run at most once per slot and are never recomputed.
    pub fn is_mutation(self) -> bool {
        matches!(
            self,
            OpKind::Set
                | OpKind::Reset
                | OpKind::Push
                | OpKind::Pop
                | OpKind::Shift
                | OpKind::Unshift
                | OpKind::Clear
        )
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Operation {
    pub fn call(args: impl IntoIterator<Item = NodeDefinition>) -> Self {
        Operation::Call(Rc::new(args.into_iter().collect()))
    }

    pub fn push(items: impl IntoIterator<Item = NodeDefinition>) -> Self {
        Operation::Push(Rc::new(items.into_iter().collect()))
    }

    pub fn unshift(items: impl IntoIterator<Item = NodeDefinition>) -> Self {
        Operation::Unshift(Rc::new(items.into_iter().collect()))
    }

    pub fn transform_items(items: impl IntoIterator<Item = NodeDefinition>) -> Self {
        Operation::TransformItems(Rc::new(items.into_iter().collect()))
    }

    pub fn kind(&self) -> OpKind {
        match self {
            Operation::Evaluate => OpKind::Evaluate,
            Operation::Resolve => OpKind::Resolve,
            Operation::Call(_) => OpKind::Call,
            Operation::Set(_) => OpKind::Set,
            Operation::Reset => OpKind::Reset,
            Operation::GetChild(_) => OpKind::GetChild,
            Operation::GetItems => OpKind::GetItems,
            Operation::Length => OpKind::Length,
            Operation::TransformItems(_) => OpKind::TransformItems,
            Operation::Init => OpKind::Init,
            Operation::Step { .. } => OpKind::Step,
            Operation::Result(_) => OpKind::Result,
            Operation::Iterate => OpKind::Iterate,
            Operation::Next => OpKind::Next,
            Operation::Push(_) => OpKind::Push,
            Operation::Pop => OpKind::Pop,
            Operation::Shift => OpKind::Shift,
            Operation::Unshift(_) => OpKind::Unshift,
            Operation::Clear => OpKind::Clear,
            Operation::Query(_) => OpKind::Query,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    pub fn is_mutation(&self) -> bool {
        self.kind().is_mutation()
    }
}
