//! Queries: hierarchical selections, their flat QuerySet form, merging and
//! the executor nodes that resolve them.

mod exec;
mod merge;
mod selection;
mod set;

pub use exec::query_set;
pub use merge::{merge, project, Merged, Projection, Shape};
pub use selection::{Field, Query, Selection};
pub use set::{QuerySet, QuerySetEntry, QuerySetOp, Tolerance};

use crate::graph::Subscription;
use crate::registry::Registry;
use crate::value::{ErrorValue, Value};
use futures_util::Stream;
use pin_project::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};

pub(crate) fn register(registry: &mut Registry) {
    set::register(registry);
    exec::register(registry);
}

/// Assembled results of a live query. Emits whenever the underlying
/// QuerySet result changes.
#[pin_project]
pub struct QuerySubscription {
    #[pin]
    inner: Subscription,
    query: Query,
}

impl QuerySubscription {
    pub(crate) fn new(inner: Subscription, query: Query) -> Self {
        Self { inner, query }
    }

    fn assemble(&self, results: Option<Value>) -> Value {
        match results {
            Some(results) => self.query.assemble(&results),
            None => Value::error(ErrorValue::new("query result is not plain data")),
        }
    }

    /// Latest assembled value, consuming every emission queued so far.
    pub fn latest(&mut self) -> Option<Value> {
        let results = self.inner.latest()?.to_value();
        Some(self.assemble(results))
    }

    /// Every assembled emission queued since the last call.
    pub fn drain(&mut self) -> Vec<Value> {
        self.inner
            .drain()
            .into_iter()
            .map(|definition| self.assemble(definition.to_value()))
            .collect()
    }
}

impl Stream for QuerySubscription {
    type Item = Value;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Value>> {
        let this = self.project();
        match this.inner.poll_next(cx) {
            Poll::Ready(Some(definition)) => Poll::Ready(Some(match definition.to_value() {
                Some(results) => this.query.assemble(&results),
                None => Value::error(ErrorValue::new("query result is not plain data")),
            })),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}
