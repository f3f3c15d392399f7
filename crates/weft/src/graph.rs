//! Host-facing handle over one engine.
//!
//! `Graph` is a cheap clone of a shared, single-threaded engine. Host calls
//! borrow the engine for the duration of the call; subscriptions dropped
//! while it is borrowed release their slot on the next tick instead.

use crate::arena::SlotId;
use crate::config::GraphConfig;
use crate::engine::{Engine, EngineStats};
use crate::error::GraphError;
use crate::node::NodeDefinition;
use crate::operation::Operation;
use crate::query::{query_set, Query, QuerySubscription};
use crate::registry::Registry;
use crate::remote::{RemoteRequest, RemoteResponse};
use crate::value::Value;
use futures_channel::mpsc;
use futures_util::task::noop_waker_ref;
use futures_util::{Stream, StreamExt};
use pin_project::pin_project;
use std::cell::{RefCell, RefMut};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll};

struct Shared {
    engine: RefCell<Engine>,
    deferred: RefCell<Vec<(SlotId, u64)>>,
}

#[derive(Clone)]
pub struct Graph(Rc<Shared>);

impl Graph {
    pub fn new(registry: Registry, root: NodeDefinition) -> Self {
        Self::with_config(registry, root, GraphConfig::default())
    }

    pub fn with_config(registry: Registry, root: NodeDefinition, config: GraphConfig) -> Self {
        Self(Rc::new(Shared {
            engine: RefCell::new(Engine::new(Rc::new(registry), root, config)),
            deferred: RefCell::new(Vec::new()),
        }))
    }

    fn engine(&self) -> Result<RefMut<'_, Engine>, GraphError> {
        self.0.engine.try_borrow_mut().map_err(|_| GraphError::Busy)
    }

    /// Live deep resolution of `definition` in the root scope.
    pub fn subscribe(&self, definition: NodeDefinition) -> Result<Subscription, GraphError> {
        self.subscribe_with(definition, Operation::Resolve)
    }

    pub fn subscribe_with(
        &self,
        definition: NodeDefinition,
        operation: Operation,
    ) -> Result<Subscription, GraphError> {
        let (slot, id, receiver) = {
            let mut engine = self.engine()?;
            let node = engine.root_node(definition);
            engine.subscribe(node, operation)?
        };
        Ok(Subscription {
            graph: self.clone(),
            slot,
            id,
            receiver,
            latest: None,
        })
    }

    /// One-off resolution. The result may be pending when it waits on a
    /// source that has not produced anything yet.
    pub fn resolve(&self, definition: NodeDefinition) -> Result<NodeDefinition, GraphError> {
        let mut subscription = self.subscribe(definition)?;
        self.flush()?;
        subscription
            .latest()
            .ok_or_else(|| GraphError::Unsettled("no result after flush".into()))
    }

    /// Run a mutation or action once and return its settled result.
    pub fn dispatch(&self, action: NodeDefinition) -> Result<NodeDefinition, GraphError> {
        let mut subscription = self.subscribe(action)?;
        self.flush()?;
        let result = subscription.latest();
        drop(subscription);
        self.engine()?.sweep();
        match result {
            Some(result) if result.is_pending() => {
                Err(GraphError::Unsettled("result is still pending".into()))
            }
            Some(result) => Ok(result),
            None => Err(GraphError::Unsettled("no result after flush".into())),
        }
    }

    /// Force every slot of `definition` in the root scope to recompute.
    pub fn invalidate(&self, definition: NodeDefinition) -> Result<(), GraphError> {
        let mut engine = self.engine()?;
        let node = engine.root_node(definition);
        engine.invalidate(&node);
        Ok(())
    }

    /// Emit a root-scope event.
    pub fn emit_event(&self, name: &str, payload: NodeDefinition) -> Result<(), GraphError> {
        let mut engine = self.engine()?;
        let scope = engine.scopes.root();
        engine.emit_event(scope, name, payload);
        Ok(())
    }

    pub fn stats(&self) -> Result<EngineStats, GraphError> {
        Ok(self.engine()?.stats())
    }

    /// Live query against its target, or against the root when it has none.
    pub fn query(&self, query: Query) -> Result<QuerySubscription, GraphError> {
        let target = self.target(query.target.clone())?;
        let subscription = self.subscribe(query_set(target, &query.query_set()))?;
        Ok(QuerySubscription::new(subscription, query))
    }

    fn target(&self, target: Option<NodeDefinition>) -> Result<NodeDefinition, GraphError> {
        if let Some(target) = target {
            return Ok(target);
        }
        let engine = self.engine()?;
        let root = engine.scopes.scope_root(engine.scopes.root())?;
        Ok(root.definition)
    }

    /// Answer a remote request against the root. Each poll flushes this
    /// graph, so the stream yields a response whenever the results change.
    pub fn serve(&self, request: RemoteRequest) -> ServeStream {
        let RemoteRequest {
            correlation_id,
            query_set: set,
            metadata,
        } = request;
        let subscription = self
            .target(None)
            .and_then(|root| self.subscribe(query_set(root, &set)));
        if let Err(error) = &subscription {
            log::warn!("cannot serve request: {error}");
        }
        ServeStream {
            graph: self.clone(),
            subscription: subscription.ok(),
            correlation_id,
            allow_pending: metadata.tolerance.allow_pending,
        }
    }

    /// Poll every attached source and stabilize until nothing changes.
    pub fn flush(&self) -> Result<(), GraphError> {
        let mut cx = Context::from_waker(noop_waker_ref());
        while self.tick(&mut cx)? {}
        Ok(())
    }

    /// Future keeping the graph up to date with its sources. Completes once
    /// no source stream is attached.
    pub fn driver(&self) -> Driver {
        Driver {
            graph: self.clone(),
        }
    }

    fn release(&self, slot: SlotId, id: u64) {
        match self.0.engine.try_borrow_mut() {
            Ok(mut engine) => engine.release(slot, id),
            Err(_) => self.0.deferred.borrow_mut().push((slot, id)),
        }
    }

    /// Stabilize, then poll sources once. Returns whether any source produced
    /// an item, i.e. whether another tick is needed.
    fn tick(&self, cx: &mut Context<'_>) -> Result<bool, GraphError> {
        let mut streams = {
            let mut engine = self.engine()?;
            let deferred = std::mem::take(&mut *self.0.deferred.borrow_mut());
            for (slot, id) in deferred {
                engine.release(slot, id);
            }
            engine.stabilize();
            std::mem::take(&mut engine.streams)
        };
        if streams.is_empty() {
            return Ok(false);
        }
        // Sources may poll other graphs, or this one, while the engine is free.
        let mut items = Vec::new();
        streams.retain_mut(|source| loop {
            match source.stream.poll_next_unpin(cx) {
                Poll::Ready(Some(item)) => items.push((source.node.clone(), item)),
                Poll::Ready(None) => {
                    log::debug!("source of {:?} finished", source.node);
                    break false;
                }
                Poll::Pending => break true,
            }
        });
        let mut engine = self.engine()?;
        streams.retain(|source| engine.has_instance(&source.node));
        let attached = std::mem::take(&mut engine.streams);
        streams.extend(attached);
        engine.streams = streams;
        let received = !items.is_empty();
        for (node, item) in items {
            engine.push_source(&node, item);
        }
        Ok(received)
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.engine.try_borrow() {
            Ok(engine) => f.debug_tuple("Graph").field(&engine.stats()).finish(),
            Err(_) => f.write_str("Graph(<busy>)"),
        }
    }
}

/// See [`Graph::driver`].
pub struct Driver {
    graph: Graph,
}

impl Future for Driver {
    type Output = Result<(), GraphError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        loop {
            match self.graph.tick(cx) {
                Err(error) => return Poll::Ready(Err(error)),
                Ok(true) => continue,
                Ok(false) => break,
            }
        }
        match self.graph.engine() {
            Ok(engine) if engine.streams.is_empty() => Poll::Ready(Ok(())),
            Ok(_) => Poll::Pending,
            Err(error) => Poll::Ready(Err(error)),
        }
    }
}

/// Host subscription to one (node, operation) slot. Emits each distinct
/// result; dropping it releases the slot and everything only it kept alive.
pub struct Subscription {
    graph: Graph,
    slot: SlotId,
    id: u64,
    receiver: mpsc::UnboundedReceiver<NodeDefinition>,
    latest: Option<NodeDefinition>,
}

impl Subscription {
    /// Most recent result, consuming every emission queued so far.
    pub fn latest(&mut self) -> Option<NodeDefinition> {
        self.drain();
        self.latest.clone()
    }

    /// Every emission queued since the last call, oldest first.
    pub fn drain(&mut self) -> Vec<NodeDefinition> {
        let mut cx = Context::from_waker(noop_waker_ref());
        let mut out = Vec::new();
        while let Poll::Ready(Some(item)) = self.receiver.poll_next_unpin(&mut cx) {
            out.push(item);
        }
        if let Some(last) = out.last() {
            self.latest = Some(last.clone());
        }
        out
    }

    /// Latest result as plain data.
    pub fn value(&mut self) -> Option<Value> {
        self.latest()?.to_value()
    }
}

impl Stream for Subscription {
    type Item = NodeDefinition;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<NodeDefinition>> {
        let polled = self.receiver.poll_next_unpin(cx);
        if let Poll::Ready(Some(item)) = &polled {
            self.latest = Some(item.clone());
        }
        polled
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.graph.release(self.slot, self.id);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("slot", &self.slot)
            .field("id", &self.id)
            .field("latest", &self.latest)
            .finish()
    }
}

/// Response stream of [`Graph::serve`].
#[pin_project]
pub struct ServeStream {
    graph: Graph,
    #[pin]
    subscription: Option<Subscription>,
    correlation_id: Option<Arc<str>>,
    allow_pending: bool,
}

impl Stream for ServeStream {
    type Item = RemoteResponse;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<RemoteResponse>> {
        let mut this = self.project();
        if let Err(error) = this.graph.flush() {
            log::debug!("serve could not flush: {error}");
        }
        let Some(mut subscription) = this.subscription.as_mut().as_pin_mut() else {
            return Poll::Ready(None);
        };
        loop {
            let definition = match subscription.as_mut().poll_next(cx) {
                Poll::Ready(Some(definition)) => definition,
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            };
            if definition.is_pending() && !*this.allow_pending {
                continue;
            }
            let Some(results) = definition.to_value() else {
                log::warn!("query result of tag `{}` is not plain data", definition.tag());
                continue;
            };
            return Poll::Ready(Some(RemoteResponse {
                correlation_id: this.correlation_id.clone(),
                results,
            }));
        }
    }
}
