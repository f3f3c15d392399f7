//! Middleware pipeline ending in a transport.
//!
//! Layers run outermost first: the first layer added sees every request
//! before the rest of the chain does.

use super::request::{RemoteRequest, RemoteResponse};
use crate::error::NodeError;
use crate::node::{NodeDefinition, Opaque, Prop};
use futures_util::stream::LocalBoxStream;
use std::rc::Rc;

pub type ResponseStream = LocalBoxStream<'static, RemoteResponse>;

/// Delivers a request to the remote side. A transport may answer with any
/// number of responses; the stream stays open for as long as the remote
/// keeps pushing.
pub trait Transport {
    fn call(&self, request: RemoteRequest) -> ResponseStream;
}

pub trait Middleware {
    fn call(&self, request: RemoteRequest, next: &Next) -> ResponseStream;
}

#[derive(Clone)]
struct Chain {
    layers: Vec<Rc<dyn Middleware>>,
    transport: Rc<dyn Transport>,
}

/// The remainder of the pipeline after the current layer.
#[derive(Clone)]
pub struct Next {
    chain: Rc<Chain>,
    index: usize,
}

impl Next {
    pub fn call(&self, request: RemoteRequest) -> ResponseStream {
        match self.chain.layers.get(self.index) {
            Some(layer) => {
                let next = Next {
                    chain: self.chain.clone(),
                    index: self.index + 1,
                };
                layer.call(request, &next)
            }
            None => self.chain.transport.call(request),
        }
    }
}

/// Shared handle; clones refer to the same chain, and proxy nodes built from
/// the same pipeline compare equal.
#[derive(Clone)]
pub struct Pipeline(Rc<Chain>);

impl Pipeline {
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self(Rc::new(Chain {
            layers: Vec::new(),
            transport: Rc::new(transport),
        }))
    }

    pub fn layer(mut self, middleware: impl Middleware + 'static) -> Self {
        Rc::make_mut(&mut self.0).layers.push(Rc::new(middleware));
        self
    }

    pub fn call(&self, request: RemoteRequest) -> ResponseStream {
        Next {
            chain: self.0.clone(),
            index: 0,
        }
        .call(request)
    }

    /// Prop value identifying this pipeline inside a definition.
    pub(crate) fn to_prop(&self) -> Prop {
        Prop::Opaque(Opaque::from_rc(self.0.clone()))
    }

    pub(crate) fn from_prop(definition: &NodeDefinition) -> Result<Self, NodeError> {
        definition.opaque_prop::<Chain>("pipeline").map(Self)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("layers", &self.0.layers.len())
            .finish()
    }
}
