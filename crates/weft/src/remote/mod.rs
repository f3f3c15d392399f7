//! Remote proxying: proxy nodes, the middleware pipeline they send
//! QuerySets through, and the transports at its end.

mod fanout;
mod middleware;
mod pipeline;
mod proxy;
mod request;
mod transport;

pub use middleware::{BatchingMiddleware, DedupMiddleware, TaggingMiddleware};
pub use pipeline::{Middleware, Next, Pipeline, ResponseStream, Transport};
pub use proxy::{in_session, proxy, remote, REMOTE, REMOTE_FETCH};
pub use request::{RemoteRequest, RemoteResponse, RequestMetadata};
pub use transport::LoopbackTransport;
#[cfg(feature = "json")]
pub use transport::{JsonTransport, LoopbackWire, WireTransport};

use crate::registry::Registry;

pub(crate) fn register(registry: &mut Registry) {
    proxy::register(registry);
}
