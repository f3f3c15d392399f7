//! Transports: where a pipeline's requests finally go.

use super::pipeline::{ResponseStream, Transport};
use super::request::RemoteRequest;
use crate::graph::Graph;
use futures_util::StreamExt;

/// Serves requests from another graph in the same process.
#[derive(Clone)]
pub struct LoopbackTransport {
    server: Graph,
}

impl LoopbackTransport {
    pub fn new(server: Graph) -> Self {
        Self { server }
    }
}

impl Transport for LoopbackTransport {
    fn call(&self, request: RemoteRequest) -> ResponseStream {
        self.server.serve(request).boxed_local()
    }
}

#[cfg(feature = "json")]
pub use wire::{JsonTransport, LoopbackWire, WireTransport};

#[cfg(feature = "json")]
mod wire {
    use super::super::pipeline::{ResponseStream, Transport};
    use super::super::request::{RemoteRequest, RemoteResponse};
    use crate::graph::Graph;
    use crate::value::{ErrorValue, Value};
    use futures_util::stream::{self, LocalBoxStream};
    use futures_util::{future, StreamExt};

    /// Moves encoded requests and responses. One request string may be
    /// answered by any number of response strings.
    pub trait WireTransport {
        fn send(&self, payload: String) -> LocalBoxStream<'static, String>;
    }

    /// Encodes requests to JSON for a string wire and decodes the replies.
    pub struct JsonTransport<W> {
        wire: W,
    }

    impl<W: WireTransport> JsonTransport<W> {
        pub fn new(wire: W) -> Self {
            Self { wire }
        }
    }

    impl<W: WireTransport> Transport for JsonTransport<W> {
        fn call(&self, request: RemoteRequest) -> ResponseStream {
            let payload = match request.to_json() {
                Ok(payload) => payload,
                Err(error) => {
                    log::warn!("request could not be encoded: {error}");
                    let results = Value::error(ErrorValue::new(error.to_string()).with_code("wire"));
                    return stream::iter([RemoteResponse {
                        correlation_id: request.correlation_id,
                        results,
                    }])
                    .chain(stream::pending())
                    .boxed_local();
                }
            };
            self.wire
                .send(payload)
                .filter_map(|reply| {
                    future::ready(match RemoteResponse::from_json(&reply) {
                        Ok(response) => Some(response),
                        Err(error) => {
                            log::warn!("dropping undecodable response: {error}");
                            None
                        }
                    })
                })
                .boxed_local()
        }
    }

    /// Server end of a string wire backed by a graph in the same process.
    #[derive(Clone)]
    pub struct LoopbackWire {
        server: Graph,
    }

    impl LoopbackWire {
        pub fn new(server: Graph) -> Self {
            Self { server }
        }
    }

    impl WireTransport for LoopbackWire {
        fn send(&self, payload: String) -> LocalBoxStream<'static, String> {
            let request = match RemoteRequest::from_json(&payload) {
                Ok(request) => request,
                Err(error) => {
                    log::warn!("dropping undecodable request: {error}");
                    return stream::empty().boxed_local();
                }
            };
            self.server
                .serve(request)
                .filter_map(|response| {
                    future::ready(match response.to_json() {
                        Ok(reply) => Some(reply),
                        Err(error) => {
                            log::warn!("response could not be encoded: {error}");
                            None
                        }
                    })
                })
                .boxed_local()
        }
    }

}
