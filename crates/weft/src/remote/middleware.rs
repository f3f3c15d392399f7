//! Built-in middlewares.

use super::fanout::{Fanout, FanoutStream};
use super::pipeline::{Middleware, Next, ResponseStream};
use super::request::{RemoteRequest, RemoteResponse, RequestMetadata};
use crate::query::{merge, Projection, QuerySet};
use futures_util::{Stream, StreamExt};
use std::cell::RefCell;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::task::{Context, Poll};
use ulid::Ulid;

/// Stamps a correlation id on every request and restores it on every
/// response.
pub struct TaggingMiddleware {
    generate: Box<dyn Fn() -> Arc<str>>,
}

impl TaggingMiddleware {
    /// Tag with ids from `generate` instead of fresh ULIDs.
    pub fn new(generate: impl Fn() -> Arc<str> + 'static) -> Self {
        Self {
            generate: Box::new(generate),
        }
    }
}

impl Default for TaggingMiddleware {
    fn default() -> Self {
        Self::new(|| Ulid::new().to_string().into())
    }
}

impl Middleware for TaggingMiddleware {
    fn call(&self, mut request: RemoteRequest, next: &Next) -> ResponseStream {
        let id = request
            .correlation_id
            .clone()
            .unwrap_or_else(|| (self.generate)());
        request.correlation_id = Some(id.clone());
        next.call(request)
            .map(move |mut response: RemoteResponse| {
                match &response.correlation_id {
                    Some(received) if *received != id => {
                        log::warn!("response tagged `{received}` for request `{id}`");
                    }
                    _ => {}
                }
                response.correlation_id = Some(id.clone());
                response
            })
            .boxed_local()
    }
}

struct Queued {
    request: RemoteRequest,
    next: Next,
    slot: Rc<RefCell<Option<FanoutStream>>>,
}

#[derive(Default)]
struct Batch {
    queue: Vec<Queued>,
}

impl Batch {
    /// Merge everything queued so far, one upstream call per group of
    /// requests with equal metadata. Requests whose stream was dropped
    /// before the batch went out are left out.
    fn flush(&mut self) {
        let queued: Vec<Queued> = std::mem::take(&mut self.queue)
            .into_iter()
            .filter(|item| Rc::strong_count(&item.slot) > 1)
            .collect();
        if queued.is_empty() {
            return;
        }
        let mut groups: Vec<(RequestMetadata, Vec<Queued>)> = Vec::new();
        for item in queued {
            match groups
                .iter_mut()
                .find(|(metadata, _)| *metadata == item.request.metadata)
            {
                Some((_, members)) => members.push(item),
                None => groups.push((item.request.metadata.clone(), vec![item])),
            }
        }
        for (metadata, members) in groups {
            let sets: Vec<QuerySet> = members
                .iter()
                .map(|member| member.request.query_set.clone())
                .collect();
            let merged = merge(&sets);
            log::debug!(
                "batching {} requests into one with {} entries",
                members.len(),
                merged.set.entries.len()
            );
            let request = RemoteRequest {
                correlation_id: members[0].request.correlation_id.clone(),
                query_set: merged.set,
                metadata,
            };
            let fanout = Fanout::new(members[0].next.call(request));
            for (member, projections) in members.into_iter().zip(merged.projections) {
                let stream = Fanout::join(
                    &fanout,
                    member.request.correlation_id.clone(),
                    Some(projections),
                );
                *member.slot.borrow_mut() = Some(stream);
            }
        }
    }
}

/// Collects requests issued before any of their streams is polled (one
/// resolution tick) and sends each compatible group as one merged request.
#[derive(Default)]
pub struct BatchingMiddleware {
    batch: Rc<RefCell<Batch>>,
}

impl BatchingMiddleware {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Middleware for BatchingMiddleware {
    fn call(&self, request: RemoteRequest, next: &Next) -> ResponseStream {
        let slot = Rc::new(RefCell::new(None));
        self.batch.borrow_mut().queue.push(Queued {
            request,
            next: next.clone(),
            slot: slot.clone(),
        });
        Batched {
            batch: self.batch.clone(),
            slot,
        }
        .boxed_local()
    }
}

struct Batched {
    batch: Rc<RefCell<Batch>>,
    slot: Rc<RefCell<Option<FanoutStream>>>,
}

impl Stream for Batched {
    type Item = RemoteResponse;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<RemoteResponse>> {
        if self.slot.borrow().is_none() {
            // Take the queue out first so a re-entrant call can queue again.
            let mut batch = std::mem::take(&mut *self.batch.borrow_mut());
            batch.flush();
        }
        let mut slot = self.slot.borrow_mut();
        match slot.as_mut() {
            Some(stream) => stream.poll_next_unpin(cx),
            None => Poll::Ready(None),
        }
    }
}

struct Flight {
    query_set: QuerySet,
    metadata: RequestMetadata,
    fanout: Weak<RefCell<Fanout>>,
}

impl Flight {
    fn is_live(&self) -> bool {
        self.fanout
            .upgrade()
            .is_some_and(|fanout| fanout.try_borrow().map_or(true, |f| f.is_open()))
    }

    /// Projection serving `query_set` from this flight, when the flight
    /// already asks for every entry of it.
    fn serves(&self, query_set: &QuerySet) -> Option<Option<Vec<Projection>>> {
        if self.query_set == *query_set {
            return Some(None);
        }
        let mut merged = merge(&[self.query_set.clone(), query_set.clone()]);
        (merged.set == self.query_set).then(|| merged.projections.pop())
    }
}

/// Serves a request from a call still in flight when that call already
/// covers it: the same set, or a merged set containing every entry of it.
/// A call stays in flight while anyone listens to it.
#[derive(Default)]
pub struct DedupMiddleware {
    in_flight: RefCell<Vec<Flight>>,
}

impl DedupMiddleware {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Middleware for DedupMiddleware {
    fn call(&self, request: RemoteRequest, next: &Next) -> ResponseStream {
        let mut in_flight = self.in_flight.borrow_mut();
        in_flight.retain(Flight::is_live);
        let shared = in_flight
            .iter()
            .filter(|flight| flight.metadata == request.metadata)
            .find_map(|flight| Some((flight.fanout.upgrade()?, flight.serves(&request.query_set)?)));
        if let Some((fanout, projections)) = shared {
            log::debug!(
                "sharing in-flight request{}",
                if projections.is_some() { " for a subset" } else { "" }
            );
            return Fanout::join(&fanout, request.correlation_id, projections).boxed_local();
        }
        let correlation_id = request.correlation_id.clone();
        let query_set = request.query_set.clone();
        let metadata = request.metadata.clone();
        let fanout = Fanout::new(next.call(request));
        in_flight.push(Flight {
            query_set,
            metadata,
            fanout: Rc::downgrade(&fanout),
        });
        Fanout::join(&fanout, correlation_id, None).boxed_local()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QuerySetEntry;
    use crate::remote::pipeline::{Pipeline, Transport};
    use crate::value::Value;
    use futures_channel::mpsc;
    use futures_util::task::noop_waker_ref;
    use std::cell::Cell;

    /// Answers every request with one result per entry: its position.
    struct Counting {
        calls: Rc<Cell<usize>>,
        last: Rc<RefCell<Option<RemoteRequest>>>,
    }

    impl Transport for Counting {
        fn call(&self, request: RemoteRequest) -> ResponseStream {
            self.calls.set(self.calls.get() + 1);
            let results = Value::list(
                (0..request.query_set.entries.len()).map(|index| Value::number(index as f64)),
            );
            let response = RemoteResponse {
                correlation_id: request.correlation_id.clone(),
                results,
            };
            *self.last.borrow_mut() = Some(request);
            // Stay open like a live subscription.
            let (sender, receiver) = mpsc::unbounded();
            let _ = sender.unbounded_send(response);
            std::mem::forget(sender);
            receiver.boxed_local()
        }
    }

    fn counting() -> (Counting, Rc<Cell<usize>>, Rc<RefCell<Option<RemoteRequest>>>) {
        let calls = Rc::new(Cell::new(0));
        let last = Rc::new(RefCell::new(None));
        (
            Counting {
                calls: calls.clone(),
                last: last.clone(),
            },
            calls,
            last,
        )
    }

    fn request(key: &str) -> RemoteRequest {
        request_all(&[key])
    }

    fn request_all(keys: &[&str]) -> RemoteRequest {
        RemoteRequest::new(QuerySet::new(
            keys.iter()
                .map(|key| QuerySetEntry::child(*key, [QuerySetEntry::value()])),
        ))
    }

    fn poll(stream: &mut ResponseStream) -> Option<RemoteResponse> {
        let mut cx = Context::from_waker(noop_waker_ref());
        match stream.poll_next_unpin(&mut cx) {
            Poll::Ready(item) => item,
            Poll::Pending => None,
        }
    }

    #[test]
    fn tagging_uses_injected_ids() {
        let (transport, _, last) = counting();
        let counter = Rc::new(Cell::new(0));
        let ids = counter.clone();
        let pipeline = Pipeline::new(transport).layer(TaggingMiddleware::new(move || {
            ids.set(ids.get() + 1);
            format!("req-{}", ids.get()).into()
        }));
        let mut stream = pipeline.call(request("a"));
        let response = poll(&mut stream).unwrap();
        assert_eq!(response.correlation_id.as_deref(), Some("req-1"));
        assert_eq!(
            last.borrow().as_ref().and_then(|r| r.correlation_id.clone()).as_deref(),
            Some("req-1")
        );
    }

    #[test]
    fn default_tags_are_ulids() {
        let (transport, _, last) = counting();
        let pipeline = Pipeline::new(transport).layer(TaggingMiddleware::default());
        let mut stream = pipeline.call(request("a"));
        poll(&mut stream);
        let id = last.borrow().as_ref().and_then(|r| r.correlation_id.clone()).unwrap();
        assert!(Ulid::from_string(&id).is_ok());
    }

    #[test]
    fn batching_merges_one_tick() {
        let (transport, calls, last) = counting();
        let pipeline = Pipeline::new(transport).layer(BatchingMiddleware::new());
        let mut a = pipeline.call(request("x"));
        let mut b = pipeline.call(request("y"));
        let mut c = pipeline.call(request("x"));
        assert_eq!(calls.get(), 0);

        let first = poll(&mut a).unwrap();
        assert_eq!(calls.get(), 1);
        assert_eq!(last.borrow().as_ref().map(|r| r.query_set.entries.len()), Some(2));
        assert_eq!(first.results, Value::list([Value::number(0.0)]));
        assert_eq!(poll(&mut b).unwrap().results, Value::list([Value::number(1.0)]));
        assert_eq!(poll(&mut c).unwrap().results, Value::list([Value::number(0.0)]));
    }

    #[test]
    fn batching_keeps_sessions_apart() {
        let (transport, calls, _) = counting();
        let pipeline = Pipeline::new(transport).layer(BatchingMiddleware::new());
        let mut a = pipeline.call(request("x"));
        let mut b = pipeline.call(request("x").with_metadata(RequestMetadata {
            session: Some("other".into()),
            ..RequestMetadata::default()
        }));
        poll(&mut a);
        poll(&mut b);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn dedup_shares_in_flight_calls() {
        let (transport, calls, _) = counting();
        let pipeline = Pipeline::new(transport).layer(DedupMiddleware::new());
        let mut a = pipeline.call(request("x"));
        assert!(poll(&mut a).is_some());
        let mut b = pipeline.call(request("x"));
        assert!(poll(&mut b).is_some());
        assert_eq!(calls.get(), 1);

        drop(a);
        drop(b);
        let mut c = pipeline.call(request("x"));
        poll(&mut c);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn batching_leaves_out_dropped_streams() {
        let (transport, calls, last) = counting();
        let pipeline = Pipeline::new(transport).layer(BatchingMiddleware::new());
        let mut kept = pipeline.call(request("x"));
        let dropped = pipeline.call(request("y"));
        drop(dropped);
        assert_eq!(poll(&mut kept).unwrap().results, Value::list([Value::number(0.0)]));
        assert_eq!(calls.get(), 1);
        assert_eq!(last.borrow().as_ref().map(|r| r.query_set.entries.len()), Some(1));

        // A tick where every stream was dropped sends nothing.
        drop(pipeline.call(request("z")));
        let mut later = pipeline.call(request("w"));
        poll(&mut later);
        assert_eq!(calls.get(), 2);
        assert_eq!(
            last.borrow().as_ref().map(|r| r.query_set.clone()),
            Some(request("w").query_set)
        );
    }

    #[test]
    fn dedup_serves_subsets_of_in_flight_calls() {
        let (transport, calls, _) = counting();
        let pipeline = Pipeline::new(transport).layer(DedupMiddleware::new());
        let mut wide = pipeline.call(request_all(&["x", "y"]));
        assert_eq!(
            poll(&mut wide).unwrap().results,
            Value::list([Value::number(0.0), Value::number(1.0)])
        );

        let mut y = pipeline.call(request("y"));
        assert_eq!(poll(&mut y).unwrap().results, Value::list([Value::number(1.0)]));
        let mut reordered = pipeline.call(request_all(&["y", "x"]));
        assert_eq!(
            poll(&mut reordered).unwrap().results,
            Value::list([Value::number(1.0), Value::number(0.0)])
        );
        assert_eq!(calls.get(), 1);

        let mut other = pipeline.call(request_all(&["x", "z"]));
        poll(&mut other);
        assert_eq!(calls.get(), 2);
        let mut elsewhere = pipeline.call(request("x").with_metadata(RequestMetadata {
            session: Some("other".into()),
            ..RequestMetadata::default()
        }));
        poll(&mut elsewhere);
        assert_eq!(calls.get(), 3);
    }
}
