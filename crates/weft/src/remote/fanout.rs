//! One upstream response stream shared by several downstream requesters.
//!
//! Whoever polls a member stream drives the upstream; every response is
//! rewritten for each member (its correlation id and, for merged requests,
//! its projection) and queued on the member's channel.

use super::pipeline::ResponseStream;
use super::request::RemoteResponse;
use crate::query::{project, Projection};
use futures_channel::mpsc;
use futures_util::{Stream, StreamExt};
use std::cell::RefCell;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll};

struct Member {
    sender: mpsc::UnboundedSender<RemoteResponse>,
    correlation_id: Option<Arc<str>>,
    projections: Option<Vec<Projection>>,
}

impl Member {
    fn deliver(&self, response: &RemoteResponse) {
        let results = match &self.projections {
            Some(projections) => project(&response.results, projections),
            None => response.results.clone(),
        };
        let response = RemoteResponse {
            correlation_id: self.correlation_id.clone(),
            results,
        };
        // A closed channel only means the member was dropped.
        let _ = self.sender.unbounded_send(response);
    }
}

pub(crate) struct Fanout {
    upstream: Option<ResponseStream>,
    last: Option<RemoteResponse>,
    members: Vec<Member>,
}

impl Fanout {
    pub fn new(upstream: ResponseStream) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            upstream: Some(upstream),
            last: None,
            members: Vec::new(),
        }))
    }

    /// Add a member. It immediately receives the latest response, if any.
    pub fn join(
        this: &Rc<RefCell<Self>>,
        correlation_id: Option<Arc<str>>,
        projections: Option<Vec<Projection>>,
    ) -> FanoutStream {
        let (sender, receiver) = mpsc::unbounded();
        let member = Member {
            sender,
            correlation_id,
            projections,
        };
        let mut fanout = this.borrow_mut();
        if let Some(last) = &fanout.last {
            member.deliver(last);
        }
        if fanout.upstream.is_some() {
            fanout.members.push(member);
        }
        FanoutStream {
            fanout: this.clone(),
            receiver,
        }
    }

    pub fn is_open(&self) -> bool {
        self.upstream.is_some()
    }

    fn pump(&mut self, cx: &mut Context<'_>) {
        let Some(upstream) = self.upstream.as_mut() else {
            return;
        };
        loop {
            match upstream.poll_next_unpin(cx) {
                Poll::Ready(Some(response)) => {
                    self.members.retain(|member| !member.sender.is_closed());
                    for member in &self.members {
                        member.deliver(&response);
                    }
                    self.last = Some(response);
                }
                Poll::Ready(None) => {
                    self.upstream = None;
                    // Dropping the senders ends every member stream.
                    self.members.clear();
                    return;
                }
                Poll::Pending => return,
            }
        }
    }
}

pub(crate) struct FanoutStream {
    fanout: Rc<RefCell<Fanout>>,
    receiver: mpsc::UnboundedReceiver<RemoteResponse>,
}

impl Stream for FanoutStream {
    type Item = RemoteResponse;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<RemoteResponse>> {
        // The upstream may be polled re-entrantly by another member's
        // transport; skip driving it then, the other poll delivers.
        if let Ok(mut fanout) = self.fanout.try_borrow_mut() {
            fanout.pump(cx);
        }
        self.receiver.poll_next_unpin(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use futures_util::stream;
    use futures_util::task::noop_waker_ref;

    fn response(n: f64) -> RemoteResponse {
        RemoteResponse {
            correlation_id: Some("upstream".into()),
            results: Value::list([Value::number(n)]),
        }
    }

    #[test]
    fn members_share_one_upstream() {
        let fanout = Fanout::new(stream::iter([response(1.0)]).chain(stream::pending()).boxed_local());
        let mut a = Fanout::join(&fanout, Some("a".into()), None);
        let mut cx = Context::from_waker(noop_waker_ref());
        let Poll::Ready(Some(first)) = a.poll_next_unpin(&mut cx) else {
            panic!("expected a response");
        };
        assert_eq!(first.correlation_id.as_deref(), Some("a"));

        // Late joiners replay the latest response under their own id.
        let mut b = Fanout::join(&fanout, Some("b".into()), None);
        let Poll::Ready(Some(replayed)) = b.poll_next_unpin(&mut cx) else {
            panic!("expected a replay");
        };
        assert_eq!(replayed.correlation_id.as_deref(), Some("b"));
        assert_eq!(replayed.results, first.results);
    }

    #[test]
    fn finished_upstream_ends_members() {
        let fanout = Fanout::new(stream::iter([response(1.0)]).boxed_local());
        let mut a = Fanout::join(&fanout, None, None);
        let mut cx = Context::from_waker(noop_waker_ref());
        assert!(matches!(a.poll_next_unpin(&mut cx), Poll::Ready(Some(_))));
        assert!(matches!(a.poll_next_unpin(&mut cx), Poll::Ready(None)));
        assert!(!fanout.borrow().is_open());
    }
}
