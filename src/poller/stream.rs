use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use super::{PollEvent, Subscriber};
use crate::metrics::{MetricSnapshot, PollError};

/// Subscriber that forwards emissions into an unbounded channel.
pub(super) struct ChannelSubscriber {
    tx: mpsc::UnboundedSender<PollEvent>,
}

impl ChannelSubscriber {
    pub(super) fn new(tx: mpsc::UnboundedSender<PollEvent>) -> Self {
        Self { tx }
    }
}

impl Subscriber for ChannelSubscriber {
    fn on_snapshot(&self, snapshot: &MetricSnapshot) {
        // A dropped stream just stops consuming; nothing to do on failure.
        let _ = self.tx.send(PollEvent::Snapshot(snapshot.clone()));
    }

    fn on_error(&self, error: &PollError) {
        let _ = self.tx.send(PollEvent::Error(error.clone()));
    }
}

/// Stream of poll outcomes, in completion order.
///
/// Obtained from [`Poller::event_stream`](super::Poller::event_stream).
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<PollEvent>,
}

impl EventStream {
    pub(super) fn new(rx: mpsc::UnboundedReceiver<PollEvent>) -> Self {
        Self { rx }
    }
}

impl Stream for EventStream {
    type Item = PollEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}
