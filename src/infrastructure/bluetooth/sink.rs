//! Output channels for stream operations.
//!
//! An [`EventSink`] is the producer half held by a coordinator; the
//! [`EventStream`] is what the caller consumes. A sink terminates exactly
//! once, with either an error or a clean end-of-stream, no matter how many
//! teardown paths race to close it. Dropping the stream is how a consumer
//! cancels; coordinators watch for it with [`EventSink::consumer_gone`].

use crate::domain::error::BleError;
use futures::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::trace;

#[derive(Debug)]
pub enum SinkEvent<T> {
    Item(T),
    Error(BleError),
    EndOfStream,
}

pub struct EventSink<T> {
    tx: mpsc::UnboundedSender<SinkEvent<T>>,
    closed: Arc<AtomicBool>,
}

impl<T> Clone for EventSink<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            closed: self.closed.clone(),
        }
    }
}

pub fn channel<T>() -> (EventSink<T>, EventStream<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        EventSink {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        },
        EventStream { rx, done: false },
    )
}

impl<T> EventSink<T> {
    /// Forward one item. Returns false once the sink is closed or the
    /// consumer has gone away.
    pub fn send(&self, item: T) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        self.tx.send(SinkEvent::Item(item)).is_ok()
    }

    /// Terminate with an error. No-op if already terminated.
    pub fn error(&self, error: BleError) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            trace!("Sink terminated with error: {}", error);
            let _ = self.tx.send(SinkEvent::Error(error));
        }
    }

    /// Terminate cleanly. No-op if already terminated.
    pub fn end_of_stream(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(SinkEvent::EndOfStream);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }

    /// Resolves when the consumer drops its [`EventStream`].
    pub async fn consumer_gone(&self) {
        self.tx.closed().await
    }
}

/// Consumer half. Yields items, then at most one error, then ends.
pub struct EventStream<T> {
    rx: mpsc::UnboundedReceiver<SinkEvent<T>>,
    done: bool,
}

impl<T> Stream for EventStream<T> {
    type Item = Result<T, BleError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(SinkEvent::Item(item))) => Poll::Ready(Some(Ok(item))),
            Poll::Ready(Some(SinkEvent::Error(e))) => {
                this.done = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(Some(SinkEvent::EndOfStream)) | Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
