//! Cancellation handle for a long-lived forwarding task.

use futures::{Stream, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::task::JoinHandle;

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

type Slot<S> = Arc<Mutex<Option<S>>>;

fn lock<S>(slot: &Slot<S>) -> MutexGuard<'_, Option<S>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Upstream stream whose owner can drop it from outside the task polling it.
/// Once released it reports end-of-stream.
pub struct Detachable<S> {
    slot: Slot<S>,
}

impl<S: Stream + Unpin> Stream for Detachable<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match lock(&self.slot).as_mut() {
            Some(stream) => stream.poll_next_unpin(cx),
            None => Poll::Ready(None),
        }
    }
}

/// Releases one [`Detachable`] stream.
pub struct Release(Box<dyn Fn() + Send + Sync>);

impl Release {
    fn run(&self) {
        (self.0)()
    }
}

/// Split `stream` into a pollable half and the handle that drops it.
pub fn detachable<S: Send + 'static>(stream: S) -> (Detachable<S>, Release) {
    let slot: Slot<S> = Arc::new(Mutex::new(Some(stream)));
    let held = slot.clone();
    let release = Release(Box::new(move || {
        // Dropped outside the lock: the stream's own drop may take other locks.
        let taken = lock(&held).take();
        drop(taken);
    }));
    (Detachable { slot }, release)
}

/// Owns one spawned task that drives upstream native streams into a sink.
///
/// Disposing releases every upstream handed to [`Subscription::holding`]
/// before returning, then aborts the task. Disposing twice is a no-op, and
/// dropping the handle disposes it.
pub struct Subscription {
    id: u64,
    task: Option<JoinHandle<()>>,
    upstreams: Vec<Release>,
}

impl Subscription {
    /// Spawn the forwarding task. The closure receives this subscription's id
    /// so the task can ask its owner to tear down *this* generation only.
    /// Must be called from within a tokio runtime.
    pub fn spawn<F, Fut>(make_task: F) -> Self
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed);
        let task = tokio::spawn(make_task(id));
        Self {
            id,
            task: Some(task),
            upstreams: Vec::new(),
        }
    }

    /// Tie an upstream's lifetime to this subscription.
    pub fn holding(mut self, release: Release) -> Self {
        self.upstreams.push(release);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn dispose(&mut self) {
        for release in self.upstreams.drain(..) {
            release.run();
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.task.is_none()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose();
    }
}
