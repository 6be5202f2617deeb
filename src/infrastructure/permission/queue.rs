use crate::domain::error::BleError;
use crate::domain::models::AccessStatus;
use std::collections::VecDeque;
use tokio::sync::oneshot;

/// Continuation of one `request_access` caller.
pub type Responder = oneshot::Sender<Result<AccessStatus, BleError>>;

/// Callers waiting on one kind of OS prompt.
///
/// Callbacks carry no caller identity, so the Nth callback for a kind answers
/// the Nth caller that was enqueued for it.
#[derive(Debug, Default)]
pub struct PendingRequestQueue {
    pending: VecDeque<Responder>,
}

impl PendingRequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, responder: Responder) {
        self.pending.push_back(responder);
    }

    pub fn dequeue(&mut self) -> Option<Responder> {
        self.pending.pop_front()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
