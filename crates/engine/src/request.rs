use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::channel::oneshot;

use crate::RequestError;

type Outcome = Result<(), RequestError>;

/// Handle to a pending prime/play request.
///
/// Resolves to `Ok(())`, `Err(Cancelled)` when superseded or torn down, or
/// `Err(Failed(..))`. A request whose owner is dropped reads as cancelled.
#[must_use = "requests report cancellation and failure"]
#[derive(Debug)]
pub struct Request {
    rx: oneshot::Receiver<Outcome>,
}

impl Request {
    /// A request that has already settled.
    pub fn settled(outcome: Outcome) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(outcome);
        Self { rx }
    }

    /// Non-blocking check; `None` while still pending.
    pub fn try_outcome(&mut self) -> Option<Outcome> {
        match self.rx.try_recv() {
            Ok(Some(outcome)) => Some(outcome),
            Ok(None) => None,
            Err(oneshot::Canceled) => Some(Err(RequestError::Cancelled)),
        }
    }
}

impl Future for Request {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(RequestError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Outstanding requests of one kind.
///
/// Every settle ends a generation: requests handed out afterwards belong to
/// the next one, so a superseded request can never be resolved late.
#[derive(Debug, Default)]
pub struct Waiters {
    generation: u64,
    senders: Vec<oneshot::Sender<Outcome>>,
}

impl Waiters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self) -> Request {
        self.senders.retain(|tx| !tx.is_canceled());
        let (tx, rx) = oneshot::channel();
        self.senders.push(tx);
        Request { rx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    pub fn resolve_all(&mut self) {
        self.settle(Ok(()));
    }

    pub fn cancel_all(&mut self) {
        self.settle(Err(RequestError::Cancelled));
    }

    pub fn fail_all(&mut self, reason: &str) {
        self.settle(Err(RequestError::Failed(reason.to_string())));
    }

    fn settle(&mut self, outcome: Outcome) {
        self.generation += 1;
        for tx in self.senders.drain(..) {
            let _ = tx.send(outcome.clone());
        }
    }
}
