//! Operation results.
//!
//! Every mutating call returns a [`PendingResult`]. The result can be polled
//! synchronously, awaited as a future, or waited on from a thread that is
//! not driving an async runtime.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

use crate::error::OperationError;
use crate::reactive::{Executor, Runtime};

type Outcome<T> = Result<T, OperationError>;

/// The eventual outcome of a submitted operation.
#[derive(Debug)]
pub struct PendingResult<T> {
    receiver: Option<oneshot::Receiver<Outcome<T>>>,
    value: Option<Outcome<T>>,
}

impl<T> PendingResult<T> {
    /// A result that is already known.
    pub fn ready(value: Outcome<T>) -> Self {
        Self { receiver: None, value: Some(value) }
    }

    /// The outcome, if it has been delivered.
    pub fn result(&mut self) -> Option<&Outcome<T>> {
        if self.value.is_none() {
            if let Some(receiver) = self.receiver.as_mut() {
                match receiver.try_recv() {
                    Ok(value) => self.value = Some(value),
                    Err(TryRecvError::Empty) => return None,
                    Err(TryRecvError::Closed) => self.value = Some(Err(OperationError::Abandoned)),
                }
                self.receiver = None;
            }
        }
        self.value.as_ref()
    }

    pub fn is_done(&mut self) -> bool {
        self.result().is_some()
    }

    /// Block the current thread until the outcome is delivered.
    ///
    /// # Panics
    ///
    /// Panics when called from within an asynchronous execution context;
    /// await the result there instead.
    pub fn wait(mut self) -> Outcome<T> {
        if let Some(value) = self.value.take() {
            return value;
        }
        match self.receiver.take() {
            Some(receiver) => receiver.blocking_recv().unwrap_or(Err(OperationError::Abandoned)),
            None => Err(OperationError::Abandoned),
        }
    }
}

// Nothing is pinned structurally; the receiver is polled through `Pin::new`.
impl<T> Unpin for PendingResult<T> {}

impl<T> Future for PendingResult<T> {
    type Output = Outcome<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(value) = self.value.take() {
            return Poll::Ready(value);
        }
        let Some(receiver) = self.receiver.as_mut() else {
            return Poll::Ready(Err(OperationError::Abandoned));
        };
        match Pin::new(receiver).poll(cx) {
            Poll::Ready(value) => {
                self.receiver = None;
                Poll::Ready(value.unwrap_or(Err(OperationError::Abandoned)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// The producing side of a [`PendingResult`].
///
/// Delivery goes through the runtime's result notifier.
pub(crate) struct Resolver<T> {
    sender: oneshot::Sender<Outcome<T>>,
    notifier: Arc<dyn Executor>,
}

impl<T: Send + 'static> Resolver<T> {
    pub(crate) fn resolve(self, value: Outcome<T>) {
        let sender = self.sender;
        self.notifier.execute(Box::new(move || {
            // The caller may have dropped its end; nobody is waiting then.
            let _ = sender.send(value);
        }));
    }
}

pub(crate) fn pending<T>(runtime: &Runtime) -> (Resolver<T>, PendingResult<T>) {
    let (sender, receiver) = oneshot::channel();
    let resolver = Resolver { sender, notifier: runtime.result_notifier() };
    (resolver, PendingResult { receiver: Some(receiver), value: None })
}

/// A staged transaction that produced a value.
///
/// The value is available as soon as the body returns; the result resolves
/// when the commit is decided.
#[derive(Debug)]
pub struct TransactionOperation<R> {
    value: R,
    result: PendingResult<()>,
}

impl<R> TransactionOperation<R> {
    pub(crate) fn new(value: R, result: PendingResult<()>) -> Self {
        Self { value, result }
    }

    pub fn value(&self) -> &R {
        &self.value
    }

    pub fn result(&mut self) -> &mut PendingResult<()> {
        &mut self.result
    }

    pub fn into_parts(self) -> (R, PendingResult<()>) {
        (self.value, self.result)
    }
}
