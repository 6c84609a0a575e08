//! Pipelines and their execution handles
//!
//! A pipeline produces row batches on the dispatcher pool. Each execution
//! gets its own cancellation token; the pipeline driver checks it before
//! every batch, so cancellation is observed at batch boundaries only.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::warn;

use crate::values::Tuple;

use super::errors::{TransactionError, TransactionResult};
use super::tx::Transaction;

/// Cooperative cancellation flag shared between a transaction and a pipeline
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// What a pipeline sees while it runs
pub struct ExecutionContext {
    pub transaction: Transaction,
    pub token: CancellationToken,
}

/// A producer of row batches
pub trait Pipeline: Send + 'static {
    /// The next batch, or `None` once exhausted
    fn next_batch(&mut self, ctx: &ExecutionContext) -> TransactionResult<Option<Vec<Tuple>>>;
}

impl<F> Pipeline for F
where
    F: FnMut(&ExecutionContext) -> TransactionResult<Option<Vec<Tuple>>> + Send + 'static,
{
    fn next_batch(&mut self, ctx: &ExecutionContext) -> TransactionResult<Option<Vec<Tuple>>> {
        self(ctx)
    }
}

pub(crate) enum ExecutionMessage {
    Batch(Vec<Tuple>),
    Done(TransactionResult<usize>),
}

/// Drive a pipeline to completion; returns the number of rows produced
pub(crate) fn drive<P: Pipeline>(
    pipeline: &mut P,
    ctx: &ExecutionContext,
    sink: &UnboundedSender<ExecutionMessage>,
) -> TransactionResult<usize> {
    let mut rows = 0;
    loop {
        if ctx.token.is_cancelled() {
            return Err(TransactionError::Cancelled(ctx.transaction.id()));
        }
        match pipeline.next_batch(ctx)? {
            Some(batch) => {
                rows += batch.len();
                if sink.send(ExecutionMessage::Batch(batch)).is_err() {
                    // Consumer went away; nothing left to produce for.
                    return Ok(rows);
                }
            }
            None => return Ok(rows),
        }
    }
}

/// Handle to a running pipeline.
///
/// Receiving blocks the calling thread; do not use it from async code.
pub struct Execution {
    transaction: Transaction,
    token: CancellationToken,
    receiver: UnboundedReceiver<ExecutionMessage>,
    outcome: Option<TransactionResult<usize>>,
}

impl Execution {
    pub(crate) fn new(
        transaction: Transaction,
        token: CancellationToken,
        receiver: UnboundedReceiver<ExecutionMessage>,
    ) -> Self {
        Self {
            transaction,
            token,
            receiver,
            outcome: None,
        }
    }

    /// Request cancellation of this execution only
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Block for the next batch; `None` once the pipeline has finished
    pub fn next_batch(&mut self) -> Option<Vec<Tuple>> {
        if self.outcome.is_some() {
            return None;
        }
        match self.receiver.blocking_recv() {
            Some(ExecutionMessage::Batch(batch)) => Some(batch),
            Some(ExecutionMessage::Done(outcome)) => {
                self.outcome = Some(outcome);
                None
            }
            None => {
                self.outcome = Some(Err(TransactionError::execution(
                    "pipeline ended without reporting an outcome",
                )));
                None
            }
        }
    }

    /// Drain all rows, then settle an implicit transaction
    pub fn collect(mut self) -> TransactionResult<Vec<Tuple>> {
        let mut rows = Vec::new();
        while let Some(batch) = self.next_batch() {
            rows.extend(batch);
        }
        self.settle()?;
        Ok(rows)
    }

    /// Drain and discard all rows; returns the row count
    pub fn finish(mut self) -> TransactionResult<usize> {
        while self.next_batch().is_some() {}
        self.settle()
    }

    /// Implicit transactions end with their statement: commit on success,
    /// roll back on failure.
    fn settle(&mut self) -> TransactionResult<usize> {
        let outcome = self
            .outcome
            .take()
            .unwrap_or_else(|| Err(TransactionError::execution("execution not drained")));
        let kind = self.transaction.kind();
        match outcome {
            Ok(rows) => {
                if kind.auto_commit() {
                    self.transaction.commit()?;
                }
                Ok(rows)
            }
            Err(e) => {
                if kind.auto_rollback() {
                    if let Err(rollback) = self.transaction.rollback() {
                        warn!(tx = %self.transaction.id(), error = %rollback, "implicit rollback failed");
                    }
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_is_shared() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
