//! Operation Queue
//!
//! ATT allows one outstanding request per link, so transactions are kept
//! in FIFO order and handed out one at a time. The queue itself is plain
//! data; the connection owns it under its state lock and runs the
//! dispatcher that drains it.

use crate::domain::error::OperationError;
use crate::infrastructure::bluetooth::transaction::{
    Completion, Transaction, TransactionRequest, TransactionResult,
};
use std::collections::VecDeque;
use tokio::sync::oneshot;

/// The transaction currently running against the adapter
#[derive(Debug)]
struct InFlight {
    id: u64,
    completion: Completion,
    abort: oneshot::Sender<()>,
}

/// Handed to the dispatcher when a transaction starts
#[derive(Debug)]
pub struct Dispatch {
    pub id: u64,
    pub request: TransactionRequest,
    /// Resolves when the transaction was failed from outside (disconnect)
    pub abort: oneshot::Receiver<()>,
}

#[derive(Debug, Default)]
pub struct OperationQueue {
    pending: VecDeque<Transaction>,
    in_flight: Option<InFlight>,
    next_id: u64,
}

impl OperationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a transaction; the receiver gets its result
    pub fn push(&mut self, request: TransactionRequest) -> (u64, oneshot::Receiver<TransactionResult>) {
        self.next_id += 1;
        let id = self.next_id;
        let (transaction, rx) = Transaction::new(id, request);
        self.pending.push_back(transaction);
        (id, rx)
    }

    /// Pending plus in-flight transactions
    pub fn len(&self) -> usize {
        self.pending.len() + usize::from(self.in_flight.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Start the oldest pending transaction, unless one is already running
    pub fn begin_next(&mut self) -> Option<Dispatch> {
        if self.in_flight.is_some() {
            return None;
        }
        let transaction = self.pending.pop_front()?;
        let id = transaction.id;
        let (request, completion) = transaction.into_parts();
        let (abort_tx, abort_rx) = oneshot::channel();
        self.in_flight = Some(InFlight {
            id,
            completion,
            abort: abort_tx,
        });
        Some(Dispatch {
            id,
            request,
            abort: abort_rx,
        })
    }

    /// Take the completion slot of the running transaction `id`.
    ///
    /// Returns `None` when the transaction was already failed by `fail_all`.
    pub fn finish(&mut self, id: u64) -> Option<Completion> {
        match &self.in_flight {
            Some(in_flight) if in_flight.id == id => {
                self.in_flight.take().map(|in_flight| in_flight.completion)
            }
            _ => None,
        }
    }

    /// Fail the running and every pending transaction with `error`, in
    /// submission order. Returns how many were failed.
    pub fn fail_all(&mut self, error: OperationError) -> usize {
        let mut failed = 0;
        if let Some(in_flight) = self.in_flight.take() {
            let _ = in_flight.abort.send(());
            in_flight.completion.complete(Err(error.clone()));
            failed += 1;
        }
        for transaction in self.pending.drain(..) {
            transaction.fail(error.clone());
            failed += 1;
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{CharacteristicHandle, CharacteristicRef};
    use crate::infrastructure::bluetooth::transaction::{
        OperationTimeouts, TransactionKind, TransactionOutput,
    };
    use uuid::Uuid;

    fn request(payload: u8) -> TransactionRequest {
        let target = CharacteristicRef {
            service: Uuid::from_u128(1),
            characteristic: Uuid::from_u128(2),
            handle: CharacteristicHandle(3),
        };
        TransactionRequest::new(
            TransactionKind::Write { ack_required: true },
            target,
            &OperationTimeouts::default(),
        )
        .with_payload(vec![payload])
    }

    #[test]
    fn test_fifo_dispatch_order() {
        let mut queue = OperationQueue::new();
        for n in 0..5 {
            queue.push(request(n));
        }

        let mut order = Vec::new();
        while let Some(dispatch) = queue.begin_next() {
            order.push(dispatch.request.payload[0]);
            queue
                .finish(dispatch.id)
                .unwrap()
                .complete(Ok(TransactionOutput::Written));
        }
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_single_in_flight() {
        let mut queue = OperationQueue::new();
        queue.push(request(1));
        queue.push(request(2));

        let first = queue.begin_next().unwrap();
        assert!(queue.is_busy());
        assert!(queue.begin_next().is_none());
        assert_eq!(queue.len(), 2);

        queue.finish(first.id).unwrap().complete(Ok(TransactionOutput::Written));
        let second = queue.begin_next().unwrap();
        assert_eq!(second.request.payload, vec![2]);
    }

    #[test]
    fn test_fail_all_drains_everything() {
        let mut queue = OperationQueue::new();
        let (_, mut rx_a) = queue.push(request(1));
        let (_, mut rx_b) = queue.push(request(2));
        let (_, mut rx_c) = queue.push(request(3));
        let mut running = queue.begin_next().unwrap();

        assert_eq!(queue.fail_all(OperationError::LinkLost), 3);
        assert_eq!(queue.len(), 0);

        for rx in [&mut rx_a, &mut rx_b, &mut rx_c] {
            assert_eq!(rx.try_recv().unwrap(), Err(OperationError::LinkLost));
        }
        // The dispatcher sees the abort and finds no completion left
        assert!(running.abort.try_recv().is_ok());
        assert!(queue.finish(running.id).is_none());
    }

    #[test]
    fn test_finish_ignores_stale_id() {
        let mut queue = OperationQueue::new();
        queue.push(request(1));
        let dispatch = queue.begin_next().unwrap();
        assert!(queue.finish(dispatch.id + 1).is_none());
        assert!(queue.finish(dispatch.id).is_some());
    }
}
