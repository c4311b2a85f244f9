//! Prioritised task queue and one-shot result handles.

use crate::codec;
use crate::error::{PumpError, Result};
use crate::status::StatusByte;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError};
use std::sync::Arc;
use std::time::Duration;

/// Answer of a completed task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: StatusByte,
    pub payload: Vec<u8>,
}

impl Reply {
    /// Reply recorded for a broadcast, which never answers
    pub fn broadcast() -> Self {
        Reply {
            status: StatusByte::NO_ANSWER,
            payload: Vec::new(),
        }
    }

    pub fn numeric(&self) -> Option<i64> {
        codec::parse_numeric(&self.payload)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).trim().to_string()
    }
}

pub(crate) struct Task {
    pub priority: u8,
    pub order: u64,
    pub address: u8,
    pub payload: Vec<u8>,
    pub is_move: bool,
    pub reply: SyncSender<Result<Reply>>,
    pub cancelled: Arc<AtomicBool>,
}

impl Task {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::SeqCst)
    }

    pub fn complete(self, result: Result<Reply>) {
        // Receiver may have been dropped by a caller that did not wait
        let _ = self.reply.send(result);
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.order == other.order
    }
}

impl Eq for Task {}

impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Task {
    // BinaryHeap pops the greatest element: lower priority value and
    // earlier submission must compare greater.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.order.cmp(&self.order))
    }
}

/// FIFO-within-priority queue of pending tasks
#[derive(Default)]
pub(crate) struct TaskQueue {
    heap: BinaryHeap<Task>,
    next_order: u64,
    pub shutdown: bool,
}

impl TaskQueue {
    pub fn push(
        &mut self,
        priority: u8,
        address: u8,
        payload: Vec<u8>,
        is_move: bool,
    ) -> CommandFuture {
        let (tx, rx) = mpsc::sync_channel(1);
        let cancelled = Arc::new(AtomicBool::new(false));
        let order = self.next_order;
        self.next_order += 1;
        self.heap.push(Task {
            priority,
            order,
            address,
            payload,
            is_move,
            reply: tx,
            cancelled: Arc::clone(&cancelled),
        });
        CommandFuture {
            rx,
            cancelled,
            address,
        }
    }

    pub fn pop(&mut self) -> Option<Task> {
        self.heap.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Remove every task whose target overlaps `ids`
    pub fn drain_matching(&mut self, ids: &[u8]) -> Vec<Task> {
        let (drained, kept): (Vec<Task>, Vec<Task>) = std::mem::take(&mut self.heap)
            .into_vec()
            .into_iter()
            .partition(|task| codec::members(task.address).iter().any(|id| ids.contains(id)));
        self.heap = kept.into();
        drained
    }
}

/// One-shot handle on the result of a queued task
#[derive(Debug)]
pub struct CommandFuture {
    rx: Receiver<Result<Reply>>,
    cancelled: Arc<AtomicBool>,
    address: u8,
}

impl CommandFuture {
    /// A handle that is already resolved
    pub fn resolved(address: u8, result: Result<Reply>) -> Self {
        let (tx, rx) = mpsc::sync_channel(1);
        let _ = tx.send(result);
        CommandFuture {
            rx,
            cancelled: Arc::new(AtomicBool::new(false)),
            address,
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    /// Mark the task cancelled; it will not be sent if still queued
    pub fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::SeqCst)
    }

    fn closed(&self) -> PumpError {
        if self.is_cancelled() {
            PumpError::CancelledByStop
        } else {
            PumpError::Disconnected
        }
    }

    /// Block until the task completes
    pub fn wait(self) -> Result<Reply> {
        match self.rx.recv() {
            Ok(result) => result,
            Err(_) => Err(self.closed()),
        }
    }

    /// Block for at most `timeout`
    pub fn wait_timeout(self, timeout: Duration) -> Result<Reply> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(PumpError::BusTimeout {
                address: self.address,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(self.closed()),
        }
    }

    /// Non-blocking check
    pub fn try_result(&self) -> Option<Result<Reply>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(self.closed())),
        }
    }
}

/// Wait on several handles, returning the first error
pub fn wait_all(futures: Vec<CommandFuture>) -> Result<Vec<Reply>> {
    let mut replies = Vec::with_capacity(futures.len());
    let mut first_error = None;
    for future in futures {
        match future.wait() {
            Ok(reply) => replies.push(reply),
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(replies),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_by_priority_then_fifo() {
        let mut queue = TaskQueue::default();
        let _a = queue.push(100, 0x31, b"A".to_vec(), true);
        let _b = queue.push(100, 0x31, b"B".to_vec(), true);
        let _c = queue.push(0, 0x31, b"T".to_vec(), false);
        let _d = queue.push(200, 0x31, b"?".to_vec(), false);
        let order: Vec<Vec<u8>> = std::iter::from_fn(|| queue.pop().map(|t| t.payload)).collect();
        assert_eq!(order, vec![b"T".to_vec(), b"A".to_vec(), b"B".to_vec(), b"?".to_vec()]);
    }

    #[test]
    fn drain_matching_covers_broadcast_members() {
        let mut queue = TaskQueue::default();
        let _a = queue.push(100, 0x31, b"A".to_vec(), true);
        let _b = queue.push(100, 0x41, b"R".to_vec(), true);
        let _c = queue.push(100, 0x33, b"A".to_vec(), true);
        let drained = queue.drain_matching(&[2]);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].address, 0x41);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn completed_task_resolves_future() {
        let mut queue = TaskQueue::default();
        let future = queue.push(100, 0x31, b"?".to_vec(), false);
        let task = queue.pop().unwrap();
        task.complete(Ok(Reply {
            status: StatusByte::READY,
            payload: b"42".to_vec(),
        }));
        assert_eq!(future.wait().unwrap().numeric(), Some(42));
    }

    #[test]
    fn dropped_task_reports_cancel_or_disconnect() {
        let mut queue = TaskQueue::default();
        let future = queue.push(100, 0x31, b"?".to_vec(), false);
        future.cancel();
        drop(queue.pop());
        assert!(matches!(future.wait(), Err(PumpError::CancelledByStop)));

        let future = queue.push(100, 0x31, b"?".to_vec(), false);
        drop(queue.pop());
        assert!(matches!(future.wait(), Err(PumpError::Disconnected)));
    }
}
