//! Per-session external event queue.
//!
//! FIFO with a single consumer. Bounded queues apply backpressure to async
//! writers and reject synchronous writers when full. Unbounded queues never
//! drop events.

use rstchart_model::Event;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue is full")]
    Full,

    #[error("queue is closed")]
    Closed,
}

/// Creates a queue. `None` means unbounded.
pub fn event_queue(capacity: Option<usize>) -> (QueueSender, QueueReceiver) {
    match capacity {
        Some(capacity) => {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            (QueueSender::Bounded(tx), QueueReceiver::Bounded(rx))
        }
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (QueueSender::Unbounded(tx), QueueReceiver::Unbounded(rx))
        }
    }
}

#[derive(Debug, Clone)]
pub enum QueueSender {
    Bounded(mpsc::Sender<Event>),
    Unbounded(mpsc::UnboundedSender<Event>),
}

impl QueueSender {
    /// Enqueues an event, waiting for room if the queue is bounded.
    pub async fn send(&self, event: Event) -> Result<(), QueueError> {
        match self {
            QueueSender::Bounded(tx) => tx.send(event).await.map_err(|_| QueueError::Closed),
            QueueSender::Unbounded(tx) => tx.send(event).map_err(|_| QueueError::Closed),
        }
    }

    /// Enqueues an event without waiting.
    pub fn try_send(&self, event: Event) -> Result<(), QueueError> {
        match self {
            QueueSender::Bounded(tx) => tx.try_send(event).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => QueueError::Full,
                mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
            }),
            QueueSender::Unbounded(tx) => tx.send(event).map_err(|_| QueueError::Closed),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            QueueSender::Bounded(tx) => tx.is_closed(),
            QueueSender::Unbounded(tx) => tx.is_closed(),
        }
    }

    pub fn is_bounded(&self) -> bool {
        matches!(self, QueueSender::Bounded(_))
    }
}

#[derive(Debug)]
pub enum QueueReceiver {
    Bounded(mpsc::Receiver<Event>),
    Unbounded(mpsc::UnboundedReceiver<Event>),
}

impl QueueReceiver {
    pub async fn recv(&mut self) -> Option<Event> {
        match self {
            QueueReceiver::Bounded(rx) => rx.recv().await,
            QueueReceiver::Unbounded(rx) => rx.recv().await,
        }
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        match self {
            QueueReceiver::Bounded(rx) => rx.try_recv().ok(),
            QueueReceiver::Unbounded(rx) => rx.try_recv().ok(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            QueueReceiver::Bounded(rx) => rx.is_empty(),
            QueueReceiver::Unbounded(rx) => rx.is_empty(),
        }
    }

    /// Rejects further sends. Already queued events can still be received.
    pub fn close(&mut self) {
        match self {
            QueueReceiver::Bounded(rx) => rx.close(),
            QueueReceiver::Unbounded(rx) => rx.close(),
        }
    }
}
