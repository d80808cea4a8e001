//! Bounded event queue between the subscriber and the delivery workers
//!
//! A single producer side (the subscriber) and a shared consumer side (any
//! number of workers). Capacity is fixed at construction. The queue closes
//! when every `QueueSender` has been dropped; receivers then drain what is
//! left and get `None`.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};

/// The receiving side has gone away
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("event queue closed")]
pub struct QueueClosed;

/// Create a queue holding at most `capacity` payloads
pub fn bounded(capacity: usize) -> (QueueSender, QueueReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    let depth = Arc::new(AtomicUsize::new(0));
    (
        QueueSender {
            tx,
            depth: Arc::clone(&depth),
        },
        QueueReceiver {
            rx: Arc::new(Mutex::new(rx)),
            depth,
            capacity,
        },
    )
}

/// Producer handle
#[derive(Clone, Debug)]
pub struct QueueSender {
    tx: mpsc::Sender<Vec<u8>>,
    depth: Arc<AtomicUsize>,
}

impl QueueSender {
    /// Wait for a free slot and enqueue `payload`.
    ///
    /// Cancel safe: if the future is dropped before it completes, nothing
    /// was enqueued.
    pub async fn send(&self, payload: Vec<u8>) -> Result<(), QueueClosed> {
        let permit = self.tx.reserve().await.map_err(|_| QueueClosed)?;
        // Count before the payload becomes visible so a receiver never decrements first.
        self.depth.fetch_add(1, Ordering::SeqCst);
        permit.send(payload);
        Ok(())
    }

    /// Number of payloads currently waiting
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Consumer handle, cheap to clone and shared by all workers
#[derive(Clone, Debug)]
pub struct QueueReceiver {
    rx: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>,
    depth: Arc<AtomicUsize>,
    capacity: usize,
}

impl QueueReceiver {
    /// Next payload, or `None` once the queue is closed and empty
    pub async fn recv(&self) -> Option<Vec<u8>> {
        let payload = self.rx.lock().await.recv().await;
        if payload.is_some() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
        payload
    }

    /// Number of payloads currently waiting
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
