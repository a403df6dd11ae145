use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::download::DownloadEvent;
use crate::inference::GenerationEvent;

pub type SubscriberId = u64;

struct Subscriber<E> {
    id: SubscriberId,
    tx: mpsc::Sender<E>,
}

/// Broadcast point with at most one listener.
///
/// `subscribe` replaces whoever was listening before; `publish` with nobody
/// listening drops the event. Nothing is buffered for late subscribers.
pub struct EventChannel<E> {
    name: &'static str,
    capacity: usize,
    slot: Mutex<Option<Subscriber<E>>>,
    next_id: AtomicU64,
}

impl<E: Send + 'static> EventChannel<E> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity: capacity.max(1),
            slot: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn subscribe(&self) -> Subscription<E> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);

        let previous = self.slot.lock().replace(Subscriber { id, tx });
        if let Some(previous) = previous {
            tracing::debug!(
                channel = self.name,
                old = previous.id,
                new = id,
                "subscriber replaced"
            );
        } else {
            tracing::debug!(channel = self.name, id, "subscriber attached");
        }

        Subscription { id, rx }
    }

    pub fn unsubscribe(&self) {
        if let Some(previous) = self.slot.lock().take() {
            tracing::debug!(channel = self.name, id = previous.id, "subscriber detached");
        }
    }

    pub fn has_subscriber(&self) -> bool {
        self.slot
            .lock()
            .as_ref()
            .map(|s| !s.tx.is_closed())
            .unwrap_or(false)
    }

    fn current(&self) -> Option<(SubscriberId, mpsc::Sender<E>)> {
        self.slot.lock().as_ref().map(|s| (s.id, s.tx.clone()))
    }

    // Receiver went away without unsubscribing.
    fn detach(&self, id: SubscriberId) {
        let mut slot = self.slot.lock();
        if slot.as_ref().map(|s| s.id) == Some(id) {
            *slot = None;
            tracing::debug!(channel = self.name, id, "subscriber dropped");
        }
    }

    /// Deliver `event` to the current subscriber, waiting for queue space.
    /// Returns whether anyone received it.
    pub async fn publish(&self, event: E) -> bool {
        let Some((id, tx)) = self.current() else {
            return false;
        };

        if tx.send(event).await.is_ok() {
            return true;
        }
        self.detach(id);
        false
    }

    /// Deliver `event` only if the subscriber's queue has room right now.
    pub fn try_publish(&self, event: E) -> bool {
        let Some((id, tx)) = self.current() else {
            return false;
        };

        match tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::trace!(channel = self.name, id, "subscriber queue full, event dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.detach(id);
                false
            }
        }
    }

    /// Wait for queue space without holding any event yet. The returned
    /// [`Reservation`] delivers synchronously, so a caller can take a lock
    /// after the wait and send while holding it.
    pub async fn reserve(&self) -> Option<Reservation<E>> {
        let (id, tx) = self.current()?;
        match tx.reserve_owned().await {
            Ok(permit) => Some(Reservation { permit }),
            Err(_) => {
                self.detach(id);
                None
            }
        }
    }
}

/// A claimed slot in a subscriber's queue.
pub struct Reservation<E> {
    permit: mpsc::OwnedPermit<E>,
}

impl<E> Reservation<E> {
    pub fn send(self, event: E) {
        self.permit.send(event);
    }
}

pub struct Subscription<E> {
    id: SubscriberId,
    rx: mpsc::Receiver<E>,
}

impl<E> Subscription<E> {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next event, or `None` once this subscription has been replaced or
    /// detached and its queue is drained.
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }

    pub fn into_stream(self) -> ReceiverStream<E> {
        ReceiverStream::new(self.rx)
    }
}

/// The two independent channels shared by the download and inference sides.
pub struct Events {
    pub progress: EventChannel<DownloadEvent>,
    pub tokens: EventChannel<GenerationEvent>,
}

impl Events {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            progress: EventChannel::new("download_progress", capacity),
            tokens: EventChannel::new("inference_stream", capacity),
        })
    }
}
