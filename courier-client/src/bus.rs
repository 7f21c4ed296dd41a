//! Typed event bus carrying transport events to the engines
//!
//! One broadcast channel per event category. Subscribers only see the
//! category they asked for, and transfer subscribers can narrow further to
//! the correlation keys they hold.

use courier_common::{CorrelationKey, TransferEvent, UploadFinished};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::warn;

/// Default number of events buffered per category before slow subscribers lag
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Process-wide publish/subscribe channel for transfer events
#[derive(Debug, Clone)]
pub struct EventBus {
    transfers: broadcast::Sender<TransferEvent>,
    uploads: broadcast::Sender<UploadFinished>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per category
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (transfers, _) = broadcast::channel(capacity);
        let (uploads, _) = broadcast::channel(capacity);
        Self { transfers, uploads }
    }

    /// Deliver a transport event to every transfer subscriber
    ///
    /// Returns the number of subscribers that received it.
    pub fn publish_transfer(&self, event: TransferEvent) -> usize {
        self.transfers.send(event).unwrap_or(0)
    }

    /// Announce a finished upload
    pub fn publish_upload(&self, finished: UploadFinished) -> usize {
        self.uploads.send(finished).unwrap_or(0)
    }

    pub fn subscribe_transfers(&self) -> Subscription<TransferEvent> {
        Subscription::new(self.transfers.subscribe(), "transfers")
    }

    pub fn subscribe_uploads(&self) -> Subscription<UploadFinished> {
        Subscription::new(self.uploads.subscribe(), "uploads")
    }
}

/// One item from a subscription that reports gaps
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery<T> {
    Event(T),
    /// The subscriber fell behind and this many events were dropped
    Lagged(u64),
}

/// Receiving end of one bus category
///
/// Lagging behind only loses the skipped events; the subscription keeps
/// going. A lost transfer event is recovered by the request timeout. Callers
/// that cannot afford a silent gap use `recv_or_lagged`.
#[derive(Debug)]
pub struct Subscription<T> {
    rx: broadcast::Receiver<T>,
    category: &'static str,
}

impl<T: Clone> Subscription<T> {
    pub(crate) fn new(rx: broadcast::Receiver<T>, category: &'static str) -> Self {
        Self { rx, category }
    }

    /// Wait for the next event
    ///
    /// Returns `None` once every publisher is gone.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.recv_or_lagged().await? {
                Delivery::Event(event) => return Some(event),
                Delivery::Lagged(_) => {}
            }
        }
    }

    /// Wait for the next event, surfacing a lag instead of skipping past it
    ///
    /// Returns `None` once every publisher is gone.
    pub async fn recv_or_lagged(&mut self) -> Option<Delivery<T>> {
        match self.rx.recv().await {
            Ok(event) => Some(Delivery::Event(event)),
            Err(RecvError::Lagged(skipped)) => {
                warn!(category = self.category, skipped, "event subscriber lagged");
                Some(Delivery::Lagged(skipped))
            }
            Err(RecvError::Closed) => None,
        }
    }

    /// Take the next buffered event without waiting
    pub fn try_recv(&mut self) -> Option<T> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(category = self.category, skipped, "event subscriber lagged");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }
}

impl Subscription<TransferEvent> {
    /// Wait for the next event whose key passes `filter`
    pub async fn recv_matching<F>(&mut self, filter: F) -> Option<TransferEvent>
    where
        F: Fn(&CorrelationKey) -> bool,
    {
        loop {
            let event = self.recv().await?;
            if filter(event.key()) {
                return Some(event);
            }
        }
    }
}
