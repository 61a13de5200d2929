//! Fan-out of status events to any number of stream subscribers.
//!
//! Every subscriber owns a bounded buffer. Publishing never blocks: when a
//! subscriber's buffer is full the newest event is dropped for that
//! subscriber only and counted in [`StatusBus::dropped`]. Each subscriber
//! sees the last published value first and never sees the same value twice
//! in a row.

use corevisor_core::StatusEvent;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::Stream;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct StatusBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    capacity: usize,
    state: Mutex<BusState>,
    dropped: AtomicU64,
}

#[derive(Default)]
struct BusState {
    subscribers: Vec<Subscriber>,
    last: Option<StatusEvent>,
    closed: bool,
}

struct Subscriber {
    tx: mpsc::Sender<StatusEvent>,
    last_sent: Option<StatusEvent>,
}

impl StatusBus {
    /// Create a bus whose subscribers each buffer up to `capacity` events
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                capacity: capacity.max(1),
                state: Mutex::new(BusState::default()),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        match self.inner.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Deliver `event` to every live subscriber without waiting
    pub fn publish(&self, event: StatusEvent) {
        let mut state = self.state();
        if state.closed {
            debug!(status = %event, "Status bus closed, event discarded");
            return;
        }
        state.last = Some(event);

        let mut dropped = 0;
        state.subscribers.retain_mut(|sub| {
            if sub.last_sent == Some(event) {
                return !sub.tx.is_closed();
            }
            match sub.tx.try_send(event) {
                Ok(()) => {
                    sub.last_sent = Some(event);
                    true
                }
                Err(TrySendError::Full(_)) => {
                    dropped += 1;
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });

        if dropped > 0 {
            self.inner.dropped.fetch_add(dropped, Ordering::Relaxed);
            warn!(status = %event, subscribers = dropped, "Status buffer full, event dropped");
        }
    }

    /// Open a new subscription, primed with the last published value
    pub fn subscribe(&self) -> StatusSubscription {
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let mut state = self.state();
        if state.closed {
            // Sender dropped here, so the subscription ends immediately
            return StatusSubscription { rx };
        }

        let mut subscriber = Subscriber {
            tx,
            last_sent: None,
        };
        if let Some(last) = state.last {
            if subscriber.tx.try_send(last).is_ok() {
                subscriber.last_sent = Some(last);
            }
        }
        state.subscribers.push(subscriber);
        StatusSubscription { rx }
    }

    /// Stop delivering events. Open subscriptions drain what they hold and end.
    pub fn close(&self) {
        let mut state = self.state();
        if !state.closed {
            state.closed = true;
            state.subscribers.clear();
            debug!("Status bus closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Last value published, if any
    pub fn last(&self) -> Option<StatusEvent> {
        self.state().last
    }

    /// Total deliveries dropped because a subscriber's buffer was full
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        let mut state = self.state();
        state.subscribers.retain(|sub| !sub.tx.is_closed());
        state.subscribers.len()
    }
}

/// Stream of status events for one subscriber
pub struct StatusSubscription {
    rx: mpsc::Receiver<StatusEvent>,
}

impl StatusSubscription {
    pub async fn recv(&mut self) -> Option<StatusEvent> {
        self.rx.recv().await
    }
}

impl Stream for StatusSubscription {
    type Item = StatusEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
