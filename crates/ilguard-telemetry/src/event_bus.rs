use std::fmt::Debug;

use parking_lot::Mutex;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::debug;

/// Fan-out of component events to any number of subscribers.
///
/// Emission never blocks; receivers that were dropped are pruned on the
/// next emit.
pub struct EventBus<E> {
    source: &'static str,
    subscribers: Mutex<Vec<UnboundedSender<E>>>,
}

impl<E> EventBus<E>
where
    E: Clone + Debug + Send + 'static,
{
    pub fn new(source: &'static str) -> Self {
        EventBus {
            source,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> UnboundedReceiver<E> {
        let (tx, rx) = unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn emit(&self, event: E) {
        debug!(source = self.source, ?event, "event emitted");
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Drop every subscriber; their receivers observe end of stream.
    pub fn close(&self) {
        self.subscribers.lock().clear();
    }
}

impl<E> Debug for EventBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("source", &self.source)
            .field("subscribers", &self.subscribers.lock().len())
            .finish()
    }
}
