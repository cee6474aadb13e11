use std::sync::Mutex;

use tokio::sync::mpsc;

/// Single-topic publish/subscribe with explicit shutdown.
///
/// Delivery is unbounded per subscriber so publishers never block; a
/// subscriber that has gone away is pruned on the next publish. After
/// `shutdown` publications are dropped silently and new subscriptions come
/// back already closed, so late publishers and late subscribers both see a
/// quiet bus instead of a hang.
pub struct Bus<T> {
    inner: Mutex<Inner<T>>,
}

struct Inner<T> {
    next_id: u64,
    subs: Vec<(u64, mpsc::UnboundedSender<T>)>,
    shut: bool,
}

/// Receiving end of one subscription. Dropping it detaches from the bus.
pub struct Subscription<T> {
    id: u64,
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next published value, or `None` once the bus has shut down.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T: Clone> Bus<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                subs: Vec::new(),
                shut: false,
            }),
        }
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let (tx, rx) = mpsc::unbounded_channel();
        if inner.shut {
            // Dropping the sender right away yields a closed subscription.
            return Subscription { id: 0, rx };
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subs.push((id, tx));
        Subscription { id, rx }
    }

    /// Idempotent: unknown ids are ignored.
    pub fn unsubscribe(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.subs.retain(|(sid, _)| *sid != id);
    }

    pub fn publish(&self, value: T) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if inner.shut {
            return;
        }
        inner.subs.retain(|(_, tx)| tx.send(value.clone()).is_ok());
    }

    /// Close every subscription. Idempotent.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.shut = true;
        inner.subs.clear();
    }

    pub fn is_shut(&self) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.shut
    }
}

impl<T: Clone> Default for Bus<T> {
    fn default() -> Self {
        Self::new()
    }
}
