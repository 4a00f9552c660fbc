use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tokio::time;
use tracing::{debug, trace};

use crate::protocol::error::PrtError;
use crate::protocol::message::Message;

/// The outcome delivered to a waiting exchange
#[derive(Debug)]
enum Settlement {
    Resolved(Message),
    Cancelled,
}

/// Registry of exchanges awaiting a correlated reply, keyed by sequence number.
///
/// Each slot is a single-use rendezvous. Settling a slot (by a reply, a timeout or cancellation)
///  removes it from the map under the registry's lock, and only the party that removed it may
///  deliver an outcome. So exactly one of the competing outcomes wins, and late replies or late
///  timeouts find no slot and are no-ops.
///
/// The lock is never held across an `.await`, so it is a blocking mutex: that allows a
///  [PendingExchange] to remove its slot when it is dropped without being waited for.
#[derive(Default)]
pub struct PendingExchanges {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    slots: FxHashMap<i64, oneshot::Sender<Settlement>>,
    /// set once the owning session is gone - no new exchanges can be registered after that
    closed: bool,
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    // the map stays consistent even if a holder panicked: every operation is a single insert or remove
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle for a registered exchange, consumed by [PendingExchanges::wait]. Dropping it
///  unsettled (e.g. because the future waiting for it was dropped) removes the slot.
#[derive(Debug)]
pub struct PendingExchange {
    sequence: i64,
    receiver: oneshot::Receiver<Settlement>,
    registry: Weak<Mutex<Inner>>,
}
impl PendingExchange {
    pub fn sequence(&self) -> i64 {
        self.sequence
    }
}

impl Drop for PendingExchange {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            if lock(&inner).slots.remove(&self.sequence).is_some() {
                debug!("exchange {} was abandoned - removed its slot", self.sequence);
            }
        }
    }
}

impl PendingExchanges {
    pub fn new() -> PendingExchanges {
        Default::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        lock(&self.inner)
    }

    pub fn register(&self, sequence: i64) -> Result<PendingExchange, PrtError> {
        let mut inner = self.lock();
        if inner.closed {
            debug!("registering exchange {} for a closed session", sequence);
            return Err(PrtError::Timeout);
        }
        if inner.slots.contains_key(&sequence) {
            return Err(PrtError::IllegalOperation(format!("sequence number {} is already in flight", sequence)));
        }

        let (sender, receiver) = oneshot::channel();
        inner.slots.insert(sequence, sender);
        Ok(PendingExchange {
            sequence,
            receiver,
            registry: Arc::downgrade(&self.inner),
        })
    }

    /// Delivers a reply to the exchange waiting for `sequence`. Returns `false` if there is no
    ///  such exchange (never registered, already timed out or already resolved).
    pub fn resolve(&self, sequence: i64, reply: Message) -> bool {
        let mut inner = self.lock();
        match inner.slots.remove(&sequence) {
            Some(sender) => {
                // sending while holding the lock: a competing timeout sees either the slot or the value
                if sender.send(Settlement::Resolved(reply)).is_err() {
                    trace!("waiter for sequence {} is gone", sequence);
                }
                true
            }
            None => {
                debug!("no pending exchange for sequence {} - dropping reply", sequence);
                false
            }
        }
    }

    /// Waits until the exchange is resolved, or until `timeout` elapses, whichever happens first.
    ///  The slot is removed in either case, and also if the returned future is dropped early.
    pub async fn wait(&self, mut exchange: PendingExchange, timeout: Duration) -> Result<Message, PrtError> {
        let sequence = exchange.sequence;

        match time::timeout(timeout, &mut exchange.receiver).await {
            Ok(Ok(Settlement::Resolved(reply))) => Ok(reply),
            Ok(Ok(Settlement::Cancelled)) | Ok(Err(_)) => {
                debug!("exchange {} was cancelled", sequence);
                Err(PrtError::Timeout)
            }
            Err(_) => {
                let removed = self.lock().slots.remove(&sequence).is_some();
                if removed {
                    debug!("exchange {} timed out after {:?}", sequence, timeout);
                    return Err(PrtError::Timeout);
                }

                // the slot was settled between the timer firing and us acquiring the lock
                match exchange.receiver.try_recv() {
                    Ok(Settlement::Resolved(reply)) => Ok(reply),
                    _ => Err(PrtError::Timeout),
                }
            }
        }
    }

    /// Removes the slot of an exchange that will never be waited for, e.g. because sending the
    ///  request failed
    pub fn discard(&self, exchange: PendingExchange) {
        self.lock().slots.remove(&exchange.sequence);
    }

    /// Settles all pending exchanges as timed out and refuses further registrations. Returns the
    ///  number of exchanges that were cancelled.
    pub fn cancel_all(&self) -> usize {
        let mut inner = self.lock();
        inner.closed = true;

        let num_cancelled = inner.slots.len();
        for (_, sender) in inner.slots.drain() {
            let _ = sender.send(Settlement::Cancelled);
        }
        num_cancelled
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, sequence: i64) -> bool {
        self.lock().slots.contains_key(&sequence)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_resolve_before_wait() {
        let pending = PendingExchanges::new();
        let exchange = pending.register(3).unwrap();

        assert!(pending.resolve(3, Message::new("S", "prt-ack", 3, "reply")));
        assert!(pending.is_empty());

        let reply = pending.wait(exchange, Duration::from_millis(100)).await.unwrap();
        assert_eq!(reply.body, "reply");
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_while_waiting() {
        let pending = Arc::new(PendingExchanges::new());
        let exchange = pending.register(7).unwrap();

        let pending2 = pending.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(50)).await;
            assert!(pending2.resolve(7, Message::new("S", "prt-ack", 7, "x")));
        });

        let start = Instant::now();
        let reply = pending.wait(exchange, Duration::from_millis(200)).await.unwrap();
        assert_eq!(reply.sequence, 7);
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_slot_and_drops_late_reply() {
        let pending = PendingExchanges::new();
        let exchange = pending.register(1).unwrap();

        let start = Instant::now();
        let result = pending.wait(exchange, Duration::from_millis(200)).await;
        assert!(matches!(result, Err(PrtError::Timeout)));
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert!(start.elapsed() < Duration::from_millis(250));
        assert!(!pending.contains(1));

        assert!(!pending.resolve(1, Message::new("S", "prt-ack", 1, "late")));
    }

    #[test]
    fn test_resolve_unknown_sequence() {
        let pending = PendingExchanges::new();
        let _exchange = pending.register(1).unwrap();

        assert!(!pending.resolve(2, Message::new("S", "prt-ack", 2, "")));
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_second_resolve_is_dropped() {
        let pending = PendingExchanges::new();
        let exchange = pending.register(5).unwrap();

        assert!(pending.resolve(5, Message::new("S", "prt-ack", 5, "first")));
        assert!(!pending.resolve(5, Message::new("S", "prt-ack", 5, "second")));

        let reply = pending.wait(exchange, Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply.body, "first");
    }

    #[test]
    fn test_discard() {
        let pending = PendingExchanges::new();
        let exchange = pending.register(5).unwrap();

        pending.discard(exchange);
        assert!(pending.is_empty());
        assert!(!pending.resolve(5, Message::new("S", "prt-ack", 5, "")));
    }

    #[test]
    fn test_register_duplicate_sequence() {
        let pending = PendingExchanges::new();
        let _exchange = pending.register(5).unwrap();

        assert!(matches!(pending.register(5), Err(PrtError::IllegalOperation(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_wait_removes_slot() {
        let pending = PendingExchanges::new();
        let exchange = pending.register(4).unwrap();

        let result = time::timeout(Duration::from_millis(10), pending.wait(exchange, Duration::from_secs(60))).await;
        assert!(result.is_err());
        assert!(pending.is_empty());
        assert!(!pending.resolve(4, Message::new("S", "prt-ack", 4, "late")));
    }

    #[test]
    fn test_dropped_handle_removes_slot() {
        let pending = PendingExchanges::new();
        let exchange = pending.register(4).unwrap();
        let _other = pending.register(5).unwrap();

        drop(exchange);
        assert!(!pending.contains(4));
        assert!(pending.contains(5));
    }

    #[test]
    fn test_handle_outliving_registry() {
        let pending = PendingExchanges::new();
        let exchange = pending.register(1).unwrap();
        drop(pending);
        drop(exchange);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all() {
        let pending = Arc::new(PendingExchanges::new());
        let mut waiters = Vec::new();
        for sequence in 0..3 {
            let exchange = pending.register(sequence).unwrap();
            let pending = pending.clone();
            waiters.push(tokio::spawn(async move {
                let start = Instant::now();
                let result = pending.wait(exchange, Duration::from_secs(60)).await;
                (result, start.elapsed())
            }));
        }

        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pending.cancel_all(), 3);
        assert!(pending.is_empty());

        for waiter in waiters {
            let (result, elapsed) = waiter.await.unwrap();
            assert!(matches!(result, Err(PrtError::Timeout)));
            assert!(elapsed < Duration::from_secs(1));
        }

        assert!(matches!(pending.register(10), Err(PrtError::Timeout)));
    }

    #[tokio::test]
    async fn test_concurrent_exchanges_are_paired_by_sequence() {
        let pending = Arc::new(PendingExchanges::new());
        let mut waiters = Vec::new();
        for sequence in 0..50 {
            let exchange = pending.register(sequence).unwrap();
            let pending = pending.clone();
            waiters.push(tokio::spawn(async move {
                pending.wait(exchange, Duration::from_secs(10)).await
            }));
        }

        // resolve in reverse order from concurrent tasks
        let mut resolvers = Vec::new();
        for sequence in (0..50).rev() {
            let pending = pending.clone();
            resolvers.push(tokio::spawn(async move {
                pending.resolve(sequence, Message::new("S", "prt-ack", sequence, sequence.to_string()))
            }));
        }
        for resolver in resolvers {
            assert!(resolver.await.unwrap());
        }

        for (sequence, waiter) in waiters.into_iter().enumerate() {
            let reply = waiter.await.unwrap().unwrap();
            assert_eq!(reply.body, sequence.to_string());
        }
        assert!(pending.is_empty());
    }
}
