//! Shared, lock-protected [Cache] with wake-ups for async consumers.

use super::cache::{Cache, Predicate, PredicateId};
use crate::messages::Envelope;
use parking_lot::Mutex;
use std::{collections::VecDeque, sync::Arc};
use tokio::{sync::watch, time::Instant};

#[derive(Debug)]
struct Inner {
    cache: Mutex<Cache>,
    // Bumped on every accepted put.
    changed: watch::Sender<u64>,
}

/// Envelope cache shared between the receive path and the tasks waiting for
/// messages. Cloning yields another handle to the same cache.
#[derive(Debug, Clone)]
pub struct Relay {
    inner: Arc<Inner>,
}

impl Default for Relay {
    fn default() -> Self {
        Self::new()
    }
}

impl Relay {
    pub fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Relay {
            inner: Arc::new(Inner {
                cache: Mutex::new(Cache::new()),
                changed,
            }),
        }
    }

    /// Register a predicate that lives until [Relay::release] or
    /// [Relay::flush].
    pub fn cache(&self, pred: Predicate) -> PredicateId {
        self.inner.cache.lock().cache(pred)
    }

    pub fn release(&self, id: PredicateId) {
        self.inner.cache.lock().release(id)
    }

    /// Retain `env` if anyone is interested and wake up the waiting
    /// subscriptions.
    pub fn put(&self, env: Envelope) -> bool {
        let accepted = self.inner.cache.lock().put(env);
        if accepted {
            self.inner.changed.send_modify(|n| *n = n.wrapping_add(1));
        }
        accepted
    }

    pub fn drain(&self, filter: impl Fn(&Envelope) -> bool) -> Vec<Envelope> {
        self.inner.cache.lock().messages(filter)
    }

    pub fn flush(&self) {
        self.inner.cache.lock().flush()
    }

    pub fn size(&self) -> usize {
        self.inner.cache.lock().size()
    }

    pub fn count(&self, filter: impl Fn(&Envelope) -> bool) -> usize {
        self.inner.cache.lock().count(filter)
    }

    /// Register `pred` and return a handle that receives the matching
    /// envelopes, including those cached before by other predicates. The
    /// predicate is released when the handle is dropped.
    pub fn subscribe<F>(&self, pred: F) -> Subscription
    where
        F: Fn(&Envelope) -> bool + Send + Sync + 'static,
    {
        let pred: Predicate = Arc::new(pred);
        let changed = self.inner.changed.subscribe();
        let id = self.cache(pred.clone());
        Subscription {
            relay: self.clone(),
            id,
            pred,
            changed,
            buffered: VecDeque::new(),
            discard: false,
        }
    }
}

pub struct Subscription {
    relay: Relay,
    id: PredicateId,
    pred: Predicate,
    changed: watch::Receiver<u64>,
    buffered: VecDeque<Envelope>,
    discard: bool,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("buffered", &self.buffered.len())
            .finish()
    }
}

impl Subscription {
    /// On drop, also remove the matching envelopes that are still cached.
    pub fn discard_unread(mut self) -> Self {
        self.discard = true;
        self
    }

    /// Next matching envelope, or `None` once `deadline` has passed.
    pub async fn next(&mut self, deadline: Instant) -> Option<Envelope> {
        loop {
            if let Some(env) = self.buffered.pop_front() {
                return Some(env);
            }
            // Mark the current generation as seen before looking, so a put
            // racing with the drain below still wakes us up.
            let _ = self.changed.borrow_and_update();
            let pred = self.pred.clone();
            self.buffered.extend(self.relay.drain(|e| pred(e)));
            if !self.buffered.is_empty() {
                continue;
            }
            match tokio::time::timeout_at(deadline, self.changed.changed()).await {
                Ok(Ok(())) => continue,
                // The sender lives as long as the relay we hold.
                Ok(Err(_)) | Err(_) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.relay.release(self.id);
        if self.discard {
            let pred = self.pred.clone();
            self.relay.drain(|e| pred(e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        abiencode::types::Hash,
        messages::{ChannelUpdateRejected, ParticipantMessage},
        Address,
    };
    use std::time::Duration;

    fn envelope(version: u64) -> Envelope {
        Envelope {
            sender: Address([1; 20]),
            recipient: Address([2; 20]),
            msg: ParticipantMessage::ChannelUpdateRejected(ChannelUpdateRejected {
                channel: Hash([0; 32]),
                version,
                reason: String::new(),
            }),
        }
    }

    #[tokio::test]
    async fn subscription_receives_later_put() {
        let relay = Relay::new();
        let mut sub = relay.subscribe(|e| e.msg.version() == 1);

        let r = relay.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(!r.put(envelope(2)));
            assert!(r.put(envelope(1)));
        });

        let got = sub.next(Instant::now() + Duration::from_secs(5)).await;
        assert_eq!(got, Some(envelope(1)));
    }

    #[tokio::test]
    async fn subscription_sees_envelopes_cached_earlier() {
        let relay = Relay::new();
        let standing = relay.cache(Arc::new(|_: &Envelope| true));
        relay.put(envelope(3));

        let mut sub = relay.subscribe(|e| e.msg.version() == 3);
        let got = sub.next(Instant::now() + Duration::from_millis(10)).await;
        assert_eq!(got, Some(envelope(3)));
        assert_eq!(relay.size(), 0);
        relay.release(standing);
    }

    #[tokio::test]
    async fn subscription_times_out() {
        let relay = Relay::new();
        let mut sub = relay.subscribe(|_| true);
        let got = sub.next(Instant::now() + Duration::from_millis(10)).await;
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn dropping_subscription_releases_predicate() {
        let relay = Relay::new();
        let sub = relay.subscribe(|_| true);
        assert!(relay.put(envelope(0)));
        drop(sub);
        assert!(!relay.put(envelope(0)));
        relay.flush();
        assert_eq!(relay.size(), 0);
    }

    #[test]
    fn discarding_subscription_drops_unread_envelopes() {
        let relay = Relay::new();
        let standing = relay.cache(Arc::new(|e: &Envelope| e.msg.version() == 2));
        let sub = relay.subscribe(|e| e.msg.version() == 1).discard_unread();
        assert!(relay.put(envelope(1)));
        assert!(relay.put(envelope(2)));
        drop(sub);
        assert_eq!(relay.size(), 1);
        assert_eq!(relay.count(|e| e.msg.version() == 2), 1);
        assert!(!relay.put(envelope(1)));
        relay.release(standing);
    }
}
