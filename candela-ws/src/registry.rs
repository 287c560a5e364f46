use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use candela_shared::{Symbol, window::TimeWindow};
use eyre::Result;
use serde::Deserialize;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Utf8Bytes;
use tracing::{debug, info};

/// What a client listens to: one symbol at one timeframe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct Subscription {
    pub symbol: Symbol,
    pub timeframe: TimeWindow,
}

impl Subscription {
    pub fn new(symbol: Symbol, timeframe: TimeWindow) -> Self {
        Self { symbol, timeframe }
    }

    /// Any subscription coarser than `(1, second)` implies a shadow
    /// subscription at `(1, second)` for the same symbol, driving the
    /// client's partial-candle updates.
    pub fn requires_one_second_updates(&self) -> bool {
        !self.timeframe.is_one_second()
    }

    pub fn as_one_second(&self) -> Subscription {
        Subscription {
            symbol: self.symbol.clone(),
            timeframe: TimeWindow::ONE_SECOND,
        }
    }
}

impl std::fmt::Display for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.timeframe)
    }
}

pub type ClientId = u64;

/// Handle to a live session. Messages pushed here are drained by the
/// session's writer task, so one slow socket never stalls a broadcast.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub id: ClientId,
    sender: mpsc::UnboundedSender<Utf8Bytes>,
}

impl ClientHandle {
    /// Best-effort: a session that is already gone just drops the message.
    fn send(&self, message: Utf8Bytes) {
        let _ = self.sender.send(message);
    }
}

#[derive(Default)]
struct Inner {
    connections: HashMap<ClientId, ClientHandle>,
    subscriptions: HashMap<Subscription, HashSet<ClientId>>,
}

/// The live-session registry.
///
/// Every mutating operation serializes on one lock. A subscription key is
/// present iff its subscriber set is non-empty, and a client holding a
/// coarse subscription always also appears under its one-second shadow.
pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            next_id: AtomicU64::new(0),
        }
    }

    pub async fn connect(&self, sender: mpsc::UnboundedSender<Utf8Bytes>) -> ClientHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = ClientHandle { id, sender };
        let mut inner = self.inner.lock().await;
        inner.connections.insert(id, handle.clone());
        info!(client = id, "new connection");
        handle
    }

    /// Drops the session handle. Subscriptions are the caller's to remove
    /// first (the session handler unsubscribes on its terminal path).
    pub async fn disconnect(&self, id: ClientId) {
        let mut inner = self.inner.lock().await;
        inner.connections.remove(&id);
        info!(client = id, "connection removed");
    }

    /// Idempotent. A coarse subscription also installs its one-second
    /// shadow unless the client already holds it.
    pub async fn subscribe(&self, id: ClientId, subscription: Subscription) {
        let mut inner = self.inner.lock().await;

        if subscription.requires_one_second_updates() {
            inner
                .subscriptions
                .entry(subscription.as_one_second())
                .or_default()
                .insert(id);
        }

        info!(client = id, %subscription, "subscribed");
        inner.subscriptions.entry(subscription).or_default().insert(id);
    }

    /// Removes `id` from `subscription`, dropping the key when its set
    /// empties. The shadow subscription goes too unless `next` still needs
    /// sub-second updates: switching between coarse timeframes keeps the
    /// shadow, disconnecting or switching to `(1, second)` drops it.
    pub async fn unsubscribe(
        &self,
        id: ClientId,
        subscription: &Subscription,
        next: Option<&Subscription>,
    ) {
        let mut inner = self.inner.lock().await;

        remove_subscriber(&mut inner.subscriptions, subscription, id);

        let keeps_shadow = next.is_some_and(|n| n.requires_one_second_updates());
        if !keeps_shadow {
            remove_subscriber(&mut inner.subscriptions, &subscription.as_one_second(), id);
        }

        info!(client = id, %subscription, "unsubscribed");
    }

    /// Decodes the `(symbol, timeframe)` key of a raw OHLC message and
    /// pushes the message, verbatim, to every subscribed session.
    ///
    /// The recipient snapshot is taken under the lock and the sends happen
    /// after it is released; a client unsubscribing in between simply
    /// receives one extra message.
    ///
    /// # Error
    ///
    /// Only an undecodable key fails; sends are best-effort.
    pub async fn broadcast(&self, raw: Utf8Bytes) -> Result<()> {
        let subscription: Subscription = simd_json::from_slice(&mut raw.as_bytes().to_vec())?;

        let recipients: Vec<ClientHandle> = {
            let inner = self.inner.lock().await;
            match inner.subscriptions.get(&subscription) {
                Some(ids) => ids
                    .iter()
                    .filter_map(|id| inner.connections.get(id).cloned())
                    .collect(),
                None => return Ok(()),
            }
        };

        debug!(%subscription, clients = recipients.len(), "broadcasting candle");
        for client in &recipients {
            client.send(raw.clone());
        }

        Ok(())
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn remove_subscriber(
    subscriptions: &mut HashMap<Subscription, HashSet<ClientId>>,
    key: &Subscription,
    id: ClientId,
) {
    if let Some(ids) = subscriptions.get_mut(key) {
        ids.remove(&id);
        if ids.is_empty() {
            subscriptions.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candela_shared::window::TimeUnit;

    fn sub(symbol: &str, size: u32, unit: TimeUnit) -> Subscription {
        Subscription::new(symbol.into(), TimeWindow::new(size, unit))
    }

    async fn client(
        registry: &ConnectionRegistry,
    ) -> (ClientHandle, mpsc::UnboundedReceiver<Utf8Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (registry.connect(tx).await, rx)
    }

    async fn subscribers(
        registry: &ConnectionRegistry,
        key: &Subscription,
    ) -> Option<HashSet<ClientId>> {
        registry.inner.lock().await.subscriptions.get(key).cloned()
    }

    async fn subscription_count(registry: &ConnectionRegistry) -> usize {
        registry.inner.lock().await.subscriptions.len()
    }

    fn candle_json(symbol: &str, size: u32, unit: &str) -> Utf8Bytes {
        format!(
            concat!(
                "{{\"symbol\":\"{}\",\"timeframe\":{{\"size\":{},\"unit\":\"{}\"}},",
                "\"ohlc\":{{\"time\":1710504000,\"open\":1.0,\"high\":2.0,",
                "\"low\":0.5,\"close\":1.5}}}}"
            ),
            symbol, size, unit
        )
        .into()
    }

    #[tokio::test]
    async fn coarse_subscription_installs_a_one_second_shadow() {
        let registry = ConnectionRegistry::new();
        let (c, _rx) = client(&registry).await;

        registry.subscribe(c.id, sub("BTC", 5, TimeUnit::Minute)).await;

        let five = subscribers(&registry, &sub("BTC", 5, TimeUnit::Minute)).await;
        let shadow = subscribers(&registry, &sub("BTC", 1, TimeUnit::Second)).await;
        assert_eq!(five.unwrap(), HashSet::from([c.id]));
        assert_eq!(shadow.unwrap(), HashSet::from([c.id]));
    }

    #[tokio::test]
    async fn switching_coarse_timeframes_preserves_the_shadow() {
        let registry = ConnectionRegistry::new();
        let (c, _rx) = client(&registry).await;

        let five = sub("BTC", 5, TimeUnit::Minute);
        let fifteen = sub("BTC", 15, TimeUnit::Minute);
        registry.subscribe(c.id, five.clone()).await;

        registry.unsubscribe(c.id, &five, Some(&fifteen)).await;
        registry.subscribe(c.id, fifteen.clone()).await;

        assert!(subscribers(&registry, &five).await.is_none());
        assert_eq!(subscribers(&registry, &fifteen).await.unwrap(), HashSet::from([c.id]));
        assert_eq!(
            subscribers(&registry, &sub("BTC", 1, TimeUnit::Second)).await.unwrap(),
            HashSet::from([c.id])
        );
    }

    #[tokio::test]
    async fn switching_to_one_second_absorbs_the_shadow() {
        let registry = ConnectionRegistry::new();
        let (c, _rx) = client(&registry).await;

        let fifteen = sub("BTC", 15, TimeUnit::Minute);
        let second = sub("BTC", 1, TimeUnit::Second);
        registry.subscribe(c.id, fifteen.clone()).await;

        registry.unsubscribe(c.id, &fifteen, Some(&second)).await;
        registry.subscribe(c.id, second.clone()).await;

        assert_eq!(subscription_count(&registry).await, 1);
        assert_eq!(subscribers(&registry, &second).await.unwrap(), HashSet::from([c.id]));
    }

    #[tokio::test]
    async fn subscribe_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (c, _rx) = client(&registry).await;

        let five = sub("BTC", 5, TimeUnit::Minute);
        registry.subscribe(c.id, five.clone()).await;
        registry.subscribe(c.id, five.clone()).await;

        assert_eq!(subscribers(&registry, &five).await.unwrap(), HashSet::from([c.id]));
        assert_eq!(subscription_count(&registry).await, 2);
    }

    #[tokio::test]
    async fn unsubscribe_with_no_next_restores_the_registry() {
        let registry = ConnectionRegistry::new();
        let (c, _rx) = client(&registry).await;

        let five = sub("BTC", 5, TimeUnit::Minute);
        registry.subscribe(c.id, five.clone()).await;
        registry.unsubscribe(c.id, &five, None).await;

        assert_eq!(subscription_count(&registry).await, 0);
    }

    #[tokio::test]
    async fn empty_sets_drop_their_key_but_other_subscribers_remain() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = client(&registry).await;
        let (b, _rx_b) = client(&registry).await;

        let five = sub("BTC", 5, TimeUnit::Minute);
        registry.subscribe(a.id, five.clone()).await;
        registry.subscribe(b.id, five.clone()).await;

        registry.unsubscribe(a.id, &five, None).await;
        assert_eq!(subscribers(&registry, &five).await.unwrap(), HashSet::from([b.id]));

        registry.unsubscribe(b.id, &five, None).await;
        assert_eq!(subscription_count(&registry).await, 0);
    }

    #[tokio::test]
    async fn broadcast_reaches_only_the_matching_subscribers() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx_a) = client(&registry).await;
        let (b, mut rx_b) = client(&registry).await;

        registry.subscribe(a.id, sub("BTC", 5, TimeUnit::Minute)).await;
        registry.subscribe(b.id, sub("ETH", 5, TimeUnit::Minute)).await;

        let raw = candle_json("BTC", 5, "minute");
        registry.broadcast(raw.clone()).await.unwrap();

        assert_eq!(rx_a.try_recv().unwrap(), raw);
        assert!(rx_b.try_recv().is_err());

        // No subscribers for the key: a quiet no-op.
        registry.broadcast(candle_json("SOL", 1, "hour")).await.unwrap();
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_rejects_undecodable_keys() {
        let registry = ConnectionRegistry::new();
        assert!(
            registry
                .broadcast(Utf8Bytes::from("not json".to_owned()))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn shadow_updates_flow_to_coarse_subscribers() {
        let registry = ConnectionRegistry::new();
        let (c, mut rx) = client(&registry).await;

        registry.subscribe(c.id, sub("BTC", 5, TimeUnit::Minute)).await;
        registry.broadcast(candle_json("BTC", 1, "second")).await.unwrap();

        assert!(rx.try_recv().is_ok());
    }
}
