//! Subscription registry
//!
//! Tracks which connected session wants which (symbol, kind) stream.
//! Backed by a sharded concurrent map so subscribe/unsubscribe churn on
//! different symbols never contends on one lock. Subscribe and
//! unsubscribe are idempotent set operations; removing a session drops
//! all of its subscriptions with it.

use std::collections::BTreeSet;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use types::ids::Symbol;

/// Session identifier, assigned at registration.
pub type ClientId = u64;

/// Stream kinds a client can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Tick,
    Kline,
    Depth,
}

impl MessageKind {
    /// Stable wire/metrics label.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Tick => "tick",
            MessageKind::Kline => "kline",
            MessageKind::Depth => "depth",
        }
    }
}

/// Sharded (symbol, kind) → subscriber-set registry.
pub struct SubscriptionRegistry {
    /// Forward index: who gets this stream. Sharded by key hash.
    streams: DashMap<(Symbol, MessageKind), BTreeSet<ClientId>>,
    /// Reverse index: what a session holds, for atomic teardown.
    by_client: DashMap<ClientId, BTreeSet<(Symbol, MessageKind)>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            streams: DashMap::new(),
            by_client: DashMap::new(),
        }
    }

    /// Subscribe a session to a stream. Idempotent.
    pub fn subscribe(&self, client: ClientId, symbol: Symbol, kind: MessageKind) {
        self.streams
            .entry((symbol.clone(), kind))
            .or_default()
            .insert(client);
        self.by_client
            .entry(client)
            .or_default()
            .insert((symbol, kind));
    }

    /// Unsubscribe a session from a stream. Idempotent; takes effect for
    /// the next published message.
    pub fn unsubscribe(&self, client: ClientId, symbol: &Symbol, kind: MessageKind) {
        let key = (symbol.clone(), kind);
        if let Some(mut set) = self.streams.get_mut(&key) {
            set.remove(&client);
        }
        self.streams.remove_if(&key, |_, set| set.is_empty());
        if let Some(mut subs) = self.by_client.get_mut(&client) {
            subs.remove(&key);
        }
    }

    /// Remove a session and every subscription it holds.
    pub fn remove_client(&self, client: ClientId) {
        let Some((_, subs)) = self.by_client.remove(&client) else {
            return;
        };
        for key in subs {
            if let Some(mut set) = self.streams.get_mut(&key) {
                set.remove(&client);
            }
            self.streams.remove_if(&key, |_, set| set.is_empty());
        }
    }

    /// Sessions subscribed to a stream, in id order.
    pub fn subscribers(&self, symbol: &Symbol, kind: MessageKind) -> Vec<ClientId> {
        self.streams
            .get(&(symbol.clone(), kind))
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Whether a session is subscribed to a stream.
    pub fn is_subscribed(&self, client: ClientId, symbol: &Symbol, kind: MessageKind) -> bool {
        self.streams
            .get(&(symbol.clone(), kind))
            .map(|set| set.contains(&client))
            .unwrap_or(false)
    }

    /// Number of subscriptions a session holds.
    pub fn subscription_count(&self, client: ClientId) -> usize {
        self.by_client.get(&client).map(|s| s.len()).unwrap_or(0)
    }

    /// Number of distinct (symbol, kind) streams with any subscriber.
    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rb() -> Symbol {
        Symbol::new("rb2405")
    }

    #[test]
    fn test_subscribe_and_lookup() {
        let reg = SubscriptionRegistry::new();
        reg.subscribe(1, rb(), MessageKind::Tick);
        reg.subscribe(2, rb(), MessageKind::Tick);
        reg.subscribe(2, rb(), MessageKind::Kline);

        assert_eq!(reg.subscribers(&rb(), MessageKind::Tick), vec![1, 2]);
        assert_eq!(reg.subscribers(&rb(), MessageKind::Kline), vec![2]);
        assert!(reg.subscribers(&rb(), MessageKind::Depth).is_empty());
    }

    #[test]
    fn test_subscribe_is_idempotent() {
        let reg = SubscriptionRegistry::new();
        reg.subscribe(1, rb(), MessageKind::Tick);
        reg.subscribe(1, rb(), MessageKind::Tick);

        assert_eq!(reg.subscribers(&rb(), MessageKind::Tick), vec![1]);
        assert_eq!(reg.subscription_count(1), 1);
    }

    #[test]
    fn test_unsubscribe_takes_effect_immediately() {
        let reg = SubscriptionRegistry::new();
        reg.subscribe(1, rb(), MessageKind::Tick);
        assert!(reg.is_subscribed(1, &rb(), MessageKind::Tick));

        reg.unsubscribe(1, &rb(), MessageKind::Tick);
        assert!(!reg.is_subscribed(1, &rb(), MessageKind::Tick));
        assert!(reg.subscribers(&rb(), MessageKind::Tick).is_empty());

        // Unsubscribing twice is harmless.
        reg.unsubscribe(1, &rb(), MessageKind::Tick);
    }

    #[test]
    fn test_remove_client_drops_all_subscriptions() {
        let reg = SubscriptionRegistry::new();
        let cu = Symbol::new("cu2405");
        reg.subscribe(1, rb(), MessageKind::Tick);
        reg.subscribe(1, cu.clone(), MessageKind::Kline);
        reg.subscribe(2, rb(), MessageKind::Tick);

        reg.remove_client(1);

        assert_eq!(reg.subscribers(&rb(), MessageKind::Tick), vec![2]);
        assert!(reg.subscribers(&cu, MessageKind::Kline).is_empty());
        assert_eq!(reg.subscription_count(1), 0);
    }

    #[test]
    fn test_empty_streams_are_compacted() {
        let reg = SubscriptionRegistry::new();
        reg.subscribe(1, rb(), MessageKind::Tick);
        assert_eq!(reg.active_streams(), 1);

        reg.unsubscribe(1, &rb(), MessageKind::Tick);
        assert_eq!(reg.active_streams(), 0);
    }
}
