//! Live subscription registry, inverted indexes, and event fan-out.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::mpsc::{error::TrySendError, Sender};
use tracing::{debug, warn};

use crate::event::Event;
use crate::filter::Filter;
use crate::metrics;

/// Connection identifier assigned by the WebSocket layer.
pub type ConnId = u64;

/// How long a broadcast id suppresses re-fan-out.
const DEDUP_WINDOW: Duration = Duration::from_secs(60);
/// Dedup table is pruned every this many match calls.
const DEDUP_SWEEP_INTERVAL: u64 = 256;

/// Subscription key: connections choose their own subscription ids, so
/// the global key is the pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SubKey {
    conn: ConnId,
    sub: String,
}

#[derive(Debug)]
struct SubEntry {
    filters: Vec<Filter>,
    matched: u64,
}

struct ConnEntry {
    addr: IpAddr,
    sink: Sender<String>,
    subs: HashSet<String>,
    delivered: u64,
}

/// Routes admitted events to the connections whose filters match.
///
/// All operations run behind one async mutex owned by the caller; the
/// sinks are bounded channel senders written with `try_send`, so no send
/// here blocks and a stalled client costs its own connection, not ours.
pub struct SubscriptionManager {
    connections: HashMap<ConnId, ConnEntry>,
    subscriptions: HashMap<SubKey, SubEntry>,
    by_author: HashMap<String, HashSet<SubKey>>,
    by_kind: HashMap<i64, HashSet<SubKey>>,
    by_e_tag: HashMap<String, HashSet<SubKey>>,
    by_p_tag: HashMap<String, HashSet<SubKey>>,
    catch_all: HashSet<SubKey>,
    recent_events: HashMap<String, Instant>,
    duplicates_dropped: u64,
    matches_total: u64,
    match_calls: u64,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self {
            connections: HashMap::new(),
            subscriptions: HashMap::new(),
            by_author: HashMap::new(),
            by_kind: HashMap::new(),
            by_e_tag: HashMap::new(),
            by_p_tag: HashMap::new(),
            catch_all: HashSet::new(),
            recent_events: HashMap::new(),
            duplicates_dropped: 0,
            matches_total: 0,
            match_calls: 0,
        }
    }

    /// Register a connection and its outbound sink. Idempotent by id.
    pub fn register_connection(&mut self, conn: ConnId, addr: IpAddr, sink: Sender<String>) {
        self.connections.entry(conn).or_insert_with(|| ConnEntry {
            addr,
            sink,
            subs: HashSet::new(),
            delivered: 0,
        });
    }

    /// Remove a connection and every subscription it owns.
    pub fn unregister_connection(&mut self, conn: ConnId) {
        let entry = match self.connections.remove(&conn) {
            Some(entry) => entry,
            None => return,
        };
        let delivered = entry.delivered;
        for sub in entry.subs {
            let key = SubKey { conn, sub };
            self.unindex(&key);
            self.subscriptions.remove(&key);
        }
        metrics::ACTIVE_SUBSCRIPTIONS.set(self.subscriptions.len() as f64);
        debug!(conn, delivered, "connection unregistered");
    }

    /// Install a subscription, replacing any existing one with the same id.
    pub fn add_subscription(&mut self, conn: ConnId, sub_id: &str, filters: Vec<Filter>) {
        let key = SubKey {
            conn,
            sub: sub_id.to_string(),
        };
        if self.subscriptions.contains_key(&key) {
            self.remove_subscription(conn, sub_id);
        }
        for filter in &filters {
            self.index(&key, filter);
        }
        self.subscriptions.insert(
            key,
            SubEntry {
                filters,
                matched: 0,
            },
        );
        if let Some(entry) = self.connections.get_mut(&conn) {
            entry.subs.insert(sub_id.to_string());
        }
        metrics::ACTIVE_SUBSCRIPTIONS.set(self.subscriptions.len() as f64);
    }

    /// Remove a subscription and prune its index entries.
    pub fn remove_subscription(&mut self, conn: ConnId, sub_id: &str) {
        let key = SubKey {
            conn,
            sub: sub_id.to_string(),
        };
        let removed = match self.subscriptions.remove(&key) {
            Some(entry) => entry,
            None => return,
        };
        self.unindex(&key);
        if let Some(entry) = self.connections.get_mut(&conn) {
            entry.subs.remove(sub_id);
        }
        metrics::ACTIVE_SUBSCRIPTIONS.set(self.subscriptions.len() as f64);
        debug!(conn, sub_id, matched = removed.matched, "subscription removed");
    }

    /// Number of live subscriptions owned by a connection.
    pub fn subscription_count(&self, conn: ConnId) -> usize {
        self.connections
            .get(&conn)
            .map(|e| e.subs.len())
            .unwrap_or(0)
    }

    /// True when the connection already holds this subscription id.
    pub fn has_subscription(&self, conn: ConnId, sub_id: &str) -> bool {
        self.connections
            .get(&conn)
            .map(|e| e.subs.contains(sub_id))
            .unwrap_or(false)
    }

    fn index(&mut self, key: &SubKey, filter: &Filter) {
        if filter.is_catch_all() {
            self.catch_all.insert(key.clone());
            return;
        }
        // Filters selecting only by ids or time bounds land in no index;
        // they ride the catch-all path of another filter or miss live
        // fan-out while still getting historical results.
        if !filter.is_indexable() {
            return;
        }
        if let Some(authors) = &filter.authors {
            for a in authors {
                self.by_author.entry(a.clone()).or_default().insert(key.clone());
            }
        }
        if let Some(kinds) = &filter.kinds {
            for k in kinds {
                self.by_kind.entry(*k).or_default().insert(key.clone());
            }
        }
        if let Some(es) = &filter.e_tags {
            for e in es {
                self.by_e_tag.entry(e.clone()).or_default().insert(key.clone());
            }
        }
        if let Some(ps) = &filter.p_tags {
            for p in ps {
                self.by_p_tag.entry(p.clone()).or_default().insert(key.clone());
            }
        }
    }

    fn unindex(&mut self, key: &SubKey) {
        self.catch_all.remove(key);
        prune(&mut self.by_author, key);
        prune(&mut self.by_kind, key);
        prune(&mut self.by_e_tag, key);
        prune(&mut self.by_p_tag, key);
    }

    /// Find every `(connection, subscription)` the event should reach.
    pub fn match_event(&mut self, ev: &Event, now: Instant) -> Vec<(ConnId, String)> {
        if let Some(seen) = self.recent_events.get(&ev.id) {
            if now.duration_since(*seen) < DEDUP_WINDOW {
                self.duplicates_dropped += 1;
                metrics::DUPLICATES_DROPPED.inc();
                return vec![];
            }
        }
        self.recent_events.insert(ev.id.clone(), now);
        self.match_calls += 1;
        if self.match_calls % DEDUP_SWEEP_INTERVAL == 0 {
            self.recent_events
                .retain(|_, seen| now.duration_since(*seen) < DEDUP_WINDOW);
        }

        let mut candidates: HashSet<&SubKey> = HashSet::new();
        if let Some(keys) = self.by_author.get(&ev.pubkey) {
            candidates.extend(keys);
        }
        if let Some(keys) = self.by_kind.get(&ev.kind) {
            candidates.extend(keys);
        }
        for value in ev.tag_values("e") {
            if let Some(keys) = self.by_e_tag.get(value) {
                candidates.extend(keys);
            }
        }
        for value in ev.tag_values("p") {
            if let Some(keys) = self.by_p_tag.get(value) {
                candidates.extend(keys);
            }
        }
        candidates.extend(self.catch_all.iter());

        let mut matched: Vec<SubKey> = vec![];
        for key in candidates {
            if let Some(entry) = self.subscriptions.get(key) {
                if entry.filters.iter().any(|f| f.matches(ev)) {
                    matched.push(key.clone());
                }
            }
        }
        for key in &matched {
            if let Some(entry) = self.subscriptions.get_mut(key) {
                entry.matched += 1;
            }
        }
        self.matches_total += matched.len() as u64;
        matched
            .into_iter()
            .map(|k| (k.conn, k.sub))
            .collect()
    }

    /// Fan an event out to every matching connection, once per connection.
    ///
    /// Returns the number of connections reached. A failed send is logged
    /// and skipped; the connection's writer task is already gone.
    pub fn broadcast_event(&mut self, ev: &Event) -> usize {
        self.broadcast_event_at(ev, Instant::now())
    }

    pub fn broadcast_event_at(&mut self, ev: &Event, now: Instant) -> usize {
        let matches = self.match_event(ev, now);
        let mut per_conn: HashMap<ConnId, String> = HashMap::new();
        for (conn, sub) in matches {
            per_conn.entry(conn).or_insert(sub);
        }
        let mut reached = 0;
        let mut failed: Vec<ConnId> = vec![];
        for (conn, sub) in per_conn {
            let entry = match self.connections.get_mut(&conn) {
                Some(e) => e,
                None => continue,
            };
            let frame = json!(["EVENT", sub, ev]).to_string();
            match entry.sink.try_send(frame) {
                Ok(()) => {
                    entry.delivered += 1;
                    reached += 1;
                }
                Err(TrySendError::Full(_)) => {
                    warn!(conn, addr = %entry.addr, "outbound queue full, dropping connection");
                    failed.push(conn);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(conn, "sink closed, dropping connection");
                    failed.push(conn);
                }
            }
        }
        // a stalled or gone subscriber never affects the others
        for conn in failed {
            self.unregister_connection(conn);
        }
        if reached > 0 {
            metrics::EVENTS_BROADCAST.inc();
        }
        reached
    }

    pub fn duplicates_dropped(&self) -> u64 {
        self.duplicates_dropped
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Counters for the admin status endpoint.
    pub fn stats(&self) -> serde_json::Value {
        json!({
            "connections": self.connection_count(),
            "subscriptions": self.subscriptions.len(),
            "matches_total": self.matches_total,
            "duplicates_dropped": self.duplicates_dropped(),
        })
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Drop `key` from every set in the index, removing emptied entries.
fn prune<K: std::hash::Hash + Eq + Clone>(
    index: &mut HashMap<K, HashSet<SubKey>>,
    key: &SubKey,
) {
    index.retain(|_, keys| {
        keys.remove(key);
        !keys.is_empty()
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Tag;
    use tokio::sync::mpsc;

    fn event(id: &str, pubkey: &str, kind: i64, tags: Vec<Tag>) -> Event {
        Event {
            id: id.into(),
            pubkey: pubkey.into(),
            created_at: 100,
            kind,
            tags,
            content: String::new(),
            sig: String::new(),
        }
    }

    fn kinds_filter(kinds: Vec<i64>) -> Filter {
        Filter {
            kinds: Some(kinds),
            ..Default::default()
        }
    }

    fn addr() -> IpAddr {
        IpAddr::from([127, 0, 0, 1])
    }

    fn setup_conn(mgr: &mut SubscriptionManager, conn: ConnId) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(8);
        mgr.register_connection(conn, addr(), tx);
        rx
    }

    #[test]
    fn matches_by_kind_index() {
        let mut mgr = SubscriptionManager::new();
        let _rx = setup_conn(&mut mgr, 1);
        mgr.add_subscription(1, "s", vec![kinds_filter(vec![1])]);
        let hits = mgr.match_event(&event("e1", "pk", 1, vec![]), Instant::now());
        assert_eq!(hits, vec![(1, "s".to_string())]);
        let misses = mgr.match_event(&event("e2", "pk", 7, vec![]), Instant::now());
        assert!(misses.is_empty());
    }

    #[test]
    fn matches_by_author_and_tag_indexes() {
        let mut mgr = SubscriptionManager::new();
        let _rx = setup_conn(&mut mgr, 1);
        mgr.add_subscription(
            1,
            "authors",
            vec![Filter {
                authors: Some(vec!["alice".into()]),
                ..Default::default()
            }],
        );
        mgr.add_subscription(
            1,
            "etag",
            vec![Filter {
                e_tags: Some(vec!["root".into()]),
                ..Default::default()
            }],
        );
        mgr.add_subscription(
            1,
            "ptag",
            vec![Filter {
                p_tags: Some(vec!["bob".into()]),
                ..Default::default()
            }],
        );
        let ev = event(
            "e1",
            "alice",
            1,
            vec![
                Tag(vec!["e".into(), "root".into()]),
                Tag(vec!["p".into(), "bob".into()]),
            ],
        );
        let mut hits = mgr.match_event(&ev, Instant::now());
        hits.sort();
        assert_eq!(
            hits,
            vec![
                (1, "authors".to_string()),
                (1, "etag".to_string()),
                (1, "ptag".to_string())
            ]
        );
    }

    #[test]
    fn catch_all_matches_everything() {
        let mut mgr = SubscriptionManager::new();
        let _rx = setup_conn(&mut mgr, 1);
        mgr.add_subscription(1, "all", vec![Filter::default()]);
        let hits = mgr.match_event(&event("e1", "whoever", 12345, vec![]), Instant::now());
        assert_eq!(hits, vec![(1, "all".to_string())]);
    }

    #[test]
    fn ids_only_filter_misses_live_fanout() {
        // a known limitation: ids/time-only filters are not indexed
        let mut mgr = SubscriptionManager::new();
        let _rx = setup_conn(&mut mgr, 1);
        mgr.add_subscription(
            1,
            "ids",
            vec![Filter {
                ids: Some(vec!["e1".into()]),
                ..Default::default()
            }],
        );
        assert!(mgr.match_event(&event("e1", "pk", 1, vec![]), Instant::now()).is_empty());
    }

    #[test]
    fn dedup_window_drops_second_broadcast() {
        let mut mgr = SubscriptionManager::new();
        let mut rx = setup_conn(&mut mgr, 1);
        mgr.add_subscription(1, "s", vec![kinds_filter(vec![1])]);
        let ev = event("e1", "pk", 1, vec![]);
        let t0 = Instant::now();
        assert_eq!(mgr.broadcast_event_at(&ev, t0), 1);
        assert_eq!(mgr.broadcast_event_at(&ev, t0 + Duration::from_secs(1)), 0);
        assert_eq!(mgr.duplicates_dropped(), 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        // past the window the id fans out again
        assert_eq!(
            mgr.broadcast_event_at(&ev, t0 + DEDUP_WINDOW + Duration::from_secs(1)),
            1
        );
    }

    #[test]
    fn one_frame_per_connection_with_many_matching_subs() {
        let mut mgr = SubscriptionManager::new();
        let mut rx = setup_conn(&mut mgr, 1);
        mgr.add_subscription(1, "a", vec![kinds_filter(vec![1])]);
        mgr.add_subscription(1, "b", vec![Filter::default()]);
        let reached = mgr.broadcast_event(&event("e1", "pk", 1, vec![]));
        assert_eq!(reached, 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn subscription_replacement_swaps_filters() {
        let mut mgr = SubscriptionManager::new();
        let _rx = setup_conn(&mut mgr, 1);
        mgr.add_subscription(1, "s", vec![kinds_filter(vec![1])]);
        mgr.add_subscription(1, "s", vec![kinds_filter(vec![7])]);
        assert!(mgr.match_event(&event("e1", "pk", 1, vec![]), Instant::now()).is_empty());
        assert_eq!(
            mgr.match_event(&event("e2", "pk", 7, vec![]), Instant::now()),
            vec![(1, "s".to_string())]
        );
        assert_eq!(mgr.subscription_count(1), 1);
    }

    #[test]
    fn same_sub_id_on_two_connections_is_independent() {
        let mut mgr = SubscriptionManager::new();
        let _rx1 = setup_conn(&mut mgr, 1);
        let _rx2 = setup_conn(&mut mgr, 2);
        mgr.add_subscription(1, "s", vec![kinds_filter(vec![1])]);
        mgr.add_subscription(2, "s", vec![kinds_filter(vec![1])]);
        let mut hits = mgr.match_event(&event("e1", "pk", 1, vec![]), Instant::now());
        hits.sort();
        assert_eq!(hits, vec![(1, "s".to_string()), (2, "s".to_string())]);
        mgr.remove_subscription(1, "s");
        assert_eq!(
            mgr.match_event(&event("e2", "pk", 1, vec![]), Instant::now()),
            vec![(2, "s".to_string())]
        );
    }

    #[test]
    fn unregister_clears_every_index() {
        let mut mgr = SubscriptionManager::new();
        let _rx = setup_conn(&mut mgr, 1);
        mgr.add_subscription(
            1,
            "s",
            vec![Filter {
                authors: Some(vec!["alice".into()]),
                kinds: Some(vec![1]),
                e_tags: Some(vec!["root".into()]),
                p_tags: Some(vec!["bob".into()]),
                ..Default::default()
            }],
        );
        mgr.add_subscription(1, "all", vec![Filter::default()]);
        mgr.unregister_connection(1);
        assert!(mgr.by_author.is_empty());
        assert!(mgr.by_kind.is_empty());
        assert!(mgr.by_e_tag.is_empty());
        assert!(mgr.by_p_tag.is_empty());
        assert!(mgr.catch_all.is_empty());
        let ev = event(
            "e1",
            "alice",
            1,
            vec![Tag(vec!["e".into(), "root".into()])],
        );
        assert!(mgr.match_event(&ev, Instant::now()).is_empty());
        assert_eq!(mgr.connection_count(), 0);
    }

    #[test]
    fn full_queue_drops_the_connection() {
        let mut mgr = SubscriptionManager::new();
        let _rx = setup_conn(&mut mgr, 1);
        mgr.add_subscription(1, "s", vec![Filter::default()]);
        // the receiver never drains; capacity is 8 frames
        for i in 0..8 {
            assert_eq!(mgr.broadcast_event(&event(&format!("e{i}"), "pk", 1, vec![])), 1);
        }
        assert_eq!(mgr.broadcast_event(&event("e9", "pk", 1, vec![])), 0);
        assert_eq!(mgr.connection_count(), 0);
    }

    #[test]
    fn closed_sink_does_not_fail_other_subscribers() {
        let mut mgr = SubscriptionManager::new();
        let rx1 = setup_conn(&mut mgr, 1);
        let mut rx2 = setup_conn(&mut mgr, 2);
        mgr.add_subscription(1, "s", vec![kinds_filter(vec![1])]);
        mgr.add_subscription(2, "s", vec![kinds_filter(vec![1])]);
        drop(rx1);
        let reached = mgr.broadcast_event(&event("e1", "pk", 1, vec![]));
        assert_eq!(reached, 1);
        let frame = rx2.try_recv().unwrap();
        assert!(frame.contains("\"EVENT\""));
        assert!(frame.contains("e1"));
    }

    #[test]
    fn register_is_idempotent() {
        let mut mgr = SubscriptionManager::new();
        let _rx1 = setup_conn(&mut mgr, 1);
        mgr.add_subscription(1, "s", vec![kinds_filter(vec![1])]);
        let (tx2, _rx2) = mpsc::channel(8);
        mgr.register_connection(1, addr(), tx2);
        // the original registration and its subscriptions survive
        assert_eq!(mgr.subscription_count(1), 1);
    }
}
