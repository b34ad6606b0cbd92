//! Subscription filters and their match predicate.

use serde_json::Value;

use crate::event::Event;

/// Selection predicate over events, used by subscriptions and queries.
///
/// Every field is optional; an empty filter matches every event. A filter
/// matches when the event satisfies all present fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    /// Full event ids.
    pub ids: Option<Vec<String>>,
    /// Author public keys.
    pub authors: Option<Vec<String>>,
    /// Kind numbers.
    pub kinds: Option<Vec<i64>>,
    /// Referenced event ids (`e` tags).
    pub e_tags: Option<Vec<String>>,
    /// Referenced author keys (`p` tags).
    pub p_tags: Option<Vec<String>>,
    /// Inclusive lower bound on `created_at`.
    pub since: Option<i64>,
    /// Inclusive upper bound on `created_at`.
    pub until: Option<i64>,
    /// Cap on historical results.
    pub limit: Option<u64>,
}

impl Filter {
    /// Build a `Filter` from a Nostr filter JSON object.
    ///
    /// Tag selectors are accepted under both the `#e`/`#p` and `e`/`p` keys.
    pub fn from_value(val: &Value) -> Self {
        let strings = |key: &str| {
            val.get(key).and_then(|v| v.as_array()).map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect::<Vec<_>>()
            })
        };
        let tag = |hashed: &str, bare: &str| strings(hashed).or_else(|| strings(bare));
        let kinds = val.get("kinds").and_then(|v| v.as_array()).map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_i64())
                .collect::<Vec<_>>()
        });
        Filter {
            ids: strings("ids"),
            authors: strings("authors"),
            kinds,
            e_tags: tag("#e", "e"),
            p_tags: tag("#p", "p"),
            since: val.get("since").and_then(|v| v.as_i64()),
            until: val.get("until").and_then(|v| v.as_i64()),
            limit: val.get("limit").and_then(|v| v.as_u64()),
        }
    }

    /// True when no selector field is present.
    ///
    /// Catch-all filters are the only way a subscription enters live
    /// fan-out without an index hit.
    pub fn is_catch_all(&self) -> bool {
        self.ids.is_none()
            && self.authors.is_none()
            && self.kinds.is_none()
            && self.e_tags.is_none()
            && self.p_tags.is_none()
            && self.since.is_none()
            && self.until.is_none()
    }

    /// True when the filter carries at least one indexable selector.
    pub fn is_indexable(&self) -> bool {
        self.authors.is_some()
            || self.kinds.is_some()
            || self.e_tags.is_some()
            || self.p_tags.is_some()
    }

    /// Full match predicate: every present field must be satisfied.
    pub fn matches(&self, ev: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| *id == ev.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| *a == ev.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&ev.kind) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if ev.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if ev.created_at > until {
                return false;
            }
        }
        if let Some(es) = &self.e_tags {
            if !ev.tag_values("e").any(|v| es.iter().any(|e| e == v)) {
                return false;
            }
        }
        if let Some(ps) = &self.p_tags {
            if !ev.tag_values("p").any(|v| ps.iter().any(|p| p == v)) {
                return false;
            }
        }
        true
    }
}
