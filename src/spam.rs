//! Heuristic spam gate for admitted events.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::Settings;
use crate::event::Event;

static URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://\S+").unwrap());

/// Verdict for one event; `Suspicious` is pass-with-log for callers.
#[derive(Debug, Clone, PartialEq)]
pub enum SpamVerdict {
    Pass,
    Suspicious(String),
    Reject(String),
}

/// Stateful spam heuristics applied after validation and rate limiting.
pub struct SpamFilter {
    /// Content hash to the time it was last admitted.
    seen_hashes: HashMap<String, Instant>,
    /// Admission times inside the trailing minute.
    admitted: VecDeque<Instant>,
    keywords: Vec<String>,
    duplicate_window: Duration,
    max_events_per_minute: usize,
    min_content_length: usize,
    max_mentions: usize,
    max_urls: usize,
    max_tags: usize,
    max_hashtags: usize,
    shorteners: Vec<String>,
}

impl SpamFilter {
    pub fn new(settings: &Settings) -> Self {
        Self {
            seen_hashes: HashMap::new(),
            admitted: VecDeque::new(),
            keywords: settings
                .spam_keywords
                .iter()
                .map(|k| k.to_lowercase())
                .collect(),
            duplicate_window: Duration::from_secs(settings.duplicate_window_secs),
            max_events_per_minute: settings.max_events_per_minute,
            min_content_length: settings.min_content_length,
            max_mentions: settings.max_mentions_per_event,
            max_urls: settings.max_urls_per_event,
            max_tags: settings.max_tags_per_event,
            max_hashtags: settings.max_hashtags_per_event,
            shorteners: settings.shortener_domains.clone(),
        }
    }

    pub fn check(&mut self, ev: &Event) -> SpamVerdict {
        self.check_at(ev, Instant::now())
    }

    /// Run every heuristic in order, returning on the first hit.
    pub fn check_at(&mut self, ev: &Event, now: Instant) -> SpamVerdict {
        let hash = content_hash(&ev.content);
        if let Some(seen) = self.seen_hashes.get(&hash) {
            if now.duration_since(*seen) < self.duplicate_window {
                return SpamVerdict::Reject("duplicate content".into());
            }
        }
        while let Some(front) = self.admitted.front() {
            if now.duration_since(*front) > Duration::from_secs(60) {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
        if self.admitted.len() >= self.max_events_per_minute {
            return SpamVerdict::Reject("too many events per minute".into());
        }
        self.seen_hashes.insert(hash, now);
        self.admitted.push_back(now);

        let lowered = ev.content.to_lowercase();
        for kw in &self.keywords {
            if lowered.contains(kw) {
                return SpamVerdict::Reject(format!("content matches banned keyword: {kw}"));
            }
        }

        let letters = ev.content.chars().filter(|c| c.is_alphabetic()).count();
        let uppercase = ev.content.chars().filter(|c| c.is_uppercase()).count();
        if ev.content.len() > 10 && letters > 0 && uppercase as f64 / letters as f64 > 0.7 {
            return SpamVerdict::Suspicious("excessive capitalization".into());
        }

        if has_long_run(&ev.content, 10) {
            return SpamVerdict::Suspicious("excessive character repetition".into());
        }
        let words: Vec<&str> = ev.content.split_whitespace().collect();
        if words.len() > 5 {
            let unique: std::collections::HashSet<&str> = words.iter().copied().collect();
            let repeats = (words.len() - unique.len()) as f64 / words.len() as f64;
            if repeats > 0.5 {
                return SpamVerdict::Suspicious("repetitive wording".into());
            }
        }

        if ev.kind == 1 && ev.content.len() < self.min_content_length {
            return SpamVerdict::Suspicious("content below length floor".into());
        }

        let mentions = ev.tags.iter().filter(|t| t.name() == Some("p")).count();
        if mentions > self.max_mentions {
            return SpamVerdict::Reject(format!("too many mentions: {mentions}"));
        }
        if mentions > 5 {
            return SpamVerdict::Suspicious(format!("many mentions: {mentions}"));
        }

        let urls: Vec<&str> = URL_RE.find_iter(&ev.content).map(|m| m.as_str()).collect();
        if urls.len() > self.max_urls {
            return SpamVerdict::Reject(format!("too many urls: {}", urls.len()));
        }
        for url in &urls {
            if self.shorteners.iter().any(|d| url.contains(d.as_str())) {
                return SpamVerdict::Suspicious("shortened url".into());
            }
        }

        if ev.tags.len() > self.max_tags {
            return SpamVerdict::Reject(format!("too many tags: {}", ev.tags.len()));
        }
        let hashtags = ev.tags.iter().filter(|t| t.name() == Some("t")).count();
        if hashtags > self.max_hashtags {
            return SpamVerdict::Suspicious(format!("too many hashtags: {hashtags}"));
        }

        SpamVerdict::Pass
    }

    /// Drop content hashes older than the duplicate window. Runs every
    /// five minutes.
    pub fn cleanup(&mut self) {
        self.cleanup_at(Instant::now());
    }

    pub fn cleanup_at(&mut self, now: Instant) {
        let window = self.duplicate_window;
        self.seen_hashes
            .retain(|_, seen| now.duration_since(*seen) < window);
        while let Some(front) = self.admitted.front() {
            if now.duration_since(*front) > Duration::from_secs(60) {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
        debug!(hashes = self.seen_hashes.len(), "spam filter cleanup");
    }
}

fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// True when any character repeats more than `limit` times in a row.
fn has_long_run(s: &str, limit: usize) -> bool {
    let mut run = 0;
    let mut prev = None;
    for c in s.chars() {
        if Some(c) == prev {
            run += 1;
            if run > limit {
                return true;
            }
        } else {
            prev = Some(c);
            run = 1;
        }
    }
    false
}
