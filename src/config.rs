//! Configuration loading from `.env` files and the environment.

use std::{env, str::FromStr};

use anyhow::{Context, Result};

/// Runtime settings derived from environment variables.
///
/// Every knob has a default; the relay starts with no configuration at
/// all. Settings are immutable after startup.
#[derive(Debug, Clone)]
pub struct Settings {
    /// WebSocket bind address, e.g. `127.0.0.1:7447`.
    pub bind_ws: String,
    /// HTTP bind address for health, metrics, and relay info.
    pub bind_http: String,
    /// SQLite database URL.
    pub database_url: String,
    /// Public URL clients use to reach this relay (checked during auth).
    pub relay_url: String,
    /// Relay name served in the information document.
    pub relay_name: String,
    /// Relay description served in the information document.
    pub relay_description: String,

    /// Maximum serialized event size in bytes.
    pub max_event_bytes: usize,
    /// Maximum live subscriptions per connection.
    pub max_subscriptions: usize,
    /// Maximum filters per subscription.
    pub max_filters: usize,
    /// Cap applied to every historical query limit.
    pub max_limit: u64,
    /// Maximum subscription id length.
    pub max_subid_length: usize,
    /// Maximum tags per event.
    pub max_event_tags: usize,
    /// Maximum content length in UTF-8 bytes.
    pub max_content_length: usize,

    /// Source-address bucket capacity.
    pub rate_ip_capacity: f64,
    /// Source-address bucket refill, tokens per second.
    pub rate_ip_refill: f64,
    /// Author-key bucket capacity.
    pub rate_pubkey_capacity: f64,
    /// Author-key bucket refill, tokens per second.
    pub rate_pubkey_refill: f64,
    /// Tokens a REQ consumes from the source-address bucket.
    pub subscription_cost: f64,
    /// Concurrent connections allowed per source address.
    pub max_connections_per_source: usize,
    /// Cap on tracked rate buckets before LRU eviction.
    pub max_rate_buckets: usize,
    /// Source addresses that bypass rate limiting.
    pub ip_allowlist: Vec<String>,
    /// Source addresses rejected unconditionally.
    pub ip_denylist: Vec<String>,

    /// Minimum proof-of-work difficulty; zero disables the check.
    pub pow_min_difficulty: u32,

    /// Require authentication before accepting events.
    pub auth_required: bool,
    /// Pubkeys allowed to authenticate; empty allows any.
    pub auth_pubkey_allowlist: Vec<String>,

    /// Origins allowed on CORS and WebSocket upgrade; empty allows any.
    pub cors_allow_origins: Vec<String>,

    /// Substrings rejected outright in event content.
    pub spam_keywords: Vec<String>,
    /// Seconds a content hash blocks identical submissions.
    pub duplicate_window_secs: u64,
    /// Admitted content hashes allowed in a trailing minute.
    pub max_events_per_minute: usize,
    /// Kind-1 content length floor.
    pub min_content_length: usize,
    /// `p` tags allowed before rejection.
    pub max_mentions_per_event: usize,
    /// URLs allowed before rejection.
    pub max_urls_per_event: usize,
    /// Tags allowed before spam rejection.
    pub max_tags_per_event: usize,
    /// `t` tags allowed before the submission turns suspicious.
    pub max_hashtags_per_event: usize,
    /// URL shortener domains that flag a submission.
    pub shortener_domains: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_ws: "127.0.0.1:7447".into(),
            bind_http: "127.0.0.1:7448".into(),
            database_url: "sqlite://nostrum.db?mode=rwc".into(),
            relay_url: "ws://127.0.0.1:7447".into(),
            relay_name: "nostrum".into(),
            relay_description: "a nostrum relay".into(),
            max_event_bytes: 65536,
            max_subscriptions: 20,
            max_filters: 10,
            max_limit: 500,
            max_subid_length: 64,
            max_event_tags: 1000,
            max_content_length: 65536,
            rate_ip_capacity: 20.0,
            rate_ip_refill: 3.0,
            rate_pubkey_capacity: 30.0,
            rate_pubkey_refill: 5.0,
            subscription_cost: 2.0,
            max_connections_per_source: 8,
            max_rate_buckets: 10000,
            ip_allowlist: vec![],
            ip_denylist: vec![],
            pow_min_difficulty: 0,
            auth_required: false,
            auth_pubkey_allowlist: vec![],
            cors_allow_origins: vec![],
            spam_keywords: vec![],
            duplicate_window_secs: 600,
            max_events_per_minute: 60,
            min_content_length: 1,
            max_mentions_per_event: 50,
            max_urls_per_event: 10,
            max_tags_per_event: 100,
            max_hashtags_per_event: 20,
            shortener_domains: vec!["bit.ly".into(), "tinyurl.com".into(), "t.co".into()],
        }
    }
}

impl Settings {
    /// Load settings from the specified `.env` file, when present, and the
    /// process environment.
    pub fn from_env(path: &str) -> Result<Self> {
        if std::path::Path::new(path).exists() {
            dotenvy::from_filename(path).context("reading env file")?;
        }
        let d = Settings::default();
        Ok(Self {
            bind_ws: env_string("BIND_WS", d.bind_ws),
            bind_http: env_string("BIND_HTTP", d.bind_http),
            database_url: env_string("DATABASE_URL", d.database_url),
            relay_url: env_string("RELAY_URL", d.relay_url),
            relay_name: env_string("RELAY_NAME", d.relay_name),
            relay_description: env_string("RELAY_DESCRIPTION", d.relay_description),
            max_event_bytes: env_parse("MAX_EVENT_BYTES", d.max_event_bytes)?,
            max_subscriptions: env_parse("MAX_SUBSCRIPTIONS", d.max_subscriptions)?,
            max_filters: env_parse("MAX_FILTERS", d.max_filters)?,
            max_limit: env_parse("MAX_LIMIT", d.max_limit)?,
            max_subid_length: env_parse("MAX_SUBID_LENGTH", d.max_subid_length)?,
            max_event_tags: env_parse("MAX_EVENT_TAGS", d.max_event_tags)?,
            max_content_length: env_parse("MAX_CONTENT_LENGTH", d.max_content_length)?,
            rate_ip_capacity: env_parse("RATE_IP_CAPACITY", d.rate_ip_capacity)?,
            rate_ip_refill: env_parse("RATE_IP_REFILL", d.rate_ip_refill)?,
            rate_pubkey_capacity: env_parse("RATE_PUBKEY_CAPACITY", d.rate_pubkey_capacity)?,
            rate_pubkey_refill: env_parse("RATE_PUBKEY_REFILL", d.rate_pubkey_refill)?,
            subscription_cost: env_parse("SUBSCRIPTION_COST", d.subscription_cost)?,
            max_connections_per_source: env_parse(
                "MAX_CONNECTIONS_PER_SOURCE",
                d.max_connections_per_source,
            )?,
            max_rate_buckets: env_parse("MAX_RATE_BUCKETS", d.max_rate_buckets)?,
            ip_allowlist: env_csv("IP_ALLOWLIST", d.ip_allowlist),
            ip_denylist: env_csv("IP_DENYLIST", d.ip_denylist),
            pow_min_difficulty: env_parse("POW_MIN_DIFFICULTY", d.pow_min_difficulty)?,
            auth_required: env_flag("AUTH_REQUIRED", d.auth_required),
            auth_pubkey_allowlist: env_csv("AUTH_PUBKEY_ALLOWLIST", d.auth_pubkey_allowlist),
            cors_allow_origins: env_csv("CORS_ALLOW_ORIGINS", d.cors_allow_origins),
            spam_keywords: env_csv("SPAM_KEYWORDS", d.spam_keywords),
            duplicate_window_secs: env_parse("DUPLICATE_WINDOW_SECS", d.duplicate_window_secs)?,
            max_events_per_minute: env_parse("MAX_EVENTS_PER_MINUTE", d.max_events_per_minute)?,
            min_content_length: env_parse("MIN_CONTENT_LENGTH", d.min_content_length)?,
            max_mentions_per_event: env_parse("MAX_MENTIONS_PER_EVENT", d.max_mentions_per_event)?,
            max_urls_per_event: env_parse("MAX_URLS_PER_EVENT", d.max_urls_per_event)?,
            max_tags_per_event: env_parse("MAX_TAGS_PER_EVENT", d.max_tags_per_event)?,
            max_hashtags_per_event: env_parse(
                "MAX_HASHTAGS_PER_EVENT",
                d.max_hashtags_per_event,
            )?,
            shortener_domains: env_csv("SHORTENER_DOMAINS", d.shortener_domains),
        })
    }
}

/// Read a string variable, falling back to the default.
fn env_string(key: &str, default: String) -> String {
    env::var(key)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or(default)
}

/// Read and parse a variable, falling back to the default when absent.
fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(s) if !s.is_empty() => s.parse().with_context(|| format!("parsing {}", key)),
        _ => Ok(default),
    }
}

/// Read a boolean flag: `1` and `true` enable it.
fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(s) if !s.is_empty() => s == "1" || s.eq_ignore_ascii_case("true"),
        _ => default,
    }
}

/// Read a comma-separated list, falling back to the default when absent.
fn env_csv(key: &str, default: Vec<String>) -> Vec<String> {
    match env::var(key) {
        Ok(s) => csv_strings(s),
        _ => default,
    }
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    let s = input.as_ref();
    s.split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, fs, sync::Mutex};
    use tempfile::tempdir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "BIND_WS",
        "BIND_HTTP",
        "DATABASE_URL",
        "RELAY_URL",
        "RELAY_NAME",
        "RELAY_DESCRIPTION",
        "MAX_EVENT_BYTES",
        "MAX_SUBSCRIPTIONS",
        "MAX_FILTERS",
        "MAX_LIMIT",
        "MAX_SUBID_LENGTH",
        "MAX_EVENT_TAGS",
        "MAX_CONTENT_LENGTH",
        "RATE_IP_CAPACITY",
        "RATE_IP_REFILL",
        "RATE_PUBKEY_CAPACITY",
        "RATE_PUBKEY_REFILL",
        "SUBSCRIPTION_COST",
        "MAX_CONNECTIONS_PER_SOURCE",
        "MAX_RATE_BUCKETS",
        "IP_ALLOWLIST",
        "IP_DENYLIST",
        "POW_MIN_DIFFICULTY",
        "AUTH_REQUIRED",
        "AUTH_PUBKEY_ALLOWLIST",
        "CORS_ALLOW_ORIGINS",
        "SPAM_KEYWORDS",
        "DUPLICATE_WINDOW_SECS",
        "MAX_EVENTS_PER_MINUTE",
        "MIN_CONTENT_LENGTH",
        "MAX_MENTIONS_PER_EVENT",
        "MAX_URLS_PER_EVENT",
        "MAX_TAGS_PER_EVENT",
        "MAX_HASHTAGS_PER_EVENT",
        "SHORTENER_DOMAINS",
    ];

    fn clear_env() {
        for v in VARS {
            env::remove_var(v);
        }
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let cfg = Settings::from_env("/nonexistent/.env").unwrap();
        assert_eq!(cfg.bind_ws, "127.0.0.1:7447");
        assert_eq!(cfg.max_event_bytes, 65536);
        assert_eq!(cfg.max_limit, 500);
        assert_eq!(cfg.pow_min_difficulty, 0);
        assert!(!cfg.auth_required);
        assert!(cfg.spam_keywords.is_empty());
        assert!(!cfg.shortener_domains.is_empty());
    }

    #[test]
    fn loads_env_file() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!(
                "BIND_WS=127.0.0.1:9001\n",
                "MAX_EVENT_BYTES=1024\n",
                "RATE_IP_CAPACITY=5\n",
                "RATE_IP_REFILL=1\n",
                "AUTH_REQUIRED=true\n",
                "SPAM_KEYWORDS=\"buy now, free money\"\n",
                "POW_MIN_DIFFICULTY=12\n",
            ),
        )
        .unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.bind_ws, "127.0.0.1:9001");
        assert_eq!(cfg.max_event_bytes, 1024);
        assert_eq!(cfg.rate_ip_capacity, 5.0);
        assert_eq!(cfg.rate_ip_refill, 1.0);
        assert!(cfg.auth_required);
        assert_eq!(cfg.spam_keywords, vec!["buy now", "free money"]);
        assert_eq!(cfg.pow_min_difficulty, 12);
        clear_env();
    }

    #[test]
    fn invalid_number_errors() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        env::set_var("MAX_EVENT_BYTES", "not-a-number");
        assert!(Settings::from_env("/nonexistent/.env").is_err());
        clear_env();
    }

    #[test]
    fn csv_helper() {
        assert_eq!(csv_strings("a, b , ,c"), vec!["a", "b", "c"]);
        assert!(csv_strings("").is_empty());
    }
}
