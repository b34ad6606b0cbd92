//! Per-connection orchestrator: wire frames in, core calls, frames out.

use std::net::IpAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use serde_json::{json, Value};
use tokio::sync::mpsc::Sender;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::auth::{AuthManager, Permission};
use crate::config::Settings;
use crate::event::KindClass;
use crate::filter::Filter;
use crate::limiter::{RateDecision, RateLimiter};
use crate::metrics;
use crate::pow;
use crate::repository::{Repository, StoreOutcome};
use crate::security::{PolicyAction, SecurityPolicy};
use crate::spam::{SpamFilter, SpamVerdict};
use crate::subscriptions::{ConnId, SubscriptionManager};
use crate::validation::{ValidationResult, Validator};

/// Shared relay state handed to every connection.
///
/// Each stateful component serializes behind its own mutex; sessions
/// never hold two component locks at once.
pub struct RelayState {
    pub settings: Arc<Settings>,
    pub validator: Validator,
    pub limiter: Mutex<RateLimiter>,
    pub spam: Mutex<SpamFilter>,
    pub manager: Mutex<SubscriptionManager>,
    pub security: Mutex<SecurityPolicy>,
    pub auth: Mutex<AuthManager>,
    pub repo: Repository,
    pub next_conn_id: AtomicU64,
}

impl RelayState {
    /// Connect the repository and assemble every component.
    pub async fn new(settings: Settings) -> Result<Self> {
        let repo = Repository::connect(&settings.database_url, settings.max_limit).await?;
        repo.init().await?;
        Ok(Self {
            validator: Validator::new(&settings),
            limiter: Mutex::new(RateLimiter::new(&settings)),
            spam: Mutex::new(SpamFilter::new(&settings)),
            manager: Mutex::new(SubscriptionManager::new()),
            security: Mutex::new(SecurityPolicy::new()),
            auth: Mutex::new(AuthManager::new(
                &settings.relay_url,
                settings.auth_pubkey_allowlist.clone(),
            )),
            repo,
            settings: Arc::new(settings),
            next_conn_id: AtomicU64::new(1),
        })
    }
}

/// Whether the connection loop should keep running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionControl {
    Continue,
    Disconnect,
}

/// One client connection's protocol state.
pub struct Session {
    conn_id: ConnId,
    addr: IpAddr,
    state: Arc<RelayState>,
    outbound: Sender<String>,
    throttled_until: Option<Instant>,
}

impl Session {
    pub fn new(
        conn_id: ConnId,
        addr: IpAddr,
        state: Arc<RelayState>,
        outbound: Sender<String>,
    ) -> Self {
        Self {
            conn_id,
            addr,
            state,
            outbound,
            throttled_until: None,
        }
    }

    /// Process one inbound text frame.
    pub async fn handle_text(&mut self, text: &str) -> SessionControl {
        if self.state.security.lock().await.is_banned(self.conn_id) {
            return SessionControl::Disconnect;
        }
        if let Some(until) = self.throttled_until {
            if Instant::now() < until {
                self.send(json!(["NOTICE", "rate-limited: connection is throttled"]));
                return SessionControl::Continue;
            }
            self.throttled_until = None;
        }
        let frame: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => {
                self.send(json!(["NOTICE", "could not parse message"]));
                return self.report("malformed frame", 1).await;
            }
        };
        let arr = match frame.as_array() {
            Some(arr) if !arr.is_empty() => arr,
            _ => {
                self.send(json!(["NOTICE", "message must be a non-empty array"]));
                return self.report("malformed frame", 1).await;
            }
        };
        match arr[0].as_str() {
            Some("EVENT") => self.handle_event(arr.get(1)).await,
            Some("REQ") => self.handle_req(arr).await,
            Some("CLOSE") => self.handle_close(arr.get(1)).await,
            Some("AUTH") => self.handle_auth(arr.get(1)).await,
            _ => {
                self.send(json!(["NOTICE", "unrecognized command"]));
                self.report("unknown command", 1).await
            }
        }
    }

    /// Binary frames are not part of the protocol.
    pub async fn handle_binary(&mut self) -> SessionControl {
        self.send(json!(["NOTICE", "binary frames are not supported"]));
        self.report("binary frame", 1).await
    }

    /// The full admission pipeline for one submitted event.
    async fn handle_event(&mut self, payload: Option<&Value>) -> SessionControl {
        metrics::EVENTS_RECEIVED.inc();
        let payload = match payload {
            Some(v) => v,
            None => {
                self.send(json!(["NOTICE", "invalid: missing event payload"]));
                return self.report("malformed frame", 1).await;
            }
        };

        let ev = match self.state.validator.validate(payload) {
            ValidationResult::Valid(ev) => ev,
            ValidationResult::Invalid(reason) => {
                metrics::EVENTS_REJECTED.with_label_values(&["invalid"]).inc();
                match usable_id(payload) {
                    Some(id) => {
                        self.send(json!(["OK", id, false, format!("invalid: {reason}")]))
                    }
                    None => self.send(json!(["NOTICE", format!("invalid: {reason}")])),
                }
                return self.report("invalid event", 1).await;
            }
        };

        if self.state.settings.auth_required {
            let auth = self.state.auth.lock().await;
            if !auth.is_authenticated(self.conn_id) {
                metrics::EVENTS_REJECTED.with_label_values(&["blocked"]).inc();
                self.send(json!([
                    "OK",
                    &ev.id,
                    false,
                    "blocked: authentication required"
                ]));
                return SessionControl::Continue;
            }
            // deletions are only honored for the key that authenticated
            if ev.kind_class() == KindClass::Deletion {
                let permitted = auth.has_permission(self.conn_id, Permission::Delete)
                    && auth.authenticated_pubkey(self.conn_id) == Some(ev.pubkey.as_str());
                if !permitted {
                    metrics::EVENTS_REJECTED.with_label_values(&["blocked"]).inc();
                    self.send(json!([
                        "OK",
                        &ev.id,
                        false,
                        "blocked: deletion not permitted for this key"
                    ]));
                    return SessionControl::Continue;
                }
            }
        }

        let size = payload.to_string().len();
        let decision = self
            .state
            .limiter
            .lock()
            .await
            .check_event(self.addr, &ev.pubkey, size);
        match decision {
            RateDecision::Allowed => {}
            RateDecision::Limited(reason) => {
                metrics::EVENTS_REJECTED
                    .with_label_values(&["rate-limited"])
                    .inc();
                self.send(json!(["NOTICE", format!("rate-limited: {reason}")]));
                return SessionControl::Continue;
            }
            RateDecision::Blocked(reason) => {
                metrics::EVENTS_REJECTED.with_label_values(&["blocked"]).inc();
                self.send(json!(["OK", &ev.id, false, format!("blocked: {reason}")]));
                return SessionControl::Continue;
            }
        }

        if let Err(reason) = pow::check(&ev, self.state.settings.pow_min_difficulty) {
            metrics::EVENTS_REJECTED.with_label_values(&["pow"]).inc();
            self.send(json!(["OK", &ev.id, false, format!("pow: {reason}")]));
            return SessionControl::Continue;
        }

        let spam_verdict = self.state.spam.lock().await.check(&ev);
        match spam_verdict {
            SpamVerdict::Pass => {}
            SpamVerdict::Suspicious(reason) => {
                warn!(conn = self.conn_id, event_id = %ev.id, %reason, "suspicious event admitted");
            }
            SpamVerdict::Reject(reason) => {
                metrics::EVENTS_REJECTED.with_label_values(&["spam"]).inc();
                self.send(json!(["OK", &ev.id, false, format!("spam: {reason}")]));
                return self.report("spam event", 3).await;
            }
        }

        if ev.kind_class() != KindClass::Ephemeral {
            match self.state.repo.store(&ev).await {
                Ok(StoreOutcome::Stored) => {
                    metrics::EVENTS_STORED.inc();
                }
                Ok(StoreOutcome::Duplicate) => {
                    metrics::EVENTS_REJECTED
                        .with_label_values(&["duplicate"])
                        .inc();
                    self.send(json!([
                        "OK",
                        &ev.id,
                        true,
                        "duplicate: already have this event"
                    ]));
                    return SessionControl::Continue;
                }
                Err(err) => {
                    metrics::EVENTS_REJECTED.with_label_values(&["error"]).inc();
                    error!(event_id = %ev.id, error = %err, "storing event failed");
                    self.send(json!(["OK", &ev.id, false, "error: failed to store event"]));
                    return SessionControl::Continue;
                }
            }
        }

        self.state.manager.lock().await.broadcast_event(&ev);
        self.send(json!(["OK", &ev.id, true]));
        SessionControl::Continue
    }

    /// Open or replace a subscription, then stream stored history.
    async fn handle_req(&mut self, arr: &[Value]) -> SessionControl {
        let decision = self.state.limiter.lock().await.check_subscription(self.addr);
        match decision {
            RateDecision::Allowed => {}
            RateDecision::Limited(reason) => {
                self.send(json!(["NOTICE", format!("rate-limited: {reason}")]));
                return SessionControl::Continue;
            }
            RateDecision::Blocked(reason) => {
                self.send(json!(["NOTICE", format!("blocked: {reason}")]));
                return SessionControl::Continue;
            }
        }

        let sub_id = match arr.get(1).and_then(|v| v.as_str()) {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => {
                self.send(json!(["NOTICE", "invalid: missing subscription id"]));
                return self.report("malformed frame", 1).await;
            }
        };
        let settings = &self.state.settings;
        if sub_id.len() > settings.max_subid_length {
            self.send(json!([
                "NOTICE",
                format!(
                    "invalid: subscription id longer than {} characters",
                    settings.max_subid_length
                )
            ]));
            return SessionControl::Continue;
        }
        if arr.len() < 3 {
            self.send(json!(["NOTICE", "invalid: at least one filter is required"]));
            return SessionControl::Continue;
        }
        let filters: Vec<Filter> = arr[2..].iter().map(Filter::from_value).collect();
        if filters.len() > settings.max_filters {
            self.send(json!([
                "NOTICE",
                format!("invalid: more than {} filters", settings.max_filters)
            ]));
            return SessionControl::Continue;
        }
        if filters
            .iter()
            .any(|f| f.limit.map_or(false, |l| l > settings.max_limit))
        {
            self.send(json!([
                "NOTICE",
                format!("invalid: filter limit exceeds {}", settings.max_limit)
            ]));
            return SessionControl::Continue;
        }

        {
            let mut manager = self.state.manager.lock().await;
            let replacing = manager.has_subscription(self.conn_id, &sub_id);
            if !replacing && manager.subscription_count(self.conn_id) >= settings.max_subscriptions
            {
                drop(manager);
                self.send(json!([
                    "NOTICE",
                    format!("blocked: more than {} subscriptions", settings.max_subscriptions)
                ]));
                return SessionControl::Continue;
            }
            manager.add_subscription(self.conn_id, &sub_id, filters.clone());
        }

        // Historical results go out per filter, oldest first, then EOSE.
        for filter in &filters {
            match self.state.repo.query(filter).await {
                Ok(events) => {
                    for ev in events.iter().rev() {
                        self.send(json!(["EVENT", sub_id, ev]));
                    }
                }
                Err(err) => {
                    error!(%sub_id, error = %err, "historical query failed");
                    self.send(json!(["NOTICE", "error: query failed"]));
                }
            }
        }
        self.send(json!(["EOSE", sub_id]));
        debug!(conn = self.conn_id, %sub_id, "subscription open");
        SessionControl::Continue
    }

    async fn handle_close(&mut self, sub_id: Option<&Value>) -> SessionControl {
        if let Some(sub_id) = sub_id.and_then(|v| v.as_str()) {
            self.state
                .manager
                .lock()
                .await
                .remove_subscription(self.conn_id, sub_id);
            debug!(conn = self.conn_id, sub_id, "subscription closed");
        } else {
            self.send(json!(["NOTICE", "invalid: missing subscription id"]));
        }
        SessionControl::Continue
    }

    /// Forward a signed authentication event to the auth boundary.
    async fn handle_auth(&mut self, payload: Option<&Value>) -> SessionControl {
        let payload = match payload {
            Some(v) => v,
            None => {
                self.send(json!(["NOTICE", "invalid: missing auth event"]));
                return SessionControl::Continue;
            }
        };
        let ev = match self.state.validator.validate(payload) {
            ValidationResult::Valid(ev) => ev,
            ValidationResult::Invalid(reason) => {
                match usable_id(payload) {
                    Some(id) => {
                        self.send(json!(["OK", id, false, format!("invalid: {reason}")]))
                    }
                    None => self.send(json!(["NOTICE", format!("invalid: {reason}")])),
                }
                return SessionControl::Continue;
            }
        };
        let now_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let result = self
            .state
            .auth
            .lock()
            .await
            .verify(self.conn_id, &ev, now_unix);
        match result {
            Ok(()) => self.send(json!(["OK", &ev.id, true])),
            Err(reason) => {
                self.send(json!(["OK", &ev.id, false, format!("invalid: {reason}")]))
            }
        }
        SessionControl::Continue
    }

    /// Report a violation and translate the policy action.
    async fn report(&mut self, kind: &str, severity: u8) -> SessionControl {
        let action = self
            .state
            .security
            .lock()
            .await
            .report(self.conn_id, kind, severity);
        match action {
            PolicyAction::Allow => SessionControl::Continue,
            PolicyAction::Warn => {
                self.send(json!(["NOTICE", "policy warning: repeated violations"]));
                SessionControl::Continue
            }
            PolicyAction::Throttle(duration) => {
                self.throttled_until = Some(Instant::now() + duration);
                SessionControl::Continue
            }
            PolicyAction::Disconnect | PolicyAction::Ban => {
                warn!(conn = self.conn_id, kind, "closing connection by policy");
                SessionControl::Disconnect
            }
        }
    }

    /// Enqueue an outbound frame; a full or closed queue is logged and the
    /// frame dropped, the writer task owns actual socket errors.
    fn send(&self, frame: Value) {
        if let Err(err) = self.outbound.try_send(frame.to_string()) {
            debug!(conn = self.conn_id, error = %err, "outbound frame dropped");
        }
    }
}

/// Extract an event id usable in an OK frame from a raw payload.
fn usable_id(payload: &Value) -> Option<&str> {
    payload
        .get("id")
        .and_then(|v| v.as_str())
        .filter(|id| id.len() == 64 && id.bytes().all(|b| b.is_ascii_hexdigit()))
}
