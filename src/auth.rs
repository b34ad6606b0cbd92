//! Challenge/response authentication boundary.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use rand::RngCore;
use tracing::info;
use url::Url;

use crate::event::Event;
use crate::subscriptions::ConnId;

/// Kind number reserved for client authentication events.
pub const AUTH_KIND: i64 = 22242;

/// Challenges expire after five minutes.
const CHALLENGE_TTL: Duration = Duration::from_secs(300);
/// Authenticated sessions last a day.
const SESSION_TTL: Duration = Duration::from_secs(24 * 3600);
/// Allowed clock skew between the auth event and the relay, seconds.
const MAX_AUTH_SKEW: i64 = 600;

/// Capability granted to an authenticated connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    Read,
    Write,
    Delete,
    Admin,
}

#[derive(Debug)]
struct AuthSession {
    pubkey: String,
    permissions: HashSet<Permission>,
    granted_at: Instant,
}

/// Issues challenges and verifies signed authentication events.
///
/// The rest of the relay consumes only `is_authenticated`,
/// `has_permission`, and `revoke`.
pub struct AuthManager {
    challenges: HashMap<ConnId, (String, Instant)>,
    sessions: HashMap<ConnId, AuthSession>,
    relay_url: String,
    pubkey_allowlist: Vec<String>,
}

impl AuthManager {
    pub fn new(relay_url: &str, pubkey_allowlist: Vec<String>) -> Self {
        Self {
            challenges: HashMap::new(),
            sessions: HashMap::new(),
            relay_url: relay_url.to_string(),
            pubkey_allowlist,
        }
    }

    /// Generate and remember a fresh challenge for the connection.
    pub fn issue_challenge(&mut self, conn: ConnId) -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let challenge = hex::encode(bytes);
        self.challenges
            .insert(conn, (challenge.clone(), Instant::now()));
        challenge
    }

    /// Verify an already-validated authentication event.
    ///
    /// The session runs the event through the full validator first; this
    /// checks the auth-specific rules and grants the permission set.
    pub fn verify(&mut self, conn: ConnId, ev: &Event, now_unix: i64) -> Result<(), String> {
        self.verify_at(conn, ev, now_unix, Instant::now())
    }

    pub fn verify_at(
        &mut self,
        conn: ConnId,
        ev: &Event,
        now_unix: i64,
        now: Instant,
    ) -> Result<(), String> {
        if ev.kind != AUTH_KIND {
            return Err("wrong kind for auth".into());
        }
        let (challenge, issued) = self
            .challenges
            .get(&conn)
            .ok_or_else(|| "no active challenge".to_string())?;
        if now.duration_since(*issued) > CHALLENGE_TTL {
            self.challenges.remove(&conn);
            return Err("challenge expired".into());
        }
        let sent = ev
            .tag_values("challenge")
            .next()
            .ok_or_else(|| "missing challenge tag".to_string())?;
        if sent != challenge.as_str() {
            return Err("challenge mismatch".into());
        }
        let relay = ev
            .tag_values("relay")
            .next()
            .ok_or_else(|| "missing relay tag".to_string())?;
        if !same_relay(relay, &self.relay_url) {
            return Err("relay mismatch".into());
        }
        if (now_unix - ev.created_at).abs() > MAX_AUTH_SKEW {
            return Err("auth event too old".into());
        }
        if !self.pubkey_allowlist.is_empty() && !self.pubkey_allowlist.contains(&ev.pubkey) {
            return Err("pubkey not allowed".into());
        }
        self.challenges.remove(&conn);
        let permissions = [Permission::Read, Permission::Write, Permission::Delete]
            .into_iter()
            .collect();
        self.sessions.insert(
            conn,
            AuthSession {
                pubkey: ev.pubkey.clone(),
                permissions,
                granted_at: now,
            },
        );
        info!(conn, pubkey = %ev.pubkey, "connection authenticated");
        Ok(())
    }

    pub fn is_authenticated(&self, conn: ConnId) -> bool {
        self.is_authenticated_at(conn, Instant::now())
    }

    pub fn is_authenticated_at(&self, conn: ConnId, now: Instant) -> bool {
        self.sessions
            .get(&conn)
            .map(|s| now.duration_since(s.granted_at) < SESSION_TTL)
            .unwrap_or(false)
    }

    pub fn has_permission(&self, conn: ConnId, perm: Permission) -> bool {
        self.sessions
            .get(&conn)
            .map(|s| s.permissions.contains(&perm))
            .unwrap_or(false)
    }

    pub fn authenticated_pubkey(&self, conn: ConnId) -> Option<&str> {
        self.sessions.get(&conn).map(|s| s.pubkey.as_str())
    }

    /// Drop the connection's session and any outstanding challenge.
    pub fn revoke(&mut self, conn: ConnId) {
        self.sessions.remove(&conn);
        self.challenges.remove(&conn);
    }

    /// Drop expired challenges and sessions.
    pub fn sweep(&mut self) {
        let now = Instant::now();
        self.challenges
            .retain(|_, (_, issued)| now.duration_since(*issued) <= CHALLENGE_TTL);
        self.sessions
            .retain(|_, s| now.duration_since(s.granted_at) < SESSION_TTL);
    }
}

/// Compare relay URLs ignoring trailing slashes and case in the host.
fn same_relay(a: &str, b: &str) -> bool {
    match (Url::parse(a), Url::parse(b)) {
        (Ok(ua), Ok(ub)) => {
            ua.scheme() == ub.scheme()
                && ua.host_str() == ub.host_str()
                && ua.port_or_known_default() == ub.port_or_known_default()
        }
        _ => a.trim_end_matches('/') == b.trim_end_matches('/'),
    }
}
