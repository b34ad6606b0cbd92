//! Violation scoring and graduated policy responses per connection.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::warn;

use crate::subscriptions::ConnId;

/// Graduated response to a reported violation.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyAction {
    Allow,
    Warn,
    Throttle(Duration),
    Disconnect,
    Ban,
}

/// Critical severity; bans immediately.
pub const SEVERITY_CRITICAL: u8 = 10;

#[derive(Debug, Clone)]
struct Violation {
    kind: String,
    at: Instant,
    severity: u8,
}

/// Records per-connection violations and decides the response.
///
/// Scores decay by 5 every 5 minutes; bans stick until the connection
/// closes.
pub struct SecurityPolicy {
    violations: HashMap<ConnId, Vec<Violation>>,
    banned: HashSet<ConnId>,
}

/// Upper bound on retained violations per connection.
const MAX_VIOLATIONS: usize = 100;
/// Score removed from every connection at each decay sweep.
const DECAY_SCORE: u8 = 5;

impl SecurityPolicy {
    pub fn new() -> Self {
        Self {
            violations: HashMap::new(),
            banned: HashSet::new(),
        }
    }

    /// Record a violation and return the action the session must take.
    pub fn report(&mut self, conn: ConnId, kind: &str, severity: u8) -> PolicyAction {
        self.report_at(conn, kind, severity, Instant::now())
    }

    pub fn report_at(&mut self, conn: ConnId, kind: &str, severity: u8, now: Instant) -> PolicyAction {
        warn!(conn, kind, severity, "policy violation");
        if severity >= SEVERITY_CRITICAL {
            self.banned.insert(conn);
            return PolicyAction::Ban;
        }
        let entry = self.violations.entry(conn).or_default();
        if entry.len() >= MAX_VIOLATIONS {
            entry.remove(0);
        }
        entry.push(Violation {
            kind: kind.to_string(),
            at: now,
            severity,
        });
        let recent = entry
            .iter()
            .filter(|v| now.duration_since(v.at) <= Duration::from_secs(60))
            .count();
        if recent > 5 {
            self.banned.insert(conn);
            return PolicyAction::Ban;
        }
        let score: u32 = entry.iter().map(|v| v.severity as u32).sum();
        if score >= 10 {
            self.banned.insert(conn);
            return PolicyAction::Ban;
        }
        match score {
            0..=2 => PolicyAction::Allow,
            3..=5 => PolicyAction::Warn,
            6..=8 => PolicyAction::Throttle(Duration::from_secs(30)),
            _ => PolicyAction::Disconnect,
        }
    }

    pub fn is_banned(&self, conn: ConnId) -> bool {
        self.banned.contains(&conn)
    }

    /// Forget a closed connection entirely, including any ban.
    pub fn connection_closed(&mut self, conn: ConnId) {
        self.violations.remove(&conn);
        self.banned.remove(&conn);
    }

    /// Drop `DECAY_SCORE` worth of oldest violations per connection.
    /// Runs every five minutes.
    pub fn decay(&mut self) {
        for entry in self.violations.values_mut() {
            let mut remaining = DECAY_SCORE as i32;
            while remaining > 0 {
                match entry.first() {
                    Some(v) => {
                        remaining -= v.severity as i32;
                        entry.remove(0);
                    }
                    None => break,
                }
            }
        }
        self.violations.retain(|_, v| !v.is_empty());
    }

    /// Summary for the admin status endpoint.
    pub fn status(&self) -> Value {
        json!({
            "tracked_connections": self.violations.len(),
            "banned_connections": self.banned.len(),
        })
    }

    /// Per-connection detail for the admin audit endpoint.
    pub fn audit(&self) -> Value {
        let connections: Vec<Value> = self
            .violations
            .iter()
            .map(|(conn, vs)| {
                json!({
                    "conn_id": conn,
                    "score": vs.iter().map(|v| v.severity as u32).sum::<u32>(),
                    "violations": vs.iter().map(|v| v.kind.clone()).collect::<Vec<_>>(),
                    "banned": self.banned.contains(conn),
                })
            })
            .collect();
        json!({ "connections": connections })
    }
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_severity_bans_immediately() {
        let mut p = SecurityPolicy::new();
        assert_eq!(p.report(1, "oversized frame", SEVERITY_CRITICAL), PolicyAction::Ban);
        assert!(p.is_banned(1));
    }

    #[test]
    fn score_escalates_through_responses() {
        let mut p = SecurityPolicy::new();
        let t0 = Instant::now();
        assert_eq!(p.report_at(1, "minor", 1, t0), PolicyAction::Allow);
        assert_eq!(p.report_at(1, "minor", 1, t0 + Duration::from_secs(120)), PolicyAction::Allow);
        assert_eq!(
            p.report_at(1, "minor", 1, t0 + Duration::from_secs(240)),
            PolicyAction::Warn
        );
        assert_eq!(
            p.report_at(1, "moderate", 3, t0 + Duration::from_secs(360)),
            PolicyAction::Throttle(Duration::from_secs(30))
        );
        assert_eq!(
            p.report_at(1, "moderate", 3, t0 + Duration::from_secs(480)),
            PolicyAction::Disconnect
        );
        assert_eq!(
            p.report_at(1, "minor", 1, t0 + Duration::from_secs(600)),
            PolicyAction::Ban
        );
    }

    #[test]
    fn rapid_fire_violations_ban() {
        let mut p = SecurityPolicy::new();
        let t0 = Instant::now();
        for i in 0..5 {
            let action = p.report_at(1, "minor", 1, t0 + Duration::from_secs(i));
            assert_ne!(action, PolicyAction::Ban);
        }
        assert_eq!(p.report_at(1, "minor", 1, t0 + Duration::from_secs(5)), PolicyAction::Ban);
    }

    #[test]
    fn decay_reduces_score() {
        let mut p = SecurityPolicy::new();
        let t0 = Instant::now();
        p.report_at(1, "moderate", 3, t0);
        p.report_at(1, "moderate", 3, t0 + Duration::from_secs(120));
        // score 6 -> throttle territory
        assert_eq!(
            p.report_at(1, "minor", 1, t0 + Duration::from_secs(240)),
            PolicyAction::Throttle(Duration::from_secs(30))
        );
        p.decay();
        // 5 points of the oldest violations dropped
        assert_eq!(
            p.report_at(1, "minor", 1, t0 + Duration::from_secs(360)),
            PolicyAction::Allow
        );
    }

    #[test]
    fn close_clears_ban() {
        let mut p = SecurityPolicy::new();
        p.report(1, "bad", SEVERITY_CRITICAL);
        assert!(p.is_banned(1));
        p.connection_closed(1);
        assert!(!p.is_banned(1));
    }

    #[test]
    fn status_and_audit_summaries() {
        let mut p = SecurityPolicy::new();
        p.report(1, "minor", 1);
        p.report(2, "bad", SEVERITY_CRITICAL);
        let status = p.status();
        assert_eq!(status["tracked_connections"], 1);
        assert_eq!(status["banned_connections"], 1);
        let audit = p.audit();
        assert_eq!(audit["connections"].as_array().unwrap().len(), 1);
    }
}
