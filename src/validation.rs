//! Event admission validation: structure, crypto, time, and kind policy.

use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

use crate::config::Settings;
use crate::event::{event_hash, Event};

/// Two years, the oldest `created_at` the relay accepts.
const MAX_PAST_SECS: i64 = 2 * 365 * 24 * 3600;
/// Fifteen minutes of clock slop into the future.
const MAX_FUTURE_SECS: i64 = 900;

/// Outcome of validating a raw event submission.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationResult {
    /// The event passed every check.
    Valid(Event),
    /// Rejected; the string is the user-visible reason.
    Invalid(String),
}

/// Structural, cryptographic, temporal, and per-kind checks.
#[derive(Debug, Clone)]
pub struct Validator {
    max_event_bytes: usize,
    max_event_tags: usize,
    max_content_length: usize,
}

impl Validator {
    pub fn new(settings: &Settings) -> Self {
        Self {
            max_event_bytes: settings.max_event_bytes,
            max_event_tags: settings.max_event_tags,
            max_content_length: settings.max_content_length,
        }
    }

    /// Validate a raw event JSON object against the current wall clock.
    pub fn validate(&self, raw: &Value) -> ValidationResult {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        self.validate_at(raw, now)
    }

    /// Validate against an explicit notion of "now".
    ///
    /// Checks run in a fixed order so the first failing rule names the
    /// rejection; reasons are surfaced verbatim to the client.
    pub fn validate_at(&self, raw: &Value, now: i64) -> ValidationResult {
        if !raw.is_object() {
            return invalid("malformed event");
        }
        let serialized = raw.to_string();
        if serialized.len() > self.max_event_bytes {
            return invalid(format!(
                "event too large: maximum size is {} bytes",
                self.max_event_bytes
            ));
        }
        let ev: Event = match serde_json::from_value(raw.clone()) {
            Ok(ev) => ev,
            Err(_) => return invalid("malformed event"),
        };
        if ev.id.len() != 64 || !is_lower_hex(&ev.id) {
            return invalid("malformed event id");
        }
        if ev.pubkey.len() != 64 || !is_lower_hex(&ev.pubkey) {
            return invalid("malformed pubkey");
        }
        if ev.sig.len() != 128 || !is_lower_hex(&ev.sig) {
            return invalid("malformed signature");
        }
        if ev.tags.iter().any(|t| t.0.is_empty()) {
            return invalid("empty tag");
        }
        match event_hash(&ev) {
            Ok(hash) => {
                if hex::encode(hash) != ev.id {
                    return invalid("event id does not match");
                }
                if crate::event::verify_signature(&ev, &hash).is_err() {
                    return invalid("bad signature");
                }
            }
            Err(_) => return invalid("malformed event"),
        }
        if ev.created_at < now - MAX_PAST_SECS {
            return invalid("created_at too old");
        }
        if ev.created_at > now + MAX_FUTURE_SECS {
            return invalid("created_at too far in the future");
        }
        if let Some(reason) = kind_policy_violation(&ev) {
            return invalid(reason);
        }
        if ev.tags.len() > self.max_event_tags {
            return invalid(format!(
                "too many tags: maximum is {}",
                self.max_event_tags
            ));
        }
        if ev.content.len() > self.max_content_length {
            return invalid(format!(
                "content too long: maximum is {} bytes",
                self.max_content_length
            ));
        }
        ValidationResult::Valid(ev)
    }
}

fn invalid(reason: impl Into<String>) -> ValidationResult {
    ValidationResult::Invalid(reason.into())
}

/// Per-kind semantic rules for the kinds the relay knows about.
fn kind_policy_violation(ev: &Event) -> Option<String> {
    match ev.kind {
        0 => {
            if serde_json::from_str::<Value>(&ev.content).is_err() {
                return Some("kind 0 content must be valid json".into());
            }
        }
        3 => {
            let broken = ev
                .tags
                .iter()
                .any(|t| t.name() == Some("p") && t.0.len() < 2);
            if broken {
                return Some("kind 3 p tags must carry a pubkey".into());
            }
        }
        4 => {
            if ev.content.is_empty() {
                return Some("kind 4 content must not be empty".into());
            }
        }
        5 => {
            let has_target = ev
                .tags
                .iter()
                .any(|t| t.name() == Some("e") && t.0.len() >= 2);
            if !has_target {
                return Some("kind 5 requires an e tag".into());
            }
        }
        7 => {
            if ev.content.is_empty() {
                return Some("kind 7 content must not be empty".into());
            }
        }
        _ => {}
    }
    None
}

fn is_lower_hex(s: &str) -> bool {
    s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{event_hash, Event, Tag};
    use secp256k1::{Keypair, Message, Secp256k1};

    const NOW: i64 = 1_700_000_000;

    fn signed_event(kind: i64, tags: Vec<Tag>, content: &str) -> Event {
        let secp = Secp256k1::new();
        let kp = Keypair::from_seckey_slice(&secp, &[9u8; 32]).unwrap();
        let pubkey = kp.x_only_public_key().0;
        let mut ev = Event {
            id: String::new(),
            pubkey: hex::encode(pubkey.serialize()),
            created_at: NOW,
            kind,
            tags,
            content: content.into(),
            sig: String::new(),
        };
        let hash = event_hash(&ev).unwrap();
        ev.id = hex::encode(hash);
        let msg = Message::from_digest_slice(&hash).unwrap();
        let sig = secp.sign_schnorr_no_aux_rand(&msg, &kp);
        ev.sig = hex::encode(sig.as_ref());
        ev
    }

    fn validator() -> Validator {
        Validator::new(&Settings::default())
    }

    fn check(ev: &Event) -> ValidationResult {
        validator().validate_at(&serde_json::to_value(ev).unwrap(), NOW)
    }

    fn reason(res: ValidationResult) -> String {
        match res {
            ValidationResult::Invalid(r) => r,
            ValidationResult::Valid(_) => panic!("expected invalid"),
        }
    }

    #[test]
    fn accepts_valid_event() {
        let ev = signed_event(1, vec![], "hello");
        match check(&ev) {
            ValidationResult::Valid(out) => assert_eq!(out, ev),
            ValidationResult::Invalid(r) => panic!("rejected: {r}"),
        }
    }

    #[test]
    fn rejects_non_object() {
        let res = validator().validate_at(&serde_json::json!(["not", "an", "object"]), NOW);
        assert_eq!(reason(res), "malformed event");
    }

    #[test]
    fn rejects_missing_fields() {
        let res = validator().validate_at(&serde_json::json!({"id": "x"}), NOW);
        assert_eq!(reason(res), "malformed event");
    }

    #[test]
    fn rejects_oversized_event() {
        let ev = signed_event(1, vec![], &"x".repeat(70000));
        let r = reason(check(&ev));
        assert_eq!(r, "event too large: maximum size is 65536 bytes");
    }

    #[test]
    fn rejects_bad_id_shape() {
        let mut ev = signed_event(1, vec![], "hello");
        ev.id = "zz".repeat(32);
        assert_eq!(reason(check(&ev)), "malformed event id");
        ev.id = "ab".into();
        assert_eq!(reason(check(&ev)), "malformed event id");
    }

    #[test]
    fn rejects_id_mismatch() {
        let mut ev = signed_event(1, vec![], "hello");
        ev.id = "0".repeat(64);
        assert_eq!(reason(check(&ev)), "event id does not match");
    }

    #[test]
    fn rejects_bad_signature() {
        let mut ev = signed_event(1, vec![], "hello");
        ev.sig = "0".repeat(128);
        assert_eq!(reason(check(&ev)), "bad signature");
    }

    #[test]
    fn rejects_stale_and_future_timestamps() {
        let mut old = signed_event(1, vec![], "hello");
        old.created_at = NOW - MAX_PAST_SECS - 1;
        // re-sign with the shifted timestamp
        let old = resign(old);
        assert_eq!(reason(check_at(&old, NOW)), "created_at too old");

        let mut future = signed_event(1, vec![], "hello");
        future.created_at = NOW + MAX_FUTURE_SECS + 1;
        let future = resign(future);
        assert_eq!(
            reason(check_at(&future, NOW)),
            "created_at too far in the future"
        );
    }

    fn resign(mut ev: Event) -> Event {
        let secp = Secp256k1::new();
        let kp = Keypair::from_seckey_slice(&secp, &[9u8; 32]).unwrap();
        let hash = event_hash(&ev).unwrap();
        ev.id = hex::encode(hash);
        let msg = Message::from_digest_slice(&hash).unwrap();
        ev.sig = hex::encode(secp.sign_schnorr_no_aux_rand(&msg, &kp).as_ref());
        ev
    }

    fn check_at(ev: &Event, now: i64) -> ValidationResult {
        validator().validate_at(&serde_json::to_value(ev).unwrap(), now)
    }

    #[test]
    fn kind_0_requires_json_content() {
        let bad = signed_event(0, vec![], "not json");
        assert_eq!(reason(check(&bad)), "kind 0 content must be valid json");
        let good = signed_event(0, vec![], r#"{"name":"alice"}"#);
        assert!(matches!(check(&good), ValidationResult::Valid(_)));
    }

    #[test]
    fn kind_3_p_tags_need_values() {
        let bad = signed_event(3, vec![Tag(vec!["p".into()])], "");
        assert_eq!(reason(check(&bad)), "kind 3 p tags must carry a pubkey");
        let good = signed_event(3, vec![Tag(vec!["p".into(), "k".into()])], "");
        assert!(matches!(check(&good), ValidationResult::Valid(_)));
    }

    #[test]
    fn kind_4_and_7_need_content() {
        let bad4 = signed_event(4, vec![], "");
        assert_eq!(reason(check(&bad4)), "kind 4 content must not be empty");
        let bad7 = signed_event(7, vec![], "");
        assert_eq!(reason(check(&bad7)), "kind 7 content must not be empty");
    }

    #[test]
    fn kind_5_needs_target() {
        let bad = signed_event(5, vec![], "");
        assert_eq!(reason(check(&bad)), "kind 5 requires an e tag");
        let good = signed_event(5, vec![Tag(vec!["e".into(), "aa".into()])], "");
        assert!(matches!(check(&good), ValidationResult::Valid(_)));
    }

    #[test]
    fn rejects_empty_tag() {
        let ev = signed_event(1, vec![Tag(vec![])], "hello");
        assert_eq!(reason(check(&ev)), "empty tag");
    }

    #[test]
    fn rejects_too_many_tags() {
        let tags = (0..1001)
            .map(|i| Tag(vec!["t".into(), format!("tag{i}")]))
            .collect();
        let ev = signed_event(1, tags, "hello");
        assert_eq!(reason(check(&ev)), "too many tags: maximum is 1000");
    }
}
