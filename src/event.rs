//! Nostr event model, canonical hashing, and signature verification.

use anyhow::{anyhow, Result};
use secp256k1::{schnorr::Signature, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Simple tag wrapper preserving tag fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Tag name, i.e. the first element.
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(|s| s.as_str())
    }

    /// Tag value, i.e. the second element.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(|s| s.as_str())
    }
}

/// Core Nostr event received from clients and served back to them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash of the canonical serialization).
    pub id: String,
    /// Author public key (x-only, hex).
    pub pubkey: String,
    /// Unix timestamp of creation, seconds.
    pub created_at: i64,
    /// Kind number, e.g. `1` or `30023`.
    pub kind: i64,
    /// Arbitrary tags; every tag carries at least its name.
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash (hex).
    pub sig: String,
}

/// Storage treatment derived from the kind number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindClass {
    /// Stored as-is.
    Regular,
    /// Stored; newest per `(pubkey, kind)` wins.
    Replaceable,
    /// Never stored; fan-out only.
    Ephemeral,
    /// Stored; newest per `(pubkey, kind, d)` wins.
    ParameterizedReplaceable,
    /// Kind 5; tombstones the author's referenced events.
    Deletion,
}

impl Event {
    /// Classify the event by its kind number.
    pub fn kind_class(&self) -> KindClass {
        match self.kind {
            5 => KindClass::Deletion,
            0 | 3 => KindClass::Replaceable,
            10000..=19999 => KindClass::Replaceable,
            20000..=29999 => KindClass::Ephemeral,
            30000..=39999 => KindClass::ParameterizedReplaceable,
            _ => KindClass::Regular,
        }
    }

    /// Values of every tag with the given name that carries a value.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.tags
            .iter()
            .filter(move |t| t.name() == Some(name))
            .filter_map(|t| t.value())
    }

    /// Value of the first `d` tag, or the empty string when absent.
    ///
    /// This is the discriminator for parameterized-replaceable kinds.
    pub fn d_tag(&self) -> &str {
        self.tag_values("d").next().unwrap_or("")
    }
}

/// Recompute the canonical event hash from its fields.
pub fn event_hash(ev: &Event) -> Result<[u8; 32]> {
    let arr = serde_json::json!([0, ev.pubkey, ev.created_at, ev.kind, ev.tags, ev.content]);
    let data = serde_json::to_vec(&arr)?;
    let hash = Sha256::digest(&data);
    Ok(hash.into())
}

/// Verify an event's Schnorr signature over a precomputed hash.
pub fn verify_signature(ev: &Event, hash: &[u8; 32]) -> Result<()> {
    let sig = Signature::from_slice(&hex::decode(&ev.sig)?)?;
    let pk = XOnlyPublicKey::from_slice(&hex::decode(&ev.pubkey)?)?;
    let secp = Secp256k1::verification_only();
    let msg = Message::from_digest_slice(hash)?;
    secp.verify_schnorr(&sig, &msg, &pk)?;
    Ok(())
}

/// Verify an event's id and Schnorr signature.
pub fn verify_event(ev: &Event) -> Result<()> {
    let hash = event_hash(ev)?;
    if hex::encode(hash) != ev.id {
        return Err(anyhow!("event id does not match"));
    }
    verify_signature(ev, &hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::{Keypair, Message, Secp256k1};

    fn signed_event(kind: i64, tags: Vec<Tag>, content: &str) -> Event {
        let secp = Secp256k1::new();
        let kp = Keypair::from_seckey_slice(&secp, &[7u8; 32]).unwrap();
        let pubkey = kp.x_only_public_key().0;
        let mut ev = Event {
            id: String::new(),
            pubkey: hex::encode(pubkey.serialize()),
            created_at: 1_700_000_000,
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

    #[test]
    fn kind_classes() {
        let ev = |kind| Event {
            id: String::new(),
            pubkey: String::new(),
            created_at: 0,
            kind,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        };
        assert_eq!(ev(1).kind_class(), KindClass::Regular);
        assert_eq!(ev(0).kind_class(), KindClass::Replaceable);
        assert_eq!(ev(3).kind_class(), KindClass::Replaceable);
        assert_eq!(ev(10000).kind_class(), KindClass::Replaceable);
        assert_eq!(ev(19999).kind_class(), KindClass::Replaceable);
        assert_eq!(ev(20000).kind_class(), KindClass::Ephemeral);
        assert_eq!(ev(29999).kind_class(), KindClass::Ephemeral);
        assert_eq!(ev(30023).kind_class(), KindClass::ParameterizedReplaceable);
        assert_eq!(ev(5).kind_class(), KindClass::Deletion);
        assert_eq!(ev(40000).kind_class(), KindClass::Regular);
    }

    #[test]
    fn tag_helpers() {
        let ev = Event {
            id: String::new(),
            pubkey: String::new(),
            created_at: 0,
            kind: 30023,
            tags: vec![
                Tag(vec!["d".into(), "slug".into()]),
                Tag(vec!["e".into(), "aa11".into()]),
                Tag(vec!["e".into(), "bb22".into()]),
                Tag(vec!["name-only".into()]),
            ],
            content: String::new(),
            sig: String::new(),
        };
        assert_eq!(ev.d_tag(), "slug");
        let es: Vec<_> = ev.tag_values("e").collect();
        assert_eq!(es, vec!["aa11", "bb22"]);
        assert!(ev.tag_values("p").next().is_none());
    }

    #[test]
    fn d_tag_defaults_to_empty() {
        let ev = Event {
            id: String::new(),
            pubkey: String::new(),
            created_at: 0,
            kind: 30000,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        };
        assert_eq!(ev.d_tag(), "");
    }

    #[test]
    fn verify_accepts_valid_event() {
        let ev = signed_event(1, vec![], "hello");
        verify_event(&ev).unwrap();
    }

    #[test]
    fn verify_rejects_id_mismatch() {
        let mut ev = signed_event(1, vec![], "hello");
        ev.id.replace_range(0..2, "ff");
        assert!(verify_event(&ev).is_err());
    }

    #[test]
    fn verify_rejects_bad_sig() {
        let mut ev = signed_event(1, vec![], "hello");
        ev.sig = "00".repeat(64);
        assert!(verify_event(&ev).is_err());
    }

    #[test]
    fn hash_covers_tags() {
        let a = signed_event(1, vec![], "x");
        let b = signed_event(1, vec![Tag(vec!["t".into(), "topic".into()])], "x");
        assert_ne!(a.id, b.id);
    }
}
