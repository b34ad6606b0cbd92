//! Proof-of-work verification over event ids.

use crate::event::Event;

/// Count leading zero bits of a hex-encoded event id.
pub fn difficulty(id: &str) -> u32 {
    let mut bits = 0;
    for c in id.chars() {
        let nibble = match c.to_digit(16) {
            Some(n) => n,
            None => break,
        };
        if nibble == 0 {
            bits += 4;
        } else {
            bits += nibble.leading_zeros() - 28;
            break;
        }
    }
    bits
}

/// Check an event against the relay's minimum difficulty.
///
/// A zero minimum always passes. Otherwise the event must carry a `nonce`
/// tag with at least three elements; a parseable third element commits to
/// a target that must equal the computed difficulty.
pub fn check(ev: &Event, min_difficulty: u32) -> Result<(), String> {
    if min_difficulty == 0 {
        return Ok(());
    }
    let nonce = ev
        .tags
        .iter()
        .find(|t| t.name() == Some("nonce") && t.0.len() >= 3);
    let nonce = match nonce {
        Some(t) => t,
        None => return Err("missing nonce tag".into()),
    };
    let diff = difficulty(&ev.id);
    if let Ok(target) = nonce.0[2].parse::<u32>() {
        if target != diff {
            return Err(format!(
                "committed target {} does not match difficulty {}",
                target, diff
            ));
        }
    }
    if diff < min_difficulty {
        return Err(format!(
            "difficulty {} is less than required {}",
            diff, min_difficulty
        ));
    }
    Ok(())
}
