//! Key to hash slot mapping.
//!
//! Valkey places a key in slot `CRC16(tag) mod 16384`, where `tag` is the
//! substring between the first `{` and the first `}` after it, provided that
//! substring is non-empty. Otherwise the whole key is hashed. The checksum
//! itself comes from fred, so keys land in the same slot the client routes to.

use std::sync::OnceLock;

use fred::util::redis_keyslot;

use super::distribution::TOTAL_SLOTS;

/// Prefix for the synthetic keys used to ask a node whether it owns a slot.
pub const OWNERSHIP_PROBE_PREFIX: &str = "__slot_owner_probe__";

/// Return the part of `key` that determines its slot.
pub fn hash_tag(key: &str) -> &str {
    if let Some(open) = key.find('{') {
        let rest = key.get(open + 1..).unwrap_or("");
        if let Some(close) = rest.find('}')
            && close > 0
            && let Some(tag) = rest.get(..close)
        {
            return tag;
        }
    }
    key
}

/// Compute the hash slot for a key.
///
/// ```
/// use valkey_reshard::slots::key_slot;
///
/// assert_eq!(key_slot("a"), 15495);
/// assert_eq!(key_slot("b{a}"), key_slot("a"));
/// ```
pub fn key_slot(key: &str) -> u16 {
    redis_keyslot(hash_tag(key).as_bytes()) % TOTAL_SLOTS
}

/// Return a short string that hashes to `slot`.
///
/// Wrapping it in braces gives a hash tag that pins any key to that slot,
/// e.g. `format!("user:{{{}}}", hash_tag_for_slot(42))`. Returns `None` for
/// slots outside `0..16384`.
pub fn hash_tag_for_slot(slot: u16) -> Option<&'static str> {
    slot_tag_table()
        .get(usize::from(slot))
        .map(|tag| tag.as_str())
}

/// Build a key that lives in `slot`, prefixed with `prefix`.
pub fn key_for_slot(prefix: &str, slot: u16) -> Option<String> {
    hash_tag_for_slot(slot).map(|tag| format!("{prefix}{{{tag}}}"))
}

/// The synthetic key used to probe slot ownership. It is never written.
pub fn ownership_probe_key(slot: u16) -> Option<String> {
    key_for_slot(OWNERSHIP_PROBE_PREFIX, slot)
}

/// Shortest base-36 tag for every slot, filled on first use.
fn slot_tag_table() -> &'static [String] {
    static TABLE: OnceLock<Vec<String>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table: Vec<Option<String>> = vec![None; usize::from(TOTAL_SLOTS)];
        let mut remaining = table.len();
        let mut candidate: u64 = 0;
        while remaining > 0 {
            let tag = to_base36(candidate);
            let slot = usize::from(redis_keyslot(tag.as_bytes()) % TOTAL_SLOTS);
            if let Some(entry) = table.get_mut(slot)
                && entry.is_none()
            {
                *entry = Some(tag);
                remaining -= 1;
            }
            candidate += 1;
        }
        table.into_iter().map(Option::unwrap_or_default).collect()
    })
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut out = Vec::new();
    loop {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
        if n == 0 {
            break;
        }
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}
