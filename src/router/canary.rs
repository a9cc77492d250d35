/// FNV-1a 32-bit hash. Stable across platforms so a given user/message pair
/// always lands in the same bucket.
fn fnv1a_32(input: &str) -> u32 {
    let mut hash: u32 = 2_166_136_261;
    for byte in input.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(16_777_619);
    }
    hash
}

/// Deterministic bucket in `[0, 100)` for a user/message pair.
pub fn canary_bucket(user_id: &str, message_id: &str) -> u8 {
    let bucket = fnv1a_32(&format!("{user_id}:{message_id}")) % 100;
    bucket as u8
}

/// Whether this turn qualifies for remote routing. An empty user list means
/// every user is eligible.
pub fn is_canary(user_id: &str, message_id: &str, percent: u8, users: &[String]) -> bool {
    if percent == 0 {
        return false;
    }
    if !users.is_empty() && !users.iter().any(|u| u == user_id) {
        return false;
    }
    canary_bucket(user_id, message_id) < percent
}
