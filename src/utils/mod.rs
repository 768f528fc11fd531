pub mod error;

use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use rand::Rng;
use ruma::MilliSecondsSinceUnixEpoch;
use sha2::{Digest, Sha256};

/// A short random alphanumeric string, used as the version tag prefixing a
/// freshly generated signing key on disk.
pub fn random_string(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(rand::distributions::Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

pub fn millis_since_unix_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time is valid")
        .as_millis() as u64
}

pub fn now_ms() -> MilliSecondsSinceUnixEpoch {
    MilliSecondsSinceUnixEpoch::now()
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    digest.iter().fold(String::new(), |mut out, byte| {
        use fmt::Write;
        let _ = write!(out, "{byte:02x}");
        out
    })
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Constant-time comparison of two byte strings, used to compare bearer
/// tokens without leaking timing information about how many bytes matched.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Translates a Matrix entity glob (`*` matches any run of characters, `?`
/// matches exactly one) into an anchored regex pattern. Every other
/// character is escaped so literal entities still match exactly.
pub fn glob_to_regex_pattern(glob: &str) -> String {
    let mut pattern = String::with_capacity(glob.len() + 2);
    pattern.push('^');
    for ch in glob.chars() {
        match ch {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            _ => pattern.push_str(&regex::escape(&ch.to_string())),
        }
    }
    pattern.push('$');
    pattern
}

/// A glob is "dynamic" if it contains a wildcard; otherwise it is an exact
/// literal and can be matched with a plain map lookup instead of a regex scan.
pub fn is_dynamic_glob(glob: &str) -> bool {
    glob.contains('*') || glob.contains('?')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_matches_equal_slices() {
        assert!(constant_time_eq(b"abc123", b"abc123"));
        assert!(!constant_time_eq(b"abc123", b"abc124"));
        assert!(!constant_time_eq(b"short", b"longer"));
    }

    #[test]
    fn glob_translation_escapes_literals_and_keeps_wildcards() {
        assert_eq!(glob_to_regex_pattern("*:evil.example"), "^.*:evil\\.example$");
        assert_eq!(glob_to_regex_pattern("@a?c:x"), "^@a.c:x$");
        assert!(is_dynamic_glob("@*:evil.example"));
        assert!(!is_dynamic_glob("@bad:evil.example"));
    }
}
