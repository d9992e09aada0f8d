//! Small stateless helpers shared by every component: timestamp formatting,
//! human-readable byte counts, and the two input validators the API and
//! User Admin both need.

use crate::types::{DATE_FORMAT, TIMESTAMP_FORMAT};
use base64::Engine;

/// The current local time, formatted as `YYYY-MM-DD HH:MM:SS`.
pub fn now_string() -> String {
    chrono::Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Today's date, formatted as `YYYY-MM-DD`.
pub fn today_string() -> String {
    chrono::Local::now().format(DATE_FORMAT).to_string()
}

/// Render a byte count as a human-readable string with one decimal place,
/// stepping through `B/K/M/G/T/P`. Negative or absent counts render as `"0B"`.
pub fn readable_bytes(n: i64) -> String {
    if n < 0 {
        return "0B".to_string();
    }
    let mut value = n as f64;
    for unit in ["B", "K", "M", "G", "T"] {
        if value < 1024.0 {
            return format!("{value:.1}{unit}");
        }
        value /= 1024.0;
    }
    format!("{value:.1}P")
}

/// A WireGuard public key is a 44-character Base64 encoding of 32 raw bytes.
/// Shape-only: this never verifies the key is a valid Curve25519 point.
pub fn validate_pubkey(pubkey: &str) -> bool {
    if pubkey.len() != 44 {
        return false;
    }
    match base64::engine::general_purpose::STANDARD.decode(pubkey) {
        Ok(bytes) => bytes.len() == 32,
        Err(_) => false,
    }
}

/// A permissive email shape check. `None`/empty is always valid since the
/// field is optional.
pub fn validate_email(email: Option<&str>) -> bool {
    let Some(email) = email else { return true };
    if email.is_empty() {
        return true;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.is_empty() {
        return false;
    }
    let local_ok = local
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "._%+-".contains(c));
    let Some((host, tld)) = domain.rsplit_once('.') else {
        return false;
    };
    let host_ok = !host.is_empty() && host.chars().all(|c| c.is_ascii_alphanumeric() || ".-".contains(c));
    let tld_ok = tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic());
    local_ok && host_ok && tld_ok
}

/// Render `duration_seconds` as the original's `"{h}h {m}m {s}s"`-style string,
/// dropping leading zero components.
pub fn readable_duration(total_seconds: i64) -> String {
    let total_seconds = total_seconds.max(0);
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readable_bytes_steps_through_units() {
        assert_eq!(readable_bytes(0), "0.0B");
        assert_eq!(readable_bytes(-5), "0B");
        assert_eq!(readable_bytes(2048), "2.0K");
        assert_eq!(readable_bytes(1024 * 1024 * 3), "3.0M");
    }

    #[test]
    fn pubkey_validation_rejects_wrong_length_and_bad_base64() {
        assert!(!validate_pubkey("too-short"));
        assert!(!validate_pubkey(&"!".repeat(44)));
        // 44 base64 chars decoding to exactly 32 bytes.
        let valid = base64::engine::general_purpose::STANDARD.encode([7u8; 32]);
        assert_eq!(valid.len(), 44);
        assert!(validate_pubkey(&valid));
    }

    #[test]
    fn email_validation_is_permissive_when_absent() {
        assert!(validate_email(None));
        assert!(validate_email(Some("")));
        assert!(validate_email(Some("a@b.co")));
        assert!(!validate_email(Some("not-an-email")));
        assert!(!validate_email(Some("a@b")));
    }

    #[test]
    fn duration_drops_leading_zero_components() {
        assert_eq!(readable_duration(5), "5s");
        assert_eq!(readable_duration(65), "1m 5s");
        assert_eq!(readable_duration(3661), "1h 1m 1s");
    }
}
