//! State-key validation for the ingest boundary.
//!
//! A state key is dotted lowercase: `^[a-z0-9]+(\.[a-z0-9_]+)+$`. External
//! ingest is further restricted to a prefix allow-list; runtime-managed
//! namespaces (`app.*`, `twitch.*`, `jinx.*`, `system.*`) are written only by
//! internal components and bypass this check.

use thiserror::Error;

/// First segments accepted on the external ingest path.
pub const INGEST_PREFIXES: &[&str] = &["ed", "music", "hw", "policy", "ai"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateKeyError {
    #[error("state_key must match ^[a-z0-9]+(\\.[a-z0-9_]+)+$: {0:?}")]
    Malformed(String),
    #[error("state_key prefix not in allow-list (ed, music, hw, policy, ai): {0:?}")]
    PrefixNotAllowed(String),
}

/// Validate the key shape alone (no prefix restriction).
pub fn is_well_formed(key: &str) -> bool {
    let mut segments = key.split('.');
    let Some(first) = segments.next() else {
        return false;
    };
    if first.is_empty() || !first.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()) {
        return false;
    }
    let mut rest = 0usize;
    for segment in segments {
        if segment.is_empty()
            || !segment
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
        {
            return false;
        }
        rest += 1;
    }
    rest >= 1
}

/// Full ingest-path validation: shape plus prefix allow-list.
pub fn validate_state_key(key: &str) -> Result<(), StateKeyError> {
    if !is_well_formed(key) {
        return Err(StateKeyError::Malformed(key.to_string()));
    }
    let first = key.split('.').next().unwrap_or_default();
    if !INGEST_PREFIXES.contains(&first) {
        return Err(StateKeyError::PrefixNotAllowed(key.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_allowed_dotted_keys() {
        for key in [
            "ed.running",
            "ed.telemetry.hull_percent",
            "music.track.title",
            "hw.cpu_percent",
            "policy.watch_condition",
            "ai.local.available",
        ] {
            assert_eq!(validate_state_key(key), Ok(()), "{key}");
        }
    }

    #[test]
    fn rejects_malformed_keys() {
        assert!(matches!(
            validate_state_key("ed..running"),
            Err(StateKeyError::Malformed(_))
        ));
        assert!(matches!(
            validate_state_key("System.CPU"),
            Err(StateKeyError::Malformed(_))
        ));
        assert!(matches!(
            validate_state_key("ed"),
            Err(StateKeyError::Malformed(_))
        ));
        assert!(matches!(
            validate_state_key("music-now_playing"),
            Err(StateKeyError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_runtime_prefixes_on_ingest() {
        assert!(matches!(
            validate_state_key("app.sammi.running"),
            Err(StateKeyError::PrefixNotAllowed(_))
        ));
        assert!(matches!(
            validate_state_key("twitch.cursor.chat"),
            Err(StateKeyError::PrefixNotAllowed(_))
        ));
    }

    #[test]
    fn underscore_not_allowed_in_first_segment() {
        assert!(!is_well_formed("ed_game.running"));
        assert!(is_well_formed("ed.on_foot"));
    }
}
