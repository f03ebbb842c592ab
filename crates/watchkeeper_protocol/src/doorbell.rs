//! Doorbell token parsing.
//!
//! A doorbell is a tiny UDP datagram announcing that a stream event's
//! variables are ready to read from the bridge. Two wire forms:
//!
//! - pipe form: `CATEGORY|marker[|seq]`, e.g. `REDEEM|1700000000000|3`
//! - packed numeric form: `CCC<timestamp>`, e.g. `104193735314` = FOLLOW with
//!   marker `193735314` (three-digit category code + commit marker)
//!
//! Malformed tokens are dropped silently by the listener; parsing never
//! panics.

use chrono::{DateTime, Duration, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Fixed category table; the numeric codes are part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TwitchCategory {
    Chat,
    Redeem,
    Bits,
    Follow,
    Sub,
    Raid,
    HypeTrain,
    Poll,
    Prediction,
    Shoutout,
    PowerUps,
    Hype,
}

impl TwitchCategory {
    pub const ALL: [TwitchCategory; 12] = [
        TwitchCategory::Chat,
        TwitchCategory::Redeem,
        TwitchCategory::Bits,
        TwitchCategory::Follow,
        TwitchCategory::Sub,
        TwitchCategory::Raid,
        TwitchCategory::HypeTrain,
        TwitchCategory::Poll,
        TwitchCategory::Prediction,
        TwitchCategory::Shoutout,
        TwitchCategory::PowerUps,
        TwitchCategory::Hype,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TwitchCategory::Chat => "CHAT",
            TwitchCategory::Redeem => "REDEEM",
            TwitchCategory::Bits => "BITS",
            TwitchCategory::Follow => "FOLLOW",
            TwitchCategory::Sub => "SUB",
            TwitchCategory::Raid => "RAID",
            TwitchCategory::HypeTrain => "HYPE_TRAIN",
            TwitchCategory::Poll => "POLL",
            TwitchCategory::Prediction => "PREDICTION",
            TwitchCategory::Shoutout => "SHOUTOUT",
            TwitchCategory::PowerUps => "POWER_UPS",
            TwitchCategory::Hype => "HYPE",
        }
    }

    pub fn code(self) -> u16 {
        match self {
            TwitchCategory::Chat => 101,
            TwitchCategory::Redeem => 102,
            TwitchCategory::Bits => 103,
            TwitchCategory::Follow => 104,
            TwitchCategory::Sub => 105,
            TwitchCategory::Raid => 106,
            TwitchCategory::HypeTrain => 107,
            TwitchCategory::Poll => 108,
            TwitchCategory::Prediction => 109,
            TwitchCategory::Shoutout => 110,
            TwitchCategory::PowerUps => 111,
            TwitchCategory::Hype => 112,
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "101" => Some(TwitchCategory::Chat),
            "102" => Some(TwitchCategory::Redeem),
            "103" => Some(TwitchCategory::Bits),
            "104" => Some(TwitchCategory::Follow),
            "105" => Some(TwitchCategory::Sub),
            "106" => Some(TwitchCategory::Raid),
            "107" => Some(TwitchCategory::HypeTrain),
            "108" => Some(TwitchCategory::Poll),
            "109" => Some(TwitchCategory::Prediction),
            "110" => Some(TwitchCategory::Shoutout),
            "111" => Some(TwitchCategory::PowerUps),
            "112" => Some(TwitchCategory::Hype),
            _ => None,
        }
    }
}

impl fmt::Display for TwitchCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TwitchCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Bridge setups have shipped a handful of spellings per category.
        match s.trim().to_ascii_uppercase().as_str() {
            "CHAT" => Ok(TwitchCategory::Chat),
            "REDEEM" => Ok(TwitchCategory::Redeem),
            "BITS" | "BITDONATION" => Ok(TwitchCategory::Bits),
            "FOLLOW" | "NEWFOLLOW" => Ok(TwitchCategory::Follow),
            "SUB" | "SUBSCRIPTION" => Ok(TwitchCategory::Sub),
            "RAID" => Ok(TwitchCategory::Raid),
            "HYPETRAIN" | "HYPE_TRAIN" => Ok(TwitchCategory::HypeTrain),
            "POLL" => Ok(TwitchCategory::Poll),
            "PREDICTION" => Ok(TwitchCategory::Prediction),
            "SHOUTOUT" => Ok(TwitchCategory::Shoutout),
            "POWERUPS" | "POWER_UPS" => Ok(TwitchCategory::PowerUps),
            "HYPE" => Ok(TwitchCategory::Hype),
            other => TwitchCategory::from_code(other)
                .ok_or_else(|| format!("unknown twitch category: {other}")),
        }
    }
}

/// A successfully parsed doorbell packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoorbellToken {
    pub category: TwitchCategory,
    /// Raw commit marker from the packet; may be empty when only the category
    /// was sent.
    pub marker: String,
    /// Optional trailing sequence hint. Accepted but never used for dedupe.
    pub seq: u32,
}

impl DoorbellToken {
    /// Parse either wire form. `None` means the token is malformed and the
    /// packet should be dropped.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim().trim_matches('\0');
        if raw.is_empty() {
            return None;
        }

        // Packed numeric form: category code followed by the marker digits.
        if !raw.contains('|') && raw.len() >= 4 && raw.bytes().all(|b| b.is_ascii_digit()) {
            let category = TwitchCategory::from_code(&raw[..3])?;
            let marker = &raw[3..];
            if marker.is_empty() {
                return None;
            }
            return Some(DoorbellToken {
                category,
                marker: marker.to_string(),
                seq: 0,
            });
        }

        let mut parts = raw.split('|');
        let category = parts.next()?.parse::<TwitchCategory>().ok()?;
        let marker = parts.next().unwrap_or_default().trim().to_string();
        let seq = parts
            .next()
            .and_then(|s| s.trim().parse::<u32>().ok())
            .unwrap_or(0);
        Some(DoorbellToken {
            category,
            marker,
            seq,
        })
    }
}

/// Normalize a digit-string commit marker to ISO-8601 UTC so markers from
/// different bridge configurations compare lexicographically.
///
/// 13+ digits are epoch milliseconds, 10+ digits epoch seconds, anything
/// shorter a seconds offset from 2020-01-01. Non-digit markers pass through
/// unchanged.
pub fn normalize_marker(raw: &str) -> String {
    let text = raw.trim();
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return text.to_string();
    }
    let Ok(value) = text.parse::<i64>() else {
        return text.to_string();
    };
    if value <= 0 {
        return text.to_string();
    }
    let parsed: Option<DateTime<Utc>> = if text.len() >= 13 {
        Utc.timestamp_millis_opt(value).single()
    } else if text.len() >= 10 {
        Utc.timestamp_opt(value, 0).single()
    } else {
        Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0)
            .single()
            .map(|base| base + Duration::seconds(value))
    };
    match parsed {
        Some(ts) => ts.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => text.to_string(),
    }
}

/// True when a marker hint looks like a bridge variable name rather than a
/// timestamp (dotted, no separators a timestamp would carry).
pub fn looks_like_variable_name(value: &str) -> bool {
    let text = value.trim();
    if text.is_empty() || !text.contains('.') {
        return false;
    }
    if text.contains(':') || text.contains('-') || text.contains(' ') {
        return false;
    }
    text.bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pipe_form() {
        let token = DoorbellToken::parse("REDEEM|1700000000000|3").unwrap();
        assert_eq!(token.category, TwitchCategory::Redeem);
        assert_eq!(token.marker, "1700000000000");
        assert_eq!(token.seq, 3);
    }

    #[test]
    fn parses_packed_numeric_form() {
        let token = DoorbellToken::parse("104193735314").unwrap();
        assert_eq!(token.category, TwitchCategory::Follow);
        assert_eq!(token.marker, "193735314");
        assert_eq!(token.seq, 0);
    }

    #[test]
    fn accepts_category_aliases() {
        assert_eq!(
            DoorbellToken::parse("hypetrain|99").unwrap().category,
            TwitchCategory::HypeTrain
        );
        assert_eq!(
            DoorbellToken::parse("101|1700000000").unwrap().category,
            TwitchCategory::Chat
        );
    }

    #[test]
    fn drops_malformed_tokens() {
        for raw in ["", "  ", "\0\0", "GARBAGE|123", "999123456", "1", "0"] {
            assert!(DoorbellToken::parse(raw).is_none(), "{raw:?}");
        }
    }

    #[test]
    fn bare_category_has_empty_marker() {
        // The bridge sometimes rings with just the category; the commit
        // marker is then read from the configured variable.
        let token = DoorbellToken::parse("104").unwrap();
        assert_eq!(token.category, TwitchCategory::Follow);
        assert!(token.marker.is_empty());
    }

    #[test]
    fn bad_seq_defaults_to_zero() {
        let token = DoorbellToken::parse("CHAT|1700000000000|nope").unwrap();
        assert_eq!(token.seq, 0);
    }

    #[test]
    fn marker_normalization_widths() {
        assert_eq!(
            normalize_marker("1700000000000"),
            "2023-11-14T22:13:20.000Z"
        );
        assert_eq!(normalize_marker("1700000000"), "2023-11-14T22:13:20.000Z");
        // Short digits offset from 2020-01-01.
        assert_eq!(normalize_marker("60"), "2020-01-01T00:01:00.000Z");
        // Non-digit markers are untouched.
        assert_eq!(normalize_marker("2024-01-01T00:00:00Z"), "2024-01-01T00:00:00Z");
    }

    #[test]
    fn variable_name_detection() {
        assert!(looks_like_variable_name("ID102.commit_ts"));
        assert!(!looks_like_variable_name("1700000000000"));
        assert!(!looks_like_variable_name("2024-01-01T00:00:00Z"));
    }
}
