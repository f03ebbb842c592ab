//! Twitch ingest service: commit-marker resolution, dedupe, variable fetch,
//! and persistence.

use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};
use watchkeeper_db::WatchkeeperDb;
use watchkeeper_protocol::doorbell::{
    looks_like_variable_name, normalize_marker, DoorbellToken, TwitchCategory,
};
use watchkeeper_protocol::types::NewEvent;

use crate::sammi::SammiClient;

pub const EVENT_TWITCH_EVENT: &str = "TWITCH_EVENT";

/// Per-category variable bindings: which bridge variables hold the commit
/// marker and the event fields.
#[derive(Debug, Clone, Default)]
pub struct CategoryBinding {
    pub commit_keys: Vec<String>,
    pub fields: Vec<(String, Vec<String>)>,
}

#[derive(Debug, Clone)]
pub struct VariableIndex {
    bindings: BTreeMap<TwitchCategory, CategoryBinding>,
}

impl VariableIndex {
    /// Built-in bindings follow the `ID<code>.<field>` convention of the
    /// bridge deck.
    pub fn defaults() -> Self {
        let mut bindings = BTreeMap::new();
        for category in TwitchCategory::ALL {
            let prefix = format!("ID{}", category.code());
            let mut fields = vec![
                ("user_id".to_string(), vec![format!("{prefix}.user_id")]),
                ("login_name".to_string(), vec![format!("{prefix}.login_name")]),
                (
                    "display_name".to_string(),
                    vec![format!("{prefix}.display_name")],
                ),
            ];
            match category {
                TwitchCategory::Chat => {
                    fields.push(("message_id".to_string(), vec![format!("{prefix}.message_id")]));
                    fields.push((
                        "message_text".to_string(),
                        vec![format!("{prefix}.message_text")],
                    ));
                    fields.push(("flags_json".to_string(), vec![format!("{prefix}.flags")]));
                }
                TwitchCategory::Bits | TwitchCategory::Hype => {
                    fields.push(("amount".to_string(), vec![format!("{prefix}.amount")]));
                }
                TwitchCategory::Redeem => {
                    fields.push(("reward_id".to_string(), vec![format!("{prefix}.reward_id")]));
                    fields.push((
                        "reward_title".to_string(),
                        vec![format!("{prefix}.reward_title")],
                    ));
                }
                TwitchCategory::Raid => {
                    fields.push(("viewers".to_string(), vec![format!("{prefix}.viewers")]));
                }
                _ => {}
            }
            bindings.insert(
                category,
                CategoryBinding {
                    commit_keys: vec![format!("{prefix}.commit_ts")],
                    fields,
                },
            );
        }
        Self { bindings }
    }

    /// Load the index document, overlaying the defaults per category.
    ///
    /// Document shape: `{"CHAT": {"commit": ["ID101.commit_ts"],
    /// "fields": {"user_id": ["ID101.user_id"], ...}}, ...}`
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let parsed: Value = serde_json::from_str(&raw)?;
        let mut index = Self::defaults();
        let Some(object) = parsed.as_object() else {
            anyhow::bail!("variable index must be a JSON object");
        };
        for (name, entry) in object {
            let Ok(category) = name.parse::<TwitchCategory>() else {
                warn!(category = %name, "unknown category in variable index; skipping");
                continue;
            };
            let binding = index.bindings.entry(category).or_default();
            if let Some(commit) = entry.get("commit").and_then(Value::as_array) {
                binding.commit_keys = commit
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect();
            }
            if let Some(fields) = entry.get("fields").and_then(Value::as_object) {
                binding.fields = fields
                    .iter()
                    .map(|(field, vars)| {
                        let vars = vars
                            .as_array()
                            .map(|arr| {
                                arr.iter()
                                    .filter_map(Value::as_str)
                                    .map(str::to_string)
                                    .collect()
                            })
                            .unwrap_or_default();
                        (field.clone(), vars)
                    })
                    .collect();
            }
        }
        Ok(index)
    }

    pub fn binding(&self, category: TwitchCategory) -> &CategoryBinding {
        self.bindings
            .get(&category)
            .expect("all categories have bindings")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestResult {
    Ingested { commit_marker: String, user_id: String },
    Duplicate { commit_marker: String },
    NoMarker,
}

pub struct TwitchIngest {
    db: WatchkeeperDb,
    sammi: Arc<SammiClient>,
    index: VariableIndex,
}

impl TwitchIngest {
    pub fn new(db: WatchkeeperDb, sammi: Arc<SammiClient>, index: VariableIndex) -> Self {
        Self { db, sammi, index }
    }

    /// Resolve the commit marker for a packet. A configured marker variable
    /// wins over the packet timestamp; one pass, no retry.
    async fn resolve_marker(&self, token: &DoorbellToken) -> Option<String> {
        let binding = self.index.binding(token.category);

        // Explicit variable-name hint in the packet.
        if looks_like_variable_name(&token.marker) {
            if let Some(value) = self.sammi.get_var(&token.marker).await {
                let resolved = value_text(&value);
                if !resolved.is_empty() {
                    return Some(normalize_marker(&resolved));
                }
            }
        } else {
            // Configured commit variable takes precedence over the packet
            // timestamp when readable.
            for key in &binding.commit_keys {
                if let Some(value) = self.sammi.get_var(key).await {
                    let resolved = value_text(&value);
                    if !resolved.is_empty() {
                        return Some(normalize_marker(&resolved));
                    }
                }
            }
            if !token.marker.is_empty() {
                return Some(normalize_marker(&token.marker));
            }
        }
        None
    }

    /// Handle one parsed doorbell token end to end.
    pub async fn handle_token(&self, token: DoorbellToken) -> anyhow::Result<IngestResult> {
        let category = token.category;
        let Some(commit_marker) = self.resolve_marker(&token).await else {
            debug!(category = %category, "doorbell without resolvable commit marker");
            return Ok(IngestResult::NoMarker);
        };

        // Cheap pre-check; the real guard is the atomic cursor advance below.
        if let Some(cursor) = self.db.get_cursor(category.as_str()).await? {
            if commit_marker.as_str() <= cursor.last_commit_marker.as_str() {
                debug!(category = %category, marker = %commit_marker, "duplicate doorbell dropped");
                return Ok(IngestResult::Duplicate { commit_marker });
            }
        }

        let binding = self.index.binding(category);
        let all_vars: Vec<String> = binding
            .fields
            .iter()
            .flat_map(|(_, vars)| vars.iter().cloned())
            .collect();
        let values = self.sammi.get_vars(&all_vars).await;

        let mut payload = Map::new();
        for (field, vars) in &binding.fields {
            let resolved = vars.iter().find_map(|var| {
                values.get(var).filter(|v| !value_text(v).is_empty()).cloned()
            });
            payload.insert(field.clone(), resolved.unwrap_or(Value::Null));
        }
        let payload = Value::Object(payload);

        if !self
            .db
            .advance_cursor(category.as_str(), &commit_marker, token.seq)
            .await?
        {
            return Ok(IngestResult::Duplicate { commit_marker });
        }

        let user_id = normalize_user_id(&payload);
        let login_name = text_field(&payload, "login_name");
        let display_name = text_field(&payload, "display_name");
        let flags = parse_flags(&payload);

        self.db
            .upsert_twitch_user(
                &user_id,
                login_name.as_deref(),
                display_name.as_deref(),
                &flags,
                &commit_marker,
                category == TwitchCategory::Chat,
            )
            .await?;

        match category {
            TwitchCategory::Chat => {
                let text = text_field(&payload, "message_text").unwrap_or_default();
                let msg_id = text_field(&payload, "message_id");
                self.db
                    .insert_recent_message_and_prune(
                        &user_id,
                        &commit_marker,
                        msg_id.as_deref(),
                        &text,
                        5,
                    )
                    .await?;
            }
            TwitchCategory::Bits => {
                self.db.add_bits(&user_id, amount_field(&payload)).await?;
            }
            TwitchCategory::Hype => {
                self.db.add_hype(&user_id, amount_field(&payload)).await?;
            }
            TwitchCategory::Redeem => {
                let reward_id =
                    text_field(&payload, "reward_id").unwrap_or_else(|| "unknown_reward".to_string());
                let reward_title = text_field(&payload, "reward_title").unwrap_or_default();
                self.db
                    .add_redeem(&user_id, &reward_id, &reward_title, &commit_marker)
                    .await?;
            }
            _ => {}
        }

        self.db
            .record_recent_twitch_event(category.as_str(), &commit_marker, &user_id, &payload)
            .await?;

        self.db
            .append_event(
                NewEvent::new(
                    EVENT_TWITCH_EVENT,
                    "twitch_ingest",
                    json!({
                        "category": category.as_str(),
                        "commit_marker": commit_marker,
                        "user_id": user_id,
                        "seq": token.seq,
                        "payload": payload,
                    }),
                )
                .tags(["twitch", "ingest"]),
            )
            .await?;

        Ok(IngestResult::Ingested {
            commit_marker,
            user_id,
        })
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn text_field(payload: &Value, field: &str) -> Option<String> {
    let text = value_text(payload.get(field)?);
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn amount_field(payload: &Value) -> i64 {
    match payload.get("amount") {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

/// Bridge variables are stringly typed; user ids arrive as numbers, floats
/// with a fraction part of zero, or strings. Fall back to the login name.
pub fn normalize_user_id(payload: &Value) -> String {
    match payload.get("user_id") {
        Some(Value::Number(n)) => {
            if let Some(int) = n.as_i64() {
                return int.to_string();
            }
            if let Some(float) = n.as_f64() {
                if float.is_finite() && float.fract() == 0.0 {
                    return (float as i64).to_string();
                }
                if float.is_finite() {
                    return float.to_string();
                }
            }
        }
        Some(Value::String(s)) => {
            let text = s.trim();
            if !text.is_empty() {
                // Spreadsheet-style float formatting of an integral id.
                if text.contains('.') || text.contains('e') || text.contains('E') {
                    if let Ok(float) = text.parse::<f64>() {
                        if float.is_finite() && float.fract() == 0.0 {
                            return (float as i64).to_string();
                        }
                    }
                }
                return text.to_string();
            }
        }
        _ => {}
    }
    if let Some(login) = text_field(payload, "login_name") {
        return format!("login:{}", login.to_lowercase());
    }
    "unknown".to_string()
}

fn parse_flags(payload: &Value) -> Value {
    let mut flags = Map::new();
    if let Some(raw) = payload.get("flags_json").and_then(Value::as_str) {
        if let Ok(Value::Object(parsed)) = serde_json::from_str::<Value>(raw) {
            flags.extend(parsed);
        }
    }
    for key in ["is_vip", "is_mod", "is_sub", "is_broadcaster"] {
        if let Some(value) = payload.get(key) {
            let flag = match value {
                Value::Bool(b) => *b,
                Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
                Value::String(s) => {
                    matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
                }
                _ => false,
            };
            flags.insert(key.to_string(), json!(flag));
        }
    }
    Value::Object(flags)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_normalization() {
        assert_eq!(normalize_user_id(&json!({"user_id": 42})), "42");
        assert_eq!(normalize_user_id(&json!({"user_id": "42.0"})), "42");
        assert_eq!(normalize_user_id(&json!({"user_id": "  1234 "})), "1234");
        assert_eq!(
            normalize_user_id(&json!({"user_id": "", "login_name": "Viewer"})),
            "login:viewer"
        );
        assert_eq!(normalize_user_id(&json!({})), "unknown");
    }

    #[test]
    fn flags_merge_json_and_direct() {
        let payload = json!({"flags_json": "{\"is_vip\": true}", "is_mod": "yes"});
        let flags = parse_flags(&payload);
        assert_eq!(flags["is_vip"], json!(true));
        assert_eq!(flags["is_mod"], json!(true));
    }

    #[test]
    fn default_index_covers_all_categories() {
        let index = VariableIndex::defaults();
        for category in TwitchCategory::ALL {
            let binding = index.binding(category);
            assert!(!binding.commit_keys.is_empty());
            assert!(binding.fields.iter().any(|(f, _)| f == "user_id"));
        }
        assert_eq!(
            index.binding(TwitchCategory::Chat).commit_keys,
            vec!["ID101.commit_ts".to_string()]
        );
    }
}
