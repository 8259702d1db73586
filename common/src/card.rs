//! Capability cards: structured, purely informational advertisements
//! stored alongside a node's registry entry.
//!
//! The registry stores and returns cards but never interprets them, so
//! sanitization only subtracts: unknown keys are dropped, wrongly
//! typed values are dropped, strings are trimmed and length-capped, lists
//! are truncated.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const MAX_CARD_TEXT_LEN: usize = 200;
pub const MAX_CARD_SUMMARY_LEN: usize = 500;
pub const MAX_CARD_LIST_ITEMS: usize = 20;
pub const MAX_CARD_MODELS: usize = 10;
pub const MAX_CARD_EXAMPLES: usize = 5;
pub const MAX_CARD_EXAMPLE_LEN: usize = 1000;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityCard {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skills: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub languages: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<CardTool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<CardModel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pricing: Option<CardPricing>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limits: Option<CardLimits>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub availability: Option<CardAvailability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<CardAuth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<CardContact>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub examples: Vec<CardExample>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CardTool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CardModel {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_tokens: Option<u64>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CardPricing {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_request: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per1k_tokens: Option<f64>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CardLimits {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_sec: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_per_min: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_per_min_by_node: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u64>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CardAvailability {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hours: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime90d: Option<f64>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CardAuth {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CardContact {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CardExample {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

fn clean_str(value: &Value, max_len: usize) -> Option<String> {
    let s = value.as_str()?.trim();
    if s.is_empty() {
        return None;
    }
    if s.len() <= max_len {
        return Some(s.to_string());
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    Some(s[..end].to_string())
}

fn str_field(obj: &Value, key: &str, max_len: usize) -> Option<String> {
    obj.get(key).and_then(|v| clean_str(v, max_len))
}

fn str_list(obj: &Value, key: &str) -> Vec<String> {
    obj.get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| clean_str(v, MAX_CARD_TEXT_LEN))
                .take(MAX_CARD_LIST_ITEMS)
                .collect()
        })
        .unwrap_or_default()
}

fn u64_field(obj: &Value, key: &str) -> Option<u64> {
    obj.get(key).and_then(Value::as_u64)
}

fn f64_field(obj: &Value, key: &str) -> Option<f64> {
    obj.get(key).and_then(Value::as_f64).filter(|f| f.is_finite())
}

fn bool_field(obj: &Value, key: &str) -> Option<bool> {
    obj.get(key).and_then(Value::as_bool)
}

impl CapabilityCard {
    /// Build a sanitized card from an untrusted JSON value. Anything that
    /// is not an object yields an empty card.
    pub fn sanitize(raw: &Value) -> CapabilityCard {
        if !raw.is_object() {
            return CapabilityCard::default();
        }

        let tools = raw
            .get("tools")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        let name = str_field(item, "name", MAX_CARD_TEXT_LEN)?;
                        Some(CardTool {
                            name,
                            scope: str_field(item, "scope", MAX_CARD_TEXT_LEN),
                            notes: str_field(item, "notes", MAX_CARD_TEXT_LEN),
                        })
                    })
                    .take(MAX_CARD_LIST_ITEMS)
                    .collect()
            })
            .unwrap_or_default();

        let models = raw
            .get("models")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        let id = str_field(item, "id", MAX_CARD_TEXT_LEN)?;
                        Some(CardModel {
                            id,
                            provider: str_field(item, "provider", MAX_CARD_TEXT_LEN),
                            context_tokens: u64_field(item, "contextTokens"),
                        })
                    })
                    .take(MAX_CARD_MODELS)
                    .collect()
            })
            .unwrap_or_default();

        let pricing = raw.get("pricing").filter(|v| v.is_object()).map(|p| CardPricing {
            unit: str_field(p, "unit", MAX_CARD_TEXT_LEN),
            per_request: u64_field(p, "perRequest"),
            per1k_tokens: f64_field(p, "per1kTokens"),
        });

        let limits = raw.get("limits").filter(|v| v.is_object()).map(|l| CardLimits {
            max_tokens: u64_field(l, "maxTokens"),
            timeout_sec: u64_field(l, "timeoutSec"),
            rate_limit_per_min: u64_field(l, "rateLimitPerMin"),
            rate_limit_per_min_by_node: u64_field(l, "rateLimitPerMinByNode"),
            concurrency: u64_field(l, "concurrency"),
        });

        let availability = raw
            .get("availability")
            .filter(|v| v.is_object())
            .map(|a| CardAvailability {
                status: str_field(a, "status", MAX_CARD_TEXT_LEN),
                hours: str_field(a, "hours", MAX_CARD_TEXT_LEN),
                uptime90d: f64_field(a, "uptime90d"),
            });

        let auth = raw.get("auth").filter(|v| v.is_object()).map(|a| CardAuth {
            mode: str_field(a, "mode", MAX_CARD_TEXT_LEN),
            required: bool_field(a, "required"),
        });

        let contact = raw.get("contact").filter(|v| v.is_object()).map(|c| CardContact {
            owner: str_field(c, "owner", MAX_CARD_TEXT_LEN),
            website: str_field(c, "website", MAX_CARD_TEXT_LEN),
        });

        let examples = raw
            .get("examples")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter(|v| v.is_object())
                    .map(|item| CardExample {
                        input: str_field(item, "input", MAX_CARD_EXAMPLE_LEN),
                        output: str_field(item, "output", MAX_CARD_EXAMPLE_LEN),
                    })
                    .filter(|e| e.input.is_some() || e.output.is_some())
                    .take(MAX_CARD_EXAMPLES)
                    .collect()
            })
            .unwrap_or_default();

        CapabilityCard {
            schema_version: str_field(raw, "schemaVersion", MAX_CARD_TEXT_LEN),
            summary: str_field(raw, "summary", MAX_CARD_SUMMARY_LEN),
            region: str_field(raw, "region", MAX_CARD_TEXT_LEN),
            skills: str_list(raw, "skills"),
            languages: str_list(raw, "languages"),
            tags: str_list(raw, "tags"),
            tools,
            models,
            pricing,
            limits,
            availability,
            auth,
            contact,
            examples,
        }
    }

    /// Sanitized card as a JSON value for storage on a node entry.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("capability card serialization cannot fail")
    }
}
