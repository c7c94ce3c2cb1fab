use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ConfigInvalid;

/// Settings exactly as stored for a user, before defaults and validation.
pub type RawSettings = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingType {
    Password,
    String,
    Url,
    Boolean,
    Number,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingItem {
    pub key: String,
    #[serde(rename = "type")]
    pub kind: SettingType,
    pub required: bool,
    pub default_value: Option<Value>,
}

impl SettingItem {
    pub fn required(key: &str, kind: SettingType) -> Self {
        Self {
            key: key.to_string(),
            kind,
            required: true,
            default_value: None,
        }
    }

    pub fn optional(key: &str, kind: SettingType) -> Self {
        Self {
            required: false,
            ..Self::required(key, kind)
        }
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }
}

/// Host capabilities a provider is constructed with. Decides which schema variant it exposes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeCapabilities {
    /// The host supplies provider credentials itself, so users need not configure them.
    pub builtin_credentials: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "variant", content = "items", rename_all = "snake_case")]
pub enum SettingsSchema {
    Standard(Vec<SettingItem>),
    Builtin(Vec<SettingItem>),
}

impl SettingsSchema {
    pub fn items(&self) -> &[SettingItem] {
        match self {
            Self::Standard(items) | Self::Builtin(items) => items.as_slice(),
        }
    }

    pub fn is_builtin(&self) -> bool {
        matches!(self, Self::Builtin(_))
    }

    pub fn item(&self, key: &str) -> Option<&SettingItem> {
        self.items().iter().find(|item| item.key == key)
    }
}

/// Validated settings: every schema key that has a value, coerced to its declared type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedSettings {
    provider: String,
    values: Map<String, Value>,
}

impl ParsedSettings {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn bool(&self, key: &str) -> Option<bool> {
        self.values.get(key).and_then(Value::as_bool)
    }

    pub fn f64(&self, key: &str) -> Option<f64> {
        self.values.get(key).and_then(Value::as_f64)
    }

    /// A string the provider cannot work without, even if the schema marks it optional
    /// (built-in variants relax `required` but still need credentials on the non-built-in path).
    pub fn require_str(&self, key: &str) -> Result<&str, ConfigInvalid> {
        self.str(key).ok_or_else(|| {
            ConfigInvalid::new(&self.provider, format!("missing required key '{key}'"))
        })
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }
}

/// Fills schema defaults into `raw`, leaving keys the schema does not know untouched.
pub fn apply_defaults(schema: &SettingsSchema, raw: &RawSettings) -> RawSettings {
    let mut merged = raw.clone();
    for item in schema.items() {
        let missing = merged.get(&item.key).map(is_blank).unwrap_or(true);
        if missing {
            if let Some(default) = item.default_value.clone() {
                merged.insert(item.key.clone(), default);
            }
        }
    }
    merged
}

pub fn parse_settings(
    provider: &str,
    schema: &SettingsSchema,
    raw: &RawSettings,
) -> Result<ParsedSettings, ConfigInvalid> {
    let merged = apply_defaults(schema, raw);
    let mut values = Map::new();
    for item in schema.items() {
        let Some(value) = merged.get(&item.key).filter(|value| !is_blank(value)) else {
            if item.required {
                return Err(ConfigInvalid::new(
                    provider,
                    format!("missing required key '{}'", item.key),
                ));
            }
            continue;
        };
        let coerced = coerce(item, value).ok_or_else(|| {
            ConfigInvalid::new(
                provider,
                format!(
                    "key '{}' expects a {} value",
                    item.key,
                    type_label(item.kind)
                ),
            )
        })?;
        values.insert(item.key.clone(), coerced);
    }
    Ok(ParsedSettings {
        provider: provider.to_string(),
        values,
    })
}

fn coerce(item: &SettingItem, value: &Value) -> Option<Value> {
    match item.kind {
        SettingType::Password | SettingType::String => {
            value.as_str().map(|raw| Value::String(raw.trim().to_string()))
        }
        SettingType::Url => {
            let raw = value.as_str()?.trim();
            if raw.starts_with("http://") || raw.starts_with("https://") {
                Some(Value::String(raw.trim_end_matches('/').to_string()))
            } else {
                None
            }
        }
        SettingType::Boolean => match value {
            Value::Bool(flag) => Some(Value::Bool(*flag)),
            Value::String(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Some(Value::Bool(true)),
                "0" | "false" | "no" | "off" => Some(Value::Bool(false)),
                _ => None,
            },
            _ => None,
        },
        SettingType::Number => match value {
            Value::Number(_) => Some(value.clone()),
            Value::String(raw) => raw
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number),
            _ => None,
        },
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(raw) => raw.trim().is_empty(),
        _ => false,
    }
}

fn type_label(kind: SettingType) -> &'static str {
    match kind {
        SettingType::Password | SettingType::String => "string",
        SettingType::Url => "http(s) URL",
        SettingType::Boolean => "boolean",
        SettingType::Number => "numeric",
    }
}
