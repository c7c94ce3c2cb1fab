use std::collections::HashMap;

use anyhow::Result;
use serde_json::Value;
use typix_contracts::providers::{ImageProvider, RawSettings};

use crate::config::non_empty_env;

/// Where a user's raw provider settings come from. Validation happens later, inside the
/// provider, so a source never rejects settings itself.
pub trait SettingsSource: Send + Sync {
    fn load(&self, user_id: &str, provider: &dyn ImageProvider) -> Result<RawSettings>;
}

/// Fixed settings per provider, optionally overridden per user.
#[derive(Debug, Clone, Default)]
pub struct StaticSettings {
    providers: HashMap<String, RawSettings>,
    users: HashMap<(String, String), RawSettings>,
}

impl StaticSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, provider_id: &str, settings: RawSettings) -> Self {
        self.providers.insert(provider_id.to_string(), settings);
        self
    }

    pub fn with_user(mut self, user_id: &str, provider_id: &str, settings: RawSettings) -> Self {
        self.users
            .insert((user_id.to_string(), provider_id.to_string()), settings);
        self
    }
}

impl SettingsSource for StaticSettings {
    fn load(&self, user_id: &str, provider: &dyn ImageProvider) -> Result<RawSettings> {
        let mut merged = self
            .providers
            .get(provider.id())
            .cloned()
            .unwrap_or_default();
        if let Some(overrides) = self
            .users
            .get(&(user_id.to_string(), provider.id().to_string()))
        {
            for (key, value) in overrides {
                merged.insert(key.clone(), value.clone());
            }
        }
        Ok(merged)
    }
}

/// Reads `TYPIX_<PROVIDER>_<KEY>` for every key in the provider's schema, e.g.
/// `apiKey` of `openai` from `TYPIX_OPENAI_API_KEY`. The same values apply to every user.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSettings;

impl EnvSettings {
    pub fn var_name(provider_id: &str, key: &str) -> String {
        format!(
            "TYPIX_{}_{}",
            env_segment(provider_id),
            env_segment(&split_camel_case(key))
        )
    }
}

impl SettingsSource for EnvSettings {
    fn load(&self, _user_id: &str, provider: &dyn ImageProvider) -> Result<RawSettings> {
        let mut raw = RawSettings::new();
        for item in provider.settings().items() {
            if let Some(value) = non_empty_env(&Self::var_name(provider.id(), &item.key)) {
                raw.insert(item.key.clone(), Value::String(value));
            }
        }
        Ok(raw)
    }
}

/// `baseURL` -> `base_URL`, `accountId` -> `account_Id`.
fn split_camel_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    let mut prev_lower = false;
    for ch in key.chars() {
        if ch.is_ascii_uppercase() && prev_lower {
            out.push('_');
        }
        prev_lower = ch.is_ascii_lowercase() || ch.is_ascii_digit();
        out.push(ch);
    }
    out
}

fn env_segment(raw: &str) -> String {
    raw.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() {
                ch.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
