use std::env;
use std::path::PathBuf;

use typix_contracts::providers::RuntimeCapabilities;

const DEFAULT_WORKERS: usize = 4;
const MAX_WORKERS: usize = 32;

/// Host-owned Cloudflare credentials used by the built-in settings variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudflareCredentials {
    pub account_id: String,
    pub api_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub workers: usize,
    pub events_path: Option<PathBuf>,
    pub builtin_cloudflare: Option<CloudflareCredentials>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("typix-data"),
            workers: DEFAULT_WORKERS,
            events_path: None,
            builtin_cloudflare: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let workers = non_empty_env("TYPIX_WORKERS")
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or(defaults.workers)
            .clamp(1, MAX_WORKERS);
        let builtin_enabled = non_empty_env("TYPIX_CLOUDFLARE_BUILTIN")
            .map(|value| parse_flag(&value))
            .unwrap_or(false);
        let builtin_cloudflare = if builtin_enabled {
            match (
                non_empty_env("CLOUDFLARE_ACCOUNT_ID"),
                non_empty_env("CLOUDFLARE_API_TOKEN"),
            ) {
                (Some(account_id), Some(api_token)) => Some(CloudflareCredentials {
                    account_id,
                    api_token,
                }),
                _ => None,
            }
        } else {
            None
        };

        Self {
            data_dir: non_empty_env("TYPIX_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            workers,
            events_path: non_empty_env("TYPIX_EVENTS_PATH").map(PathBuf::from),
            builtin_cloudflare,
        }
    }

    pub fn runtime(&self) -> RuntimeCapabilities {
        RuntimeCapabilities {
            builtin_credentials: self.builtin_cloudflare.is_some(),
        }
    }
}

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// `<KEY>` from the environment without a trailing slash, or `default`.
pub(crate) fn api_base_from_env(key: &str, default: &str) -> String {
    non_empty_env(key)
        .map(|value| value.trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
