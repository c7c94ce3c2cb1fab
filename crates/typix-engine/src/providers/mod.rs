pub mod cloudflare;
pub mod dryrun;
pub mod fal;
pub mod flux;
pub mod openai;

use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::StatusCode;
use serde_json::{Map, Value};
use typix_contracts::providers::ProviderRegistry;

use crate::config::EngineConfig;
use crate::data_uri;

pub use cloudflare::CloudflareProvider;
pub use dryrun::DryrunProvider;
pub use fal::FalProvider;
pub use flux::FluxProvider;
pub use openai::OpenAiProvider;

const HTTP_TIMEOUT: Duration = Duration::from_secs(180);

pub fn default_provider_registry(config: &EngineConfig) -> ProviderRegistry {
    let mut providers = ProviderRegistry::new();
    providers.register(CloudflareProvider::new(config.builtin_cloudflare.clone()));
    providers.register(DryrunProvider::new());
    providers.register(FalProvider::new());
    providers.register(FluxProvider::new());
    providers.register(OpenAiProvider::new());
    providers
}

pub(crate) fn http_client() -> HttpClient {
    HttpClient::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| HttpClient::new())
}

/// True when `status` is one of the codes a provider uses to reject credentials or models.
pub(crate) fn is_config_rejection(status: StatusCode, codes: &[u16]) -> bool {
    codes.contains(&status.as_u16())
}

pub(crate) fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

/// Fetches a hosted result image and returns it as a data URI.
pub(crate) fn download_data_uri(http: &HttpClient, provider: &str, url: &str) -> Result<String> {
    let response = http
        .get(url)
        .send()
        .with_context(|| format!("failed downloading {provider} image ({url})"))?;
    if !response.status().is_success() {
        let code = response.status().as_u16();
        let body = response.text().unwrap_or_default();
        bail!(
            "{provider} image download failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let mime_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.split(';').next().unwrap_or(value).trim().to_string())
        .filter(|value| value.starts_with("image/"));
    let bytes = response
        .bytes()
        .with_context(|| format!("failed reading {provider} image bytes"))?
        .to_vec();
    Ok(match mime_type {
        Some(mime_type) => data_uri::encode(&bytes, &mime_type),
        None => data_uri::encode_sniffed(&bytes),
    })
}

/// Normalizes a provider's base64 field, which may or may not already be a data URI.
pub(crate) fn base64_to_data_uri(raw: &str) -> String {
    let raw = raw.trim();
    if raw.starts_with("data:") {
        return raw.to_string();
    }
    match data_uri::decode(raw) {
        Ok(decoded) => format!("data:{};base64,{raw}", decoded.mime_type),
        Err(_) => format!("data:image/png;base64,{raw}"),
    }
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

pub(crate) fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

/// Fixed-interval polling for asynchronous provider jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollPolicy {
    pub fn total_wait(&self) -> Duration {
        self.interval * self.max_attempts
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollState<T> {
    Pending,
    Ready(T),
}

/// Sleeps one interval before every attempt. Step errors abort immediately.
pub fn poll_until<T>(
    provider: &str,
    policy: PollPolicy,
    mut step: impl FnMut(u32) -> Result<PollState<T>>,
) -> Result<T> {
    for attempt in 1..=policy.max_attempts {
        thread::sleep(policy.interval);
        if let PollState::Ready(value) = step(attempt)? {
            return Ok(value);
        }
    }
    bail!(
        "{provider} generation timeout exceeded ({} polling attempts)",
        policy.max_attempts
    )
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::anyhow;
    use reqwest::StatusCode;

    use super::{
        base64_to_data_uri, default_provider_registry, is_config_rejection, poll_until,
        truncate_text, PollPolicy, PollState,
    };
    use crate::config::{CloudflareCredentials, EngineConfig};

    const FAST: PollPolicy = PollPolicy {
        interval: Duration::from_millis(1),
        max_attempts: 3,
    };

    #[test]
    fn default_registry_ships_every_provider() {
        let registry = default_provider_registry(&EngineConfig::default());
        assert_eq!(
            registry.list(),
            vec!["cloudflare", "dryrun", "fal", "flux", "openai"]
        );
        assert!(registry.contains_model("openai", "gpt-image-1"));
        assert!(registry.contains_model("flux", "flux-kontext-pro"));
    }

    #[test]
    fn cloudflare_schema_follows_runtime_credentials() -> anyhow::Result<()> {
        let standard = default_provider_registry(&EngineConfig::default());
        assert!(!standard.expect("cloudflare")?.settings().is_builtin());

        let config = EngineConfig {
            builtin_cloudflare: Some(CloudflareCredentials {
                account_id: "acct".to_string(),
                api_token: "token".to_string(),
            }),
            ..EngineConfig::default()
        };
        let builtin = default_provider_registry(&config);
        assert!(builtin.expect("cloudflare")?.settings().is_builtin());
        Ok(())
    }

    #[test]
    fn poll_until_returns_first_ready_value() -> anyhow::Result<()> {
        let value = poll_until("Test", FAST, |attempt| {
            Ok(if attempt == 2 {
                PollState::Ready(attempt)
            } else {
                PollState::Pending
            })
        })?;
        assert_eq!(value, 2);
        Ok(())
    }

    #[test]
    fn poll_until_times_out_after_max_attempts() {
        let mut calls = 0;
        let err = poll_until::<()>("Test", FAST, |_| {
            calls += 1;
            Ok(PollState::Pending)
        })
        .err()
        .map(|err| err.to_string())
        .unwrap_or_default();
        assert_eq!(calls, 3);
        assert!(err.contains("timeout exceeded"));
    }

    #[test]
    fn poll_until_stops_on_step_error() {
        let mut calls = 0;
        let result = poll_until::<()>("Test", FAST, |_| {
            calls += 1;
            Err(anyhow!("Failed"))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn helpers_normalize_payloads() {
        assert!(is_config_rejection(StatusCode::UNAUTHORIZED, &[401, 404]));
        assert!(!is_config_rejection(StatusCode::FORBIDDEN, &[401, 404]));
        assert_eq!(truncate_text("abcdef", 3), "abc…");
        assert_eq!(base64_to_data_uri("data:image/jpeg;base64,AA=="), "data:image/jpeg;base64,AA==");
        assert!(base64_to_data_uri("iVBORw0KGgo=").starts_with("data:image/png;base64,"));
    }
}
