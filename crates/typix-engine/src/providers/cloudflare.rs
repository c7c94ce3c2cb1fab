use anyhow::{bail, Context, Result};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Value};
use typix_contracts::models::{ModelCatalog, ModelSpec};
use typix_contracts::providers::{
    GenerateRequest, GenerateResponse, ImageProvider, RawSettings, SettingItem, SettingType,
    SettingsSchema,
};

use super::{base64_to_data_uri, http_client, is_config_rejection, truncate_text};
use crate::config::{api_base_from_env, CloudflareCredentials};
use crate::data_uri;

const DEFAULT_API_BASE: &str = "https://api.cloudflare.com/client/v4";

/// Workers AI text-to-image models. With host credentials configured the provider exposes the
/// built-in settings variant and users need not supply an account or token.
pub struct CloudflareProvider {
    api_base: String,
    http: HttpClient,
    builtin: Option<CloudflareCredentials>,
    models: ModelCatalog,
}

impl CloudflareProvider {
    pub fn new(builtin: Option<CloudflareCredentials>) -> Self {
        Self {
            api_base: api_base_from_env("CLOUDFLARE_API_BASE", DEFAULT_API_BASE),
            http: http_client(),
            builtin,
            models: ModelCatalog::new(vec![
                ModelSpec::t2i("@cf/black-forest-labs/flux-1-schnell", "FLUX.1-schnell"),
                ModelSpec::t2i("@cf/lykon/dreamshaper-8-lcm", "DreamShaper 8 LCM"),
                ModelSpec::t2i(
                    "@cf/bytedance/stable-diffusion-xl-lightning",
                    "Stable Diffusion XL Lightning",
                ),
                ModelSpec::t2i(
                    "@cf/stabilityai/stable-diffusion-xl-base-1.0",
                    "Stable Diffusion XL Base 1.0",
                ),
            ]),
        }
    }

    fn endpoint(&self, account_id: &str, model_id: &str) -> String {
        format!("{}/accounts/{account_id}/ai/run/{model_id}", self.api_base)
    }

    fn credentials(&self, settings: &RawSettings) -> Result<CloudflareCredentials> {
        let parsed = self.parse_settings(settings)?;
        if let Some(host) = self.builtin.as_ref() {
            if parsed.bool("builtin").unwrap_or(false) {
                return Ok(host.clone());
            }
        }
        Ok(CloudflareCredentials {
            account_id: parsed.require_str("accountId")?.to_string(),
            api_token: parsed.require_str("apiKey")?.to_string(),
        })
    }
}

impl ImageProvider for CloudflareProvider {
    fn id(&self) -> &str {
        "cloudflare"
    }

    fn name(&self) -> &str {
        "Cloudflare AI"
    }

    fn settings(&self) -> SettingsSchema {
        if self.builtin.is_some() {
            SettingsSchema::Builtin(vec![
                SettingItem::required("builtin", SettingType::Boolean).with_default(json!(true)),
                SettingItem::optional("accountId", SettingType::Password),
                SettingItem::optional("apiKey", SettingType::Password),
            ])
        } else {
            SettingsSchema::Standard(vec![
                SettingItem::required("accountId", SettingType::Password),
                SettingItem::required("apiKey", SettingType::Password),
            ])
        }
    }

    fn models(&self) -> &ModelCatalog {
        &self.models
    }

    fn generate(
        &self,
        request: &GenerateRequest,
        settings: &RawSettings,
    ) -> Result<GenerateResponse> {
        let credentials = self.credentials(settings)?;
        let endpoint = self.endpoint(&credentials.account_id, &request.model_id);
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&credentials.api_token)
            .json(&json!({ "prompt": request.prompt }))
            .send()
            .with_context(|| format!("Cloudflare request failed ({endpoint})"))?;

        let status = response.status();
        if is_config_rejection(status, &[401, 404]) {
            return Ok(GenerateResponse::config_error());
        }
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!(
                "Cloudflare API error ({}): {}",
                status.as_u16(),
                truncate_text(&body, 512)
            );
        }

        let is_png = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.contains("image/png"))
            .unwrap_or(false);
        if is_png {
            let bytes = response
                .bytes()
                .context("failed reading Cloudflare image bytes")?;
            return Ok(GenerateResponse::images(vec![data_uri::encode(
                &bytes,
                "image/png",
            )]));
        }

        let payload: Value = response
            .json()
            .context("Cloudflare returned invalid JSON payload")?;
        Ok(GenerateResponse::images(vec![image_from_payload(&payload)?]))
    }
}

fn image_from_payload(payload: &Value) -> Result<String> {
    let Some(image) = payload
        .get("result")
        .and_then(|result| result.get("image"))
        .and_then(Value::as_str)
        .filter(|value| !value.trim().is_empty())
    else {
        bail!(
            "Cloudflare response missing result.image: {}",
            truncate_text(&payload.to_string(), 256)
        );
    };
    Ok(base64_to_data_uri(image))
}
