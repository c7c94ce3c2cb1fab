use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::ACCEPT;
use reqwest::Url;
use serde_json::{json, Map, Value};
use typix_contracts::models::{choose_ability, Ability, ModelCatalog, ModelSpec};
use typix_contracts::providers::{
    find_model, GenerateRequest, GenerateResponse, ImageProvider, RawSettings, SettingItem,
    SettingType, SettingsSchema,
};

use super::{
    download_data_uri, http_client, is_config_rejection, map_object, poll_until,
    response_json_or_error, PollPolicy, PollState,
};
use crate::config::api_base_from_env;

const DEFAULT_API_BASE: &str = "https://api.bfl.ai/v1";

pub const FLUX_POLL_POLICY: PollPolicy = PollPolicy {
    interval: Duration::from_millis(500),
    max_attempts: 120,
};

/// Black Forest Labs API: submit a job, then poll its `polling_url` until ready.
pub struct FluxProvider {
    api_base: String,
    http: HttpClient,
    poll: PollPolicy,
    models: ModelCatalog,
}

impl Default for FluxProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl FluxProvider {
    pub fn new() -> Self {
        Self {
            api_base: api_base_from_env("FLUX_API_BASE", DEFAULT_API_BASE),
            http: http_client(),
            poll: FLUX_POLL_POLICY,
            models: ModelCatalog::new(vec![
                ModelSpec::i2i("flux-kontext-max", "FLUX.1 Kontext [max]"),
                ModelSpec::i2i("flux-kontext-pro", "FLUX.1 Kontext [pro]"),
                ModelSpec::t2i("flux-pro-1.1-ultra", "FLUX1.1 [pro] Ultra"),
                ModelSpec::t2i("flux-pro-1.1", "FLUX1.1 [pro]"),
                ModelSpec::t2i("flux-pro", "FLUX.1 [pro]"),
                ModelSpec::t2i("flux-dev", "FLUX.1 [dev]"),
            ]),
        }
    }

    fn poll_sample(&self, polling_url: &Url, api_key: &str) -> Result<PollState<String>> {
        let response = self
            .http
            .get(polling_url.clone())
            .header(ACCEPT, "application/json")
            .header("x-key", api_key)
            .send()
            .with_context(|| format!("Flux poll request failed ({polling_url})"))?;
        let payload = response_json_or_error("Flux poll", response)?;
        poll_state(&payload)
    }
}

fn build_payload(request: &GenerateRequest, ability: Ability) -> Map<String, Value> {
    let mut payload = map_object(json!({ "prompt": request.prompt }));
    if ability == Ability::I2i {
        if let Some(first) = request.images.first() {
            payload.insert("image_url".to_string(), Value::String(first.clone()));
        }
    }
    payload
}

fn polling_url(submitted: &Value) -> Result<Url> {
    let raw = submitted
        .get("polling_url")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| anyhow!("Flux response missing polling_url"))?;
    let mut url = Url::parse(raw).with_context(|| format!("Flux polling_url is invalid ({raw})"))?;
    if let Some(id) = submitted.get("id").and_then(Value::as_str) {
        let kept = url
            .query_pairs()
            .filter(|(key, _)| key != "id")
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect::<Vec<(String, String)>>();
        url.query_pairs_mut()
            .clear()
            .extend_pairs(kept)
            .append_pair("id", id);
    }
    Ok(url)
}

fn poll_state(payload: &Value) -> Result<PollState<String>> {
    let status = payload
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or_default();
    match status {
        "Ready" => {
            let sample = payload
                .get("result")
                .and_then(|result| result.get("sample"))
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty());
            Ok(match sample {
                Some(url) => PollState::Ready(url.to_string()),
                None => PollState::Pending,
            })
        }
        "Error" | "Failed" => bail!(
            "Flux generation failed: {}",
            payload
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error")
        ),
        _ => Ok(PollState::Pending),
    }
}

impl ImageProvider for FluxProvider {
    fn id(&self) -> &str {
        "flux"
    }

    fn name(&self) -> &str {
        "Flux"
    }

    fn settings(&self) -> SettingsSchema {
        SettingsSchema::Standard(vec![SettingItem::required("apiKey", SettingType::Password)])
    }

    fn models(&self) -> &ModelCatalog {
        &self.models
    }

    fn generate(
        &self,
        request: &GenerateRequest,
        settings: &RawSettings,
    ) -> Result<GenerateResponse> {
        let parsed = self.parse_settings(settings)?;
        let api_key = parsed.require_str("apiKey")?;
        let model = find_model(self, &request.model_id)?;
        let payload = build_payload(request, choose_ability(request, model.ability));

        let endpoint = format!("{}/{}", self.api_base, model.id);
        let response = self
            .http
            .post(&endpoint)
            .header(ACCEPT, "application/json")
            .header("x-key", api_key)
            .json(&Value::Object(payload))
            .send()
            .with_context(|| format!("Flux request failed ({endpoint})"))?;
        if is_config_rejection(response.status(), &[401, 403]) {
            return Ok(GenerateResponse::config_error());
        }
        let submitted = response_json_or_error("Flux", response)?;
        let polling_url = polling_url(&submitted)?;

        let sample = poll_until("Flux", self.poll, |_| self.poll_sample(&polling_url, api_key))?;
        let image = download_data_uri(&self.http, "Flux", &sample)
            .context("Flux result image could not be fetched")?;
        Ok(GenerateResponse::images(vec![image]))
    }
}
