use anyhow::{bail, Context, Result};
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Value};
use typix_contracts::models::{choose_ability, Ability, ModelCatalog, ModelSpec};
use typix_contracts::providers::{
    find_model, GenerateRequest, GenerateResponse, ImageProvider, RawSettings, SettingItem,
    SettingType, SettingsSchema,
};

use super::{
    base64_to_data_uri, download_data_uri, http_client, is_config_rejection,
    response_json_or_error,
};
use crate::config::api_base_from_env;
use crate::data_uri;

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-image-1";

pub struct OpenAiProvider {
    default_base: String,
    http: HttpClient,
    models: ModelCatalog,
}

impl Default for OpenAiProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenAiProvider {
    pub fn new() -> Self {
        Self {
            default_base: api_base_from_env("OPENAI_API_BASE", DEFAULT_API_BASE),
            http: http_client(),
            models: ModelCatalog::new(vec![
                ModelSpec::i2i(DEFAULT_MODEL, "GPT Image 1").with_max_input_images(3)
            ]),
        }
    }

    fn generate_images(
        &self,
        base: &str,
        api_key: &str,
        model: &str,
        request: &GenerateRequest,
    ) -> Result<HttpResponse> {
        let endpoint = format!("{base}/images/generations");
        self.http
            .post(&endpoint)
            .bearer_auth(api_key)
            .json(&json!({
                "model": model,
                "prompt": request.prompt,
                "n": request.n.max(1),
            }))
            .send()
            .with_context(|| format!("OpenAI request failed ({endpoint})"))
    }

    fn edit_images(
        &self,
        base: &str,
        api_key: &str,
        model: &str,
        request: &GenerateRequest,
    ) -> Result<HttpResponse> {
        let endpoint = format!("{base}/images/edits");
        let mut form = MultipartForm::new()
            .text("model", model.to_string())
            .text("prompt", request.prompt.clone())
            .text("n", request.n.max(1).to_string());
        for (idx, image) in request.images.iter().enumerate() {
            let decoded = data_uri::decode(image)
                .with_context(|| format!("OpenAI edit input {idx} is not a valid image"))?;
            let file_name = format!("image-{idx}.{}", decoded.extension());
            let part = MultipartPart::bytes(decoded.bytes)
                .file_name(file_name)
                .mime_str(&decoded.mime_type)
                .with_context(|| format!("invalid mime '{}' for edit input", decoded.mime_type))?;
            form = form.part("image[]", part);
        }
        self.http
            .post(&endpoint)
            .bearer_auth(api_key)
            .multipart(form)
            .send()
            .with_context(|| format!("OpenAI request failed ({endpoint})"))
    }

    fn collect_images(&self, payload: &Value) -> Vec<String> {
        let Some(rows) = payload.get("data").and_then(Value::as_array) else {
            return Vec::new();
        };
        rows.iter()
            .filter_map(|row| {
                if let Some(b64) = row.get("b64_json").and_then(Value::as_str) {
                    return Some(base64_to_data_uri(b64));
                }
                let url = row.get("url").and_then(Value::as_str)?;
                download_data_uri(&self.http, "OpenAI", url).ok()
            })
            .collect()
    }
}

impl ImageProvider for OpenAiProvider {
    fn id(&self) -> &str {
        "openai"
    }

    fn name(&self) -> &str {
        "OpenAI"
    }

    fn supports_cors(&self) -> bool {
        true
    }

    fn settings(&self) -> SettingsSchema {
        SettingsSchema::Standard(vec![
            SettingItem::required("apiKey", SettingType::Password),
            SettingItem::optional("baseURL", SettingType::Url)
                .with_default(json!(self.default_base)),
            SettingItem::optional("model", SettingType::String).with_default(json!(DEFAULT_MODEL)),
        ])
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
        let base = parsed.str("baseURL").unwrap_or(self.default_base.as_str());
        let model = find_model(self, &request.model_id)?;
        // `model` names the upstream model, so OpenAI-compatible gateways can alias it.
        let wire_model = parsed.str("model").unwrap_or(model.id.as_str());

        let response = match choose_ability(request, model.ability) {
            Ability::T2i => self.generate_images(base, api_key, wire_model, request)?,
            Ability::I2i => self.edit_images(base, api_key, wire_model, request)?,
        };
        if is_config_rejection(response.status(), &[401, 404]) {
            return Ok(GenerateResponse::config_error());
        }
        let payload = response_json_or_error("OpenAI", response)?;
        if payload.get("data").and_then(Value::as_array).is_none() {
            bail!("OpenAI response missing data array");
        }
        Ok(GenerateResponse::images(self.collect_images(&payload)))
    }
}
