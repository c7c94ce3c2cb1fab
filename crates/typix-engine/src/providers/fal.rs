use anyhow::{bail, Context, Result};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::AUTHORIZATION;
use serde_json::{json, Map, Value};
use typix_contracts::models::{choose_ability, Ability, ModelCatalog, ModelSpec};
use typix_contracts::providers::{
    find_model, GenerateRequest, GenerateResponse, ImageProvider, RawSettings, SettingItem,
    SettingType, SettingsSchema,
};

use super::{
    download_data_uri, http_client, is_config_rejection, map_object, response_json_or_error,
    truncate_text,
};
use crate::config::api_base_from_env;

const DEFAULT_API_BASE: &str = "https://fal.run";
const QWEN_IMAGE: &str = "fal-ai/qwen-image";

pub struct FalProvider {
    api_base: String,
    http: HttpClient,
    models: ModelCatalog,
}

impl Default for FalProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl FalProvider {
    pub fn new() -> Self {
        Self {
            api_base: api_base_from_env("FAL_API_BASE", DEFAULT_API_BASE),
            http: http_client(),
            models: ModelCatalog::new(vec![
                ModelSpec::i2i("fal-ai/flux-pro/kontext/max", "FLUX.1 Kontext [max]"),
                ModelSpec::i2i("fal-ai/flux-pro/kontext", "FLUX.1 Kontext [pro]"),
                ModelSpec::i2i(QWEN_IMAGE, "Qwen Image"),
            ]),
        }
    }

    fn extract_urls(value: &Value, out: &mut Vec<String>) {
        let Some(images) = value.get("images").and_then(Value::as_array) else {
            return;
        };
        for image in images {
            let Some(url) = image.get("url").and_then(Value::as_str).map(str::trim) else {
                continue;
            };
            if !url.is_empty() && !out.iter().any(|existing| existing == url) {
                out.push(url.to_string());
            }
        }
    }
}

/// Route suffix appended to the model id. Kontext models have a dedicated text-to-image
/// route and a `/multi` route for several inputs; Qwen switches to `-edit` for image input.
fn endpoint_suffix(model: &ModelSpec, ability: Ability, image_count: usize) -> &'static str {
    if model.id == QWEN_IMAGE {
        return match ability {
            Ability::I2i => "-edit",
            Ability::T2i => "",
        };
    }
    match ability {
        Ability::T2i => "/text-to-image",
        Ability::I2i => {
            if image_count > 1 && model.max_input_images.unwrap_or(1) > 1 {
                "/multi"
            } else {
                ""
            }
        }
    }
}

fn build_input(request: &GenerateRequest, ability: Ability) -> Map<String, Value> {
    let mut input = map_object(json!({ "prompt": request.prompt }));
    if ability == Ability::I2i {
        if let [single] = request.images.as_slice() {
            input.insert("image_url".to_string(), Value::String(single.clone()));
        } else {
            input.insert("image_urls".to_string(), json!(request.images));
        }
    }
    input
}

impl ImageProvider for FalProvider {
    fn id(&self) -> &str {
        "fal"
    }

    fn name(&self) -> &str {
        "Fal"
    }

    fn supports_cors(&self) -> bool {
        true
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
        let ability = choose_ability(request, model.ability);
        let endpoint = format!(
            "{}/{}{}",
            self.api_base,
            model.id,
            endpoint_suffix(model, ability, request.images.len())
        );
        let input = build_input(request, ability);

        let response = self
            .http
            .post(&endpoint)
            .header(AUTHORIZATION, format!("Key {api_key}"))
            .json(&Value::Object(input))
            .send()
            .with_context(|| format!("Fal request failed ({endpoint})"))?;
        if is_config_rejection(response.status(), &[401, 404]) {
            return Ok(GenerateResponse::config_error());
        }
        let payload = response_json_or_error("Fal", response)?;

        let mut urls = Vec::new();
        Self::extract_urls(&payload, &mut urls);
        if urls.is_empty() {
            bail!(
                "Fal response returned no image URLs: {}",
                truncate_text(&payload.to_string(), 256)
            );
        }
        // A failed download drops that image; the rest are still returned.
        let images = urls
            .iter()
            .filter_map(|url| download_data_uri(&self.http, "Fal", url).ok())
            .collect();
        Ok(GenerateResponse::images(images))
    }
}
