pub mod settings;

use std::fmt;
use std::sync::Arc;

use anyhow::anyhow;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigInvalid, ErrorReason};
use crate::models::{ModelCatalog, ModelSpec};

pub use settings::{
    ParsedSettings, RawSettings, RuntimeCapabilities, SettingItem, SettingType, SettingsSchema,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub provider_id: String,
    pub model_id: String,
    pub prompt: String,
    /// Ordered input images as data URIs.
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default = "default_n")]
    pub n: u32,
}

impl GenerateRequest {
    pub fn new(provider_id: &str, model_id: &str, prompt: &str) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            model_id: model_id.to_string(),
            prompt: prompt.to_string(),
            images: Vec::new(),
            n: default_n(),
        }
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateResponse {
    /// Produced images as data URIs.
    pub images: Vec<String>,
    pub error_reason: Option<ErrorReason>,
}

impl GenerateResponse {
    pub fn images(images: Vec<String>) -> Self {
        Self {
            images,
            error_reason: None,
        }
    }

    /// The provider was reachable but rejected credentials or the model.
    pub fn config_error() -> Self {
        Self {
            images: Vec::new(),
            error_reason: Some(ErrorReason::ConfigError),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderDescriptor {
    pub id: String,
    pub name: String,
    pub supports_cors: bool,
    pub enabled_by_default: bool,
    pub settings: SettingsSchema,
    pub models: Vec<ModelSpec>,
}

/// Capability set every generation backend implements.
///
/// `generate` reports credential or model rejections as
/// [`GenerateResponse::config_error`]; every other failure is returned as an error.
pub trait ImageProvider: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;

    fn supports_cors(&self) -> bool {
        false
    }

    fn enabled_by_default(&self) -> bool {
        true
    }

    fn settings(&self) -> SettingsSchema;
    fn models(&self) -> &ModelCatalog;

    fn parse_settings(&self, raw: &RawSettings) -> Result<ParsedSettings, ConfigInvalid> {
        settings::parse_settings(self.id(), &self.settings(), raw)
    }

    fn generate(
        &self,
        request: &GenerateRequest,
        settings: &RawSettings,
    ) -> anyhow::Result<GenerateResponse>;

    fn descriptor(&self) -> ProviderDescriptor {
        ProviderDescriptor {
            id: self.id().to_string(),
            name: self.name().to_string(),
            supports_cors: self.supports_cors(),
            enabled_by_default: self.enabled_by_default(),
            settings: self.settings(),
            models: self.models().list().cloned().collect(),
        }
    }
}

pub fn find_model<'a>(provider: &'a dyn ImageProvider, model_id: &str) -> anyhow::Result<&'a ModelSpec> {
    provider
        .models()
        .get(model_id)
        .ok_or_else(|| anyhow!("model '{model_id}' not found for provider '{}'", provider.id()))
}

/// Fixed provider set, built once at startup.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: IndexMap<String, Arc<dyn ImageProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: ImageProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.id().to_string(), Arc::new(provider));
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ImageProvider>> {
        self.providers.get(id).cloned()
    }

    /// Lookup for identifiers that were validated before being persisted; a miss is a
    /// configuration error.
    pub fn expect(&self, id: &str) -> anyhow::Result<Arc<dyn ImageProvider>> {
        self.get(id).ok_or_else(|| {
            anyhow!(
                "provider '{id}' not registered (available: [{}])",
                self.list().join(", ")
            )
        })
    }

    pub fn find_model(&self, provider_id: &str, model_id: &str) -> anyhow::Result<ModelSpec> {
        let provider = self.expect(provider_id)?;
        let model = find_model(provider.as_ref(), model_id)?.clone();
        Ok(model)
    }

    pub fn contains_model(&self, provider_id: &str, model_id: &str) -> bool {
        self.providers
            .get(provider_id)
            .map(|provider| provider.models().contains(model_id))
            .unwrap_or(false)
    }

    pub fn list(&self) -> Vec<String> {
        let mut ids = self.providers.keys().cloned().collect::<Vec<String>>();
        ids.sort();
        ids
    }

    pub fn providers(&self) -> impl Iterator<Item = &Arc<dyn ImageProvider>> {
        self.providers.values()
    }

    pub fn descriptors(&self) -> Vec<ProviderDescriptor> {
        self.providers
            .values()
            .map(|provider| provider.descriptor())
            .collect()
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn default_n() -> u32 {
    1
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        GenerateRequest, GenerateResponse, ImageProvider, ProviderRegistry, RawSettings,
        SettingItem, SettingType, SettingsSchema,
    };
    use crate::error::ErrorReason;
    use crate::models::{ModelCatalog, ModelSpec};

    struct DummyProvider {
        id: String,
        models: ModelCatalog,
    }

    impl DummyProvider {
        fn new(id: &str) -> Self {
            Self {
                id: id.to_string(),
                models: ModelCatalog::new(vec![
                    ModelSpec::t2i("draw-1", "Draw 1"),
                    ModelSpec::i2i("edit-1", "Edit 1").with_max_input_images(2),
                ]),
            }
        }
    }

    impl ImageProvider for DummyProvider {
        fn id(&self) -> &str {
            self.id.as_str()
        }

        fn name(&self) -> &str {
            "Dummy"
        }

        fn settings(&self) -> SettingsSchema {
            SettingsSchema::Standard(vec![SettingItem::required("apiKey", SettingType::Password)])
        }

        fn models(&self) -> &ModelCatalog {
            &self.models
        }

        fn generate(
            &self,
            _request: &GenerateRequest,
            settings: &RawSettings,
        ) -> anyhow::Result<GenerateResponse> {
            let parsed = self.parse_settings(settings)?;
            if parsed.str("apiKey") == Some("revoked") {
                return Ok(GenerateResponse::config_error());
            }
            Ok(GenerateResponse::images(vec!["data:image/png;base64,AA==".to_string()]))
        }
    }

    #[test]
    fn registry_lists_sorted_but_keeps_registration_order() {
        let mut registry = ProviderRegistry::new();
        registry.register(DummyProvider::new("z"));
        registry.register(DummyProvider::new("a"));
        registry.register(DummyProvider::new("m"));
        assert_eq!(registry.list(), vec!["a", "m", "z"]);
        assert_eq!(
            registry
                .providers()
                .map(|provider| provider.id().to_string())
                .collect::<Vec<String>>(),
            vec!["z", "a", "m"]
        );
    }

    #[test]
    fn expect_fails_fast_for_unknown_provider() {
        let mut registry = ProviderRegistry::new();
        registry.register(DummyProvider::new("dummy"));
        let err = registry.expect("missing").err().map(|err| err.to_string());
        assert_eq!(
            err.as_deref(),
            Some("provider 'missing' not registered (available: [dummy])")
        );
    }

    #[test]
    fn find_model_checks_the_catalog() -> anyhow::Result<()> {
        let mut registry = ProviderRegistry::new();
        registry.register(DummyProvider::new("dummy"));
        assert_eq!(registry.find_model("dummy", "edit-1")?.max_input_images, Some(2));
        assert!(registry.find_model("dummy", "edit-9").is_err());
        assert!(registry.contains_model("dummy", "draw-1"));
        assert!(!registry.contains_model("other", "draw-1"));
        Ok(())
    }

    #[test]
    fn generate_reports_rejected_credentials_as_config_error() -> anyhow::Result<()> {
        let provider = DummyProvider::new("dummy");
        let request = GenerateRequest::new("dummy", "draw-1", "a cat");
        let settings = json!({"apiKey": "revoked"}).as_object().cloned().unwrap_or_default();
        let response = provider.generate(&request, &settings)?;
        assert_eq!(response.error_reason, Some(ErrorReason::ConfigError));
        assert!(response.images.is_empty());

        let missing = provider.generate(&request, &RawSettings::new());
        assert!(missing.is_err());
        Ok(())
    }

    #[test]
    fn descriptor_exposes_catalog_and_schema() {
        let descriptor = DummyProvider::new("dummy").descriptor();
        assert_eq!(descriptor.models.len(), 2);
        assert!(!descriptor.supports_cors);
        assert_eq!(descriptor.settings.items()[0].key, "apiKey");
    }
}
