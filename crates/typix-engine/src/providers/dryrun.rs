use std::io::Cursor;

use anyhow::{Context, Result};
use image::{ImageFormat, Rgb, RgbImage};
use serde_json::json;
use sha2::{Digest, Sha256};
use typix_contracts::models::{ModelCatalog, ModelSpec};
use typix_contracts::providers::{
    GenerateRequest, GenerateResponse, ImageProvider, RawSettings, SettingItem, SettingType,
    SettingsSchema,
};

use crate::data_uri;

const DEFAULT_SIZE: u32 = 64;
const MAX_SIZE: u32 = 1024;

/// Offline provider producing deterministic solid-colour PNGs. The colour is derived from
/// the prompt and the input images, so chained edits visibly change.
#[derive(Debug, Clone)]
pub struct DryrunProvider {
    models: ModelCatalog,
}

impl Default for DryrunProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl DryrunProvider {
    pub fn new() -> Self {
        Self {
            models: ModelCatalog::new(vec![
                ModelSpec::t2i("dryrun-t2i", "Dryrun Text to Image"),
                ModelSpec::i2i("dryrun-i2i", "Dryrun Image Edit").with_max_input_images(2),
            ]),
        }
    }
}

impl ImageProvider for DryrunProvider {
    fn id(&self) -> &str {
        "dryrun"
    }

    fn name(&self) -> &str {
        "Dryrun"
    }

    fn enabled_by_default(&self) -> bool {
        false
    }

    fn settings(&self) -> SettingsSchema {
        SettingsSchema::Standard(vec![
            SettingItem::optional("size", SettingType::Number).with_default(json!(DEFAULT_SIZE))
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
        let size = parsed
            .f64("size")
            .map(|value| value.clamp(1.0, MAX_SIZE as f64) as u32)
            .unwrap_or(DEFAULT_SIZE);
        let mut images = Vec::new();
        for idx in 0..request.n.max(1) {
            let color = color_for(request, idx);
            images.push(solid_png(size, color)?);
        }
        Ok(GenerateResponse::images(images))
    }
}

fn color_for(request: &GenerateRequest, idx: u32) -> Rgb<u8> {
    let mut hasher = Sha256::new();
    hasher.update(request.prompt.as_bytes());
    for image in &request.images {
        hasher.update(image.as_bytes());
    }
    hasher.update(idx.to_be_bytes());
    let digest = hasher.finalize();
    Rgb([digest[0], digest[1], digest[2]])
}

fn solid_png(size: u32, color: Rgb<u8>) -> Result<String> {
    let mut image = RgbImage::new(size, size);
    for pixel in image.pixels_mut() {
        *pixel = color;
    }
    let mut bytes = Cursor::new(Vec::new());
    image
        .write_to(&mut bytes, ImageFormat::Png)
        .context("failed to encode dryrun image")?;
    Ok(data_uri::encode(bytes.get_ref(), "image/png"))
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use typix_contracts::error::ConfigInvalid;
    use typix_contracts::providers::{GenerateRequest, ImageProvider, RawSettings};

    use super::DryrunProvider;
    use crate::data_uri;

    #[test]
    fn generates_decodable_pngs_per_requested_count() -> anyhow::Result<()> {
        let provider = DryrunProvider::new();
        let mut request = GenerateRequest::new("dryrun", "dryrun-t2i", "a red fox");
        request.n = 2;
        let response = provider.generate(&request, &RawSettings::new())?;
        assert_eq!(response.images.len(), 2);
        assert!(response.error_reason.is_none());
        let decoded = data_uri::decode(&response.images[0])?;
        assert_eq!(decoded.mime_type, "image/png");
        assert_eq!(data_uri::sniff_mime(&decoded.bytes), Some("image/png"));
        Ok(())
    }

    #[test]
    fn output_is_deterministic_and_input_sensitive() -> anyhow::Result<()> {
        let provider = DryrunProvider::new();
        let request = GenerateRequest::new("dryrun", "dryrun-i2i", "a red fox");
        let first = provider.generate(&request, &RawSettings::new())?;
        let again = provider.generate(&request, &RawSettings::new())?;
        assert_eq!(first.images, again.images);

        let edited = provider.generate(
            &request.clone().with_images(first.images.clone()),
            &RawSettings::new(),
        )?;
        assert_ne!(edited.images, first.images);
        Ok(())
    }

    #[test]
    fn invalid_size_is_a_settings_error() {
        let provider = DryrunProvider::new();
        let settings = json!({"size": "huge"}).as_object().cloned().unwrap_or_default();
        let err = provider
            .generate(&GenerateRequest::new("dryrun", "dryrun-t2i", "x"), &settings)
            .err();
        assert!(err
            .as_ref()
            .and_then(|err| err.downcast_ref::<ConfigInvalid>())
            .is_some());
    }
}
