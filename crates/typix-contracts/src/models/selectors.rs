use super::registry::{Ability, ModelSpec};
use crate::providers::GenerateRequest;

/// Picks the code path a provider should take for `request`.
///
/// `i2i` is chosen only when the model can take images and at least one image was resolved;
/// everything else routes through text-to-image.
pub fn choose_ability(request: &GenerateRequest, model_ability: Ability) -> Ability {
    if model_ability == Ability::I2i && !request.images.is_empty() {
        return Ability::I2i;
    }
    Ability::T2i
}

/// How many prior results may be chained into a request for `model`.
pub fn reference_limit(model: &ModelSpec) -> usize {
    model.max_input_images.unwrap_or(1).max(1) as usize
}

#[cfg(test)]
mod tests {
    use super::{choose_ability, reference_limit};
    use crate::models::{Ability, ModelSpec};
    use crate::providers::GenerateRequest;

    fn request(images: Vec<String>) -> GenerateRequest {
        GenerateRequest {
            provider_id: "fal".to_string(),
            model_id: "fal-ai/flux-pro/kontext".to_string(),
            prompt: "make it blue".to_string(),
            images,
            n: 1,
        }
    }

    #[test]
    fn i2i_model_without_images_routes_t2i() {
        assert_eq!(choose_ability(&request(Vec::new()), Ability::I2i), Ability::T2i);
    }

    #[test]
    fn i2i_model_with_images_routes_i2i() {
        let req = request(vec!["data:image/png;base64,AAAA".to_string()]);
        assert_eq!(choose_ability(&req, Ability::I2i), Ability::I2i);
    }

    #[test]
    fn t2i_model_ignores_images() {
        let req = request(vec!["data:image/png;base64,AAAA".to_string()]);
        assert_eq!(choose_ability(&req, Ability::T2i), Ability::T2i);
    }

    #[test]
    fn reference_limit_defaults_to_one() {
        assert_eq!(reference_limit(&ModelSpec::i2i("m", "M")), 1);
        assert_eq!(
            reference_limit(&ModelSpec::i2i("m", "M").with_max_input_images(3)),
            3
        );
        assert_eq!(
            reference_limit(&ModelSpec::i2i("m", "M").with_max_input_images(0)),
            1
        );
    }
}
