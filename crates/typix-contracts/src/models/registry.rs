use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Generation mode a model supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ability {
    /// Text-to-image only.
    T2i,
    /// Accepts input images for editing; text-only requests still work.
    I2i,
}

impl Ability {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::T2i => "t2i",
            Self::I2i => "i2i",
        }
    }

    pub fn accepts_images(self) -> bool {
        self != Self::T2i
    }
}

impl fmt::Display for Ability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub id: String,
    pub name: String,
    pub ability: Ability,
    pub max_input_images: Option<u32>,
    pub enabled_by_default: bool,
}

impl ModelSpec {
    pub fn t2i(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            ability: Ability::T2i,
            max_input_images: None,
            enabled_by_default: true,
        }
    }

    pub fn i2i(id: &str, name: &str) -> Self {
        Self {
            ability: Ability::I2i,
            ..Self::t2i(id, name)
        }
    }

    pub fn with_max_input_images(mut self, max: u32) -> Self {
        self.max_input_images = Some(max);
        self
    }
}

/// Static, ordered model catalog of one provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelCatalog {
    models: IndexMap<String, ModelSpec>,
}

impl ModelCatalog {
    pub fn new(models: Vec<ModelSpec>) -> Self {
        Self {
            models: models
                .into_iter()
                .map(|model| (model.id.clone(), model))
                .collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&ModelSpec> {
        self.models.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.models.contains_key(id)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn by_ability(&self, ability: Ability) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.ability == ability)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
