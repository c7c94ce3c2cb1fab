mod registry;
mod selectors;

pub use registry::{Ability, ModelCatalog, ModelSpec};
pub use selectors::{choose_ability, reference_limit};
