use super::types::{ModelCatalogue, ModelDefinition};
use crate::error::Result;
use std::path::Path;

/// Parse a models.yaml file into a list of model definitions.
pub fn parse_models(path: &Path) -> Result<Vec<ModelDefinition>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| crate::error::StrataError::Schema(format!("{}: {e}", path.display())))?;
    parse_models_str(&content)
}

/// Parse a YAML model catalogue string into a list of model definitions.
/// Computes, constraints and function defaults are referenced by name and
/// resolved against the registry's callable tables at registration time.
pub fn parse_models_str(content: &str) -> Result<Vec<ModelDefinition>> {
    let de = serde_yaml::Deserializer::from_str(content);
    let catalogue: ModelCatalogue = serde_yaml::with::singleton_map_recursive::deserialize(de)?;
    Ok(catalogue.models)
}
