//! Definition serialization and file IO.
//!
//! Committed definitions are durable data and round-trip through YAML, so
//! graphs can be stored alongside the code that registers their handlers.
//! Parsing re-runs the structural validation pass, so a hand-edited file gets
//! the same guarantees as a freshly committed builder graph.

use std::path::Path;

use strand_types::definition::Definition;
use tracing::debug;

use crate::builder::BuildError;
use crate::plan;

/// Parse a definition from YAML and validate its structure.
pub fn parse_yaml(yaml: &str) -> Result<Definition, BuildError> {
    let definition: Definition =
        serde_yaml_ng::from_str(yaml).map_err(|e| BuildError::Parse(e.to_string()))?;
    validate(&definition)?;
    Ok(definition)
}

/// Serialize a definition to YAML.
pub fn to_yaml(definition: &Definition) -> Result<String, BuildError> {
    serde_yaml_ng::to_string(definition).map_err(|e| BuildError::Parse(e.to_string()))
}

/// Load and validate a definition from a YAML file.
pub async fn load_file(path: impl AsRef<Path>) -> Result<Definition, BuildError> {
    let path = path.as_ref();
    let yaml = tokio::fs::read_to_string(path).await?;
    let definition = parse_yaml(&yaml)?;
    debug!(name = %definition.name, path = %path.display(), "definition loaded");
    Ok(definition)
}

/// Write a definition to a YAML file.
pub async fn save_file(
    definition: &Definition,
    path: impl AsRef<Path>,
) -> Result<(), BuildError> {
    let yaml = to_yaml(definition)?;
    tokio::fs::write(path.as_ref(), yaml).await?;
    Ok(())
}

fn validate(definition: &Definition) -> Result<(), BuildError> {
    if definition.name.is_empty() {
        return Err(BuildError::Validation(
            "definition name must not be empty".to_string(),
        ));
    }
    let plan = plan::lower(&definition.root);
    plan::validate(&plan)
}
