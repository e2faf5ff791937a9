//! Playbook Parser
//!
//! Loads playbook definitions from JSON or YAML files. The format is chosen
//! by file extension.

use std::error::Error;
use std::fs;
use std::path::Path;

use log::{debug, info};

use super::model::Playbook;
use super::validator::check_playbook;

/// Supported playbook document formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybookFormat {
    Json,
    Yaml,
}

impl PlaybookFormat {
    /// Picks a format from a file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let extension = path.extension()?.to_str()?.to_ascii_lowercase();
        match extension.as_str() {
            "json" => Some(Self::Json),
            "yaml" | "yml" => Some(Self::Yaml),
            _ => None,
        }
    }
}

/// Parses a playbook document and fills step IDs from the workflow keys.
pub fn parse_playbook(content: &str, format: PlaybookFormat) -> Result<Playbook, Box<dyn Error>> {
    let mut playbook: Playbook = match format {
        PlaybookFormat::Json => serde_json::from_str(content)
            .map_err(|e| format!("Failed to parse playbook JSON: {}", e))?,
        PlaybookFormat::Yaml => serde_yaml::from_str(content)
            .map_err(|e| format!("Failed to parse playbook YAML: {}", e))?,
    };

    playbook.normalize_ids();
    Ok(playbook)
}

/// Loads a playbook from a JSON or YAML file.
///
/// Step references are checked after parsing. Capability coverage is
/// checked later, when the playbook is triggered against a registry.
///
/// # Example
///
/// ```rust,no_run
/// use soarflow::playbook::load_playbook;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let playbook = load_playbook("block-ip.json")?;
///     println!("Loaded {} steps", playbook.len());
///     Ok(())
/// }
/// ```
pub fn load_playbook(path: impl AsRef<Path>) -> Result<Playbook, Box<dyn Error>> {
    let path = path.as_ref();
    info!("Loading playbook from: {}", path.display());

    let format = PlaybookFormat::from_path(path).ok_or_else(|| {
        format!(
            "Unsupported playbook file '{}'. Use a .json, .yaml or .yml file.",
            path.display()
        )
    })?;

    let content = fs::read_to_string(path).map_err(|e| {
        format!(
            "Failed to read playbook file '{}': {}. Check that the file exists and is readable.",
            path.display(),
            e
        )
    })?;
    debug!("Playbook content loaded ({} bytes)", content.len());

    let playbook = parse_playbook(&content, format)?;

    if let Some(problem) = check_playbook(&playbook, None).into_iter().next() {
        return Err(format!("Invalid playbook '{}': {}", playbook.id, problem).into());
    }

    info!(
        "Loaded playbook '{}' with {} steps",
        playbook.id,
        playbook.len()
    );
    Ok(playbook)
}
