//! Deterministic artifact locations: `<stage dir>/<item id><suffix>`.

use std::collections::HashMap;
use std::path::PathBuf;

use xaio_shared::{AppConfig, ItemId, Result, XaioError};

/// Output directory and file suffix of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageLocation {
    pub dir: PathBuf,
    pub suffix: String,
}

impl StageLocation {
    pub fn path(&self, id: &ItemId) -> PathBuf {
        self.dir.join(format!("{id}{}", self.suffix))
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    locations: HashMap<String, StageLocation>,
}

impl ArtifactLayout {
    pub fn from_config(config: &AppConfig) -> Self {
        let paths = &config.paths;
        let mut locations: HashMap<String, StageLocation> = [
            ("meta", &paths.meta_dir, ".meta_parsed.json"),
            ("claims", &paths.claims_dir, ".claims_parsed.json"),
            ("merge", &paths.merge_dir, ".xaio_parsed.json"),
            ("buffers", &paths.buffers_dir, ".buffers.json"),
            ("publish", &paths.publish_dir, ".publish_receipt.json"),
        ]
        .into_iter()
        .map(|(name, dir, suffix)| {
            (
                name.to_string(),
                StageLocation {
                    dir: dir.clone(),
                    suffix: suffix.to_string(),
                },
            )
        })
        .collect();

        for ext in &config.external_stages {
            locations.insert(
                ext.name.clone(),
                StageLocation {
                    dir: ext.output_dir.clone(),
                    suffix: ext.output_suffix.clone(),
                },
            );
        }
        Self { locations }
    }

    pub fn location(&self, stage: &str) -> Result<&StageLocation> {
        self.locations
            .get(stage)
            .ok_or_else(|| XaioError::config(format!("no output location for stage `{stage}`")))
    }

    /// Artifact path for `stage` and `id`, if the stage is known.
    pub fn artifact(&self, stage: &str, id: &ItemId) -> Option<PathBuf> {
        self.locations.get(stage).map(|loc| loc.path(id))
    }

    /// Where a refused model response for `stage` is preserved.
    pub fn raw_response(&self, stage: &str, id: &ItemId) -> PathBuf {
        let dir = self
            .locations
            .get(stage)
            .map(|loc| loc.dir.clone())
            .unwrap_or_else(|| PathBuf::from("."));
        dir.join(format!("{id}.{stage}_response_raw.json"))
    }
}
