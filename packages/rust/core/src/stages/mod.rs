//! Concrete pipeline stages and the factory that wires them from config.

mod buffers;
mod claims;
mod external;
mod merge;
mod meta;
mod publish;

use std::path::PathBuf;
use std::sync::Arc;

use xaio_shared::{AppConfig, ItemId, Result, StageFields, WorkItem, XaioError};

use crate::layout::{ArtifactLayout, StageLocation};
use crate::llm::ModelClient;
use crate::retry::RetryPolicy;
use crate::stage::Stage;

pub use buffers::{BuffersStage, PANELS};
pub use claims::ClaimsStage;
pub use external::ExternalStage;
pub use merge::MergeStage;
pub use meta::MetaStage;
pub use publish::{PublishStage, derive_topics};

/// Built-in stages that call the generative service.
const MODEL_STAGES: [&str; 3] = ["meta", "claims", "buffers"];

/// Whether running `stage` needs a generative service client.
pub fn requires_model(stage: &str) -> bool {
    MODEL_STAGES.contains(&stage)
}

/// Long-lived collaborators shared by every stage of a run.
#[derive(Clone, Default)]
pub struct StageServices {
    pub model: Option<Arc<dyn ModelClient>>,
}

impl StageServices {
    fn model_for(&self, stage: &str) -> Result<Arc<dyn ModelClient>> {
        self.model.clone().ok_or_else(|| {
            XaioError::config(format!("stage `{stage}` needs a generative service client"))
        })
    }
}

/// Identity shared by every concrete stage: its name, queue fields and
/// output location.
#[derive(Debug, Clone)]
pub(crate) struct StageIdentity {
    pub name: String,
    pub fields: StageFields,
    pub location: StageLocation,
}

impl StageIdentity {
    fn new(name: &str, layout: &ArtifactLayout) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            fields: StageFields::for_stage(name),
            location: layout.location(name)?.clone(),
        })
    }

    pub fn output_path(&self, item: &WorkItem) -> PathBuf {
        self.location.path(&item.id)
    }
}

/// Path of the artifact `stage` wrote for `id`.
pub(crate) fn upstream_path(layout: &ArtifactLayout, stage: &str, id: &ItemId) -> Result<PathBuf> {
    Ok(layout.location(stage)?.path(id))
}

/// Instantiate `names` in order. Unknown names are a configuration error.
pub fn build_stages(
    config: &AppConfig,
    names: &[String],
    services: &StageServices,
) -> Result<Vec<Box<dyn Stage>>> {
    let layout = ArtifactLayout::from_config(config);
    let remote = RetryPolicy::from(&config.retry.remote);

    names
        .iter()
        .map(|name| -> Result<Box<dyn Stage>> {
            let identity = StageIdentity::new(name, &layout)?;
            let stage: Box<dyn Stage> = match name.as_str() {
                "meta" => Box::new(MetaStage::new(
                    identity,
                    config.stages.meta.clone(),
                    services.model_for(name)?,
                    remote.clone(),
                    layout.clone(),
                )),
                "claims" => Box::new(ClaimsStage::new(
                    identity,
                    config.stages.claims.clone(),
                    services.model_for(name)?,
                    remote.clone(),
                    layout.clone(),
                )),
                "merge" => Box::new(MergeStage::new(identity, layout.clone())),
                "buffers" => Box::new(BuffersStage::new(
                    identity,
                    config.stages.buffers.clone(),
                    services.model_for(name)?,
                    remote.clone(),
                    layout.clone(),
                )),
                "publish" => Box::new(PublishStage::from_config(
                    identity,
                    &config.publish,
                    remote.clone(),
                    layout.clone(),
                )?),
                other => {
                    let ext = config.external_stage(other).ok_or_else(|| {
                        XaioError::config(format!("unknown stage `{other}`"))
                    })?;
                    Box::new(ExternalStage::new(identity, ext.clone(), layout.clone()))
                }
            };
            Ok(stage)
        })
        .collect()
}
