//! Component registry.
//!
//! Maps models to source resolvers, `(data, output)` type pairs to decode
//! stages, and artifact types to encoders. Lookups walk the subtype chain
//! from the most specific type to `Any`, so a stage registered for `Any`
//! data is always tried after one registered for the exact data type.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

use super::artifact::{Artifact, ArtifactType, BoxedArtifact, Model};
use super::decode::{DecodePipeline, DecodeStage};
use super::error::StageError;
use super::fetch::DataFetcher;
use super::keys::{CacheKey, Options, TransformationId};
use super::store::CachedFile;
use super::strategy::EncodeStrategy;

/// Everything needed to attempt one fetch.
#[derive(Clone)]
pub struct FetchPlan {
    /// Primary identity of the data the fetcher will produce.
    pub source_key: CacheKey,
    /// Other keys the same data may already be cached under.
    pub alternate_keys: Vec<CacheKey>,
    pub fetcher: Arc<dyn DataFetcher>,
}

impl fmt::Debug for FetchPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchPlan")
            .field("source_key", &self.source_key)
            .field("alternate_keys", &self.alternate_keys)
            .field("data_type", &self.fetcher.data_type())
            .finish()
    }
}

/// Turns a model into fetch plans.
pub trait SourceResolver: Send + Sync {
    fn name(&self) -> &str;

    fn handles(&self, model: &Model) -> bool;

    /// `None` when this resolver cannot serve the model at these parameters.
    fn build_fetch(
        &self,
        model: &Model,
        width: i32,
        height: i32,
        options: &Options,
    ) -> Option<FetchPlan>;
}

/// Post-decode rewrite of an artifact, e.g. a resize.
pub trait Transformation: Send + Sync {
    fn id(&self) -> TransformationId;

    /// Identity transformations are left out of persistent artifact keys.
    fn is_identity(&self) -> bool {
        false
    }

    fn transform(
        &self,
        artifact: BoxedArtifact,
        width: i32,
        height: i32,
    ) -> Result<BoxedArtifact, StageError>;
}

/// Writes artifacts into the persistent artifact tier.
pub trait ArtifactEncoder: Send + Sync {
    fn encode_strategy(&self, options: &Options) -> EncodeStrategy;

    fn encode(&self, artifact: &dyn Artifact, out: &mut dyn Write) -> io::Result<()>;
}

/// What a request needs from the outside world.
pub trait ComponentRegistry: Send + Sync {
    fn resolvers_for(&self, model: &Model) -> Vec<Arc<dyn SourceResolver>>;

    /// Resolvers able to read an entry handed back by a persistent store.
    fn resolvers_for_cached_file(&self, file: &CachedFile) -> Vec<Arc<dyn SourceResolver>>;

    fn decode_pipeline_for(
        &self,
        data_type: ArtifactType,
        intermediate_type: ArtifactType,
        output_type: ArtifactType,
    ) -> Option<DecodePipeline>;

    /// Artifact types any registered stage may produce for this pair,
    /// whatever the fetched data type.
    fn decoded_types(
        &self,
        _intermediate_type: ArtifactType,
        output_type: ArtifactType,
    ) -> Vec<ArtifactType> {
        vec![output_type]
    }

    fn artifact_encoder(&self, artifact: &dyn Artifact) -> Option<Arc<dyn ArtifactEncoder>>;

    fn has_artifact_encoder(&self, artifact: &dyn Artifact) -> bool {
        self.artifact_encoder(artifact).is_some()
    }
}

/// Default in-process registry.
#[derive(Default)]
pub struct Registry {
    resolvers: Vec<Arc<dyn SourceResolver>>,
    stages: BTreeMap<(ArtifactType, ArtifactType), Vec<Arc<dyn DecodeStage>>>,
    encoders: BTreeMap<ArtifactType, Arc<dyn ArtifactEncoder>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolvers are consulted in registration order.
    pub fn append_resolver(&mut self, resolver: Arc<dyn SourceResolver>) -> &mut Self {
        self.resolvers.push(resolver);
        self
    }

    pub fn append_stage(&mut self, stage: Arc<dyn DecodeStage>) -> &mut Self {
        self.stages
            .entry((stage.data_type(), stage.output_type()))
            .or_default()
            .push(stage);
        self
    }

    /// Replaces any encoder previously registered for `artifact_type`.
    pub fn register_encoder(
        &mut self,
        artifact_type: ArtifactType,
        encoder: Arc<dyn ArtifactEncoder>,
    ) -> &mut Self {
        self.encoders.insert(artifact_type, encoder);
        self
    }

    fn stages_for(
        &self,
        data_type: ArtifactType,
        intermediate_type: ArtifactType,
        output_type: ArtifactType,
    ) -> Vec<Arc<dyn DecodeStage>> {
        let mut selected = Vec::new();
        let mut current = Some(data_type);
        while let Some(kind) = current {
            for ((stage_data, stage_output), stages) in &self.stages {
                if *stage_data != kind || !stage_output.is_assignable_to(output_type) {
                    continue;
                }
                selected.extend(
                    stages
                        .iter()
                        .filter(|stage| stage.intermediate_type().is_assignable_to(intermediate_type))
                        .cloned(),
                );
            }
            current = kind.parent();
        }
        selected
    }
}

impl ComponentRegistry for Registry {
    fn resolvers_for(&self, model: &Model) -> Vec<Arc<dyn SourceResolver>> {
        self.resolvers
            .iter()
            .filter(|resolver| resolver.handles(model))
            .cloned()
            .collect()
    }

    fn resolvers_for_cached_file(&self, file: &CachedFile) -> Vec<Arc<dyn SourceResolver>> {
        self.resolvers_for(&file.to_model())
    }

    fn decode_pipeline_for(
        &self,
        data_type: ArtifactType,
        intermediate_type: ArtifactType,
        output_type: ArtifactType,
    ) -> Option<DecodePipeline> {
        let stages = self.stages_for(data_type, intermediate_type, output_type);
        DecodePipeline::new(data_type, intermediate_type, output_type, stages).ok()
    }

    fn decoded_types(
        &self,
        intermediate_type: ArtifactType,
        output_type: ArtifactType,
    ) -> Vec<ArtifactType> {
        let types: BTreeSet<ArtifactType> = self
            .stages
            .iter()
            .filter(|((_, stage_output), _)| stage_output.is_assignable_to(output_type))
            .flat_map(|(_, stages)| stages)
            .filter(|stage| stage.intermediate_type().is_assignable_to(intermediate_type))
            .map(|stage| stage.output_type())
            .collect();
        types.into_iter().collect()
    }

    fn artifact_encoder(&self, artifact: &dyn Artifact) -> Option<Arc<dyn ArtifactEncoder>> {
        let mut current = Some(artifact.artifact_type());
        while let Some(kind) = current {
            if let Some(encoder) = self.encoders.get(&kind) {
                return Some(encoder.clone());
            }
            current = kind.parent();
        }
        None
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let resolvers: Vec<&str> = self.resolvers.iter().map(|r| r.name()).collect();
        f.debug_struct("Registry")
            .field("resolvers", &resolvers)
            .field("stage_pairs", &self.stages.keys().collect::<Vec<_>>())
            .field("encoders", &self.encoders.keys().collect::<Vec<_>>())
            .finish()
    }
}
