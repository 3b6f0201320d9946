//! Per-request view of the component registry.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use once_cell::unsync::OnceCell;

use super::artifact::{ArtifactType, Model};
use super::components::UnitTransformation;
use super::decode::DecodePipeline;
use super::error::{BuildError, MissingTransformationError};
use super::keys::{
    ArtifactCacheKey, CacheKey, ORIGINAL_SIZE, OptionKey, OptionValue, Options, RequestKey,
    SourceCacheKey, TransformationId,
};
use super::registry::{ComponentRegistry, FetchPlan, Transformation};
use super::strategy::PersistenceStrategy;

/// Everything a caller specifies for one load.
#[derive(Clone)]
pub struct LoadRequest {
    pub model: Model,
    pub signature: CacheKey,
    pub width: i32,
    pub height: i32,
    pub transformations: BTreeMap<ArtifactType, Arc<dyn Transformation>>,
    /// Fail instead of falling back to the identity when no transformation
    /// is registered at all.
    pub transformation_required: bool,
    pub source_type: ArtifactType,
    pub output_type: ArtifactType,
    pub options: Options,
    /// `None` uses the engine's configured default.
    pub strategy: Option<PersistenceStrategy>,
    pub cache_only: bool,
    pub memory_cacheable: bool,
}

impl LoadRequest {
    pub fn new(model: Model) -> Self {
        Self {
            model,
            signature: CacheKey::Empty,
            width: ORIGINAL_SIZE,
            height: ORIGINAL_SIZE,
            transformations: BTreeMap::new(),
            transformation_required: false,
            source_type: ArtifactType::Bytes,
            output_type: ArtifactType::Bytes,
            options: Options::new(),
            strategy: None,
            cache_only: false,
            memory_cacheable: true,
        }
    }

    pub fn size(mut self, width: i32, height: i32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn signature(mut self, signature: CacheKey) -> Self {
        self.signature = signature;
        self
    }

    pub fn transform(
        mut self,
        artifact_type: ArtifactType,
        transformation: Arc<dyn Transformation>,
    ) -> Self {
        self.transformations.insert(artifact_type, transformation);
        self
    }

    pub fn require_transformation(mut self) -> Self {
        self.transformation_required = true;
        self
    }

    pub fn types(mut self, source_type: ArtifactType, output_type: ArtifactType) -> Self {
        self.source_type = source_type;
        self.output_type = output_type;
        self
    }

    pub fn option(mut self, key: OptionKey, value: OptionValue) -> Self {
        self.options = self.options.set(key, value);
        self
    }

    pub fn strategy(mut self, strategy: PersistenceStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn cache_only(mut self) -> Self {
        self.cache_only = true;
        self
    }

    pub fn skip_memory_cache(mut self) -> Self {
        self.memory_cacheable = false;
        self
    }

    /// In-memory identity of this request.
    pub fn request_key(&self) -> Result<RequestKey, BuildError> {
        let transformations = self
            .transformations
            .iter()
            .map(|(kind, transformation)| (*kind, transformation.id()))
            .collect();
        RequestKey::builder()
            .model(self.model.clone())
            .signature(self.signature.clone())
            .size(self.width, self.height)
            .transformations(transformations)
            .source_type(self.source_type)
            .output_type(self.output_type)
            .options(self.options.clone())
            .build()
    }
}

impl fmt::Debug for LoadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadRequest")
            .field("model", &self.model)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("transformations", &self.transformations.keys().collect::<Vec<_>>())
            .field("source_type", &self.source_type)
            .field("output_type", &self.output_type)
            .field("strategy", &self.strategy)
            .field("cache_only", &self.cache_only)
            .finish_non_exhaustive()
    }
}

/// Memoizing facade over the registry for a single job.
///
/// Not `Sync`: it is created and consumed on the thread running the job, and
/// nothing it caches is shared with other jobs.
pub struct RequestContext {
    request: Arc<LoadRequest>,
    key: RequestKey,
    strategy: PersistenceStrategy,
    registry: Arc<dyn ComponentRegistry>,
    fetch_plans: OnceCell<Vec<FetchPlan>>,
    source_keys: OnceCell<Vec<CacheKey>>,
    decoded_types: OnceCell<Vec<ArtifactType>>,
    pipelines: RefCell<HashMap<ArtifactType, Option<Arc<DecodePipeline>>>>,
}

impl RequestContext {
    pub fn new(
        request: Arc<LoadRequest>,
        key: RequestKey,
        strategy: PersistenceStrategy,
        registry: Arc<dyn ComponentRegistry>,
    ) -> Self {
        Self {
            request,
            key,
            strategy,
            registry,
            fetch_plans: OnceCell::new(),
            source_keys: OnceCell::new(),
            decoded_types: OnceCell::new(),
            pipelines: RefCell::new(HashMap::new()),
        }
    }

    pub fn request(&self) -> &LoadRequest {
        &self.request
    }

    pub fn key(&self) -> &RequestKey {
        &self.key
    }

    pub fn strategy(&self) -> PersistenceStrategy {
        self.strategy
    }

    pub fn registry(&self) -> &Arc<dyn ComponentRegistry> {
        &self.registry
    }

    /// Fetch plans from every resolver that handles the model, in resolver
    /// order.
    pub fn fetch_plans(&self) -> &[FetchPlan] {
        self.fetch_plans.get_or_init(|| {
            let request = &self.request;
            self.registry
                .resolvers_for(&request.model)
                .iter()
                .filter_map(|resolver| {
                    resolver.build_fetch(
                        &request.model,
                        request.width,
                        request.height,
                        &request.options,
                    )
                })
                .collect()
        })
    }

    /// Primary and alternate keys of every fetch plan, first occurrence wins.
    pub fn candidate_source_keys(&self) -> &[CacheKey] {
        self.source_keys.get_or_init(|| {
            let mut keys: Vec<CacheKey> = Vec::new();
            for plan in self.fetch_plans() {
                for key in std::iter::once(&plan.source_key).chain(&plan.alternate_keys) {
                    if !keys.contains(key) {
                        keys.push(key.clone());
                    }
                }
            }
            keys
        })
    }

    /// Transformation for an artifact of `artifact_type`: an exact match,
    /// else the one registered for the nearest supertype, else the identity.
    pub fn resolve_transformation(
        &self,
        artifact_type: ArtifactType,
    ) -> Result<Arc<dyn Transformation>, MissingTransformationError> {
        let transformations = &self.request.transformations;
        let mut current = Some(artifact_type);
        while let Some(kind) = current {
            if let Some(transformation) = transformations.get(&kind) {
                return Ok(transformation.clone());
            }
            current = kind.parent();
        }
        if transformations.is_empty() && self.request.transformation_required {
            return Err(MissingTransformationError { artifact_type });
        }
        Ok(Arc::new(UnitTransformation))
    }

    /// Id recorded in artifact keys for an artifact of `artifact_type`;
    /// `None` when it would be left untouched.
    pub fn transformation_id_for(&self, artifact_type: ArtifactType) -> Option<TransformationId> {
        self.resolve_transformation(artifact_type)
            .ok()
            .filter(|transformation| !transformation.is_identity())
            .map(|transformation| transformation.id())
    }

    /// Artifact types the registered stages may decode this request to.
    pub fn decoded_types(&self) -> &[ArtifactType] {
        self.decoded_types.get_or_init(|| {
            self.registry
                .decoded_types(self.key.source_type(), self.key.output_type())
        })
    }

    pub fn candidate_decode_stages(&self, data_type: ArtifactType) -> Option<Arc<DecodePipeline>> {
        if let Some(cached) = self.pipelines.borrow().get(&data_type) {
            return cached.clone();
        }
        let pipeline = self
            .registry
            .decode_pipeline_for(data_type, self.key.source_type(), self.key.output_type())
            .map(Arc::new);
        self.pipelines
            .borrow_mut()
            .insert(data_type, pipeline.clone());
        pipeline
    }

    pub fn has_decode_pipeline(&self, data_type: ArtifactType) -> bool {
        self.candidate_decode_stages(data_type).is_some()
    }

    pub fn source_cache_key(&self, source_key: &CacheKey) -> SourceCacheKey {
        SourceCacheKey::new(source_key.clone(), self.request.signature.clone())
    }

    pub fn artifact_cache_key(
        &self,
        source_key: &CacheKey,
        transformation: Option<TransformationId>,
    ) -> ArtifactCacheKey {
        ArtifactCacheKey::new(
            source_key.clone(),
            self.request.signature.clone(),
            self.request.width,
            self.request.height,
            transformation,
            self.request.output_type,
            self.request.options.clone(),
        )
    }

    /// Every artifact key a job for this request could have written under
    /// `source_key`: one per distinct transformation the decoded types
    /// resolve to, in decoded-type order.
    pub fn artifact_cache_keys(&self, source_key: &CacheKey) -> Vec<ArtifactCacheKey> {
        let mut ids: Vec<Option<TransformationId>> = Vec::new();
        for kind in self.decoded_types() {
            let id = self.transformation_id_for(*kind);
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids.into_iter()
            .map(|id| self.artifact_cache_key(source_key, id))
            .collect()
    }

    /// True when `source_key` is not the request's primary source key.
    pub fn is_alternate_key(&self, source_key: &CacheKey) -> bool {
        self.candidate_source_keys()
            .first()
            .is_some_and(|primary| primary != source_key)
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("key", &self.key)
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}
