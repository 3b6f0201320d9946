use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use tracing::debug;

use super::artifact::{ArtifactType, BoxedArtifact, Data};
use super::error::{BuildError, Cause, PipelineError, StageError};
use super::keys::Options;

const SOURCE: &str = "cache::decode";

/// One way of turning fetched data into an artifact.
pub trait DecodeStage: Send + Sync {
    fn name(&self) -> &str;

    fn data_type(&self) -> ArtifactType;

    fn intermediate_type(&self) -> ArtifactType;

    fn output_type(&self) -> ArtifactType;

    /// `Ok(None)` means the stage does not apply to this data; it is not
    /// recorded as a failure.
    fn decode(
        &self,
        data: &Data,
        width: i32,
        height: i32,
        options: &Options,
    ) -> Result<Option<BoxedArtifact>, StageError>;
}

/// Post-processing applied to whatever a stage decoded, before the pipeline
/// returns it. A failure here counts against the stage that produced the input.
pub trait StageCallback {
    fn on_decoded(&mut self, artifact: BoxedArtifact) -> Result<BoxedArtifact, StageError>;
}

impl<F> StageCallback for F
where
    F: FnMut(BoxedArtifact) -> Result<BoxedArtifact, StageError>,
{
    fn on_decoded(&mut self, artifact: BoxedArtifact) -> Result<BoxedArtifact, StageError> {
        self(artifact)
    }
}

/// Ordered fallback over stages that share one
/// `(data type, intermediate type, output type)` triple.
pub struct DecodePipeline {
    data_type: ArtifactType,
    intermediate_type: ArtifactType,
    output_type: ArtifactType,
    stages: Vec<Arc<dyn DecodeStage>>,
}

impl DecodePipeline {
    pub fn new(
        data_type: ArtifactType,
        intermediate_type: ArtifactType,
        output_type: ArtifactType,
        stages: Vec<Arc<dyn DecodeStage>>,
    ) -> Result<Self, BuildError> {
        if stages.is_empty() {
            return Err(BuildError::EmptyDecodePipeline {
                data_type,
                intermediate_type,
                output_type,
            });
        }
        Ok(Self {
            data_type,
            intermediate_type,
            output_type,
            stages,
        })
    }

    pub fn data_type(&self) -> ArtifactType {
        self.data_type
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Try each stage in order; the first artifact wins. When none produces
    /// one, the error lists every stage failure in order.
    pub fn decode(
        &self,
        data: &Data,
        options: &Options,
        width: i32,
        height: i32,
        callback: &mut dyn StageCallback,
    ) -> Result<BoxedArtifact, PipelineError> {
        let started = Instant::now();
        let mut causes = Vec::new();

        for stage in &self.stages {
            let outcome = stage
                .decode(data, width, height, options)
                .and_then(|decoded| decoded.map(|artifact| callback.on_decoded(artifact)).transpose());

            match outcome {
                Ok(Some(artifact)) => {
                    histogram!("stratacache_decode_ms")
                        .record(started.elapsed().as_secs_f64() * 1000.0);
                    return Ok(artifact);
                }
                Ok(None) => {
                    debug!(
                        target_module = SOURCE,
                        stage = stage.name(),
                        data_type = %self.data_type,
                        "Decode stage declined data"
                    );
                }
                Err(err) => {
                    counter!("stratacache_decode_stage_failed_total").increment(1);
                    debug!(
                        target_module = SOURCE,
                        stage = stage.name(),
                        error = %err,
                        "Decode stage failed"
                    );
                    causes.push(Cause::leaf(err));
                }
            }
        }

        Err(PipelineError::new(
            format!(
                "Failed to decode {} -> {} -> {}",
                self.data_type, self.intermediate_type, self.output_type
            ),
            causes,
        ))
    }
}

impl fmt::Debug for DecodePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodePipeline")
            .field("data_type", &self.data_type)
            .field("intermediate_type", &self.intermediate_type)
            .field("output_type", &self.output_type)
            .field("stages", &self.stage_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::artifact::BytesArtifact;

    enum Behaviour {
        Fail(&'static str),
        Decline,
        Produce(&'static str),
    }

    struct Scripted {
        name: &'static str,
        behaviour: Behaviour,
    }

    impl DecodeStage for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn data_type(&self) -> ArtifactType {
            ArtifactType::Bytes
        }

        fn intermediate_type(&self) -> ArtifactType {
            ArtifactType::Bytes
        }

        fn output_type(&self) -> ArtifactType {
            ArtifactType::Bytes
        }

        fn decode(
            &self,
            _data: &Data,
            _width: i32,
            _height: i32,
            _options: &Options,
        ) -> Result<Option<BoxedArtifact>, StageError> {
            match self.behaviour {
                Behaviour::Fail(message) => Err(StageError::format(self.name, message)),
                Behaviour::Decline => Ok(None),
                Behaviour::Produce(payload) => {
                    Ok(Some(Box::new(BytesArtifact::new(ArtifactType::Bytes, payload))))
                }
            }
        }
    }

    fn pipeline(stages: Vec<Scripted>) -> DecodePipeline {
        let stages = stages
            .into_iter()
            .map(|stage| Arc::new(stage) as Arc<dyn DecodeStage>)
            .collect();
        DecodePipeline::new(ArtifactType::Bytes, ArtifactType::Bytes, ArtifactType::Bytes, stages)
            .expect("pipeline")
    }

    fn identity(artifact: BoxedArtifact) -> Result<BoxedArtifact, StageError> {
        Ok(artifact)
    }

    fn payload(artifact: &BoxedArtifact) -> &[u8] {
        artifact
            .as_any()
            .downcast_ref::<BytesArtifact>()
            .expect("bytes artifact")
            .bytes()
    }

    #[test]
    fn empty_stage_list_is_rejected() {
        let err = DecodePipeline::new(
            ArtifactType::File,
            ArtifactType::Bytes,
            ArtifactType::Text,
            Vec::new(),
        )
        .expect_err("empty");
        assert!(matches!(err, BuildError::EmptyDecodePipeline { .. }));
    }

    #[test]
    fn falls_back_until_a_stage_succeeds() {
        let pipeline = pipeline(vec![
            Scripted {
                name: "first",
                behaviour: Behaviour::Fail("bad header"),
            },
            Scripted {
                name: "second",
                behaviour: Behaviour::Fail("truncated"),
            },
            Scripted {
                name: "third",
                behaviour: Behaviour::Produce("A"),
            },
            Scripted {
                name: "unreached",
                behaviour: Behaviour::Produce("B"),
            },
        ]);

        let artifact = pipeline
            .decode(&Data::bytes("raw"), &Options::new(), 1, 1, &mut identity)
            .expect("third stage wins");
        assert_eq!(payload(&artifact), b"A");
    }

    #[test]
    fn exhaustion_reports_every_failure_in_order() {
        let pipeline = pipeline(vec![
            Scripted {
                name: "first",
                behaviour: Behaviour::Fail("one"),
            },
            Scripted {
                name: "declines",
                behaviour: Behaviour::Decline,
            },
            Scripted {
                name: "second",
                behaviour: Behaviour::Fail("two"),
            },
        ]);

        let err = pipeline
            .decode(&Data::bytes("raw"), &Options::new(), 1, 1, &mut identity)
            .expect_err("all stages fail");
        let roots: Vec<String> = err
            .root_causes()
            .iter()
            .map(|cause| cause.error().to_string())
            .collect();
        assert_eq!(
            roots,
            vec![
                "stage `first` could not decode: one",
                "stage `second` could not decode: two"
            ]
        );
        assert!(err.message().contains("bytes -> bytes -> bytes"));
    }

    #[test]
    fn callback_failure_counts_against_the_stage() {
        let pipeline = pipeline(vec![
            Scripted {
                name: "first",
                behaviour: Behaviour::Produce("A"),
            },
            Scripted {
                name: "second",
                behaviour: Behaviour::Produce("B"),
            },
        ]);

        let mut calls = 0;
        let mut reject_first = |artifact: BoxedArtifact| {
            calls += 1;
            if calls == 1 {
                Err(StageError::Transform {
                    id: "crop".to_string(),
                    message: "too small".to_string(),
                })
            } else {
                Ok(artifact)
            }
        };

        let artifact = pipeline
            .decode(&Data::bytes("raw"), &Options::new(), 1, 1, &mut reject_first)
            .expect("second stage wins");
        assert_eq!(payload(&artifact), b"B");
    }
}
