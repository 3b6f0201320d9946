//! Persistence policies for the source and artifact tiers.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

/// Where the data for an attempt came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provenance {
    /// Fetched from a remote origin.
    Remote,
    /// Read from a local origin (file system, bundled resource, in-memory bytes).
    Local,
    /// Raw source bytes read back from the persistent source tier.
    SourceDiskCache,
    /// A transformed artifact read back from the persistent artifact tier.
    ArtifactDiskCache,
    /// Served from the live or memory tier.
    MemoryCache,
}

/// How an encoder would persist an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeStrategy {
    /// The encoder writes the original source bytes.
    Source,
    /// The encoder writes the transformed artifact.
    Transformed,
    /// The artifact cannot be encoded.
    None,
}

/// Which tiers are written and read for a request.
///
/// Every predicate is a total, side-effect free function of its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PersistenceStrategy {
    /// Cache remote source bytes and every artifact not already read from a cache.
    All,
    /// Cache nothing, read nothing.
    None,
    /// Cache raw source bytes before decoding; never the artifact.
    SourceOnly,
    /// Cache the decoded artifact; never the raw source.
    ArtifactOnly,
    /// Cache remote sources, and artifacts whose re-derivation is deterministic
    /// but not free (local sources, or alternate keys served by the source tier).
    #[default]
    Automatic,
}

impl PersistenceStrategy {
    /// Whether raw source bytes obtained from `provenance` go to the source tier.
    pub fn should_cache_source(self, provenance: Provenance) -> bool {
        match self {
            Self::All | Self::Automatic => provenance == Provenance::Remote,
            Self::SourceOnly => !matches!(
                provenance,
                Provenance::SourceDiskCache | Provenance::MemoryCache
            ),
            Self::None | Self::ArtifactOnly => false,
        }
    }

    /// Whether a transformed artifact goes to the artifact tier.
    ///
    /// `is_from_alternate_key` is computed by the caller: true when the data
    /// was found under a key other than the request's primary source key.
    pub fn should_cache_artifact(
        self,
        is_from_alternate_key: bool,
        provenance: Provenance,
        encode_strategy: EncodeStrategy,
    ) -> bool {
        match self {
            Self::All | Self::ArtifactOnly => !matches!(
                provenance,
                Provenance::ArtifactDiskCache | Provenance::MemoryCache
            ),
            Self::Automatic => {
                let re_derivable = (is_from_alternate_key
                    && provenance == Provenance::SourceDiskCache)
                    || provenance == Provenance::Local;
                re_derivable && encode_strategy == EncodeStrategy::Transformed
            }
            Self::None | Self::SourceOnly => false,
        }
    }

    pub fn should_read_artifact_cache(self) -> bool {
        matches!(self, Self::All | Self::ArtifactOnly | Self::Automatic)
    }

    pub fn should_read_source_cache(self) -> bool {
        matches!(self, Self::All | Self::SourceOnly | Self::Automatic)
    }

    fn name(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::None => "none",
            Self::SourceOnly => "source-only",
            Self::ArtifactOnly => "artifact-only",
            Self::Automatic => "automatic",
        }
    }
}

impl fmt::Display for PersistenceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PersistenceStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let strategy = match value.trim().to_ascii_lowercase().as_str() {
            "all" => Self::All,
            "none" => Self::None,
            "source-only" => Self::SourceOnly,
            "artifact-only" => Self::ArtifactOnly,
            "automatic" => Self::Automatic,
            other => return Err(format!("unknown persistence strategy `{other}`")),
        };
        Ok(strategy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROVENANCES: [Provenance; 5] = [
        Provenance::Remote,
        Provenance::Local,
        Provenance::SourceDiskCache,
        Provenance::ArtifactDiskCache,
        Provenance::MemoryCache,
    ];
    const ENCODES: [EncodeStrategy; 3] = [
        EncodeStrategy::Source,
        EncodeStrategy::Transformed,
        EncodeStrategy::None,
    ];

    #[test]
    fn all_caches_remote_sources_only() {
        let strategy = PersistenceStrategy::All;
        assert!(strategy.should_cache_source(Provenance::Remote));
        assert!(!strategy.should_cache_source(Provenance::Local));
        assert!(!strategy.should_cache_source(Provenance::SourceDiskCache));
    }

    #[test]
    fn all_caches_artifacts_not_read_from_a_cache() {
        let strategy = PersistenceStrategy::All;
        assert!(strategy.should_cache_artifact(false, Provenance::Remote, EncodeStrategy::None));
        assert!(strategy.should_cache_artifact(
            false,
            Provenance::SourceDiskCache,
            EncodeStrategy::Source
        ));
        assert!(!strategy.should_cache_artifact(
            false,
            Provenance::ArtifactDiskCache,
            EncodeStrategy::Transformed
        ));
        assert!(!strategy.should_cache_artifact(
            true,
            Provenance::MemoryCache,
            EncodeStrategy::Transformed
        ));
        assert!(strategy.should_read_artifact_cache());
        assert!(strategy.should_read_source_cache());
    }

    #[test]
    fn none_is_false_everywhere() {
        let strategy = PersistenceStrategy::None;
        for provenance in PROVENANCES {
            assert!(!strategy.should_cache_source(provenance));
            for encode in ENCODES {
                for alternate in [false, true] {
                    assert!(!strategy.should_cache_artifact(alternate, provenance, encode));
                }
            }
        }
        assert!(!strategy.should_read_artifact_cache());
        assert!(!strategy.should_read_source_cache());
    }

    #[test]
    fn source_only_never_touches_artifact_tier() {
        let strategy = PersistenceStrategy::SourceOnly;
        assert!(strategy.should_cache_source(Provenance::Remote));
        assert!(strategy.should_cache_source(Provenance::Local));
        assert!(!strategy.should_cache_source(Provenance::SourceDiskCache));
        for provenance in PROVENANCES {
            assert!(!strategy.should_cache_artifact(
                false,
                provenance,
                EncodeStrategy::Transformed
            ));
        }
        assert!(!strategy.should_read_artifact_cache());
        assert!(strategy.should_read_source_cache());
    }

    #[test]
    fn artifact_only_never_touches_source_tier() {
        let strategy = PersistenceStrategy::ArtifactOnly;
        for provenance in PROVENANCES {
            assert!(!strategy.should_cache_source(provenance));
        }
        assert!(strategy.should_cache_artifact(false, Provenance::Remote, EncodeStrategy::None));
        assert!(strategy.should_read_artifact_cache());
        assert!(!strategy.should_read_source_cache());
    }

    #[test]
    fn automatic_caches_cheap_to_keep_artifacts() {
        let strategy = PersistenceStrategy::Automatic;
        assert!(strategy.should_cache_source(Provenance::Remote));
        assert!(!strategy.should_cache_source(Provenance::Local));

        assert!(strategy.should_cache_artifact(
            false,
            Provenance::Local,
            EncodeStrategy::Transformed
        ));
        assert!(strategy.should_cache_artifact(
            true,
            Provenance::SourceDiskCache,
            EncodeStrategy::Transformed
        ));
        assert!(!strategy.should_cache_artifact(
            false,
            Provenance::SourceDiskCache,
            EncodeStrategy::Transformed
        ));
        assert!(!strategy.should_cache_artifact(
            false,
            Provenance::Local,
            EncodeStrategy::Source
        ));
        assert!(!strategy.should_cache_artifact(
            true,
            Provenance::Remote,
            EncodeStrategy::Transformed
        ));
    }

    #[test]
    fn parses_kebab_case_names() {
        for strategy in [
            PersistenceStrategy::All,
            PersistenceStrategy::None,
            PersistenceStrategy::SourceOnly,
            PersistenceStrategy::ArtifactOnly,
            PersistenceStrategy::Automatic,
        ] {
            assert_eq!(strategy.to_string().parse(), Ok(strategy));
        }
        assert!("sometimes".parse::<PersistenceStrategy>().is_err());
    }
}
