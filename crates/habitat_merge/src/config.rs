use crate::scheduler::PartitionStrategy;
use clap::ValueEnum;
use habitat_store::HabitatType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use thiserror::Error;

/// Per-type merge thresholds, in metres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TypeThresholds {
    /// Maximum separation for two candidates to count as one feature.
    pub merge_distance: f64,
    /// Outward offset applied to every member before union.
    pub merge_buffer: f64,
}

/// Which source dataset the candidates were built from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetMode {
    /// CORINE land cover.
    Corine,
    /// UK Land Cover Map: finer polygons, so tighter merge distances.
    Lcm,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("habitat type `none` must always be excluded")]
    NoneNotExcluded,

    #[error("no thresholds configured for habitat type `{0}`")]
    MissingThresholds(HabitatType),

    #[error("thresholds for `{habitat}` must be finite and non-negative ({thresholds:?})")]
    InvalidThresholds {
        habitat: HabitatType,
        thresholds: TypeThresholds,
    },

    #[error(
        "search distance {search} m is below the merge distance {needed} m of `{habitat}`; \
         true neighbours would be missed"
    )]
    SearchDistanceTooSmall {
        search: f64,
        needed: f64,
        habitat: HabitatType,
    },

    #[error("{name} must be {requirement} (got {value})")]
    OutOfRange {
        name: &'static str,
        requirement: &'static str,
        value: f64,
    },
}

/// Static run configuration for one consolidation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MergeConfig {
    pub thresholds: BTreeMap<HabitatType, TypeThresholds>,
    /// Types that never enter the graph or the fallback path.
    pub exclude_types: Vec<HabitatType>,
    /// Neighbour query radius; must dominate every merge distance.
    pub search_distance: f64,
    /// Minimum area (m²) of any committed habitat.
    pub min_size: f64,
    pub max_simplify_tolerance: f64,
    /// Halving stops once the tolerance is at or below this value.
    pub min_simplify_tolerance: f64,
    pub graph_workers: usize,
    pub merge_workers: usize,
    pub partition: PartitionStrategy,
}

/// `min(available cores, 64)`.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(64)
}

impl Default for MergeConfig {
    fn default() -> Self {
        use HabitatType::*;

        let table = [
            (Urban, 100.0, 50.0),
            (Wood, 10.0, 10.0),
            (Wetland, 10.0, 30.0),
            (Water, 10.0, 30.0),
            (River, 10.0, 30.0),
            (Grassland, 20.0, 30.0),
            (Arable, 2.0, 30.0),
            (Seminatural, 2.0, 30.0),
            (Mountain, 10.0, 10.0),
        ];

        let workers = default_workers();

        Self {
            thresholds: table
                .into_iter()
                .map(|(t, merge_distance, merge_buffer)| {
                    (
                        t,
                        TypeThresholds {
                            merge_distance,
                            merge_buffer,
                        },
                    )
                })
                .collect(),
            exclude_types: vec![HabitatType::None],
            search_distance: 100.0,
            min_size: 50_000.0,
            max_simplify_tolerance: 50.0,
            min_simplify_tolerance: 1.0,
            graph_workers: workers,
            merge_workers: workers,
            partition: PartitionStrategy::RoundRobin,
        }
    }
}

impl MergeConfig {
    /// Load a JSON config. Missing fields take their default values.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        serde_json::from_reader(BufReader::new(file)).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Adjust thresholds for the source dataset. `Lcm` halves every merge
    /// distance and disables distance merging of arable land.
    pub fn with_mode(mut self, mode: DatasetMode) -> Self {
        if mode == DatasetMode::Lcm {
            for th in self.thresholds.values_mut() {
                th.merge_distance /= 2.0;
            }
            if let Some(arable) = self.thresholds.get_mut(&HabitatType::Arable) {
                arable.merge_distance = 0.0;
            }
        }
        self
    }

    #[inline]
    pub fn is_excluded(&self, habitat: HabitatType) -> bool {
        habitat == HabitatType::None || self.exclude_types.contains(&habitat)
    }

    #[inline]
    pub fn thresholds(&self, habitat: HabitatType) -> Option<TypeThresholds> {
        self.thresholds.get(&habitat).copied()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.exclude_types.contains(&HabitatType::None) {
            return Err(ConfigError::NoneNotExcluded);
        }

        for habitat in HabitatType::ALL {
            if self.is_excluded(habitat) {
                continue;
            }

            let th = self
                .thresholds(habitat)
                .ok_or(ConfigError::MissingThresholds(habitat))?;

            let sane = |v: f64| v.is_finite() && v >= 0.0;
            if !sane(th.merge_distance) || !sane(th.merge_buffer) {
                return Err(ConfigError::InvalidThresholds {
                    habitat,
                    thresholds: th,
                });
            }

            if th.merge_distance > self.search_distance {
                return Err(ConfigError::SearchDistanceTooSmall {
                    search: self.search_distance,
                    needed: th.merge_distance,
                    habitat,
                });
            }
        }

        positive("min_size", self.min_size)?;
        positive("max_simplify_tolerance", self.max_simplify_tolerance)?;
        positive("min_simplify_tolerance", self.min_simplify_tolerance)?;

        if self.min_simplify_tolerance > self.max_simplify_tolerance {
            return Err(ConfigError::OutOfRange {
                name: "min_simplify_tolerance",
                requirement: "at most max_simplify_tolerance",
                value: self.min_simplify_tolerance,
            });
        }

        for (name, workers) in [
            ("graph_workers", self.graph_workers),
            ("merge_workers", self.merge_workers),
        ] {
            if workers == 0 {
                return Err(ConfigError::OutOfRange {
                    name,
                    requirement: "at least 1",
                    value: 0.0,
                });
            }
        }

        Ok(())
    }
}

fn positive(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            name,
            requirement: "finite and positive",
            value,
        })
    }
}
