//! Query configuration and its file loader.

use std::{path::PathBuf, time::Duration};

use data_types::{Predicate, Query};
use planner::PlannerConfig;
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("error reading query config {}: {}", path.display(), source))]
    FetchBytes {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("error decoding query config: {}", source))]
    Decode { source: serde_json::Error },

    #[snafu(display("invalid query config: {}", reason))]
    Invalid { reason: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything needed to plan queries against one dataset replica.
///
/// Predicates are expressed in the dataset's real attribute numbering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConf {
    /// Root of the dataset in the object store.
    pub working_dir: String,
    pub replica_id: String,
    pub coordination_hosts: Vec<String>,
    pub predicates: Vec<Predicate>,
    /// Plan in access mode only; never refine the index.
    pub just_access: bool,
    pub min_split_records: u64,
    pub max_split_records: u64,
    pub min_refine_records: u64,
    pub max_refine_selectivity: f64,
    pub lease_timeout_ms: u64,
}

impl Default for QueryConf {
    fn default() -> Self {
        let planner = PlannerConfig::default();
        Self {
            working_dir: "adaptdb".to_string(),
            replica_id: "0".to_string(),
            coordination_hosts: vec!["localhost:2181".to_string()],
            predicates: vec![],
            just_access: false,
            min_split_records: planner.min_split_records,
            max_split_records: planner.max_split_records,
            min_refine_records: planner.min_refine_records,
            max_refine_selectivity: planner.max_refine_selectivity,
            lease_timeout_ms: 30_000,
        }
    }
}

impl QueryConf {
    /// The configured predicates as one query.
    pub fn query(&self) -> Query {
        Query::new(self.predicates.clone())
    }

    pub fn planner_config(&self) -> PlannerConfig {
        PlannerConfig {
            min_split_records: self.min_split_records,
            max_split_records: self.max_split_records,
            min_refine_records: self.min_refine_records,
            max_refine_selectivity: self.max_refine_selectivity,
        }
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.working_dir.is_empty() && !self.replica_id.is_empty(),
            InvalidSnafu {
                reason: "working_dir and replica_id must be set",
            }
        );
        ensure!(
            self.max_split_records > 0 && self.min_split_records <= self.max_split_records,
            InvalidSnafu {
                reason: format!(
                    "split bounds {}..{} are empty",
                    self.min_split_records, self.max_split_records
                ),
            }
        );
        ensure!(
            (0.0..=1.0).contains(&self.max_refine_selectivity),
            InvalidSnafu {
                reason: format!(
                    "max_refine_selectivity {} is not a fraction",
                    self.max_refine_selectivity
                ),
            }
        );
        ensure!(
            self.lease_timeout_ms > 0,
            InvalidSnafu {
                reason: "lease_timeout_ms must be positive",
            }
        );
        Ok(())
    }
}

/// A loader for [`QueryConf`] stored as JSON.
#[derive(Debug)]
pub struct QueryConfFile {
    path: PathBuf,
}

impl QueryConfFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Read and validate the file. Fields missing from the file take their
    /// default values.
    pub async fn load(&self) -> Result<QueryConf> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .context(FetchBytesSnafu { path: &self.path })?;

        let conf: QueryConf = serde_json::from_slice(bytes.as_slice()).context(DecodeSnafu)?;
        conf.validate()?;
        Ok(conf)
    }
}
