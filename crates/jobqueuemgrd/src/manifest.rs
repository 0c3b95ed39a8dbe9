//! Desired job queues, loaded from YAML.
//!
//! ```yaml
//! job_queues:
//!   - name: nightly-etl
//!     priority: 10
//!     state: ENABLED
//!     compute_environments:
//!       - arn:aws:batch:us-east-1:123456789012:compute-environment/spot
//!     scheduling_policy_arn: arn:aws:batch:us-east-1:123456789012:scheduling-policy/fair
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job_queue::{JobQueueError, JobQueueSpec};

/// Errors loading a manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Failed to read manifest '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse manifest: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error(transparent)]
    Invalid(#[from] JobQueueError),

    #[error("Job queue '{0}' is declared more than once")]
    Duplicate(String),
}

/// The job queues that should exist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default)]
    pub job_queues: Vec<JobQueueSpec>,
}

impl Manifest {
    /// Loads and validates a manifest file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    /// Parses and validates manifest YAML.
    pub fn from_yaml_str(text: &str) -> Result<Self, ManifestError> {
        let manifest: Manifest = serde_yaml::from_str(text)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Checks every queue and rejects duplicate names.
    pub fn validate(&self) -> Result<(), ManifestError> {
        let mut seen = HashSet::new();
        for queue in &self.job_queues {
            queue.validate()?;
            if !seen.insert(queue.name.as_str()) {
                return Err(ManifestError::Duplicate(queue.name.clone()));
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.job_queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.job_queues.is_empty()
    }
}
