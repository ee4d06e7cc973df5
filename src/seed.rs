//! Startup import of wish definitions from a JSON file.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::model::Wish;
use crate::store::{StoreError, WishStore, validate_wish};

#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    #[error("reading seed file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing seed file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("seed entry {index} ({name:?}): {source}")]
    Invalid {
        index: usize,
        name: String,
        source: StoreError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SeedReport {
    pub created: usize,
    pub skipped: usize,
}

pub fn load(path: &Path) -> Result<Vec<Wish>, SeedError> {
    let raw = std::fs::read_to_string(path).map_err(|source| SeedError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| SeedError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Create every wish that does not exist yet. All entries are checked before
/// the first write, so one bad entry leaves the store untouched.
pub async fn apply(
    store: &dyn WishStore,
    namespace: &str,
    mut wishes: Vec<Wish>,
) -> Result<SeedReport, SeedError> {
    for (index, wish) in wishes.iter_mut().enumerate() {
        if wish.metadata.namespace.is_empty() {
            wish.metadata.namespace = namespace.to_string();
        }
        let invalid = |source| SeedError::Invalid {
            index,
            name: wish.metadata.name.clone(),
            source,
        };
        if wish.metadata.namespace != namespace {
            return Err(invalid(StoreError::Invalid(format!(
                "namespace {:?} is not the served namespace {namespace:?}",
                wish.metadata.namespace
            ))));
        }
        validate_wish(wish).map_err(invalid)?;
    }

    let mut report = SeedReport::default();
    for wish in wishes {
        let name = wish.metadata.name.clone();
        match store.create(wish).await {
            Ok(_) => {
                debug!(wish = %name, "seeded wish");
                report.created += 1;
            }
            Err(StoreError::AlreadyExists { .. }) => {
                debug!(wish = %name, "wish already present, not seeding");
                report.skipped += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
    info!(namespace, created = report.created, skipped = report.skipped, "applied seed file");
    Ok(report)
}
