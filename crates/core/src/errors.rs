use std::fmt;

use thiserror::Error;

/// Conditions callers are expected to match on.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("no cache available for {gvk}")]
    NoCacheAvailable { gvk: String },
    #[error("invalid cluster scoped gvk: {gvk}")]
    ClusterScopedRestricted { gvk: String },
    #[error("object missing metadata.name")]
    MissingName,
    #[error("object missing metadata.uid")]
    MissingUid,
    #[error("object missing apiVersion/kind")]
    MissingTypeMeta,
    #[error("no owner set to assign owner reference")]
    NoOwner,
    /// Transient condition: the object was force-deleted and is expected to
    /// be recreated on a later pass.
    #[error("waiting for replace of {key} ({gvk}) for {debug_id}")]
    ReplaceWait { gvk: String, key: String, debug_id: String },
}

/// Store verb failures. `AlreadyExists` and `NotFound` are recovered from by
/// the engine; everything else is reported as-is.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object already exists")]
    AlreadyExists,
    #[error("object not found")]
    NotFound,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Aggregate of independent failures from one batch. A non-empty aggregate
/// means "incomplete", not "discard results".
#[derive(Debug, Default)]
pub struct Errors(Vec<anyhow::Error>);

impl Errors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: anyhow::Error) {
        self.0.push(err);
    }

    pub fn extend(&mut self, errs: impl IntoIterator<Item = anyhow::Error>) {
        self.0.extend(errs);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &anyhow::Error> {
        self.0.iter()
    }

    /// `Ok(value)` when no errors were collected, `Err(self)` otherwise.
    pub fn into_result<T>(self, value: T) -> Result<T, Errors> {
        if self.0.is_empty() {
            Ok(value)
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for Errors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [] => write!(f, "no errors"),
            [single] => write!(f, "{single:#}"),
            many => {
                write!(f, "{} errors occurred:", many.len())?;
                for err in many {
                    write!(f, " [{err:#}]")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for Errors {}

impl From<anyhow::Error> for Errors {
    fn from(err: anyhow::Error) -> Self {
        Self(vec![err])
    }
}

impl IntoIterator for Errors {
    type Item = anyhow::Error;
    type IntoIter = std::vec::IntoIter<anyhow::Error>;
    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
