use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::digest::{Algorithm, Digest};

/// A file observed by the tracer: its absolute path inside the traced
/// environment and a digest over its byte contents at observation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileRef {
    pub path: Utf8PathBuf,
    pub digest: Digest,
}

impl FileRef {
    pub fn new(path: impl Into<Utf8PathBuf>, digest: Digest) -> Self {
        Self {
            path: path.into(),
            digest,
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.digest.algorithm()
    }
}
