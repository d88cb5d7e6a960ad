use std::collections::BTreeSet;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::digest::{Algorithm, Digest};
use crate::file_ref::FileRef;

/// Vertex status: `UPDATED ↔ OUTDATED`, no terminal state other than
/// deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Updated,
    Outdated,
}

/// A logical clock used to order updates. `updated_at` must only ever
/// increase; the index is the sole owner of the counter (see
/// `compendium-graph::Clock`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

/// A reference to the sealed bundle archive on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleRef {
    pub path: Utf8PathBuf,
    pub digest: Digest,
    pub algorithm: Algorithm,
}

/// Hints the builder recorded about how the command was parsed, carried
/// through to reproduction so the same splitter/algorithm choice is used
/// again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandConfig {
    pub splitter: CommandSplitter,
    pub digest_algorithm: Algorithm,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            splitter: CommandSplitter::Whitespace,
            digest_algorithm: Algorithm::Sha256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandSplitter {
    Whitespace,
    Shell,
}

/// A vertex payload in the pipeline graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compendium {
    pub name: String,
    pub command: Vec<String>,
    pub command_digest: Digest,
    pub bundle: BundleRef,
    pub inputs: Vec<FileRef>,
    pub outputs: Vec<FileRef>,
    pub external_inputs_required: BTreeSet<Digest>,
    pub unpacked_files: Vec<Utf8PathBuf>,
    pub unpacked_environment_variables: Vec<String>,
    pub status: Status,
    pub updated_at: Timestamp,
    pub command_config: CommandConfig,
}

impl Compendium {
    /// `outputs(self) \ outputs(other)` by digest — used by the index's
    /// edge-rebuild and required-input recomputation (invariants 1 and 3).
    pub fn output_digests(&self) -> BTreeSet<Digest> {
        self.outputs.iter().map(|f| f.digest.clone()).collect()
    }

    pub fn input_digests(&self) -> BTreeSet<Digest> {
        self.inputs.iter().map(|f| f.digest.clone()).collect()
    }
}
