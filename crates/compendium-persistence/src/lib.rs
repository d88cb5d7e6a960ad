//! Persistence (component I): index snapshot serialization and bundle store
//! garbage collection.
//!
//! Snapshots serialize via `postcard` for compact, deterministic binary
//! output; the write path reuses the write-to-temp-then-rename pattern
//! from `compendium-builder::seal`, itself grounded on
//! `turborepo-cache::fs::FSCache::put`.

use std::collections::BTreeSet;

use camino::{Utf8Path, Utf8PathBuf};
use compendium_graph::{GraphError, Index};
use compendium_types::Compendium;
use serde::{Deserialize, Serialize};

/// Bumped whenever the on-disk snapshot layout changes incompatibly.
const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize index snapshot: {0}")]
    Serialize(postcard::Error),
    #[error("failed to deserialize index snapshot: {0}")]
    Deserialize(postcard::Error),
    #[error("snapshot was written by version {found}, this build reads version {expected}")]
    VersionMismatch { found: u32, expected: u32 },
    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl compendium_types::Classify for PersistenceError {
    fn classify(&self) -> compendium_types::ErrorClassification {
        use compendium_types::ErrorClassification::*;
        match self {
            PersistenceError::Io { .. }
            | PersistenceError::Serialize(_)
            | PersistenceError::Deserialize(_)
            | PersistenceError::VersionMismatch { .. } => Io,
            PersistenceError::Graph(inner) => {
                use compendium_types::Classify as _;
                inner.classify()
            }
        }
    }
}

/// The whole graph, vertices and edges, as written to a single snapshot
/// file. Edges are carried for a self-describing format even though they
/// are always re-derived from vertex digests on load (invariant 1) — a
/// mismatch between stored and re-derived edges signals a corrupted or
/// hand-edited snapshot, not a semantic difference to honor.
#[derive(Debug, Serialize, Deserialize)]
struct IndexSnapshot {
    version: u32,
    vertices: Vec<Compendium>,
    edges: Vec<(String, String)>,
}

/// Serialize the whole index to `path` via the atomic write-then-rename
/// pattern.
#[tracing::instrument(skip(index))]
pub fn save_index(path: &Utf8Path, index: &Index) -> Result<(), PersistenceError> {
    let snapshot = IndexSnapshot {
        version: SNAPSHOT_VERSION,
        vertices: index.ordered_vertices().into_iter().cloned().collect(),
        edges: index.edges(),
    };

    let bytes = postcard::to_stdvec(&snapshot).map_err(PersistenceError::Serialize)?;

    let parent = path.parent().unwrap_or(Utf8Path::new("."));
    std::fs::create_dir_all(parent).map_err(|source| PersistenceError::Io {
        path: parent.to_string(),
        source,
    })?;
    let temp_path = parent.join(format!(
        ".{}.{}.tmp",
        path.file_name().unwrap_or("index"),
        std::process::id()
    ));
    std::fs::write(&temp_path, &bytes).map_err(|source| PersistenceError::Io {
        path: temp_path.to_string(),
        source,
    })?;
    std::fs::rename(&temp_path, path).map_err(|source| PersistenceError::Io {
        path: path.to_string(),
        source,
    })?;

    Ok(())
}

/// Load a previously-saved index. `updated_at` ordering and insertion order
/// are restored exactly.
#[tracing::instrument]
pub fn load_index(path: &Utf8Path) -> Result<Index, PersistenceError> {
    let bytes = std::fs::read(path).map_err(|source| PersistenceError::Io {
        path: path.to_string(),
        source,
    })?;
    let snapshot: IndexSnapshot =
        postcard::from_bytes(&bytes).map_err(PersistenceError::Deserialize)?;

    if snapshot.version != SNAPSHOT_VERSION {
        return Err(PersistenceError::VersionMismatch {
            found: snapshot.version,
            expected: SNAPSHOT_VERSION,
        });
    }

    let index = Index::restore(snapshot.vertices)?;

    let mut rebuilt: Vec<(String, String)> = index.edges();
    let mut stored = snapshot.edges;
    rebuilt.sort();
    stored.sort();
    if rebuilt != stored {
        tracing::warn!(
            "snapshot edge list at {} did not match edges re-derived from vertex digests; \
             re-derived edges were used",
            path
        );
    }

    Ok(index)
}

/// Content-addressed bundle store layout: `<root>/<compendium.name>/bundle.sealed`.
pub fn bundle_path(root: &Utf8Path, name: &str) -> Utf8PathBuf {
    root.join(name).join("bundle.sealed")
}

/// Deletes bundle directories under `root` that no longer correspond to any
/// name in `index`: enumerate compendium names in the index, enumerate
/// directories under the bundle root, remove the symmetric difference. The
/// other half of that symmetric difference — index entries with no
/// directory on disk — has nothing to physically remove; it is logged, not
/// acted on. Returns the names of directories removed.
#[tracing::instrument(skip(index))]
pub fn garbage_collect_bundle_store(
    root: &Utf8Path,
    index: &Index,
) -> Result<Vec<String>, PersistenceError> {
    let indexed_names: BTreeSet<String> =
        index.all().into_iter().map(|c| c.name.clone()).collect();

    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(PersistenceError::Io {
                path: root.to_string(),
                source,
            });
        }
    };

    let mut on_disk_names = BTreeSet::new();
    for entry in entries {
        let entry = entry.map_err(|source| PersistenceError::Io {
            path: root.to_string(),
            source,
        })?;
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            if let Some(name) = entry.file_name().to_str() {
                on_disk_names.insert(name.to_string());
            }
        }
    }

    let missing_on_disk: Vec<&String> = indexed_names.difference(&on_disk_names).collect();
    if !missing_on_disk.is_empty() {
        tracing::debug!(?missing_on_disk, "indexed compendia with no bundle directory on disk");
    }

    let orphaned: Vec<String> = on_disk_names
        .difference(&indexed_names)
        .cloned()
        .collect();

    for name in &orphaned {
        let dir = root.join(name);
        std::fs::remove_dir_all(&dir).map_err(|source| PersistenceError::Io {
            path: dir.to_string(),
            source,
        })?;
    }

    Ok(orphaned)
}
