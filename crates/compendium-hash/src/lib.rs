//! Content hashing (component A).
//!
//! `hash_bytes`, `hash_file`, `hash_command`, and `verify`, all routed
//! through the tagged multihash [`Digest`] type so downstream consumers
//! can dispatch on algorithm without re-parsing. File hashing streams in
//! bounded chunks so large artifacts never need to be fully resident in
//! memory at once.

use std::fs::File;
use std::io::{self, Read};

use camino::Utf8Path;
use compendium_types::{Algorithm, Digest};
use sha2::{Digest as _, Sha256};

/// Upper bound on a single read from disk while hashing a file.
const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl compendium_types::Classify for HashError {
    fn classify(&self) -> compendium_types::ErrorClassification {
        compendium_types::ErrorClassification::Io
    }
}

/// Outcome of [`verify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Ok,
    Mismatch,
}

/// Hash a byte string directly.
#[tracing::instrument(skip(bytes))]
pub fn hash_bytes(bytes: &[u8], algorithm: Algorithm) -> Digest {
    match algorithm {
        Algorithm::Sha256 => {
            let mut hasher = Sha256::new();
            hasher.update(bytes);
            Digest::new(Algorithm::Sha256, &hasher.finalize())
        }
    }
}

/// Stream a file's contents through the hasher in bounded chunks.
#[tracing::instrument(skip(algorithm))]
pub fn hash_file(path: &Utf8Path, algorithm: Algorithm) -> Result<Digest, HashError> {
    let mut file = File::open(path).map_err(|source| HashError::Io {
        path: path.to_string(),
        source,
    })?;

    let mut hasher = match algorithm {
        Algorithm::Sha256 => Sha256::new(),
    };
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let read = file.read(&mut buf).map_err(|source| HashError::Io {
            path: path.to_string(),
            source,
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }

    Ok(Digest::new(algorithm, &hasher.finalize()))
}

/// Hash a command's argument vector. Tokens are sorted first so equivalent
/// re-orderings of the same flags hash identically — a deliberate design
/// choice, not an oversight. This is also why `rm -rf /foo` and
/// `rm /foo -rf` collapse to the same `command_digest`; see DESIGN.md for
/// the rationale.
#[tracing::instrument]
pub fn hash_command(argv: &[String], algorithm: Algorithm) -> Digest {
    let mut sorted: Vec<&str> = argv.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    let joined = sorted.join("\u{0}");
    hash_bytes(joined.as_bytes(), algorithm)
}

/// Compare a file's actual digest against an expected one.
pub fn verify(
    path: &Utf8Path,
    expected: &Digest,
    algorithm: Algorithm,
) -> Result<VerifyOutcome, HashError> {
    let actual = hash_file(path, algorithm)?;
    Ok(if &actual == expected {
        VerifyOutcome::Ok
    } else {
        VerifyOutcome::Mismatch
    })
}
