//! Compendium builder (component C).
//!
//! Turns a [`TraceRecord`] plus a [`BuilderConfig`] into a sealed
//! [`Compendium`]: classify inputs/outputs, run the three filters in order
//! (graph-dedup, data-source, secret scrubber), then seal the remaining
//! artifacts into an archive bundle.
//!
//! `external_inputs_required`, `status`, and `updated_at` are left at their
//! defaults here — recomputing required inputs and assigning a logical
//! timestamp are the graph index's job (`compendium-graph::Index::add`),
//! not the builder's.

use std::collections::BTreeSet;
use std::io::{self, Write as _};

use camino::{Utf8Path, Utf8PathBuf};
use compendium_trace::{Run, TraceRecord};
use compendium_types::{
    Algorithm, BuilderConfig, BundleRef, CommandConfig, Compendium, DataSourceAction, Digest,
    FileRef, Status, Timestamp,
};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum BuilderError {
    #[error("trace record has no runs; cannot determine the executed command")]
    EmptyCommand,
    #[error("invalid glob pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Hash(#[from] compendium_hash::HashError),
}

impl compendium_types::Classify for BuilderError {
    fn classify(&self) -> compendium_types::ErrorClassification {
        use compendium_types::ErrorClassification::*;
        match self {
            BuilderError::EmptyCommand | BuilderError::InvalidPattern { .. } => InputValidation,
            BuilderError::Io { .. } | BuilderError::Hash(_) => Io,
        }
    }
}

/// Sidecar manifest written next to the sealed bundle, grounded on
/// `turborepo-cache::fs::FSCache`'s `{hash}-meta.json` pattern: the archive
/// and its metadata are two files, not one, so the manifest never needs to
/// describe its own container's digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealManifest {
    pub algorithm: Algorithm,
    pub external_inputs_required: BTreeSet<Digest>,
    pub unpacked_environment_variables: Vec<String>,
    pub artifact_digests: Vec<(Utf8PathBuf, Digest)>,
}

/// Result of classifying a trace's `inputs_outputs` section.
struct Classified {
    command: Vec<String>,
    inputs: Vec<Utf8PathBuf>,
    outputs: Vec<Utf8PathBuf>,
}

#[tracing::instrument(skip(trace, config))]
fn classify(trace: &TraceRecord, config: &BuilderConfig) -> Result<Classified, BuilderError> {
    let command = trace
        .runs
        .first()
        .ok_or(BuilderError::EmptyCommand)?
        .argv
        .clone();

    let mut inputs = Vec::new();
    let mut outputs = Vec::new();

    for entry in &trace.inputs_outputs {
        let is_input = entry.written_by_runs.is_empty()
            && config
                .working_directories
                .iter()
                .any(|dir| entry.path.as_str().contains(dir.as_str()));
        let is_output = !entry.written_by_runs.is_empty();

        if is_input {
            inputs.push(entry.path.clone());
        }
        if is_output {
            outputs.push(entry.path.clone());
        }
    }

    // The script file itself is never an input, even if the tracer saw it
    // as a read-only file under a working directory.
    inputs.retain(|path| {
        let basename = path.file_name().unwrap_or(path.as_str());
        !command.iter().any(|token| token.contains(basename))
    });

    for pattern in &config.ignored_data_objects {
        let compiled =
            glob::Pattern::new(pattern).map_err(|source| BuilderError::InvalidPattern {
                pattern: pattern.clone(),
                source,
            })?;
        inputs.retain(|path| !compiled.matches(path.as_str()));
        outputs.retain(|path| !compiled.matches(path.as_str()));
    }

    Ok(Classified {
        command,
        inputs,
        outputs,
    })
}

/// Filter 1: drop `other_files` whose digest is already produced as an
/// output by some indexed predecessor — it will arrive via a graph edge at
/// reproduction time.
#[tracing::instrument(skip(other_files, root_dir, predecessor_output_digests))]
fn graph_dedup_filter(
    other_files: &[Utf8PathBuf],
    root_dir: &Utf8Path,
    predecessor_output_digests: &BTreeSet<Digest>,
    algorithm: Algorithm,
) -> Result<Vec<Utf8PathBuf>, BuilderError> {
    let mut kept = Vec::with_capacity(other_files.len());
    for path in other_files {
        let absolute = root_dir.join(path);
        let digest = compendium_hash::hash_file(&absolute, algorithm)?;
        if !predecessor_output_digests.contains(&digest) {
            kept.push(path.clone());
        }
    }
    Ok(kept)
}

/// Filter 2: apply ordered data-source rules. The first matching rule wins;
/// files excluded this way move into `unpacked_files` rather than the bundle.
fn data_source_filter(
    files: &[Utf8PathBuf],
    rules: &[compendium_types::DataSourceRule],
) -> Result<(Vec<Utf8PathBuf>, Vec<Utf8PathBuf>), BuilderError> {
    let compiled: Vec<(glob::Pattern, DataSourceAction)> = rules
        .iter()
        .map(|rule| {
            glob::Pattern::new(&rule.pattern)
                .map(|pattern| (pattern, rule.action))
                .map_err(|source| BuilderError::InvalidPattern {
                    pattern: rule.pattern.clone(),
                    source,
                })
        })
        .collect::<Result<_, _>>()?;

    let mut kept = Vec::new();
    let mut unpacked = Vec::new();
    for file in files {
        let action = compiled
            .iter()
            .find(|(pattern, _)| pattern.matches(file.as_str()))
            .map(|(_, action)| *action);
        match action {
            Some(DataSourceAction::Exclude) => unpacked.push(file.clone()),
            Some(DataSourceAction::Include) | None => kept.push(file.clone()),
        }
    }
    Ok((kept, unpacked))
}

/// Filter 3: strip secret env var values from every run, recording which
/// names were redacted.
fn secret_scrubber(runs: &mut [Run], secret_env_vars: &[String]) -> Vec<String> {
    let mut redacted = BTreeSet::new();
    for run in runs.iter_mut() {
        for name in secret_env_vars {
            if run.environ.remove(name).is_some() {
                redacted.insert(name.clone());
            }
        }
    }
    redacted.into_iter().collect()
}

/// Seal the retained files into a `zstd`-compressed tar archive at
/// `bundle_path`, writing it via the write-to-temp-then-rename pattern
/// (grounded on `turborepo-cache::fs::FSCache::put`) so a crash mid-write
/// never leaves a corrupt bundle visible at its final path.
#[tracing::instrument(skip(files, root_dir))]
fn seal(
    files: &[Utf8PathBuf],
    root_dir: &Utf8Path,
    bundle_path: &Utf8Path,
    algorithm: Algorithm,
) -> Result<(Digest, Vec<(Utf8PathBuf, Digest)>), BuilderError> {
    let parent = bundle_path.parent().unwrap_or(Utf8Path::new("."));
    std::fs::create_dir_all(parent).map_err(|source| BuilderError::Io {
        path: parent.to_string(),
        source,
    })?;

    let temp_path = parent.join(format!(
        ".{}.{}.tmp",
        bundle_path
            .file_name()
            .unwrap_or("bundle.sealed"),
        std::process::id()
    ));

    let mut artifact_digests = Vec::with_capacity(files.len());
    {
        let temp_file = std::fs::File::create(&temp_path).map_err(|source| BuilderError::Io {
            path: temp_path.to_string(),
            source,
        })?;
        let encoder = zstd::Encoder::new(temp_file, 0).map_err(|source| BuilderError::Io {
            path: temp_path.to_string(),
            source,
        })?;
        let mut archive = tar::Builder::new(encoder);

        for file in files {
            let absolute = root_dir.join(file);
            let digest = compendium_hash::hash_file(&absolute, algorithm)?;
            archive
                .append_path_with_name(&absolute, file.as_str())
                .map_err(|source| BuilderError::Io {
                    path: absolute.to_string(),
                    source,
                })?;
            artifact_digests.push((file.clone(), digest));
        }

        let encoder = archive.into_inner().map_err(|source| BuilderError::Io {
            path: temp_path.to_string(),
            source,
        })?;
        let mut temp_file = encoder.finish().map_err(|source| BuilderError::Io {
            path: temp_path.to_string(),
            source,
        })?;
        temp_file.flush().map_err(|source| BuilderError::Io {
            path: temp_path.to_string(),
            source,
        })?;
    }

    std::fs::rename(&temp_path, bundle_path).map_err(|source| BuilderError::Io {
        path: bundle_path.to_string(),
        source,
    })?;

    let digest = compendium_hash::hash_file(bundle_path, algorithm)?;
    Ok((digest, artifact_digests))
}

fn write_manifest(
    manifest_path: &Utf8Path,
    manifest: &SealManifest,
) -> Result<(), BuilderError> {
    let json = serde_json::to_vec_pretty(manifest).expect("SealManifest is always serializable");
    let parent = manifest_path.parent().unwrap_or(Utf8Path::new("."));
    let temp_path = parent.join(format!(
        ".{}.{}.tmp",
        manifest_path.file_name().unwrap_or("manifest.json"),
        std::process::id()
    ));
    std::fs::write(&temp_path, &json).map_err(|source| BuilderError::Io {
        path: temp_path.to_string(),
        source,
    })?;
    std::fs::rename(&temp_path, manifest_path).map_err(|source| BuilderError::Io {
        path: manifest_path.to_string(),
        source,
    })?;
    Ok(())
}

/// Opaque stable identifier: a random base32 string. 16 characters drawn
/// from the RFC 4648 base32 alphabet give ~80 bits of entropy.
fn generate_name() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let mut rng = rand::thread_rng();
    (0..16)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Build a sealed compendium from a trace record.
///
/// `root_dir` is the trace's on-disk root (`TraceRecord::root_dir`);
/// `other_files` paths are relative to it. `predecessor_output_digests` is
/// the set of digests already produced as outputs by indexed predecessors,
/// used by the graph-dedup filter. `bundle_path` is where the sealed
/// archive is written; a `.manifest.json` sidecar is written alongside it.
#[tracing::instrument(skip(trace, config, predecessor_output_digests))]
pub fn build(
    mut trace: TraceRecord,
    config: &BuilderConfig,
    predecessor_output_digests: &BTreeSet<Digest>,
    bundle_path: &Utf8Path,
) -> Result<Compendium, BuilderError> {
    let algorithm = Algorithm::Sha256;
    let classified = classify(&trace, config)?;

    let deduped = graph_dedup_filter(
        &trace.other_files,
        &trace.root_dir,
        predecessor_output_digests,
        algorithm,
    )?;
    let (kept, mut unpacked_files) = data_source_filter(&deduped, &config.data_sources)?;
    let unpacked_environment_variables = secret_scrubber(&mut trace.runs, &config.secret_env_vars);
    unpacked_files.sort();

    let (bundle_digest, artifact_digests) =
        seal(&kept, &trace.root_dir, bundle_path, algorithm)?;

    let manifest = SealManifest {
        algorithm,
        external_inputs_required: BTreeSet::new(),
        unpacked_environment_variables: unpacked_environment_variables.clone(),
        artifact_digests,
    };
    let manifest_path = Utf8PathBuf::from(format!("{bundle_path}.manifest.json"));
    write_manifest(&manifest_path, &manifest)?;

    let inputs = classified
        .inputs
        .iter()
        .map(|path| {
            let digest = compendium_hash::hash_file(&trace.root_dir.join(path), algorithm)?;
            Ok(FileRef::new(path.clone(), digest))
        })
        .collect::<Result<Vec<_>, BuilderError>>()?;
    let outputs = classified
        .outputs
        .iter()
        .map(|path| {
            let digest = compendium_hash::hash_file(&trace.root_dir.join(path), algorithm)?;
            Ok(FileRef::new(path.clone(), digest))
        })
        .collect::<Result<Vec<_>, BuilderError>>()?;

    let command_digest = compendium_hash::hash_command(&classified.command, algorithm);

    Ok(Compendium {
        name: generate_name(),
        command: classified.command,
        command_digest,
        bundle: BundleRef {
            path: bundle_path.to_path_buf(),
            digest: bundle_digest,
            algorithm,
        },
        inputs,
        outputs,
        external_inputs_required: BTreeSet::new(),
        unpacked_files,
        unpacked_environment_variables,
        status: Status::Updated,
        updated_at: Timestamp(0),
        command_config: CommandConfig::default(),
    })
}
