//! Shared vocabulary for the compendium pipeline graph and execution engine.
//!
//! Every other crate in this workspace depends on this one for the digest,
//! file-reference, and compendium-record types, plus the error
//! classification trait used to give every crate's error enum a consistent
//! exit code and abort/retry policy.

pub mod classification;
pub mod compendium;
pub mod config;
pub mod digest;
pub mod file_ref;

pub use classification::{Classify, ErrorClassification};
pub use compendium::{BundleRef, CommandConfig, CommandSplitter, Compendium, Status, Timestamp};
pub use config::{BuilderConfig, DataSourceAction, DataSourceRule, SchedulerMode, parse_env_file};
pub use digest::{Algorithm, Digest};
pub use file_ref::FileRef;
