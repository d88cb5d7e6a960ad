//! Error classification shared across every compendium crate.
//!
//! Grounded on `turborepo-errors::classification`: a small enum mapping each
//! error kind to an exit code and a few yes/no questions a caller (or a CLI
//! front-end, out of scope here) needs answered without inspecting the error
//! variant itself.

use std::fmt;

/// The error taxonomy shared across every compendium crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClassification {
    /// Empty command, malformed env pair, unknown data-source action,
    /// missing required parameter.
    InputValidation,
    /// Cycle would form, duplicate name, reference to unknown vertex.
    GraphInvariant,
    /// Index-out-of-date for an operation that requires a clean graph.
    State,
    /// Bundle digest mismatch, input digest mismatch.
    Integrity,
    /// Tracer unavailable/aborted, sandbox setup failed, reproduction
    /// failed or timed out.
    External,
    /// Persistence read/write, serialization failure.
    Io,
}

impl ErrorClassification {
    /// Exit codes for a CLI front-end: 0 success; 2 validation error; 3
    /// graph-out-of-date; 4 reproduction failure; 5 integrity failure.
    /// External/I/O errors that aren't specifically a reproduction failure
    /// share exit code 1, the generic failure code.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorClassification::InputValidation => 2,
            ErrorClassification::GraphInvariant => 2,
            ErrorClassification::State => 3,
            ErrorClassification::Integrity => 5,
            ErrorClassification::External => 4,
            ErrorClassification::Io => 1,
        }
    }

    /// Whether the index/bundle store was left untouched by this error.
    /// Input-validation and graph-invariant errors surface synchronously;
    /// state and integrity errors abort and roll back. External/I/O errors
    /// attach to a `JobResult` and do not abort independent sub-graphs.
    pub fn aborts_operation(self) -> bool {
        matches!(
            self,
            ErrorClassification::State | ErrorClassification::Integrity
        )
    }

    pub fn category_name(self) -> &'static str {
        match self {
            ErrorClassification::InputValidation => "Input Validation",
            ErrorClassification::GraphInvariant => "Graph Invariant",
            ErrorClassification::State => "State",
            ErrorClassification::Integrity => "Integrity",
            ErrorClassification::External => "External",
            ErrorClassification::Io => "I/O",
        }
    }
}

impl fmt::Display for ErrorClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.category_name())
    }
}

/// Implemented by every crate's error enum so callers can route on kind
/// without matching every variant.
pub trait Classify {
    fn classify(&self) -> ErrorClassification;
}
