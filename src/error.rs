// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Error taxonomy.
//!
//! Per the two-layer error model: everything in this module is a
//! *programmer* error — misuse of the API that should fail fast at the call
//! site. Data-path failures (a module reporting a problem, a deadline
//! elapsing, a cancellation) never become an [`Error`]; they are carried as
//! [`crate::outcome::Outcome`] variants instead.

use crate::compiler::ValidationReport;

/// Result alias used throughout the crate for fallible, call-site-fatal
/// operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Programmer-error taxonomy.
///
/// None of these variants are ever produced by a module execution; they
/// indicate a mistake in how the orchestrator itself is being used
/// (duplicate registration, unknown names, signature mismatches, malformed
/// overlay documents).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid registration: {0}")]
    InvalidRegistration(String),

    #[error("module type '{0}' is not registered")]
    UnknownModuleType(String),

    #[error("flow '{0}' is not registered")]
    UnknownFlow(String),

    #[error(
        "signature mismatch for '{name}': registered as ({registered_args}, {registered_out}), \
         requested as ({requested_args}, {requested_out})"
    )]
    SignatureMismatch {
        name: String,
        registered_args: &'static str,
        registered_out: &'static str,
        requested_args: &'static str,
        requested_out: &'static str,
    },

    #[error("module type '{0}' is already registered")]
    DuplicateModuleRegistration(String),

    #[error("flow '{0}' is already registered")]
    DuplicateFlowRegistration(String),

    #[error("node '{0}' already has a recorded outcome for this invocation")]
    DuplicateNodeOutcome(String),

    #[error("unsupported patch schema version '{0}'")]
    UnsupportedPatchSchema(String),

    #[error("patch format error at {path}: {message}")]
    PatchFormatError { path: String, message: String },

    #[error("blueprint failed to compile: {count} error finding(s)", count = .0.error_count())]
    CompileError(ValidationReport),

    #[error("factory for module type '{module_type}' failed: {source}")]
    CatalogError {
        module_type: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("cyclic memoized dependency detected for key '{0}'")]
    CyclicMemo(String),

    #[error(
        "flow '{name}' registered with (req={registered_req}, resp={registered_resp}), \
         requested as (req={requested_req}, resp={requested_resp})"
    )]
    FlowSignatureMismatch {
        name: String,
        registered_req: &'static str,
        registered_resp: &'static str,
        requested_req: &'static str,
        requested_resp: &'static str,
    },
}
