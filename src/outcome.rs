// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Outcome algebra — the tagged result every node and flow produces.
//!
//! An [`Outcome`] is never an `Err` in the `std::result::Result` sense:
//! failures that belong on the *data path* (a module degrading, a deadline
//! expiring, a gate disabling a slot) are outcomes, not errors. Only misuse
//! of the orchestrator's own API (see [`crate::error::Error`]) is surfaced
//! as a `Result`.

use serde::{Deserialize, Serialize};

/// Discriminant of an [`Outcome`], independent of any carried value.
///
/// Used wherever the value itself is irrelevant or has already been erased,
/// e.g. explain records and stage fold bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutcomeKind {
    Ok,
    Fallback,
    Error,
    Timeout,
    Skipped,
    Canceled,
}

impl OutcomeKind {
    /// Whether this kind carries a value (`Ok` or `Fallback`).
    pub fn is_value_bearing(self) -> bool {
        matches!(self, OutcomeKind::Ok | OutcomeKind::Fallback)
    }
}

/// Tagged result of a node or flow invocation.
///
/// Invariant: carries a value iff the variant is `Ok` or `Fallback`; `code`
/// is non-empty for every non-`Ok` variant and is exactly `"OK"` for `Ok`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum Outcome<T> {
    Ok(T),
    Fallback(T, String),
    Error(String),
    Timeout(String),
    Skipped(String),
    Canceled(String),
}

const OK_CODE: &str = "OK";

impl<T> Outcome<T> {
    /// Construct an `Ok` outcome. Code is implicitly `"OK"`.
    pub fn ok(value: T) -> Self {
        Outcome::Ok(value)
    }

    /// Construct a `Fallback` outcome carrying a degraded value.
    ///
    /// # Panics
    /// Panics if `code` is empty — an empty code is a programmer error, not
    /// a data-path condition a caller should need to handle.
    pub fn fallback(value: T, code: impl Into<String>) -> Self {
        let code = code.into();
        assert!(!code.is_empty(), "Outcome::Fallback code must be non-empty");
        Outcome::Fallback(value, code)
    }

    /// Construct an `Error` outcome.
    pub fn error(code: impl Into<String>) -> Self {
        let code = code.into();
        assert!(!code.is_empty(), "Outcome::Error code must be non-empty");
        Outcome::Error(code)
    }

    /// Construct a `Timeout` outcome.
    pub fn timeout(code: impl Into<String>) -> Self {
        let code = code.into();
        assert!(!code.is_empty(), "Outcome::Timeout code must be non-empty");
        Outcome::Timeout(code)
    }

    /// Construct a `Skipped` outcome.
    pub fn skipped(code: impl Into<String>) -> Self {
        let code = code.into();
        assert!(!code.is_empty(), "Outcome::Skipped code must be non-empty");
        Outcome::Skipped(code)
    }

    /// Construct a `Canceled` outcome.
    pub fn canceled(code: impl Into<String>) -> Self {
        let code = code.into();
        assert!(!code.is_empty(), "Outcome::Canceled code must be non-empty");
        Outcome::Canceled(code)
    }

    /// The outcome's discriminant, independent of any carried value.
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Outcome::Ok(_) => OutcomeKind::Ok,
            Outcome::Fallback(..) => OutcomeKind::Fallback,
            Outcome::Error(_) => OutcomeKind::Error,
            Outcome::Timeout(_) => OutcomeKind::Timeout,
            Outcome::Skipped(_) => OutcomeKind::Skipped,
            Outcome::Canceled(_) => OutcomeKind::Canceled,
        }
    }

    /// The outcome's code. `"OK"` for `Ok`, otherwise the carried code.
    pub fn code(&self) -> &str {
        match self {
            Outcome::Ok(_) => OK_CODE,
            Outcome::Fallback(_, code)
            | Outcome::Error(code)
            | Outcome::Timeout(code)
            | Outcome::Skipped(code)
            | Outcome::Canceled(code) => code,
        }
    }

    /// Whether this outcome carries a value (`Ok` or `Fallback`).
    pub fn is_value_bearing(&self) -> bool {
        self.kind().is_value_bearing()
    }

    /// Access the carried value.
    ///
    /// # Panics
    /// Panics if the variant is not value-bearing. Callers that need a
    /// fallible accessor should check [`Outcome::is_value_bearing`] first.
    pub fn value(&self) -> &T {
        match self {
            Outcome::Ok(v) | Outcome::Fallback(v, _) => v,
            _ => panic!("Outcome::value called on non-value-bearing variant {:?}", self.kind()),
        }
    }

    /// Consume the outcome, returning the carried value.
    ///
    /// # Panics
    /// Panics if the variant is not value-bearing.
    pub fn into_value(self) -> T {
        match self {
            Outcome::Ok(v) | Outcome::Fallback(v, _) => v,
            other => panic!("Outcome::into_value called on non-value-bearing variant {:?}", other.kind()),
        }
    }

    /// Map the carried value, if any, preserving variant and code.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Ok(v) => Outcome::Ok(f(v)),
            Outcome::Fallback(v, code) => Outcome::Fallback(f(v), code),
            Outcome::Error(code) => Outcome::Error(code),
            Outcome::Timeout(code) => Outcome::Timeout(code),
            Outcome::Skipped(code) => Outcome::Skipped(code),
            Outcome::Canceled(code) => Outcome::Canceled(code),
        }
    }
}
