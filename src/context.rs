// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Per-invocation flow state.
//!
//! A [`FlowContext`] is created once per call to
//! [`crate::registry::FlowRegistry::execute`] and lives exactly as long as
//! that invocation: services, the deadline, the cancellation signal, the
//! keyed node-outcome table, and the explain collector handle all scope to
//! it. Nothing here outlives the call.

use crate::cancel::CancellationToken;
use crate::error::{Error, Result};
use crate::explain::ExplainCollector;
use crate::memo::RequestMemo;
use crate::module::{BoxedAny, Services};
use crate::outcome::{Outcome, OutcomeKind};
use parking_lot::Mutex;
use std::any::TypeId;
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct NodeOutcomeEntry {
    out_type: TypeId,
    out_type_name: &'static str,
    kind: OutcomeKind,
    code: String,
    value: Option<BoxedAny>,
}

/// Per-invocation state shared by every node dispatch and every module
/// execution within a single flow invocation.
pub struct FlowContext {
    services: Services,
    deadline: Instant,
    cancel: CancellationToken,
    node_outcomes: Mutex<HashMap<String, NodeOutcomeEntry>>,
    explain: ExplainCollector,
    config_version: Option<u64>,
    memo: RequestMemo,
}

impl FlowContext {
    pub fn new(services: Services, deadline: Instant, cancel: CancellationToken, explain: ExplainCollector) -> Self {
        Self { services, deadline, cancel, node_outcomes: Mutex::new(HashMap::new()), explain, config_version: None, memo: RequestMemo::new() }
    }

    /// A `FlowContext` with no caller-supplied services, a generous
    /// deadline, and a cancellation token that is never triggered. Intended
    /// for unit tests exercising a single module or node in isolation.
    pub fn for_test() -> Self {
        Self::new(
            Services::new(),
            Instant::now() + Duration::from_secs(60),
            CancellationToken::never(),
            ExplainCollector::new(crate::explain::ExplainLevel::Detailed),
        )
    }

    pub fn with_config_version(mut self, version: u64) -> Self {
        self.config_version = Some(version);
        self
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time remaining before the deadline, `Duration::ZERO` if it has
    /// already elapsed.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_deadline_expired(&self) -> bool {
        self.remaining() == Duration::ZERO
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn explain(&self) -> &ExplainCollector {
        &self.explain
    }

    /// Per-invocation single-flight cache shared by every node dispatch
    /// within this call.
    pub fn memo(&self) -> &RequestMemo {
        &self.memo
    }

    /// Accessor used by the explain collector's `Finish` step to capture
    /// whichever overlay configuration version was active for this
    /// invocation, if any.
    pub fn try_get_config_version(&self) -> Option<u64> {
        self.config_version
    }

    /// Record the outcome of a node. Fails if this node name already has a
    /// recorded outcome for this invocation — a programmer error (plans are
    /// walked once, each node dispatched exactly once).
    pub fn record_node_outcome<T>(&self, node_name: &str, outcome: Outcome<T>) -> Result<()>
    where
        T: Send + Sync + 'static,
    {
        let mut map = self.node_outcomes.lock();
        if map.contains_key(node_name) {
            return Err(Error::DuplicateNodeOutcome(node_name.to_string()));
        }
        let kind = outcome.kind();
        let code = outcome.code().to_string();
        let value = if kind.is_value_bearing() {
            Some(Box::new(outcome.into_value()) as BoxedAny)
        } else {
            None
        };
        map.insert(
            node_name.to_string(),
            NodeOutcomeEntry { out_type: TypeId::of::<T>(), out_type_name: std::any::type_name::<T>(), kind, code, value },
        );
        Ok(())
    }

    /// Type-erased counterpart of [`FlowContext::record_node_outcome`], used
    /// by [`crate::executor`] which dispatches nodes without a statically
    /// known output type. `out_type`/`out_type_name` stand in for
    /// `TypeId::of::<T>()`/`type_name::<T>()`.
    pub(crate) fn record_node_outcome_erased(&self, node_name: &str, out_type: TypeId, out_type_name: &'static str, outcome: Outcome<BoxedAny>) -> Result<()> {
        let mut map = self.node_outcomes.lock();
        if map.contains_key(node_name) {
            return Err(Error::DuplicateNodeOutcome(node_name.to_string()));
        }
        let kind = outcome.kind();
        let code = outcome.code().to_string();
        let value = if kind.is_value_bearing() { Some(outcome.into_value()) } else { None };
        map.insert(node_name.to_string(), NodeOutcomeEntry { out_type, out_type_name, kind, code, value });
        Ok(())
    }

    /// Type-checked read-back of a previously recorded node outcome.
    ///
    /// Returns `None` iff no outcome was recorded for `node_name`. Never
    /// returns a value for a non-value-bearing variant (`Error`, `Timeout`,
    /// `Skipped`, `Canceled`).
    ///
    /// # Panics
    /// Panics if an outcome was recorded under `node_name` with an output
    /// type other than `T` — reading a node's outcome as the wrong type is
    /// a programmer error, not a data-path condition.
    pub fn try_get_node_outcome<T>(&self, node_name: &str) -> Option<Outcome<T>>
    where
        T: Send + Sync + Clone + 'static,
    {
        let map = self.node_outcomes.lock();
        let entry = map.get(node_name)?;
        assert_eq!(
            entry.out_type,
            TypeId::of::<T>(),
            "type mismatch reading outcome of node '{node_name}': stored as {}, requested as {}",
            entry.out_type_name,
            std::any::type_name::<T>(),
        );
        Some(match entry.kind {
            OutcomeKind::Ok => Outcome::Ok(downcast_clone::<T>(entry.value.as_ref().expect("Ok entry has a value"))),
            OutcomeKind::Fallback => {
                Outcome::Fallback(downcast_clone::<T>(entry.value.as_ref().expect("Fallback entry has a value")), entry.code.clone())
            }
            OutcomeKind::Error => Outcome::Error(entry.code.clone()),
            OutcomeKind::Timeout => Outcome::Timeout(entry.code.clone()),
            OutcomeKind::Skipped => Outcome::Skipped(entry.code.clone()),
            OutcomeKind::Canceled => Outcome::Canceled(entry.code.clone()),
        })
    }

    /// Read back only the [`OutcomeKind`] and code of a recorded node
    /// outcome, without requiring the caller to know its value type. Used
    /// by conditional-node predicates and stage fold bookkeeping.
    pub fn node_outcome_kind(&self, node_name: &str) -> Option<(OutcomeKind, String)> {
        let map = self.node_outcomes.lock();
        map.get(node_name).map(|e| (e.kind, e.code.clone()))
    }
}

fn downcast_clone<T: Clone + Send + Sync + 'static>(value: &BoxedAny) -> T {
    value
        .downcast_ref::<T>()
        .expect("type identity already asserted by caller")
        .clone()
}
