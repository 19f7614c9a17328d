// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Explain collection — an optional, best-effort trace of one flow
//! invocation: which nodes ran, in what order, with what outcome, and
//! (at [`ExplainLevel::Detailed`]) which stage-module slots were gated in,
//! gated out, or shadowed.
//!
//! Collection never affects dispatch: the collector only records what
//! already happened. A `Summary`-level collector drops per-slot detail to
//! keep overhead near zero on hot paths that never inspect it.

use crate::blueprint::NodeKind;
use crate::outcome::OutcomeKind;
use crate::overlay::OverlayApplied;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

/// How much detail a collector retains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExplainLevel {
    /// Node-level outcomes only; no per-stage-module slot detail.
    Summary,
    /// Everything: node outcomes plus every stage slot's gate decision.
    Detailed,
}

/// Static description of one plan node, produced by [`crate::compiler`] and
/// fed to [`ExplainCollector::start`] so the collector can pre-size its
/// node table and report nodes that never ran (e.g. a conditional's
/// untaken branch) as absent rather than guessing.
#[derive(Debug, Clone)]
pub struct PlanNodeSummary {
    pub index: usize,
    pub kind: NodeKind,
    pub name: String,
    pub stage: Option<String>,
    pub module_type: Option<String>,
}

/// Recorded outcome of one node dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplainNode {
    pub index: usize,
    pub kind: NodeKind,
    pub name: String,
    pub stage: Option<String>,
    pub outcome_kind: Option<OutcomeKind>,
    pub code: Option<String>,
    pub start_ms: Option<u64>,
    pub end_ms: Option<u64>,
}

/// Recorded outcome of one stage-module slot, only ever populated at
/// [`ExplainLevel::Detailed`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplainStageModule {
    pub stage_index: usize,
    pub stage_name: String,
    pub module_id: String,
    pub priority: i32,
    pub gate_decision_code: String,
    pub selector_name: String,
    pub is_shadow: bool,
    pub shadow_sample_bps: Option<u32>,
    pub is_override: bool,
    pub outcome_kind: Option<OutcomeKind>,
    pub code: Option<String>,
    pub start_ms: Option<u64>,
    pub end_ms: Option<u64>,
}

/// Ahead-of-execution outline of a compiled plan, as returned by
/// [`crate::registry::FlowRegistry::explain`]: one [`PlanNodeSummary`] per
/// node, in plan-index order, with no outcome data (nothing has run yet).
#[derive(Debug, Clone)]
pub struct PlanExplain {
    pub flow_name: String,
    pub plan_hash: u64,
    pub nodes: Vec<PlanNodeSummary>,
}

/// The frozen trace of one flow invocation, as returned by
/// [`crate::registry::FlowRegistry::explain`] or attached to a response
/// when explain collection was requested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecExplain {
    pub flow_name: String,
    pub plan_hash: u64,
    pub start_ms: u64,
    pub end_ms: u64,
    pub config_version: Option<u64>,
    pub overlays_applied: Vec<OverlayApplied>,
    pub variants: HashMap<String, String>,
    pub qos_selected_tier: Option<String>,
    pub nodes: Vec<ExplainNode>,
    pub stage_modules: Vec<ExplainStageModule>,
}

struct CollectorState {
    flow_name: String,
    plan_hash: u64,
    started_at: Instant,
    nodes: Vec<ExplainNode>,
    stage_modules: Vec<ExplainStageModule>,
    overlays_applied: Vec<OverlayApplied>,
    variants: HashMap<String, String>,
    qos_selected_tier: Option<String>,
}

/// Accumulates one invocation's trace. Cheap to clone-free share via
/// `&ExplainCollector` since every mutation goes through an internal lock;
/// readers only ever see the frozen [`ExecExplain`] returned by
/// [`ExplainCollector::finish`].
pub struct ExplainCollector {
    level: ExplainLevel,
    created_at: Instant,
    state: Mutex<Option<CollectorState>>,
}

impl ExplainCollector {
    pub fn new(level: ExplainLevel) -> Self {
        Self { level, created_at: Instant::now(), state: Mutex::new(None) }
    }

    pub fn level(&self) -> ExplainLevel {
        self.level
    }

    pub(crate) fn elapsed_ms(&self, at: Instant) -> u64 {
        at.saturating_duration_since(self.created_at).as_millis() as u64
    }

    /// Begin collection for one invocation. `nodes` pre-populates the node
    /// table so nodes that never dispatch (an untaken conditional branch)
    /// still appear, with no outcome recorded.
    pub fn start(&self, flow_name: impl Into<String>, plan_hash: u64, nodes: &[PlanNodeSummary]) {
        let explain_nodes = nodes
            .iter()
            .map(|n| ExplainNode {
                index: n.index,
                kind: n.kind,
                name: n.name.clone(),
                stage: n.stage.clone(),
                outcome_kind: None,
                code: None,
                start_ms: None,
                end_ms: None,
            })
            .collect();
        let mut state = self.state.lock();
        *state = Some(CollectorState {
            flow_name: flow_name.into(),
            plan_hash,
            started_at: Instant::now(),
            nodes: explain_nodes,
            stage_modules: Vec::new(),
            overlays_applied: Vec::new(),
            variants: HashMap::new(),
            qos_selected_tier: None,
        });
    }

    /// Record one node's outcome by plan index. A no-op if collection was
    /// never started, or if `index` is out of range for the node table
    /// passed to `start` (both indicate a caller bug, not something the
    /// collector should ever panic over — it is always safe to skip
    /// tracing).
    pub fn record_node(&self, index: usize, outcome_kind: OutcomeKind, code: String, start: Instant, end: Instant) {
        let start_ms = self.elapsed_ms(start);
        let end_ms = self.elapsed_ms(end);
        let mut guard = self.state.lock();
        if let Some(state) = guard.as_mut() {
            if let Some(node) = state.nodes.get_mut(index) {
                node.outcome_kind = Some(outcome_kind);
                node.code = Some(code);
                node.start_ms = Some(start_ms);
                node.end_ms = Some(end_ms);
            }
        }
    }

    /// Record one stage-module slot's disposition. No-op at
    /// [`ExplainLevel::Summary`] or before `start`.
    #[allow(clippy::too_many_arguments)]
    pub fn record_stage_module(&self, entry: ExplainStageModule) {
        if self.level == ExplainLevel::Summary {
            return;
        }
        let mut guard = self.state.lock();
        if let Some(state) = guard.as_mut() {
            state.stage_modules.push(entry);
        }
    }

    pub fn set_overlays_applied(&self, applied: Vec<OverlayApplied>) {
        let mut guard = self.state.lock();
        if let Some(state) = guard.as_mut() {
            state.overlays_applied = applied;
        }
    }

    pub fn set_variants(&self, variants: HashMap<String, String>) {
        let mut guard = self.state.lock();
        if let Some(state) = guard.as_mut() {
            state.variants = variants;
        }
    }

    pub fn set_qos_selected_tier(&self, tier: impl Into<String>) {
        let mut guard = self.state.lock();
        if let Some(state) = guard.as_mut() {
            state.qos_selected_tier = Some(tier.into());
        }
    }

    /// Freeze the trace collected so far into an [`ExecExplain`].
    ///
    /// # Panics
    /// Panics if `start` was never called — finishing an explain that was
    /// never started is a caller bug.
    pub fn finish(&self, config_version: Option<u64>) -> ExecExplain {
        let guard = self.state.lock();
        let state = guard.as_ref().expect("ExplainCollector::finish called before start");
        ExecExplain {
            flow_name: state.flow_name.clone(),
            plan_hash: state.plan_hash,
            start_ms: self.elapsed_ms(state.started_at),
            end_ms: self.elapsed_ms(Instant::now()),
            config_version,
            overlays_applied: state.overlays_applied.clone(),
            variants: state.variants.clone(),
            qos_selected_tier: state.qos_selected_tier.clone(),
            nodes: state.nodes.clone(),
            stage_modules: state.stage_modules.clone(),
        }
    }
}
