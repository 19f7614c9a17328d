// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Flow executor — walks a compiled plan and dispatches every node.
//!
//! The executor never knows a flow's concrete request/response types: it
//! operates entirely on [`crate::compiler::CompiledNode`] and records
//! outcomes into [`crate::context::FlowContext`] type-erased. Reading the
//! response back out by its concrete type is [`crate::registry::FlowRegistry`]'s
//! job, once the plan has finished.

use crate::blueprint::{GateDecision, GateSelectorInput, ModuleNodeSpec, StageNodeSpec, StageSlotSpec};
use crate::catalog::ModuleCatalog;
use crate::compiler::{CompiledNode, PlanTemplate};
use crate::context::FlowContext;
use crate::explain::ExplainStageModule;
use crate::limiter::ConcurrencyLimiter;
use crate::module::{BoxedAny, DynModule};
use crate::outcome::{Outcome, OutcomeKind};
use futures::future::join_all;
use futures::FutureExt;
use rand::Rng;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

/// Per-invocation dependencies the executor needs beyond the [`FlowContext`]
/// itself: the catalog modules are created from, the limiter admission
/// counters are scoped by, and the resolved stage overlay / variant
/// assignment gates read from.
pub(crate) struct FlowExecutor<'a> {
    pub catalog: &'a ModuleCatalog,
    pub limiter: &'a ConcurrencyLimiter,
    pub flow_name: &'a str,
    pub overlay: &'a crate::overlay::PatchOverlay,
    pub variants: &'a HashMap<String, String>,
}

impl<'a> FlowExecutor<'a> {
    /// Walk every top-level node of `plan` in order, recursing into
    /// conditional branches as their predicates select them.
    pub async fn run(&self, plan: &PlanTemplate, ctx: &FlowContext) -> crate::error::Result<()> {
        self.run_nodes(&plan.nodes, ctx).await
    }

    async fn run_nodes(&self, nodes: &[CompiledNode], ctx: &FlowContext) -> crate::error::Result<()> {
        for node in nodes {
            if ctx.is_cancelled() || ctx.is_deadline_expired() {
                // A node that never dispatches leaves no outcome recorded;
                // callers reading it back via try_get_node_outcome see None,
                // which is indistinguishable from "not yet reached" — correct,
                // since the invocation is already winding down.
                continue;
            }
            match node {
                CompiledNode::Module { index, spec } => self.dispatch_module(*index, spec, ctx).await?,
                CompiledNode::Stage { index, spec } => self.dispatch_stage(*index, spec, ctx).await?,
                CompiledNode::Conditional { index, name, predicate, then_branch, else_branch } => {
                    let start = Instant::now();
                    let take_then = predicate(ctx);
                    let end = Instant::now();
                    ctx.explain().record_node(*index, OutcomeKind::Ok, "OK".to_string(), start, end);
                    ctx.record_node_outcome_erased(name, std::any::TypeId::of::<()>(), "()", Outcome::ok(Box::new(()) as BoxedAny))?;
                    if take_then {
                        Box::pin(self.run_nodes(then_branch, ctx)).await?;
                    } else {
                        Box::pin(self.run_nodes(else_branch, ctx)).await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn dispatch_module(&self, index: usize, spec: &ModuleNodeSpec, ctx: &FlowContext) -> crate::error::Result<()> {
        let start = Instant::now();
        let handle = self.catalog.create_dyn(&spec.module_type, ctx.services())?;
        let memo_key = spec.memo_key.as_ref().map(|f| f(spec.args.as_ref()));
        let args = spec.args.clone();

        let outcome = match memo_key {
            Some(memo_key) => {
                let cloning_handle = handle.clone();
                let clone_boxed = move |v: &BoxedAny| cloning_handle.clone_boxed(v);
                let compute_handle = handle.clone();
                let compute_args = args.clone();
                let module_type = spec.module_type.clone();
                let node_name = spec.name.clone();
                ctx.memo()
                    .get_or_compute_dyn(&spec.module_type, &memo_key, spec.out_type, false, clone_boxed, || {
                        execute_module_once(self.limiter, &module_type, &node_name, &module_type, compute_handle, compute_args, ctx)
                    })
                    .await
                    .unwrap_or_else(|err| Outcome::error(format!("memo_error:{err}")))
            }
            None => execute_module_once(self.limiter, &spec.module_type, &spec.name, &spec.module_type, handle, args, ctx).await,
        };

        let end = Instant::now();
        ctx.explain().record_node(index, outcome.kind(), outcome.code().to_string(), start, end);
        ctx.record_node_outcome_erased(&spec.name, spec.out_type, spec.out_type_name, outcome)?;
        Ok(())
    }

    async fn dispatch_stage(&self, index: usize, spec: &StageNodeSpec, ctx: &FlowContext) -> crate::error::Result<()> {
        let start = Instant::now();
        let overlay = self.overlay.stage_overlay(self.flow_name, &spec.name);

        let mut decisions: Vec<(usize, &StageSlotSpec, GateDecision)> = spec
            .slots
            .iter()
            .enumerate()
            .map(|(decl_index, slot)| {
                let input = GateSelectorInput { overlay, variants: self.variants };
                (decl_index, slot, slot.gate.evaluate(&input))
            })
            .collect();

        // Group by priority, descending, stable by declared order within a bucket.
        decisions.sort_by(|a, b| b.1.priority.cmp(&a.1.priority).then(a.0.cmp(&b.0)));

        let mut priorities: Vec<i32> = decisions.iter().map(|(_, slot, _)| slot.priority).collect();
        priorities.dedup();

        // For each bucket: the first Enabled slot becomes a live candidate,
        // any remaining Enabled slots in that bucket become unconditional
        // (100%) shadow candidates alongside every explicit Shadow slot.
        let mut live_candidates: Vec<(usize, &StageSlotSpec)> = Vec::new();
        let mut shadow_candidates: Vec<(usize, &StageSlotSpec, u32)> = Vec::new();
        let mut inert: Vec<(usize, &StageSlotSpec, GateDecision)> = Vec::new();

        for priority in priorities {
            let mut bucket_live_taken = false;
            for (decl_index, slot, decision) in decisions.iter().filter(|(_, slot, _)| slot.priority == priority) {
                match decision {
                    GateDecision::Enabled if !bucket_live_taken => {
                        bucket_live_taken = true;
                        live_candidates.push((*decl_index, slot));
                    }
                    GateDecision::Enabled => {
                        shadow_candidates.push((*decl_index, slot, 10_000));
                    }
                    GateDecision::Shadow { sample_bps } => {
                        shadow_candidates.push((*decl_index, slot, *sample_bps));
                    }
                    GateDecision::Disabled(_) | GateDecision::Overridden { .. } => {
                        inert.push((*decl_index, slot, decision.clone()));
                    }
                }
            }
        }

        for (_, slot, decision) in &inert {
            ctx.explain().record_stage_module(ExplainStageModule {
                stage_index: index,
                stage_name: spec.name.clone(),
                module_id: slot.module_id.clone(),
                priority: slot.priority,
                gate_decision_code: decision.code().to_string(),
                selector_name: slot.gate.name().to_string(),
                is_shadow: false,
                shadow_sample_bps: None,
                is_override: matches!(decision, GateDecision::Overridden { .. }),
                outcome_kind: None,
                code: None,
                start_ms: None,
                end_ms: None,
            });
        }

        let mut executed: Vec<(i32, Outcome<BoxedAny>)> = Vec::new();
        let mut stage_value: Option<Outcome<BoxedAny>> = None;
        let mut reached_end = false;

        for (pos, (_, slot)) in live_candidates.iter().enumerate() {
            let slot_start = Instant::now();
            let outcome = execute_module_once(self.limiter, &slot.module_type, &slot.module_id, &slot.module_type, self.catalog.create_dyn(&slot.module_type, ctx.services())?, slot.args.clone(), ctx).await;
            let slot_end = Instant::now();

            ctx.explain().record_stage_module(ExplainStageModule {
                stage_index: index,
                stage_name: spec.name.clone(),
                module_id: slot.module_id.clone(),
                priority: slot.priority,
                gate_decision_code: "enabled".to_string(),
                selector_name: slot.gate.name().to_string(),
                is_shadow: false,
                shadow_sample_bps: None,
                is_override: false,
                outcome_kind: Some(outcome.kind()),
                code: Some(outcome.code().to_string()),
                start_ms: Some(ctx.explain().elapsed_ms(slot_start)),
                end_ms: Some(ctx.explain().elapsed_ms(slot_end)),
            });

            if outcome.is_value_bearing() {
                stage_value = Some(outcome);
                reached_end = pos + 1 < live_candidates.len();
                break;
            }
            executed.push((slot.priority, outcome));
        }

        // Live candidates never reached because an earlier one already
        // produced a value-bearing outcome run as shadow instead.
        if stage_value.is_some() && reached_end {
            let consumed = executed.len() + 1;
            for (_, slot) in live_candidates.iter().skip(consumed) {
                shadow_candidates.push((0, slot, 10_000));
            }
        }

        let stage_outcome = match stage_value {
            Some(outcome) => outcome,
            None => {
                let best = executed.iter().filter(|(_, o)| o.kind() != OutcomeKind::Skipped).max_by_key(|(priority, _)| *priority);
                match best {
                    Some((_, outcome)) => outcome.clone(),
                    None => Outcome::skipped("stage_all_skipped"),
                }
            }
        };

        self.run_shadows(index, &spec.name, shadow_candidates, ctx).await;

        let end = Instant::now();
        ctx.explain().record_node(index, stage_outcome.kind(), stage_outcome.code().to_string(), start, end);
        ctx.record_node_outcome_erased(&spec.name, spec.out_type, spec.out_type_name, stage_outcome)?;
        Ok(())
    }

    async fn run_shadows(&self, stage_index: usize, stage_name: &str, candidates: Vec<(usize, &StageSlotSpec, u32)>, ctx: &FlowContext) {
        let futures = candidates.into_iter().map(|(_, slot, sample_bps)| {
            let sampled = sample_bps >= 10_000 || rand::thread_rng().gen_range(0..10_000) < sample_bps;
            async move {
                if !sampled {
                    ctx.explain().record_stage_module(ExplainStageModule {
                        stage_index,
                        stage_name: stage_name.to_string(),
                        module_id: slot.module_id.clone(),
                        priority: slot.priority,
                        gate_decision_code: "shadow".to_string(),
                        selector_name: slot.gate.name().to_string(),
                        is_shadow: true,
                        shadow_sample_bps: Some(sample_bps),
                        is_override: false,
                        outcome_kind: None,
                        code: None,
                        start_ms: None,
                        end_ms: None,
                    });
                    return;
                }

                let Ok(handle) = self.catalog.create_dyn(&slot.module_type, ctx.services()) else { return };
                let start = Instant::now();
                let outcome = execute_module_once(self.limiter, &slot.module_type, &slot.module_id, &slot.module_type, handle, slot.args.clone(), ctx).await;
                let end = Instant::now();

                ctx.explain().record_stage_module(ExplainStageModule {
                    stage_index,
                    stage_name: stage_name.to_string(),
                    module_id: slot.module_id.clone(),
                    priority: slot.priority,
                    gate_decision_code: "shadow".to_string(),
                    selector_name: slot.gate.name().to_string(),
                    is_shadow: true,
                    shadow_sample_bps: Some(sample_bps),
                    is_override: false,
                    outcome_kind: Some(outcome.kind()),
                    code: Some(outcome.code().to_string()),
                    start_ms: Some(ctx.explain().elapsed_ms(start)),
                    end_ms: Some(ctx.explain().elapsed_ms(end)),
                });
            }
        });
        join_all(futures).await;
    }
}

/// One module invocation attempt: limiter admission, deadline/cancellation
/// race, and panic containment, shared by module nodes, stage live slots,
/// and stage shadow slots alike.
async fn execute_module_once(
    limiter: &ConcurrencyLimiter,
    limiter_key: &str,
    module_id: &str,
    module_type: &str,
    handle: Arc<dyn DynModule>,
    args: Arc<dyn std::any::Any + Send + Sync>,
    ctx: &FlowContext,
) -> Outcome<BoxedAny> {
    if ctx.is_cancelled() {
        return Outcome::canceled("cancelled");
    }
    if ctx.is_deadline_expired() {
        return Outcome::timeout("deadline");
    }

    let Some(_lease) = limiter.try_enter(limiter_key) else {
        tracing::warn!(module_type, module_id, "module concurrency limit reached");
        return Outcome::error("module_concurrency_limited");
    };

    let remaining = ctx.remaining();
    let exec = AssertUnwindSafe(handle.execute_dyn(module_id, module_type, args.as_ref(), ctx)).catch_unwind();

    tokio::select! {
        biased;
        _ = ctx.cancel_token().cancelled() => Outcome::canceled("cancelled"),
        _ = tokio::time::sleep(remaining) => Outcome::timeout("deadline"),
        result = exec => match result {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(module_type, module_id, "module panicked");
                Outcome::error("module_fault:panic")
            }
        },
    }
}
