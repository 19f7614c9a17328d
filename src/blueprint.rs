// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Flow blueprint — the declarative graph a flow is authored as.
//!
//! A blueprint is pure data (plus a handful of boxed closures for gates,
//! memo keys, and conditional predicates): it names module types and binds
//! arguments, but never runs anything itself. [`crate::compiler`] turns it
//! into an executable [`crate::compiler::PlanTemplate`].

use crate::context::FlowContext;
use crate::overlay::ResolvedStageOverlay;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// Discriminant of a [`BlueprintNode`], also carried into explain records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum NodeKind {
    Module,
    Stage,
    Conditional,
}

/// Inputs available to a [`GateSelector`] when deciding a stage slot's fate.
pub struct GateSelectorInput<'a> {
    pub overlay: Option<&'a ResolvedStageOverlay>,
    pub variants: &'a HashMap<String, String>,
}

/// Outcome of evaluating a stage slot's gate.
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    /// Eligible to run on the live path.
    Enabled,
    /// Eligible to run only as shadow traffic, sampled at `sample_bps`
    /// (basis points, 0..=10000).
    Shadow { sample_bps: u32 },
    /// Not eligible to run at all.
    Disabled(String),
    /// Redirected: explain records this slot as overridden, but it does not
    /// itself execute — `to_module_id` names the slot that runs in its
    /// place.
    Overridden { to_module_id: String },
}

impl GateDecision {
    pub fn code(&self) -> &str {
        match self {
            GateDecision::Enabled => "enabled",
            GateDecision::Shadow { .. } => "shadow",
            GateDecision::Disabled(code) => code,
            GateDecision::Overridden { .. } => "overridden",
        }
    }
}

/// Named gate policy bound to a stage slot. The name is carried into
/// explain records so a trace can say *which* policy produced a decision.
#[derive(Clone)]
pub struct GateSelector {
    name: String,
    evaluate: Arc<dyn Fn(&GateSelectorInput<'_>) -> GateDecision + Send + Sync>,
}

impl GateSelector {
    pub fn new(name: impl Into<String>, evaluate: impl Fn(&GateSelectorInput<'_>) -> GateDecision + Send + Sync + 'static) -> Self {
        Self { name: name.into(), evaluate: Arc::new(evaluate) }
    }

    /// A selector that is always `Enabled`, for slots with no gating.
    pub fn always_enabled() -> Self {
        Self::new("always_enabled", |_| GateDecision::Enabled)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn evaluate(&self, input: &GateSelectorInput<'_>) -> GateDecision {
        (self.evaluate)(input)
    }
}

/// The (currently singular) policy by which a stage's live-slot outcomes
/// fold into one stage outcome, kept as a named type per the blueprint's
/// "fold policy" field even though only one policy is implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FoldPolicy {
    /// Run live slots in priority order; adopt the first value-bearing
    /// outcome. See [`crate::executor`] for the full algorithm.
    #[default]
    FirstValueBearing,
}

/// A single module bound into a stage, with its own priority and gate.
pub struct StageSlotSpec {
    pub module_id: String,
    pub module_type: String,
    pub(crate) args: Arc<dyn Any + Send + Sync>,
    pub(crate) args_type: TypeId,
    pub(crate) args_type_name: &'static str,
    pub priority: i32,
    pub gate: GateSelector,
}

impl StageSlotSpec {
    pub fn new<Args>(module_id: impl Into<String>, module_type: impl Into<String>, args: Args, priority: i32, gate: GateSelector) -> Self
    where
        Args: Send + Sync + 'static,
    {
        Self {
            module_id: module_id.into(),
            module_type: module_type.into(),
            args: Arc::new(args),
            args_type: TypeId::of::<Args>(),
            args_type_name: std::any::type_name::<Args>(),
            priority,
            gate,
        }
    }
}

/// A single ordinary node invoking one module.
pub struct ModuleNodeSpec {
    pub name: String,
    pub module_type: String,
    pub(crate) args: Arc<dyn Any + Send + Sync>,
    pub(crate) args_type: TypeId,
    pub(crate) args_type_name: &'static str,
    pub(crate) out_type: TypeId,
    pub(crate) out_type_name: &'static str,
    pub(crate) memo_key: Option<Arc<dyn Fn(&(dyn Any + Send + Sync)) -> String + Send + Sync>>,
}

impl ModuleNodeSpec {
    pub fn new<Args, Out>(name: impl Into<String>, module_type: impl Into<String>, args: Args) -> Self
    where
        Args: Send + Sync + 'static,
        Out: Clone + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            module_type: module_type.into(),
            args: Arc::new(args),
            args_type: TypeId::of::<Args>(),
            args_type_name: std::any::type_name::<Args>(),
            out_type: TypeId::of::<Out>(),
            out_type_name: std::any::type_name::<Out>(),
            memo_key: None,
        }
    }

    /// Attach a memo-key function: args are made available type-erased
    /// since this spec is stored in a plan alongside nodes of differing
    /// `Args` types, but the closure captures the concrete `Args` type at
    /// the call site.
    pub fn with_memo_key<Args: 'static>(mut self, key_fn: impl Fn(&Args) -> String + Send + Sync + 'static) -> Self {
        self.memo_key = Some(Arc::new(move |args: &(dyn Any + Send + Sync)| {
            let typed = args.downcast_ref::<Args>().expect("args type matches this node's own Args");
            key_fn(typed)
        }));
        self
    }
}

/// A stage node: fans out over gated module slots and folds their outcomes.
pub struct StageNodeSpec {
    pub name: String,
    pub slots: Vec<StageSlotSpec>,
    pub fold_policy: FoldPolicy,
    pub(crate) out_type: TypeId,
    pub(crate) out_type_name: &'static str,
}

impl StageNodeSpec {
    pub fn new<Out: Clone + Send + Sync + 'static>(name: impl Into<String>, slots: Vec<StageSlotSpec>) -> Self {
        Self {
            name: name.into(),
            slots,
            fold_policy: FoldPolicy::default(),
            out_type: TypeId::of::<Out>(),
            out_type_name: std::any::type_name::<Out>(),
        }
    }
}

/// A conditional node: evaluates a pure predicate over previously recorded
/// node outcomes and executes one of two sub-sequences.
pub struct ConditionalNodeSpec {
    pub name: String,
    pub(crate) predicate: Arc<dyn Fn(&FlowContext) -> bool + Send + Sync>,
    pub then_branch: Vec<BlueprintNode>,
    pub else_branch: Vec<BlueprintNode>,
}

impl ConditionalNodeSpec {
    pub fn new(
        name: impl Into<String>,
        predicate: impl Fn(&FlowContext) -> bool + Send + Sync + 'static,
        then_branch: Vec<BlueprintNode>,
        else_branch: Vec<BlueprintNode>,
    ) -> Self {
        Self { name: name.into(), predicate: Arc::new(predicate), then_branch, else_branch }
    }
}

/// One node in a flow blueprint.
pub enum BlueprintNode {
    Module(ModuleNodeSpec),
    Stage(StageNodeSpec),
    Conditional(ConditionalNodeSpec),
}

impl BlueprintNode {
    pub fn name(&self) -> &str {
        match self {
            BlueprintNode::Module(m) => &m.name,
            BlueprintNode::Stage(s) => &s.name,
            BlueprintNode::Conditional(c) => &c.name,
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            BlueprintNode::Module(_) => NodeKind::Module,
            BlueprintNode::Stage(_) => NodeKind::Stage,
            BlueprintNode::Conditional(_) => NodeKind::Conditional,
        }
    }
}

/// Declarative graph of nodes composing a flow, plus the name of the node
/// whose outcome becomes the flow's response.
pub struct FlowBlueprint {
    pub nodes: Vec<BlueprintNode>,
    pub response_node: String,
}

/// Fluent construction of a [`FlowBlueprint`] from its nodes and response
/// node name.
#[derive(Default)]
pub struct FlowBlueprintBuilder {
    nodes: Vec<BlueprintNode>,
    response_node: Option<String>,
}

impl FlowBlueprintBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(mut self, node: BlueprintNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn respond_with(mut self, node_name: impl Into<String>) -> Self {
        self.response_node = Some(node_name.into());
        self
    }

    /// # Panics
    /// Panics if `respond_with` was never called — every flow must
    /// designate a response node.
    pub fn build(self) -> FlowBlueprint {
        let response_node = self.response_node.expect("FlowBlueprintBuilder::respond_with must be called before build()");
        FlowBlueprint { nodes: self.nodes, response_node }
    }
}

