// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Flow registry — stores compiled plans keyed by flow name and drives
//! execution against them.
//!
//! Registration compiles a blueprint against the catalog exactly once;
//! [`FlowRegistry::execute`] only ever walks the cached [`PlanTemplate`],
//! never re-validating the blueprint on the hot path.

use crate::blueprint::FlowBlueprint;
use crate::cancel::CancellationToken;
use crate::catalog::ModuleCatalog;
use crate::compiler::{self, PlanTemplate};
use crate::config::FlowEngineConfig;
use crate::context::FlowContext;
use crate::error::{Error, Result};
use crate::executor::FlowExecutor;
use crate::explain::{ExecExplain, ExplainCollector, PlanExplain};
use crate::limiter::ConcurrencyLimiter;
use crate::module::Services;
use crate::outcome::Outcome;
use crate::overlay::{self, PatchOverlay};
use parking_lot::RwLock;
use serde_json::Value;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

struct FlowEntry {
    plan: Arc<PlanTemplate>,
    base_composition: HashMap<String, HashMap<String, String>>,
    req_type: TypeId,
    req_type_name: &'static str,
    resp_type: TypeId,
    resp_type_name: &'static str,
}

/// Typed home for every compiled flow, plus the shared catalog, limiter, and
/// overlay configuration every execution reads from.
pub struct FlowRegistry {
    catalog: Arc<ModuleCatalog>,
    config: FlowEngineConfig,
    flows: dashmap::DashMap<String, FlowEntry>,
    limiter: ConcurrencyLimiter,
    overlay: RwLock<Arc<PatchOverlay>>,
    config_version: AtomicU64,
}

impl FlowRegistry {
    pub fn new(catalog: Arc<ModuleCatalog>, config: FlowEngineConfig) -> Self {
        Self {
            catalog,
            config,
            flows: dashmap::DashMap::new(),
            limiter: ConcurrencyLimiter::new(),
            overlay: RwLock::new(Arc::new(PatchOverlay::empty())),
            config_version: AtomicU64::new(0),
        }
    }

    pub fn catalog(&self) -> &ModuleCatalog {
        &self.catalog
    }

    /// Compile `blueprint` against this registry's catalog and register it
    /// under `flow_name`. Fails if `flow_name` is already registered or the
    /// blueprint does not compile.
    pub fn register<Req, Resp>(&self, flow_name: impl Into<String>, blueprint: FlowBlueprint) -> Result<()>
    where
        Req: Send + Sync + 'static,
        Resp: Send + Sync + Clone + 'static,
    {
        let flow_name = flow_name.into();
        if self.flows.contains_key(&flow_name) {
            return Err(Error::DuplicateFlowRegistration(flow_name));
        }

        let base_composition = overlay::base_composition(&flow_name, &blueprint);
        let plan = compiler::compile(flow_name.clone(), blueprint, &self.catalog).map_err(Error::CompileError)?;

        tracing::debug!(flow_name = %flow_name, plan_hash = plan.plan_hash, "flow registered");

        self.flows.insert(
            flow_name,
            FlowEntry {
                plan: Arc::new(plan),
                base_composition,
                req_type: TypeId::of::<Req>(),
                req_type_name: std::any::type_name::<Req>(),
                resp_type: TypeId::of::<Resp>(),
                resp_type_name: std::any::type_name::<Resp>(),
            },
        );
        Ok(())
    }

    /// Replace the active patch overlay, bumping the configuration version
    /// and reconfiguring the concurrency limiter. Readers already mid
    /// invocation keep the snapshot they took at entry.
    pub fn set_overlay(&self, raw: &Value) -> Result<()> {
        let resolved = overlay::evaluate(raw)?;
        let version = self.config_version.fetch_add(1, Ordering::AcqRel) + 1;
        self.limiter.ensure_configured(&resolved.module_concurrency_limits, version);
        *self.overlay.write() = Arc::new(resolved);
        tracing::info!(config_version = version, "overlay reconfigured");
        Ok(())
    }

    /// Execute `flow_name` against `request`, returning its response outcome
    /// and the trace collected for the invocation.
    ///
    /// `deadline` defaults to `now + config.default_deadline` when `None`.
    /// `cancel` defaults to a token that is never triggered when `None`.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute<Req, Resp>(
        &self,
        flow_name: &str,
        request: Req,
        variants: HashMap<String, String>,
        cancel: Option<CancellationToken>,
        deadline: Option<Instant>,
    ) -> Result<(Outcome<Resp>, ExecExplain)>
    where
        Req: Send + Sync + 'static,
        Resp: Send + Sync + Clone + 'static,
    {
        let entry = self.flows.get(flow_name).ok_or_else(|| Error::UnknownFlow(flow_name.to_string()))?;
        if entry.req_type != TypeId::of::<Req>() || entry.resp_type != TypeId::of::<Resp>() {
            return Err(Error::FlowSignatureMismatch {
                name: flow_name.to_string(),
                registered_req: entry.req_type_name,
                registered_resp: entry.resp_type_name,
                requested_req: std::any::type_name::<Req>(),
                requested_resp: std::any::type_name::<Resp>(),
            });
        }
        let plan = entry.plan.clone();
        let base_composition = entry.base_composition.clone();
        drop(entry);

        let mut services = Services::new();
        services.insert(request);

        let cancel = cancel.unwrap_or_else(CancellationToken::never);
        let deadline = deadline.unwrap_or_else(|| Instant::now() + self.config.default_deadline);
        let explain = ExplainCollector::new(self.config.default_explain_level);
        explain.start(flow_name, plan.plan_hash, &plan.node_summaries);

        let config_version = self.config_version.load(Ordering::Acquire);
        let ctx = FlowContext::new(services, deadline, cancel, explain).with_config_version(config_version);

        let overlay_snapshot = self.overlay.read().clone();
        let overlay_applied = overlay::applied_against_base(flow_name, &overlay_snapshot, &base_composition);
        ctx.explain().set_overlays_applied(overlay_applied);
        ctx.explain().set_variants(variants.clone());

        let executor = FlowExecutor { catalog: &self.catalog, limiter: &self.limiter, flow_name, overlay: &overlay_snapshot, variants: &variants };
        let span = tracing::info_span!("flow_execute", flow_name, plan_hash = plan.plan_hash);
        let _guard = span.enter();
        executor.run(&plan, &ctx).await?;
        drop(_guard);

        let response_outcome = match ctx.try_get_node_outcome::<Resp>(&plan.response_node) {
            Some(outcome) if outcome.kind() != crate::outcome::OutcomeKind::Skipped => outcome,
            _ => Outcome::error(format!("flow_no_response:{}", plan.response_node)),
        };

        let exec_explain = ctx.explain().finish(ctx.try_get_config_version());
        Ok((response_outcome, exec_explain))
    }

    /// Return the static, pre-execution outline of `flow_name`'s compiled
    /// plan.
    pub fn explain(&self, flow_name: &str) -> Result<PlanExplain> {
        let entry = self.flows.get(flow_name).ok_or_else(|| Error::UnknownFlow(flow_name.to_string()))?;
        Ok(PlanExplain { flow_name: entry.plan.flow_name.clone(), plan_hash: entry.plan.plan_hash, nodes: entry.plan.node_summaries.clone() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::{BlueprintNode, FlowBlueprintBuilder, ModuleNodeSpec};
    use crate::catalog::{Lifetime, ThreadSafety};
    use crate::module::{Module, ModuleContext};
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl Module<String, String> for Echo {
        async fn execute(&self, ctx: &ModuleContext<'_, String>) -> Outcome<String> {
            Outcome::ok(ctx.args().clone())
        }
    }

    fn registry_with_echo_flow() -> FlowRegistry {
        let catalog = Arc::new(ModuleCatalog::new());
        catalog
            .register::<String, String, _, _, fn(&String) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>>(
                "echo",
                |_: &Services| Ok(Echo),
                None,
                Lifetime::Transient,
                ThreadSafety::Safe,
            )
            .unwrap();

        let registry = FlowRegistry::new(catalog, FlowEngineConfig::default());
        let blueprint = FlowBlueprintBuilder::new()
            .node(BlueprintNode::Module(ModuleNodeSpec::new::<String, String>("n1", "echo", "unused".to_string())))
            .respond_with("n1")
            .build();
        registry.register::<String, String>("greet", blueprint).unwrap();
        registry
    }

    #[tokio::test]
    async fn execute_returns_response_and_explain() {
        let registry = registry_with_echo_flow();
        let (outcome, explain) = registry.execute::<String, String>("greet", "unused".to_string(), HashMap::new(), None, None).await.unwrap();
        assert_eq!(outcome, Outcome::Ok("unused".to_string()));
        assert_eq!(explain.flow_name, "greet");
        assert_eq!(explain.nodes.len(), 1);
    }

    #[tokio::test]
    async fn unknown_flow_is_an_error() {
        let registry = registry_with_echo_flow();
        let result = registry.execute::<String, String>("missing", "x".to_string(), HashMap::new(), None, None).await;
        assert!(matches!(result, Err(Error::UnknownFlow(_))));
    }

    #[tokio::test]
    async fn signature_mismatch_on_execute_is_rejected() {
        let registry = registry_with_echo_flow();
        let result = registry.execute::<u32, String>("greet", 1, HashMap::new(), None, None).await;
        assert!(matches!(result, Err(Error::FlowSignatureMismatch { .. })));
    }

    #[test]
    fn duplicate_flow_registration_fails() {
        let catalog = Arc::new(ModuleCatalog::new());
        catalog
            .register::<String, String, _, _, fn(&String) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>>(
                "echo",
                |_: &Services| Ok(Echo),
                None,
                Lifetime::Transient,
                ThreadSafety::Safe,
            )
            .unwrap();
        let registry = FlowRegistry::new(catalog, FlowEngineConfig::default());
        let build = || {
            FlowBlueprintBuilder::new()
                .node(BlueprintNode::Module(ModuleNodeSpec::new::<String, String>("n1", "echo", "x".to_string())))
                .respond_with("n1")
                .build()
        };
        registry.register::<String, String>("f", build()).unwrap();
        let second = registry.register::<String, String>("f", build());
        assert!(matches!(second, Err(Error::DuplicateFlowRegistration(_))));
    }

    #[test]
    fn explain_reports_plan_outline_before_execution() {
        let registry = registry_with_echo_flow();
        let outline = registry.explain("greet").unwrap();
        assert_eq!(outline.nodes.len(), 1);
        assert_eq!(outline.nodes[0].name, "n1");
    }

    // A response node whose own outcome is Skipped (e.g. a stage that ends
    // all-skipped) must fold to Error("flow_no_response:..."), not pass the
    // Skipped outcome through to the caller.
    #[tokio::test]
    async fn skipped_response_node_folds_to_flow_no_response_error() {
        use crate::blueprint::{GateSelector, StageNodeSpec, StageSlotSpec};

        let catalog = Arc::new(ModuleCatalog::new());
        catalog
            .register::<String, String, _, _, fn(&String) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>>(
                "echo",
                |_: &Services| Ok(Echo),
                None,
                Lifetime::Transient,
                ThreadSafety::Safe,
            )
            .unwrap();

        let registry = FlowRegistry::new(catalog, FlowEngineConfig::default());
        let disabled_gate = GateSelector::new("always_disabled", |_| crate::blueprint::GateDecision::Disabled("gated_off".to_string()));
        let slot = StageSlotSpec::new::<String>("m1", "echo", "x".to_string(), 0, disabled_gate);
        let blueprint = FlowBlueprintBuilder::new().node(BlueprintNode::Stage(StageNodeSpec::new::<String>("s1", vec![slot]))).respond_with("s1").build();
        registry.register::<String, String>("all_skipped", blueprint).unwrap();

        let (outcome, _explain) = registry.execute::<String, String>("all_skipped", "x".to_string(), HashMap::new(), None, None).await.unwrap();
        assert_eq!(outcome, Outcome::Error("flow_no_response:s1".to_string()));
    }
}
