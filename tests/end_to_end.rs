// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Scenario-level coverage driven entirely through the public API: a real
//! [`FlowRegistry`] registering a real blueprint and executing it, rather
//! than exercising `executor`/`memo`/`overlay` in isolation.

use async_trait::async_trait;
use dashflow_orchestrator::blueprint::{BlueprintNode, FlowBlueprintBuilder, ModuleNodeSpec};
use dashflow_orchestrator::catalog::{Lifetime, ModuleCatalog, ThreadSafety};
use dashflow_orchestrator::config::FlowEngineConfig;
use dashflow_orchestrator::module::{Module, ModuleContext, Services};
use dashflow_orchestrator::outcome::Outcome;
use dashflow_orchestrator::registry::FlowRegistry;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).try_init();
}

struct CountingEcho {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Module<String, String> for CountingEcho {
    async fn execute(&self, ctx: &ModuleContext<'_, String>) -> Outcome<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        Outcome::ok(ctx.args().clone())
    }
}

struct Sleepy(Duration);

#[async_trait]
impl Module<String, String> for Sleepy {
    async fn execute(&self, ctx: &ModuleContext<'_, String>) -> Outcome<String> {
        tokio::time::sleep(self.0).await;
        Outcome::ok(ctx.args().clone())
    }
}

// S4: two distinct nodes memoizing under the same key observe exactly one
// underlying module execution.
#[tokio::test]
async fn s4_two_nodes_sharing_a_memo_key_single_flight() {
    init_tracing();
    let calls = Arc::new(AtomicU32::new(0));
    let catalog = Arc::new(ModuleCatalog::new());
    {
        let calls = calls.clone();
        catalog
            .register::<String, String, _, _, fn(&String) -> Result<(), Box<dyn std::error::Error + Send + Sync>>>(
                "counting_echo",
                move |_: &Services| Ok(CountingEcho { calls: calls.clone() }),
                None,
                Lifetime::Transient,
                ThreadSafety::Safe,
            )
            .unwrap();
    }

    let registry = FlowRegistry::new(catalog, FlowEngineConfig::default());
    let blueprint = FlowBlueprintBuilder::new()
        .node(BlueprintNode::Module(
            ModuleNodeSpec::new::<String, String>("n1", "counting_echo", "shared".to_string()).with_memo_key::<String>(|_| "same-key".to_string()),
        ))
        .node(BlueprintNode::Module(
            ModuleNodeSpec::new::<String, String>("n2", "counting_echo", "shared".to_string()).with_memo_key::<String>(|_| "same-key".to_string()),
        ))
        .respond_with("n1")
        .build();
    registry.register::<String, String>("dedup", blueprint).unwrap();

    let (outcome, _explain) = registry.execute::<String, String>("dedup", "shared".to_string(), HashMap::new(), None, None).await.unwrap();
    assert_eq!(outcome, Outcome::Ok("shared".to_string()));
    assert_eq!(calls.load(Ordering::SeqCst), 1, "both nodes should have shared a single underlying execution");
}

// S5: an overlay-configured concurrency ceiling of one rejects a second
// concurrent invocation of the same module type with module_concurrency_limited.
#[tokio::test]
async fn s5_overlay_configured_limiter_rejects_second_concurrent_call() {
    init_tracing();
    let catalog = Arc::new(ModuleCatalog::new());
    catalog
        .register::<String, String, _, _, fn(&String) -> Result<(), Box<dyn std::error::Error + Send + Sync>>>(
            "sleepy",
            |_: &Services| Ok(Sleepy(Duration::from_millis(80))),
            None,
            Lifetime::Transient,
            ThreadSafety::Safe,
        )
        .unwrap();

    let registry = Arc::new(FlowRegistry::new(catalog, FlowEngineConfig::default()));
    let blueprint = FlowBlueprintBuilder::new()
        .node(BlueprintNode::Module(ModuleNodeSpec::new::<String, String>("n1", "sleepy", "x".to_string())))
        .respond_with("n1")
        .build();
    registry.register::<String, String>("slow", blueprint).unwrap();
    registry
        .set_overlay(&json!({
            "schemaVersion": "v1",
            "limits": { "moduleConcurrency": { "maxInFlight": { "sleepy": 1 } } }
        }))
        .unwrap();

    let first = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.execute::<String, String>("slow", "a".to_string(), HashMap::new(), None, None).await.unwrap() })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    let (second_outcome, _) = registry.execute::<String, String>("slow", "b".to_string(), HashMap::new(), None, None).await.unwrap();
    let (first_outcome, _) = first.await.unwrap();

    assert_eq!(first_outcome, Outcome::Ok("a".to_string()));
    assert_eq!(second_outcome, Outcome::Error("module_concurrency_limited".to_string()));
}

// S6: applying an overlay that changes a stage module's `use`/`with`
// against a blueprint with no stages at all reports no applied changes; a
// registry actually composed of a stage reports the diff in its ExecExplain.
#[tokio::test]
async fn s6_overlay_diff_surfaces_in_exec_explain() {
    init_tracing();
    use dashflow_orchestrator::blueprint::{GateSelector, StageNodeSpec, StageSlotSpec};

    let catalog = Arc::new(ModuleCatalog::new());
    catalog
        .register::<String, String, _, _, fn(&String) -> Result<(), Box<dyn std::error::Error + Send + Sync>>>(
            "counting_echo",
            |_: &Services| Ok(CountingEcho { calls: Arc::new(AtomicU32::new(0)) }),
            None,
            Lifetime::Transient,
            ThreadSafety::Safe,
        )
        .unwrap();

    let registry = FlowRegistry::new(catalog, FlowEngineConfig::default());
    let slot = StageSlotSpec::new::<String>("m1", "counting_echo", "x".to_string(), 0, GateSelector::always_enabled());
    let blueprint = FlowBlueprintBuilder::new().node(BlueprintNode::Stage(StageNodeSpec::new::<String>("s1", vec![slot]))).respond_with("s1").build();
    registry.register::<String, String>("rank", blueprint).unwrap();

    registry
        .set_overlay(&json!({
            "schemaVersion": "v1",
            "flows": {
                "rank": {
                    "stages": {
                        "s1": {
                            "modules": [
                                { "id": "m1", "with": { "boost": 2 } },
                                { "id": "m2", "use": "counting_echo" }
                            ]
                        }
                    }
                }
            }
        }))
        .unwrap();

    let (_outcome, explain) = registry.execute::<String, String>("rank", "x".to_string(), HashMap::new(), None, None).await.unwrap();

    let kinds: Vec<_> = explain.overlays_applied.iter().map(|a| (a.module_id.as_str(), a.kind)).collect();
    assert!(kinds.contains(&("m1", dashflow_orchestrator::overlay::OverlayChangeKind::WithChanged)));
    assert!(kinds.contains(&("m2", dashflow_orchestrator::overlay::OverlayChangeKind::Added)));
}
