// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! A request-flow orchestrator: executes per-request computation described
//! as a declarative blueprint of pluggable modules.
//!
//! A [`blueprint::FlowBlueprint`] names module types and wires them into
//! ordinary nodes, stages (gated fan-out with live/shadow dispatch), and
//! conditionals. [`registry::FlowRegistry`] compiles a blueprint against a
//! [`catalog::ModuleCatalog`] once at registration time and, from then on,
//! only ever walks the resulting plan. Every node produces an
//! [`outcome::Outcome`] rather than failing the whole invocation: degraded
//! responses, timeouts, and skipped work are first-class results, not
//! exceptions.
//!
//! ```no_run
//! use dashflow_orchestrator::blueprint::{BlueprintNode, FlowBlueprintBuilder, ModuleNodeSpec};
//! use dashflow_orchestrator::catalog::{Lifetime, ModuleCatalog, ThreadSafety};
//! use dashflow_orchestrator::config::FlowEngineConfig;
//! use dashflow_orchestrator::module::{Module, ModuleContext, Services};
//! use dashflow_orchestrator::outcome::Outcome;
//! use dashflow_orchestrator::registry::FlowRegistry;
//! use std::sync::Arc;
//!
//! struct Greeter;
//!
//! #[async_trait::async_trait]
//! impl Module<String, String> for Greeter {
//!     async fn execute(&self, ctx: &ModuleContext<'_, String>) -> Outcome<String> {
//!         Outcome::ok(format!("hello, {}", ctx.args()))
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let catalog = Arc::new(ModuleCatalog::new());
//! catalog.register::<String, String, _, _, fn(&String) -> Result<(), Box<dyn std::error::Error + Send + Sync>>>(
//!     "greeter",
//!     |_: &Services| Ok(Greeter),
//!     None,
//!     Lifetime::Transient,
//!     ThreadSafety::Safe,
//! ).unwrap();
//!
//! let registry = FlowRegistry::new(catalog, FlowEngineConfig::default());
//! let blueprint = FlowBlueprintBuilder::new()
//!     .node(BlueprintNode::Module(ModuleNodeSpec::new::<String, String>("greet", "greeter", "world".to_string())))
//!     .respond_with("greet")
//!     .build();
//! registry.register::<String, String>("greeting", blueprint).unwrap();
//!
//! let (outcome, _explain) = registry
//!     .execute::<String, String>("greeting", "world".to_string(), Default::default(), None, None)
//!     .await
//!     .unwrap();
//! assert_eq!(outcome, Outcome::ok("hello, world".to_string()));
//! # });
//! ```

pub mod blueprint;
pub mod cancel;
pub mod catalog;
pub mod compiler;
pub mod config;
pub mod context;
pub mod error;
pub mod explain;
pub mod limiter;
pub mod memo;
pub mod module;
pub mod outcome;
pub mod overlay;
pub mod registry;

mod executor;

pub use blueprint::{BlueprintNode, ConditionalNodeSpec, FlowBlueprint, FlowBlueprintBuilder, ModuleNodeSpec, StageNodeSpec, StageSlotSpec};
pub use config::{FlowEngineConfig, FlowEngineConfigBuilder};
pub use context::FlowContext;
pub use error::{Error, Result};
pub use module::{Module, ModuleContext, Services};
pub use outcome::{Outcome, OutcomeKind};
pub use registry::FlowRegistry;
