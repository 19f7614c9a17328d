// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Module contract: the unit of computation bound into a plan node.
//!
//! A [`Module`] executes exactly one attempt given a [`ModuleContext`] and
//! returns an [`Outcome`]. Expected failures are reported as `Outcome`
//! variants; a module must not panic for conditions it can anticipate. The
//! executor converts any panic or returned `Err` from the surrounding glue
//! into `Outcome::Error("module_fault:<code>")`.

use crate::context::FlowContext;
use crate::outcome::Outcome;
use async_trait::async_trait;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// Opaque, per-execution bundle handed to a module.
///
/// Borrows the owning [`FlowContext`] so a module can read services, the
/// deadline, the cancellation signal, and prior node outcomes, and can push
/// structured explain data for nested work it performs.
pub struct ModuleContext<'a, Args> {
    module_id: &'a str,
    module_type: &'a str,
    args: &'a Args,
    flow: &'a FlowContext,
}

impl<'a, Args> ModuleContext<'a, Args> {
    pub fn new(module_id: &'a str, module_type: &'a str, args: &'a Args, flow: &'a FlowContext) -> Self {
        Self { module_id, module_type, args, flow }
    }

    pub fn module_id(&self) -> &str {
        self.module_id
    }

    pub fn module_type(&self) -> &str {
        self.module_type
    }

    pub fn args(&self) -> &Args {
        self.args
    }

    pub fn flow(&self) -> &FlowContext {
        self.flow
    }
}

/// A pluggable unit of computation bound into a [`crate::blueprint::BlueprintNode`].
///
/// Implementations are registered into a [`crate::catalog::ModuleCatalog`]
/// under a type name and created there for each node that names that type.
#[async_trait]
pub trait Module<Args, Out>: Send + Sync
where
    Args: Send + Sync + 'static,
    Out: Clone + Send + Sync + 'static,
{
    async fn execute(&self, ctx: &ModuleContext<'_, Args>) -> Outcome<Out>;
}

/// Type-erased value used to move args and results through the catalog and
/// executor without each node's concrete types infecting the plan's
/// storage types.
pub type BoxedAny = Box<dyn Any + Send + Sync>;

/// Caller-supplied services bag, handed to module factories at creation
/// time. Keyed by `TypeId` so callers can store arbitrary typed services
/// (HTTP clients, datastores, clocks) without the orchestrator needing to
/// know their concrete types.
#[derive(Default, Clone)]
pub struct Services {
    inner: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Services {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) -> &mut Self {
        self.inner.insert(TypeId::of::<T>(), Arc::new(value));
        self
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.inner.get(&TypeId::of::<T>()).and_then(|v| v.clone().downcast::<T>().ok())
    }
}

/// Type-erased counterpart of [`Module`], used internally by the catalog so
/// entries of differing `(Args, Out)` pairs can share one storage table.
///
/// Not exposed outside the crate: user code only ever implements the typed
/// [`Module`] trait; [`crate::catalog::ModuleAdapter`] bridges the two.
#[async_trait]
pub(crate) trait DynModule: Send + Sync {
    async fn execute_dyn(
        &self,
        module_id: &str,
        module_type: &str,
        args: &(dyn Any + Send + Sync),
        flow: &FlowContext,
    ) -> Outcome<BoxedAny>;

    fn args_type_id(&self) -> TypeId;
    fn out_type_id(&self) -> TypeId;
    fn args_type_name(&self) -> &'static str;
    fn out_type_name(&self) -> &'static str;

    /// Clone an erased `Out` value produced by this module. `value` must
    /// have been produced by this same module (or another registered under
    /// the same `(Args, Out)` pair) — callers are expected to have already
    /// confirmed `out_type_id()` matches. The sole reason this exists on the
    /// trait is that `BoxedAny` itself carries no `Clone` impl; only the
    /// concrete adapter that closes over `Out: Clone` can provide one.
    fn clone_boxed(&self, value: &BoxedAny) -> BoxedAny;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn services_round_trip_typed_value() {
        let mut services = Services::new();
        services.insert(42u32);
        services.insert("hello".to_string());

        assert_eq!(*services.get::<u32>().unwrap(), 42);
        assert_eq!(*services.get::<String>().unwrap(), "hello");
        assert!(services.get::<i64>().is_none());
    }
}
