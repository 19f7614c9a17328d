// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Module catalog — typed registry mapping a module type name to a factory.
//!
//! Every module a blueprint can name must first be registered here, along
//! with its lifetime (created fresh per node, or once and shared) and
//! thread-safety declaration (can the shared instance tolerate overlapping
//! executions).

use crate::context::FlowContext;
use crate::error::{Error, Result};
use crate::module::{BoxedAny, DynModule, Module, ModuleContext, Services};
use crate::outcome::Outcome;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry as DashEntry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// How long a created module instance lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifetime {
    /// A fresh instance is created for every [`ModuleCatalog::create`] call.
    Transient,
    /// One instance is created lazily, the first time it's needed, and
    /// shared by every subsequent invocation.
    Singleton,
}

/// Whether a module tolerates overlapping concurrent executions of the
/// same (singleton) instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadSafety {
    /// Safe to execute concurrently from multiple invocations.
    Safe,
    /// Overlapping executions must be serialized; a second caller arriving
    /// while the first is still in flight is rejected with
    /// `Outcome::Error("concurrency_violation")` rather than blocked.
    NotSafe,
}

type BoxedFactory =
    Box<dyn Fn(&Services) -> std::result::Result<Arc<dyn DynModule>, Box<dyn std::error::Error + Send + Sync>> + Send + Sync>;
type BoxedValidator =
    Box<dyn Fn(&(dyn Any + Send + Sync)) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> + Send + Sync>;

struct CatalogEntry {
    factory: BoxedFactory,
    validator: Option<BoxedValidator>,
    lifetime: Lifetime,
    thread_safety: ThreadSafety,
    args_type: TypeId,
    out_type: TypeId,
    args_type_name: &'static str,
    out_type_name: &'static str,
    singleton: Mutex<Option<Arc<dyn DynModule>>>,
}

/// Typed registry of module factories, keyed by module type name.
#[derive(Default)]
pub struct ModuleCatalog {
    entries: DashMap<String, Arc<CatalogEntry>>,
}

impl ModuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module type.
    ///
    /// Fails if `type_name` is empty or already registered. `factory` is
    /// invoked once per [`ModuleCatalog::create`] call for `Transient`
    /// modules, or exactly once (double-checked, under a per-entry gate)
    /// for `Singleton` modules.
    pub fn register<Args, Out, M, F, V>(
        &self,
        type_name: impl Into<String>,
        factory: F,
        validator: Option<V>,
        lifetime: Lifetime,
        thread_safety: ThreadSafety,
    ) -> Result<()>
    where
        Args: Send + Sync + 'static,
        Out: Clone + Send + Sync + 'static,
        M: Module<Args, Out> + 'static,
        F: Fn(&Services) -> std::result::Result<M, Box<dyn std::error::Error + Send + Sync>> + Send + Sync + 'static,
        V: Fn(&Args) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> + Send + Sync + 'static,
    {
        let type_name = type_name.into();
        if type_name.is_empty() {
            return Err(Error::InvalidRegistration("module type name must not be empty".into()));
        }

        let boxed_factory: BoxedFactory = Box::new(move |services| {
            let instance = factory(services)?;
            Ok(Arc::new(ModuleAdapter::<M, Args, Out> { inner: instance, _marker: PhantomData }) as Arc<dyn DynModule>)
        });

        let boxed_validator: Option<BoxedValidator> = validator.map(|v| -> BoxedValidator {
            Box::new(move |args: &(dyn Any + Send + Sync)| {
                let typed = args
                    .downcast_ref::<Args>()
                    .expect("args type already checked against catalog signature");
                v(typed)
            })
        });

        let entry = Arc::new(CatalogEntry {
            factory: boxed_factory,
            validator: boxed_validator,
            lifetime,
            thread_safety,
            args_type: TypeId::of::<Args>(),
            out_type: TypeId::of::<Out>(),
            args_type_name: std::any::type_name::<Args>(),
            out_type_name: std::any::type_name::<Out>(),
            singleton: Mutex::new(None),
        });

        match self.entries.entry(type_name.clone()) {
            DashEntry::Occupied(_) => Err(Error::DuplicateModuleRegistration(type_name)),
            DashEntry::Vacant(v) => {
                v.insert(entry);
                tracing::debug!(module_type = %type_name, lifetime = lifetime_dbg(lifetime), "module type registered");
                Ok(())
            }
        }
    }

    /// Create (or, for singletons, fetch) an instance of `type_name`,
    /// checked against the requested `(Args, Out)` type pair.
    pub fn create<Args, Out>(&self, type_name: &str, services: &Services) -> Result<TypedModuleHandle<Args, Out>>
    where
        Args: Send + Sync + 'static,
        Out: Clone + Send + Sync + 'static,
    {
        self.check_signature::<Args, Out>(type_name)?;
        let dyn_module = self.create_dyn(type_name, services)?;
        Ok(TypedModuleHandle::new(dyn_module))
    }

    fn check_signature<Args, Out>(&self, type_name: &str) -> Result<()>
    where
        Args: 'static,
        Out: 'static,
    {
        let entry = self.entries.get(type_name).ok_or_else(|| Error::UnknownModuleType(type_name.to_string()))?;
        let requested_args = TypeId::of::<Args>();
        let requested_out = TypeId::of::<Out>();
        if entry.args_type != requested_args || entry.out_type != requested_out {
            return Err(Error::SignatureMismatch {
                name: type_name.to_string(),
                registered_args: entry.args_type_name,
                registered_out: entry.out_type_name,
                requested_args: std::any::type_name::<Args>(),
                requested_out: std::any::type_name::<Out>(),
            });
        }
        Ok(())
    }

    /// Type-erased creation path used internally by the plan executor,
    /// which dispatches nodes without static `(Args, Out)` generics. The
    /// plan compiler has already checked every node's bound types against
    /// the catalog signature before the executor ever calls this.
    pub(crate) fn create_dyn(&self, type_name: &str, services: &Services) -> Result<Arc<dyn DynModule>> {
        let entry = self
            .entries
            .get(type_name)
            .ok_or_else(|| Error::UnknownModuleType(type_name.to_string()))?
            .clone();
        self.instantiate(type_name, &entry, services)
    }

    fn instantiate(&self, type_name: &str, entry: &Arc<CatalogEntry>, services: &Services) -> Result<Arc<dyn DynModule>> {
        let wrap = |m: Arc<dyn DynModule>| -> Arc<dyn DynModule> {
            match entry.thread_safety {
                ThreadSafety::Safe => m,
                ThreadSafety::NotSafe => Arc::new(NotSafeGuard::new(m)),
            }
        };

        match entry.lifetime {
            Lifetime::Transient => {
                let m = (entry.factory)(services)
                    .map_err(|source| Error::CatalogError { module_type: type_name.to_string(), source })?;
                Ok(wrap(m))
            }
            Lifetime::Singleton => {
                let mut guard = entry.singleton.lock();
                if let Some(existing) = guard.as_ref() {
                    return Ok(existing.clone());
                }
                let m = (entry.factory)(services)
                    .map_err(|source| Error::CatalogError { module_type: type_name.to_string(), source })?;
                let wrapped = wrap(m);
                *guard = Some(wrapped.clone());
                Ok(wrapped)
            }
        }
    }

    /// Run the registered args-validator for `type_name` against a bound
    /// args value, used by the plan compiler while resolving each
    /// module-bearing node. A no-op if no validator was registered.
    pub(crate) fn validate_args(&self, type_name: &str, args: &(dyn Any + Send + Sync)) -> Result<()> {
        let entry = self
            .entries
            .get(type_name)
            .ok_or_else(|| Error::UnknownModuleType(type_name.to_string()))?;
        if let Some(validator) = &entry.validator {
            validator(args).map_err(|source| Error::CatalogError { module_type: type_name.to_string(), source })?;
        }
        Ok(())
    }

    /// Internal reflection used by the plan compiler to resolve a node's
    /// `(Args, Out)` type identity ahead of execution.
    pub(crate) fn signature(&self, type_name: &str) -> Option<(TypeId, TypeId, &'static str, &'static str)> {
        self.entries
            .get(type_name)
            .map(|e| (e.args_type, e.out_type, e.args_type_name, e.out_type_name))
    }

    pub(crate) fn contains(&self, type_name: &str) -> bool {
        self.entries.contains_key(type_name)
    }

    /// Start a fluent, multi-module registration session.
    pub fn builder() -> ModuleCatalogBuilder {
        ModuleCatalogBuilder::default()
    }
}

/// Fluent alternative to repeated [`ModuleCatalog::register`] calls, in the
/// `X::builder()....build()` style used throughout this lineage
/// (`AppArchitecture::builder()`, `GraphManifest::builder()`). Registrations
/// are queued as boxed thunks since each `register` call is generic over a
/// distinct `(Args, Out, M)` triple that can't be stored in one `Vec`
/// directly, then applied in order against a fresh catalog on `build()`.
#[derive(Default)]
pub struct ModuleCatalogBuilder {
    registrations: Vec<Box<dyn FnOnce(&ModuleCatalog) -> Result<()>>>,
}

impl ModuleCatalogBuilder {
    /// Queue a module registration. Errors (empty type name, duplicate
    /// type) surface from `build()`, not here.
    pub fn module<Args, Out, M, F, V>(
        mut self,
        type_name: impl Into<String>,
        factory: F,
        validator: Option<V>,
        lifetime: Lifetime,
        thread_safety: ThreadSafety,
    ) -> Self
    where
        Args: Send + Sync + 'static,
        Out: Clone + Send + Sync + 'static,
        M: Module<Args, Out> + 'static,
        F: Fn(&Services) -> std::result::Result<M, Box<dyn std::error::Error + Send + Sync>> + Send + Sync + 'static,
        V: Fn(&Args) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> + Send + Sync + 'static,
    {
        let type_name = type_name.into();
        self.registrations
            .push(Box::new(move |catalog: &ModuleCatalog| catalog.register::<Args, Out, M, F, V>(type_name, factory, validator, lifetime, thread_safety)));
        self
    }

    /// Apply every queued registration to a fresh catalog, in the order
    /// they were added. Fails on the first registration error.
    pub fn build(self) -> Result<ModuleCatalog> {
        let catalog = ModuleCatalog::new();
        for register in self.registrations {
            register(&catalog)?;
        }
        Ok(catalog)
    }
}

fn lifetime_dbg(lifetime: Lifetime) -> &'static str {
    match lifetime {
        Lifetime::Transient => "transient",
        Lifetime::Singleton => "singleton",
    }
}

/// Typed handle over a created module instance, bridging back from the
/// catalog's type-erased storage to the caller's concrete `(Args, Out)`.
pub struct TypedModuleHandle<Args, Out> {
    inner: Arc<dyn DynModule>,
    _marker: PhantomData<fn(Args) -> Out>,
}

impl<Args, Out> TypedModuleHandle<Args, Out>
where
    Args: Send + Sync + 'static,
    Out: Clone + Send + Sync + 'static,
{
    fn new(inner: Arc<dyn DynModule>) -> Self {
        Self { inner, _marker: PhantomData }
    }

    pub async fn execute(&self, module_id: &str, module_type: &str, args: &Args, flow: &FlowContext) -> Outcome<Out> {
        let erased = self.inner.execute_dyn(module_id, module_type, args, flow).await;
        erased.map(|boxed| {
            *boxed
                .downcast::<Out>()
                .expect("out type already checked at ModuleCatalog::create")
        })
    }
}

struct ModuleAdapter<M, Args, Out> {
    inner: M,
    _marker: PhantomData<fn(Args) -> Out>,
}

#[async_trait]
impl<M, Args, Out> DynModule for ModuleAdapter<M, Args, Out>
where
    M: Module<Args, Out>,
    Args: Send + Sync + 'static,
    Out: Clone + Send + Sync + 'static,
{
    async fn execute_dyn(
        &self,
        module_id: &str,
        module_type: &str,
        args: &(dyn Any + Send + Sync),
        flow: &FlowContext,
    ) -> Outcome<BoxedAny> {
        let typed_args = args
            .downcast_ref::<Args>()
            .expect("args type already checked at ModuleCatalog::create");
        let ctx = ModuleContext::new(module_id, module_type, typed_args, flow);
        self.inner.execute(&ctx).await.map(|out| Box::new(out) as BoxedAny)
    }

    fn args_type_id(&self) -> TypeId {
        TypeId::of::<Args>()
    }

    fn out_type_id(&self) -> TypeId {
        TypeId::of::<Out>()
    }

    fn args_type_name(&self) -> &'static str {
        std::any::type_name::<Args>()
    }

    fn out_type_name(&self) -> &'static str {
        std::any::type_name::<Out>()
    }

    fn clone_boxed(&self, value: &BoxedAny) -> BoxedAny {
        Box::new(
            value
                .downcast_ref::<Out>()
                .expect("out type already checked by caller")
                .clone(),
        )
    }
}

/// Wraps a singleton, non-thread-safe module so overlapping executions are
/// rejected rather than silently corrupting shared state.
struct NotSafeGuard {
    inner: Arc<dyn DynModule>,
    in_use: AtomicBool,
}

impl NotSafeGuard {
    fn new(inner: Arc<dyn DynModule>) -> Self {
        Self { inner, in_use: AtomicBool::new(false) }
    }
}

#[async_trait]
impl DynModule for NotSafeGuard {
    async fn execute_dyn(
        &self,
        module_id: &str,
        module_type: &str,
        args: &(dyn Any + Send + Sync),
        flow: &FlowContext,
    ) -> Outcome<BoxedAny> {
        if self.in_use.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            tracing::warn!(module_type, module_id, "rejected overlapping execution of non-thread-safe singleton");
            return Outcome::error("concurrency_violation");
        }
        struct ReleaseOnDrop<'a>(&'a AtomicBool);
        impl Drop for ReleaseOnDrop<'_> {
            fn drop(&mut self) {
                self.0.store(false, Ordering::Release);
            }
        }
        let _release = ReleaseOnDrop(&self.in_use);
        self.inner.execute_dyn(module_id, module_type, args, flow).await
    }

    fn args_type_id(&self) -> TypeId {
        self.inner.args_type_id()
    }

    fn out_type_id(&self) -> TypeId {
        self.inner.out_type_id()
    }

    fn args_type_name(&self) -> &'static str {
        self.inner.args_type_name()
    }

    fn out_type_name(&self) -> &'static str {
        self.inner.out_type_name()
    }

    fn clone_boxed(&self, value: &BoxedAny) -> BoxedAny {
        self.inner.clone_boxed(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::FlowContext;
    use std::sync::atomic::AtomicU32;

    struct Echo;

    #[async_trait]
    impl Module<String, String> for Echo {
        async fn execute(&self, ctx: &ModuleContext<'_, String>) -> Outcome<String> {
            Outcome::ok(ctx.args().clone())
        }
    }

    fn noop_validator(_: &String) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }

    #[tokio::test]
    async fn register_and_create_transient() {
        let catalog = ModuleCatalog::new();
        catalog
            .register::<String, String, _, _, _>(
                "echo",
                |_services: &Services| Ok(Echo),
                Some(noop_validator),
                Lifetime::Transient,
                ThreadSafety::Safe,
            )
            .unwrap();

        let handle = catalog.create::<String, String>("echo", &Services::new()).unwrap();
        let flow = FlowContext::for_test();
        let outcome = handle.execute("n1", "echo", &"hi".to_string(), &flow).await;
        assert_eq!(outcome, Outcome::ok("hi".to_string()));
    }

    #[tokio::test]
    async fn builder_registers_every_queued_module() {
        let catalog = ModuleCatalog::builder()
            .module::<String, String, _, _, _>("echo", |_: &Services| Ok(Echo), Some(noop_validator), Lifetime::Transient, ThreadSafety::Safe)
            .module::<String, String, _, _, fn(&String) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>>(
                "echo2",
                |_: &Services| Ok(Echo),
                None,
                Lifetime::Singleton,
                ThreadSafety::Safe,
            )
            .build()
            .unwrap();

        assert!(catalog.contains("echo"));
        assert!(catalog.contains("echo2"));
        let handle = catalog.create::<String, String>("echo2", &Services::new()).unwrap();
        let flow = FlowContext::for_test();
        let outcome = handle.execute("n1", "echo2", &"hi".to_string(), &flow).await;
        assert_eq!(outcome, Outcome::ok("hi".to_string()));
    }

    #[tokio::test]
    async fn builder_surfaces_first_registration_error() {
        let result = ModuleCatalog::builder()
            .module::<String, String, _, _, fn(&String) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>>(
                "",
                |_: &Services| Ok(Echo),
                None,
                Lifetime::Transient,
                ThreadSafety::Safe,
            )
            .build();
        assert!(matches!(result, Err(Error::InvalidRegistration(_))));
    }

    #[test]
    fn duplicate_registration_fails() {
        let catalog = ModuleCatalog::new();
        catalog
            .register::<String, String, _, _, fn(&String) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>>(
                "echo",
                |_: &Services| Ok(Echo),
                None,
                Lifetime::Transient,
                ThreadSafety::Safe,
            )
            .unwrap();
        let second = catalog
            .register::<String, String, _, _, fn(&String) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>>(
                "echo",
                |_: &Services| Ok(Echo),
                None,
                Lifetime::Transient,
                ThreadSafety::Safe,
            );
        assert!(matches!(second, Err(Error::DuplicateModuleRegistration(_))));
    }

    #[test]
    fn empty_name_rejected() {
        let catalog = ModuleCatalog::new();
        let result = catalog
            .register::<String, String, _, _, fn(&String) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>>(
                "",
                |_: &Services| Ok(Echo),
                None,
                Lifetime::Transient,
                ThreadSafety::Safe,
            );
        assert!(matches!(result, Err(Error::InvalidRegistration(_))));
    }

    #[test]
    fn signature_mismatch_rejected() {
        let catalog = ModuleCatalog::new();
        catalog
            .register::<String, String, _, _, fn(&String) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>>(
                "echo",
                |_: &Services| Ok(Echo),
                None,
                Lifetime::Transient,
                ThreadSafety::Safe,
            )
            .unwrap();
        let result = catalog.create::<u32, String>("echo", &Services::new());
        assert!(matches!(result, Err(Error::SignatureMismatch { .. })));
    }

    struct CountingSingleton {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Module<(), u32> for CountingSingleton {
        async fn execute(&self, _ctx: &ModuleContext<'_, ()>) -> Outcome<u32> {
            Outcome::ok(self.calls.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }

    #[tokio::test]
    async fn singleton_created_once_and_shared() {
        let catalog = ModuleCatalog::new();
        let creations = Arc::new(AtomicU32::new(0));
        let creations_clone = creations.clone();
        catalog
            .register::<(), u32, _, _, fn(&()) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>>(
                "counter",
                move |_: &Services| {
                    creations_clone.fetch_add(1, Ordering::SeqCst);
                    Ok(CountingSingleton { calls: Arc::new(AtomicU32::new(0)) })
                },
                None,
                Lifetime::Singleton,
                ThreadSafety::Safe,
            )
            .unwrap();

        let services = Services::new();
        let h1 = catalog.create::<(), u32>("counter", &services).unwrap();
        let h2 = catalog.create::<(), u32>("counter", &services).unwrap();
        let flow = FlowContext::for_test();
        let _ = h1.execute("n1", "counter", &(), &flow).await;
        let _ = h2.execute("n2", "counter", &(), &flow).await;

        assert_eq!(creations.load(Ordering::SeqCst), 1);
    }

    struct Blocking {
        gate: tokio::sync::Barrier,
    }

    #[async_trait]
    impl Module<(), ()> for Blocking {
        async fn execute(&self, _ctx: &ModuleContext<'_, ()>) -> Outcome<()> {
            // Hold "in use" across an await point so a concurrent caller observes it.
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            let _ = &self.gate;
            Outcome::ok(())
        }
    }

    #[tokio::test]
    async fn not_safe_singleton_rejects_overlap() {
        let catalog = ModuleCatalog::new();
        catalog
            .register::<(), (), _, _, fn(&()) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>>(
                "blocking",
                |_: &Services| Ok(Blocking { gate: tokio::sync::Barrier::new(1) }),
                None,
                Lifetime::Singleton,
                ThreadSafety::NotSafe,
            )
            .unwrap();

        let services = Services::new();
        let handle = Arc::new(catalog.create::<(), ()>("blocking", &services).unwrap());
        let flow = Arc::new(FlowContext::for_test());

        let h1 = handle.clone();
        let f1 = flow.clone();
        let first = tokio::spawn(async move { h1.execute("n1", "blocking", &(), &f1).await });
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = handle.execute("n2", "blocking", &(), &flow).await;

        assert_eq!(second, Outcome::error("concurrency_violation"));
        let first_result = first.await.unwrap();
        assert_eq!(first_result, Outcome::ok(()));
    }
}
