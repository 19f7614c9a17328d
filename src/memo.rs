// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Request memo — single-flight de-duplication of identical module
//! invocations within one flow invocation.
//!
//! Two node dispatches that resolve to the same `(module type, memo key,
//! output type, shadow-ness)` share one underlying module execution: the
//! first caller computes it, concurrent callers await the same result
//! instead of re-invoking the module. Shadow and live calls never share a
//! slot even with an identical memo key, since a shadow invocation's
//! result must never leak onto the live path.

use crate::error::{Error, Result};
use crate::outcome::Outcome;
use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;

type BoxedAny = Box<dyn Any + Send + Sync>;

#[derive(Clone, PartialEq, Eq, Hash)]
struct MemoKey {
    module_type: String,
    memo_key: String,
    out_type: TypeId,
    is_shadow: bool,
}

impl MemoKey {
    fn describe(&self) -> String {
        format!("{}:{}{}", self.module_type, self.memo_key, if self.is_shadow { " (shadow)" } else { "" })
    }
}

enum Slot {
    InProgress(broadcast::Sender<Arc<Outcome<BoxedAny>>>),
    Done(Arc<Outcome<BoxedAny>>),
}

thread_local! {
    /// Keys whose compute future is currently being polled on this thread.
    /// Catches the common synchronous-recursion case of a module's own
    /// compute closure re-requesting its own memo key; a recursive call
    /// that first hops to a different worker thread across an `.await`
    /// is not caught by this and will instead await its own broadcast
    /// channel forever — callers constructing memo keys should avoid
    /// self-referential module graphs regardless.
    static IN_PROGRESS_ON_THREAD: RefCell<HashSet<(String, String, bool)>> = RefCell::new(HashSet::new());
}

/// Per-invocation single-flight cache, scoped to one [`crate::context::FlowContext`].
#[derive(Default)]
pub struct RequestMemo {
    slots: Mutex<HashMap<MemoKey, Slot>>,
}

impl RequestMemo {
    pub fn new() -> Self {
        Self { slots: Mutex::new(HashMap::new()) }
    }

    /// Compute (or join an in-flight computation of, or reuse the cached
    /// result of) the outcome for `module_type`/`memo_key`.
    ///
    /// # Errors
    /// Returns [`Error::CyclicMemo`] if this key's compute future is
    /// already being polled on the current thread — a module depending on
    /// its own memoized result.
    pub async fn get_or_compute<Out, Fut>(&self, module_type: &str, memo_key: &str, is_shadow: bool, compute: impl FnOnce() -> Fut) -> Result<Outcome<Out>>
    where
        Out: Clone + Send + Sync + 'static,
        Fut: Future<Output = Outcome<Out>> + Send,
    {
        let key = MemoKey { module_type: module_type.to_string(), memo_key: memo_key.to_string(), out_type: TypeId::of::<Out>(), is_shadow };
        let thread_key = (key.module_type.clone(), key.memo_key.clone(), key.is_shadow);

        let already_on_thread = IN_PROGRESS_ON_THREAD.with(|set| set.borrow().contains(&thread_key));
        if already_on_thread {
            return Err(Error::CyclicMemo(key.describe()));
        }

        let mut receiver = {
            let mut slots = self.slots.lock();
            match slots.get(&key) {
                Some(Slot::Done(outcome)) => return Ok(downcast_outcome::<Out>(outcome)),
                Some(Slot::InProgress(tx)) => Some(tx.subscribe()),
                None => {
                    let (tx, _rx) = broadcast::channel(1);
                    slots.insert(key.clone(), Slot::InProgress(tx));
                    None
                }
            }
        };

        if let Some(ref mut rx) = receiver {
            return match rx.recv().await {
                Ok(outcome) => Ok(downcast_outcome::<Out>(&outcome)),
                Err(_) => Err(Error::CyclicMemo(key.describe())),
            };
        }

        IN_PROGRESS_ON_THREAD.with(|set| set.borrow_mut().insert(thread_key.clone()));
        let outcome = compute().await;
        IN_PROGRESS_ON_THREAD.with(|set| set.borrow_mut().remove(&thread_key));

        let erased: Outcome<BoxedAny> = outcome.clone().map(|v| Box::new(v) as BoxedAny);
        let shared = Arc::new(erased);

        let mut slots = self.slots.lock();
        if let Some(Slot::InProgress(tx)) = slots.insert(key, Slot::Done(shared.clone())) {
            let _ = tx.send(shared);
        }

        Ok(outcome)
    }

    /// Type-erased counterpart of [`RequestMemo::get_or_compute`], used by
    /// [`crate::executor`] which dispatches nodes without a statically known
    /// `Out`. `out_type` stands in for `TypeId::of::<Out>()`; `clone_boxed`
    /// stands in for `Out::clone` — the executor supplies it from the
    /// catalog's [`crate::module::DynModule::clone_boxed`], which closes
    /// over the real `Out` type at the point the module was registered.
    pub(crate) async fn get_or_compute_dyn<Fut>(
        &self,
        module_type: &str,
        memo_key: &str,
        out_type: TypeId,
        is_shadow: bool,
        clone_boxed: impl Fn(&BoxedAny) -> BoxedAny,
        compute: impl FnOnce() -> Fut,
    ) -> Result<Outcome<BoxedAny>>
    where
        Fut: Future<Output = Outcome<BoxedAny>> + Send,
    {
        let key = MemoKey { module_type: module_type.to_string(), memo_key: memo_key.to_string(), out_type, is_shadow };
        let thread_key = (key.module_type.clone(), key.memo_key.clone(), key.is_shadow);

        let already_on_thread = IN_PROGRESS_ON_THREAD.with(|set| set.borrow().contains(&thread_key));
        if already_on_thread {
            return Err(Error::CyclicMemo(key.describe()));
        }

        let mut receiver = {
            let mut slots = self.slots.lock();
            match slots.get(&key) {
                Some(Slot::Done(outcome)) => return Ok(clone_erased_outcome(outcome, &clone_boxed)),
                Some(Slot::InProgress(tx)) => Some(tx.subscribe()),
                None => {
                    let (tx, _rx) = broadcast::channel(1);
                    slots.insert(key.clone(), Slot::InProgress(tx));
                    None
                }
            }
        };

        if let Some(ref mut rx) = receiver {
            return match rx.recv().await {
                Ok(outcome) => Ok(clone_erased_outcome(&outcome, &clone_boxed)),
                Err(_) => Err(Error::CyclicMemo(key.describe())),
            };
        }

        IN_PROGRESS_ON_THREAD.with(|set| set.borrow_mut().insert(thread_key.clone()));
        let outcome = compute().await;
        IN_PROGRESS_ON_THREAD.with(|set| set.borrow_mut().remove(&thread_key));

        let shared = Arc::new(outcome);
        let result = clone_erased_outcome(&shared, &clone_boxed);

        let mut slots = self.slots.lock();
        if let Some(Slot::InProgress(tx)) = slots.insert(key, Slot::Done(shared.clone())) {
            let _ = tx.send(shared);
        }

        Ok(result)
    }
}

/// Downcast-and-clone an erased outcome's value (if any) into a fresh typed
/// copy, without requiring `Outcome<BoxedAny>` itself to be `Clone` — a
/// boxed trait object never is.
fn downcast_outcome<Out: Clone + Send + Sync + 'static>(outcome: &Outcome<BoxedAny>) -> Outcome<Out> {
    clone_erased_outcome(outcome, &|v| {
        Box::new(
            v.downcast_ref::<Out>()
                .unwrap_or_else(|| panic!("memo slot type mismatch: expected {}", std::any::type_name::<Out>()))
                .clone(),
        )
    })
    .map(|boxed| *boxed.downcast::<Out>().expect("clone_boxed preserved Out's concrete type"))
}

/// Clone an erased outcome, reboxing its value (if any) through
/// `clone_boxed` — the one operation that needs to know `Out`'s concrete
/// type, supplied by the caller since `BoxedAny` carries no `Clone` impl of
/// its own.
fn clone_erased_outcome(outcome: &Outcome<BoxedAny>, clone_boxed: &impl Fn(&BoxedAny) -> BoxedAny) -> Outcome<BoxedAny> {
    match outcome {
        Outcome::Ok(v) => Outcome::Ok(clone_boxed(v)),
        Outcome::Fallback(v, code) => Outcome::Fallback(clone_boxed(v), code.clone()),
        Outcome::Error(code) => Outcome::Error(code.clone()),
        Outcome::Timeout(code) => Outcome::Timeout(code.clone()),
        Outcome::Skipped(code) => Outcome::Skipped(code.clone()),
        Outcome::Canceled(code) => Outcome::Canceled(code.clone()),
    }
}
