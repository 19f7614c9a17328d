// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Module concurrency limiters — per-key, lock-free admission counters.
//!
//! A limiter key is whatever the caller chooses to scope concurrency by
//! (typically a module type or module id). Configuration arrives by patch
//! overlay and can be replaced at any time without losing in-flight leases:
//! reconfiguration only changes the ceiling new [`ConcurrencyLimiter::try_enter`]
//! calls are checked against.

use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

struct KeyState {
    /// `<= 0` means unbounded: `try_enter` always admits.
    max_in_flight: AtomicI64,
    in_flight: AtomicI64,
}

/// Concurrent admission control keyed by an arbitrary string.
#[derive(Default)]
pub struct ConcurrencyLimiter {
    keys: DashMap<String, Arc<KeyState>>,
    config_version: AtomicI64,
}

/// A granted admission slot. Releases its reservation when dropped,
/// guaranteeing the in-flight counter never leaks on an early return or a
/// panic unwind.
pub struct LimiterLease {
    state: Arc<KeyState>,
}

impl Drop for LimiterLease {
    fn drop(&mut self) {
        self.state.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ConcurrencyLimiter {
    pub fn new() -> Self {
        Self { keys: DashMap::new(), config_version: AtomicI64::new(-1) }
    }

    /// Idempotently (re)apply a configuration version's per-key ceilings.
    /// A version already applied is a no-op, so overlapping invocations
    /// racing to apply the same overlay never double-reset counters.
    pub fn ensure_configured(&self, limits: &std::collections::HashMap<String, i64>, config_version: u64) {
        let version = config_version as i64;
        let previous = self.config_version.load(Ordering::Acquire);
        if previous == version {
            return;
        }
        for (key, max) in limits {
            self.keys
                .entry(key.clone())
                .or_insert_with(|| Arc::new(KeyState { max_in_flight: AtomicI64::new(*max), in_flight: AtomicI64::new(0) }))
                .max_in_flight
                .store(*max, Ordering::Release);
        }
        self.config_version.store(version, Ordering::Release);
    }

    /// Attempt to enter under `key`. Returns `None` if the key's ceiling is
    /// currently saturated. A key with no configured ceiling (never seen by
    /// `ensure_configured`) is always unbounded.
    pub fn try_enter(&self, key: &str) -> Option<LimiterLease> {
        let state = self
            .keys
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(KeyState { max_in_flight: AtomicI64::new(0), in_flight: AtomicI64::new(0) }))
            .clone();

        let max = state.max_in_flight.load(Ordering::Acquire);
        if max <= 0 {
            state.in_flight.fetch_add(1, Ordering::AcqRel);
            return Some(LimiterLease { state });
        }

        loop {
            let current = state.in_flight.load(Ordering::Acquire);
            if current >= max {
                return None;
            }
            if state
                .in_flight
                .compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(LimiterLease { state });
            }
        }
    }

    /// Current in-flight count for `key`, `0` if never seen.
    pub fn in_flight(&self, key: &str) -> i64 {
        self.keys.get(key).map(|s| s.in_flight.load(Ordering::Acquire)).unwrap_or(0)
    }
}
