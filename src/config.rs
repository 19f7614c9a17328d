// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Engine-wide defaults, following this crate's per-subsystem `...Config`
//! struct convention.
//!
//! A [`FlowEngineConfig`] is supplied once when constructing a
//! [`crate::registry::FlowRegistry`] and applies to every flow it executes
//! unless a call to [`crate::registry::FlowRegistry::execute`] overrides the
//! deadline explicitly.

use crate::explain::ExplainLevel;
use std::time::Duration;

/// Engine-wide defaults for flow execution.
#[derive(Debug, Clone)]
pub struct FlowEngineConfig {
    /// Deadline applied to an invocation that supplies none of its own.
    pub default_deadline: Duration,
    /// Explain granularity used when a caller doesn't request a level.
    pub default_explain_level: ExplainLevel,
}

impl Default for FlowEngineConfig {
    fn default() -> Self {
        Self { default_deadline: Duration::from_secs(5), default_explain_level: ExplainLevel::Summary }
    }
}

impl FlowEngineConfig {
    pub fn builder() -> FlowEngineConfigBuilder {
        FlowEngineConfigBuilder::default()
    }
}

/// Fluent construction of a [`FlowEngineConfig`], mirroring the crate's other
/// `...Builder` types.
#[derive(Default)]
pub struct FlowEngineConfigBuilder {
    default_deadline: Option<Duration>,
    default_explain_level: Option<ExplainLevel>,
}

impl FlowEngineConfigBuilder {
    pub fn default_deadline(mut self, deadline: Duration) -> Self {
        self.default_deadline = Some(deadline);
        self
    }

    pub fn default_explain_level(mut self, level: ExplainLevel) -> Self {
        self.default_explain_level = Some(level);
        self
    }

    pub fn build(self) -> FlowEngineConfig {
        let defaults = FlowEngineConfig::default();
        FlowEngineConfig {
            default_deadline: self.default_deadline.unwrap_or(defaults.default_deadline),
            default_explain_level: self.default_explain_level.unwrap_or(defaults.default_explain_level),
        }
    }
}
