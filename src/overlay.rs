// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Patch overlay evaluator (schema v1).
//!
//! Resolves a v1 JSON patch document into per-(flow, stage, module)
//! overrides and module-concurrency limits applicable to a given
//! invocation. The evaluator reads only the small, fixed subset of JSON
//! described in this module — full JSON Patch (RFC 6902) parsing is out of
//! scope; this is a purpose-built reader for one small schema.

use crate::blueprint::{BlueprintNode, FlowBlueprint};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub const SUPPORTED_SCHEMA_VERSION: &str = "v1";

/// One module id's override within a single stage.
#[derive(Debug, Clone, Default)]
pub struct ModuleOverride {
    pub id: String,
    /// `None` if the patch entry has no `use` key. `Some(None)` if the key
    /// is present and explicitly `null` (removal). `Some(Some(t))` if the
    /// key names a new module type.
    pub use_field: Option<Option<String>>,
    /// `Some(value)` if the patch entry has a `with` key.
    pub with: Option<Value>,
    /// Position of this entry within the patch's `modules` array, used only
    /// to render `modules[i]` paths on diff/applied output.
    pub origin_index: usize,
}

/// Resolved overrides for one stage, keyed by module id.
#[derive(Debug, Clone, Default)]
pub struct ResolvedStageOverlay {
    pub modules: HashMap<String, ModuleOverride>,
}

/// Fully resolved patch: per-(flow, stage) module overrides and
/// per-key concurrency limits.
#[derive(Debug, Clone, Default)]
pub struct PatchOverlay {
    /// flow name -> stage name -> resolved overrides
    pub flows: HashMap<String, HashMap<String, ResolvedStageOverlay>>,
    /// `limits.moduleConcurrency.maxInFlight`
    pub module_concurrency_limits: HashMap<String, i64>,
}

impl PatchOverlay {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn stage_overlay(&self, flow: &str, stage: &str) -> Option<&ResolvedStageOverlay> {
        self.flows.get(flow).and_then(|stages| stages.get(stage))
    }
}

/// Change kind relative to a baseline — either the flow's blueprint
/// composition (single-patch evaluation) or an older patch (two-patch
/// diff). Declaration order is the tie-break order used when sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OverlayChangeKind {
    Added,
    Removed,
    UseChanged,
    WithChanged,
}

/// One resolved change, naming the JSON path it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlayApplied {
    pub flow: String,
    pub stage: String,
    pub module_id: String,
    pub kind: OverlayChangeKind,
    pub path: String,
}

fn module_path(flow: &str, stage: &str, index: usize, suffix: &str) -> String {
    if suffix.is_empty() {
        format!("$.flows.{flow}.stages.{stage}.modules[{index}]")
    } else {
        format!("$.flows.{flow}.stages.{stage}.modules[{index}].{suffix}")
    }
}

/// Parse and validate a v1 patch document. Rejects unsupported schema
/// versions and malformed `flows`/`stages`/`modules[i]` shapes with a
/// [`Error::PatchFormatError`] naming the offending path.
pub fn evaluate(raw: &Value) -> Result<PatchOverlay> {
    let schema_version = raw
        .get("schemaVersion")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::PatchFormatError { path: "$.schemaVersion".into(), message: "missing or non-string schemaVersion".into() })?;
    if schema_version != SUPPORTED_SCHEMA_VERSION {
        return Err(Error::UnsupportedPatchSchema(schema_version.to_string()));
    }

    let mut overlay = PatchOverlay::empty();

    if let Some(flows_value) = raw.get("flows") {
        let flows_obj = flows_value
            .as_object()
            .ok_or_else(|| Error::PatchFormatError { path: "$.flows".into(), message: "expected an object".into() })?;

        for (flow_name, flow_value) in flows_obj {
            let flow_path = format!("$.flows.{flow_name}");
            let stages_value = flow_value
                .get("stages")
                .ok_or_else(|| Error::PatchFormatError { path: format!("{flow_path}.stages"), message: "missing stages".into() })?;
            let stages_obj = stages_value
                .as_object()
                .ok_or_else(|| Error::PatchFormatError { path: format!("{flow_path}.stages"), message: "expected an object".into() })?;

            let mut resolved_stages = HashMap::new();
            for (stage_name, stage_value) in stages_obj {
                let stage_path = format!("{flow_path}.stages.{stage_name}");
                let modules_value = stage_value.get("modules").ok_or_else(|| Error::PatchFormatError {
                    path: format!("{stage_path}.modules"),
                    message: "missing modules".into(),
                })?;
                let modules_arr = modules_value
                    .as_array()
                    .ok_or_else(|| Error::PatchFormatError { path: format!("{stage_path}.modules"), message: "expected an array".into() })?;

                let mut resolved_modules = HashMap::new();
                for (index, module_value) in modules_arr.iter().enumerate() {
                    let module_path_base = module_path(flow_name, stage_name, index, "");
                    let module_obj = module_value
                        .as_object()
                        .ok_or_else(|| Error::PatchFormatError { path: module_path_base.clone(), message: "expected an object".into() })?;

                    let id = module_obj
                        .get("id")
                        .and_then(Value::as_str)
                        .ok_or_else(|| Error::PatchFormatError { path: format!("{module_path_base}.id"), message: "missing or non-string id".into() })?
                        .to_string();

                    if resolved_modules.contains_key(&id) {
                        return Err(Error::PatchFormatError {
                            path: module_path_base,
                            message: format!("duplicate module id '{id}' within stage"),
                        });
                    }

                    let use_field = module_obj.get("use").map(|v| match v {
                        Value::Null => None,
                        Value::String(s) => Some(s.clone()),
                        _ => None,
                    });
                    // A present-but-non-string, non-null `use` is still a format error.
                    if let Some(v) = module_obj.get("use") {
                        if !v.is_null() && !v.is_string() {
                            return Err(Error::PatchFormatError {
                                path: format!("{module_path_base}.use"),
                                message: "expected a string or null".into(),
                            });
                        }
                    }

                    let with = module_obj.get("with").cloned();

                    resolved_modules.insert(id.clone(), ModuleOverride { id, use_field, with, origin_index: index });
                }
                resolved_stages.insert(stage_name.clone(), ResolvedStageOverlay { modules: resolved_modules });
            }
            overlay.flows.insert(flow_name.clone(), resolved_stages);
        }
    }

    if let Some(limits) = raw.get("limits") {
        if let Some(max_in_flight) = limits.get("moduleConcurrency").and_then(|m| m.get("maxInFlight")) {
            let obj = max_in_flight.as_object().ok_or_else(|| Error::PatchFormatError {
                path: "$.limits.moduleConcurrency.maxInFlight".into(),
                message: "expected an object".into(),
            })?;
            for (key, value) in obj {
                let n = value.as_i64().ok_or_else(|| Error::PatchFormatError {
                    path: format!("$.limits.moduleConcurrency.maxInFlight.{key}"),
                    message: "expected an integer".into(),
                })?;
                overlay.module_concurrency_limits.insert(key.clone(), n);
            }
        }
    }

    Ok(overlay)
}

/// Per-(flow, stage) `module_id -> module_type` composition taken from a
/// blueprint's base stage definitions, used to classify a single patch's
/// overrides as `Added`/`Removed`/`UseChanged` relative to what the
/// blueprint itself declares.
pub fn base_composition(flow_name: &str, blueprint: &FlowBlueprint) -> HashMap<String, HashMap<String, String>> {
    let mut out: HashMap<String, HashMap<String, String>> = HashMap::new();
    collect_stage_composition(flow_name, &blueprint.nodes, &mut out);
    out
}

fn collect_stage_composition(flow_name: &str, nodes: &[BlueprintNode], out: &mut HashMap<String, HashMap<String, String>>) {
    for node in nodes {
        match node {
            BlueprintNode::Stage(stage) => {
                let entry = out.entry(stage.name.clone()).or_default();
                for slot in &stage.slots {
                    entry.insert(slot.module_id.clone(), slot.module_type.clone());
                }
            }
            BlueprintNode::Conditional(cond) => {
                collect_stage_composition(flow_name, &cond.then_branch, out);
                collect_stage_composition(flow_name, &cond.else_branch, out);
            }
            BlueprintNode::Module(_) => {}
        }
    }
}

/// Classify every override in `overlay` for `flow` against `base`
/// (`stage -> module_id -> module_type`), producing one [`OverlayApplied`]
/// per distinct change, stable-sorted by (flow, stage, moduleId, kind).
pub fn applied_against_base(flow: &str, overlay: &PatchOverlay, base: &HashMap<String, HashMap<String, String>>) -> Vec<OverlayApplied> {
    let mut applied = Vec::new();
    let Some(stages) = overlay.flows.get(flow) else {
        return applied;
    };

    for (stage_name, resolved) in stages {
        let base_modules = base.get(stage_name);
        for (module_id, module_override) in &resolved.modules {
            let base_type = base_modules.and_then(|m| m.get(module_id));
            let base_path = module_path(flow, stage_name, module_override.origin_index, "");

            match &module_override.use_field {
                Some(None) => {
                    applied.push(OverlayApplied {
                        flow: flow.to_string(),
                        stage: stage_name.clone(),
                        module_id: module_id.clone(),
                        kind: OverlayChangeKind::Removed,
                        path: format!("{base_path}.use"),
                    });
                    continue;
                }
                Some(Some(new_type)) => {
                    if base_type.is_none() {
                        applied.push(OverlayApplied {
                            flow: flow.to_string(),
                            stage: stage_name.clone(),
                            module_id: module_id.clone(),
                            kind: OverlayChangeKind::Added,
                            path: base_path.clone(),
                        });
                    } else if base_type != Some(new_type) {
                        applied.push(OverlayApplied {
                            flow: flow.to_string(),
                            stage: stage_name.clone(),
                            module_id: module_id.clone(),
                            kind: OverlayChangeKind::UseChanged,
                            path: format!("{base_path}.use"),
                        });
                    }
                }
                None => {
                    if base_type.is_none() {
                        applied.push(OverlayApplied {
                            flow: flow.to_string(),
                            stage: stage_name.clone(),
                            module_id: module_id.clone(),
                            kind: OverlayChangeKind::Added,
                            path: base_path.clone(),
                        });
                    }
                }
            }

            if module_override.with.is_some() {
                applied.push(OverlayApplied {
                    flow: flow.to_string(),
                    stage: stage_name.clone(),
                    module_id: module_id.clone(),
                    kind: OverlayChangeKind::WithChanged,
                    path: format!("{base_path}.with"),
                });
            }
        }
    }

    applied.sort_by(|a, b| (&a.flow, &a.stage, &a.module_id, a.kind).cmp(&(&b.flow, &b.stage, &b.module_id, b.kind)));
    applied
}

/// Deep-equality over JSON values per the overlay's comparison rules:
/// numbers by raw lexical form (no float normalization), strings/booleans
/// by value, objects by key-set plus recursive equality, arrays by order
/// and length.
pub fn deep_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => x.to_string() == y.to_string(),
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Array(x), Value::Array(y)) => x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| deep_equal(a, b)),
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len() && x.iter().all(|(k, v)| y.get(k).is_some_and(|yv| deep_equal(v, yv)))
        }
        _ => false,
    }
}

/// Diff two whole patch documents directly, independent of any blueprint:
/// a module id present in `new` but not `old` is `Added`; present in `old`
/// but not `new` is `Removed`; present in both with a different `use` is
/// `UseChanged`; with a different `with` (per [`deep_equal`]) is
/// `WithChanged`. Stable-sorted by (flow, stage, moduleId, kind).
pub fn diff_modules(old: &PatchOverlay, new: &PatchOverlay) -> Vec<OverlayApplied> {
    let mut diffs = Vec::new();
    let mut flow_names: Vec<&String> = old.flows.keys().chain(new.flows.keys()).collect();
    flow_names.sort();
    flow_names.dedup();

    for flow in flow_names {
        let old_stages = old.flows.get(flow);
        let new_stages = new.flows.get(flow);
        let mut stage_names: Vec<&String> = old_stages.into_iter().flat_map(|s| s.keys()).chain(new_stages.into_iter().flat_map(|s| s.keys())).collect();
        stage_names.sort();
        stage_names.dedup();

        for stage in stage_names {
            let old_modules = old_stages.and_then(|s| s.get(stage)).map(|r| &r.modules);
            let new_modules = new_stages.and_then(|s| s.get(stage)).map(|r| &r.modules);
            let mut module_ids: Vec<&String> = old_modules.into_iter().flatten().map(|(k, _)| k).chain(new_modules.into_iter().flatten().map(|(k, _)| k)).collect();
            module_ids.sort();
            module_ids.dedup();

            for module_id in module_ids {
                let old_entry = old_modules.and_then(|m| m.get(module_id));
                let new_entry = new_modules.and_then(|m| m.get(module_id));

                match (old_entry, new_entry) {
                    (None, Some(n)) => diffs.push(OverlayApplied {
                        flow: flow.clone(),
                        stage: stage.clone(),
                        module_id: module_id.clone(),
                        kind: OverlayChangeKind::Added,
                        path: module_path(flow, stage, n.origin_index, ""),
                    }),
                    (Some(o), None) => diffs.push(OverlayApplied {
                        flow: flow.clone(),
                        stage: stage.clone(),
                        module_id: module_id.clone(),
                        kind: OverlayChangeKind::Removed,
                        path: module_path(flow, stage, o.origin_index, ""),
                    }),
                    (Some(o), Some(n)) => {
                        if o.use_field != n.use_field {
                            diffs.push(OverlayApplied {
                                flow: flow.clone(),
                                stage: stage.clone(),
                                module_id: module_id.clone(),
                                kind: OverlayChangeKind::UseChanged,
                                path: module_path(flow, stage, n.origin_index, "use"),
                            });
                        }
                        let with_changed = match (&o.with, &n.with) {
                            (Some(a), Some(b)) => !deep_equal(a, b),
                            (None, None) => false,
                            _ => true,
                        };
                        if with_changed {
                            diffs.push(OverlayApplied {
                                flow: flow.clone(),
                                stage: stage.clone(),
                                module_id: module_id.clone(),
                                kind: OverlayChangeKind::WithChanged,
                                path: module_path(flow, stage, n.origin_index, "with"),
                            });
                        }
                    }
                    (None, None) => {}
                }
            }
        }
    }

    diffs.sort_by(|a, b| (&a.flow, &a.stage, &a.module_id, a.kind).cmp(&(&b.flow, &b.stage, &b.module_id, b.kind)));
    diffs
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn rejects_unsupported_schema_version() {
        let raw = json!({ "schemaVersion": "v2" });
        let result = evaluate(&raw);
        assert!(matches!(result, Err(Error::UnsupportedPatchSchema(v)) if v == "v2"));
    }

    #[test]
    fn parses_module_overrides_and_limits() {
        let raw = json!({
            "schemaVersion": "v1",
            "flows": {
                "search": {
                    "stages": {
                        "rank": {
                            "modules": [
                                { "id": "m1", "use": "u2", "with": { "a": 2 } }
                            ]
                        }
                    }
                }
            },
            "limits": { "moduleConcurrency": { "maxInFlight": { "keyX": 1 } } }
        });
        let overlay = evaluate(&raw).unwrap();
        let stage = overlay.stage_overlay("search", "rank").unwrap();
        let m1 = &stage.modules["m1"];
        assert_eq!(m1.use_field, Some(Some("u2".to_string())));
        assert_eq!(m1.with, Some(json!({ "a": 2 })));
        assert_eq!(overlay.module_concurrency_limits["keyX"], 1);
    }

    #[test]
    fn duplicate_module_id_rejected() {
        let raw = json!({
            "schemaVersion": "v1",
            "flows": { "f": { "stages": { "s": { "modules": [
                { "id": "m1", "use": "a" },
                { "id": "m1", "use": "b" }
            ] } } } }
        });
        let result = evaluate(&raw);
        assert!(matches!(result, Err(Error::PatchFormatError { .. })));
    }

    #[test]
    fn non_object_stages_rejected_with_path() {
        let raw = json!({ "schemaVersion": "v1", "flows": { "f": { "stages": "not-an-object" } } });
        let result = evaluate(&raw);
        match result {
            Err(Error::PatchFormatError { path, .. }) => assert_eq!(path, "$.flows.f.stages"),
            other => panic!("expected PatchFormatError, got {other:?}"),
        }
    }

    #[test]
    fn deep_equal_does_not_normalize_float_lexical_form() {
        assert!(deep_equal(&json!(1), &json!(1)));
        assert!(!deep_equal(&json!(1), &json!(1.0)));
    }

    proptest! {
        /// Every value is equal to itself, and an object's key order must
        /// never affect the comparison (the `with` payload round-trips
        /// through a `serde_json::Map`, which is order-preserving, not
        /// sorted).
        #[test]
        fn deep_equal_is_reflexive_for_scalars_and_ignores_object_key_order(
            a in -1000i64..1000,
            b in -1000i64..1000,
            s in "[a-zA-Z0-9]{0,12}",
        ) {
            let value = json!({ "a": a, "b": b, "s": s.clone() });
            prop_assert!(deep_equal(&value, &value));

            let reordered = json!({ "s": s, "b": b, "a": a });
            prop_assert!(deep_equal(&value, &reordered));
        }

        /// Two distinct integers must never compare equal, since their
        /// lexical forms differ.
        #[test]
        fn deep_equal_distinguishes_unequal_integers(a in -1000i64..1000, b in -1000i64..1000) {
            prop_assume!(a != b);
            prop_assert!(!deep_equal(&json!(a), &json!(b)));
        }
    }

    #[test]
    fn s6_diff_use_and_with_changed_sorted() {
        let old = evaluate(&json!({
            "schemaVersion": "v1",
            "flows": { "F": { "stages": { "S": { "modules": [ { "id": "m1", "use": "u1", "with": { "a": 1 } } ] } } } }
        }))
        .unwrap();
        let new = evaluate(&json!({
            "schemaVersion": "v1",
            "flows": { "F": { "stages": { "S": { "modules": [ { "id": "m1", "use": "u2", "with": { "a": 2 } } ] } } } }
        }))
        .unwrap();

        let diffs = diff_modules(&old, &new);
        assert_eq!(diffs.len(), 2);
        assert_eq!(diffs[0].kind, OverlayChangeKind::UseChanged);
        assert_eq!(diffs[1].kind, OverlayChangeKind::WithChanged);
        assert_eq!(diffs[0].path, "$.flows.F.stages.S.modules[0].use");
    }
}
