//! Multi-step flow definitions referenced from the registry as
//! `flow:<file>`, stored under `.flow/flows/`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{FlowError, Result};
use crate::io::safe_path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    Atom,
    Workflow,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StepDef {
    pub id: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    /// Registry atom name (`type: atom`) or flow file (`type: workflow`).
    #[serde(rename = "ref")]
    pub target: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    /// Optional aliasing of export keys into context keys.
    #[serde(default)]
    pub export: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlowDefinition {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub steps: Vec<StepDef>,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// Load and validate a flow definition file (jailed under `flows/`).
pub fn load_flow(flows_dir: &Path, rel: &str) -> Result<FlowDefinition> {
    let path = safe_path::resolve(flows_dir, rel)?;
    let contents = std::fs::read_to_string(&path)
        .map_err(|err| FlowError::Config(format!("read flow {}: {err}", path.display())))?;
    let def: FlowDefinition = serde_json::from_str(&contents)
        .map_err(|err| FlowError::Config(format!("parse flow {}: {err}", path.display())))?;
    validate(&def)?;
    Ok(def)
}

fn validate(def: &FlowDefinition) -> Result<()> {
    if def.steps.is_empty() {
        return Err(FlowError::Config(format!("flow '{}' has no steps", def.name)));
    }
    let mut seen = std::collections::HashSet::new();
    for step in &def.steps {
        if step.id.is_empty() || step.id.contains('#') {
            return Err(FlowError::Config(format!(
                "flow '{}': step id '{}' is invalid",
                def.name, step.id
            )));
        }
        if !seen.insert(step.id.as_str()) {
            return Err(FlowError::Config(format!(
                "flow '{}': duplicate step id '{}'",
                def.name, step.id
            )));
        }
    }
    Ok(())
}

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z0-9_.]+)\}").expect("static regex"));

/// Resolve `${key}` placeholders in string args from the context.
///
/// Dotted keys traverse nested objects, falling back to a flat lookup.
/// Unknown keys keep their placeholder so failures are visible downstream.
pub fn resolve_args(args: &Map<String, Value>, context: &Map<String, Value>) -> Map<String, Value> {
    let mut resolved = Map::new();
    for (key, value) in args {
        let value = match value {
            Value::String(s) if s.contains("${") => {
                Value::String(resolve_placeholders(s, context))
            }
            other => other.clone(),
        };
        resolved.insert(key.clone(), value);
    }
    resolved
}

fn resolve_placeholders(input: &str, context: &Map<String, Value>) -> String {
    PLACEHOLDER
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let key = &caps[1];
            match lookup(context, key) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn lookup<'a>(context: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    if let Some(value) = context.get(key) {
        return Some(value);
    }
    let mut current: Option<&Value> = None;
    for part in key.split('.') {
        current = match current {
            None => context.get(part),
            Some(Value::Object(map)) => map.get(part),
            Some(_) => return None,
        };
        current?;
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_flow(temp: &tempfile::TempDir, name: &str, contents: &str) {
        std::fs::write(temp.path().join(name), contents).expect("write flow");
    }

    #[test]
    fn loads_a_flow_definition() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_flow(
            &temp,
            "deploy.json",
            r#"{
                "name": "deploy",
                "steps": [
                    {"id": "build", "type": "atom", "ref": "Build"},
                    {"id": "ship", "type": "workflow", "ref": "ship.json",
                     "args": {"target": "${env}"}}
                ]
            }"#,
        );
        let def = load_flow(temp.path(), "deploy.json").expect("load");
        assert_eq!(def.name, "deploy");
        assert_eq!(def.version, "1.0");
        assert_eq!(def.steps.len(), 2);
        assert_eq!(def.steps[1].step_type, StepType::Workflow);
    }

    #[test]
    fn empty_steps_is_a_config_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_flow(&temp, "empty.json", r#"{"name": "empty", "steps": []}"#);
        let err = load_flow(temp.path(), "empty.json").expect_err("should fail");
        assert!(matches!(err, FlowError::Config(_)), "{err}");
    }

    #[test]
    fn duplicate_step_ids_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_flow(
            &temp,
            "dup.json",
            r#"{"name": "dup", "steps": [
                {"id": "a", "type": "atom", "ref": "X"},
                {"id": "a", "type": "atom", "ref": "Y"}
            ]}"#,
        );
        let err = load_flow(temp.path(), "dup.json").expect_err("should fail");
        assert!(err.to_string().contains("duplicate step id"), "{err}");
    }

    #[test]
    fn jailbroken_flow_path_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = load_flow(temp.path(), "../outside.json").expect_err("should fail");
        assert!(matches!(err, FlowError::Security(_)), "{err}");
    }

    #[test]
    fn placeholders_resolve_from_context() {
        let mut context = Map::new();
        context.insert("env".to_string(), json!("staging"));
        context.insert(
            "config".to_string(),
            json!({"root": "/workspace"}),
        );

        let mut args = Map::new();
        args.insert("target".to_string(), json!("${env}"));
        args.insert("dir".to_string(), json!("${config.root}/out"));
        args.insert("missing".to_string(), json!("${nope}"));
        args.insert("count".to_string(), json!(3));

        let resolved = resolve_args(&args, &context);
        assert_eq!(resolved["target"], json!("staging"));
        assert_eq!(resolved["dir"], json!("/workspace/out"));
        assert_eq!(resolved["missing"], json!("${nope}"));
        assert_eq!(resolved["count"], json!(3));
    }
}
