use std::collections::HashMap;

use orion_error::prelude::*;

use rw_lang::types::Type;

use crate::error::{CoreReason, CoreResult};
use crate::value::Value;

// ---------------------------------------------------------------------------
// Namespaced run inputs
// ---------------------------------------------------------------------------

/// Inputs decoded from a run's JSON object. Keys are namespaced
/// `target.input` or `target.call.input`; call-qualified entries stay raw
/// until the scheduler resolves the callee's declared types.
#[derive(Debug, Default, Clone)]
pub struct RunInputs {
    /// Direct inputs of the target workflow or task.
    pub direct: HashMap<String, Value>,
    /// `call → input → raw JSON` overrides for calls inside the workflow.
    pub calls: HashMap<String, HashMap<String, serde_json::Value>>,
}

/// Decode a `{"wf.input": value, ...}` object against the target's input
/// types. Unknown keys and type mismatches are input errors; absent
/// optionals stay unset.
pub fn parse_run_inputs(
    json: &serde_json::Value,
    target: &str,
    input_types: &HashMap<String, Type>,
) -> CoreResult<RunInputs> {
    let serde_json::Value::Object(map) = json else {
        return StructError::from(CoreReason::Input)
            .with_detail("run inputs must be a JSON object")
            .err();
    };

    let mut out = RunInputs::default();
    for (key, raw) in map {
        let mut parts = key.split('.');
        let first = parts.next().unwrap_or_default();
        if first != target {
            return StructError::from(CoreReason::Input)
                .with_detail(format!(
                    "input key {key:?} does not belong to `{target}`"
                ))
                .err();
        }
        let rest: Vec<&str> = parts.collect();
        match rest.as_slice() {
            [input] => {
                let Some(ty) = input_types.get(*input) else {
                    return StructError::from(CoreReason::Input)
                        .with_detail(format!("`{target}` has no input named `{input}`"))
                        .err();
                };
                if raw.is_null() && ty.optional {
                    continue;
                }
                let value = Value::from_json(raw, ty)?;
                out.direct.insert((*input).to_string(), value);
            }
            [call, input] => {
                out.calls
                    .entry((*call).to_string())
                    .or_default()
                    .insert((*input).to_string(), raw.clone());
            }
            _ => {
                return StructError::from(CoreReason::Input)
                    .with_detail(format!("unrecognized input key {key:?}"))
                    .err();
            }
        }
    }
    Ok(out)
}

/// Verify every required input is present.
pub fn check_required(
    inputs: &RunInputs,
    target: &str,
    required: &[String],
) -> CoreResult<()> {
    for name in required {
        if !inputs.direct.contains_key(name) {
            return StructError::from(CoreReason::Input)
                .with_detail(format!("required input `{target}.{name}` is missing"))
                .err();
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

/// Qualified output object: `{"target.output": value, ...}`.
pub fn outputs_json(target: &str, outputs: &[(String, Value)]) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (name, value) in outputs {
        map.insert(format!("{target}.{name}"), value.to_json());
    }
    serde_json::Value::Object(map)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn types() -> HashMap<String, Type> {
        HashMap::from([
            ("who".to_string(), Type::string()),
            ("n".to_string(), Type::int().with_optional(true)),
        ])
    }

    #[test]
    fn parses_direct_and_call_inputs() {
        let json: serde_json::Value =
            serde_json::from_str(r#"{"w.who": "Alyssa", "w.t.n": 3}"#).unwrap();
        let inputs = parse_run_inputs(&json, "w", &types()).unwrap();
        assert_eq!(inputs.direct["who"], Value::String("Alyssa".into()));
        assert_eq!(inputs.calls["t"]["n"], serde_json::json!(3));
    }

    #[test]
    fn null_clears_optionals_only() {
        let json: serde_json::Value = serde_json::from_str(r#"{"w.n": null}"#).unwrap();
        let inputs = parse_run_inputs(&json, "w", &types()).unwrap();
        assert!(!inputs.direct.contains_key("n"));

        let json: serde_json::Value = serde_json::from_str(r#"{"w.who": null}"#).unwrap();
        assert!(parse_run_inputs(&json, "w", &types()).is_err());
    }

    #[test]
    fn unknown_keys_rejected() {
        let json: serde_json::Value = serde_json::from_str(r#"{"w.nope": 1}"#).unwrap();
        assert!(parse_run_inputs(&json, "w", &types()).is_err());
        let json: serde_json::Value = serde_json::from_str(r#"{"other.who": "x"}"#).unwrap();
        assert!(parse_run_inputs(&json, "w", &types()).is_err());
    }

    #[test]
    fn required_check() {
        let inputs = RunInputs::default();
        assert!(check_required(&inputs, "w", &["who".to_string()]).is_err());
        assert!(check_required(&inputs, "w", &[]).is_ok());
    }

    #[test]
    fn outputs_are_qualified() {
        let j = outputs_json("w", &[("out".to_string(), Value::Int(4))]);
        assert_eq!(j, serde_json::json!({"w.out": 4}));
    }
}
