use std::path::Path;

use anyhow::Result;

// ---------------------------------------------------------------------------
// Command-line input assembly
// ---------------------------------------------------------------------------

/// Build the namespaced inputs object from `-i FILE.json` plus positional
/// `NAME=VALUE` arguments. Positional values parse as integers, floats,
/// booleans, and strings; a repeated `NAME` accumulates into an array;
/// `--empty NAME` forces an empty array and `--none NAME` an absent
/// optional. Bare names are qualified with the target's namespace.
pub fn assemble_inputs(
    target: &str,
    input_file: Option<&Path>,
    positional: &[String],
    empty: &[String],
    none: &[String],
) -> Result<serde_json::Value> {
    let mut object = match input_file {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("cannot read {}: {e}", path.display()))?;
            match serde_json::from_str(&text)? {
                serde_json::Value::Object(map) => map,
                _ => anyhow::bail!("{} must contain a JSON object", path.display()),
            }
        }
        None => serde_json::Map::new(),
    };

    // Positional values override the file; repeating a NAME on the
    // command line accumulates into an array.
    let mut from_cli = std::collections::HashSet::new();
    for pair in positional {
        let Some((name, raw)) = pair.split_once('=') else {
            anyhow::bail!("malformed input {pair:?}: expected NAME=VALUE");
        };
        let key = qualify(target, name);
        let value = parse_scalar(raw);
        if !from_cli.insert(key.clone()) {
            match object.get_mut(&key) {
                Some(serde_json::Value::Array(items)) => items.push(value),
                Some(existing) => {
                    let first = existing.take();
                    *existing = serde_json::Value::Array(vec![first, value]);
                }
                None => {
                    object.insert(key, value);
                }
            }
        } else {
            object.insert(key, value);
        }
    }
    for name in empty {
        object.insert(qualify(target, name), serde_json::Value::Array(Vec::new()));
    }
    for name in none {
        object.insert(qualify(target, name), serde_json::Value::Null);
    }

    Ok(serde_json::Value::Object(object))
}

fn qualify(target: &str, name: &str) -> String {
    if name.starts_with(&format!("{target}.")) {
        name.to_string()
    } else {
        format!("{target}.{name}")
    }
}

/// Positional value literals: integer, float, boolean, else string.
fn parse_scalar(raw: &str) -> serde_json::Value {
    if let Ok(i) = raw.parse::<i64>() {
        return serde_json::Value::Number(i.into());
    }
    if let Ok(f) = raw.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return serde_json::Value::Number(n);
        }
    }
    match raw {
        "true" => serde_json::Value::Bool(true),
        "false" => serde_json::Value::Bool(false),
        _ => serde_json::Value::String(raw.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Input templates
// ---------------------------------------------------------------------------

/// JSON skeleton of a target's required inputs.
pub fn input_template(
    target: &str,
    inputs: impl Iterator<Item = (String, String)>,
) -> serde_json::Value {
    let mut object = serde_json::Map::new();
    for (name, ty) in inputs {
        object.insert(
            format!("{target}.{name}"),
            serde_json::Value::String(ty),
        );
    }
    serde_json::Value::Object(object)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_are_typed() {
        assert_eq!(parse_scalar("42"), serde_json::json!(42));
        assert_eq!(parse_scalar("2.5"), serde_json::json!(2.5));
        assert_eq!(parse_scalar("true"), serde_json::json!(true));
        assert_eq!(parse_scalar("hello"), serde_json::json!("hello"));
        assert_eq!(parse_scalar("in.txt"), serde_json::json!("in.txt"));
    }

    #[test]
    fn repetition_builds_arrays() {
        let json = assemble_inputs(
            "w",
            None,
            &[
                "xs=1".to_string(),
                "xs=2".to_string(),
                "xs=3".to_string(),
                "who=Alyssa".to_string(),
            ],
            &[],
            &[],
        )
        .unwrap();
        assert_eq!(json["w.xs"], serde_json::json!([1, 2, 3]));
        assert_eq!(json["w.who"], serde_json::json!("Alyssa"));
    }

    #[test]
    fn empty_and_none_flags() {
        let json = assemble_inputs(
            "w",
            None,
            &[],
            &["xs".to_string()],
            &["opt".to_string()],
        )
        .unwrap();
        assert_eq!(json["w.xs"], serde_json::json!([]));
        assert_eq!(json["w.opt"], serde_json::Value::Null);
    }

    #[test]
    fn positional_overrides_merge_with_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("inputs.json");
        std::fs::write(&path, r#"{"w.who": "from-file", "w.n": 1}"#).unwrap();

        let json = assemble_inputs(
            "w",
            Some(&path),
            &["who=from-cli".to_string()],
            &[],
            &[],
        )
        .unwrap();
        assert_eq!(json["w.n"], serde_json::json!(1));
        assert_eq!(json["w.who"], serde_json::json!("from-cli"));
    }

    #[test]
    fn dotted_call_inputs_pass_through() {
        let json = assemble_inputs("w", None, &["t.n=3".to_string()], &[], &[]).unwrap();
        assert_eq!(json["w.t.n"], serde_json::json!(3));
    }

    #[test]
    fn malformed_pairs_are_rejected() {
        assert!(assemble_inputs("w", None, &["oops".to_string()], &[], &[]).is_err());
    }
}
