use std::path::PathBuf;

// ---------------------------------------------------------------------------
// Environment overlay — RUNWDL__SECTION__KEY=VALUE
// ---------------------------------------------------------------------------

const ENV_PREFIX: &str = "RUNWDL__";

/// Apply `RUNWDL__SECTION__KEY=VALUE` environment entries onto a parsed
/// TOML table. Values parse as JSON when possible (arrays, booleans,
/// numbers) and fall back to plain strings.
pub fn apply_env(
    table: &mut toml::Table,
    env: impl Iterator<Item = (String, String)>,
) -> anyhow::Result<()> {
    for (key, value) in env {
        let Some(rest) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let mut parts = rest.splitn(2, "__");
        let (Some(section), Some(field)) = (parts.next(), parts.next()) else {
            anyhow::bail!("malformed override {key:?}: expected RUNWDL__SECTION__KEY");
        };
        let section = section.to_ascii_lowercase();
        let field = field.to_ascii_lowercase();

        let entry = table
            .entry(section)
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
        let toml::Value::Table(section_table) = entry else {
            anyhow::bail!("override {key:?} targets a non-table config entry");
        };
        section_table.insert(field, parse_value(&value)?);
    }
    Ok(())
}

/// JSON first, plain string second.
fn parse_value(raw: &str) -> anyhow::Result<toml::Value> {
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(raw) {
        if let Some(v) = json_to_toml(&json) {
            return Ok(v);
        }
    }
    Ok(toml::Value::String(raw.to_string()))
}

fn json_to_toml(json: &serde_json::Value) -> Option<toml::Value> {
    use serde_json::Value as J;
    Some(match json {
        J::Bool(b) => toml::Value::Boolean(*b),
        J::Number(n) => {
            if let Some(i) = n.as_i64() {
                toml::Value::Integer(i)
            } else {
                toml::Value::Float(n.as_f64()?)
            }
        }
        J::String(s) => toml::Value::String(s.clone()),
        J::Array(items) => {
            let converted: Option<Vec<toml::Value>> = items.iter().map(json_to_toml).collect();
            toml::Value::Array(converted?)
        }
        J::Object(map) => {
            let mut table = toml::Table::new();
            for (k, v) in map {
                table.insert(k.clone(), json_to_toml(v)?);
            }
            toml::Value::Table(table)
        }
        J::Null => return None,
    })
}

// ---------------------------------------------------------------------------
// User config discovery
// ---------------------------------------------------------------------------

/// First-found user config file: `$RUNWDL_CONFIG`, then
/// `$XDG_CONFIG_HOME/runwdl.toml`, then `~/.config/runwdl.toml`.
pub fn find_user_config() -> Option<PathBuf> {
    if let Ok(explicit) = std::env::var("RUNWDL_CONFIG") {
        let path = PathBuf::from(explicit);
        if path.is_file() {
            return Some(path);
        }
    }
    let config_home = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .ok()
        .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))?;
    let path = config_home.join("runwdl.toml");
    path.is_file().then_some(path)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlays_typed_values() {
        let mut table: toml::Table = toml::from_str("[scheduler]\ncpu = 1\n").unwrap();
        let env = vec![
            ("RUNWDL__SCHEDULER__CPU".to_string(), "4".to_string()),
            ("RUNWDL__TASK__COPY_INPUT_FILES".to_string(), "true".to_string()),
            ("PATH".to_string(), "/usr/bin".to_string()),
        ];
        apply_env(&mut table, env.into_iter()).unwrap();
        assert_eq!(table["scheduler"]["cpu"], toml::Value::Integer(4));
        assert_eq!(
            table["task"]["copy_input_files"],
            toml::Value::Boolean(true)
        );
        assert!(!table.contains_key("path"));
    }

    #[test]
    fn non_json_values_stay_strings() {
        let mut table = toml::Table::new();
        let env = vec![(
            "RUNWDL__CONTAINER__DEFAULT_IMAGE".to_string(),
            "ubuntu:22.04".to_string(),
        )];
        apply_env(&mut table, env.into_iter()).unwrap();
        assert_eq!(
            table["container"]["default_image"],
            toml::Value::String("ubuntu:22.04".to_string())
        );
    }

    #[test]
    fn malformed_key_rejected() {
        let mut table = toml::Table::new();
        let env = vec![("RUNWDL__NOSECTION".to_string(), "x".to_string())];
        assert!(apply_env(&mut table, env.into_iter()).is_err());
    }
}
